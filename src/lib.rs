//! Preloadable shim that makes `makemkvcon` create MKV files the way `touch`
//! would.
//!
//! makemkvcon opens its output with mode `0644`, so a umask can only take
//! permissions away from that and a umask of `0002` still produces `0644`
//! files. Loaded with `LD_PRELOAD`, this library replaces the mode of any
//! `open` of a `.mkv` file under `/output/` with `0666`, leaving the umask as
//! the only thing narrowing the result. It also prints the path of every
//! descriptor passed to `close`.
//!
//! ```text
//! LD_PRELOAD=/libmkv_mode_hook.so makemkvcon ...
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("mkv_mode_hook relies on RTLD_NEXT and /proc/self/fd and only targets Linux.");

use std::cell::Cell;
use std::sync::OnceLock;

use ctor::ctor;
use log::{debug, error};

pub mod intercept;
pub mod real;
pub mod rule;

pub use intercept::{CStdout, Interceptor, fd_target};
pub use real::{LibcFileOps, RealFileOps, ResolveError};
pub use rule::ModeRule;

// Set while this thread is running shim code.
thread_local! {
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
}

/// Runs `f`, or `bypass` if this thread is already inside a hook.
///
/// `bypass` also runs once the thread-local is gone (thread teardown), where
/// the hook can no longer tell whether it is being re-entered.
pub fn with_hook_protection<F, G, R>(f: F, bypass: G) -> R
where
    F: FnOnce() -> R,
    G: FnOnce() -> R,
{
    let entered = IN_HOOK.try_with(|flag| !flag.replace(true)).unwrap_or(false);
    if !entered {
        return bypass();
    }
    let result = f();
    let _ = IN_HOOK.try_with(|flag| flag.set(false));
    result
}

static INTERCEPTOR: OnceLock<Result<Interceptor<LibcFileOps>, ResolveError>> = OnceLock::new();

/// Resolves the real `open`/`close` once and returns the process-wide
/// interceptor. Later calls return the cached outcome, failure included.
pub fn install() -> Result<&'static Interceptor<LibcFileOps>, &'static ResolveError> {
    INTERCEPTOR
        .get_or_init(|| LibcFileOps::resolve().map(Interceptor::new))
        .as_ref()
}

/// The real functions, if resolution has already finished successfully.
fn installed_real() -> Option<&'static LibcFileOps> {
    match INTERCEPTOR.get() {
        Some(Ok(hook)) => Some(hook.real()),
        _ => None,
    }
}

#[ctor]
fn init() {
    load();
}

/// Logger setup and resolution, guarded so that an `open`/`close` issued
/// from inside either one takes the bypass instead of re-entering `install`.
fn load() {
    with_hook_protection(
        || {
            let _ = env_logger::try_init();
            match install() {
                Ok(hook) => debug!(
                    "mkv_mode_hook: interposing open/close, forcing mode {:o}",
                    hook.rule().mode
                ),
                Err(err) => error!("mkv_mode_hook: {err}; open and close will fail with ENOSYS"),
            }
        },
        || {},
    )
}

/// Fails the call the way a missing syscall would.
fn unresolved() -> libc::c_int {
    // SAFETY: errno is thread-local and always writable.
    unsafe { *libc::__errno_location() = libc::ENOSYS };
    -1
}

// The exported symbols are left out of unit-test builds so the test harness
// keeps the plain libc `open`/`close`.
#[cfg(not(test))]
mod exports {
    use std::ffi::{c_char, c_int};

    use libc::mode_t;

    use super::*;

    // C declares open as variadic. Taking `mode` as a fixed third argument
    // reads the same register on the Linux ABIs; it is only meaningful with
    // O_CREAT or O_TMPFILE and is forwarded as-is otherwise.
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn open(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
        with_hook_protection(
            || match install() {
                Ok(hook) => unsafe { hook.open(path, flags, mode) },
                Err(_) => unresolved(),
            },
            || match installed_real() {
                Some(real) => unsafe { real.open(path, flags, mode) },
                None => unresolved(),
            },
        )
    }

    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn close(fd: c_int) -> c_int {
        with_hook_protection(
            || match install() {
                Ok(hook) => unsafe { hook.close(fd) },
                Err(_) => unresolved(),
            },
            || match installed_real() {
                Some(real) => unsafe { real.close(fd) },
                None => unresolved(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn install_resolves_once() {
        let first = install().expect("libc open/close should resolve");
        let second = install().unwrap();
        assert!(std::ptr::eq(first, second));
        assert_eq!(*first.rule(), ModeRule::OUTPUT_MKV);
        assert!(installed_real().is_some());
    }

    #[test]
    fn installed_interceptor_delegates_to_libc() {
        let hook = install().unwrap();
        let path = CString::new("/etc/passwd").unwrap();

        let fd = unsafe { hook.open(path.as_ptr(), libc::O_RDONLY, 0) };
        assert!(fd >= 0);

        let mut out = Vec::new();
        assert_eq!(unsafe { hook.close_to(fd, &mut out) }, 0);
        let target = std::fs::canonicalize("/etc/passwd").unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            format!("INTERCEPTED: {fd} -> {}\n", target.display())
        );
    }

    #[test]
    fn load_installs_and_releases_guard() {
        load();
        assert!(installed_real().is_some());
        assert_eq!(with_hook_protection(|| "hooked", || "bypassed"), "hooked");
    }

    #[test]
    fn load_is_skipped_when_reentered() {
        let nested = with_hook_protection(
            || {
                load();
                with_hook_protection(|| "hooked", || "bypassed")
            },
            || "outer bypassed",
        );
        assert_eq!(nested, "bypassed");
    }

    #[test]
    fn hook_protection_bypasses_nested_calls() {
        let result = with_hook_protection(
            || with_hook_protection(|| "hooked", || "bypassed"),
            || "outer bypassed",
        );
        assert_eq!(result, "bypassed");
    }

    #[test]
    fn hook_protection_resets_after_call() {
        assert_eq!(with_hook_protection(|| 1, || 2), 1);
        assert_eq!(with_hook_protection(|| 1, || 2), 1);
    }

    #[test]
    fn hook_protection_is_per_thread() {
        with_hook_protection(
            || {
                let other = std::thread::spawn(|| with_hook_protection(|| "hooked", || "bypassed"))
                    .join()
                    .unwrap();
                assert_eq!(other, "hooked");
            },
            || panic!("outer call should not be bypassed"),
        );
    }

    #[test]
    fn unresolved_sets_enosys() {
        assert_eq!(unresolved(), -1);
        assert_eq!(
            std::io::Error::last_os_error().raw_os_error(),
            Some(libc::ENOSYS)
        );
    }
}
