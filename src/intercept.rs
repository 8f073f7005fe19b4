use std::ffi::{CStr, c_char, c_int};
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use libc::mode_t;
use log::{debug, trace};

use crate::real::RealFileOps;
use crate::rule::ModeRule;

/// Decides what to do with an intercepted call, then hands it to `R`.
#[derive(Debug)]
pub struct Interceptor<R> {
    real: R,
    rule: ModeRule,
}

impl<R: RealFileOps> Interceptor<R> {
    pub fn new(real: R) -> Self {
        Self::with_rule(real, ModeRule::default())
    }

    pub fn with_rule(real: R, rule: ModeRule) -> Self {
        Self { real, rule }
    }

    pub fn real(&self) -> &R {
        &self.real
    }

    pub fn rule(&self) -> &ModeRule {
        &self.rule
    }

    /// `open(2)` with the mode replaced when the rule matches `path`.
    ///
    /// # Safety
    ///
    /// `path` must be null or point to a NUL-terminated string.
    pub unsafe fn open(&self, path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
        let mode = if path.is_null() {
            mode
        } else {
            let bytes = unsafe { CStr::from_ptr(path) }.to_bytes();
            if self.rule.matches(bytes) {
                debug!(
                    "open({}): mode {:o} -> {:o}",
                    String::from_utf8_lossy(bytes),
                    mode,
                    self.rule.mode
                );
            }
            self.rule.apply(bytes, mode)
        };
        unsafe { self.real.open(path, flags, mode) }
    }

    /// `close(2)`, printing `INTERCEPTED: <fd> -> <path>` to the C `stdout`
    /// first.
    ///
    /// # Safety
    ///
    /// See [`RealFileOps::close`].
    pub unsafe fn close(&self, fd: c_int) -> c_int {
        unsafe { self.close_to(fd, &mut CStdout) }
    }

    /// Like [`Interceptor::close`] but writes the record to `out`.
    ///
    /// Nothing is written when the descriptor's target can't be read, and a
    /// failing `out` is ignored. The return value and `errno` are always
    /// the real `close`'s.
    ///
    /// # Safety
    ///
    /// See [`RealFileOps::close`].
    pub unsafe fn close_to<W: Write>(&self, fd: c_int, out: &mut W) -> c_int {
        match fd_target(fd) {
            Some(target) => {
                let mut line = format!("INTERCEPTED: {fd} -> ").into_bytes();
                line.extend_from_slice(target.as_os_str().as_bytes());
                line.push(b'\n');
                let _ = out.write_all(&line);
            }
            None => trace!("close({fd}): target not resolvable, no record"),
        }
        unsafe { self.real.close(fd) }
    }
}

unsafe extern "C" {
    #[link_name = "stdout"]
    static mut C_STDOUT: *mut libc::FILE;
}

/// The host's own stdio `stdout`, so records share its buffer and ordering.
/// stdio locks the stream per call; nothing is held between writes.
#[derive(Debug, Clone, Copy, Default)]
pub struct CStdout;

impl Write for CStdout {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        // SAFETY: C_STDOUT is initialised by libc before any constructor runs.
        let n = unsafe { libc::fwrite(buf.as_ptr().cast(), 1, buf.len(), C_STDOUT) };
        if n == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match unsafe { libc::fflush(C_STDOUT) } {
            0 => Ok(()),
            _ => Err(io::Error::last_os_error()),
        }
    }
}

/// What `/proc/self/fd/<fd>` currently points at.
pub fn fd_target(fd: c_int) -> Option<PathBuf> {
    if fd < 0 {
        return None;
    }
    let target = std::fs::read_link(format!("/proc/self/fd/{fd}")).ok()?;
    (!target.as_os_str().is_empty()).then_some(target)
}
