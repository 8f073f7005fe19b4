//! The genuine `open`/`close` implementations this library shadows.

use std::ffi::{CStr, c_char, c_int};

use libc::mode_t;
use thiserror::Error;

pub type OpenFn = unsafe extern "C" fn(*const c_char, c_int, mode_t) -> c_int;
pub type CloseFn = unsafe extern "C" fn(c_int) -> c_int;

/// The file operations an [`Interceptor`](crate::Interceptor) forwards to.
///
/// Implementations must behave exactly like the libc calls they stand for,
/// including leaving `errno` set on failure.
pub trait RealFileOps: Send + Sync {
    /// # Safety
    ///
    /// `path` must be null or point to a NUL-terminated string.
    unsafe fn open(&self, path: *const c_char, flags: c_int, mode: mode_t) -> c_int;

    /// # Safety
    ///
    /// Closing a descriptor owned by other code is the caller's problem,
    /// exactly as with `close(2)`.
    unsafe fn close(&self, fd: c_int) -> c_int;
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("unable to find underlying function for {symbol}: {reason}")]
    MissingSymbol { symbol: &'static str, reason: String },
}

/// Function pointers to the next `open` and `close` in the lookup order.
#[derive(Debug, Clone, Copy)]
pub struct LibcFileOps {
    open: OpenFn,
    close: CloseFn,
}

impl LibcFileOps {
    /// Looks up `open` and `close` with `dlsym(RTLD_NEXT, ..)`.
    pub fn resolve() -> Result<Self, ResolveError> {
        let open = next_symbol(c"open")?;
        let close = next_symbol(c"close")?;
        // SAFETY: both symbols are the libc functions with these exact C
        // signatures, and `next_symbol` never returns null.
        unsafe {
            Ok(Self {
                open: std::mem::transmute::<*mut libc::c_void, OpenFn>(open),
                close: std::mem::transmute::<*mut libc::c_void, CloseFn>(close),
            })
        }
    }

    pub const fn from_raw(open: OpenFn, close: CloseFn) -> Self {
        Self { open, close }
    }
}

impl RealFileOps for LibcFileOps {
    unsafe fn open(&self, path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
        unsafe { (self.open)(path, flags, mode) }
    }

    unsafe fn close(&self, fd: c_int) -> c_int {
        unsafe { (self.close)(fd) }
    }
}

fn next_symbol(name: &'static CStr) -> Result<*mut libc::c_void, ResolveError> {
    // SAFETY: `name` is NUL-terminated; RTLD_NEXT is always a valid handle
    // from inside a shared object.
    let ptr = unsafe {
        libc::dlerror();
        libc::dlsym(libc::RTLD_NEXT, name.as_ptr())
    };
    if !ptr.is_null() {
        return Ok(ptr);
    }

    let reason = unsafe {
        let err = libc::dlerror();
        if err.is_null() {
            "symbol resolved to null".to_owned()
        } else {
            CStr::from_ptr(err).to_string_lossy().into_owned()
        }
    };
    Err(ResolveError::MissingSymbol {
        symbol: name.to_str().unwrap_or("?"),
        reason,
    })
}
