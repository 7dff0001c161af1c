///
/// Native Handles
///
/// A `NativeHandle<T>` is the single owner of a raw engine pointer
/// (`sqlite3`, `sqlite3_stmt`). Releasing it swaps in a null sentinel, so a
/// use after release surfaces as `None` instead of a read of freed memory.
///

use std::fmt;

pub struct NativeHandle<T> {
    ptr: *mut T,
}

impl<T> NativeHandle<T> {
    /// Wraps a pointer returned by the engine; null yields `None`.
    pub fn new(ptr: *mut T) -> Option<Self> {
        if ptr.is_null() { None } else { Some(Self { ptr }) }
    }

    pub fn released() -> Self {
        Self {
            ptr: std::ptr::null_mut(),
        }
    }

    pub fn get(&self) -> Option<*mut T> {
        if self.ptr.is_null() { None } else { Some(self.ptr) }
    }

    pub fn is_live(&self) -> bool {
        !self.ptr.is_null()
    }

    /// Address used as a registry key; 0 once released.
    pub fn addr(&self) -> usize {
        self.ptr as usize
    }

    /// Hands the pointer to the caller for the native release call and
    /// leaves the sentinel behind.
    pub fn release(&mut self) -> Option<*mut T> {
        let ptr = std::mem::replace(&mut self.ptr, std::ptr::null_mut());
        if ptr.is_null() { None } else { Some(ptr) }
    }

    /// Installs a fresh pointer into a released handle (reopen after export).
    pub fn install(&mut self, ptr: *mut T) {
        debug_assert!(self.ptr.is_null(), "installing over a live handle");
        self.ptr = ptr;
    }
}

impl<T> fmt::Debug for NativeHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ptr.is_null() {
            write!(f, "NativeHandle(released)")
        } else {
            write!(f, "NativeHandle({:#x})", self.addr())
        }
    }
}
