///
/// Engine Heap Arena
///
/// Everything the binding hands to the engine lives in the engine's own heap
/// (`sqlite3_malloc64` / `sqlite3_free`). Each thread keeps a table of its
/// live allocations, so frees are checked, typed reads and writes are
/// bounds-checked, and leaks can be counted.
///
/// Two lifetimes:
/// - Heap: `allocate` / `free`, or an `EncodedBuffer` that frees itself on
///   drop. Used for data that must outlive one engine call (bound text and
///   blobs, the source text of a statement iterator).
/// - Stack: a 64 KiB bump block per thread. `StackFrame` saves the top on
///   entry and restores it on drop, so call-scoped strings never need an
///   explicit free. Requests that do not fit fall back to heap allocations
///   owned by the frame.
///

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::{CStr, c_char};
use std::marker::PhantomData;
use std::ptr::NonNull;

use rusqlite::ffi;
use tracing::warn;

use crate::error::ArenaError;

const STACK_SIZE: usize = 64 * 1024;
const STACK_ALIGN: usize = 8;

/// Address of a region inside the arena (heap allocation or stack block).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArenaPtr(NonNull<u8>);

impl ArenaPtr {
    pub fn from_raw(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(ArenaPtr)
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    pub fn as_c_ptr(self) -> *const c_char {
        self.0.as_ptr() as *const c_char
    }

    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArenaStats {
    pub live_allocations: usize,
    pub live_bytes: usize,
    pub total_allocations: u64,
    pub total_frees: u64,
    pub stack_in_use: usize,
}

struct StackBlock {
    base: NonNull<u8>,
    top: usize,
}

struct ArenaState {
    live: BTreeMap<usize, usize>,
    total_allocations: u64,
    total_frees: u64,
    stack: Option<StackBlock>,
}

impl ArenaState {
    fn new() -> Self {
        Self {
            live: BTreeMap::new(),
            total_allocations: 0,
            total_frees: 0,
            stack: None,
        }
    }

    fn allocate(&mut self, size: usize) -> Result<ArenaPtr, ArenaError> {
        // sqlite3_malloc64(0) returns NULL, so empty values still get a byte.
        let reserved = size.max(1);
        let raw = unsafe { ffi::sqlite3_malloc64(reserved as u64) } as *mut u8;
        let ptr = ArenaPtr::from_raw(raw).ok_or(ArenaError::OutOfMemory { requested: size })?;
        self.live.insert(ptr.addr(), reserved);
        self.total_allocations += 1;
        Ok(ptr)
    }

    fn free(&mut self, ptr: ArenaPtr) -> Result<(), ArenaError> {
        if self.live.remove(&ptr.addr()).is_none() {
            return Err(ArenaError::DoubleFree { addr: ptr.addr() });
        }
        unsafe { ffi::sqlite3_free(ptr.as_ptr().cast()) };
        self.total_frees += 1;
        Ok(())
    }

    fn check(&self, addr: usize, width: usize) -> Result<(), ArenaError> {
        let out_of_bounds = ArenaError::OutOfBounds { addr, width };
        let end = addr.checked_add(width).ok_or(out_of_bounds.clone())?;

        if let Some((&base, &size)) = self.live.range(..=addr).next_back() {
            if end <= base + size {
                return Ok(());
            }
        }
        if let Some(stack) = &self.stack {
            let base = stack.base.as_ptr() as usize;
            if addr >= base && end <= base + stack.top {
                return Ok(());
            }
        }
        Err(out_of_bounds)
    }

    fn stack(&mut self) -> Result<&mut StackBlock, ArenaError> {
        let block = match self.stack.take() {
            Some(block) => block,
            None => {
                let raw = unsafe { ffi::sqlite3_malloc64(STACK_SIZE as u64) } as *mut u8;
                let base = NonNull::new(raw).ok_or(ArenaError::OutOfMemory {
                    requested: STACK_SIZE,
                })?;
                StackBlock { base, top: 0 }
            }
        };
        Ok(self.stack.insert(block))
    }

    fn stats(&self) -> ArenaStats {
        ArenaStats {
            live_allocations: self.live.len(),
            live_bytes: self.live.values().sum(),
            total_allocations: self.total_allocations,
            total_frees: self.total_frees,
            stack_in_use: self.stack.as_ref().map_or(0, |s| s.top),
        }
    }
}

impl Drop for ArenaState {
    fn drop(&mut self) {
        if let Some(stack) = self.stack.take() {
            unsafe { ffi::sqlite3_free(stack.base.as_ptr().cast()) };
        }
    }
}

thread_local! {
    static ARENA: RefCell<ArenaState> = RefCell::new(ArenaState::new());
}

fn with_arena<R>(f: impl FnOnce(&mut ArenaState) -> R) -> R {
    ARENA.with(|arena| f(&mut arena.borrow_mut()))
}

/// Allocate a writable region of at least `size` bytes.
pub fn allocate(size: usize) -> Result<ArenaPtr, ArenaError> {
    with_arena(|arena| arena.allocate(size))
}

/// Release a region returned by `allocate`. A second free of the same
/// region is reported instead of reaching the engine heap.
pub fn free(ptr: ArenaPtr) -> Result<(), ArenaError> {
    match ARENA.try_with(|arena| arena.borrow_mut().free(ptr)) {
        Ok(Err(err)) => {
            warn!(addr = ptr.addr(), "rejected free of a region that is not live");
            Err(err)
        }
        Ok(Ok(())) => Ok(()),
        // Thread teardown: the table is gone, hand the block straight back.
        Err(_) => {
            unsafe { ffi::sqlite3_free(ptr.as_ptr().cast()) };
            Ok(())
        }
    }
}

pub fn allocation_size(ptr: ArenaPtr) -> Option<usize> {
    with_arena(|arena| arena.live.get(&ptr.addr()).copied())
}

pub fn stats() -> ArenaStats {
    with_arena(|arena| arena.stats())
}

/// Addresses of every live heap allocation on this thread.
pub fn live_set() -> BTreeSet<usize> {
    with_arena(|arena| arena.live.keys().copied().collect())
}

fn checked_target(ptr: ArenaPtr, offset: usize, width: usize) -> Result<*mut u8, ArenaError> {
    let addr = ptr.addr().checked_add(offset).ok_or(ArenaError::OutOfBounds {
        addr: ptr.addr(),
        width,
    })?;
    with_arena(|arena| arena.check(addr, width))?;
    Ok(ptr.as_ptr().wrapping_add(offset))
}

macro_rules! scalar_views {
    ($($read:ident, $write:ident, $ty:ty;)*) => {
        $(
            pub fn $read(ptr: ArenaPtr, offset: usize) -> Result<$ty, ArenaError> {
                let target = checked_target(ptr, offset, std::mem::size_of::<$ty>())?;
                Ok(unsafe { std::ptr::read_unaligned(target.cast::<$ty>()) })
            }

            pub fn $write(ptr: ArenaPtr, offset: usize, value: $ty) -> Result<(), ArenaError> {
                let target = checked_target(ptr, offset, std::mem::size_of::<$ty>())?;
                unsafe { std::ptr::write_unaligned(target.cast::<$ty>(), value) };
                Ok(())
            }
        )*
    };
}

scalar_views! {
    read_u8, write_u8, u8;
    read_u16, write_u16, u16;
    read_u32, write_u32, u32;
    read_u64, write_u64, u64;
}

pub fn write_bytes(ptr: ArenaPtr, offset: usize, bytes: &[u8]) -> Result<(), ArenaError> {
    let target = checked_target(ptr, offset, bytes.len())?;
    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), target, bytes.len()) };
    Ok(())
}

pub fn read_bytes(ptr: ArenaPtr, offset: usize, len: usize) -> Result<Vec<u8>, ArenaError> {
    let target = checked_target(ptr, offset, len)?;
    Ok(unsafe { std::slice::from_raw_parts(target, len) }.to_vec())
}

/// Encode `text` as UTF-8 followed by a NUL terminator in a heap region.
pub fn alloc_string(text: &str) -> Result<EncodedBuffer, ArenaError> {
    let ptr = allocate(text.len() + 1)?;
    let buffer = EncodedBuffer {
        ptr,
        len: text.len(),
    };
    write_bytes(ptr, 0, text.as_bytes())?;
    write_u8(ptr, text.len(), 0)?;
    Ok(buffer)
}

/// Copy `bytes` into a heap region. The encoding is not self-describing;
/// callers pass `len()` alongside the pointer.
pub fn alloc_bytes(bytes: &[u8]) -> Result<EncodedBuffer, ArenaError> {
    let ptr = allocate(bytes.len())?;
    let buffer = EncodedBuffer {
        ptr,
        len: bytes.len(),
    };
    write_bytes(ptr, 0, bytes)?;
    Ok(buffer)
}

/// Decode a NUL-terminated string owned by the engine. Null decodes to "".
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string that stays valid
/// for the duration of the call.
pub unsafe fn read_cstr(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

/// Copy an engine-owned byte range into host memory. The engine may reuse
/// or grow the region after the call, so callers never keep a view.
///
/// # Safety
/// `ptr` must be null or valid for reads of `len` bytes.
pub unsafe fn copy_foreign(ptr: *const u8, len: usize) -> Vec<u8> {
    if ptr.is_null() || len == 0 {
        return Vec::new();
    }
    unsafe { std::slice::from_raw_parts(ptr, len) }.to_vec()
}

/// Read slot `index` of an engine-owned pointer vector (e.g. `argv`).
///
/// # Safety
/// `base` must point to at least `index + 1` initialized pointer slots.
pub unsafe fn read_ptr<T>(base: *const *mut T, index: usize) -> *mut T {
    unsafe { base.add(index).read() }
}

/// Owning guard over one heap region holding an encoded string or byte
/// sequence. Dropping it releases the region.
#[derive(Debug)]
pub struct EncodedBuffer {
    ptr: ArenaPtr,
    len: usize,
}

impl EncodedBuffer {
    pub fn ptr(&self) -> ArenaPtr {
        self.ptr
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_c_ptr(&self) -> *const c_char {
        self.ptr.as_c_ptr()
    }

    /// Encoded length, excluding any NUL terminator.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for EncodedBuffer {
    fn drop(&mut self) {
        let _ = free(self.ptr);
    }
}

/// Scoped region of the per-thread stack block. Frames must be dropped in
/// the reverse order they were entered, which plain scoping guarantees.
pub struct StackFrame {
    saved_top: usize,
    overflow: Vec<EncodedBuffer>,
    _thread_bound: PhantomData<*const ()>,
}

impl StackFrame {
    pub fn enter() -> Result<Self, ArenaError> {
        let saved_top = with_arena(|arena| arena.stack().map(|stack| stack.top))?;
        Ok(Self {
            saved_top,
            overflow: Vec::new(),
            _thread_bound: PhantomData,
        })
    }

    pub fn alloc(&mut self, size: usize) -> Result<ArenaPtr, ArenaError> {
        let bumped = with_arena(|arena| -> Result<Option<ArenaPtr>, ArenaError> {
            let stack = arena.stack()?;
            let start = (stack.top + STACK_ALIGN - 1) & !(STACK_ALIGN - 1);
            let end = start + size.max(1);
            if end > STACK_SIZE {
                return Ok(None);
            }
            stack.top = end;
            Ok(ArenaPtr::from_raw(stack.base.as_ptr().wrapping_add(start)))
        })?;

        match bumped {
            Some(ptr) => Ok(ptr),
            None => {
                let ptr = allocate(size)?;
                self.overflow.push(EncodedBuffer { ptr, len: size });
                Ok(ptr)
            }
        }
    }

    /// NUL-terminated UTF-8 copy of `text`, reclaimed when the frame drops.
    pub fn alloc_string(&mut self, text: &str) -> Result<ArenaPtr, ArenaError> {
        let ptr = self.alloc(text.len() + 1)?;
        write_bytes(ptr, 0, text.as_bytes())?;
        write_u8(ptr, text.len(), 0)?;
        Ok(ptr)
    }
}

impl Drop for StackFrame {
    fn drop(&mut self) {
        let saved_top = self.saved_top;
        let _ = ARENA.try_with(|arena| {
            if let Some(stack) = arena.borrow_mut().stack.as_mut() {
                stack.top = saved_top;
            }
        });
    }
}
