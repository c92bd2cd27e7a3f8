//! The process-wide pool and the front ends built on it.
//!
//! Each thread lazily gets its own [`ThreadCache`] over one static [`Pool`]. The
//! cache is flushed back when the thread exits.

use core::{
  alloc::{GlobalAlloc, Layout},
  cell::Cell,
  ptr::{self, NonNull, null_mut},
};
use std::{cell::UnsafeCell, sync::OnceLock};

use tracing::debug;

use crate::{
  AllocError,
  consts::{MAX_BYTES, PAGE_SIZE},
  free_list::MIN_BLOCK,
  pool::{Pool, PoolStats},
  size_class,
  thread_cache::ThreadCache,
};

static POOL: OnceLock<Result<Pool, AllocError>> = OnceLock::new();

/// The process-wide pool, created on first use.
///
/// A failed creation is not retried; every later call sees the same error.
pub fn pool() -> Result<&'static Pool, AllocError> {
  let mut created = false;
  let pool = POOL.get_or_init(|| {
    created = true;
    Pool::new()
  });
  let pool = pool.as_ref().map_err(|e| *e)?;
  if created {
    debug!("created process-wide pool");
  }
  Ok(pool)
}

// =============================================================================
// TLS
// =============================================================================

thread_local! {
  static CACHE: UnsafeCell<Option<ThreadCache<'static>>> = const { UnsafeCell::new(None) };
  static IN_ALLOC: Cell<bool> = const { Cell::new(false) };
}

/// Clears `IN_ALLOC` when dropped, including while unwinding out of the allocator.
struct Entered;

impl Drop for Entered {
  fn drop(&mut self) {
    let _ = IN_ALLOC.try_with(|flag| flag.set(false));
  }
}

/// Runs `f` on this thread's cache. `None` if the thread is already inside the
/// allocator or its thread-locals are being torn down.
fn with_cache<R>(pool: &'static Pool, f: impl FnOnce(&mut ThreadCache<'static>) -> R) -> Option<R> {
  // try_with: TLS may already be destroyed during thread exit.
  let entered = IN_ALLOC.try_with(|flag| !flag.replace(true)).unwrap_or(false);
  if !entered {
    return None;
  }
  let _entered = Entered;

  CACHE
    .try_with(|cell| {
      // SAFETY: the guard makes this the only live borrow on this thread.
      let cache = unsafe { &mut *cell.get() };
      f(cache.get_or_insert_with(|| ThreadCache::new(pool)))
    })
    .ok()
}

/// Allocates at least `size` bytes from the process-wide pool.
pub fn allocate(size: usize) -> Result<NonNull<u8>, AllocError> {
  let pool = pool()?;
  if size > MAX_BYTES {
    return pool.allocate_large(size);
  }
  with_cache(pool, |cache| cache.allocate(size)).unwrap_or_else(|| pool.allocate_uncached(size))
}

/// Frees a block from [`allocate`].
///
/// # Safety
///
/// `ptr` came from [`allocate`] (or [`Allocator`]) and is not used again.
pub unsafe fn deallocate(ptr: NonNull<u8>) {
  let Some(Ok(pool)) = POOL.get() else {
    panic!("{ptr:p} freed before any allocation");
  };
  let cached = with_cache(pool, |cache| unsafe { pool.deallocate(cache, ptr) });
  if cached.is_none() {
    unsafe { pool.deallocate_uncached(ptr) };
  }
}

/// Usable bytes at `ptr`, a live block from [`allocate`].
///
/// # Safety
///
/// Same contract as [`deallocate`], except the block stays live.
pub unsafe fn usable_size(ptr: NonNull<u8>) -> usize {
  let Some(Ok(pool)) = POOL.get() else {
    panic!("{ptr:p} queried before any allocation");
  };
  unsafe { pool.usable_size(ptr) }
}

/// Statistics of the process-wide pool, if it exists.
pub fn stats() -> Option<PoolStats> {
  POOL.get()?.as_ref().ok().map(Pool::stats)
}

// =============================================================================
// GlobalAlloc
// =============================================================================

/// [`GlobalAlloc`] over the process-wide pool.
///
/// Alignments up to [`PAGE_SIZE`] are honoured; larger ones fail with a null pointer.
pub struct Allocator;

/// Request size that yields a block aligned for `layout`.
///
/// Blocks of a class are laid out back to back from a page boundary, so rounding
/// the size to a multiple of the alignment aligns every block.
#[inline]
fn aligned_size(layout: Layout) -> Option<usize> {
  let align = layout.align();
  if align > PAGE_SIZE {
    return None;
  }
  let size = layout.size().max(1);
  if align <= MIN_BLOCK {
    Some(size)
  } else {
    size.checked_next_multiple_of(align)
  }
}

unsafe impl GlobalAlloc for Allocator {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    let Some(size) = aligned_size(layout) else {
      return null_mut();
    };
    allocate(size).map_or(null_mut(), NonNull::as_ptr)
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    if let Some(ptr) = NonNull::new(ptr) {
      unsafe { deallocate(ptr) };
    }
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
    if ptr.is_null() {
      return unsafe { self.alloc(new_layout) };
    }

    if new_size == 0 {
      unsafe { self.dealloc(ptr, layout) };
      return null_mut();
    }

    // Same size class: keep the block.
    if let (Some(old), Some(new)) = (aligned_size(layout), aligned_size(new_layout))
      && old <= MAX_BYTES
      && new <= MAX_BYTES
      && size_class::round_up(old) == size_class::round_up(new)
    {
      return ptr;
    }

    let new_ptr = unsafe { self.alloc(new_layout) };
    if !new_ptr.is_null() {
      unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size)) };
      unsafe { self.dealloc(ptr, layout) };
    }
    new_ptr
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    let ptr = unsafe { self.alloc(layout) };
    if !ptr.is_null() {
      unsafe { ptr::write_bytes(ptr, 0, layout.size()) }
    }
    ptr
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
const MALLOC_ALIGN: usize = 16;

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
  unsafe { Allocator.alloc(Layout::from_size_align_unchecked(size.max(1), MALLOC_ALIGN)) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut u8) {
  let Some(nn) = NonNull::new(ptr) else {
    return;
  };
  // Foreign pointers (allocated before this library was loaded) are ignored.
  if pool().is_ok_and(|pool| pool.owns(nn)) {
    unsafe { deallocate(nn) };
  }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
  let Some(total) = nmemb.checked_mul(size) else {
    return null_mut();
  };
  unsafe { Allocator.alloc_zeroed(Layout::from_size_align_unchecked(total.max(1), MALLOC_ALIGN)) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  if ptr.is_null() {
    return unsafe { malloc(size) };
  }
  if size == 0 {
    unsafe { free(ptr) };
    return null_mut();
  }

  let old = unsafe { malloc_usable_size(ptr) };
  if old >= size && old <= MAX_BYTES {
    return ptr;
  }

  let new_ptr = unsafe { malloc(size) };
  if !new_ptr.is_null() {
    unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, old.min(size)) };
    unsafe { free(ptr) };
  }
  new_ptr
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn posix_memalign(
  memptr: *mut *mut u8,
  alignment: usize,
  size: usize,
) -> i32 {
  if !alignment.is_power_of_two() || alignment < core::mem::size_of::<*mut u8>() {
    return libc::EINVAL;
  }

  let ptr = unsafe { Allocator.alloc(Layout::from_size_align_unchecked(size.max(1), alignment)) };
  if ptr.is_null() {
    return libc::ENOMEM;
  }

  unsafe { *memptr = ptr };
  0
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
  let Some(nn) = NonNull::new(ptr) else {
    return 0;
  };
  match pool() {
    Ok(pool) if pool.owns(nn) => unsafe { pool.usable_size(nn) },
    // Foreign pointer.
    _ => 0,
  }
}
