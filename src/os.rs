//! Page reservation from the operating system.
//!
//! Every run handed out here starts on a [`PAGE_SIZE`] boundary. `mmap` only
//! promises OS-page alignment, so one extra allocator page is mapped and the
//! unaligned head and tail are unmapped again.

use core::{
  mem::size_of,
  ptr::{NonNull, null_mut},
};

use crate::{
  AllocError,
  consts::{PAGE_SHIFT, PAGE_SIZE},
};

unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  if size != 0 {
    unsafe { libc::munmap(ptr.cast(), size) };
  }
}

/// Bytes spanned by `pages` allocator pages.
pub(crate) fn pages_to_bytes(pages: usize) -> Result<usize, AllocError> {
  pages
    .checked_mul(PAGE_SIZE)
    .ok_or(AllocError::SizeOverflow { size: usize::MAX })
}

/// Maps `pages` zeroed, page-aligned allocator pages.
pub(crate) fn reserve_pages(pages: usize) -> Result<NonNull<u8>, AllocError> {
  debug_assert!(pages > 0);
  let bytes = pages_to_bytes(pages)?;
  let padded = bytes
    .checked_add(PAGE_SIZE)
    .ok_or(AllocError::SizeOverflow { size: bytes })?;

  let raw = unsafe { os_mmap(padded) };
  if raw.is_null() {
    return Err(AllocError::OutOfMemory { pages });
  }

  let addr = raw as usize;
  let aligned = align_up(addr, PAGE_SIZE);
  let head = aligned - addr;
  let tail = padded - head - bytes;
  unsafe {
    os_munmap(raw, head);
    os_munmap((aligned + bytes) as *mut u8, tail);
  }

  // SAFETY: `aligned` lies inside a successful non-null mapping.
  Ok(unsafe { NonNull::new_unchecked(aligned as *mut u8) })
}

/// Unmaps a run obtained from [`reserve_pages`].
///
/// # Safety
///
/// `base` must come from `reserve_pages(pages)` and no block inside it may be used again.
pub(crate) unsafe fn unreserve_pages(base: NonNull<u8>, pages: usize) {
  unsafe { os_munmap(base.as_ptr(), pages << PAGE_SHIFT) };
}

/// Maps zeroed memory for allocator metadata, rounded up to whole pages.
pub(crate) fn reserve_bytes(bytes: usize) -> Result<NonNull<u8>, AllocError> {
  reserve_pages(bytes.div_ceil(PAGE_SIZE).max(1))
}

/// Releases memory from [`reserve_bytes`].
///
/// # Safety
///
/// Same contract as [`unreserve_pages`].
pub(crate) unsafe fn unreserve_bytes(base: NonNull<u8>, bytes: usize) {
  unsafe { unreserve_pages(base, bytes.div_ceil(PAGE_SIZE).max(1)) };
}

// =============================================================================
// Region Log
// =============================================================================

/// A page run reserved from the OS.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Region {
  pub(crate) base: NonNull<u8>,
  pub(crate) pages: usize,
}

/// Owns every page run a pool has reserved, sorted by base address. Backed by mapped
/// memory so it never touches the global heap. Dropping the log unmaps all recorded
/// runs.
pub(crate) struct RegionLog {
  entries: Option<NonNull<Region>>,
  len: usize,
  cap: usize,
  pages: usize,
  reservations: u64,
}

// SAFETY: the log exclusively owns its buffer and the runs it records.
unsafe impl Send for RegionLog {}

impl RegionLog {
  pub(crate) const fn new() -> Self {
    Self {
      entries: None,
      len: 0,
      cap: 0,
      pages: 0,
      reservations: 0,
    }
  }

  fn slice(&self) -> &[Region] {
    match self.entries {
      Some(entries) => unsafe { core::slice::from_raw_parts(entries.as_ptr(), self.len) },
      None => &[],
    }
  }

  /// Index of the run starting at `base`, or where such a run would be inserted.
  fn search(&self, base: NonNull<u8>) -> Result<usize, usize> {
    self
      .slice()
      .binary_search_by_key(&(base.as_ptr() as usize), |r| r.base.as_ptr() as usize)
  }

  fn grow(&mut self) -> Result<(), AllocError> {
    let cap = (self.cap * 2).max(PAGE_SIZE / size_of::<Region>());
    let entries = reserve_bytes(cap * size_of::<Region>())?.cast::<Region>();
    if let Some(old) = self.entries {
      unsafe {
        core::ptr::copy_nonoverlapping(old.as_ptr(), entries.as_ptr(), self.len);
        unreserve_bytes(old.cast(), self.cap * size_of::<Region>());
      }
    }
    self.entries = Some(entries);
    self.cap = cap;
    Ok(())
  }

  /// Reserves `pages` pages and records the run.
  pub(crate) fn reserve(&mut self, pages: usize) -> Result<NonNull<u8>, AllocError> {
    if self.len == self.cap {
      self.grow()?;
    }
    let base = reserve_pages(pages)?;
    let Some(entries) = self.entries else {
      unreachable!("region log grown without a buffer");
    };
    let Err(i) = self.search(base) else {
      unreachable!("{base:p} reserved twice");
    };
    unsafe {
      let slot = entries.as_ptr().add(i);
      core::ptr::copy(slot, slot.add(1), self.len - i);
      slot.write(Region { base, pages });
    }
    self.len += 1;
    self.pages += pages;
    self.reservations += 1;
    Ok(base)
  }

  /// Unmaps the run starting at `base` and drops it from the log. Panics if `base` does
  /// not start a recorded run.
  ///
  /// # Safety
  ///
  /// No block inside the run may be used again.
  pub(crate) unsafe fn unreserve(&mut self, base: NonNull<u8>) -> Region {
    let Ok(i) = self.search(base) else {
      panic!("{base:p} does not start a reserved page run");
    };
    let Some(entries) = self.entries else {
      unreachable!();
    };
    let region = unsafe {
      let slot = entries.as_ptr().add(i);
      let region = slot.read();
      core::ptr::copy(slot.add(1), slot, self.len - i - 1);
      region
    };
    self.len -= 1;
    self.pages -= region.pages;
    unsafe { unreserve_pages(region.base, region.pages) };
    region
  }

  /// Pages currently reserved.
  pub(crate) fn pages(&self) -> usize {
    self.pages
  }

  /// Reservations made over the log's lifetime.
  pub(crate) fn reservations(&self) -> u64 {
    self.reservations
  }
}

impl Drop for RegionLog {
  fn drop(&mut self) {
    for region in self.slice() {
      unsafe { unreserve_pages(region.base, region.pages) };
    }
    if let Some(entries) = self.entries {
      unsafe { unreserve_bytes(entries.cast(), self.cap * size_of::<Region>()) };
    }
  }
}

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}
