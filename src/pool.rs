//! The shared tiers behind one handle.

use core::ptr::{self, NonNull};

use tracing::{debug, trace};

use crate::{
  AllocError,
  central_cache::CentralCache,
  consts::{MAX_BYTES, PAGE_SHIFT, PAGE_SIZE},
  free_list::Chain,
  page_cache::PageCache,
  size_class,
  thread_cache::ThreadCache,
};

/// Point-in-time view of a pool's page accounting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
  /// Pages currently mapped from the OS for blocks.
  pub reserved_pages: usize,
  /// OS reservations made since the pool was created.
  pub reservations: u64,
  /// Free spans held by the page cache.
  pub free_spans: usize,
  /// Pages in those spans.
  pub free_pages: usize,
  /// Oversized allocations currently outstanding.
  pub oversized_spans: usize,
}

/// Central and page caches shared by every [`ThreadCache`] created from it.
///
/// Dropping the pool returns all of its memory to the OS. Caches borrow the pool, so
/// none can outlive it; pointers handed out by it must not be used afterwards.
pub struct Pool {
  central: CentralCache,
  pages: PageCache,
}

impl Pool {
  pub fn new() -> Result<Self, AllocError> {
    let pages = PageCache::new()?;
    let central = CentralCache::new(&pages)?;
    Ok(Self { central, pages })
  }

  /// A new, empty thread cache drawing from this pool.
  pub fn thread_cache(&self) -> ThreadCache<'_> {
    ThreadCache::new(self)
  }

  #[inline]
  pub(crate) fn central(&self) -> &CentralCache {
    &self.central
  }

  #[inline]
  pub(crate) fn pages(&self) -> &PageCache {
    &self.pages
  }

  /// Hands out at least `size` bytes. Small requests go through `cache`, larger ones
  /// straight to the page cache as whole pages.
  ///
  /// Blocks are 8-byte aligned; oversized ones are page aligned.
  pub fn allocate(&self, cache: &mut ThreadCache<'_>, size: usize) -> Result<NonNull<u8>, AllocError> {
    assert!(
      ptr::eq(cache.pool(), self),
      "thread cache belongs to another pool"
    );
    if size > MAX_BYTES {
      return self.allocate_large(size);
    }
    cache.allocate(size)
  }

  /// Takes back a block from [`allocate`](Self::allocate). The size is recovered from
  /// the span the block lies in.
  ///
  /// # Safety
  ///
  /// `ptr` was returned by this pool and is not used again.
  pub unsafe fn deallocate(&self, cache: &mut ThreadCache<'_>, ptr: NonNull<u8>) {
    assert!(
      ptr::eq(cache.pool(), self),
      "thread cache belongs to another pool"
    );
    let size = self.object_size(ptr);
    if size > MAX_BYTES {
      unsafe { self.deallocate_large(ptr) };
    } else {
      unsafe { cache.deallocate(ptr, size) };
    }
  }

  /// Bytes usable at `ptr`: its size class, or the whole page run when oversized.
  ///
  /// # Safety
  ///
  /// `ptr` is a live block from this pool.
  pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
    let size = self.object_size(ptr);
    if size > MAX_BYTES {
      let id = self.pages.map_object_to_span(ptr);
      self.pages.span(id).pages() << PAGE_SHIFT
    } else {
      size_class::round_up(size)
    }
  }

  pub fn stats(&self) -> PoolStats {
    let pages = self.pages.stats();
    PoolStats {
      reserved_pages: pages.reserved_pages,
      reservations: pages.reservations,
      free_spans: pages.free_spans,
      free_pages: pages.free_pages,
      oversized_spans: pages.oversized_spans,
    }
  }

  /// Whether `ptr` lies in a span this pool currently has leased out.
  pub fn owns(&self, ptr: NonNull<u8>) -> bool {
    self
      .pages
      .owner(ptr)
      .is_some_and(|id| self.pages.span(id).obj_size() != 0)
  }

  fn object_size(&self, ptr: NonNull<u8>) -> usize {
    let span = self.pages.span(self.pages.map_object_to_span(ptr));
    let size = span.obj_size();
    assert!(size != 0, "{ptr:p} lies in a free span");
    size
  }

  // ===========================================================================
  // Page Path
  // ===========================================================================

  pub(crate) fn allocate_large(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
    let bytes = size
      .checked_add(PAGE_SIZE - 1)
      .ok_or(AllocError::SizeOverflow { size })?;
    let pages = bytes >> PAGE_SHIFT;
    let id = self.pages.new_span(pages, size)?;
    let base = self.pages.span(id).base();
    trace!(size, pages, "oversized allocation");
    Ok(base)
  }

  unsafe fn deallocate_large(&self, ptr: NonNull<u8>) {
    let id = self.pages.map_object_to_span(ptr);
    debug_assert_eq!(self.pages.span(id).base(), ptr, "oversized free of an interior pointer");
    unsafe { self.pages.release_span(id) };
  }

  // ===========================================================================
  // Uncached Path
  // ===========================================================================

  /// Allocates without a thread cache, moving a single block through the central
  /// cache.
  pub(crate) fn allocate_uncached(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
    if size > MAX_BYTES {
      return self.allocate_large(size);
    }
    let size = size_class::round_up(size.max(1));
    let chain = self.central.fetch_range_obj(&self.pages, 1, size)?;
    Ok(chain.split_first().0)
  }

  /// # Safety
  ///
  /// Same contract as [`deallocate`](Self::deallocate).
  pub(crate) unsafe fn deallocate_uncached(&self, ptr: NonNull<u8>) {
    let size = self.object_size(ptr);
    if size > MAX_BYTES {
      unsafe { self.deallocate_large(ptr) };
    } else {
      unsafe {
        self
          .central
          .release_list_to_spans(&self.pages, Chain::single(ptr), size)
      };
    }
  }
}

impl Drop for Pool {
  fn drop(&mut self) {
    let stats = self.pages.stats();
    debug!(
      reserved_pages = stats.reserved_pages,
      oversized_spans = stats.oversized_spans,
      "tearing down pool"
    );
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::consts::MAX_MANAGED_PAGES;

  #[test]
  fn freed_blocks_are_reused_without_new_pages() {
    let pool = Pool::new().unwrap();
    let mut cache = pool.thread_cache();
    let sizes: Vec<usize> = (0..2000).map(|i| if i % 2 == 0 { 64 } else { 200 }).collect();

    let blocks: Vec<_> = sizes.iter().map(|&s| pool.allocate(&mut cache, s).unwrap()).collect();
    let reserved = pool.stats().reserved_pages;
    for &b in &blocks {
      unsafe { pool.deallocate(&mut cache, b) };
    }
    let again: Vec<_> = sizes.iter().map(|&s| pool.allocate(&mut cache, s).unwrap()).collect();
    assert_eq!(pool.stats().reserved_pages, reserved);
    for b in again {
      unsafe { pool.deallocate(&mut cache, b) };
    }
  }

  #[test]
  fn blocks_are_writable_and_distinct() {
    let pool = Pool::new().unwrap();
    let mut cache = pool.thread_cache();
    let blocks: Vec<_> = (1..=500)
      .map(|i| {
        let size = i * 13;
        let p = pool.allocate(&mut cache, size).unwrap();
        unsafe { p.as_ptr().write_bytes(i as u8, size) };
        (p, size, i as u8)
      })
      .collect();
    for &(p, size, tag) in &blocks {
      let bytes = unsafe { core::slice::from_raw_parts(p.as_ptr(), size) };
      assert!(bytes.iter().all(|&b| b == tag));
      assert_eq!(p.as_ptr() as usize % 8, 0);
      unsafe { pool.deallocate(&mut cache, p) };
    }
  }

  #[test]
  fn oversized_request_skips_size_classes() {
    let pool = Pool::new().unwrap();
    let mut cache = pool.thread_cache();
    let size = 257 * 1024;
    let p = pool.allocate(&mut cache, size).unwrap();
    assert_eq!(p.as_ptr() as usize % PAGE_SIZE, 0);
    assert!(pool.central().bucket(pool.pages(), 8).is_empty());
    assert_eq!(cache.cached(), 0);
    assert_eq!(unsafe { pool.usable_size(p) }, 33 * PAGE_SIZE);

    unsafe { pool.deallocate(&mut cache, p) };
    assert!(pool.central().bucket(pool.pages(), 8).is_empty());
    assert_eq!(cache.cached(), 0);
  }

  #[test]
  fn unmanaged_runs_go_back_to_the_os() {
    let pool = Pool::new().unwrap();
    let mut cache = pool.thread_cache();
    let size = (MAX_MANAGED_PAGES + 1) * PAGE_SIZE;
    let p = pool.allocate(&mut cache, size).unwrap();
    let stats = pool.stats();
    assert_eq!(stats.oversized_spans, 1);
    assert_eq!(stats.reserved_pages, MAX_MANAGED_PAGES + 1);

    unsafe { pool.deallocate(&mut cache, p) };
    let stats = pool.stats();
    assert_eq!(stats.oversized_spans, 0);
    assert_eq!(stats.reserved_pages, 0);
  }

  #[test]
  fn large_managed_span_survives_neighbour_release() {
    let pool = Pool::new().unwrap();
    let mut cache = pool.thread_cache();
    let small = pool.allocate(&mut cache, 300 * 1024).unwrap();
    let big = pool.allocate(&mut cache, 400 * 1024).unwrap();
    unsafe { pool.deallocate(&mut cache, small) };

    // The freed neighbour must not swallow the live run.
    let id = pool.pages().map_object_to_span(big);
    let span = pool.pages().span(id);
    assert!(span.is_in_use());
    assert_eq!(span.base(), big);
    assert_eq!(unsafe { pool.usable_size(big) }, 50 * PAGE_SIZE);
    unsafe { pool.deallocate(&mut cache, big) };

    let stats = pool.stats();
    assert_eq!(stats.free_pages, stats.reserved_pages);
  }

  #[test]
  fn ownership_follows_the_lease() {
    let pool = Pool::new().unwrap();
    let mut cache = pool.thread_cache();
    let p = pool.allocate(&mut cache, 500 * 1024).unwrap();
    assert!(pool.owns(p));
    let mut local = 0u64;
    assert!(!pool.owns(NonNull::from(&mut local).cast()));
    unsafe { pool.deallocate(&mut cache, p) };
    assert!(!pool.owns(p));
  }

  #[test]
  fn usable_size_reports_the_class() {
    let pool = Pool::new().unwrap();
    let mut cache = pool.thread_cache();
    let p = pool.allocate(&mut cache, 129).unwrap();
    assert_eq!(unsafe { pool.usable_size(p) }, 144);
    unsafe { pool.deallocate(&mut cache, p) };
  }

  #[test]
  fn blocks_cross_threads() {
    let pool = Pool::new().unwrap();
    let blocks: Vec<usize> = std::thread::scope(|s| {
      s.spawn(|| {
        let mut cache = pool.thread_cache();
        (0..256)
          .map(|i| pool.allocate(&mut cache, 8 + i).unwrap().as_ptr() as usize)
          .collect()
      })
      .join()
      .unwrap()
    });
    std::thread::scope(|s| {
      s.spawn(|| {
        let mut cache = pool.thread_cache();
        for addr in blocks {
          let ptr = NonNull::new(addr as *mut u8).unwrap();
          unsafe { pool.deallocate(&mut cache, ptr) };
        }
      });
    });
    let stats = pool.stats();
    assert_eq!(stats.free_pages, stats.reserved_pages);
  }

  #[test]
  fn uncached_path_round_trips() {
    let pool = Pool::new().unwrap();
    let p = pool.allocate_uncached(40).unwrap();
    assert_eq!(unsafe { pool.usable_size(p) }, 40);
    unsafe { pool.deallocate_uncached(p) };
    let q = pool.allocate_uncached(MAX_BYTES + 1).unwrap();
    unsafe { pool.deallocate_uncached(q) };
    let stats = pool.stats();
    assert_eq!(stats.free_pages, stats.reserved_pages);
  }

  #[test]
  #[should_panic(expected = "thread cache belongs to another pool")]
  fn foreign_cache_is_rejected() {
    let a = Pool::new().unwrap();
    let b = Pool::new().unwrap();
    let mut cache = b.thread_cache();
    let _ = a.allocate(&mut cache, 8);
  }

  #[test]
  fn overflowing_request_fails_cleanly() {
    let pool = Pool::new().unwrap();
    let mut cache = pool.thread_cache();
    assert_eq!(
      pool.allocate(&mut cache, usize::MAX),
      Err(AllocError::SizeOverflow { size: usize::MAX })
    );
  }
}
