//! Top tier: a private free list per size class.
//!
//! The hot path touches no lock. Lists refill from the central cache in batches
//! whose size grows one step per refill (slow start), and a list that reaches its
//! batch ceiling gives one batch back.

use core::ptr::NonNull;

use tracing::trace;

use crate::{
  AllocError,
  consts::{MAX_BYTES, NFREELISTS},
  free_list::FreeList,
  pool::Pool,
  size_class,
};

/// Per-thread block cache over a [`Pool`].
///
/// Not shareable; each thread owns its own. Dropping the cache returns every block
/// it holds to the pool.
pub struct ThreadCache<'p> {
  pool: &'p Pool,
  lists: [FreeList; NFREELISTS],
}

impl<'p> ThreadCache<'p> {
  pub fn new(pool: &'p Pool) -> Self {
    Self {
      pool,
      lists: [const { FreeList::new() }; NFREELISTS],
    }
  }

  #[inline]
  pub fn pool(&self) -> &'p Pool {
    self.pool
  }

  /// Hands out a block of at least `size` bytes, `0 < size <= MAX_BYTES`.
  #[inline]
  pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
    assert!(size <= MAX_BYTES, "thread cache asked for {size} bytes");
    let size = size_class::round_up(size.max(1));
    let idx = size_class::index(size);
    if !self.lists[idx].is_empty() {
      return Ok(self.lists[idx].pop());
    }
    self.fetch_from_central(idx, size)
  }

  /// Refills bucket `idx` and returns one block from the batch.
  fn fetch_from_central(&mut self, idx: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
    let list = &mut self.lists[idx];
    let ceiling = size_class::num_move_size(size);
    let batch = list.max_size().min(ceiling);
    if batch == list.max_size() {
      list.grow_max_size();
    }

    let chain = self.pool.central().fetch_range_obj(self.pool.pages(), batch, size)?;
    let (block, rest) = chain.split_first();
    if let Some(rest) = rest {
      list.push_range(rest);
    }
    Ok(block)
  }

  /// Takes back a block of class `size`.
  ///
  /// # Safety
  ///
  /// `ptr` came from this pool with a request that rounds to the same class as `size`,
  /// and is not used again.
  #[inline]
  pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
    let size = size_class::round_up(size);
    let idx = size_class::index(size);
    let list = &mut self.lists[idx];
    unsafe { list.push(ptr) };
    if list.len() >= list.max_size() {
      self.list_too_long(idx, size);
    }
  }

  /// Gives one batch of bucket `idx` back to the central cache.
  fn list_too_long(&mut self, idx: usize, size: usize) {
    let list = &mut self.lists[idx];
    let chain = list.pop_range(list.max_size());
    // SAFETY: blocks on our lists came from the central cache for this class.
    unsafe { self.pool.central().release_list_to_spans(self.pool.pages(), chain, size) };
  }

  /// Returns every cached block to the central cache. Returns the number of blocks.
  pub fn flush(&mut self) -> usize {
    let mut flushed = 0;
    for idx in 0..NFREELISTS {
      let Some(chain) = self.lists[idx].take_up_to(usize::MAX) else {
        continue;
      };
      flushed += chain.len();
      let size = class_size(idx);
      unsafe { self.pool.central().release_list_to_spans(self.pool.pages(), chain, size) };
    }
    flushed
  }

  /// Blocks currently cached.
  pub fn cached(&self) -> usize {
    self.lists.iter().map(FreeList::len).sum()
  }
}

impl Drop for ThreadCache<'_> {
  fn drop(&mut self) {
    let blocks = self.flush();
    if blocks > 0 {
      trace!(blocks, "flushed thread cache");
    }
  }
}

/// Largest request that lands in bucket `idx`.
fn class_size(idx: usize) -> usize {
  let mut lo = 1;
  let mut hi = MAX_BYTES;
  // `index` is monotone; find the last size mapping to `idx`.
  while lo < hi {
    let mid = lo + (hi - lo).div_ceil(2);
    if size_class::index(mid) <= idx {
      lo = mid;
    } else {
      hi = mid - 1;
    }
  }
  lo
}
