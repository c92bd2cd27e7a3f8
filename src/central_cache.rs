//! Middle tier: one locked span list per size class.
//!
//! Thread caches trade blocks with this tier in batches. Each bucket keeps the spans
//! carved for its size class and counts how many blocks of each are out; a span with
//! nothing out goes back to the page cache.
//!
//! A bucket lock is never held while the page-cache lock is taken. Calls down are
//! made with the bucket lock released via [`MutexGuard::unlocked`].

use tracing::trace;

use crate::{
  AllocError,
  consts::NFREELISTS,
  free_list::Chain,
  lock::{Mutex, MutexGuard},
  page_cache::PageCache,
  size_class,
  span::{SpanId, SpanList},
};

pub(crate) struct CentralCache {
  buckets: [Mutex<SpanList>; NFREELISTS],
}

impl CentralCache {
  pub(crate) fn new(pages: &PageCache) -> Result<Self, AllocError> {
    let mut lists = [const { None }; NFREELISTS];
    for list in &mut lists {
      *list = Some(pages.new_list()?);
    }
    Ok(Self {
      buckets: lists.map(|list| Mutex::new(list.unwrap_or_else(|| unreachable!()))),
    })
  }

  /// Detaches up to `batch` blocks of class `size` from a single span. Never returns an
  /// empty chain.
  pub(crate) fn fetch_range_obj(
    &self,
    pages: &PageCache,
    batch: usize,
    size: usize,
  ) -> Result<Chain, AllocError> {
    debug_assert!(batch > 0);
    let idx = size_class::index(size);
    let mut list = self.buckets[idx].lock();
    let (id, carved) = Self::get_one_span(pages, &mut list, size)?;

    // SAFETY: the span is on this bucket and its lock is held.
    let blocks = unsafe { pages.span(id).blocks() };
    let Some(chain) = blocks.free_list.take_up_to(batch) else {
      unreachable!("span with free blocks yielded none");
    };
    blocks.use_count += chain.len();
    drop(list);

    if let Some(blocks) = carved {
      trace!(bucket = idx, blocks, "carved span for size class");
    }
    Ok(chain)
  }

  /// A span in `list` with at least one free block, carving a new one if needed. The
  /// second value is the block count of a freshly carved span.
  fn get_one_span(
    pages: &PageCache,
    list: &mut MutexGuard<'_, SpanList>,
    size: usize,
  ) -> Result<(SpanId, Option<usize>), AllocError> {
    let spans = pages.spans();
    let found = list
      .iter(spans)
      .find(|&id| !unsafe { pages.span(id).blocks() }.free_list.is_empty());
    if let Some(id) = found {
      return Ok((id, None));
    }

    let npages = size_class::num_move_page(size);
    let id = MutexGuard::unlocked(list, || -> Result<SpanId, AllocError> {
      let id = pages.new_span(npages, size)?;
      // SAFETY: the span is leased to us and published nowhere yet.
      unsafe { pages.span(id).carve(size) };
      Ok(id)
    })?;

    // SAFETY: still private to this thread.
    let blocks = unsafe { pages.span(id).blocks() }.free_list.len();
    unsafe { list.push_front(spans, id) };
    Ok((id, Some(blocks)))
  }

  /// Returns each block of `chain` to the span it was carved from. Spans left with no
  /// outstanding blocks go back to the page cache.
  ///
  /// # Safety
  ///
  /// Every block came from [`fetch_range_obj`](Self::fetch_range_obj) with this
  /// `size` and is not used again.
  pub(crate) unsafe fn release_list_to_spans(&self, pages: &PageCache, chain: Chain, size: usize) {
    let idx = size_class::index(size);
    let spans = pages.spans();
    let mut list = self.buckets[idx].lock();

    for block in chain {
      let id = pages.map_object_to_span(block);
      let span = pages.span(id);

      // SAFETY: spans of this class live on this bucket, whose lock we hold.
      let blocks = unsafe { span.blocks() };
      assert!(
        blocks.use_count > 0,
        "{block:p} freed to a span with no outstanding blocks"
      );
      debug_assert_eq!(
        size_class::round_up(span.obj_size()),
        size_class::round_up(size),
        "block freed to the wrong size class"
      );
      unsafe { blocks.free_list.push(block) };
      blocks.use_count -= 1;

      if blocks.use_count == 0 {
        blocks.free_list.clear();
        unsafe { list.erase(spans, id) };
        MutexGuard::unlocked(&mut list, || unsafe {
          pages.release_span(id);
        });
      }
    }
  }

  /// `(use_count, free blocks)` of every span in the bucket for `size`.
  #[cfg(test)]
  pub(crate) fn bucket(&self, pages: &PageCache, size: usize) -> Vec<(usize, usize)> {
    let list = self.buckets[size_class::index(size)].lock();
    list
      .iter(pages.spans())
      .map(|id| {
        let blocks = unsafe { pages.span(id).blocks() };
        (blocks.use_count, blocks.free_list.len())
      })
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::consts::PAGE_SIZE;

  fn setup() -> (PageCache, CentralCache) {
    let pages = PageCache::new().unwrap();
    let central = CentralCache::new(&pages).unwrap();
    (pages, central)
  }

  #[test]
  fn fetch_carves_one_span_and_counts_use() {
    let (pages, central) = setup();
    let chain = central.fetch_range_obj(&pages, 10, 64).unwrap();
    assert_eq!(chain.len(), 10);

    let per_span = size_class::num_move_page(64) * PAGE_SIZE / 64;
    assert_eq!(central.bucket(&pages, 64), vec![(10, per_span - 10)]);

    // Every block of the chain belongs to the same span.
    let mut owners = chain.into_iter().map(|b| pages.map_object_to_span(b));
    let first = owners.next().unwrap();
    assert!(owners.all(|id| id == first));
  }

  #[test]
  fn batch_is_capped_by_one_span() {
    let (pages, central) = setup();
    let size = 128 * 1024;
    let per_span = size_class::num_move_page(size) * PAGE_SIZE / size;
    let chain = central.fetch_range_obj(&pages, 100, size).unwrap();
    assert_eq!(chain.len(), per_span);
    assert_eq!(central.bucket(&pages, size), vec![(per_span, 0)]);

    // The next fetch needs a second span.
    let more = central.fetch_range_obj(&pages, 1, size).unwrap();
    assert_eq!(more.len(), 1);
    assert_eq!(central.bucket(&pages, size).len(), 2);
  }

  #[test]
  fn drained_span_returns_to_page_cache() {
    let (pages, central) = setup();
    let free_before = pages.stats().free_pages;
    let chain = central.fetch_range_obj(&pages, 7, 256).unwrap();
    let span_pages = size_class::num_move_page(256);
    assert_eq!(pages.stats().free_pages, free_before + pages.stats().reserved_pages - span_pages);

    let (first, rest) = chain.split_first();
    unsafe { central.release_list_to_spans(&pages, rest.unwrap(), 256) };
    assert_eq!(central.bucket(&pages, 256)[0].0, 1);

    unsafe { central.release_list_to_spans(&pages, Chain::single(first), 256) };
    assert!(central.bucket(&pages, 256).is_empty());

    let stats = pages.stats();
    assert_eq!(stats.free_pages, stats.reserved_pages);
    assert_eq!(stats.free_spans, 1);
  }

  #[test]
  #[should_panic(expected = "no outstanding blocks")]
  fn double_free_is_fatal() {
    let (pages, central) = setup();
    let block = central.fetch_range_obj(&pages, 1, 32).unwrap().split_first().0;
    unsafe {
      central.release_list_to_spans(&pages, Chain::single(block), 32);
      central.release_list_to_spans(&pages, Chain::single(block), 32);
    }
  }
}
