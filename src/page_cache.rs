//! Bottom tier: page runs.
//!
//! Owns every span that is not leased to a size class, hands out runs of `k` pages,
//! splits larger runs on demand and merges neighbours when runs come back. Runs longer
//! than [`MAX_MANAGED_PAGES`] are mapped and unmapped one to one.
//!
//! One coarse lock guards the buckets, the span slab and the region log. The page map
//! and span arena sit outside it so lookups stay lock-free.

use core::ptr::NonNull;

use tracing::{debug, trace};

use crate::{
  AllocError,
  consts::{MAX_MANAGED_PAGES, NPAGES, PAGE_SHIFT},
  lock::Mutex,
  os::RegionLog,
  page_map::PageMap,
  span::{Span, SpanArena, SpanId, SpanList, SpanSlab},
};

/// Where a released span ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Released {
  /// Bucketed as a free run, after merging.
  Bucketed { page_id: usize, pages: usize },
  /// Oversized run handed back to the OS.
  Unmapped { page_id: usize, pages: usize },
}

/// Snapshot of page-cache bookkeeping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct PageStats {
  pub(crate) reserved_pages: usize,
  pub(crate) reservations: u64,
  pub(crate) free_spans: usize,
  pub(crate) free_pages: usize,
  pub(crate) oversized_spans: usize,
}

pub(crate) struct PageState {
  lists: [SpanList; NPAGES],
  slab: SpanSlab,
  regions: RegionLog,
  oversized: usize,
}

pub(crate) struct PageCache {
  state: Mutex<PageState>,
  map: PageMap,
  spans: SpanArena,
}

impl PageCache {
  pub(crate) fn new() -> Result<Self, AllocError> {
    let spans = SpanArena::new();
    let map = PageMap::new()?;
    let mut slab = SpanSlab::new();

    let mut lists = [const { None }; NPAGES];
    for list in &mut lists {
      *list = Some(SpanList::new(&mut slab, &spans)?);
    }
    let lists = lists.map(|list| list.unwrap_or_else(|| unreachable!()));

    Ok(Self {
      state: Mutex::new(PageState {
        lists,
        slab,
        regions: RegionLog::new(),
        oversized: 0,
      }),
      map,
      spans,
    })
  }

  #[inline]
  pub(crate) fn span(&self, id: SpanId) -> &Span {
    self.spans.get(id)
  }

  #[inline]
  pub(crate) fn spans(&self) -> &SpanArena {
    &self.spans
  }

  /// Fresh sentinel slot for a list owned by another tier.
  pub(crate) fn new_list(&self) -> Result<SpanList, AllocError> {
    SpanList::new(&mut self.state.lock().slab, &self.spans)
  }

  /// Leases a `k`-page span tagged with `obj_size`.
  pub(crate) fn new_span(&self, k: usize, obj_size: usize) -> Result<SpanId, AllocError> {
    let mut state = self.state.lock();
    let (id, grew) = state.new_span(&self.spans, &self.map, k)?;
    self.span(id).set_obj_size(obj_size);
    let reserved = state.regions.pages();
    drop(state);

    if let Some(pages) = grew {
      debug!(pages, reserved, "reserved page run from the OS");
    }
    Ok(id)
  }

  /// Span owning the page `ptr` lies in, if any.
  #[inline]
  pub(crate) fn owner(&self, ptr: NonNull<u8>) -> Option<SpanId> {
    self.map.get(ptr.as_ptr() as usize >> PAGE_SHIFT)
  }

  /// Span owning the page `ptr` lies in. Panics if no span owns it.
  #[inline]
  pub(crate) fn map_object_to_span(&self, ptr: NonNull<u8>) -> SpanId {
    match self.owner(ptr) {
      Some(id) => id,
      None => panic!("{ptr:p} does not belong to any span"),
    }
  }

  /// Takes back a span whose blocks are all free.
  ///
  /// # Safety
  ///
  /// `id` is leased, on no list, and none of its memory is used again.
  pub(crate) unsafe fn release_span(&self, id: SpanId) -> Released {
    let mut state = self.state.lock();
    let released = unsafe { state.release_span_to_page_cache(&self.spans, &self.map, id) };
    let reserved = state.regions.pages();
    drop(state);

    match released {
      Released::Bucketed { page_id, pages } => {
        trace!(page_id, pages, "span returned to page cache");
      }
      Released::Unmapped { page_id, pages } => {
        debug!(page_id, pages, reserved, "unreserved page run");
      }
    }
    released
  }

  pub(crate) fn stats(&self) -> PageStats {
    let state = self.state.lock();
    let mut stats = PageStats {
      reserved_pages: state.regions.pages(),
      reservations: state.regions.reservations(),
      oversized_spans: state.oversized,
      ..PageStats::default()
    };
    for (pages, list) in state.lists.iter().enumerate() {
      let spans = list.iter(&self.spans).count();
      stats.free_spans += spans;
      stats.free_pages += spans * pages;
    }
    stats
  }

  /// Free spans in bucket `pages`, front to back, as `(page_id, pages)`.
  #[cfg(test)]
  pub(crate) fn bucket(&self, pages: usize) -> Vec<(usize, usize)> {
    let state = self.state.lock();
    state.lists[pages]
      .iter(&self.spans)
      .map(|id| (self.span(id).page_id(), self.span(id).pages()))
      .collect()
  }
}

// =============================================================================
// Locked State
// =============================================================================

impl PageState {
  /// Reserves a run from the OS and maps the page-map nodes covering it.
  fn reserve(&mut self, map: &PageMap, pages: usize) -> Result<NonNull<u8>, AllocError> {
    let base = self.regions.reserve(pages)?;
    if let Err(e) = map.ensure(base.as_ptr() as usize >> PAGE_SHIFT, pages) {
      unsafe { self.regions.unreserve(base) };
      return Err(e);
    }
    Ok(base)
  }

  /// Fresh span slot wrapping a newly reserved run, or nothing if either step fails.
  fn reserve_span(
    &mut self,
    spans: &SpanArena,
    map: &PageMap,
    pages: usize,
  ) -> Result<SpanId, AllocError> {
    let base = self.reserve(map, pages)?;
    let id = match self.slab.acquire(spans) {
      Ok(id) => id,
      Err(e) => {
        unsafe { self.regions.unreserve(base) };
        return Err(e);
      }
    };
    let span = spans.get(id);
    span.set_page_id(base.as_ptr() as usize >> PAGE_SHIFT);
    span.set_pages(pages);
    Ok(id)
  }

  fn register_all(spans: &SpanArena, map: &PageMap, id: SpanId) {
    let span = spans.get(id);
    let first = span.page_id();
    for page in first..first + span.pages() {
      map.set(page, id);
    }
  }

  fn register_ends(spans: &SpanArena, map: &PageMap, id: SpanId) {
    let span = spans.get(id);
    map.set(span.page_id(), id);
    map.set(span.page_id() + span.pages() - 1, id);
  }

  /// A `k`-page span with every page registered and marked in use. The second value
  /// is the size of the OS reservation made along the way, if any.
  pub(crate) fn new_span(
    &mut self,
    spans: &SpanArena,
    map: &PageMap,
    k: usize,
  ) -> Result<(SpanId, Option<usize>), AllocError> {
    assert!(k > 0, "span of zero pages");

    if k > MAX_MANAGED_PAGES {
      let id = self.reserve_span(spans, map, k)?;
      Self::register_all(spans, map, id);
      spans.get(id).set_in_use(true);
      self.oversized += 1;
      return Ok((id, Some(k)));
    }

    let mut grew = None;
    loop {
      if let Some(id) = self.lists[k].pop_front(spans) {
        Self::register_all(spans, map, id);
        spans.get(id).set_in_use(true);
        return Ok((id, grew));
      }

      if let Some(i) = (k + 1..NPAGES).find(|&i| !self.lists[i].is_empty(spans)) {
        // Take the slot before touching the list so a failure leaves it intact.
        let k_id = self.slab.acquire(spans)?;
        let n_id = self.lists[i]
          .pop_front(spans)
          .unwrap_or_else(|| unreachable!("bucket {i} emptied under the lock"));
        let (n_span, k_span) = (spans.get(n_id), spans.get(k_id));

        k_span.set_page_id(n_span.page_id());
        k_span.set_pages(k);
        n_span.set_page_id(n_span.page_id() + k);
        n_span.set_pages(n_span.pages() - k);

        // SAFETY: `n_id` was just unlinked and is owned here.
        unsafe { self.lists[n_span.pages()].push_front(spans, n_id) };
        Self::register_ends(spans, map, n_id);
        Self::register_all(spans, map, k_id);
        k_span.set_in_use(true);
        return Ok((k_id, grew));
      }

      assert!(grew.is_none(), "fresh {MAX_MANAGED_PAGES}-page run vanished");
      let id = self.reserve_span(spans, map, MAX_MANAGED_PAGES)?;
      Self::register_ends(spans, map, id);
      // SAFETY: fresh slot, on no list.
      unsafe { self.lists[MAX_MANAGED_PAGES].push_front(spans, id) };
      grew = Some(MAX_MANAGED_PAGES);
    }
  }

  /// Merges a returned span with free neighbours and buckets it, or unmaps it if it
  /// is oversized.
  ///
  /// # Safety
  ///
  /// Same contract as [`PageCache::release_span`].
  pub(crate) unsafe fn release_span_to_page_cache(
    &mut self,
    spans: &SpanArena,
    map: &PageMap,
    id: SpanId,
  ) -> Released {
    let span = spans.get(id);
    assert!(span.is_in_use(), "span at page {:#x} released twice", span.page_id());

    if span.pages() > MAX_MANAGED_PAGES {
      let (page_id, pages) = (span.page_id(), span.pages());
      for page in page_id..page_id + pages {
        map.clear(page);
      }
      unsafe {
        self.regions.unreserve(span.base());
        self.slab.release(spans, id);
      }
      self.oversized -= 1;
      return Released::Unmapped { page_id, pages };
    }

    // Backward.
    while let Some(prev_id) = span.page_id().checked_sub(1).and_then(|page| map.get(page)) {
      let prev = spans.get(prev_id);
      if prev.is_in_use() || prev.pages() + span.pages() > MAX_MANAGED_PAGES {
        break;
      }
      span.set_page_id(prev.page_id());
      span.set_pages(span.pages() + prev.pages());
      // SAFETY: a free span that is not in use sits in the bucket of its length.
      unsafe {
        self.lists[prev.pages()].erase(spans, prev_id);
        self.slab.release(spans, prev_id);
      }
    }

    // Forward.
    while let Some(next_id) = map.get(span.page_id() + span.pages()) {
      let next = spans.get(next_id);
      if next.is_in_use() || next.pages() + span.pages() > MAX_MANAGED_PAGES {
        break;
      }
      span.set_pages(span.pages() + next.pages());
      unsafe {
        self.lists[next.pages()].erase(spans, next_id);
        self.slab.release(spans, next_id);
      }
    }

    span.set_in_use(false);
    span.set_obj_size(0);
    unsafe { self.lists[span.pages()].push_front(spans, id) };
    Self::register_ends(spans, map, id);
    Released::Bucketed {
      page_id: span.page_id(),
      pages: span.pages(),
    }
  }
}
