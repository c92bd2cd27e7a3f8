//! Spans, the slot arena that stores them, and the circular lists that own them.
//!
//! A span is addressed by a [`SpanId`] into a [`SpanArena`] whose slots never move.
//! Lists link spans by id through a permanent sentinel slot, so an empty list is one
//! whose sentinel points at itself.
//!
//! Span fields fall into two groups:
//! * geometry and tags (`page_id`, `pages`, `obj_size`, `in_use`) are atomics, written
//!   under the page-cache lock and read from anywhere;
//! * `links` and `blocks` sit in `UnsafeCell`s owned by whoever holds the lock of the
//!   list the span is currently on (or by the thread that has it detached).

use core::{
  cell::UnsafeCell,
  mem::size_of,
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering},
};

use crate::{
  AllocError,
  consts::{PAGE_SHIFT, SPAN_CHUNK_SLOTS, SPAN_CHUNKS},
  free_list::FreeList,
  os,
};

const CHUNK_SHIFT: usize = SPAN_CHUNK_SLOTS.trailing_zeros() as usize;
const CHUNK_BYTES: usize = size_of::<SpanChunk>();

/// Handle of a span slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct SpanId(u32);

impl SpanId {
  /// Terminator of the recycled-slot stack.
  const NONE: SpanId = SpanId(u32::MAX);

  #[inline(always)]
  pub(crate) const fn from_raw(raw: u32) -> Self {
    SpanId(raw)
  }

  #[inline(always)]
  pub(crate) const fn raw(self) -> u32 {
    self.0
  }
}

#[derive(Debug)]
pub(crate) struct Links {
  prev: SpanId,
  next: SpanId,
}

/// Blocks carved from a leased span.
#[derive(Debug)]
pub(crate) struct Blocks {
  pub(crate) free_list: FreeList,
  /// Blocks currently handed out to thread caches.
  pub(crate) use_count: usize,
}

pub(crate) struct Span {
  page_id: AtomicUsize,
  pages: AtomicUsize,
  obj_size: AtomicUsize,
  in_use: AtomicBool,
  links: UnsafeCell<Links>,
  blocks: UnsafeCell<Blocks>,
}

// SAFETY: the cells are only touched under the lock that owns the span's current list,
// everything else is atomic.
unsafe impl Sync for Span {}

impl Span {
  #[inline]
  pub(crate) fn page_id(&self) -> usize {
    self.page_id.load(Ordering::Relaxed)
  }

  #[inline]
  pub(crate) fn set_page_id(&self, page_id: usize) {
    self.page_id.store(page_id, Ordering::Relaxed);
  }

  #[inline]
  pub(crate) fn pages(&self) -> usize {
    self.pages.load(Ordering::Relaxed)
  }

  #[inline]
  pub(crate) fn set_pages(&self, pages: usize) {
    self.pages.store(pages, Ordering::Relaxed);
  }

  /// Size the span was carved for, the raw request for an oversized span, 0 when free.
  #[inline]
  pub(crate) fn obj_size(&self) -> usize {
    self.obj_size.load(Ordering::Acquire)
  }

  #[inline]
  pub(crate) fn set_obj_size(&self, size: usize) {
    self.obj_size.store(size, Ordering::Release);
  }

  #[inline]
  pub(crate) fn is_in_use(&self) -> bool {
    self.in_use.load(Ordering::Relaxed)
  }

  #[inline]
  pub(crate) fn set_in_use(&self, in_use: bool) {
    self.in_use.store(in_use, Ordering::Relaxed);
  }

  /// First byte of the span's memory.
  #[inline]
  pub(crate) fn base(&self) -> NonNull<u8> {
    let addr = self.page_id() << PAGE_SHIFT;
    debug_assert!(addr != 0, "base of an unplaced span");
    // SAFETY: placed spans never start at page 0.
    unsafe { NonNull::new_unchecked(addr as *mut u8) }
  }

  /// # Safety
  ///
  /// The caller holds the lock of the central bucket this span is on, or owns the
  /// span exclusively (detached, not yet published).
  #[inline]
  #[allow(clippy::mut_from_ref)]
  pub(crate) unsafe fn blocks(&self) -> &mut Blocks {
    unsafe { &mut *self.blocks.get() }
  }

  #[inline]
  #[allow(clippy::mut_from_ref)]
  unsafe fn links(&self) -> &mut Links {
    unsafe { &mut *self.links.get() }
  }

  /// Cuts the span's memory into `size`-byte blocks.
  ///
  /// # Safety
  ///
  /// The span is leased and not yet visible to any other thread.
  pub(crate) unsafe fn carve(&self, size: usize) {
    let bytes = self.pages() << PAGE_SHIFT;
    let blocks = unsafe { self.blocks() };
    blocks.free_list = unsafe { FreeList::carve(self.base(), bytes, size) };
    blocks.use_count = 0;
  }

  fn reset(&self, id: SpanId) {
    self.set_page_id(0);
    self.set_pages(0);
    self.set_obj_size(0);
    self.set_in_use(false);
    // SAFETY: only called on a slot that just left the recycled stack or was never used.
    unsafe {
      *self.links() = Links { prev: id, next: id };
      let blocks = self.blocks();
      blocks.free_list.clear();
      blocks.use_count = 0;
    }
  }
}

// =============================================================================
// Arena
// =============================================================================

#[repr(C)]
struct SpanChunk {
  slots: [Span; SPAN_CHUNK_SLOTS],
}

/// Stable storage for span metadata. Chunks are mapped on demand and live until the
/// arena is dropped, so a `&Span` stays valid for the arena's lifetime.
pub(crate) struct SpanArena {
  chunks: [AtomicPtr<SpanChunk>; SPAN_CHUNKS],
}

impl SpanArena {
  pub(crate) const fn new() -> Self {
    Self {
      chunks: [const { AtomicPtr::new(null_mut()) }; SPAN_CHUNKS],
    }
  }

  #[inline]
  pub(crate) fn get(&self, id: SpanId) -> &Span {
    let raw = id.0 as usize;
    let chunk = self.chunks[raw >> CHUNK_SHIFT].load(Ordering::Acquire);
    assert!(!chunk.is_null(), "span handle {raw} outside the arena");
    // SAFETY: mapped chunks stay mapped until drop; zeroed memory is a valid `Span`.
    unsafe { &(*chunk).slots[raw & (SPAN_CHUNK_SLOTS - 1)] }
  }

  fn ensure_chunk(&self, chunk: usize) -> Result<(), AllocError> {
    if chunk >= SPAN_CHUNKS {
      return Err(AllocError::MetadataExhausted);
    }
    if self.chunks[chunk].load(Ordering::Acquire).is_null() {
      let mem = os::reserve_bytes(CHUNK_BYTES)?;
      self.chunks[chunk].store(mem.as_ptr().cast(), Ordering::Release);
    }
    Ok(())
  }
}

impl Drop for SpanArena {
  fn drop(&mut self) {
    for chunk in &self.chunks {
      if let Some(mem) = NonNull::new(chunk.load(Ordering::Acquire)) {
        unsafe { os::unreserve_bytes(mem.cast(), CHUNK_BYTES) };
      }
    }
  }
}

/// Fixed-size slot allocator over a [`SpanArena`]. Not synchronized; the page cache
/// lock serializes it.
pub(crate) struct SpanSlab {
  next_fresh: u32,
  recycled: SpanId,
  live: usize,
}

impl SpanSlab {
  pub(crate) const fn new() -> Self {
    Self {
      next_fresh: 0,
      recycled: SpanId::NONE,
      live: 0,
    }
  }

  /// Hands out a reset span slot.
  pub(crate) fn acquire(&mut self, arena: &SpanArena) -> Result<SpanId, AllocError> {
    let id = if self.recycled != SpanId::NONE {
      let id = self.recycled;
      // SAFETY: recycled slots are owned by the slab.
      self.recycled = unsafe { arena.get(id).links().next };
      id
    } else {
      let raw = self.next_fresh as usize;
      arena.ensure_chunk(raw >> CHUNK_SHIFT)?;
      self.next_fresh += 1;
      SpanId(raw as u32)
    };
    arena.get(id).reset(id);
    self.live += 1;
    Ok(id)
  }

  /// Returns a slot for reuse.
  ///
  /// # Safety
  ///
  /// `id` is on no list and no page-map entry will be followed to it again.
  pub(crate) unsafe fn release(&mut self, arena: &SpanArena, id: SpanId) {
    debug_assert!(self.live > 0);
    let span = arena.get(id);
    span.set_in_use(false);
    span.set_pages(0);
    unsafe { span.links().next = self.recycled };
    self.recycled = id;
    self.live -= 1;
  }

  #[cfg(test)]
  pub(crate) fn live(&self) -> usize {
    self.live
  }
}

// =============================================================================
// SpanList
// =============================================================================

/// Circular doubly linked list of spans with a sentinel head.
///
/// Holding `&mut SpanList` (i.e. the lock it lives behind) grants exclusive access to
/// the links of its sentinel and of every member.
#[derive(Debug)]
pub(crate) struct SpanList {
  head: SpanId,
}

impl SpanList {
  /// Creates an empty list around a fresh sentinel slot.
  pub(crate) fn new(slab: &mut SpanSlab, arena: &SpanArena) -> Result<Self, AllocError> {
    // `acquire` leaves the slot linked to itself.
    let head = slab.acquire(arena)?;
    Ok(Self { head })
  }

  #[inline]
  pub(crate) fn begin(&self, arena: &SpanArena) -> SpanId {
    unsafe { arena.get(self.head).links().next }
  }

  #[inline]
  pub(crate) fn end(&self) -> SpanId {
    self.head
  }

  #[inline]
  pub(crate) fn is_empty(&self, arena: &SpanArena) -> bool {
    self.begin(arena) == self.end()
  }

  /// Links `span` in front of `pos`.
  ///
  /// # Safety
  ///
  /// `pos` is a member or the sentinel; `span` is detached and exclusively owned.
  unsafe fn insert(&mut self, arena: &SpanArena, pos: SpanId, span: SpanId) {
    debug_assert!(span != self.head);
    unsafe {
      let prev = arena.get(pos).links().prev;
      arena.get(prev).links().next = span;
      let links = arena.get(span).links();
      links.prev = prev;
      links.next = pos;
      arena.get(pos).links().prev = span;
    }
  }

  /// # Safety
  ///
  /// `span` is detached and exclusively owned by the caller.
  #[inline]
  pub(crate) unsafe fn push_front(&mut self, arena: &SpanArena, span: SpanId) {
    let begin = self.begin(arena);
    unsafe { self.insert(arena, begin, span) };
  }

  pub(crate) fn pop_front(&mut self, arena: &SpanArena) -> Option<SpanId> {
    if self.is_empty(arena) {
      return None;
    }
    let span = self.begin(arena);
    // SAFETY: `begin` of a non-empty list is a member.
    unsafe { self.erase(arena, span) };
    Some(span)
  }

  /// Unlinks `span`. The span itself is not released.
  ///
  /// # Safety
  ///
  /// `span` is a member of this list.
  pub(crate) unsafe fn erase(&mut self, arena: &SpanArena, span: SpanId) {
    assert!(span != self.head, "erasing the sentinel of a span list");
    unsafe {
      let links = arena.get(span).links();
      let (prev, next) = (links.prev, links.next);
      arena.get(prev).links().next = next;
      arena.get(next).links().prev = prev;
      links.prev = span;
      links.next = span;
    }
  }

  /// Members from front to back.
  pub(crate) fn iter<'a>(&'a self, arena: &'a SpanArena) -> impl Iterator<Item = SpanId> + 'a {
    let mut cursor = self.begin(arena);
    core::iter::from_fn(move || {
      if cursor == self.end() {
        return None;
      }
      let span = cursor;
      cursor = unsafe { arena.get(span).links().next };
      Some(span)
    })
  }

  #[cfg(test)]
  pub(crate) fn len(&self, arena: &SpanArena) -> usize {
    self.iter(arena).count()
  }
}
