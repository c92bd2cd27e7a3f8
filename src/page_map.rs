//! Page number to span lookup.
//!
//! A three-level radix tree over the 35-bit page-number space of a 48-bit address
//! space. Interior nodes are mapped on demand, so the tree costs memory only for
//! regions the allocator actually reserved.
//!
//! Writers are serialized by the page-cache lock. Readers take no lock: a node
//! pointer or entry, once published, is only ever replaced by another valid value.

use core::{
  mem::size_of,
  ptr::NonNull,
  sync::atomic::{AtomicPtr, AtomicU32, Ordering},
};

use crate::{
  AllocError,
  consts::{PAGE_MAP_BITS, PAGE_MAP_LEAF_BITS, PAGE_MAP_MID_BITS, PAGE_MAP_ROOT_BITS},
  os,
  span::SpanId,
};

const ROOT_LEN: usize = 1 << PAGE_MAP_ROOT_BITS;
const MID_LEN: usize = 1 << PAGE_MAP_MID_BITS;
const LEAF_LEN: usize = 1 << PAGE_MAP_LEAF_BITS;

/// Entry value for "no span".
const EMPTY: u32 = 0;

#[repr(C)]
struct Leaf {
  /// `SpanId + 1`, or [`EMPTY`].
  entries: [AtomicU32; LEAF_LEN],
}

#[repr(C)]
struct Mid {
  leaves: [AtomicPtr<Leaf>; MID_LEN],
}

#[repr(C)]
struct Root {
  mids: [AtomicPtr<Mid>; ROOT_LEN],
}

#[inline(always)]
const fn split(page: usize) -> (usize, usize, usize) {
  (
    page >> (PAGE_MAP_MID_BITS + PAGE_MAP_LEAF_BITS),
    (page >> PAGE_MAP_LEAF_BITS) & (MID_LEN - 1),
    page & (LEAF_LEN - 1),
  )
}

/// Maps a zeroed node of type `T`. All-zero is a valid empty node.
fn map_node<T>() -> Result<NonNull<T>, AllocError> {
  Ok(os::reserve_bytes(size_of::<T>())?.cast())
}

pub(crate) struct PageMap {
  root: NonNull<Root>,
}

// SAFETY: every node is reached only through atomics and lives until drop.
unsafe impl Send for PageMap {}
unsafe impl Sync for PageMap {}

impl PageMap {
  pub(crate) fn new() -> Result<Self, AllocError> {
    Ok(Self { root: map_node()? })
  }

  #[inline]
  fn root(&self) -> &Root {
    unsafe { self.root.as_ref() }
  }

  /// Leaf covering `page`, if it has been mapped.
  #[inline]
  fn leaf(&self, page: usize) -> Option<&Leaf> {
    if page >> PAGE_MAP_BITS != 0 {
      return None;
    }
    let (r, m, _) = split(page);
    let mid = NonNull::new(self.root().mids[r].load(Ordering::Acquire))?;
    let leaf = NonNull::new(unsafe { mid.as_ref() }.leaves[m].load(Ordering::Acquire))?;
    Some(unsafe { leaf.as_ref() })
  }

  /// Maps every node needed to hold entries for `pages` pages starting at `first`.
  ///
  /// After this succeeds, [`set`](Self::set) and [`clear`](Self::clear) on those pages
  /// cannot fail. Caller holds the page-cache lock.
  pub(crate) fn ensure(&self, first: usize, pages: usize) -> Result<(), AllocError> {
    debug_assert!(pages > 0);
    let last = first + pages - 1;
    assert!(
      last >> PAGE_MAP_BITS == 0,
      "page {last:#x} outside the {PAGE_MAP_BITS}-bit page map"
    );

    let mut page = first;
    while page <= last {
      let (r, m, _) = split(page);
      let slot = &self.root().mids[r];
      let mid = match NonNull::new(slot.load(Ordering::Acquire)) {
        Some(mid) => mid,
        None => {
          let mid = map_node::<Mid>()?;
          slot.store(mid.as_ptr(), Ordering::Release);
          mid
        }
      };
      let slot = &unsafe { mid.as_ref() }.leaves[m];
      if slot.load(Ordering::Acquire).is_null() {
        slot.store(map_node::<Leaf>()?.as_ptr(), Ordering::Release);
      }
      // Next leaf boundary.
      page = (page | (LEAF_LEN - 1)) + 1;
    }
    Ok(())
  }

  /// Span owning `page`, if any.
  #[inline]
  pub(crate) fn get(&self, page: usize) -> Option<SpanId> {
    let (_, _, l) = split(page);
    let raw = self.leaf(page)?.entries[l].load(Ordering::Acquire);
    (raw != EMPTY).then(|| SpanId::from_raw(raw - 1))
  }

  /// Records `span` as the owner of `page`. The page must be covered by [`ensure`](Self::ensure).
  #[inline]
  pub(crate) fn set(&self, page: usize, span: SpanId) {
    let Some(leaf) = self.leaf(page) else {
      panic!("page {page:#x} set before its page-map node was mapped");
    };
    let (_, _, l) = split(page);
    leaf.entries[l].store(span.raw() + 1, Ordering::Release);
  }

  /// Forgets the owner of `page`.
  #[inline]
  pub(crate) fn clear(&self, page: usize) {
    if let Some(leaf) = self.leaf(page) {
      let (_, _, l) = split(page);
      leaf.entries[l].store(EMPTY, Ordering::Release);
    }
  }
}

impl Drop for PageMap {
  fn drop(&mut self) {
    for mid in &self.root().mids {
      let Some(mid) = NonNull::new(mid.load(Ordering::Acquire)) else {
        continue;
      };
      for leaf in &unsafe { mid.as_ref() }.leaves {
        if let Some(leaf) = NonNull::new(leaf.load(Ordering::Acquire)) {
          unsafe { os::unreserve_bytes(leaf.cast(), size_of::<Leaf>()) };
        }
      }
      unsafe { os::unreserve_bytes(mid.cast(), size_of::<Mid>()) };
    }
    unsafe { os::unreserve_bytes(self.root.cast(), size_of::<Root>()) };
  }
}
