//! Intrusive free lists over raw memory.
//!
//! A free block stores the link to the next free block in its first word. This is
//! the only module that reads or writes those words: blocks enter a list through
//! [`FreeList::push`], [`FreeList::push_range`] or [`FreeList::carve`] and leave it
//! as plain `NonNull<u8>` pointers, so a block handed to a caller is never still
//! linked anywhere.

use core::{mem::size_of, ptr::NonNull};

#[repr(C)]
struct FreeBlock {
  next: Option<NonNull<FreeBlock>>,
}

/// Smallest block a free list can hold.
pub(crate) const MIN_BLOCK: usize = size_of::<FreeBlock>();

#[inline(always)]
unsafe fn next_of(block: NonNull<FreeBlock>) -> Option<NonNull<FreeBlock>> {
  unsafe { (*block.as_ptr()).next }
}

#[inline(always)]
unsafe fn set_next(block: NonNull<FreeBlock>, next: Option<NonNull<FreeBlock>>) {
  unsafe { (*block.as_ptr()).next = next };
}

// =============================================================================
// Chain
// =============================================================================

/// A detached, null-terminated run of `len` linked blocks.
#[derive(Debug)]
pub(crate) struct Chain {
  head: NonNull<FreeBlock>,
  tail: NonNull<FreeBlock>,
  len: usize,
}

// SAFETY: a chain exclusively owns the blocks it links.
unsafe impl Send for Chain {}

impl Chain {
  /// Chain of exactly one block.
  ///
  /// # Safety
  ///
  /// `block` must be exclusively owned, word-aligned and at least [`MIN_BLOCK`] bytes.
  pub(crate) unsafe fn single(block: NonNull<u8>) -> Self {
    let block = block.cast::<FreeBlock>();
    unsafe { set_next(block, None) };
    Self {
      head: block,
      tail: block,
      len: 1,
    }
  }

  #[inline]
  pub(crate) fn len(&self) -> usize {
    self.len
  }

  /// Detaches the first block, returning it and whatever remains.
  pub(crate) fn split_first(self) -> (NonNull<u8>, Option<Chain>) {
    let first = self.head.cast::<u8>();
    if self.len == 1 {
      return (first, None);
    }
    // SAFETY: `len > 1`, so the head links to a block in this chain.
    let rest = unsafe { next_of(self.head) };
    let rest = rest.map(|head| Chain {
      head,
      tail: self.tail,
      len: self.len - 1,
    });
    debug_assert!(rest.is_some(), "chain shorter than its length");
    (first, rest)
  }
}

impl IntoIterator for Chain {
  type Item = NonNull<u8>;
  type IntoIter = ChainIter;

  fn into_iter(self) -> ChainIter {
    ChainIter {
      next: Some(self.head),
      remaining: self.len,
    }
  }
}

/// Yields each block of a [`Chain`]. The link is read before a block is yielded, so
/// the caller may immediately overwrite it.
pub(crate) struct ChainIter {
  next: Option<NonNull<FreeBlock>>,
  remaining: usize,
}

impl Iterator for ChainIter {
  type Item = NonNull<u8>;

  fn next(&mut self) -> Option<NonNull<u8>> {
    if self.remaining == 0 {
      return None;
    }
    let block = self.next?;
    self.remaining -= 1;
    self.next = if self.remaining == 0 {
      None
    } else {
      unsafe { next_of(block) }
    };
    Some(block.cast())
  }

  fn size_hint(&self) -> (usize, Option<usize>) {
    (self.remaining, Some(self.remaining))
  }
}

// =============================================================================
// FreeList
// =============================================================================

/// Singly linked list of same-size free blocks with a slow-start batch ceiling.
///
/// Not synchronized; the owner (a thread cache, or the central bucket lock for a
/// span's list) provides exclusion.
#[derive(Debug)]
pub(crate) struct FreeList {
  head: Option<NonNull<FreeBlock>>,
  size: usize,
  max_size: usize,
}

// SAFETY: the list exclusively owns its blocks; moving it moves that ownership.
unsafe impl Send for FreeList {}

impl FreeList {
  pub(crate) const fn new() -> Self {
    Self {
      head: None,
      size: 0,
      max_size: 1,
    }
  }

  /// Builds a list from a fresh run of memory cut into `size`-byte blocks in address
  /// order. A trailing remainder too small for a whole block is left unlinked.
  ///
  /// # Safety
  ///
  /// `base..base + bytes` must be writable, exclusively owned and word-aligned.
  pub(crate) unsafe fn carve(base: NonNull<u8>, bytes: usize, size: usize) -> Self {
    assert!(size >= MIN_BLOCK, "block of {size} bytes cannot hold a link");
    let count = bytes / size;
    assert!(count > 0, "run of {bytes} bytes holds no {size}-byte block");

    let block_at =
      |i: usize| unsafe { NonNull::new_unchecked(base.as_ptr().add(i * size)).cast::<FreeBlock>() };
    let head = block_at(0);
    let mut tail = head;
    for i in 1..count {
      let block = block_at(i);
      unsafe { set_next(tail, Some(block)) };
      tail = block;
    }
    unsafe { set_next(tail, None) };

    Self {
      head: Some(head),
      size: count,
      max_size: 1,
    }
  }

  /// Prepends one block.
  ///
  /// # Safety
  ///
  /// `block` must be exclusively owned, word-aligned, at least [`MIN_BLOCK`] bytes, and
  /// not linked into any list.
  #[inline]
  pub(crate) unsafe fn push(&mut self, block: NonNull<u8>) {
    let block = block.cast::<FreeBlock>();
    unsafe { set_next(block, self.head) };
    self.head = Some(block);
    self.size += 1;
  }

  /// Removes the head block. Panics on an empty list.
  #[inline]
  pub(crate) fn pop(&mut self) -> NonNull<u8> {
    let Some(block) = self.head else {
      panic!("pop from an empty free list");
    };
    self.head = unsafe { next_of(block) };
    self.size -= 1;
    block.cast()
  }

  /// Splices a whole chain in front in O(1).
  #[inline]
  pub(crate) fn push_range(&mut self, chain: Chain) {
    unsafe { set_next(chain.tail, self.head) };
    self.head = Some(chain.head);
    self.size += chain.len;
  }

  /// Detaches exactly the first `n` blocks. Panics if fewer are present.
  pub(crate) fn pop_range(&mut self, n: usize) -> Chain {
    assert!(
      n > 0 && n <= self.size,
      "pop_range({n}) from a free list of {}",
      self.size
    );
    self.take_up_to(n).unwrap_or_else(|| unreachable!())
  }

  /// Detaches up to `n` blocks, fewer if the list runs out. `None` if it is empty.
  pub(crate) fn take_up_to(&mut self, n: usize) -> Option<Chain> {
    debug_assert!(n > 0);
    let head = self.head?;
    let mut tail = head;
    let mut len = 1;
    while len < n {
      match unsafe { next_of(tail) } {
        Some(next) => {
          tail = next;
          len += 1;
        }
        None => break,
      }
    }
    self.head = unsafe { next_of(tail) };
    unsafe { set_next(tail, None) };
    self.size -= len;
    Some(Chain { head, tail, len })
  }

  /// Drops every link without touching the blocks.
  #[inline]
  pub(crate) fn clear(&mut self) {
    self.head = None;
    self.size = 0;
  }

  #[inline]
  pub(crate) fn is_empty(&self) -> bool {
    self.head.is_none()
  }

  #[inline]
  pub(crate) fn len(&self) -> usize {
    self.size
  }

  #[inline]
  pub(crate) fn max_size(&self) -> usize {
    self.max_size
  }

  /// Raises the batch ceiling by one. It never shrinks.
  #[inline]
  pub(crate) fn grow_max_size(&mut self) {
    self.max_size += 1;
  }
}

impl Default for FreeList {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  /// Word-aligned scratch memory carved into `size`-byte blocks.
  fn arena(words: usize) -> Vec<u64> {
    vec![0u64; words]
  }

  fn base(buf: &mut [u64]) -> NonNull<u8> {
    NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap()
  }

  #[test]
  fn push_pop_is_lifo() {
    let mut buf = arena(8);
    let base = base(&mut buf);
    let blocks: Vec<_> = (0..4)
      .map(|i| unsafe { NonNull::new_unchecked(base.as_ptr().add(i * 16)) })
      .collect();

    let mut list = FreeList::new();
    assert!(list.is_empty());
    for &b in &blocks {
      unsafe { list.push(b) };
    }
    assert_eq!(list.len(), 4);
    for &b in blocks.iter().rev() {
      assert_eq!(list.pop(), b);
    }
    assert!(list.is_empty());
    assert_eq!(list.len(), 0);
  }

  #[test]
  #[should_panic(expected = "pop from an empty free list")]
  fn pop_empty_panics() {
    FreeList::new().pop();
  }

  #[test]
  fn carve_links_whole_blocks_in_address_order() {
    let mut buf = arena(16);
    let base = base(&mut buf);
    // 128 bytes into 24-byte blocks: five whole blocks, 8-byte tail dropped.
    let mut list = unsafe { FreeList::carve(base, 128, 24) };
    assert_eq!(list.len(), 5);
    for i in 0..5 {
      assert_eq!(list.pop().as_ptr() as usize, base.as_ptr() as usize + i * 24);
    }
    assert!(list.is_empty());
  }

  #[test]
  fn carve_keeps_exact_fit() {
    let mut buf = arena(16);
    let list = unsafe { FreeList::carve(base(&mut buf), 128, 32) };
    assert_eq!(list.len(), 4);
  }

  #[test]
  fn range_transfer_round_trip() {
    let mut buf = arena(64);
    let mut list = unsafe { FreeList::carve(base(&mut buf), 512, 16) };
    assert_eq!(list.len(), 32);

    let chain = list.pop_range(10);
    assert_eq!(chain.len(), 10);
    assert_eq!(list.len(), 22);

    let mut other = FreeList::new();
    other.push_range(chain);
    assert_eq!(other.len(), 10);
    let mut addrs = Vec::new();
    while !other.is_empty() {
      addrs.push(other.pop());
    }
    assert_eq!(addrs.len(), 10);
    assert!(addrs.windows(2).all(|w| w[1].as_ptr() as usize - w[0].as_ptr() as usize == 16));
  }

  #[test]
  #[should_panic(expected = "pop_range(5)")]
  fn pop_range_needs_enough_blocks() {
    let mut buf = arena(8);
    let mut list = unsafe { FreeList::carve(base(&mut buf), 64, 16) };
    list.pop_range(5);
  }

  #[test]
  fn take_up_to_stops_at_end() {
    let mut buf = arena(8);
    let mut list = unsafe { FreeList::carve(base(&mut buf), 64, 16) };
    let chain = list.take_up_to(10).unwrap();
    assert_eq!(chain.len(), 4);
    assert!(list.is_empty());
    assert!(list.take_up_to(1).is_none());
  }

  #[test]
  fn chain_iteration_survives_relinking() {
    let mut buf = arena(16);
    let mut list = unsafe { FreeList::carve(base(&mut buf), 128, 16) };
    let chain = list.pop_range(8);
    let mut sink = FreeList::new();
    for block in chain {
      // Overwrites the link the iterator just followed.
      unsafe { sink.push(block) };
    }
    assert_eq!(sink.len(), 8);
  }

  #[test]
  fn split_first_detaches_head() {
    let mut buf = arena(8);
    let start = base(&mut buf);
    let mut list = unsafe { FreeList::carve(start, 64, 16) };
    let chain = list.pop_range(3);
    let (first, rest) = chain.split_first();
    assert_eq!(first, start);
    assert_eq!(rest.unwrap().len(), 2);

    let single = unsafe { Chain::single(first) };
    let (only, rest) = single.split_first();
    assert_eq!(only, first);
    assert!(rest.is_none());
  }

  #[test]
  fn max_size_only_grows() {
    let mut list = FreeList::new();
    assert_eq!(list.max_size(), 1);
    list.grow_max_size();
    list.grow_max_size();
    assert_eq!(list.max_size(), 3);
  }
}
