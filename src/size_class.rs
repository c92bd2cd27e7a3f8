//! Size-class arithmetic.
//!
//! Internal fragmentation is held to roughly 10% by aligning small requests finely
//! and large ones coarsely:
//!
//! | request           | alignment | buckets      |
//! |-------------------|-----------|--------------|
//! | `[1, 128]`        | 8 B       | `[0, 16)`    |
//! | `(128, 1024]`     | 16 B      | `[16, 72)`   |
//! | `(1 KiB, 8 KiB]`  | 128 B     | `[72, 128)`  |
//! | `(8 KiB, 64 KiB]` | 1 KiB     | `[128, 184)` |
//! | `(64 KiB, 256 KiB]` | 8 KiB   | `[184, 208)` |
//!
//! Above 256 KiB requests are rounded to whole pages and never get a bucket.

use crate::consts::{MAX_BATCH, MAX_BYTES, MIN_BATCH, PAGE_SHIFT, PAGE_SIZE};

/// Buckets per alignment regime, excluding the last one.
const GROUP_BUCKETS: [usize; 4] = [16, 56, 56, 56];

#[inline(always)]
const fn round_up_to(bytes: usize, align: usize) -> usize {
  (bytes + align - 1) & !(align - 1)
}

#[inline(always)]
const fn bucket_in_group(bytes: usize, align_shift: usize) -> usize {
  ((bytes + (1 << align_shift) - 1) >> align_shift) - 1
}

/// Rounds a request up to the size actually handed out.
///
/// Sizes above [`MAX_BYTES`] are rounded to a whole number of pages. `size` must not
/// exceed `usize::MAX - PAGE_SIZE`.
#[inline]
pub const fn round_up(size: usize) -> usize {
  if size <= 128 {
    round_up_to(size, 8)
  } else if size <= 1024 {
    round_up_to(size, 16)
  } else if size <= 8 * 1024 {
    round_up_to(size, 128)
  } else if size <= 64 * 1024 {
    round_up_to(size, 1024)
  } else if size <= MAX_BYTES {
    round_up_to(size, 8 * 1024)
  } else {
    round_up_to(size, PAGE_SIZE)
  }
}

/// Bucket index of `size`. Panics above [`MAX_BYTES`].
#[inline]
pub fn index(size: usize) -> usize {
  debug_assert!(size > 0, "size class of a zero-byte request");
  assert!(
    size <= MAX_BYTES,
    "size {size} exceeds the largest size class ({MAX_BYTES})"
  );

  if size <= 128 {
    bucket_in_group(size, 3)
  } else if size <= 1024 {
    bucket_in_group(size - 128, 4) + GROUP_BUCKETS[0]
  } else if size <= 8 * 1024 {
    bucket_in_group(size - 1024, 7) + GROUP_BUCKETS[0] + GROUP_BUCKETS[1]
  } else if size <= 64 * 1024 {
    bucket_in_group(size - 8 * 1024, 10) + GROUP_BUCKETS[0] + GROUP_BUCKETS[1] + GROUP_BUCKETS[2]
  } else {
    bucket_in_group(size - 64 * 1024, 13)
      + GROUP_BUCKETS[0]
      + GROUP_BUCKETS[1]
      + GROUP_BUCKETS[2]
      + GROUP_BUCKETS[3]
  }
}

/// Upper bound on objects moved per thread/central transfer (slow-start ceiling).
#[inline]
pub fn num_move_size(size: usize) -> usize {
  debug_assert!(size > 0);
  (MAX_BYTES / size).clamp(MIN_BATCH, MAX_BATCH)
}

/// Pages the central cache requests when a bucket runs dry.
#[inline]
pub fn num_move_page(size: usize) -> usize {
  let bytes = num_move_size(size) * size;
  (bytes >> PAGE_SHIFT).max(1)
}
