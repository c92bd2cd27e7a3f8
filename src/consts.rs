//! Compile-time configuration of the allocator.

/// log2 of the allocator page size.
pub const PAGE_SHIFT: usize = 13;
/// Allocator page size (8 KiB). Independent of the OS page size.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Largest request served through the size-class tiers.
pub const MAX_BYTES: usize = 256 * 1024;

/// Number of size-class buckets (16 + 56 + 56 + 56 + 24).
pub const NFREELISTS: usize = 208;

/// Number of page-count buckets in the page cache. Bucket `k` holds `k`-page spans.
pub const NPAGES: usize = 129;

/// Longest page run the page cache splits and coalesces.
pub const MAX_MANAGED_PAGES: usize = NPAGES - 1;

/// Bounds of the slow-start batch size between thread and central cache.
pub const MIN_BATCH: usize = 2;
pub const MAX_BATCH: usize = 512;

/// Radix tree level widths. Together they cover a 48-bit address space.
pub const PAGE_MAP_ROOT_BITS: usize = 12;
pub const PAGE_MAP_MID_BITS: usize = 12;
pub const PAGE_MAP_LEAF_BITS: usize = 11;
pub const PAGE_MAP_BITS: usize = PAGE_MAP_ROOT_BITS + PAGE_MAP_MID_BITS + PAGE_MAP_LEAF_BITS;

/// Span metadata slots per arena chunk.
pub const SPAN_CHUNK_SLOTS: usize = 4096;
/// Maximum number of arena chunks (4M spans).
pub const SPAN_CHUNKS: usize = 1024;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(MAX_BYTES % PAGE_SIZE == 0);
const _: () = assert!(NFREELISTS == 16 + 56 + 56 + 56 + 24);
const _: () = assert!(MAX_MANAGED_PAGES * PAGE_SIZE >= 2 * MAX_BYTES);
const _: () = assert!(PAGE_MAP_BITS + PAGE_SHIFT == 48);
const _: () = assert!(SPAN_CHUNK_SLOTS.is_power_of_two());
const _: () = assert!(SPAN_CHUNKS * SPAN_CHUNK_SLOTS <= u32::MAX as usize);
const _: () = assert!(NFREELISTS + NPAGES < SPAN_CHUNK_SLOTS);
