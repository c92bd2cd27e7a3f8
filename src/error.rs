use thiserror::Error;

/// Recoverable allocation failure.
///
/// Contract violations (freeing a pointer this allocator never produced, popping an
/// empty free list) are not represented here; those panic.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
  /// The operating system refused to map more memory.
  #[error("operating system refused to reserve {pages} pages")]
  OutOfMemory { pages: usize },
  /// Every span metadata slot is in use.
  #[error("span metadata arena exhausted")]
  MetadataExhausted,
  /// Rounding the request up to whole pages overflows the address space.
  #[error("allocation of {size} bytes overflows the address space")]
  SizeOverflow { size: usize },
}
