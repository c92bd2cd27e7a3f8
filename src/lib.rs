//! A three-tier thread-caching memory pool.
//!
//! Small requests (up to [`consts::MAX_BYTES`]) are served from a per-thread
//! [`ThreadCache`] without locking. Caches refill from and spill to a central cache
//! of per-size-class span lists, which in turn lease page runs from a page cache
//! that splits and coalesces them. Larger requests go straight to the page cache as
//! whole pages.
//!
//! Use an explicit [`Pool`] with one [`ThreadCache`] per thread, or the process-wide
//! instance through [`allocate`]/[`deallocate`] and the [`Allocator`] type:
//!
//! ```
//! let p = tierpool::allocate(100).unwrap();
//! unsafe { tierpool::deallocate(p) };
//! ```
#![allow(clippy::missing_safety_doc)]

pub mod consts;
mod error;
mod lock;
mod os;
pub mod size_class;
mod free_list;
mod span;
mod page_map;
mod page_cache;
mod central_cache;
mod thread_cache;
mod pool;
mod global;

pub use error::AllocError;
pub use global::{Allocator, allocate, deallocate, pool, stats, usable_size};
pub use pool::{Pool, PoolStats};
pub use thread_cache::ThreadCache;

#[cfg(feature = "c_api")]
pub use global::{calloc, free, malloc, malloc_usable_size, posix_memalign, realloc};
