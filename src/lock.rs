//! Spinning lock for the shared tiers.
//!
//! The contended path spins and then yields the CPU. It never parks and never
//! allocates, so a thread holding one of these locks can re-enter the allocator
//! without going through a lock implementation's own heap-backed bookkeeping.

use core::{
  hint,
  sync::atomic::{AtomicBool, Ordering},
};

use parking_lot::lock_api::{self, GuardSend};

/// Busy-wait rounds before yielding to the scheduler.
const SPINS_BEFORE_YIELD: u32 = 64;

pub(crate) struct RawSpinLock {
  locked: AtomicBool,
}

unsafe impl lock_api::RawMutex for RawSpinLock {
  #[allow(clippy::declare_interior_mutable_const)]
  const INIT: Self = Self {
    locked: AtomicBool::new(false),
  };

  type GuardMarker = GuardSend;

  fn lock(&self) {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      let mut spins = 0;
      while self.locked.load(Ordering::Relaxed) {
        if spins < SPINS_BEFORE_YIELD {
          hint::spin_loop();
          spins += 1;
        } else {
          std::thread::yield_now();
        }
      }
    }
  }

  #[inline]
  fn try_lock(&self) -> bool {
    self
      .locked
      .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_ok()
  }

  #[inline]
  unsafe fn unlock(&self) {
    self.locked.store(false, Ordering::Release);
  }
}

pub(crate) type Mutex<T> = lock_api::Mutex<RawSpinLock, T>;
pub(crate) type MutexGuard<'a, T> = lock_api::MutexGuard<'a, RawSpinLock, T>;

#[cfg(test)]
mod tests {
  use std::{sync::Arc, thread};

  use super::*;

  #[test]
  fn contended_increments_are_not_lost() {
    let counter = Arc::new(Mutex::new(0usize));
    let handles: Vec<_> = (0..8)
      .map(|_| {
        let counter = Arc::clone(&counter);
        thread::spawn(move || {
          for _ in 0..10_000 {
            *counter.lock() += 1;
          }
        })
      })
      .collect();
    for handle in handles {
      handle.join().unwrap();
    }
    assert_eq!(*counter.lock(), 80_000);
  }

  #[test]
  fn unlocked_releases_for_the_closure() {
    let lock = Mutex::new(1);
    let mut guard = lock.lock();
    let seen = MutexGuard::unlocked(&mut guard, || {
      let mut inner = lock.try_lock().expect("lock released inside the closure");
      *inner += 1;
      *inner
    });
    assert_eq!(seen, 2);
    assert!(lock.try_lock().is_none());
    assert_eq!(*guard, 2);
  }
}
