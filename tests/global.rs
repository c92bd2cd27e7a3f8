use std::{ptr::NonNull, sync::mpsc};

use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;
use tierpool::consts::{MAX_BYTES, PAGE_SIZE};

#[test]
fn small_and_oversized_round_trip() {
  for size in [1, 8, 129, 4096, MAX_BYTES, MAX_BYTES + 1, 129 * PAGE_SIZE] {
    let p = tierpool::allocate(size).unwrap();
    unsafe {
      p.as_ptr().write_bytes(0xC3, size);
      assert!(tierpool::usable_size(p) >= size);
      tierpool::deallocate(p);
    }
  }
}

#[test]
fn each_thread_gets_its_own_cache() {
  let handles: Vec<_> = (0..4)
    .map(|seed| {
      std::thread::spawn(move || {
        let mut rng = XorShiftRng::seed_from_u64(seed);
        for _ in 0..500 {
          let blocks: Vec<_> = (0..20)
            .map(|_| tierpool::allocate(rng.gen_range(1..8192)).unwrap())
            .collect();
          for p in blocks {
            unsafe { tierpool::deallocate(p) };
          }
        }
      })
    })
    .collect();
  for handle in handles {
    handle.join().unwrap();
  }
  assert!(tierpool::stats().is_some());
}

#[test]
fn blocks_migrate_between_threads() {
  let (tx, rx) = mpsc::channel::<usize>();
  let producer = std::thread::spawn(move || {
    for i in 0..2000 {
      let p = tierpool::allocate(16 + i % 1000).unwrap();
      tx.send(p.as_ptr() as usize).unwrap();
    }
  });
  let consumer = std::thread::spawn(move || {
    let mut freed = 0;
    for addr in rx {
      unsafe { tierpool::deallocate(NonNull::new(addr as *mut u8).unwrap()) };
      freed += 1;
    }
    freed
  });
  producer.join().unwrap();
  assert_eq!(consumer.join().unwrap(), 2000);
}

#[test]
fn absurd_requests_fail_without_panicking() {
  assert_eq!(
    tierpool::allocate(usize::MAX),
    Err(tierpool::AllocError::SizeOverflow { size: usize::MAX })
  );
  assert!(tierpool::allocate(usize::MAX / 2).is_err());
}
