//! Runs ordinary std collections with the pool installed as the global allocator.

use std::{
  collections::{BTreeMap, HashMap},
  sync::{Arc, Barrier},
};

use tierpool::Allocator;

#[global_allocator]
static GLOBAL: Allocator = Allocator;

#[test]
fn collections_work() {
  let mut v: Vec<u64> = Vec::new();
  for i in 0..100_000 {
    v.push(i);
  }
  assert_eq!(v.iter().sum::<u64>(), 100_000 * 99_999 / 2);

  let mut map = HashMap::new();
  for i in 0..10_000 {
    map.insert(i.to_string(), vec![i as u8; i % 300]);
  }
  assert_eq!(map["4242"].len(), 4242 % 300);

  let tree: BTreeMap<_, _> = (0..5000).map(|i| (i, format!("value-{i}"))).collect();
  assert_eq!(tree[&4999], "value-4999");
}

#[test]
fn realloc_preserves_contents() {
  let mut s = String::new();
  for i in 0..20_000 {
    s.push(char::from(b'a' + (i % 26) as u8));
  }
  assert_eq!(s.len(), 20_000);
  assert!(s.bytes().enumerate().all(|(i, b)| b == b'a' + (i % 26) as u8));

  let mut v = vec![7u8; 300 * 1024];
  v.truncate(10);
  v.shrink_to_fit();
  assert_eq!(v, vec![7u8; 10]);
}

#[test]
fn over_aligned_values() {
  #[repr(align(64))]
  struct Line([u8; 64]);
  #[repr(align(4096))]
  struct Page([u8; 4096]);

  let lines: Vec<Box<Line>> = (0..100).map(|i| Box::new(Line([i as u8; 64]))).collect();
  for (i, line) in lines.iter().enumerate() {
    assert_eq!(&**line as *const Line as usize % 64, 0);
    assert_eq!(line.0[63], i as u8);
  }

  let page = Box::new(Page([1; 4096]));
  assert_eq!(&*page as *const Page as usize % 4096, 0);
  assert_eq!(page.0[4095], 1);
}

#[test]
fn zeroed_allocations() {
  let v = vec![0u64; 50_000];
  assert!(v.iter().all(|&x| x == 0));
  drop(v);
  // Reuses memory the previous vector dirtied.
  let mut dirty = vec![0xFFu8; 4096];
  dirty.clear();
  drop(dirty);
  let clean = vec![0u8; 4096];
  assert!(clean.iter().all(|&b| b == 0));
}

#[test]
fn threads_with_the_global_allocator() {
  let handles: Vec<_> = (0..8)
    .map(|t| {
      std::thread::spawn(move || {
        let mut out = Vec::new();
        for i in 0..2000 {
          out.push(format!("{t}:{i}"));
        }
        out
      })
    })
    .collect();
  let all: Vec<String> = handles
    .into_iter()
    .flat_map(|h| h.join().unwrap())
    .collect();
  assert_eq!(all.len(), 16_000);
  let stats = tierpool::stats().unwrap();
  assert!(stats.reserved_pages > 0);
}

#[test]
fn contended_size_classes_make_progress() {
  // Every thread starts at once and hammers the same few classes, so the shared
  // locks are contended on each thread's first trip past its cache.
  let threads = 16;
  let start = Arc::new(Barrier::new(threads));
  let handles: Vec<_> = (0..threads)
    .map(|t| {
      let start = Arc::clone(&start);
      std::thread::spawn(move || {
        start.wait();
        let mut total = 0;
        for round in 0..200 {
          let batch: Vec<Vec<u8>> = (0..64)
            .map(|i| vec![t as u8; 32 + (round + i) % 3 * 32])
            .collect();
          total += batch.iter().map(Vec::len).sum::<usize>();
        }
        total
      })
    })
    .collect();
  for handle in handles {
    assert!(handle.join().unwrap() > 0);
  }
}
