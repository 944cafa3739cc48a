//! Enqueue and cursor-read benchmarks for kitelog
//!
//! Run with: cargo bench --bench enqueue
//!
//! These benchmarks measure:
//! - Single-threaded enqueue of distinct and duplicate keys
//! - Enqueue scaling across producer threads
//! - Cursor drain throughput

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::{Arc, Barrier};
use std::thread;

use kitelog::{CheckpointConfig, CheckpointManager, Entry, ManagerOptions};

// ============================================================================
// Setup Helpers
// ============================================================================

fn bench_manager() -> CheckpointManager {
  CheckpointManager::new(
    ManagerOptions::new().config(
      CheckpointConfig::new()
        .max_items(10_000)
        .persistence_enabled(false),
    ),
  )
  .unwrap()
}

fn filled_manager(items: usize) -> CheckpointManager {
  let manager = bench_manager();
  for index in 0..items {
    manager
      .queue_dirty(Entry::mutation(format!("key{index}"), vec![0u8; 64]))
      .unwrap();
  }
  manager
}

// ============================================================================
// Benchmarks
// ============================================================================

fn bench_enqueue(c: &mut Criterion) {
  let mut group = c.benchmark_group("enqueue");
  group.throughput(Throughput::Elements(1_000));

  group.bench_function("distinct_keys_1000", |bencher| {
    bencher.iter_with_large_drop(|| {
      let manager = bench_manager();
      for index in 0..1_000 {
        black_box(
          manager
            .queue_dirty(Entry::mutation(format!("key{index}"), vec![0u8; 64]))
            .unwrap(),
        );
      }
      manager
    });
  });

  group.bench_function("duplicate_keys_1000", |bencher| {
    bencher.iter_with_large_drop(|| {
      let manager = bench_manager();
      for index in 0..1_000 {
        black_box(
          manager
            .queue_dirty(Entry::mutation(format!("key{}", index % 16), vec![0u8; 64]))
            .unwrap(),
        );
      }
      manager
    });
  });

  group.finish();
}

fn bench_enqueue_scaling(c: &mut Criterion) {
  let mut group = c.benchmark_group("enqueue_scaling");
  group.sample_size(20);
  let ops_per_thread = 1_000;

  for num_threads in [1, 2, 4, 8].iter() {
    group.throughput(Throughput::Elements((*num_threads * ops_per_thread) as u64));
    group.bench_with_input(
      BenchmarkId::from_parameter(num_threads),
      num_threads,
      |bencher, &num_threads| {
        bencher.iter(|| {
          let manager = Arc::new(bench_manager());
          let barrier = Arc::new(Barrier::new(num_threads));
          let handles: Vec<_> = (0..num_threads)
            .map(|thread_id| {
              let manager = Arc::clone(&manager);
              let barrier = Arc::clone(&barrier);
              thread::spawn(move || {
                barrier.wait();
                for index in 0..ops_per_thread {
                  let _ = black_box(
                    manager.queue_dirty(Entry::mutation(format!("t{thread_id}-{index}"), vec![0u8; 64])),
                  );
                }
              })
            })
            .collect();

          for handle in handles {
            handle.join().unwrap();
          }
        });
      },
    );
  }

  group.finish();
}

fn bench_cursor_drain(c: &mut Criterion) {
  let mut group = c.benchmark_group("cursor_drain");

  for items in [1_000usize, 10_000].iter() {
    group.throughput(Throughput::Elements(*items as u64));
    group.bench_with_input(BenchmarkId::from_parameter(items), items, |bencher, &items| {
      let manager = filled_manager(items);
      bencher.iter(|| {
        manager.register_cursor_by_seqno("bench", 1, false).unwrap();
        black_box(manager.get_all_items_for_cursor("bench").unwrap().len())
      });
    });
  }

  group.finish();
}

criterion_group!(benches, bench_enqueue, bench_enqueue_scaling, bench_cursor_drain);
criterion_main!(benches);
