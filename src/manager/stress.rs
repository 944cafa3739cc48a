//! Stress tests for CheckpointManager

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use rand::{rngs::StdRng, Rng, SeedableRng};

use super::CheckpointManager;
use crate::config::{CheckpointConfig, ManagerOptions};
use crate::cursor::PERSISTENCE_CURSOR_NAME;
use crate::entry::Entry;
use crate::error::Result;

fn stress_manager() -> Result<Arc<CheckpointManager>> {
  Ok(Arc::new(CheckpointManager::new(
    ManagerOptions::new().config(
      CheckpointConfig::new()
        .max_items(50)
        .max_checkpoints(4),
    ),
  )?))
}

#[test]
fn test_outstanding_counts_match_recount_under_random_workload() -> Result<()> {
  let manager = stress_manager()?;
  let mut rng = StdRng::seed_from_u64(0x0c4e_c4b0);
  let readers = ["dcp-a", "dcp-b", "dcp-c"];
  for reader in readers {
    manager.register_cursor_by_seqno(reader, 1, false)?;
  }

  for _ in 0..5_000 {
    match rng.gen_range(0..100) {
      0..=69 => {
        let key = format!("k{}", rng.gen_range(0..200));
        manager.queue_dirty(Entry::mutation(key, vec![0u8; 8]))?;
      }
      70..=79 => {
        let reader = readers[rng.gen_range(0..readers.len())];
        let limit = rng.gen_range(1..40);
        manager.get_items_for_cursor(reader, Some(limit))?;
      }
      80..=84 => {
        manager.get_items_for_cursor(PERSISTENCE_CURSOR_NAME, Some(64))?;
        manager.items_persisted();
      }
      85..=89 => {
        manager.remove_closed_unref_checkpoints();
      }
      90..=94 => {
        let reader = readers[rng.gen_range(0..readers.len())];
        manager.next_item(reader)?;
      }
      _ => {
        let reader = readers[rng.gen_range(0..readers.len())];
        let start = rng.gen_range(1..=manager.high_seqno().max(1));
        manager.register_cursor_by_seqno(reader, start, false)?;
      }
    }

    for name in manager.cursor_names() {
      assert_eq!(
        manager.num_items_for_cursor(&name)?,
        manager.recount_items_for_cursor(&name)?,
        "outstanding drifted for {name}"
      );
    }
  }

  manager.verify()
}

#[test]
fn test_concurrent_producers_readers_and_remover() -> Result<()> {
  let manager = stress_manager()?;
  let producers = 4;
  let per_producer = 2_000;
  let readers = ["dcp-0", "dcp-1"];
  for reader in readers {
    manager.register_cursor_by_seqno(reader, 1, false)?;
  }

  let done = Arc::new(AtomicBool::new(false));
  let barrier = Arc::new(Barrier::new(producers + readers.len() + 2));
  let mut producer_handles = Vec::new();

  for producer in 0..producers {
    let manager = Arc::clone(&manager);
    let barrier = Arc::clone(&barrier);
    producer_handles.push(thread::spawn(move || {
      barrier.wait();
      for index in 0..per_producer {
        let key = format!("p{producer}-k{}", index % 64);
        manager
          .queue_dirty(Entry::mutation(key, vec![1u8; 4]))
          .expect("enqueue");
      }
    }));
  }

  let mut reader_handles = Vec::new();
  for reader in readers {
    let manager = Arc::clone(&manager);
    let barrier = Arc::clone(&barrier);
    let done = Arc::clone(&done);
    reader_handles.push(thread::spawn(move || {
      barrier.wait();
      let mut last_seqno = 0;
      let mut seen = HashSet::new();
      loop {
        let finished = done.load(Ordering::Acquire);
        let read = manager
          .get_items_for_cursor(reader, Some(100))
          .expect("cursor read");
        for entry in read.data() {
          assert!(entry.seqno() > last_seqno, "{reader} went backwards");
          last_seqno = entry.seqno();
          if let Some(key) = entry.key() {
            seen.insert(key.clone());
          }
        }
        if finished && read.is_empty() {
          break;
        }
      }
      seen.len()
    }));
  }

  let flusher = {
    let manager = Arc::clone(&manager);
    let barrier = Arc::clone(&barrier);
    let done = Arc::clone(&done);
    thread::spawn(move || {
      barrier.wait();
      loop {
        let finished = done.load(Ordering::Acquire);
        let read = manager
          .get_items_for_cursor(PERSISTENCE_CURSOR_NAME, Some(256))
          .expect("persistence read");
        manager.items_persisted();
        manager.remove_closed_unref_checkpoints();
        if finished && read.is_empty() {
          break;
        }
      }
    })
  };

  barrier.wait();
  for handle in producer_handles {
    handle.join().expect("producer thread");
  }
  done.store(true, Ordering::Release);

  for handle in reader_handles {
    let keys = handle.join().expect("reader thread");
    // Every key the producers touched reaches every reader in some version.
    assert_eq!(keys, producers * 64);
  }
  flusher.join().expect("flusher thread");

  assert_eq!(manager.high_seqno(), (producers * per_producer) as u64);
  for name in manager.cursor_names() {
    assert_eq!(manager.num_items_for_cursor(&name)?, 0);
  }
  manager.verify()
}
