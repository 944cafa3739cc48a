use std::str::FromStr;

use kitelog::{
  CheckpointConfig, CheckpointManager, CursorPosition, Entry, EntryKind, ManagerOptions,
  PartitionState, PERSISTENCE_CURSOR_NAME,
};

fn manager() -> CheckpointManager {
  CheckpointManager::new(ManagerOptions::new().config(CheckpointConfig::new().max_items(1000)))
    .expect("create manager")
}

fn put(manager: &CheckpointManager, key: &str, value: &str) {
  manager
    .queue_dirty(Entry::mutation(key, value.as_bytes().to_vec()))
    .expect("enqueue");
}

fn values(manager: &CheckpointManager, cursor: &str) -> Vec<String> {
  manager
    .get_all_items_for_cursor(cursor)
    .expect("read")
    .data()
    .map(|entry| String::from_utf8_lossy(entry.value().unwrap_or_default()).into_owned())
    .collect()
}

fn assert_counts_agree(manager: &CheckpointManager) {
  for name in manager.cursor_names() {
    assert_eq!(
      manager.num_items_for_cursor(&name).expect("outstanding"),
      manager.recount_items_for_cursor(&name).expect("recount"),
      "cursor {name}"
    );
  }
  manager.verify().expect("verify");
}

#[test]
fn dedup_behind_cursor_redelivers_new_version_only() {
  let manager = manager();
  manager.register_cursor_at_head("dcp", false).expect("register");
  put(&manager, "a", "a1");
  put(&manager, "b", "b1");
  assert_eq!(values(&manager, "dcp"), vec!["a1", "b1"]);

  put(&manager, "a", "a2");
  assert_eq!(manager.num_items_for_cursor("dcp").expect("outstanding"), 1);
  assert_counts_agree(&manager);
  assert_eq!(values(&manager, "dcp"), vec!["a2"]);
}

#[test]
fn dedup_ahead_of_cursor_moves_key_to_tail() {
  let manager = manager();
  manager.register_cursor_at_head("dcp", false).expect("register");
  put(&manager, "a", "a1");
  put(&manager, "b", "b1");
  put(&manager, "a", "a2");

  assert_eq!(manager.num_items_for_cursor("dcp").expect("outstanding"), 2);
  assert_counts_agree(&manager);
  assert_eq!(values(&manager, "dcp"), vec!["b1", "a2"]);
}

#[test]
fn dedup_of_the_entry_a_cursor_sits_on() {
  let manager = manager();
  manager.register_cursor_at_head("dcp", false).expect("register");
  put(&manager, "a", "a1");
  put(&manager, "b", "b1");

  let first = manager.next_item("dcp").expect("next").expect("a1");
  assert_eq!(first.entry.value(), Some(&b"a1"[..]));
  put(&manager, "a", "a2");

  // The consumed slot is gone, so the cursor falls back onto the start marker.
  assert_eq!(
    manager.cursor_position("dcp").expect("position"),
    CursorPosition::new(1, 1)
  );

  assert_eq!(manager.num_items_for_cursor("dcp").expect("outstanding"), 2);
  assert_counts_agree(&manager);
  assert_eq!(values(&manager, "dcp"), vec!["b1", "a2"]);
}

#[test]
fn dedup_with_meta_entry_at_cursor_position() {
  let manager = manager();
  put(&manager, "a", "a1");
  manager.queue_set_partition_state(PartitionState::Active);
  manager.register_cursor_at_head("dcp", false).expect("register");
  put(&manager, "b", "b1");
  put(&manager, "a", "a2");

  // "a" was behind the cursor, so only the new version is outstanding.
  assert_eq!(manager.num_items_for_cursor("dcp").expect("outstanding"), 2);
  assert_counts_agree(&manager);

  let persistence = manager
    .get_all_items_for_cursor(PERSISTENCE_CURSOR_NAME)
    .expect("drain");
  let kinds: Vec<EntryKind> = persistence.items.iter().map(|entry| entry.kind()).collect();
  assert_eq!(
    kinds,
    vec![
      EntryKind::SegmentStart,
      EntryKind::SetPartitionState(PartitionState::Active),
      EntryKind::Mutation,
      EntryKind::Mutation,
    ]
  );
  assert_eq!(values(&manager, "dcp"), vec!["b1", "a2"]);
}

#[test]
fn hot_key_updates_keep_the_open_checkpoint_small() {
  let manager = CheckpointManager::new(
    ManagerOptions::new().config(CheckpointConfig::new().max_items(1000).period_secs(3600)),
  )
  .expect("create manager");
  put(&manager, "cold", "c1");
  manager.register_cursor_at_head("dcp", false).expect("register");

  for round in 0..5_000 {
    put(&manager, "hot", &round.to_string());
    if round % 7 == 0 {
      let next = manager.next_item("dcp").expect("next").expect("hot");
      assert_eq!(next.entry.value(), Some(round.to_string().as_bytes()));
    }
    if round % 500 == 0 {
      assert_counts_agree(&manager);
    }
    let summary = manager.summary();
    let open = summary.checkpoints.last().expect("open checkpoint");
    assert!(open.num_slots <= 12, "round {round}: {} slots", open.num_slots);
  }

  assert_eq!(manager.num_checkpoints(), 1);
  assert_eq!(
    manager
      .num_items_for_cursor(PERSISTENCE_CURSOR_NAME)
      .expect("outstanding"),
    2
  );
  assert_counts_agree(&manager);
  assert_eq!(values(&manager, "dcp"), vec!["4999"]);
  assert_eq!(values(&manager, PERSISTENCE_CURSOR_NAME), vec!["c1", "4999"]);
}

#[test]
fn cursor_registered_beyond_high_seqno_starts_at_requested_seqno() {
  let manager = manager();
  for index in 0..10 {
    put(&manager, &format!("k{index}"), "v");
  }
  let registration = manager
    .register_cursor_by_seqno("dcp", 15, false)
    .expect("register");
  assert_eq!(registration.first_seqno, 15);
  assert!(!registration.backfill_required);
  manager
    .register_cursor_by_seqno("step", 13, false)
    .expect("register");

  for index in 10..20 {
    put(&manager, &format!("k{index}"), "v");
  }
  let read = manager.get_all_items_for_cursor("dcp").expect("read");
  let seqnos: Vec<u64> = read.data().map(|entry| entry.seqno()).collect();
  assert_eq!(seqnos, (15..=20).collect::<Vec<u64>>());
  assert_eq!((read.range.start, read.range.end), (15, 20));
  assert_eq!(manager.num_items_for_cursor("dcp").expect("outstanding"), 0);

  let first = manager.next_item("step").expect("next").expect("item");
  assert_eq!(first.entry.seqno(), 13);
  assert_counts_agree(&manager);
}

#[test]
fn end_markers_only_reach_cursors_that_ask_for_them() {
  let manager = manager();
  manager.register_cursor_by_seqno("with-end", 1, true).expect("register");
  manager.register_cursor_by_seqno("without-end", 1, false).expect("register");
  put(&manager, "a", "a1");
  manager.create_new_checkpoint();
  put(&manager, "b", "b1");

  let kinds = |name: &str| -> Vec<EntryKind> {
    manager
      .get_all_items_for_cursor(name)
      .expect("read")
      .items
      .iter()
      .map(|entry| entry.kind())
      .collect()
  };
  assert_eq!(
    kinds("with-end"),
    vec![
      EntryKind::SegmentStart,
      EntryKind::Mutation,
      EntryKind::SegmentEnd,
      EntryKind::SegmentStart,
      EntryKind::Mutation,
    ]
  );
  assert_eq!(
    kinds("without-end"),
    vec![
      EntryKind::SegmentStart,
      EntryKind::Mutation,
      EntryKind::SegmentStart,
      EntryKind::Mutation,
    ]
  );
}

#[test]
fn caught_up_cursor_skips_end_marker_on_rotation() {
  let manager = manager();
  manager.register_cursor_at_head("dcp", false).expect("register");
  put(&manager, "a", "a1");
  assert_eq!(values(&manager, "dcp"), vec!["a1"]);

  manager.create_new_checkpoint();
  assert_eq!(manager.checkpoint_id_for_cursor("dcp").expect("id"), 2);
  assert_eq!(
    manager.checkpoint_id_for_cursor(PERSISTENCE_CURSOR_NAME).expect("id"),
    1
  );
  assert_counts_agree(&manager);
}

#[test]
fn limited_read_stops_at_checkpoint_boundary() {
  let manager = manager();
  manager.register_cursor_by_seqno("dcp", 1, false).expect("register");
  for index in 0..5 {
    put(&manager, &format!("first{index}"), "v");
  }
  manager.create_new_checkpoint();
  for index in 0..5 {
    put(&manager, &format!("second{index}"), "v");
  }

  let first = manager.get_items_for_cursor("dcp", Some(2)).expect("read");
  assert_eq!(first.data().count(), 5);
  assert_eq!((first.range.start, first.range.end), (1, 5));
  assert_eq!(
    manager.cursor_position("dcp").expect("position"),
    CursorPosition::new(2, 0)
  );

  let second = manager.get_items_for_cursor("dcp", Some(2)).expect("read");
  assert_eq!(second.data().count(), 5);
  assert_eq!((second.range.start, second.range.end), (6, 10));
  assert_counts_agree(&manager);
}

#[test]
fn delivered_seqnos_strictly_increase_across_reads() {
  let manager = CheckpointManager::new(
    ManagerOptions::new().config(CheckpointConfig::new().max_items(7).max_checkpoints(100)),
  )
  .expect("create manager");
  manager.register_cursor_by_seqno("dcp", 1, true).expect("register");

  let mut last = 0;
  for round in 0..50 {
    for index in 0..13 {
      put(&manager, &format!("k{}", (round * 7 + index) % 23), "v");
    }
    let read = manager.get_items_for_cursor("dcp", Some(5)).expect("read");
    for entry in read.data() {
      assert!(entry.seqno() > last);
      last = entry.seqno();
    }
    assert_counts_agree(&manager);
  }
}

#[test]
fn cursor_positions_render_and_parse() {
  let manager = manager();
  put(&manager, "a", "a1");
  manager.next_item(PERSISTENCE_CURSOR_NAME).expect("next");
  let position = manager
    .cursor_position(PERSISTENCE_CURSOR_NAME)
    .expect("position");
  assert_eq!(position.to_string(), "1:1");
  assert_eq!(CursorPosition::from_str("1:1").expect("parse"), position);
}

#[test]
fn removed_cursor_no_longer_pins_checkpoints() {
  let manager = CheckpointManager::new(
    ManagerOptions::new().config(CheckpointConfig::new().persistence_enabled(false)),
  )
  .expect("create manager");
  manager.register_cursor_by_seqno("dcp", 1, false).expect("register");
  put(&manager, "a", "a1");
  manager.create_new_checkpoint();
  put(&manager, "b", "b1");

  assert_eq!(manager.remove_closed_unref_checkpoints().checkpoints_removed, 0);
  assert!(manager.remove_cursor("dcp").expect("remove"));
  assert_eq!(manager.remove_closed_unref_checkpoints().checkpoints_removed, 1);
  assert_eq!(manager.num_checkpoints(), 1);
  manager.verify().expect("verify");
}
