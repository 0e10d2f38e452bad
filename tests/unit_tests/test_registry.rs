// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::HashSet, time::Duration};

use dny_gateway_rs::command::registry::MessageIdRegistry;

#[test]
fn ids_stay_in_range_and_skip_zero() {
    let registry = MessageIdRegistry::new(Duration::from_secs(300));
    for _ in 0..10_000 {
        let id = registry.allocate("04A228CD", 0x81, 1);
        assert!(id >= 1);
    }
}

#[test]
fn active_ids_are_never_reissued() {
    let registry = MessageIdRegistry::new(Duration::from_secs(300));
    let mut seen = HashSet::new();
    for _ in 0..2_000 {
        let id = registry.allocate("04A228CD", 0x81, 1);
        assert!(seen.insert(id), "id {id} issued twice while active");
    }
}

#[test]
fn released_ids_can_come_back() {
    let registry = MessageIdRegistry::new(Duration::from_secs(300));
    let id = registry.allocate("04A228CD", 0x81, 1);
    assert_eq!(registry.active_count(), 1);
    registry.release(id);
    assert_eq!(registry.active_count(), 0);
}

#[test]
fn entry_records_command_metadata() {
    let registry = MessageIdRegistry::new(Duration::from_secs(300));
    let id = registry.allocate("04A228CD", 0x82, 7);
    let entry = registry.get(id).expect("entry");
    assert_eq!(entry.device_id, "04A228CD");
    assert_eq!(entry.command, 0x82);
    assert_eq!(entry.conn_id, 7);
    assert_eq!(entry.usage_count, 1);
}

#[test]
fn sweep_expires_stale_entries() {
    let registry = MessageIdRegistry::new(Duration::from_millis(1));
    registry.allocate("04A228CD", 0x81, 1);
    registry.allocate("04A228CD", 0x82, 1);
    std::thread::sleep(Duration::from_millis(10));
    assert_eq!(registry.sweep(), 2);
    assert_eq!(registry.active_count(), 0);
}

#[test]
fn stale_slot_is_taken_over_instead_of_probed_past() {
    let registry = MessageIdRegistry::new(Duration::from_millis(1));
    let first = registry.allocate("04A228CD", 0x81, 1);
    std::thread::sleep(Duration::from_millis(10));
    // All 65535 slots minus one are free, but the stale one may be reused
    // as soon as its timeout lapsed.
    let mut reused = false;
    for _ in 0..65_535 {
        if registry.allocate("04A228CD", 0x81, 1) == first {
            reused = true;
            break;
        }
    }
    assert!(reused, "stale id {first} never reclaimed");
}
