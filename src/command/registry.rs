// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use tracing::{debug, warn};

/// How many consecutive ids to probe when the candidate slot is busy.
const MAX_PROBES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Active,
    Expired,
}

/// Bookkeeping for one allocated message id.
#[derive(Debug, Clone)]
pub struct MessageEntry {
    pub message_id: u16,
    pub device_id: String,
    pub command: u8,
    pub conn_id: u64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub usage_count: u32,
    pub status: EntryStatus,
}

/// Allocator for the 16-bit correlation id carried by outbound frames.
///
/// Ids come from a monotone 64-bit counter folded into [1, 65535]; zero is
/// never handed out. A slot still active within `message_timeout` is skipped;
/// stale slots are expired in place and reused.
#[derive(Debug)]
pub struct MessageIdRegistry {
    counter: AtomicU64,
    entries: DashMap<u16, MessageEntry>,
    message_timeout: Duration,
}

impl MessageIdRegistry {
    pub fn new(message_timeout: Duration) -> Self {
        Self {
            counter: AtomicU64::new(0),
            entries: DashMap::new(),
            message_timeout,
        }
    }

    fn next_candidate(&self) -> u16 {
        (self.counter.fetch_add(1, Ordering::Relaxed) % 65535) as u16 + 1
    }

    fn stale(&self, entry: &MessageEntry, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.message_timeout) {
            Ok(timeout) => now.signed_duration_since(entry.last_used_at) > timeout,
            Err(_) => false,
        }
    }

    /// Allocates an id for an outbound command and records its metadata.
    pub fn allocate(&self, device_id: &str, command: u8, conn_id: u64) -> u16 {
        let now = Utc::now();
        let mut candidate = self.next_candidate();

        for probe in 0..MAX_PROBES {
            let mut taken = false;
            {
                match self.entries.entry(candidate) {
                    Entry::Vacant(v) => {
                        v.insert(MessageEntry {
                            message_id: candidate,
                            device_id: device_id.to_string(),
                            command,
                            conn_id,
                            created_at: now,
                            last_used_at: now,
                            usage_count: 1,
                            status: EntryStatus::Active,
                        });
                    },
                    Entry::Occupied(mut o) => {
                        let live = o.get().status == EntryStatus::Active
                            && !self.stale(o.get(), now);
                        if live {
                            taken = true;
                        } else {
                            // Expired slot: take it over.
                            let usage = o.get().usage_count;
                            o.insert(MessageEntry {
                                message_id: candidate,
                                device_id: device_id.to_string(),
                                command,
                                conn_id,
                                created_at: now,
                                last_used_at: now,
                                usage_count: usage.wrapping_add(1),
                                status: EntryStatus::Active,
                            });
                        }
                    },
                }
            }
            if !taken {
                return candidate;
            }
            if probe == MAX_PROBES - 1 {
                break;
            }
            candidate = candidate % 65535 + 1;
        }

        // The registry is saturated with recent ids; reclaim the last
        // candidate rather than fail the send.
        warn!(candidate, "message id space exhausted, reclaiming slot");
        self.entries.insert(
            candidate,
            MessageEntry {
                message_id: candidate,
                device_id: device_id.to_string(),
                command,
                conn_id,
                created_at: now,
                last_used_at: now,
                usage_count: 1,
                status: EntryStatus::Active,
            },
        );
        candidate
    }

    /// Frees the id after its reply arrived (or the wait gave up).
    pub fn release(&self, message_id: u16) {
        self.entries.remove(&message_id);
    }

    pub fn get(&self, message_id: u16) -> Option<MessageEntry> {
        self.entries.get(&message_id).map(|e| e.clone())
    }

    pub fn active_count(&self) -> usize {
        self.entries.len()
    }

    /// Drops every entry older than the message timeout; returns how many.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !self.stale(entry, now));
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, "expired message ids swept");
        }
        removed
    }
}
