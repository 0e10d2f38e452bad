// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Aggregate counters kept by the manager. Drift is non-fatal; a full rescan
/// rewrites the block.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GatewayStats {
    /// Connections accepted since process start.
    pub total_connections: u64,
    /// Currently live connections.
    pub active_connections: u64,
    /// Currently registered (and therefore online) devices.
    pub online_devices: u64,
    pub last_update_at: Option<DateTime<Utc>>,
}

impl GatewayStats {
    pub fn on_connect(&mut self) {
        self.total_connections += 1;
        self.active_connections += 1;
        self.last_update_at = Some(Utc::now());
    }

    pub fn on_cleanup(&mut self, removed_devices: usize) {
        self.active_connections = self.active_connections.saturating_sub(1);
        self.online_devices = self
            .online_devices
            .saturating_sub(removed_devices as u64);
        self.last_update_at = Some(Utc::now());
    }

    pub fn on_device_registered(&mut self) {
        self.online_devices += 1;
        self.last_update_at = Some(Utc::now());
    }
}
