// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::manager::TcpManager;

/// Watcher tick: half the timeout, capped at 30s. The 5s floor applies only
/// to production-scale timeouts so that sub-second timeouts still evict
/// promptly.
pub fn tick_period(heartbeat_timeout: Duration) -> Duration {
    let half = (heartbeat_timeout / 2).min(Duration::from_secs(30));
    if heartbeat_timeout >= Duration::from_secs(10) {
        half.max(Duration::from_secs(5))
    } else {
        half.max(Duration::from_millis(10))
    }
}

/// Periodic sweep evicting sessions whose last activity lapsed.
pub(crate) async fn run_watcher(manager: Arc<TcpManager>, cancel: CancellationToken) {
    let period = tick_period(manager.config().heartbeat_timeout);
    info!(period_secs = period.as_secs(), "heartbeat watcher running");

    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let evicted = sweep_once(&manager);
        if evicted > 0 {
            info!(evicted, "heartbeat sweep evicted stale devices");
        }
    }
    debug!("heartbeat watcher exited");
}

/// One pass over every group.
///
/// Timestamps are read under short per-group/per-device locks that are all
/// released before `mark_device_offline` funnels into the cleanup path; the
/// cleanup path in turn never takes a group lock while deleting from the
/// groups map.
pub fn sweep_once(manager: &TcpManager) -> usize {
    let now = Utc::now();
    let Ok(timeout) =
        chrono::Duration::from_std(manager.config().heartbeat_timeout)
    else {
        return 0;
    };

    let mut evicted = 0usize;
    for iccid in manager.group_iccids() {
        let Some(group) = manager.get_group(&iccid) else {
            continue;
        };

        let mut expired = Vec::new();
        for device_id in group.device_ids() {
            let Some(device) = group.device(&device_id) else {
                continue;
            };
            // A device that has never spoken is not evictable.
            let last = match (device.last_heartbeat(), device.last_activity()) {
                (None, None) => continue,
                (a, b) => a.max(b),
            };
            let Some(last) = last else { continue };
            if now.signed_duration_since(last) > timeout {
                expired.push(device_id);
            }
        }
        drop(group);

        for device_id in expired {
            debug!(device_id = %device_id, "heartbeat timeout");
            if manager.mark_device_offline(&device_id) {
                evicted += 1;
            }
        }
    }
    evicted
}
