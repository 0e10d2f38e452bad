// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod heartbeat;
pub mod stats;

use std::{
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    errors::GatewayError,
    manager::stats::GatewayStats,
    server::conn::ConnHandle,
    session::{
        connection::{ConnectionSession, DeviceStatus},
        device::Device,
        group::DeviceGroup,
    },
};

/// Limits and timers the manager operates under, lifted out of the gateway
/// config so tests can construct a manager directly.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub max_connections: usize,
    pub max_devices: usize,
    pub heartbeat_timeout: Duration,
    pub cleanup_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            max_devices: 500,
            heartbeat_timeout: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

/// Counters produced by one index health sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexHealthReport {
    pub checked: usize,
    pub repaired: usize,
    pub dropped: usize,
}

/// Single authority over the three-layer mapping
/// `conn_id <-> iccid/group <-> device_id`.
///
/// All writes to the three maps funnel through methods here; a device is
/// online iff its session is resolvable through these indices. The sole
/// removal path is [`TcpManager::cleanup_connection`].
#[derive(Debug)]
pub struct TcpManager {
    cfg: ManagerConfig,

    connections: DashMap<u64, Arc<ConnectionSession>>,
    device_groups: DashMap<String, Arc<DeviceGroup>>,
    device_index: DashMap<String, String>,

    stats: RwLock<GatewayStats>,
    cancel: CancellationToken,
    running: AtomicBool,
}

impl TcpManager {
    pub fn new(cfg: ManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            connections: DashMap::new(),
            device_groups: DashMap::new(),
            device_index: DashMap::new(),
            stats: RwLock::new(GatewayStats::default()),
            cancel: CancellationToken::new(),
            running: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.cfg
    }

    // ── connection lifecycle ────────────────────────────────────────────

    /// Creates the session for a freshly accepted connection. Idempotent on
    /// `conn_id`.
    pub fn register_connection(
        &self,
        conn: ConnHandle,
    ) -> Result<Arc<ConnectionSession>, GatewayError> {
        if !conn.is_connected() {
            return Err(GatewayError::NilConnection);
        }
        if let Some(existing) = self.connections.get(&conn.conn_id) {
            return Ok(existing.clone());
        }
        if self.connections.len() >= self.cfg.max_connections {
            return Err(GatewayError::TooManyConnections(self.cfg.max_connections));
        }

        let session = Arc::new(ConnectionSession::new(conn));
        debug!(
            conn_id = session.conn_id,
            session_id = %session.session_id,
            remote = %session.remote_addr,
            "connection registered"
        );
        self.connections.insert(session.conn_id, session.clone());
        self.write_stats(|s| s.on_connect());
        Ok(session)
    }

    pub fn update_iccid_by_conn_id(
        &self,
        conn_id: u64,
        iccid: &str,
    ) -> Result<(), GatewayError> {
        if iccid.is_empty() {
            return Err(GatewayError::EmptyIccid);
        }
        let session = self
            .connections
            .get(&conn_id)
            .map(|s| s.clone())
            .ok_or(GatewayError::ConnectionNotFound(conn_id))?;

        session.set_iccid(iccid);
        if let Some(device_id) = session.device_id() {
            self.device_index.insert(device_id, iccid.to_string());
        }
        debug!(conn_id, iccid, "iccid attached to session");
        Ok(())
    }

    pub fn unregister_connection(&self, conn_id: u64) {
        self.cleanup_connection(conn_id, "unregister");
    }

    /// Disconnects whatever connection currently serves `device_id`. Returns
    /// true even when the device is already gone.
    pub fn disconnect_by_device_id(&self, device_id: &str, reason: &str) -> bool {
        if let Some(session) = self.get_session_by_device_id(device_id) {
            let conn = session.conn().clone();
            self.cleanup_connection(session.conn_id, reason);
            conn.stop();
        }
        true
    }

    /// The single path that removes devices from the online view.
    ///
    /// Idempotent: cleaning an unknown `conn_id` is a no-op. Never holds a
    /// group lock while touching the groups map, so the heartbeat watcher can
    /// call back in here safely.
    pub fn cleanup_connection(&self, conn_id: u64, reason: &str) -> usize {
        let Some((_, session)) = self.connections.remove(&conn_id) else {
            return 0;
        };
        session.on_disconnect();

        let mut removed = 0usize;
        if let Some(iccid) = session.iccid() {
            let group = self.device_groups.get(&iccid).map(|g| g.clone());
            if let Some(group) = group {
                if group.conn_id == conn_id {
                    let evicted = group.clear_with_ids();
                    removed = evicted.len();
                    for device_id in &evicted {
                        self.device_index.remove(device_id);
                    }
                    self.device_groups
                        .remove_if(&iccid, |_, g| g.conn_id == conn_id);
                }
            }
        }

        self.write_stats(|s| s.on_cleanup(removed));
        info!(conn_id, reason, removed, "connection cleaned up");
        removed
    }

    // ── device registration ─────────────────────────────────────────────

    pub fn register_device(
        &self,
        conn: &ConnHandle,
        device_id: &str,
        physical_id: u32,
        iccid: &str,
    ) -> Result<(), GatewayError> {
        self.register_device_with_details(conn, device_id, physical_id, iccid, 0, "")
    }

    /// Registers a logical device on the given connection, evicting any other
    /// connection that currently claims the same device or ICCID.
    pub fn register_device_with_details(
        &self,
        conn: &ConnHandle,
        device_id: &str,
        physical_id: u32,
        iccid: &str,
        device_type: u16,
        device_version: &str,
    ) -> Result<(), GatewayError> {
        if device_id.is_empty() {
            return Err(GatewayError::EmptyDeviceId);
        }
        if iccid.is_empty() {
            return Err(GatewayError::EmptyIccid);
        }
        let session = self
            .connections
            .get(&conn.conn_id)
            .map(|s| s.clone())
            .ok_or(GatewayError::ConnectionNotFound(conn.conn_id))?;

        if let Some(prev) = self.get_session_by_device_id(device_id) {
            if prev.conn_id == conn.conn_id {
                // Benign refresh: the cabinet re-announced itself.
                session.update_activity();
                if let Some(group) = self.device_groups.get(iccid).map(|g| g.clone()) {
                    group.touch();
                }
                debug!(device_id, conn_id = conn.conn_id, "register refresh");
                return Ok(());
            }
            // Strict-online view: exactly one connection per device.
            let stale = prev.conn().clone();
            info!(
                device_id,
                old_conn = prev.conn_id,
                new_conn = conn.conn_id,
                "device re-registered on a new connection, evicting the old one"
            );
            self.cleanup_connection(prev.conn_id, "re-register");
            stale.stop();
        }

        // A group left behind by an older connection with the same SIM must
        // go before this connection can own the ICCID.
        let stale_group = self
            .device_groups
            .get(iccid)
            .map(|g| (g.conn_id, g.conn().clone()));
        if let Some((old_conn_id, old_conn)) = stale_group {
            if old_conn_id != conn.conn_id {
                self.cleanup_connection(old_conn_id, "stale-group");
                old_conn.stop();
            }
        }

        if !self.device_index.contains_key(device_id)
            && self.device_index.len() >= self.cfg.max_devices
        {
            return Err(GatewayError::TooManyConnections(self.cfg.max_devices));
        }

        session.register_device(device_id, physical_id, device_version, device_type);
        if session.iccid().is_none() {
            session.set_iccid(iccid);
        }

        let device = Arc::new(Device::new(
            device_id,
            physical_id,
            iccid,
            device_type,
            device_version,
        ));

        self.atomic_device_index_operation(device_id, iccid, || {
            self.device_index
                .insert(device_id.to_string(), iccid.to_string());
            let group = self
                .device_groups
                .entry(iccid.to_string())
                .or_insert_with(|| Arc::new(DeviceGroup::new(iccid, conn.clone())))
                .clone();
            group.insert(device.clone(), session.clone());
            Ok(())
        })?;

        self.write_stats(|s| s.on_device_registered());
        info!(
            device_id,
            physical_id = format_args!("{physical_id:#010x}"),
            iccid,
            conn_id = conn.conn_id,
            "device registered"
        );
        Ok(())
    }

    // ── per-device updates ──────────────────────────────────────────────

    pub fn update_heartbeat(&self, device_id: &str) -> Result<(), GatewayError> {
        if !self.validate_device_index(device_id) && !self.repair_device_index(device_id)
        {
            return Err(GatewayError::DeviceNotFound(device_id.to_string()));
        }
        let (group, device, session) = self.resolve_device(device_id)?;
        device.touch_heartbeat();
        session.update_heartbeat();
        group.touch();
        Ok(())
    }

    /// Writes the reported status onto device and session without touching
    /// online/offline membership.
    pub fn update_device_status(
        &self,
        device_id: &str,
        status: DeviceStatus,
    ) -> Result<(), GatewayError> {
        let (_, device, session) = self.resolve_device(device_id)?;
        device.set_status(status);
        session.set_device_status(status);
        Ok(())
    }

    pub fn record_device_command(
        &self,
        device_id: &str,
        command: u8,
        size: usize,
    ) -> Result<(), GatewayError> {
        let (group, device, session) = self.resolve_device(device_id)?;
        device.record_command(command, size);
        session.bump_command_count();
        group.touch();
        Ok(())
    }

    // ── lookups ─────────────────────────────────────────────────────────

    pub fn get_session_by_conn_id(&self, conn_id: u64) -> Option<Arc<ConnectionSession>> {
        self.connections.get(&conn_id).map(|s| s.clone())
    }

    pub fn get_session_by_device_id(
        &self,
        device_id: &str,
    ) -> Option<Arc<ConnectionSession>> {
        let iccid = self.device_index.get(device_id)?.clone();
        let group = self.device_groups.get(&iccid)?.clone();
        group.session(device_id)
    }

    pub fn get_device_by_id(&self, device_id: &str) -> Option<Arc<Device>> {
        let iccid = self.device_index.get(device_id)?.clone();
        let group = self.device_groups.get(&iccid)?.clone();
        group.device(device_id)
    }

    pub fn get_device_connection(&self, device_id: &str) -> Option<ConnHandle> {
        self.get_session_by_device_id(device_id)
            .map(|s| s.conn().clone())
    }

    pub fn get_all_sessions(&self) -> Vec<Arc<ConnectionSession>> {
        self.connections.iter().map(|e| e.value().clone()).collect()
    }

    pub fn get_group(&self, iccid: &str) -> Option<Arc<DeviceGroup>> {
        self.device_groups.get(iccid).map(|g| g.clone())
    }

    /// Lock-free read of the device index.
    pub fn device_index_lookup(&self, device_id: &str) -> Option<String> {
        self.device_index.get(device_id).map(|r| r.clone())
    }

    pub fn group_iccids(&self) -> Vec<String> {
        self.device_groups.iter().map(|e| e.key().clone()).collect()
    }

    fn resolve_device(
        &self,
        device_id: &str,
    ) -> Result<(Arc<DeviceGroup>, Arc<Device>, Arc<ConnectionSession>), GatewayError>
    {
        let not_found = || GatewayError::DeviceNotFound(device_id.to_string());
        let iccid = self
            .device_index
            .get(device_id)
            .map(|r| r.clone())
            .ok_or_else(not_found)?;
        let group = self
            .device_groups
            .get(&iccid)
            .map(|g| g.clone())
            .ok_or_else(not_found)?;
        let device = group.device(device_id).ok_or_else(not_found)?;
        let session = group.session(device_id).ok_or_else(not_found)?;
        Ok((group, device, session))
    }

    // ── index validation and self-repair ────────────────────────────────

    /// True when the index entry, the group, and both group maps agree.
    pub fn validate_device_index(&self, device_id: &str) -> bool {
        let Some(iccid) = self.device_index.get(device_id).map(|r| r.clone()) else {
            return false;
        };
        let Some(group) = self.device_groups.get(&iccid).map(|g| g.clone()) else {
            return false;
        };
        group.contains_device(device_id)
    }

    /// Scans every group for the device and reinstates the index entry.
    /// A device found in no group drops its stale entry and reports failure.
    pub fn repair_device_index(&self, device_id: &str) -> bool {
        let groups: Vec<Arc<DeviceGroup>> = self
            .device_groups
            .iter()
            .map(|e| e.value().clone())
            .collect();
        for group in groups {
            if group.contains_device(device_id) {
                self.device_index
                    .insert(device_id.to_string(), group.iccid.clone());
                warn!(device_id, iccid = %group.iccid, "device index repaired");
                return true;
            }
        }
        self.device_index.remove(device_id);
        false
    }

    /// Runs `op`, then validates the index for `device_id`, repairing once
    /// before giving up.
    pub fn atomic_device_index_operation(
        &self,
        device_id: &str,
        _iccid: &str,
        op: impl FnOnce() -> Result<(), GatewayError>,
    ) -> Result<(), GatewayError> {
        op()?;
        if !self.validate_device_index(device_id) && !self.repair_device_index(device_id)
        {
            return Err(GatewayError::IndexInconsistent(device_id.to_string()));
        }
        Ok(())
    }

    /// Walks the whole index, validating and repairing entry by entry.
    pub fn periodic_index_health_check(&self) -> IndexHealthReport {
        let mut report = IndexHealthReport::default();
        let device_ids: Vec<String> =
            self.device_index.iter().map(|e| e.key().clone()).collect();
        for device_id in device_ids {
            report.checked += 1;
            if self.validate_device_index(&device_id) {
                continue;
            }
            if self.repair_device_index(&device_id) {
                report.repaired += 1;
            } else {
                report.dropped += 1;
            }
        }
        if report.repaired > 0 || report.dropped > 0 {
            warn!(
                checked = report.checked,
                repaired = report.repaired,
                dropped = report.dropped,
                "index health sweep found inconsistencies"
            );
        }
        report
    }

    // ── eviction ────────────────────────────────────────────────────────

    /// Timeout eviction entry point used by the heartbeat watcher.
    pub fn mark_device_offline(&self, device_id: &str) -> bool {
        let Some(session) = self.get_session_by_device_id(device_id) else {
            return false;
        };
        let conn = session.conn().clone();
        self.cleanup_connection(session.conn_id, "heartbeat-timeout");
        conn.stop();
        true
    }

    // ── stats ───────────────────────────────────────────────────────────

    fn write_stats(&self, f: impl FnOnce(&mut GatewayStats)) {
        let mut stats = self.stats.write().unwrap_or_else(|e| e.into_inner());
        f(&mut stats);
    }

    pub fn stats_snapshot(&self) -> GatewayStats {
        self.stats
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Rescans the indices and rewrites the stats block; drift is non-fatal.
    pub fn recalculate_stats(&self) {
        let active = self.connections.len() as u64;
        let online: u64 = self
            .device_groups
            .iter()
            .map(|e| e.value().device_count() as u64)
            .sum();
        self.write_stats(|s| {
            s.active_connections = active;
            s.online_devices = online;
            s.last_update_at = Some(chrono::Utc::now());
        });
    }

    // ── background tasks ────────────────────────────────────────────────

    /// Starts the heartbeat watcher and the periodic index health check.
    pub fn start(self: &Arc<Self>) -> Result<(), GatewayError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(GatewayError::AlreadyRunning);
        }

        let watcher = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            heartbeat::run_watcher(watcher, cancel).await;
        });

        let health = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(health.cfg.cleanup_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        health.periodic_index_health_check();
                    }
                }
            }
        });

        info!("tcp manager background tasks started");
        Ok(())
    }

    /// Signals every background task to exit at its next suspension point.
    pub fn stop(&self) -> Result<(), GatewayError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(GatewayError::NotRunning);
        }
        self.cancel.cancel();
        info!("tcp manager stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
