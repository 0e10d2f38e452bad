// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    codec::command::Command,
    command::engine::{CommandEngine, CommandOutcome},
    errors::GatewayError,
    manager::{TcpManager, stats::GatewayStats},
};

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// One row of the device listing. Everything returned here is online by
/// construction: the listing is read straight off the manager's indices.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceListEntry {
    pub device_id: String,
    pub physical_id: u32,
    pub iccid: String,
    pub device_type: u16,
    pub device_version: String,
    pub is_online: bool,
    pub last_heartbeat: Option<i64>,
    pub last_heartbeat_str: Option<String>,
    pub conn_id: u64,
    pub remote_addr: String,
}

/// Device listing row enriched with command metadata and group sizes.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceDetail {
    #[serde(flatten)]
    pub entry: DeviceListEntry,
    pub heartbeat_count: u64,
    pub registered_at: Option<i64>,
    pub last_command_at: Option<i64>,
    pub last_command_code: Option<u8>,
    pub last_command_size: usize,
    pub group_device_count: usize,
    pub group_session_count: usize,
}

/// Manager health as the HTTP health endpoint reports it.
#[derive(Debug, Clone, Serialize)]
pub struct HealthView {
    pub running: bool,
    pub stats: GatewayStats,
}

/// Parameters of a charging order sent down to a cabinet.
#[derive(Debug, Clone)]
pub struct ChargeOrder {
    /// Backend order number, at most 16 ASCII bytes on the wire.
    pub order_no: String,
    /// Socket index on the cabinet.
    pub port: u8,
    /// Prepaid amount in cents.
    pub amount: u32,
}

impl ChargeOrder {
    /// Wire payload shared by order-confirm and settlement: port byte,
    /// NUL-padded 16-byte order number, little-endian amount.
    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(21);
        payload.push(self.port);
        let mut order = [0u8; 16];
        let bytes = self.order_no.as_bytes();
        let n = bytes.len().min(16);
        order[..n].copy_from_slice(&bytes[..n]);
        payload.extend_from_slice(&order);
        payload.extend_from_slice(&self.amount.to_le_bytes());
        payload
    }
}

impl TcpManager {
    /// Snapshot of every online device for the control plane.
    pub fn get_device_list_for_api(&self) -> Vec<DeviceListEntry> {
        let mut entries = Vec::new();
        for iccid in self.group_iccids() {
            let Some(group) = self.get_group(&iccid) else {
                continue;
            };
            for device_id in group.device_ids() {
                let (Some(device), Some(session)) =
                    (group.device(&device_id), group.session(&device_id))
                else {
                    continue;
                };
                let snap = device.snapshot();
                entries.push(DeviceListEntry {
                    device_id: snap.device_id,
                    physical_id: snap.physical_id,
                    iccid: snap.iccid,
                    device_type: snap.device_type,
                    device_version: snap.device_version,
                    is_online: true,
                    last_heartbeat: snap.last_heartbeat.map(|t| t.timestamp()),
                    last_heartbeat_str: snap.last_heartbeat.map(fmt_ts),
                    conn_id: session.conn_id,
                    remote_addr: session.remote_addr.to_string(),
                });
            }
        }
        entries
    }

    pub fn get_device_detail(
        &self,
        device_id: &str,
    ) -> Result<DeviceDetail, GatewayError> {
        let not_found = || GatewayError::DeviceNotFound(device_id.to_string());
        let iccid = self
            .device_index_lookup(device_id)
            .ok_or_else(not_found)?;
        let group = self.get_group(&iccid).ok_or_else(not_found)?;
        let device = group.device(device_id).ok_or_else(not_found)?;
        let session = group.session(device_id).ok_or_else(not_found)?;
        let snap = device.snapshot();

        Ok(DeviceDetail {
            entry: DeviceListEntry {
                device_id: snap.device_id,
                physical_id: snap.physical_id,
                iccid: snap.iccid,
                device_type: snap.device_type,
                device_version: snap.device_version,
                is_online: true,
                last_heartbeat: snap.last_heartbeat.map(|t| t.timestamp()),
                last_heartbeat_str: snap.last_heartbeat.map(fmt_ts),
                conn_id: session.conn_id,
                remote_addr: session.remote_addr.to_string(),
            },
            heartbeat_count: snap.heartbeat_count,
            registered_at: snap.registered_at.map(|t| t.timestamp()),
            last_command_at: snap.last_command_at.map(|t| t.timestamp()),
            last_command_code: snap.last_command_code,
            last_command_size: snap.last_command_size,
            group_device_count: group.device_count(),
            group_session_count: group.session_count(),
        })
    }
}

/// The surface the HTTP control plane consumes. Read views come straight off
/// the manager; writes funnel through the manager and command engine.
#[derive(Debug)]
pub struct ApiAdapter {
    manager: Arc<TcpManager>,
    engine: Arc<CommandEngine>,
}

impl ApiAdapter {
    pub fn new(manager: Arc<TcpManager>, engine: Arc<CommandEngine>) -> Self {
        Self { manager, engine }
    }

    pub fn device_list(&self) -> Vec<DeviceListEntry> {
        self.manager.get_device_list_for_api()
    }

    pub fn device_detail(&self, device_id: &str) -> Result<DeviceDetail, GatewayError> {
        self.manager.get_device_detail(device_id)
    }

    /// Idempotent: returns true even when the device is already gone.
    pub fn disconnect(&self, device_id: &str, reason: &str) -> bool {
        self.manager.disconnect_by_device_id(device_id, reason)
    }

    pub async fn send_dny_command(
        &self,
        device_id: &str,
        command: u8,
        data_hex: &str,
        wait_reply: bool,
        timeout_secs: u64,
    ) -> Result<CommandOutcome, GatewayError> {
        self.engine
            .send_dny_command(
                device_id,
                command,
                data_hex,
                wait_reply,
                Duration::from_secs(timeout_secs),
            )
            .await
    }

    pub async fn start_charging(
        &self,
        device_id: &str,
        order: &ChargeOrder,
        wait_reply: bool,
        timeout_secs: u64,
    ) -> Result<CommandOutcome, GatewayError> {
        self.send_dny_command(
            device_id,
            Command::OrderConfirm.raw(),
            &hex::encode(order.to_payload()),
            wait_reply,
            timeout_secs,
        )
        .await
    }

    pub async fn stop_charging(
        &self,
        device_id: &str,
        order: &ChargeOrder,
        wait_reply: bool,
        timeout_secs: u64,
    ) -> Result<CommandOutcome, GatewayError> {
        self.send_dny_command(
            device_id,
            Command::Settlement.raw(),
            &hex::encode(order.to_payload()),
            wait_reply,
            timeout_secs,
        )
        .await
    }

    pub fn health(&self) -> HealthView {
        HealthView {
            running: self.manager.is_running(),
            stats: self.manager.stats_snapshot(),
        }
    }
}
