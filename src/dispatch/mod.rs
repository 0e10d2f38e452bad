// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use bytes::Bytes;
use serde_json::json;
use tracing::{debug, warn};

use crate::{
    codec::{
        command::Command,
        frame::{self, DnyFrame, DnyMessage},
    },
    command::engine::CommandEngine,
    manager::TcpManager,
    server::conn::ConnHandle,
    session::connection::{ConnectionSession, DeviceStatus},
};

/// Routes classified inbound messages into manager updates and ACKs.
///
/// Parsing and routing failures are logged and drop the offending message;
/// the connection itself survives everything except a failed registration.
#[derive(Debug)]
pub struct Dispatcher {
    manager: Arc<TcpManager>,
    engine: Arc<CommandEngine>,
    log_hex_dump: bool,
}

impl Dispatcher {
    pub fn new(
        manager: Arc<TcpManager>,
        engine: Arc<CommandEngine>,
        log_hex_dump: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            engine,
            log_hex_dump,
        })
    }

    /// Entry point for one message extracted from the connection's stream.
    pub async fn handle_bytes(&self, conn: &ConnHandle, raw: Bytes) {
        if self.log_hex_dump {
            debug!(conn_id = conn.conn_id, rx = %hex::encode(&raw), "ingress");
        }

        match frame::classify(&raw) {
            Err(e) => {
                warn!(conn_id = conn.conn_id, error = %e, "dropping unparseable message");
            },
            Ok(DnyMessage::Iccid(iccid)) => {
                if let Err(e) = self.manager.update_iccid_by_conn_id(conn.conn_id, &iccid)
                {
                    warn!(conn_id = conn.conn_id, error = %e, "iccid update failed");
                }
                // No reply: the following registration frame acts as the ack.
            },
            Ok(DnyMessage::HeartbeatLink) => {
                if let Some(session) = self.manager.get_session_by_conn_id(conn.conn_id)
                {
                    session.update_activity();
                    session.add_bytes_in(raw.len() as u64);
                }
                if conn
                    .send(Bytes::from_static(frame::LINK_HEARTBEAT))
                    .await
                    .is_err()
                {
                    warn!(conn_id = conn.conn_id, "link echo failed");
                }
            },
            Ok(DnyMessage::Standard(parsed)) => {
                self.handle_frame(conn, parsed, raw.len() as u64).await;
            },
        }
    }

    async fn handle_frame(&self, conn: &ConnHandle, frame: DnyFrame, wire_len: u64) {
        let Some(session) = self.manager.get_session_by_conn_id(conn.conn_id) else {
            warn!(conn_id = conn.conn_id, "frame from unknown connection dropped");
            return;
        };
        session.update_activity();
        session.add_bytes_in(wire_len);

        // Replies to in-flight outbound commands never reach the handlers.
        if self.engine.try_complete_reply(&frame) {
            return;
        }

        let device_id = frame.device_id();
        match Command::from_raw(frame.command) {
            Some(Command::DeviceRegister) => {
                self.on_register(conn, &session, &frame).await;
            },
            Some(Command::MainStatusReport) => {
                let status_byte = frame.payload.first().copied().unwrap_or(0);
                let status = match status_byte {
                    0x00 | 0x01 => DeviceStatus::Online,
                    _ => DeviceStatus::Unknown,
                };
                if let Some(device) = self.manager.get_device_by_id(&device_id) {
                    device.set_property("main_status", json!(status_byte));
                }
                if let Err(e) = self.manager.update_device_status(&device_id, status) {
                    debug!(device_id, error = %e, "status report for unknown device");
                }
                self.send_ack(conn, &session, &frame).await;
            },
            Some(Command::OrderConfirm) => {
                self.on_order(conn, &session, &frame, true).await;
            },
            Some(Command::Settlement) => {
                self.on_order(conn, &session, &frame, false).await;
            },
            Some(Command::PowerHeartbeat) => {
                if let Err(e) = self.manager.update_heartbeat(&device_id) {
                    debug!(device_id, error = %e, "heartbeat for unknown device");
                }
                self.send_ack(conn, &session, &frame).await;
            },
            // Unknown commands are forwarded with the default ack.
            Some(Command::QueryStatus) | None => {
                self.send_ack(conn, &session, &frame).await;
            },
        }
    }

    async fn on_register(
        &self,
        conn: &ConnHandle,
        session: &Arc<ConnectionSession>,
        frame: &DnyFrame,
    ) {
        let Some(iccid) = session.iccid() else {
            warn!(
                conn_id = conn.conn_id,
                "registration before iccid, disconnecting"
            );
            self.manager.unregister_connection(conn.conn_id);
            conn.stop();
            return;
        };

        let device_id = frame.device_id();
        let version = parse_version(&frame.payload);
        match self.manager.register_device_with_details(
            conn,
            &device_id,
            frame.physical_id,
            &iccid,
            0,
            &version,
        ) {
            Ok(()) => {
                self.send_ack(conn, session, frame).await;
            },
            Err(e) => {
                warn!(
                    conn_id = conn.conn_id,
                    device_id,
                    error = %e,
                    "registration failed, disconnecting"
                );
                self.manager.unregister_connection(conn.conn_id);
                conn.stop();
            },
        }
    }

    async fn on_order(
        &self,
        conn: &ConnHandle,
        session: &Arc<ConnectionSession>,
        frame: &DnyFrame,
        charging: bool,
    ) {
        let device_id = frame.device_id();
        if let Some(device) = self.manager.get_device_by_id(&device_id) {
            device.set_property("charging", json!(charging));
        }
        if let Err(e) = self.manager.record_device_command(
            &device_id,
            frame.command,
            frame.payload.len(),
        ) {
            debug!(device_id, error = %e, "order frame for unknown device");
        }
        self.send_ack(conn, session, frame).await;
    }

    async fn send_ack(
        &self,
        conn: &ConnHandle,
        session: &Arc<ConnectionSession>,
        frame: &DnyFrame,
    ) {
        let wire = frame.ack().encode();
        if self.log_hex_dump {
            debug!(conn_id = conn.conn_id, tx = %hex::encode(&wire), "egress");
        }
        match conn.send(wire.clone()).await {
            Ok(()) => session.add_bytes_out(wire.len() as u64),
            Err(e) => warn!(conn_id = conn.conn_id, error = %e, "ack write failed"),
        }
    }
}

/// Trims a registration payload down to its printable version string.
fn parse_version(payload: &[u8]) -> String {
    let end = payload
        .iter()
        .position(|b| *b == 0)
        .unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end])
        .chars()
        .filter(|c| !c.is_control())
        .collect()
}
