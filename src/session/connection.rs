// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::HashMap,
    fmt::Write,
    net::SocketAddr,
    sync::RwLock,
};

use chrono::{DateTime, Utc};
use rand::RngExt;
use serde::Serialize;

use crate::server::conn::ConnHandle;

/// Connection lifecycle, advanced only by the dispatcher and the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnState {
    AwaitingIccid,
    IccidReceived,
    Registering,
    Registered,
    Online,
    Disconnecting,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Online,
    Offline,
    Reconnecting,
    Unknown,
}

/// Generates a random 16-hex-char session identifier.
pub fn generate_session_id() -> String {
    let mut raw = [0u8; 8];
    rand::rng().fill(&mut raw);

    let mut hex = String::with_capacity(16);
    for byte in &raw {
        write!(&mut hex, "{byte:02x}").expect("writing to String cannot fail");
    }
    hex
}

#[derive(Debug)]
struct SessionState {
    device_id: Option<String>,
    physical_id: u32,
    iccid: Option<String>,
    device_type: u16,
    device_version: String,
    conn_state: ConnState,
    device_status: DeviceStatus,
    registered_at: Option<DateTime<Utc>>,
    last_heartbeat: Option<DateTime<Utc>>,
    last_activity: Option<DateTime<Utc>>,
    last_disconnect: Option<DateTime<Utc>>,
    heartbeat_count: u64,
    command_count: u64,
    bytes_in: u64,
    bytes_out: u64,
    properties: HashMap<String, serde_json::Value>,
}

/// Mutable state of one live TCP connection.
///
/// Created when the listener reports a new connection and destroyed exactly
/// once through the manager's cleanup path. Everything writable lives behind
/// the session's own lock; the lock is never held across I/O.
#[derive(Debug)]
pub struct ConnectionSession {
    pub session_id: String,
    pub conn_id: u64,
    pub remote_addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
    conn: ConnHandle,
    state: RwLock<SessionState>,
}

/// Lock-free copy of the fields the API and logs care about.
#[derive(Debug, Clone, Serialize)]
pub struct SessionBasicInfo {
    pub session_id: String,
    pub conn_id: u64,
    pub remote_addr: String,
    pub device_id: Option<String>,
    pub iccid: Option<String>,
    pub conn_state: ConnState,
    pub device_status: DeviceStatus,
    pub heartbeat_count: u64,
    pub command_count: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl ConnectionSession {
    pub fn new(conn: ConnHandle) -> Self {
        Self {
            session_id: generate_session_id(),
            conn_id: conn.conn_id,
            remote_addr: conn.remote_addr,
            connected_at: Utc::now(),
            conn,
            state: RwLock::new(SessionState {
                device_id: None,
                physical_id: 0,
                iccid: None,
                device_type: 0,
                device_version: String::new(),
                conn_state: ConnState::AwaitingIccid,
                device_status: DeviceStatus::Unknown,
                registered_at: None,
                last_heartbeat: None,
                last_activity: None,
                last_disconnect: None,
                heartbeat_count: 0,
                command_count: 0,
                bytes_in: 0,
                bytes_out: 0,
                properties: HashMap::new(),
            }),
        }
    }

    /// The narrow handle used to write to and stop the underlying socket.
    pub fn conn(&self) -> &ConnHandle {
        &self.conn
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn iccid(&self) -> Option<String> {
        self.read().iccid.clone()
    }

    pub fn device_id(&self) -> Option<String> {
        self.read().device_id.clone()
    }

    pub fn physical_id(&self) -> u32 {
        self.read().physical_id
    }

    pub fn device_type(&self) -> u16 {
        self.read().device_type
    }

    pub fn device_version(&self) -> String {
        self.read().device_version.clone()
    }

    pub fn conn_state(&self) -> ConnState {
        self.read().conn_state
    }

    pub fn device_status(&self) -> DeviceStatus {
        self.read().device_status
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.read().last_activity
    }

    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        self.read().last_heartbeat
    }

    pub fn heartbeat_count(&self) -> u64 {
        self.read().heartbeat_count
    }

    pub fn command_count(&self) -> u64 {
        self.read().command_count
    }

    pub fn update_activity(&self) {
        self.write().last_activity = Some(Utc::now());
    }

    pub fn update_heartbeat(&self) {
        let mut st = self.write();
        let now = Utc::now();
        st.last_heartbeat = Some(now);
        st.last_activity = Some(now);
        st.heartbeat_count += 1;
        st.device_status = DeviceStatus::Online;
        st.conn_state = ConnState::Online;
    }

    pub fn set_iccid(&self, iccid: &str) {
        let mut st = self.write();
        st.iccid = Some(iccid.to_string());
        if st.conn_state == ConnState::AwaitingIccid {
            st.conn_state = ConnState::IccidReceived;
        }
        st.last_activity = Some(Utc::now());
    }

    /// Marks this session registered for the given logical device.
    pub fn register_device(
        &self,
        device_id: &str,
        physical_id: u32,
        version: &str,
        device_type: u16,
    ) {
        let mut st = self.write();
        let now = Utc::now();
        st.device_id = Some(device_id.to_string());
        st.physical_id = physical_id;
        st.device_version = version.to_string();
        st.device_type = device_type;
        st.conn_state = ConnState::Registered;
        st.device_status = DeviceStatus::Online;
        st.registered_at = Some(now);
        st.last_activity = Some(now);
    }

    pub fn set_device_status(&self, status: DeviceStatus) {
        self.write().device_status = status;
    }

    pub fn set_conn_state(&self, state: ConnState) {
        self.write().conn_state = state;
    }

    pub fn on_disconnect(&self) {
        let mut st = self.write();
        st.conn_state = ConnState::Disconnected;
        st.device_status = DeviceStatus::Offline;
        st.last_disconnect = Some(Utc::now());
    }

    pub fn bump_command_count(&self) {
        let mut st = self.write();
        st.command_count += 1;
        st.last_activity = Some(Utc::now());
    }

    pub fn add_bytes_in(&self, n: u64) {
        self.write().bytes_in += n;
    }

    pub fn add_bytes_out(&self, n: u64) {
        self.write().bytes_out += n;
    }

    pub fn set_property(&self, key: &str, value: serde_json::Value) {
        self.write().properties.insert(key.to_string(), value);
    }

    pub fn property(&self, key: &str) -> Option<serde_json::Value> {
        self.read().properties.get(key).cloned()
    }

    pub fn basic_info(&self) -> SessionBasicInfo {
        let st = self.read();
        SessionBasicInfo {
            session_id: self.session_id.clone(),
            conn_id: self.conn_id,
            remote_addr: self.remote_addr.to_string(),
            device_id: st.device_id.clone(),
            iccid: st.iccid.clone(),
            conn_state: st.conn_state,
            device_status: st.device_status,
            heartbeat_count: st.heartbeat_count,
            command_count: st.command_count,
            bytes_in: st.bytes_in,
            bytes_out: st.bytes_out,
        }
    }
}
