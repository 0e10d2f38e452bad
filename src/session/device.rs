// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::HashMap, sync::RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::session::connection::{ConnState, DeviceStatus};

#[derive(Debug)]
struct DeviceState {
    status: DeviceStatus,
    state: ConnState,
    registered_at: Option<DateTime<Utc>>,
    last_activity: Option<DateTime<Utc>>,
    last_heartbeat: Option<DateTime<Utc>>,
    heartbeat_count: u64,
    last_command_at: Option<DateTime<Utc>>,
    last_command_code: Option<u8>,
    last_command_size: usize,
    properties: HashMap<String, serde_json::Value>,
}

/// One logical charging cabinet behind a shared ICCID.
#[derive(Debug)]
pub struct Device {
    pub device_id: String,
    pub physical_id: u32,
    pub iccid: String,
    pub device_type: u16,
    pub device_version: String,
    state: RwLock<DeviceState>,
}

/// Immutable copy of the mutable half, taken under the device lock.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub physical_id: u32,
    pub iccid: String,
    pub device_type: u16,
    pub device_version: String,
    pub status: DeviceStatus,
    pub state: ConnState,
    pub registered_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub heartbeat_count: u64,
    pub last_command_at: Option<DateTime<Utc>>,
    pub last_command_code: Option<u8>,
    pub last_command_size: usize,
}

impl Device {
    pub fn new(
        device_id: &str,
        physical_id: u32,
        iccid: &str,
        device_type: u16,
        device_version: &str,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            physical_id,
            iccid: iccid.to_string(),
            device_type,
            device_version: device_version.to_string(),
            state: RwLock::new(DeviceState {
                status: DeviceStatus::Online,
                state: ConnState::Registered,
                registered_at: Some(Utc::now()),
                last_activity: Some(Utc::now()),
                last_heartbeat: None,
                heartbeat_count: 0,
                last_command_at: None,
                last_command_code: None,
                last_command_size: 0,
                properties: HashMap::new(),
            }),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, DeviceState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, DeviceState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> DeviceStatus {
        self.read().status
    }

    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        self.read().last_heartbeat
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.read().last_activity
    }

    pub fn heartbeat_count(&self) -> u64 {
        self.read().heartbeat_count
    }

    pub fn touch_heartbeat(&self) {
        let mut st = self.write();
        let now = Utc::now();
        st.last_heartbeat = Some(now);
        st.last_activity = Some(now);
        st.heartbeat_count += 1;
        st.status = DeviceStatus::Online;
        st.state = ConnState::Online;
    }

    pub fn touch_activity(&self) {
        self.write().last_activity = Some(Utc::now());
    }

    pub fn set_status(&self, status: DeviceStatus) {
        self.write().status = status;
    }

    pub fn record_command(&self, command: u8, size: usize) {
        let mut st = self.write();
        let now = Utc::now();
        st.last_command_at = Some(now);
        st.last_command_code = Some(command);
        st.last_command_size = size;
        st.last_activity = Some(now);
    }

    pub fn set_property(&self, key: &str, value: serde_json::Value) {
        self.write().properties.insert(key.to_string(), value);
    }

    pub fn property(&self, key: &str) -> Option<serde_json::Value> {
        self.read().properties.get(key).cloned()
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        let st = self.read();
        DeviceSnapshot {
            device_id: self.device_id.clone(),
            physical_id: self.physical_id,
            iccid: self.iccid.clone(),
            device_type: self.device_type,
            device_version: self.device_version.clone(),
            status: st.status,
            state: st.state,
            registered_at: st.registered_at,
            last_activity: st.last_activity,
            last_heartbeat: st.last_heartbeat,
            heartbeat_count: st.heartbeat_count,
            last_command_at: st.last_command_at,
            last_command_code: st.last_command_code,
            last_command_size: st.last_command_size,
        }
    }
}
