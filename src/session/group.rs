// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use chrono::{DateTime, Utc};

use crate::{
    server::conn::ConnHandle,
    session::{connection::ConnectionSession, device::Device},
};

#[derive(Debug, Default)]
struct GroupInner {
    devices: HashMap<String, Arc<Device>>,
    sessions: HashMap<String, Arc<ConnectionSession>>,
    primary_device: Option<String>,
    last_activity: Option<DateTime<Utc>>,
}

/// The set of logical devices multiplexed over one SIM card's TCP connection.
///
/// Exists iff its connection exists iff it holds at least one device. Lock
/// order is group before session; the manager never holds this lock while
/// touching the groups map itself.
#[derive(Debug)]
pub struct DeviceGroup {
    pub iccid: String,
    pub conn_id: u64,
    pub created_at: DateTime<Utc>,
    conn: ConnHandle,
    inner: RwLock<GroupInner>,
}

impl DeviceGroup {
    pub fn new(iccid: &str, conn: ConnHandle) -> Self {
        Self {
            iccid: iccid.to_string(),
            conn_id: conn.conn_id,
            created_at: Utc::now(),
            conn,
            inner: RwLock::new(GroupInner::default()),
        }
    }

    pub fn conn(&self) -> &ConnHandle {
        &self.conn
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, GroupInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, GroupInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Inserts or refreshes a device and its session. The first device added
    /// becomes the primary.
    pub fn insert(&self, device: Arc<Device>, session: Arc<ConnectionSession>) {
        let mut inner = self.write();
        let device_id = device.device_id.clone();
        if inner.primary_device.is_none() {
            inner.primary_device = Some(device_id.clone());
        }
        inner.devices.insert(device_id.clone(), device);
        inner.sessions.insert(device_id, session);
        inner.last_activity = Some(Utc::now());
    }

    /// Removes one device's entries; returns true when the group emptied and
    /// must be deleted by the manager.
    pub fn remove_session(&self, device_id: &str) -> bool {
        let mut inner = self.write();
        inner.devices.remove(device_id);
        inner.sessions.remove(device_id);
        if inner.primary_device.as_deref() == Some(device_id) {
            inner.primary_device = inner.devices.keys().next().cloned();
        }
        inner.devices.is_empty()
    }

    /// Empties both maps, returning the ids that were dropped so the caller
    /// can unlink them from the device index after releasing this lock.
    pub fn clear_with_ids(&self) -> Vec<String> {
        let mut inner = self.write();
        let removed: Vec<String> = inner.devices.keys().cloned().collect();
        inner.devices.clear();
        inner.sessions.clear();
        inner.primary_device = None;
        removed
    }

    pub fn touch(&self) {
        self.write().last_activity = Some(Utc::now());
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.read().last_activity
    }

    pub fn primary_device(&self) -> Option<String> {
        self.read().primary_device.clone()
    }

    pub fn contains_device(&self, device_id: &str) -> bool {
        let inner = self.read();
        inner.devices.contains_key(device_id) && inner.sessions.contains_key(device_id)
    }

    pub fn device(&self, device_id: &str) -> Option<Arc<Device>> {
        self.read().devices.get(device_id).cloned()
    }

    pub fn session(&self, device_id: &str) -> Option<Arc<ConnectionSession>> {
        self.read().sessions.get(device_id).cloned()
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.read().devices.keys().cloned().collect()
    }

    pub fn device_count(&self) -> usize {
        self.read().devices.len()
    }

    pub fn session_count(&self) -> usize {
        self.read().sessions.len()
    }
}
