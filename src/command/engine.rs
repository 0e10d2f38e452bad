// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    codec::frame::DnyFrame,
    command::registry::MessageIdRegistry,
    errors::GatewayError,
    manager::TcpManager,
};

/// Reply expected for an in-flight command.
#[derive(Debug)]
struct PendingReply {
    physical_id: u32,
    command: u8,
    tx: oneshot::Sender<Bytes>,
}

/// Outcome of a completed command send.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub device_id: String,
    pub message_id: u16,
    pub command: u8,
    /// Payload of the matched reply, when one was awaited.
    pub reply_data: Option<Bytes>,
}

/// Builds outbound DNY frames, tags them with fresh message ids, and
/// correlates replies routed back from the dispatcher.
#[derive(Debug)]
pub struct CommandEngine {
    manager: Arc<TcpManager>,
    registry: MessageIdRegistry,
    pending: DashMap<u16, PendingReply>,
    cancel: CancellationToken,
    running: AtomicBool,
    cleanup_interval: Duration,
}

impl CommandEngine {
    /// Default window during which an allocated id may not be reused.
    pub const MESSAGE_TIMEOUT: Duration = Duration::from_secs(300);

    pub fn new(manager: Arc<TcpManager>) -> Arc<Self> {
        let cleanup_interval = manager.config().cleanup_interval;
        Arc::new(Self {
            manager,
            registry: MessageIdRegistry::new(Self::MESSAGE_TIMEOUT),
            pending: DashMap::new(),
            cancel: CancellationToken::new(),
            running: AtomicBool::new(false),
            cleanup_interval,
        })
    }

    pub fn registry(&self) -> &MessageIdRegistry {
        &self.registry
    }

    /// Sends one DNY command to a device, optionally awaiting the matching
    /// reply.
    ///
    /// `data_hex` is the payload as a hex string; empty means no payload.
    pub async fn send_dny_command(
        &self,
        device_id: &str,
        command: u8,
        data_hex: &str,
        wait_reply: bool,
        timeout: Duration,
    ) -> Result<CommandOutcome, GatewayError> {
        if device_id.is_empty() {
            return Err(GatewayError::EmptyDeviceId);
        }
        let payload = hex::decode(data_hex)?;

        let session = self
            .manager
            .get_session_by_device_id(device_id)
            .ok_or_else(|| GatewayError::DeviceNotFound(device_id.to_string()))?;
        let conn = session.conn().clone();
        let physical_id = session.physical_id();

        let message_id = self
            .registry
            .allocate(device_id, command, session.conn_id);
        let frame = DnyFrame::new(physical_id, message_id, command, payload.clone());
        let wire = frame.encode();

        let rx = if wait_reply {
            let (tx, rx) = oneshot::channel();
            self.pending.insert(
                message_id,
                PendingReply {
                    physical_id,
                    command,
                    tx,
                },
            );
            Some(rx)
        } else {
            None
        };

        if let Err(e) = conn.send(wire.clone()).await {
            self.pending.remove(&message_id);
            self.registry.release(message_id);
            return Err(e);
        }
        session.add_bytes_out(wire.len() as u64);
        let _ = self
            .manager
            .record_device_command(device_id, command, payload.len());
        debug!(
            device_id,
            command = format_args!("{command:#04x}"),
            message_id,
            wait_reply,
            "dny command sent"
        );

        let Some(rx) = rx else {
            return Ok(CommandOutcome {
                device_id: device_id.to_string(),
                message_id,
                command,
                reply_data: None,
            });
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(CommandOutcome {
                device_id: device_id.to_string(),
                message_id,
                command,
                reply_data: Some(reply),
            }),
            _ => {
                self.pending.remove(&message_id);
                self.registry.release(message_id);
                Err(GatewayError::CommandTimeout {
                    device_id: device_id.to_string(),
                    command,
                    timeout_secs: timeout.as_secs(),
                })
            },
        }
    }

    /// Offers an inbound frame as a reply candidate. Returns true when a
    /// waiter matched on (physical id, message id, command) and consumed it.
    pub fn try_complete_reply(&self, frame: &DnyFrame) -> bool {
        let matched = self
            .pending
            .get(&frame.message_id)
            .map(|p| p.physical_id == frame.physical_id && p.command == frame.command)
            .unwrap_or(false);
        if !matched {
            return false;
        }
        let Some((message_id, pending)) = self.pending.remove(&frame.message_id) else {
            return false;
        };
        self.registry.release(message_id);
        if pending.tx.send(frame.payload.clone()).is_err() {
            // The waiter gave up between match and delivery.
            warn!(message_id, "reply waiter already gone");
        }
        true
    }

    /// Starts the background sweep that expires stale message ids.
    pub fn start(self: &Arc<Self>) -> Result<(), GatewayError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(GatewayError::AlreadyRunning);
        }
        let engine = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.cleanup_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        engine.registry.sweep();
                    }
                }
            }
        });
        Ok(())
    }

    pub fn stop(&self) -> Result<(), GatewayError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(GatewayError::NotRunning);
        }
        self.cancel.cancel();
        Ok(())
    }
}
