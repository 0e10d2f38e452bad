// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::SocketAddr, time::Duration};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors::GatewayError;

/// Default depth of the per-connection outbound queue.
pub const OUTBOUND_QUEUE: usize = 64;

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// The narrow handle the core holds per TCP connection.
///
/// The socket itself stays inside the listener's read/write tasks; everything
/// else reaches the peer through the bounded outbound queue and stops it via
/// the cancellation token. Tests build handles around their own receivers.
#[derive(Debug, Clone)]
pub struct ConnHandle {
    pub conn_id: u64,
    pub remote_addr: SocketAddr,
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

impl ConnHandle {
    pub fn new(
        conn_id: u64,
        remote_addr: SocketAddr,
        tx: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            conn_id,
            remote_addr,
            tx,
            cancel,
        }
    }

    /// Handle plus the receiving end of its queue, for tests and tools that
    /// play the socket side themselves.
    pub fn pair(conn_id: u64, remote_addr: SocketAddr) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        (
            Self::new(conn_id, remote_addr, tx, CancellationToken::new()),
            rx,
        )
    }

    /// Enqueues bytes for the write loop, bounded by the queue timeout.
    pub async fn send(&self, bytes: Bytes) -> Result<(), GatewayError> {
        match tokio::time::timeout(SEND_TIMEOUT, self.tx.send(bytes)).await {
            Ok(Ok(())) => Ok(()),
            _ => Err(GatewayError::WriteFailed(self.conn_id)),
        }
    }

    /// Non-blocking variant for paths that must not suspend.
    pub fn try_send(&self, bytes: Bytes) -> Result<(), GatewayError> {
        self.tx
            .try_send(bytes)
            .map_err(|_| GatewayError::WriteFailed(self.conn_id))
    }

    /// Asks the connection's read and write tasks to exit.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// True while the write loop still holds its receiver.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
