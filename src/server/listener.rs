// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    codec::scanner,
    dispatch::Dispatcher,
    manager::TcpManager,
    server::conn::{ConnHandle, OUTBOUND_QUEUE},
};

const READ_CHUNK: usize = 4096;

/// Accept loop plus per-connection read/write tasks.
///
/// The server owns the sockets; the rest of the core only ever sees
/// [`ConnHandle`]s.
#[derive(Debug)]
pub struct GatewayServer {
    manager: Arc<TcpManager>,
    dispatcher: Arc<Dispatcher>,
    connection_timeout: Duration,
    conn_ids: AtomicU64,
    cancel: CancellationToken,
}

impl GatewayServer {
    pub fn new(
        manager: Arc<TcpManager>,
        dispatcher: Arc<Dispatcher>,
        connection_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            dispatcher,
            connection_timeout,
            conn_ids: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        })
    }

    /// Token that stops the accept loop and every connection task.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn bind(host: &str, port: u16) -> Result<TcpListener> {
        TcpListener::bind((host, port))
            .await
            .with_context(|| format!("failed to bind {host}:{port}"))
    }

    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr().context("listener has no local addr")?;
        info!(%addr, "gateway listening");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.spawn_connection(stream, peer),
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
            }
        }
        info!("gateway accept loop exited");
        Ok(())
    }

    fn spawn_connection(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let conn_id = self.conn_ids.fetch_add(1, Ordering::Relaxed) + 1;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(conn_id, error = %e, "set_nodelay failed");
        }

        let (tx, rx) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE);
        let cancel = self.cancel.child_token();
        let handle = ConnHandle::new(conn_id, peer, tx, cancel.clone());

        if let Err(e) = self.manager.register_connection(handle.clone()) {
            warn!(conn_id, %peer, error = %e, "connection rejected");
            return;
        }

        let (read_half, write_half) = stream.into_split();

        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            write_loop(write_half, rx, writer_cancel).await;
        });

        let server = Arc::clone(self);
        tokio::spawn(async move {
            server.read_loop(read_half, handle, cancel).await;
        });
    }

    async fn read_loop(
        self: Arc<Self>,
        mut reader: OwnedReadHalf,
        handle: ConnHandle,
        cancel: CancellationToken,
    ) {
        let conn_id = handle.conn_id;
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        // Until the first full message arrives the handshake window applies.
        let mut handshaking = true;

        loop {
            let read = async {
                if handshaking {
                    match tokio::time::timeout(
                        self.connection_timeout,
                        reader.read_buf(&mut buf),
                    )
                    .await
                    {
                        Ok(res) => res,
                        Err(_) => Err(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "handshake window elapsed",
                        )),
                    }
                } else {
                    reader.read_buf(&mut buf).await
                }
            };

            let n = tokio::select! {
                _ = cancel.cancelled() => break,
                res = read => match res {
                    Ok(0) => {
                        debug!(conn_id, "peer closed connection");
                        break;
                    },
                    Ok(n) => n,
                    Err(e) => {
                        debug!(conn_id, error = %e, "read failed");
                        break;
                    },
                },
            };
            debug!(conn_id, bytes = n, "read chunk");

            scanner::skip_noise(&mut buf);
            while let Some(msg) = scanner::extract_message(&mut buf) {
                handshaking = false;
                self.dispatcher.handle_bytes(&handle, msg).await;
            }
        }

        self.manager.unregister_connection(conn_id);
        handle.stop();
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = rx.recv() => {
                let Some(bytes) = msg else { break };
                if let Err(e) = writer.write_all(&bytes).await {
                    warn!(error = %e, "socket write failed");
                    cancel.cancel();
                    break;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}
