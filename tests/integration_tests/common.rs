// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::SocketAddr, sync::Arc, time::Duration};

use dny_gateway_rs::{
    codec::frame::DnyFrame,
    command::engine::CommandEngine,
    dispatch::Dispatcher,
    manager::{ManagerConfig, TcpManager},
    server::listener::GatewayServer,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_util::sync::CancellationToken;

pub const PHYSICAL_ID: u32 = 0x04A2_28CD;
pub const DEVICE_ID: &str = "04A228CD";
pub const ICCID: &str = "898604D9102380488339";

/// A gateway bound to an ephemeral loopback port, torn down on drop.
pub struct TestGateway {
    pub manager: Arc<TcpManager>,
    pub engine: Arc<CommandEngine>,
    pub addr: SocketAddr,
    stop: CancellationToken,
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.stop.cancel();
        let _ = self.engine.stop();
        let _ = self.manager.stop();
    }
}

pub async fn spawn_gateway(cfg: ManagerConfig) -> TestGateway {
    let manager = TcpManager::new(cfg);
    let engine = CommandEngine::new(manager.clone());
    let dispatcher = Dispatcher::new(manager.clone(), engine.clone(), false);

    manager.start().expect("manager start");

    let server = GatewayServer::new(
        manager.clone(),
        dispatcher,
        Duration::from_secs(5),
    );
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    let stop = server.cancellation();
    tokio::spawn(server.run(listener));

    TestGateway {
        manager,
        engine,
        addr,
        stop,
    }
}

pub async fn connect(gw: &TestGateway) -> TcpStream {
    TcpStream::connect(gw.addr).await.expect("connect to gateway")
}

/// Plays the cabinet's registration sequence and consumes the ACK.
pub async fn send_registration(stream: &mut TcpStream, message_id: u16) {
    stream
        .write_all(ICCID.as_bytes())
        .await
        .expect("send iccid");
    let frame =
        DnyFrame::new(PHYSICAL_ID, message_id, 0x20, b"V1.05\0\0".to_vec()).encode();
    stream.write_all(&frame).await.expect("send register");

    let ack = read_frame(stream).await;
    assert_eq!(ack.command, 0x20);
    assert_eq!(ack.message_id, message_id);
    assert_eq!(ack.physical_id, PHYSICAL_ID);
    assert_eq!(&ack.payload[..], &[0x00]);
}

/// Reads one complete DNY frame off the socket.
pub async fn read_frame(stream: &mut TcpStream) -> DnyFrame {
    let mut head = [0u8; 5];
    stream.read_exact(&mut head).await.expect("frame head");
    assert_eq!(&head[..3], b"DNY", "unexpected leading bytes");
    let len = u16::from_le_bytes([head[3], head[4]]) as usize;
    let mut rest = vec![0u8; len];
    stream.read_exact(&mut rest).await.expect("frame body");

    let mut whole = head.to_vec();
    whole.extend_from_slice(&rest);
    DnyFrame::decode(&whole).expect("decode frame")
}

/// Polls `cond` until it holds or the timeout lapses.
pub async fn wait_for(cond: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
