// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use dny_gateway_rs::{
    codec::frame::DnyFrame, errors::GatewayError, manager::ManagerConfig,
};
use serial_test::serial;
use tokio::io::AsyncWriteExt;

use crate::integration_tests::common::{
    DEVICE_ID, PHYSICAL_ID, connect, read_frame, send_registration, spawn_gateway,
};

#[tokio::test]
#[serial]
async fn query_command_correlates_the_reply() {
    let gw = spawn_gateway(ManagerConfig::default()).await;
    let mut peer = connect(&gw).await;
    send_registration(&mut peer, 1).await;

    let engine = gw.engine.clone();
    let send = tokio::spawn(async move {
        engine
            .send_dny_command(DEVICE_ID, 0x81, "", true, Duration::from_secs(2))
            .await
    });

    let query = read_frame(&mut peer).await;
    assert_eq!(query.command, 0x81);
    assert_eq!(query.physical_id, PHYSICAL_ID);
    assert_ne!(query.message_id, 0);
    assert!(query.payload.is_empty());

    let reply =
        DnyFrame::new(PHYSICAL_ID, query.message_id, 0x81, vec![0x01, 0x02]).encode();
    peer.write_all(&reply).await.expect("send reply");

    let outcome = send.await.expect("join").expect("command succeeds");
    assert_eq!(outcome.command, 0x81);
    assert_eq!(outcome.message_id, query.message_id);
    assert_eq!(outcome.reply_data.as_deref(), Some(&[0x01, 0x02][..]));

    // Correlation success releases the message id.
    assert_eq!(gw.engine.registry().active_count(), 0);
}

#[tokio::test]
#[serial]
async fn silent_peer_times_the_command_out() {
    let gw = spawn_gateway(ManagerConfig::default()).await;
    let mut peer = connect(&gw).await;
    send_registration(&mut peer, 1).await;

    let started = tokio::time::Instant::now();
    let err = gw
        .engine
        .send_dny_command(DEVICE_ID, 0x81, "", true, Duration::from_secs(1))
        .await
        .expect_err("no reply must time out");
    assert!(matches!(err, GatewayError::CommandTimeout { .. }));
    assert!(started.elapsed() >= Duration::from_secs(1));

    // The timed-out id is released for reuse.
    assert_eq!(gw.engine.registry().active_count(), 0);
}

#[tokio::test]
#[serial]
async fn command_to_unknown_device_fails_fast() {
    let gw = spawn_gateway(ManagerConfig::default()).await;
    let err = gw
        .engine
        .send_dny_command("FFFFFFFF", 0x81, "", false, Duration::from_secs(1))
        .await
        .expect_err("unknown device");
    assert!(matches!(err, GatewayError::DeviceNotFound(_)));
}

#[tokio::test]
#[serial]
async fn bad_hex_payload_is_rejected() {
    let gw = spawn_gateway(ManagerConfig::default()).await;
    let mut peer = connect(&gw).await;
    send_registration(&mut peer, 1).await;

    let err = gw
        .engine
        .send_dny_command(DEVICE_ID, 0x81, "zz", false, Duration::from_secs(1))
        .await
        .expect_err("bad hex");
    assert!(matches!(err, GatewayError::BadHexData(_)));
}
