// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use chrono::Utc;
use dny_gateway_rs::{codec::frame::DnyFrame, manager::ManagerConfig};
use serial_test::serial;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::integration_tests::common::{
    DEVICE_ID, PHYSICAL_ID, connect, send_registration, spawn_gateway,
};

#[tokio::test]
#[serial]
async fn power_heartbeat_is_acked_and_counted() {
    let gw = spawn_gateway(ManagerConfig::default()).await;
    let mut peer = connect(&gw).await;
    send_registration(&mut peer, 1).await;

    let heartbeat = DnyFrame::new(PHYSICAL_ID, 2, 0x06, vec![0x00]).encode();
    peer.write_all(&heartbeat).await.expect("send heartbeat");

    // The ACK must be bit-identical to the encoder's own output for the
    // mirrored tuple.
    let expected = DnyFrame::new(PHYSICAL_ID, 2, 0x06, vec![0x00]).encode();
    let mut ack_raw = vec![0u8; expected.len()];
    peer.read_exact(&mut ack_raw).await.expect("read ack");
    assert_eq!(&ack_raw[..], &expected[..]);

    let session = gw
        .manager
        .get_session_by_device_id(DEVICE_ID)
        .expect("session");
    assert_eq!(session.heartbeat_count(), 1);
    let last = session.last_heartbeat().expect("heartbeat stamped");
    assert!(Utc::now().signed_duration_since(last).num_milliseconds() < 1000);

    let device = gw.manager.get_device_by_id(DEVICE_ID).expect("device");
    assert_eq!(device.heartbeat_count(), 1);
}
