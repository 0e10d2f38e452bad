// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use dny_gateway_rs::manager::ManagerConfig;
use serial_test::serial;
use tokio::io::AsyncReadExt;

use crate::integration_tests::common::{
    DEVICE_ID, connect, send_registration, spawn_gateway, wait_for,
};

#[tokio::test]
#[serial]
async fn reconnect_on_new_connection_evicts_the_old_one() {
    let gw = spawn_gateway(ManagerConfig::default()).await;

    let mut first = connect(&gw).await;
    send_registration(&mut first, 1).await;
    let first_conn_id = gw
        .manager
        .get_session_by_device_id(DEVICE_ID)
        .expect("first session")
        .conn_id;

    let mut second = connect(&gw).await;
    send_registration(&mut second, 1).await;

    let session = gw
        .manager
        .get_session_by_device_id(DEVICE_ID)
        .expect("exactly one session for the device");
    assert_ne!(session.conn_id, first_conn_id);
    assert!(gw.manager.get_session_by_conn_id(first_conn_id).is_none());

    let manager = gw.manager.clone();
    assert!(
        wait_for(
            move || manager.get_all_sessions().len() == 1,
            Duration::from_secs(1)
        )
        .await,
        "old session lingered"
    );
    assert_eq!(gw.manager.stats_snapshot().active_connections, 1);

    // The evicted socket gets closed by the gateway.
    let mut scratch = [0u8; 16];
    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match first.read(&mut scratch).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {},
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "evicted connection not closed");
}
