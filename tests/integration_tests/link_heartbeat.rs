// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use dny_gateway_rs::{manager::ManagerConfig, session::connection::ConnState};
use serial_test::serial;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::integration_tests::common::{connect, spawn_gateway, wait_for};

#[tokio::test]
#[serial]
async fn link_is_echoed_verbatim() {
    let gw = spawn_gateway(ManagerConfig::default()).await;
    let mut peer = connect(&gw).await;

    peer.write_all(b"link").await.expect("send link");

    let mut echo = [0u8; 4];
    peer.read_exact(&mut echo).await.expect("read echo");
    assert_eq!(&echo, b"link");

    // No state beyond last_activity moves: still awaiting the iccid.
    let manager = gw.manager.clone();
    assert!(
        wait_for(
            move || {
                manager
                    .get_all_sessions()
                    .first()
                    .map(|s| s.last_activity().is_some())
                    .unwrap_or(false)
            },
            Duration::from_secs(1)
        )
        .await
    );
    let session = gw.manager.get_all_sessions().pop().expect("session");
    assert_eq!(session.conn_state(), ConnState::AwaitingIccid);
    assert!(session.iccid().is_none());
    assert!(gw.manager.get_device_list_for_api().is_empty());
}
