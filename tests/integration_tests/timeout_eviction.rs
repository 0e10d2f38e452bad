// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use dny_gateway_rs::manager::ManagerConfig;
use serial_test::serial;

use crate::integration_tests::common::{
    DEVICE_ID, connect, send_registration, spawn_gateway, wait_for,
};

#[tokio::test]
#[serial]
async fn idle_device_is_evicted_after_heartbeat_timeout() {
    let gw = spawn_gateway(ManagerConfig {
        heartbeat_timeout: Duration::from_millis(100),
        ..ManagerConfig::default()
    })
    .await;

    let mut peer = connect(&gw).await;
    send_registration(&mut peer, 1).await;
    assert!(gw.manager.get_session_by_device_id(DEVICE_ID).is_some());

    // Idle past the timeout: the watcher must evict within 400ms.
    let manager = gw.manager.clone();
    assert!(
        wait_for(
            move || manager.get_session_by_device_id(DEVICE_ID).is_none(),
            Duration::from_millis(400)
        )
        .await,
        "device survived the heartbeat timeout"
    );

    assert!(gw.manager.get_device_list_for_api().is_empty());
    assert_eq!(gw.manager.stats_snapshot().active_connections, 0);
}
