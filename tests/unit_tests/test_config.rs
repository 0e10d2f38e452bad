// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use dny_gateway_rs::cfg::config::GatewayConfig;

fn parse(yaml: &str) -> anyhow::Result<GatewayConfig> {
    let mut cfg: GatewayConfig = serde_yaml::from_str(yaml)?;
    cfg.validate_and_normalize()?;
    Ok(cfg)
}

#[test]
fn minimal_config_gets_defaults() {
    let cfg = parse("tcp:\n  port: 7054\n").expect("minimal config");
    assert_eq!(cfg.tcp.host, "0.0.0.0");
    assert_eq!(cfg.tcp.port, 7054);
    assert_eq!(cfg.tcp.max_connections, 1000);
    assert_eq!(cfg.tcp.max_devices, 500);
    assert_eq!(cfg.tcp.connection_timeout, Duration::from_secs(30));
    assert_eq!(cfg.tcp.heartbeat_timeout, Duration::from_secs(60));
    assert_eq!(cfg.tcp.cleanup_interval, Duration::from_secs(300));
    assert_eq!(cfg.logger.level, "info");
    assert!(!cfg.logger.log_hex_dump);
    assert_eq!(cfg.http.port, 8080);
}

#[test]
fn full_config_is_honored() {
    let cfg = parse(
        "tcp:\n  host: 127.0.0.1\n  port: 7055\n  max_connections: 10\n  \
         max_devices: 5\n  connection_timeout: 3\n  heartbeat_timeout: 9\n  \
         cleanup_interval: 60\nlogger:\n  level: debug\n  file_path: \
         /tmp/gw.log\n  log_hex_dump: true\nhttp:\n  port: 9090\n",
    )
    .expect("full config");
    assert_eq!(cfg.tcp.host, "127.0.0.1");
    assert_eq!(cfg.tcp.max_connections, 10);
    assert_eq!(cfg.tcp.heartbeat_timeout, Duration::from_secs(9));
    assert_eq!(cfg.logger.level, "debug");
    assert!(cfg.logger.log_hex_dump);
    assert_eq!(cfg.http.port, 9090);

    let mc = cfg.manager_config();
    assert_eq!(mc.max_connections, 10);
    assert_eq!(mc.max_devices, 5);
    assert_eq!(mc.heartbeat_timeout, Duration::from_secs(9));
}

#[test]
fn zero_port_is_rejected() {
    assert!(parse("tcp:\n  port: 0\n").is_err());
}

#[test]
fn zero_heartbeat_timeout_is_rejected() {
    assert!(parse("tcp:\n  port: 7054\n  heartbeat_timeout: 0\n").is_err());
}

#[test]
fn oversized_cleanup_interval_is_clamped() {
    let cfg = parse("tcp:\n  port: 7054\n  cleanup_interval: 86400\n")
        .expect("config");
    assert_eq!(cfg.tcp.cleanup_interval, Duration::from_secs(3600));
}
