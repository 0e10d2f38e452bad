// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::manager::ManagerConfig;

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct GatewayConfig {
    /// TCP listener, limits and timers.
    pub tcp: TcpConfig,
    /// Logging sink and verbosity.
    #[serde(default)]
    pub logger: LoggerConfig,
    /// Settings consumed by the collaborating HTTP layer.
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TcpConfig {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,

    /// Live connections above which new accepts are rejected.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Registered devices above which new registrations are rejected.
    #[serde(default = "default_max_devices")]
    pub max_devices: usize,

    /// Window for the first message after accept.
    #[serde(default = "default_connection_timeout", with = "serde_secs")]
    pub connection_timeout: Duration,
    /// Inactivity span after which a device is evicted.
    #[serde(default = "default_heartbeat_timeout", with = "serde_secs")]
    pub heartbeat_timeout: Duration,
    /// Period of the background sweepers.
    #[serde(default = "default_cleanup_interval", with = "serde_secs")]
    pub cleanup_interval: Duration,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LoggerConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log to this file instead of stdout when set.
    #[serde(default)]
    pub file_path: Option<String>,
    /// Dump raw frames as hex at debug level.
    #[serde(default)]
    pub log_hex_dump: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_path: None,
            log_hex_dump: false,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: default_http_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_max_connections() -> usize {
    1000
}

fn default_max_devices() -> usize {
    500
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_heartbeat_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_http_port() -> u16 {
    8080
}

impl GatewayConfig {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(&path).with_context(|| {
            format!("failed to read config {}", path.as_ref().display())
        })?;
        let mut cfg: GatewayConfig =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(self.tcp.port != 0, "tcp.port must be set");
        ensure!(
            self.tcp.max_connections >= 1,
            "tcp.max_connections must be >= 1"
        );
        ensure!(self.tcp.max_devices >= 1, "tcp.max_devices must be >= 1");
        ensure!(
            !self.tcp.heartbeat_timeout.is_zero(),
            "tcp.heartbeat_timeout must be > 0"
        );
        ensure!(
            !self.tcp.connection_timeout.is_zero(),
            "tcp.connection_timeout must be > 0"
        );

        // A sweep period longer than an hour defeats its purpose.
        if self.tcp.cleanup_interval > Duration::from_secs(3600) {
            self.tcp.cleanup_interval = Duration::from_secs(3600);
        }
        Ok(())
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            max_connections: self.tcp.max_connections,
            max_devices: self.tcp.max_devices,
            heartbeat_timeout: self.tcp.heartbeat_timeout,
            cleanup_interval: self.tcp.cleanup_interval,
        }
    }
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
