// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Context, Result};
use dny_gateway_rs::{
    cfg::{cli::resolve_config_path, config::GatewayConfig, logger::init_logger},
    command::engine::CommandEngine,
    dispatch::Dispatcher,
    manager::TcpManager,
    server::listener::GatewayServer,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = resolve_config_path("config/gateway.yaml")
        .and_then(GatewayConfig::load_from_file)
        .context("failed to resolve or load config")?;

    let _logger_guard = init_logger(&cfg.logger)?;
    info!(
        host = %cfg.tcp.host,
        port = cfg.tcp.port,
        http_port = cfg.http.port,
        "starting dny gateway"
    );

    let manager = TcpManager::new(cfg.manager_config());
    let engine = CommandEngine::new(manager.clone());
    let dispatcher = Dispatcher::new(
        manager.clone(),
        engine.clone(),
        cfg.logger.log_hex_dump,
    );

    manager.start().context("manager start failed")?;
    engine.start().context("command engine start failed")?;

    let server = GatewayServer::new(
        manager.clone(),
        dispatcher,
        cfg.tcp.connection_timeout,
    );
    let listener = GatewayServer::bind(&cfg.tcp.host, cfg.tcp.port).await?;

    let stop = server.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
            stop.cancel();
        }
    });

    server.run(listener).await?;

    engine.stop().ok();
    manager.stop().ok();
    Ok(())
}
