// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::env;

use anyhow::{Context, Result};
use exa_nbd::{
    cfg::{cli::resolve_config_path, config::ServerConfig, logger::init_logger},
    server::Server,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let logger_cfg = env::args().nth(2).unwrap_or_else(|| "config/logger.yaml".to_string());
    let _init_logger = init_logger(&logger_cfg)?;

    let config_path = env::args().nth(1).unwrap_or_else(|| "config/serverd.yaml".to_string());
    let cfg = resolve_config_path(&config_path)
        .and_then(ServerConfig::load_from_file)
        .context("failed to resolve or load server config")?;

    let cancel = CancellationToken::new();
    let node_table: Vec<_> = cfg.node_table.iter().map(|n| (n.node_id, n.ip)).collect();
    let server = Server::new(cfg, cancel.clone());
    server.bind_nodes(&node_table);

    let (_control_tx, control_rx) = mpsc::unbounded_channel();

    info!("nbd_serverd starting");
    tokio::select! {
        _ = server.run_accept_loop() => {},
        _ = server.run_control_loop(control_rx) => {},
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
        },
    }

    Ok(())
}
