// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::env;

use anyhow::{Context, Result};
use exa_nbd::{
    cfg::{cli::resolve_config_path, config::ClientConfig, logger::init_logger},
    client::ClientDaemon,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let logger_cfg = env::args().nth(2).unwrap_or_else(|| "config/logger.yaml".to_string());
    let _init_logger = init_logger(&logger_cfg)?;

    let config_path = env::args().nth(1).unwrap_or_else(|| "config/clientd.yaml".to_string());
    let cfg = resolve_config_path(&config_path)
        .and_then(ClientConfig::load_from_file)
        .context("failed to resolve or load client config")?;

    let cancel = CancellationToken::new();
    let node_table: Vec<_> = cfg.node_table.iter().map(|n| (n.node_id, n.ip)).collect();
    let daemon = ClientDaemon::new(cfg, cancel.clone());
    daemon.bind_nodes(&node_table);

    let (_control_tx, control_rx) = mpsc::unbounded_channel();

    info!("nbd_clientd starting");
    tokio::select! {
        _ = daemon.run_control_loop(control_rx) => {},
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
        },
    }

    Ok(())
}
