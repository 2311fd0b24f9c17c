// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Client daemon: owns the `ClientEngine` and the `uuid -> NdevId` table,
//! and serializes `ClientControl` messages onto it (`spec.md` §6.3's
//! `DEVICE_*` family, mirroring `server::daemon::Server`).

use std::{collections::HashMap, net::IpAddr, sync::Arc};

use anyhow::{Result, anyhow};
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::{cfg::config::ClientConfig, client::engine::ClientEngine, control::ClientControl};

pub struct ClientDaemon {
    pub engine: Arc<ClientEngine>,
    pub cfg: ClientConfig,
    ndevs_by_uuid: RwLock<HashMap<Uuid, crate::client::ndev::NdevId>>,
}

impl ClientDaemon {
    pub fn new(cfg: ClientConfig, cancel: CancellationToken) -> Self {
        let engine = ClientEngine::new(
            cfg.bind_ip,
            cfg.max_requests as usize,
            cfg.send_buf_bytes,
            cfg.recv_buf_bytes,
            cancel,
        );
        Self {
            engine,
            cfg,
            ndevs_by_uuid: RwLock::new(HashMap::new()),
        }
    }

    async fn ndev_for(&self, uuid: Uuid) -> Result<crate::client::ndev::NdevId> {
        self.ndevs_by_uuid
            .read()
            .await
            .get(&uuid)
            .copied()
            .ok_or_else(|| anyhow!("unknown ndev {uuid}"))
    }

    pub async fn run_control_loop(&self, mut rx: mpsc::UnboundedReceiver<ClientControl>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                ClientControl::Quit => {
                    self.engine.transport.shutdown();
                    break;
                },
                ClientControl::Bind { uuid, server_node_id, server_side_disk_id, sector_count, reply } => {
                    let result = self.bind(uuid, server_node_id, server_side_disk_id, sector_count).await;
                    let _ = reply.send(result);
                },
                ClientControl::Suspend { uuid, reply } => {
                    let result = async {
                        let ndev = self.ndev_for(uuid).await?;
                        self.engine.suspend(ndev).await
                    }
                    .await;
                    let _ = reply.send(result);
                },
                ClientControl::Up { uuid, reply } => {
                    let result = async {
                        let ndev = self.ndev_for(uuid).await?;
                        self.engine.set_direction(ndev, false).await
                    }
                    .await;
                    let _ = reply.send(result);
                },
                ClientControl::Down { uuid, reply } => {
                    let result = async {
                        let ndev = self.ndev_for(uuid).await?;
                        self.engine.set_direction(ndev, true).await
                    }
                    .await;
                    let _ = reply.send(result);
                },
                ClientControl::Resume { uuid, reply } => {
                    let result = async {
                        let ndev = self.ndev_for(uuid).await?;
                        self.engine.resume(ndev).await
                    }
                    .await;
                    let _ = reply.send(result);
                },
                ClientControl::Remove { uuid, reply } => {
                    let result = self.remove(uuid).await;
                    let _ = reply.send(result);
                },
                ClientControl::SessionOpen { node_id, ip, data_port, reply } => {
                    self.engine.transport.add_peer(node_id, ip).await;
                    let result = self.engine.transport.connect_to_peer(node_id, data_port).await;
                    let _ = reply.send(result);
                },
                ClientControl::SessionClose { node_id, reply } => {
                    self.engine.transport.remove_peer(node_id).await;
                    let _ = reply.send(Ok(()));
                },
            }
        }
        info!("client control loop exited");
    }

    async fn bind(
        &self,
        uuid: Uuid,
        server_node_id: u32,
        server_side_disk_id: i8,
        sector_count: u64,
    ) -> Result<()> {
        let mut table = self.ndevs_by_uuid.write().await;
        let ndev = match table.get(&uuid) {
            Some(id) => *id,
            None => {
                let id = self.engine.new_ndev(uuid, server_node_id).await;
                let noop: crate::client::engine::EndIoCallback = Arc::new(|_io, _res| {});
                self.engine.register_end_io(id, noop).await;
                table.insert(uuid, id);
                id
            },
        };
        drop(table);
        self.engine.bind(ndev, server_side_disk_id, sector_count).await
    }

    async fn remove(&self, uuid: Uuid) -> Result<()> {
        let ndev = self.ndev_for(uuid).await?;
        self.engine.remove(ndev).await?;
        self.ndevs_by_uuid.write().await.remove(&uuid);
        Ok(())
    }

    pub fn bind_nodes(&self, node_table: &[(u32, IpAddr)]) {
        let transport = Arc::clone(&self.engine.transport);
        let nodes = node_table.to_vec();
        tokio::spawn(async move {
            for (node_id, ip) in nodes {
                transport.add_peer(node_id, ip).await;
            }
        });
    }
}
