// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Block-device façade (`spec.md` §6.2), consumed by this crate's own
//! test harness in place of the out-of-scope virtualizer.

use std::sync::Arc;

use anyhow::Result;
use uuid::Uuid;

use crate::client::{
    engine::{ClientEngine, EndIoCallback},
    ndev::NdevId,
    slot::BlockIo,
};

/// `open(uuid, access=RW, sector_size) → BlockDevice`. `sector_size` is
/// accepted for interface fidelity with §6.2 but is fixed at 512 by the
/// wire format everywhere else in this crate.
pub struct BlockDevice {
    engine: Arc<ClientEngine>,
    ndev: NdevId,
}

impl BlockDevice {
    pub async fn open(
        engine: Arc<ClientEngine>,
        uuid: Uuid,
        server_node_id: u32,
        end_io: EndIoCallback,
    ) -> Self {
        let ndev = engine.new_ndev(uuid, server_node_id).await;
        engine.register_end_io(ndev, end_io).await;
        Self { engine, ndev }
    }

    pub fn ndev_id(&self) -> NdevId {
        self.ndev
    }

    pub async fn bind(&self, server_side_disk_id: i8, sector_count: u64) -> Result<()> {
        self.engine.bind(self.ndev, server_side_disk_id, sector_count).await
    }

    pub async fn submit(&self, io: BlockIo) -> Result<()> {
        self.engine.submit(self.ndev, io).await
    }

    /// `set_sector_count(BlockDevice, n)`.
    pub async fn set_sector_count(&self, n: u64) -> Result<()> {
        let ndev = self
            .engine
            .ndev(self.ndev)
            .await
            .ok_or_else(|| anyhow::anyhow!("unknown ndev"))?;
        ndev.sector_count.store(n, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    pub async fn close(self) -> Result<()> {
        self.engine.remove(self.ndev).await
    }
}
