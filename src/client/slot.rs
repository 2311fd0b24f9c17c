// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Client-side `RequestSlot` pool (`spec.md` §3, §4.5).
//!
//! A bounded MPMC pool sized at `max_requests`. The free list is a
//! channel of indices: popping a slot means receiving its index (blocks
//! the submitter when exhausted, which is exactly the back-pressure
//! `spec.md` §1 asks for); the completion path never needs to lock the
//! pool, only the one slot it already knows the index of.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};

use crate::client::ndev::NdevId;

/// What the block layer asked for (`spec.md` §6.2 `BlockIo`).
#[derive(Debug, Clone)]
pub struct BlockIo {
    pub is_write: bool,
    pub start_sector: u64,
    pub sector_count: u32,
    pub buf: Bytes,
    pub bypass_lock: bool,
    pub flush_cache: bool,
}

struct Slot {
    io: Option<BlockIo>,
    ndev: Option<NdevId>,
}

/// A drawn slot. Dropping without calling [`SlotPool::release`] would
/// leak the index forever, so this type carries nothing the caller can
/// accidentally forget to release through — `release` is the only way to
/// consume it.
pub struct DrawnSlot {
    pub req_num: u32,
}

pub struct SlotPool {
    slots: Vec<Mutex<Slot>>,
    free_tx: mpsc::Sender<u32>,
    free_rx: Mutex<mpsc::Receiver<u32>>,
}

impl SlotPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(capacity);
        for i in 0..capacity as u32 {
            tx.try_send(i).expect("channel sized to capacity");
        }
        Arc::new(Self {
            slots: (0..capacity).map(|_| Mutex::new(Slot { io: None, ndev: None })).collect(),
            free_tx: tx,
            free_rx: Mutex::new(rx),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Draws a slot, blocking the caller while the pool is exhausted —
    /// the one back-pressure point on the client submit path.
    pub async fn draw(&self, ndev: NdevId, io: BlockIo) -> Result<DrawnSlot> {
        let req_num = {
            let mut rx = self.free_rx.lock().await;
            rx.recv().await.context("slot pool closed")?
        };
        let mut slot = self.slots[req_num as usize].lock().await;
        slot.io = Some(io);
        slot.ndev = Some(ndev);
        Ok(DrawnSlot { req_num })
    }

    pub async fn io_for(&self, req_num: u32) -> Option<BlockIo> {
        self.slots.get(req_num as usize)?.lock().await.io.clone()
    }

    pub async fn ndev_for(&self, req_num: u32) -> Option<NdevId> {
        self.slots.get(req_num as usize)?.lock().await.ndev
    }

    /// Releases a slot back to the free pool. Must be called exactly
    /// once per `draw` (`spec.md` invariant I1).
    pub async fn release(&self, req_num: u32) -> Result<()> {
        {
            let mut slot = self
                .slots
                .get(req_num as usize)
                .context("req_num out of range")?
                .lock()
                .await;
            slot.io = None;
            slot.ndev = None;
        }
        if self.free_tx.send(req_num).await.is_err() {
            bail!("slot pool closed");
        }
        Ok(())
    }

    /// Every slot currently tagged with `ndev` (`spec.md` §4.5 `resume`
    /// retiring stranded requests on `Down`).
    pub async fn req_nums_tagged(&self, ndev: NdevId) -> Vec<u32> {
        let mut out = Vec::new();
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.lock().await.ndev == Some(ndev) {
                out.push(i as u32);
            }
        }
        out
    }
}
