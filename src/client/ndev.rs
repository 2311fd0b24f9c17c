// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Client-side imported disk (`NDev`, `spec.md` §3, §4.5 lifecycle).

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, bail};
use uuid::Uuid;

pub type NdevId = usize;

/// Transient per-ndev counters surfaced to the block layer's stats
/// queries; kept to submitted/completed counts only.
#[derive(Debug, Default)]
pub struct NdevStats {
    pub submitted: std::sync::atomic::AtomicU64,
    pub completed: std::sync::atomic::AtomicU64,
}

/// `(uuid, server_node_id, server_side_disk_id, sector_count, state, stats)`
/// of `spec.md` §3. `bound` / `suspended` / `down` are tracked as
/// independent flags rather than one enum because `resume` must be able
/// to leave a device simultaneously un-suspended and down (`spec.md`
/// §4.5's "If the new state is Down").
pub struct Ndev {
    pub uuid: Uuid,
    pub server_node_id: u32,
    pub server_side_disk_id: std::sync::atomic::AtomicI8,
    pub sector_count: std::sync::atomic::AtomicU64,
    bound: AtomicBool,
    suspended: AtomicBool,
    down: AtomicBool,
    pub stats: NdevStats,
}

impl Ndev {
    /// Created `Suspended+Down` (`spec.md` lifecycle): unbound devices
    /// start suspended and down so a stray submit before `bind` fails
    /// fast instead of racing the bind.
    pub fn new_free(uuid: Uuid, server_node_id: u32) -> Self {
        Self {
            uuid,
            server_node_id,
            server_side_disk_id: std::sync::atomic::AtomicI8::new(-1),
            sector_count: std::sync::atomic::AtomicU64::new(0),
            bound: AtomicBool::new(false),
            suspended: AtomicBool::new(true),
            down: AtomicBool::new(true),
            stats: NdevStats::default(),
        }
    }

    pub fn is_bound(&self) -> bool {
        self.bound.load(Ordering::SeqCst)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::SeqCst)
    }

    /// `bind(uuid, size, server_side_disk_id)`: stamps the ndev and
    /// marks it Up (bound, not suspended, not down).
    pub fn bind(&self, server_side_disk_id: i8, sector_count: u64) {
        self.server_side_disk_id.store(server_side_disk_id, Ordering::SeqCst);
        self.sector_count.store(sector_count, Ordering::SeqCst);
        self.bound.store(true, Ordering::SeqCst);
        self.suspended.store(false, Ordering::SeqCst);
        self.down.store(false, Ordering::SeqCst);
    }

    pub fn suspend(&self) -> Result<()> {
        if !self.bound.load(Ordering::SeqCst) {
            bail!("suspend on unbound ndev {}", self.uuid);
        }
        self.suspended.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// `up`/`down` are only valid while suspended.
    pub fn set_direction(&self, down: bool) -> Result<()> {
        if !self.suspended.load(Ordering::SeqCst) {
            bail!("up/down on ndev {} that isn't suspended", self.uuid);
        }
        self.down.store(down, Ordering::SeqCst);
        Ok(())
    }

    /// `resume`: clears `suspended`. The caller (client engine) is
    /// responsible for retiring stranded slots when this returns `true`
    /// (new state is Down).
    pub fn resume(&self) -> bool {
        self.suspended.store(false, Ordering::SeqCst);
        self.down.load(Ordering::SeqCst)
    }
}
