// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Client engine (`spec.md` §4.5): block-layer façade, request-slot
//! bookkeeping, and the completion callback invoked off the transport's
//! receive path.
//!
//! Fragmentation: a `BlockIo` larger than
//! [`crate::wire::MAX_PAYLOAD_BYTES`] is split into independent
//! `IoDescriptor`s, each drawing its own slot; `end_io` fires exactly
//! once, after every fragment has completed (SPEC_FULL §9's resolution
//! of the source's single-message assumption).

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::{
    client::{
        ndev::{Ndev, NdevId},
        slot::{BlockIo, SlotPool},
    },
    error::Errno,
    transport::{NodeId, Transport, TransportHandler},
    wire::{IoDescriptor, IoOp, MAX_PAYLOAD_BYTES},
};

pub type EndIoCallback = Arc<dyn Fn(BlockIo, i8) + Send + Sync>;

struct FragmentGroup {
    remaining: AtomicUsize,
    first_error: Mutex<Option<i8>>,
    read_buf: Option<Mutex<BytesMut>>,
    original: BlockIo,
    end_io: EndIoCallback,
}

struct FragmentSlot {
    req_num: u32,
    group: Arc<FragmentGroup>,
    offset_in_group: usize,
}

type ClientTransport = Transport<(), ClientHandler>;

/// Transport-facing half of the client engine: implements
/// [`TransportHandler`] to decode replies and route them to the right
/// fragment group.
pub struct ClientHandler {
    fragments: DashMap<u32, FragmentSlot>,
    slots: OnceCell<Arc<SlotPool>>,
}

impl ClientHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            fragments: DashMap::new(),
            slots: OnceCell::new(),
        })
    }

    fn bind_slots(&self, slots: Arc<SlotPool>) {
        let _ = self.slots.set(slots);
    }
}

impl TransportHandler<()> for ClientHandler {
    fn payload_len(&self, header: &IoDescriptor) -> usize {
        header.reply_payload_len()
    }

    fn keep_receiving(&self, _from: NodeId, header: &IoDescriptor) -> Option<BytesMut> {
        Some(BytesMut::zeroed(header.reply_payload_len()))
    }

    fn deliver(&self, _from: NodeId, header: IoDescriptor, payload: Bytes) {
        let Some((_, frag)) = self.fragments.remove(&(header.req_num as u32)) else {
            warn!(req_num = header.req_num, "reply for unknown request slot");
            return;
        };
        let Some(slots) = self.slots.get().cloned() else {
            return;
        };
        tokio::spawn(async move {
            if let Some(buf) = &frag.group.read_buf {
                let mut buf = buf.lock().await;
                let end = frag.offset_in_group + payload.len();
                if end <= buf.len() {
                    buf[frag.offset_in_group..end].copy_from_slice(&payload);
                }
            }
            if header.result != 0 {
                let mut err = frag.group.first_error.lock().await;
                if err.is_none() {
                    *err = Some(header.result);
                }
            }
            if frag.group.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                let result = frag.group.first_error.lock().await.unwrap_or(0);
                let mut io = frag.group.original.clone();
                if let Some(buf) = &frag.group.read_buf {
                    io.buf = buf.lock().await.clone().freeze();
                }
                (frag.group.end_io)(io, result);
            }
            let _ = slots.release(frag.req_num).await;
        });
    }

    fn end_sending(&self, _ctx: (), result: std::result::Result<(), Errno>) {
        if let Err(e) = result {
            warn!("client send failed: {e:?}");
        }
    }
}

/// Owns the `ndevs` table, the slot pool, and the transport
/// (`spec.md` §4.5).
pub struct ClientEngine {
    pub transport: Arc<ClientTransport>,
    handler: Arc<ClientHandler>,
    slots: Arc<SlotPool>,
    ndevs: RwLock<HashMap<NdevId, Arc<Ndev>>>,
    next_ndev_id: AtomicUsize,
    end_io_callbacks: RwLock<HashMap<NdevId, EndIoCallback>>,
}

impl ClientEngine {
    pub fn new(
        bind_ip: std::net::IpAddr,
        max_requests: usize,
        send_buf_bytes: u32,
        recv_buf_bytes: u32,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let handler = ClientHandler::new();
        let slots = SlotPool::new(max_requests);
        handler.bind_slots(Arc::clone(&slots));
        let transport =
            Transport::new(Arc::clone(&handler), bind_ip, send_buf_bytes, recv_buf_bytes, cancel);
        Arc::new(Self {
            transport,
            handler,
            slots,
            ndevs: RwLock::new(HashMap::new()),
            next_ndev_id: AtomicUsize::new(0),
            end_io_callbacks: RwLock::new(HashMap::new()),
        })
    }

    pub async fn new_ndev(&self, uuid: Uuid, server_node_id: u32) -> NdevId {
        let id = self.next_ndev_id.fetch_add(1, Ordering::SeqCst);
        self.ndevs
            .write()
            .await
            .insert(id, Arc::new(Ndev::new_free(uuid, server_node_id)));
        id
    }

    pub async fn ndev(&self, id: NdevId) -> Option<Arc<Ndev>> {
        self.ndevs.read().await.get(&id).cloned()
    }

    pub async fn register_end_io(&self, ndev: NdevId, cb: EndIoCallback) {
        self.end_io_callbacks.write().await.insert(ndev, cb);
    }

    pub async fn bind(&self, ndev_id: NdevId, server_side_disk_id: i8, sector_count: u64) -> anyhow::Result<()> {
        let ndev = self.ndev(ndev_id).await.ok_or_else(|| anyhow::anyhow!("unknown ndev"))?;
        ndev.bind(server_side_disk_id, sector_count);
        Ok(())
    }

    pub async fn suspend(&self, ndev_id: NdevId) -> anyhow::Result<()> {
        self.ndev(ndev_id).await.ok_or_else(|| anyhow::anyhow!("unknown ndev"))?.suspend()
    }

    pub async fn set_direction(&self, ndev_id: NdevId, down: bool) -> anyhow::Result<()> {
        self.ndev(ndev_id)
            .await
            .ok_or_else(|| anyhow::anyhow!("unknown ndev"))?
            .set_direction(down)
    }

    /// `resume(uuid)`: if the ndev comes back Down, retires every slot
    /// tagged with it as `-EIO` (`spec.md` §4.5, invariant I6).
    pub async fn resume(&self, ndev_id: NdevId) -> anyhow::Result<()> {
        let ndev = self.ndev(ndev_id).await.ok_or_else(|| anyhow::anyhow!("unknown ndev"))?;
        let went_down = ndev.resume();
        if went_down {
            self.retire_down(ndev_id).await;
        }
        Ok(())
    }

    async fn retire_down(&self, ndev_id: NdevId) {
        for req_num in self.slots.req_nums_tagged(ndev_id).await {
            let Some(io) = self.slots.io_for(req_num).await else { continue };
            self.handler.fragments.remove(&req_num);
            if let Some(cb) = self.end_io_callbacks.read().await.get(&ndev_id).cloned() {
                cb(io, Errno::Io.to_wire());
            }
            let _ = self.slots.release(req_num).await;
        }
    }

    pub async fn remove(&self, ndev_id: NdevId) -> anyhow::Result<()> {
        self.suspend(ndev_id).await?;
        self.set_direction(ndev_id, true).await?;
        self.resume(ndev_id).await?;
        self.ndevs.write().await.remove(&ndev_id);
        self.end_io_callbacks.write().await.remove(&ndev_id);
        Ok(())
    }

    /// Block-layer façade entry point (`spec.md` §4.5 steps 1-5).
    pub async fn submit(&self, ndev_id: NdevId, io: BlockIo) -> anyhow::Result<()> {
        let ndev = self.ndev(ndev_id).await.ok_or_else(|| anyhow::anyhow!("unknown ndev"))?;

        loop {
            if !ndev.is_suspended() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }

        if ndev.is_down() {
            if let Some(cb) = self.end_io_callbacks.read().await.get(&ndev_id).cloned() {
                cb(io, Errno::Io.to_wire());
            }
            return Ok(());
        }

        let payload_len = io.buf.len();
        let fragment_count = payload_len.div_ceil(MAX_PAYLOAD_BYTES).max(1);

        let read_buf = if !io.is_write {
            Some(Mutex::new(BytesMut::zeroed(
                io.sector_count as usize * 512,
            )))
        } else {
            None
        };

        let group = Arc::new(FragmentGroup {
            remaining: AtomicUsize::new(fragment_count),
            first_error: Mutex::new(None),
            read_buf,
            original: io.clone(),
            end_io: self
                .end_io_callbacks
                .read()
                .await
                .get(&ndev_id)
                .cloned()
                .unwrap_or_else(|| Arc::new(|_io, _res| {})),
        });

        let sectors_per_fragment = (MAX_PAYLOAD_BYTES / 512) as u32;
        let mut remaining_sectors = io.sector_count;
        let mut sector_cursor = io.start_sector;
        let mut byte_cursor = 0usize;

        for _ in 0..fragment_count {
            let this_sectors = remaining_sectors.min(sectors_per_fragment).max(if io.sector_count == 0 { 0 } else { 1 });
            let server_disk_id = ndev.server_side_disk_id.load(Ordering::SeqCst);
            let server_node = ndev.server_node_id;

            let fragment_io = BlockIo {
                is_write: io.is_write,
                start_sector: sector_cursor,
                sector_count: this_sectors,
                buf: if io.is_write {
                    io.buf.slice(byte_cursor..byte_cursor + this_sectors as usize * 512)
                } else {
                    Bytes::new()
                },
                bypass_lock: io.bypass_lock,
                flush_cache: io.flush_cache,
            };

            let drawn = self.slots.draw(ndev_id, fragment_io.clone()).await?;
            ndev.stats.submitted.fetch_add(1, Ordering::Relaxed);

            self.handler.fragments.insert(
                drawn.req_num,
                FragmentSlot {
                    req_num: drawn.req_num,
                    group: Arc::clone(&group),
                    offset_in_group: byte_cursor,
                },
            );

            let desc = IoDescriptor::new(
                if fragment_io.is_write { IoOp::Write } else { IoOp::Read },
                fragment_io.start_sector,
                fragment_io.sector_count,
                server_disk_id,
                drawn.req_num as u64,
                fragment_io.bypass_lock,
                fragment_io.flush_cache,
            );

            let payload = if fragment_io.is_write && !fragment_io.buf.is_empty() {
                Some(fragment_io.buf.clone())
            } else {
                None
            };

            self.transport.send(server_node, desc.to_bytes(), payload, ()).await;

            sector_cursor += this_sectors as u64;
            remaining_sectors = remaining_sectors.saturating_sub(this_sectors);
            byte_cursor += this_sectors as usize * 512;
        }

        Ok(())
    }
}

/// Whether this `BlockIo` is the flush-barrier special case (`spec.md`
/// §8 scenario 4): a zero-sector write.
pub fn is_flush(io: &BlockIo) -> bool {
    io.is_write && io.sector_count == 0
}
