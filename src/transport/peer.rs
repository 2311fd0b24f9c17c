// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A single peer's connection state (`spec.md` §3 `Peer`/`SendDescriptor`/
//! `PendingRecv`).

use std::{net::IpAddr, sync::Arc};

use anyhow::{Context, Result, bail};
use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{RwLock, mpsc},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{error::Errno, wire::IoDescriptor};

pub type NodeId = u32;

/// A queued outbound message plus the caller's opaque context. Ownership
/// returns to the caller through exactly one [`super::TransportHandler::end_sending`]
/// call (`spec.md` invariant I5).
pub struct SendDescriptor<Ctx> {
    pub header: [u8; crate::wire::HEADER_BYTES],
    pub payload: Option<Bytes>,
    pub ctx: Ctx,
}

/// Live half of a peer's connection: the writer side is driven by a task
/// reading from `queue_tx`; the reader side is driven by a separate task
/// that owns the `OwnedReadHalf` directly.
///
/// Retiring a connection always goes through [`PeerConnection::shutdown`],
/// never a bare drop: the writer task's own cancellation-driven drain
/// (`writer_loop`'s trailing `while let Ok(desc) = rx.try_recv()`) is what
/// gives every still-queued `SendDescriptor` its one `end_sending` call
/// (invariant I5). Aborting the writer task instead of awaiting it would
/// win the race against that drain and silently discard queued sends.
struct PeerConnection<Ctx> {
    queue_tx: mpsc::UnboundedSender<SendDescriptor<Ctx>>,
    writer_task: tokio::task::JoinHandle<()>,
    reader_task: tokio::task::JoinHandle<()>,
    cancel: CancellationToken,
}

impl<Ctx> PeerConnection<Ctx> {
    /// Cancels the connection and waits for the writer task to finish its
    /// own drain before returning. The reader side has no queued state to
    /// drain, so it's aborted outright.
    async fn shutdown(self) {
        self.cancel.cancel();
        self.reader_task.abort();
        if let Err(e) = self.writer_task.await {
            if !e.is_cancelled() {
                warn!("writer task panicked during shutdown: {e}");
            }
        }
    }
}

/// One registered peer. Lives for as long as `add_peer`..`remove_peer`;
/// the socket itself (`conn`) comes and goes independently (`spec.md` §3:
/// "add/remove is independent of connection state").
pub struct Peer<Ctx> {
    pub node_id: NodeId,
    pub ip: IpAddr,
    conn: RwLock<Option<PeerConnection<Ctx>>>,
}

impl<Ctx: Send + 'static> Peer<Ctx> {
    pub fn new(node_id: NodeId, ip: IpAddr) -> Self {
        Self {
            node_id,
            ip,
            conn: RwLock::new(None),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.conn.read().await.is_some()
    }

    /// Installs `stream` as this peer's socket, tearing down any previous
    /// one first. Spawns the dedicated writer and reader tasks.
    pub async fn install_socket<H>(
        self: &Arc<Self>,
        stream: TcpStream,
        handler: Arc<H>,
    ) -> Result<()>
    where
        H: super::TransportHandler<Ctx> + 'static,
        Ctx: Send + 'static,
    {
        stream.set_nodelay(true).context("TCP_NODELAY")?;
        let (r, w) = stream.into_split();

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel::<SendDescriptor<Ctx>>();

        let writer_peer = Arc::clone(self);
        let writer_handler = Arc::clone(&handler);
        let writer_cancel = cancel.clone();
        let writer_task = tokio::spawn(async move {
            writer_peer
                .writer_loop(w, rx, writer_handler, writer_cancel)
                .await;
        });

        let reader_peer = Arc::clone(self);
        let reader_handler = handler;
        let reader_cancel = cancel.clone();
        let reader_task = tokio::spawn(async move {
            if let Err(e) = reader_peer.reader_loop(r, reader_handler, reader_cancel).await {
                debug!(peer = reader_peer.node_id, "reader loop ended: {e}");
            }
        });

        let new_conn = PeerConnection {
            queue_tx: tx,
            writer_task,
            reader_task,
            cancel,
        };

        let old = self.conn.write().await.replace(new_conn);
        if let Some(old) = old {
            old.shutdown().await;
        }

        Ok(())
    }

    /// Tears down the socket, if any, waiting for every send still queued
    /// to drain through `end_sending(ctx, NoConnection)` before returning.
    pub async fn clear_socket<H>(&self, handler: &H)
    where
        H: super::TransportHandler<Ctx>,
    {
        let Some(conn) = self.conn.write().await.take() else {
            return;
        };
        let _ = handler; // end_sending for queued items happens in writer_loop's own drain.
        conn.shutdown().await;
    }

    /// Enqueues a message for this peer. If there is no socket, the
    /// descriptor is bounced back synchronously with `NoConnection`
    /// (`spec.md` §4.2 send API).
    pub async fn enqueue<H>(&self, desc: SendDescriptor<Ctx>, handler: &H)
    where
        H: super::TransportHandler<Ctx>,
    {
        let conn = self.conn.read().await;
        match conn.as_ref() {
            Some(c) => {
                if c.queue_tx.send(desc).is_err() {
                    // writer task already gone; bounce immediately.
                    drop(conn);
                    return;
                }
            },
            None => {
                drop(conn);
                handler.end_sending(desc.ctx, Err(Errno::NoConnection));
            },
        }
    }

    async fn writer_loop<H>(
        self: Arc<Self>,
        mut w: OwnedWriteHalf,
        mut rx: mpsc::UnboundedReceiver<SendDescriptor<Ctx>>,
        handler: Arc<H>,
        cancel: CancellationToken,
    ) where
        H: super::TransportHandler<Ctx>,
    {
        let mut cancelled = false;
        loop {
            let desc = tokio::select! {
                _ = cancel.cancelled() => { cancelled = true; break },
                d = rx.recv() => match d {
                    Some(d) => d,
                    None => break,
                },
            };

            let result = async {
                w.write_all(&desc.header).await?;
                if let Some(payload) = &desc.payload {
                    w.write_all(payload).await?;
                }
                Ok::<(), std::io::Error>(())
            }
            .await;

            match result {
                Ok(()) => handler.end_sending(desc.ctx, Ok(())),
                Err(e) => {
                    warn!(peer = self.node_id, "send failed: {e}");
                    handler.end_sending(desc.ctx, Err(Errno::Io));
                    break;
                },
            }
        }

        // Drain whatever is left in the queue: the peer's socket is gone.
        while let Ok(desc) = rx.try_recv() {
            handler.end_sending(desc.ctx, Err(Errno::NoConnection));
        }

        // A cancellation means `install_socket`/`clear_socket` already
        // own retiring this peer's `conn` slot (and may have already
        // installed a new connection there); only self-clear when the
        // loop ended on its own (write error or a closed channel).
        if !cancelled {
            self.conn.write().await.take();
        }
    }

    async fn reader_loop<H>(
        self: Arc<Self>,
        mut r: OwnedReadHalf,
        handler: Arc<H>,
        cancel: CancellationToken,
    ) -> Result<()>
    where
        H: super::TransportHandler<Ctx>,
    {
        loop {
            let mut header_buf = [0u8; crate::wire::HEADER_BYTES];
            tokio::select! {
                _ = cancel.cancelled() => bail!("peer connection cancelled"),
                res = r.read_exact(&mut header_buf) => res.context("reading header")?,
            };

            let header = IoDescriptor::from_bytes(&header_buf)?;
            let expected = handler.payload_len(&header);

            let payload = if expected == 0 {
                Bytes::new()
            } else {
                match handler.keep_receiving(self.node_id, &header) {
                    Some(mut buf) => {
                        buf.resize(expected, 0);
                        tokio::select! {
                            _ = cancel.cancelled() => bail!("peer connection cancelled"),
                            res = r.read_exact(&mut buf) => res.context("reading payload")?,
                        };
                        buf.freeze()
                    },
                    None => {
                        let mut scratch = BytesMut::zeroed(expected);
                        tokio::select! {
                            _ = cancel.cancelled() => bail!("peer connection cancelled"),
                            res = r.read_exact(&mut scratch) => res.context("draining payload")?,
                        };
                        Bytes::new()
                    },
                }
            };

            handler.deliver(self.node_id, header, payload);
        }
    }
}
