// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! TCP transport (`spec.md` §4.2): one ordered stream per peer, per-peer
//! send queue, per-peer receive reassembly, survives reconnects.
//!
//! The source's accept/send/recv threads become, here, one spawned task
//! per peer connection plus one accept task — a cooperative-runtime
//! substitution the redesign notes explicitly license, preserving the
//! per-peer FIFO ordering and at-most-once `end_sending` contracts rather
//! than the literal thread topology.

mod peer;

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, bail, ensure};
use bytes::{Bytes, BytesMut};
pub use peer::{NodeId, Peer, SendDescriptor};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::RwLock,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{error::Errno, wire::IoDescriptor};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(4);

/// Upcalls the transport makes into whatever owns it (`Server` or
/// `ClientEngine`). Never invoked with the peer table lock held.
pub trait TransportHandler<Ctx>: Send + Sync {
    /// Bytes expected to follow this header, computed from the role's own
    /// framing rule (`spec.md` §6.1): the server always reads requests,
    /// the client always reads replies, and the two interpret an
    /// identical header differently (a WRITE carries `sector_count·512`
    /// bytes as a request but zero as a reply).
    fn payload_len(&self, header: &IoDescriptor) -> usize;

    /// Called once the header has fully arrived, only when
    /// `payload_len(header) > 0`. Returning `None` drains and discards the
    /// bytes without breaking framing.
    fn keep_receiving(&self, from: NodeId, header: &IoDescriptor) -> Option<BytesMut>;

    /// Called once a full message (header + optional payload) has
    /// arrived.
    fn deliver(&self, from: NodeId, header: IoDescriptor, payload: Bytes);

    /// Called exactly once per [`SendDescriptor`] (`spec.md` invariant
    /// I5).
    fn end_sending(&self, ctx: Ctx, result: std::result::Result<(), Errno>);
}

/// Shared TCP transport instance. One per daemon. Generic over the
/// caller-supplied context type carried on every outbound message (the
/// disk engine's request handle on the server, the `RequestSlot` index on
/// the client).
pub struct Transport<Ctx, H: TransportHandler<Ctx>> {
    peers: RwLock<HashMap<NodeId, Arc<Peer<Ctx>>>>,
    handler: Arc<H>,
    local_bind_ip: IpAddr,
    send_buf_bytes: u32,
    recv_buf_bytes: u32,
    cancel: CancellationToken,
}

impl<Ctx, H> Transport<Ctx, H>
where
    Ctx: Send + 'static,
    H: TransportHandler<Ctx> + 'static,
{
    pub fn new(
        handler: Arc<H>,
        local_bind_ip: IpAddr,
        send_buf_bytes: u32,
        recv_buf_bytes: u32,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            peers: RwLock::new(HashMap::new()),
            handler,
            local_bind_ip,
            send_buf_bytes,
            recv_buf_bytes,
            cancel,
        })
    }

    /// `add_peer`: idempotent for a repeated `(node_id, ip)`; a mismatched
    /// `ip` for an existing `node_id` is a programmer error (`spec.md`
    /// §3 lifecycle, §7 "duplicate peer-id with mismatched IP").
    pub async fn add_peer(&self, node_id: NodeId, ip: IpAddr) {
        let mut peers = self.peers.write().await;
        if let Some(existing) = peers.get(&node_id) {
            assert_eq!(
                existing.ip, ip,
                "add_peer({node_id}) called twice with different IPs"
            );
            return;
        }
        peers.insert(node_id, Arc::new(Peer::new(node_id, ip)));
    }

    /// `remove_peer`: shuts the socket (flushing the send queue with
    /// `end_sending(ctx, NoConnection)`) and drops the entry.
    pub async fn remove_peer(&self, node_id: NodeId) {
        let removed = self.peers.write().await.remove(&node_id);
        if let Some(peer) = removed {
            peer.clear_socket(self.handler.as_ref()).await;
        }
    }

    async fn peer(&self, node_id: NodeId) -> Option<Arc<Peer<Ctx>>> {
        self.peers.read().await.get(&node_id).cloned()
    }

    /// Client-role connect path (`spec.md` §4.2 "Connect path").
    pub async fn connect_to_peer(&self, node_id: NodeId, data_port: u16) -> Result<()> {
        let peer = self
            .peer(node_id)
            .await
            .with_context(|| format!("connect_to_peer: unknown peer {node_id}"))?;

        let addr = SocketAddr::new(peer.ip, data_port);
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .with_context(|| format!("connect timeout to {addr}"))?
            .with_context(|| format!("connect failed to {addr}"))?;

        self.configure_socket(&stream)?;
        peer.install_socket(stream, Arc::clone(&self.handler)).await
    }

    fn configure_socket(&self, stream: &TcpStream) -> Result<()> {
        stream.set_nodelay(true).context("TCP_NODELAY")?;
        stream.set_linger(Some(Duration::ZERO)).context("SO_LINGER")?;
        let sock_ref = socket2::SockRef::from(stream);
        sock_ref
            .set_send_buffer_size(self.send_buf_bytes as usize)
            .context("SO_SNDBUF")?;
        sock_ref
            .set_recv_buffer_size(self.recv_buf_bytes as usize)
            .context("SO_RCVBUF")?;
        Ok(())
    }

    /// Server-role accept loop (`spec.md` §4.2 "Accept thread"). Runs
    /// until cancelled. Connections from unregistered IPs are closed
    /// immediately.
    pub async fn run_accept_loop(self: &Arc<Self>, data_port: u16) -> Result<()> {
        let listener = TcpListener::bind((self.local_bind_ip, data_port))
            .await
            .with_context(|| format!("binding data port {data_port}"))?;
        info!(port = data_port, "accept loop listening");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, remote) = accepted.context("accept")?;
                    self.handle_accept(stream, remote.ip()).await;
                }
            }
        }
    }

    async fn handle_accept(self: &Arc<Self>, stream: TcpStream, remote_ip: IpAddr) {
        let peer = {
            let peers = self.peers.read().await;
            peers.values().find(|p| p.ip == remote_ip).cloned()
        };
        match peer {
            Some(peer) => {
                if let Err(e) = self.configure_socket(&stream) {
                    warn!("failed to configure accepted socket from {remote_ip}: {e}");
                    return;
                }
                if let Err(e) =
                    peer.install_socket(stream, Arc::clone(&self.handler)).await
                {
                    warn!("failed to install accepted socket from {remote_ip}: {e}");
                }
            },
            None => {
                debug_unregistered_peer(remote_ip);
                drop(stream);
            },
        }
    }

    /// `send`: enqueue on the target peer's send queue. Synchronously
    /// bounces with `NoConnection` if the peer has no socket or is
    /// unknown.
    pub async fn send(
        &self,
        to: NodeId,
        header: [u8; crate::wire::HEADER_BYTES],
        payload: Option<Bytes>,
        ctx: Ctx,
    ) {
        match self.peer(to).await {
            Some(peer) => {
                peer.enqueue(SendDescriptor { header, payload, ctx }, self.handler.as_ref())
                    .await
            },
            None => self.handler.end_sending(ctx, Err(Errno::NoConnection)),
        }
    }

    pub async fn is_peer_connected(&self, node_id: NodeId) -> bool {
        match self.peer(node_id).await {
            Some(p) => p.is_connected().await,
            None => false,
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

fn debug_unregistered_peer(ip: IpAddr) {
    tracing::debug!("rejecting connection from unregistered peer {ip}");
}

/// Validates the `net_type = "TCP=<KiB>"` config string (`spec.md` §6.1)
/// and returns the buffer size in bytes.
pub fn parse_net_type(net_type: &str) -> Result<u32> {
    let kib = net_type
        .strip_prefix("TCP=")
        .with_context(|| format!("unsupported net_type: {net_type}"))?;
    let kib: u32 = kib.parse().context("net_type KiB value")?;
    ensure!(kib > 0, "net_type buffer size must be positive");
    Ok(kib * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_net_type() {
        assert_eq!(parse_net_type("TCP=256").unwrap(), 256 * 1024);
    }

    #[test]
    fn rejects_malformed_net_type() {
        assert!(parse_net_type("UDP=256").is_err());
        assert!(parse_net_type("TCP=abc").is_err());
    }
}
