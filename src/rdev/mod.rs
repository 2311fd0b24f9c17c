// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Raw-Device Backend (`spec.md` §4.1).
//!
//! Exposes a uniform asynchronous interface to a local disk with a bounded
//! number of in-flight requests. `submit`/`wait_one` are driven through
//! `tokio::task::spawn_blocking` performing positioned reads/writes
//! (`pread`/`pwrite` via [`std::os::unix::fs::FileExt`]), which plays the
//! role the source's kernel-side queue or an io_uring-equivalent userland
//! ring would play: the bound comes from a [`tokio::sync::Semaphore`]
//! sized to the ring capacity, not from the OS.

use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use anyhow::{Context, Result, bail};
use tokio::sync::{Mutex, Semaphore, mpsc};
use tracing::{debug, warn};

use crate::error::Errno;

/// Sector size in bytes; fixed by the wire format (`spec.md` §3).
pub const SECTOR_BYTES: u64 = 512;

/// First `RDEV_RESERVED_SECTORS` of every managed disk are off-limits to
/// I/O and reserved for Exanodes metadata (`spec.md` §4.1 GLOSSARY).
pub const RDEV_RESERVED_SECTORS: u64 = 2048; // 1 MiB

/// `sync` helpers must fragment larger transfers at this boundary.
pub const SYNC_FRAGMENT_BYTES: usize = 256 * 1024;

/// Default ring depth when the caller doesn't specify one.
pub const DEFAULT_RING_CAPACITY: usize = 128;

/// Ownership of a data buffer as it crosses the RDEV boundary: input data
/// for a WRITE, or a pre-sized destination for a READ. Round-trips back to
/// the caller on every [`Outcome`]/[`WaitOutcome`] variant so a retry (on
/// `NoFreeSlot`) never needs to reallocate.
#[derive(Debug, Default)]
pub struct IoBuffer(pub Vec<u8>);

/// One pending request's identity, chosen by the caller. The backend never
/// interprets it, only returns it with the matching completion — this is
/// what lets the caller avoid heap traffic on the completion hot path
/// (`spec.md`'s "request slot" idea, reused at the RDEV layer).
pub type Tag = u64;

#[derive(Debug)]
pub struct Completion {
    pub tag: Tag,
    pub result: std::result::Result<IoBuffer, Errno>,
}

/// Result of [`Rdev::submit`]. Deliberately a sum type (`spec.md` §9):
/// the source conflated "submitted", "submitted and something else already
/// finished", "ring full", and "hard error" into one integer.
#[derive(Debug)]
pub enum Outcome {
    SubmittedAndOneCompleted(Completion),
    Submitted,
    NoFreeSlot(IoBuffer),
    Error(Errno, IoBuffer),
}

#[derive(Debug)]
pub enum WaitOutcome {
    Completed(Completion),
    AllDrained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Read,
    Write,
}

struct Inner {
    file: File,
    logical_sectors: u64,
    capacity: usize,
    permits: Semaphore,
    in_flight: AtomicUsize,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: Mutex<mpsc::UnboundedReceiver<Completion>>,
    last_error: Mutex<Option<Errno>>,
    closed: AtomicBool,
}

/// A handle to one open local disk. Cheap to clone (`Arc`-backed); the
/// disk engine holds exactly one per `ExportedDisk`.
#[derive(Clone)]
pub struct Rdev {
    inner: Arc<Inner>,
}

impl Rdev {
    /// `handle_alloc`: opens the disk, probes its size, and establishes
    /// the submission ring.
    pub async fn handle_alloc(path: &str, ring_capacity: usize) -> Result<Self> {
        let path = path.to_owned();
        let (file, physical_sectors) = tokio::task::spawn_blocking(move || {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .with_context(|| format!("opening raw device {path}"))?;
            let len = file.metadata().context("probing device size")?.len();
            Ok::<_, anyhow::Error>((file, len / SECTOR_BYTES))
        })
        .await
        .context("handle_alloc task panicked")??;

        if physical_sectors <= RDEV_RESERVED_SECTORS {
            bail!(
                "device too small: {physical_sectors} sectors <= reserved prefix \
                 {RDEV_RESERVED_SECTORS}"
            );
        }
        let logical_sectors = physical_sectors - RDEV_RESERVED_SECTORS;

        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            inner: Arc::new(Inner {
                file,
                logical_sectors,
                capacity: ring_capacity,
                permits: Semaphore::new(ring_capacity),
                in_flight: AtomicUsize::new(0),
                completions_tx: tx,
                completions_rx: Mutex::new(rx),
                last_error: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Logical sector count exposed on the wire (reserved prefix excluded).
    pub fn sector_count(&self) -> u64 {
        self.inner.logical_sectors
    }

    /// `handle_free`: idempotent close. Safe to call with outstanding I/O
    /// only after the caller has drained every completion via
    /// [`Rdev::wait_one`].
    pub fn handle_free(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    async fn latch_error(&self, e: Errno) {
        *self.inner.last_error.lock().await = Some(e);
    }

    /// Latches `last_error` for a completion reaped off the async I/O
    /// path (`wait_one`, or the opportunistic reap inside `submit`), not
    /// just the synchronous validation failures in `submit_inner`.
    async fn latch_completion(&self, c: &Completion) {
        if let Err(e) = &c.result {
            self.latch_error(*e).await;
        }
    }

    /// Most recent outcome, queryable for the cluster's health probe.
    pub async fn last_error(&self) -> Option<Errno> {
        *self.inner.last_error.lock().await
    }

    fn try_reap_one(&self) -> Option<Completion> {
        self.inner.completions_rx.try_lock().ok()?.try_recv().ok()
    }

    async fn submit_inner(
        &self,
        op: Op,
        tag: Tag,
        sector: u64,
        sector_count: u32,
        buf: IoBuffer,
    ) -> Outcome {
        let expected_len = sector_count as usize * SECTOR_BYTES as usize;
        if buf.0.len() != expected_len {
            return Outcome::Error(Errno::InvalidArgument, buf);
        }
        let end = match sector.checked_add(sector_count as u64) {
            Some(e) => e,
            None => return Outcome::Error(Errno::InvalidArgument, buf),
        };
        if end > self.inner.logical_sectors {
            return Outcome::Error(Errno::InvalidArgument, buf);
        }

        let permit = match self.inner.permits.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => return Outcome::NoFreeSlot(buf),
        };

        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let physical_sector = sector + RDEV_RESERVED_SECTORS;
        let inner = Arc::clone(&self.inner);
        let tx = self.inner.completions_tx.clone();

        tokio::task::spawn_blocking(move || {
            let offset = physical_sector * SECTOR_BYTES;
            let mut buf = buf;
            let result = match op {
                Op::Read => inner
                    .file
                    .read_at(&mut buf.0, offset)
                    .map(|_| ())
                    .map_err(|_| Errno::Io),
                Op::Write => inner
                    .file
                    .write_at(&buf.0, offset)
                    .map(|_| ())
                    .map_err(|_| Errno::Io),
            };
            drop(permit);
            inner.in_flight.fetch_sub(1, Ordering::SeqCst);
            let result = result.map(|()| buf).map_err(|e| e);
            let _ = tx.send(Completion { tag, result });
        });

        match self.try_reap_one() {
            Some(c) => {
                self.latch_completion(&c).await;
                Outcome::SubmittedAndOneCompleted(c)
            },
            None => Outcome::Submitted,
        }
    }

    /// `submit`: queue an aligned read/write. May opportunistically reap
    /// at most one already-completed request; if it does, the caller owns
    /// that completion too.
    pub async fn submit(
        &self,
        is_write: bool,
        tag: Tag,
        sector: u64,
        sector_count: u32,
        buf: IoBuffer,
    ) -> Outcome {
        let op = if is_write { Op::Write } else { Op::Read };
        let outcome = self.submit_inner(op, tag, sector, sector_count, buf).await;
        if let Outcome::Error(e, _) = &outcome {
            self.latch_error(*e).await;
        }
        outcome
    }

    /// `wait_one`: blocks until a completion is available or the ring is
    /// empty.
    pub async fn wait_one(&self) -> WaitOutcome {
        if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
            // Still drain anything already queued without blocking.
            if let Some(c) = self.try_reap_one() {
                self.latch_completion(&c).await;
                return WaitOutcome::Completed(c);
            }
            return WaitOutcome::AllDrained;
        }
        let mut rx = self.inner.completions_rx.lock().await;
        match rx.recv().await {
            Some(c) => {
                self.latch_completion(&c).await;
                WaitOutcome::Completed(c)
            },
            None => WaitOutcome::AllDrained,
        }
    }

    /// `flush`: issues a cache barrier and returns once the device has
    /// accepted it. Fragmentation at [`SYNC_FRAGMENT_BYTES`] only matters
    /// for bulk sync helpers built atop this primitive; `flush` itself is
    /// a single `fsync`.
    pub async fn flush(&self) -> std::result::Result<(), Errno> {
        let inner = Arc::clone(&self.inner);
        let result = tokio::task::spawn_blocking(move || inner.file.sync_data())
            .await
            .map_err(|e| {
                warn!("flush task panicked: {e}");
                Errno::Io
            })
            .and_then(|r| r.map_err(|_| Errno::Io));

        if let Err(e) = result {
            self.latch_error(e).await;
        } else {
            debug!("flush accepted");
        }
        result
    }

    /// Ring depth this handle was opened with.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

#[cfg(test)]
mod tests {
    use tempfile::NamedTempFile;

    use super::*;

    async fn scratch_disk(sectors: u64) -> (NamedTempFile, Rdev) {
        let f = NamedTempFile::new().expect("tmp file");
        f.as_file()
            .set_len((sectors + RDEV_RESERVED_SECTORS) * SECTOR_BYTES)
            .expect("truncate");
        let path = f.path().to_str().expect("utf8 path").to_owned();
        let rdev = Rdev::handle_alloc(&path, 4).await.expect("alloc");
        (f, rdev)
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (_f, rdev) = scratch_disk(16).await;

        let data = vec![0xAAu8; 1024];
        let outcome = rdev.submit(true, 1, 8, 2, IoBuffer(data.clone())).await;
        assert!(matches!(outcome, Outcome::Submitted));
        match rdev.wait_one().await {
            WaitOutcome::Completed(c) => {
                assert_eq!(c.tag, 1);
                assert!(c.result.is_ok());
            },
            other => panic!("unexpected {other:?}"),
        }

        let outcome = rdev
            .submit(false, 2, 8, 2, IoBuffer(vec![0u8; 1024]))
            .await;
        assert!(matches!(outcome, Outcome::Submitted));
        match rdev.wait_one().await {
            WaitOutcome::Completed(c) => {
                assert_eq!(c.tag, 2);
                let buf = c.result.expect("ok");
                assert_eq!(buf.0, data);
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn ring_saturates_then_drains() {
        let (_f, rdev) = scratch_disk(64).await;
        let mut tags = Vec::new();
        for i in 0..rdev.capacity() as u64 {
            let outcome = rdev
                .submit(true, i, i, 1, IoBuffer(vec![i as u8; 512]))
                .await;
            assert!(matches!(
                outcome,
                Outcome::Submitted | Outcome::SubmittedAndOneCompleted(_)
            ));
            tags.push(i);
        }

        // One more exceeds the ring before anything has necessarily
        // finished; retry after reaping is the caller's contract.
        let extra = rdev.submit(true, 999, 0, 1, IoBuffer(vec![9u8; 512])).await;
        if let Outcome::NoFreeSlot(_buf) = extra {
            // expected under saturation; reap and retry.
            let _ = rdev.wait_one().await;
        }

        let mut drained = 0;
        loop {
            match rdev.wait_one().await {
                WaitOutcome::Completed(_) => drained += 1,
                WaitOutcome::AllDrained => break,
            }
        }
        assert!(drained >= tags.len());
    }

    #[tokio::test]
    async fn out_of_range_sector_is_error_without_consuming_a_slot() {
        let (_f, rdev) = scratch_disk(4).await;
        let outcome = rdev.submit(false, 1, 100, 1, IoBuffer(vec![0u8; 512])).await;
        assert!(matches!(outcome, Outcome::Error(Errno::InvalidArgument, _)));
        assert_eq!(rdev.last_error().await, Some(Errno::InvalidArgument));
    }

    #[tokio::test]
    async fn flush_is_observable_and_idempotent_to_call_repeatedly() {
        let (_f, rdev) = scratch_disk(4).await;
        rdev.flush().await.expect("flush ok");
        rdev.flush().await.expect("flush ok again");
    }
}
