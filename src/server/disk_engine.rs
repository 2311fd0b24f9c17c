// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Server-side per-disk worker (`spec.md` §4.3). One task per
//! `ExportedDisk`; drains `incoming_queue`, enforces lock zones, pipelines
//! into RDEV, hands completions back to the daemon.

use std::{collections::HashMap, sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    error::Errno,
    rdev::{IoBuffer, Outcome, WaitOutcome},
    server::disk::{DiskWorkItem, ExportedDisk, LockOp, LockZone, PendingIo},
    wire::{IoDescriptor, IoOp},
};

const QUEUE_WAIT: Duration = Duration::from_millis(200);

struct InFlight {
    header: IoDescriptor,
    from_peer: u32,
    finisher: tokio::sync::oneshot::Sender<(IoDescriptor, Bytes)>,
    /// Original write payload, kept only so a would-be-read reply buffer
    /// isn't confused with it; reads allocate their own reply buffer.
    _write_payload: Option<Bytes>,
}

/// Runs until `disk.exit_requested()` and the queue is closed, draining
/// every in-flight RDEV completion before returning (`spec.md` §4.4
/// `unexport` contract).
pub async fn run(disk: Arc<ExportedDisk>, mut queue_rx: mpsc::UnboundedReceiver<DiskWorkItem>) {
    let mut in_flight: HashMap<u64, InFlight> = HashMap::new();
    let mut next_tag: u64 = 0;
    let mut have_in_flight = false;

    loop {
        let item = match queue_rx.try_recv() {
            Ok(item) => Some(item),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                if !have_in_flight {
                    break;
                }
                None
            },
        };

        let item = match item {
            Some(item) => item,
            None if have_in_flight => {
                match disk.rdev.wait_one().await {
                    WaitOutcome::Completed(c) => {
                        finish_rdev_completion(&disk, &mut in_flight, c).await;
                    },
                    WaitOutcome::AllDrained => have_in_flight = false,
                }
                continue;
            },
            None => {
                match tokio::time::timeout(QUEUE_WAIT, queue_rx.recv()).await {
                    Ok(Some(item)) => item,
                    Ok(None) if disk.exit_requested() => break,
                    Ok(None) => continue,
                    Err(_elapsed) if disk.exit_requested() => break,
                    Err(_elapsed) => continue,
                }
            },
        };

        match item {
            DiskWorkItem::Lock(cmd) => {
                drain_all_completions(&disk, &mut in_flight, &mut have_in_flight).await;
                let zone = LockZone {
                    start: cmd.start_sector,
                    count: cmd.sector_count,
                };
                let result = disk.apply_lock(cmd.op, zone).await;
                let _ = cmd.reply.send(result.map_err(|e| {
                    anyhow::anyhow!("lock op failed: {e:?}")
                }));
            },
            DiskWorkItem::Io(req) => {
                handle_io(
                    &disk,
                    req,
                    &mut in_flight,
                    &mut next_tag,
                    &mut have_in_flight,
                )
                .await;
            },
        }
    }

    drain_all_completions(&disk, &mut in_flight, &mut have_in_flight).await;
    debug!(disk = %disk.uuid, "disk engine exited");
}

async fn handle_io(
    disk: &Arc<ExportedDisk>,
    req: PendingIo,
    in_flight: &mut HashMap<u64, InFlight>,
    next_tag: &mut u64,
    have_in_flight: &mut bool,
) {
    let header = req.header;

    if header.is_flush_request() {
        drain_all_completions(disk, in_flight, have_in_flight).await;
        let result = disk.rdev.flush().await;
        let errno = result.err().unwrap_or(Errno::Ok);
        finish(disk, header, req.from_peer, req.finisher, errno, Bytes::new()).await;
        return;
    }

    if header.op == IoOp::Read && header.sector_count == 0 {
        finish(
            disk,
            header,
            req.from_peer,
            req.finisher,
            Errno::InvalidArgument,
            Bytes::new(),
        )
        .await;
        return;
    }

    if disk
        .conflicts(header.sector, header.sector_count as u64, header.bypass_lock)
        .await
    {
        finish(
            disk,
            header,
            req.from_peer,
            req.finisher,
            Errno::Again,
            Bytes::new(),
        )
        .await;
        return;
    }

    let tag = *next_tag;
    *next_tag += 1;

    let buf = match header.op {
        IoOp::Read => IoBuffer(vec![0u8; header.sector_count as usize * 512]),
        IoOp::Write => IoBuffer(req.payload.to_vec()),
    };

    let mut outcome = disk
        .rdev
        .submit(header.op == IoOp::Write, tag, header.sector, header.sector_count, buf)
        .await;

    loop {
        match outcome {
            Outcome::NoFreeSlot(buf) => {
                match disk.rdev.wait_one().await {
                    WaitOutcome::Completed(c) => {
                        finish_rdev_completion(disk, in_flight, c).await;
                    },
                    WaitOutcome::AllDrained => *have_in_flight = false,
                }
                outcome = disk
                    .rdev
                    .submit(
                        header.op == IoOp::Write,
                        tag,
                        header.sector,
                        header.sector_count,
                        buf,
                    )
                    .await;
                continue;
            },
            Outcome::Error(errno, _buf) => {
                disk.errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                finish(disk, header, req.from_peer, req.finisher, errno, Bytes::new()).await;
                return;
            },
            Outcome::Submitted => {
                *have_in_flight = true;
                disk.submitted
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                in_flight.insert(
                    tag,
                    InFlight {
                        header,
                        from_peer: req.from_peer,
                        finisher: req.finisher,
                        _write_payload: None,
                    },
                );
                return;
            },
            Outcome::SubmittedAndOneCompleted(completed) => {
                *have_in_flight = true;
                disk.submitted
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                in_flight.insert(
                    tag,
                    InFlight {
                        header,
                        from_peer: req.from_peer,
                        finisher: req.finisher,
                        _write_payload: None,
                    },
                );
                finish_rdev_completion(disk, in_flight, completed).await;
                return;
            },
        }
    }
}

async fn drain_all_completions(
    disk: &Arc<ExportedDisk>,
    in_flight: &mut HashMap<u64, InFlight>,
    have_in_flight: &mut bool,
) {
    if !*have_in_flight {
        return;
    }
    loop {
        match disk.rdev.wait_one().await {
            WaitOutcome::Completed(c) => finish_rdev_completion(disk, in_flight, c).await,
            WaitOutcome::AllDrained => {
                *have_in_flight = false;
                return;
            },
        }
    }
}

async fn finish_rdev_completion(
    disk: &Arc<ExportedDisk>,
    in_flight: &mut HashMap<u64, InFlight>,
    completion: crate::rdev::Completion,
) {
    let Some(req) = in_flight.remove(&completion.tag) else {
        warn!(disk = %disk.uuid, tag = completion.tag, "completion for unknown tag");
        return;
    };
    let (errno, payload) = match completion.result {
        Ok(buf) if req.header.op == IoOp::Read => (Errno::Ok, Bytes::from(buf.0)),
        Ok(_buf) => (Errno::Ok, Bytes::new()),
        Err(e) => (e, Bytes::new()),
    };
    finish(disk, req.header, req.from_peer, req.finisher, errno, payload).await;
}

async fn finish(
    disk: &Arc<ExportedDisk>,
    mut header: IoDescriptor,
    _from_peer: u32,
    finisher: tokio::sync::oneshot::Sender<(IoDescriptor, Bytes)>,
    errno: Errno,
    payload: Bytes,
) {
    header.result = errno.to_wire();
    header.strip_payload_for_reply();
    if errno.is_ok() {
        disk.completed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    } else {
        disk.errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
    let _ = finisher.send((header, payload));
}

/// Applies `apply_lock`'s unification of `LockOp` naming with the
/// control-plane request so daemon code doesn't need to duplicate the
/// match.
pub fn lock_op_from_bool(is_lock: bool) -> LockOp {
    if is_lock { LockOp::Lock } else { LockOp::Unlock }
}
