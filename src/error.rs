// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Error taxonomy for the NBD data plane.
//!
//! The wire format carries a single signed byte (`result`) per completion,
//! so every outcome that can cross the wire or be returned from RDEV must
//! collapse to an [`Errno`]. Components above that boundary (transport,
//! disk engine, client engine) use [`NbdError`] to keep the *kind* of
//! failure (transport-recoverable, operation-recoverable, operation-fatal,
//! resource-exhaustion) distinguishable instead of carrying a bare int
//! whose meaning depends on the caller, which is the pattern this crate
//! explicitly replaces.

use thiserror::Error;

/// Negative errno-like codes carried verbatim in `IoDescriptor::result`.
///
/// `Ok` is the wire value `0`; every other variant is negative on the wire
/// (`-(variant as i8)`), matching the convention `spec.md` §7 assumes.
#[repr(i8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    Ok = 0,
    /// Operation-recoverable: hit a locked zone without `bypass_lock`.
    Again = 11,
    /// Operation-fatal: RDEV or disk I/O failure.
    Io = 5,
    /// Unknown `disk_id`, unknown ndev, or similar "no such thing" case.
    NoEntry = 2,
    /// No connected socket for the target peer.
    NoConnection = 107,
    /// Zero-sector READ, or another malformed request.
    InvalidArgument = 22,
}

impl Errno {
    /// Value as it appears on the wire (0 for success, negative otherwise).
    #[inline]
    pub const fn to_wire(self) -> i8 {
        match self {
            Errno::Ok => 0,
            other => -(other as i8),
        }
    }

    /// Decode a wire `result` byte back into an `Errno`. Unknown negative
    /// codes are folded into `Io` since the wire format has no room for
    /// anything richer than "it failed".
    pub const fn from_wire(v: i8) -> Self {
        match v {
            0 => Errno::Ok,
            -11 => Errno::Again,
            -2 => Errno::NoEntry,
            -107 => Errno::NoConnection,
            -22 => Errno::InvalidArgument,
            _ => Errno::Io,
        }
    }

    #[inline]
    pub const fn is_ok(self) -> bool {
        matches!(self, Errno::Ok)
    }
}

/// Component-level error type. `anyhow::Result` is still used at call
/// sites that only need to propagate and log (connection setup, config
/// loading); `NbdError` is used wherever the *kind* of failure changes
/// control flow (retry vs. surface vs. assert).
#[derive(Debug, Error)]
pub enum NbdError {
    /// Peer socket lost or never connected. Recovered by the control plane
    /// (`remove_peer`/`add_peer`/`connect_to_peer`), never auto-retried.
    #[error("transport: {0}")]
    Transport(String),

    /// The request hit a rebuild lock zone without `bypass_lock`. The
    /// upper layer is expected to resubmit.
    #[error("operation recoverable: {0:?}")]
    OperationRecoverable(Errno),

    /// RDEV surfaced a hard failure; propagated verbatim to the caller.
    #[error("operation fatal: {0:?}")]
    OperationFatal(Errno),

    /// A bounded pool (receive buffers, request slots, RDEV ring) is
    /// exhausted and the caller must back off or fail the request.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl NbdError {
    /// Collapse to the wire-level errno this error should be reported as.
    pub const fn as_errno(&self) -> Errno {
        match self {
            NbdError::Transport(_) => Errno::Io,
            NbdError::OperationRecoverable(e) => *e,
            NbdError::OperationFatal(e) => *e,
            NbdError::ResourceExhausted(_) => Errno::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, NbdError>;
