// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The NBD request/reply header (`spec.md` §6.1).
//!
//! Frozen at 34 bytes, little-endian, packed. The first 28 bytes carry the
//! descriptor fields; the last 6 bytes are reserved padding, written as
//! zero and ignored on read, closing the gap to the size frozen at first
//! deployment.
//!
//! No in-memory pointer rides on the wire (the source's `nbd_io_desc_t`
//! carried a `void *buf`); server- and client-side buffers are located
//! out-of-band, by `req_num` on the client and by the `PendingRecv` slot on
//! the server.

use anyhow::{Result, anyhow, bail};
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U32, U64,
};

/// Size of [`IoDescriptorWire`] on the wire.
pub const HEADER_BYTES: usize = 34;

/// Transport-level cap on a single message's payload; larger block I/Os
/// must be fragmented by the client engine (`spec.md` §9).
pub const MAX_PAYLOAD_BYTES: usize = 262_144;

/// Request opcode, carried in `request_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Read,
    Write,
}

impl IoOp {
    const READ_WIRE: u32 = 236;
    const WRITE_WIRE: u32 = 237;

    pub const fn to_wire(self) -> u32 {
        match self {
            IoOp::Read => Self::READ_WIRE,
            IoOp::Write => Self::WRITE_WIRE,
        }
    }

    pub fn from_wire(v: u32) -> Result<Self> {
        match v {
            Self::READ_WIRE => Ok(IoOp::Read),
            Self::WRITE_WIRE => Ok(IoOp::Write),
            other => bail!("invalid NBD request_type: {other}"),
        }
    }
}

/// Wire-level layout of the NBD header. Only ever touched through copying
/// accessors (`.get()`/`.set()`) so the `packed` layout never forces a
/// reference to an unaligned field.
#[repr(C, packed)]
#[derive(Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct IoDescriptorWire {
    request_type: U32<LittleEndian>,
    sector: U64<LittleEndian>,
    sector_count: U32<LittleEndian>,
    disk_id: i8,
    req_num: U64<LittleEndian>,
    result: i8,
    bypass_lock: u8,
    flush_cache: u8,
    _reserved: [u8; 6],
}

const _: () = assert!(std::mem::size_of::<IoDescriptorWire>() == HEADER_BYTES);

impl Default for IoDescriptorWire {
    fn default() -> Self {
        Self {
            request_type: U32::new(IoOp::Read.to_wire()),
            sector: U64::new(0),
            sector_count: U32::new(0),
            disk_id: 0,
            req_num: U64::new(0),
            result: 0,
            bypass_lock: 0,
            flush_cache: 0,
            _reserved: [0; 6],
        }
    }
}

/// High-level, owned view of an [`IoDescriptorWire`]; this is what the
/// rest of the crate passes around. Construct with [`IoDescriptor::new`],
/// serialize with [`IoDescriptor::to_bytes`], parse with
/// [`IoDescriptor::from_bytes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoDescriptor {
    pub op: IoOp,
    pub sector: u64,
    pub sector_count: u32,
    pub disk_id: i8,
    pub req_num: u64,
    pub result: i8,
    pub bypass_lock: bool,
    pub flush_cache: bool,
}

impl IoDescriptor {
    pub fn new(
        op: IoOp,
        sector: u64,
        sector_count: u32,
        disk_id: i8,
        req_num: u64,
        bypass_lock: bool,
        flush_cache: bool,
    ) -> Self {
        Self {
            op,
            sector,
            sector_count,
            disk_id,
            req_num,
            result: 0,
            bypass_lock,
            flush_cache,
        }
    }

    /// True for a WRITE with `sector_count == 0`: the flush-barrier
    /// convention `spec.md` §4.3 and §8 (scenario 4) describe.
    #[inline]
    pub fn is_flush_request(&self) -> bool {
        self.op == IoOp::Write && self.sector_count == 0
    }

    /// Number of payload bytes this message must carry *as a request*
    /// (client → server direction).
    #[inline]
    pub fn request_payload_len(&self) -> usize {
        match self.op {
            IoOp::Read => 0,
            IoOp::Write => self.sector_count as usize * 512,
        }
    }

    /// Number of payload bytes this message carries *as a reply*
    /// (server → client direction): only a successful READ carries data.
    #[inline]
    pub fn reply_payload_len(&self) -> usize {
        match self.op {
            IoOp::Read if self.result == 0 => self.sector_count as usize * 512,
            _ => 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_BYTES] {
        let wire = IoDescriptorWire {
            request_type: U32::new(self.op.to_wire()),
            sector: U64::new(self.sector),
            sector_count: U32::new(self.sector_count),
            disk_id: self.disk_id,
            req_num: U64::new(self.req_num),
            result: self.result,
            bypass_lock: self.bypass_lock as u8,
            flush_cache: self.flush_cache as u8,
            _reserved: [0; 6],
        };
        let mut out = [0u8; HEADER_BYTES];
        out.copy_from_slice(wire.as_bytes());
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let wire = IoDescriptorWire::read_from_bytes(buf)
            .map_err(|_| anyhow!("short NBD header: {} bytes", buf.len()))?;
        Ok(Self {
            op: IoOp::from_wire(wire.request_type.get())?,
            sector: wire.sector.get(),
            sector_count: wire.sector_count.get(),
            disk_id: wire.disk_id,
            req_num: wire.req_num.get(),
            result: wire.result,
            bypass_lock: wire.bypass_lock != 0,
            flush_cache: wire.flush_cache != 0,
        })
    }

    /// Zero `sector_count` on a reply that carries no payload, so the
    /// receiver's framing state machine terminates correctly (`spec.md`
    /// §6.1's framing rule).
    pub fn strip_payload_for_reply(&mut self) {
        if !(self.op == IoOp::Read && self.result == 0) {
            self.sector_count = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let d = IoDescriptor::new(IoOp::Write, 8, 2, 3, 42, false, true);
        let bytes = d.to_bytes();
        assert_eq!(bytes.len(), HEADER_BYTES);
        let back = IoDescriptor::from_bytes(&bytes).expect("decode");
        assert_eq!(d, back);
    }

    #[test]
    fn read_request_carries_no_payload() {
        let d = IoDescriptor::new(IoOp::Read, 0, 4, 0, 1, false, false);
        assert_eq!(d.request_payload_len(), 0);
    }

    #[test]
    fn write_request_carries_sector_count_times_512() {
        let d = IoDescriptor::new(IoOp::Write, 0, 4, 0, 1, false, false);
        assert_eq!(d.request_payload_len(), 2048);
    }

    #[test]
    fn successful_read_reply_carries_payload_failed_reply_does_not() {
        let mut ok = IoDescriptor::new(IoOp::Read, 0, 2, 0, 1, false, false);
        ok.result = 0;
        assert_eq!(ok.reply_payload_len(), 1024);

        let mut failed = ok;
        failed.result = -5;
        assert_eq!(failed.reply_payload_len(), 0);
    }

    #[test]
    fn flush_is_zero_sector_write() {
        let flush = IoDescriptor::new(IoOp::Write, 0, 0, 0, 1, false, true);
        assert!(flush.is_flush_request());
        let normal_write = IoDescriptor::new(IoOp::Write, 0, 1, 0, 1, false, true);
        assert!(!normal_write.is_flush_request());
    }

    #[test]
    fn strip_payload_zeroes_sector_count_on_non_successful_read() {
        let mut reply = IoDescriptor::new(IoOp::Read, 5, 4, 0, 9, false, false);
        reply.result = -5;
        reply.strip_payload_for_reply();
        assert_eq!(reply.sector_count, 0);

        let mut ok_read = IoDescriptor::new(IoOp::Read, 5, 4, 0, 9, false, false);
        ok_read.result = 0;
        ok_read.strip_payload_for_reply();
        assert_eq!(ok_read.sector_count, 4);
    }
}
