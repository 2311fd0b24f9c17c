// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! On-the-wire structures shared by the transport, disk engine, and both
//! daemons.

mod io_descriptor;

pub use io_descriptor::{
    HEADER_BYTES, IoDescriptor, IoDescriptorWire, IoOp, MAX_PAYLOAD_BYTES,
};
