// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

/// Errors produced while parsing or rendering any of the wire formats
/// (BPv6/BPv7 bundles, LTP segments, TCPCL messages, admin records).
#[derive(Debug, Error)]
pub enum CodecError {
    /// Structural damage: SDNV/CBOR overrun, truncated block, bad magic,
    /// violated primary-block invariant.
    #[error("malformed {what}: {detail}")]
    Malformed {
        what: &'static str,
        detail: String,
    },

    /// CRC declared by the block does not match the computed value.
    #[error("{what}: crc mismatch (expected {expected:#010x}, got {actual:#010x})")]
    CrcMismatch {
        what: &'static str,
        expected: u32,
        actual: u32,
    },

    /// First byte is neither a BPv6 version byte nor a BPv7 CBOR
    /// indefinite-array head.
    #[error("unsupported bundle version byte {0:#04x}")]
    UnsupportedVersion(u8),
}

impl CodecError {
    #[inline]
    pub fn malformed(what: &'static str, detail: impl Into<String>) -> Self {
        CodecError::Malformed {
            what,
            detail: detail.into(),
        }
    }
}
