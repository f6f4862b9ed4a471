// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Bundle Protocol version 7 (RFC 9171): CBOR bundles with CRC-protected
//! blocks, previous-node and hop-count extension blocks.

pub mod bundle;
pub mod canonical;
pub mod crc;
pub mod primary;

use bitflags::bitflags;

/// A BPv7 bundle always starts with the CBOR indefinite-length array head.
pub const BPV7_FIRST_BYTE: u8 = crate::models::cbor::INDEFINITE_ARRAY_HEAD;

bitflags! {
    /// Bundle processing control flags (RFC 9171 § 4.2.3).
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct BundleFlagsV7: u64 {
        const FRAGMENT              = 1 << 0;
        const ADMIN_RECORD          = 1 << 1;
        const NO_FRAGMENT           = 1 << 2;
        const APP_ACK_REQUESTED     = 1 << 5;
        const STATUS_TIME_REQUESTED = 1 << 6;
        const _ = !0;
    }
}

bitflags! {
    /// Block processing control flags (RFC 9171 § 4.2.4).
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct BlockFlagsV7: u64 {
        const REPLICATE_IN_EVERY_FRAGMENT    = 1 << 0;
        const REPORT_IF_UNPROCESSABLE        = 1 << 1;
        const DELETE_BUNDLE_IF_UNPROCESSABLE = 1 << 2;
        const REMOVE_BLOCK_IF_UNPROCESSABLE  = 1 << 4;
        const _ = !0;
    }
}

/// CRC type declared by a block (RFC 9171 § 4.2.1).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CrcType {
    #[default]
    None,
    Crc16,
    Crc32c,
}

impl CrcType {
    pub fn from_u64(v: u64) -> Option<Self> {
        Some(match v {
            0 => CrcType::None,
            1 => CrcType::Crc16,
            2 => CrcType::Crc32c,
            _ => return None,
        })
    }

    #[inline]
    pub fn as_u64(self) -> u64 {
        match self {
            CrcType::None => 0,
            CrcType::Crc16 => 1,
            CrcType::Crc32c => 2,
        }
    }

    /// Width of the CRC byte string, zero when absent.
    #[inline]
    pub fn width(self) -> usize {
        match self {
            CrcType::None => 0,
            CrcType::Crc16 => 2,
            CrcType::Crc32c => 4,
        }
    }
}

/// Canonical block type codes (RFC 9171 § 4.4 + registries).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTypeV7 {
    Payload,
    PreviousNode,
    BundleAge,
    HopCount,
    Other(u64),
}

impl From<u64> for BlockTypeV7 {
    fn from(v: u64) -> Self {
        match v {
            1 => BlockTypeV7::Payload,
            6 => BlockTypeV7::PreviousNode,
            7 => BlockTypeV7::BundleAge,
            10 => BlockTypeV7::HopCount,
            other => BlockTypeV7::Other(other),
        }
    }
}

impl From<BlockTypeV7> for u64 {
    fn from(t: BlockTypeV7) -> u64 {
        match t {
            BlockTypeV7::Payload => 1,
            BlockTypeV7::PreviousNode => 6,
            BlockTypeV7::BundleAge => 7,
            BlockTypeV7::HopCount => 10,
            BlockTypeV7::Other(v) => v,
        }
    }
}
