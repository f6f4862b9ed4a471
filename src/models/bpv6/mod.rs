// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Bundle Protocol version 6 (RFC 5050) with CBHE-encoded endpoint ids
//! (RFC 6260) and the Custody Transfer Enhancement Block (CTEB).

pub mod admin;
pub mod bundle;
pub mod canonical;
pub mod primary;

use bitflags::bitflags;

/// On-wire version byte of a BPv6 primary block.
pub const BPV6_VERSION: u8 = 6;

bitflags! {
    /// Bundle processing control flags (RFC 5050 § 4.2), low 7 bits plus the
    /// class-of-service and status-report groups handled separately.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct BundleFlagsV6: u64 {
        const FRAGMENT            = 1 << 0;
        const ADMIN_RECORD        = 1 << 1;
        const NO_FRAGMENT         = 1 << 2;
        const CUSTODY_REQUESTED   = 1 << 3;
        const SINGLETON           = 1 << 4;
        const APP_ACK_REQUESTED   = 1 << 5;
        const _ = !0;
    }
}

impl BundleFlagsV6 {
    /// Class-of-service priority from bits 7..9: 0 bulk, 1 normal,
    /// 2 expedited.  Anything else collapses to bulk.
    pub fn priority(&self) -> u8 {
        let p = ((self.bits() >> 7) & 0x3) as u8;
        if p > 2 { 0 } else { p }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self = Self::from_bits_retain(self.bits() & !(0x3 << 7));
        Self::from_bits_retain(self.bits() | (u64::from(priority.min(2)) << 7))
    }
}

bitflags! {
    /// Canonical block processing control flags (RFC 5050 § 4.3).
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct BlockFlagsV6: u64 {
        const REPLICATE_IN_EVERY_FRAGMENT       = 1 << 0;
        const REPORT_IF_UNPROCESSABLE           = 1 << 1;
        const DELETE_BUNDLE_IF_UNPROCESSABLE    = 1 << 2;
        const IS_LAST_BLOCK                     = 1 << 3;
        const DISCARD_BLOCK_IF_UNPROCESSABLE    = 1 << 4;
        const FORWARDED_WITHOUT_PROCESSING      = 1 << 5;
        const CONTAINS_EID_REFERENCES           = 1 << 6;
        const _ = !0;
    }
}

/// Canonical block type codes used by this router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTypeV6 {
    Payload,
    CustodyTransferEnhancement,
    Other(u8),
}

impl From<u8> for BlockTypeV6 {
    fn from(v: u8) -> Self {
        match v {
            1 => BlockTypeV6::Payload,
            10 => BlockTypeV6::CustodyTransferEnhancement,
            other => BlockTypeV6::Other(other),
        }
    }
}

impl From<BlockTypeV6> for u8 {
    fn from(t: BlockTypeV6) -> u8 {
        match t {
            BlockTypeV6::Payload => 1,
            BlockTypeV6::CustodyTransferEnhancement => 10,
            BlockTypeV6::Other(v) => v,
        }
    }
}
