// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Fixed-size 64-bit-aligned headers crossing the ingress / egress / storage
//! boundary.  Each travels as the first frame of a two-frame message, the
//! bundle payload being the second.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::models::eid::Eid;

/// Stable numeric message type codes.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Egress = 1,
    Store = 2,
    EgressAckToIngress = 3,
    StorageAckToIngress = 4,
    LinkUp = 5,
    LinkDown = 6,
    EgressAddOpportunisticLink = 7,
    EgressRemoveOpportunisticLink = 8,
    StorageAddOpportunisticLink = 9,
    StorageRemoveOpportunisticLink = 10,
}

impl MsgType {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            1 => MsgType::Egress,
            2 => MsgType::Store,
            3 => MsgType::EgressAckToIngress,
            4 => MsgType::StorageAckToIngress,
            5 => MsgType::LinkUp,
            6 => MsgType::LinkDown,
            7 => MsgType::EgressAddOpportunisticLink,
            8 => MsgType::EgressRemoveOpportunisticLink,
            9 => MsgType::StorageAddOpportunisticLink,
            10 => MsgType::StorageRemoveOpportunisticLink,
            _ => return None,
        })
    }
}

/// Leading fields shared by every fabric header.  Padded out to 8 bytes so
/// the u64 members that follow stay naturally aligned.
#[repr(C)]
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable,
)]
pub struct CommonHdr {
    pub msg_type: u16,
    pub flags: u16,
    reserved: u32,
}

impl CommonHdr {
    pub fn new(msg_type: MsgType) -> Self {
        Self {
            msg_type: msg_type as u16,
            flags: 0,
            reserved: 0,
        }
    }

    #[inline]
    pub fn msg_type(&self) -> Option<MsgType> {
        MsgType::from_u16(self.msg_type)
    }
}

/// Ingress → egress: a bundle to transmit toward `final_dest_eid`.
#[repr(C)]
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable,
)]
pub struct ToEgressHdr {
    pub base: CommonHdr,
    pub final_dest_eid: Eid,
    pub has_custody: u8,
    pub is_cut_through_from_ingress: u8,
    pub reserved: [u8; 6],
    /// Custody id when `has_custody`, otherwise the ingress unique id the
    /// matching ack must echo.
    pub custody_id: u64,
}

impl ToEgressHdr {
    pub fn new(final_dest_eid: Eid, has_custody: bool, custody_id: u64) -> Self {
        Self {
            base: CommonHdr::new(MsgType::Egress),
            final_dest_eid,
            has_custody: u8::from(has_custody),
            is_cut_through_from_ingress: 1,
            reserved: [0; 6],
            custody_id,
        }
    }
}

/// Ingress → storage: a bundle to commit.
#[repr(C)]
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable,
)]
pub struct ToStorageHdr {
    pub base: CommonHdr,
    pub ingress_unique_id: u64,
}

impl ToStorageHdr {
    pub fn new(ingress_unique_id: u64) -> Self {
        Self {
            base: CommonHdr::new(MsgType::Store),
            ingress_unique_id,
        }
    }
}

/// Egress → ingress ack, matched FIFO against the per-destination queue.
#[repr(C)]
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable,
)]
pub struct EgressAckHdr {
    pub base: CommonHdr,
    pub final_dest_eid: Eid,
    pub custody_id: u64,
}

impl EgressAckHdr {
    pub fn new(final_dest_eid: Eid, custody_id: u64) -> Self {
        Self {
            base: CommonHdr::new(MsgType::EgressAckToIngress),
            final_dest_eid,
            custody_id,
        }
    }
}

/// Storage → ingress ack, matched FIFO against the global storage queue.
#[repr(C)]
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable,
)]
pub struct StorageAckHdr {
    pub base: CommonHdr,
    pub ingress_unique_id: u64,
}

impl StorageAckHdr {
    pub fn new(ingress_unique_id: u64) -> Self {
        Self {
            base: CommonHdr::new(MsgType::StorageAckToIngress),
            ingress_unique_id,
        }
    }
}

/// Scheduler → ingress link event: the named final destination (and the next
/// hop toward it) became reachable / unreachable.
#[repr(C)]
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable,
)]
pub struct LinkEventHdr {
    pub base: CommonHdr,
    pub final_dest_eid: Eid,
    pub next_hop_eid: Eid,
}

impl LinkEventHdr {
    pub fn link_up(final_dest_eid: Eid, next_hop_eid: Eid) -> Self {
        Self {
            base: CommonHdr::new(MsgType::LinkUp),
            final_dest_eid,
            next_hop_eid,
        }
    }

    pub fn link_down(final_dest_eid: Eid, next_hop_eid: Eid) -> Self {
        Self {
            base: CommonHdr::new(MsgType::LinkDown),
            final_dest_eid,
            next_hop_eid,
        }
    }
}
