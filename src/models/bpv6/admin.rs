// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! BPv6 administrative records carried in custody-signalling bundles:
//! the RFC 5050 single-bundle custody signal and the aggregate custody
//! signal that acknowledges many custody ids in one bundle.

use crate::models::{error::CodecError, sdnv};

/// Admin record type nibble (high 4 bits of the first payload byte).
pub const ADMIN_RECORD_CUSTODY_SIGNAL: u8 = 2;
pub const ADMIN_RECORD_AGGREGATE_CUSTODY_SIGNAL: u8 = 4;

/// Flag bit in the low nibble: the record refers to a bundle fragment.
const ADMIN_FLAG_FOR_FRAGMENT: u8 = 1;

/// Status-reason slots used by custody signalling.  Index 0 is success; the
/// rest are the RFC 5050 refusal reasons an accepting node may report.
#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CustodyReason {
    #[default]
    Success = 0,
    RedundantReception,
    DepletedStorage,
    DestinationUnintelligible,
    NoKnownRoute,
    NoTimelyContact,
    BlockUnintelligible,
}

/// Number of distinct reason slots (one pending aggregate per slot).
pub const NUM_CUSTODY_REASONS: usize = 7;

impl CustodyReason {
    pub const ALL: [CustodyReason; NUM_CUSTODY_REASONS] = [
        CustodyReason::Success,
        CustodyReason::RedundantReception,
        CustodyReason::DepletedStorage,
        CustodyReason::DestinationUnintelligible,
        CustodyReason::NoKnownRoute,
        CustodyReason::NoTimelyContact,
        CustodyReason::BlockUnintelligible,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub fn is_success(self) -> bool {
        matches!(self, CustodyReason::Success)
    }

    /// RFC 5050 § 6.3 reason code carried in the signal status byte.
    pub fn rfc5050_code(self) -> u8 {
        match self {
            CustodyReason::Success => 0,
            CustodyReason::RedundantReception => 3,
            CustodyReason::DepletedStorage => 4,
            CustodyReason::DestinationUnintelligible => 5,
            CustodyReason::NoKnownRoute => 6,
            CustodyReason::NoTimelyContact => 7,
            CustodyReason::BlockUnintelligible => 8,
        }
    }

    pub fn from_rfc5050_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => CustodyReason::Success,
            3 => CustodyReason::RedundantReception,
            4 => CustodyReason::DepletedStorage,
            5 => CustodyReason::DestinationUnintelligible,
            6 => CustodyReason::NoKnownRoute,
            7 => CustodyReason::NoTimelyContact,
            8 => CustodyReason::BlockUnintelligible,
            _ => return None,
        })
    }
}

/// RFC 5050 § 6.3 custody signal payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustodySignal {
    pub succeeded: bool,
    pub reason: CustodyReason,
    pub is_for_fragment: bool,
    pub fragment_offset: u64,
    pub fragment_length: u64,
    /// Time of signal, seconds since DTN epoch + nanosecond remainder.
    pub signal_seconds: u64,
    pub signal_nanoseconds: u64,
    /// Copied from the signalled bundle's primary block.
    pub bundle_creation_seconds: u64,
    pub bundle_creation_sequence: u64,
    pub bundle_source_eid: String,
}

impl CustodySignal {
    /// Renders the admin-record payload (becomes the payload block body of a
    /// custody-signal bundle).
    pub fn render(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + self.bundle_source_eid.len());
        let flags = if self.is_for_fragment {
            ADMIN_FLAG_FOR_FRAGMENT
        } else {
            0
        };
        out.push((ADMIN_RECORD_CUSTODY_SIGNAL << 4) | flags);

        let mut status = self.reason.rfc5050_code() & 0x7f;
        if self.succeeded {
            status |= 0x80;
        }
        out.push(status);

        if self.is_for_fragment {
            sdnv::encode(self.fragment_offset, &mut out);
            sdnv::encode(self.fragment_length, &mut out);
        }
        sdnv::encode(self.signal_seconds, &mut out);
        sdnv::encode(self.signal_nanoseconds, &mut out);
        sdnv::encode(self.bundle_creation_seconds, &mut out);
        sdnv::encode(self.bundle_creation_sequence, &mut out);
        sdnv::encode(self.bundle_source_eid.len() as u64, &mut out);
        out.extend_from_slice(self.bundle_source_eid.as_bytes());
        out
    }

    pub fn parse(payload: &[u8]) -> Result<Self, CodecError> {
        if payload.len() < 2 {
            return Err(CodecError::malformed("custody signal", "too short"));
        }
        if payload[0] >> 4 != ADMIN_RECORD_CUSTODY_SIGNAL {
            return Err(CodecError::malformed(
                "custody signal",
                "wrong admin record type",
            ));
        }
        let is_for_fragment = payload[0] & ADMIN_FLAG_FOR_FRAGMENT != 0;
        let status = payload[1];
        let succeeded = status & 0x80 != 0;
        let reason = CustodyReason::from_rfc5050_code(status & 0x7f).ok_or_else(|| {
            CodecError::malformed("custody signal", "unknown reason code")
        })?;

        let mut pos = 2usize;
        let mut next = |pos: &mut usize| -> Result<u64, CodecError> {
            let (v, n) = sdnv::decode(&payload[*pos..])?;
            *pos += n;
            Ok(v)
        };
        let (fragment_offset, fragment_length) = if is_for_fragment {
            (next(&mut pos)?, next(&mut pos)?)
        } else {
            (0, 0)
        };
        let signal_seconds = next(&mut pos)?;
        let signal_nanoseconds = next(&mut pos)?;
        let bundle_creation_seconds = next(&mut pos)?;
        let bundle_creation_sequence = next(&mut pos)?;
        let eid_len = next(&mut pos)? as usize;
        if payload.len() < pos + eid_len {
            return Err(CodecError::malformed("custody signal", "truncated eid"));
        }
        let bundle_source_eid = core::str::from_utf8(&payload[pos..pos + eid_len])
            .map_err(|_| CodecError::malformed("custody signal", "eid not utf-8"))?
            .to_string();

        Ok(CustodySignal {
            succeeded,
            reason,
            is_for_fragment,
            fragment_offset,
            fragment_length,
            signal_seconds,
            signal_nanoseconds,
            bundle_creation_seconds,
            bundle_creation_sequence,
            bundle_source_eid,
        })
    }
}

/// Aggregate custody signal: one status byte plus delta-encoded fills of
/// custody ids, all sharing the same disposition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateCustodySignal {
    pub succeeded: bool,
    pub reason: CustodyReason,
    /// Sorted, deduplicated custody ids covered by this signal.
    pub custody_ids: Vec<u64>,
}

impl AggregateCustodySignal {
    pub fn new(reason: CustodyReason) -> Self {
        Self {
            succeeded: reason.is_success(),
            reason,
            custody_ids: Vec::new(),
        }
    }

    pub fn add_custody_id(&mut self, custody_id: u64) {
        match self.custody_ids.binary_search(&custody_id) {
            Ok(_) => {},
            Err(idx) => self.custody_ids.insert(idx, custody_id),
        }
    }

    /// Renders the admin-record payload.  Runs of consecutive ids collapse
    /// into `(delta-from-previous-fill-end, length)` SDNV pairs.
    pub fn render(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.custody_ids.len() * 2);
        out.push(ADMIN_RECORD_AGGREGATE_CUSTODY_SIGNAL << 4);

        let mut status = self.reason.rfc5050_code() & 0x7f;
        if self.succeeded {
            status |= 0x80;
        }
        out.push(status);

        let mut prev_end = 0u64;
        let mut i = 0usize;
        while i < self.custody_ids.len() {
            let start = self.custody_ids[i];
            let mut len = 1u64;
            while i + 1 < self.custody_ids.len()
                && self.custody_ids[i + 1] == self.custody_ids[i] + 1
            {
                i += 1;
                len += 1;
            }
            sdnv::encode(start - prev_end, &mut out);
            sdnv::encode(len, &mut out);
            prev_end = start + len;
            i += 1;
        }
        out
    }

    pub fn parse(payload: &[u8]) -> Result<Self, CodecError> {
        if payload.len() < 2 {
            return Err(CodecError::malformed("acs", "too short"));
        }
        if payload[0] >> 4 != ADMIN_RECORD_AGGREGATE_CUSTODY_SIGNAL {
            return Err(CodecError::malformed("acs", "wrong admin record type"));
        }
        let status = payload[1];
        let succeeded = status & 0x80 != 0;
        let reason = CustodyReason::from_rfc5050_code(status & 0x7f)
            .ok_or_else(|| CodecError::malformed("acs", "unknown reason code"))?;

        let mut custody_ids = Vec::new();
        let mut pos = 2usize;
        let mut prev_end = 0u64;
        while pos < payload.len() {
            let (delta, n) = sdnv::decode(&payload[pos..])?;
            pos += n;
            let (len, n) = sdnv::decode(&payload[pos..])?;
            pos += n;
            if len == 0 {
                return Err(CodecError::malformed("acs", "zero-length fill"));
            }
            let start = prev_end + delta;
            for id in start..start + len {
                custody_ids.push(id);
            }
            prev_end = start + len;
        }

        Ok(AggregateCustodySignal {
            succeeded,
            reason,
            custody_ids,
        })
    }
}

/// Admin record type nibble of an admin bundle payload, if recognizable.
pub fn admin_record_type(payload: &[u8]) -> Option<u8> {
    payload.first().map(|b| b >> 4)
}
