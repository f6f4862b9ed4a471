// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::models::{
    bpv6::{BPV6_VERSION, BundleFlagsV6},
    eid::Eid,
    error::CodecError,
    sdnv,
};

/// BPv6 primary block with CBHE endpoint encoding (RFC 6260): the dictionary
/// is empty and every scheme/ssp offset pair carries `(node_id, service_id)`
/// directly.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PrimaryBlockV6 {
    pub flags: BundleFlagsV6,
    pub destination: Eid,
    pub source: Eid,
    pub report_to: Eid,
    pub custodian: Eid,
    /// Creation timestamp: seconds since the DTN epoch plus a sequence number
    /// disambiguating bundles created within one second.
    pub creation_seconds: u64,
    pub creation_sequence: u64,
    pub lifetime_seconds: u64,
    /// Present only when [`BundleFlagsV6::FRAGMENT`] is set.
    pub fragment_offset: u64,
    pub total_adu_length: u64,
}

impl PrimaryBlockV6 {
    /// Parses a primary block from the front of `buf`, returning the block
    /// and the number of bytes consumed.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        if buf.first().copied() != Some(BPV6_VERSION) {
            return Err(CodecError::malformed("bpv6 primary", "bad version byte"));
        }
        let mut pos = 1usize;
        let mut next = |buf: &[u8], pos: &mut usize| -> Result<u64, CodecError> {
            let (v, n) = sdnv::decode(&buf[*pos..])?;
            *pos += n;
            Ok(v)
        };

        let flags = BundleFlagsV6::from_bits_retain(next(buf, &mut pos)?);
        let block_length = next(buf, &mut pos)? as usize;
        let body_start = pos;

        let dest_node = next(buf, &mut pos)?;
        let dest_service = next(buf, &mut pos)?;
        let src_node = next(buf, &mut pos)?;
        let src_service = next(buf, &mut pos)?;
        let report_node = next(buf, &mut pos)?;
        let report_service = next(buf, &mut pos)?;
        let custodian_node = next(buf, &mut pos)?;
        let custodian_service = next(buf, &mut pos)?;
        let creation_seconds = next(buf, &mut pos)?;
        let creation_sequence = next(buf, &mut pos)?;
        let lifetime_seconds = next(buf, &mut pos)?;

        let dictionary_length = next(buf, &mut pos)?;
        if dictionary_length != 0 {
            return Err(CodecError::malformed(
                "bpv6 primary",
                "non-empty dictionary (only cbhe is supported)",
            ));
        }

        let (fragment_offset, total_adu_length) =
            if flags.contains(BundleFlagsV6::FRAGMENT) {
                (next(buf, &mut pos)?, next(buf, &mut pos)?)
            } else {
                (0, 0)
            };

        if pos - body_start != block_length {
            return Err(CodecError::malformed(
                "bpv6 primary",
                format!(
                    "declared block length {block_length} != parsed {}",
                    pos - body_start
                ),
            ));
        }

        let primary = PrimaryBlockV6 {
            flags,
            destination: Eid::new(dest_node, dest_service),
            source: Eid::new(src_node, src_service),
            report_to: Eid::new(report_node, report_service),
            custodian: Eid::new(custodian_node, custodian_service),
            creation_seconds,
            creation_sequence,
            lifetime_seconds,
            fragment_offset,
            total_adu_length,
        };

        if primary.destination.is_null() {
            return Err(CodecError::malformed("bpv6 primary", "null destination"));
        }
        Ok((primary, pos))
    }

    /// Serializes the primary block, appending to `out`.
    pub fn render(&self, out: &mut Vec<u8>) {
        out.push(BPV6_VERSION);
        sdnv::encode(self.flags.bits(), out);

        let mut body = Vec::with_capacity(64);
        sdnv::encode(self.destination.node_id, &mut body);
        sdnv::encode(self.destination.service_id, &mut body);
        sdnv::encode(self.source.node_id, &mut body);
        sdnv::encode(self.source.service_id, &mut body);
        sdnv::encode(self.report_to.node_id, &mut body);
        sdnv::encode(self.report_to.service_id, &mut body);
        sdnv::encode(self.custodian.node_id, &mut body);
        sdnv::encode(self.custodian.service_id, &mut body);
        sdnv::encode(self.creation_seconds, &mut body);
        sdnv::encode(self.creation_sequence, &mut body);
        sdnv::encode(self.lifetime_seconds, &mut body);
        sdnv::encode(0, &mut body); // empty cbhe dictionary
        if self.flags.contains(BundleFlagsV6::FRAGMENT) {
            sdnv::encode(self.fragment_offset, &mut body);
            sdnv::encode(self.total_adu_length, &mut body);
        }

        sdnv::encode(body.len() as u64, out);
        out.extend_from_slice(&body);
    }

    #[inline]
    pub fn requests_custody(&self) -> bool {
        self.flags
            .contains(BundleFlagsV6::SINGLETON | BundleFlagsV6::CUSTODY_REQUESTED)
    }

    #[inline]
    pub fn is_admin_record(&self) -> bool {
        self.flags
            .contains(BundleFlagsV6::SINGLETON | BundleFlagsV6::ADMIN_RECORD)
    }
}
