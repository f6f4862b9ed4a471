// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::models::{
    bpv7::{BundleFlagsV7, CrcType, crc},
    cbor::{self, CborReader},
    eid::Eid,
    error::CodecError,
};

const IPN_SCHEME: u64 = 2;
const DTN_SCHEME: u64 = 1;

/// Writes a BPv7 EID item: `[2, [node, service]]` for ipn, `[1, 0]` for the
/// null endpoint.
pub fn write_eid(eid: &Eid, out: &mut Vec<u8>) {
    if eid.is_null() {
        cbor::write_array_head(2, out);
        cbor::write_uint(DTN_SCHEME, out);
        cbor::write_uint(0, out); // dtn:none
    } else {
        cbor::write_array_head(2, out);
        cbor::write_uint(IPN_SCHEME, out);
        cbor::write_array_head(2, out);
        cbor::write_uint(eid.node_id, out);
        cbor::write_uint(eid.service_id, out);
    }
}

pub fn read_eid(r: &mut CborReader<'_>) -> Result<Eid, CodecError> {
    let n = r.read_array_head()?;
    if n != 2 {
        return Err(CodecError::malformed("bpv7 eid", "array not 2 items"));
    }
    match r.read_uint()? {
        IPN_SCHEME => {
            let parts = r.read_array_head()?;
            if parts != 2 {
                return Err(CodecError::malformed("bpv7 eid", "ipn ssp not 2 items"));
            }
            Ok(Eid::new(r.read_uint()?, r.read_uint()?))
        },
        DTN_SCHEME => {
            // only dtn:none (ssp = 0) is accepted
            if r.read_uint()? != 0 {
                return Err(CodecError::malformed("bpv7 eid", "non-none dtn eid"));
            }
            Ok(Eid::NULL)
        },
        other => Err(CodecError::malformed(
            "bpv7 eid",
            format!("unknown scheme {other}"),
        )),
    }
}

/// BPv7 primary block (RFC 9171 § 4.3.1): a CBOR array of 8 to 11 items.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PrimaryBlockV7 {
    pub flags: BundleFlagsV7,
    pub crc_type: CrcType,
    pub destination: Eid,
    pub source: Eid,
    pub report_to: Eid,
    /// Creation timestamp: milliseconds since the DTN epoch + sequence.
    pub creation_millis: u64,
    pub creation_sequence: u64,
    pub lifetime_millis: u64,
    pub fragment_offset: Option<u64>,
    pub total_adu_length: Option<u64>,
}

impl PrimaryBlockV7 {
    /// Parses one primary block item from the reader, verifying the declared
    /// CRC over the raw bytes.
    pub fn parse(r: &mut CborReader<'_>, raw: &[u8]) -> Result<Self, CodecError> {
        let start = r.position();
        let items = r.read_array_head()?;
        if !(8..=11).contains(&items) {
            return Err(CodecError::malformed(
                "bpv7 primary",
                format!("array of {items} items"),
            ));
        }
        let version = r.read_uint()?;
        if version != 7 {
            return Err(CodecError::malformed("bpv7 primary", "version != 7"));
        }
        let flags = BundleFlagsV7::from_bits_retain(r.read_uint()?);
        let crc_type = CrcType::from_u64(r.read_uint()?)
            .ok_or_else(|| CodecError::malformed("bpv7 primary", "bad crc type"))?;
        let destination = read_eid(r)?;
        let source = read_eid(r)?;
        let report_to = read_eid(r)?;
        let ts_items = r.read_array_head()?;
        if ts_items != 2 {
            return Err(CodecError::malformed("bpv7 primary", "bad timestamp"));
        }
        let creation_millis = r.read_uint()?;
        let creation_sequence = r.read_uint()?;
        let lifetime_millis = r.read_uint()?;

        let is_fragment = flags.contains(BundleFlagsV7::FRAGMENT);
        let expected: u64 = 8
            + if is_fragment { 2 } else { 0 }
            + if crc_type != CrcType::None { 1 } else { 0 };
        if items != expected {
            return Err(CodecError::malformed(
                "bpv7 primary",
                format!("array of {items} items, expected {expected}"),
            ));
        }

        let (fragment_offset, total_adu_length) = if is_fragment {
            (Some(r.read_uint()?), Some(r.read_uint()?))
        } else {
            (None, None)
        };

        if crc_type != CrcType::None {
            let declared = r.read_byte_string()?;
            if declared.len() != crc_type.width() {
                return Err(CodecError::malformed("bpv7 primary", "bad crc width"));
            }
            // crc content bytes sit at the very end of the block
            let mut scratch = raw[start..r.position()].to_vec();
            let zero_from = scratch.len() - crc_type.width();
            for b in &mut scratch[zero_from..] {
                *b = 0;
            }
            let actual = crc::compute(crc_type, &scratch);
            let expected_crc = declared
                .iter()
                .fold(0u32, |acc, b| (acc << 8) | u32::from(*b));
            if actual != expected_crc {
                return Err(CodecError::CrcMismatch {
                    what: "bpv7 primary",
                    expected: expected_crc,
                    actual,
                });
            }
        }

        if destination.is_null() {
            return Err(CodecError::malformed("bpv7 primary", "null destination"));
        }

        Ok(PrimaryBlockV7 {
            flags,
            crc_type,
            destination,
            source,
            report_to,
            creation_millis,
            creation_sequence,
            lifetime_millis,
            fragment_offset,
            total_adu_length,
        })
    }

    pub fn render(&self, out: &mut Vec<u8>) {
        let is_fragment = self.flags.contains(BundleFlagsV7::FRAGMENT);
        let items = 8
            + if is_fragment { 2 } else { 0 }
            + if self.crc_type != CrcType::None { 1 } else { 0 };

        let start = out.len();
        cbor::write_array_head(items as u64, out);
        cbor::write_uint(7, out);
        cbor::write_uint(self.flags.bits(), out);
        cbor::write_uint(self.crc_type.as_u64(), out);
        write_eid(&self.destination, out);
        write_eid(&self.source, out);
        write_eid(&self.report_to, out);
        cbor::write_array_head(2, out);
        cbor::write_uint(self.creation_millis, out);
        cbor::write_uint(self.creation_sequence, out);
        cbor::write_uint(self.lifetime_millis, out);
        if is_fragment {
            cbor::write_uint(self.fragment_offset.unwrap_or(0), out);
            cbor::write_uint(self.total_adu_length.unwrap_or(0), out);
        }
        if self.crc_type != CrcType::None {
            let width = self.crc_type.width();
            cbor::write_byte_string(&vec![0u8; width], out);
            let value = crc::compute(self.crc_type, &out[start..]);
            let bytes = crc::to_bytes(self.crc_type, value);
            let crc_pos = out.len() - width;
            out[crc_pos..].copy_from_slice(&bytes[..width]);
        }
    }
}
