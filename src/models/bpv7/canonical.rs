// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::models::{
    bpv7::{BlockFlagsV7, BlockTypeV7, CrcType, crc, primary},
    cbor::{self, CborReader},
    eid::Eid,
    error::CodecError,
};

/// One BPv7 canonical block: `[type, number, flags, crc-type, data, crc?]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalBlockV7 {
    pub block_type: BlockTypeV7,
    pub block_number: u64,
    pub flags: BlockFlagsV7,
    pub crc_type: CrcType,
    pub data: Vec<u8>,
}

impl CanonicalBlockV7 {
    /// Parses one canonical block item, optionally skipping CRC verification
    /// (the fast path used for bundles that are forwarded untouched).
    pub fn parse(
        r: &mut CborReader<'_>,
        raw: &[u8],
        skip_crc: bool,
    ) -> Result<Self, CodecError> {
        let start = r.position();
        let items = r.read_array_head()?;
        if !(5..=6).contains(&items) {
            return Err(CodecError::malformed(
                "bpv7 block",
                format!("array of {items} items"),
            ));
        }
        let block_type = BlockTypeV7::from(r.read_uint()?);
        let block_number = r.read_uint()?;
        let flags = BlockFlagsV7::from_bits_retain(r.read_uint()?);
        let crc_type = CrcType::from_u64(r.read_uint()?)
            .ok_or_else(|| CodecError::malformed("bpv7 block", "bad crc type"))?;
        let data = r.read_byte_string()?.to_vec();

        if (items == 6) != (crc_type != CrcType::None) {
            return Err(CodecError::malformed(
                "bpv7 block",
                "crc presence disagrees with crc type",
            ));
        }
        if crc_type != CrcType::None {
            let declared = r.read_byte_string()?;
            if declared.len() != crc_type.width() {
                return Err(CodecError::malformed("bpv7 block", "bad crc width"));
            }
            if !skip_crc {
                let mut scratch = raw[start..r.position()].to_vec();
                let zero_from = scratch.len() - crc_type.width();
                for b in &mut scratch[zero_from..] {
                    *b = 0;
                }
                let actual = crc::compute(crc_type, &scratch);
                let expected = declared
                    .iter()
                    .fold(0u32, |acc, b| (acc << 8) | u32::from(*b));
                if actual != expected {
                    return Err(CodecError::CrcMismatch {
                        what: "bpv7 block",
                        expected,
                        actual,
                    });
                }
            }
        }

        Ok(CanonicalBlockV7 {
            block_type,
            block_number,
            flags,
            crc_type,
            data,
        })
    }

    pub fn render(&self, out: &mut Vec<u8>) {
        let items = if self.crc_type != CrcType::None { 6 } else { 5 };
        let start = out.len();
        cbor::write_array_head(items, out);
        cbor::write_uint(u64::from(self.block_type), out);
        cbor::write_uint(self.block_number, out);
        cbor::write_uint(self.flags.bits(), out);
        cbor::write_uint(self.crc_type.as_u64(), out);
        cbor::write_byte_string(&self.data, out);
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

/// Previous-node block body: a CBOR-encoded EID naming the forwarding node.
pub fn encode_previous_node(eid: &Eid) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    primary::write_eid(eid, &mut out);
    out
}

pub fn decode_previous_node(data: &[u8]) -> Result<Eid, CodecError> {
    let mut r = CborReader::new(data);
    let eid = primary::read_eid(&mut r)?;
    if r.remaining() != 0 {
        return Err(CodecError::malformed("previous node", "trailing bytes"));
    }
    Ok(eid)
}

/// Hop-count block body: `[hop limit, hop count]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HopCount {
    pub limit: u64,
    pub count: u64,
}

impl HopCount {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        cbor::write_array_head(2, &mut out);
        cbor::write_uint(self.limit, &mut out);
        cbor::write_uint(self.count, &mut out);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = CborReader::new(data);
        if r.read_array_head()? != 2 {
            return Err(CodecError::malformed("hop count", "array not 2 items"));
        }
        let limit = r.read_uint()?;
        let count = r.read_uint()?;
        if r.remaining() != 0 {
            return Err(CodecError::malformed("hop count", "trailing bytes"));
        }
        Ok(HopCount { limit, count })
    }
}
