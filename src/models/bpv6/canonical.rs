// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::models::{
    bpv6::{BlockFlagsV6, BlockTypeV6},
    error::CodecError,
    sdnv,
};

/// One parsed BPv6 canonical block header plus the location of its body.
///
/// The body is referenced by range into the source buffer so untouched
/// blocks can be copied verbatim at render time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalBlockV6 {
    pub block_type: BlockTypeV6,
    pub flags: BlockFlagsV6,
    /// `[start, end)` of the whole block (header + body) inside the original
    /// bundle buffer.
    pub block_range: (usize, usize),
    /// `[start, end)` of the block body inside the original bundle buffer.
    pub body_range: (usize, usize),
}

impl CanonicalBlockV6 {
    /// Parses one canonical block starting at `offset` in `buf`.  Returns the
    /// block and the offset one past its body.
    pub fn parse(buf: &[u8], offset: usize) -> Result<(Self, usize), CodecError> {
        let mut pos = offset;
        let block_type = BlockTypeV6::from(
            *buf.get(pos)
                .ok_or_else(|| CodecError::malformed("bpv6 block", "truncated type"))?,
        );
        pos += 1;
        let (raw_flags, n) = sdnv::decode(&buf[pos..])?;
        pos += n;
        let flags = BlockFlagsV6::from_bits_retain(raw_flags);
        if flags.contains(BlockFlagsV6::CONTAINS_EID_REFERENCES) {
            // cbhe bundles never carry eid-reference lists
            return Err(CodecError::malformed(
                "bpv6 block",
                "eid references unsupported",
            ));
        }
        let (body_len, n) = sdnv::decode(&buf[pos..])?;
        pos += n;
        let body_len = body_len as usize;
        if buf.len() < pos + body_len {
            return Err(CodecError::malformed("bpv6 block", "truncated body"));
        }
        Ok((
            CanonicalBlockV6 {
                block_type,
                flags,
                block_range: (offset, pos + body_len),
                body_range: (pos, pos + body_len),
            },
            pos + body_len,
        ))
    }

    /// Serializes a block header + `body`, appending to `out`.
    pub fn render(
        block_type: BlockTypeV6,
        flags: BlockFlagsV6,
        body: &[u8],
        out: &mut Vec<u8>,
    ) {
        out.push(u8::from(block_type));
        sdnv::encode(flags.bits(), out);
        sdnv::encode(body.len() as u64, out);
        out.extend_from_slice(body);
    }

    #[inline]
    pub fn body<'a>(&self, source: &'a [u8]) -> &'a [u8] {
        &source[self.body_range.0..self.body_range.1]
    }
}

/// Custody Transfer Enhancement Block body: an SDNV custody id followed by
/// the creator custodian EID as a UTF-8 `ipn` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtebBody {
    pub custody_id: u64,
    pub creator_custodian_eid: String,
}

impl CtebBody {
    pub fn parse(body: &[u8]) -> Result<Self, CodecError> {
        let (custody_id, n) = sdnv::decode(body)?;
        let eid = core::str::from_utf8(&body[n..])
            .map_err(|_| CodecError::malformed("cteb", "custodian eid not utf-8"))?;
        Ok(CtebBody {
            custody_id,
            creator_custodian_eid: eid.to_string(),
        })
    }

    pub fn render(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            sdnv::encoded_len(self.custody_id) + self.creator_custodian_eid.len(),
        );
        sdnv::encode(self.custody_id, &mut out);
        out.extend_from_slice(self.creator_custodian_eid.as_bytes());
        out
    }
}
