// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::models::{
    bpv7::{
        BPV7_FIRST_BYTE, BlockTypeV7,
        canonical::CanonicalBlockV7,
        primary::PrimaryBlockV7,
    },
    cbor::{self, CborReader},
    error::CodecError,
};

/// Lazy view of one canonical block inside a parsed BPv7 bundle.
#[derive(Debug, Clone)]
pub struct BlockViewV7 {
    pub block: CanonicalBlockV7,
    /// `[start, end)` of the encoded block in the source buffer; `None` for
    /// blocks added after parse.
    source_range: Option<(usize, usize)>,
    modified: bool,
}

impl BlockViewV7 {
    #[inline]
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Marks the block dirty so `render` re-encodes it (with a fresh CRC).
    #[inline]
    pub fn set_manually_modified(&mut self) {
        self.modified = true;
    }
}

/// Parsed BPv7 bundle over a borrowed source buffer.
#[derive(Debug)]
pub struct BundleV7<'a> {
    source: &'a [u8],
    pub primary: PrimaryBlockV7,
    primary_range: (usize, usize),
    primary_modified: bool,
    pub blocks: Vec<BlockViewV7>,
}

impl<'a> BundleV7<'a> {
    /// Parses the indefinite-length bundle array.  `skip_canonical_crc`
    /// bypasses canonical-block CRC checks (primary CRC is always checked).
    pub fn parse(source: &'a [u8], skip_canonical_crc: bool) -> Result<Self, CodecError> {
        let mut r = CborReader::new(source);
        r.read_indefinite_array_head()?;

        let primary_start = r.position();
        let primary = PrimaryBlockV7::parse(&mut r, source)?;
        let primary_range = (primary_start, r.position());

        let mut blocks = Vec::new();
        loop {
            if r.try_read_break() {
                break;
            }
            if r.remaining() == 0 {
                return Err(CodecError::malformed("bpv7 bundle", "missing break"));
            }
            let start = r.position();
            let block = CanonicalBlockV7::parse(&mut r, source, skip_canonical_crc)?;
            blocks.push(BlockViewV7 {
                block,
                source_range: Some((start, r.position())),
                modified: false,
            });
        }
        if r.remaining() != 0 {
            return Err(CodecError::malformed("bpv7 bundle", "trailing bytes"));
        }

        // block numbers are unique, payload is block number 1
        for (i, a) in blocks.iter().enumerate() {
            for b in &blocks[i + 1..] {
                if a.block.block_number == b.block.block_number {
                    return Err(CodecError::malformed(
                        "bpv7 bundle",
                        "duplicate block number",
                    ));
                }
            }
            if a.block.block_type == BlockTypeV7::Payload && a.block.block_number != 1 {
                return Err(CodecError::malformed(
                    "bpv7 bundle",
                    "payload block number != 1",
                ));
            }
        }

        Ok(BundleV7 {
            source,
            primary,
            primary_range,
            primary_modified: false,
            blocks,
        })
    }

    #[inline]
    pub fn set_primary_modified(&mut self) {
        self.primary_modified = true;
    }

    pub fn blocks_by_type(&mut self, t: BlockTypeV7) -> Vec<&mut BlockViewV7> {
        self.blocks
            .iter_mut()
            .filter(|b| b.block.block_type == t)
            .collect()
    }

    pub fn count_blocks_by_type(&self, t: BlockTypeV7) -> usize {
        self.blocks
            .iter()
            .filter(|b| b.block.block_type == t)
            .count()
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.blocks
            .iter()
            .find(|b| b.block.block_type == BlockTypeV7::Payload)
            .map(|b| b.block.data.as_slice())
    }

    /// Smallest block number not yet taken (payload holds 1 forever).
    pub fn next_free_block_number(&self) -> u64 {
        let mut n = 2u64;
        while self.blocks.iter().any(|b| b.block.block_number == n) {
            n += 1;
        }
        n
    }

    /// Inserts a new block in front of all existing canonical blocks.
    pub fn prepend_block(&mut self, block: CanonicalBlockV7) {
        self.blocks.insert(
            0,
            BlockViewV7 {
                block,
                source_range: None,
                modified: true,
            },
        );
    }

    /// Serializes the bundle; untouched blocks are copied byte-for-byte from
    /// the source buffer.
    pub fn render(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.source.len() + 32);
        out.push(BPV7_FIRST_BYTE);
        if self.primary_modified {
            self.primary.render(&mut out);
        } else {
            let (start, end) = self.primary_range;
            out.extend_from_slice(&self.source[start..end]);
        }
        for view in &self.blocks {
            match (view.modified, view.source_range) {
                (false, Some((start, end))) => {
                    out.extend_from_slice(&self.source[start..end]);
                },
                _ => view.block.render(&mut out),
            }
        }
        out.push(cbor::BREAK);
        out
    }

}

/// True when the first byte announces a BPv7 bundle (CBOR indefinite array).
#[inline]
pub fn looks_like_bpv7(buf: &[u8]) -> bool {
    buf.first().copied() == Some(BPV7_FIRST_BYTE)
}

/// Convenience assembler for freshly originated BPv7 bundles.
#[derive(Debug)]
pub struct BundleBuilderV7 {
    pub primary: PrimaryBlockV7,
    blocks: Vec<CanonicalBlockV7>,
}

impl BundleBuilderV7 {
    pub fn new(primary: PrimaryBlockV7) -> Self {
        Self {
            primary,
            blocks: Vec::new(),
        }
    }

    pub fn block(mut self, block: CanonicalBlockV7) -> Self {
        self.blocks.push(block);
        self
    }

    pub fn payload(self, data: Vec<u8>, crc_type: super::CrcType) -> Self {
        self.block(CanonicalBlockV7 {
            block_type: BlockTypeV7::Payload,
            block_number: 1,
            flags: super::BlockFlagsV7::empty(),
            crc_type,
            data,
        })
    }

    pub fn build(self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(BPV7_FIRST_BYTE);
        self.primary.render(&mut out);
        for block in &self.blocks {
            block.render(&mut out);
        }
        out.push(cbor::BREAK);
        out
    }
}
