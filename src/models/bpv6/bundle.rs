// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::models::{
    bpv6::{
        BlockFlagsV6, BlockTypeV6, BundleFlagsV6,
        canonical::CanonicalBlockV6,
        primary::PrimaryBlockV6,
    },
    error::CodecError,
};

/// Lazy view of one canonical block.
///
/// Until a block is mutated it is nothing more than a header plus a byte
/// range into the source buffer; rendering copies those bytes verbatim.
/// Mutation swaps in an owned replacement body which is re-encoded instead.
#[derive(Debug, Clone)]
pub struct BlockViewV6 {
    pub header: CanonicalBlockV6,
    replacement_body: Option<Vec<u8>>,
    modified: bool,
}

impl BlockViewV6 {
    #[inline]
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Replaces the block body and marks the view dirty.
    pub fn set_body(&mut self, body: Vec<u8>) {
        self.replacement_body = Some(body);
        self.modified = true;
    }

    pub fn body<'a>(&'a self, source: &'a [u8]) -> &'a [u8] {
        match &self.replacement_body {
            Some(owned) => owned,
            None => self.header.body(source),
        }
    }
}

/// Parsed BPv6 bundle over a borrowed source buffer.
///
/// `render` re-emits only what changed: an untouched primary block and
/// untouched canonical blocks are memcpy'd from the source.
#[derive(Debug)]
pub struct BundleV6<'a> {
    source: &'a [u8],
    pub primary: PrimaryBlockV6,
    /// `[0, end)` range of the primary block inside `source`.
    primary_end: usize,
    primary_modified: bool,
    pub blocks: Vec<BlockViewV6>,
}

impl<'a> BundleV6<'a> {
    pub fn parse(source: &'a [u8]) -> Result<Self, CodecError> {
        let (primary, primary_end) = PrimaryBlockV6::parse(source)?;

        let mut blocks = Vec::new();
        let mut pos = primary_end;
        loop {
            if pos >= source.len() {
                return Err(CodecError::malformed(
                    "bpv6 bundle",
                    "missing last-block flag",
                ));
            }
            let (header, next) = CanonicalBlockV6::parse(source, pos)?;
            let is_last = header.flags.contains(BlockFlagsV6::IS_LAST_BLOCK);
            blocks.push(BlockViewV6 {
                header,
                replacement_body: None,
                modified: false,
            });
            pos = next;
            if is_last {
                break;
            }
        }
        if pos != source.len() {
            return Err(CodecError::malformed(
                "bpv6 bundle",
                "trailing bytes after last block",
            ));
        }

        Ok(BundleV6 {
            source,
            primary,
            primary_end,
            primary_modified: false,
            blocks,
        })
    }

    /// Marks the primary block dirty so `render` re-encodes it.
    #[inline]
    pub fn set_primary_modified(&mut self) {
        self.primary_modified = true;
    }

    pub fn blocks_by_type(&mut self, t: BlockTypeV6) -> Vec<&mut BlockViewV6> {
        self.blocks
            .iter_mut()
            .filter(|b| b.header.block_type == t)
            .collect()
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.blocks
            .iter()
            .find(|b| b.header.block_type == BlockTypeV6::Payload)
            .map(|b| b.body(self.source))
    }

    #[inline]
    pub fn source(&self) -> &'a [u8] {
        self.source
    }

    /// Serializes the bundle.  Untouched regions are copied from the source
    /// buffer; the primary and any dirty block are re-encoded.
    pub fn render(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.source.len() + 16);
        if self.primary_modified {
            self.primary.render(&mut out);
        } else {
            out.extend_from_slice(&self.source[..self.primary_end]);
        }
        let last = self.blocks.len().saturating_sub(1);
        for (i, view) in self.blocks.iter().enumerate() {
            // last-block flag is structural, keep it consistent on re-encode
            let mut flags = view.header.flags;
            flags.set(BlockFlagsV6::IS_LAST_BLOCK, i == last);
            if view.modified || flags != view.header.flags {
                CanonicalBlockV6::render(
                    view.header.block_type,
                    flags,
                    view.body(self.source),
                    &mut out,
                );
            } else {
                let (start, end) = view.header.block_range;
                out.extend_from_slice(&self.source[start..end]);
            }
        }
        out
    }
}

/// Convenience assembler for freshly originated BPv6 bundles (custody
/// signals, echo replies built from scratch in tests).
#[derive(Debug, Default)]
pub struct BundleBuilderV6 {
    pub primary: PrimaryBlockV6,
    blocks: Vec<(BlockTypeV6, BlockFlagsV6, Vec<u8>)>,
}

impl BundleBuilderV6 {
    pub fn new(primary: PrimaryBlockV6) -> Self {
        Self {
            primary,
            blocks: Vec::new(),
        }
    }

    pub fn block(mut self, t: BlockTypeV6, flags: BlockFlagsV6, body: Vec<u8>) -> Self {
        self.blocks.push((t, flags, body));
        self
    }

    pub fn payload(self, body: Vec<u8>) -> Self {
        self.block(BlockTypeV6::Payload, BlockFlagsV6::empty(), body)
    }

    pub fn build(self) -> Vec<u8> {
        let mut out = Vec::new();
        self.primary.render(&mut out);
        let last = self.blocks.len().saturating_sub(1);
        for (i, (t, mut flags, body)) in self.blocks.into_iter().enumerate() {
            flags.set(BlockFlagsV6::IS_LAST_BLOCK, i == last);
            CanonicalBlockV6::render(t, flags, &body, &mut out);
        }
        out
    }
}

/// True when the first byte of a buffer announces a BPv6 bundle.
#[inline]
pub fn looks_like_bpv6(buf: &[u8]) -> bool {
    buf.first().copied() == Some(super::BPV6_VERSION)
}
