// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use dtn_router_rs::models::{
    bpv7::{
        BlockFlagsV7, BlockTypeV7, BundleFlagsV7, CrcType,
        bundle::{BundleBuilderV7, BundleV7, looks_like_bpv7},
        canonical::{CanonicalBlockV7, HopCount, decode_previous_node, encode_previous_node},
        primary::PrimaryBlockV7,
    },
    eid::Eid,
    padded::PaddedBytes,
};

fn sample_primary(crc_type: CrcType) -> PrimaryBlockV7 {
    PrimaryBlockV7 {
        flags: BundleFlagsV7::NO_FRAGMENT,
        crc_type,
        destination: Eid::new(10, 1),
        source: Eid::new(2, 1),
        report_to: Eid::NULL,
        creation_millis: 700_000_123_000,
        creation_sequence: 4,
        lifetime_millis: 86_400_000,
        fragment_offset: None,
        total_adu_length: None,
    }
}

fn sample_bundle(crc_type: CrcType) -> Vec<u8> {
    BundleBuilderV7::new(sample_primary(crc_type))
        .block(CanonicalBlockV7 {
            block_type: BlockTypeV7::HopCount,
            block_number: 2,
            flags: BlockFlagsV7::REMOVE_BLOCK_IF_UNPROCESSABLE,
            crc_type,
            data: HopCount { limit: 10, count: 4 }.encode(),
        })
        .payload(b"seven bytes".to_vec(), crc_type)
        .build()
}

#[test]
fn test_parse_render_is_identity_when_unmodified() -> Result<()> {
    for crc_type in [CrcType::None, CrcType::Crc16, CrcType::Crc32c] {
        let wire = sample_bundle(crc_type);
        assert!(looks_like_bpv7(&wire));
        let bundle = BundleV7::parse(&wire, false)?;
        assert_eq!(bundle.render(), wire, "{crc_type:?}");
    }
    Ok(())
}

#[test]
fn test_payload_block_number_enforced() {
    let wire = BundleBuilderV7::new(sample_primary(CrcType::None))
        .block(CanonicalBlockV7 {
            block_type: BlockTypeV7::Payload,
            block_number: 3,
            flags: BlockFlagsV7::empty(),
            crc_type: CrcType::None,
            data: b"x".to_vec(),
        })
        .build();
    assert!(BundleV7::parse(&wire, false).is_err());
}

#[test]
fn test_canonical_crc_corruption_detected_unless_skipped() -> Result<()> {
    let wire = sample_bundle(CrcType::Crc32c);
    let bundle = BundleV7::parse(&wire, false)?;
    let payload = bundle.payload().expect("payload").to_vec();
    drop(bundle);

    // flip one payload byte; the canonical crc no longer matches
    let mut corrupted = wire.clone();
    let pos = corrupted
        .windows(payload.len())
        .position(|w| w == payload)
        .expect("payload bytes present");
    corrupted[pos] ^= 0x01;

    assert!(BundleV7::parse(&corrupted, false).is_err());
    assert!(BundleV7::parse(&corrupted, true).is_ok());
    Ok(())
}

#[test]
fn test_previous_node_rewrite_in_padded_buffer() -> Result<()> {
    let wire = sample_bundle(CrcType::Crc32c);
    let mut padded = PaddedBytes::from_bundle(&wire);

    let rendered = {
        let mut bundle = BundleV7::parse(padded.as_slice(), false)?;
        let number = bundle.next_free_block_number();
        bundle.prepend_block(CanonicalBlockV7 {
            block_type: BlockTypeV7::PreviousNode,
            block_number: number,
            flags: BlockFlagsV7::REMOVE_BLOCK_IF_UNPROCESSABLE,
            crc_type: CrcType::None,
            data: encode_previous_node(&Eid::new(99, 0)),
        });
        bundle.render()
    };
    if !padded.replace_in_place(&rendered) {
        padded = PaddedBytes::from_bundle(&rendered);
    }

    let reparsed = BundleV7::parse(padded.as_slice(), false)?;
    assert_eq!(reparsed.blocks[0].block.block_type, BlockTypeV7::PreviousNode);
    assert_eq!(
        decode_previous_node(&reparsed.blocks[0].block.data)?,
        Eid::new(99, 0)
    );
    assert_eq!(reparsed.payload().expect("payload"), b"seven bytes");
    Ok(())
}

#[test]
fn test_hop_count_mutation_renders_fresh_crc() -> Result<()> {
    let wire = sample_bundle(CrcType::Crc32c);
    let rendered = {
        let mut bundle = BundleV7::parse(&wire, false)?;
        for view in bundle.blocks_by_type(BlockTypeV7::HopCount) {
            let mut hop = HopCount::decode(&view.block.data)?;
            hop.count += 1;
            view.block.data = hop.encode();
            view.set_manually_modified();
        }
        bundle.render()
    };
    // the re-encoded block must still verify
    let reparsed = BundleV7::parse(&rendered, false)?;
    let hop_view = reparsed
        .blocks
        .iter()
        .find(|b| b.block.block_type == BlockTypeV7::HopCount)
        .expect("hop count block");
    assert_eq!(HopCount::decode(&hop_view.block.data)?.count, 5);
    Ok(())
}
