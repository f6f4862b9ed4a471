// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use dtn_router_rs::models::{
    bpv6::{
        BlockFlagsV6, BlockTypeV6, BundleFlagsV6,
        bundle::{BundleBuilderV6, BundleV6, looks_like_bpv6},
        canonical::CtebBody,
        primary::PrimaryBlockV6,
    },
    eid::Eid,
    sdnv,
};
use hex_literal::hex;

fn sample_primary() -> PrimaryBlockV6 {
    PrimaryBlockV6 {
        flags: BundleFlagsV6::SINGLETON | BundleFlagsV6::NO_FRAGMENT,
        destination: Eid::new(10, 1),
        source: Eid::new(2, 1),
        report_to: Eid::NULL,
        custodian: Eid::new(2, 0),
        creation_seconds: 700_000_123,
        creation_sequence: 9,
        lifetime_seconds: 86_400,
        fragment_offset: 0,
        total_adu_length: 0,
    }
}

#[test]
fn test_parse_render_is_identity_when_unmodified() -> Result<()> {
    let wire = BundleBuilderV6::new(sample_primary())
        .block(
            BlockTypeV6::CustodyTransferEnhancement,
            BlockFlagsV6::empty(),
            CtebBody {
                custody_id: 77,
                creator_custodian_eid: "ipn:2.0".to_string(),
            }
            .render(),
        )
        .payload(b"hello dtn".to_vec())
        .build();

    assert!(looks_like_bpv6(&wire));
    let bundle = BundleV6::parse(&wire)?;
    assert_eq!(bundle.render(), wire);

    // parse ∘ render ∘ parse is a fixed point
    let rendered = bundle.render();
    let again = BundleV6::parse(&rendered)?;
    assert_eq!(again.primary, bundle.primary);
    assert_eq!(again.render(), rendered);
    Ok(())
}

#[test]
fn test_cbhe_eids_survive_round_trip() -> Result<()> {
    let mut primary = sample_primary();
    primary.destination = Eid::new(u64::from(u32::MAX) + 17, 130);
    primary.custodian = Eid::NULL;
    let mut wire = Vec::new();
    primary.render(&mut wire);
    let (parsed, _) = PrimaryBlockV6::parse(&wire)?;
    assert_eq!(parsed.destination, primary.destination);
    assert!(parsed.custodian.is_null());
    Ok(())
}

#[test]
fn test_priority_bits() {
    let expedited = BundleFlagsV6::SINGLETON.with_priority(2);
    assert_eq!(expedited.priority(), 2);
    assert_eq!(BundleFlagsV6::empty().priority(), 0);
    assert_eq!(BundleFlagsV6::empty().with_priority(1).priority(), 1);
}

#[test]
fn test_truncated_bundle_is_malformed() {
    let wire = BundleBuilderV6::new(sample_primary())
        .payload(b"xyz".to_vec())
        .build();
    for cut in [1, wire.len() / 2, wire.len() - 1] {
        assert!(
            BundleV6::parse(&wire[..cut]).is_err(),
            "cut at {cut} must fail"
        );
    }
}

#[test]
fn test_missing_last_block_flag_rejected() {
    // a single payload block whose last-block flag is cleared by hand
    let wire = BundleBuilderV6::new(sample_primary())
        .payload(b"p".to_vec())
        .build();
    let mut broken = wire.clone();
    // block header: type byte, then sdnv flags (single octet here)
    let block_start = wire.len() - 1 /* body */ - 1 /* len sdnv */ - 1 /* flags */ - 1;
    broken[block_start + 1] = 0; // clear IS_LAST_BLOCK
    assert!(BundleV6::parse(&broken).is_err());
}

#[test]
fn test_sdnv_wire_compat() {
    // 0x0a0b: a canonical two-octet sdnv from the rfc examples
    let mut out = Vec::new();
    sdnv::encode(0x0a0b, &mut out);
    assert_eq!(out, hex!("94 0b"));
}
