// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! End-to-end custody flows: signal generation at the accepting node and
//! consumption back at the prior custodian.

use std::collections::HashMap;

use dtn_router_rs::{
    custody::manager::CustodyTransferManager,
    models::{
        bpv6::{
            BlockFlagsV6, BlockTypeV6, BundleFlagsV6,
            admin::{
                ADMIN_RECORD_AGGREGATE_CUSTODY_SIGNAL, ADMIN_RECORD_CUSTODY_SIGNAL,
                AggregateCustodySignal, CustodyReason, CustodySignal, admin_record_type,
            },
            bundle::{BundleBuilderV6, BundleV6},
            canonical::CtebBody,
            primary::PrimaryBlockV6,
        },
        eid::Eid,
    },
    storage::relay::{CustodyKey, extract_acknowledged_custody_ids},
};

fn bundle_in_custody_of(custodian: Eid, custody_id: u64, sequence: u64) -> Vec<u8> {
    BundleBuilderV6::new(PrimaryBlockV6 {
        flags: BundleFlagsV6::SINGLETON | BundleFlagsV6::CUSTODY_REQUESTED,
        destination: Eid::new(50, 1),
        source: Eid::new(2, 1),
        report_to: Eid::NULL,
        custodian,
        creation_seconds: 5000,
        creation_sequence: sequence,
        lifetime_seconds: 3600,
        fragment_offset: 0,
        total_adu_length: 0,
    })
    .block(
        BlockTypeV6::CustodyTransferEnhancement,
        BlockFlagsV6::empty(),
        CtebBody {
            custody_id,
            creator_custodian_eid: custodian.to_string(),
        }
        .render(),
    )
    .payload(b"IN CUSTODY".to_vec())
    .build()
}

#[test]
fn test_rfc5050_signal_round_trip_acknowledges_custody_id() {
    let prior = Eid::new(2, 0);
    let wire = bundle_in_custody_of(prior, 55, 1);
    let mut bundle = BundleV6::parse(&wire).expect("parse");

    // accepting node (non-acs) emits an immediate signal
    let mut accepting = CustodyTransferManager::new(false, 7, 0);
    let outcome = accepting
        .process_custody_of_bundle(&mut bundle, true, CustodyReason::Success, 6000)
        .expect("custody");
    let signal_wire = outcome.custody_signal_bundle.expect("signal bundle");

    // the prior custodian consumes it and matches its own bookkeeping
    let signal_bundle = BundleV6::parse(&signal_wire).expect("parse signal");
    assert_eq!(signal_bundle.primary.destination, prior);
    let payload = signal_bundle.payload().expect("payload");
    assert_eq!(admin_record_type(payload), Some(ADMIN_RECORD_CUSTODY_SIGNAL));

    let signal = CustodySignal::parse(payload).expect("parse record");
    assert!(signal.succeeded);
    assert_eq!(signal.bundle_creation_seconds, 5000);
    assert_eq!(signal.bundle_creation_sequence, 1);
    assert_eq!(signal.bundle_source_eid, "ipn:2.1");
}

#[test]
fn test_acs_flush_emits_one_bundle_per_reason_index() {
    let prior = Eid::new(2, 0);
    let mut mgr = CustodyTransferManager::new(true, 7, 0);

    // three accepted, one refused for depleted storage
    for (custody_id, sequence) in [(11u64, 1u64), (12, 2), (13, 3)] {
        let wire = bundle_in_custody_of(prior, custody_id, sequence);
        let mut bundle = BundleV6::parse(&wire).expect("parse");
        mgr.process_custody_of_bundle(&mut bundle, true, CustodyReason::Success, 6000)
            .expect("custody");
    }
    {
        let wire = bundle_in_custody_of(prior, 99, 4);
        let mut bundle = BundleV6::parse(&wire).expect("parse");
        mgr.process_custody_of_bundle(
            &mut bundle,
            false,
            CustodyReason::DepletedStorage,
            6000,
        )
        .expect("custody");
    }

    let flushed = mgr.flush_all_acs(6001);
    assert_eq!(flushed.len(), 2, "one acs bundle per non-empty reason index");

    let mut success_ids = None;
    let mut refused_ids = None;
    for wire in &flushed {
        let bundle = BundleV6::parse(wire).expect("parse acs bundle");
        assert_eq!(bundle.primary.destination, prior);
        let payload = bundle.payload().expect("payload");
        assert_eq!(
            admin_record_type(payload),
            Some(ADMIN_RECORD_AGGREGATE_CUSTODY_SIGNAL)
        );
        let acs = AggregateCustodySignal::parse(payload).expect("parse record");
        if acs.succeeded {
            success_ids = Some(acs.custody_ids);
        } else {
            assert_eq!(acs.reason, CustodyReason::DepletedStorage);
            refused_ids = Some(acs.custody_ids);
        }
    }
    assert_eq!(success_ids.expect("success acs"), vec![11, 12, 13]);
    assert_eq!(refused_ids.expect("refusal acs"), vec![99]);

    // everything flushed; a second flush is empty
    assert!(mgr.flush_all_acs(6002).is_empty());
}

#[test]
fn test_stale_cteb_falls_back_to_rfc5050_signal() {
    // cteb creator names a node that is no longer the custodian: the
    // aggregate path cannot be trusted and a single signal is emitted
    let prior = Eid::new(2, 0);
    let wire = BundleBuilderV6::new(PrimaryBlockV6 {
        flags: BundleFlagsV6::SINGLETON | BundleFlagsV6::CUSTODY_REQUESTED,
        destination: Eid::new(50, 1),
        source: Eid::new(2, 1),
        report_to: Eid::NULL,
        custodian: prior,
        creation_seconds: 5000,
        creation_sequence: 1,
        lifetime_seconds: 3600,
        fragment_offset: 0,
        total_adu_length: 0,
    })
    .block(
        BlockTypeV6::CustodyTransferEnhancement,
        BlockFlagsV6::empty(),
        CtebBody {
            custody_id: 31,
            creator_custodian_eid: "ipn:9.0".to_string(), // not the custodian
        }
        .render(),
    )
    .payload(b"X".to_vec())
    .build();

    let mut bundle = BundleV6::parse(&wire).expect("parse");
    let mut mgr = CustodyTransferManager::new(true, 7, 0);
    let outcome = mgr
        .process_custody_of_bundle(&mut bundle, true, CustodyReason::Success, 6000)
        .expect("custody");
    assert!(outcome.custody_signal_bundle.is_some(), "immediate signal");
    assert_eq!(mgr.pending_acs_len(CustodyReason::Success), 0);
}

#[test]
fn test_incoming_acs_yields_ids_for_release() {
    // node 7 previously took custody of ids 11..=13; the downstream node
    // aggregates its acceptance into one acs bundle addressed to ipn:7.0
    let custody_eid = Eid::new(7, 0);
    let mut downstream = CustodyTransferManager::new(true, 50, 0);

    for custody_id in [11u64, 12, 13] {
        let wire = bundle_in_custody_of(custody_eid, custody_id, custody_id);
        let mut bundle = BundleV6::parse(&wire).expect("parse");
        downstream
            .process_custody_of_bundle(&mut bundle, true, CustodyReason::Success, 9000)
            .expect("custody");
    }
    let acs_wire = downstream
        .generate_acs_bundle(CustodyReason::Success, 9001)
        .expect("acs");

    let ids = extract_acknowledged_custody_ids(&acs_wire, custody_eid, &HashMap::new())
        .expect("acs consumed");
    assert_eq!(ids, vec![11, 12, 13]);

    // the same bundle is not an acknowledgement for anyone else
    assert!(
        extract_acknowledged_custody_ids(&acs_wire, Eid::new(8, 0), &HashMap::new())
            .is_none()
    );
}

#[test]
fn test_incoming_rfc5050_signal_resolves_via_bundle_key() {
    // a non-acs downstream names the bundle, not the custody id; the
    // relay's bookkeeping maps it back
    let custody_eid = Eid::new(7, 0);
    let wire = bundle_in_custody_of(custody_eid, 21, 5);
    let mut bundle = BundleV6::parse(&wire).expect("parse");

    let mut downstream = CustodyTransferManager::new(false, 50, 0);
    let outcome = downstream
        .process_custody_of_bundle(&mut bundle, true, CustodyReason::Success, 9000)
        .expect("custody");
    let signal_wire = outcome.custody_signal_bundle.expect("signal");

    let mut ids_by_bundle = HashMap::new();
    ids_by_bundle.insert(
        CustodyKey {
            source_eid: "ipn:2.1".to_string(),
            creation_seconds: 5000,
            creation_sequence: 5,
        },
        21u64,
    );

    let ids = extract_acknowledged_custody_ids(&signal_wire, custody_eid, &ids_by_bundle)
        .expect("signal consumed");
    assert_eq!(ids, vec![21]);

    // unknown bundle identity: consumed upstream decides, nothing matches
    assert_eq!(
        extract_acknowledged_custody_ids(&signal_wire, custody_eid, &HashMap::new()),
        None
    );
}

#[test]
fn test_incoming_refusal_releases_nothing() {
    let custody_eid = Eid::new(7, 0);
    let wire = bundle_in_custody_of(custody_eid, 31, 6);
    let mut bundle = BundleV6::parse(&wire).expect("parse");

    let mut downstream = CustodyTransferManager::new(false, 50, 0);
    let outcome = downstream
        .process_custody_of_bundle(
            &mut bundle,
            false,
            CustodyReason::DepletedStorage,
            9000,
        )
        .expect("custody");
    let refusal_wire = outcome.custody_signal_bundle.expect("signal");

    let ids = extract_acknowledged_custody_ids(&refusal_wire, custody_eid, &HashMap::new())
        .expect("refusal is still consumed");
    assert!(ids.is_empty(), "a refusal must not release anything");
}

#[test]
fn test_non_admin_bundle_is_not_an_acknowledgement() {
    let custody_eid = Eid::new(7, 0);
    let wire = bundle_in_custody_of(Eid::new(2, 0), 1, 1);
    assert!(
        extract_acknowledged_custody_ids(&wire, custody_eid, &HashMap::new()).is_none()
    );
}
