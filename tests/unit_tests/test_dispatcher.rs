// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Ingress dispatcher scenarios: classification, rewrites, hop-limit
//! enforcement, echo reflection, and both backpressure paths.

use std::sync::Arc;

use bytes::Bytes;
use dtn_router_rs::{
    ingress::dispatcher::{
        DispatchError, Disposition, IngressConfig, IngressDispatcher,
    },
    models::{
        bpv6::{
            BundleFlagsV6,
            bundle::{BundleBuilderV6, BundleV6},
            primary::PrimaryBlockV6,
        },
        bpv7::{
            BlockFlagsV7, BlockTypeV7, CrcType,
            bundle::{BundleBuilderV7, BundleV7},
            canonical::{CanonicalBlockV7, HopCount, decode_previous_node},
            primary::PrimaryBlockV7,
        },
        eid::Eid,
        fabric::{EgressAckHdr, LinkEventHdr, ToEgressHdr, ToStorageHdr},
        padded::PaddedBytes,
    },
};
use tokio::{
    sync::mpsc,
    time::{Duration, sleep},
};

const NODE: u64 = 10;
const ECHO_SERVICE: u64 = 2047;

fn make_dispatcher(
    max_messages_per_path: usize,
    wait_ms: u64,
    cut_through_only: bool,
) -> (
    Arc<IngressDispatcher>,
    mpsc::Receiver<(ToEgressHdr, Bytes)>,
    mpsc::Receiver<(ToStorageHdr, Bytes)>,
) {
    let dispatcher = Arc::new(IngressDispatcher::new(IngressConfig {
        my_node_id: NODE,
        my_custodial_service_id: 0,
        my_bp_echo_service_id: ECHO_SERVICE,
        max_bundle_size_bytes: 1 << 20,
        max_messages_per_path,
        max_ingress_wait_on_egress: Duration::from_millis(wait_ms),
        is_cut_through_only_test: cut_through_only,
    }));
    let (to_egress_tx, to_egress_rx) = mpsc::channel(64);
    let (to_storage_tx, to_storage_rx) = mpsc::channel(64);
    dispatcher.bind_channels(to_egress_tx, to_storage_tx);
    (dispatcher, to_egress_rx, to_storage_rx)
}

fn bpv6_bundle(dest: Eid, source: Eid, flags: BundleFlagsV6, payload: &[u8]) -> Vec<u8> {
    BundleBuilderV6::new(PrimaryBlockV6 {
        flags,
        destination: dest,
        source,
        report_to: Eid::NULL,
        custodian: Eid::NULL,
        creation_seconds: 1000,
        creation_sequence: 0,
        lifetime_seconds: 3600,
        fragment_offset: 0,
        total_adu_length: 0,
    })
    .payload(payload.to_vec())
    .build()
}

fn bpv7_bundle_with_hops(dest: Eid, limit: u64, count: u64) -> Vec<u8> {
    BundleBuilderV7::new(PrimaryBlockV7 {
        crc_type: CrcType::Crc32c,
        destination: dest,
        source: Eid::new(2, 1),
        report_to: Eid::NULL,
        creation_millis: 1_000_000,
        creation_sequence: 0,
        lifetime_millis: 3_600_000,
        ..Default::default()
    })
    .block(CanonicalBlockV7 {
        block_type: BlockTypeV7::HopCount,
        block_number: 2,
        flags: BlockFlagsV7::REMOVE_BLOCK_IF_UNPROCESSABLE,
        crc_type: CrcType::Crc32c,
        data: HopCount { limit, count }.encode(),
    })
    .payload(b"DATA".to_vec(), CrcType::Crc32c)
    .build()
}

fn link_up(dispatcher: &IngressDispatcher, dest: Eid) {
    dispatcher.handle_link_event(&LinkEventHdr::link_up(dest, dest));
}

#[tokio::test]
async fn test_unreachable_destination_goes_to_storage() {
    let (dispatcher, _egress, mut storage) = make_dispatcher(8, 0, false);
    let wire = bpv6_bundle(
        Eid::new(42, 1),
        Eid::new(2, 1),
        BundleFlagsV6::SINGLETON,
        b"x",
    );
    let disposition = dispatcher
        .process_bundle(PaddedBytes::from_bundle(&wire), true)
        .await
        .expect("dispatch");
    assert_eq!(disposition, Disposition::Storage);
    let (hdr, bundle) = storage.recv().await.expect("storage message");
    assert_eq!(hdr.ingress_unique_id, 0);
    assert_eq!(bundle.as_ref(), wire.as_slice());
}

#[tokio::test]
async fn test_reachable_destination_cuts_through() {
    let (dispatcher, mut egress, _storage) = make_dispatcher(8, 0, false);
    let dest = Eid::new(42, 1);
    link_up(&dispatcher, dest);

    let wire = bpv6_bundle(dest, Eid::new(2, 1), BundleFlagsV6::SINGLETON, b"x");
    let disposition = dispatcher
        .process_bundle(PaddedBytes::from_bundle(&wire), true)
        .await
        .expect("dispatch");
    assert_eq!(disposition, Disposition::CutThrough);

    let (hdr, bundle) = egress.recv().await.expect("egress message");
    assert_eq!(hdr.final_dest_eid, dest);
    assert_eq!(hdr.is_cut_through_from_ingress, 1);
    assert_eq!(bundle.as_ref(), wire.as_slice());
    // the unique id is outstanding until the egress ack arrives
    assert_eq!(dispatcher.egress_queue_depth(dest), 1);
    dispatcher
        .handle_egress_ack(&EgressAckHdr::new(dest, hdr.custody_id))
        .expect("ack matches head");
    assert_eq!(dispatcher.egress_queue_depth(dest), 0);
}

#[tokio::test]
async fn test_custody_request_goes_to_storage_even_when_link_up() {
    let (dispatcher, _egress, mut storage) = make_dispatcher(8, 0, false);
    let dest = Eid::new(42, 1);
    link_up(&dispatcher, dest);

    let wire = bpv6_bundle(
        dest,
        Eid::new(2, 1),
        BundleFlagsV6::SINGLETON | BundleFlagsV6::CUSTODY_REQUESTED,
        b"x",
    );
    let disposition = dispatcher
        .process_bundle(PaddedBytes::from_bundle(&wire), true)
        .await
        .expect("dispatch");
    assert_eq!(disposition, Disposition::Storage);
    assert!(storage.recv().await.is_some());
}

#[tokio::test]
async fn test_admin_record_for_this_node_goes_to_storage() {
    let (dispatcher, _egress, mut storage) = make_dispatcher(8, 0, false);
    let custody_eid = Eid::new(NODE, 0);
    link_up(&dispatcher, custody_eid);

    let wire = bpv6_bundle(
        custody_eid,
        Eid::new(2, 0),
        BundleFlagsV6::SINGLETON | BundleFlagsV6::ADMIN_RECORD,
        &[0x20], // empty custody-signal-ish admin payload
    );
    let disposition = dispatcher
        .process_bundle(PaddedBytes::from_bundle(&wire), true)
        .await
        .expect("dispatch");
    assert_eq!(disposition, Disposition::Storage);
    assert!(storage.recv().await.is_some());
}

#[tokio::test]
async fn test_echo_bundle_reflected_with_swapped_eids() {
    let (dispatcher, _egress, mut storage) = make_dispatcher(8, 0, false);
    let origin = Eid::new(3, 9);
    let echo = Eid::new(NODE, ECHO_SERVICE);

    let wire = bpv6_bundle(echo, origin, BundleFlagsV6::empty(), b"PING");
    let disposition = dispatcher
        .process_bundle(PaddedBytes::from_bundle(&wire), true)
        .await
        .expect("dispatch");
    // reflected toward the (unreachable) origin
    assert_eq!(disposition, Disposition::Storage);

    let (_, bundle) = storage.recv().await.expect("storage message");
    let reflected = BundleV6::parse(&bundle).expect("parse");
    assert_eq!(reflected.primary.destination, origin);
    assert_eq!(reflected.primary.source, echo);
    assert_eq!(reflected.payload().expect("payload"), b"PING");
}

#[tokio::test]
async fn test_hop_count_incremented_within_limit() {
    let (dispatcher, _egress, mut storage) = make_dispatcher(8, 0, false);
    let dest = Eid::new(42, 1);

    let wire = bpv7_bundle_with_hops(dest, 10, 9);
    let disposition = dispatcher
        .process_bundle(PaddedBytes::from_bundle(&wire), true)
        .await
        .expect("dispatch");
    assert_eq!(disposition, Disposition::Storage);

    let (_, bundle) = storage.recv().await.expect("storage message");
    let forwarded = BundleV7::parse(&bundle, false).expect("parse");

    let hop_view = forwarded
        .blocks
        .iter()
        .find(|b| b.block.block_type == BlockTypeV7::HopCount)
        .expect("hop count survives");
    assert_eq!(HopCount::decode(&hop_view.block.data).expect("decode").count, 10);

    // previous-node prepended, naming this node
    let prev_view = forwarded
        .blocks
        .iter()
        .find(|b| b.block.block_type == BlockTypeV7::PreviousNode)
        .expect("previous node present");
    assert_eq!(
        decode_previous_node(&prev_view.block.data).expect("decode"),
        Eid::new(NODE, 0)
    );
}

#[tokio::test]
async fn test_hop_limit_exceeded_drops() {
    let (dispatcher, _egress, _storage) = make_dispatcher(8, 0, false);
    let wire = bpv7_bundle_with_hops(Eid::new(42, 1), 10, 10);
    let err = dispatcher
        .process_bundle(PaddedBytes::from_bundle(&wire), true)
        .await
        .expect_err("must drop");
    assert!(matches!(err, DispatchError::HopLimitExceeded { hop_count: 11, .. }));
}

#[tokio::test]
async fn test_previous_node_rewritten_not_duplicated() {
    let (dispatcher, _egress, mut storage) = make_dispatcher(8, 0, false);
    let dest = Eid::new(42, 1);

    // bundle already carrying a previous-node block from the prior hop
    let wire = BundleBuilderV7::new(PrimaryBlockV7 {
        crc_type: CrcType::Crc32c,
        destination: dest,
        source: Eid::new(2, 1),
        report_to: Eid::NULL,
        creation_millis: 1,
        creation_sequence: 0,
        lifetime_millis: 1000,
        ..Default::default()
    })
    .block(CanonicalBlockV7 {
        block_type: BlockTypeV7::PreviousNode,
        block_number: 2,
        flags: BlockFlagsV7::REMOVE_BLOCK_IF_UNPROCESSABLE,
        crc_type: CrcType::None,
        data: dtn_router_rs::models::bpv7::canonical::encode_previous_node(&Eid::new(
            5, 0,
        )),
    })
    .payload(b"x".to_vec(), CrcType::Crc32c)
    .build();

    dispatcher
        .process_bundle(PaddedBytes::from_bundle(&wire), true)
        .await
        .expect("dispatch");
    let (_, bundle) = storage.recv().await.expect("storage message");
    let forwarded = BundleV7::parse(&bundle, false).expect("parse");

    let prev_blocks: Vec<_> = forwarded
        .blocks
        .iter()
        .filter(|b| b.block.block_type == BlockTypeV7::PreviousNode)
        .collect();
    assert_eq!(prev_blocks.len(), 1, "rewritten in place, not duplicated");
    assert_eq!(
        decode_previous_node(&prev_blocks[0].block.data).expect("decode"),
        Eid::new(NODE, 0)
    );
}

#[tokio::test]
async fn test_unsupported_version_and_oversize_rejected() {
    let (dispatcher, _egress, _storage) = make_dispatcher(8, 0, false);

    let err = dispatcher
        .process_bundle(PaddedBytes::from_bundle(&[0x42, 0, 0]), true)
        .await
        .expect_err("bad version");
    assert!(matches!(err, DispatchError::UnsupportedVersion(0x42)));

    let (dispatcher, _egress, _storage) = {
        let d = IngressDispatcher::new(IngressConfig {
            my_node_id: NODE,
            my_custodial_service_id: 0,
            my_bp_echo_service_id: ECHO_SERVICE,
            max_bundle_size_bytes: 16,
            max_messages_per_path: 8,
            max_ingress_wait_on_egress: Duration::ZERO,
            is_cut_through_only_test: false,
        });
        let (tx_e, rx_e) = mpsc::channel(4);
        let (tx_s, rx_s) = mpsc::channel(4);
        d.bind_channels(tx_e, tx_s);
        (d, rx_e, rx_s)
    };
    let err = dispatcher
        .process_bundle(PaddedBytes::from_bundle(&[6u8; 64]), true)
        .await
        .expect_err("oversize");
    assert!(matches!(err, DispatchError::OversizedBundle { size: 64, max: 16 }));
}

#[tokio::test(start_paused = true)]
async fn test_backpressure_zero_wait_falls_to_storage() {
    let (dispatcher, _egress, mut storage) = make_dispatcher(3, 0, false);
    let dest = Eid::new(42, 1);
    link_up(&dispatcher, dest);
    // fill the queue one past the depth bound
    dispatcher.seed_egress_queue(dest, &[100, 101, 102, 103]);

    let wire = bpv6_bundle(dest, Eid::new(2, 1), BundleFlagsV6::SINGLETON, b"x");
    let disposition = dispatcher
        .process_bundle(PaddedBytes::from_bundle(&wire), true)
        .await
        .expect("dispatch");
    assert_eq!(disposition, Disposition::Storage);
    assert!(storage.recv().await.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_backpressure_drained_queue_takes_cut_through() {
    let (dispatcher, mut egress, _storage) = make_dispatcher(3, 2000, false);
    let dest = Eid::new(42, 1);
    link_up(&dispatcher, dest);
    dispatcher.seed_egress_queue(dest, &[100, 101, 102, 103]);

    // a drain arrives after 500 ms, inside the 2000 ms bound
    let drainer = Arc::clone(&dispatcher);
    tokio::spawn(async move {
        sleep(Duration::from_millis(500)).await;
        drainer.drain_one_egress_ack(dest);
        drainer.drain_one_egress_ack(dest);
    });

    let wire = bpv6_bundle(dest, Eid::new(2, 1), BundleFlagsV6::SINGLETON, b"x");
    let disposition = dispatcher
        .process_bundle(PaddedBytes::from_bundle(&wire), true)
        .await
        .expect("dispatch");
    assert_eq!(disposition, Disposition::CutThrough);
    assert!(egress.recv().await.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_cut_through_only_mode_drops_on_timeout() {
    let (dispatcher, _egress, _storage) = make_dispatcher(3, 100, true);
    let dest = Eid::new(42, 1);
    dispatcher.seed_egress_queue(dest, &[100, 101, 102, 103]);

    let wire = bpv6_bundle(dest, Eid::new(2, 1), BundleFlagsV6::SINGLETON, b"x");
    let err = dispatcher
        .process_bundle(PaddedBytes::from_bundle(&wire), true)
        .await
        .expect_err("must drop");
    assert!(matches!(err, DispatchError::BackpressureTimeout { path: "egress" }));
}

#[tokio::test]
async fn test_out_of_order_egress_ack_is_fatal_and_drains_queue() {
    let (dispatcher, _egress, _storage) = make_dispatcher(8, 0, false);
    let dest = Eid::new(42, 1);
    dispatcher.seed_egress_queue(dest, &[7, 8, 9]);

    let err = dispatcher
        .handle_egress_ack(&EgressAckHdr::new(dest, 8))
        .expect_err("mismatch is fatal per link");
    assert!(matches!(err, DispatchError::AckMismatch { unique_id: 8, .. }));
    assert_eq!(dispatcher.egress_queue_depth(dest), 0, "queue drained");
}

#[tokio::test]
async fn test_link_down_reroutes_to_storage() {
    let (dispatcher, mut egress, mut storage) = make_dispatcher(8, 0, false);
    let dest = Eid::new(42, 1);
    link_up(&dispatcher, dest);
    assert!(dispatcher.is_reachable(dest));

    let wire = bpv6_bundle(dest, Eid::new(2, 1), BundleFlagsV6::SINGLETON, b"a");
    assert_eq!(
        dispatcher
            .process_bundle(PaddedBytes::from_bundle(&wire), true)
            .await
            .expect("dispatch"),
        Disposition::CutThrough
    );
    let _ = egress.recv().await;

    dispatcher.handle_link_event(&LinkEventHdr::link_down(dest, dest));
    assert!(!dispatcher.is_reachable(dest));
    assert_eq!(
        dispatcher
            .process_bundle(PaddedBytes::from_bundle(&wire), true)
            .await
            .expect("dispatch"),
        Disposition::Storage
    );
    assert!(storage.recv().await.is_some());
}
