// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use dtn_router_rs::{
    models::eid::Eid,
    storage::store::{BundleStorageManager, SEGMENT_SIZE, StorageError},
};
use serial_test::serial;

fn temp_store(name: &str, segments: u32) -> BundleStorageManager {
    let path = std::env::temp_dir().join(format!("dtn-store-test-{name}-{}.bin", std::process::id()));
    BundleStorageManager::open(path, segments).expect("open store")
}

#[test]
#[serial]
fn test_store_get_round_trip_multi_segment() {
    let mut store = temp_store("roundtrip", 64);
    let dest = Eid::new(9, 1);
    // spans three segments
    let data: Vec<u8> = (0..SEGMENT_SIZE * 2 + 100).map(|i| (i % 256) as u8).collect();

    let free_before = store.free_segments();
    store.store(dest, 1, 1000, &data, None).expect("store");
    assert_eq!(free_before - store.free_segments(), 3);

    let retrieved = store.get(&[dest]).expect("get");
    assert_eq!(retrieved.dest, dest);
    assert_eq!(retrieved.priority, 1);
    assert_eq!(retrieved.expiration_second, 1000);
    assert_eq!(retrieved.data, data);
    // chain released back to the free list
    assert_eq!(store.free_segments(), free_before);
    assert!(store.get(&[dest]).is_none());
}

#[test]
#[serial]
fn test_retrieval_order_priority_then_expiration_then_fifo() {
    let mut store = temp_store("order", 64);
    let dest = Eid::new(9, 1);

    store.store(dest, 0, 500, b"bulk-early", None).expect("store");
    store.store(dest, 1, 900, b"normal", None).expect("store");
    store.store(dest, 2, 999, b"expedited", None).expect("store");
    store.store(dest, 0, 100, b"bulk-earliest-a", None).expect("store");
    store.store(dest, 0, 100, b"bulk-earliest-b", None).expect("store");

    let order: Vec<Vec<u8>> = std::iter::from_fn(|| store.get(&[dest]).map(|r| r.data))
        .collect();
    assert_eq!(
        order,
        vec![
            b"expedited".to_vec(),
            b"normal".to_vec(),
            b"bulk-earliest-a".to_vec(), // earliest expiration bucket first
            b"bulk-earliest-b".to_vec(), // fifo within the bucket
            b"bulk-early".to_vec(),
        ]
    );
}

#[test]
#[serial]
fn test_get_respects_available_destinations() {
    let mut store = temp_store("dests", 64);
    let a = Eid::new(1, 1);
    let b = Eid::new(2, 1);
    store.store(a, 1, 10, b"for-a", None).expect("store");
    store.store(b, 1, 10, b"for-b", None).expect("store");

    let got = store.get(&[b]).expect("only b available");
    assert_eq!(got.data, b"for-b");
    assert_eq!(got.dest_index, 0);
    assert!(store.get(&[b]).is_none(), "a's bundle stays put");
    assert!(store.get(&[a, b]).is_some());
}

#[test]
#[serial]
fn test_duplicate_store_is_noop() {
    let mut store = temp_store("dup", 64);
    let dest = Eid::new(9, 1);
    let head = store.store(dest, 1, 10, b"original", None).expect("store");

    let again = store
        .store_if_absent(dest, 1, 10, head, b"redelivery")
        .expect("redeliver");
    assert_eq!(again, head);
    assert_eq!(store.stored_bundle_count(), 1);
    assert_eq!(store.get(&[dest]).expect("get").data, b"original");
}

#[test]
#[serial]
fn test_depleted_storage_reported() {
    let mut store = temp_store("depleted", 16);
    let dest = Eid::new(9, 1);
    let big = vec![0u8; SEGMENT_SIZE * 20];
    match store.store(dest, 1, 10, &big, None) {
        Err(StorageError::DepletedStorage { needed, available }) => {
            assert!(needed > available);
        },
        other => panic!("expected depleted storage, got {other:?}"),
    }
}

#[test]
#[serial]
fn test_expiration_sweep_and_custody_release() {
    let mut store = temp_store("sweep", 64);
    let dest = Eid::new(9, 1);
    store.store(dest, 1, 100, b"expires-early", None).expect("store");
    store.store(dest, 1, 900, b"expires-late", None).expect("store");
    store.store(dest, 1, 900, b"custodial", Some(42)).expect("store");

    assert_eq!(store.drop_expired(500), 1);
    assert_eq!(store.stored_bundle_count(), 2);

    assert_eq!(store.release_by_custody_ids(&[42, 43]), 1);
    assert_eq!(store.stored_bundle_count(), 1);
    assert_eq!(store.get(&[dest]).expect("get").data, b"expires-late");
}
