// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Storage relay: consumes `(ToStorageHdr, bundle)` messages from ingress,
//! files each bundle under `(destination, priority, expiration)`, and
//! returns the ordered `StorageAckHdr` acks.
//!
//! Custody transfer lives here too: a BPv6 bundle requesting custody is
//! accepted (or refused for depleted storage) before it is filed, the
//! rewritten bundle is stored under its fresh custody id, and the signal
//! toward the previous custodian re-enters the router through ingress.
//! Admin-record bundles addressed to this node's custodial endpoint are
//! not stored at all; they acknowledge custody ids and release the matching
//! bundles from disk.  A periodic sweep drops expired bundles and flushes
//! pending aggregate signals.

use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use tokio::{select, sync::mpsc, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    custody::manager::CustodyTransferManager,
    ingress::dispatcher::IngressDispatcher,
    models::{
        bpv6::{
            self,
            admin::{
                ADMIN_RECORD_AGGREGATE_CUSTODY_SIGNAL, ADMIN_RECORD_CUSTODY_SIGNAL,
                AggregateCustodySignal, CustodyReason, CustodySignal, admin_record_type,
            },
            bundle::BundleV6,
        },
        bpv7::{self, bundle::BundleV7},
        eid::Eid,
        error::CodecError,
        fabric::{MsgType, StorageAckHdr, ToStorageHdr},
        padded::PaddedBytes,
    },
    storage::store::BundleStorageManager,
};

/// Index coordinates extracted from a bundle's primary block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageCoords {
    pub dest: Eid,
    pub priority: u8,
    pub expiration_second: u64,
}

/// Reads just enough of either bundle version to file it.
pub fn storage_coords(bundle: &[u8]) -> Result<StorageCoords, CodecError> {
    match bundle.first().copied() {
        Some(bpv6::BPV6_VERSION) => {
            let bv = BundleV6::parse(bundle)?;
            Ok(StorageCoords {
                dest: bv.primary.destination,
                priority: bv.primary.flags.priority(),
                expiration_second: bv.primary.creation_seconds
                    + bv.primary.lifetime_seconds,
            })
        },
        Some(bpv7::BPV7_FIRST_BYTE) => {
            let bv = BundleV7::parse(bundle, true)?;
            Ok(StorageCoords {
                dest: bv.primary.destination,
                // bpv7 carries no class of service; everything files under
                // the middle priority bucket
                priority: 1,
                expiration_second: (bv.primary.creation_millis
                    + bv.primary.lifetime_millis)
                    / 1000,
            })
        },
        other => Err(CodecError::UnsupportedVersion(other.unwrap_or(0))),
    }
}

/// Identity of a stored bundle the way RFC 5050 custody signals name it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CustodyKey {
    pub source_eid: String,
    pub creation_seconds: u64,
    pub creation_sequence: u64,
}

/// Custody ids acknowledged by one locally-addressed admin-record bundle.
///
/// `None` means the bundle is not a custody acknowledgement for this node
/// and should be handled normally.  `Some(empty)` is a consumed refusal:
/// nothing gets released, but the bundle must not be stored either.
pub fn extract_acknowledged_custody_ids(
    bundle: &[u8],
    custody_eid: Eid,
    ids_by_bundle: &HashMap<CustodyKey, u64>,
) -> Option<Vec<u64>> {
    if !bpv6::bundle::looks_like_bpv6(bundle) {
        return None;
    }
    let bv = BundleV6::parse(bundle).ok()?;
    if !bv.primary.is_admin_record() || bv.primary.destination != custody_eid {
        return None;
    }
    let payload = bv.payload()?;
    match admin_record_type(payload) {
        Some(ADMIN_RECORD_AGGREGATE_CUSTODY_SIGNAL) => {
            let acs = AggregateCustodySignal::parse(payload).ok()?;
            if acs.succeeded {
                Some(acs.custody_ids)
            } else {
                Some(Vec::new())
            }
        },
        Some(ADMIN_RECORD_CUSTODY_SIGNAL) => {
            let signal = CustodySignal::parse(payload).ok()?;
            if !signal.succeeded {
                return Some(Vec::new());
            }
            // a plain rfc5050 signal names the bundle, not the custody id;
            // the relay's bookkeeping bridges the two
            let key = CustodyKey {
                source_eid: signal.bundle_source_eid,
                creation_seconds: signal.bundle_creation_seconds,
                creation_sequence: signal.bundle_creation_sequence,
            };
            ids_by_bundle.get(&key).map(|&id| vec![id])
        },
        _ => None,
    }
}

/// Outcome of the custody decision for one bundle entering storage.
enum CustodyAction {
    NotRequested,
    Accepted {
        rewritten: Vec<u8>,
        custody_id: u64,
        key: CustodyKey,
    },
    Refused,
}

pub struct StorageRelay {
    manager: BundleStorageManager,
    custody: CustodyTransferManager,
    custody_eid: Eid,
    /// custody id per stored bundle identity, consulted when a plain
    /// rfc5050 signal (no custody id on the wire) comes back.
    custody_ids_by_bundle: HashMap<CustodyKey, u64>,
    dispatcher: Arc<IngressDispatcher>,
    bundle_rx: mpsc::Receiver<(ToStorageHdr, Bytes)>,
    ack_tx: mpsc::Sender<StorageAckHdr>,
    cancel: CancellationToken,
}

impl StorageRelay {
    pub fn new(
        manager: BundleStorageManager,
        custody: CustodyTransferManager,
        dispatcher: Arc<IngressDispatcher>,
        bundle_rx: mpsc::Receiver<(ToStorageHdr, Bytes)>,
        ack_tx: mpsc::Sender<StorageAckHdr>,
        cancel: CancellationToken,
    ) -> Self {
        let custody_eid = custody.my_custodian_eid();
        Self {
            manager,
            custody,
            custody_eid,
            custody_ids_by_bundle: HashMap::new(),
            dispatcher,
            bundle_rx,
            ack_tx,
            cancel,
        }
    }

    pub async fn run(mut self) {
        let mut sweep = time::interval(time::Duration::from_secs(1));
        info!("storage relay running");
        loop {
            select! {
                _ = self.cancel.cancelled() => break,
                msg = self.bundle_rx.recv() => {
                    match msg {
                        Some((hdr, bundle)) => self.handle_message(hdr, &bundle).await,
                        None => break,
                    }
                },
                _ = sweep.tick() => {
                    let now = now_seconds();
                    let dropped = self.manager.drop_expired(now);
                    if dropped > 0 {
                        debug!(dropped, "expired bundles swept");
                    }
                    // one-second aggregation window: whatever accumulated
                    // since the last tick goes out as acs bundles
                    for acs_bundle in self.custody.flush_all_acs(now) {
                        self.reinject(acs_bundle);
                    }
                },
            }
        }
        info!(
            stored = self.manager.stored_bundle_count(),
            "storage relay stopping"
        );
    }

    async fn handle_message(&mut self, hdr: ToStorageHdr, bundle: &[u8]) {
        match hdr.base.msg_type() {
            Some(MsgType::Store) => {},
            Some(MsgType::StorageAddOpportunisticLink)
            | Some(MsgType::StorageRemoveOpportunisticLink) => {
                debug!(node_id = hdr.ingress_unique_id, "opportunistic link notice");
                return;
            },
            other => {
                warn!(?other, "unexpected storage message type");
                return;
            },
        }

        self.handle_store(bundle).await;
        // the ack always flows, keeping the unique-id stream contiguous
        let _ = self
            .ack_tx
            .send(StorageAckHdr::new(hdr.ingress_unique_id))
            .await;
    }

    async fn handle_store(&mut self, bundle: &[u8]) {
        // locally-addressed admin records reconcile custody; nothing to file
        if let Some(ids) = extract_acknowledged_custody_ids(
            bundle,
            self.custody_eid,
            &self.custody_ids_by_bundle,
        ) {
            if ids.is_empty() {
                debug!("custody refusal signal consumed, nothing released");
                return;
            }
            self.custody_ids_by_bundle.retain(|_, id| !ids.contains(id));
            let released = self.manager.release_by_custody_ids(&ids);
            info!(
                acknowledged = ids.len(),
                released, "custody signal consumed"
            );
            return;
        }

        let coords = match storage_coords(bundle) {
            Ok(coords) => coords,
            Err(e) => {
                warn!(error = %e, "unparseable bundle dropped at storage");
                return;
            },
        };

        let action = match self.decide_custody(bundle) {
            Ok(action) => action,
            Err(e) => {
                warn!(error = %e, "custody processing failed, bundle dropped");
                return;
            },
        };
        let (bytes_to_store, custody_id, key) = match action {
            CustodyAction::NotRequested => (None, None, None),
            CustodyAction::Accepted {
                rewritten,
                custody_id,
                key,
            } => (Some(rewritten), Some(custody_id), Some(key)),
            CustodyAction::Refused => {
                // the refusal signal is already on its way back
                return;
            },
        };

        let store_result = self.manager.store(
            coords.dest,
            coords.priority,
            coords.expiration_second,
            bytes_to_store.as_deref().unwrap_or(bundle),
            custody_id,
        );
        match store_result {
            Ok(_) => {
                if let (Some(id), Some(key)) = (custody_id, key) {
                    self.custody_ids_by_bundle.insert(key, id);
                }
            },
            Err(e) => warn!(error = %e, "bundle store failed"),
        }
    }

    /// Accept-or-refuse for BPv6 bundles requesting custody; custody signal
    /// bundles (single or flushed aggregates) re-enter through ingress.
    fn decide_custody(&mut self, bundle: &[u8]) -> Result<CustodyAction, CodecError> {
        if !bpv6::bundle::looks_like_bpv6(bundle) {
            return Ok(CustodyAction::NotRequested);
        }
        let mut bv = BundleV6::parse(bundle)?;
        if !bv.primary.requests_custody() {
            return Ok(CustodyAction::NotRequested);
        }

        let accept = self.manager.has_capacity_for(bundle.len());
        let reason = if accept {
            CustodyReason::Success
        } else {
            CustodyReason::DepletedStorage
        };
        let outcome =
            self.custody
                .process_custody_of_bundle(&mut bv, accept, reason, now_seconds())?;

        let key = CustodyKey {
            source_eid: bv.primary.source.to_string(),
            creation_seconds: bv.primary.creation_seconds,
            creation_sequence: bv.primary.creation_sequence,
        };
        let rewritten = bv.render();

        if let Some(signal) = outcome.custody_signal_bundle {
            self.reinject(signal);
        }
        for acs_bundle in outcome.flushed_acs_bundles {
            self.reinject(acs_bundle);
        }

        if accept {
            Ok(CustodyAction::Accepted {
                rewritten,
                custody_id: outcome.assigned_custody_id.unwrap_or_default(),
                key,
            })
        } else {
            info!(dest = %bv.primary.destination, "custody refused, depleted storage");
            Ok(CustodyAction::Refused)
        }
    }

    /// Hands a locally generated signalling bundle back to ingress; spawned
    /// so a storage backpressure wait can never stall this relay.
    fn reinject(&self, bundle: Vec<u8>) {
        let dispatcher = Arc::clone(&self.dispatcher);
        tokio::spawn(async move {
            let buf = PaddedBytes::from_bundle(&bundle);
            if let Err(e) = dispatcher.process_bundle(buf, true).await {
                warn!(error = %e, "custody signal dropped at ingress");
            }
        });
    }
}

fn now_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
