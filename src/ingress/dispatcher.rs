// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Ingress dispatcher: parse, rewrite, classify, and hand every received
//! bundle to either the cut-through egress path or the storage path, with
//! bounded backpressure against both.
//!
//! One dispatcher instance carries all shared dataplane state (reachable
//! endpoint set, opportunistic node map, ack queues, counters); induct
//! callbacks and the ack-reader task all work through it by reference.

use std::{
    collections::HashSet,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use thiserror::Error;
use tokio::{
    sync::mpsc,
    time::{Duration, timeout},
};
use tracing::{error, info, warn};

use crate::{
    fabric::queues::{AckQueue, AckQueueMap},
    models::{
        bpv6::bundle::BundleV6,
        bpv7::{
            BlockFlagsV7, BlockTypeV7, BundleFlagsV7, CrcType,
            bundle::BundleV7,
            canonical::{CanonicalBlockV7, HopCount, decode_previous_node, encode_previous_node},
        },
        eid::Eid,
        error::CodecError,
        fabric::{
            CommonHdr, EgressAckHdr, LinkEventHdr, MsgType, StorageAckHdr, ToEgressHdr,
            ToStorageHdr,
        },
        padded::PaddedBytes,
    },
    tcpcl::session::SessionCommand,
};

/// Send timeout for the opportunistic reverse path.
const OPPORTUNISTIC_FORWARD_TIMEOUT: Duration = Duration::from_secs(3);
/// Hard cap on the storage backpressure wait.
const STORAGE_WAIT_CAP: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct IngressConfig {
    pub my_node_id: u64,
    pub my_custodial_service_id: u64,
    pub my_bp_echo_service_id: u64,
    pub max_bundle_size_bytes: usize,
    /// Outstanding-ack depth beyond which a path exerts backpressure.
    pub max_messages_per_path: usize,
    /// How long a bundle may wait for the egress ack queue to drain; zero
    /// falls through to storage immediately.
    pub max_ingress_wait_on_egress: Duration,
    /// Test mode: never use storage, drop on egress backpressure timeout.
    pub is_cut_through_only_test: bool,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Malformed(#[from] CodecError),

    #[error("unsupported bundle version byte {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("bundle of {size} bytes exceeds max bundle size {max}")]
    OversizedBundle { size: usize, max: usize },

    #[error("hop count {hop_count} exceeds limit {hop_limit}")]
    HopLimitExceeded { hop_count: u64, hop_limit: u64 },

    #[error("bundle has multiple {0} blocks")]
    DuplicateExtensionBlock(&'static str),

    #[error("backpressure timeout toward {path}")]
    BackpressureTimeout { path: &'static str },

    #[error("ack {unique_id} does not match queue head for {dest}")]
    AckMismatch { dest: Eid, unique_id: u64 },

    #[error("fabric channel closed")]
    ChannelClosed,
}

/// Where a bundle ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    CutThrough,
    Storage,
    Opportunistic,
}

/// Read-only counters snapshot.
#[derive(Debug, Default, Clone, Copy)]
pub struct IngressTelemetry {
    pub total_bundle_data_bytes: u64,
    pub bundle_count_egress: u64,
    pub bundle_count_storage: u64,
    pub events_too_many_in_egress_queue: u64,
    pub events_too_many_in_storage_queue: u64,
}

/// Channels toward egress and storage, bound after construction (the relay
/// tasks are created later in startup).
#[derive(Debug)]
struct FabricChannels {
    to_egress: mpsc::Sender<(ToEgressHdr, Bytes)>,
    to_storage: mpsc::Sender<(ToStorageHdr, Bytes)>,
}

pub struct IngressDispatcher {
    cfg: IngressConfig,
    custody_eid: Eid,
    echo_eid: Eid,
    reachable: Mutex<HashSet<Eid>>,
    /// node id → tcpcl session command handle for the reverse path.
    opportunistic: DashMap<u64, mpsc::Sender<SessionCommand>>,
    egress_queues: AckQueueMap,
    storage_queue: AckQueue,
    channels: OnceCell<FabricChannels>,
    /// Held across unique-id allocation, queue push, and channel send so
    /// ack-queue order always equals transmission order.
    egress_send_lock: tokio::sync::Mutex<()>,
    storage_send_lock: tokio::sync::Mutex<()>,
    next_egress_unique_id: AtomicU64,
    next_storage_unique_id: AtomicU64,
    total_bundle_data_bytes: AtomicU64,
    bundle_count_egress: AtomicU64,
    bundle_count_storage: AtomicU64,
    events_too_many_in_egress_queue: AtomicU64,
    events_too_many_in_storage_queue: AtomicU64,
}

impl IngressDispatcher {
    pub fn new(cfg: IngressConfig) -> Self {
        // custodial/administration service is service 0 by convention,
        // changeable in the config
        let custody_eid = Eid::new(cfg.my_node_id, cfg.my_custodial_service_id);
        let echo_eid = Eid::new(cfg.my_node_id, cfg.my_bp_echo_service_id);
        Self {
            cfg,
            custody_eid,
            echo_eid,
            reachable: Mutex::new(HashSet::new()),
            opportunistic: DashMap::new(),
            egress_queues: AckQueueMap::new(),
            storage_queue: AckQueue::new(),
            channels: OnceCell::new(),
            egress_send_lock: tokio::sync::Mutex::new(()),
            storage_send_lock: tokio::sync::Mutex::new(()),
            next_egress_unique_id: AtomicU64::new(0),
            next_storage_unique_id: AtomicU64::new(0),
            total_bundle_data_bytes: AtomicU64::new(0),
            bundle_count_egress: AtomicU64::new(0),
            bundle_count_storage: AtomicU64::new(0),
            events_too_many_in_egress_queue: AtomicU64::new(0),
            events_too_many_in_storage_queue: AtomicU64::new(0),
        }
    }

    /// Late-binds the egress and storage channels once the relays exist.
    pub fn bind_channels(
        &self,
        to_egress: mpsc::Sender<(ToEgressHdr, Bytes)>,
        to_storage: mpsc::Sender<(ToStorageHdr, Bytes)>,
    ) {
        let _ = self.channels.set(FabricChannels {
            to_egress,
            to_storage,
        });
    }

    pub fn telemetry(&self) -> IngressTelemetry {
        IngressTelemetry {
            total_bundle_data_bytes: self.total_bundle_data_bytes.load(Ordering::Relaxed),
            bundle_count_egress: self.bundle_count_egress.load(Ordering::Relaxed),
            bundle_count_storage: self.bundle_count_storage.load(Ordering::Relaxed),
            events_too_many_in_egress_queue: self
                .events_too_many_in_egress_queue
                .load(Ordering::Relaxed),
            events_too_many_in_storage_queue: self
                .events_too_many_in_storage_queue
                .load(Ordering::Relaxed),
        }
    }

    /// Logs the final counters, mirroring what the telemetry snapshot
    /// exposes, at shutdown.
    pub fn log_final_stats(&self) {
        let t = self.telemetry();
        info!(
            bundle_count_egress = t.bundle_count_egress,
            bundle_count_storage = t.bundle_count_storage,
            total_bundle_data_bytes = t.total_bundle_data_bytes,
            events_too_many_in_egress_queue = t.events_too_many_in_egress_queue,
            events_too_many_in_storage_queue = t.events_too_many_in_storage_queue,
            "ingress dispatcher stopping"
        );
    }

    // ── classification and forwarding ────────────────────────────────────

    /// Full ingress pass for one received bundle.
    ///
    /// `needs_processing` is false for bundles already processed on a prior
    /// pass (storage releases re-entering via the opportunistic reader):
    /// those skip rewriting and canonical CRC checks.
    pub async fn process_bundle(
        &self,
        mut buf: PaddedBytes,
        needs_processing: bool,
    ) -> Result<Disposition, DispatchError> {
        if buf.len() > self.cfg.max_bundle_size_bytes {
            return Err(DispatchError::OversizedBundle {
                size: buf.len(),
                max: self.cfg.max_bundle_size_bytes,
            });
        }
        let first_byte = buf.as_slice().first().copied().unwrap_or(0);

        let (final_dest, requests_custody, is_admin_record) = if first_byte
            == crate::models::bpv6::BPV6_VERSION
        {
            self.prepare_bpv6(&mut buf, needs_processing)?
        } else if first_byte == crate::models::bpv7::BPV7_FIRST_BYTE {
            self.prepare_bpv7(&mut buf, needs_processing)?
        } else {
            return Err(DispatchError::UnsupportedVersion(first_byte));
        };

        let bundle_len = buf.len() as u64;
        let disposition = self
            .classify_and_enqueue(final_dest, requests_custody, is_admin_record, buf)
            .await?;
        self.total_bundle_data_bytes
            .fetch_add(bundle_len, Ordering::Relaxed);
        Ok(disposition)
    }

    /// BPv6 pass: custody/admin/echo detection plus the echo rewrite.
    fn prepare_bpv6(
        &self,
        buf: &mut PaddedBytes,
        needs_processing: bool,
    ) -> Result<(Eid, bool, bool), DispatchError> {
        let mut rendered: Option<Vec<u8>> = None;
        let (final_dest, requests_custody, is_admin_record);
        {
            let mut bundle = BundleV6::parse(buf.as_slice())?;
            let mut dest = bundle.primary.destination;
            let mut custody = false;
            let mut admin = false;
            if needs_processing {
                custody = bundle.primary.requests_custody();
                // admin records for this node signal a deletion from disk
                // and always reconcile through storage
                admin = bundle.primary.is_admin_record() && dest == self.custody_eid;
                if dest == self.echo_eid {
                    let origin = bundle.primary.source;
                    info!(dest = %origin, "echoing ping bundle");
                    bundle.primary.destination = origin;
                    bundle.primary.source = self.echo_eid;
                    bundle.set_primary_modified();
                    dest = origin;
                    rendered = Some(bundle.render());
                }
            }
            final_dest = dest;
            requests_custody = custody;
            is_admin_record = admin;
        }
        if let Some(rendered) = rendered {
            if !buf.replace_in_place(&rendered) {
                *buf = PaddedBytes::from_bundle(&rendered);
            }
        }
        Ok((final_dest, requests_custody, is_admin_record))
    }

    /// BPv7 pass: previous-node rewrite/prepend, hop-count enforcement,
    /// echo rewrite, and the in-place re-render.
    fn prepare_bpv7(
        &self,
        buf: &mut PaddedBytes,
        needs_processing: bool,
    ) -> Result<(Eid, bool, bool), DispatchError> {
        let mut rendered: Option<Vec<u8>> = None;
        let (final_dest, is_admin_record);
        {
            let skip_canonical_crc = !needs_processing;
            let mut bundle = BundleV7::parse(buf.as_slice(), skip_canonical_crc)?;
            let mut dest = bundle.primary.destination;
            let admin = bundle.primary.flags.contains(BundleFlagsV7::ADMIN_RECORD)
                && dest == self.custody_eid;

            if needs_processing && !admin {
                let local_node = Eid::new(self.cfg.my_node_id, 0);

                if bundle.count_blocks_by_type(BlockTypeV7::PreviousNode) > 1 {
                    return Err(DispatchError::DuplicateExtensionBlock("previous-node"));
                }
                let mut have_previous_node = false;
                for view in bundle.blocks_by_type(BlockTypeV7::PreviousNode) {
                    decode_previous_node(&view.block.data)?;
                    view.block.data = encode_previous_node(&local_node);
                    view.set_manually_modified();
                    have_previous_node = true;
                }
                if !have_previous_node {
                    let block_number = bundle.next_free_block_number();
                    bundle.prepend_block(CanonicalBlockV7 {
                        block_type: BlockTypeV7::PreviousNode,
                        block_number,
                        flags: BlockFlagsV7::REMOVE_BLOCK_IF_UNPROCESSABLE,
                        crc_type: CrcType::Crc32c,
                        data: encode_previous_node(&local_node),
                    });
                }

                if bundle.count_blocks_by_type(BlockTypeV7::HopCount) > 1 {
                    return Err(DispatchError::DuplicateExtensionBlock("hop-count"));
                }
                for view in bundle.blocks_by_type(BlockTypeV7::HopCount) {
                    let mut hop = HopCount::decode(&view.block.data)?;
                    // hop count increases by one per hop; past the limit the
                    // bundle is deleted for "hop limit exceeded"
                    hop.count += 1;
                    if hop.count > hop.limit || hop.count > 255 {
                        return Err(DispatchError::HopLimitExceeded {
                            hop_count: hop.count,
                            hop_limit: hop.limit,
                        });
                    }
                    view.block.data = hop.encode();
                    view.set_manually_modified();
                }

                if dest == self.echo_eid {
                    let origin = bundle.primary.source;
                    info!(dest = %origin, "echoing ping bundle");
                    bundle.primary.destination = origin;
                    bundle.primary.source = self.echo_eid;
                    bundle.set_primary_modified();
                    dest = origin;
                }

                rendered = Some(bundle.render());
            }
            final_dest = dest;
            is_admin_record = admin;
        }
        if let Some(rendered) = rendered {
            // grow into the reserved prefix; a fresh allocation only when
            // the rewrite outgrew it
            if !buf.replace_in_place(&rendered) {
                *buf = PaddedBytes::from_bundle(&rendered);
            }
        }
        // bpv7 custody is unsupported at this time
        Ok((final_dest, false, is_admin_record))
    }

    async fn classify_and_enqueue(
        &self,
        final_dest: Eid,
        requests_custody: bool,
        is_admin_record: bool,
        buf: PaddedBytes,
    ) -> Result<Disposition, DispatchError> {
        let link_is_up = self
            .reachable
            .lock()
            .expect("reachable set poisoned")
            .contains(&final_dest);
        let opportunistic = self
            .opportunistic
            .get(&final_dest.node_id)
            .map(|entry| entry.value().clone());

        let should_try_cut_through = self.cfg.is_cut_through_only_test
            || (link_is_up && !requests_custody && !is_admin_record);

        let bundle = Bytes::from(buf.into_bundle_vec());

        if let Some(session_cmd) = opportunistic {
            let send = session_cmd.send(SessionCommand::SendBundle {
                id: u64::MAX, // reverse-path bundles are not ack-tracked
                bundle: bundle.clone(),
            });
            match timeout(OPPORTUNISTIC_FORWARD_TIMEOUT, send).await {
                Ok(Ok(())) => return Ok(Disposition::Opportunistic),
                _ => {
                    warn!(
                        dest = %final_dest,
                        fallback = if should_try_cut_through { "cut-through" } else { "storage" },
                        "opportunistic forward timed out"
                    );
                },
            }
        }

        if should_try_cut_through {
            match self.try_cut_through(final_dest, requests_custody, &bundle).await {
                Ok(true) => return Ok(Disposition::CutThrough),
                Ok(false) => {}, // fall through to storage
                Err(e) => return Err(e),
            }
        }

        self.enqueue_to_storage(bundle).await?;
        Ok(Disposition::Storage)
    }

    /// Cut-through: bounded wait on the per-destination ack queue, then an
    /// atomic push + send.  `Ok(false)` means "reroute to storage".
    async fn try_cut_through(
        &self,
        final_dest: Eid,
        requests_custody: bool,
        bundle: &Bytes,
    ) -> Result<bool, DispatchError> {
        let queue = self.egress_queues.queue_for(final_dest);
        if queue.len() > self.cfg.max_messages_per_path {
            self.events_too_many_in_egress_queue
                .fetch_add(1, Ordering::Relaxed);
            let drained = queue
                .wait_until_below(
                    self.cfg.max_messages_per_path,
                    self.cfg.max_ingress_wait_on_egress,
                )
                .await;
            if !drained {
                if self.cfg.is_cut_through_only_test {
                    warn!(
                        dest = %final_dest,
                        "cut-through path timed out, dropping (cut-through-only mode)"
                    );
                    return Err(DispatchError::BackpressureTimeout { path: "egress" });
                }
                warn!(dest = %final_dest, "cut-through path timed out, using storage");
                return Ok(false);
            }
        }

        let channels = self.channels.get().ok_or(DispatchError::ChannelClosed)?;
        {
            // id allocation, queue push, and channel send happen under one
            // lock: a racing dispatch for the same destination must not
            // interleave them, or the ack stream stops matching the queue
            let _send_guard = self.egress_send_lock.lock().await;
            let unique_id = self.next_egress_unique_id.fetch_add(1, Ordering::Relaxed);
            let hdr = ToEgressHdr::new(final_dest, requests_custody, unique_id);
            queue.push(unique_id);
            if channels
                .to_egress
                .send((hdr, bundle.clone()))
                .await
                .is_err()
            {
                error!("ingress cannot send bundle to egress");
                queue.pop_back_if(unique_id);
                return Err(DispatchError::ChannelClosed);
            }
        }
        self.bundle_count_egress.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    async fn enqueue_to_storage(&self, bundle: Bytes) -> Result<(), DispatchError> {
        if self.storage_queue.len() > self.cfg.max_messages_per_path {
            self.events_too_many_in_storage_queue
                .fetch_add(1, Ordering::Relaxed);
            let drained = self
                .storage_queue
                .wait_until_below(self.cfg.max_messages_per_path, STORAGE_WAIT_CAP)
                .await;
            if !drained {
                error!("too many pending storage acks in the queue");
                return Err(DispatchError::BackpressureTimeout { path: "storage" });
            }
        }

        let channels = self.channels.get().ok_or(DispatchError::ChannelClosed)?;
        {
            // same push-order-equals-send-order discipline as cut-through,
            // against the single global storage queue
            let _send_guard = self.storage_send_lock.lock().await;
            let unique_id = self.next_storage_unique_id.fetch_add(1, Ordering::Relaxed);
            let hdr = ToStorageHdr::new(unique_id);
            self.storage_queue.push(unique_id);
            if channels.to_storage.send((hdr, bundle)).await.is_err() {
                error!("ingress cannot send bundle to storage");
                self.storage_queue.pop_back_if(unique_id);
                return Err(DispatchError::ChannelClosed);
            }
        }
        self.bundle_count_storage.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // ── ack handling ─────────────────────────────────────────────────────

    /// Egress ack: must match the FIFO head of its destination's queue.  A
    /// mismatch is fatal for the link; the queue is drained so the link can
    /// restart clean.
    pub fn handle_egress_ack(&self, hdr: &EgressAckHdr) -> Result<(), DispatchError> {
        if hdr.base.msg_type() != Some(MsgType::EgressAckToIngress) {
            warn!(msg_type = hdr.base.msg_type, "unexpected egress ack type");
            return Ok(());
        }
        let dest = hdr.final_dest_eid;
        let queue = self.egress_queues.queue_for(dest);
        if queue.compare_and_pop(hdr.custody_id) {
            queue.notify_all();
            Ok(())
        } else {
            error!(%dest, unique_id = hdr.custody_id, "unexpected egress ack");
            queue.clear();
            Err(DispatchError::AckMismatch {
                dest,
                unique_id: hdr.custody_id,
            })
        }
    }

    pub fn handle_storage_ack(&self, hdr: &StorageAckHdr) -> Result<(), DispatchError> {
        if hdr.base.msg_type() != Some(MsgType::StorageAckToIngress) {
            warn!(msg_type = hdr.base.msg_type, "unexpected storage ack type");
            return Ok(());
        }
        if self.storage_queue.compare_and_pop(hdr.ingress_unique_id) {
            self.storage_queue.notify_all();
            Ok(())
        } else {
            error!(unique_id = hdr.ingress_unique_id, "unexpected storage ack");
            Err(DispatchError::AckMismatch {
                dest: Eid::NULL,
                unique_id: hdr.ingress_unique_id,
            })
        }
    }

    // ── scheduler and opportunistic link events ──────────────────────────

    /// Link events arrive in publish order; both the final destination and
    /// the next hop toward it become (un)reachable.
    pub fn handle_link_event(&self, hdr: &LinkEventHdr) {
        let mut reachable = self.reachable.lock().expect("reachable set poisoned");
        match hdr.base.msg_type() {
            Some(MsgType::LinkUp) => {
                reachable.insert(hdr.final_dest_eid);
                reachable.insert(hdr.next_hop_eid);
                info!(dest = %hdr.final_dest_eid, "sending bundles to egress for destination");
            },
            Some(MsgType::LinkDown) => {
                reachable.remove(&hdr.final_dest_eid);
                reachable.remove(&hdr.next_hop_eid);
                info!(dest = %hdr.final_dest_eid, "sending bundles to storage for destination");
            },
            other => warn!(?other, "unexpected scheduler event type"),
        }
    }

    /// A bidirectional TCPCL induct gained a peer: its reverse direction
    /// becomes an opportunistic path to that node.
    pub async fn on_new_opportunistic_link(
        &self,
        remote_node_id: u64,
        session_cmd: mpsc::Sender<SessionCommand>,
    ) {
        info!(remote_node_id, "new opportunistic link on tcpcl induct");
        self.opportunistic.insert(remote_node_id, session_cmd);
        self.send_opportunistic_link_messages(remote_node_id, true)
            .await;
    }

    pub async fn on_deleted_opportunistic_link(&self, remote_node_id: u64) {
        info!(remote_node_id, "deleted opportunistic link on tcpcl induct");
        self.opportunistic.remove(&remote_node_id);
        self.send_opportunistic_link_messages(remote_node_id, false)
            .await;
    }

    /// Tells egress and storage about the (un)available reverse path.
    async fn send_opportunistic_link_messages(&self, remote_node_id: u64, available: bool) {
        let Some(channels) = self.channels.get() else {
            return;
        };
        let egress_hdr = ToEgressHdr {
            base: CommonHdr::new(if available {
                MsgType::EgressAddOpportunisticLink
            } else {
                MsgType::EgressRemoveOpportunisticLink
            }),
            final_dest_eid: Eid::new(remote_node_id, 0),
            ..Default::default()
        };
        {
            let _send_guard = self.egress_send_lock.lock().await;
            if channels
                .to_egress
                .send((egress_hdr, Bytes::new()))
                .await
                .is_err()
            {
                warn!("cannot send opportunistic link message to egress");
            }
        }

        let storage_hdr = ToStorageHdr {
            base: CommonHdr::new(if available {
                MsgType::StorageAddOpportunisticLink
            } else {
                MsgType::StorageRemoveOpportunisticLink
            }),
            ingress_unique_id: remote_node_id,
        };
        {
            let _send_guard = self.storage_send_lock.lock().await;
            if channels
                .to_storage
                .send((storage_hdr, Bytes::new()))
                .await
                .is_err()
            {
                warn!("cannot send opportunistic link message to storage");
            }
        }
    }

    // ── test and telemetry accessors ─────────────────────────────────────

    pub fn is_reachable(&self, dest: Eid) -> bool {
        self.reachable
            .lock()
            .expect("reachable set poisoned")
            .contains(&dest)
    }

    pub fn egress_queue_depth(&self, dest: Eid) -> usize {
        self.egress_queues.get(dest).map(|q| q.len()).unwrap_or(0)
    }

    pub fn storage_queue_depth(&self) -> usize {
        self.storage_queue.len()
    }

    /// Seeds the per-destination queue with already-outstanding ids
    /// (link-restart reconciliation and backpressure tests).
    pub fn seed_egress_queue(&self, dest: Eid, ids: &[u64]) {
        let queue = self.egress_queues.queue_for(dest);
        for &id in ids {
            queue.push(id);
        }
    }

    /// Pops one outstanding id from the destination queue, as if its ack
    /// arrived; wakes waiters.
    pub fn drain_one_egress_ack(&self, dest: Eid) -> bool {
        let queue = self.egress_queues.queue_for(dest);
        let popped = queue.pop_front_any().is_some();
        if popped {
            queue.notify_all();
        }
        popped
    }
}
