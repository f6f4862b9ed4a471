// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Custody transfer manager: accept/refuse decisions, CTEB rewriting, and
//! custody-signal generation (single RFC 5050 signals, or aggregate signals
//! when the node is ACS-aware and the bundle carries a valid CTEB).

use tracing::debug;

use crate::models::{
    bpv6::{
        BlockFlagsV6, BlockTypeV6, BundleFlagsV6,
        admin::{
            AggregateCustodySignal, CustodyReason, CustodySignal, NUM_CUSTODY_REASONS,
        },
        bundle::{BundleBuilderV6, BundleV6},
        canonical::CtebBody,
        primary::PrimaryBlockV6,
    },
    eid::Eid,
    error::CodecError,
};

/// Outcome of one custody decision.
#[derive(Debug, Default)]
pub struct CustodyOutcome {
    pub accepted: bool,
    /// Custody id assigned locally (accept only).
    pub assigned_custody_id: Option<u64>,
    /// Immediate RFC 5050 signal bundle (non-ACS path), ready to route.
    pub custody_signal_bundle: Option<Vec<u8>>,
    /// ACS bundles force-flushed because the prior custodian changed.
    pub flushed_acs_bundles: Vec<Vec<u8>>,
}

/// One pending aggregate, tied to the prior custodian it acknowledges.
#[derive(Debug, Clone)]
struct PendingAcs {
    prior_custodian: Eid,
    signal: AggregateCustodySignal,
}

#[derive(Debug)]
pub struct CustodyTransferManager {
    is_acs_aware: bool,
    my_custodian_eid: Eid,
    my_custodian_eid_string: String,
    next_custody_id: u64,
    signal_sequence: u64,
    pending: [Option<PendingAcs>; NUM_CUSTODY_REASONS],
}

impl CustodyTransferManager {
    pub fn new(is_acs_aware: bool, my_node_id: u64, my_custodial_service_id: u64) -> Self {
        let my_custodian_eid = Eid::new(my_node_id, my_custodial_service_id);
        Self {
            is_acs_aware,
            my_custodian_eid,
            my_custodian_eid_string: my_custodian_eid.to_string(),
            next_custody_id: 0,
            signal_sequence: 0,
            pending: Default::default(),
        }
    }

    #[inline]
    pub fn my_custodian_eid(&self) -> Eid {
        self.my_custodian_eid
    }

    /// Decides custody for one BPv6 bundle in place.
    ///
    /// On acceptance the bundle's CTEB is rewritten (or added) with a fresh
    /// local custody id and the primary custodian becomes this node; the
    /// previous custodian gets a success signal.  On refusal the bundle is
    /// left untouched and the previous custodian gets the refusal reason.
    pub fn process_custody_of_bundle(
        &mut self,
        bundle: &mut BundleV6<'_>,
        accept: bool,
        reason: CustodyReason,
        signal_time_seconds: u64,
    ) -> Result<CustodyOutcome, CodecError> {
        let prior_custodian = bundle.primary.custodian;
        let prior_primary = bundle.primary.clone();

        // the cteb is trustworthy only when its creator matches the current
        // custodian; a stale cteb means the previous hop was not acs-aware
        let source = bundle.source();
        let cteb = bundle
            .blocks
            .iter()
            .find(|b| b.header.block_type == BlockTypeV6::CustodyTransferEnhancement)
            .map(|b| CtebBody::parse(b.body(source)))
            .transpose()?;
        let cteb_valid = cteb
            .as_ref()
            .map(|c| c.creator_custodian_eid == prior_custodian.to_string())
            .unwrap_or(false);

        let mut outcome = CustodyOutcome {
            accepted: accept,
            ..Default::default()
        };

        let effective_reason = if accept { CustodyReason::Success } else { reason };
        if self.is_acs_aware && cteb_valid {
            let prior_custody_id = cteb.as_ref().map(|c| c.custody_id).unwrap_or(0);
            outcome.flushed_acs_bundles = self.accumulate_acs(
                effective_reason,
                prior_custodian,
                prior_custody_id,
                signal_time_seconds,
            );
        } else if !prior_custodian.is_null() {
            outcome.custody_signal_bundle = Some(self.generate_custody_signal_bundle(
                &prior_primary,
                effective_reason,
                signal_time_seconds,
            ));
        }

        if accept {
            let custody_id = self.next_custody_id;
            self.next_custody_id += 1;
            outcome.assigned_custody_id = Some(custody_id);

            let new_cteb = CtebBody {
                custody_id,
                creator_custodian_eid: self.my_custodian_eid_string.clone(),
            }
            .render();

            let mut have_cteb = false;
            for view in
                bundle.blocks_by_type(BlockTypeV6::CustodyTransferEnhancement)
            {
                view.set_body(new_cteb.clone());
                have_cteb = true;
            }
            if !have_cteb {
                debug!(custody_id, "bundle had no cteb, custody id assigned anyway");
            }

            bundle.primary.custodian = self.my_custodian_eid;
            bundle.set_primary_modified();
        }

        Ok(outcome)
    }

    /// Adds one custody id to the pending aggregate for `reason`.  A change
    /// of prior custodian flushes the previous aggregate first: an ACS may
    /// only acknowledge ids issued by a single custodian.
    fn accumulate_acs(
        &mut self,
        reason: CustodyReason,
        prior_custodian: Eid,
        prior_custody_id: u64,
        signal_time_seconds: u64,
    ) -> Vec<Vec<u8>> {
        let custodian_changed = self.pending[reason.index()]
            .as_ref()
            .map(|p| p.prior_custodian != prior_custodian)
            .unwrap_or(false);
        let mut flushed = Vec::new();
        if custodian_changed {
            if let Some(old) = self.pending[reason.index()].take() {
                flushed.push(self.render_acs_bundle(&old, signal_time_seconds));
            }
        }
        let pending = self.pending[reason.index()].get_or_insert_with(|| PendingAcs {
            prior_custodian,
            signal: AggregateCustodySignal::new(reason),
        });
        pending.signal.add_custody_id(prior_custody_id);
        flushed
    }

    /// Emits the pending ACS bundle for one reason index, if any.
    pub fn generate_acs_bundle(
        &mut self,
        reason: CustodyReason,
        signal_time_seconds: u64,
    ) -> Option<Vec<u8>> {
        let pending = self.pending[reason.index()].take()?;
        Some(self.render_acs_bundle(&pending, signal_time_seconds))
    }

    /// Flushes every non-empty reason slot, one ACS bundle each.
    pub fn flush_all_acs(&mut self, signal_time_seconds: u64) -> Vec<Vec<u8>> {
        CustodyReason::ALL
            .iter()
            .filter_map(|&reason| self.generate_acs_bundle(reason, signal_time_seconds))
            .collect()
    }

    /// Pending custody-id count for one reason slot (telemetry / tests).
    pub fn pending_acs_len(&self, reason: CustodyReason) -> usize {
        self.pending[reason.index()]
            .as_ref()
            .map(|p| p.signal.custody_ids.len())
            .unwrap_or(0)
    }

    fn render_acs_bundle(&mut self, pending: &PendingAcs, signal_time_seconds: u64) -> Vec<u8> {
        let payload = pending.signal.render();
        self.render_admin_bundle(pending.prior_custodian, payload, signal_time_seconds)
    }

    fn generate_custody_signal_bundle(
        &mut self,
        prior_primary: &PrimaryBlockV6,
        reason: CustodyReason,
        signal_time_seconds: u64,
    ) -> Vec<u8> {
        let signal = CustodySignal {
            succeeded: reason.is_success(),
            reason,
            is_for_fragment: prior_primary.flags.contains(BundleFlagsV6::FRAGMENT),
            fragment_offset: prior_primary.fragment_offset,
            fragment_length: prior_primary.total_adu_length,
            signal_seconds: signal_time_seconds,
            signal_nanoseconds: 0,
            bundle_creation_seconds: prior_primary.creation_seconds,
            bundle_creation_sequence: prior_primary.creation_sequence,
            bundle_source_eid: prior_primary.source.to_string(),
        };
        self.render_admin_bundle(
            prior_primary.custodian,
            signal.render(),
            signal_time_seconds,
        )
    }

    fn render_admin_bundle(
        &mut self,
        destination: Eid,
        admin_payload: Vec<u8>,
        signal_time_seconds: u64,
    ) -> Vec<u8> {
        let sequence = self.signal_sequence;
        self.signal_sequence += 1;
        let primary = PrimaryBlockV6 {
            flags: BundleFlagsV6::SINGLETON
                | BundleFlagsV6::ADMIN_RECORD
                | BundleFlagsV6::NO_FRAGMENT,
            destination,
            source: self.my_custodian_eid,
            report_to: Eid::NULL,
            custodian: Eid::NULL,
            creation_seconds: signal_time_seconds,
            creation_sequence: sequence,
            lifetime_seconds: 86_400,
            fragment_offset: 0,
            total_adu_length: 0,
        };
        BundleBuilderV6::new(primary)
            .block(BlockTypeV6::Payload, BlockFlagsV6::empty(), admin_payload)
            .build()
    }
}
