// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Receiver-side LTP session: red-part reassembly, checkpoint-driven report
//! generation (with claim-cap splitting), report retransmission, and green
//! pass-through.

use std::collections::{HashMap, HashSet, VecDeque};

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    ltp::{
        LtpConfig, RetryState, SessionNotice, TimerKey, TimerKind,
        fragment_set::FragmentSet,
        timer::TimerManager,
    },
    models::ltp::{
        CancelReason, DataSegment, ReceptionClaim, ReportSegment, Segment, SegmentType,
        SessionId,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Receiving,
    RedComplete,
    Cancelled,
}

#[derive(Debug)]
pub struct ReceiverSession {
    pub id: SessionId,
    client_service_id: u64,
    state: ReceiverState,
    received: FragmentSet,
    /// Ranges the sender is known (via report-acks) to know we received.
    sender_knows: FragmentSet,
    red_buffer: Vec<u8>,
    red_length: Option<u64>,
    end_of_block_seen: bool,
    checkpoint_serials_seen: HashSet<u64>,
    /// checkpoint serial → report serials generated for it (resent verbatim
    /// when the checkpoint is retransmitted).
    reports_per_checkpoint: HashMap<u64, Vec<u64>>,
    reports_sent: HashMap<u64, ReportSegment>,
    next_report_serial: u64,
    pending: VecDeque<Segment>,
    notices: Vec<SessionNotice>,
    red_notice_delivered: bool,
    cancel_notice_delivered: bool,
}

impl ReceiverSession {
    pub fn new(id: SessionId, cfg: &LtpConfig, initial_report_serial: u64) -> Self {
        Self {
            id,
            client_service_id: 0,
            state: ReceiverState::Receiving,
            received: FragmentSet::new(),
            sender_knows: FragmentSet::new(),
            red_buffer: Vec::with_capacity(cfg.estimated_bytes_to_receive),
            red_length: None,
            end_of_block_seen: false,
            checkpoint_serials_seen: HashSet::new(),
            reports_per_checkpoint: HashMap::new(),
            reports_sent: HashMap::new(),
            next_report_serial: initial_report_serial,
            pending: VecDeque::new(),
            notices: Vec::new(),
            red_notice_delivered: false,
            cancel_notice_delivered: false,
        }
    }

    #[inline]
    pub fn state(&self) -> ReceiverState {
        self.state
    }

    #[inline]
    pub fn has_data_to_send(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn next_segment(&mut self) -> Option<Segment> {
        self.pending.pop_front()
    }

    pub fn drain_notices(&mut self) -> Vec<SessionNotice> {
        std::mem::take(&mut self.notices)
    }

    /// A session is reapable once its block is delivered (or cancelled) and
    /// every report it sent has been acknowledged.
    pub fn is_finished(&self) -> bool {
        match self.state {
            ReceiverState::Cancelled => self.pending.is_empty(),
            ReceiverState::RedComplete => {
                self.pending.is_empty() && self.reports_sent.is_empty()
            },
            ReceiverState::Receiving => false,
        }
    }

    /// One data segment in.  Red data lands in the reassembly buffer; green
    /// data is delivered immediately.
    pub fn on_data_segment(
        &mut self,
        segment_type: SegmentType,
        ds: DataSegment,
        cfg: &LtpConfig,
        timers: &mut TimerManager<TimerKey, RetryState>,
        now: Instant,
    ) {
        if self.state == ReceiverState::Cancelled {
            return;
        }
        self.client_service_id = ds.client_service_id;

        if segment_type.is_green_data() {
            let end_of_block = segment_type.is_end_of_block();
            if end_of_block {
                self.end_of_block_seen = true;
            }
            self.notices.push(SessionNotice::GreenSegmentArrival {
                session_id: self.id,
                offset: ds.offset,
                data: Bytes::from(ds.data),
                end_of_block,
            });
            // a pure-green block ends the session at EOB
            if end_of_block && self.received.is_empty() && self.red_length.is_none() {
                self.state = ReceiverState::RedComplete;
            }
            self.try_deliver_red();
            return;
        }

        let begin = ds.offset;
        let end = begin + ds.data.len() as u64;
        if end as usize > cfg.max_red_rx_bytes {
            warn!(session = %self.id, end, "red part exceeds receive bound, cancelling");
            self.cancel_local(CancelReason::SystemCancelled, cfg, timers, now);
            return;
        }

        if self.red_buffer.len() < end as usize {
            self.red_buffer.resize(end as usize, 0);
        }
        self.red_buffer[begin as usize..end as usize].copy_from_slice(&ds.data);
        self.received.insert(begin, end);

        if segment_type.is_end_of_red_part() {
            self.red_length = Some(end);
        }
        if segment_type.is_end_of_block() {
            self.end_of_block_seen = true;
        }

        if segment_type.is_checkpoint() {
            let (checkpoint_serial, _) = ds.checkpoint.unwrap_or((0, 0));
            if self.checkpoint_serials_seen.insert(checkpoint_serial) {
                self.emit_reports_for_checkpoint(checkpoint_serial, end, cfg, timers, now);
            } else {
                // retransmitted checkpoint: resend the reports it prompted
                let serials = self
                    .reports_per_checkpoint
                    .get(&checkpoint_serial)
                    .cloned()
                    .unwrap_or_default();
                for serial in serials {
                    if let Some(report) = self.reports_sent.get(&serial) {
                        self.pending.push_back(Segment::report(self.id, report.clone()));
                    }
                }
            }
        }

        self.try_deliver_red();
    }

    /// Builds the report(s) answering one new checkpoint: claims cover what
    /// we received that the sender does not yet know about, split across
    /// ascending-offset reports when the claim cap bites.
    fn emit_reports_for_checkpoint(
        &mut self,
        checkpoint_serial: u64,
        checkpoint_data_end: u64,
        cfg: &LtpConfig,
        timers: &mut TimerManager<TimerKey, RetryState>,
        now: Instant,
    ) {
        let bound = self.red_length.unwrap_or(checkpoint_data_end);
        let mut emitted = Vec::new();
        let mut already_claimed = self.sender_knows.clone();
        loop {
            let (claims, truncated) = self.received.fragments_needing_claim(
                &already_claimed,
                bound,
                cfg.max_reception_claims,
            );
            if claims.is_empty() {
                if emitted.is_empty() {
                    // nothing new to claim, still answer the checkpoint with
                    // a full-coverage description of what we hold
                    let (all, _) = self.received.fragments_needing_claim(
                        &FragmentSet::new(),
                        bound,
                        cfg.max_reception_claims,
                    );
                    let serial = self.allocate_report_serial();
                    let report = ReportSegment {
                        report_serial: serial,
                        checkpoint_serial,
                        upper_bound: bound,
                        lower_bound: 0,
                        claims: all
                            .iter()
                            .map(|f| ReceptionClaim {
                                offset: f.begin,
                                length: f.len(),
                            })
                            .collect(),
                    };
                    self.send_report(report, timers, cfg, now);
                    emitted.push(serial);
                }
                break;
            }
            for frag in &claims {
                already_claimed.insert(frag.begin, frag.end);
            }
            let serial = self.allocate_report_serial();
            let report = ReportSegment {
                report_serial: serial,
                checkpoint_serial,
                upper_bound: bound,
                lower_bound: 0,
                claims: claims
                    .iter()
                    .map(|f| ReceptionClaim {
                        offset: f.begin,
                        length: f.len(),
                    })
                    .collect(),
            };
            debug!(
                session = %self.id,
                serial,
                claims = report.claims.len(),
                truncated,
                "emitting report segment"
            );
            self.send_report(report, timers, cfg, now);
            emitted.push(serial);
            if !truncated {
                break;
            }
        }
        self.reports_per_checkpoint
            .insert(checkpoint_serial, emitted);
    }

    fn allocate_report_serial(&mut self) -> u64 {
        let serial = self.next_report_serial;
        self.next_report_serial = self.next_report_serial.wrapping_add(1);
        serial
    }

    fn send_report(
        &mut self,
        report: ReportSegment,
        timers: &mut TimerManager<TimerKey, RetryState>,
        cfg: &LtpConfig,
        now: Instant,
    ) {
        timers.start(
            TimerKey {
                session_id: self.id,
                kind: TimerKind::ReportSerial(report.report_serial),
            },
            now + cfg.rtt(),
            RetryState::default(),
        );
        self.pending.push_back(Segment::report(self.id, report.clone()));
        self.reports_sent.insert(report.report_serial, report);
    }

    /// Report-ack from the sender: it now knows everything that report
    /// claimed.
    pub fn on_report_ack(
        &mut self,
        report_serial: u64,
        timers: &mut TimerManager<TimerKey, RetryState>,
    ) {
        timers.cancel(&TimerKey {
            session_id: self.id,
            kind: TimerKind::ReportSerial(report_serial),
        });
        if let Some(report) = self.reports_sent.remove(&report_serial) {
            for claim in &report.claims {
                let begin = report.lower_bound + claim.offset;
                self.sender_knows.insert(begin, begin + claim.length);
            }
        }
    }

    /// Report timer fired: resend that report, give up after the bound.
    pub fn on_report_timer_expired(
        &mut self,
        report_serial: u64,
        retry: RetryState,
        cfg: &LtpConfig,
        timers: &mut TimerManager<TimerKey, RetryState>,
        now: Instant,
    ) {
        if self.state == ReceiverState::Cancelled {
            return;
        }
        let Some(report) = self.reports_sent.get(&report_serial).cloned() else {
            return;
        };
        if retry.retries >= cfg.max_retries_per_serial {
            warn!(
                session = %self.id,
                report_serial,
                "report retransmission limit exceeded, cancelling"
            );
            self.cancel_local(CancelReason::RetransmissionLimitExceeded, cfg, timers, now);
            return;
        }
        self.pending.push_back(Segment::report(self.id, report));
        timers.start(
            TimerKey {
                session_id: self.id,
                kind: TimerKind::ReportSerial(report_serial),
            },
            now + cfg.rtt(),
            RetryState {
                retries: retry.retries + 1,
            },
        );
    }

    pub fn cancel_local(
        &mut self,
        reason: CancelReason,
        cfg: &LtpConfig,
        timers: &mut TimerManager<TimerKey, RetryState>,
        now: Instant,
    ) {
        if self.state == ReceiverState::Cancelled {
            return;
        }
        self.state = ReceiverState::Cancelled;
        self.clear_report_timers(timers);
        self.pending.clear();
        self.pending
            .push_back(Segment::cancel(self.id, false, reason));
        timers.start(
            TimerKey {
                session_id: self.id,
                kind: TimerKind::CancelSegment,
            },
            now + cfg.rtt(),
            RetryState::default(),
        );
        self.deliver_cancel(reason, false);
    }

    pub fn on_cancel_from_sender(
        &mut self,
        reason: CancelReason,
        timers: &mut TimerManager<TimerKey, RetryState>,
    ) {
        self.clear_report_timers(timers);
        self.pending.clear();
        self.pending.push_back(Segment::cancel_ack(self.id, true));
        if self.state != ReceiverState::Cancelled {
            self.state = ReceiverState::Cancelled;
            self.deliver_cancel(reason, true);
        }
    }

    pub fn on_cancel_ack(&mut self, timers: &mut TimerManager<TimerKey, RetryState>) {
        timers.cancel(&TimerKey {
            session_id: self.id,
            kind: TimerKind::CancelSegment,
        });
    }

    pub fn on_cancel_timer_expired(
        &mut self,
        retry: RetryState,
        cfg: &LtpConfig,
        timers: &mut TimerManager<TimerKey, RetryState>,
        now: Instant,
    ) {
        if retry.retries >= cfg.max_retries_per_serial
            || self.state != ReceiverState::Cancelled
        {
            return;
        }
        self.pending.push_back(Segment::cancel(
            self.id,
            false,
            CancelReason::SystemCancelled,
        ));
        timers.start(
            TimerKey {
                session_id: self.id,
                kind: TimerKind::CancelSegment,
            },
            now + cfg.rtt(),
            RetryState {
                retries: retry.retries + 1,
            },
        );
    }

    /// Red-part delivery: the whole red part present and EORP observed.
    fn try_deliver_red(&mut self) {
        if self.red_notice_delivered || self.state == ReceiverState::Cancelled {
            return;
        }
        let Some(red_length) = self.red_length else {
            return;
        };
        if red_length > 0 && !self.received.contains(0, red_length) {
            return;
        }
        self.red_notice_delivered = true;
        self.state = ReceiverState::RedComplete;
        self.red_buffer.truncate(red_length as usize);
        self.notices.push(SessionNotice::RedPartReception {
            session_id: self.id,
            client_service_id: self.client_service_id,
            data: Bytes::from(std::mem::take(&mut self.red_buffer)),
            end_of_block: self.end_of_block_seen,
        });
    }

    fn clear_report_timers(&mut self, timers: &mut TimerManager<TimerKey, RetryState>) {
        for serial in self.reports_sent.keys() {
            timers.cancel(&TimerKey {
                session_id: self.id,
                kind: TimerKind::ReportSerial(*serial),
            });
        }
    }

    fn deliver_cancel(&mut self, reason: CancelReason, by_remote: bool) {
        if !self.cancel_notice_delivered {
            self.cancel_notice_delivered = true;
            self.notices.push(SessionNotice::SessionCancelled {
                session_id: self.id,
                reason,
                cancelled_by_remote: by_remote,
                tag: None,
            });
        }
    }
}
