// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Sender-side LTP session.
//!
//! The session is a pure state machine: segment arrivals and timer
//! expirations go in, outgoing segments queue up for the engine to drain,
//! and client-service notices accumulate until collected.  All time comes
//! from the caller so the whole machine is testable without a socket.

use std::collections::{HashMap, VecDeque};

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
        CancelReason, DataSegment, ReportSegment, Segment, SegmentType, SessionId,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Initial,
    SendingRed,
    SendingGreen,
    RedDone,
    Closed,
    Cancelled,
}

/// Everything needed to retransmit one checkpointed burst tail.
#[derive(Debug, Clone)]
struct CheckpointInfo {
    begin: u64,
    end: u64,
    is_end_of_red_part: bool,
    is_end_of_block: bool,
    report_serial_being_responded_to: u64,
}

#[derive(Debug)]
pub struct SenderSession {
    pub id: SessionId,
    client_service_id: u64,
    /// Opaque tag echoed in the completion notice (egress ack correlation).
    tag: u64,
    red: Bytes,
    green: Bytes,
    state: SenderState,
    /// Red ranges the receiver has claimed.
    claimed_by_receiver: FragmentSet,
    /// Checkpoint serials still awaiting a report.
    outstanding_checkpoints: HashMap<u64, CheckpointInfo>,
    next_checkpoint_serial: u64,
    pending: VecDeque<Segment>,
    notices: Vec<SessionNotice>,
    completion_delivered: bool,
}

impl SenderSession {
    pub fn new(
        id: SessionId,
        client_service_id: u64,
        tag: u64,
        red: Bytes,
        green: Bytes,
        initial_checkpoint_serial: u64,
    ) -> Self {
        Self {
            id,
            client_service_id,
            tag,
            red,
            green,
            state: SenderState::Initial,
            claimed_by_receiver: FragmentSet::new(),
            outstanding_checkpoints: HashMap::new(),
            next_checkpoint_serial: initial_checkpoint_serial,
            pending: VecDeque::new(),
            notices: Vec::new(),
            completion_delivered: false,
        }
    }

    #[inline]
    pub fn state(&self) -> SenderState {
        self.state
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        matches!(self.state, SenderState::Closed | SenderState::Cancelled)
            && self.pending.is_empty()
    }

    #[inline]
    pub fn has_data_to_send(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn next_segment(&mut self) -> Option<Segment> {
        let seg = self.pending.pop_front();
        // a pure-green (or empty) block completes once flushed; red blocks
        // wait for the closing report before the green tail can finish
        if self.pending.is_empty() {
            let green_only = self.state == SenderState::SendingGreen && self.red.is_empty();
            if green_only || self.state == SenderState::RedDone {
                self.state = SenderState::Closed;
                self.deliver_completion();
            }
        }
        seg
    }

    pub fn drain_notices(&mut self) -> Vec<SessionNotice> {
        std::mem::take(&mut self.notices)
    }

    /// Begins transmission, queueing the whole red part then the green part.
    pub fn start(
        &mut self,
        cfg: &LtpConfig,
        timers: &mut TimerManager<TimerKey, RetryState>,
        now: Instant,
    ) {
        debug_assert_eq!(self.state, SenderState::Initial);
        self.state = if self.red.is_empty() {
            SenderState::SendingGreen
        } else {
            SenderState::SendingRed
        };

        if !self.red.is_empty() {
            self.enqueue_red_burst(cfg, timers, now, 0, self.red.len() as u64, 0);
        }

        let green_len = self.green.len() as u64;
        if green_len > 0 {
            let mtu = cfg.mtu_client_data as u64;
            let mut offset = 0u64;
            while offset < green_len {
                let end = (offset + mtu).min(green_len);
                let segment_type = if end == green_len {
                    SegmentType::GreenDataEndOfBlock
                } else {
                    SegmentType::GreenData
                };
                self.pending.push_back(Segment::data(
                    self.id,
                    segment_type,
                    DataSegment {
                        client_service_id: self.client_service_id,
                        offset,
                        data: self.green[offset as usize..end as usize].to_vec(),
                        checkpoint: None,
                    },
                ));
                offset = end;
            }
        } else if self.red.is_empty() {
            // empty block: nothing on the wire, complete immediately
            self.state = SenderState::Closed;
            self.deliver_completion();
        }
    }

    /// Queues red data covering `[begin, end)` in MTU chunks.  The burst's
    /// final segment is always a checkpoint; a segment reaching the end of
    /// the red part additionally carries EORP (and EOB when there is no
    /// green part).
    fn enqueue_red_burst(
        &mut self,
        cfg: &LtpConfig,
        timers: &mut TimerManager<TimerKey, RetryState>,
        now: Instant,
        begin: u64,
        end: u64,
        report_serial_being_responded_to: u64,
    ) {
        let mtu = cfg.mtu_client_data as u64;
        let red_len = self.red.len() as u64;
        let mut offset = begin;
        while offset < end {
            let chunk_end = (offset + mtu).min(end);
            let is_burst_tail = chunk_end == end;
            let reaches_red_end = chunk_end == red_len;
            if is_burst_tail {
                let serial = self.next_checkpoint_serial;
                self.next_checkpoint_serial = self.next_checkpoint_serial.wrapping_add(1);
                let segment_type = if reaches_red_end {
                    if self.green.is_empty() {
                        SegmentType::RedDataCheckpointEndOfRedPartEndOfBlock
                    } else {
                        SegmentType::RedDataCheckpointEndOfRedPart
                    }
                } else {
                    SegmentType::RedDataCheckpoint
                };
                self.outstanding_checkpoints.insert(
                    serial,
                    CheckpointInfo {
                        begin: offset,
                        end: chunk_end,
                        is_end_of_red_part: reaches_red_end,
                        is_end_of_block: reaches_red_end && self.green.is_empty(),
                        report_serial_being_responded_to,
                    },
                );
                timers.start(
                    TimerKey {
                        session_id: self.id,
                        kind: TimerKind::CheckpointSerial(serial),
                    },
                    now + cfg.rtt(),
                    RetryState::default(),
                );
                self.pending.push_back(Segment::data(
                    self.id,
                    segment_type,
                    DataSegment {
                        client_service_id: self.client_service_id,
                        offset,
                        data: self.red[offset as usize..chunk_end as usize].to_vec(),
                        checkpoint: Some((serial, report_serial_being_responded_to)),
                    },
                ));
            } else {
                self.pending.push_back(Segment::data(
                    self.id,
                    SegmentType::RedData,
                    DataSegment {
                        client_service_id: self.client_service_id,
                        offset,
                        data: self.red[offset as usize..chunk_end as usize].to_vec(),
                        checkpoint: None,
                    },
                ));
            }
            offset = chunk_end;
        }
    }

    /// Report segment from the receiver: ack it, absorb its claims, and
    /// retransmit whatever the report shows missing.
    pub fn on_report_segment(
        &mut self,
        report: &ReportSegment,
        cfg: &LtpConfig,
        timers: &mut TimerManager<TimerKey, RetryState>,
        now: Instant,
    ) {
        self.pending
            .push_back(Segment::report_ack(self.id, report.report_serial));

        if matches!(self.state, SenderState::Closed | SenderState::Cancelled) {
            return;
        }

        if report.checkpoint_serial != 0 {
            let key = TimerKey {
                session_id: self.id,
                kind: TimerKind::CheckpointSerial(report.checkpoint_serial),
            };
            timers.cancel(&key);
            self.outstanding_checkpoints.remove(&report.checkpoint_serial);
        }

        for claim in &report.claims {
            let begin = report.lower_bound + claim.offset;
            self.claimed_by_receiver.insert(begin, begin + claim.length);
        }

        let red_len = self.red.len() as u64;
        if self.claimed_by_receiver.contains(0, red_len) {
            self.state = if self.green.is_empty() || self.pending_green_flushed() {
                SenderState::Closed
            } else {
                SenderState::RedDone
            };
            if self.state == SenderState::Closed {
                self.deliver_completion();
            }
            return;
        }

        // retransmit the gaps the report exposes, one checkpointed burst per
        // contiguous gap inside the report scope
        let scope_end = report.upper_bound.min(red_len);
        let gaps: Vec<_> = self
            .claimed_by_receiver
            .complement_up_to(scope_end)
            .into_iter()
            .filter(|g| g.end > report.lower_bound)
            .collect();
        for gap in gaps {
            let begin = gap.begin.max(report.lower_bound);
            debug!(
                session = %self.id,
                begin,
                end = gap.end,
                "retransmitting red gap"
            );
            self.enqueue_red_burst(cfg, timers, now, begin, gap.end, report.report_serial);
        }
    }

    /// Checkpoint timer fired: retransmit the checkpoint or give up.
    pub fn on_checkpoint_timer_expired(
        &mut self,
        serial: u64,
        retry: RetryState,
        cfg: &LtpConfig,
        timers: &mut TimerManager<TimerKey, RetryState>,
        now: Instant,
    ) {
        if matches!(self.state, SenderState::Closed | SenderState::Cancelled) {
            return;
        }
        let Some(info) = self.outstanding_checkpoints.get(&serial).cloned() else {
            return;
        };

        if retry.retries >= cfg.max_retries_per_serial {
            warn!(
                session = %self.id,
                serial,
                "checkpoint retransmission limit exceeded, cancelling"
            );
            self.cancel_local(CancelReason::RetransmissionLimitExceeded, cfg, timers, now);
            return;
        }

        let segment_type = match (info.is_end_of_red_part, info.is_end_of_block) {
            (true, true) => SegmentType::RedDataCheckpointEndOfRedPartEndOfBlock,
            (true, false) => SegmentType::RedDataCheckpointEndOfRedPart,
            _ => SegmentType::RedDataCheckpoint,
        };
        // the retransmission is a zero-data checkpoint probe: the receiver's
        // report names the gaps and the report drives the data retransmission
        self.pending.push_back(Segment::data(
            self.id,
            segment_type,
            DataSegment {
                client_service_id: self.client_service_id,
                offset: info.end,
                data: Vec::new(),
                checkpoint: Some((serial, info.report_serial_being_responded_to)),
            },
        ));
        timers.start(
            TimerKey {
                session_id: self.id,
                kind: TimerKind::CheckpointSerial(serial),
            },
            now + cfg.rtt(),
            RetryState {
                retries: retry.retries + 1,
            },
        );
    }

    /// Local cancellation: emit the cancel segment (retransmitted on its own
    /// timer) and deliver the single cancel notice.
    pub fn cancel_local(
        &mut self,
        reason: CancelReason,
        cfg: &LtpConfig,
        timers: &mut TimerManager<TimerKey, RetryState>,
        now: Instant,
    ) {
        if self.state == SenderState::Cancelled {
            return;
        }
        self.state = SenderState::Cancelled;
        self.clear_outstanding(timers);
        self.pending.clear();
        self.pending
            .push_back(Segment::cancel(self.id, true, reason));
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

    /// Cancel segment from the receiver: ack and tear down.
    pub fn on_cancel_from_receiver(
        &mut self,
        reason: CancelReason,
        timers: &mut TimerManager<TimerKey, RetryState>,
    ) {
        self.clear_outstanding(timers);
        self.pending.clear();
        self.pending.push_back(Segment::cancel_ack(self.id, false));
        if self.state != SenderState::Cancelled {
            self.state = SenderState::Cancelled;
            self.deliver_cancel(reason, true);
        }
    }

    /// Cancel-ack from the receiver: the cancel handshake is complete.
    pub fn on_cancel_ack(&mut self, timers: &mut TimerManager<TimerKey, RetryState>) {
        timers.cancel(&TimerKey {
            session_id: self.id,
            kind: TimerKind::CancelSegment,
        });
    }

    /// Cancel-segment timer fired: resend the cancel a bounded number of
    /// times, then go quiet (the peer is gone either way).
    pub fn on_cancel_timer_expired(
        &mut self,
        retry: RetryState,
        cfg: &LtpConfig,
        timers: &mut TimerManager<TimerKey, RetryState>,
        now: Instant,
    ) {
        if retry.retries >= cfg.max_retries_per_serial {
            return;
        }
        self.pending.push_back(Segment::cancel(
            self.id,
            true,
            CancelReason::RetransmissionLimitExceeded,
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

    fn pending_green_flushed(&self) -> bool {
        !self
            .pending
            .iter()
            .any(|s| s.segment_type.is_green_data())
    }

    fn clear_outstanding(&mut self, timers: &mut TimerManager<TimerKey, RetryState>) {
        for serial in self.outstanding_checkpoints.keys() {
            timers.cancel(&TimerKey {
                session_id: self.id,
                kind: TimerKind::CheckpointSerial(*serial),
            });
        }
        self.outstanding_checkpoints.clear();
    }

    fn deliver_completion(&mut self) {
        if !self.completion_delivered {
            self.completion_delivered = true;
            self.notices.push(SessionNotice::SessionCompleted {
                session_id: self.id,
                tag: self.tag,
            });
        }
    }

    fn deliver_cancel(&mut self, reason: CancelReason, by_remote: bool) {
        if !self.completion_delivered {
            self.completion_delivered = true;
            self.notices.push(SessionNotice::SessionCancelled {
                session_id: self.id,
                reason,
                cancelled_by_remote: by_remote,
                tag: Some(self.tag),
            });
        }
    }
}
