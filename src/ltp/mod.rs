// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! LTP session engine: sender and receiver state machines multiplexed over
//! one UDP socket, with a shared timer and light-time-aware retransmission.

pub mod engine;
pub mod fragment_set;
pub mod random;
pub mod receiver;
pub mod sender;
pub mod timer;

use bytes::Bytes;
use tokio::time::Duration;

use crate::models::ltp::{CancelReason, SessionId};

/// Per-engine tuning, shared by every session it hosts.
#[derive(Debug, Clone)]
pub struct LtpConfig {
    /// Local engine id stamped on outgoing sender sessions.
    pub engine_id: u64,
    /// Client service data bytes per data segment.
    pub mtu_client_data: usize,
    /// One-way light time to the peer; the retransmission timeout is
    /// `2 × (light time + margin)`.
    pub one_way_light_time: Duration,
    pub one_way_margin: Duration,
    /// Retransmissions of one serial number before the session cancels
    /// with `RetransmissionLimitExceeded`.
    pub max_retries_per_serial: u32,
    /// Claim cap per report segment; larger coverage splits the report.
    pub max_reception_claims: usize,
    /// Initial red-part buffer allocation for receiver sessions.
    pub estimated_bytes_to_receive: usize,
    /// Hard bound on a receiver session's red buffer; exceeding cancels
    /// with `SystemCancelled`.
    pub max_red_rx_bytes: usize,
    /// Receiver sessions a single engine will host at once.
    pub max_sessions: usize,
}

impl Default for LtpConfig {
    fn default() -> Self {
        Self {
            engine_id: 0,
            mtu_client_data: 1360,
            one_way_light_time: Duration::from_millis(1),
            one_way_margin: Duration::from_millis(200),
            max_retries_per_serial: 5,
            max_reception_claims: 20,
            estimated_bytes_to_receive: 4096,
            max_red_rx_bytes: 1 << 26,
            max_sessions: 5000,
        }
    }
}

impl LtpConfig {
    /// Checkpoint / report retransmission timeout.
    #[inline]
    pub fn rtt(&self) -> Duration {
        (self.one_way_light_time + self.one_way_margin) * 2
    }
}

/// Timer key: every armed serial number in the engine's shared
/// [`timer::TimerManager`] is qualified by its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerKey {
    pub session_id: SessionId,
    pub kind: TimerKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKind {
    CheckpointSerial(u64),
    ReportSerial(u64),
    CancelSegment,
}

/// Retry counter carried as timer user data; the expire handler decides to
/// reschedule or give up.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryState {
    pub retries: u32,
}

/// Notices delivered to the client-service layer.  Every session produces
/// exactly one completion-or-cancel notice over its lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    /// The full red part arrived, contiguous, exactly once.
    RedPartReception {
        session_id: SessionId,
        client_service_id: u64,
        data: Bytes,
        end_of_block: bool,
    },
    /// One green segment, delivered in arrival order without reassembly.
    GreenSegmentArrival {
        session_id: SessionId,
        offset: u64,
        data: Bytes,
        end_of_block: bool,
    },
    /// Sender side: red fully acknowledged (or pure-green block flushed).
    /// `tag` echoes the value given with the send command.
    SessionCompleted { session_id: SessionId, tag: u64 },
    SessionCancelled {
        session_id: SessionId,
        reason: CancelReason,
        cancelled_by_remote: bool,
        /// Present for sender sessions only.
        tag: Option<u64>,
    },
}

impl SessionNotice {
    pub fn session_id(&self) -> SessionId {
        match self {
            SessionNotice::RedPartReception { session_id, .. }
            | SessionNotice::GreenSegmentArrival { session_id, .. }
            | SessionNotice::SessionCompleted { session_id, .. }
            | SessionNotice::SessionCancelled { session_id, .. } => *session_id,
        }
    }
}
