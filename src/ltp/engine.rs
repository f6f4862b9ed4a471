// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Engine multiplexer: owns every LTP session on one UDP socket, routes
//! incoming segments, drives the shared timer, and drains outgoing
//! segments fairly (round-robin over sessions with data pending).
//!
//! All session state is touched only from the engine task; other tasks
//! submit work through the command channel.

use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::Arc,
};

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::{net::UdpSocket, select, sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    ltp::{
        LtpConfig, RetryState, SessionNotice, TimerKey, TimerKind,
        random::RandomNumberGenerator,
        receiver::ReceiverSession,
        sender::SenderSession,
        timer::TimerManager,
    },
    models::ltp::{Segment, SegmentBody, SessionId},
};

/// Work submitted to the engine from other tasks.
#[derive(Debug)]
pub enum EngineCommand {
    /// Open a sender session toward the engine's peer.  `tag` is echoed in
    /// the session's completion-or-cancel notice.
    SendRedGreen {
        client_service_id: u64,
        tag: u64,
        red: Bytes,
        green: Bytes,
    },
    /// Cancel a session locally (client-service request).
    CancelSession { session_id: SessionId },
}

enum Session {
    Sender(SenderSession),
    Receiver(ReceiverSession),
}

/// Counters exposed for the telemetry snapshot.
#[derive(Debug, Default, Clone, Copy)]
pub struct EngineStats {
    pub datagrams_received: u64,
    pub datagrams_sent: u64,
    pub sessions_started: u64,
    pub sessions_completed: u64,
    pub sessions_cancelled: u64,
}

pub struct LtpEngine {
    cfg: LtpConfig,
    socket: Arc<UdpSocket>,
    /// Peer address for sender sessions; receivers answer the source
    /// address of their latest segment.
    remote_addr: Option<SocketAddr>,
    sessions: HashMap<SessionId, Session>,
    session_addrs: HashMap<SessionId, SocketAddr>,
    timers: TimerManager<TimerKey, RetryState>,
    rng: RandomNumberGenerator,
    round_robin: VecDeque<SessionId>,
    cmd_rx: mpsc::Receiver<EngineCommand>,
    notice_tx: mpsc::Sender<SessionNotice>,
    cancel: CancellationToken,
    stats: EngineStats,
}

impl LtpEngine {
    /// Builds the engine plus its command handle.  `remote_addr` is required
    /// for engines that originate sessions (outducts); pure inducts pass
    /// `None`.
    pub fn new(
        cfg: LtpConfig,
        socket: UdpSocket,
        remote_addr: Option<SocketAddr>,
        notice_tx: mpsc::Sender<SessionNotice>,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Sender<EngineCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        (
            Self {
                cfg,
                socket: Arc::new(socket),
                remote_addr,
                sessions: HashMap::new(),
                session_addrs: HashMap::new(),
                timers: TimerManager::new(),
                rng: RandomNumberGenerator::new(),
                round_robin: VecDeque::new(),
                cmd_rx,
                notice_tx,
                cancel,
                stats: EngineStats::default(),
            },
            cmd_tx,
        )
    }

    #[inline]
    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    /// Engine task body.  Runs until cancelled.
    pub async fn run(mut self) -> Result<()> {
        let mut recv_buf = vec![0u8; 65536];
        info!(engine_id = self.cfg.engine_id, "ltp engine running");
        loop {
            self.flush_outgoing().await?;
            self.reap_finished();

            let next_deadline = self.timers.next_deadline();
            select! {
                _ = self.cancel.cancelled() => break,
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => break,
                    }
                },
                res = self.socket.recv_from(&mut recv_buf) => {
                    let (len, from) = res.context("ltp udp recv")?;
                    self.stats.datagrams_received += 1;
                    self.handle_datagram(&recv_buf[..len], from);
                },
                _ = sleep_until_or_forever(next_deadline) => {
                    self.handle_timer_expiry();
                },
            }
            self.forward_notices().await;
        }
        info!(
            engine_id = self.cfg.engine_id,
            completed = self.stats.sessions_completed,
            cancelled = self.stats.sessions_cancelled,
            "ltp engine stopping"
        );
        Ok(())
    }

    fn handle_command(&mut self, cmd: EngineCommand) {
        let now = Instant::now();
        match cmd {
            EngineCommand::SendRedGreen {
                client_service_id,
                tag,
                red,
                green,
            } => {
                let session_id =
                    SessionId::new(self.cfg.engine_id, self.rng.next_u64());
                let mut session = SenderSession::new(
                    session_id,
                    client_service_id,
                    tag,
                    red,
                    green,
                    self.rng.next_u64(),
                );
                session.start(&self.cfg, &mut self.timers, now);
                self.stats.sessions_started += 1;
                if let Some(addr) = self.remote_addr {
                    self.session_addrs.insert(session_id, addr);
                }
                self.sessions.insert(session_id, Session::Sender(session));
                self.mark_has_data(session_id);
            },
            EngineCommand::CancelSession { session_id } => {
                if let Some(Session::Sender(session)) = self.sessions.get_mut(&session_id)
                {
                    session.cancel_local(
                        crate::models::ltp::CancelReason::UserCancelled,
                        &self.cfg,
                        &mut self.timers,
                        now,
                    );
                    self.mark_has_data(session_id);
                }
            },
        }
    }

    fn handle_datagram(&mut self, datagram: &[u8], from: SocketAddr) {
        let segment = match Segment::decode(datagram) {
            Ok(s) => s,
            Err(e) => {
                warn!(%from, error = %e, "dropping malformed ltp segment");
                return;
            },
        };
        let session_id = segment.session_id;
        let now = Instant::now();

        // receiver sessions are created on demand by the first data segment
        // of an unknown id
        if !self.sessions.contains_key(&session_id) {
            if !matches!(segment.body, SegmentBody::Data(_)) {
                debug!(%session_id, "segment for unknown session, ignoring");
                return;
            }
            if self.sessions.len() >= self.cfg.max_sessions {
                warn!(%session_id, "session cap reached, dropping new session");
                return;
            }
            let session =
                ReceiverSession::new(session_id, &self.cfg, self.rng.next_u64());
            self.sessions.insert(session_id, Session::Receiver(session));
            self.stats.sessions_started += 1;
        }
        self.session_addrs.insert(session_id, from);

        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };
        match (session, segment.body) {
            (Session::Receiver(rx), SegmentBody::Data(ds)) => {
                rx.on_data_segment(segment.segment_type, ds, &self.cfg, &mut self.timers, now);
            },
            (Session::Sender(tx), SegmentBody::Report(rs)) => {
                tx.on_report_segment(&rs, &self.cfg, &mut self.timers, now);
            },
            (Session::Receiver(rx), SegmentBody::ReportAck { report_serial }) => {
                rx.on_report_ack(report_serial, &mut self.timers);
            },
            (Session::Receiver(rx), SegmentBody::Cancel { reason }) => {
                rx.on_cancel_from_sender(reason, &mut self.timers);
                self.stats.sessions_cancelled += 1;
            },
            (Session::Sender(tx), SegmentBody::Cancel { reason }) => {
                tx.on_cancel_from_receiver(reason, &mut self.timers);
                self.stats.sessions_cancelled += 1;
            },
            (Session::Sender(tx), SegmentBody::CancelAck) => {
                tx.on_cancel_ack(&mut self.timers);
            },
            (Session::Receiver(rx), SegmentBody::CancelAck) => {
                rx.on_cancel_ack(&mut self.timers);
            },
            (_, body) => {
                debug!(%session_id, ?body, "segment type mismatched session role");
            },
        }
        self.mark_has_data(session_id);
    }

    fn handle_timer_expiry(&mut self) {
        let now = Instant::now();
        // one expiration per wake-up; the loop re-arms for the next deadline
        let Some((key, retry)) = self.timers.pop_expired(now) else {
            return;
        };
        let Some(session) = self.sessions.get_mut(&key.session_id) else {
            return; // session already reaped
        };
        match (session, key.kind) {
            (Session::Sender(tx), TimerKind::CheckpointSerial(serial)) => {
                tx.on_checkpoint_timer_expired(serial, retry, &self.cfg, &mut self.timers, now);
            },
            (Session::Receiver(rx), TimerKind::ReportSerial(serial)) => {
                rx.on_report_timer_expired(serial, retry, &self.cfg, &mut self.timers, now);
            },
            (Session::Sender(tx), TimerKind::CancelSegment) => {
                tx.on_cancel_timer_expired(retry, &self.cfg, &mut self.timers, now);
            },
            (Session::Receiver(rx), TimerKind::CancelSegment) => {
                rx.on_cancel_timer_expired(retry, &self.cfg, &mut self.timers, now);
            },
            _ => {},
        }
        self.mark_has_data(key.session_id);
    }

    /// Round-robin drain: one segment per session per pass so a bulk
    /// transfer cannot starve its neighbours.
    async fn flush_outgoing(&mut self) -> Result<()> {
        while let Some(session_id) = self.round_robin.pop_front() {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                continue;
            };
            let segment = match session {
                Session::Sender(tx) => tx.next_segment(),
                Session::Receiver(rx) => rx.next_segment(),
            };
            let Some(segment) = segment else {
                continue;
            };
            let addr = self
                .session_addrs
                .get(&session_id)
                .copied()
                .or(self.remote_addr);
            if let Some(addr) = addr {
                self.socket
                    .send_to(&segment.encode(), addr)
                    .await
                    .context("ltp udp send")?;
                self.stats.datagrams_sent += 1;
            } else {
                warn!(%session_id, "no peer address for outgoing segment, dropping");
            }
            let has_more = match self.sessions.get(&session_id) {
                Some(Session::Sender(tx)) => tx.has_data_to_send(),
                Some(Session::Receiver(rx)) => rx.has_data_to_send(),
                None => false,
            };
            if has_more {
                self.round_robin.push_back(session_id);
            }
        }
        Ok(())
    }

    fn mark_has_data(&mut self, session_id: SessionId) {
        let has_data = match self.sessions.get(&session_id) {
            Some(Session::Sender(tx)) => tx.has_data_to_send(),
            Some(Session::Receiver(rx)) => rx.has_data_to_send(),
            None => false,
        };
        if has_data && !self.round_robin.contains(&session_id) {
            self.round_robin.push_back(session_id);
        }
    }

    async fn forward_notices(&mut self) {
        let mut notices = Vec::new();
        for session in self.sessions.values_mut() {
            match session {
                Session::Sender(tx) => notices.extend(tx.drain_notices()),
                Session::Receiver(rx) => notices.extend(rx.drain_notices()),
            }
        }
        for notice in notices {
            if matches!(notice, SessionNotice::SessionCompleted { .. }) {
                self.stats.sessions_completed += 1;
            }
            if self.notice_tx.send(notice).await.is_err() {
                self.cancel.cancel();
                return;
            }
        }
    }

    fn reap_finished(&mut self) {
        let finished: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| match s {
                Session::Sender(tx) => tx.is_finished(),
                Session::Receiver(rx) => rx.is_finished(),
            })
            .map(|(id, _)| *id)
            .collect();
        for id in finished {
            debug!(session = %id, "reaping finished session");
            self.sessions.remove(&id);
            self.session_addrs.remove(&id);
            self.timers.cancel(&TimerKey {
                session_id: id,
                kind: TimerKind::CancelSegment,
            });
        }
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
