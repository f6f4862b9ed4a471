// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! TCPCLv3 session: contact-header negotiation, segmented bundle transfer
//! with cumulative acks, keepalive/idle supervision, and the two-phase
//! shutdown drain.
//!
//! The session is generic over the byte stream so the full state machine
//! runs against an in-memory duplex in tests.

use std::collections::VecDeque;

use anyhow::{Result, bail};
use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    select,
    sync::mpsc,
    time::{Duration, Instant, sleep_until},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::tcpcl::{
    ContactHeader, ContactHeaderFlags, Message, ShutdownReason, try_decode_contact_header,
    try_decode_message,
};

/// Delay advertised in our SHUTDOWN message and applied before reconnect.
pub const RECONNECTION_DELAY_SECONDS: u64 = 3;
/// Quiescence window between sending SHUTDOWN and closing the socket.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct TcpclConfig {
    pub local_eid: String,
    /// Desired keepalive interval; the negotiated value is the minimum of
    /// both sides, zero disabling the feature entirely.
    pub keepalive_interval_seconds: u16,
    /// Segment size for outgoing bundles; zero disables fragmentation.
    pub fragment_size: usize,
    /// Ask the peer to ack our data segments.
    pub request_segment_acks: bool,
}

impl Default for TcpclConfig {
    fn default() -> Self {
        Self {
            local_eid: String::new(),
            keepalive_interval_seconds: 15,
            fragment_size: 0,
            request_segment_acks: true,
        }
    }
}

/// Commands submitted by the owner of the session handle.
#[derive(Debug)]
pub enum SessionCommand {
    /// Transmit a bundle; `id` is echoed in the `BundleAcked` event.
    SendBundle { id: u64, bundle: Bytes },
    /// Begin a graceful shutdown (SHUTDOWN message, drain, close).
    Shutdown,
}

/// Events emitted toward the session owner.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Established { remote_eid: String, remote_node_id: Option<u64> },
    BundleReceived { bundle: Vec<u8> },
    BundleAcked { id: u64 },
    Closed { reason: CloseReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// We idled out waiting for keepalives; reconnect after the delay.
    IdleTimeout,
    ShutdownByPeer,
    ShutdownLocal,
    PeerClosed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingContactHeader,
    Established,
    ShutdownDraining,
}

/// One in-flight outgoing bundle awaiting cumulative acks.
#[derive(Debug)]
struct InFlight {
    id: u64,
    total_len: u64,
}

pub struct TcpclSession<S> {
    stream: S,
    cfg: TcpclConfig,
    is_initiator: bool,
    state: State,
    negotiated_keepalive: Option<Duration>,
    peer_requested_acks: bool,
    rx_buf: BytesMut,
    /// Reassembly buffer for fragmented inbound bundles.
    fragment_concat: Vec<u8>,
    in_flight: VecDeque<InFlight>,
    pending_close: Option<CloseReason>,
    cmd_rx: mpsc::Receiver<SessionCommand>,
    event_tx: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
}

impl<S> TcpclSession<S>
where S: AsyncRead + AsyncWrite + Unpin + Send
{
    pub fn new(
        stream: S,
        cfg: TcpclConfig,
        is_initiator: bool,
        event_tx: mpsc::Sender<SessionEvent>,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Sender<SessionCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        (
            Self {
                stream,
                cfg,
                is_initiator,
                state: State::AwaitingContactHeader,
                negotiated_keepalive: None,
                peer_requested_acks: false,
                rx_buf: BytesMut::with_capacity(64 * 1024),
                fragment_concat: Vec::new(),
                in_flight: VecDeque::new(),
                pending_close: None,
                cmd_rx,
                event_tx,
                cancel,
            },
            cmd_tx,
        )
    }

    fn local_contact_header(&self) -> ContactHeader {
        let mut flags = ContactHeaderFlags::empty();
        if self.cfg.request_segment_acks {
            flags |= ContactHeaderFlags::REQUEST_ACK_OF_BUNDLE_SEGMENTS;
        }
        ContactHeader {
            flags,
            keepalive_interval_seconds: self.cfg.keepalive_interval_seconds,
            eid: self.cfg.local_eid.clone(),
        }
    }

    /// Drives the session to completion.  Always emits exactly one
    /// `Closed` event (barring cancellation).
    pub async fn run(mut self) -> Result<()> {
        let close_reason = match self.run_inner().await {
            Ok(reason) => reason,
            Err(e) => {
                warn!(error = %e, "tcpcl session error");
                CloseReason::Error
            },
        };
        let _ = self
            .event_tx
            .send(SessionEvent::Closed {
                reason: close_reason,
            })
            .await;
        Ok(())
    }

    async fn run_inner(&mut self) -> Result<CloseReason> {
        if self.is_initiator {
            let hdr = self.local_contact_header().encode();
            self.stream.write_all(&hdr).await?;
        }

        let far_future = Instant::now() + Duration::from_secs(3600 * 24 * 365);
        let mut no_keepalive_deadline = far_future;
        let mut send_keepalive_deadline = far_future;
        let mut shutdown_deadline = far_future;

        let mut read_chunk = vec![0u8; 16 * 1024];
        loop {
            select! {
                _ = self.cancel.cancelled() => {
                    return Ok(CloseReason::ShutdownLocal);
                },
                cmd = self.cmd_rx.recv(), if self.state == State::Established => {
                    match cmd {
                        Some(SessionCommand::SendBundle { id, bundle }) => {
                            self.send_bundle(id, bundle).await?;
                        },
                        Some(SessionCommand::Shutdown) | None => {
                            self.begin_shutdown(None).await?;
                            self.pending_close = Some(CloseReason::ShutdownLocal);
                            shutdown_deadline = Instant::now() + SHUTDOWN_DRAIN;
                        },
                    }
                },
                read = self.stream.read(&mut read_chunk) => {
                    let n = read?;
                    if n == 0 {
                        debug!("tcp connection closed by peer");
                        return Ok(self.pending_close.unwrap_or(CloseReason::PeerClosed));
                    }
                    self.rx_buf.extend_from_slice(&read_chunk[..n]);
                    self.drain_rx(
                        &mut no_keepalive_deadline,
                        &mut send_keepalive_deadline,
                        &mut shutdown_deadline,
                    )
                    .await?;
                },
                _ = sleep_until(no_keepalive_deadline) => {
                    // 2 × keepalive_interval with silence: idle timeout
                    info!("no keepalive received, shutting down (idle timeout)");
                    self.begin_shutdown(Some(ShutdownReason::IdleTimeout)).await?;
                    self.pending_close = Some(CloseReason::IdleTimeout);
                    shutdown_deadline = Instant::now() + SHUTDOWN_DRAIN;
                    no_keepalive_deadline = far_future;
                },
                _ = sleep_until(send_keepalive_deadline) => {
                    self.stream
                        .write_all(&Message::Keepalive.encode())
                        .await?;
                    if let Some(interval) = self.negotiated_keepalive {
                        send_keepalive_deadline = Instant::now() + interval;
                    }
                },
                _ = sleep_until(shutdown_deadline) => {
                    debug!("shutdown drain elapsed, closing socket");
                    let _ = self.stream.shutdown().await;
                    return Ok(self.pending_close.unwrap_or(CloseReason::ShutdownLocal));
                },
            }
        }
    }

    /// Parses everything buffered, reacting to each complete message.
    async fn drain_rx(
        &mut self,
        no_keepalive_deadline: &mut Instant,
        send_keepalive_deadline: &mut Instant,
        shutdown_deadline: &mut Instant,
    ) -> Result<()> {
        if self.state == State::AwaitingContactHeader {
            let Some(peer) = try_decode_contact_header(&mut self.rx_buf)? else {
                return Ok(());
            };
            self.peer_requested_acks = peer
                .flags
                .contains(ContactHeaderFlags::REQUEST_ACK_OF_BUNDLE_SEGMENTS);

            if !self.is_initiator {
                // passive side answers with its own contact header
                let hdr = self.local_contact_header().encode();
                self.stream.write_all(&hdr).await?;
            }

            // keepalive = min(local, remote); zero on either side disables
            let negotiated = self
                .cfg
                .keepalive_interval_seconds
                .min(peer.keepalive_interval_seconds);
            if negotiated > 0 {
                let interval = Duration::from_secs(u64::from(negotiated));
                self.negotiated_keepalive = Some(interval);
                *no_keepalive_deadline = Instant::now() + interval * 2;
                *send_keepalive_deadline = Instant::now() + interval;
                info!(seconds = negotiated, "tcpcl keepalive negotiated");
            }
            self.state = State::Established;

            let remote_node_id = peer
                .eid
                .parse::<crate::models::eid::Eid>()
                .ok()
                .map(|eid| eid.node_id);
            info!(remote_eid = %peer.eid, "tcpcl session established");
            let _ = self
                .event_tx
                .send(SessionEvent::Established {
                    remote_eid: peer.eid,
                    remote_node_id,
                })
                .await;
        }

        while let Some(msg) = try_decode_message(&mut self.rx_buf)? {
            match msg {
                Message::DataSegment { start, end, data } => {
                    let cumulative = self.apply_data_segment(start, end, data).await;
                    if self.peer_requested_acks {
                        self.stream
                            .write_all(
                                &Message::AckSegment {
                                    cumulative_bytes: cumulative,
                                }
                                .encode(),
                            )
                            .await?;
                    }
                },
                Message::AckSegment { cumulative_bytes } => {
                    if let Some(front) = self.in_flight.front() {
                        if cumulative_bytes >= front.total_len {
                            let id = front.id;
                            self.in_flight.pop_front();
                            let _ = self
                                .event_tx
                                .send(SessionEvent::BundleAcked { id })
                                .await;
                        }
                    } else {
                        warn!("ack segment with nothing in flight");
                    }
                },
                Message::Keepalive => {
                    if let Some(interval) = self.negotiated_keepalive {
                        *no_keepalive_deadline = Instant::now() + interval * 2;
                    }
                },
                Message::Shutdown {
                    reason,
                    reconnection_delay_seconds,
                } => {
                    debug!(?reason, ?reconnection_delay_seconds, "shutdown received");
                    // peer-initiated shutdown: stop writing and drain briefly
                    self.state = State::ShutdownDraining;
                    self.pending_close.get_or_insert(CloseReason::ShutdownByPeer);
                    *shutdown_deadline = Instant::now() + SHUTDOWN_DRAIN;
                },
                Message::Length { next_bundle_length } => {
                    debug!(next_bundle_length, "length message");
                },
                Message::RefuseBundle { reason_code } => {
                    warn!(reason_code, "peer refused bundle");
                    if let Some(front) = self.in_flight.pop_front() {
                        debug!(id = front.id, "dropping refused bundle");
                    }
                },
            }
        }
        Ok(())
    }

    /// Appends one inbound data segment; emits the bundle when complete.
    /// Returns the cumulative byte count to ack.
    async fn apply_data_segment(&mut self, start: bool, end: bool, data: Vec<u8>) -> u64 {
        if start && end {
            // whole bundle in one segment
            let len = data.len() as u64;
            let _ = self
                .event_tx
                .send(SessionEvent::BundleReceived { bundle: data })
                .await;
            return len;
        }
        if start {
            self.fragment_concat.clear();
        }
        self.fragment_concat.extend_from_slice(&data);
        let cumulative = self.fragment_concat.len() as u64;
        if end {
            let bundle = std::mem::take(&mut self.fragment_concat);
            let _ = self
                .event_tx
                .send(SessionEvent::BundleReceived { bundle })
                .await;
        }
        cumulative
    }

    /// Segments and writes one outgoing bundle.
    async fn send_bundle(&mut self, id: u64, bundle: Bytes) -> Result<()> {
        if self.state != State::Established {
            bail!("send on non-established tcpcl session");
        }
        let total_len = bundle.len() as u64;
        self.in_flight.push_back(InFlight { id, total_len });

        let chunk = if self.cfg.fragment_size == 0 {
            bundle.len().max(1)
        } else {
            self.cfg.fragment_size
        };
        let mut offset = 0usize;
        while offset < bundle.len() {
            let end_offset = (offset + chunk).min(bundle.len());
            let msg = Message::DataSegment {
                start: offset == 0,
                end: end_offset == bundle.len(),
                data: bundle[offset..end_offset].to_vec(),
            };
            self.stream.write_all(&msg.encode()).await?;
            offset = end_offset;
        }
        if !self.peer_requested_acks_for_us() {
            // no acks coming: report delivery optimistically on flush
            if let Some(front) = self.in_flight.pop_front() {
                let _ = self
                    .event_tx
                    .send(SessionEvent::BundleAcked { id: front.id })
                    .await;
            }
        }
        Ok(())
    }

    /// Did *we* ask the peer to ack our segments (and can therefore expect
    /// `AckSegment` replies)?
    fn peer_requested_acks_for_us(&self) -> bool {
        self.cfg.request_segment_acks
    }

    async fn begin_shutdown(&mut self, reason: Option<ShutdownReason>) -> Result<()> {
        if self.state == State::ShutdownDraining {
            return Ok(());
        }
        self.state = State::ShutdownDraining;
        let msg = Message::Shutdown {
            reason,
            reconnection_delay_seconds: Some(RECONNECTION_DELAY_SECONDS),
        };
        self.stream.write_all(&msg.encode()).await?;
        Ok(())
    }
}
