// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Convergence-layer inducts, outducts and the egress relay.
//!
//! An outduct is a capability set (forward a bundle, observe acks, report
//! readiness and final stats) dispatched over a tagged variant per
//! convergence layer.  Reliable outducts (TCPCL, LTP) hold the bundle until
//! the transport acknowledges it; UDP and STCP acknowledge on send.

pub mod inducts;

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use bytes::Bytes;
use enum_dispatch::enum_dispatch;
use tokio::{
    io::AsyncWriteExt,
    net::{UdpSocket, tcp::OwnedWriteHalf},
    sync::{Mutex, mpsc},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    ltp::engine::EngineCommand,
    models::{
        eid::Eid,
        fabric::{EgressAckHdr, MsgType, ToEgressHdr},
    },
    tcpcl::session::SessionCommand,
};

/// Counters an outduct reports when stopped.
#[derive(Debug, Default, Clone, Copy)]
pub struct OutductStats {
    pub bundles_forwarded: u64,
    pub bundles_acked: u64,
}

/// Synchronous capabilities shared by every outduct variant.
#[enum_dispatch]
pub trait OutductCapabilities {
    /// Convergence-layer name for logs.
    fn cl_name(&self) -> &'static str;

    /// Ready to accept another bundle right now.
    fn is_ready(&self) -> bool;

    /// Acks arrive out-of-band (transport layer) rather than at forward
    /// time.
    fn is_reliable(&self) -> bool;

    fn final_stats(&self) -> OutductStats;
}

/// UDP outduct: fire-and-forget datagrams, one bundle per datagram.
#[derive(Debug)]
pub struct UdpOutduct {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    stats: std::sync::Mutex<OutductStats>,
}

impl UdpOutduct {
    pub fn new(socket: UdpSocket, remote: SocketAddr) -> Self {
        Self {
            socket: Arc::new(socket),
            remote,
            stats: std::sync::Mutex::new(OutductStats::default()),
        }
    }

    async fn forward(&self, bundle: &[u8]) -> Result<()> {
        self.socket
            .send_to(bundle, self.remote)
            .await
            .context("udp outduct send")?;
        let mut stats = self.stats.lock().expect("stats poisoned");
        stats.bundles_forwarded += 1;
        stats.bundles_acked += 1;
        Ok(())
    }
}

impl OutductCapabilities for UdpOutduct {
    fn cl_name(&self) -> &'static str {
        "udp"
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn is_reliable(&self) -> bool {
        false
    }

    fn final_stats(&self) -> OutductStats {
        *self.stats.lock().expect("stats poisoned")
    }
}

/// STCP outduct: 32-bit big-endian length prefix, then the bundle, over one
/// long-lived TCP connection.
#[derive(Debug)]
pub struct StcpOutduct {
    writer: Mutex<OwnedWriteHalf>,
    stats: std::sync::Mutex<OutductStats>,
}

impl StcpOutduct {
    pub fn new(writer: OwnedWriteHalf) -> Self {
        Self {
            writer: Mutex::new(writer),
            stats: std::sync::Mutex::new(OutductStats::default()),
        }
    }

    async fn forward(&self, bundle: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&(bundle.len() as u32).to_be_bytes())
            .await
            .context("stcp length prefix")?;
        writer.write_all(bundle).await.context("stcp bundle")?;
        let mut stats = self.stats.lock().expect("stats poisoned");
        stats.bundles_forwarded += 1;
        stats.bundles_acked += 1;
        Ok(())
    }
}

impl OutductCapabilities for StcpOutduct {
    fn cl_name(&self) -> &'static str {
        "stcp"
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn is_reliable(&self) -> bool {
        false
    }

    fn final_stats(&self) -> OutductStats {
        *self.stats.lock().expect("stats poisoned")
    }
}

/// TCPCLv3 outduct: hands bundles to a running session task; acks surface
/// as `BundleAcked` session events.
#[derive(Debug)]
pub struct TcpclOutduct {
    session_cmd: mpsc::Sender<SessionCommand>,
    stats: std::sync::Mutex<OutductStats>,
}

impl TcpclOutduct {
    pub fn new(session_cmd: mpsc::Sender<SessionCommand>) -> Self {
        Self {
            session_cmd,
            stats: std::sync::Mutex::new(OutductStats::default()),
        }
    }

    async fn forward(&self, tag: u64, bundle: Bytes) -> Result<()> {
        self.session_cmd
            .send(SessionCommand::SendBundle { id: tag, bundle })
            .await
            .context("tcpcl outduct session gone")?;
        self.stats.lock().expect("stats poisoned").bundles_forwarded += 1;
        Ok(())
    }

    pub fn note_acked(&self) {
        self.stats.lock().expect("stats poisoned").bundles_acked += 1;
    }
}

impl OutductCapabilities for TcpclOutduct {
    fn cl_name(&self) -> &'static str {
        "tcpcl"
    }

    fn is_ready(&self) -> bool {
        !self.session_cmd.is_closed()
    }

    fn is_reliable(&self) -> bool {
        true
    }

    fn final_stats(&self) -> OutductStats {
        *self.stats.lock().expect("stats poisoned")
    }
}

/// LTP-over-UDP outduct: each bundle becomes the red part of one sender
/// session; the completion notice releases the held buffer.
#[derive(Debug)]
pub struct LtpOverUdpOutduct {
    engine_cmd: mpsc::Sender<EngineCommand>,
    client_service_id: u64,
    stats: std::sync::Mutex<OutductStats>,
}

impl LtpOverUdpOutduct {
    pub fn new(engine_cmd: mpsc::Sender<EngineCommand>, client_service_id: u64) -> Self {
        Self {
            engine_cmd,
            client_service_id,
            stats: std::sync::Mutex::new(OutductStats::default()),
        }
    }

    async fn forward(&self, tag: u64, bundle: Bytes) -> Result<()> {
        self.engine_cmd
            .send(EngineCommand::SendRedGreen {
                client_service_id: self.client_service_id,
                tag,
                red: bundle,
                green: Bytes::new(),
            })
            .await
            .context("ltp outduct engine gone")?;
        self.stats.lock().expect("stats poisoned").bundles_forwarded += 1;
        Ok(())
    }

    pub fn note_acked(&self) {
        self.stats.lock().expect("stats poisoned").bundles_acked += 1;
    }
}

impl OutductCapabilities for LtpOverUdpOutduct {
    fn cl_name(&self) -> &'static str {
        "ltp-over-udp"
    }

    fn is_ready(&self) -> bool {
        !self.engine_cmd.is_closed()
    }

    fn is_reliable(&self) -> bool {
        true
    }

    fn final_stats(&self) -> OutductStats {
        *self.stats.lock().expect("stats poisoned")
    }
}

/// Tagged outduct variant.
#[enum_dispatch(OutductCapabilities)]
#[derive(Debug)]
pub enum Outduct {
    Udp(UdpOutduct),
    Stcp(StcpOutduct),
    Tcpcl(TcpclOutduct),
    LtpOverUdp(LtpOverUdpOutduct),
}

impl Outduct {
    /// Forwards one bundle.  For reliable variants the ack (tagged with
    /// `tag`) arrives later via the transport; unreliable variants are
    /// considered acked once written.
    pub async fn forward(&self, tag: u64, bundle: Bytes) -> Result<()> {
        match self {
            Outduct::Udp(duct) => duct.forward(&bundle).await,
            Outduct::Stcp(duct) => duct.forward(&bundle).await,
            Outduct::Tcpcl(duct) => duct.forward(tag, bundle).await,
            Outduct::LtpOverUdp(duct) => duct.forward(tag, bundle).await,
        }
    }
}

/// Egress relay: consumes `(ToEgressHdr, bundle)` messages from ingress,
/// forwards over the outduct routed for the destination, and returns
/// `EgressAckHdr` acks once the bundle is out of our hands.
pub struct EgressRelay {
    outducts: HashMap<Eid, Arc<Outduct>>,
    bundle_rx: mpsc::Receiver<(ToEgressHdr, Bytes)>,
    ack_tx: mpsc::Sender<EgressAckHdr>,
    /// tag → (dest, custody id) for reliable ducts' deferred acks.
    pending_reliable: HashMap<u64, (Eid, u64)>,
    /// Transport-level ack stream (tcpcl `BundleAcked` ids, ltp completion
    /// tags) fed by the session/engine wiring.
    transport_ack_rx: mpsc::Receiver<u64>,
    transport_acks_closed: bool,
    next_tag: u64,
    cancel: CancellationToken,
}

impl EgressRelay {
    pub fn new(
        outducts: HashMap<Eid, Arc<Outduct>>,
        bundle_rx: mpsc::Receiver<(ToEgressHdr, Bytes)>,
        ack_tx: mpsc::Sender<EgressAckHdr>,
        transport_ack_rx: mpsc::Receiver<u64>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            outducts,
            bundle_rx,
            ack_tx,
            pending_reliable: HashMap::new(),
            transport_ack_rx,
            transport_acks_closed: false,
            next_tag: 0,
            cancel,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        info!(outducts = self.outducts.len(), "egress relay running");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = self.bundle_rx.recv() => {
                    match msg {
                        Some((hdr, bundle)) => self.handle_bundle(hdr, bundle).await?,
                        None => break,
                    }
                },
                ack = self.transport_ack_rx.recv(), if !self.transport_acks_closed => {
                    match ack {
                        Some(tag) => self.handle_transport_ack(tag).await,
                        None => self.transport_acks_closed = true,
                    }
                },
            }
        }
        for (dest, outduct) in &self.outducts {
            let stats = outduct.final_stats();
            info!(
                %dest,
                cl = outduct.cl_name(),
                forwarded = stats.bundles_forwarded,
                acked = stats.bundles_acked,
                "outduct final stats"
            );
        }
        Ok(())
    }

    async fn handle_bundle(&mut self, hdr: ToEgressHdr, bundle: Bytes) -> Result<()> {
        if hdr.base.msg_type() != Some(MsgType::Egress) {
            // opportunistic link add/remove bookkeeping messages
            debug!(msg_type = hdr.base.msg_type, "egress relay control message");
            return Ok(());
        }
        let dest = hdr.final_dest_eid;
        let Some(outduct) = self.outducts.get(&dest) else {
            warn!(%dest, "no outduct for destination, dropping bundle");
            return Ok(());
        };
        let tag = self.next_tag;
        self.next_tag += 1;

        if outduct.is_reliable() {
            self.pending_reliable.insert(tag, (dest, hdr.custody_id));
        }
        if let Err(e) = outduct.forward(tag, bundle).await {
            warn!(%dest, error = %e, "outduct forward failed");
            self.pending_reliable.remove(&tag);
            return Ok(());
        }
        if !outduct.is_reliable() {
            let _ = self
                .ack_tx
                .send(EgressAckHdr::new(dest, hdr.custody_id))
                .await;
        }
        Ok(())
    }

    async fn handle_transport_ack(&mut self, tag: u64) {
        if let Some((dest, custody_id)) = self.pending_reliable.remove(&tag) {
            match self.outducts.get(&dest).map(Arc::as_ref) {
                Some(Outduct::Tcpcl(duct)) => duct.note_acked(),
                Some(Outduct::LtpOverUdp(duct)) => duct.note_acked(),
                _ => {},
            }
            let _ = self.ack_tx.send(EgressAckHdr::new(dest, custody_id)).await;
        } else {
            warn!(tag, "transport ack with no pending bundle");
        }
    }
}
