// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Induct listeners.  Every variant ends the same way: a whole bundle in a
//! padded buffer handed to the ingress dispatcher.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, UdpSocket},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    cfg::config::InductElement,
    ingress::dispatcher::IngressDispatcher,
    ltp::{LtpConfig, SessionNotice, engine::LtpEngine},
    models::padded::PaddedBytes,
    tcpcl::session::{SessionEvent, TcpclConfig, TcpclSession},
};

async fn dispatch(dispatcher: &IngressDispatcher, bundle: &[u8]) {
    let buf = PaddedBytes::from_bundle(bundle);
    if let Err(e) = dispatcher.process_bundle(buf, true).await {
        warn!(error = %e, "bundle dropped at ingress");
    }
}

/// Plain-UDP induct: one bundle per datagram.
pub async fn run_udp_induct(
    dispatcher: Arc<IngressDispatcher>,
    bound_port: u16,
    max_packet: usize,
    cancel: CancellationToken,
) -> Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", bound_port))
        .await
        .context("udp induct bind")?;
    info!(bound_port, "udp induct listening");
    let mut buf = vec![0u8; max_packet];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            res = socket.recv_from(&mut buf) => {
                let (len, _from) = res.context("udp induct recv")?;
                dispatch(&dispatcher, &buf[..len]).await;
            },
        }
    }
    Ok(())
}

/// STCP induct: 32-bit big-endian length prefix per bundle.
pub async fn run_stcp_induct(
    dispatcher: Arc<IngressDispatcher>,
    bound_port: u16,
    max_bundle: usize,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", bound_port))
        .await
        .context("stcp induct bind")?;
    info!(bound_port, "stcp induct listening");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            res = listener.accept() => {
                let (mut stream, peer) = res.context("stcp accept")?;
                info!(%peer, "stcp connection");
                let dispatcher = Arc::clone(&dispatcher);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    loop {
                        let mut len_bytes = [0u8; 4];
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            res = stream.read_exact(&mut len_bytes) => {
                                if res.is_err() {
                                    break;
                                }
                                let len = u32::from_be_bytes(len_bytes) as usize;
                                if len == 0 || len > max_bundle {
                                    warn!(len, "stcp bundle length out of range");
                                    break;
                                }
                                let mut bundle = vec![0u8; len];
                                if stream.read_exact(&mut bundle).await.is_err() {
                                    break;
                                }
                                dispatch(&dispatcher, &bundle).await;
                            },
                        }
                    }
                });
            },
        }
    }
    Ok(())
}

/// TCPCLv3 induct.  Each accepted connection runs a passive session; its
/// reverse direction registers as an opportunistic path once the peer's
/// node id is known.
pub async fn run_tcpcl_induct(
    dispatcher: Arc<IngressDispatcher>,
    element: InductElement,
    local_eid: String,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", element.bound_port))
        .await
        .context("tcpcl induct bind")?;
    info!(bound_port = element.bound_port, "tcpcl induct listening");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            res = listener.accept() => {
                let (stream, peer) = res.context("tcpcl accept")?;
                info!(%peer, "tcpcl connection");
                let (event_tx, mut event_rx) = mpsc::channel(64);
                let (session, cmd_tx) = TcpclSession::new(
                    stream,
                    TcpclConfig {
                        local_eid: local_eid.clone(),
                        keepalive_interval_seconds: element.keep_alive_interval_seconds,
                        fragment_size: 0,
                        request_segment_acks: true,
                    },
                    false,
                    event_tx,
                    cancel.clone(),
                );
                tokio::spawn(session.run());

                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    let mut opportunistic_node = None;
                    while let Some(event) = event_rx.recv().await {
                        match event {
                            SessionEvent::Established { remote_eid, remote_node_id } => {
                                info!(%remote_eid, "tcpcl induct session established");
                                if let Some(node_id) = remote_node_id {
                                    opportunistic_node = Some(node_id);
                                    dispatcher
                                        .on_new_opportunistic_link(node_id, cmd_tx.clone())
                                        .await;
                                }
                            },
                            SessionEvent::BundleReceived { bundle } => {
                                dispatch(&dispatcher, &bundle).await;
                            },
                            SessionEvent::BundleAcked { .. } => {},
                            SessionEvent::Closed { reason } => {
                                info!(?reason, "tcpcl induct session closed");
                                if let Some(node_id) = opportunistic_node.take() {
                                    dispatcher
                                        .on_deleted_opportunistic_link(node_id)
                                        .await;
                                }
                                break;
                            },
                        }
                    }
                });
            },
        }
    }
    Ok(())
}

/// LTP-over-UDP induct: an engine whose red-part deliveries are bundles.
pub async fn run_ltp_induct(
    dispatcher: Arc<IngressDispatcher>,
    element: InductElement,
    cancel: CancellationToken,
) -> Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", element.bound_port))
        .await
        .context("ltp induct bind")?;
    info!(bound_port = element.bound_port, "ltp induct listening");

    let (notice_tx, mut notice_rx) = mpsc::channel(64);
    let cfg = LtpConfig {
        engine_id: element.this_ltp_engine_id,
        ..LtpConfig::default()
    };
    let (engine, _cmd_tx) = LtpEngine::new(cfg, socket, None, notice_tx, cancel.clone());
    tokio::spawn(engine.run());

    while let Some(notice) = notice_rx.recv().await {
        match notice {
            SessionNotice::RedPartReception { data, .. } => {
                dispatch(&dispatcher, &data).await;
            },
            SessionNotice::GreenSegmentArrival { .. } => {
                // green-part bundles are not reassembled by this induct
            },
            SessionNotice::SessionCancelled { session_id, reason, .. } => {
                warn!(%session_id, ?reason, "ltp induct session cancelled");
            },
            SessionNotice::SessionCompleted { .. } => {},
        }
    }
    Ok(())
}
