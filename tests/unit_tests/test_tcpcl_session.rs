// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Two TCPCLv3 sessions wired back-to-back over an in-memory duplex:
//! negotiation, segmented transfer with cumulative acks, and the
//! keepalive/idle machinery under paused time.

use bytes::Bytes;
use dtn_router_rs::tcpcl::session::{
    CloseReason, SessionCommand, SessionEvent, TcpclConfig, TcpclSession,
};
use tokio::{
    sync::mpsc,
    time::{Duration, timeout},
};
use tokio_util::sync::CancellationToken;

struct Harness {
    events: mpsc::Receiver<SessionEvent>,
    commands: mpsc::Sender<SessionCommand>,
}

fn spawn_pair(
    initiator_cfg: TcpclConfig,
    passive_cfg: TcpclConfig,
    cancel: &CancellationToken,
) -> (Harness, Harness) {
    let (a_stream, b_stream) = tokio::io::duplex(64 * 1024);

    let (a_events_tx, a_events_rx) = mpsc::channel(64);
    let (a_session, a_cmds) =
        TcpclSession::new(a_stream, initiator_cfg, true, a_events_tx, cancel.clone());
    tokio::spawn(a_session.run());

    let (b_events_tx, b_events_rx) = mpsc::channel(64);
    let (b_session, b_cmds) =
        TcpclSession::new(b_stream, passive_cfg, false, b_events_tx, cancel.clone());
    tokio::spawn(b_session.run());

    (
        Harness {
            events: a_events_rx,
            commands: a_cmds,
        },
        Harness {
            events: b_events_rx,
            commands: b_cmds,
        },
    )
}

async fn expect_established(h: &mut Harness) -> String {
    match timeout(Duration::from_secs(5), h.events.recv()).await {
        Ok(Some(SessionEvent::Established { remote_eid, .. })) => remote_eid,
        other => panic!("expected established, got {other:?}"),
    }
}

fn cfg(eid: &str, keepalive: u16, fragment_size: usize) -> TcpclConfig {
    TcpclConfig {
        local_eid: eid.to_string(),
        keepalive_interval_seconds: keepalive,
        fragment_size,
        request_segment_acks: true,
    }
}

#[tokio::test(start_paused = true)]
async fn test_contact_header_negotiation() {
    let cancel = CancellationToken::new();
    let (mut a, mut b) = spawn_pair(cfg("ipn:1.0", 10, 0), cfg("ipn:2.0", 5, 0), &cancel);

    assert_eq!(expect_established(&mut a).await, "ipn:2.0");
    assert_eq!(expect_established(&mut b).await, "ipn:1.0");
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_whole_bundle_transfer_with_ack() {
    let cancel = CancellationToken::new();
    let (mut a, mut b) = spawn_pair(cfg("ipn:1.0", 0, 0), cfg("ipn:2.0", 0, 0), &cancel);
    expect_established(&mut a).await;
    expect_established(&mut b).await;

    let bundle = Bytes::from(vec![0xabu8; 4096]);
    a.commands
        .send(SessionCommand::SendBundle {
            id: 7,
            bundle: bundle.clone(),
        })
        .await
        .expect("send");

    match timeout(Duration::from_secs(5), b.events.recv()).await {
        Ok(Some(SessionEvent::BundleReceived { bundle: received })) => {
            assert_eq!(received, bundle.as_ref());
        },
        other => panic!("expected bundle, got {other:?}"),
    }
    match timeout(Duration::from_secs(5), a.events.recv()).await {
        Ok(Some(SessionEvent::BundleAcked { id })) => assert_eq!(id, 7),
        other => panic!("expected ack, got {other:?}"),
    }
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_fragmented_transfer_cumulative_acks() {
    let cancel = CancellationToken::new();
    // 1 KiB segments force a 10-segment transfer
    let (mut a, mut b) = spawn_pair(cfg("ipn:1.0", 0, 1024), cfg("ipn:2.0", 0, 0), &cancel);
    expect_established(&mut a).await;
    expect_established(&mut b).await;

    let bundle: Bytes = (0..10_240u32).map(|i| i as u8).collect::<Vec<_>>().into();
    a.commands
        .send(SessionCommand::SendBundle {
            id: 3,
            bundle: bundle.clone(),
        })
        .await
        .expect("send");

    match timeout(Duration::from_secs(5), b.events.recv()).await {
        Ok(Some(SessionEvent::BundleReceived { bundle: received })) => {
            assert_eq!(received.len(), bundle.len());
            assert_eq!(received, bundle.as_ref());
        },
        other => panic!("expected reassembled bundle, got {other:?}"),
    }
    // bundle_acked only fires when the cumulative ack reaches the full length
    match timeout(Duration::from_secs(5), a.events.recv()).await {
        Ok(Some(SessionEvent::BundleAcked { id })) => assert_eq!(id, 3),
        other => panic!("expected ack, got {other:?}"),
    }
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_idle_timeout_after_silence() {
    use dtn_router_rs::models::tcpcl::{
        ContactHeader, ContactHeaderFlags, Message, ShutdownReason,
        try_decode_contact_header, try_decode_message,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let cancel = CancellationToken::new();
    let (session_stream, mut scripted_peer) = tokio::io::duplex(64 * 1024);

    // passive session wanting 5 s keepalives
    let (events_tx, mut events) = mpsc::channel(64);
    let (session, _cmds) = TcpclSession::new(
        session_stream,
        cfg("ipn:9.0", 5, 0),
        false,
        events_tx,
        cancel.clone(),
    );
    tokio::spawn(session.run());

    // the scripted peer sends its contact header (negotiated = min(5, 5))
    // then goes silent, only draining what the session writes
    scripted_peer
        .write_all(
            &ContactHeader {
                flags: ContactHeaderFlags::empty(),
                keepalive_interval_seconds: 5,
                eid: "ipn:1.0".to_string(),
            }
            .encode(),
        )
        .await
        .expect("contact header write");

    match timeout(Duration::from_secs(5), events.recv()).await {
        Ok(Some(SessionEvent::Established { .. })) => {},
        other => panic!("expected established, got {other:?}"),
    }

    // drain the session's output while the silence stretches past
    // 2 × keepalive = 10 s; collect everything it wrote
    let mut written = bytes::BytesMut::new();
    let mut chunk = [0u8; 4096];
    let closed = loop {
        tokio::select! {
            event = events.recv() => break event,
            read = scripted_peer.read(&mut chunk) => {
                match read {
                    Ok(0) => {},
                    Ok(n) => written.extend_from_slice(&chunk[..n]),
                    Err(_) => {},
                }
            },
        }
    };
    match closed {
        Some(SessionEvent::Closed { reason }) => {
            assert_eq!(reason, CloseReason::IdleTimeout);
        },
        other => panic!("expected idle-timeout close, got {other:?}"),
    }

    // the wire shows: our contact header reply, keepalives, then a
    // SHUTDOWN carrying IDLE_TIMEOUT and the 3 s reconnection delay
    let hdr = try_decode_contact_header(&mut written)
        .expect("decode")
        .expect("complete header");
    assert_eq!(hdr.eid, "ipn:9.0");

    let mut keepalives = 0;
    let mut shutdown = None;
    while let Some(msg) = try_decode_message(&mut written).expect("decode stream") {
        match msg {
            Message::Keepalive => keepalives += 1,
            Message::Shutdown {
                reason,
                reconnection_delay_seconds,
            } => shutdown = Some((reason, reconnection_delay_seconds)),
            other => panic!("unexpected message {other:?}"),
        }
    }
    assert!(keepalives >= 1, "keepalive timer fired before the idle cut");
    assert_eq!(
        shutdown,
        Some((Some(ShutdownReason::IdleTimeout), Some(3)))
    );
}

#[tokio::test(start_paused = true)]
async fn test_local_shutdown_reaches_peer() {
    let cancel = CancellationToken::new();
    let (mut a, mut b) = spawn_pair(cfg("ipn:1.0", 0, 0), cfg("ipn:2.0", 0, 0), &cancel);
    expect_established(&mut a).await;
    expect_established(&mut b).await;

    a.commands
        .send(SessionCommand::Shutdown)
        .await
        .expect("shutdown command");

    match timeout(Duration::from_secs(10), b.events.recv()).await {
        Ok(Some(SessionEvent::Closed { reason })) => {
            assert_eq!(reason, CloseReason::ShutdownByPeer);
        },
        other => panic!("expected peer shutdown, got {other:?}"),
    }
    match timeout(Duration::from_secs(10), a.events.recv()).await {
        Ok(Some(SessionEvent::Closed { reason })) => {
            assert_eq!(reason, CloseReason::ShutdownLocal);
        },
        other => panic!("expected local shutdown, got {other:?}"),
    }
}
