// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Sender/receiver session state machines driven directly, no sockets:
//! lossless transfer, checkpoint loss and recovery, report splitting, and
//! retransmission exhaustion.

use bytes::Bytes;
use dtn_router_rs::{
    ltp::{
        LtpConfig, RetryState, SessionNotice, TimerKey, TimerKind,
        receiver::ReceiverSession,
        sender::{SenderSession, SenderState},
        timer::TimerManager,
    },
    models::ltp::{CancelReason, Segment, SegmentBody, SessionId},
};
use tokio::time::{Duration, Instant};

type Timers = TimerManager<TimerKey, RetryState>;

fn test_cfg() -> LtpConfig {
    LtpConfig {
        engine_id: 1,
        mtu_client_data: 5000,
        one_way_light_time: Duration::from_millis(100),
        one_way_margin: Duration::from_millis(50),
        max_retries_per_serial: 5,
        max_reception_claims: 20,
        estimated_bytes_to_receive: 1024,
        max_red_rx_bytes: 1 << 20,
        ..LtpConfig::default()
    }
}

fn drain(session_segments: &mut Vec<Segment>, sender: &mut SenderSession) {
    while let Some(seg) = sender.next_segment() {
        session_segments.push(seg);
    }
}

fn drain_rx(session_segments: &mut Vec<Segment>, receiver: &mut ReceiverSession) {
    while let Some(seg) = receiver.next_segment() {
        session_segments.push(seg);
    }
}

/// Feeds one segment into whichever side it belongs to.
fn deliver(
    seg: &Segment,
    sender: &mut SenderSession,
    receiver: &mut ReceiverSession,
    cfg: &LtpConfig,
    timers: &mut Timers,
    now: Instant,
) {
    match &seg.body {
        SegmentBody::Data(ds) => {
            receiver.on_data_segment(seg.segment_type, ds.clone(), cfg, timers, now);
        },
        SegmentBody::Report(rs) => sender.on_report_segment(rs, cfg, timers, now),
        SegmentBody::ReportAck { report_serial } => {
            receiver.on_report_ack(*report_serial, timers);
        },
        SegmentBody::Cancel { reason } => {
            if seg.segment_type == dtn_router_rs::models::ltp::SegmentType::CancelFromSender {
                receiver.on_cancel_from_sender(*reason, timers);
            } else {
                sender.on_cancel_from_receiver(*reason, timers);
            }
        },
        SegmentBody::CancelAck => {},
    }
}

#[tokio::test(start_paused = true)]
async fn test_lossless_red_transfer_completes() {
    let cfg = test_cfg();
    let mut timers = Timers::new();
    let now = Instant::now();
    let session_id = SessionId::new(1, 42);

    let red: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
    let mut sender = SenderSession::new(
        session_id,
        1,
        0,
        Bytes::from(red.clone()),
        Bytes::new(),
        100,
    );
    let mut receiver = ReceiverSession::new(session_id, &cfg, 500);

    sender.start(&cfg, &mut timers, now);
    let mut wire = Vec::new();
    drain(&mut wire, &mut sender);
    assert_eq!(wire.len(), 2, "two mtu-sized data segments");

    // every burst tail is a checkpoint; the final one carries eorp + eob
    assert!(wire[1].segment_type.is_checkpoint());
    assert!(wire[1].segment_type.is_end_of_red_part());
    assert!(wire[1].segment_type.is_end_of_block());
    assert!(!wire[0].segment_type.is_checkpoint());

    for seg in &wire {
        deliver(seg, &mut sender, &mut receiver, &cfg, &mut timers, now);
    }

    // red part delivered contiguously, exactly once
    let notices = receiver.drain_notices();
    match notices.as_slice() {
        [SessionNotice::RedPartReception { data, end_of_block, .. }] => {
            assert_eq!(data.as_ref(), red.as_slice());
            assert!(end_of_block);
        },
        other => panic!("expected one red-part notice, got {other:?}"),
    }

    // the receiver's report flows back; sender acks it and completes
    let mut back = Vec::new();
    drain_rx(&mut back, &mut receiver);
    assert_eq!(back.len(), 1);
    deliver(&back[0], &mut sender, &mut receiver, &cfg, &mut timers, now);

    assert_eq!(sender.state(), SenderState::Closed);
    let notices = sender.drain_notices();
    assert!(matches!(
        notices.as_slice(),
        [SessionNotice::SessionCompleted { tag: 0, .. }]
    ));

    // report-ack travels back and clears the receiver's report timer
    let mut acks = Vec::new();
    drain(&mut acks, &mut sender);
    assert_eq!(acks.len(), 1);
    deliver(&acks[0], &mut sender, &mut receiver, &cfg, &mut timers, now);
    assert!(receiver.is_finished());
    assert!(timers.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_red_loss_recovery_via_checkpoint_probe() {
    // red [0,10000) in two segments; the checkpointed [5000,10000) segment
    // is dropped once
    let cfg = test_cfg();
    let mut timers = Timers::new();
    let now = Instant::now();
    let session_id = SessionId::new(1, 7);

    let red: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let mut sender = SenderSession::new(
        session_id,
        1,
        0,
        Bytes::from(red.clone()),
        Bytes::new(),
        100,
    );
    let mut receiver = ReceiverSession::new(session_id, &cfg, 500);

    sender.start(&cfg, &mut timers, now);
    let mut wire = Vec::new();
    drain(&mut wire, &mut sender);

    // deliver only the first (plain) segment; drop the checkpoint
    deliver(&wire[0], &mut sender, &mut receiver, &cfg, &mut timers, now);
    assert!(receiver.drain_notices().is_empty());

    // checkpoint timer fires: 2 × (owlt + margin)
    let after_rtt = now + cfg.rtt() + Duration::from_millis(1);
    let (key, retry) = timers.pop_expired(after_rtt).expect("checkpoint timer");
    let TimerKind::CheckpointSerial(serial) = key.kind else {
        panic!("expected checkpoint timer, got {key:?}");
    };
    sender.on_checkpoint_timer_expired(serial, retry, &cfg, &mut timers, after_rtt);

    let mut probe = Vec::new();
    drain(&mut probe, &mut sender);
    assert_eq!(probe.len(), 1);
    let SegmentBody::Data(ds) = &probe[0].body else {
        panic!("probe must be a data segment");
    };
    assert!(ds.data.is_empty());
    assert!(probe[0].segment_type.is_end_of_red_part());

    // probe reaches the receiver: one report claiming [0,5000)
    deliver(&probe[0], &mut sender, &mut receiver, &cfg, &mut timers, after_rtt);
    let mut reports = Vec::new();
    drain_rx(&mut reports, &mut receiver);
    assert_eq!(reports.len(), 1);
    let SegmentBody::Report(report) = &reports[0].body else {
        panic!("expected report");
    };
    assert_eq!(report.claims.len(), 1);
    assert_eq!((report.claims[0].offset, report.claims[0].length), (0, 5000));

    // sender: report-ack + one retransmission burst of [5000,10000)
    deliver(&reports[0], &mut sender, &mut receiver, &cfg, &mut timers, after_rtt);
    let mut retx = Vec::new();
    drain(&mut retx, &mut sender);
    assert_eq!(retx.len(), 2, "report ack + retransmitted checkpoint");
    let SegmentBody::Data(rds) = &retx[1].body else {
        panic!("expected retransmitted data");
    };
    assert_eq!(rds.offset, 5000);
    assert_eq!(rds.data.len(), 5000);
    assert!(retx[1].segment_type.is_checkpoint());

    // deliver retransmitted data BEFORE the report ack (udp reorder):
    // the second report claims the whole red part
    deliver(&retx[1], &mut sender, &mut receiver, &cfg, &mut timers, after_rtt);
    deliver(&retx[0], &mut sender, &mut receiver, &cfg, &mut timers, after_rtt);

    let notices = receiver.drain_notices();
    match notices.as_slice() {
        [SessionNotice::RedPartReception { data, .. }] => {
            assert_eq!(data.as_ref(), red.as_slice());
        },
        other => panic!("expected red-part notice, got {other:?}"),
    }

    let mut second_reports = Vec::new();
    drain_rx(&mut second_reports, &mut receiver);
    assert_eq!(second_reports.len(), 1);
    let SegmentBody::Report(report2) = &second_reports[0].body else {
        panic!("expected report");
    };
    assert_eq!(report2.claims.len(), 1, "single merged claim");
    assert_eq!(
        (report2.claims[0].offset, report2.claims[0].length),
        (0, 10_000)
    );

    deliver(
        &second_reports[0],
        &mut sender,
        &mut receiver,
        &cfg,
        &mut timers,
        after_rtt,
    );
    assert_eq!(sender.state(), SenderState::Closed);
    assert!(matches!(
        sender.drain_notices().as_slice(),
        [SessionNotice::SessionCompleted { .. }]
    ));
}

#[tokio::test(start_paused = true)]
async fn test_report_splits_when_claims_exceed_cap() {
    let mut cfg = test_cfg();
    cfg.max_reception_claims = 3;
    cfg.mtu_client_data = 100;
    let mut timers = Timers::new();
    let now = Instant::now();
    let session_id = SessionId::new(1, 9);

    let mut receiver = ReceiverSession::new(session_id, &cfg, 500);

    // eight disjoint 50-byte islands of a 1000-byte red part, then the
    // eorp checkpoint probe announcing red_length = 1000
    use dtn_router_rs::models::ltp::{DataSegment, SegmentType};
    for i in 0..8u64 {
        receiver.on_data_segment(
            SegmentType::RedData,
            DataSegment {
                client_service_id: 1,
                offset: i * 120,
                data: vec![0xaa; 50],
                checkpoint: None,
            },
            &cfg,
            &mut timers,
            now,
        );
    }
    receiver.on_data_segment(
        SegmentType::RedDataCheckpointEndOfRedPartEndOfBlock,
        DataSegment {
            client_service_id: 1,
            offset: 1000,
            data: Vec::new(),
            checkpoint: Some((1, 0)),
        },
        &cfg,
        &mut timers,
        now,
    );

    let mut reports = Vec::new();
    drain_rx(&mut reports, &mut receiver);
    assert_eq!(reports.len(), 3, "8 claims split across ceil(8/3) reports");

    let mut seen_serials = std::collections::HashSet::new();
    let mut last_first_offset = None;
    let mut total_claims = 0;
    for seg in &reports {
        let SegmentBody::Report(rs) = &seg.body else {
            panic!("expected report");
        };
        assert!(rs.claims.len() <= 3);
        assert!(seen_serials.insert(rs.report_serial), "fresh serial each");
        // ascending offsets across the split
        if let (Some(prev), Some(first)) = (last_first_offset, rs.claims.first()) {
            assert!(first.offset > prev);
        }
        last_first_offset = rs.claims.first().map(|c| c.offset);
        total_claims += rs.claims.len();
    }
    assert_eq!(total_claims, 8);
    // each unacked report armed its own timer
    assert_eq!(timers.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_retransmission_limit_cancels_with_rlexc() {
    let cfg = test_cfg();
    let mut timers = Timers::new();
    let mut now = Instant::now();
    let session_id = SessionId::new(1, 11);

    let mut sender = SenderSession::new(
        session_id,
        1,
        0,
        Bytes::from(vec![0u8; 1000]),
        Bytes::new(),
        100,
    );
    sender.start(&cfg, &mut timers, now);
    let mut wire = Vec::new();
    drain(&mut wire, &mut sender);

    // the peer never answers; drive the checkpoint timer to exhaustion
    for _ in 0..=cfg.max_retries_per_serial {
        now += cfg.rtt() + Duration::from_millis(1);
        let (key, retry) = timers.pop_expired(now).expect("armed timer");
        let TimerKind::CheckpointSerial(serial) = key.kind else {
            panic!("expected checkpoint timer");
        };
        sender.on_checkpoint_timer_expired(serial, retry, &cfg, &mut timers, now);
        let mut out = Vec::new();
        drain(&mut out, &mut sender);
    }

    assert_eq!(sender.state(), SenderState::Cancelled);
    match sender.drain_notices().as_slice() {
        [SessionNotice::SessionCancelled { reason, cancelled_by_remote, .. }] => {
            assert_eq!(*reason, CancelReason::RetransmissionLimitExceeded);
            assert!(!cancelled_by_remote);
        },
        other => panic!("expected cancel notice, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_green_passthrough_no_timers() {
    let cfg = test_cfg();
    let mut timers = Timers::new();
    let now = Instant::now();
    let session_id = SessionId::new(1, 13);

    let green: Vec<u8> = vec![0x5a; 12_000];
    let mut sender = SenderSession::new(
        session_id,
        1,
        0,
        Bytes::new(),
        Bytes::from(green.clone()),
        100,
    );
    let mut receiver = ReceiverSession::new(session_id, &cfg, 500);

    sender.start(&cfg, &mut timers, now);
    assert!(timers.is_empty(), "green transmission arms no timers");

    let mut wire = Vec::new();
    drain(&mut wire, &mut sender);
    assert_eq!(wire.len(), 3);
    for seg in &wire {
        deliver(seg, &mut sender, &mut receiver, &cfg, &mut timers, now);
    }

    let notices = receiver.drain_notices();
    assert_eq!(notices.len(), 3, "one arrival notice per green segment");
    let mut reassembled = Vec::new();
    let mut saw_eob = false;
    for notice in &notices {
        let SessionNotice::GreenSegmentArrival { data, end_of_block, .. } = notice else {
            panic!("expected green arrival");
        };
        reassembled.extend_from_slice(data);
        saw_eob |= end_of_block;
    }
    assert!(saw_eob);
    assert_eq!(reassembled, green);

    // pure-green sender completes once flushed
    assert_eq!(sender.state(), SenderState::Closed);
    assert!(matches!(
        sender.drain_notices().as_slice(),
        [SessionNotice::SessionCompleted { .. }]
    ));
}

#[tokio::test(start_paused = true)]
async fn test_oversized_red_part_cancels_sys() {
    let mut cfg = test_cfg();
    cfg.max_red_rx_bytes = 4096;
    let mut timers = Timers::new();
    let now = Instant::now();
    let session_id = SessionId::new(1, 15);

    use dtn_router_rs::models::ltp::{DataSegment, SegmentType};
    let mut receiver = ReceiverSession::new(session_id, &cfg, 500);
    receiver.on_data_segment(
        SegmentType::RedData,
        DataSegment {
            client_service_id: 1,
            offset: 8000,
            data: vec![0; 100],
            checkpoint: None,
        },
        &cfg,
        &mut timers,
        now,
    );

    match receiver.drain_notices().as_slice() {
        [SessionNotice::SessionCancelled { reason, .. }] => {
            assert_eq!(*reason, CancelReason::SystemCancelled);
        },
        other => panic!("expected sys cancel, got {other:?}"),
    }
    // a cancel-from-receiver segment is queued for the peer
    let mut out = Vec::new();
    drain_rx(&mut out, &mut receiver);
    assert!(matches!(
        out.as_slice(),
        [Segment {
            body: SegmentBody::Cancel { .. },
            ..
        }]
    ));
}
