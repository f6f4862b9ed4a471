// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Licklider Transmission Protocol segment codec (RFC 5326).
//!
//! Wire layout: control byte, session id (engine SDNV + session SDNV), one
//! extension-count byte (header count in the high nibble, trailer count in
//! the low nibble), header extensions, type-specific body, trailer
//! extensions.  The control byte's low 4 bits select the segment type.

use crate::models::{error::CodecError, sdnv};

/// LTP protocol version carried in the control byte's high nibble.
const LTP_VERSION: u8 = 0;

/// Session identifier: the sending engine plus its session number.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId {
    pub engine_id: u64,
    pub session_number: u64,
}

impl SessionId {
    pub const fn new(engine_id: u64, session_number: u64) -> Self {
        Self {
            engine_id,
            session_number,
        }
    }
}

impl core::fmt::Display for SessionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}", self.engine_id, self.session_number)
    }
}

/// Segment type nibble of the control byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentType {
    RedData = 0x0,
    RedDataCheckpoint = 0x1,
    RedDataCheckpointEndOfRedPart = 0x2,
    RedDataCheckpointEndOfRedPartEndOfBlock = 0x3,
    GreenData = 0x4,
    GreenDataEndOfBlock = 0x7,
    ReportSegment = 0x8,
    ReportAck = 0x9,
    CancelFromSender = 0xC,
    CancelAckToSender = 0xD,
    CancelFromReceiver = 0xE,
    CancelAckToReceiver = 0xF,
}

impl SegmentType {
    pub fn from_nibble(v: u8) -> Option<Self> {
        Some(match v {
            0x0 => SegmentType::RedData,
            0x1 => SegmentType::RedDataCheckpoint,
            0x2 => SegmentType::RedDataCheckpointEndOfRedPart,
            0x3 => SegmentType::RedDataCheckpointEndOfRedPartEndOfBlock,
            0x4 => SegmentType::GreenData,
            0x7 => SegmentType::GreenDataEndOfBlock,
            0x8 => SegmentType::ReportSegment,
            0x9 => SegmentType::ReportAck,
            0xC => SegmentType::CancelFromSender,
            0xD => SegmentType::CancelAckToSender,
            0xE => SegmentType::CancelFromReceiver,
            0xF => SegmentType::CancelAckToReceiver,
            _ => return None,
        })
    }

    #[inline]
    pub fn is_red_data(self) -> bool {
        matches!(
            self,
            SegmentType::RedData
                | SegmentType::RedDataCheckpoint
                | SegmentType::RedDataCheckpointEndOfRedPart
                | SegmentType::RedDataCheckpointEndOfRedPartEndOfBlock
        )
    }

    #[inline]
    pub fn is_green_data(self) -> bool {
        matches!(self, SegmentType::GreenData | SegmentType::GreenDataEndOfBlock)
    }

    #[inline]
    pub fn is_checkpoint(self) -> bool {
        matches!(
            self,
            SegmentType::RedDataCheckpoint
                | SegmentType::RedDataCheckpointEndOfRedPart
                | SegmentType::RedDataCheckpointEndOfRedPartEndOfBlock
        )
    }

    #[inline]
    pub fn is_end_of_red_part(self) -> bool {
        matches!(
            self,
            SegmentType::RedDataCheckpointEndOfRedPart
                | SegmentType::RedDataCheckpointEndOfRedPartEndOfBlock
        )
    }

    #[inline]
    pub fn is_end_of_block(self) -> bool {
        matches!(
            self,
            SegmentType::RedDataCheckpointEndOfRedPartEndOfBlock
                | SegmentType::GreenDataEndOfBlock
        )
    }
}

/// Session cancellation reason codes (RFC 5326 § 3.2.5).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    UserCancelled = 0,
    UnreachableClient = 1,
    RetransmissionLimitExceeded = 2,
    Miscolored = 3,
    SystemCancelled = 4,
    RetransmissionCycleLimitExceeded = 5,
}

impl CancelReason {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => CancelReason::UserCancelled,
            1 => CancelReason::UnreachableClient,
            2 => CancelReason::RetransmissionLimitExceeded,
            3 => CancelReason::Miscolored,
            4 => CancelReason::SystemCancelled,
            5 => CancelReason::RetransmissionCycleLimitExceeded,
            _ => return None,
        })
    }
}

/// One reception claim inside a report segment: `offset` is relative to the
/// report's lower bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceptionClaim {
    pub offset: u64,
    pub length: u64,
}

/// Data-segment payload descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSegment {
    pub client_service_id: u64,
    pub offset: u64,
    pub data: Vec<u8>,
    /// Present on checkpoints: `(checkpoint serial, report serial being
    /// responded to, zero for asynchronous checkpoints)`.
    pub checkpoint: Option<(u64, u64)>,
}

/// Report-segment body (RFC 5326 § 3.2.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportSegment {
    pub report_serial: u64,
    pub checkpoint_serial: u64,
    pub upper_bound: u64,
    pub lower_bound: u64,
    pub claims: Vec<ReceptionClaim>,
}

/// A fully decoded LTP segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub segment_type: SegmentType,
    pub session_id: SessionId,
    pub body: SegmentBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentBody {
    Data(DataSegment),
    Report(ReportSegment),
    ReportAck { report_serial: u64 },
    Cancel { reason: CancelReason },
    CancelAck,
}

impl Segment {
    pub fn data(
        session_id: SessionId,
        segment_type: SegmentType,
        ds: DataSegment,
    ) -> Self {
        debug_assert!(segment_type.is_red_data() || segment_type.is_green_data());
        Segment {
            segment_type,
            session_id,
            body: SegmentBody::Data(ds),
        }
    }

    pub fn report(session_id: SessionId, rs: ReportSegment) -> Self {
        Segment {
            segment_type: SegmentType::ReportSegment,
            session_id,
            body: SegmentBody::Report(rs),
        }
    }

    pub fn report_ack(session_id: SessionId, report_serial: u64) -> Self {
        Segment {
            segment_type: SegmentType::ReportAck,
            session_id,
            body: SegmentBody::ReportAck { report_serial },
        }
    }

    pub fn cancel(session_id: SessionId, from_sender: bool, reason: CancelReason) -> Self {
        Segment {
            segment_type: if from_sender {
                SegmentType::CancelFromSender
            } else {
                SegmentType::CancelFromReceiver
            },
            session_id,
            body: SegmentBody::Cancel { reason },
        }
    }

    pub fn cancel_ack(session_id: SessionId, to_sender: bool) -> Self {
        Segment {
            segment_type: if to_sender {
                SegmentType::CancelAckToSender
            } else {
                SegmentType::CancelAckToReceiver
            },
            session_id,
            body: SegmentBody::CancelAck,
        }
    }

    /// Encodes the segment into a datagram.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(match &self.body {
            SegmentBody::Data(ds) => 32 + ds.data.len(),
            _ => 48,
        });
        out.push((LTP_VERSION << 4) | self.segment_type as u8);
        sdnv::encode(self.session_id.engine_id, &mut out);
        sdnv::encode(self.session_id.session_number, &mut out);
        out.push(0); // no header or trailer extensions

        match &self.body {
            SegmentBody::Data(ds) => {
                sdnv::encode(ds.client_service_id, &mut out);
                sdnv::encode(ds.offset, &mut out);
                sdnv::encode(ds.data.len() as u64, &mut out);
                if self.segment_type.is_checkpoint() {
                    let (cp, rs) = ds.checkpoint.unwrap_or((0, 0));
                    sdnv::encode(cp, &mut out);
                    sdnv::encode(rs, &mut out);
                }
                out.extend_from_slice(&ds.data);
            },
            SegmentBody::Report(rs) => {
                sdnv::encode(rs.report_serial, &mut out);
                sdnv::encode(rs.checkpoint_serial, &mut out);
                sdnv::encode(rs.upper_bound, &mut out);
                sdnv::encode(rs.lower_bound, &mut out);
                sdnv::encode(rs.claims.len() as u64, &mut out);
                for claim in &rs.claims {
                    sdnv::encode(claim.offset, &mut out);
                    sdnv::encode(claim.length, &mut out);
                }
            },
            SegmentBody::ReportAck { report_serial } => {
                sdnv::encode(*report_serial, &mut out);
            },
            SegmentBody::Cancel { reason } => {
                out.push(*reason as u8);
            },
            SegmentBody::CancelAck => {},
        }
        out
    }

    /// Decodes one segment from a received datagram.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.is_empty() {
            return Err(CodecError::malformed("ltp segment", "empty datagram"));
        }
        let control = buf[0];
        if control >> 4 != LTP_VERSION {
            return Err(CodecError::malformed("ltp segment", "bad version nibble"));
        }
        let segment_type = SegmentType::from_nibble(control & 0x0f).ok_or_else(|| {
            CodecError::malformed("ltp segment", "reserved segment type")
        })?;

        let mut pos = 1usize;
        let mut next = |pos: &mut usize| -> Result<u64, CodecError> {
            let (v, n) = sdnv::decode(&buf[*pos..])?;
            *pos += n;
            Ok(v)
        };
        let engine_id = next(&mut pos)?;
        let session_number = next(&mut pos)?;
        let session_id = SessionId::new(engine_id, session_number);

        let ext_counts = *buf
            .get(pos)
            .ok_or_else(|| CodecError::malformed("ltp segment", "truncated header"))?;
        pos += 1;
        // skip extensions (tag byte, sdnv length, value)
        let header_ext = ext_counts >> 4;
        let trailer_ext = ext_counts & 0x0f;
        if trailer_ext != 0 {
            return Err(CodecError::malformed(
                "ltp segment",
                "trailer extensions unsupported",
            ));
        }
        for _ in 0..header_ext {
            pos += 1; // tag
            let len = next(&mut pos)? as usize;
            if buf.len() < pos + len {
                return Err(CodecError::malformed("ltp segment", "truncated extension"));
            }
            pos += len;
        }

        let body = match segment_type {
            t if t.is_red_data() || t.is_green_data() => {
                let client_service_id = next(&mut pos)?;
                let offset = next(&mut pos)?;
                let length = next(&mut pos)? as usize;
                let checkpoint = if t.is_checkpoint() {
                    Some((next(&mut pos)?, next(&mut pos)?))
                } else {
                    None
                };
                if buf.len() < pos + length {
                    return Err(CodecError::malformed("ltp segment", "truncated data"));
                }
                SegmentBody::Data(DataSegment {
                    client_service_id,
                    offset,
                    data: buf[pos..pos + length].to_vec(),
                    checkpoint,
                })
            },
            SegmentType::ReportSegment => {
                let report_serial = next(&mut pos)?;
                let checkpoint_serial = next(&mut pos)?;
                let upper_bound = next(&mut pos)?;
                let lower_bound = next(&mut pos)?;
                let count = next(&mut pos)? as usize;
                let mut claims = Vec::with_capacity(count);
                for _ in 0..count {
                    claims.push(ReceptionClaim {
                        offset: next(&mut pos)?,
                        length: next(&mut pos)?,
                    });
                }
                SegmentBody::Report(ReportSegment {
                    report_serial,
                    checkpoint_serial,
                    upper_bound,
                    lower_bound,
                    claims,
                })
            },
            SegmentType::ReportAck => SegmentBody::ReportAck {
                report_serial: next(&mut pos)?,
            },
            SegmentType::CancelFromSender | SegmentType::CancelFromReceiver => {
                let code = *buf.get(pos).ok_or_else(|| {
                    CodecError::malformed("ltp segment", "truncated cancel")
                })?;
                SegmentBody::Cancel {
                    reason: CancelReason::from_u8(code).ok_or_else(|| {
                        CodecError::malformed("ltp segment", "bad cancel reason")
                    })?,
                }
            },
            _ => SegmentBody::CancelAck,
        };

        Ok(Segment {
            segment_type,
            session_id,
            body,
        })
    }
}
