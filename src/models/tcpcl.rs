// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! TCPCL version 3 framing (RFC 7242): the `dtn!` contact header plus the
//! six one-byte-typed messages.  The decoder is incremental: feed it a
//! receive buffer and it yields complete items, leaving partial ones in
//! place.

use bitflags::bitflags;
use bytes::{Buf, BytesMut};

use crate::models::{error::CodecError, sdnv};

pub const CONTACT_HEADER_MAGIC: &[u8; 4] = b"dtn!";
pub const TCPCL_VERSION: u8 = 3;

bitflags! {
    /// Contact header flags (RFC 7242 § 4.1).
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct ContactHeaderFlags: u8 {
        const REQUEST_ACK_OF_BUNDLE_SEGMENTS = 1 << 0;
        const REQUEST_ENABLING_OF_REACTIVE_FRAGMENTATION = 1 << 1;
        const SUPPORT_BUNDLE_REFUSAL = 1 << 2;
        const REQUEST_SENDING_OF_LENGTH_MESSAGES = 1 << 3;
    }
}

/// Message type nibble (high 4 bits of the message's first byte).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    DataSegment = 0x1,
    AckSegment = 0x2,
    RefuseBundle = 0x3,
    Keepalive = 0x4,
    Shutdown = 0x5,
    Length = 0x6,
}

/// Data-segment flag bits (low nibble).
pub const DATA_FLAG_END: u8 = 0x1;
pub const DATA_FLAG_START: u8 = 0x2;

/// Shutdown flag bits (low nibble).
const SHUTDOWN_FLAG_HAS_REASON: u8 = 0x2;
const SHUTDOWN_FLAG_HAS_DELAY: u8 = 0x1;

/// Shutdown reason codes (RFC 7242 § 5.1).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    IdleTimeout = 0,
    VersionMismatch = 1,
    Busy = 2,
}

impl ShutdownReason {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => ShutdownReason::IdleTimeout,
            1 => ShutdownReason::VersionMismatch,
            2 => ShutdownReason::Busy,
            _ => return None,
        })
    }
}

/// The contact header exchanged once per direction at session start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactHeader {
    pub flags: ContactHeaderFlags,
    pub keepalive_interval_seconds: u16,
    pub eid: String,
}

impl ContactHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.eid.len());
        out.extend_from_slice(CONTACT_HEADER_MAGIC);
        out.push(TCPCL_VERSION);
        out.push(self.flags.bits());
        out.extend_from_slice(&self.keepalive_interval_seconds.to_be_bytes());
        sdnv::encode(self.eid.len() as u64, &mut out);
        out.extend_from_slice(self.eid.as_bytes());
        out
    }
}

/// Messages that follow the contact-header exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    DataSegment {
        start: bool,
        end: bool,
        data: Vec<u8>,
    },
    AckSegment {
        cumulative_bytes: u64,
    },
    RefuseBundle {
        reason_code: u8,
    },
    Keepalive,
    Shutdown {
        reason: Option<ShutdownReason>,
        reconnection_delay_seconds: Option<u64>,
    },
    Length {
        next_bundle_length: u64,
    },
}

impl Message {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        match self {
            Message::DataSegment { start, end, data } => {
                let mut flags = 0u8;
                if *start {
                    flags |= DATA_FLAG_START;
                }
                if *end {
                    flags |= DATA_FLAG_END;
                }
                out.push(((MessageType::DataSegment as u8) << 4) | flags);
                sdnv::encode(data.len() as u64, &mut out);
                out.extend_from_slice(data);
            },
            Message::AckSegment { cumulative_bytes } => {
                out.push((MessageType::AckSegment as u8) << 4);
                sdnv::encode(*cumulative_bytes, &mut out);
            },
            Message::RefuseBundle { reason_code } => {
                out.push(((MessageType::RefuseBundle as u8) << 4) | (reason_code & 0x0f));
            },
            Message::Keepalive => {
                out.push((MessageType::Keepalive as u8) << 4);
            },
            Message::Shutdown {
                reason,
                reconnection_delay_seconds,
            } => {
                let mut flags = 0u8;
                if reason.is_some() {
                    flags |= SHUTDOWN_FLAG_HAS_REASON;
                }
                if reconnection_delay_seconds.is_some() {
                    flags |= SHUTDOWN_FLAG_HAS_DELAY;
                }
                out.push(((MessageType::Shutdown as u8) << 4) | flags);
                if let Some(r) = reason {
                    out.push(*r as u8);
                }
                if let Some(d) = reconnection_delay_seconds {
                    sdnv::encode(*d, &mut out);
                }
            },
            Message::Length { next_bundle_length } => {
                out.push((MessageType::Length as u8) << 4);
                sdnv::encode(*next_bundle_length, &mut out);
            },
        }
        out
    }
}

/// Incremental decoder output: either not enough buffered bytes yet, or one
/// complete item plus the number of bytes it consumed.
enum Decoded<T> {
    NeedMore,
    Item(T, usize),
}

fn decode_sdnv_partial(buf: &[u8]) -> Result<Decoded<u64>, CodecError> {
    match sdnv::decode(buf) {
        Ok((v, n)) => Ok(Decoded::Item(v, n)),
        Err(_) if buf.len() < sdnv::MAX_SDNV_LEN && buf.iter().all(|b| b & 0x80 != 0) => {
            Ok(Decoded::NeedMore)
        },
        Err(e) => Err(e),
    }
}

/// Tries to decode a contact header from the front of `buf`; consumes it on
/// success, leaves the buffer untouched when incomplete.
pub fn try_decode_contact_header(
    buf: &mut BytesMut,
) -> Result<Option<ContactHeader>, CodecError> {
    if buf.len() < 8 {
        return Ok(None);
    }
    if &buf[..4] != CONTACT_HEADER_MAGIC {
        return Err(CodecError::malformed("tcpcl contact header", "bad magic"));
    }
    if buf[4] != TCPCL_VERSION {
        return Err(CodecError::malformed(
            "tcpcl contact header",
            format!("version {} unsupported", buf[4]),
        ));
    }
    let flags = ContactHeaderFlags::from_bits_truncate(buf[5]);
    let keepalive = u16::from_be_bytes([buf[6], buf[7]]);
    let (eid_len, sdnv_len) = match decode_sdnv_partial(&buf[8..])? {
        Decoded::NeedMore => return Ok(None),
        Decoded::Item(v, n) => (v as usize, n),
    };
    let total = 8 + sdnv_len + eid_len;
    if buf.len() < total {
        return Ok(None);
    }
    let eid = core::str::from_utf8(&buf[8 + sdnv_len..total])
        .map_err(|_| CodecError::malformed("tcpcl contact header", "eid not utf-8"))?
        .to_string();
    buf.advance(total);
    Ok(Some(ContactHeader {
        flags,
        keepalive_interval_seconds: keepalive,
        eid,
    }))
}

/// Tries to decode one post-contact message from the front of `buf`.
pub fn try_decode_message(buf: &mut BytesMut) -> Result<Option<Message>, CodecError> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };
    let type_nibble = first >> 4;
    let flags = first & 0x0f;

    let decoded = match type_nibble {
        t if t == MessageType::DataSegment as u8 => {
            let (len, n) = match decode_sdnv_partial(&buf[1..])? {
                Decoded::NeedMore => return Ok(None),
                Decoded::Item(v, n) => (v as usize, n),
            };
            let total = 1 + n + len;
            if buf.len() < total {
                return Ok(None);
            }
            let data = buf[1 + n..total].to_vec();
            Decoded::Item(
                Message::DataSegment {
                    start: flags & DATA_FLAG_START != 0,
                    end: flags & DATA_FLAG_END != 0,
                    data,
                },
                total,
            )
        },
        t if t == MessageType::AckSegment as u8 => {
            match decode_sdnv_partial(&buf[1..])? {
                Decoded::NeedMore => return Ok(None),
                Decoded::Item(v, n) => Decoded::Item(
                    Message::AckSegment { cumulative_bytes: v },
                    1 + n,
                ),
            }
        },
        t if t == MessageType::RefuseBundle as u8 => {
            Decoded::Item(Message::RefuseBundle { reason_code: flags }, 1)
        },
        t if t == MessageType::Keepalive as u8 => Decoded::Item(Message::Keepalive, 1),
        t if t == MessageType::Shutdown as u8 => {
            let mut pos = 1usize;
            let reason = if flags & SHUTDOWN_FLAG_HAS_REASON != 0 {
                let Some(&code) = buf.get(pos) else {
                    return Ok(None);
                };
                pos += 1;
                Some(ShutdownReason::from_u8(code).ok_or_else(|| {
                    CodecError::malformed("tcpcl shutdown", "bad reason code")
                })?)
            } else {
                None
            };
            let delay = if flags & SHUTDOWN_FLAG_HAS_DELAY != 0 {
                match decode_sdnv_partial(&buf[pos..])? {
                    Decoded::NeedMore => return Ok(None),
                    Decoded::Item(v, n) => {
                        pos += n;
                        Some(v)
                    },
                }
            } else {
                None
            };
            Decoded::Item(
                Message::Shutdown {
                    reason,
                    reconnection_delay_seconds: delay,
                },
                pos,
            )
        },
        t if t == MessageType::Length as u8 => match decode_sdnv_partial(&buf[1..])? {
            Decoded::NeedMore => return Ok(None),
            Decoded::Item(v, n) => Decoded::Item(
                Message::Length {
                    next_bundle_length: v,
                },
                1 + n,
            ),
        },
        other => {
            return Err(CodecError::malformed(
                "tcpcl message",
                format!("unknown message type nibble {other:#x}"),
            ));
        },
    };

    match decoded {
        Decoded::NeedMore => Ok(None),
        Decoded::Item(msg, consumed) => {
            buf.advance(consumed);
            Ok(Some(msg))
        },
    }
}
