// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Self-Delimiting Numeric Value codec (RFC 5050 § 4.1 / RFC 6256).
//!
//! An SDNV carries an unsigned integer in big-endian 7-bit groups; the high
//! bit of every octet except the last is set.  A `u64` never needs more than
//! ten octets.

use crate::models::error::CodecError;

/// Upper bound on the encoded length of a `u64` SDNV.
pub const MAX_SDNV_LEN: usize = 10;

/// Appends the SDNV encoding of `value` to `out` and returns the number of
/// octets written.
pub fn encode(value: u64, out: &mut Vec<u8>) -> usize {
    let mut tmp = [0u8; MAX_SDNV_LEN];
    let mut idx = MAX_SDNV_LEN;
    let mut v = value;
    loop {
        idx -= 1;
        tmp[idx] = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            break;
        }
    }
    let len = MAX_SDNV_LEN - idx;
    for (i, byte) in tmp[idx..].iter().enumerate() {
        // continuation bit on all but the final octet
        out.push(if i + 1 < len { byte | 0x80 } else { *byte });
    }
    len
}

/// Decodes one SDNV from the front of `buf`, returning `(value, octets_read)`.
pub fn decode(buf: &[u8]) -> Result<(u64, usize), CodecError> {
    let mut value: u64 = 0;
    for (i, byte) in buf.iter().enumerate() {
        if i >= MAX_SDNV_LEN {
            return Err(CodecError::malformed("sdnv", "exceeds 10 octets"));
        }
        if value > (u64::MAX >> 7) {
            return Err(CodecError::malformed("sdnv", "overflows u64"));
        }
        value = (value << 7) | u64::from(byte & 0x7f);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(CodecError::malformed("sdnv", "truncated (no terminal octet)"))
}

/// Number of octets `value` occupies when SDNV-encoded.
#[inline]
pub fn encoded_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    core::cmp::max(1, bits.div_ceil(7))
}
