// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Block CRC helpers.  A BPv7 CRC is computed over the entire CBOR-encoded
//! block with the CRC field itself present but zero-filled.

use crc::{CRC_16_IBM_SDLC, Crc};

use crate::models::bpv7::CrcType;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_SDLC);

/// Computes the declared CRC over `block_bytes` (CRC field zeroed by the
/// caller).  Returns the value widened to u32 for uniform comparison.
pub fn compute(crc_type: CrcType, block_bytes: &[u8]) -> u32 {
    match crc_type {
        CrcType::None => 0,
        CrcType::Crc16 => u32::from(CRC16.checksum(block_bytes)),
        CrcType::Crc32c => crc32c::crc32c(block_bytes),
    }
}

/// Big-endian CRC bytes of the declared width.
pub fn to_bytes(crc_type: CrcType, value: u32) -> [u8; 4] {
    match crc_type {
        CrcType::Crc16 => {
            let b = (value as u16).to_be_bytes();
            [b[0], b[1], 0, 0]
        },
        _ => value.to_be_bytes(),
    }
}
