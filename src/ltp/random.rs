// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Session- and serial-number source.
//!
//! Numbers must be hard to guess (they gate off-path segment injection) yet
//! collision-free within a run.  A fresh 64-bit random draw keeps the top 48
//! bits; the low 16 bits come from an incrementing counter, so two draws can
//! never collide until the counter wraps 65536 sessions later.

use rand::RngExt;

#[derive(Debug)]
pub struct RandomNumberGenerator {
    incremental_part: u16,
}

impl Default for RandomNumberGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomNumberGenerator {
    pub fn new() -> Self {
        Self {
            incremental_part: rand::rng().random(),
        }
    }

    /// Next session / serial number: random top bits, counter low bits,
    /// never zero (zero is reserved on the wire for "no serial").
    pub fn next_u64(&mut self) -> u64 {
        let random_part: u64 = rand::rng().random();
        let value = (random_part & !0xffff) | u64::from(self.incremental_part);
        self.incremental_part = self.incremental_part.wrapping_add(1);
        if value == 0 { 1 } else { value }
    }
}
