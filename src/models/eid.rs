// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Endpoint identifier in the `ipn` scheme: a `(node, service)` pair with the
/// textual form `ipn:N.S`.
///
/// The all-zero EID is the null endpoint (`dtn:none` equivalent) and is used
/// as a sentinel for "no custodian" / "anonymous source".
#[repr(C)]
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    FromBytes,
    IntoBytes,
    KnownLayout,
    Immutable,
)]
pub struct Eid {
    pub node_id: u64,
    pub service_id: u64,
}

impl Eid {
    pub const NULL: Eid = Eid {
        node_id: 0,
        service_id: 0,
    };

    #[inline]
    pub const fn new(node_id: u64, service_id: u64) -> Self {
        Self {
            node_id,
            service_id,
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl fmt::Display for Eid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ipn:{}.{}", self.node_id, self.service_id)
    }
}

/// Returned when an `ipn:N.S` string cannot be parsed.
#[derive(Debug, Error)]
#[error("invalid ipn eid: {0:?}")]
pub struct InvalidEid(pub String);

impl FromStr for Eid {
    type Err = InvalidEid;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix("ipn:").ok_or_else(|| InvalidEid(s.into()))?;
        let (node, service) = rest.split_once('.').ok_or_else(|| InvalidEid(s.into()))?;
        let node_id = node.parse().map_err(|_| InvalidEid(s.into()))?;
        let service_id = service.parse().map_err(|_| InvalidEid(s.into()))?;
        Ok(Eid {
            node_id,
            service_id,
        })
    }
}
