// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use serde::{Deserialize, Serialize};

/// Convergence-layer adapter selection for induct and outduct elements.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceLayer {
    #[serde(rename = "tcpcl_v3", alias = "tcpcl", alias = "TCPCL")]
    TcpclV3,
    #[serde(rename = "stcp", alias = "STCP")]
    Stcp,
    #[serde(rename = "udp", alias = "UDP")]
    Udp,
    #[serde(rename = "ltp_over_udp", alias = "ltp", alias = "LTP")]
    LtpOverUdp,
}

impl fmt::Display for ConvergenceLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConvergenceLayer::TcpclV3 => "tcpcl_v3",
            ConvergenceLayer::Stcp => "stcp",
            ConvergenceLayer::Udp => "udp",
            ConvergenceLayer::LtpOverUdp => "ltp_over_udp",
        })
    }
}

impl ConvergenceLayer {
    /// Reliable layers hold a bundle until the transport acknowledges it.
    pub fn is_reliable(self) -> bool {
        matches!(self, ConvergenceLayer::TcpclV3 | ConvergenceLayer::LtpOverUdp)
    }

    /// TCPCLv3 inducts are bidirectional and may carry reverse traffic.
    pub fn supports_opportunistic_reverse(self) -> bool {
        matches!(self, ConvergenceLayer::TcpclV3)
    }
}
