// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::cfg::enums::ConvergenceLayer;

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Node identity and dataplane limits.
    pub router: RouterConfig,
    /// Bundle store location and sizing.
    pub storage: StorageConfig,
    /// Receiver-side convergence-layer endpoints.
    #[serde(rename = "inducts", default)]
    pub inducts: Vec<InductElement>,
    /// Sender-side convergence-layer endpoints.
    #[serde(rename = "outducts", default)]
    pub outducts: Vec<OutductElement>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RouterConfig {
    #[serde(rename = "myNodeId")]
    /// This node's ipn node number (mandatory, nonzero).
    pub my_node_id: u64,

    #[serde(rename = "myCustodialServiceId", default)]
    /// Custodial/administration service number; service 0 by convention.
    pub my_custodial_service_id: u64,

    #[serde(rename = "myBpEchoServiceId", default = "default_echo_service_id")]
    /// Service number answering echo (ping) bundles.
    pub my_bp_echo_service_id: u64,

    #[serde(rename = "maxBundleSizeBytes", default = "default_max_bundle_size")]
    /// Bundles larger than this are rejected before parsing.
    pub max_bundle_size_bytes: usize,

    #[serde(
        rename = "maxLtpReceiveUdpPacketSizeBytes",
        default = "default_max_ltp_udp_packet"
    )]
    /// Receive buffer sizing for LTP-over-UDP inducts.
    pub max_ltp_receive_udp_packet_size_bytes: usize,

    #[serde(rename = "maxMessagesPerPath", default = "default_max_messages_per_path")]
    /// Outstanding-ack depth per path before ingress exerts backpressure.
    pub max_messages_per_path: usize,

    #[serde(
        rename = "maxIngressBundleWaitOnEgressMilliseconds",
        with = "serde_millis",
        default = "default_ingress_wait"
    )]
    /// Bounded cut-through wait; zero falls straight through to storage.
    pub max_ingress_bundle_wait_on_egress: Duration,

    #[serde(rename = "isAcsAware", default = "default_true")]
    /// Aggregate custody signals instead of per-bundle RFC 5050 signals.
    pub is_acs_aware: bool,

    #[serde(rename = "cutThroughOnlyTest", default)]
    /// Test mode: no storage fallback, drop on egress backpressure.
    pub cut_through_only_test: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct StorageConfig {
    #[serde(rename = "storePath", default = "default_store_path")]
    /// Backing file of the memory-mapped segment store.
    pub store_path: String,

    #[serde(rename = "segmentCount", default = "default_segment_count")]
    /// Total 4 KiB segments in the store.
    pub segment_count: u32,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct InductElement {
    #[serde(rename = "convergenceLayer")]
    pub convergence_layer: ConvergenceLayer,

    #[serde(rename = "boundPort")]
    pub bound_port: u16,

    #[serde(rename = "keepAliveIntervalSeconds", default = "default_keepalive")]
    /// TCPCL only; zero disables keepalives.
    pub keep_alive_interval_seconds: u16,

    #[serde(rename = "thisLtpEngineId", default)]
    /// LTP only: the receiving engine id.
    pub this_ltp_engine_id: u64,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct OutductElement {
    #[serde(rename = "convergenceLayer")]
    pub convergence_layer: ConvergenceLayer,

    #[serde(rename = "remoteHostname")]
    pub remote_hostname: String,

    #[serde(rename = "remotePort")]
    pub remote_port: u16,

    #[serde(rename = "finalDestinationEidUris", default)]
    /// `ipn:N.S` uris routed through this outduct.
    pub final_destination_eid_uris: Vec<String>,

    #[serde(rename = "fragmentSize", default)]
    /// TCPCL only; zero disables fragmentation.
    pub fragment_size: usize,

    #[serde(rename = "keepAliveIntervalSeconds", default = "default_keepalive")]
    pub keep_alive_interval_seconds: u16,

    #[serde(rename = "thisLtpEngineId", default)]
    pub this_ltp_engine_id: u64,

    #[serde(rename = "oneWayLightTimeMs", with = "serde_millis", default = "default_owlt")]
    /// LTP only: nominal propagation delay seeding retransmission timers.
    pub one_way_light_time: Duration,

    #[serde(rename = "oneWayMarginTimeMs", with = "serde_millis", default = "default_margin")]
    pub one_way_margin_time: Duration,
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(self.router.my_node_id != 0, "myNodeId must be nonzero");
        ensure!(
            self.router.max_bundle_size_bytes >= 64,
            "maxBundleSizeBytes too small"
        );
        ensure!(
            self.router.max_messages_per_path >= 1,
            "maxMessagesPerPath must be >= 1"
        );
        ensure!(self.storage.segment_count >= 16, "segmentCount too small");

        for outduct in &self.outducts {
            ensure!(
                !outduct.remote_hostname.is_empty(),
                "outduct remoteHostname must not be empty"
            );
            for uri in &outduct.final_destination_eid_uris {
                uri.parse::<crate::models::eid::Eid>()
                    .with_context(|| format!("bad final destination uri {uri:?}"))?;
            }
        }
        Ok(())
    }
}

fn default_echo_service_id() -> u64 {
    2047
}
fn default_max_bundle_size() -> usize {
    10 * 1024 * 1024
}
fn default_max_ltp_udp_packet() -> usize {
    65536
}
fn default_max_messages_per_path() -> usize {
    32
}
fn default_ingress_wait() -> Duration {
    Duration::from_millis(2000)
}
fn default_true() -> bool {
    true
}
fn default_store_path() -> String {
    "dtn.store".to_string()
}
fn default_segment_count() -> u32 {
    8192
}
fn default_keepalive() -> u16 {
    15
}
fn default_owlt() -> Duration {
    Duration::from_millis(1)
}
fn default_margin() -> Duration {
    Duration::from_millis(200)
}

/// Serde helpers for representing `Duration` as a number of milliseconds.
mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}
