// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::HashMap, sync::Arc};

use anyhow::{Context, Result};
use dtn_router_rs::{
    cfg::{cli::config_path_from_env_or, config::Config, logger::init_logger},
    custody::manager::CustodyTransferManager,
    ducts::{EgressRelay, Outduct, StcpOutduct, UdpOutduct},
    ingress::dispatcher::{IngressConfig, IngressDispatcher},
    models::eid::Eid,
    storage::{relay::StorageRelay, store::BundleStorageManager},
};
use tokio::{net::{TcpStream, UdpSocket}, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg_path = config_path_from_env_or("config/router.yaml")?;
    let cfg = Config::load_from_file(&cfg_path)
        .with_context(|| format!("failed to load {}", cfg_path.display()))?;

    // every log record carries the node id, so the config comes first
    let _logger_guard = init_logger("config/logger.yaml", cfg.router.my_node_id)?;
    info!(node_id = cfg.router.my_node_id, "router starting");

    let cancel = CancellationToken::new();

    let dispatcher = Arc::new(IngressDispatcher::new(IngressConfig {
        my_node_id: cfg.router.my_node_id,
        my_custodial_service_id: cfg.router.my_custodial_service_id,
        my_bp_echo_service_id: cfg.router.my_bp_echo_service_id,
        max_bundle_size_bytes: cfg.router.max_bundle_size_bytes,
        max_messages_per_path: cfg.router.max_messages_per_path,
        max_ingress_wait_on_egress: cfg.router.max_ingress_bundle_wait_on_egress,
        is_cut_through_only_test: cfg.router.cut_through_only_test,
    }));

    // fabric channels: ingress → egress, ingress → storage, acks back
    let (to_egress_tx, to_egress_rx) = mpsc::channel(64);
    let (to_storage_tx, to_storage_rx) = mpsc::channel(64);
    let (egress_ack_tx, mut egress_ack_rx) = mpsc::channel(64);
    let (storage_ack_tx, mut storage_ack_rx) = mpsc::channel(64);
    let (transport_ack_tx, transport_ack_rx) = mpsc::channel(64);
    dispatcher.bind_channels(to_egress_tx, to_storage_tx);

    // storage relay, which also owns the custody transfer manager: custody
    // decisions happen where the bundle is filed
    let store = BundleStorageManager::open(
        &cfg.storage.store_path,
        cfg.storage.segment_count,
    )?;
    let custody = CustodyTransferManager::new(
        cfg.router.is_acs_aware,
        cfg.router.my_node_id,
        cfg.router.my_custodial_service_id,
    );
    let storage_relay = StorageRelay::new(
        store,
        custody,
        Arc::clone(&dispatcher),
        to_storage_rx,
        storage_ack_tx,
        cancel.clone(),
    );
    tokio::spawn(storage_relay.run());

    // outducts from config (tcpcl/ltp outducts are attached as their
    // sessions come up; udp and stcp connect eagerly here)
    let mut outducts: HashMap<Eid, Arc<Outduct>> = HashMap::new();
    for element in &cfg.outducts {
        let remote = format!("{}:{}", element.remote_hostname, element.remote_port);
        let duct = match element.convergence_layer {
            dtn_router_rs::cfg::enums::ConvergenceLayer::Udp => {
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                let remote = tokio::net::lookup_host(&remote)
                    .await?
                    .next()
                    .context("outduct hostname resolves to nothing")?;
                Some(Outduct::Udp(UdpOutduct::new(socket, remote)))
            },
            dtn_router_rs::cfg::enums::ConvergenceLayer::Stcp => {
                match TcpStream::connect(&remote).await {
                    Ok(stream) => {
                        let (_r, w) = stream.into_split();
                        Some(Outduct::Stcp(StcpOutduct::new(w)))
                    },
                    Err(e) => {
                        warn!(%remote, error = %e, "stcp outduct connect failed");
                        None
                    },
                }
            },
            other => {
                info!(cl = %other, %remote, "session-based outduct deferred to link-up");
                None
            },
        };
        if let Some(duct) = duct {
            let duct = Arc::new(duct);
            for uri in &element.final_destination_eid_uris {
                let eid: Eid = uri.parse().expect("validated at config load");
                if outducts.insert(eid, Arc::clone(&duct)).is_some() {
                    warn!(%eid, "duplicate outduct route replaced");
                }
            }
        }
    }
    let egress_relay = EgressRelay::new(
        outducts,
        to_egress_rx,
        egress_ack_tx,
        transport_ack_rx,
        cancel.clone(),
    );
    tokio::spawn(egress_relay.run());
    // transport_ack_tx stays alive: session-based outducts (tcpcl, ltp)
    // clone it as their sessions come up
    let _transport_ack_tx = transport_ack_tx;

    // ack readers feeding the dispatcher's fifo queues
    {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            while let Some(hdr) = egress_ack_rx.recv().await {
                if let Err(e) = dispatcher.handle_egress_ack(&hdr) {
                    warn!(error = %e, "egress ack stream violation");
                }
            }
        });
    }
    {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            while let Some(hdr) = storage_ack_rx.recv().await {
                if let Err(e) = dispatcher.handle_storage_ack(&hdr) {
                    warn!(error = %e, "storage ack stream violation");
                }
            }
        });
    }

    // inducts from config
    for element in &cfg.inducts {
        let dispatcher = Arc::clone(&dispatcher);
        let cancel = cancel.clone();
        match element.convergence_layer {
            dtn_router_rs::cfg::enums::ConvergenceLayer::Udp => {
                let max_packet = cfg.router.max_ltp_receive_udp_packet_size_bytes;
                let port = element.bound_port;
                tokio::spawn(async move {
                    if let Err(e) =
                        dtn_router_rs::ducts::inducts::run_udp_induct(
                            dispatcher, port, max_packet, cancel,
                        )
                        .await
                    {
                        warn!(error = %e, "udp induct exited");
                    }
                });
            },
            dtn_router_rs::cfg::enums::ConvergenceLayer::Stcp => {
                let max_bundle = cfg.router.max_bundle_size_bytes;
                let port = element.bound_port;
                tokio::spawn(async move {
                    if let Err(e) =
                        dtn_router_rs::ducts::inducts::run_stcp_induct(
                            dispatcher, port, max_bundle, cancel,
                        )
                        .await
                    {
                        warn!(error = %e, "stcp induct exited");
                    }
                });
            },
            dtn_router_rs::cfg::enums::ConvergenceLayer::TcpclV3 => {
                let element = element.clone();
                let local_eid = Eid::new(cfg.router.my_node_id, 0).to_string();
                tokio::spawn(async move {
                    if let Err(e) =
                        dtn_router_rs::ducts::inducts::run_tcpcl_induct(
                            dispatcher, element, local_eid, cancel,
                        )
                        .await
                    {
                        warn!(error = %e, "tcpcl induct exited");
                    }
                });
            },
            dtn_router_rs::cfg::enums::ConvergenceLayer::LtpOverUdp => {
                let element = element.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        dtn_router_rs::ducts::inducts::run_ltp_induct(
                            dispatcher, element, cancel,
                        )
                        .await
                    {
                        warn!(error = %e, "ltp induct exited");
                    }
                });
            },
        }
    }

    info!(
        max_messages_per_path = cfg.router.max_messages_per_path,
        "ingress running"
    );

    tokio::signal::ctrl_c().await.context("signal wait")?;
    info!("shutdown requested");
    cancel.cancel();
    dispatcher.log_final_stats();
    Ok(())
}
