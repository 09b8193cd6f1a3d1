// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Overlay node initialization.

use crate::{
    config::LocnetConfig,
    delay::Periodic,
    dispatch::{Dispatcher, Interface},
    error::Error,
    event::{self, EventBridge, EventRx},
    local::LocalNode,
    node::{
        self,
        maintenance::{self, DiscoveryTask, MaintenanceTask},
        Node, OverlayParams,
    },
    peer::{NodeInfo, NodeProfile, SpatialDatabase},
    proxy::{DetectedIpCallback, TcpConnector},
    server::{self, AcceptLoop},
    task,
};

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

/// A handle to the running overlay node. The bound addresses carry the
/// actual ports, so configuring port 0 is supported.
pub struct LocnetHandle {
    /// The bound node-to-node listener address.
    pub node_addr: SocketAddr,
    /// The bound local-service listener address.
    pub local_service_addr: SocketAddr,
    /// The bound client listener address.
    pub client_addr: SocketAddr,
    /// The overlay event stream.
    pub events: EventRx,
}

/// Initializes the overlay node: binds the three interface listeners,
/// wires the engine to the given spatial database, and spawns the
/// maintenance and discovery workers. The node runs until `quit_signal`
/// resolves.
pub async fn init<Q>(config: LocnetConfig, db: Arc<dyn SpatialDatabase>, quit_signal: Q) -> Result<LocnetHandle, Error>
where
    Q: Future + Send + 'static,
{
    let profile = NodeProfile::new(&config.node_id, config.advertised_contacts.clone())?;
    let local = LocalNode::new(NodeInfo::new(profile, config.location));

    log::info!("Node id: {}", config.node_id);
    log::info!("Location: {}", config.location);
    log::info!(
        "Listen ports: node {}, local {}, client {}",
        config.listen_ports.node,
        config.listen_ports.local,
        config.listen_ports.client
    );
    if config.is_test_mode {
        log::info!("Running in test mode.");
    }

    // Event channel to publish overlay events to the embedding application;
    // database changes are republished onto it by a bridge listener.
    let (event_tx, event_rx) = event::event_chan();
    db.add_listener(Box::new(EventBridge::new(event_tx.clone())));

    // The proxy reports echoed external addresses back into the local
    // entity, the engine's only post-construction self mutation.
    let detected_ip_callback: DetectedIpCallback = {
        let local = local.clone();
        let event_tx = event_tx.clone();
        let node_port = config.listen_ports.node;
        Arc::new(move |address| node::adopt_detected_address(&local, node_port, &event_tx, address))
    };
    let connector = Arc::new(TcpConnector::new(Some(detected_ip_callback)));

    let params = OverlayParams::from_config(&config);
    let node = Node::new(local, Arc::clone(&db), connector, params, event_tx);

    // Bind all three listeners before anything is spawned, so that a port
    // clash fails the whole initialization.
    let node_listener = server::bind(config.listen_ports.node).await?;
    let local_listener = server::bind(config.listen_ports.local).await?;
    let client_listener = server::bind(config.listen_ports.client).await?;
    let node_addr = node_listener.local_addr()?;
    let local_service_addr = local_listener.local_addr()?;
    let client_addr = client_listener.local_addr()?;

    // One flag reaches the accept loops, the session loops and the
    // periodic workers alike.
    let (shutdown_tx, shutdown_rx) = task::shutdown_chan();

    // In test mode every listener serves all three interfaces.
    let serve_all = config.is_test_mode;
    task::spawn_runnable(
        AcceptLoop::new(
            node_listener,
            Dispatcher::new(node.clone(), Interface::RemoteNode, serve_all),
        ),
        shutdown_rx.clone(),
    );
    task::spawn_runnable(
        AcceptLoop::new(
            local_listener,
            Dispatcher::new(node.clone(), Interface::LocalService, serve_all),
        ),
        shutdown_rx.clone(),
    );
    task::spawn_runnable(
        AcceptLoop::new(
            client_listener,
            Dispatcher::new(node.clone(), Interface::Client, serve_all),
        ),
        shutdown_rx.clone(),
    );

    // Renewal + expiry, and world-map upkeep, on their own schedules.
    task::repeat(
        MaintenanceTask { node: node.clone() },
        Periodic::new(Duration::from_secs(config.db_maintenance_period)).with_jitter(0.9),
        shutdown_rx.clone(),
    );
    task::repeat(
        DiscoveryTask { node: node.clone() },
        Periodic::new(Duration::from_secs(config.discovery_period)).with_jitter(0.9),
        shutdown_rx,
    );

    // One immediate bootstrap round; an incomplete fill is retried by the
    // discovery worker.
    let bootstrap_node = node.clone();
    task::spawn_detached("Bootstrap", async move {
        maintenance::ensure_map_filled(&bootstrap_node).await;
    });

    // Await the shutdown signal in a separate task.
    task::spawn_detached("Shutdown-Waiter", async move {
        quit_signal.await;
        log::info!("Shutting down.");
        shutdown_tx.notify();
    });

    log::debug!("Locnet node initialized.");

    Ok(LocnetHandle {
        node_addr,
        local_service_addr,
        client_addr,
        events: event_rx,
    })
}
