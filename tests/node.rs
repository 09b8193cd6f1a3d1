// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests driving a running overlay node over localhost TCP.

use locnet::{
    init, AddressType, Event, GpsLocation, InMemorySpatialDb, ListenPorts, LocnetConfig, NeighbourFilter,
    NetworkEndpoint, NetworkInterface, NodeContactRole, NodeDbEntry, NodeInfo, NodeProfile, NodeProxy, NodeRelation,
    RemoteNode, SpatialDatabase,
};

use std::{
    future,
    io,
    sync::{Arc, Once},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

static LOGGER: Once = Once::new();

fn setup_logger() {
    LOGGER.call_once(|| {
        fern::Dispatch::new()
            .level(log::LevelFilter::Debug)
            .chain(io::stdout())
            .apply()
            .expect("fern");
    });
}

fn test_config(node_id: &str, latitude: f64, longitude: f64, seeds: Vec<NetworkEndpoint>) -> LocnetConfig {
    LocnetConfig {
        node_id: node_id.to_string(),
        listen_ports: ListenPorts {
            node: 0,
            local: 0,
            client: 0,
        },
        advertised_contacts: Vec::new(),
        seeds,
        location: GpsLocation::new(latitude, longitude).unwrap(),
        db_path: None,
        db_expiration_period: 3600,
        db_maintenance_period: 3600,
        discovery_period: 3600,
        renewal_period: 1800,
        neighbourhood_target: 4,
        colleague_target: 4,
        is_test_mode: true,
    }
}

fn unix_now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

fn node_info(id: &str, latitude: f64, longitude: f64, port: u16) -> NodeInfo {
    NodeInfo::new(
        NodeProfile::new(
            id,
            vec![NetworkInterface::new(AddressType::Ipv4, "127.0.0.1", port).unwrap()],
        )
        .unwrap(),
        GpsLocation::new(latitude, longitude).unwrap(),
    )
}

fn entry(id: &str, latitude: f64, longitude: f64, relation: NodeRelation) -> NodeDbEntry {
    NodeDbEntry::new(
        node_info(id, latitude, longitude, 6666),
        relation,
        NodeContactRole::Acceptor,
        unix_now_secs() + 3600,
    )
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn node_interface_answers_spatial_queries() {
    setup_logger();

    let config = test_config("Budapest", 47.4979, 19.0402, Vec::new());
    let budapest = config.location;

    let db = Arc::new(InMemorySpatialDb::new(budapest));
    db.store(entry("Kecskemet", 46.9065, 19.6913, NodeRelation::Neighbour)).unwrap();
    db.store(entry("Wien", 48.2082, 16.3738, NodeRelation::Neighbour)).unwrap();
    db.store(entry("London", 51.5074, -0.1278, NodeRelation::Colleague)).unwrap();
    db.store(entry("NewYork", 40.7128, -74.0060, NodeRelation::Colleague)).unwrap();
    db.store(entry("CapeTown", -33.9249, 18.4241, NodeRelation::Colleague)).unwrap();

    let handle = init(config, db.clone() as Arc<dyn SpatialDatabase>, future::pending::<()>())
        .await
        .expect("initializing the overlay node failed");

    let endpoint = NetworkEndpoint::new("127.0.0.1", handle.node_addr.port());
    let mut proxy = NodeProxy::connect(&endpoint, None).await.unwrap();

    assert_eq!(proxy.get_node_info().await.unwrap().id(), "Budapest");
    assert_eq!(proxy.get_node_count().await.unwrap(), 5);

    let closest = proxy
        .get_closest_nodes_by_distance(&budapest, 20000.0, 1, NeighbourFilter::Included)
        .await
        .unwrap();
    assert_eq!(closest.len(), 1);
    assert_eq!(closest[0].id(), "Kecskemet");

    let closest = proxy
        .get_closest_nodes_by_distance(&budapest, 20000.0, 1000, NeighbourFilter::Included)
        .await
        .unwrap();
    let ids = closest.iter().map(|i| i.id().to_string()).collect::<Vec<_>>();
    assert_eq!(ids, ["Kecskemet", "Wien", "London", "NewYork", "CapeTown"]);

    let random = proxy.get_random_nodes(10, NeighbourFilter::Excluded).await.unwrap();
    let mut ids = random.iter().map(|i| i.id().to_string()).collect::<Vec<_>>();
    ids.sort();
    assert_eq!(ids, ["CapeTown", "London", "NewYork"]);
}

#[tokio::test]
async fn accept_and_renew_over_tcp() {
    setup_logger();

    let config = test_config("Acceptor", 47.4979, 19.0402, Vec::new());
    let db = Arc::new(InMemorySpatialDb::new(config.location));

    let mut handle = init(config, db.clone() as Arc<dyn SpatialDatabase>, future::pending::<()>())
        .await
        .unwrap();

    let endpoint = NetworkEndpoint::new("127.0.0.1", handle.node_addr.port());
    let mut proxy = NodeProxy::connect(&endpoint, None).await.unwrap();

    // The requestor claims a public address; the acceptor must store the
    // address it actually observed on the session.
    let requestor = NodeInfo::new(
        NodeProfile::new(
            "Wanderer",
            vec![NetworkInterface::new(AddressType::Ipv4, "198.51.100.23", 9999).unwrap()],
        )
        .unwrap(),
        GpsLocation::new(51.5074, -0.1278).unwrap(),
    );

    let acceptance = proxy.accept_colleague(requestor.clone()).await.unwrap();
    assert!(acceptance.accepted);
    assert_eq!(acceptance.acceptor_info.unwrap().id(), "Acceptor");

    let stored = db.lookup("Wanderer").unwrap();
    assert_eq!(stored.relation(), NodeRelation::Colleague);
    assert_eq!(stored.role(), NodeContactRole::Acceptor);
    assert_eq!(stored.info().profile().contacts()[0].address(), "127.0.0.1");

    match tokio::time::timeout(Duration::from_secs(5), handle.events.recv())
        .await
        .unwrap()
        .unwrap()
    {
        Event::PeerAdded { info, relation } => {
            assert_eq!(info.id(), "Wanderer");
            assert_eq!(relation, NodeRelation::Colleague);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    // Renewing the stored relation succeeds, renewing the wrong one is
    // refused.
    assert!(proxy.renew_colleague(requestor.clone()).await.unwrap().accepted);
    assert!(!proxy.renew_neighbour(requestor).await.unwrap().accepted);
}

#[tokio::test]
async fn bootstrap_acquires_colleagues_via_a_seed() {
    setup_logger();

    // A reachable stranger for the seed to hand out.
    let stranger_db = Arc::new(InMemorySpatialDb::new(GpsLocation::new(51.5074, -0.1278).unwrap()));
    let stranger_handle = init(
        test_config("NodeC", 51.5074, -0.1278, Vec::new()),
        stranger_db.clone() as Arc<dyn SpatialDatabase>,
        future::pending::<()>(),
    )
    .await
    .unwrap();

    // The seed node knows where the stranger listens.
    let seed_db = Arc::new(InMemorySpatialDb::new(GpsLocation::new(40.7128, -74.0060).unwrap()));
    seed_db
        .store(NodeDbEntry::new(
            node_info("NodeC", 51.5074, -0.1278, stranger_handle.node_addr.port()),
            NodeRelation::Colleague,
            NodeContactRole::Acceptor,
            unix_now_secs() + 3600,
        ))
        .unwrap();
    let seed_handle = init(
        test_config("SeedB", 40.7128, -74.0060, Vec::new()),
        seed_db.clone() as Arc<dyn SpatialDatabase>,
        future::pending::<()>(),
    )
    .await
    .unwrap();

    // The bootstrapping node pulls the stranger from the seed and invites
    // it into its world map.
    let joiner_db = Arc::new(InMemorySpatialDb::new(GpsLocation::new(47.4979, 19.0402).unwrap()));
    let _joiner_handle = init(
        test_config(
            "NodeA",
            47.4979,
            19.0402,
            vec![NetworkEndpoint::new("127.0.0.1", seed_handle.node_addr.port())],
        ),
        joiner_db.clone() as Arc<dyn SpatialDatabase>,
        future::pending::<()>(),
    )
    .await
    .unwrap();

    wait_until(|| joiner_db.lookup("NodeC").is_some()).await;
    let acquired = joiner_db.lookup("NodeC").unwrap();
    assert_eq!(acquired.relation(), NodeRelation::Colleague);
    assert_eq!(acquired.role(), NodeContactRole::Initiator);

    // The stranger mirrored the relation as the acceptor.
    wait_until(|| stranger_db.lookup("NodeA").is_some()).await;
    let mirrored = stranger_db.lookup("NodeA").unwrap();
    assert_eq!(mirrored.relation(), NodeRelation::Colleague);
    assert_eq!(mirrored.role(), NodeContactRole::Acceptor);
}
