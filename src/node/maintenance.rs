// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The periodic overlay work: seed bootstrap, world-map discovery probes,
//! relation renewal and expiry.
//!
//! Every operation here is best-effort; a failed peer or connection is
//! logged and skipped, never propagated to the schedule.

use crate::{
    error::Error,
    event::Event,
    geo,
    node::Node,
    peer::{NeighbourFilter, NetworkEndpoint, NodeContactRole, NodeDbEntry, NodeInfo, NodeRelation},
    proxy::RemoteNode,
    task::RepeatedTask,
    time,
};

/// The world map divides bearings around the own node into this many equal
/// sectors; discovery aims a probe at every sector without a colleague.
const BEARING_SECTORS: usize = 16;

/// How far away from the own node a discovery probe location lies.
const DISCOVERY_PROBE_DISTANCE_KM: f64 = 5000.0;

/// Upper bound of peer connections per map-fill round.
const MAP_FILL_ATTEMPTS: usize = 16;

const RANDOM_NODE_REQUEST_COUNT: usize = 10;
const CLOSEST_NODE_REQUEST_COUNT: usize = 10;

/// The renewal + expiry worker.
pub(crate) struct MaintenanceTask {
    pub(crate) node: Node,
}

#[async_trait::async_trait]
impl RepeatedTask for MaintenanceTask {
    const NAME: &'static str = "Maintenance";

    async fn tick(&self) {
        self.node.db().expire_old_nodes();
        renew_node_relations(&self.node).await;
    }
}

/// The world-map worker: fills the map from the seeds until the colleague
/// target is met, then probes uncovered areas.
pub(crate) struct DiscoveryTask {
    pub(crate) node: Node,
}

#[async_trait::async_trait]
impl RepeatedTask for DiscoveryTask {
    const NAME: &'static str = "Discovery";

    async fn tick(&self) {
        if self.node.db().get_colleague_node_count() < self.node.params().colleague_target {
            ensure_map_filled(&self.node).await;
        } else {
            discover_unknown_areas(&self.node).await;
        }
    }
}

/// Bootstraps the colleague world map: pulls candidates from the seeds
/// (and, later on, from already known peers) and invites them until the
/// target is met or the attempt budget runs out.
pub(crate) async fn ensure_map_filled(node: &Node) {
    let params = node.params();
    let mut attempts = 0;

    for seed in &params.seeds {
        if node.db().get_colleague_node_count() >= params.colleague_target || attempts >= MAP_FILL_ATTEMPTS {
            break;
        }
        if seed.is_loopback() && !params.test_mode {
            log::debug!("Skipping loopback seed {}.", seed);
            continue;
        }

        attempts += 1;
        match acquire_from_informant(node, seed).await {
            Ok(acquired) => log::debug!("Acquired {} colleague(s) via seed {}.", acquired, seed),
            Err(e) => log::warn!("Bootstrapping from seed {} failed: {}", seed, e),
        }
    }

    // Once anyone is known, strangers can also be learned from them.
    if node.db().get_colleague_node_count() < params.colleague_target && attempts < MAP_FILL_ATTEMPTS {
        if let Some(informant) = node.db().get_random_nodes(1, NeighbourFilter::Included).first() {
            if let Some(endpoint) = endpoint_of(informant.info()) {
                if let Err(e) = acquire_from_informant(node, &endpoint).await {
                    log::debug!("Pulling candidates from {} failed: {}", informant.id(), e);
                }
            }
        }
    }

    let colleagues = node.db().get_colleague_node_count();
    if colleagues < params.colleague_target {
        log::debug!(
            "World map below target ({}/{}); retrying on the discovery schedule.",
            colleagues,
            params.colleague_target
        );
    }
}

/// Aims a probe location at every bearing sector without a colleague and
/// invites the strangers reported to live there.
pub(crate) async fn discover_unknown_areas(node: &Node) {
    let own_location = node.db().location();

    let mut occupied = [false; BEARING_SECTORS];
    node.db()
        .get_closest_nodes_by_distance(&own_location, f64::INFINITY, usize::MAX, NeighbourFilter::Excluded)
        .iter()
        .filter(|e| e.relation() == NodeRelation::Colleague)
        .for_each(|e| occupied[bearing_sector(&own_location, e.location())] = true);

    for sector in (0..BEARING_SECTORS).filter(|s| !occupied[*s]) {
        let informant = match node.db().get_random_nodes(1, NeighbourFilter::Included).into_iter().next() {
            Some(informant) => informant,
            None => return,
        };
        let endpoint = match endpoint_of(informant.info()) {
            Some(endpoint) => endpoint,
            None => continue,
        };

        let bearing = (sector as f64 + 0.5) * (360.0 / BEARING_SECTORS as f64);
        let probe = geo::destination(&own_location, bearing, DISCOVERY_PROBE_DISTANCE_KM);
        log::debug!("Probing uncovered area around {} via {}.", probe, informant.id());

        let strangers = match query_closest(node, &endpoint, &probe).await {
            Ok(strangers) => strangers,
            Err(e) => {
                log::debug!("Probe via {} failed: {}", informant.id(), e);
                continue;
            }
        };

        for stranger in strangers {
            if node.db().get_colleague_node_count() >= node.params().colleague_target {
                return;
            }
            try_acquire_colleague(node, &stranger).await;
        }
    }
}

/// Renews every initiated relation that comes close to expiry. Refusals
/// and network errors leave the entry for the expiry sweep to collect.
pub(crate) async fn renew_node_relations(node: &Node) {
    let now = time::unix_now_secs();
    let own_location = node.db().location();

    let entries =
        node.db()
            .get_closest_nodes_by_distance(&own_location, f64::INFINITY, usize::MAX, NeighbourFilter::Included);

    for entry in entries {
        if entry.role() != NodeContactRole::Initiator {
            continue;
        }
        if entry.expires_at().saturating_sub(now) >= node.params().renewal_period {
            continue;
        }

        if let Err(e) = renew_relation(node, &entry).await {
            log::debug!("Renewal of {} failed: {}; leaving it to expire.", entry.id(), e);
        }
    }
}

async fn renew_relation(node: &Node, entry: &NodeDbEntry) -> Result<(), Error> {
    let endpoint =
        endpoint_of(entry.info()).ok_or_else(|| Error::InvalidState("stored entry without contacts".into()))?;
    let mut remote = node.connector().connect_to(&endpoint).await?;

    let acceptance = match entry.relation() {
        NodeRelation::Colleague => remote.renew_colleague(node.self_info()).await?,
        NodeRelation::Neighbour => remote.renew_neighbour(node.self_info()).await?,
        NodeRelation::Own => return Ok(()),
    };
    if !acceptance.accepted {
        return Err(Error::InvalidState("peer refused the renewal".into()));
    }

    node.db().update(
        entry
            .clone()
            .with_expiry(time::unix_now_secs() + node.params().expiration_period),
    )?;
    node.emit(Event::RelationRenewed {
        id: entry.id().to_string(),
        relation: entry.relation(),
    });
    log::debug!("Renewed {:?} relation with {}.", entry.relation(), entry.id());

    Ok(())
}

/// Pulls random candidates from one informant and invites them as
/// colleagues.
async fn acquire_from_informant(node: &Node, endpoint: &NetworkEndpoint) -> Result<usize, Error> {
    let mut remote = node.connector().connect_to(endpoint).await?;
    let candidates = remote
        .get_random_nodes(RANDOM_NODE_REQUEST_COUNT, NeighbourFilter::Included)
        .await?;

    let mut acquired = 0;
    for candidate in candidates {
        if node.db().get_colleague_node_count() >= node.params().colleague_target {
            break;
        }
        if try_acquire_colleague(node, &candidate).await {
            acquired += 1;
        }
    }

    Ok(acquired)
}

async fn query_closest(
    node: &Node,
    endpoint: &NetworkEndpoint,
    location: &geo::GpsLocation,
) -> Result<Vec<NodeInfo>, Error> {
    let mut remote = node.connector().connect_to(endpoint).await?;
    remote
        .get_closest_nodes_by_distance(location, f64::INFINITY, CLOSEST_NODE_REQUEST_COUNT, NeighbourFilter::Excluded)
        .await
}

/// Invites a stranger into the world map. On success the colleague is also
/// asked for nodes near us, which feeds the neighbour ring.
async fn try_acquire_colleague(node: &Node, candidate: &NodeInfo) -> bool {
    if is_known(node, candidate) {
        return false;
    }
    let endpoint = match endpoint_of(candidate) {
        Some(endpoint) => endpoint,
        None => return false,
    };
    if endpoint.is_loopback() && !node.params().test_mode {
        return false;
    }

    let mut remote = match node.connector().connect_to(&endpoint).await {
        Ok(remote) => remote,
        Err(e) => {
            log::debug!("Could not reach colleague candidate {}: {}", candidate.id(), e);
            return false;
        }
    };

    match remote.accept_colleague(node.self_info()).await {
        Ok(acceptance) if acceptance.accepted => {
            // The acceptor's own answer carries its freshest contacts.
            let info = acceptance.acceptor_info.unwrap_or_else(|| candidate.clone());
            if let Err(e) = node.store_acquired(info, NodeRelation::Colleague) {
                log::warn!("Failed to store acquired colleague {}: {}", candidate.id(), e);
                return false;
            }
            log::debug!("Acquired colleague {}.", candidate.id());

            expand_neighbourhood(node, remote.as_mut()).await;
            true
        }
        Ok(_) => {
            log::debug!("Colleague candidate {} refused us.", candidate.id());
            false
        }
        Err(e) => {
            log::debug!("AcceptColleague({}) failed: {}", candidate.id(), e);
            false
        }
    }
}

/// Asks a freshly acquired colleague for the nodes closest to us and
/// invites each of them into the neighbour ring.
async fn expand_neighbourhood(node: &Node, remote: &mut dyn RemoteNode) {
    let own_location = node.db().location();

    let candidates = match remote
        .get_closest_nodes_by_distance(
            &own_location,
            f64::INFINITY,
            CLOSEST_NODE_REQUEST_COUNT,
            NeighbourFilter::Included,
        )
        .await
    {
        Ok(candidates) => candidates,
        Err(e) => {
            log::debug!("Neighbourhood expansion query failed: {}", e);
            return;
        }
    };

    for candidate in candidates {
        try_acquire_neighbour(node, &candidate).await;
    }
}

async fn try_acquire_neighbour(node: &Node, candidate: &NodeInfo) -> bool {
    if is_known(node, candidate) {
        return false;
    }
    let endpoint = match endpoint_of(candidate) {
        Some(endpoint) => endpoint,
        None => return false,
    };
    if endpoint.is_loopback() && !node.params().test_mode {
        return false;
    }

    // Only invite peers that would actually tighten the ring.
    let own_location = node.db().location();
    let ring = node.db().get_neighbour_nodes_by_distance();
    if ring.len() >= node.params().neighbourhood_target {
        if let Some(farthest) = ring.last() {
            if geo::distance_km(&own_location, candidate.location())
                >= geo::distance_km(&own_location, farthest.location())
            {
                return false;
            }
        }
    }

    let mut remote = match node.connector().connect_to(&endpoint).await {
        Ok(remote) => remote,
        Err(e) => {
            log::debug!("Could not reach neighbour candidate {}: {}", candidate.id(), e);
            return false;
        }
    };

    match remote.accept_neighbour(node.self_info()).await {
        Ok(acceptance) if acceptance.accepted => {
            let info = acceptance.acceptor_info.unwrap_or_else(|| candidate.clone());
            if let Err(e) = node.store_acquired(info, NodeRelation::Neighbour) {
                log::warn!("Failed to store acquired neighbour {}: {}", candidate.id(), e);
                return false;
            }
            log::debug!("Acquired neighbour {}.", candidate.id());
            true
        }
        Ok(_) => false,
        Err(e) => {
            log::debug!("AcceptNeighbour({}) failed: {}", candidate.id(), e);
            false
        }
    }
}

fn is_known(node: &Node, info: &NodeInfo) -> bool {
    info.id() == node.self_info().id() || node.db().lookup(info.id()).is_some()
}

fn endpoint_of(info: &NodeInfo) -> Option<NetworkEndpoint> {
    info.profile().contacts().first().map(Into::into)
}

fn bearing_sector(origin: &geo::GpsLocation, location: &geo::GpsLocation) -> usize {
    let sector_width = 360.0 / BEARING_SECTORS as f64;

    (geo::bearing_deg(origin, location) / sector_width) as usize % BEARING_SECTORS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event,
        geo::GpsLocation,
        local::LocalNode,
        node::{OverlayParams, PeerAcceptance, RemoteNodeMethods},
        peer::{db::InMemorySpatialDb, AddressType, NetworkInterface, NodeProfile},
        proxy::NodeConnector,
    };

    use async_trait::async_trait;

    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
    };

    /// Routes outbound connections to in-process engines by port, which
    /// lets the maintenance flows run without sockets.
    #[derive(Default)]
    struct LoopbackNetwork {
        nodes: Mutex<HashMap<u16, Node>>,
    }

    impl LoopbackNetwork {
        fn register(&self, port: u16, node: Node) {
            self.nodes.lock().unwrap().insert(port, node);
        }
    }

    #[async_trait]
    impl NodeConnector for Arc<LoopbackNetwork> {
        async fn connect_to(&self, endpoint: &NetworkEndpoint) -> Result<Box<dyn RemoteNode>, Error> {
            let node = self
                .nodes
                .lock()
                .unwrap()
                .get(&endpoint.port)
                .cloned()
                .ok_or_else(|| Error::Connection(format!("no route to {}", endpoint)))?;

            Ok(Box::new(LoopbackRemote { node }))
        }
    }

    struct LoopbackRemote {
        node: Node,
    }

    #[async_trait]
    impl RemoteNode for LoopbackRemote {
        async fn get_node_info(&mut self) -> Result<NodeInfo, Error> {
            Ok(self.node.get_node_info())
        }

        async fn get_node_count(&mut self) -> Result<usize, Error> {
            Ok(self.node.get_node_count())
        }

        async fn get_random_nodes(
            &mut self,
            max_node_count: usize,
            filter: NeighbourFilter,
        ) -> Result<Vec<NodeInfo>, Error> {
            Ok(self.node.get_random_nodes(max_node_count, filter))
        }

        async fn get_closest_nodes_by_distance(
            &mut self,
            location: &GpsLocation,
            max_radius_km: f64,
            max_node_count: usize,
            filter: NeighbourFilter,
        ) -> Result<Vec<NodeInfo>, Error> {
            Ok(RemoteNodeMethods::get_closest_nodes_by_distance(
                &self.node,
                location,
                max_radius_km,
                max_node_count,
                filter,
            ))
        }

        async fn accept_colleague(&mut self, requestor: NodeInfo) -> Result<PeerAcceptance, Error> {
            self.node.accept_colleague(requestor)
        }

        async fn renew_colleague(&mut self, requestor: NodeInfo) -> Result<PeerAcceptance, Error> {
            self.node.renew_colleague(requestor)
        }

        async fn accept_neighbour(&mut self, requestor: NodeInfo) -> Result<PeerAcceptance, Error> {
            self.node.accept_neighbour(requestor)
        }

        async fn renew_neighbour(&mut self, requestor: NodeInfo) -> Result<PeerAcceptance, Error> {
            self.node.renew_neighbour(requestor)
        }
    }

    fn engine(
        network: &Arc<LoopbackNetwork>,
        id: &str,
        port: u16,
        latitude: f64,
        longitude: f64,
        seeds: Vec<NetworkEndpoint>,
    ) -> Node {
        let location = GpsLocation::new(latitude, longitude).unwrap();
        let contact = NetworkInterface::new(AddressType::Ipv4, "127.0.0.1", port).unwrap();
        let info = NodeInfo::new(NodeProfile::new(id, vec![contact]).unwrap(), location);

        let (event_tx, _event_rx) = event::event_chan();
        let params = OverlayParams {
            neighbourhood_target: 4,
            colleague_target: 4,
            expiration_period: 3600,
            renewal_period: 1800,
            node_port: port,
            test_mode: true,
            seeds,
        };

        let node = Node::new(
            LocalNode::new(info),
            Arc::new(InMemorySpatialDb::new(location)),
            Arc::new(Arc::clone(network)),
            params,
            event_tx,
        );
        network.register(port, node.clone());

        node
    }

    fn info_with_port(id: &str, port: u16, latitude: f64, longitude: f64) -> NodeInfo {
        NodeInfo::new(
            NodeProfile::new(
                id,
                vec![NetworkInterface::new(AddressType::Ipv4, "127.0.0.1", port).unwrap()],
            )
            .unwrap(),
            GpsLocation::new(latitude, longitude).unwrap(),
        )
    }

    #[tokio::test]
    async fn bootstrap_fills_the_world_map_via_a_seed() {
        let network = Arc::new(LoopbackNetwork::default());

        let seed = engine(&network, "Seed", 1000, 51.5074, -0.1278, Vec::new());
        let new_york = engine(&network, "NewYork", 1001, 40.7128, -74.0060, Vec::new());
        let cape_town = engine(&network, "CapeTown", 1002, -33.9249, 18.4241, Vec::new());

        // The seed knows about both strangers.
        seed.store_acquired(info_with_port("NewYork", 1001, 40.7128, -74.0060), NodeRelation::Colleague)
            .unwrap();
        seed.store_acquired(info_with_port("CapeTown", 1002, -33.9249, 18.4241), NodeRelation::Colleague)
            .unwrap();

        let budapest = engine(
            &network,
            "Budapest",
            1003,
            47.4979,
            19.0402,
            vec![NetworkEndpoint::new("127.0.0.1", 1000)],
        );

        ensure_map_filled(&budapest).await;

        // Both strangers were invited and stored on our side as initiated
        // colleagues.
        let stored = budapest.db().lookup("NewYork").expect("NewYork not acquired");
        assert_eq!(stored.relation(), NodeRelation::Colleague);
        assert_eq!(stored.role(), NodeContactRole::Initiator);
        assert!(budapest.db().lookup("CapeTown").is_some());

        // The acceptors stored us with the mirrored role.
        let mirrored = new_york.db().lookup("Budapest").expect("acceptor did not store us");
        assert_eq!(mirrored.role(), NodeContactRole::Acceptor);
        assert!(cape_town.db().lookup("Budapest").is_some());
    }

    #[tokio::test]
    async fn acquiring_a_colleague_expands_the_neighbourhood() {
        let network = Arc::new(LoopbackNetwork::default());

        let seed = engine(&network, "Seed", 2000, 51.5074, -0.1278, Vec::new());
        let wien = engine(&network, "Wien", 2001, 48.2082, 16.3738, Vec::new());
        let _kecskemet = engine(&network, "Kecskemet", 2002, 46.9065, 19.6913, Vec::new());

        // The seed only knows Wien; Wien knows a node close to Budapest.
        seed.store_acquired(info_with_port("Wien", 2001, 48.2082, 16.3738), NodeRelation::Colleague)
            .unwrap();
        wien.store_acquired(info_with_port("Kecskemet", 2002, 46.9065, 19.6913), NodeRelation::Colleague)
            .unwrap();

        let budapest = engine(
            &network,
            "Budapest",
            2003,
            47.4979,
            19.0402,
            vec![NetworkEndpoint::new("127.0.0.1", 2000)],
        );

        ensure_map_filled(&budapest).await;

        // Wien came back as a colleague candidate from the seed; once
        // acquired it answered the closest-nodes query with Kecskemet,
        // which was then invited into the ring.
        assert_eq!(budapest.db().lookup("Wien").unwrap().relation(), NodeRelation::Colleague);
        assert_eq!(
            budapest.db().lookup("Kecskemet").unwrap().relation(),
            NodeRelation::Neighbour
        );
    }

    #[tokio::test]
    async fn discovery_probes_acquire_strangers_in_uncovered_areas() {
        let network = Arc::new(LoopbackNetwork::default());

        let london = engine(&network, "London", 3000, 51.5074, -0.1278, Vec::new());
        let _cape_town = engine(&network, "CapeTown", 3001, -33.9249, 18.4241, Vec::new());

        london
            .store_acquired(info_with_port("CapeTown", 3001, -33.9249, 18.4241), NodeRelation::Colleague)
            .unwrap();

        let budapest = engine(&network, "Budapest", 3002, 47.4979, 19.0402, Vec::new());
        budapest
            .store_acquired(info_with_port("London", 3000, 51.5074, -0.1278), NodeRelation::Colleague)
            .unwrap();

        discover_unknown_areas(&budapest).await;

        assert!(budapest.db().lookup("CapeTown").is_some());
    }

    #[tokio::test]
    async fn renewal_refreshes_initiated_relations() {
        let network = Arc::new(LoopbackNetwork::default());

        let wien = engine(&network, "Wien", 4000, 48.2082, 16.3738, Vec::new());
        let budapest = engine(&network, "Budapest", 4001, 47.4979, 19.0402, Vec::new());

        // Wien accepted us earlier; our initiated entry is close to expiry.
        wien.accept_colleague(budapest.self_info()).unwrap();
        let entry = NodeDbEntry::new(
            info_with_port("Wien", 4000, 48.2082, 16.3738),
            NodeRelation::Colleague,
            NodeContactRole::Initiator,
            time::unix_now_secs() + 10,
        );
        budapest.db().store(entry).unwrap();

        renew_node_relations(&budapest).await;

        let renewed = budapest.db().lookup("Wien").unwrap();
        assert!(renewed.expires_at() >= time::unix_now_secs() + 3000);
    }

    #[tokio::test]
    async fn refused_renewal_leaves_the_entry_to_expire() {
        let network = Arc::new(LoopbackNetwork::default());

        // Wien never heard of us, so the renewal is refused.
        let _wien = engine(&network, "Wien", 5000, 48.2082, 16.3738, Vec::new());
        let budapest = engine(&network, "Budapest", 5001, 47.4979, 19.0402, Vec::new());

        let expires_at = time::unix_now_secs() + 10;
        let entry = NodeDbEntry::new(
            info_with_port("Wien", 5000, 48.2082, 16.3738),
            NodeRelation::Colleague,
            NodeContactRole::Initiator,
            expires_at,
        );
        budapest.db().store(entry).unwrap();

        renew_node_relations(&budapest).await;

        assert_eq!(budapest.db().lookup("Wien").unwrap().expires_at(), expires_at);
    }

    #[tokio::test]
    async fn acceptor_role_entries_are_not_renewed_by_us() {
        let network = Arc::new(LoopbackNetwork::default());

        let wien = engine(&network, "Wien", 6000, 48.2082, 16.3738, Vec::new());
        let budapest = engine(&network, "Budapest", 6001, 47.4979, 19.0402, Vec::new());

        wien.accept_colleague(budapest.self_info()).unwrap();
        let expires_at = time::unix_now_secs() + 10;
        let entry = NodeDbEntry::new(
            info_with_port("Wien", 6000, 48.2082, 16.3738),
            NodeRelation::Colleague,
            NodeContactRole::Acceptor,
            expires_at,
        );
        budapest.db().store(entry).unwrap();

        renew_node_relations(&budapest).await;

        assert_eq!(budapest.db().lookup("Wien").unwrap().expires_at(), expires_at);
    }

    #[test]
    fn bearing_sectors_partition_the_compass() {
        let budapest = GpsLocation::new(47.4979, 19.0402).unwrap();

        let north = GpsLocation::new(60.0, 19.0402).unwrap();
        let south = GpsLocation::new(30.0, 19.0402).unwrap();

        assert_eq!(bearing_sector(&budapest, &north), 0);
        assert_eq!(bearing_sector(&budapest, &south), BEARING_SECTORS / 2);
    }
}
