// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The overlay maintenance engine: decides which peers to accept, invite,
//! renew and expire, and exposes the three service interfaces.

pub(crate) mod maintenance;

use crate::{
    config::LocnetConfig,
    error::Error,
    event::{ChangeListener, Event, EventTx},
    geo::{self, Distance, GpsLocation},
    local::LocalNode,
    peer::{
        NeighbourFilter, NetworkEndpoint, NodeContactRole, NodeDbEntry, NodeInfo, NodeRelation, ServiceProfile,
        ServiceType, SpatialDatabase,
    },
    proxy::NodeConnector,
    time,
};

use std::{collections::HashMap, net::IpAddr, sync::Arc};

/// The outcome of an accept or renew exchange. `acceptor_info` carries the
/// acceptor's own node info whenever the request was granted.
#[derive(Clone, Debug)]
pub struct PeerAcceptance {
    pub accepted: bool,
    pub acceptor_info: Option<NodeInfo>,
}

impl PeerAcceptance {
    fn granted(acceptor_info: NodeInfo) -> Self {
        Self {
            accepted: true,
            acceptor_info: Some(acceptor_info),
        }
    }

    fn refused() -> Self {
        Self {
            accepted: false,
            acceptor_info: None,
        }
    }
}

/// The interface offered to co-located services.
pub trait LocalServiceMethods: Send + Sync {
    /// Publishes a service; at most one profile per service type.
    fn register_service(&self, service_type: ServiceType, profile: ServiceProfile) -> Result<(), Error>;
    /// Withdraws a published service.
    fn deregister_service(&self, service_type: ServiceType) -> Result<(), Error>;
    /// The currently published services.
    fn get_services(&self) -> HashMap<ServiceType, ServiceProfile>;
    /// The neighbour ring, closest first.
    fn get_neighbour_nodes_by_distance(&self) -> Vec<NodeInfo>;
    /// Subscribes a listener to neighbourhood changes.
    fn add_listener(&self, listener: Box<dyn ChangeListener>);
    /// Drops the listener installed by the given session, if any.
    fn remove_listener(&self, session_id: &str);
}

/// The interface offered to remote overlay nodes.
pub trait RemoteNodeMethods: Send + Sync {
    fn get_node_info(&self) -> NodeInfo;
    fn get_node_count(&self) -> usize;
    fn get_random_nodes(&self, max_node_count: usize, filter: NeighbourFilter) -> Vec<NodeInfo>;
    fn get_closest_nodes_by_distance(
        &self,
        location: &GpsLocation,
        max_radius_km: Distance,
        max_node_count: usize,
        filter: NeighbourFilter,
    ) -> Vec<NodeInfo>;
    fn accept_colleague(&self, requestor: NodeInfo) -> Result<PeerAcceptance, Error>;
    fn renew_colleague(&self, requestor: NodeInfo) -> Result<PeerAcceptance, Error>;
    fn accept_neighbour(&self, requestor: NodeInfo) -> Result<PeerAcceptance, Error>;
    fn renew_neighbour(&self, requestor: NodeInfo) -> Result<PeerAcceptance, Error>;
}

/// The interface offered to untrusted clients.
pub trait ClientMethods: Send + Sync {
    fn get_services(&self) -> HashMap<ServiceType, ServiceProfile>;
    fn get_neighbour_nodes_by_distance(&self) -> Vec<NodeInfo>;
    fn get_closest_nodes_by_distance(
        &self,
        location: &GpsLocation,
        max_radius_km: Distance,
        max_node_count: usize,
        filter: NeighbourFilter,
    ) -> Vec<NodeInfo>;
}

/// The effect of the proxy observing an echoed external address: adopt it
/// into the advertised contacts and publish the detection.
pub(crate) fn adopt_detected_address(local: &LocalNode, node_port: u16, event_tx: &EventTx, address: IpAddr) {
    match local.write().adopt_external_address(address, node_port) {
        Ok(true) => {
            let _ = event_tx.send(Event::ExternalAddressDetected { address });
        }
        Ok(false) => {}
        Err(e) => log::warn!("Ignoring detected external address {}: {}", address, e),
    }
}

pub(crate) struct OverlayParams {
    pub(crate) neighbourhood_target: usize,
    pub(crate) colleague_target: usize,
    pub(crate) expiration_period: u64,
    pub(crate) renewal_period: u64,
    pub(crate) node_port: u16,
    pub(crate) test_mode: bool,
    pub(crate) seeds: Vec<NetworkEndpoint>,
}

impl OverlayParams {
    pub(crate) fn from_config(config: &LocnetConfig) -> Self {
        Self {
            neighbourhood_target: config.neighbourhood_target,
            colleague_target: config.colleague_target,
            expiration_period: config.db_expiration_period,
            renewal_period: config.renewal_period,
            node_port: config.listen_ports.node,
            test_mode: config.is_test_mode,
            seeds: config.seeds.clone(),
        }
    }
}

/// The overlay engine. Exclusively owns the spatial database handle and
/// the outbound connection factory.
#[derive(Clone)]
pub struct Node {
    local: LocalNode,
    db: Arc<dyn SpatialDatabase>,
    connector: Arc<dyn NodeConnector>,
    params: Arc<OverlayParams>,
    event_tx: EventTx,
}

impl Node {
    pub(crate) fn new(
        local: LocalNode,
        db: Arc<dyn SpatialDatabase>,
        connector: Arc<dyn NodeConnector>,
        params: OverlayParams,
        event_tx: EventTx,
    ) -> Self {
        Self {
            local,
            db,
            connector,
            params: Arc::new(params),
            event_tx,
        }
    }

    pub(crate) fn db(&self) -> &Arc<dyn SpatialDatabase> {
        &self.db
    }

    pub(crate) fn connector(&self) -> &Arc<dyn NodeConnector> {
        &self.connector
    }

    pub(crate) fn params(&self) -> &OverlayParams {
        &self.params
    }

    pub(crate) fn self_info(&self) -> NodeInfo {
        self.local.read().info().clone()
    }

    pub(crate) fn emit(&self, event: Event) {
        // The embedding application may have dropped the receiver.
        let _ = self.event_tx.send(event);
    }

    /// Adopts an externally observed address into the advertised contacts.
    /// This is the only mutation of the own node info after construction.
    pub(crate) fn detected_external_address(&self, address: IpAddr) {
        adopt_detected_address(&self.local, self.params.node_port, &self.event_tx, address);
    }

    /// Stores a peer that accepted one of our own invitations.
    pub(crate) fn store_acquired(&self, info: NodeInfo, relation: NodeRelation) -> Result<(), Error> {
        let entry = NodeDbEntry::new(
            info,
            relation,
            NodeContactRole::Initiator,
            time::unix_now_secs() + self.params.expiration_period,
        );

        self.db.store(entry)?;
        if relation == NodeRelation::Neighbour {
            self.trim_neighbour_ring()?;
        }

        Ok(())
    }

    /// Keeps the ring bounded: whenever it exceeds the target, the farthest
    /// neighbour is dropped.
    fn trim_neighbour_ring(&self) -> Result<(), Error> {
        let ring = self.db.get_neighbour_nodes_by_distance();
        if ring.len() > self.params.neighbourhood_target {
            if let Some(farthest) = ring.last() {
                let id = farthest.id().to_string();
                log::debug!("Neighbour ring over target; dropping farthest neighbour {}.", id);
                self.db.remove(&id)?;
            }
        }

        Ok(())
    }

    fn distance_to_self(&self, location: &GpsLocation) -> Distance {
        geo::distance_km(&self.db.location(), location)
    }

    fn fresh_expiry(&self) -> u64 {
        time::unix_now_secs() + self.params.expiration_period
    }

    /// The world-map admission rule. While the colleague target is not met
    /// any candidate fits. A full map only trades its nearest colleague for
    /// a farther candidate, so the minimum colleague distance never
    /// decreases.
    fn admit_colleague(&self, requestor: &NodeInfo) -> Result<bool, Error> {
        if self.db.get_colleague_node_count() < self.params.colleague_target {
            return Ok(true);
        }

        let own_location = self.db.location();
        let colleagues = self
            .db
            .get_closest_nodes_by_distance(&own_location, f64::INFINITY, usize::MAX, NeighbourFilter::Excluded);
        let nearest = match colleagues.iter().find(|e| e.relation() == NodeRelation::Colleague) {
            Some(nearest) => nearest,
            None => return Ok(true),
        };

        if self.distance_to_self(requestor.location()) > self.distance_to_self(nearest.location()) {
            let id = nearest.id().to_string();
            log::debug!("World map full; replacing nearest colleague {}.", id);
            self.db.remove(&id)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn renew_relation(&self, requestor: NodeInfo, expected: NodeRelation) -> Result<PeerAcceptance, Error> {
        match self.db.lookup(requestor.id()) {
            Some(existing) if existing.relation() == expected => {
                let entry = NodeDbEntry::new(requestor, expected, existing.role(), self.fresh_expiry());
                self.db.update(entry)?;

                Ok(PeerAcceptance::granted(self.self_info()))
            }
            _ => Ok(PeerAcceptance::refused()),
        }
    }
}

impl LocalServiceMethods for Node {
    fn register_service(&self, service_type: ServiceType, profile: ServiceProfile) -> Result<(), Error> {
        self.local.write().register_service(service_type, profile)
    }

    fn deregister_service(&self, service_type: ServiceType) -> Result<(), Error> {
        self.local.write().deregister_service(service_type)
    }

    fn get_services(&self) -> HashMap<ServiceType, ServiceProfile> {
        self.local.read().services().clone()
    }

    fn get_neighbour_nodes_by_distance(&self) -> Vec<NodeInfo> {
        self.db
            .get_neighbour_nodes_by_distance()
            .into_iter()
            .map(|e| e.info().clone())
            .collect()
    }

    fn add_listener(&self, listener: Box<dyn ChangeListener>) {
        self.db.add_listener(listener);
    }

    fn remove_listener(&self, session_id: &str) {
        self.db.remove_listener(session_id);
    }
}

impl RemoteNodeMethods for Node {
    fn get_node_info(&self) -> NodeInfo {
        self.self_info()
    }

    fn get_node_count(&self) -> usize {
        self.db.get_node_count()
    }

    fn get_random_nodes(&self, max_node_count: usize, filter: NeighbourFilter) -> Vec<NodeInfo> {
        self.db
            .get_random_nodes(max_node_count, filter)
            .into_iter()
            .map(|e| e.info().clone())
            .collect()
    }

    fn get_closest_nodes_by_distance(
        &self,
        location: &GpsLocation,
        max_radius_km: Distance,
        max_node_count: usize,
        filter: NeighbourFilter,
    ) -> Vec<NodeInfo> {
        self.db
            .get_closest_nodes_by_distance(location, max_radius_km, max_node_count, filter)
            .into_iter()
            .map(|e| e.info().clone())
            .collect()
    }

    fn accept_colleague(&self, requestor: NodeInfo) -> Result<PeerAcceptance, Error> {
        if requestor.id() == self.local.read().node_id() {
            return Ok(PeerAcceptance::refused());
        }
        // A peer already in the neighbour ring must keep renewing that
        // relation instead of downgrading it.
        if let Some(existing) = self.db.lookup(requestor.id()) {
            if existing.relation() == NodeRelation::Neighbour {
                return Ok(PeerAcceptance::refused());
            }
        }

        if !self.admit_colleague(&requestor)? {
            return Ok(PeerAcceptance::refused());
        }

        let entry = NodeDbEntry::new(
            requestor,
            NodeRelation::Colleague,
            NodeContactRole::Acceptor,
            self.fresh_expiry(),
        );
        self.db.store(entry)?;

        Ok(PeerAcceptance::granted(self.self_info()))
    }

    fn renew_colleague(&self, requestor: NodeInfo) -> Result<PeerAcceptance, Error> {
        self.renew_relation(requestor, NodeRelation::Colleague)
    }

    fn accept_neighbour(&self, requestor: NodeInfo) -> Result<PeerAcceptance, Error> {
        if requestor.id() == self.local.read().node_id() {
            return Ok(PeerAcceptance::refused());
        }

        let ring = self.db.get_neighbour_nodes_by_distance();
        let target = self.params.neighbourhood_target;

        let admitted = match ring.last() {
            _ if ring.len() < target => true,
            Some(farthest) => {
                self.distance_to_self(requestor.location()) < self.distance_to_self(farthest.location())
            }
            None => true,
        };
        if !admitted {
            return Ok(PeerAcceptance::refused());
        }

        let entry = NodeDbEntry::new(
            requestor,
            NodeRelation::Neighbour,
            NodeContactRole::Acceptor,
            self.fresh_expiry(),
        );
        self.db.store(entry)?;
        // A closer peer displaces the farthest one.
        self.trim_neighbour_ring()?;

        Ok(PeerAcceptance::granted(self.self_info()))
    }

    fn renew_neighbour(&self, requestor: NodeInfo) -> Result<PeerAcceptance, Error> {
        self.renew_relation(requestor, NodeRelation::Neighbour)
    }
}

impl ClientMethods for Node {
    fn get_services(&self) -> HashMap<ServiceType, ServiceProfile> {
        LocalServiceMethods::get_services(self)
    }

    fn get_neighbour_nodes_by_distance(&self) -> Vec<NodeInfo> {
        LocalServiceMethods::get_neighbour_nodes_by_distance(self)
    }

    fn get_closest_nodes_by_distance(
        &self,
        location: &GpsLocation,
        max_radius_km: Distance,
        max_node_count: usize,
        filter: NeighbourFilter,
    ) -> Vec<NodeInfo> {
        RemoteNodeMethods::get_closest_nodes_by_distance(self, location, max_radius_km, max_node_count, filter)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::{
        event,
        peer::db::InMemorySpatialDb,
        proxy::RemoteNode,
    };

    use async_trait::async_trait;

    pub(crate) struct NoopConnector;

    #[async_trait]
    impl NodeConnector for NoopConnector {
        async fn connect_to(&self, endpoint: &NetworkEndpoint) -> Result<Box<dyn RemoteNode>, Error> {
            Err(Error::Connection(format!("no route to {}", endpoint)))
        }
    }

    pub(crate) fn test_node(location: GpsLocation, neighbourhood_target: usize, colleague_target: usize) -> Node {
        let (event_tx, _event_rx) = event::event_chan();
        let local = LocalNode::new(crate::peer::test_fixtures::node_info("OwnNodeId", 47.4979, 19.0402));
        let params = OverlayParams {
            neighbourhood_target,
            colleague_target,
            expiration_period: 3600,
            renewal_period: 1800,
            node_port: 6666,
            test_mode: true,
            seeds: Vec::new(),
        };

        Node::new(
            local,
            Arc::new(InMemorySpatialDb::new(location)),
            Arc::new(NoopConnector),
            params,
            event_tx,
        )
    }
}
