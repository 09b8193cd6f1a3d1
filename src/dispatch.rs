// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Routing of decoded requests into the engine, one dispatcher variant per
//! served interface.

use crate::{
    error::Error,
    listener::NeighbourhoodNotifier,
    messaging,
    node::{ClientMethods, LocalServiceMethods, Node, PeerAcceptance, RemoteNodeMethods},
    peer::{address_to_bytes, NeighbourFilter, NodeInfo},
    proto,
    session::Session,
};

use std::{net::IpAddr, sync::Arc};

/// The interface a listener serves; the dispatcher only accepts the
/// matching request variant (all of them in test mode).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Interface {
    LocalService,
    RemoteNode,
    Client,
}

#[derive(Clone)]
pub(crate) struct Dispatcher {
    node: Node,
    interface: Interface,
    serve_all: bool,
}

impl Dispatcher {
    pub(crate) fn new(node: Node, interface: Interface, serve_all: bool) -> Self {
        Self {
            node,
            interface,
            serve_all,
        }
    }

    fn serves(&self, interface: Interface) -> bool {
        self.serve_all || self.interface == interface
    }

    pub(crate) fn dispatch(
        &self,
        request: proto::request::Request,
        session: &Arc<Session>,
    ) -> Result<proto::response::Response, Error> {
        match request {
            proto::request::Request::LocalService(request) if self.serves(Interface::LocalService) => self
                .dispatch_local_service(request, session)
                .map(proto::response::Response::LocalService),
            proto::request::Request::RemoteNode(request) if self.serves(Interface::RemoteNode) => self
                .dispatch_remote_node(request, session)
                .map(proto::response::Response::RemoteNode),
            proto::request::Request::Client(request) if self.serves(Interface::Client) => {
                self.dispatch_client(request).map(proto::response::Response::Client)
            }
            _ => Err(Error::Unsupported(format!(
                "request is not served on the {:?} interface",
                self.interface
            ))),
        }
    }

    fn dispatch_local_service(
        &self,
        request: proto::LocalServiceRequest,
        session: &Arc<Session>,
    ) -> Result<proto::LocalServiceResponse, Error> {
        use proto::local_service_request::Request;
        use proto::local_service_response::Response;

        let request = request
            .request
            .ok_or_else(|| Error::BadRequest("missing local service request".into()))?;

        let response = match request {
            Request::RegisterService(request) => {
                let service_type = messaging::service_type_from_wire(request.service_type)?;
                let profile = request
                    .service
                    .as_ref()
                    .ok_or_else(|| Error::InvalidValue("missing service profile".into()))?
                    .try_into()?;

                self.node.register_service(service_type, profile)?;
                log::debug!("Served RegisterService({}).", service_type);

                Response::RegisterService(proto::RegisterServiceResponse {})
            }
            Request::DeregisterService(request) => {
                let service_type = messaging::service_type_from_wire(request.service_type)?;

                self.node.deregister_service(service_type)?;
                log::debug!("Served DeregisterService({}).", service_type);

                Response::DeregisterService(proto::DeregisterServiceResponse {})
            }
            Request::GetNeighbourNodes(request) => {
                if request.keep_alive_and_send_updates && !session.is_keep_alive() {
                    session.set_keep_alive();
                    self.node.add_listener(Box::new(NeighbourhoodNotifier::new(session)));
                    log::debug!("Registered neighbourhood listener for session {}.", session.id());
                }

                let nodes = LocalServiceMethods::get_neighbour_nodes_by_distance(&self.node);
                log::debug!("Served GetNeighbourNodes(), node count: {}", nodes.len());

                Response::GetNeighbourNodes(proto::GetNeighbourNodesResponse {
                    nodes: messaging::infos_to_wire(&nodes),
                })
            }
            Request::NeighbourhoodChanged(_) => {
                return Err(Error::Unsupported("neighbourhood notifications are not served".into()));
            }
        };

        Ok(proto::LocalServiceResponse { response: Some(response) })
    }

    fn dispatch_remote_node(
        &self,
        request: proto::RemoteNodeRequest,
        session: &Arc<Session>,
    ) -> Result<proto::RemoteNodeResponse, Error> {
        use proto::remote_node_request::Request;
        use proto::remote_node_response::Response;

        let request = request
            .request
            .ok_or_else(|| Error::BadRequest("missing remote node request".into()))?;
        let remote_ip = session.remote_ip();

        let response = match request {
            Request::AcceptColleague(request) => {
                let requestor = rewritten_requestor(request.requestor_node_info, remote_ip)?;
                log::debug!("Serving AcceptColleague({}).", requestor);

                let acceptance = self.node.accept_colleague(requestor)?;
                Response::AcceptColleague(proto::AcceptColleagueResponse {
                    accepted: acceptance.accepted,
                    acceptor_node_info: acceptor_to_wire(&acceptance),
                    remote_ip_address: address_to_bytes(&remote_ip),
                })
            }
            Request::RenewColleague(request) => {
                let requestor = rewritten_requestor(request.requestor_node_info, remote_ip)?;
                log::debug!("Serving RenewColleague({}).", requestor);

                let acceptance = self.node.renew_colleague(requestor)?;
                Response::RenewColleague(proto::RenewColleagueResponse {
                    accepted: acceptance.accepted,
                    acceptor_node_info: acceptor_to_wire(&acceptance),
                    remote_ip_address: address_to_bytes(&remote_ip),
                })
            }
            Request::AcceptNeighbour(request) => {
                let requestor = rewritten_requestor(request.requestor_node_info, remote_ip)?;
                log::debug!("Serving AcceptNeighbour({}).", requestor);

                let acceptance = self.node.accept_neighbour(requestor)?;
                Response::AcceptNeighbour(proto::AcceptNeighbourResponse {
                    accepted: acceptance.accepted,
                    acceptor_node_info: acceptor_to_wire(&acceptance),
                    remote_ip_address: address_to_bytes(&remote_ip),
                })
            }
            Request::RenewNeighbour(request) => {
                let requestor = rewritten_requestor(request.requestor_node_info, remote_ip)?;
                log::debug!("Serving RenewNeighbour({}).", requestor);

                let acceptance = self.node.renew_neighbour(requestor)?;
                Response::RenewNeighbour(proto::RenewNeighbourResponse {
                    accepted: acceptance.accepted,
                    acceptor_node_info: acceptor_to_wire(&acceptance),
                    remote_ip_address: address_to_bytes(&remote_ip),
                })
            }
            Request::GetNodeCount(_) => Response::GetNodeCount(proto::GetNodeCountResponse {
                node_count: self.node.get_node_count().min(u32::MAX as usize) as u32,
            }),
            Request::GetNodeInfo(_) => Response::GetNodeInfo(proto::GetNodeInfoResponse {
                node_info: Some((&self.node.get_node_info()).into()),
            }),
            Request::GetRandomNodes(request) => {
                let nodes = self
                    .node
                    .get_random_nodes(request.max_node_count as usize, filter_from(request.include_neighbours));
                log::debug!("Served GetRandomNodes(), node count: {}", nodes.len());

                Response::GetRandomNodes(proto::GetRandomNodesResponse {
                    nodes: messaging::infos_to_wire(&nodes),
                })
            }
            Request::GetClosestNodes(request) => {
                let nodes = self.closest_nodes(&request)?;
                Response::GetClosestNodes(proto::GetClosestNodesByDistanceResponse {
                    nodes: messaging::infos_to_wire(&nodes),
                })
            }
        };

        Ok(proto::RemoteNodeResponse { response: Some(response) })
    }

    fn dispatch_client(&self, request: proto::ClientRequest) -> Result<proto::ClientResponse, Error> {
        use proto::client_request::Request;
        use proto::client_response::Response;

        let request = request
            .request
            .ok_or_else(|| Error::BadRequest("missing client request".into()))?;

        let response = match request {
            Request::GetServices(_) => {
                let services = ClientMethods::get_services(&self.node);
                log::debug!("Served GetServices(), service count: {}", services.len());

                Response::GetServices(proto::GetServicesResponse {
                    services: messaging::services_to_wire(&services),
                })
            }
            // The keepalive flag only has meaning on the local-service
            // interface.
            Request::GetNeighbourNodes(_) => {
                let nodes = ClientMethods::get_neighbour_nodes_by_distance(&self.node);
                Response::GetNeighbourNodes(proto::GetNeighbourNodesResponse {
                    nodes: messaging::infos_to_wire(&nodes),
                })
            }
            Request::GetClosestNodes(request) => {
                let nodes = self.closest_nodes(&request)?;
                Response::GetClosestNodes(proto::GetClosestNodesByDistanceResponse {
                    nodes: messaging::infos_to_wire(&nodes),
                })
            }
        };

        Ok(proto::ClientResponse { response: Some(response) })
    }

    fn closest_nodes(&self, request: &proto::GetClosestNodesByDistanceRequest) -> Result<Vec<NodeInfo>, Error> {
        let location = request
            .location
            .as_ref()
            .ok_or_else(|| Error::InvalidValue("missing query location".into()))?
            .try_into()?;

        let nodes = RemoteNodeMethods::get_closest_nodes_by_distance(
            &self.node,
            &location,
            request.max_radius_km as f64,
            request.max_node_count as usize,
            filter_from(request.include_neighbours),
        );
        log::debug!("Served GetClosestNodes(), node count: {}", nodes.len());

        Ok(nodes)
    }
}

fn filter_from(include_neighbours: bool) -> NeighbourFilter {
    if include_neighbours {
        NeighbourFilter::Included
    } else {
        NeighbourFilter::Excluded
    }
}

fn acceptor_to_wire(acceptance: &PeerAcceptance) -> Option<proto::NodeInfo> {
    acceptance.acceptor_info.as_ref().map(Into::into)
}

/// Decodes the requestor info of an accept/renew exchange, overriding every
/// claimed contact address with the one observed on the session.
fn rewritten_requestor(info: Option<proto::NodeInfo>, remote_ip: IpAddr) -> Result<NodeInfo, Error> {
    let wire = info.ok_or_else(|| Error::InvalidValue("missing requestor node info".into()))?;
    let mut info = NodeInfo::try_from(&wire)?;

    for contact in info.profile_mut().contacts_mut().iter_mut() {
        let rewritten = contact.with_ip(remote_ip);
        *contact = rewritten;
    }

    Ok(info)
}
