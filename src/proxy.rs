// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The outbound side of the node-to-node interface: a proxy that presents
//! remote overlay nodes as local calls over a request/response session.

use crate::{
    error::Error,
    geo::{Distance, GpsLocation},
    messaging,
    node::PeerAcceptance,
    peer::{address_from_bytes, NeighbourFilter, NetworkEndpoint, NodeInfo},
    proto, session,
};

use async_trait::async_trait;
use tokio::{net::TcpStream, time::timeout};

use std::{net::IpAddr, sync::Arc, time::Duration};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Invoked whenever a peer reports back a previously unseen external
/// address of ours.
pub type DetectedIpCallback = Arc<dyn Fn(IpAddr) + Send + Sync>;

/// The node-to-node operations as seen from the initiating side.
#[async_trait]
pub trait RemoteNode: Send {
    async fn get_node_info(&mut self) -> Result<NodeInfo, Error>;
    async fn get_node_count(&mut self) -> Result<usize, Error>;
    async fn get_random_nodes(&mut self, max_node_count: usize, filter: NeighbourFilter)
        -> Result<Vec<NodeInfo>, Error>;
    async fn get_closest_nodes_by_distance(
        &mut self,
        location: &GpsLocation,
        max_radius_km: Distance,
        max_node_count: usize,
        filter: NeighbourFilter,
    ) -> Result<Vec<NodeInfo>, Error>;
    async fn accept_colleague(&mut self, requestor: NodeInfo) -> Result<PeerAcceptance, Error>;
    async fn renew_colleague(&mut self, requestor: NodeInfo) -> Result<PeerAcceptance, Error>;
    async fn accept_neighbour(&mut self, requestor: NodeInfo) -> Result<PeerAcceptance, Error>;
    async fn renew_neighbour(&mut self, requestor: NodeInfo) -> Result<PeerAcceptance, Error>;
}

/// Creates outbound connections to remote overlay nodes.
#[async_trait]
pub trait NodeConnector: Send + Sync {
    async fn connect_to(&self, endpoint: &NetworkEndpoint) -> Result<Box<dyn RemoteNode>, Error>;
}

/// The TCP-backed connection factory used by the engine.
pub(crate) struct TcpConnector {
    detected_ip_callback: Option<DetectedIpCallback>,
}

impl TcpConnector {
    pub(crate) fn new(detected_ip_callback: Option<DetectedIpCallback>) -> Self {
        Self { detected_ip_callback }
    }
}

#[async_trait]
impl NodeConnector for TcpConnector {
    async fn connect_to(&self, endpoint: &NetworkEndpoint) -> Result<Box<dyn RemoteNode>, Error> {
        let proxy = NodeProxy::connect(endpoint, self.detected_ip_callback.clone()).await?;

        Ok(Box::new(proxy))
    }
}

/// A proxy speaking the node-to-node protocol over one outbound session.
/// Requests and responses are strictly sequential on the session, so the
/// proxy owns the stream outright.
pub struct NodeProxy {
    stream: TcpStream,
    endpoint: NetworkEndpoint,
    next_request_id: u32,
    detected_ip_callback: Option<DetectedIpCallback>,
    reported_address: Option<IpAddr>,
}

impl NodeProxy {
    /// Connects to the node-to-node interface of the given endpoint.
    pub async fn connect(
        endpoint: &NetworkEndpoint,
        detected_ip_callback: Option<DetectedIpCallback>,
    ) -> Result<Self, Error> {
        let connect = TcpStream::connect((endpoint.host.as_str(), endpoint.port));
        let stream = match timeout(CONNECT_TIMEOUT, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(Error::Connection(format!("failed connecting to {}: {}", endpoint, e)));
            }
            Err(_) => {
                return Err(Error::Connection(format!("timed out connecting to {}", endpoint)));
            }
        };
        log::debug!("Connected to {}.", endpoint);

        Ok(Self {
            stream,
            endpoint: endpoint.clone(),
            next_request_id: 1,
            detected_ip_callback,
            reported_address: None,
        })
    }

    async fn call(
        &mut self,
        request: proto::remote_node_request::Request,
    ) -> Result<proto::remote_node_response::Response, Error> {
        let id = self.next_request_id;
        self.next_request_id += 1;

        let message = messaging::request_message(
            id,
            proto::request::Request::RemoteNode(proto::RemoteNodeRequest { request: Some(request) }),
        );
        session::write_frame(&mut self.stream, &message).await?;

        let reply = match timeout(RESPONSE_TIMEOUT, session::read_frame(&mut self.stream)).await {
            Ok(Ok(reply)) => reply,
            // A response the proxy cannot even decode is the remote's
            // protocol violation, not ours.
            Ok(Err(Error::BadRequest(details))) => return Err(Error::BadResponse(details)),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(Error::Connection(format!("response timeout from {}", self.endpoint)));
            }
        };

        if reply.id != id {
            return Err(Error::BadResponse(format!(
                "response id mismatch: expected {}, got {}",
                id, reply.id
            )));
        }

        let response = match reply.body {
            Some(proto::message::Body::Response(response)) => response,
            _ => return Err(Error::BadResponse("expected a response message".into())),
        };

        let status = proto::Status::from_i32(response.status)
            .ok_or_else(|| Error::BadResponse(format!("unknown status code: {}", response.status)))?;
        if status != proto::Status::Ok {
            log::warn!(
                "Session with {} received status {:?}, details: {}",
                self.endpoint,
                status,
                response.details
            );
            return Err(Error::from_status(status, response.details));
        }

        match response.response {
            Some(proto::response::Response::RemoteNode(proto::RemoteNodeResponse {
                response: Some(response),
            })) => Ok(response),
            _ => Err(Error::BadResponse("missing remote node response body".into())),
        }
    }

    fn observe_remote_ip(&mut self, address_bytes: &[u8]) {
        if address_bytes.is_empty() {
            return;
        }

        match address_from_bytes(address_bytes) {
            Ok(address) => {
                if self.reported_address != Some(address) {
                    self.reported_address = Some(address);
                    if let Some(callback) = &self.detected_ip_callback {
                        callback(address);
                    }
                }
            }
            Err(e) => log::debug!("Peer {} echoed an unusable address: {}", self.endpoint, e),
        }
    }

    fn into_acceptance(
        &mut self,
        accepted: bool,
        acceptor_node_info: Option<proto::NodeInfo>,
        remote_ip_address: &[u8],
    ) -> Result<PeerAcceptance, Error> {
        self.observe_remote_ip(remote_ip_address);

        let acceptor_info = acceptor_node_info
            .as_ref()
            .map(NodeInfo::try_from)
            .transpose()
            .map_err(|e| Error::BadResponse(e.to_string()))?;

        Ok(PeerAcceptance { accepted, acceptor_info })
    }
}

fn infos_from_wire(nodes: &[proto::NodeInfo]) -> Result<Vec<NodeInfo>, Error> {
    nodes
        .iter()
        .map(NodeInfo::try_from)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::BadResponse(e.to_string()))
}

#[async_trait]
impl RemoteNode for NodeProxy {
    async fn get_node_info(&mut self) -> Result<NodeInfo, Error> {
        let response = self
            .call(proto::remote_node_request::Request::GetNodeInfo(proto::GetNodeInfoRequest {}))
            .await?;

        match response {
            proto::remote_node_response::Response::GetNodeInfo(proto::GetNodeInfoResponse {
                node_info: Some(info),
            }) => NodeInfo::try_from(&info).map_err(|e| Error::BadResponse(e.to_string())),
            _ => Err(Error::BadResponse("mismatching response variant".into())),
        }
    }

    async fn get_node_count(&mut self) -> Result<usize, Error> {
        let response = self
            .call(proto::remote_node_request::Request::GetNodeCount(
                proto::GetNodeCountRequest {},
            ))
            .await?;

        match response {
            proto::remote_node_response::Response::GetNodeCount(proto::GetNodeCountResponse { node_count }) => {
                Ok(node_count as usize)
            }
            _ => Err(Error::BadResponse("mismatching response variant".into())),
        }
    }

    async fn get_random_nodes(
        &mut self,
        max_node_count: usize,
        filter: NeighbourFilter,
    ) -> Result<Vec<NodeInfo>, Error> {
        let response = self
            .call(proto::remote_node_request::Request::GetRandomNodes(
                proto::GetRandomNodesRequest {
                    max_node_count: max_node_count.min(u32::MAX as usize) as u32,
                    include_neighbours: filter == NeighbourFilter::Included,
                },
            ))
            .await?;

        match response {
            proto::remote_node_response::Response::GetRandomNodes(proto::GetRandomNodesResponse { nodes }) => {
                infos_from_wire(&nodes)
            }
            _ => Err(Error::BadResponse("mismatching response variant".into())),
        }
    }

    async fn get_closest_nodes_by_distance(
        &mut self,
        location: &GpsLocation,
        max_radius_km: Distance,
        max_node_count: usize,
        filter: NeighbourFilter,
    ) -> Result<Vec<NodeInfo>, Error> {
        let response = self
            .call(proto::remote_node_request::Request::GetClosestNodes(
                proto::GetClosestNodesByDistanceRequest {
                    location: Some(location.into()),
                    max_radius_km: max_radius_km as f32,
                    max_node_count: max_node_count.min(u32::MAX as usize) as u32,
                    include_neighbours: filter == NeighbourFilter::Included,
                },
            ))
            .await?;

        match response {
            proto::remote_node_response::Response::GetClosestNodes(proto::GetClosestNodesByDistanceResponse {
                nodes,
            }) => infos_from_wire(&nodes),
            _ => Err(Error::BadResponse("mismatching response variant".into())),
        }
    }

    async fn accept_colleague(&mut self, requestor: NodeInfo) -> Result<PeerAcceptance, Error> {
        let response = self
            .call(proto::remote_node_request::Request::AcceptColleague(
                proto::AcceptColleagueRequest {
                    requestor_node_info: Some((&requestor).into()),
                },
            ))
            .await?;

        match response {
            proto::remote_node_response::Response::AcceptColleague(proto::AcceptColleagueResponse {
                accepted,
                acceptor_node_info,
                remote_ip_address,
            }) => self.into_acceptance(accepted, acceptor_node_info, &remote_ip_address),
            _ => Err(Error::BadResponse("mismatching response variant".into())),
        }
    }

    async fn renew_colleague(&mut self, requestor: NodeInfo) -> Result<PeerAcceptance, Error> {
        let response = self
            .call(proto::remote_node_request::Request::RenewColleague(
                proto::RenewColleagueRequest {
                    requestor_node_info: Some((&requestor).into()),
                },
            ))
            .await?;

        match response {
            proto::remote_node_response::Response::RenewColleague(proto::RenewColleagueResponse {
                accepted,
                acceptor_node_info,
                remote_ip_address,
            }) => self.into_acceptance(accepted, acceptor_node_info, &remote_ip_address),
            _ => Err(Error::BadResponse("mismatching response variant".into())),
        }
    }

    async fn accept_neighbour(&mut self, requestor: NodeInfo) -> Result<PeerAcceptance, Error> {
        let response = self
            .call(proto::remote_node_request::Request::AcceptNeighbour(
                proto::AcceptNeighbourRequest {
                    requestor_node_info: Some((&requestor).into()),
                },
            ))
            .await?;

        match response {
            proto::remote_node_response::Response::AcceptNeighbour(proto::AcceptNeighbourResponse {
                accepted,
                acceptor_node_info,
                remote_ip_address,
            }) => self.into_acceptance(accepted, acceptor_node_info, &remote_ip_address),
            _ => Err(Error::BadResponse("mismatching response variant".into())),
        }
    }

    async fn renew_neighbour(&mut self, requestor: NodeInfo) -> Result<PeerAcceptance, Error> {
        let response = self
            .call(proto::remote_node_request::Request::RenewNeighbour(
                proto::RenewNeighbourRequest {
                    requestor_node_info: Some((&requestor).into()),
                },
            ))
            .await?;

        match response {
            proto::remote_node_response::Response::RenewNeighbour(proto::RenewNeighbourResponse {
                accepted,
                acceptor_node_info,
                remote_ip_address,
            }) => self.into_acceptance(accepted, acceptor_node_info, &remote_ip_address),
            _ => Err(Error::BadResponse("mismatching response variant".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{address_to_bytes, test_fixtures};

    use tokio::net::TcpListener;

    use std::sync::Mutex;

    async fn accept_one(listener: TcpListener, response_for: impl Fn(proto::Message) -> proto::Message + Send + 'static) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let request = session::read_frame(&mut stream).await.unwrap();
        let reply = response_for(request);
        session::write_frame(&mut stream, &reply).await.unwrap();
    }

    fn acceptance_response(id: u32, accepted: bool, echoed_ip: Vec<u8>) -> proto::Message {
        let acceptor = test_fixtures::node_info("Acceptor", 1.0, 2.0);
        messaging::response_message(
            id,
            messaging::ok_response(proto::response::Response::RemoteNode(proto::RemoteNodeResponse {
                response: Some(proto::remote_node_response::Response::AcceptColleague(
                    proto::AcceptColleagueResponse {
                        accepted,
                        acceptor_node_info: Some((&acceptor).into()),
                        remote_ip_address: echoed_ip,
                    },
                )),
            })),
        )
    }

    #[tokio::test]
    async fn accept_colleague_round_trip_reports_external_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = NetworkEndpoint::new("127.0.0.1", listener.local_addr().unwrap().port());

        let echoed: IpAddr = "198.51.100.7".parse().unwrap();
        let echoed_bytes = address_to_bytes(&echoed);
        tokio::spawn(accept_one(listener, move |request| {
            assert_eq!(request.id, 1);
            assert!(matches!(request.body, Some(proto::message::Body::Request(_))));
            acceptance_response(request.id, true, echoed_bytes.clone())
        }));

        let detected = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&detected);
        let callback: DetectedIpCallback = Arc::new(move |addr| {
            *seen.lock().unwrap() = Some(addr);
        });

        let mut proxy = NodeProxy::connect(&endpoint, Some(callback)).await.unwrap();
        let acceptance = proxy
            .accept_colleague(test_fixtures::node_info("Requestor", 3.0, 4.0))
            .await
            .unwrap();

        assert!(acceptance.accepted);
        assert_eq!(acceptance.acceptor_info.unwrap().id(), "Acceptor");
        assert_eq!(*detected.lock().unwrap(), Some(echoed));
    }

    #[tokio::test]
    async fn mismatching_response_id_is_a_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = NetworkEndpoint::new("127.0.0.1", listener.local_addr().unwrap().port());

        tokio::spawn(accept_one(listener, |request| {
            acceptance_response(request.id + 7, true, Vec::new())
        }));

        let mut proxy = NodeProxy::connect(&endpoint, None).await.unwrap();
        let result = proxy.accept_colleague(test_fixtures::node_info("Requestor", 3.0, 4.0)).await;

        assert!(matches!(result, Err(Error::BadResponse(_))));
    }

    #[tokio::test]
    async fn error_status_surfaces_as_typed_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = NetworkEndpoint::new("127.0.0.1", listener.local_addr().unwrap().port());

        tokio::spawn(accept_one(listener, |request| {
            messaging::response_message(
                request.id,
                messaging::error_response(&Error::InvalidState("unknown node id".into())),
            )
        }));

        let mut proxy = NodeProxy::connect(&endpoint, None).await.unwrap();
        let result = proxy.renew_colleague(test_fixtures::node_info("Requestor", 3.0, 4.0)).await;

        assert!(matches!(result, Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn connection_refused_surfaces_as_transport_error() {
        // Bind and drop to obtain a port that very likely refuses.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = NetworkEndpoint::new("127.0.0.1", listener.local_addr().unwrap().port());
        drop(listener);

        let result = NodeProxy::connect(&endpoint, None).await;
        assert!(matches!(result, Err(Error::Connection(_))));
    }
}
