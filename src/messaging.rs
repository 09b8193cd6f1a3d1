// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Conversions between the internal data model and the protobuf wire
//! schema, plus message construction helpers.

use crate::{
    error::Error,
    event::DbChange,
    geo::GpsLocation,
    peer::{self, NetworkInterface, NodeInfo, NodeProfile, ServiceProfile, ServiceType},
    proto,
};

use num_traits::FromPrimitive as _;

use std::collections::HashMap;

/// The protocol version announced in every message. Peers only need to
/// agree on the major component.
pub(crate) const PROTOCOL_VERSION: [u8; 3] = [1, 0, 0];

/// Wire encoding scales coordinates to integers with this factor, which
/// bounds the round-trip error to about 0.1 m.
pub(crate) const GPS_COORDINATE_SCALE: f64 = 1_000_000.0;

pub(crate) fn check_version(version: &[u8]) -> Result<(), Error> {
    match version.first() {
        Some(&major) if major == PROTOCOL_VERSION[0] => Ok(()),
        Some(&major) => Err(Error::BadRequest(format!("unsupported protocol version: {}", major))),
        None => Err(Error::BadRequest("missing protocol version".into())),
    }
}

impl From<&GpsLocation> for proto::GpsLocation {
    fn from(location: &GpsLocation) -> Self {
        Self {
            latitude: (location.latitude() * GPS_COORDINATE_SCALE).round() as i32,
            longitude: (location.longitude() * GPS_COORDINATE_SCALE).round() as i32,
        }
    }
}

impl TryFrom<&proto::GpsLocation> for GpsLocation {
    type Error = Error;

    fn try_from(location: &proto::GpsLocation) -> Result<Self, Self::Error> {
        GpsLocation::new(
            location.latitude as f64 / GPS_COORDINATE_SCALE,
            location.longitude as f64 / GPS_COORDINATE_SCALE,
        )
    }
}

impl From<&NetworkInterface> for proto::NetworkInterface {
    fn from(contact: &NetworkInterface) -> Self {
        Self {
            ip_address: contact.address_bytes(),
            port: contact.port() as u32,
        }
    }
}

impl TryFrom<&proto::NetworkInterface> for NetworkInterface {
    type Error = Error;

    fn try_from(contact: &proto::NetworkInterface) -> Result<Self, Self::Error> {
        let port = u16::try_from(contact.port)
            .map_err(|_| Error::InvalidValue(format!("port out of range: {}", contact.port)))?;

        NetworkInterface::from_ip(peer::address_from_bytes(&contact.ip_address)?, port)
    }
}

impl From<&NodeProfile> for proto::NodeProfile {
    fn from(profile: &NodeProfile) -> Self {
        Self {
            node_id: profile.id().to_string(),
            contacts: profile.contacts().iter().map(Into::into).collect(),
        }
    }
}

impl TryFrom<&proto::NodeProfile> for NodeProfile {
    type Error = Error;

    fn try_from(profile: &proto::NodeProfile) -> Result<Self, Self::Error> {
        let contacts = profile
            .contacts
            .iter()
            .map(TryInto::try_into)
            .collect::<Result<Vec<_>, _>>()?;

        NodeProfile::new(&profile.node_id, contacts)
    }
}

impl From<&NodeInfo> for proto::NodeInfo {
    fn from(info: &NodeInfo) -> Self {
        Self {
            profile: Some(info.profile().into()),
            location: Some(info.location().into()),
        }
    }
}

impl TryFrom<&proto::NodeInfo> for NodeInfo {
    type Error = Error;

    fn try_from(info: &proto::NodeInfo) -> Result<Self, Self::Error> {
        let profile = info
            .profile
            .as_ref()
            .ok_or_else(|| Error::InvalidValue("missing node profile".into()))?;
        let location = info
            .location
            .as_ref()
            .ok_or_else(|| Error::InvalidValue("missing node location".into()))?;

        Ok(NodeInfo::new(profile.try_into()?, location.try_into()?))
    }
}

impl From<&ServiceProfile> for proto::ServiceProfile {
    fn from(profile: &ServiceProfile) -> Self {
        Self {
            service_id: profile.service_id().to_string(),
            contacts: profile.contacts().iter().map(Into::into).collect(),
        }
    }
}

impl TryFrom<&proto::ServiceProfile> for ServiceProfile {
    type Error = Error;

    fn try_from(profile: &proto::ServiceProfile) -> Result<Self, Self::Error> {
        let contacts = profile
            .contacts
            .iter()
            .map(TryInto::try_into)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ServiceProfile::new(&profile.service_id, contacts))
    }
}

pub(crate) fn service_type_from_wire(raw: i32) -> Result<ServiceType, Error> {
    ServiceType::from_i32(raw).ok_or_else(|| Error::InvalidValue(format!("unknown service type: {}", raw)))
}

pub(crate) fn services_to_wire(services: &HashMap<ServiceType, ServiceProfile>) -> Vec<proto::ServiceEntry> {
    services
        .iter()
        .map(|(service_type, profile)| proto::ServiceEntry {
            service_type: *service_type as i32,
            profile: Some(profile.into()),
        })
        .collect()
}

pub(crate) fn infos_to_wire(infos: &[NodeInfo]) -> Vec<proto::NodeInfo> {
    infos.iter().map(Into::into).collect()
}

/// Builds an outbound request message carrying the given session-local id.
pub(crate) fn request_message(id: u32, request: proto::request::Request) -> proto::Message {
    proto::Message {
        id,
        version: PROTOCOL_VERSION.to_vec(),
        body: Some(proto::message::Body::Request(proto::Request { request: Some(request) })),
    }
}

/// Builds the response message answering the request with the given id.
pub(crate) fn response_message(id: u32, response: proto::Response) -> proto::Message {
    proto::Message {
        id,
        version: PROTOCOL_VERSION.to_vec(),
        body: Some(proto::message::Body::Response(response)),
    }
}

pub(crate) fn ok_response(response: proto::response::Response) -> proto::Response {
    proto::Response {
        status: proto::Status::Ok as i32,
        details: String::new(),
        response: Some(response),
    }
}

pub(crate) fn error_response(error: &Error) -> proto::Response {
    proto::Response {
        status: error.to_status() as i32,
        details: error.to_string(),
        response: None,
    }
}

/// Translates a database change into its wire notification form. Removed
/// entries travel as a bare node id.
pub(crate) fn change_to_wire(change: &DbChange) -> proto::NeighbourhoodChange {
    let change = match change {
        DbChange::Added(e) => proto::neighbourhood_change::Change::AddedNodeInfo(e.info().into()),
        DbChange::Updated(e) => proto::neighbourhood_change::Change::UpdatedNodeInfo(e.info().into()),
        DbChange::Removed(e) => proto::neighbourhood_change::Change::RemovedNodeId(e.id().to_string()),
    };

    proto::NeighbourhoodChange { change: Some(change) }
}
