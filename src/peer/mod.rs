// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Peer records: who a node is, how to reach it, and how it relates to us.

pub(crate) mod db;
#[cfg(feature = "sled1")]
pub mod store;

pub use db::{InMemorySpatialDb, NeighbourFilter, SpatialDatabase};

use crate::{
    error::Error,
    geo::GpsLocation,
    time::Timestamp,
};

use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

/// The opaque identifier of a node.
pub type NodeId = String;

/// Restores an IP address from its packed 4 or 16 byte form.
pub fn address_from_bytes(bytes: &[u8]) -> Result<IpAddr, Error> {
    match bytes.len() {
        4 => {
            let mut packed = [0u8; 4];
            packed.copy_from_slice(bytes);
            Ok(IpAddr::V4(Ipv4Addr::from(packed)))
        }
        16 => {
            let mut packed = [0u8; 16];
            packed.copy_from_slice(bytes);
            Ok(IpAddr::V6(Ipv6Addr::from(packed)))
        }
        n => Err(Error::InvalidValue(format!("invalid packed address length: {}", n))),
    }
}

/// Returns the packed byte form of an IP address (4 or 16 bytes).
pub fn address_to_bytes(addr: &IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

/// The address family of a contact.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum AddressType {
    Ipv4,
    Ipv6,
}

/// A reachable endpoint of a node: an IP address plus a TCP port.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NetworkInterface {
    address: IpAddr,
    port: u16,
}

impl NetworkInterface {
    /// Creates a contact from a textual address, validating that the
    /// address parses, matches the claimed family and the port is nonzero.
    pub fn new(addr_type: AddressType, address: &str, port: u16) -> Result<Self, Error> {
        let address: IpAddr = address
            .parse()
            .map_err(|_| Error::InvalidValue(format!("unparseable ip address: {}", address)))?;

        match (addr_type, &address) {
            (AddressType::Ipv4, IpAddr::V4(_)) | (AddressType::Ipv6, IpAddr::V6(_)) => {}
            _ => {
                return Err(Error::InvalidValue(format!(
                    "address {} does not match family {:?}",
                    address, addr_type
                )))
            }
        }

        Self::from_ip(address, port)
    }

    /// Creates a contact from an already parsed address.
    pub fn from_ip(address: IpAddr, port: u16) -> Result<Self, Error> {
        if port == 0 {
            return Err(Error::InvalidValue("port must be nonzero".into()));
        }

        Ok(Self { address, port })
    }

    pub fn addr_type(&self) -> AddressType {
        match self.address {
            IpAddr::V4(_) => AddressType::Ipv4,
            IpAddr::V6(_) => AddressType::Ipv6,
        }
    }

    /// The canonical textual form of the address.
    pub fn address(&self) -> String {
        self.address.to_string()
    }

    pub fn ip(&self) -> IpAddr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The packed byte form of the address (4 or 16 bytes).
    pub fn address_bytes(&self) -> Vec<u8> {
        address_to_bytes(&self.address)
    }

    pub(crate) fn with_ip(&self, address: IpAddr) -> Self {
        Self {
            address,
            port: self.port,
        }
    }
}

impl fmt::Display for NetworkInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// A contactable host, possibly given as an unresolved DNS name. Seeds are
/// configured this way.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NetworkEndpoint {
    pub host: String,
    pub port: u16,
}

impl NetworkEndpoint {
    pub fn new(host: impl ToString, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }

    /// Whether the endpoint names the loopback interface. Seeds on loopback
    /// are only contacted in test mode.
    pub fn is_loopback(&self) -> bool {
        self.host
            .parse::<IpAddr>()
            .map_or(self.host == "localhost", |ip| ip.is_loopback())
    }
}

impl From<&NetworkInterface> for NetworkEndpoint {
    fn from(contact: &NetworkInterface) -> Self {
        Self {
            host: contact.address(),
            port: contact.port(),
        }
    }
}

impl fmt::Display for NetworkEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The identity and the contact list of a node.
///
/// Two profiles are equal iff the ids match and the contact sequences match
/// element-wise.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeProfile {
    id: NodeId,
    contacts: Vec<NetworkInterface>,
}

impl NodeProfile {
    pub fn new(id: impl ToString, contacts: Vec<NetworkInterface>) -> Result<Self, Error> {
        let id = id.to_string();
        if id.is_empty() {
            return Err(Error::InvalidValue("empty node id".into()));
        }

        Ok(Self { id, contacts })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn contacts(&self) -> &[NetworkInterface] {
        &self.contacts
    }

    pub(crate) fn contacts_mut(&mut self) -> &mut Vec<NetworkInterface> {
        &mut self.contacts
    }
}

/// A node profile paired with the node's geographic position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    profile: NodeProfile,
    location: GpsLocation,
}

impl NodeInfo {
    pub fn new(profile: NodeProfile, location: GpsLocation) -> Self {
        Self { profile, location }
    }

    pub fn profile(&self) -> &NodeProfile {
        &self.profile
    }

    pub(crate) fn profile_mut(&mut self) -> &mut NodeProfile {
        &mut self.profile
    }

    pub fn location(&self) -> &GpsLocation {
        &self.location
    }

    pub fn id(&self) -> &str {
        self.profile.id()
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.profile.id(), self.location)
    }
}

/// How a stored peer relates to the owning node.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum NodeRelation {
    /// A far-away peer kept for world coverage.
    Colleague,
    /// A nearby peer kept for neighbourhood coverage.
    Neighbour,
    /// The owning node itself. Reserved by the protocol; never produced by
    /// database queries.
    Own,
}

/// Which side initiated the stored relationship.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum NodeContactRole {
    Initiator,
    Acceptor,
}

/// A peer record as stored in the spatial database.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeDbEntry {
    info: NodeInfo,
    relation: NodeRelation,
    role: NodeContactRole,
    expires_at: Timestamp,
}

impl NodeDbEntry {
    pub fn new(info: NodeInfo, relation: NodeRelation, role: NodeContactRole, expires_at: Timestamp) -> Self {
        Self {
            info,
            relation,
            role,
            expires_at,
        }
    }

    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    pub fn id(&self) -> &str {
        self.info.id()
    }

    pub fn location(&self) -> &GpsLocation {
        self.info.location()
    }

    pub fn relation(&self) -> NodeRelation {
        self.relation
    }

    pub fn role(&self) -> NodeContactRole {
        self.role
    }

    pub fn expires_at(&self) -> Timestamp {
        self.expires_at
    }

    pub(crate) fn with_expiry(mut self, expires_at: Timestamp) -> Self {
        self.expires_at = expires_at;
        self
    }
}

/// The services a node may announce to its local neighbourhood.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, FromPrimitive, Serialize, Deserialize)]
#[repr(u32)]
pub enum ServiceType {
    Unstructured = 0,
    Content = 1,
    Latency = 2,
    Location = 3,
    Token = 4,
    Profile = 5,
    Proximity = 6,
    Relay = 7,
    Reputation = 8,
    Minting = 9,
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The published endpoint data of a locally attached service.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ServiceProfile {
    service_id: String,
    contacts: Vec<NetworkInterface>,
}

impl ServiceProfile {
    pub fn new(service_id: impl ToString, contacts: Vec<NetworkInterface>) -> Self {
        Self {
            service_id: service_id.to_string(),
            contacts,
        }
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn contacts(&self) -> &[NetworkInterface] {
        &self.contacts
    }
}
