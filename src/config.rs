// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Overlay node configuration.

use crate::{
    geo::GpsLocation,
    peer::{NetworkEndpoint, NetworkInterface},
};

use serde::{Deserialize, Serialize};

use std::path::PathBuf;

#[rustfmt::skip]
// # Example
// ```json
// {
//     "nodeId": "TestNode",
//     "listenPorts": { "node": 16980, "local": 16981, "client": 16982 },
//     "advertisedContacts": [ { "address": "198.51.100.7", "port": 16980 } ],
//     "seeds": [ { "host": "seed.locnet.example.org", "port": 16980 } ],
//     "location": { "latitude": 47.4979, "longitude": 19.0402 },
//     "dbPath": "./peerdb",
//     "isTestMode": false
// }
// ```

/// The complete configuration of a locnet node.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocnetConfig {
    /// The id this node announces to its peers.
    pub node_id: String,
    /// The ports of the three listeners.
    pub listen_ports: ListenPorts,
    /// Contacts advertised to peers in addition to any detected external
    /// address.
    #[serde(default)]
    pub advertised_contacts: Vec<NetworkInterface>,
    /// The seed endpoints used for bootstrapping.
    #[serde(default)]
    pub seeds: Vec<NetworkEndpoint>,
    /// The geographic position of this node.
    pub location: GpsLocation,
    /// Where the persistent peer store keeps its data, if one is used.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    /// How long a stored peer relation lives without renewal, in seconds.
    #[serde(default = "default_db_expiration_period")]
    pub db_expiration_period: u64,
    /// The period of the maintenance worker (renewal + expiry), in seconds.
    #[serde(default = "default_db_maintenance_period")]
    pub db_maintenance_period: u64,
    /// The period of the discovery worker, in seconds.
    #[serde(default = "default_discovery_period")]
    pub discovery_period: u64,
    /// Relations whose remaining lifetime drops below this window are
    /// renewed by the maintenance worker, in seconds.
    #[serde(default = "default_renewal_period")]
    pub renewal_period: u64,
    /// The bounded size of the neighbour ring.
    #[serde(default = "default_neighbourhood_target")]
    pub neighbourhood_target: usize,
    /// The targeted size of the colleague world map.
    #[serde(default = "default_colleague_target")]
    pub colleague_target: usize,
    /// Test mode permits loopback seeds and serves every interface on
    /// every port.
    #[serde(default)]
    pub is_test_mode: bool,
}

/// The listen ports of the three interfaces.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenPorts {
    /// Node-to-node interface.
    pub node: u16,
    /// Local-service interface.
    pub local: u16,
    /// Client interface.
    pub client: u16,
}

fn default_db_expiration_period() -> u64 {
    60 * 60 * 24
}

fn default_db_maintenance_period() -> u64 {
    60 * 60
}

fn default_discovery_period() -> u64 {
    60 * 15
}

fn default_renewal_period() -> u64 {
    60 * 60 * 6
}

fn default_neighbourhood_target() -> usize {
    20
}

fn default_colleague_target() -> usize {
    100
}
