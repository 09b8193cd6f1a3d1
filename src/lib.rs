// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! A location-based peer-to-peer overlay node.
//!
//! Every node carries a geographic coordinate and sorts its peers into two
//! sets: a sparse world map of far-away *colleagues* and a dense ring of
//! nearby *neighbours*. Nodes answer "closest nodes to location L" queries
//! for clients, and push neighbourhood changes to locally attached services
//! that opted into updates.
//!
//! ## Example
//!
//! In order to run an overlay node you need to provide its `init` function:
//! * a [`LocnetConfig`];
//! * a spatial database, e.g. the [`InMemorySpatialDb`] (non-persistent) or
//!   the Sled-backed store (feature `sled1`), or a custom implementation of
//!   the [`SpatialDatabase`] trait;
//! * a shutdown signal (any `Future`).
//!
//! ```no_run
//! use locnet::{init, Event, InMemorySpatialDb, LocnetConfig};
//!
//! use std::sync::Arc;
//!
//! fn read_config() -> LocnetConfig {
//!     let config_json = r#"
//!     {
//!         "nodeId": "ExampleNode",
//!         "listenPorts": { "node": 16980, "local": 16981, "client": 16982 },
//!         "seeds": [ { "host": "seed.locnet.example.org", "port": 16980 } ],
//!         "location": { "latitude": 47.4979, "longitude": 19.0402 }
//!     }"#;
//!
//!     serde_json::from_str(config_json).expect("error deserializing json config")
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = read_config();
//!     let db = Arc::new(InMemorySpatialDb::new(config.location));
//!
//!     let mut handle = init(config, db, tokio::signal::ctrl_c())
//!         .await
//!         .expect("initializing the overlay node failed");
//!
//!     while let Some(event) = handle.events.recv().await {
//!         match event {
//!             Event::PeerAdded { info, relation } => {
//!                 println!("new {:?}: {}", relation, info);
//!             }
//!             _ => {}
//!         }
//!     }
//! }
//! ```

#![warn(missing_docs)]

mod delay;
mod dispatch;
mod error;
mod geo;
mod listener;
mod local;
mod messaging;
mod node;
mod proto {
    #![allow(missing_docs)]
    include!(concat!(env!("OUT_DIR"), "/proto.rs"));
}
mod proxy;
mod server;
mod session;
mod task;
mod time;

pub mod config;
pub mod event;
pub mod init;
pub mod peer;

pub use config::{ListenPorts, LocnetConfig};
pub use error::Error;
pub use event::{ChangeListener, DbChange, Event, EventRx};
pub use geo::{distance_km, Distance, GpsCoordinate, GpsLocation};
pub use init::{init, LocnetHandle};
pub use local::{LocalNode, LocalNodeInner};
pub use node::{ClientMethods, LocalServiceMethods, Node, PeerAcceptance, RemoteNodeMethods};
pub use peer::{
    AddressType, InMemorySpatialDb, NeighbourFilter, NetworkEndpoint, NetworkInterface, NodeContactRole, NodeDbEntry,
    NodeId, NodeInfo, NodeProfile, NodeRelation, ServiceProfile, ServiceType, SpatialDatabase,
};
#[cfg(feature = "sled1")]
pub use peer::store::{SledSpatialDb, SledSpatialDbConfig};
pub use proxy::{DetectedIpCallback, NodeConnector, NodeProxy, RemoteNode};
pub use time::Timestamp;
