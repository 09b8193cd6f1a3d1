// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Database change observation and the public overlay event stream.

use crate::peer::{NodeDbEntry, NodeId, NodeInfo, NodeRelation};

use tokio::sync::mpsc;

use std::net::IpAddr;

/// A mutation of the spatial database, delivered to registered listeners
/// synchronously on the thread that caused it, after the mutation became
/// visible.
#[derive(Clone, Debug)]
pub enum DbChange {
    /// A new entry was inserted.
    Added(NodeDbEntry),
    /// An existing entry was replaced.
    Updated(NodeDbEntry),
    /// An entry was deleted or expired.
    Removed(NodeDbEntry),
}

impl DbChange {
    pub fn entry(&self) -> &NodeDbEntry {
        match self {
            DbChange::Added(e) | DbChange::Updated(e) | DbChange::Removed(e) => e,
        }
    }
}

/// An observer of spatial database changes. Listeners are identified by the
/// session that installed them so that deregistration is idempotent.
pub trait ChangeListener: Send {
    /// The id of the session this listener belongs to.
    fn session_id(&self) -> &str;

    /// Delivers one change. Returning `false` marks the listener defunct;
    /// the database drops it afterwards.
    fn on_change(&self, change: &DbChange) -> bool;
}

/// Overlay events published to the embedding application.
#[derive(Debug)]
pub enum Event {
    /// A new peer entered the database.
    PeerAdded {
        info: NodeInfo,
        relation: NodeRelation,
    },
    /// A stored peer record was replaced.
    PeerUpdated {
        info: NodeInfo,
        relation: NodeRelation,
    },
    /// A stored peer was removed, either explicitly or by expiration.
    PeerRemoved {
        id: NodeId,
    },
    /// A renewal round-trip refreshed a stored relation.
    RelationRenewed {
        id: NodeId,
        relation: NodeRelation,
    },
    /// A remote peer echoed back our apparent external address.
    ExternalAddressDetected {
        address: IpAddr,
    },
}

/// Exposes overlay events.
pub type EventRx = mpsc::UnboundedReceiver<Event>;
pub(crate) type EventTx = mpsc::UnboundedSender<Event>;

pub(crate) fn event_chan() -> (EventTx, EventRx) {
    mpsc::unbounded_channel::<Event>()
}

/// Session id reserved for the internal listener that republishes database
/// changes on the public event channel.
pub(crate) const EVENT_BRIDGE_SESSION_ID: &str = "locnet-event-bridge";

pub(crate) struct EventBridge {
    event_tx: EventTx,
}

impl EventBridge {
    pub(crate) fn new(event_tx: EventTx) -> Self {
        Self { event_tx }
    }
}

impl ChangeListener for EventBridge {
    fn session_id(&self) -> &str {
        EVENT_BRIDGE_SESSION_ID
    }

    fn on_change(&self, change: &DbChange) -> bool {
        let event = match change {
            DbChange::Added(e) => Event::PeerAdded {
                info: e.info().clone(),
                relation: e.relation(),
            },
            DbChange::Updated(e) => Event::PeerUpdated {
                info: e.info().clone(),
                relation: e.relation(),
            },
            DbChange::Removed(e) => Event::PeerRemoved { id: e.id().to_string() },
        };

        self.event_tx.send(event).is_ok()
    }
}
