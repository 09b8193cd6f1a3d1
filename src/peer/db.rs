// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The spatial peer database: peer records indexed by great-circle
//! distance, with TTL expiration and a change notification stream.

use crate::{
    error::Error,
    event::{ChangeListener, DbChange},
    geo::{self, Distance, GpsLocation},
    peer::{NodeDbEntry, NodeId, NodeRelation},
    time::{self, Timestamp},
};

use priority_queue::PriorityQueue;
use rand::seq::SliceRandom;

use std::{
    cmp::{Ordering, Reverse},
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

/// Whether neighbour entries take part in a query.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NeighbourFilter {
    Included,
    Excluded,
}

impl NeighbourFilter {
    fn admits(&self, entry: &NodeDbEntry) -> bool {
        match self {
            NeighbourFilter::Included => true,
            NeighbourFilter::Excluded => entry.relation() != NodeRelation::Neighbour,
        }
    }
}

/// Storage of peer records with the distance queries the overlay relies on.
///
/// Exactly one entry exists per node id. All change events are dispatched
/// synchronously on the mutating thread, after the mutation is visible.
pub trait SpatialDatabase: Send + Sync {
    /// The location of the owning node; `get_neighbour_nodes_by_distance`
    /// orders relative to it.
    fn location(&self) -> GpsLocation;

    /// Inserts or replaces an entry. Emits `Added` on insert, `Updated` on
    /// replacement of an existing id.
    fn store(&self, entry: NodeDbEntry) -> Result<(), Error>;

    /// Replaces an existing entry; fails if the id is unknown.
    fn update(&self, entry: NodeDbEntry) -> Result<(), Error>;

    /// Deletes an entry; fails if the id is unknown. Emits `Removed`.
    fn remove(&self, id: &str) -> Result<NodeDbEntry, Error>;

    /// Returns the entry stored under the given id, if any.
    fn lookup(&self, id: &str) -> Option<NodeDbEntry>;

    /// Great-circle distance between two locations.
    fn get_distance_km(&self, a: &GpsLocation, b: &GpsLocation) -> Distance {
        geo::distance_km(a, b)
    }

    /// Up to `max_count` entries within `max_radius_km` of `origin`, sorted
    /// ascending by distance (ties broken by id).
    fn get_closest_nodes_by_distance(
        &self,
        origin: &GpsLocation,
        max_radius_km: Distance,
        max_count: usize,
        filter: NeighbourFilter,
    ) -> Vec<NodeDbEntry>;

    /// Up to `max_count` entries sampled uniformly without replacement.
    fn get_random_nodes(&self, max_count: usize, filter: NeighbourFilter) -> Vec<NodeDbEntry>;

    /// All neighbour entries sorted ascending by distance from the owner.
    fn get_neighbour_nodes_by_distance(&self) -> Vec<NodeDbEntry>;

    /// The number of stored colleague entries.
    fn get_colleague_node_count(&self) -> usize;

    /// The number of stored entries.
    fn get_node_count(&self) -> usize;

    /// Removes every entry whose expiry lies in the past, emitting
    /// `Removed` for each.
    fn expire_old_nodes(&self);

    /// Registers a change observer.
    fn add_listener(&self, listener: Box<dyn ChangeListener>);

    /// Unregisters the observer installed by the given session, if any.
    fn remove_listener(&self, session_id: &str);
}

/// The in-memory spatial database.
#[derive(Clone)]
pub struct InMemorySpatialDb {
    location: GpsLocation,
    inner: Arc<Mutex<DbInner>>,
}

#[derive(Default)]
struct DbInner {
    entries: HashMap<NodeId, NodeDbEntry>,
    // Wakes up with the entry closest to expiry on top.
    expiry: PriorityQueue<NodeId, Reverse<Timestamp>>,
    listeners: Vec<Box<dyn ChangeListener>>,
}

impl DbInner {
    fn notify(&mut self, change: &DbChange) {
        self.listeners.retain(|l| l.on_change(change));
    }
}

impl InMemorySpatialDb {
    /// Creates an empty database owned by a node at the given location.
    pub fn new(location: GpsLocation) -> Self {
        Self {
            location,
            inner: Arc::new(Mutex::new(DbInner::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DbInner> {
        self.inner.lock().expect("spatial db lock poisoned")
    }
}

fn by_distance_then_id(origin: &GpsLocation) -> impl Fn(&NodeDbEntry, &NodeDbEntry) -> Ordering + '_ {
    move |a, b| {
        let da = geo::distance_km(origin, a.location());
        let db = geo::distance_km(origin, b.location());
        da.partial_cmp(&db)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id().cmp(b.id()))
    }
}

impl SpatialDatabase for InMemorySpatialDb {
    fn location(&self) -> GpsLocation {
        self.location
    }

    fn store(&self, entry: NodeDbEntry) -> Result<(), Error> {
        let mut inner = self.lock();

        let id = entry.id().to_string();
        inner.expiry.push(id.clone(), Reverse(entry.expires_at()));

        let change = match inner.entries.insert(id, entry.clone()) {
            Some(_) => DbChange::Updated(entry),
            None => DbChange::Added(entry),
        };
        inner.notify(&change);

        Ok(())
    }

    fn update(&self, entry: NodeDbEntry) -> Result<(), Error> {
        let mut inner = self.lock();

        if !inner.entries.contains_key(entry.id()) {
            return Err(Error::InvalidState(format!("unknown node id: {}", entry.id())));
        }

        let id = entry.id().to_string();
        inner.expiry.push(id.clone(), Reverse(entry.expires_at()));
        inner.entries.insert(id, entry.clone());
        inner.notify(&DbChange::Updated(entry));

        Ok(())
    }

    fn remove(&self, id: &str) -> Result<NodeDbEntry, Error> {
        let mut inner = self.lock();

        let entry = inner
            .entries
            .remove(id)
            .ok_or_else(|| Error::InvalidState(format!("unknown node id: {}", id)))?;
        inner.expiry.remove(id);
        inner.notify(&DbChange::Removed(entry.clone()));

        Ok(entry)
    }

    fn lookup(&self, id: &str) -> Option<NodeDbEntry> {
        self.lock().entries.get(id).cloned()
    }

    fn get_closest_nodes_by_distance(
        &self,
        origin: &GpsLocation,
        max_radius_km: Distance,
        max_count: usize,
        filter: NeighbourFilter,
    ) -> Vec<NodeDbEntry> {
        let inner = self.lock();

        let mut result = inner
            .entries
            .values()
            .filter(|e| filter.admits(e))
            .filter(|e| geo::distance_km(origin, e.location()) <= max_radius_km)
            .cloned()
            .collect::<Vec<_>>();

        result.sort_by(by_distance_then_id(origin));
        result.truncate(max_count);
        result
    }

    fn get_random_nodes(&self, max_count: usize, filter: NeighbourFilter) -> Vec<NodeDbEntry> {
        let inner = self.lock();

        let population = inner
            .entries
            .values()
            .filter(|e| filter.admits(e))
            .cloned()
            .collect::<Vec<_>>();

        population
            .choose_multiple(&mut rand::thread_rng(), max_count)
            .cloned()
            .collect()
    }

    fn get_neighbour_nodes_by_distance(&self) -> Vec<NodeDbEntry> {
        let inner = self.lock();

        let mut result = inner
            .entries
            .values()
            .filter(|e| e.relation() == NodeRelation::Neighbour)
            .cloned()
            .collect::<Vec<_>>();

        result.sort_by(by_distance_then_id(&self.location));
        result
    }

    fn get_colleague_node_count(&self) -> usize {
        self.lock()
            .entries
            .values()
            .filter(|e| e.relation() == NodeRelation::Colleague)
            .count()
    }

    fn get_node_count(&self) -> usize {
        self.lock().entries.len()
    }

    fn expire_old_nodes(&self) {
        let now = time::unix_now_secs();
        let mut inner = self.lock();

        while let Some((id, &Reverse(expires_at))) = inner.expiry.peek() {
            if expires_at >= now {
                break;
            }
            let id = id.clone();

            inner.expiry.remove(&id);
            // The queue entry may be stale; only drop entries whose stored
            // expiry really lies in the past.
            if let Some(entry) = inner.entries.get(&id) {
                if entry.expires_at() < now {
                    let entry = inner.entries.remove(&id).expect("entry vanished under lock");
                    log::debug!("Expired node {}.", id);
                    inner.notify(&DbChange::Removed(entry));
                }
            }
        }
    }

    fn add_listener(&self, listener: Box<dyn ChangeListener>) {
        self.lock().listeners.push(listener);
    }

    fn remove_listener(&self, session_id: &str) {
        self.lock().listeners.retain(|l| l.session_id() != session_id);
    }
}
