// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! A persistent spatial database backed by Sled.
//!
//! The in-memory database stays the source of truth for queries; a mirror
//! listener writes every change through to disk, and the stored rows are
//! replayed into the index on startup.

use crate::{
    error::Error,
    event::{ChangeListener, DbChange},
    geo::{Distance, GpsLocation},
    peer::{
        db::{InMemorySpatialDb, NeighbourFilter, SpatialDatabase},
        NodeDbEntry,
    },
};

use sled::Db;

/// Session id reserved for the write-through mirror listener.
const SLED_MIRROR_SESSION_ID: &str = "locnet-sled-mirror";

/// The config for the Sled spatial database.
pub type SledSpatialDbConfig = sled::Config;

/// The (persistent) Sled spatial database.
pub struct SledSpatialDb {
    index: InMemorySpatialDb,
    db: Db,
}

impl SledSpatialDb {
    /// Opens (or creates) the store and replays the persisted entries into
    /// the in-memory index.
    pub fn new(config: SledSpatialDbConfig, location: GpsLocation) -> Result<Self, Error> {
        let db = config
            .open()
            .map_err(|e| Error::Internal(format!("error opening peer store: {}", e)))?;

        let index = InMemorySpatialDb::new(location);
        for row in db.iter() {
            let (_, value) = row.map_err(|e| Error::Internal(format!("error reading peer store: {}", e)))?;
            let entry: NodeDbEntry = bincode::deserialize(&value)
                .map_err(|e| Error::Internal(format!("error decoding stored peer: {}", e)))?;
            index.store(entry)?;
        }

        index.add_listener(Box::new(SledMirror { db: db.clone() }));

        Ok(Self { index, db })
    }

    /// The number of rows currently on disk.
    pub fn persisted_len(&self) -> usize {
        self.db.len()
    }
}

struct SledMirror {
    db: Db,
}

impl ChangeListener for SledMirror {
    fn session_id(&self) -> &str {
        SLED_MIRROR_SESSION_ID
    }

    fn on_change(&self, change: &DbChange) -> bool {
        let result = match change {
            DbChange::Added(entry) | DbChange::Updated(entry) => match bincode::serialize(entry) {
                Ok(bytes) => self.db.insert(entry.id(), bytes).map(|_| ()),
                Err(e) => {
                    log::error!("Failed to encode peer {} for persistence: {}", entry.id(), e);
                    return true;
                }
            },
            DbChange::Removed(entry) => self.db.remove(entry.id()).map(|_| ()),
        };

        if let Err(e) = result {
            log::error!("Peer store write failed: {}", e);
        }

        // Persistence trouble never silences the other listeners.
        true
    }
}

impl SpatialDatabase for SledSpatialDb {
    fn location(&self) -> GpsLocation {
        self.index.location()
    }

    fn store(&self, entry: NodeDbEntry) -> Result<(), Error> {
        self.index.store(entry)
    }

    fn update(&self, entry: NodeDbEntry) -> Result<(), Error> {
        self.index.update(entry)
    }

    fn remove(&self, id: &str) -> Result<NodeDbEntry, Error> {
        self.index.remove(id)
    }

    fn lookup(&self, id: &str) -> Option<NodeDbEntry> {
        self.index.lookup(id)
    }

    fn get_closest_nodes_by_distance(
        &self,
        origin: &GpsLocation,
        max_radius_km: Distance,
        max_count: usize,
        filter: NeighbourFilter,
    ) -> Vec<NodeDbEntry> {
        self.index.get_closest_nodes_by_distance(origin, max_radius_km, max_count, filter)
    }

    fn get_random_nodes(&self, max_count: usize, filter: NeighbourFilter) -> Vec<NodeDbEntry> {
        self.index.get_random_nodes(max_count, filter)
    }

    fn get_neighbour_nodes_by_distance(&self) -> Vec<NodeDbEntry> {
        self.index.get_neighbour_nodes_by_distance()
    }

    fn get_colleague_node_count(&self) -> usize {
        self.index.get_colleague_node_count()
    }

    fn get_node_count(&self) -> usize {
        self.index.get_node_count()
    }

    fn expire_old_nodes(&self) {
        self.index.expire_old_nodes()
    }

    fn add_listener(&self, listener: Box<dyn ChangeListener>) {
        self.index.add_listener(listener)
    }

    fn remove_listener(&self, session_id: &str) {
        self.index.remove_listener(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{test_fixtures, NodeRelation};

    fn budapest() -> GpsLocation {
        GpsLocation::new(47.4979, 19.0402).unwrap()
    }

    #[test]
    fn changes_are_mirrored_to_disk() {
        let db = SledSpatialDb::new(sled::Config::new().temporary(true), budapest()).unwrap();

        db.store(test_fixtures::entry("Wien", 48.2082, 16.3738, NodeRelation::Colleague))
            .unwrap();
        db.store(test_fixtures::entry("London", 51.5074, -0.1278, NodeRelation::Colleague))
            .unwrap();
        assert_eq!(db.persisted_len(), 2);

        db.remove("Wien").unwrap();
        assert_eq!(db.persisted_len(), 1);
        assert_eq!(db.get_node_count(), 1);
    }

    #[test]
    fn persisted_entries_survive_a_reopen() {
        let path = std::env::temp_dir().join(format!("locnet-sled-test-{}", std::process::id()));

        {
            let db = SledSpatialDb::new(sled::Config::new().path(&path), budapest()).unwrap();
            db.store(test_fixtures::entry("Kecskemet", 46.9065, 19.6913, NodeRelation::Neighbour))
                .unwrap();
        }

        {
            let db = SledSpatialDb::new(sled::Config::new().path(&path), budapest()).unwrap();
            let restored = db.lookup("Kecskemet").expect("entry lost on reopen");
            assert_eq!(restored.relation(), NodeRelation::Neighbour);
            assert_eq!(db.get_neighbour_nodes_by_distance().len(), 1);
        }

        let _ = std::fs::remove_dir_all(&path);
    }
}
