//! Watched-Object Store: persists previously seen objects and node
//! locations across runs, per spec.md §4.3.
//!
//! Grounded on `wildside-core`'s `SqlitePoiStore` for the `rusqlite`
//! access pattern, and on the original `OscDatabase` (`osc_db.py`) for the
//! schema and upsert semantics.

use std::path::{Path, PathBuf};

use log::debug;
use osc_core::{Decimicro, Tags, Variant};
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

/// Errors raised by the Watched-Object Store (spec.md §4.3 "Failure":
/// connectivity errors surface unchanged).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Opening or migrating the SQLite database failed.
    #[error("failed to open watched-object store at {path}: {source}")]
    Open {
        /// Database file location.
        path: PathBuf,
        /// Underlying `rusqlite` error.
        #[source]
        source: rusqlite::Error,
    },
    /// A read or write against the database failed.
    #[error("watched-object store operation failed: {0}")]
    Database(#[from] rusqlite::Error),
    /// A persisted tag payload was not valid JSON.
    #[error("failed to decode stored tags for {osm_id}: {source}")]
    InvalidTags {
        /// The malformed row's store key.
        osm_id: String,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// A previously observed OSM object, restricted to the fields the
/// Matcher's relevant keys admit, per spec.md §3 "StoredObject".
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    /// The object's variant.
    pub variant: Variant,
    /// Id, unique within its variant.
    pub osm_id: i64,
    /// Version at which this snapshot was taken.
    pub version: i64,
    /// Filtered tags (relevant keys only, or empty for a tombstone).
    pub tags: Tags,
    /// Ordered node references, for ways; `None` for nodes and relations.
    pub nodes: Option<Vec<i64>>,
}

impl StoredObject {
    /// The `"<variant-initial><osm_id>"` storage key (spec.md §3).
    #[must_use]
    pub fn store_key(&self) -> String {
        format!("{}{}", self.variant.initial(), self.osm_id)
    }

    fn nodes_column(&self) -> Option<String> {
        self.nodes.as_ref().map(|nodes| {
            nodes
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",")
        })
    }
}

/// A table-name configuration for the Watched-Object Store (spec.md §6.6).
#[derive(Debug, Clone)]
pub struct StoreTables {
    /// Name of the objects table.
    pub objects: String,
    /// Name of the node-locations table.
    pub locations: String,
}

impl Default for StoreTables {
    fn default() -> Self {
        Self {
            objects: "objects".to_owned(),
            locations: "locations".to_owned(),
        }
    }
}

/// Persistent index of previously seen objects and node coordinates.
pub struct WatchedObjectStore {
    connection: Connection,
    tables: StoreTables,
}

impl WatchedObjectStore {
    /// Opens (creating if absent) a store at `path` with the default table
    /// names.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::open_with_tables(path, StoreTables::default())
    }

    /// Opens a store using caller-supplied table names.
    pub fn open_with_tables<P: AsRef<Path>>(
        path: P,
        tables: StoreTables,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let connection = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let store = Self { connection, tables };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&self) -> Result<(), StoreError> {
        self.connection.execute(
            &format!(
                "create table if not exists {} (
                    osm_id text primary key,
                    version integer not null,
                    tags text not null,
                    nodes text
                )",
                self.tables.objects
            ),
            [],
        )?;
        self.connection.execute(
            &format!(
                "create table if not exists {} (
                    node_id bigint primary key,
                    lat integer not null,
                    lon integer not null
                )",
                self.tables.locations
            ),
            [],
        )?;
        Ok(())
    }

    /// Reads the stored snapshot of `(variant, osm_id)`, if any.
    pub fn read(&self, variant: Variant, osm_id: i64) -> Result<Option<StoredObject>, StoreError> {
        let key = format!("{}{osm_id}", variant.initial());
        let row = self
            .connection
            .query_row(
                &format!(
                    "select version, tags, nodes from {} where osm_id = ?1",
                    self.tables.objects
                ),
                params![key],
                |row| {
                    let version: i64 = row.get(0)?;
                    let tags_json: String = row.get(1)?;
                    let nodes_column: Option<String> = row.get(2)?;
                    Ok((version, tags_json, nodes_column))
                },
            )
            .optional()?;

        let Some((version, tags_json, nodes_column)) = row else {
            return Ok(None);
        };
        let tags: Tags =
            serde_json::from_str(&tags_json).map_err(|source| StoreError::InvalidTags {
                osm_id: key,
                source,
            })?;
        let nodes = nodes_column.map(|column| {
            column
                .split(',')
                .filter(|s| !s.is_empty())
                .filter_map(|s| s.parse::<i64>().ok())
                .collect()
        });
        Ok(Some(StoredObject {
            variant,
            osm_id,
            version,
            tags,
            nodes,
        }))
    }

    /// Upserts `obj` (spec.md §4.3 "save"). An empty tag map is a
    /// legitimate tombstone (spec.md I3).
    pub fn save(&self, obj: &StoredObject) -> Result<(), StoreError> {
        let tags_json = serde_json::to_string(&obj.tags).unwrap_or_else(|_| "{}".to_owned());
        self.connection.execute(
            &format!(
                "insert into {} (osm_id, version, tags, nodes) values (?1, ?2, ?3, ?4)
                 on conflict (osm_id) do update set
                    version = excluded.version,
                    tags = excluded.tags,
                    nodes = excluded.nodes",
                self.tables.objects
            ),
            params![obj.store_key(), obj.version, tags_json, obj.nodes_column()],
        )?;
        debug!("saved {} at version {}", obj.store_key(), obj.version);
        Ok(())
    }

    /// Looks up known coordinates for a batch of node ids (spec.md §4.3
    /// "get_locations").
    pub fn get_locations(
        &self,
        node_ids: &[i64],
    ) -> Result<std::collections::HashMap<i64, (f64, f64)>, StoreError> {
        let mut found = std::collections::HashMap::new();
        let mut statement = self.connection.prepare(&format!(
            "select lat, lon from {} where node_id = ?1",
            self.tables.locations
        ))?;
        for &node_id in node_ids {
            let row = statement
                .query_row(params![node_id], |row| {
                    let lat: i32 = row.get(0)?;
                    let lon: i32 = row.get(1)?;
                    Ok((lat, lon))
                })
                .optional()?;
            if let Some((lat, lon)) = row {
                found.insert(node_id, decode_location(lat, lon));
            }
        }
        Ok(found)
    }

    /// Upserts a batch of `(node_id, lat, lon)` locations; later entries
    /// in the same call supersede earlier ones (spec.md §4.3
    /// "update_locations").
    pub fn update_locations(&self, locations: &[(i64, f64, f64)]) -> Result<(), StoreError> {
        if locations.is_empty() {
            return Ok(());
        }
        let mut deduped = std::collections::HashMap::new();
        for &(node_id, lat, lon) in locations {
            deduped.insert(node_id, (lat, lon));
        }
        let mut statement = self.connection.prepare(&format!(
            "insert into {} (node_id, lat, lon) values (?1, ?2, ?3)
             on conflict (node_id) do update set lat = excluded.lat, lon = excluded.lon",
            self.tables.locations
        ))?;
        for (node_id, (lat, lon)) in deduped {
            let (lat_fixed, lon_fixed) = encode_location(lat, lon);
            statement.execute(params![node_id, lat_fixed, lon_fixed])?;
        }
        Ok(())
    }
}

/// Encodes decimal degrees as persisted fixed-point values (spec.md §3/§9:
/// "µdeg×10" = multiplier 10⁷, a signed 32-bit value), reusing
/// [`Decimicro`] at the store boundary rather than a separate scale.
fn encode_location(lat: f64, lon: f64) -> (i32, i32) {
    (Decimicro::from_degrees(lat).0, Decimicro::from_degrees(lon).0)
}

fn decode_location(lat: i32, lon: i32) -> (f64, f64) {
    (Decimicro(lat).to_degrees(), Decimicro(lon).to_degrees())
}

/// Re-exported so downstream crates can reference the fixed-point type
/// without depending on `osc-core` directly for this one conversion.
pub type FixedPoint = Decimicro;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    #[fixture]
    fn store() -> (TempDir, WatchedObjectStore) {
        let dir = TempDir::new().expect("create temp dir");
        let path = dir.path().join("store.sqlite3");
        let store = WatchedObjectStore::open(&path).expect("open store");
        (dir, store)
    }

    fn sample_tags() -> Tags {
        [("highway".to_owned(), "bus_stop".to_owned())]
            .into_iter()
            .collect()
    }

    #[rstest]
    fn read_missing_object_returns_none(store: (TempDir, WatchedObjectStore)) {
        let (_dir, store) = store;
        assert_eq!(store.read(Variant::Node, 1).expect("read"), None);
    }

    #[rstest]
    fn save_then_read_round_trips(store: (TempDir, WatchedObjectStore)) {
        let (_dir, store) = store;
        let obj = StoredObject {
            variant: Variant::Way,
            osm_id: 100,
            version: 3,
            tags: sample_tags(),
            nodes: Some(vec![1, 2, 3]),
        };
        store.save(&obj).expect("save");
        let read_back = store.read(Variant::Way, 100).expect("read").expect("present");
        assert_eq!(read_back, obj);
    }

    #[rstest]
    fn save_upserts_on_conflict(store: (TempDir, WatchedObjectStore)) {
        let (_dir, store) = store;
        let mut obj = StoredObject {
            variant: Variant::Node,
            osm_id: 7,
            version: 1,
            tags: sample_tags(),
            nodes: None,
        };
        store.save(&obj).expect("save v1");
        obj.version = 2;
        obj.tags.clear();
        store.save(&obj).expect("save tombstone");
        let read_back = store.read(Variant::Node, 7).expect("read").expect("present");
        assert_eq!(read_back.version, 2);
        assert!(read_back.tags.is_empty());
    }

    #[rstest]
    fn locations_round_trip_within_fixed_point_precision(store: (TempDir, WatchedObjectStore)) {
        let (_dir, store) = store;
        store
            .update_locations(&[(1, 60.123_456_7, 30.654_321_0)])
            .expect("update");
        let found = store.get_locations(&[1]).expect("lookup");
        let (lat, lon) = found.get(&1).copied().expect("node present");
        assert!((lat - 60.123_456_7).abs() <= 1e-6);
        assert!((lon - 30.654_321_0).abs() <= 1e-6);
    }

    #[rstest]
    fn later_update_in_same_call_supersedes_earlier(store: (TempDir, WatchedObjectStore)) {
        let (_dir, store) = store;
        store
            .update_locations(&[(1, 1.0, 1.0), (1, 2.0, 2.0)])
            .expect("update");
        let found = store.get_locations(&[1]).expect("lookup");
        let (lat, lon) = found.get(&1).copied().expect("node present");
        assert!((lat - 2.0).abs() < 1e-9);
        assert!((lon - 2.0).abs() < 1e-9);
    }

    #[rstest]
    fn get_locations_omits_unknown_nodes(store: (TempDir, WatchedObjectStore)) {
        let (_dir, store) = store;
        store.update_locations(&[(1, 1.0, 1.0)]).expect("update");
        let found = store.get_locations(&[1, 2]).expect("lookup");
        assert_eq!(found.len(), 1);
        assert!(!found.contains_key(&2));
    }
}
