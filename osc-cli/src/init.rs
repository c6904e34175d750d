//! Initial `.osm.pbf` snapshot loading (SPEC_FULL.md §4.10, grounded on
//! the original `InitHandler` in `lib/osc_to_adiff.py` and on
//! `wildside-data`'s two-pass PBF ingestion for the `osmpbf` access
//! pattern). Seeds the Watched-Object Store before any osmChange is
//! processed. Snapshot versions are not carried through (the PBF
//! node/way/dense-node info blocks expose incompatible accessors across
//! variants); every seeded row starts at version `0`.

use std::collections::HashMap;
use std::path::Path;

use osc_core::{RegionLocator, TagKindMatcher, Tags, Variant};
use osc_store::{StoreError, StoredObject, WatchedObjectStore};
use osmpbf::{Element, ElementReader};

use crate::CliError;

/// Counts of objects seeded from a PBF snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct SeedSummary {
    /// Nodes saved.
    pub nodes: u64,
    /// Ways saved.
    pub ways: u64,
}

struct WayCandidate {
    osm_id: i64,
    tags: Tags,
    node_refs: Vec<i64>,
}

#[derive(Default)]
struct SeedState {
    locations: HashMap<i64, (f64, f64)>,
    way_candidates: Vec<WayCandidate>,
    summary: SeedSummary,
    error: Option<StoreError>,
}

/// Seeds `store` from `path`, matching `InitHandler`'s semantics: nodes
/// are filtered by both the tag matcher and the region locator; ways are
/// filtered by the tag matcher only (the original never region-checks
/// ways during init). Node locations are always recorded, whether or not
/// the node itself is admitted, so later way resolution can find them.
///
/// # Errors
/// Returns [`CliError::ReadPbf`] if the PBF file cannot be opened or
/// decoded, or [`CliError::Store`] if persisting a record fails.
pub fn seed_from_pbf(
    path: &Path,
    matcher: &TagKindMatcher,
    region: &RegionLocator,
    store: &WatchedObjectStore,
) -> Result<SeedSummary, CliError> {
    let mut state = SeedState::default();

    let reader = ElementReader::from_path(path).map_err(|source| CliError::ReadPbf {
        path: path.to_path_buf(),
        source,
    })?;
    reader
        .for_each(|element| process_element(element, matcher, region, store, &mut state))
        .map_err(|source| CliError::ReadPbf {
            path: path.to_path_buf(),
            source,
        })?;

    if let Some(error) = state.error {
        return Err(CliError::Store(error));
    }

    for candidate in state.way_candidates {
        if candidate.node_refs.len() < 2 {
            continue;
        }
        store.save(&StoredObject {
            variant: Variant::Way,
            osm_id: candidate.osm_id,
            version: 0,
            tags: matcher.filter_relevant(&candidate.tags),
            nodes: Some(candidate.node_refs.clone()),
        })?;
        let batch: Vec<(i64, f64, f64)> = candidate
            .node_refs
            .iter()
            .filter_map(|id| state.locations.get(id).map(|&(lat, lon)| (*id, lat, lon)))
            .collect();
        store.update_locations(&batch)?;
        state.summary.ways += 1;
    }

    Ok(state.summary)
}

fn process_element(
    element: Element<'_>,
    matcher: &TagKindMatcher,
    region: &RegionLocator,
    store: &WatchedObjectStore,
    state: &mut SeedState,
) {
    if state.error.is_some() {
        return;
    }
    match element {
        Element::Node(node) => seed_node(node.id(), node.lon(), node.lat(), node.tags(), matcher, region, store, state),
        Element::DenseNode(node) => seed_node(node.id(), node.lon(), node.lat(), node.tags(), matcher, region, store, state),
        Element::Way(way) => {
            let tags: Tags = way.tags().map(|(k, v)| (k.to_owned(), v.to_owned())).collect();
            if matcher.is_empty() || !matcher.kinds_of(Variant::Way, &tags).is_empty() {
                state.way_candidates.push(WayCandidate {
                    osm_id: way.id(),
                    tags,
                    node_refs: way.refs().collect(),
                });
            }
        }
        Element::Relation(_) => {}
    }
}

fn seed_node<'a>(
    osm_id: i64,
    lon: f64,
    lat: f64,
    tags: impl IntoIterator<Item = (&'a str, &'a str)>,
    matcher: &TagKindMatcher,
    region: &RegionLocator,
    store: &WatchedObjectStore,
    state: &mut SeedState,
) {
    state.locations.insert(osm_id, (lat, lon));
    let tags: Tags = tags.into_iter().map(|(k, v)| (k.to_owned(), v.to_owned())).collect();

    if !matcher.is_empty() && matcher.kinds_of(Variant::Node, &tags).is_empty() {
        return;
    }
    if !region.is_empty() && region.find(lon, lat).is_none() {
        return;
    }

    let obj = StoredObject {
        variant: Variant::Node,
        osm_id,
        version: 0,
        tags: matcher.filter_relevant(&tags),
        nodes: None,
    };
    if let Err(error) = store.save(&obj) {
        state.error = Some(error);
        return;
    }
    if let Err(error) = store.update_locations(&[(osm_id, lat, lon)]) {
        state.error = Some(error);
        return;
    }
    state.summary.nodes += 1;
}
