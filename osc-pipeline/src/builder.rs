//! Augmented-Diff Builder (spec.md §4.5).
//!
//! Orchestrates the Tag-Kind Matcher, Region Locator, Watched-Object
//! Store, and OSM-API client into a single `process_osc` pass, mirroring
//! `wildside-data`'s `ingest_osm_pbf_report`: one accumulating scan
//! followed by a resolve-pending-references pass, here folded into the
//! builder's own pass A / pass B / main-pass structure.

use std::collections::HashMap;
use std::io::Write;

use log::debug;
use osc_api::OsmApiClient;
use osc_core::{Geometry, OsmObject, RegionLocator, TagKindMatcher, Variant};
use osc_store::{StoredObject, WatchedObjectStore};
use thiserror::Error;

use crate::adiff_xml::write_object;
use crate::change::{ActionKind, ChangeError, ChangeRecord, decompress, read_osm_change};

/// Errors from building an augmented diff (spec.md §7).
#[derive(Debug, Error)]
pub enum BuilderError {
    /// The osmChange input was malformed.
    #[error(transparent)]
    Change(#[from] ChangeError),
    /// A store operation failed.
    #[error(transparent)]
    Store(#[from] osc_store::StoreError),
    /// An OSM-API call that was required to complete the diff failed
    /// (spec.md §4.4 "fatal for the current action").
    #[error(transparent)]
    Api(#[from] osc_api::ApiError),
    /// Writing the adiff output failed.
    #[error("failed to write adiff output: {0}")]
    Io(#[from] std::io::Error),
}

/// Builds augmented diffs from osmChange input.
pub struct AdiffBuilder<'a, A: OsmApiClient> {
    matcher: &'a TagKindMatcher,
    region: &'a RegionLocator,
    store: &'a WatchedObjectStore,
    api: &'a A,
}

impl<'a, A: OsmApiClient> AdiffBuilder<'a, A> {
    /// Builds a new `AdiffBuilder` over the given collaborators (spec.md
    /// §2 dependency order: this orchestrates the four leaf components).
    pub const fn new(
        matcher: &'a TagKindMatcher,
        region: &'a RegionLocator,
        store: &'a WatchedObjectStore,
        api: &'a A,
    ) -> Self {
        Self {
            matcher,
            region,
            store,
            api,
        }
    }

    /// Runs the full `process_osc` pipeline: reads osmChange from `input`
    /// (transparently gzip-decompressed), and writes pretty-printed adiff
    /// XML to `sink`.
    pub fn process_osc(&self, input: impl std::io::BufRead, mut sink: impl Write) -> Result<(), BuilderError> {
        let decompressed = decompress(input)?;
        let records = read_osm_change(decompressed)?;

        let mut locations = collect_location_cache(&records);
        if !self.region.is_empty() {
            self.prefetch_bounds_anchors(&records, &mut locations)?;
        }

        let mut actions = Vec::new();
        for record in &records {
            if let Some(body) = self.process_record(record, &mut locations)? {
                actions.push(body);
            }
        }

        write_adiff(&mut sink, &actions)?;
        Ok(())
    }

    fn prefetch_bounds_anchors(
        &self,
        records: &[ChangeRecord],
        locations: &mut HashMap<i64, (f64, f64)>,
    ) -> Result<(), BuilderError> {
        let mut missing = Vec::new();
        for record in records {
            let Geometry::Way { nodes } = &record.object.geometry else {
                continue;
            };
            if self.matcher.kinds_of(record.object.variant(), &record.object.tags).is_empty() {
                continue;
            }
            if let Some(&first) = nodes.first()
                && !locations.contains_key(&first)
            {
                missing.push(first);
            }
        }
        if missing.is_empty() {
            return Ok(());
        }
        missing.sort_unstable();
        missing.dedup();
        let fetched = self.api.nodes(&missing)?;
        locations.extend(fetched);
        Ok(())
    }

    fn process_record(
        &self,
        record: &ChangeRecord,
        locations: &mut HashMap<i64, (f64, f64)>,
    ) -> Result<Option<AdiffBody>, BuilderError> {
        let object = &record.object;
        let variant = object.variant();

        if object.is_degenerate_way() || object.is_empty_relation() {
            debug!("dropped degenerate {variant} {}", object.osm_id);
            return Ok(None);
        }

        let admitted = !self.matcher.kinds_of(variant, &object.tags).is_empty();

        if !self.region.is_empty()
            && !self.passes_region_filter(object, locations, admitted)?
        {
            debug!("dropped {variant} {} outside configured regions", object.osm_id);
            return Ok(None);
        }

        match record.action {
            ActionKind::Create => self.process_create(object, locations, admitted),
            ActionKind::Modify | ActionKind::Delete => {
                self.process_modify_or_delete(record, locations, admitted)
            }
        }
    }

    fn passes_region_filter(
        &self,
        object: &OsmObject,
        locations: &HashMap<i64, (f64, f64)>,
        admitted: bool,
    ) -> Result<bool, BuilderError> {
        let Some((lat, lon)) = self.representative_point(object, locations, admitted)? else {
            return Ok(false);
        };
        Ok(self.region.find(lon, lat).is_some())
    }

    fn representative_point(
        &self,
        object: &OsmObject,
        locations: &HashMap<i64, (f64, f64)>,
        admitted: bool,
    ) -> Result<Option<(f64, f64)>, BuilderError> {
        if let Geometry::Node { lat, lon } = object.geometry {
            return Ok(Some((lat, lon)));
        }
        for node_id in object.referenced_node_ids() {
            if let Some(&coords) = locations.get(&node_id) {
                return Ok(Some(coords));
            }
            if let Some(coords) = self.store.get_locations(&[node_id])?.get(&node_id).copied() {
                return Ok(Some(coords));
            }
        }
        if admitted {
            for node_id in object.referenced_node_ids() {
                let fetched = self.api.nodes(&[node_id])?;
                if let Some(&coords) = fetched.get(&node_id) {
                    return Ok(Some(coords));
                }
            }
        }
        Ok(None)
    }

    fn process_create(
        &self,
        object: &OsmObject,
        locations: &mut HashMap<i64, (f64, f64)>,
        admitted: bool,
    ) -> Result<Option<AdiffBody>, BuilderError> {
        if !admitted {
            return Ok(None);
        }
        self.remember_own_coordinates(object, locations);
        self.persist(object, locations)?;
        Ok(Some(AdiffBody {
            action: "create",
            new: object.clone(),
            old: None,
            coords: locations.clone(),
        }))
    }

    fn process_modify_or_delete(
        &self,
        record: &ChangeRecord,
        locations: &mut HashMap<i64, (f64, f64)>,
        admitted: bool,
    ) -> Result<Option<AdiffBody>, BuilderError> {
        let object = &record.object;
        let variant = object.variant();
        let prior = self.store.read(variant, object.osm_id)?;

        if prior.is_none() && !admitted {
            return Ok(None);
        }
        let is_delete = matches!(record.action, ActionKind::Delete);
        if is_delete && prior.is_none() {
            return Ok(None);
        }

        let old = self.reconstruct_old(variant, object, prior.as_ref())?;
        self.remember_own_coordinates(object, locations);

        let mut coords = locations.clone();
        if let Some(old_obj) = &old {
            for node_id in old_obj.referenced_node_ids() {
                if coords.contains_key(&node_id) {
                    continue;
                }
                if let Some(&found) = self.store.get_locations(&[node_id])?.get(&node_id) {
                    coords.insert(node_id, found);
                }
            }
        }

        if is_delete {
            self.store.save(&StoredObject {
                variant,
                osm_id: object.osm_id,
                version: object.version,
                tags: osc_core::Tags::new(),
                nodes: way_nodes(object),
            })?;
        } else {
            self.persist(object, locations)?;
        }

        Ok(Some(AdiffBody {
            action: record.action.as_str(),
            new: object.clone(),
            old,
            coords,
        }))
    }

    fn reconstruct_old(
        &self,
        variant: Variant,
        object: &OsmObject,
        prior: Option<&StoredObject>,
    ) -> Result<Option<OsmObject>, BuilderError> {
        match prior {
            Some(stored) => {
                let mut reconstructed = stored_to_object(stored);
                if let Geometry::Node { .. } = reconstructed.geometry
                    && let Some(&(lat, lon)) = self.store.get_locations(&[stored.osm_id])?.get(&stored.osm_id)
                {
                    reconstructed.geometry = Geometry::Node { lat, lon };
                }
                Ok(Some(reconstructed))
            }
            None => {
                let previous_version = object.version - 1;
                Ok(self.api.object_version(variant, object.osm_id, previous_version)?)
            }
        }
    }

    fn remember_own_coordinates(&self, object: &OsmObject, locations: &mut HashMap<i64, (f64, f64)>) {
        if let Geometry::Node { lat, lon } = object.geometry {
            locations.insert(object.osm_id, (lat, lon));
        }
    }

    fn persist(&self, object: &OsmObject, locations: &HashMap<i64, (f64, f64)>) -> Result<(), BuilderError> {
        let filtered_tags = self.matcher.filter_relevant(&object.tags);
        self.store.save(&StoredObject {
            variant: object.variant(),
            osm_id: object.osm_id,
            version: object.version,
            tags: filtered_tags,
            nodes: way_nodes(object),
        })?;
        let batch: Vec<(i64, f64, f64)> = object
            .referenced_node_ids()
            .into_iter()
            .filter_map(|id| locations.get(&id).map(|&(lat, lon)| (id, lat, lon)))
            .collect();
        if !batch.is_empty() {
            self.store.update_locations(&batch)?;
        }
        Ok(())
    }
}

fn way_nodes(object: &OsmObject) -> Option<Vec<i64>> {
    match &object.geometry {
        Geometry::Way { nodes } => Some(nodes.clone()),
        _ => None,
    }
}

fn stored_to_object(stored: &StoredObject) -> OsmObject {
    let geometry = match stored.variant {
        Variant::Node => Geometry::Node { lat: 0.0, lon: 0.0 },
        Variant::Way => Geometry::Way {
            nodes: stored.nodes.clone().unwrap_or_default(),
        },
        Variant::Relation => Geometry::Relation { members: Vec::new() },
    };
    OsmObject {
        osm_id: stored.osm_id,
        version: stored.version,
        tags: stored.tags.clone(),
        meta: osc_core::ChangeMeta::default(),
        geometry,
    }
}

fn collect_location_cache(records: &[ChangeRecord]) -> HashMap<i64, (f64, f64)> {
    let mut cache = HashMap::new();
    for record in records {
        if let Geometry::Node { lat, lon } = record.object.geometry {
            cache.insert(record.object.osm_id, (lat, lon));
        }
    }
    cache
}

/// One fully resolved adiff action, pending serialisation.
struct AdiffBody {
    action: &'static str,
    new: OsmObject,
    old: Option<OsmObject>,
    coords: HashMap<i64, (f64, f64)>,
}

fn write_adiff(sink: &mut impl Write, actions: &[AdiffBody]) -> Result<(), std::io::Error> {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str("<osm version=\"0.6\" generator=\"osc-engine\">\n");
    for body in actions {
        out.push_str(&format!("  <action type=\"{}\">\n", body.action));
        if body.action == "create" {
            write_object(&mut out, &body.new, &body.coords, "    ");
        } else {
            out.push_str("    <old>\n");
            if let Some(old) = &body.old {
                write_object(&mut out, old, &body.coords, "      ");
            }
            out.push_str("    </old>\n");
            out.push_str("    <new>\n");
            write_object(&mut out, &body.new, &body.coords, "      ");
            out.push_str("    </new>\n");
        }
        out.push_str("  </action>\n");
    }
    out.push_str("</osm>\n");
    sink.write_all(out.as_bytes())
}
