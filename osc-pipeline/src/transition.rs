//! Transition Extractor (spec.md §4.6): reads adiff XML and emits
//! tag-kind transition rows, detecting way split/join relationships.

use std::collections::BTreeSet;

use geo::line_measures::LengthMeasurable;
use geo::{Coord, Geodesic, LineString};
use osc_core::{ContextStrength, RegionLocator, TagKindMatcher, Variant};
use thiserror::Error;

use crate::adiff_reader::{AdiffReadError, ParsedAction, ParsedBody, read_adiff};

/// One output row (spec.md §6.3).
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRow {
    /// `YYYY-MM-DD HH:MM:SS+00`, as it appeared on the wire.
    pub ts: String,
    /// Transition label: `create|modify|delete`.
    pub action: String,
    /// Action-header label: `create|modify|delete|split|join`.
    pub obj_action: String,
    /// The matched kind.
    pub kind: String,
    /// Changeset id.
    pub changeset: i64,
    /// Author's user id.
    pub uid: i64,
    /// Author's display name.
    pub username: String,
    /// `{variant}/{id}`.
    pub osm_id: String,
    /// Version of the current body.
    pub version: i64,
    /// For split/join rows, the other way's id.
    pub prev_id: Option<i64>,
    /// Containing region name, if any.
    pub region: Option<String>,
    /// Representative latitude.
    pub lat: f64,
    /// Representative longitude.
    pub lon: f64,
    /// Geodesic way length in metres, rounded; ways only.
    pub length: Option<i64>,
}

/// Errors extracting transitions from an adiff document.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// The adiff input was malformed.
    #[error(transparent)]
    Adiff(#[from] AdiffReadError),
}

/// Reads adiff XML and produces tag-kind transition rows.
pub struct TransitionExtractor<'a> {
    matcher: &'a TagKindMatcher,
    region: &'a RegionLocator,
}

impl<'a> TransitionExtractor<'a> {
    /// Builds an extractor over the given Matcher and Region Locator
    /// (both shared leaves per spec.md §2's dependency diagram).
    #[must_use]
    pub const fn new(matcher: &'a TagKindMatcher, region: &'a RegionLocator) -> Self {
        Self { matcher, region }
    }

    /// Extracts every transition row from `adiff_xml`, ordered by
    /// `(osm_id, kind, ts, version)` per spec.md §5.
    ///
    /// # Errors
    /// Returns [`ExtractError`] if the adiff XML is malformed.
    pub fn extract(&self, adiff_xml: &str) -> Result<Vec<TransitionRow>, ExtractError> {
        let actions = read_adiff(adiff_xml)?;
        let relabeled = relabel_splits_and_joins(actions);

        let mut rows = Vec::new();
        for resolved in relabeled {
            self.emit_rows(&resolved, &mut rows);
        }
        rows.sort_by(|a, b| {
            (a.osm_id.as_str(), a.kind.as_str(), a.ts.as_str(), a.version).cmp(&(
                b.osm_id.as_str(),
                b.kind.as_str(),
                b.ts.as_str(),
                b.version,
            ))
        });
        Ok(rows)
    }

    fn emit_rows(&self, resolved: &ResolvedAction, rows: &mut Vec<TransitionRow>) {
        let Some((lat, lon)) = representative_coordinate(&resolved.identity) else {
            return;
        };
        let new_kinds =
            self.matcher
                .kinds_of_with_context(resolved.new.variant, &resolved.new.tags, old_tags(resolved.old.as_ref()), ContextStrength::Weak);
        let old_kinds = resolved.old.as_ref().map_or_else(BTreeSet::new, |old| {
            self.matcher
                .kinds_of_with_context(old.variant, &old.tags, &resolved.new.tags, ContextStrength::Weak)
        });
        let modified = resolved.old.as_ref().map_or_else(BTreeSet::new, |old| {
            self.matcher
                .modified_kinds(resolved.new.variant, &old.tags, &resolved.new.tags, ContextStrength::Weak)
        });

        let created = new_kinds.difference(&old_kinds).cloned();
        let deleted = old_kinds.difference(&new_kinds).cloned();
        let length = way_length(&resolved.identity);
        let region = self.region.find(lon, lat).map(ToOwned::to_owned);

        for kind in created {
            rows.push(self.build_row(resolved, &kind, "create", region.clone(), lat, lon, length));
        }
        for kind in deleted {
            rows.push(self.build_row(resolved, &kind, "delete", region.clone(), lat, lon, length));
        }
        for kind in modified {
            rows.push(self.build_row(resolved, &kind, "modify", region.clone(), lat, lon, length));
        }
    }

    fn build_row(
        &self,
        resolved: &ResolvedAction,
        kind: &str,
        action: &str,
        region: Option<String>,
        lat: f64,
        lon: f64,
        length: Option<i64>,
    ) -> TransitionRow {
        TransitionRow {
            ts: resolved.identity.meta.timestamp.clone(),
            action: action.to_owned(),
            obj_action: resolved.obj_action.clone(),
            kind: kind.to_owned(),
            changeset: resolved.identity.meta.changeset,
            uid: resolved.identity.meta.uid,
            username: resolved.identity.meta.username.clone(),
            osm_id: format!("{}/{}", resolved.identity.variant.xml_tag(), resolved.identity.osm_id),
            version: resolved.identity.version,
            prev_id: resolved.prev_id,
            region,
            lat,
            lon,
            length,
        }
    }
}

fn old_tags(old: Option<&ParsedBody>) -> &osc_core::Tags {
    static EMPTY: std::sync::OnceLock<osc_core::Tags> = std::sync::OnceLock::new();
    old.map_or_else(|| EMPTY.get_or_init(osc_core::Tags::new), |body| &body.tags)
}

fn representative_coordinate(body: &ParsedBody) -> Option<(f64, f64)> {
    match body.variant {
        Variant::Node => body.own_coords,
        Variant::Way | Variant::Relation => body.bounds.map(|b| b.midpoint()),
    }
}

fn way_length(body: &ParsedBody) -> Option<i64> {
    if body.variant != Variant::Way || body.nds.len() < 2 {
        return None;
    }
    let mut coords = Vec::with_capacity(body.nds.len());
    for nd in &body.nds {
        let (lat, lon) = nd.coords?;
        coords.push(Coord { x: lon, y: lat });
    }
    let line = LineString::new(coords);
    #[allow(
        clippy::cast_possible_truncation,
        reason = "way lengths fit comfortably in i64 after rounding"
    )]
    Some(line.length(&Geodesic).round() as i64)
}

/// One resolved action, ready for tag-kind comparison and row emission.
///
/// `old`/`new` are the tag-comparison sources (spec.md §4.6: "Given `obj`
/// ... and `old`"). `identity` is the row's own identity (ts, osm_id,
/// version, representative coordinate, length) — for a join this is the
/// *deleted* way, even though `new` has been reassigned to the surviving
/// way for tag comparison (matching `adiff_to_csv.py::process_single_action`,
/// which freezes `data` from the original `obj` before reassigning it to
/// the ancestor "just for comparing tags").
struct ResolvedAction {
    obj_action: String,
    old: Option<ParsedBody>,
    new: ParsedBody,
    identity: ParsedBody,
    prev_id: Option<i64>,
}

/// Cross-references created/deleted ways against modify-actions to detect
/// splits and joins (spec.md §4.6).
fn relabel_splits_and_joins(actions: Vec<ParsedAction>) -> Vec<ResolvedAction> {
    let modifies: Vec<&ParsedAction> = actions.iter().filter(|a| a.header_action == "modify").collect();

    let mut resolved = Vec::with_capacity(actions.len());
    for action in &actions {
        match action.header_action.as_str() {
            "create" if action.new.variant == Variant::Way => {
                if let Some(candidate) = find_split_candidate(&action.new, &modifies) {
                    resolved.push(ResolvedAction {
                        obj_action: "split".to_owned(),
                        old: Some(candidate.clone()),
                        new: action.new.clone(),
                        identity: action.new.clone(),
                        prev_id: Some(candidate.osm_id),
                    });
                    continue;
                }
                resolved.push(ResolvedAction {
                    obj_action: "create".to_owned(),
                    old: None,
                    new: action.new.clone(),
                    identity: action.new.clone(),
                    prev_id: None,
                });
            }
            "delete" if action.new.variant == Variant::Way => {
                let deleted_old = action.old.clone().unwrap_or_else(|| action.new.clone());
                if let Some(survivor) = find_join_survivor(&deleted_old, &modifies) {
                    resolved.push(ResolvedAction {
                        obj_action: "join".to_owned(),
                        old: Some(deleted_old),
                        new: survivor.clone(),
                        identity: action.new.clone(),
                        prev_id: Some(survivor.osm_id),
                    });
                    continue;
                }
                resolved.push(ResolvedAction {
                    obj_action: "delete".to_owned(),
                    old: action.old.clone(),
                    new: action.new.clone(),
                    identity: action.new.clone(),
                    prev_id: None,
                });
            }
            _ => resolved.push(ResolvedAction {
                obj_action: action.header_action.clone(),
                old: action.old.clone(),
                new: action.new.clone(),
                identity: action.new.clone(),
                prev_id: None,
            }),
        }
    }
    resolved
}

fn overlap_threshold(len: usize) -> usize {
    len / 2 + 1
}

fn find_split_candidate<'a>(created: &ParsedBody, modifies: &[&'a ParsedAction]) -> Option<&'a ParsedBody> {
    let first = created.nds.first()?.node_id;
    let last = created.nds.last()?.node_id;
    let required = overlap_threshold(created.nds.len());

    modifies
        .iter()
        .filter_map(|action| action.old.as_ref())
        .filter(|old| old.variant == Variant::Way && old.osm_id != created.osm_id)
        .filter(|old| {
            let old_ids: BTreeSet<i64> = old.nds.iter().map(|nd| nd.node_id).collect();
            old_ids.contains(&first)
                && old_ids.contains(&last)
                && created.nds.iter().filter(|nd| old_ids.contains(&nd.node_id)).count() >= required
        })
        .max_by_key(|old| old.version)
}

fn find_join_survivor<'a>(deleted: &ParsedBody, modifies: &[&'a ParsedAction]) -> Option<&'a ParsedBody> {
    let first = deleted.nds.first()?.node_id;
    let last = deleted.nds.last()?.node_id;
    let required = overlap_threshold(deleted.nds.len());

    modifies
        .iter()
        .filter(|action| action.new.variant == Variant::Way && action.new.osm_id != deleted.osm_id)
        .filter(|action| {
            let new_ids: BTreeSet<i64> = action.new.nds.iter().map(|nd| nd.node_id).collect();
            new_ids.contains(&first)
                && new_ids.contains(&last)
                && deleted.nds.iter().filter(|nd| new_ids.contains(&nd.node_id)).count() >= required
        })
        .map(|action| &action.new)
        .max_by_key(|new| new.version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn matcher() -> TagKindMatcher {
        TagKindMatcher::load(Cursor::new("way maxspeed maxspeed\nnode amenity amenity\n")).expect("rules")
    }

    #[test]
    fn create_emits_kind_row_with_node_coordinates() {
        let m = matcher();
        let region = RegionLocator::empty();
        let extractor = TransitionExtractor::new(&m, &region);
        let xml = r#"<osm><action type="create"><node id="1" version="1" changeset="1" uid="1" user="a" timestamp="2020-01-01 00:00:00+00" lat="1.0" lon="2.0"><tag k="amenity" v="cafe"/></node></action></osm>"#;
        let rows = extractor.extract(xml).expect("extract");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, "amenity");
        assert_eq!(rows[0].action, "create");
        assert_eq!(rows[0].obj_action, "create");
        assert_eq!(rows[0].lat, 1.0);
    }

    #[test]
    fn way_without_bounds_is_dropped() {
        let m = matcher();
        let region = RegionLocator::empty();
        let extractor = TransitionExtractor::new(&m, &region);
        let xml = r#"<osm><action type="create"><way id="1" version="1" changeset="1" uid="1" user="a" timestamp="t"><nd ref="1"/></way></action></osm>"#;
        let rows = extractor.extract(xml).expect("extract");
        assert!(rows.is_empty());
    }

    #[test]
    fn modify_detects_value_change_as_modify_row() {
        let m = matcher();
        let region = RegionLocator::empty();
        let extractor = TransitionExtractor::new(&m, &region);
        let xml = r#"<osm><action type="modify">
            <old><way id="1" version="1" changeset="1" uid="1" user="a" timestamp="t"><tag k="maxspeed" v="50"/></way></old>
            <new><way id="1" version="2" changeset="1" uid="1" user="a" timestamp="t2"><bounds minlat="0" minlon="0" maxlat="1" maxlon="1"/><tag k="maxspeed" v="60"/></way></new>
        </action></osm>"#;
        let rows = extractor.extract(xml).expect("extract");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].action, "modify");
        assert_eq!(rows[0].kind, "maxspeed");
    }

    #[test]
    fn way_length_uses_geodesic_distance() {
        let body = ParsedBody {
            variant: Variant::Way,
            osm_id: 1,
            version: 1,
            tags: osc_core::Tags::new(),
            meta: osc_core::ChangeMeta::default(),
            own_coords: None,
            nds: vec![
                crate::adiff_reader::NdRef {
                    node_id: 1,
                    coords: Some((0.0, 0.0)),
                },
                crate::adiff_reader::NdRef {
                    node_id: 2,
                    coords: Some((0.0, 1.0)),
                },
            ],
            members: Vec::new(),
            bounds: None,
        };
        let length = way_length(&body).expect("resolvable length");
        assert!(length > 100_000 && length < 112_000);
    }

    #[test]
    fn split_detection_relabels_create_and_records_prev_id() {
        let m = matcher();
        let region = RegionLocator::empty();
        let extractor = TransitionExtractor::new(&m, &region);
        let xml = r#"<osm>
            <action type="create"><way id="2" version="1" changeset="1" uid="1" user="a" timestamp="t"><bounds minlat="0" minlon="0" maxlat="1" maxlon="1"/><nd ref="1" lat="0" lon="0"/><nd ref="2" lat="1" lon="1"/></way></action>
            <action type="modify">
                <old><way id="1" version="3" changeset="1" uid="1" user="a" timestamp="t"><nd ref="1" lat="0" lon="0"/><nd ref="2" lat="1" lon="1"/><nd ref="3" lat="2" lon="2"/></way></old>
                <new><way id="1" version="4" changeset="1" uid="1" user="a" timestamp="t"><bounds minlat="1" minlon="1" maxlat="2" maxlon="2"/><nd ref="2" lat="1" lon="1"/><nd ref="3" lat="2" lon="2"/></way></new>
            </action>
        </osm>"#;
        let actions = read_adiff(xml).expect("parse");
        let resolved = relabel_splits_and_joins(actions);
        let split = resolved.iter().find(|r| r.obj_action == "split").expect("split detected");
        assert_eq!(split.prev_id, Some(1));
    }

    #[test]
    fn join_detection_keeps_row_identity_on_the_deleted_way() {
        // spec.md §8 scenario 3: modify of way 100 extends it with nodes
        // 6,7; delete of way 101 (nodes 5,6,7) joins into it. The row
        // identity stays on the deleted way (101); only `prev_id` points
        // at the survivor (100).
        let xml = r#"<osm>
            <action type="modify">
                <old><way id="100" version="3" changeset="1" uid="1" user="a" timestamp="t"><nd ref="1"/><nd ref="2"/><nd ref="3"/><nd ref="4"/></way></old>
                <new><way id="100" version="4" changeset="1" uid="1" user="a" timestamp="t"><bounds minlat="0" minlon="0" maxlat="1" maxlon="1"/><nd ref="1"/><nd ref="2"/><nd ref="3"/><nd ref="4"/><nd ref="5"/><nd ref="6"/><nd ref="7"/></way></new>
            </action>
            <action type="delete">
                <old><way id="101" version="1" changeset="1" uid="1" user="a" timestamp="t"><nd ref="5"/><nd ref="6"/><nd ref="7"/><tag k="maxspeed" v="50"/></way></old>
                <new><way id="101" version="1" changeset="2" uid="1" user="b" timestamp="t2"><nd ref="5"/><nd ref="6"/><nd ref="7"/></way></new>
            </action>
        </osm>"#;
        let actions = read_adiff(xml).expect("parse");
        let resolved = relabel_splits_and_joins(actions);
        let join = resolved.iter().find(|r| r.obj_action == "join").expect("join detected");
        assert_eq!(join.prev_id, Some(100));
        assert_eq!(join.identity.osm_id, 101);
        assert_eq!(join.identity.meta.username, "b");
        assert_eq!(join.new.osm_id, 100);
        assert_eq!(join.old.as_ref().map(|o| o.osm_id), Some(101));
    }
}
