//! Serialises resolved OSM objects into augmented-diff XML bodies
//! (spec.md §6.2). Hand-rolled rather than event-driven: the output shape
//! (bounds + coordinate-annotated `nd`) is fixed and small enough that an
//! explicit writer is clearer than building `quick_xml` event streams.

use std::collections::HashMap;
use std::fmt::Write as _;

use osc_core::{ChangeMeta, Geometry, OsmObject, Variant};

/// Escapes XML attribute-value special characters.
fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Formats a coordinate with enough precision to round-trip a fixed-point
/// decimicro value (spec.md §6.2: "preserve ≥ 6 decimal places").
fn format_coord(value: f64) -> String {
    format!("{value:.7}")
}

/// Axis-aligned bounds of a set of coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    /// Minimum latitude.
    pub min_lat: f64,
    /// Minimum longitude.
    pub min_lon: f64,
    /// Maximum latitude.
    pub max_lat: f64,
    /// Maximum longitude.
    pub max_lon: f64,
}

/// Computes the bounds of `coords`, or `None` if empty (spec.md §4.5:
/// "emitted without a bounds element only if no coordinates were
/// resolvable").
#[must_use]
pub fn compute_bounds<'a>(coords: impl Iterator<Item = &'a (f64, f64)>) -> Option<Bounds> {
    coords.fold(None, |acc, &(lat, lon)| match acc {
        None => Some(Bounds {
            min_lat: lat,
            min_lon: lon,
            max_lat: lat,
            max_lon: lon,
        }),
        Some(mut bounds) => {
            bounds.min_lat = bounds.min_lat.min(lat);
            bounds.min_lon = bounds.min_lon.min(lon);
            bounds.max_lat = bounds.max_lat.max(lat);
            bounds.max_lon = bounds.max_lon.max(lon);
            Some(bounds)
        }
    })
}

fn write_meta_attrs(out: &mut String, osm_id: i64, version: i64, meta: &ChangeMeta) {
    let _ = write!(
        out,
        " id=\"{osm_id}\" version=\"{version}\" timestamp=\"{ts}\" changeset=\"{cs}\" uid=\"{uid}\" user=\"{user}\"",
        ts = escape_attr(&meta.timestamp),
        cs = meta.changeset,
        uid = meta.uid,
        user = escape_attr(&meta.username),
    );
}

fn write_tags(out: &mut String, object: &OsmObject, indent: &str) {
    for (key, value) in &object.tags {
        let _ = writeln!(
            out,
            "{indent}<tag k=\"{}\" v=\"{}\"/>",
            escape_attr(key),
            escape_attr(value)
        );
    }
}

/// Writes one full object body (`<node>`, `<way>`, or `<relation>`), with
/// `nd`/`member` coordinates resolved from `coords` where available and a
/// `bounds` element when at least one coordinate resolved.
pub fn write_object(out: &mut String, object: &OsmObject, coords: &HashMap<i64, (f64, f64)>, base_indent: &str) {
    let inner_indent = format!("{base_indent}  ");
    match &object.geometry {
        Geometry::Node { lat, lon } => {
            let _ = write!(out, "{base_indent}<node");
            write_meta_attrs(out, object.osm_id, object.version, &object.meta);
            let _ = write!(out, " lat=\"{}\" lon=\"{}\"", format_coord(*lat), format_coord(*lon));
            if object.tags.is_empty() {
                let _ = writeln!(out, "/>");
            } else {
                let _ = writeln!(out, ">");
                write_tags(out, object, &inner_indent);
                let _ = writeln!(out, "{base_indent}</node>");
            }
        }
        Geometry::Way { nodes } => {
            let resolved: Vec<(f64, f64)> = nodes.iter().filter_map(|id| coords.get(id).copied()).collect();
            let _ = write!(out, "{base_indent}<way");
            write_meta_attrs(out, object.osm_id, object.version, &object.meta);
            let _ = writeln!(out, ">");
            if let Some(bounds) = compute_bounds(resolved.iter()) {
                write_bounds(out, bounds, &inner_indent);
            }
            for id in nodes {
                match coords.get(id) {
                    Some(&(lat, lon)) => {
                        let _ = writeln!(
                            out,
                            "{inner_indent}<nd ref=\"{id}\" lat=\"{}\" lon=\"{}\"/>",
                            format_coord(lat),
                            format_coord(lon)
                        );
                    }
                    None => {
                        let _ = writeln!(out, "{inner_indent}<nd ref=\"{id}\"/>");
                    }
                }
            }
            write_tags(out, object, &inner_indent);
            let _ = writeln!(out, "{base_indent}</way>");
        }
        Geometry::Relation { members } => {
            let node_coords: Vec<(f64, f64)> = members
                .iter()
                .filter(|m| m.member_type == Variant::Node)
                .filter_map(|m| coords.get(&m.osm_ref).copied())
                .collect();
            let _ = write!(out, "{base_indent}<relation");
            write_meta_attrs(out, object.osm_id, object.version, &object.meta);
            let _ = writeln!(out, ">");
            if let Some(bounds) = compute_bounds(node_coords.iter()) {
                write_bounds(out, bounds, &inner_indent);
            }
            for member in members {
                let _ = writeln!(
                    out,
                    "{inner_indent}<member type=\"{}\" ref=\"{}\" role=\"{}\"/>",
                    member.member_type.xml_tag(),
                    member.osm_ref,
                    escape_attr(&member.role)
                );
            }
            write_tags(out, object, &inner_indent);
            let _ = writeln!(out, "{base_indent}</relation>");
        }
    }
}

fn write_bounds(out: &mut String, bounds: Bounds, indent: &str) {
    let _ = writeln!(
        out,
        "{indent}<bounds minlat=\"{}\" minlon=\"{}\" maxlat=\"{}\" maxlon=\"{}\"/>",
        format_coord(bounds.min_lat),
        format_coord(bounds.min_lon),
        format_coord(bounds.max_lat),
        format_coord(bounds.max_lon)
    );
}
