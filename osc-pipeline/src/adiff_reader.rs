//! Parses augmented-diff XML (the Adiff Builder's own output format)
//! back into structured actions for the Transition Extractor.

use osc_core::{ChangeMeta, Member, Tags, Variant};
use quick_xml::Reader;
use quick_xml::events::Event;
use thiserror::Error;

/// A `nd` reference with coordinates, when resolvable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NdRef {
    /// Referenced node id.
    pub node_id: i64,
    /// Coordinates, if the producing Adiff Builder resolved them.
    pub coords: Option<(f64, f64)>,
}

/// Bounds as read from a `<bounds>` element.
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

impl Bounds {
    /// Midpoint of the bounds, used as a way/relation's representative
    /// coordinate (spec.md §4.6).
    #[must_use]
    pub fn midpoint(&self) -> (f64, f64) {
        ((self.min_lat + self.max_lat) / 2.0, (self.min_lon + self.max_lon) / 2.0)
    }
}

/// One `<node>`/`<way>`/`<relation>` body as it appears in adiff XML.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedBody {
    /// The object's variant.
    pub variant: Variant,
    /// Id, unique within variant.
    pub osm_id: i64,
    /// Version at the time this body was emitted.
    pub version: i64,
    /// Tags on this body.
    pub tags: Tags,
    /// Change metadata.
    pub meta: ChangeMeta,
    /// A node's own coordinates.
    pub own_coords: Option<(f64, f64)>,
    /// A way's ordered node references, with coordinates where resolved.
    pub nds: Vec<NdRef>,
    /// A relation's members.
    pub members: Vec<Member>,
    /// The `bounds` child, for ways/relations.
    pub bounds: Option<Bounds>,
}

impl ParsedBody {
    fn empty(variant: Variant) -> Self {
        Self {
            variant,
            osm_id: 0,
            version: 0,
            tags: Tags::new(),
            meta: ChangeMeta::default(),
            own_coords: None,
            nds: Vec::new(),
            members: Vec::new(),
            bounds: None,
        }
    }
}

/// One `<action>` element: a create (new only), or a modify/delete/split/
/// join (both old and new).
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedAction {
    /// The action-header label (`create|modify|delete`; adiff never
    /// carries `split`/`join` itself — those are derived downstream).
    pub header_action: String,
    /// The prior body, for modify/delete.
    pub old: Option<ParsedBody>,
    /// The current body.
    pub new: ParsedBody,
}

/// Errors parsing adiff XML.
#[derive(Debug, Error)]
pub enum AdiffReadError {
    /// The input was not well-formed XML.
    #[error("malformed adiff XML: {0}")]
    Xml(#[from] quick_xml::Error),
}

fn attr(event: &quick_xml::events::BytesStart<'_>, name: &str) -> Option<String> {
    event
        .attributes()
        .flatten()
        .find(|a| a.key.as_ref() == name.as_bytes())
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

fn variant_of(local: &[u8]) -> Option<Variant> {
    match local {
        b"node" => Some(Variant::Node),
        b"way" => Some(Variant::Way),
        b"relation" => Some(Variant::Relation),
        _ => None,
    }
}

/// Reads every `<action>` in an adiff document, in document order.
pub fn read_adiff(xml: &str) -> Result<Vec<ParsedAction>, AdiffReadError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut actions = Vec::new();
    let mut header_action = String::new();
    let mut in_old = false;
    let mut old_body: Option<ParsedBody> = None;
    let mut new_body: Option<ParsedBody> = None;
    let mut current: Option<ParsedBody> = None;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Eof => break,
            Event::Start(ref e) | Event::Empty(ref e) => {
                let local = e.name();
                match local.as_ref() {
                    b"action" => {
                        header_action = attr(e, "type").unwrap_or_default();
                        old_body = None;
                        new_body = None;
                    }
                    b"old" => in_old = true,
                    b"new" => {}
                    b"bounds" => {
                        if let Some(body) = current.as_mut() {
                            body.bounds = Some(Bounds {
                                min_lat: attr(e, "minlat").and_then(|v| v.parse().ok()).unwrap_or_default(),
                                min_lon: attr(e, "minlon").and_then(|v| v.parse().ok()).unwrap_or_default(),
                                max_lat: attr(e, "maxlat").and_then(|v| v.parse().ok()).unwrap_or_default(),
                                max_lon: attr(e, "maxlon").and_then(|v| v.parse().ok()).unwrap_or_default(),
                            });
                        }
                    }
                    b"tag" => {
                        if let (Some(body), Some(k), Some(v)) = (current.as_mut(), attr(e, "k"), attr(e, "v")) {
                            body.tags.insert(k, v);
                        }
                    }
                    b"nd" => {
                        if let Some(body) = current.as_mut() {
                            let node_id = attr(e, "ref").and_then(|v| v.parse().ok()).unwrap_or_default();
                            let coords = match (attr(e, "lat"), attr(e, "lon")) {
                                (Some(lat), Some(lon)) => {
                                    match (lat.parse::<f64>(), lon.parse::<f64>()) {
                                        (Ok(lat), Ok(lon)) => Some((lat, lon)),
                                        _ => None,
                                    }
                                }
                                _ => None,
                            };
                            body.nds.push(NdRef { node_id, coords });
                        }
                    }
                    b"member" => {
                        if let Some(body) = current.as_mut() {
                            let member_type = attr(e, "type")
                                .and_then(|v| v.chars().next().and_then(Variant::from_initial))
                                .unwrap_or(Variant::Node);
                            let osm_ref = attr(e, "ref").and_then(|v| v.parse().ok()).unwrap_or_default();
                            let role = attr(e, "role").unwrap_or_default();
                            body.members.push(Member {
                                member_type,
                                osm_ref,
                                role,
                            });
                        }
                    }
                    _ => {
                        if let Some(variant) = variant_of(local.as_ref()) {
                            let mut body = ParsedBody::empty(variant);
                            body.osm_id = attr(e, "id").and_then(|v| v.parse().ok()).unwrap_or_default();
                            body.version = attr(e, "version").and_then(|v| v.parse().ok()).unwrap_or_default();
                            body.meta = ChangeMeta {
                                timestamp: attr(e, "timestamp").unwrap_or_default(),
                                changeset: attr(e, "changeset").and_then(|v| v.parse().ok()).unwrap_or_default(),
                                uid: attr(e, "uid").and_then(|v| v.parse().ok()).unwrap_or_default(),
                                username: attr(e, "user").unwrap_or_default(),
                            };
                            if variant == Variant::Node {
                                body.own_coords = match (attr(e, "lat"), attr(e, "lon")) {
                                    (Some(lat), Some(lon)) => {
                                        match (lat.parse::<f64>(), lon.parse::<f64>()) {
                                            (Ok(lat), Ok(lon)) => Some((lat, lon)),
                                            _ => None,
                                        }
                                    }
                                    _ => None,
                                };
                            }
                            current = Some(body);
                        }
                    }
                }
            }
            Event::End(ref e) => {
                let local = e.name();
                match local.as_ref() {
                    b"node" | b"way" | b"relation" => {
                        if let Some(body) = current.take() {
                            if in_old {
                                old_body = Some(body);
                            } else {
                                new_body = Some(body);
                            }
                        }
                    }
                    b"old" => in_old = false,
                    b"new" => {}
                    b"action" => {
                        if let Some(new_body) = new_body.take() {
                            actions.push(ParsedAction {
                                header_action: std::mem::take(&mut header_action),
                                old: old_body.take(),
                                new: new_body,
                            });
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_create_action() {
        let xml = r#"<osm><action type="create"><node id="1" version="1" changeset="1" uid="1" user="a" timestamp="t" lat="1.0" lon="2.0"><tag k="amenity" v="cafe"/></node></action></osm>"#;
        let actions = read_adiff(xml).expect("parse");
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].header_action, "create");
        assert_eq!(actions[0].new.own_coords, Some((1.0, 2.0)));
    }

    #[test]
    fn parses_modify_action_with_old_and_new() {
        let xml = r#"<osm><action type="modify">
            <old><way id="5" version="1" changeset="1" uid="1" user="a" timestamp="t"><nd ref="1" lat="1.0" lon="1.0"/><nd ref="2" lat="2.0" lon="2.0"/></way></old>
            <new><way id="5" version="2" changeset="1" uid="1" user="a" timestamp="t"><bounds minlat="1.0" minlon="1.0" maxlat="2.0" maxlon="2.0"/><nd ref="1" lat="1.0" lon="1.0"/><nd ref="3" lat="3.0" lon="3.0"/></way></new>
        </action></osm>"#;
        let actions = read_adiff(xml).expect("parse");
        let action = &actions[0];
        assert!(action.old.is_some());
        assert_eq!(action.new.bounds.unwrap().midpoint(), (1.5, 1.5));
        assert_eq!(action.new.nds.len(), 2);
    }

    #[test]
    fn missing_coordinates_leave_nd_coords_none() {
        let xml = r#"<osm><action type="create"><way id="1" version="1" changeset="1" uid="1" user="a" timestamp="t"><nd ref="1"/></way></action></osm>"#;
        let actions = read_adiff(xml).expect("parse");
        assert_eq!(actions[0].new.nds[0].coords, None);
    }
}
