//! Parses osmChange documents (spec.md §6.1) into an in-memory action list.
//!
//! osmChange files in this pipeline's domain (single-changeset diffs) are
//! modest, so the two scans spec.md's Adiff Builder algorithm calls for are
//! taken as two passes over one parsed `Vec<ChangeRecord>` rather than two
//! re-reads of the file; see DESIGN.md.

use std::io::{BufRead, Read};

use flate2::bufread::GzDecoder;
use osc_core::{ChangeMeta, Geometry, Member, OsmObject, Tags, Variant};
use quick_xml::Reader;
use quick_xml::events::Event;
use thiserror::Error;

/// Which osmChange section an object was found under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// `<create>`.
    Create,
    /// `<modify>`.
    Modify,
    /// `<delete>`.
    Delete,
}

impl ActionKind {
    /// The adiff `type` attribute value for this action.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Modify => "modify",
            Self::Delete => "delete",
        }
    }
}

/// One object found under an osmChange section.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    /// The enclosing section.
    pub action: ActionKind,
    /// The parsed object.
    pub object: OsmObject,
}

/// Errors reading or parsing an osmChange document (spec.md §7 "Input
/// malformed").
#[derive(Debug, Error)]
pub enum ChangeError {
    /// The input was not well-formed XML.
    #[error("malformed osmChange XML: {0}")]
    Xml(#[from] quick_xml::Error),
    /// Reading the input stream failed.
    #[error("failed to read osmChange input: {0}")]
    Io(#[from] std::io::Error),
}

/// Transparently gzip-decompresses `input` if it starts with the gzip
/// magic bytes (spec.md §6.1, "optionally gzip-compressed").
pub fn decompress<'a>(mut input: impl BufRead + 'a) -> Result<Box<dyn Read + 'a>, std::io::Error> {
    let header = input.fill_buf()?;
    if header.starts_with(&[0x1f, 0x8b]) {
        Ok(Box::new(GzDecoder::new(input)))
    } else {
        Ok(Box::new(input))
    }
}

/// Parses an entire osmChange document into its constituent records, in
/// document order.
pub fn read_osm_change(input: impl Read) -> Result<Vec<ChangeRecord>, ChangeError> {
    let mut reader = Reader::from_reader(std::io::BufReader::new(input));
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut records = Vec::new();
    let mut current_action: Option<ActionKind> = None;
    let mut open_object: Option<OpenObject> = None;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Eof => break,
            Event::Start(ref e) => {
                let local = e.name();
                match local.as_ref() {
                    b"create" => current_action = Some(ActionKind::Create),
                    b"modify" => current_action = Some(ActionKind::Modify),
                    b"delete" => current_action = Some(ActionKind::Delete),
                    b"node" | b"way" | b"relation" => {
                        open_object = Some(OpenObject::start(e));
                    }
                    b"tag" => {
                        if let Some(open) = open_object.as_mut() {
                            open.push_tag(e);
                        }
                    }
                    b"nd" => {
                        if let Some(open) = open_object.as_mut() {
                            open.push_nd(e);
                        }
                    }
                    b"member" => {
                        if let Some(open) = open_object.as_mut() {
                            open.push_member(e);
                        }
                    }
                    _ => {}
                }
            }
            Event::Empty(ref e) => {
                let local = e.name();
                match local.as_ref() {
                    b"node" | b"way" | b"relation" => {
                        let open = OpenObject::start(e);
                        if let Some(action) = current_action {
                            records.push(ChangeRecord {
                                action,
                                object: open.finish(),
                            });
                        }
                    }
                    b"tag" => {
                        if let Some(open) = open_object.as_mut() {
                            open.push_tag(e);
                        }
                    }
                    b"nd" => {
                        if let Some(open) = open_object.as_mut() {
                            open.push_nd(e);
                        }
                    }
                    b"member" => {
                        if let Some(open) = open_object.as_mut() {
                            open.push_member(e);
                        }
                    }
                    _ => {}
                }
            }
            Event::End(ref e) => {
                let local = e.name();
                match local.as_ref() {
                    b"node" | b"way" | b"relation" => {
                        if let (Some(open), Some(action)) = (open_object.take(), current_action) {
                            records.push(ChangeRecord {
                                action,
                                object: open.finish(),
                            });
                        }
                    }
                    b"create" | b"modify" | b"delete" => current_action = None,
                    _ => {}
                }
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(records)
}

struct OpenObject {
    variant: Variant,
    osm_id: i64,
    version: i64,
    meta: ChangeMeta,
    lat: f64,
    lon: f64,
    tags: Tags,
    nodes: Vec<i64>,
    members: Vec<Member>,
}

fn attr(event: &quick_xml::events::BytesStart<'_>, name: &str) -> Option<String> {
    event
        .attributes()
        .flatten()
        .find(|a| a.key.as_ref() == name.as_bytes())
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

impl OpenObject {
    fn start(e: &quick_xml::events::BytesStart<'_>) -> Self {
        let variant = match e.name().as_ref() {
            b"way" => Variant::Way,
            b"relation" => Variant::Relation,
            _ => Variant::Node,
        };
        Self {
            variant,
            osm_id: attr(e, "id").and_then(|v| v.parse().ok()).unwrap_or_default(),
            version: attr(e, "version").and_then(|v| v.parse().ok()).unwrap_or_default(),
            meta: ChangeMeta {
                timestamp: attr(e, "timestamp").unwrap_or_default(),
                changeset: attr(e, "changeset").and_then(|v| v.parse().ok()).unwrap_or_default(),
                uid: attr(e, "uid").and_then(|v| v.parse().ok()).unwrap_or_default(),
                username: attr(e, "user").unwrap_or_default(),
            },
            lat: attr(e, "lat").and_then(|v| v.parse().ok()).unwrap_or_default(),
            lon: attr(e, "lon").and_then(|v| v.parse().ok()).unwrap_or_default(),
            tags: Tags::new(),
            nodes: Vec::new(),
            members: Vec::new(),
        }
    }

    fn push_tag(&mut self, e: &quick_xml::events::BytesStart<'_>) {
        if let (Some(k), Some(v)) = (attr(e, "k"), attr(e, "v")) {
            self.tags.insert(k, v);
        }
    }

    fn push_nd(&mut self, e: &quick_xml::events::BytesStart<'_>) {
        if let Some(id) = attr(e, "ref").and_then(|v| v.parse().ok()) {
            self.nodes.push(id);
        }
    }

    fn push_member(&mut self, e: &quick_xml::events::BytesStart<'_>) {
        let member_type = attr(e, "type")
            .and_then(|v| v.chars().next().and_then(Variant::from_initial))
            .unwrap_or(Variant::Node);
        let osm_ref = attr(e, "ref").and_then(|v| v.parse().ok()).unwrap_or_default();
        let role = attr(e, "role").unwrap_or_default();
        self.members.push(Member {
            member_type,
            osm_ref,
            role,
        });
    }

    fn finish(self) -> OsmObject {
        let geometry = match self.variant {
            Variant::Node => Geometry::Node {
                lat: self.lat,
                lon: self.lon,
            },
            Variant::Way => Geometry::Way { nodes: self.nodes },
            Variant::Relation => Geometry::Relation {
                members: self.members,
            },
        };
        OsmObject {
            osm_id: self.osm_id,
            version: self.version,
            tags: self.tags,
            meta: self.meta,
            geometry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn parses_create_node() {
        let xml = br#"<osmChange version="0.6"><create><node id="1" version="1" timestamp="t" changeset="1" uid="1" user="a" lat="1.0" lon="2.0"><tag k="amenity" v="bench"/></node></create></osmChange>"#;
        let records = read_osm_change(&xml[..]).expect("parse");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, ActionKind::Create);
        assert_eq!(records[0].object.osm_id, 1);
    }

    #[rstest]
    fn parses_modify_way_with_nodes_and_tags() {
        let xml = br#"<osmChange><modify><way id="5" version="2" changeset="1" uid="1" user="a" timestamp="t"><nd ref="10"/><nd ref="11"/><tag k="highway" v="residential"/></way></modify></osmChange>"#;
        let records = read_osm_change(&xml[..]).expect("parse");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, ActionKind::Modify);
        assert!(matches!(&records[0].object.geometry, Geometry::Way { nodes } if nodes == &vec![10, 11]));
    }

    #[rstest]
    fn parses_delete_section() {
        let xml = br#"<osmChange><delete><node id="9" version="3" changeset="1" uid="1" user="a" timestamp="t" lat="0.0" lon="0.0"/></delete></osmChange>"#;
        let records = read_osm_change(&xml[..]).expect("parse");
        assert_eq!(records[0].action, ActionKind::Delete);
    }

    #[rstest]
    fn multiple_sections_preserve_document_order() {
        let xml = br#"<osmChange>
            <create><node id="1" version="1" changeset="1" uid="1" user="a" timestamp="t" lat="1" lon="1"/></create>
            <modify><node id="2" version="2" changeset="1" uid="1" user="a" timestamp="t" lat="2" lon="2"/></modify>
            <delete><node id="3" version="1" changeset="1" uid="1" user="a" timestamp="t" lat="3" lon="3"/></delete>
        </osmChange>"#;
        let records = read_osm_change(&xml[..]).expect("parse");
        assert_eq!(
            records.iter().map(|r| r.object.osm_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[rstest]
    fn detects_gzip_magic_bytes() {
        use std::io::BufReader;
        let plain = b"<osmChange></osmChange>".to_vec();
        let mut decompressed = decompress(BufReader::new(&plain[..])).expect("decompress");
        let mut out = Vec::new();
        decompressed.read_to_end(&mut out).expect("read");
        assert_eq!(out, plain);
    }
}
