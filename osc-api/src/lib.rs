//! Read-only OSM API client (spec.md §4.4, §6.7).
//!
//! Grounded on `wildside-data`'s `HttpTravelTimeProvider`: a synchronous
//! trait backed by an HTTP implementation that bridges to async `reqwest`
//! calls via an owned Tokio runtime, detecting and reusing an ambient
//! multi-threaded runtime where one is already running.

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, warn};
use osc_core::{ChangeMeta, Geometry, Member, OsmObject, Tags, Variant};
use quick_xml::Reader;
use quick_xml::events::Event;
use reqwest::Client;
use thiserror::Error;
use tokio::runtime::{Handle, Runtime, RuntimeFlavor};

/// Up to this many node ids are requested per bulk lookup (spec.md §4.4,
/// §5).
pub const NODE_BATCH_LIMIT: usize = 500;

/// Summary of a changeset, as returned by `user_changesets`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangesetSummary {
    /// Changeset id.
    pub id: i64,
    /// Creation timestamp as it appeared on the wire.
    pub created_at: String,
}

/// Summary of a user account, as returned by `user`.
#[derive(Debug, Clone, PartialEq)]
pub struct UserSummary {
    /// Account-creation timestamp as it appeared on the wire.
    pub account_created: String,
    /// Total changeset count reported by the API.
    pub changesets_count: i64,
}

/// Errors from the OSM API client. Per spec.md §4.4 "Failure semantics":
/// a non-200 on a single-version lookup is a recoverable miss and never
/// surfaces as this type; only bulk/history failures on a genuinely
/// referenced node, and malformed responses, are fatal.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The HTTP request itself failed (network, timeout, non-2xx on a
    /// bulk or required-history endpoint).
    #[error("request to {url} failed: {source}")]
    Request {
        /// The request URL.
        url: String,
        /// Underlying `reqwest` error.
        #[source]
        source: reqwest::Error,
    },
    /// The response body was not well-formed XML.
    #[error("malformed response from {url}: {source}")]
    Xml {
        /// The request URL.
        url: String,
        /// Underlying parse error.
        #[source]
        source: quick_xml::Error,
    },
    /// A node genuinely referenced by the current action could not be
    /// resolved by either the bulk endpoint or its history.
    #[error("node {node_id} has no resolvable coordinates")]
    UnresolvedNode {
        /// The node id that could not be resolved.
        node_id: i64,
    },
    /// Failed to build the underlying HTTP client or Tokio runtime.
    #[error("failed to initialise OSM API client: {0}")]
    Init(String),
}

/// Read-only access to an OSM API-compatible service.
pub trait OsmApiClient {
    /// Returns the first changeset opened by `display_name`, if any.
    ///
    /// # Errors
    /// Returns [`ApiError`] only for malformed responses; a missing user
    /// or changeset is a recoverable `Ok(None)`.
    fn user_changesets(&self, display_name: &str) -> Result<Option<ChangesetSummary>, ApiError>;

    /// Returns account metadata for `uid`, if the account exists.
    ///
    /// # Errors
    /// Returns [`ApiError`] only for malformed responses.
    fn user(&self, uid: i64) -> Result<Option<UserSummary>, ApiError>;

    /// Fetches a specific historical version of an object. A non-200 is a
    /// recoverable miss (spec.md §4.4).
    ///
    /// # Errors
    /// Returns [`ApiError`] only for malformed responses.
    fn object_version(
        &self,
        variant: Variant,
        osm_id: i64,
        version: i64,
    ) -> Result<Option<OsmObject>, ApiError>;

    /// Resolves coordinates for `ids`, batching at [`NODE_BATCH_LIMIT`]
    /// and falling back to per-node history for ids the bulk endpoint
    /// omits (deleted nodes).
    ///
    /// # Errors
    /// Fatal per spec.md §4.4 when a genuinely referenced node cannot be
    /// resolved by either path.
    fn nodes(&self, ids: &[i64]) -> Result<HashMap<i64, (f64, f64)>, ApiError>;
}

/// HTTP-backed [`OsmApiClient`].
pub struct HttpOsmApiClient {
    client: Client,
    base_url: String,
    runtime: Runtime,
}

impl std::fmt::Debug for HttpOsmApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpOsmApiClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpOsmApiClient {
    /// Builds a client against `base_url` (e.g. `https://api.openstreetmap.org/api/0.6`).
    ///
    /// # Errors
    /// Returns [`ApiError::Init`] if the HTTP client or runtime cannot be
    /// constructed.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        let client = Client::builder()
            .user_agent("osc-engine/0.1")
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| ApiError::Init(err.to_string()))?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| ApiError::Init(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            runtime,
        })
    }

    fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| handle.block_on(future))
            }
            _ => self.runtime.block_on(future),
        }
    }

    async fn get(&self, url: &str) -> Result<Option<String>, ApiError> {
        let response =
            self.client
                .get(url)
                .send()
                .await
                .map_err(|source| ApiError::Request {
                    url: url.to_owned(),
                    source,
                })?;
        if !response.status().is_success() {
            return Ok(None);
        }
        let body = response.text().await.map_err(|source| ApiError::Request {
            url: url.to_owned(),
            source,
        })?;
        Ok(Some(body))
    }

    async fn get_required(&self, url: &str) -> Result<String, ApiError> {
        let response =
            self.client
                .get(url)
                .send()
                .await
                .map_err(|source| ApiError::Request {
                    url: url.to_owned(),
                    source,
                })?
                .error_for_status()
                .map_err(|source| ApiError::Request {
                    url: url.to_owned(),
                    source,
                })?;
        response.text().await.map_err(|source| ApiError::Request {
            url: url.to_owned(),
            source,
        })
    }

    fn node_batch(&self, ids: &[i64]) -> Result<HashMap<i64, (f64, f64)>, ApiError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let joined = ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(",");
        let url = format!("{}/nodes?nodes={joined}", self.base_url);
        let body = self.block_on(self.get_required(&url))?;
        parse_node_coordinates(&body, &url)
    }

    fn node_history_coordinates(&self, node_id: i64) -> Result<(f64, f64), ApiError> {
        let url = format!("{}/node/{node_id}/history", self.base_url);
        let body = self.block_on(self.get_required(&url))?;
        let versions = parse_node_version_coordinates(&body, &url)?;
        versions
            .into_iter()
            .last()
            .map(|(_, coords)| coords)
            .ok_or(ApiError::UnresolvedNode { node_id })
    }
}

impl OsmApiClient for HttpOsmApiClient {
    fn user_changesets(&self, display_name: &str) -> Result<Option<ChangesetSummary>, ApiError> {
        let url = format!(
            "{}/changesets?display_name={}",
            self.base_url,
            urlencode(display_name)
        );
        let Some(body) = self.block_on(self.get(&url))? else {
            return Ok(None);
        };
        parse_first_changeset(&body, &url)
    }

    fn user(&self, uid: i64) -> Result<Option<UserSummary>, ApiError> {
        let url = format!("{}/user/{uid}", self.base_url);
        let Some(body) = self.block_on(self.get(&url))? else {
            return Ok(None);
        };
        parse_user_summary(&body, &url)
    }

    fn object_version(
        &self,
        variant: Variant,
        osm_id: i64,
        version: i64,
    ) -> Result<Option<OsmObject>, ApiError> {
        let url = format!(
            "{}/{}/{osm_id}/{version}",
            self.base_url,
            variant.xml_tag()
        );
        let Some(body) = self.block_on(self.get(&url))? else {
            return Ok(None);
        };
        parse_object(&body, &url)
    }

    fn nodes(&self, ids: &[i64]) -> Result<HashMap<i64, (f64, f64)>, ApiError> {
        let mut resolved = HashMap::new();
        for chunk in ids.chunks(NODE_BATCH_LIMIT) {
            resolved.extend(self.node_batch(chunk)?);
        }
        for &id in ids {
            if resolved.contains_key(&id) {
                continue;
            }
            debug!("node {id} absent from bulk response, falling back to history");
            let coords = self.node_history_coordinates(id)?;
            resolved.insert(id, coords);
        }
        Ok(resolved)
    }
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn attr(event: &quick_xml::events::BytesStart<'_>, name: &str) -> Option<String> {
    event
        .attributes()
        .flatten()
        .find(|a| a.key.as_ref() == name.as_bytes())
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

fn parse_object(xml: &str, url: &str) -> Result<Option<OsmObject>, ApiError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut variant: Option<Variant> = None;
    let mut osm_id = 0i64;
    let mut version = 0i64;
    let mut meta = ChangeMeta::default();
    let mut lat = 0.0f64;
    let mut lon = 0.0f64;
    let mut tags = Tags::new();
    let mut nodes = Vec::new();
    let mut members = Vec::new();
    let mut visible = true;

    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|source| ApiError::Xml {
                url: url.to_owned(),
                source,
            })? {
            Event::Eof => break,
            Event::Start(ref e) | Event::Empty(ref e) => {
                let name = e.name();
                let local = name.as_ref();
                let top_level_variant = match local {
                    b"node" => Some(Variant::Node),
                    b"way" => Some(Variant::Way),
                    b"relation" => Some(Variant::Relation),
                    _ => None,
                };
                if let (true, Some(v)) = (variant.is_none(), top_level_variant) {
                    variant = Some(v);
                    osm_id = attr(e, "id").and_then(|v| v.parse().ok()).unwrap_or_default();
                    version = attr(e, "version").and_then(|v| v.parse().ok()).unwrap_or_default();
                    meta.timestamp = attr(e, "timestamp").unwrap_or_default();
                    meta.changeset = attr(e, "changeset").and_then(|v| v.parse().ok()).unwrap_or_default();
                    meta.uid = attr(e, "uid").and_then(|v| v.parse().ok()).unwrap_or_default();
                    meta.username = attr(e, "user").unwrap_or_default();
                    visible = attr(e, "visible").is_none_or(|v| v != "false");
                    if v == Variant::Node {
                        lat = attr(e, "lat").and_then(|v| v.parse().ok()).unwrap_or_default();
                        lon = attr(e, "lon").and_then(|v| v.parse().ok()).unwrap_or_default();
                    }
                    continue;
                }
                match local {
                    b"tag" => {
                        if let (Some(k), Some(v)) = (attr(e, "k"), attr(e, "v")) {
                            tags.insert(k, v);
                        }
                    }
                    b"nd" => {
                        if let Some(id) = attr(e, "ref").and_then(|v| v.parse().ok()) {
                            nodes.push(id);
                        }
                    }
                    b"member" => {
                        let member_type = attr(e, "type")
                            .and_then(|v| v.chars().next().and_then(Variant::from_initial))
                            .unwrap_or(Variant::Node);
                        let osm_ref = attr(e, "ref").and_then(|v| v.parse().ok()).unwrap_or_default();
                        let role = attr(e, "role").unwrap_or_default();
                        members.push(Member {
                            member_type,
                            osm_ref,
                            role,
                        });
                    }
                    _ => {}
                }
            }
            _ => {}
        }
        buf.clear();
    }

    let Some(variant) = variant else {
        return Ok(None);
    };
    if !visible {
        warn!("object_version returned a deleted revision for {osm_id}");
    }
    let geometry = match variant {
        Variant::Node => Geometry::Node { lat, lon },
        Variant::Way => Geometry::Way { nodes },
        Variant::Relation => Geometry::Relation { members },
    };
    Ok(Some(OsmObject {
        osm_id,
        version,
        tags,
        meta,
        geometry,
    }))
}

fn parse_node_coordinates(xml: &str, url: &str) -> Result<HashMap<i64, (f64, f64)>, ApiError> {
    let versions = parse_node_version_coordinates(xml, url)?;
    Ok(versions.into_iter().collect())
}

/// Parses every `<node>` element in `xml`, preserving document order so
/// the most recent version (for history responses) is last.
fn parse_node_version_coordinates(xml: &str, url: &str) -> Result<Vec<(i64, (f64, f64))>, ApiError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut out = Vec::new();

    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|source| ApiError::Xml {
                url: url.to_owned(),
                source,
            })? {
            Event::Eof => break,
            Event::Start(ref e) | Event::Empty(ref e) if e.name().as_ref() == b"node" => {
                let visible = attr(e, "visible").is_none_or(|v| v != "false");
                let lat = attr(e, "lat").and_then(|v| v.parse().ok());
                let lon = attr(e, "lon").and_then(|v| v.parse().ok());
                if let (true, Some(id), Some(lat), Some(lon)) =
                    (visible, attr(e, "id").and_then(|v| v.parse().ok()), lat, lon)
                {
                    out.push((id, (lat, lon)));
                }
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

fn parse_first_changeset(xml: &str, url: &str) -> Result<Option<ChangesetSummary>, ApiError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|source| ApiError::Xml {
                url: url.to_owned(),
                source,
            })? {
            Event::Eof => return Ok(None),
            Event::Start(ref e) | Event::Empty(ref e) if e.name().as_ref() == b"changeset" => {
                let id = attr(e, "id").and_then(|v| v.parse().ok()).unwrap_or_default();
                let created_at = attr(e, "created_at").unwrap_or_default();
                return Ok(Some(ChangesetSummary { id, created_at }));
            }
            _ => {}
        }
        buf.clear();
    }
}

fn parse_user_summary(xml: &str, url: &str) -> Result<Option<UserSummary>, ApiError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut account_created = None;
    let mut changesets_count = 0i64;
    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|source| ApiError::Xml {
                url: url.to_owned(),
                source,
            })? {
            Event::Eof => break,
            Event::Start(ref e) | Event::Empty(ref e) => match e.name().as_ref() {
                b"user" => account_created = attr(e, "account_created"),
                b"changesets" => {
                    changesets_count = attr(e, "count").and_then(|v| v.parse().ok()).unwrap_or_default();
                }
                _ => {}
            },
            _ => {}
        }
        buf.clear();
    }
    Ok(account_created.map(|account_created| UserSummary {
        account_created,
        changesets_count,
    }))
}

/// A canned [`OsmApiClient`] for tests, returning pre-seeded answers.
pub mod test_support {
    use std::cell::RefCell;
    use std::collections::HashMap;

    use osc_core::{OsmObject, Variant};

    use super::{ApiError, ChangesetSummary, OsmApiClient, UserSummary};

    /// Deterministic fake client driven by maps populated before use.
    #[derive(Default)]
    pub struct FakeOsmApiClient {
        /// Keyed by `(variant, osm_id, version)`.
        pub versions: RefCell<HashMap<(Variant, i64, i64), OsmObject>>,
        /// Known node coordinates.
        pub node_locations: RefCell<HashMap<i64, (f64, f64)>>,
        /// Known changesets by display name.
        pub changesets: RefCell<HashMap<String, ChangesetSummary>>,
        /// Known users by id.
        pub users: RefCell<HashMap<i64, UserSummary>>,
        /// Node ids that should report as unresolved, simulating a fatal
        /// bulk/history failure.
        pub unresolved: RefCell<Vec<i64>>,
    }

    impl OsmApiClient for FakeOsmApiClient {
        fn user_changesets(
            &self,
            display_name: &str,
        ) -> Result<Option<ChangesetSummary>, ApiError> {
            Ok(self.changesets.borrow().get(display_name).cloned())
        }

        fn user(&self, uid: i64) -> Result<Option<UserSummary>, ApiError> {
            Ok(self.users.borrow().get(&uid).cloned())
        }

        fn object_version(
            &self,
            variant: Variant,
            osm_id: i64,
            version: i64,
        ) -> Result<Option<OsmObject>, ApiError> {
            Ok(self
                .versions
                .borrow()
                .get(&(variant, osm_id, version))
                .cloned())
        }

        fn nodes(&self, ids: &[i64]) -> Result<HashMap<i64, (f64, f64)>, ApiError> {
            let unresolved = self.unresolved.borrow();
            let locations = self.node_locations.borrow();
            let mut out = HashMap::new();
            for &id in ids {
                if unresolved.contains(&id) {
                    return Err(ApiError::UnresolvedNode { node_id: id });
                }
                if let Some(&coords) = locations.get(&id) {
                    out.insert(id, coords);
                }
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn parses_node_object() {
        let xml = r#"<?xml version="1.0"?><osm><node id="1" version="2" timestamp="2020-01-01T00:00:00Z" changeset="5" uid="9" user="alice" lat="60.1" lon="30.2"><tag k="amenity" v="cafe"/></node></osm>"#;
        let obj = parse_object(xml, "url").expect("parse").expect("present");
        assert_eq!(obj.osm_id, 1);
        assert_eq!(obj.version, 2);
        assert_eq!(obj.tags.get("amenity").map(String::as_str), Some("cafe"));
        assert!(matches!(obj.geometry, Geometry::Node { lat, lon } if (lat - 60.1).abs() < 1e-9 && (lon - 30.2).abs() < 1e-9));
    }

    #[rstest]
    fn parses_way_object_with_nodes() {
        let xml = r#"<osm><way id="7" version="1" changeset="1" uid="1" user="a" timestamp="t"><nd ref="1"/><nd ref="2"/><tag k="highway" v="residential"/></way></osm>"#;
        let obj = parse_object(xml, "url").expect("parse").expect("present");
        assert!(matches!(&obj.geometry, Geometry::Way { nodes } if nodes == &vec![1, 2]));
    }

    #[rstest]
    fn missing_object_returns_none() {
        let xml = "<osm></osm>";
        assert_eq!(parse_object(xml, "url").expect("parse"), None);
    }

    #[rstest]
    fn bulk_nodes_skip_invisible_entries() {
        let xml = r#"<osm><node id="1" lat="1.0" lon="2.0"/><node id="2" visible="false"/></osm>"#;
        let found = parse_node_coordinates(xml, "url").expect("parse");
        assert_eq!(found.len(), 1);
        assert!(found.contains_key(&1));
    }

    #[rstest]
    fn history_selects_last_visible_version() {
        let xml = r#"<osm>
            <node id="3" version="1" lat="1.0" lon="1.0"/>
            <node id="3" version="2" lat="2.0" lon="2.0"/>
            <node id="3" version="3" visible="false"/>
        </osm>"#;
        let versions = parse_node_version_coordinates(xml, "url").expect("parse");
        let (_, coords) = versions.last().copied().expect("has a visible version");
        assert_eq!(coords, (2.0, 2.0));
    }

    #[rstest]
    fn parses_first_changeset_only() {
        let xml = r#"<osm><changeset id="1" created_at="2020-01-01"/><changeset id="2" created_at="2020-01-02"/></osm>"#;
        let summary = parse_first_changeset(xml, "url").expect("parse").expect("present");
        assert_eq!(summary.id, 1);
    }

    #[rstest]
    fn parses_user_summary() {
        let xml = r#"<osm><user id="1" account_created="2015-01-01T00:00:00Z"><changesets count="42"/></user></osm>"#;
        let summary = parse_user_summary(xml, "url").expect("parse").expect("present");
        assert_eq!(summary.changesets_count, 42);
    }

    #[rstest]
    fn urlencode_escapes_reserved_characters() {
        assert_eq!(urlencode("a b"), "a%20b");
        assert_eq!(urlencode("abc-_.~"), "abc-_.~");
    }
}
