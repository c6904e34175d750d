//! OSM change-record domain types.
//!
//! Mirrors the three OSM element variants (node, way, relation) and the
//! change metadata that accompanies every edit. Coordinates are carried as
//! `f64` degrees on [`OsmObject`] and converted to fixed-point only at the
//! Watched-Object Store boundary (see [`Decimicro`]).

use std::collections::BTreeMap;

/// Free-form OSM tags. Ordered so that adiff XML emits tags in a
/// deterministic sequence across runs.
pub type Tags = BTreeMap<String, String>;

/// One of the three kinds of OSM element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    /// A point.
    Node,
    /// An ordered sequence of node references.
    Way,
    /// A typed, ordered sequence of members.
    Relation,
}

impl Variant {
    /// Returns the single-letter store-key prefix (`n`, `w`, `r`).
    #[must_use]
    pub const fn initial(self) -> char {
        match self {
            Self::Node => 'n',
            Self::Way => 'w',
            Self::Relation => 'r',
        }
    }

    /// Parses a variant from its first letter, case-insensitively.
    #[must_use]
    pub fn from_initial(c: char) -> Option<Self> {
        match c.to_ascii_lowercase() {
            'n' => Some(Self::Node),
            'w' => Some(Self::Way),
            'r' => Some(Self::Relation),
            _ => None,
        }
    }

    /// The lowercase XML element name for this variant (`node`, `way`,
    /// `relation`).
    #[must_use]
    pub const fn xml_tag(self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Way => "way",
            Self::Relation => "relation",
        }
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.xml_tag())
    }
}

/// A typed member of a relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Type of the referenced object.
    pub member_type: Variant,
    /// Id of the referenced object.
    pub osm_ref: i64,
    /// Role string, possibly empty.
    pub role: String,
}

/// Change metadata common to every OSM object.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChangeMeta {
    /// ISO-8601 timestamp as it appeared on the wire.
    pub timestamp: String,
    /// Changeset id.
    pub changeset: i64,
    /// Author's user id.
    pub uid: i64,
    /// Author's display name.
    pub username: String,
}

/// Variant-specific payload of an [`OsmObject`].
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    /// A node's coordinates, in decimal degrees.
    Node {
        /// Latitude in decimal degrees.
        lat: f64,
        /// Longitude in decimal degrees.
        lon: f64,
    },
    /// A way's ordered node references.
    Way {
        /// Referenced node ids, in order.
        nodes: Vec<i64>,
    },
    /// A relation's ordered members.
    Relation {
        /// Members, in order.
        members: Vec<Member>,
    },
}

impl Geometry {
    /// The [`Variant`] this geometry belongs to.
    #[must_use]
    pub const fn variant(&self) -> Variant {
        match self {
            Self::Node { .. } => Variant::Node,
            Self::Way { .. } => Variant::Way,
            Self::Relation { .. } => Variant::Relation,
        }
    }
}

/// A full OSM object as it appears in an osmChange or adiff document.
#[derive(Debug, Clone, PartialEq)]
pub struct OsmObject {
    /// Id, unique within its variant.
    pub osm_id: i64,
    /// Monotone version number.
    pub version: i64,
    /// Tags, keyed by string.
    pub tags: Tags,
    /// Change metadata.
    pub meta: ChangeMeta,
    /// Variant-specific payload.
    pub geometry: Geometry,
}

impl OsmObject {
    /// The object's [`Variant`].
    #[must_use]
    pub const fn variant(&self) -> Variant {
        self.geometry.variant()
    }

    /// `true` for a way with fewer than two node references (spec.md I1/B1).
    #[must_use]
    pub fn is_degenerate_way(&self) -> bool {
        matches!(&self.geometry, Geometry::Way { nodes } if nodes.len() < 2)
    }

    /// `true` for a relation with zero members (spec.md B2).
    #[must_use]
    pub fn is_empty_relation(&self) -> bool {
        matches!(&self.geometry, Geometry::Relation { members } if members.is_empty())
    }

    /// Node ids referenced by this object: itself for a node, its `nd`
    /// list for a way, or the node-typed members of a relation.
    #[must_use]
    pub fn referenced_node_ids(&self) -> Vec<i64> {
        match &self.geometry {
            Geometry::Node { .. } => vec![self.osm_id],
            Geometry::Way { nodes } => nodes.clone(),
            Geometry::Relation { members } => members
                .iter()
                .filter(|m| m.member_type == Variant::Node)
                .map(|m| m.osm_ref)
                .collect(),
        }
    }
}

/// Fixed-point coordinate representation: degrees * 10^7, per spec.md
/// "Fixed-point coordinates" design note. A signed 32-bit integer suffices
/// for the ±180 degree domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Decimicro(pub i32);

/// Multiplier converting decimal degrees to the fixed-point representation.
const COORD_MULTIPLIER: f64 = 1e7;

impl Decimicro {
    /// Rounds `degrees` to the nearest fixed-point unit.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        reason = "degrees are bounded to ±180 and rounded before the cast"
    )]
    pub fn from_degrees(degrees: f64) -> Self {
        Self((degrees * COORD_MULTIPLIER).round() as i32)
    }

    /// Converts back to decimal degrees.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        reason = "i32 -> f64 is exact for the ±180 degree*1e7 domain"
    )]
    pub fn to_degrees(self) -> f64 {
        f64::from(self.0) / COORD_MULTIPLIER
    }
}
