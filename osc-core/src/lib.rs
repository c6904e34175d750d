//! Core domain types for the osmChange → augmented-diff pipeline.
//!
//! Holds the pure, no-I/O-after-load leaves of the pipeline (spec.md §2):
//! the OSM object model, the Tag-Kind Matcher, and the Region Locator.

pub mod matcher;
pub mod model;
pub mod region;

pub use matcher::{ContextStrength, MatcherError, TagKindMatcher};
pub use model::{ChangeMeta, Decimicro, Geometry, Member, OsmObject, Tags, Variant};
pub use region::{RegionError, RegionLocator};
