//! Facade crate for the osmChange-to-transition-CSV pipeline.
//!
//! Re-exports the crates that make up the pipeline so downstream code
//! can depend on a single package: the core domain model and Tag-Kind
//! Matcher/Region Locator (`osc-core`), the Watched-Object Store
//! (`osc-store`), the OSM-API client (`osc-api`), and the Adiff Builder
//! and Transition Extractor (`osc-pipeline`).

#![forbid(unsafe_code)]

pub use osc_api::{ApiError, ChangesetSummary, HttpOsmApiClient, OsmApiClient, UserSummary};
pub use osc_core::{ChangeMeta, ContextStrength, Decimicro, Geometry, Member, OsmObject, RegionLocator, Tags, TagKindMatcher, Variant};
pub use osc_pipeline::{
    ActionKind, AdiffBuilder, BuilderError, ChangeRecord, ExtractError, TransitionExtractor, TransitionRow,
};
pub use osc_store::{StoreTables, StoredObject, WatchedObjectStore};
