//! Errors emitted by the `osc` command-line interface.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced at the CLI seam, aggregating every sub-crate's error
/// type via `#[from]` (spec.md §4.8).
#[derive(Debug, Error)]
pub enum CliError {
    /// Provided arguments failed Clap validation.
    #[error(transparent)]
    ArgumentParsing(#[from] clap::Error),
    /// A referenced input path could not be opened.
    #[error("failed to open {path:?}: {source}")]
    OpenInput {
        /// The path that failed to open.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// A referenced output path could not be created.
    #[error("failed to create {path:?}: {source}")]
    CreateOutput {
        /// The path that failed to create.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// Loading the tag-rule file failed.
    #[error("failed to load tag rules from {path:?}: {source}")]
    LoadMatcher {
        /// The tag-rule file path.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: osc_core::MatcherError,
    },
    /// Loading the region file failed.
    #[error("failed to load regions from {path:?}: {source}")]
    LoadRegions {
        /// The region CSV path.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: osc_core::RegionError,
    },
    /// Reading the region CSV failed at the file level.
    #[error("failed to read region CSV at {path:?}: {source}")]
    ReadRegionCsv {
        /// The region CSV path.
        path: PathBuf,
        /// Underlying CSV error.
        #[source]
        source: csv::Error,
    },
    /// Opening the Watched-Object Store failed.
    #[error(transparent)]
    Store(#[from] osc_store::StoreError),
    /// Constructing the OSM API client failed.
    #[error(transparent)]
    Api(#[from] osc_api::ApiError),
    /// Building the augmented diff failed.
    #[error(transparent)]
    Builder(#[from] osc_pipeline::BuilderError),
    /// Extracting transition rows from an adiff failed.
    #[error(transparent)]
    Extract(#[from] osc_pipeline::ExtractError),
    /// Reading the initial PBF snapshot failed.
    #[error("failed to read PBF snapshot at {path:?}: {source}")]
    ReadPbf {
        /// The PBF file path.
        path: PathBuf,
        /// Underlying `osmpbf` error.
        #[source]
        source: osmpbf::Error,
    },
    /// Writing a transition CSV row failed.
    #[error("failed to write transition row: {0}")]
    WriteCsv(#[from] csv::Error),
}

impl CliError {
    /// Maps an error to the process exit code defined in spec.md §6.8.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::ArgumentParsing(_) => 2,
            _ => 1,
        }
    }
}
