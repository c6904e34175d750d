//! Adiff Builder and Transition Extractor: the two pipeline stages that
//! turn an osmChange stream into tag-kind transition rows.

mod adiff_reader;
mod adiff_xml;
mod builder;
mod change;
mod transition;

pub use adiff_reader::{AdiffReadError, Bounds, NdRef, ParsedAction, ParsedBody};
pub use builder::{AdiffBuilder, BuilderError};
pub use change::{ActionKind, ChangeError, ChangeRecord, decompress, read_osm_change};
pub use transition::{ExtractError, TransitionExtractor, TransitionRow};
