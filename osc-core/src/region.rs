//! Region Locator: matches a point to a named region polygon.
//!
//! Grounded on the original `RegionFilter` (`filters.py`), which decodes
//! `(name, wkb_hex)` CSV rows into Shapely polygons and queries an
//! `STRtree`. Here the polygons are decoded with `geozero`'s WKB reader
//! into `geo::Geometry`, and candidates are pruned with an `rstar` R-tree
//! over bounding boxes before the exact `geo::Contains` check, matching
//! wildside-core's `rstar`-backed spatial index pattern.

use geo::{BoundingRect, Contains, Geometry, Point, Rect};
use geozero::ToGeo;
use geozero::wkb::Wkb;
use rstar::{AABB, RTree, RTreeObject};
use thiserror::Error;

/// Error loading region polygons (spec.md §4.1, "A malformed WKB aborts
/// load with a fatal error").
#[derive(Debug, Error)]
pub enum RegionError {
    /// A row did not contain `name, wkb_hex` at minimum.
    #[error("region row {row}: expected at least two columns")]
    MissingColumns {
        /// 1-based row number.
        row: usize,
    },
    /// The `wkb_hex` column was not valid hex.
    #[error("region row {row} ({name}): invalid WKB hex: {source}")]
    InvalidHex {
        /// 1-based row number.
        row: usize,
        /// Region name from the same row.
        name: String,
        /// Underlying hex-decode error.
        #[source]
        source: hex_error::HexError,
    },
    /// The decoded bytes were not valid WKB.
    #[error("region row {row} ({name}): invalid WKB: {source}")]
    InvalidWkb {
        /// 1-based row number.
        row: usize,
        /// Region name from the same row.
        name: String,
        /// Underlying decode error.
        #[source]
        source: geozero::error::GeozeroError,
    },
}

/// Minimal hex-decoding used only to surface a typed error; avoids adding
/// a dependency solely for this.
mod hex_error {
    use thiserror::Error;

    /// A hex string contained a non-hex character or had odd length.
    #[derive(Debug, Error)]
    #[error("invalid hex digit or odd length")]
    pub struct HexError;

    pub fn decode(input: &str) -> Result<Vec<u8>, HexError> {
        if input.len() % 2 != 0 {
            return Err(HexError);
        }
        let mut bytes = Vec::with_capacity(input.len() / 2);
        let chars: Vec<char> = input.chars().collect();
        for pair in chars.chunks(2) {
            let [hi, lo] = pair else {
                return Err(HexError);
            };
            let hi = hi.to_digit(16).ok_or(HexError)?;
            let lo = lo.to_digit(16).ok_or(HexError)?;
            #[allow(
                clippy::cast_possible_truncation,
                reason = "hi/lo are each < 16, product fits in u8"
            )]
            bytes.push(((hi << 4) | lo) as u8);
        }
        Ok(bytes)
    }
}

#[derive(Debug)]
struct RegionEntry {
    name: String,
    geometry: Geometry<f64>,
    envelope: AABB<[f64; 2]>,
    /// Insertion order, used to break ties between overlapping polygons
    /// (spec.md P5: the earlier-inserted region wins).
    order: usize,
}

impl RTreeObject for RegionEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// Matches points against a set of named region polygons loaded from a
/// `(name, wkb_hex)` CSV.
#[derive(Debug)]
pub struct RegionLocator {
    tree: Option<RTree<RegionEntry>>,
}

impl RegionLocator {
    /// Builds an empty locator that matches nothing.
    #[must_use]
    pub const fn empty() -> Self {
        Self { tree: None }
    }

    /// Loads regions from `(name, wkb_hex)` rows, in insertion order. Rows
    /// with fewer than two columns, unparseable hex, or invalid WKB are
    /// fatal, matching spec.md §4.1.
    pub fn load<I, S>(rows: I) -> Result<Self, RegionError>
    where
        I: IntoIterator<Item = Vec<S>>,
        S: AsRef<str>,
    {
        let mut entries = Vec::new();
        for (idx, row) in rows.into_iter().enumerate() {
            let row_number = idx + 1;
            if row.len() < 2 {
                return Err(RegionError::MissingColumns { row: row_number });
            }
            let name = row[0].as_ref().to_owned();
            let bytes =
                hex_error::decode(row[1].as_ref()).map_err(|source| RegionError::InvalidHex {
                    row: row_number,
                    name: name.clone(),
                    source,
                })?;
            let geometry = Wkb(bytes)
                .to_geo()
                .map_err(|source| RegionError::InvalidWkb {
                    row: row_number,
                    name: name.clone(),
                    source,
                })?;
            let envelope = geometry_envelope(&geometry);
            entries.push(RegionEntry {
                name,
                geometry,
                envelope,
                order: idx,
            });
        }
        if entries.is_empty() {
            return Ok(Self::empty());
        }
        Ok(Self {
            tree: Some(RTree::bulk_load(entries)),
        })
    }

    /// `true` when no regions were loaded; callers must treat the region
    /// field as absent.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match &self.tree {
            None => true,
            Some(tree) => tree.size() == 0,
        }
    }

    /// Returns the name of the first-inserted region containing `(lon,
    /// lat)`, or `None` if no region contains it (spec.md §4.1, P5).
    #[must_use]
    pub fn find(&self, lon: f64, lat: f64) -> Option<&str> {
        let tree = self.tree.as_ref()?;
        let point = Point::new(lon, lat);
        let query_envelope = AABB::from_point([lon, lat]);
        tree.locate_in_envelope_intersecting(&query_envelope)
            .filter(|entry| entry.geometry.contains(&point))
            .min_by_key(|entry| entry.order)
            .map(|entry| entry.name.as_str())
    }
}

fn geometry_envelope(geometry: &Geometry<f64>) -> AABB<[f64; 2]> {
    let rect: Rect<f64> = geometry
        .bounding_rect()
        .unwrap_or_else(|| Rect::new((0.0, 0.0), (0.0, 0.0)));
    AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y])
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{Geometry, LineString, Polygon};
    use geozero::{CoordDimensions, ToWkb};
    use rstest::rstest;

    fn square_wkb_hex(min: f64, max: f64) -> String {
        let exterior = LineString::from(vec![
            (min, min),
            (max, min),
            (max, max),
            (min, max),
            (min, min),
        ]);
        let polygon = Polygon::new(exterior, vec![]);
        let geometry = Geometry::Polygon(polygon);
        let bytes = geometry
            .to_wkb(CoordDimensions::xy())
            .expect("geometry encodes to wkb");
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    #[rstest]
    fn empty_locator_matches_nothing() {
        let locator = RegionLocator::empty();
        assert!(locator.is_empty());
        assert_eq!(locator.find(0.0, 0.0), None);
    }

    #[rstest]
    fn finds_containing_region() {
        let locator =
            RegionLocator::load(vec![vec!["square".to_owned(), square_wkb_hex(-1.0, 1.0)]])
                .expect("valid wkb");
        assert_eq!(locator.find(0.0, 0.0), Some("square"));
        assert_eq!(locator.find(5.0, 5.0), None);
    }

    #[rstest]
    fn earlier_inserted_region_wins_on_overlap() {
        let locator = RegionLocator::load(vec![
            vec!["first".to_owned(), square_wkb_hex(-2.0, 2.0)],
            vec!["second".to_owned(), square_wkb_hex(-1.0, 1.0)],
        ])
        .expect("valid wkb");
        assert_eq!(locator.find(0.0, 0.0), Some("first"));
    }

    #[rstest]
    fn malformed_hex_is_fatal() {
        let err = RegionLocator::load(vec![vec!["bad".to_owned(), "zz".to_owned()]]).unwrap_err();
        assert!(matches!(err, RegionError::InvalidHex { .. }));
    }

    #[rstest]
    fn missing_column_is_fatal() {
        let err: Result<RegionLocator, _> = RegionLocator::load(vec![vec!["only-name"]]);
        assert!(matches!(err.unwrap_err(), RegionError::MissingColumns { row: 1 }));
    }
}
