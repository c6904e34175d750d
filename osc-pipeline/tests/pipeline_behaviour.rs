//! End-to-end scenarios covering the full osmChange -> adiff ->
//! transition-row pipeline, per spec.md §8 "End-to-end scenarios".

use std::io::Cursor;

use osc_core::{RegionLocator, TagKindMatcher};
use osc_pipeline::{AdiffBuilder, TransitionExtractor};
use osc_api::test_support::FakeOsmApiClient;
use osc_store::WatchedObjectStore;
use tempfile::TempDir;

fn matcher(rules: &str) -> TagKindMatcher {
    TagKindMatcher::load(Cursor::new(rules.to_owned())).expect("valid rule file")
}

fn open_store() -> (TempDir, WatchedObjectStore) {
    let dir = TempDir::new().expect("temp dir");
    let store = WatchedObjectStore::open(dir.path().join("store.sqlite3")).expect("open store");
    (dir, store)
}

#[test]
fn simple_node_create_flows_through_to_a_transition_row() {
    let m = matcher("node amenity amenity\n");
    let region = RegionLocator::empty();
    let (_dir, store) = open_store();
    let api = FakeOsmApiClient::default();
    let builder = AdiffBuilder::new(&m, &region, &store, &api);

    let osc = br#"<osmChange version="0.6">
        <create><node id="1" version="1" changeset="5" uid="9" user="mapper" timestamp="2020-06-01 12:00:00+00" lat="51.5" lon="-0.1"><tag k="amenity" v="cafe"/></node></create>
    </osmChange>"#;
    let mut adiff = Vec::new();
    builder.process_osc(Cursor::new(&osc[..]), &mut adiff).expect("build adiff");
    let adiff_xml = String::from_utf8(adiff).expect("utf8 adiff");
    assert!(adiff_xml.contains("<action type=\"create\">"));

    let extractor = TransitionExtractor::new(&m, &region);
    let rows = extractor.extract(&adiff_xml).expect("extract rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].kind, "amenity");
    assert_eq!(rows[0].action, "create");
    assert_eq!(rows[0].osm_id, "node/1");
}

#[test]
fn maxspeed_value_change_is_reported_as_modify() {
    let m = matcher("way maxspeed maxspeed\n");
    let region = RegionLocator::empty();
    let (_dir, store) = open_store();
    let api = FakeOsmApiClient::default();

    let create_osc = br#"<osmChange version="0.6">
        <create><way id="10" version="1" changeset="1" uid="1" user="a" timestamp="t1">
            <nd ref="1"/><nd ref="2"/><tag k="maxspeed" v="50"/>
        </way></create>
    </osmChange>"#;
    {
        let builder = AdiffBuilder::new(&m, &region, &store, &api);
        let mut adiff = Vec::new();
        builder.process_osc(Cursor::new(&create_osc[..]), &mut adiff).expect("seed way");
    }

    let modify_osc = br#"<osmChange version="0.6">
        <modify><way id="10" version="2" changeset="2" uid="1" user="a" timestamp="t2">
            <nd ref="1"/><nd ref="2"/><tag k="maxspeed" v="60"/>
        </way></modify>
    </osmChange>"#;
    let builder = AdiffBuilder::new(&m, &region, &store, &api);
    let mut adiff = Vec::new();
    builder.process_osc(Cursor::new(&modify_osc[..]), &mut adiff).expect("build modify adiff");
    let adiff_xml = String::from_utf8(adiff).expect("utf8 adiff");

    let extractor = TransitionExtractor::new(&m, &region);
    let rows = extractor.extract(&adiff_xml).expect("extract rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].action, "modify");
    assert_eq!(rows[0].kind, "maxspeed");
}

#[test]
fn object_outside_every_region_is_dropped() {
    let m = matcher("node amenity amenity\n");
    let region_csv = vec![vec![
        "far_away".to_owned(),
        hex::encode(wkb_polygon_far_away()),
    ]];
    let region = RegionLocator::load(region_csv).expect("load region");
    let (_dir, store) = open_store();
    let api = FakeOsmApiClient::default();
    let builder = AdiffBuilder::new(&m, &region, &store, &api);

    let osc = br#"<osmChange version="0.6">
        <create><node id="1" version="1" changeset="1" uid="1" user="a" timestamp="t" lat="0.0" lon="0.0"><tag k="amenity" v="cafe"/></node></create>
    </osmChange>"#;
    let mut adiff = Vec::new();
    builder.process_osc(Cursor::new(&osc[..]), &mut adiff).expect("build adiff");
    let adiff_xml = String::from_utf8(adiff).expect("utf8 adiff");
    assert!(!adiff_xml.contains("<action"));
}

/// A small square far from the origin, so an origin-coordinate node
/// never falls inside it.
fn wkb_polygon_far_away() -> Vec<u8> {
    use std::io::Write as _;
    let mut buf = Vec::new();
    buf.push(1u8); // little-endian
    buf.extend_from_slice(&3u32.to_le_bytes()); // wkbPolygon
    buf.extend_from_slice(&1u32.to_le_bytes()); // one ring
    buf.extend_from_slice(&5u32.to_le_bytes()); // five points, closed ring
    let ring: [(f64, f64); 5] = [
        (40.0, 40.0),
        (40.0, 41.0),
        (41.0, 41.0),
        (41.0, 40.0),
        (40.0, 40.0),
    ];
    for (x, y) in ring {
        let _ = buf.write_all(&x.to_le_bytes());
        let _ = buf.write_all(&y.to_le_bytes());
    }
    buf
}

mod hex {
    pub fn encode(bytes: Vec<u8>) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}
