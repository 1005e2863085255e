use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{TimeZone, Utc};

use super::*;
use crate::error::TesseraError;

// =============================================================================
// FIXTURES
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
struct Dimensions {
    width: f64,
    height: f64,
}

impl Structure for Dimensions {
    fn describe(s: &mut Schema<Self>) {
        s.field("width", |d| &d.width, |d| &mut d.width);
        s.field("height", |d| &d.height, |d| &mut d.height);
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Part {
    name: String,
    qty: i64,
}

impl Structure for Part {
    fn describe(s: &mut Schema<Self>) {
        s.field("name", |p| &p.name, |p| &mut p.name).indexed();
        s.field("qty", |p| &p.qty, |p| &mut p.qty);
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Widget {
    id: i64,
    shelf: i64,
    name: String,
    created: chrono::DateTime<Utc>,
    tags: Vec<String>,
    dims: Dimensions,
    parts: Vec<Part>,
    attrs: BTreeMap<String, String>,
    payload: Blob,
    note: String,
}

impl Structure for Widget {
    fn describe(s: &mut Schema<Self>) {
        s.numeric_id(|w| &w.id, |w| &mut w.id);
        s.numeric_parent("Shelf", |w| &w.shelf, |w| &mut w.shelf);
        s.field("name", |w| &w.name, |w| &mut w.name).indexed();
        s.field("created", |w| &w.created, |w| &mut w.created).omit_empty();
        s.field("tags", |w| &w.tags, |w| &mut w.tags).indexed();
        s.nested("dims", |w| &w.dims, |w| &mut w.dims);
        s.nested_vec("parts", |w| &w.parts, |w| &mut w.parts);
        s.field("attrs", |w| &w.attrs, |w| &mut w.attrs);
        s.field("payload", |w| &w.payload, |w| &mut w.payload).indexed();
        s.field("note", |w| &w.note, |w| &mut w.note).index_omit_empty();
    }
}

impl Record for Widget {
    const KIND: &'static str = "Widget";
}

fn sample_widget() -> Widget {
    let mut attrs = BTreeMap::new();
    attrs.insert("color".to_string(), "red".to_string());
    Widget {
        id: 7,
        shelf: 2,
        name: "sprocket".to_string(),
        created: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        tags: vec!["a".to_string(), "b".to_string()],
        dims: Dimensions {
            width: 1.5,
            height: 2.0,
        },
        parts: vec![
            Part {
                name: "bolt".to_string(),
                qty: 4,
            },
            Part {
                name: "nut".to_string(),
                qty: 8,
            },
        ],
        attrs,
        payload: Blob(vec![1, 2, 3]),
        note: String::new(),
    }
}

fn find<'a>(props: &'a [Property], name: &str) -> Vec<&'a Property> {
    props.iter().filter(|p| p.name == name).collect()
}

// =============================================================================
// ENCODING
// =============================================================================

#[test]
fn test_encode_property_layout() {
    let codec = codec::<Widget>().unwrap();
    let props = codec.encode_fields(&sample_widget()).unwrap();

    let name = find(&props, "name");
    assert_eq!(name.len(), 1);
    assert!(name[0].indexed);
    assert!(!name[0].multi);

    let tags = find(&props, "tags");
    assert_eq!(tags.len(), 2);
    assert!(tags.iter().all(|p| p.multi && p.indexed));

    assert_eq!(find(&props, "dims.width")[0].value, Value::Float(1.5));
    assert!(!find(&props, "dims.width")[0].multi);

    let part_names = find(&props, "parts.name");
    assert_eq!(part_names.len(), 2);
    assert!(part_names.iter().all(|p| p.multi));
    assert_eq!(part_names[1].value, Value::Text("nut".into()));

    assert_eq!(find(&props, "attrs.color")[0].value, Value::Text("red".into()));

    let payload = find(&props, "payload");
    assert!(!payload[0].indexed, "bytes are never indexed");
    assert!(!payload[0].multi, "bytes are never repeated");
}

#[test]
fn test_encode_follows_declaration_order() {
    let codec = codec::<Widget>().unwrap();
    let props = codec.encode_fields(&sample_widget()).unwrap();
    let names: Vec<&str> = props.iter().map(|p| p.name.as_str()).collect();
    let position = |n: &str| names.iter().position(|x| *x == n).unwrap();

    assert!(position("name") < position("created"));
    assert!(position("created") < position("tags"));
    assert!(position("tags") < position("dims.width"));
    assert!(position("dims.height") < position("parts.name"));
    assert!(position("parts.qty") < position("attrs.color"));
}

#[test]
fn test_omit_empty_drops_zero_time() {
    let codec = codec::<Widget>().unwrap();
    let mut widget = sample_widget();
    widget.created = Default::default();
    let props = codec.encode_fields(&widget).unwrap();
    assert!(find(&props, "created").is_empty());
}

#[test]
fn test_index_omit_empty_keeps_property_unindexed() {
    let codec = codec::<Widget>().unwrap();
    let mut widget = sample_widget();
    let props = codec.encode_fields(&widget).unwrap();
    let note = find(&props, "note");
    assert_eq!(note.len(), 1);
    assert!(!note[0].indexed);

    widget.note = "fragile".to_string();
    let props = codec.encode_fields(&widget).unwrap();
    assert!(find(&props, "note")[0].indexed);
}

#[test]
fn test_identifier_fields_are_not_properties() {
    let codec = codec::<Widget>().unwrap();
    let names: Vec<&str> = codec.property_names().collect();
    assert!(!names.contains(&"id"));
    assert!(!names.contains(&"shelf"));
}

// =============================================================================
// DECODING
// =============================================================================

#[test]
fn test_roundtrip_restores_fields() {
    let codec = codec::<Widget>().unwrap();
    let widget = sample_widget();
    let props = codec.encode_fields(&widget).unwrap();
    let back = codec.decode_fields(props).unwrap();

    assert_eq!(back.name, widget.name);
    assert_eq!(back.created, widget.created);
    assert_eq!(back.tags, widget.tags);
    assert_eq!(back.dims, widget.dims);
    assert_eq!(back.parts, widget.parts);
    assert_eq!(back.attrs, widget.attrs);
    assert_eq!(back.payload, widget.payload);
    // identifiers come from the key, not from properties
    assert_eq!(back.id, 0);
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Line {
    sku: String,
    qty: i64,
}

impl Structure for Line {
    fn describe(s: &mut Schema<Self>) {
        s.field("sku", |l| &l.sku, |l| &mut l.sku);
        s.field("qty", |l| &l.qty, |l| &mut l.qty).omit_empty();
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Order {
    lines: Vec<Line>,
    total: i64,
}

impl Structure for Order {
    fn describe(s: &mut Schema<Self>) {
        s.nested_vec("lines", |o| &o.lines, |o| &mut o.lines);
        s.field("total", |o| &o.total, |o| &mut o.total);
    }
}

#[test]
fn test_zero_child_in_repeated_nested_keeps_alignment() {
    let codec = codec::<Order>().unwrap();
    let order = Order {
        lines: vec![
            Line {
                sku: "a".to_string(),
                qty: 0,
            },
            Line {
                sku: "b".to_string(),
                qty: 5,
            },
        ],
        total: 5,
    };
    let props = codec.encode_fields(&order).unwrap();
    assert_eq!(find(&props, "lines.qty").len(), 2);

    let back = codec.decode_fields(props).unwrap();
    assert_eq!(back, order);
}

#[test]
fn test_unknown_properties_are_ignored() {
    let codec = codec::<Widget>().unwrap();
    let props = vec![
        Property::new("name", "gear"),
        Property::new("retired_field", 99i64),
        Property::new("dims.depth", 3.0),
    ];
    let widget = codec.decode_fields(props).unwrap();
    assert_eq!(widget.name, "gear");
}

#[test]
fn test_mismatch_reported_after_draining() {
    let codec = codec::<Widget>().unwrap();
    let props = vec![
        Property::new("name", 3i64),
        Property::new("tags", "late"),
        Property::new("note", true),
    ];
    let mut widget = Widget::default();
    let err = codec.decode_into(&mut widget, props).unwrap_err();

    match err {
        CodecError::FieldMismatch {
            name,
            expected,
            found,
        } => {
            assert_eq!(name, "name");
            assert_eq!(expected, "text");
            assert_eq!(found, "int");
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(widget.tags, vec!["late".to_string()]);
}

// =============================================================================
// INLINE AND DUPLICATES
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
struct Framed {
    id: String,
    label: String,
    dims: Dimensions,
}

impl Structure for Framed {
    fn describe(s: &mut Schema<Self>) {
        s.text_id(|f| &f.id, |f| &mut f.id);
        s.field("label", |f| &f.label, |f| &mut f.label);
        s.nested("dims", |f| &f.dims, |f| &mut f.dims).inline();
    }
}

impl Record for Framed {
    const KIND: &'static str = "Framed";
}

#[test]
fn test_inline_nested_has_no_prefix() {
    let codec = codec::<Framed>().unwrap();
    let framed = Framed {
        id: "f1".to_string(),
        label: "x".to_string(),
        dims: Dimensions {
            width: 3.0,
            height: 4.0,
        },
    };
    let props = codec.encode_fields(&framed).unwrap();
    assert_eq!(find(&props, "width").len(), 1);
    assert!(find(&props, "dims.width").is_empty());
    assert_eq!(codec.decode_fields(props).unwrap().dims, framed.dims);
}

#[derive(Debug, Clone, Default)]
struct InlineClash {
    width: f64,
    dims: Dimensions,
}

impl Structure for InlineClash {
    fn describe(s: &mut Schema<Self>) {
        s.field("Width", |c| &c.width, |c| &mut c.width);
        s.nested("dims", |c| &c.dims, |c| &mut c.dims).inline();
    }
}

#[test]
fn test_duplicate_through_inline_is_case_insensitive() {
    match codec::<InlineClash>() {
        Err(CodecError::DuplicateProperty { name, .. }) => assert_eq!(name, "width"),
        other => panic!("expected duplicate, got {:?}", other.err()),
    }
}

// =============================================================================
// REGISTRATION FAILURES
// =============================================================================

#[derive(Debug, Clone, Default)]
struct BadName {
    value: i64,
}

impl Structure for BadName {
    fn describe(s: &mut Schema<Self>) {
        s.field("9-lives", |b| &b.value, |b| &mut b.value);
    }
}

#[derive(Debug, Clone, Default)]
struct WithPointer {
    maybe: Option<String>,
}

impl Structure for WithPointer {
    fn describe(s: &mut Schema<Self>) {
        s.field("maybe", |w| &w.maybe, |w| &mut w.maybe);
    }
}

#[derive(Debug, Clone, Default)]
struct IntKeyedMap {
    scores: BTreeMap<i64, String>,
}

impl Structure for IntKeyedMap {
    fn describe(s: &mut Schema<Self>) {
        s.field("scores", |m| &m.scores, |m| &mut m.scores);
    }
}

#[derive(Debug, Clone, Default)]
struct Grid {
    cells: Vec<Vec<i64>>,
}

impl Structure for Grid {
    fn describe(s: &mut Schema<Self>) {
        s.field("cells", |g| &g.cells, |g| &mut g.cells);
    }
}

#[derive(Debug, Clone, Default)]
struct Tagged {
    tags: Vec<String>,
}

impl Structure for Tagged {
    fn describe(s: &mut Schema<Self>) {
        s.field("tags", |t| &t.tags, |t| &mut t.tags);
    }
}

#[derive(Debug, Clone, Default)]
struct TaggedList {
    items: Vec<Tagged>,
}

impl Structure for TaggedList {
    fn describe(s: &mut Schema<Self>) {
        s.nested_vec("items", |t| &t.items, |t| &mut t.items);
    }
}

#[derive(Debug, Clone, Default)]
struct MapList {
    rows: Vec<BTreeMap<String, String>>,
}

impl Structure for MapList {
    fn describe(s: &mut Schema<Self>) {
        s.field("rows", |m| &m.rows, |m| &mut m.rows);
    }
}

#[test]
fn test_invalid_property_name() {
    assert!(matches!(
        codec::<BadName>(),
        Err(CodecError::InvalidFieldName { .. })
    ));
}

#[test]
fn test_pointer_field_rejected() {
    assert!(matches!(
        codec::<WithPointer>(),
        Err(CodecError::PointerField { .. })
    ));
}

#[test]
fn test_map_requires_string_keys() {
    assert!(matches!(
        codec::<IntKeyedMap>(),
        Err(CodecError::MapKeyNotString { .. })
    ));
}

#[test]
fn test_slice_of_slice_rejected() {
    assert!(matches!(codec::<Grid>(), Err(CodecError::SliceOfSlice { .. })));
    match codec::<TaggedList>() {
        Err(CodecError::SliceOfSlice { name, .. }) => assert_eq!(name, "items.tags"),
        other => panic!("expected slice of slice, got {:?}", other.err()),
    }
}

#[test]
fn test_repeated_map_is_unsupported() {
    let err = codec::<MapList>().err().unwrap();
    assert_eq!(err.to_string(), "unsupported field type for property \"rows\"");
}

#[test]
fn test_failed_registration_is_cached() {
    let first = codec::<Grid>().err();
    let second = codec::<Grid>().err();
    assert!(first.is_some());
    assert_eq!(first, second);
}

// =============================================================================
// RECURSION
// =============================================================================

#[derive(Debug, Clone, Default)]
struct Node {
    label: String,
    children: Vec<Node>,
}

impl Structure for Node {
    fn describe(s: &mut Schema<Self>) {
        s.field("label", |n| &n.label, |n| &mut n.label);
        s.nested_vec("children", |n| &n.children, |n| &mut n.children);
    }
}

#[derive(Debug, Clone, Default)]
struct Ping {
    pong: Box<Pong>,
}

#[derive(Debug, Clone, Default)]
struct Pong {
    pings: Vec<Ping>,
}

impl Structure for Ping {
    fn describe(s: &mut Schema<Self>) {
        s.nested("pong", |p| &*p.pong, |p| &mut *p.pong);
    }
}

impl Structure for Pong {
    fn describe(s: &mut Schema<Self>) {
        s.nested_vec("pings", |p| &p.pings, |p| &mut p.pings);
    }
}

#[test]
fn test_self_nesting_is_recursive() {
    assert!(matches!(
        codec::<Node>(),
        Err(CodecError::RecursiveStructure { .. })
    ));
}

#[test]
fn test_mutual_nesting_is_recursive() {
    assert!(matches!(
        codec::<Ping>(),
        Err(CodecError::RecursiveStructure { .. })
    ));
    assert!(codec::<Pong>().is_err());
}

// =============================================================================
// KEYS AND CAPABILITIES
// =============================================================================

#[derive(Debug, Clone, Default)]
struct Anonymous {
    value: i64,
}

impl Structure for Anonymous {
    fn describe(s: &mut Schema<Self>) {
        s.field("value", |a| &a.value, |a| &mut a.value);
    }
}

impl Record for Anonymous {
    const KIND: &'static str = "Anonymous";
}

#[derive(Debug, Clone, Default)]
struct TwoIds {
    a: i64,
    b: String,
}

impl Structure for TwoIds {
    fn describe(s: &mut Schema<Self>) {
        s.numeric_id(|t| &t.a, |t| &mut t.a);
        s.text_id(|t| &t.b, |t| &mut t.b);
    }
}

#[test]
fn test_key_of_builds_parent_first() {
    let codec = codec::<Widget>().unwrap();
    let key = codec.key_of(&sample_widget()).unwrap();
    assert_eq!(key, Key::numeric("Widget", 7, Some(Key::numeric("Shelf", 2, None))));

    let mut orphan = sample_widget();
    orphan.shelf = 0;
    orphan.id = 0;
    let key = codec.key_of(&orphan).unwrap();
    assert!(key.parent().is_none());
    assert!(!key.is_complete());
}

#[test]
fn test_missing_identifier() {
    let codec = codec::<Anonymous>().unwrap();
    let err = codec.key_of(&Anonymous::default()).unwrap_err();
    assert!(err.to_string().starts_with("value type \""));
    assert!(err.to_string().ends_with("does not provide an identifier"));
}

#[test]
fn test_set_key_writes_identifiers_back() {
    let codec = codec::<Widget>().unwrap();
    let mut widget = Widget::default();
    let key = Key::numeric("Widget", 41, Some(Key::numeric("Shelf", 9, None)));
    codec.set_key(&mut widget, &key).unwrap();
    assert_eq!(widget.id, 41);
    assert_eq!(widget.shelf, 9);

    let text = Key::text("Widget", "w", None);
    assert!(matches!(
        codec.set_key(&mut widget, &text),
        Err(KeyError::IdentifierMismatch { .. })
    ));
}

#[test]
fn test_conflicting_identity_rejected() {
    assert!(matches!(
        codec::<TwoIds>(),
        Err(CodecError::ConflictingCapability {
            capability: "identifier",
            ..
        })
    ));
}

// =============================================================================
// HOOKS
// =============================================================================

static AFTER_LOADS: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone, Default)]
struct Hooked {
    id: i64,
    name: String,
    saves: u32,
}

impl Structure for Hooked {
    fn describe(s: &mut Schema<Self>) {
        s.numeric_id(|h| &h.id, |h| &mut h.id);
        s.field("name", |h| &h.name, |h| &mut h.name);
    }
}

impl Record for Hooked {
    const KIND: &'static str = "Hooked";

    fn before_save(&mut self) -> TesseraResult<()> {
        if self.name == "reject" {
            return Err(CodecError::Hook {
                record: Self::KIND.to_string(),
                hook: "before_save",
                reason: "rejected".to_string(),
            }
            .into());
        }
        self.name = self.name.trim().to_string();
        Ok(())
    }

    fn after_save(&mut self) -> TesseraResult<()> {
        self.saves += 1;
        Ok(())
    }

    fn after_load(&mut self) -> TesseraResult<()> {
        AFTER_LOADS.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn test_hooks_wrap_encode() {
    let codec = codec::<Hooked>().unwrap();
    let mut hooked = Hooked {
        id: 1,
        name: "  padded ".to_string(),
        saves: 0,
    };
    let props = codec.encode(&mut hooked).unwrap();
    assert_eq!(props[0].value, Value::Text("padded".into()));
    assert_eq!(hooked.saves, 1);

    let mut rejected = Hooked {
        id: 2,
        name: "reject".to_string(),
        saves: 0,
    };
    let err = codec.encode(&mut rejected).unwrap_err();
    assert!(matches!(err, TesseraError::Codec(CodecError::Hook { .. })));
    assert_eq!(rejected.saves, 0);
}

#[test]
fn test_after_load_skipped_on_mismatch() {
    let codec = codec::<Hooked>().unwrap();
    let before = AFTER_LOADS.load(Ordering::SeqCst);
    assert!(codec.decode(vec![Property::new("name", 5i64)]).is_err());
    assert_eq!(AFTER_LOADS.load(Ordering::SeqCst), before);

    let loaded = codec.decode(vec![Property::new("name", "ok")]).unwrap();
    assert_eq!(loaded.name, "ok");
    assert!(AFTER_LOADS.load(Ordering::SeqCst) > before);
}

// =============================================================================
// PAYLOAD
// =============================================================================

#[test]
fn test_payload_keeps_every_value_type() {
    let props = vec![
        Property::new("n", Value::Null),
        Property::new("i", -4i64).indexed(),
        Property::new("f", 0.25),
        Property::new("b", true),
        Property::new("t", "text"),
        Property::new("x", Value::Bytes(vec![0, 255])),
        Property::new("d", Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap()),
        Property::new("k", Key::text("Shelf", "s", None)).multi(),
    ];
    let bytes = encode_payload(&props).unwrap();
    assert_eq!(decode_payload(&bytes).unwrap(), props);
}

#[test]
fn test_payload_rejects_garbage() {
    assert!(matches!(
        decode_payload(b"\x00\x01not json"),
        Err(CodecError::Payload { .. })
    ));
}

// =============================================================================
// PROPERTY TESTS
// =============================================================================

mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn part_strategy() -> impl Strategy<Value = Part> {
        ("[a-z]{1,8}", 1i64..1000).prop_map(|(name, qty)| Part { name, qty })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_widget_roundtrip(
            name in "[a-zA-Z0-9 ]{0,16}",
            tags in proptest::collection::vec("[a-z]{1,6}", 0..5),
            width in -1.0e6f64..1.0e6,
            parts in proptest::collection::vec(part_strategy(), 0..4),
            bytes in proptest::collection::vec(any::<u8>(), 0..16),
        ) {
            let codec = codec::<Widget>().unwrap();
            let widget = Widget {
                name,
                tags,
                dims: Dimensions { width, height: 1.0 },
                parts,
                payload: Blob(bytes),
                ..Default::default()
            };
            let props = codec.encode_fields(&widget).unwrap();
            let payload = encode_payload(&props).unwrap();
            let back = codec.decode_fields(decode_payload(&payload).unwrap()).unwrap();
            prop_assert_eq!(back, widget);
        }
    }
}
