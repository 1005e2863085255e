//! Tessera Test Utilities
//!
//! Shared test infrastructure for the tessera workspace:
//! - Fixture record types covering every codec field shape
//! - A fixture store wired to the in-memory backend and both cache tiers
//! - Counting wrappers that record backend and shared-tier round trips
//! - Proptest generators and custom assertions

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

// Re-export core and store types for convenience
pub use tessera_core::{
    Blob, CacheFlags, CachePolicy, Cursor, FilterOp, Key, KeyState, MultiError, Property, Query,
    QueryMode, Record, Schema, SharedExpiration, Source, StoreConfig, Structure, TesseraError,
    TesseraResult, TransactionOptions, Value,
};
pub use tessera_store::{
    Backend, BackendTransaction, CacheItem, CacheKeyer, CacheStats, ItemResult, MemoryBackend,
    MemorySharedCache, QueryCursor, SharedCache, Store,
};

// ============================================================================
// FIXTURE RECORDS
// ============================================================================

/// Nested value type written as `dims.width` / `dims.height`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dimensions {
    pub width: f64,
    pub height: f64,
}

impl Structure for Dimensions {
    fn describe(s: &mut Schema<Self>) {
        s.field("width", |d| &d.width, |d| &mut d.width);
        s.field("height", |d| &d.height, |d| &mut d.height);
    }
}

/// Repeated nested value type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Part {
    pub name: String,
    pub qty: i64,
}

impl Structure for Part {
    fn describe(s: &mut Schema<Self>) {
        s.field("name", |p| &p.name, |p| &mut p.name).indexed();
        s.field("qty", |p| &p.qty, |p| &mut p.qty);
    }
}

/// Record exercising every field shape: numeric id under a `Shelf`
/// parent, indexed scalars, repeated values, nesting, maps and blobs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Widget {
    pub id: i64,
    pub shelf: i64,
    pub name: String,
    pub created: DateTime<Utc>,
    pub tags: Vec<String>,
    pub dims: Dimensions,
    pub parts: Vec<Part>,
    pub attrs: BTreeMap<String, String>,
    pub payload: Blob,
    pub price: f64,
    pub active: bool,
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
        s.field("payload", |w| &w.payload, |w| &mut w.payload);
        s.field("price", |w| &w.price, |w| &mut w.price).indexed();
        s.field("active", |w| &w.active, |w| &mut w.active).indexed();
    }
}

impl Record for Widget {
    const KIND: &'static str = "Widget";
}

/// Minimal record: numeric id, indexed name, optional creation time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Gadget {
    pub id: i64,
    pub name: String,
    pub created: DateTime<Utc>,
}

impl Structure for Gadget {
    fn describe(s: &mut Schema<Self>) {
        s.numeric_id(|g| &g.id, |g| &mut g.id);
        s.field("name", |g| &g.name, |g| &mut g.name).indexed();
        s.field("created", |g| &g.created, |g| &mut g.created).omit_empty();
    }
}

impl Record for Gadget {
    const KIND: &'static str = "Gadget";
}

/// Record keyed by a text identifier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Label {
    pub code: String,
    pub text: String,
    pub uses: i64,
}

impl Structure for Label {
    fn describe(s: &mut Schema<Self>) {
        s.text_id(|l| &l.code, |l| &mut l.code);
        s.field("text", |l| &l.text, |l| &mut l.text);
        s.field("uses", |l| &l.uses, |l| &mut l.uses).indexed();
    }
}

impl Record for Label {
    const KIND: &'static str = "Label";
}

// ============================================================================
// COUNTING WRAPPERS
// ============================================================================

/// [`Backend`] wrapper that records every batched round trip.
///
/// Transactions are delegated untouched and not counted.
#[derive(Default)]
pub struct CountingBackend {
    inner: MemoryBackend,
    get_calls: AtomicUsize,
    put_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    query_calls: AtomicUsize,
    fetched: Mutex<Vec<Key>>,
}

impl CountingBackend {
    pub fn new(inner: MemoryBackend) -> Self {
        Self {
            inner,
            ..Default::default()
        }
    }

    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    /// Every key requested through `get_multi`, in call order.
    pub fn fetched(&self) -> Vec<Key> {
        self.fetched.lock().clone()
    }

    pub fn reset(&self) {
        self.get_calls.store(0, Ordering::SeqCst);
        self.put_calls.store(0, Ordering::SeqCst);
        self.delete_calls.store(0, Ordering::SeqCst);
        self.query_calls.store(0, Ordering::SeqCst);
        self.fetched.lock().clear();
    }
}

#[async_trait]
impl Backend for CountingBackend {
    async fn get_multi(&self, keys: &[Key]) -> TesseraResult<Vec<ItemResult<Vec<Property>>>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.fetched.lock().extend_from_slice(keys);
        self.inner.get_multi(keys).await
    }

    async fn put_multi(
        &self,
        keys: &[Key],
        entities: Vec<Vec<Property>>,
    ) -> TesseraResult<Vec<ItemResult<Key>>> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.put_multi(keys, entities).await
    }

    async fn delete_multi(&self, keys: &[Key]) -> TesseraResult<Vec<ItemResult<()>>> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.delete_multi(keys).await
    }

    async fn run_query(&self, query: &Query) -> TesseraResult<Box<dyn QueryCursor>> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.run_query(query).await
    }

    async fn begin_transaction(
        &self,
        options: TransactionOptions,
    ) -> TesseraResult<Box<dyn BackendTransaction>> {
        self.inner.begin_transaction(options).await
    }
}

/// [`SharedCache`] wrapper that records every bulk call.
#[derive(Default)]
pub struct CountingSharedCache {
    inner: MemorySharedCache,
    get_calls: AtomicUsize,
    set_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    requested: Mutex<Vec<String>>,
    written: Mutex<Vec<CacheItem>>,
}

impl CountingSharedCache {
    pub fn new(inner: MemorySharedCache) -> Self {
        Self {
            inner,
            ..Default::default()
        }
    }

    pub fn inner(&self) -> &MemorySharedCache {
        &self.inner
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn set_calls(&self) -> usize {
        self.set_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    /// Every cache key requested through `get_multi`, in call order.
    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().clone()
    }

    /// Every item handed to `set_multi`, in call order.
    pub fn written(&self) -> Vec<CacheItem> {
        self.written.lock().clone()
    }

    pub fn reset(&self) {
        self.get_calls.store(0, Ordering::SeqCst);
        self.set_calls.store(0, Ordering::SeqCst);
        self.delete_calls.store(0, Ordering::SeqCst);
        self.requested.lock().clear();
        self.written.lock().clear();
    }
}

#[async_trait]
impl SharedCache for CountingSharedCache {
    async fn get_multi(
        &self,
        keys: &[String],
    ) -> TesseraResult<std::collections::HashMap<String, Vec<u8>>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.requested.lock().extend_from_slice(keys);
        self.inner.get_multi(keys).await
    }

    async fn set_multi(&self, items: Vec<CacheItem>) -> TesseraResult<()> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        self.written.lock().extend(items.iter().cloned());
        self.inner.set_multi(items).await
    }

    async fn delete_multi(&self, keys: &[String]) -> TesseraResult<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.delete_multi(keys).await
    }

    async fn flush(&self) -> TesseraResult<()> {
        self.inner.flush().await
    }

    async fn stats(&self) -> TesseraResult<CacheStats> {
        self.inner.stats().await
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Ready-made stores and records.

    use super::*;
    use chrono::TimeZone;

    /// A store plus handles on every collaborator behind it.
    pub struct Fixture {
        pub store: Store,
        pub backend: Arc<CountingBackend>,
        pub shared: Arc<CountingSharedCache>,
    }

    impl Fixture {
        /// The underlying in-memory data, bypassing every cache tier.
        pub fn data(&self) -> &MemoryBackend {
            self.backend.inner()
        }

        /// Shared-tier cache key for `key` under the fixture config.
        pub fn cache_key(&self, key: &Key) -> String {
            CacheKeyer::from_config(self.store.config()).key(key)
        }
    }

    /// Store over a counting in-memory backend with an LRU local tier and
    /// a counting in-memory shared tier.
    pub fn fixture_store() -> Fixture {
        fixture_store_with(StoreConfig::default())
    }

    pub fn fixture_store_with(config: StoreConfig) -> Fixture {
        let backend = Arc::new(CountingBackend::new(MemoryBackend::new()));
        let shared = Arc::new(CountingSharedCache::new(MemorySharedCache::new()));
        let store = match Store::new(backend.clone(), config) {
            Ok(store) => store.with_shared_cache(shared.clone()),
            Err(err) => panic!("fixture config rejected: {err}"),
        };
        Fixture {
            store,
            backend,
            shared,
        }
    }

    pub fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0)
            .single()
            .unwrap_or_default()
    }

    /// A fully populated widget on shelf 1.
    pub fn sample_widget(id: i64) -> Widget {
        let mut attrs = BTreeMap::new();
        attrs.insert("color".to_string(), "red".to_string());
        Widget {
            id,
            shelf: 1,
            name: format!("widget-{id}"),
            created: fixed_time(),
            tags: vec!["new".to_string(), "sale".to_string()],
            dims: Dimensions {
                width: 2.5,
                height: 4.0,
            },
            parts: vec![
                Part {
                    name: "bolt".to_string(),
                    qty: 4,
                },
                Part {
                    name: "nut".to_string(),
                    qty: 4,
                },
            ],
            attrs,
            payload: Blob(vec![0xde, 0xad, 0xbe, 0xef]),
            price: 9.99,
            active: true,
        }
    }

    pub fn gadget(id: i64, name: &str) -> Gadget {
        Gadget {
            id,
            name: name.to_string(),
            created: DateTime::<Utc>::default(),
        }
    }

    pub fn gadget_key(id: i64) -> Key {
        Key::numeric(Gadget::KIND, id, None)
    }

    pub fn shelf_key(id: i64) -> Key {
        Key::numeric("Shelf", id, None)
    }

    pub fn widget_key(id: i64) -> Key {
        Key::numeric(Widget::KIND, id, Some(shelf_key(1)))
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for keys and fixture records.

    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    pub fn arb_kind() -> impl Strategy<Value = String> {
        "[A-Z][a-z]{2,8}"
    }

    /// A complete root key with a numeric or text id.
    pub fn arb_root_key() -> impl Strategy<Value = Key> {
        (arb_kind(), prop_oneof![
            (1i64..1_000_000).prop_map(Ok::<i64, String>),
            "[a-z0-9_-]{1,12}".prop_map(Err::<i64, String>),
        ])
            .prop_map(|(kind, id)| match id {
                Ok(n) => Key::numeric(kind, n, None),
                Err(s) => Key::text(kind, s, None),
            })
    }

    /// A complete key up to three levels deep.
    pub fn arb_key() -> impl Strategy<Value = Key> {
        arb_root_key().prop_recursive(2, 3, 1, |parent| {
            (parent, arb_kind(), 1i64..1_000_000)
                .prop_map(|(parent, kind, id)| Key::numeric(kind, id, Some(parent)))
        })
    }

    pub fn arb_timestamp() -> impl Strategy<Value = DateTime<Utc>> {
        (0i64..4_000_000_000).prop_map(|secs| Utc.timestamp_opt(secs, 0).single().unwrap_or_default())
    }

    pub fn arb_part() -> impl Strategy<Value = Part> {
        ("[a-z]{1,8}", 0i64..100).prop_map(|(name, qty)| Part { name, qty })
    }

    pub fn arb_widget() -> impl Strategy<Value = Widget> {
        (
            (1i64..1_000_000, 1i64..100, "[a-z ]{0,16}", arb_timestamp()),
            prop::collection::vec("[a-z]{1,6}", 0..4),
            (0.0f64..1000.0, 0.0f64..1000.0),
            prop::collection::vec(arb_part(), 0..3),
            prop::collection::btree_map("[a-z]{1,6}", "[a-z]{0,6}", 0..3),
            prop::collection::vec(any::<u8>(), 0..16),
            (0.0f64..100.0, any::<bool>()),
        )
            .prop_map(
                |((id, shelf, name, created), tags, (width, height), parts, attrs, payload, (price, active))| Widget {
                    id,
                    shelf,
                    name,
                    created,
                    tags,
                    dims: Dimensions { width, height },
                    parts,
                    attrs,
                    payload: Blob(payload),
                    price,
                    active,
                },
            )
    }

    pub fn arb_gadget() -> impl Strategy<Value = Gadget> {
        (1i64..1_000_000, "[a-z]{1,10}", arb_timestamp())
            .prop_map(|(id, name, created)| Gadget { id, name, created })
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for tessera error shapes.

    use super::*;

    /// Assert that a result is an aggregate whose failing slots are exactly
    /// `indices`.
    #[track_caller]
    pub fn assert_failed_indices<T: std::fmt::Debug>(result: &TesseraResult<T>, indices: &[usize]) {
        match result {
            Err(TesseraError::Multi(multi)) => {
                let failed: Vec<usize> = multi
                    .errors()
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| e.is_some())
                    .map(|(i, _)| i)
                    .collect();
                assert_eq!(failed, indices, "unexpected failing indices in {multi:?}");
            }
            other => panic!("Expected Multi error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_key_error<T: std::fmt::Debug>(result: &TesseraResult<T>) {
        match result {
            Err(TesseraError::Key(_)) => {}
            other => panic!("Expected Key error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_conflict<T: std::fmt::Debug>(result: &TesseraResult<T>) {
        match result {
            Err(err) if err.is_conflict() => {}
            other => panic!("Expected Conflict, got: {:?}", other),
        }
    }

    /// Assert that `keys` are in input order and complete.
    #[track_caller]
    pub fn assert_complete_keys(keys: &[Key]) {
        for (i, key) in keys.iter().enumerate() {
            assert!(key.is_complete(), "key {i} is incomplete: {key}");
        }
    }
}

// ============================================================================
// TRACING
// ============================================================================

/// Install a test-friendly subscriber honoring `RUST_LOG`. Safe to call
/// from every test.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
