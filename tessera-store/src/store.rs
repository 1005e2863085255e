//! Store facade: cached, batched reads and writes of typed records.
//!
//! A [`Store`] ties a [`Backend`] to the two cache tiers. Reads go local
//! tier, then shared tier, then backend; writes go to the backend first
//! and then populate the tiers. Inside a transaction the store view reads
//! straight from the transaction and buffers every cache effect until
//! commit.

use std::sync::Arc;

use tracing::warn;

use tessera_core::{
    codec, encode_payload, BatchLimits, CachePolicy, Codec, Identity, Key, KeyError, KeyState,
    MultiError, Operation, Property, Record, SharedExpiration, Source, StoreConfig, TesseraError,
    TesseraResult,
};

use crate::backend::{Backend, BackendTransaction};
use crate::batch::{check_complete, BatchExecutor, Written};
use crate::cache::{
    CacheHit, CacheKeyer, CacheLayer, CacheStats, CacheWrite, DirectCache, LocalCache,
    LruLocalCache, SharedCache,
};
use crate::entry::Entry;

/// Per-key cache policy override. Returning `None` keeps the store policy.
pub type KeyPolicy = dyn Fn(&Key) -> Option<CachePolicy> + Send + Sync;

/// Cached, batched access to one backend.
///
/// Cloning is cheap; clones share the backend and both cache tiers.
#[derive(Clone)]
pub struct Store {
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) txn: Option<Arc<dyn BackendTransaction>>,
    pub(crate) cache: Arc<dyn CacheLayer>,
    pub(crate) direct: Arc<DirectCache>,
    pub(crate) config: Arc<StoreConfig>,
    pub(crate) policy: CachePolicy,
    pub(crate) key_policy: Option<Arc<KeyPolicy>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("config", &self.config)
            .field("policy", &self.policy)
            .field("in_transaction", &self.in_transaction())
            .field("shared_tier", &self.direct.has_shared())
            .finish()
    }
}

impl Store {
    /// A store with an LRU local tier sized from `config` and no shared tier.
    pub fn new(backend: Arc<dyn Backend>, config: StoreConfig) -> TesseraResult<Self> {
        config.validate()?;
        let local: Arc<dyn LocalCache> = Arc::new(LruLocalCache::new(config.local_capacity));
        let direct = Arc::new(
            DirectCache::new(local, None, CacheKeyer::from_config(&config))
                .with_default_ttl(config.shared_default_ttl),
        );
        Ok(Self {
            backend,
            txn: None,
            cache: direct.clone(),
            direct,
            policy: config.policy,
            config: Arc::new(config),
            key_policy: None,
        })
    }

    fn with_direct(mut self, direct: DirectCache) -> Self {
        let direct = Arc::new(direct);
        self.cache = direct.clone();
        self.direct = direct;
        self
    }

    /// Attach a shared tier.
    pub fn with_shared_cache(self, shared: Arc<dyn SharedCache>) -> Self {
        let direct = (*self.direct).clone().with_shared(shared);
        self.with_direct(direct)
    }

    /// Replace the local tier.
    pub fn with_local_cache(self, local: Arc<dyn LocalCache>) -> Self {
        let direct = (*self.direct).clone().with_local(local);
        self.with_direct(direct)
    }

    /// A view of this store using `policy` for every operation.
    pub fn with_policy(&self, policy: CachePolicy) -> Store {
        Store {
            policy,
            ..self.clone()
        }
    }

    /// A view of this store consulting `f` for each key's policy.
    pub fn with_key_policy<F>(&self, f: F) -> Store
    where
        F: Fn(&Key) -> Option<CachePolicy> + Send + Sync + 'static,
    {
        Store {
            key_policy: Some(Arc::new(f)),
            ..self.clone()
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    pub fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    /// The policy in force for `key`.
    pub fn effective_policy(&self, key: &Key) -> CachePolicy {
        self.key_policy
            .as_ref()
            .and_then(|f| f(key))
            .unwrap_or(self.policy)
    }

    pub fn flush_local(&self) {
        self.direct.flush_local();
    }

    pub async fn flush_shared(&self) -> TesseraResult<()> {
        self.direct.flush_shared().await
    }

    pub fn local_stats(&self) -> CacheStats {
        self.direct.local_stats()
    }

    /// Shared tier counters, or `None` without a shared tier.
    pub async fn shared_stats(&self) -> TesseraResult<Option<CacheStats>> {
        self.direct.shared_stats().await
    }

    pub(crate) fn backend(&self) -> &dyn Backend {
        match &self.txn {
            Some(txn) => txn.backend(),
            None => self.backend.as_ref(),
        }
    }

    pub(crate) fn executor(&self) -> BatchExecutor<'_> {
        let limits: BatchLimits = self.config.batch;
        BatchExecutor::new(self.backend(), limits)
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Read `keys`, reporting the outcome of each one.
    ///
    /// Only precondition and whole-call failures are returned as `Err`;
    /// per-key failures are left on each entry's state.
    pub async fn get_entries<R: Record>(&self, keys: &[Key]) -> TesseraResult<Vec<Entry<R>>> {
        check_complete(Operation::Get, keys)?;
        let codec = codec::<R>()?;
        self.fetch(&codec, keys, None).await
    }

    /// Read `keys`. Missing entities are `None`; any other per-key failure
    /// fails the call with a [`MultiError`].
    pub async fn get_multi<R: Record>(&self, keys: &[Key]) -> TesseraResult<Vec<Option<R>>> {
        let entries = self.get_entries::<R>(keys).await?;
        let errors = entries.iter().map(|e| e.state.error.clone()).collect();
        if let Some(multi) = MultiError::from_slots(errors) {
            return Err(multi.into());
        }
        Ok(entries.into_iter().map(Entry::into_value).collect())
    }

    /// Read one key.
    pub async fn get<R: Record>(&self, key: &Key) -> TesseraResult<Option<R>> {
        let entry = single(self.get_entries::<R>(std::slice::from_ref(key)).await?)?;
        match entry.state.error {
            Some(err) => Err(err),
            None => Ok(entry.into_value()),
        }
    }

    /// The key `record` would be stored under.
    pub fn key_for<R: Record>(&self, record: &R) -> TesseraResult<Key> {
        Ok(codec::<R>()?.key_of(record)?)
    }

    pub(crate) async fn fetch<R: Record>(
        &self,
        codec: &Codec<R>,
        keys: &[Key],
        expected_kind: Option<&str>,
    ) -> TesseraResult<Vec<Entry<R>>> {
        let policies: Vec<CachePolicy> = keys.iter().map(|k| self.effective_policy(k)).collect();
        let mut entries: Vec<Option<Entry<R>>> = (0..keys.len()).map(|_| None).collect();

        let hits = self.cache.read(keys, &policies).await;
        for (i, hit) in hits.into_iter().enumerate() {
            let key = &keys[i];
            match hit {
                Some(CacheHit::Local(value)) => {
                    if let Some(record) = value.downcast_ref::<R>() {
                        entries[i] = Some(Entry::found(
                            key.clone(),
                            record.clone(),
                            KeyState::cached(Source::Local),
                        ));
                    }
                }
                Some(CacheHit::Shared(bytes)) => {
                    match tessera_core::decode_payload(&bytes)
                        .map_err(TesseraError::from)
                        .and_then(|properties| decode_record(codec, key, properties))
                    {
                        Ok(record) => {
                            if policies[i].write_local() {
                                self.cache.promote(key, Arc::new(record.clone()));
                            }
                            entries[i] =
                                Some(Entry::found(key.clone(), record, KeyState::cached(Source::Shared)));
                        }
                        Err(err) => {
                            warn!(operation = "decode", keys = 1, key = %key, error = %err, "discarding shared cache entry");
                        }
                    }
                }
                None => {}
            }
        }

        let misses: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_none())
            .map(|(i, _)| i)
            .collect();
        if misses.is_empty() {
            return Ok(entries.into_iter().flatten().collect());
        }

        let miss_keys: Vec<Key> = misses.iter().map(|&i| keys[i].clone()).collect();
        let outcome = self.executor().get(&miss_keys, expected_kind).await?;
        let populate = !self.cache.is_transactional();
        let mut writes = Vec::new();
        for (&i, fetched) in misses.iter().zip(outcome.items) {
            let key = keys[i].clone();
            let entry = match fetched.properties {
                Some(properties) => {
                    let payload = populate
                        .then(|| shared_payload(&properties, &key))
                        .flatten();
                    match decode_record(codec, &key, properties) {
                        Ok(record) => {
                            if populate {
                                writes.push(CacheWrite {
                                    key: key.clone(),
                                    record: Arc::new(record.clone()),
                                    payload,
                                    policy: policies[i],
                                    expiration: None,
                                });
                            }
                            Entry::found(key, record, fetched.state)
                        }
                        Err(err) => Entry::missing(key, KeyState::failed(err)),
                    }
                }
                None => Entry::missing(key, fetched.state),
            };
            entries[i] = Some(entry);
        }
        if !writes.is_empty() {
            self.cache.write(writes).await;
        }
        Ok(entries.into_iter().flatten().collect())
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Write `records`, reporting the outcome of each one.
    ///
    /// Successful records have their identifier (and parent) fields set to
    /// the stored key; incomplete keys receive a backend-allocated id.
    pub async fn put_entries<R: Record>(&self, records: &mut [R]) -> TesseraResult<Vec<Written>> {
        self.write_records(records, false, None).await
    }

    /// Write `records` and return their keys; any per-key failure fails
    /// the call with a [`MultiError`].
    pub async fn put_multi<R: Record>(&self, records: &mut [R]) -> TesseraResult<Vec<Key>> {
        written_keys(self.write_records(records, false, None).await?)
    }

    /// Like [`Store::put_multi`], but every record must already carry a
    /// complete key.
    pub async fn put_complete_multi<R: Record>(&self, records: &mut [R]) -> TesseraResult<Vec<Key>> {
        written_keys(self.write_records(records, true, None).await?)
    }

    /// Like [`Store::put_multi`], with a shared-tier expiration that
    /// overrides the policy value for this call.
    pub async fn put_with_expiration<R: Record>(
        &self,
        records: &mut [R],
        expiration: SharedExpiration,
    ) -> TesseraResult<Vec<Key>> {
        written_keys(self.write_records(records, false, Some(expiration)).await?)
    }

    /// Write one record.
    pub async fn put<R: Record>(&self, record: &mut R) -> TesseraResult<Key> {
        let written = single(
            self.write_records(std::slice::from_mut(record), false, None)
                .await?,
        )?;
        match written.state.error {
            Some(err) => Err(err),
            None => Ok(written.key),
        }
    }

    async fn write_records<R: Record>(
        &self,
        records: &mut [R],
        require_complete: bool,
        expiration: Option<SharedExpiration>,
    ) -> TesseraResult<Vec<Written>> {
        if records.is_empty() {
            return Err(KeyError::NoKeys {
                operation: Operation::Put,
            }
            .into());
        }
        let codec = codec::<R>()?;
        // Save hooks may assign identifiers, so keys are derived after encoding.
        let entities = records
            .iter_mut()
            .map(|r| codec.encode(r))
            .collect::<TesseraResult<Vec<_>>>()?;
        let keys = records
            .iter()
            .map(|r| codec.key_of(r))
            .collect::<Result<Vec<_>, _>>()?;
        // The backend only allocates numeric ids.
        if matches!(codec.capabilities().identity, Identity::Text { .. }) {
            if let Some((index, key)) = keys.iter().enumerate().find(|(_, k)| !k.is_complete()) {
                return Err(KeyError::IncompleteKey {
                    operation: Operation::Put,
                    index,
                    key: key.clone(),
                }
                .into());
            }
        }
        let payloads: Vec<Option<Vec<u8>>> = entities
            .iter()
            .zip(&keys)
            .map(|(properties, key)| shared_payload(properties, key))
            .collect();

        let outcome = self
            .executor()
            .put(&keys, entities, require_complete)
            .await?;

        let mut writes = Vec::new();
        let mut reports = Vec::with_capacity(records.len());
        for ((record, mut written), payload) in records.iter_mut().zip(outcome.items).zip(payloads) {
            if written.state.is_ok() {
                match codec.set_key(record, &written.key) {
                    Ok(()) => writes.push(CacheWrite {
                        key: written.key.clone(),
                        record: Arc::new(record.clone()),
                        payload,
                        policy: self.effective_policy(&written.key),
                        expiration,
                    }),
                    Err(err) => written.state = KeyState::failed(err.into()),
                }
            }
            reports.push(written);
        }
        if !writes.is_empty() {
            self.cache.write(writes).await;
        }
        Ok(reports)
    }

    // ========================================================================
    // DELETES
    // ========================================================================

    /// Delete `keys` from the backend and from both tiers.
    ///
    /// The tiers are invalidated even when the backend call fails.
    pub async fn delete_multi(&self, keys: &[Key]) -> TesseraResult<()> {
        check_complete(Operation::Delete, keys)?;
        let result = self.executor().delete(keys).await;
        self.cache.delete(keys).await;
        result
    }

    pub async fn delete(&self, key: &Key) -> TesseraResult<()> {
        self.delete_multi(std::slice::from_ref(key)).await
    }
}

fn single<T>(items: Vec<T>) -> TesseraResult<T> {
    items.into_iter().next().ok_or_else(|| {
        tessera_core::BackendError::Internal {
            reason: "batch returned no result".to_string(),
        }
        .into()
    })
}

fn written_keys(reports: Vec<Written>) -> TesseraResult<Vec<Key>> {
    let errors = reports.iter().map(|w| w.state.error.clone()).collect();
    if let Some(multi) = MultiError::from_slots(errors) {
        return Err(multi.into());
    }
    Ok(reports.into_iter().map(|w| w.key).collect())
}

pub(crate) fn decode_record<R: Record>(
    codec: &Codec<R>,
    key: &Key,
    properties: Vec<Property>,
) -> TesseraResult<R> {
    let mut record = codec.decode(properties)?;
    codec.set_key(&mut record, key)?;
    Ok(record)
}

fn shared_payload(properties: &[Property], key: &Key) -> Option<Vec<u8>> {
    match encode_payload(properties) {
        Ok(payload) => Some(payload),
        Err(err) => {
            warn!(operation = "encode", keys = 1, key = %key, error = %err, "skipping shared cache write");
            None
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemorySharedCache;
    use crate::memory::MemoryBackend;
    use tessera_core::{BackendError, CacheFlags, Schema, Structure};

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Note {
        id: i64,
        body: String,
    }

    impl Structure for Note {
        fn describe(s: &mut Schema<Self>) {
            s.numeric_id(|n| &n.id, |n| &mut n.id);
            s.field("body", |n| &n.body, |n| &mut n.body).indexed();
        }
    }

    impl Record for Note {
        const KIND: &'static str = "Note";
    }

    #[derive(Debug, Clone, Default)]
    struct Faceless {
        body: String,
    }

    impl Structure for Faceless {
        fn describe(s: &mut Schema<Self>) {
            s.field("body", |n| &n.body, |n| &mut n.body);
        }
    }

    impl Record for Faceless {
        const KIND: &'static str = "Faceless";
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Slug {
        code: String,
    }

    impl Structure for Slug {
        fn describe(s: &mut Schema<Self>) {
            s.text_id(|g| &g.code, |g| &mut g.code);
        }
    }

    impl Record for Slug {
        const KIND: &'static str = "Slug";
    }

    /// Takes its identifier from the body when saved.
    #[derive(Debug, Clone, Default, PartialEq)]
    struct Stamped {
        id: i64,
        body: String,
    }

    impl Structure for Stamped {
        fn describe(s: &mut Schema<Self>) {
            s.numeric_id(|n| &n.id, |n| &mut n.id);
            s.field("body", |n| &n.body, |n| &mut n.body);
        }
    }

    impl Record for Stamped {
        const KIND: &'static str = "Stamped";

        fn before_save(&mut self) -> TesseraResult<()> {
            if self.id == 0 {
                self.id = self.body.len() as i64;
            }
            Ok(())
        }
    }

    fn note(id: i64, body: &str) -> Note {
        Note {
            id,
            body: body.to_string(),
        }
    }

    fn setup() -> (Store, MemoryBackend, Arc<MemorySharedCache>) {
        let backend = MemoryBackend::new();
        let shared = Arc::new(MemorySharedCache::new());
        let store = Store::new(Arc::new(backend.clone()), StoreConfig::default())
            .unwrap()
            .with_shared_cache(shared.clone());
        (store, backend, shared)
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = StoreConfig::default().with_local_capacity(0);
        assert!(Store::new(Arc::new(MemoryBackend::new()), config).is_err());
    }

    #[tokio::test]
    async fn test_put_then_get_from_local_tier() {
        let (store, _, _) = setup();
        let mut n = note(1, "hello");
        let key = store.put(&mut n).await.unwrap();
        assert_eq!(key, Key::numeric("Note", 1, None));

        let entries = store.get_entries::<Note>(&[key]).await.unwrap();
        assert_eq!(entries[0].value, n);
        assert_eq!(entries[0].state.source, Some(Source::Local));
    }

    #[tokio::test]
    async fn test_put_assigns_id_to_incomplete_record() {
        let (store, backend, _) = setup();
        let mut n = note(0, "fresh");
        let key = store.put(&mut n).await.unwrap();
        assert!(key.is_complete());
        assert_eq!(Some(n.id), key.numeric_id());
        assert!(backend.contains(&key));
    }

    #[tokio::test]
    async fn test_record_without_identifier_is_rejected() {
        let (store, backend, _) = setup();
        let mut f = Faceless::default();
        let err = store.put(&mut f).await.unwrap_err();
        assert!(err
            .to_string()
            .contains("does not provide an identifier"));
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_empty_text_identifier_is_rejected_before_write() {
        let (store, backend, _) = setup();
        let err = store.put(&mut Slug::default()).await.unwrap_err();
        assert_eq!(
            err,
            TesseraError::Key(KeyError::IncompleteKey {
                operation: Operation::Put,
                index: 0,
                key: Key::text("Slug", "", None),
            })
        );
        assert!(backend.is_empty());

        let mut slugs = vec![
            Slug {
                code: "a".to_string(),
            },
            Slug::default(),
        ];
        assert!(matches!(
            store.put_multi(&mut slugs).await,
            Err(TesseraError::Key(KeyError::IncompleteKey { index: 1, .. }))
        ));
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_key_follows_identifier_set_by_save_hook() {
        let (store, backend, _) = setup();
        let mut stamped = Stamped {
            id: 0,
            body: "four".to_string(),
        };
        let key = store.put(&mut stamped).await.unwrap();
        assert_eq!(key, Key::numeric("Stamped", 4, None));
        assert_eq!(stamped.id, 4);
        assert!(backend.contains(&key));
        assert_eq!(store.get::<Stamped>(&key).await.unwrap(), Some(stamped));
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let (store, _, _) = setup();
        let got = store.get::<Note>(&Key::numeric("Note", 9, None)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_get_falls_back_to_shared_then_backend() {
        let (store, _, shared) = setup();
        let mut n = note(1, "tiered");
        let key = store.put(&mut n).await.unwrap();

        store.flush_local();
        let entry = store.get_entries::<Note>(&[key.clone()]).await.unwrap().remove(0);
        assert_eq!(entry.state.source, Some(Source::Shared));
        assert_eq!(entry.value, n);

        store.flush_local();
        shared.flush().await.unwrap();
        let entry = store.get_entries::<Note>(&[key]).await.unwrap().remove(0);
        assert_eq!(entry.state.source, Some(Source::Backend));
        assert!(entry.state.synced_at.is_some());
    }

    #[tokio::test]
    async fn test_no_cache_policy_reads_backend() {
        let (store, backend, _) = setup();
        let mut n = note(1, "cached");
        let key = store.put(&mut n).await.unwrap();
        backend
            .put_multi(
                &[key.clone()],
                vec![vec![Property::new("body", "changed").indexed()]],
            )
            .await
            .unwrap();

        let cached = store.get::<Note>(&key).await.unwrap().unwrap();
        assert_eq!(cached.body, "cached");

        let fresh = store
            .with_policy(CachePolicy::no_cache())
            .get::<Note>(&key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fresh.body, "changed");
    }

    #[tokio::test]
    async fn test_key_policy_overrides_store_policy() {
        let (store, _, shared) = setup();
        let local_only = Key::numeric("Note", 2, None);
        let selective = store.with_key_policy({
            let local_only = local_only.clone();
            move |k: &Key| (k == &local_only).then(|| CachePolicy::default().without(CacheFlags::WRITE_SHARED))
        });

        let mut notes = vec![note(1, "a"), note(2, "b")];
        selective.put_multi(&mut notes).await.unwrap();

        let keyer = CacheKeyer::default();
        assert!(shared.contains(&keyer.key(&Key::numeric("Note", 1, None))));
        assert!(!shared.contains(&keyer.key(&local_only)));
    }

    #[tokio::test]
    async fn test_per_key_put_failure_is_aggregated() {
        let (store, backend, _) = setup();
        let bad = Key::numeric("Note", 2, None);
        backend.fail_key(
            bad.clone(),
            BackendError::Item {
                key: bad.clone(),
                reason: "quota".to_string(),
            },
        );

        let mut notes = vec![note(1, "a"), note(2, "b"), note(3, "c")];
        let reports = store.put_entries(&mut notes).await.unwrap();
        assert!(reports[0].state.is_ok());
        assert!(reports[1].state.error.is_some());
        assert!(reports[2].state.is_ok());

        let err = store.put_multi(&mut notes).await.unwrap_err();
        let multi = err.as_multi().unwrap();
        assert_eq!(multi.failed(), 1);
        assert!(multi.get(1).is_some());
    }

    #[tokio::test]
    async fn test_delete_clears_caches() {
        let (store, backend, _) = setup();
        let mut n = note(1, "doomed");
        let key = store.put(&mut n).await.unwrap();

        store.delete(&key).await.unwrap();
        assert!(!backend.contains(&key));
        assert!(store.get::<Note>(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_key_for() {
        let (store, _, _) = setup();
        assert_eq!(
            store.key_for(&note(4, "x")).unwrap(),
            Key::numeric("Note", 4, None)
        );
        assert!(store.key_for(&Faceless::default()).is_err());
    }
}
