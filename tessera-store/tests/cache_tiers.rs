//! Tier precedence, promotion and shared expiration.

use std::time::Duration;

use tessera_test_utils::fixtures::*;
use tessera_test_utils::*;

#[tokio::test]
async fn test_local_hit_skips_shared_and_backend() {
    let fixture = fixture_store();
    fixture.store.put(&mut gadget(1, "a")).await.unwrap();
    fixture.backend.reset();
    fixture.shared.reset();

    let got = fixture.store.get::<Gadget>(&gadget_key(1)).await.unwrap();
    assert_eq!(got.unwrap().name, "a");
    assert_eq!(fixture.shared.get_calls(), 0);
    assert_eq!(fixture.backend.get_calls(), 0);
}

#[tokio::test]
async fn test_shared_hit_is_promoted_when_write_local() {
    let fixture = fixture_store();
    fixture.store.put(&mut gadget(1, "a")).await.unwrap();
    fixture.store.flush_local();
    fixture.shared.reset();

    let entries = fixture
        .store
        .get_entries::<Gadget>(&[gadget_key(1)])
        .await
        .unwrap();
    assert_eq!(entries[0].state.source, Some(Source::Shared));
    assert_eq!(fixture.shared.get_calls(), 1);
    assert_eq!(fixture.backend.get_calls(), 0);

    let entries = fixture
        .store
        .get_entries::<Gadget>(&[gadget_key(1)])
        .await
        .unwrap();
    assert_eq!(entries[0].state.source, Some(Source::Local));
    assert_eq!(fixture.shared.get_calls(), 1);
}

#[tokio::test]
async fn test_shared_hit_is_not_promoted_without_write_local() {
    let fixture = fixture_store();
    fixture.store.put(&mut gadget(1, "a")).await.unwrap();
    fixture.store.flush_local();
    fixture.shared.reset();

    let no_promote = fixture
        .store
        .with_policy(CachePolicy::default().without(CacheFlags::WRITE_LOCAL));
    no_promote.get::<Gadget>(&gadget_key(1)).await.unwrap();
    fixture.store.get::<Gadget>(&gadget_key(1)).await.unwrap();
    assert_eq!(fixture.shared.get_calls(), 2);
    assert_eq!(fixture.backend.get_calls(), 0);
}

#[tokio::test]
async fn test_backend_read_populates_both_tiers() {
    let fixture = fixture_store();
    fixture.store.put(&mut gadget(1, "a")).await.unwrap();
    fixture.store.flush_local();
    fixture.store.flush_shared().await.unwrap();

    let entries = fixture
        .store
        .get_entries::<Gadget>(&[gadget_key(1)])
        .await
        .unwrap();
    assert_eq!(entries[0].state.source, Some(Source::Backend));
    assert!(fixture.shared.inner().contains(&fixture.cache_key(&gadget_key(1))));
    assert_eq!(fixture.store.local_stats().entry_count, 1);
}

#[tokio::test]
async fn test_mixed_tiers_in_one_batch() {
    let fixture = fixture_store();
    let mut records: Vec<Gadget> = (1..=3).map(|i| gadget(i, &format!("g{i}"))).collect();
    fixture.store.put_multi(&mut records).await.unwrap();

    // 1 stays local, 2 only shared, 3 only in the backend
    fixture.store.flush_local();
    fixture.store.get::<Gadget>(&gadget_key(1)).await.unwrap();
    fixture
        .shared
        .delete_multi(&[fixture.cache_key(&gadget_key(3))])
        .await
        .unwrap();
    fixture.backend.reset();
    fixture.shared.reset();

    let keys = [gadget_key(1), gadget_key(2), gadget_key(3)];
    let entries = fixture.store.get_entries::<Gadget>(&keys).await.unwrap();
    let sources: Vec<_> = entries.iter().map(|e| e.state.source).collect();
    assert_eq!(
        sources,
        vec![Some(Source::Local), Some(Source::Shared), Some(Source::Backend)]
    );
    assert_eq!(
        fixture.shared.requested(),
        vec![fixture.cache_key(&gadget_key(2)), fixture.cache_key(&gadget_key(3))]
    );
    assert_eq!(fixture.backend.fetched(), vec![gadget_key(3)]);
}

#[tokio::test]
async fn test_shared_tier_outage_is_a_miss() {
    init_test_tracing();
    let fixture = fixture_store();
    fixture.shared.inner().set_unavailable(true);

    let key = fixture.store.put(&mut gadget(1, "a")).await.unwrap();
    fixture.store.flush_local();
    let got = fixture.store.get::<Gadget>(&key).await.unwrap();
    assert_eq!(got.unwrap().name, "a");
    assert_eq!(fixture.backend.get_calls(), 1);

    fixture.store.delete(&key).await.unwrap();
    assert!(fixture.store.get::<Gadget>(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn test_corrupt_shared_payload_is_a_miss() {
    let fixture = fixture_store();
    let key = fixture.store.put(&mut gadget(1, "a")).await.unwrap();
    fixture.store.flush_local();
    fixture
        .shared
        .set_multi(vec![CacheItem {
            key: fixture.cache_key(&key),
            value: b"not a payload".to_vec(),
            ttl: None,
        }])
        .await
        .unwrap();
    fixture.backend.reset();

    let entries = fixture.store.get_entries::<Gadget>(&[key]).await.unwrap();
    assert_eq!(entries[0].state.source, Some(Source::Backend));
    assert_eq!(entries[0].value.name, "a");
    assert_eq!(fixture.backend.get_calls(), 1);
}

#[tokio::test]
async fn test_no_cache_policy_bypasses_tiers() {
    let fixture = fixture_store();
    let bypass = fixture.store.with_policy(CachePolicy::no_cache());
    let key = bypass.put(&mut gadget(1, "a")).await.unwrap();
    assert_eq!(fixture.shared.set_calls(), 0);
    assert!(!fixture.shared.inner().contains(&fixture.cache_key(&key)));

    bypass.get::<Gadget>(&key).await.unwrap();
    bypass.get::<Gadget>(&key).await.unwrap();
    assert_eq!(fixture.backend.get_calls(), 2);
    assert_eq!(fixture.shared.get_calls(), 0);
}

#[tokio::test]
async fn test_put_with_expiration_override() {
    let fixture = fixture_store();
    fixture
        .store
        .put_with_expiration(&mut [gadget(1, "a")], SharedExpiration::After(Duration::from_secs(30)))
        .await
        .unwrap();
    let written = fixture.shared.written();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].ttl, Some(Duration::from_secs(30)));

    fixture
        .store
        .put_with_expiration(&mut [gadget(2, "b")], SharedExpiration::DoNotCache)
        .await
        .unwrap();
    assert!(!fixture.shared.inner().contains(&fixture.cache_key(&gadget_key(2))));
    assert_eq!(fixture.shared.written().len(), 1);
}

#[tokio::test]
async fn test_policy_do_not_cache_beats_override() {
    let fixture = fixture_store();
    let policy = CachePolicy::default().with_expiration(SharedExpiration::DoNotCache);
    fixture
        .store
        .with_policy(policy)
        .put_with_expiration(&mut [gadget(1, "a")], SharedExpiration::After(Duration::from_secs(30)))
        .await
        .unwrap();
    assert!(!fixture.shared.inner().contains(&fixture.cache_key(&gadget_key(1))));

    // still cached locally
    fixture.backend.reset();
    fixture.store.get::<Gadget>(&gadget_key(1)).await.unwrap();
    assert_eq!(fixture.backend.get_calls(), 0);
}

#[tokio::test]
async fn test_policy_expiration_applies_without_override() {
    let fixture = fixture_store();
    let policy =
        CachePolicy::default().with_expiration(SharedExpiration::After(Duration::from_secs(5)));
    fixture
        .store
        .with_policy(policy)
        .put(&mut gadget(1, "a"))
        .await
        .unwrap();
    assert_eq!(fixture.shared.written()[0].ttl, Some(Duration::from_secs(5)));
}

#[tokio::test]
async fn test_configured_default_ttl_applies_to_tier_default_writes() {
    let fixture = fixture_store_with(
        StoreConfig::default().with_shared_default_ttl(Duration::from_millis(1)),
    );
    fixture.store.put(&mut gadget(1, "a")).await.unwrap();
    assert_eq!(fixture.shared.written()[0].ttl, Some(Duration::from_millis(1)));

    // an explicit expiration still wins
    fixture
        .store
        .put_with_expiration(&mut [gadget(2, "b")], SharedExpiration::After(Duration::from_secs(30)))
        .await
        .unwrap();
    assert_eq!(fixture.shared.written()[1].ttl, Some(Duration::from_secs(30)));

    std::thread::sleep(Duration::from_millis(20));
    assert!(!fixture.shared.inner().contains(&fixture.cache_key(&gadget_key(1))));
    assert!(fixture.shared.inner().contains(&fixture.cache_key(&gadget_key(2))));
}

#[tokio::test]
async fn test_skipped_shared_write_invalidates_stale_entry() {
    let fixture = fixture_store();
    fixture.store.put(&mut gadget(1, "old")).await.unwrap();
    assert!(fixture.shared.inner().contains(&fixture.cache_key(&gadget_key(1))));

    fixture
        .store
        .put_with_expiration(&mut [gadget(1, "new")], SharedExpiration::DoNotCache)
        .await
        .unwrap();
    assert!(!fixture.shared.inner().contains(&fixture.cache_key(&gadget_key(1))));
}

#[tokio::test]
async fn test_cache_version_isolates_entries() {
    let fixture = fixture_store();
    let v2 = fixture_store_with(StoreConfig::default().with_cache_version(2));
    assert_ne!(
        fixture.cache_key(&gadget_key(1)),
        v2.cache_key(&gadget_key(1))
    );
}
