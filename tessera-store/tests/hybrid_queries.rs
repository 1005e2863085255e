//! Hybrid versus direct query execution.

use proptest::prelude::*;
use tessera_test_utils::fixtures::*;
use tessera_test_utils::*;

use tessera_core::BackendError;

async fn seed(fixture: &Fixture, names: &[&str]) {
    let mut records: Vec<Gadget> = names
        .iter()
        .enumerate()
        .map(|(i, name)| gadget(i as i64 + 1, name))
        .collect();
    fixture.store.put_multi(&mut records).await.unwrap();
}

#[tokio::test]
async fn test_warm_hybrid_query_skips_backend_fetch() {
    let fixture = fixture_store();
    seed(&fixture, &["e", "a", "d", "b", "c"]).await;
    fixture.backend.reset();

    let query = Query::new(Gadget::KIND).order_asc("name");
    let page = fixture.store.all::<Gadget>(&query).await.unwrap();
    assert_eq!(page.len(), 5);
    assert_eq!(fixture.backend.query_calls(), 1);
    assert_eq!(fixture.backend.get_calls(), 0);
}

#[tokio::test]
async fn test_cold_hybrid_query_fetches_once() {
    let fixture = fixture_store();
    seed(&fixture, &["e", "a", "d"]).await;
    fixture.store.flush_local();
    fixture.store.flush_shared().await.unwrap();
    fixture.backend.reset();

    let page = fixture
        .store
        .all::<Gadget>(&Query::new(Gadget::KIND).order_desc("name"))
        .await
        .unwrap();
    let names: Vec<&str> = page.records.iter().map(|g| g.name.as_str()).collect();
    assert_eq!(names, vec!["e", "d", "a"]);
    assert_eq!(fixture.backend.get_calls(), 1);
    assert_eq!(fixture.backend.fetched().len(), 3);
}

#[tokio::test]
async fn test_single_result_query_runs_direct() {
    let fixture = fixture_store();
    seed(&fixture, &["b", "a"]).await;
    fixture.backend.reset();

    let first = fixture
        .store
        .first::<Gadget>(&Query::new(Gadget::KIND).order_asc("name"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.name, "a");
    assert_eq!(fixture.backend.get_calls(), 0);
    assert_eq!(fixture.shared.get_calls(), 0);
}

#[tokio::test]
async fn test_hybrid_drops_keys_missing_on_fetch() {
    let fixture = fixture_store();
    seed(&fixture, &["a", "b", "c"]).await;
    fixture.store.flush_local();
    fixture.store.flush_shared().await.unwrap();
    fixture.data().fail_key(
        gadget_key(2),
        BackendError::NotFound {
            key: gadget_key(2),
        },
    );

    let query = Query::new(Gadget::KIND).order_asc("name");
    let page = fixture.store.all::<Gadget>(&query).await.unwrap();
    assert_eq!(page.keys, vec![gadget_key(1), gadget_key(3)]);
    assert_eq!(page.records.len(), 2);
}

#[tokio::test]
async fn test_projected_query_decodes_partial_records() {
    let fixture = fixture_store();
    seed(&fixture, &["x", "y"]).await;
    fixture.backend.reset();

    let page = fixture
        .store
        .all::<Gadget>(&Query::new(Gadget::KIND).project(["name"]).order_asc("name"))
        .await
        .unwrap();
    assert_eq!(fixture.backend.get_calls(), 0);
    assert_eq!(page.records[0].name, "x");
    assert_eq!(page.records[0].id, 1);
}

#[tokio::test]
async fn test_distinct_projection() {
    let fixture = fixture_store();
    seed(&fixture, &["dup", "dup", "solo"]).await;

    let query = Query::new(Gadget::KIND).project(["name"]).distinct();
    let page = fixture.store.all::<Gadget>(&query).await.unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(fixture.store.count(&query).await.unwrap(), 2);
}

#[tokio::test]
async fn test_cursor_string_round_trip() {
    let fixture = fixture_store();
    seed(&fixture, &["a", "b", "c", "d", "e"]).await;

    let base = Query::new(Gadget::KIND).order_asc("name");
    let first = fixture.store.all::<Gadget>(&base.limit(3)).await.unwrap();
    let token = first.cursor.to_string();

    let rest = fixture.store.all::<Gadget>(&base.start(&token)).await.unwrap();
    let names: Vec<&str> = rest.records.iter().map(|g| g.name.as_str()).collect();
    assert_eq!(names, vec!["d", "e"]);

    let err = fixture
        .store
        .all::<Gadget>(&base.start("%%%"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("start"));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_hybrid_matches_direct(
        names in prop::collection::vec("[a-e]{1,2}", 0..20),
        threshold in "[a-e]",
        descending in any::<bool>(),
        limit in prop::option::of(2usize..8),
        offset in 0usize..4,
        flush in any::<bool>(),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let fixture = fixture_store();
            if !names.is_empty() {
                let refs: Vec<&str> = names.iter().map(String::as_str).collect();
                seed(&fixture, &refs).await;
            }
            if flush {
                fixture.store.flush_local();
            }

            let mut query = Query::new(Gadget::KIND)
                .filter("name", FilterOp::Ge, threshold.as_str())
                .offset(offset);
            query = if descending { query.order_desc("name") } else { query.order_asc("name") };
            if let Some(limit) = limit {
                query = query.limit(limit);
            }

            let hybrid = fixture.store.all::<Gadget>(&query).await.unwrap();
            let direct = fixture
                .store
                .with_policy(CachePolicy::no_cache())
                .all::<Gadget>(&query)
                .await
                .unwrap();
            prop_assert_eq!(&hybrid.keys, &direct.keys);
            prop_assert_eq!(&hybrid.records, &direct.records);
            prop_assert_eq!(&hybrid.cursor, &direct.cursor);
            Ok(())
        })?;
    }
}
