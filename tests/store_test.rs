use aqueduct::config::ProviderConfig;
use aqueduct::credentials::CredentialPool;
use aqueduct::store::{MemoryStore, PipelineStore, SqliteStore};
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;

#[tokio::test]
async fn sqlite_blacklist_round_trips_with_millis_precision() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(dir.path().join("pipeline.db")).await.unwrap();

    let expiry = Utc::now() + Duration::hours(24);
    let mut map = HashMap::new();
    map.insert("sk-alpha".to_string(), expiry);
    map.insert("sk-beta".to_string(), expiry - Duration::hours(1));
    store.save_blacklist(map).await.unwrap();

    let loaded = store.load_blacklist().await.unwrap();
    assert_eq!(loaded.len(), 2);
    assert_eq!(
        loaded["sk-alpha"].timestamp_millis(),
        expiry.timestamp_millis()
    );
}

#[tokio::test]
async fn sqlite_save_replaces_previous_blacklist() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(dir.path().join("pipeline.db")).await.unwrap();

    let mut first = HashMap::new();
    first.insert("old".to_string(), Utc::now() + Duration::hours(1));
    store.save_blacklist(first).await.unwrap();

    let mut second = HashMap::new();
    second.insert("new".to_string(), Utc::now() + Duration::hours(2));
    store.save_blacklist(second).await.unwrap();

    let loaded = store.load_blacklist().await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert!(loaded.contains_key("new"));
}

#[tokio::test]
async fn sqlite_configs_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(dir.path().join("pipeline.db")).await.unwrap();

    let mut config = ProviderConfig::new("https://api.example.com/v1", "gpt-4o")
        .with_keys(["sk-a", "sk-b"]);
    config.temperature = Some(0.7);
    config.system_prompt = Some("be brief".into());

    store.save_configs(vec![config.clone()]).await.unwrap();
    let loaded = store.load_configs().await.unwrap();
    assert_eq!(loaded, vec![config.clone()]);

    // Saving the same id again upserts rather than duplicating.
    config.model_name = "gpt-4o-mini".into();
    store.save_configs(vec![config.clone()]).await.unwrap();
    let loaded = store.load_configs().await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].model_name, "gpt-4o-mini");
}

#[tokio::test]
async fn pool_hydrates_blacklist_from_store() {
    let store = Arc::new(MemoryStore::new());
    let mut map = HashMap::new();
    map.insert("sk-quarantined".to_string(), Utc::now() + Duration::hours(12));
    store.save_blacklist(map).await.unwrap();

    let mut pool = CredentialPool::with_store(store);
    pool.hydrate().await;

    assert!(pool.is_blacklisted("sk-quarantined"));
    assert!(!pool.is_blacklisted("sk-fresh"));
}
