use aqueduct::config::ProviderConfig;
use aqueduct::credentials::CredentialPool;
use aqueduct::engine::{dispatch_with_rotation, SendOutcome, UpstreamStatus};
use std::cell::RefCell;
use std::collections::VecDeque;

#[derive(Debug)]
struct FakeResponse {
    status: u16,
}

impl UpstreamStatus for FakeResponse {
    fn status_code(&self) -> u16 {
        self.status
    }
}

fn config_with(keys: &[&str]) -> ProviderConfig {
    ProviderConfig::new("https://api.example.com/v1", "test-model").with_keys(keys.iter().copied())
}

/// Runs the rotation loop against a scripted status sequence, recording
/// which key each attempt used.
async fn run_script(
    pool: &mut CredentialPool,
    config: &mut ProviderConfig,
    statuses: &[u16],
) -> (aqueduct::Result<SendOutcome<FakeResponse>>, Vec<String>) {
    let script = RefCell::new(statuses.iter().copied().collect::<VecDeque<_>>());
    let tried = RefCell::new(Vec::new());
    let outcome = dispatch_with_rotation(pool, config, |key| {
        tried.borrow_mut().push(key);
        let status = script
            .borrow_mut()
            .pop_front()
            .expect("script ran out of responses");
        async move { Ok(FakeResponse { status }) }
    })
    .await;
    (outcome, tried.into_inner())
}

#[tokio::test]
async fn rate_limits_rotate_through_pool_and_pin_the_winner() {
    let mut pool = CredentialPool::new();
    let mut config = config_with(&["A", "B", "C"]);

    let (outcome, tried) = run_script(&mut pool, &mut config, &[429, 429, 200]).await;

    match outcome.unwrap() {
        SendOutcome::Success { key_index, .. } => assert_eq!(key_index, 2),
        other => panic!("expected success, got {:?}", other),
    }
    assert_eq!(tried, vec!["A", "B", "C"]);
    assert_eq!(pool.usage_index(&config), 2);

    // Both rate-limited keys sit in quarantine with a ~24h window.
    for key in ["A", "B"] {
        let expiry = pool.blacklist_expiry(key).expect("key must be quarantined");
        let remaining = expiry - chrono::Utc::now();
        assert!(remaining > chrono::Duration::hours(23));
        assert!(remaining <= chrono::Duration::hours(24));
    }
    assert!(pool.blacklist_expiry("C").is_none());
}

#[tokio::test]
async fn invalid_key_is_removed_permanently() {
    let mut pool = CredentialPool::new();
    let mut config = config_with(&["A", "B"]);

    let (outcome, tried) = run_script(&mut pool, &mut config, &[400, 200]).await;

    assert!(matches!(outcome.unwrap(), SendOutcome::Success { .. }));
    assert_eq!(tried, vec!["A", "B"]);
    assert_eq!(config.api_keys.len(), 1);
    assert_eq!(config.api_keys.get(0), Some("B"));
    assert_eq!(pool.usage_index(&config), 0);

    // A later cycle with the same config never offers the removed key.
    let (outcome, tried) = run_script(&mut pool, &mut config, &[200]).await;
    assert!(matches!(outcome.unwrap(), SendOutcome::Success { .. }));
    assert_eq!(tried, vec!["B"]);
}

#[tokio::test]
async fn exhausted_pool_returns_last_response_instead_of_erroring() {
    let mut pool = CredentialPool::new();
    let mut config = config_with(&["A"]);

    let (outcome, tried) = run_script(&mut pool, &mut config, &[429]).await;

    match outcome.unwrap() {
        SendOutcome::Exhausted { response } => assert_eq!(response.status_code(), 429),
        other => panic!("expected exhaustion, got {:?}", other),
    }
    assert_eq!(tried, vec!["A"]);
    assert!(pool.blacklist_expiry("A").is_some());
}

#[tokio::test]
async fn non_rotating_status_returns_immediately() {
    let mut pool = CredentialPool::new();
    let mut config = config_with(&["A", "B"]);

    let (outcome, tried) = run_script(&mut pool, &mut config, &[500]).await;

    match outcome.unwrap() {
        SendOutcome::Rejected { response } => assert_eq!(response.status_code(), 500),
        other => panic!("expected rejection, got {:?}", other),
    }
    // No rotation on a 500: one attempt, nothing quarantined or removed.
    assert_eq!(tried, vec!["A"]);
    assert_eq!(config.api_keys.len(), 2);
    assert!(pool.blacklist_expiry("A").is_none());
}

#[tokio::test]
async fn no_usable_key_is_a_config_error() {
    let mut pool = CredentialPool::new();
    let mut config = ProviderConfig::new("https://api.example.com/v1", "test-model");

    let (outcome, tried) = run_script(&mut pool, &mut config, &[]).await;

    let err = outcome.unwrap_err();
    assert!(matches!(err.inner, aqueduct::AqueductError::Config(_)));
    assert!(tried.is_empty());
}

#[tokio::test]
async fn loop_terminates_when_every_key_fails() {
    let mut pool = CredentialPool::new();
    let mut config = config_with(&["A", "B", "C"]);

    let (outcome, tried) = run_script(&mut pool, &mut config, &[429, 400, 429]).await;

    assert!(matches!(outcome.unwrap(), SendOutcome::Exhausted { .. }));
    // Bounded by the key list: each key attempted exactly once.
    assert_eq!(tried, vec!["A", "B", "C"]);
    assert_eq!(config.api_keys.len(), 2);
}
