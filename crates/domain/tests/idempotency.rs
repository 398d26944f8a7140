use std::sync::Arc;
use std::time::Duration;

use pantau_domain::idempotency::{
    BeginOutcome, IdempotencyConfig, IdempotencyService, InMemoryIdempotencyStore,
};
use pantau_domain::ports::idempotency::IdempotencyKey;
use serde_json::json;

fn service(in_progress_ttl: Duration) -> IdempotencyService {
    IdempotencyService::new(
        Arc::new(InMemoryIdempotencyStore::new("test")),
        IdempotencyConfig {
            in_progress_ttl,
            completed_ttl: Duration::from_secs(60),
        },
    )
}

#[tokio::test]
async fn replay_returns_recorded_outcome() {
    let service = service(Duration::from_secs(60));

    let key = IdempotencyKey::new("validation_callback", "task-1");
    let outcome = service.begin(&key).await.unwrap();
    assert_eq!(outcome, BeginOutcome::Started);

    let recorded = json!({ "outcome": "approved" });
    service.complete(&key, recorded.clone()).await.unwrap();

    let replay = service.begin(&key).await.unwrap();
    assert_eq!(replay, BeginOutcome::Replay(recorded));
}

#[tokio::test]
async fn in_progress_claim_is_visible() {
    let service = service(Duration::from_secs(60));

    let key = IdempotencyKey::new("validation_callback", "task-2");
    assert_eq!(service.begin(&key).await.unwrap(), BeginOutcome::Started);
    assert_eq!(service.begin(&key).await.unwrap(), BeginOutcome::InProgress);
}

#[tokio::test]
async fn in_progress_expiry_allows_new_start() {
    let service = service(Duration::from_millis(10));

    let key = IdempotencyKey::new("validation_callback", "task-3");
    assert_eq!(service.begin(&key).await.unwrap(), BeginOutcome::Started);

    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(service.begin(&key).await.unwrap(), BeginOutcome::Started);
}

#[tokio::test]
async fn released_claim_can_be_taken_again() {
    let service = service(Duration::from_secs(60));

    let key = IdempotencyKey::new("validation_callback", "task-4");
    assert_eq!(service.begin(&key).await.unwrap(), BeginOutcome::Started);
    service.release(&key).await.unwrap();
    assert_eq!(service.begin(&key).await.unwrap(), BeginOutcome::Started);
}

#[tokio::test]
async fn scopes_do_not_collide() {
    let service = service(Duration::from_secs(60));

    let callback = IdempotencyKey::new("validation_callback", "shared");
    let other = IdempotencyKey::new("other_scope", "shared");
    assert_eq!(service.begin(&callback).await.unwrap(), BeginOutcome::Started);
    assert_eq!(service.begin(&other).await.unwrap(), BeginOutcome::Started);
}
