use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use uuid::Uuid;

use outbox_relay::idempotency::{
    Idempotency, IdempotencyDecision, IdempotencyRecord, IdempotencyStore, InMemoryIdempotencyStore,
    StoredResponse,
};
use outbox_relay::lock::{with_lock, DistributedLock, InMemoryLock};
use outbox_relay::rate_limit::{InMemoryRateLimiter, RateLimiter};
use outbox_relay::{Clock, ManualClock, RelayError};

// =============================================================================
// Distributed lock
// =============================================================================

#[tokio::test]
async fn lock_excludes_second_holder_until_released() {
    let lock = InMemoryLock::new();

    let held = lock.acquire("sync:org-1", Duration::from_secs(30)).await.unwrap();
    assert_eq!(held.token.len(), 22);

    let err = lock.acquire("sync:org-1", Duration::from_secs(30)).await.unwrap_err();
    assert!(err.is_conflict());

    // Other keys are independent.
    lock.acquire("sync:org-2", Duration::from_secs(30)).await.unwrap();

    assert!(lock.release(&held).await.unwrap());
    let again = lock.acquire("sync:org-1", Duration::from_secs(30)).await.unwrap();
    assert_ne!(again.token, held.token);
}

#[tokio::test]
async fn expired_holder_cannot_release_new_owner() {
    let clock = ManualClock::fixed();
    let lock = InMemoryLock::with_clock(Arc::new(clock.clone()));

    let stale = lock.acquire("job", Duration::from_secs(10)).await.unwrap();
    clock.advance(Duration::from_secs(11));
    let current = lock.acquire("job", Duration::from_secs(10)).await.unwrap();

    assert!(!lock.release(&stale).await.unwrap());
    assert!(lock.is_held("job"));
    assert!(lock.release(&current).await.unwrap());
    assert!(!lock.is_held("job"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn only_one_concurrent_acquirer_wins() {
    let lock = InMemoryLock::new();
    let winners = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let lock = lock.clone();
        let winners = winners.clone();
        tasks.push(tokio::spawn(async move {
            match lock.acquire("migrate", Duration::from_secs(30)).await {
                Ok(_) => {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => assert!(e.is_conflict()),
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(winners.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn with_lock_releases_even_on_error() {
    let lock = InMemoryLock::new();

    let result: Result<(), RelayError> = with_lock(&lock, "job", Duration::from_secs(30), || async {
        Err(RelayError::Validation("boom".into()))
    })
    .await;
    assert!(matches!(result, Err(RelayError::Validation(_))));
    assert!(!lock.is_held("job"));

    let value = with_lock(&lock, "job", Duration::from_secs(30), || async { Ok(42) })
        .await
        .unwrap();
    assert_eq!(value, 42);
}

// =============================================================================
// Idempotency
// =============================================================================

#[tokio::test]
async fn completed_request_is_replayed() {
    let idempotency = Idempotency::new(Arc::new(InMemoryIdempotencyStore::new()));
    let org = Uuid::new_v4();
    let body = br#"{"title":"Replace filter"}"#;

    let first = idempotency.begin(org, "key-1", "POST /tasks", body).await.unwrap();
    assert_eq!(first, IdempotencyDecision::Execute);

    idempotency
        .complete(org, "key-1", "POST /tasks", &StoredResponse::new(201, br#"{"id":"t-1"}"#.to_vec()))
        .await
        .unwrap();

    let second = idempotency.begin(org, "key-1", "POST /tasks", body).await.unwrap();
    assert_eq!(
        second,
        IdempotencyDecision::Replay(StoredResponse {
            status: 201,
            content_type: None,
            body: br#"{"id":"t-1"}"#.to_vec(),
        })
    );
}

#[tokio::test]
async fn keys_are_scoped_by_org_and_endpoint() {
    let idempotency = Idempotency::new(Arc::new(InMemoryIdempotencyStore::new()));
    let org = Uuid::new_v4();

    idempotency.begin(org, "key-1", "POST /tasks", b"{}").await.unwrap();
    for (org, endpoint) in [(Uuid::new_v4(), "POST /tasks"), (org, "POST /parts")] {
        let decision = idempotency.begin(org, "key-1", endpoint, b"{}").await.unwrap();
        assert_eq!(decision, IdempotencyDecision::Execute);
    }
}

#[tokio::test]
async fn reused_key_with_different_body_is_rejected() {
    let idempotency = Idempotency::new(Arc::new(InMemoryIdempotencyStore::new()));
    let org = Uuid::new_v4();

    idempotency.begin(org, "key-1", "POST /tasks", b"{\"a\":1}").await.unwrap();
    idempotency
        .complete(org, "key-1", "POST /tasks", &StoredResponse::new(200, b"{}".to_vec()))
        .await
        .unwrap();

    let err = idempotency
        .begin(org, "key-1", "POST /tasks", b"{\"a\":2}")
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Validation(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicates_execute_once() {
    let idempotency = Idempotency::new(Arc::new(InMemoryIdempotencyStore::new()));
    let org = Uuid::new_v4();

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let idempotency = idempotency.clone();
        tasks.push(tokio::spawn(async move {
            idempotency.begin(org, "key-1", "POST /tasks", b"{}").await
        }));
    }

    let mut executed = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(IdempotencyDecision::Execute) => executed += 1,
            Ok(IdempotencyDecision::Replay(_)) => panic!("nothing was completed yet"),
            Err(e) => assert!(e.is_conflict(), "unexpected error: {e}"),
        }
    }
    assert_eq!(executed, 1);
}

#[tokio::test]
async fn abandoned_key_can_be_retried() {
    let idempotency = Idempotency::new(Arc::new(InMemoryIdempotencyStore::new()));
    let org = Uuid::new_v4();

    idempotency.begin(org, "key-1", "POST /tasks", b"{}").await.unwrap();
    idempotency.abandon(org, "key-1", "POST /tasks").await.unwrap();

    let decision = idempotency.begin(org, "key-1", "POST /tasks", b"{}").await.unwrap();
    assert_eq!(decision, IdempotencyDecision::Execute);
}

#[tokio::test]
async fn expired_records_are_forgotten_and_purged() {
    let clock = ManualClock::fixed();
    let store = Arc::new(InMemoryIdempotencyStore::with_clock(Arc::new(clock.clone())));
    let idempotency = Idempotency::new(store.clone())
        .with_clock(Arc::new(clock.clone()))
        .with_ttl(Duration::from_secs(60));
    let org = Uuid::new_v4();

    idempotency.begin(org, "key-1", "POST /tasks", b"{}").await.unwrap();
    idempotency
        .complete(org, "key-1", "POST /tasks", &StoredResponse::new(201, b"{}".to_vec()))
        .await
        .unwrap();

    clock.advance(Duration::from_secs(61));
    assert!(store.get(org, "key-1", "POST /tasks").await.unwrap().is_none());

    // An expired key behaves like a new one, even with a different body.
    let decision = idempotency.begin(org, "key-1", "POST /tasks", b"{\"v\":2}").await.unwrap();
    assert_eq!(decision, IdempotencyDecision::Execute);

    clock.advance(Duration::from_secs(61));
    assert_eq!(store.purge_expired(clock.now()).await.unwrap(), 1);
    assert!(store.is_empty());
}

#[tokio::test]
async fn placeholder_insert_conflicts() {
    let store = InMemoryIdempotencyStore::new();
    let record = IdempotencyRecord::placeholder(
        Uuid::new_v4(),
        "key-1",
        "POST /tasks",
        "abc",
        Utc::now(),
        Duration::from_secs(60),
    );

    store.create_placeholder(&record).await.unwrap();
    let err = store.create_placeholder(&record).await.unwrap_err();
    assert!(err.is_conflict());
}

// =============================================================================
// Rate limiter
// =============================================================================

#[tokio::test]
async fn fixed_window_allows_limit_then_rejects() {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 10).unwrap();
    let clock = ManualClock::new(start);
    let limiter = InMemoryRateLimiter::with_clock(Arc::new(clock.clone()));
    let window = Duration::from_secs(60);

    for expected_remaining in [2, 1, 0] {
        let decision = limiter.allow("org-1", 3, window).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, expected_remaining);
    }

    let rejected = limiter.allow("org-1", 3, window).await.unwrap();
    assert!(!rejected.allowed);
    assert_eq!(rejected.count, 4);
    assert_eq!(rejected.remaining, 0);
    assert_eq!(rejected.reset_at, Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 0).unwrap());
    assert_eq!(rejected.retry_after(clock.now()), Duration::from_secs(50));

    // Other keys have their own counters.
    assert!(limiter.allow("org-2", 3, window).await.unwrap().allowed);

    // The next window starts fresh.
    clock.advance(Duration::from_secs(50));
    let decision = limiter.allow("org-1", 3, window).await.unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.count, 1);
}

#[tokio::test]
async fn zero_window_is_rejected() {
    let limiter = InMemoryRateLimiter::new();
    let err = limiter.allow("org-1", 3, Duration::ZERO).await.unwrap_err();
    assert!(matches!(err, RelayError::Validation(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_are_counted_exactly() {
    let clock = ManualClock::fixed();
    let limiter = InMemoryRateLimiter::with_clock(Arc::new(clock.clone()));

    let mut tasks = Vec::new();
    for _ in 0..50 {
        let limiter = limiter.clone();
        tasks.push(tokio::spawn(async move {
            limiter.allow("org-1", 20, Duration::from_secs(60)).await.unwrap().allowed
        }));
    }

    let mut allowed = 0;
    for task in tasks {
        if task.await.unwrap() {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 20);
}
