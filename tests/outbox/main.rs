use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use outbox_relay::clock::add;
use outbox_relay::stream::{InMemoryDeadLetters, InMemoryStream};
use outbox_relay::webhook::{DeliveryQueue, InMemoryWebhookStore, Subscription, SubscriptionStore};
use outbox_relay::{
    worker, Clock, EventLog, EventPublisher, InMemoryEventLog, ManualClock, NewEvent,
    OutboxEvent, RelayError, Result, WebhookFanout,
};

/// Wraps an event log, records every `schedule_retry` call and can fail the
/// next `mark_failed`.
#[derive(Clone)]
struct RecordingLog {
    inner: InMemoryEventLog,
    retries: Arc<Mutex<Vec<(u32, DateTime<Utc>)>>>,
    fail_mark_failed: Arc<AtomicBool>,
}

impl RecordingLog {
    fn new(inner: InMemoryEventLog) -> Self {
        Self {
            inner,
            retries: Arc::default(),
            fail_mark_failed: Arc::default(),
        }
    }

    fn retries(&self) -> Vec<(u32, DateTime<Utc>)> {
        self.retries.lock().unwrap().clone()
    }

    fn fail_next_mark_failed(&self) {
        self.fail_mark_failed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventLog for RecordingLog {
    async fn enqueue(&self, event: NewEvent) -> Result<OutboxEvent> {
        self.inner.enqueue(event).await
    }

    async fn claim(&self, worker_id: &str, limit: usize) -> Result<Vec<OutboxEvent>> {
        self.inner.claim(worker_id, limit).await
    }

    async fn mark_processed(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.inner.mark_processed(id, at).await
    }

    async fn mark_failed(&self, id: Uuid, attempt: u32, last_error: &str, at: DateTime<Utc>) -> Result<()> {
        if self.fail_mark_failed.swap(false, Ordering::SeqCst) {
            return Err(RelayError::Validation("log unavailable".into()));
        }
        self.inner.mark_failed(id, attempt, last_error, at).await
    }

    async fn schedule_retry(
        &self,
        id: Uuid,
        attempt: u32,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<()> {
        self.retries.lock().unwrap().push((attempt, next_attempt_at));
        self.inner
            .schedule_retry(id, attempt, next_attempt_at, last_error)
            .await
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxEvent>> {
        self.inner.get(id).await
    }

    async fn release_stale_claims(&self, locked_before: DateTime<Utc>) -> Result<u64> {
        self.inner.release_stale_claims(locked_before).await
    }
}

fn task_completed(org_id: Uuid, task_id: &str) -> NewEvent {
    NewEvent::new(
        org_id,
        "TaskCompleted",
        "task",
        task_id,
        json!({ "task_id": task_id }),
        format!("complete:{task_id}"),
    )
}

// =============================================================================
// Enqueue
// =============================================================================

#[tokio::test]
async fn enqueue_is_deduplicated_per_org_and_aggregate() {
    let log = InMemoryEventLog::new();
    let org = Uuid::new_v4();

    log.enqueue(task_completed(org, "t-1")).await.unwrap();
    let err = log.enqueue(task_completed(org, "t-1")).await.unwrap_err();
    assert!(matches!(err, RelayError::DuplicateEvent { .. }));

    // Same key, different org or aggregate: a distinct event.
    log.enqueue(task_completed(Uuid::new_v4(), "t-1")).await.unwrap();
    log.enqueue(task_completed(org, "t-2")).await.unwrap();
    assert_eq!(log.len(), 3);
}

// =============================================================================
// Retry and dead-lettering
// =============================================================================

#[tokio::test]
async fn failed_publishes_back_off_two_then_four_seconds() {
    let clock = ManualClock::fixed();
    let start = clock.now();
    let log = RecordingLog::new(InMemoryEventLog::with_clock(Arc::new(clock.clone())));
    let stream = InMemoryStream::new();
    stream.fail_next(2);

    let publisher = EventPublisher::new(
        Arc::new(log.clone()),
        Arc::new(stream.clone()),
        Arc::new(InMemoryDeadLetters::new()),
    )
    .with_clock(Arc::new(clock.clone()));

    let event = log.enqueue(task_completed(Uuid::new_v4(), "t-1")).await.unwrap();

    assert_eq!(publisher.tick().await.unwrap().retried, 1);
    clock.advance(Duration::from_secs(1));
    assert_eq!(publisher.tick().await.unwrap().claimed, 0, "claimed before backoff elapsed");
    clock.advance(Duration::from_secs(1));

    assert_eq!(publisher.tick().await.unwrap().retried, 1);
    clock.advance(Duration::from_secs(4));

    let result = publisher.tick().await.unwrap();
    assert_eq!(result.published, 1);

    assert_eq!(
        log.retries(),
        vec![
            (1, add(start, Duration::from_secs(2))),
            (2, add(start, Duration::from_secs(6))),
        ]
    );
    assert_eq!(stream.attempts(), 3);
    assert_eq!(stream.len(), 1);

    let row = log.get(event.id).await.unwrap().unwrap();
    assert!(row.is_processed());
    assert_eq!(row.attempt_count, 2);
}

#[tokio::test]
async fn event_is_dead_lettered_after_max_attempts() {
    let clock = ManualClock::fixed();
    let log = InMemoryEventLog::with_clock(Arc::new(clock.clone()));
    let stream = InMemoryStream::new();
    let dead_letters = InMemoryDeadLetters::new();
    stream.fail_next(usize::MAX);

    let publisher = EventPublisher::new(
        Arc::new(log.clone()),
        Arc::new(stream.clone()),
        Arc::new(dead_letters.clone()),
    )
    .with_clock(Arc::new(clock.clone()))
    .with_max_attempts(3);

    let event = log.enqueue(task_completed(Uuid::new_v4(), "t-1")).await.unwrap();

    let mut dead_lettered = 0;
    for _ in 0..10 {
        dead_lettered += publisher.tick().await.unwrap().dead_lettered;
        clock.advance(Duration::from_secs(3600));
    }

    assert_eq!(dead_lettered, 1);
    assert_eq!(stream.attempts(), 3);
    assert!(stream.is_empty());

    let letters = dead_letters.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].event.id, event.id);
    assert_eq!(letters[0].attempts, 3);
    assert!(letters[0].error.contains("scripted failure"));

    let row = log.get(event.id).await.unwrap().unwrap();
    assert!(row.is_processed());
    assert_eq!(row.attempt_count, 3);
    assert!(row.last_error.as_deref().unwrap().contains("scripted failure"));
    assert!(row.locked_by.is_none());
}

#[tokio::test]
async fn dead_lettered_event_is_not_retried_when_closing_fails() {
    let clock = ManualClock::fixed();
    let log = RecordingLog::new(InMemoryEventLog::with_clock(Arc::new(clock.clone())));
    let stream = InMemoryStream::new();
    let dead_letters = InMemoryDeadLetters::new();
    stream.fail_next(usize::MAX);

    let publisher = EventPublisher::new(
        Arc::new(log.clone()),
        Arc::new(stream.clone()),
        Arc::new(dead_letters.clone()),
    )
    .with_clock(Arc::new(clock.clone()))
    .with_max_attempts(1);

    let event = log.enqueue(task_completed(Uuid::new_v4(), "t-1")).await.unwrap();
    log.fail_next_mark_failed();

    let result = publisher.tick().await.unwrap();
    assert_eq!(result.errors, 1);
    assert_eq!(result.dead_lettered, 0);
    assert_eq!(dead_letters.len(), 1);
    assert!(log.retries().is_empty());

    // The row keeps its claim instead of becoming due again.
    let row = log.get(event.id).await.unwrap().unwrap();
    assert!(row.is_pending());
    assert!(row.locked_by.is_some());

    clock.advance(Duration::from_secs(3600));
    assert_eq!(publisher.tick().await.unwrap().claimed, 0);
    assert_eq!(stream.attempts(), 1);
    assert_eq!(dead_letters.len(), 1);
}

#[tokio::test]
async fn stale_claims_are_released_when_configured() {
    let clock = ManualClock::fixed();
    let log = InMemoryEventLog::with_clock(Arc::new(clock.clone()));
    let stream = InMemoryStream::new();
    let event = log.enqueue(task_completed(Uuid::new_v4(), "t-1")).await.unwrap();

    // A publisher that claimed the row and died.
    assert_eq!(log.claim("crashed", 10).await.unwrap().len(), 1);

    let publisher = EventPublisher::new(
        Arc::new(log.clone()),
        Arc::new(stream.clone()),
        Arc::new(InMemoryDeadLetters::new()),
    )
    .with_clock(Arc::new(clock.clone()))
    .with_stale_claim_timeout(Duration::from_secs(300));

    assert_eq!(publisher.tick().await.unwrap().claimed, 0);

    clock.advance(Duration::from_secs(301));
    let result = publisher.tick().await.unwrap();
    assert_eq!(result.released, 1);
    assert_eq!(result.published, 1);
    assert!(log.get(event.id).await.unwrap().unwrap().is_processed());
}

// =============================================================================
// Fan-out
// =============================================================================

#[tokio::test]
async fn published_events_fan_out_to_matching_subscriptions() {
    let org = Uuid::new_v4();
    let log = InMemoryEventLog::new();
    let webhooks = Arc::new(InMemoryWebhookStore::new());
    webhooks
        .create(Subscription::new(org, "http://a.test/hook", "s1", ["TaskCompleted"]))
        .await
        .unwrap();
    webhooks
        .create(Subscription::new(org, "http://b.test/hook", "s2", ["TaskCompleted", "TaskCreated"]))
        .await
        .unwrap();
    webhooks
        .create(Subscription::new(org, "http://c.test/hook", "s3", ["TaskCreated"]))
        .await
        .unwrap();

    let publisher = EventPublisher::new(
        Arc::new(log.clone()),
        Arc::new(InMemoryStream::new()),
        Arc::new(InMemoryDeadLetters::new()),
    )
    .with_fanout(WebhookFanout::new(webhooks.clone(), webhooks.clone()));

    let event = log.enqueue(task_completed(org, "t-1")).await.unwrap();
    assert_eq!(publisher.tick().await.unwrap().published, 1);

    let deliveries = webhooks.list_for_event(event.id).await.unwrap();
    assert_eq!(deliveries.len(), 2);
    assert!(deliveries.iter().all(|d| d.is_pending() && d.attempt_count == 0));
}

#[tokio::test]
async fn republishing_does_not_duplicate_deliveries() {
    let org = Uuid::new_v4();
    let log = InMemoryEventLog::new();
    let webhooks = Arc::new(InMemoryWebhookStore::new());
    webhooks
        .create(Subscription::new(org, "http://a.test/hook", "s1", ["TaskCompleted"]))
        .await
        .unwrap();
    let fanout = WebhookFanout::new(webhooks.clone(), webhooks.clone());

    let event = log.enqueue(task_completed(org, "t-1")).await.unwrap();
    assert_eq!(fanout.fan_out(&event, Utc::now()).await.unwrap(), 1);
    assert_eq!(fanout.fan_out(&event, Utc::now()).await.unwrap(), 0);
    assert_eq!(webhooks.deliveries().len(), 1);
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_never_overlap() {
    let log = InMemoryEventLog::new();
    let org = Uuid::new_v4();
    for i in 0..200 {
        log.enqueue(task_completed(org, &format!("t-{i}"))).await.unwrap();
    }

    let mut tasks = Vec::new();
    for w in 0..8 {
        let log = log.clone();
        tasks.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            loop {
                let batch = log.claim(&format!("worker-{w}"), 7).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                ids.extend(batch.into_iter().map(|e| e.id));
            }
            ids
        }));
    }

    let mut seen = HashSet::new();
    for task in tasks {
        for id in task.await.unwrap() {
            assert!(seen.insert(id), "event {id} claimed twice");
        }
    }
    assert_eq!(seen.len(), 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn competing_publishers_publish_each_event_once() {
    let log = InMemoryEventLog::new();
    let stream = InMemoryStream::new();
    let org = Uuid::new_v4();
    for i in 0..100 {
        log.enqueue(task_completed(org, &format!("t-{i}"))).await.unwrap();
    }

    let mut tasks = Vec::new();
    for w in 0..4 {
        let publisher = EventPublisher::new(
            Arc::new(log.clone()),
            Arc::new(stream.clone()),
            Arc::new(InMemoryDeadLetters::new()),
        )
        .with_worker_id(format!("publisher-{w}"))
        .with_batch_size(10);
        tasks.push(tokio::spawn(async move {
            while publisher.tick().await.unwrap().claimed > 0 {}
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let ids: HashSet<Uuid> = stream.entries().into_iter().map(|e| e.event_id).collect();
    assert_eq!(stream.len(), 100);
    assert_eq!(ids.len(), 100);
    assert!(log.pending().is_empty());
}

// =============================================================================
// Background worker
// =============================================================================

#[tokio::test]
async fn worker_drains_until_stopped() {
    let log = InMemoryEventLog::new();
    let stream = InMemoryStream::new();
    let org = Uuid::new_v4();
    for i in 0..5 {
        log.enqueue(task_completed(org, &format!("t-{i}"))).await.unwrap();
    }

    let publisher = EventPublisher::new(
        Arc::new(log.clone()),
        Arc::new(stream.clone()),
        Arc::new(InMemoryDeadLetters::new()),
    )
    .with_batch_size(2);

    let shutdown = CancellationToken::new();
    let handle = worker::spawn(publisher, Duration::from_millis(10), shutdown.child_token());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while stream.len() < 5 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown.cancel();
    let stats = handle.stop().await;
    assert_eq!(stream.len(), 5);
    assert_eq!(stats.items, 5);
    assert_eq!(stats.errors, 0);
    assert!(stats.polls >= 3);
}
