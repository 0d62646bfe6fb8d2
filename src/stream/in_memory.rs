//! In-memory stream and dead-letter sink for tests and single-process use.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::sink::{DeadLetter, DeadLetterSink, EventStream, StreamEntry};
use crate::error::StreamError;

/// Append-only in-memory stream.
///
/// Failures can be scripted with [`fail_next`](Self::fail_next) to exercise
/// the publisher's retry path. Clones share the same log.
///
/// ```
/// use outbox_relay::stream::{EventStream, InMemoryStream, StreamEntry};
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let stream = InMemoryStream::new();
/// stream.fail_next(1);
///
/// let entry = StreamEntry {
///     event_id: uuid::Uuid::new_v4(),
///     org_id: uuid::Uuid::new_v4(),
///     event_type: "TaskCompleted".into(),
///     aggregate_type: "task".into(),
///     aggregate_id: "t-1".into(),
///     payload: serde_json::json!({}),
///     occurred_at: chrono::Utc::now(),
/// };
/// assert!(stream.append(&entry).await.is_err());
/// assert!(stream.append(&entry).await.is_ok());
/// assert_eq!(stream.len(), 1);
/// # });
/// ```
#[derive(Clone, Default)]
pub struct InMemoryStream {
    log: Arc<Mutex<Vec<StreamEntry>>>,
    failures: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
}

impl InMemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` appends fail with `StreamError::Unavailable`.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Successfully appended entries, in order.
    pub fn entries(&self) -> Vec<StreamEntry> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    pub fn event_types(&self) -> Vec<String> {
        self.entries().into_iter().map(|e| e.event_type).collect()
    }

    pub fn len(&self) -> usize {
        self.log.lock().map(|log| log.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `append` calls, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventStream for InMemoryStream {
    async fn append(&self, entry: &StreamEntry) -> Result<String, StreamError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let scripted_failure = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure {
            return Err(StreamError::Unavailable("scripted failure".into()));
        }

        let mut log = self
            .log
            .lock()
            .map_err(|_| StreamError::Unavailable("stream log poisoned".into()))?;
        log.push(entry.clone());
        Ok(format!("{}-0", log.len()))
    }
}

/// Collects dead letters in memory. Clones share storage.
#[derive(Clone, Default)]
pub struct InMemoryDeadLetters {
    letters: Arc<Mutex<Vec<DeadLetter>>>,
    failing: Arc<AtomicUsize>,
}

impl InMemoryDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` dead-letter pushes fail.
    pub fn fail_next(&self, n: usize) {
        self.failing.store(n, Ordering::SeqCst);
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.letters.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetters {
    async fn dead_letter(&self, letter: &DeadLetter) -> Result<(), StreamError> {
        let scripted_failure = self
            .failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure {
            return Err(StreamError::Unavailable("scripted failure".into()));
        }

        self.letters
            .lock()
            .map_err(|_| StreamError::Unavailable("dead letters poisoned".into()))?
            .push(letter.clone());
        Ok(())
    }
}
