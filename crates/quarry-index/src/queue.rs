//! Debounced, coalescing work queue for indexing jobs.
//!
//! At most one pending job exists per document: repeated `added`/`modified` events
//! restart that document's debounce window, and a `removed` event replaces whatever was
//! queued and becomes due immediately. Due jobs leave in FIFO order, and a document
//! with a job in flight is skipped until that job completes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::pin;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{IndexError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub document: String,
    pub kind: ChangeKind,
}

impl FileEvent {
    #[must_use]
    pub fn new(document: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            document: document.into(),
            kind,
        }
    }
}

/// A job handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub document: String,
    pub kind: ChangeKind,
    /// Number of failed attempts so far.
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pushed {
    Queued,
    /// Merged into a job already pending for the same document.
    Coalesced,
    /// Capacity reached and the document had nothing pending.
    Full,
    /// Filtered out before reaching the queue.
    Ignored,
}

#[derive(Debug)]
struct Pending {
    kind: ChangeKind,
    due: Instant,
    attempt: u32,
}

#[derive(Debug, Default)]
struct State {
    pending: HashMap<String, Pending>,
    order: VecDeque<String>,
    in_flight: HashSet<String>,
    closed: bool,
}

enum Poll {
    Ready(Job),
    Wait(Option<Instant>),
    Closed,
}

#[derive(Debug)]
pub struct WorkQueue {
    state: Mutex<State>,
    debounce: Duration,
    capacity: usize,
    changed: Notify,
    space: Notify,
    idle: Notify,
}

impl WorkQueue {
    #[must_use]
    pub fn new(capacity: usize, debounce: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            debounce,
            capacity: capacity.max(1),
            changed: Notify::new(),
            space: Notify::new(),
            idle: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue without waiting for capacity.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::QueueClosed`] after [`close`](Self::close).
    pub fn try_push(&self, event: FileEvent) -> Result<Pushed> {
        let now = Instant::now();
        let outcome = {
            let mut state = self.lock();
            if state.closed {
                return Err(IndexError::QueueClosed);
            }
            let State { pending, order, .. } = &mut *state;
            if let Some(existing) = pending.get_mut(&event.document) {
                match event.kind {
                    ChangeKind::Removed => {
                        existing.kind = ChangeKind::Removed;
                        existing.due = now;
                    }
                    ChangeKind::Added | ChangeKind::Modified => {
                        if existing.kind == ChangeKind::Removed {
                            existing.kind = ChangeKind::Modified;
                        } else if event.kind == ChangeKind::Modified {
                            existing.kind = ChangeKind::Modified;
                        }
                        existing.due = now + self.debounce;
                    }
                }
                existing.attempt = 0;
                Pushed::Coalesced
            } else if pending.len() >= self.capacity {
                Pushed::Full
            } else {
                let due = match event.kind {
                    ChangeKind::Removed => now,
                    ChangeKind::Added | ChangeKind::Modified => now + self.debounce,
                };
                pending.insert(
                    event.document.clone(),
                    Pending {
                        kind: event.kind,
                        due,
                        attempt: 0,
                    },
                );
                order.push_back(event.document);
                Pushed::Queued
            }
        };
        if matches!(outcome, Pushed::Queued | Pushed::Coalesced) {
            self.changed.notify_waiters();
        }
        Ok(outcome)
    }

    /// Enqueue, waiting for capacity when the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::QueueClosed`] after [`close`](Self::close).
    pub async fn push(&self, event: FileEvent) -> Result<Pushed> {
        loop {
            let mut space = pin!(self.space.notified());
            space.as_mut().enable();
            match self.try_push(event.clone())? {
                Pushed::Full => space.await,
                outcome => return Ok(outcome),
            }
        }
    }

    /// Wait for the next due job. `None` once the queue is closed or `cancel` fires.
    pub async fn next(&self, cancel: &CancellationToken) -> Option<Job> {
        loop {
            let mut changed = pin!(self.changed.notified());
            changed.as_mut().enable();
            match self.poll(Instant::now()) {
                Poll::Ready(job) => return Some(job),
                Poll::Closed => return None,
                Poll::Wait(Some(deadline)) => {
                    tokio::select! {
                        () = &mut changed => {}
                        () = tokio::time::sleep_until(deadline) => {}
                        () = cancel.cancelled() => return None,
                    }
                }
                Poll::Wait(None) => {
                    tokio::select! {
                        () = &mut changed => {}
                        () = cancel.cancelled() => return None,
                    }
                }
            }
        }
    }

    fn poll(&self, now: Instant) -> Poll {
        let job = {
            let mut state = self.lock();
            if state.closed {
                return Poll::Closed;
            }
            let State {
                pending,
                order,
                in_flight,
                ..
            } = &mut *state;

            let mut earliest: Option<Instant> = None;
            let mut ready = None;
            for (pos, doc) in order.iter().enumerate() {
                if in_flight.contains(doc) {
                    continue;
                }
                let Some(p) = pending.get(doc) else {
                    continue;
                };
                if p.due <= now {
                    ready = Some(pos);
                    break;
                }
                earliest = Some(earliest.map_or(p.due, |e| e.min(p.due)));
            }

            let Some(pos) = ready else {
                return Poll::Wait(earliest);
            };
            let Some(document) = order.remove(pos) else {
                return Poll::Wait(earliest);
            };
            let Some(p) = pending.remove(&document) else {
                return Poll::Wait(earliest);
            };
            in_flight.insert(document.clone());
            Job {
                document,
                kind: p.kind,
                attempt: p.attempt,
            }
        };
        self.space.notify_waiters();
        Poll::Ready(job)
    }

    /// Release a document after its job finished, successfully or not.
    pub fn complete(&self, document: &str) {
        let idle = {
            let mut state = self.lock();
            state.in_flight.remove(document);
            state.pending.is_empty() && state.in_flight.is_empty()
        };
        self.changed.notify_waiters();
        if idle {
            self.idle.notify_waiters();
        }
    }

    /// Put a failed job back at the front of the queue, due after `delay`.
    ///
    /// If a newer event for the document arrived meanwhile, that event wins and the retry
    /// is dropped.
    pub fn retry(&self, job: Job, delay: Duration) {
        {
            let mut state = self.lock();
            state.in_flight.remove(&job.document);
            if !state.closed && !state.pending.contains_key(&job.document) {
                state.pending.insert(
                    job.document.clone(),
                    Pending {
                        kind: job.kind,
                        due: Instant::now() + delay,
                        attempt: job.attempt + 1,
                    },
                );
                state.order.push_front(job.document);
            }
        }
        self.changed.notify_waiters();
    }

    /// Pending plus in-flight jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        let state = self.lock();
        state.pending.len() + state.in_flight.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve once nothing is pending or in flight.
    pub async fn wait_idle(&self) {
        loop {
            let mut idle = pin!(self.idle.notified());
            idle.as_mut().enable();
            {
                let state = self.lock();
                if state.closed || (state.pending.is_empty() && state.in_flight.is_empty()) {
                    return;
                }
            }
            idle.await;
        }
    }

    /// Refuse new events and wake every waiter. Pending jobs are dropped.
    pub fn close(&self) {
        {
            let mut state = self.lock();
            state.closed = true;
            state.pending.clear();
            state.order.clear();
        }
        self.changed.notify_waiters();
        self.space.notify_waiters();
        self.idle.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> WorkQueue {
        WorkQueue::new(8, Duration::from_millis(100))
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_modifications_coalesce_into_one_job() {
        let q = queue();
        let cancel = CancellationToken::new();
        assert_eq!(
            q.try_push(FileEvent::new("a", ChangeKind::Modified)).unwrap(),
            Pushed::Queued
        );
        for _ in 0..2 {
            tokio::time::advance(Duration::from_millis(30)).await;
            assert_eq!(
                q.try_push(FileEvent::new("a", ChangeKind::Modified)).unwrap(),
                Pushed::Coalesced
            );
        }
        assert_eq!(q.len(), 1);

        let start = Instant::now();
        let job = q.next(&cancel).await.unwrap();
        assert_eq!(job.kind, ChangeKind::Modified);
        assert!(start.elapsed() >= Duration::from_millis(100));
        q.complete("a");
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn removal_replaces_queued_modification_and_is_immediate() {
        let q = queue();
        let cancel = CancellationToken::new();
        q.try_push(FileEvent::new("a", ChangeKind::Modified)).unwrap();
        q.try_push(FileEvent::new("a", ChangeKind::Removed)).unwrap();

        let start = Instant::now();
        let job = q.next(&cancel).await.unwrap();
        assert_eq!(job.kind, ChangeKind::Removed);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_remove_becomes_modification() {
        let q = queue();
        let cancel = CancellationToken::new();
        q.try_push(FileEvent::new("a", ChangeKind::Removed)).unwrap();
        q.try_push(FileEvent::new("a", ChangeKind::Added)).unwrap();
        assert_eq!(q.next(&cancel).await.unwrap().kind, ChangeKind::Modified);
    }

    #[tokio::test(start_paused = true)]
    async fn due_jobs_leave_in_fifo_order() {
        let q = queue();
        let cancel = CancellationToken::new();
        for doc in ["a", "b", "c"] {
            q.try_push(FileEvent::new(doc, ChangeKind::Added)).unwrap();
        }
        tokio::time::advance(Duration::from_millis(150)).await;
        let order: Vec<String> = [
            q.next(&cancel).await.unwrap(),
            q.next(&cancel).await.unwrap(),
            q.next(&cancel).await.unwrap(),
        ]
        .into_iter()
        .map(|j| j.document)
        .collect();
        assert_eq!(order, ["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_document_is_not_handed_out_twice() {
        let q = queue();
        let cancel = CancellationToken::new();
        q.try_push(FileEvent::new("a", ChangeKind::Removed)).unwrap();
        let first = q.next(&cancel).await.unwrap();
        q.try_push(FileEvent::new("a", ChangeKind::Removed)).unwrap();
        q.try_push(FileEvent::new("b", ChangeKind::Removed)).unwrap();

        let second = q.next(&cancel).await.unwrap();
        assert_eq!(second.document, "b");
        q.complete(&first.document);
        assert_eq!(q.next(&cancel).await.unwrap().document, "a");
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_still_coalesces_duplicates() {
        let q = WorkQueue::new(2, Duration::from_millis(10));
        q.try_push(FileEvent::new("a", ChangeKind::Added)).unwrap();
        q.try_push(FileEvent::new("b", ChangeKind::Added)).unwrap();
        assert_eq!(
            q.try_push(FileEvent::new("c", ChangeKind::Added)).unwrap(),
            Pushed::Full
        );
        assert_eq!(
            q.try_push(FileEvent::new("a", ChangeKind::Modified)).unwrap(),
            Pushed::Coalesced
        );
    }

    #[tokio::test(start_paused = true)]
    async fn push_waits_for_space() {
        let q = std::sync::Arc::new(WorkQueue::new(1, Duration::ZERO));
        let cancel = CancellationToken::new();
        q.try_push(FileEvent::new("a", ChangeKind::Added)).unwrap();

        let producer = {
            let q = std::sync::Arc::clone(&q);
            tokio::spawn(async move { q.push(FileEvent::new("b", ChangeKind::Added)).await })
        };
        tokio::task::yield_now().await;
        assert!(!producer.is_finished());

        let job = q.next(&cancel).await.unwrap();
        assert_eq!(job.document, "a");
        assert_eq!(producer.await.unwrap().unwrap(), Pushed::Queued);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_goes_to_front_after_delay() {
        let q = queue();
        let cancel = CancellationToken::new();
        q.try_push(FileEvent::new("a", ChangeKind::Removed)).unwrap();
        let job = q.next(&cancel).await.unwrap();
        q.try_push(FileEvent::new("b", ChangeKind::Removed)).unwrap();

        q.retry(job, Duration::from_millis(50));
        assert_eq!(q.next(&cancel).await.unwrap().document, "b");
        let start = Instant::now();
        let retried = q.next(&cancel).await.unwrap();
        assert_eq!(retried.document, "a");
        assert_eq!(retried.attempt, 1);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn newer_event_supersedes_retry() {
        let q = queue();
        let cancel = CancellationToken::new();
        q.try_push(FileEvent::new("a", ChangeKind::Removed)).unwrap();
        let job = q.next(&cancel).await.unwrap();
        q.try_push(FileEvent::new("a", ChangeKind::Modified)).unwrap();
        q.retry(job, Duration::from_secs(60));

        let next = q.next(&cancel).await.unwrap();
        assert_eq!(next.kind, ChangeKind::Modified);
        assert_eq!(next.attempt, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_idle_and_close() {
        let q = std::sync::Arc::new(queue());
        let cancel = CancellationToken::new();
        q.wait_idle().await;

        q.try_push(FileEvent::new("a", ChangeKind::Removed)).unwrap();
        let waiter = {
            let q = std::sync::Arc::clone(&q);
            tokio::spawn(async move { q.wait_idle().await })
        };
        let job = q.next(&cancel).await.unwrap();
        q.complete(&job.document);
        waiter.await.unwrap();

        q.close();
        assert!(q.next(&cancel).await.is_none());
        assert!(matches!(
            q.try_push(FileEvent::new("b", ChangeKind::Added)),
            Err(IndexError::QueueClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_waiting() {
        let q = queue();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(q.next(&cancel).await.is_none());
    }
}
