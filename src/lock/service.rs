//! Lock service
//!
//! Layers per-resource FIFO waiter queues, a waiter bound, an acquire
//! deadline, and TTL-based deadlock recovery over the shared [`LockStore`].
//! Waiting never blocks callers on unrelated resources.

use crate::config::LockConfig;
use crate::lock::store::{LockStore, ReleaseOutcome};
use crate::lock::LockError;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

/// Per-resource wait queue. The std mutex guards only short, non-await
/// critical sections; the notify wakes waiters on release and on handoff.
struct ResourceQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

struct QueueState {
    next_ticket: u64,
    waiting: VecDeque<u64>,
}

impl ResourceQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                next_ticket: 0,
                waiting: VecDeque::new(),
            }),
            notify: Notify::new(),
        }
    }
}

/// Removes a waiter's ticket if its acquire is abandoned (timeout or caller
/// cancellation), so a dead waiter at the head cannot stall the queue.
struct Ticket {
    queue: Arc<ResourceQueue>,
    id: u64,
    done: bool,
}

impl Ticket {
    fn at_head(&self) -> bool {
        let state = self.queue.state.lock().expect("lock queue poisoned");
        state.waiting.front() == Some(&self.id)
    }

    fn complete(mut self) {
        let mut state = self.queue.state.lock().expect("lock queue poisoned");
        state.waiting.retain(|t| *t != self.id);
        self.done = true;
        drop(state);
        self.queue.notify.notify_waiters();
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Ok(mut state) = self.queue.state.lock() {
            state.waiting.retain(|t| *t != self.id);
        }
        self.queue.notify.notify_waiters();
    }
}

/// Distributed mutual-exclusion service.
pub struct LockService {
    store: Arc<dyn LockStore>,
    config: LockConfig,
    queues: Mutex<HashMap<String, Arc<ResourceQueue>>>,
}

impl LockService {
    pub fn new(store: Arc<dyn LockStore>, config: LockConfig) -> Self {
        Self {
            store,
            config,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the lock on `resource`, blocking (async) until the resource
    /// is free or the configured maximum wait elapses.
    ///
    /// Returns the opaque holder token that must be presented to `release`.
    /// Fails with [`LockError::QueueFull`] if the resource already has the
    /// configured number of outstanding waiters, and [`LockError::Timeout`]
    /// if the wait deadline passes.
    pub async fn acquire(
        &self,
        resource: &str,
        ttl: Option<Duration>,
    ) -> Result<String, LockError> {
        let ttl = ttl.unwrap_or(Duration::from_millis(self.config.default_ttl_ms));
        let queue = self.queue_for(resource);

        let ticket = {
            let mut state = queue.state.lock().expect("lock queue poisoned");
            if state.waiting.len() >= self.config.max_waiters_per_resource {
                warn!(
                    "Lock queue full for {}: {} waiters",
                    resource,
                    state.waiting.len()
                );
                return Err(LockError::QueueFull(resource.to_string()));
            }
            let id = state.next_ticket;
            state.next_ticket += 1;
            state.waiting.push_back(id);
            Ticket {
                queue: Arc::clone(&queue),
                id,
                done: false,
            }
        };

        let token = Uuid::new_v4().to_string();
        let started = Instant::now();
        let deadline = started + Duration::from_millis(self.config.max_wait_ms);
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));

        loop {
            // FIFO: only the head of the queue races the store. Expired
            // holders are reclaimed by the store's compare-and-set.
            if ticket.at_head() && self.store.try_acquire(resource, &token, ttl).await? {
                debug!(
                    "Acquired lock on {} after {}ms (ttl {}ms)",
                    resource,
                    started.elapsed().as_millis(),
                    ttl.as_millis()
                );
                ticket.complete();
                return Ok(token);
            }

            let now = Instant::now();
            if now >= deadline {
                let waited_ms = started.elapsed().as_millis() as u64;
                warn!("Lock acquire timed out for {} after {}ms", resource, waited_ms);
                return Err(LockError::Timeout {
                    resource: resource.to_string(),
                    waited_ms,
                });
            }

            // Wake on release, or poll so TTL expiry of a dead holder is
            // picked up without a cooperative release.
            let wait = poll.min(deadline - now);
            let _ = tokio::time::timeout(wait, queue.notify.notified()).await;
        }
    }

    /// Release a previously acquired lock.
    ///
    /// Idempotent on stale tokens: releasing an already-expired lease or a
    /// resource with no recorded holder logs a warning and returns Ok, so
    /// duplicate release calls are never an error.
    pub async fn release(&self, resource: &str, token: &str) -> Result<(), LockError> {
        match self.store.release(resource, token).await? {
            ReleaseOutcome::Released => {
                debug!("Released lock on {}", resource);
            }
            ReleaseOutcome::NotHolder => {
                warn!(
                    "Release for {} ignored: token no longer matches holder (lease expired?)",
                    resource
                );
            }
            ReleaseOutcome::NoHolder => {
                warn!("Release for {} ignored: no holder recorded", resource);
            }
        }
        self.wake(resource);
        Ok(())
    }

    /// Run `operation` with the lock on `resource` held for its entire
    /// duration, releasing afterward regardless of the outcome.
    pub async fn with_lock<T, F, Fut>(
        &self,
        resource: &str,
        ttl: Option<Duration>,
        operation: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let token = self.acquire(resource, ttl).await?;
        let result = operation().await;
        self.release(resource, &token).await?;
        Ok(result)
    }

    fn queue_for(&self, resource: &str) -> Arc<ResourceQueue> {
        let mut queues = self.queues.lock().expect("lock queue map poisoned");
        Arc::clone(
            queues
                .entry(resource.to_string())
                .or_insert_with(|| Arc::new(ResourceQueue::new())),
        )
    }

    fn wake(&self, resource: &str) {
        let queues = self.queues.lock().expect("lock queue map poisoned");
        if let Some(queue) = queues.get(resource) {
            queue.notify.notify_waiters();
        }
    }
}

/// Deterministic ordering for operations that must lock two channels: always
/// lexicographic, so two callers can never nest the same pair in opposite
/// orders.
pub fn ordered_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}
