//! Rate-limited reconcile queue
//!
//! Keys are opaque strings. A key sits in the ready list at most once; if it
//! is enqueued again while a worker is handling it, it is marked dirty and
//! goes back to the ready list exactly once when the handler returns. This
//! gives at most one in-flight handler per key no matter how many workers run.
//!
//! Delayed keys wait in a timer heap and join the ready list when due. A key
//! that is both ready and delayed runs twice, once for each copy.
//!
//! The handler is supplied to [`Queue::run`] rather than stored in the queue,
//! so a controller can own its queues and still be captured by the handler.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use vnode_common::metrics::{HandlerTimer, Outcome, QUEUE_ADDS, QUEUE_DROPS, QUEUE_RETRIES};
use vnode_common::{Error, Result};

use crate::rate_limiter::{default_rate_limiter, RateLimiter};

/// Consecutive failures after which the default retry decider gives up on a key
pub const MAX_RETRIES: u32 = 20;

/// What to do with a key whose handler failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue after `delay`, or after the rate limiter's delay when `None`
    Retry {
        /// Explicit delay overriding the rate limiter
        delay: Option<Duration>,
    },
    /// Drop the key and clear its retry state
    Forget,
}

/// Retry decider: `(key, attempts, error) -> decision`
///
/// `attempts` counts consecutive failures including the current one.
pub type RetryFn = Arc<dyn Fn(&str, u32, &Error) -> RetryDecision + Send + Sync>;

/// Retry with the rate limiter's delay while `attempts < MAX_RETRIES`
pub fn default_retry(_key: &str, attempts: u32, _err: &Error) -> RetryDecision {
    if attempts < MAX_RETRIES {
        RetryDecision::Retry { delay: None }
    } else {
        RetryDecision::Forget
    }
}

#[derive(Default)]
struct ReadySet {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    attempts: HashMap<String, u32>,
}

#[derive(Default)]
struct DelayHeap {
    heap: BinaryHeap<Reverse<(Instant, u64, String)>>,
    // Earliest pending time per key; heap entries that disagree are stale
    due: HashMap<String, Instant>,
    seq: u64,
}

/// Builder for [`Queue`]
pub struct QueueBuilder {
    name: String,
    limiter: Option<Arc<dyn RateLimiter>>,
    retry: Option<RetryFn>,
}

impl QueueBuilder {
    /// Use a custom rate limiter
    pub fn rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Use a custom retry decider
    pub fn retry(mut self, retry: RetryFn) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Build the queue
    pub fn build(self) -> Arc<Queue> {
        Arc::new(Queue {
            name: self.name,
            ready: Mutex::new(ReadySet::default()),
            delayed: Mutex::new(DelayHeap::default()),
            limiter: self.limiter.unwrap_or_else(default_rate_limiter),
            retry: self.retry.unwrap_or_else(|| Arc::new(default_retry)),
            item_ready: Notify::new(),
            delay_changed: Notify::new(),
            shutdown: CancellationToken::new(),
            dropped: AtomicU64::new(0),
        })
    }
}

/// Rate-limited, deduplicating work queue
pub struct Queue {
    name: String,
    ready: Mutex<ReadySet>,
    delayed: Mutex<DelayHeap>,
    limiter: Arc<dyn RateLimiter>,
    retry: RetryFn,
    item_ready: Notify,
    delay_changed: Notify,
    shutdown: CancellationToken,
    dropped: AtomicU64,
}

impl Queue {
    /// Start building a queue with the given name
    pub fn builder(name: impl Into<String>) -> QueueBuilder {
        QueueBuilder {
            name: name.into(),
            limiter: None,
            retry: None,
        }
    }

    /// Queue with the default rate limiter and retry decider
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::builder(name).build()
    }

    /// Queue name, used in logs and metrics
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add `key` no sooner than the rate limiter allows
    pub fn enqueue(&self, key: &str) {
        if self.reject_if_shut_down(key) {
            return;
        }
        let delay = self.limiter.when(key);
        self.add_after(key, delay);
    }

    /// Add `key` to the ready list now, bypassing the rate limiter
    pub fn enqueue_immediate(&self, key: &str) {
        self.add(key);
    }

    /// Add `key` once `delay` has elapsed
    ///
    /// A pending delayed copy of the same key keeps whichever deadline is
    /// earlier. An immediate copy is independent and runs on its own.
    pub fn enqueue_after(&self, key: &str, delay: Duration) {
        self.add_after(key, delay);
    }

    /// Clear the retry counter and rate-limit state for `key`
    ///
    /// A copy that is already ready or in flight still runs.
    pub fn forget(&self, key: &str) {
        self.limiter.forget(key);
        self.ready.lock().attempts.remove(key);
    }

    /// Consecutive failures recorded for `key`
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.ready.lock().attempts.get(key).copied().unwrap_or(0)
    }

    /// Number of keys waiting in the ready list
    pub fn len(&self) -> usize {
        self.ready.lock().queue.len()
    }

    /// True when no key is waiting in the ready list
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys waiting for their delay to elapse
    pub fn delayed_len(&self) -> usize {
        self.delayed.lock().due.len()
    }

    /// Number of enqueues rejected because the queue was shut down
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting keys and release idle workers
    pub fn shut_down(&self) {
        self.shutdown.cancel();
    }

    /// True once [`Queue::shut_down`] has been called
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Run `workers` handlers until `ctx` is cancelled
    ///
    /// Returns once the queue is shut down and every worker has finished
    /// its current key.
    pub async fn run<F, Fut>(self: &Arc<Self>, ctx: &CancellationToken, workers: usize, handler: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let workers = workers.max(1);
        let handler = Arc::new(handler);
        let mut tasks = JoinSet::new();

        tasks.spawn(self.clone().delay_loop());
        for _ in 0..workers {
            tasks.spawn(self.clone().worker(handler.clone()));
        }
        info!(queue = %self.name, workers, "Queue workers started");

        tokio::select! {
            _ = ctx.cancelled() => {}
            _ = self.shutdown.cancelled() => {}
        }
        self.shut_down();

        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!(queue = %self.name, error = %e, "Queue task failed");
            }
        }
        info!(queue = %self.name, "Queue workers stopped");
    }

    // =========================================================================
    // Ready list
    // =========================================================================

    fn reject_if_shut_down(&self, key: &str) -> bool {
        if !self.is_shut_down() {
            return false;
        }
        self.dropped.fetch_add(1, Ordering::Relaxed);
        QUEUE_DROPS.add(
            1,
            &[
                KeyValue::new("queue", self.name.clone()),
                KeyValue::new("reason", "shutdown"),
            ],
        );
        debug!(queue = %self.name, key, "Queue shut down, dropping key");
        true
    }

    fn add(&self, key: &str) {
        if self.reject_if_shut_down(key) {
            return;
        }
        {
            let mut ready = self.ready.lock();
            if !ready.dirty.insert(key.to_string()) {
                return;
            }
            QUEUE_ADDS.add(1, &[KeyValue::new("queue", self.name.clone())]);
            if ready.processing.contains(key) {
                return;
            }
            ready.queue.push_back(key.to_string());
        }
        self.item_ready.notify_one();
    }

    fn get(&self) -> Option<String> {
        let mut ready = self.ready.lock();
        let key = ready.queue.pop_front()?;
        ready.processing.insert(key.clone());
        ready.dirty.remove(&key);
        Some(key)
    }

    fn done(&self, key: &str) {
        let requeued = {
            let mut ready = self.ready.lock();
            ready.processing.remove(key);
            if ready.dirty.contains(key) {
                ready.queue.push_back(key.to_string());
                true
            } else {
                false
            }
        };
        if requeued {
            self.item_ready.notify_one();
        }
    }

    // =========================================================================
    // Delayed keys
    // =========================================================================

    fn add_after(&self, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.reject_if_shut_down(key) {
            return;
        }
        let at = Instant::now() + delay;
        {
            let mut delayed = self.delayed.lock();
            if delayed.due.get(key).is_some_and(|existing| *existing <= at) {
                return;
            }
            delayed.due.insert(key.to_string(), at);
            delayed.seq += 1;
            let seq = delayed.seq;
            delayed.heap.push(Reverse((at, seq, key.to_string())));
        }
        self.delay_changed.notify_one();
    }

    /// Move due keys to the ready list; returns the next deadline
    fn fire_due(&self) -> Option<Instant> {
        let now = Instant::now();
        let mut fired = Vec::new();
        let next = {
            let mut delayed = self.delayed.lock();
            while let Some(Reverse((at, _, _))) = delayed.heap.peek() {
                if *at > now {
                    break;
                }
                let Some(Reverse((at, _, key))) = delayed.heap.pop() else {
                    break;
                };
                if delayed.due.get(&key) == Some(&at) {
                    delayed.due.remove(&key);
                    fired.push(key);
                }
            }
            delayed.heap.peek().map(|Reverse((at, _, _))| *at)
        };
        for key in fired {
            self.add(&key);
        }
        next
    }

    async fn delay_loop(self: Arc<Self>) {
        loop {
            let changed = self.delay_changed.notified();
            let next = self.fire_due();
            let sleep = async {
                match next {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = changed => {}
                _ = sleep => {}
            }
        }
    }

    // =========================================================================
    // Workers
    // =========================================================================

    async fn next_key(&self) -> Option<String> {
        loop {
            if self.is_shut_down() {
                return None;
            }
            let notified = self.item_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(key) = self.get() {
                return Some(key);
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = self.shutdown.cancelled() => return None,
            }
        }
    }

    async fn worker<F, Fut>(self: Arc<Self>, handler: Arc<F>)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        while let Some(key) = self.next_key().await {
            self.process(&key, handler.as_ref()).await;
        }
    }

    async fn process<F, Fut>(&self, key: &str, handler: &F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let timer = HandlerTimer::start(self.name.clone());
        let result = AssertUnwindSafe(async { handler(key.to_string()).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(Error::panicked(panic_message(panic.as_ref()))));

        match result {
            Ok(()) => {
                timer.finish(Outcome::Success);
                self.forget(key);
            }
            Err(err) => {
                timer.finish(Outcome::Error);
                self.handle_failure(key, err);
            }
        }
        self.done(key);
    }

    fn handle_failure(&self, key: &str, err: Error) {
        let attempts = {
            let mut ready = self.ready.lock();
            let attempts = ready.attempts.entry(key.to_string()).or_insert(0);
            *attempts += 1;
            *attempts
        };

        if self.is_shut_down() {
            debug!(queue = %self.name, key, error = %err, "Handler failed during shutdown");
            return;
        }

        match (self.retry)(key, attempts, &err) {
            RetryDecision::Retry { delay } => {
                let delay = delay.unwrap_or_else(|| {
                    let limited = self.limiter.when(key);
                    err.retry_after().map_or(limited, |floor| limited.max(floor))
                });
                QUEUE_RETRIES.add(1, &[KeyValue::new("queue", self.name.clone())]);
                warn!(
                    queue = %self.name,
                    key,
                    attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Handler failed, requeueing"
                );
                self.add_after(key, delay);
            }
            RetryDecision::Forget => {
                QUEUE_DROPS.add(
                    1,
                    &[
                        KeyValue::new("queue", self.name.clone()),
                        KeyValue::new("reason", "exhausted"),
                    ],
                );
                warn!(
                    queue = %self.name,
                    key,
                    attempts,
                    error = %err,
                    "Handler failed, giving up on key"
                );
                self.forget(key);
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
