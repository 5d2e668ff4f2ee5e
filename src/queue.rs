//! Priority request queue for outbound model calls.
//!
//! Every model call in the process goes through one [`RequestQueue`]. It
//! orders work by [`Priority`] (FIFO within a priority), caps how many calls
//! are in flight, and absorbs provider rate limiting: a rate-limited task is
//! put back at the very front of the queue and all dequeuing stops for a
//! fixed cool-down. Callers never see rate-limit failures, only the eventual
//! result.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::agents::AgentId;
use crate::llm::LlmError;

/// Number of recent latencies kept for the rolling average.
const LATENCY_WINDOW: usize = 50;

/// Scheduling class of a request. Lower rank runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
    Background,
}

impl Priority {
    pub fn rank(self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
            Priority::Background => 4,
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            "background" => Ok(Priority::Background),
            other => Err(format!("unknown priority: {}", other)),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
            Priority::Background => "background",
        };
        write!(f, "{}", s)
    }
}

/// Why a queued request did not produce a value.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Removed from the queue before it started.
    #[error("Cancelled")]
    Cancelled,

    /// The task ran and failed with a non-retryable error.
    #[error("{0}")]
    Failed(#[from] LlmError),

    /// The task panicked. Its slot was released.
    #[error("Request task panicked: {0}")]
    Panicked(String),
}

impl QueueError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueueError::Cancelled)
    }
}

/// Queue tuning.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of tasks running at once.
    pub max_concurrent: usize,
    /// Global pause applied after a rate-limit signal.
    pub rate_limit_cooldown: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            rate_limit_cooldown: Duration::from_secs(30),
        }
    }
}

/// Point-in-time queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueMetrics {
    pub queued: usize,
    pub in_flight: usize,
    pub processed: u64,
    pub errors: u64,
    /// Mean enqueue-to-settle time over recent requests.
    pub avg_latency_ms: f64,
    pub paused: bool,
}

type TaskFuture<T> = BoxFuture<'static, Result<T, LlmError>>;
type TaskFactory<T> = Box<dyn FnMut() -> TaskFuture<T> + Send>;

struct QueueItem<T> {
    owner: AgentId,
    priority: Priority,
    /// Re-invoked on every attempt.
    task: TaskFactory<T>,
    enqueued_at: Instant,
    responder: oneshot::Sender<Result<T, QueueError>>,
}

struct QueueState<T> {
    items: VecDeque<QueueItem<T>>,
    in_flight: usize,
    paused: bool,
    processed: u64,
    errors: u64,
    latencies: VecDeque<Duration>,
}

impl<T> QueueState<T> {
    /// Stable priority insert: after every item of equal or better rank.
    fn insert(&mut self, item: QueueItem<T>) {
        let rank = item.priority.rank();
        let idx = self
            .items
            .iter()
            .position(|queued| queued.priority.rank() > rank)
            .unwrap_or(self.items.len());
        self.items.insert(idx, item);
    }

    fn record_latency(&mut self, latency: Duration) {
        if self.latencies.len() == LATENCY_WINDOW {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }
}

struct Inner<T> {
    config: QueueConfig,
    state: Mutex<QueueState<T>>,
}

/// Priority-ordered, concurrency-bounded scheduler.
///
/// Cloning is cheap; clones share the same queue.
pub struct RequestQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for RequestQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> RequestQueue<T> {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: QueueConfig {
                    max_concurrent: config.max_concurrent.max(1),
                    ..config
                },
                state: Mutex::new(QueueState {
                    items: VecDeque::new(),
                    in_flight: 0,
                    paused: false,
                    processed: 0,
                    errors: 0,
                    latencies: VecDeque::new(),
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue `task` and wait for its final outcome.
    pub async fn enqueue<F, Fut>(
        &self,
        owner: AgentId,
        priority: Priority,
        task: F,
    ) -> Result<T, QueueError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, LlmError>> + Send + 'static,
    {
        self.submit(owner, priority, task).await
    }

    /// Queue `task` immediately and return a handle to its outcome.
    ///
    /// Unlike [`enqueue`](Self::enqueue), the item takes its place in the
    /// queue before this returns, so submission order is call order.
    pub fn submit<F, Fut>(
        &self,
        owner: AgentId,
        priority: Priority,
        mut task: F,
    ) -> impl Future<Output = Result<T, QueueError>> + Send + 'static
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, LlmError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let item = QueueItem {
            owner,
            priority,
            task: Box::new(move || Box::pin(task()) as TaskFuture<T>),
            enqueued_at: Instant::now(),
            responder: tx,
        };

        {
            let mut state = self.lock();
            state.insert(item);
            tracing::debug!(
                owner = %owner,
                priority = %priority,
                queued = state.items.len(),
                "Request enqueued"
            );
        }
        self.pump();

        async move { rx.await.unwrap_or(Err(QueueError::Cancelled)) }
    }

    /// Start queued work until the concurrency limit is reached.
    fn pump(&self) {
        let mut state = self.lock();
        while !state.paused && state.in_flight < self.inner.config.max_concurrent {
            let Some(item) = state.items.pop_front() else {
                break;
            };
            // Nobody is waiting for this result any more.
            if item.responder.is_closed() {
                continue;
            }
            state.in_flight += 1;
            let queue = self.clone();
            tokio::spawn(async move { queue.run(item).await });
        }
    }

    async fn run(self, mut item: QueueItem<T>) {
        let attempt = AssertUnwindSafe(async { (item.task)().await })
            .catch_unwind()
            .await;

        {
            let mut state = self.lock();
            state.in_flight -= 1;

            let result = match attempt {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    state.errors += 1;
                    tracing::error!(owner = %item.owner, "Request task panicked: {}", message);
                    let _ = item.responder.send(Err(QueueError::Panicked(message)));
                    drop(state);
                    self.pump();
                    return;
                }
            };

            match result {
                Err(error) if error.is_rate_limited() => {
                    tracing::warn!(
                        owner = %item.owner,
                        cooldown = ?self.inner.config.rate_limit_cooldown,
                        "Rate limited, requeueing and pausing queue: {}",
                        error
                    );
                    state.items.push_front(item);
                    if !state.paused {
                        state.paused = true;
                        self.schedule_resume();
                    }
                }
                Ok(value) => {
                    state.processed += 1;
                    state.record_latency(item.enqueued_at.elapsed());
                    let _ = item.responder.send(Ok(value));
                }
                Err(error) => {
                    state.errors += 1;
                    state.record_latency(item.enqueued_at.elapsed());
                    tracing::error!(owner = %item.owner, "Request failed: {}", error);
                    let _ = item.responder.send(Err(QueueError::Failed(error)));
                }
            }
        }

        self.pump();
    }

    fn schedule_resume(&self) {
        let queue = self.clone();
        let cooldown = self.inner.config.rate_limit_cooldown;
        tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            queue.lock().paused = false;
            tracing::info!("Rate-limit cool-down elapsed, resuming queue");
            queue.pump();
        });
    }

    /// Fail every not-yet-started item owned by `owner` with
    /// [`QueueError::Cancelled`]. Running items are unaffected.
    pub fn cancel(&self, owner: &AgentId) -> usize {
        self.cancel_where(|item| &item.owner == owner)
    }

    /// Fail every not-yet-started item.
    pub fn cancel_all(&self) -> usize {
        self.cancel_where(|_| true)
    }

    fn cancel_where(&self, predicate: impl Fn(&QueueItem<T>) -> bool) -> usize {
        let cancelled: VecDeque<QueueItem<T>> = {
            let mut state = self.lock();
            let items = std::mem::take(&mut state.items);
            let (cancelled, kept): (VecDeque<_>, VecDeque<_>) =
                items.into_iter().partition(|item| predicate(item));
            state.items = kept;
            cancelled
        };

        let count = cancelled.len();
        for item in cancelled {
            let _ = item.responder.send(Err(QueueError::Cancelled));
        }
        if count > 0 {
            tracing::info!(count, "Cancelled queued requests");
        }
        count
    }

    pub fn metrics(&self) -> QueueMetrics {
        let state = self.lock();
        let avg_latency_ms = if state.latencies.is_empty() {
            0.0
        } else {
            let total: Duration = state.latencies.iter().sum();
            total.as_secs_f64() * 1000.0 / state.latencies.len() as f64
        };
        QueueMetrics {
            queued: state.items.len(),
            in_flight: state.in_flight,
            processed: state.processed,
            errors: state.errors,
            avg_latency_ms,
            paused: state.paused,
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_queue<T: Send + 'static>(max_concurrent: usize) -> RequestQueue<T> {
        RequestQueue::new(QueueConfig {
            max_concurrent,
            rate_limit_cooldown: Duration::from_millis(50),
        })
    }

    /// A task that does not finish until the returned sender fires.
    fn gated() -> (
        oneshot::Sender<()>,
        impl FnMut() -> BoxFuture<'static, Result<&'static str, LlmError>> + Send + 'static,
    ) {
        let (tx, rx) = oneshot::channel::<()>();
        let mut rx = Some(rx);
        let task = move || {
            let rx = rx.take();
            Box::pin(async move {
                if let Some(rx) = rx {
                    let _ = rx.await;
                }
                Ok("blocker")
            }) as BoxFuture<'static, Result<&'static str, LlmError>>
        };
        (tx, task)
    }

    fn recording(
        order: Arc<Mutex<Vec<&'static str>>>,
        label: &'static str,
    ) -> impl FnMut() -> futures::future::Ready<Result<&'static str, LlmError>> + Send + 'static
    {
        move || {
            order.lock().unwrap().push(label);
            futures::future::ready(Ok(label))
        }
    }

    #[test]
    fn priority_parses_and_ranks() {
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
        assert!(Priority::Critical.rank() < Priority::Background.rank());
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[tokio::test]
    async fn dequeues_by_priority_then_fifo() {
        let queue = test_queue::<&'static str>(1);
        let owner = AgentId::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let (gate, blocker) = gated();
        let blocker = queue.submit(owner, Priority::Normal, blocker);

        let pending = vec![
            queue.submit(owner, Priority::Background, recording(order.clone(), "background")),
            queue.submit(owner, Priority::Normal, recording(order.clone(), "normal-1")),
            queue.submit(owner, Priority::Critical, recording(order.clone(), "critical")),
            queue.submit(owner, Priority::High, recording(order.clone(), "high")),
            queue.submit(owner, Priority::Normal, recording(order.clone(), "normal-2")),
        ];
        assert_eq!(queue.metrics().queued, 5);

        gate.send(()).unwrap();
        assert_eq!(blocker.await.unwrap(), "blocker");
        for p in pending {
            p.await.unwrap();
        }

        assert_eq!(
            *order.lock().unwrap(),
            vec!["critical", "high", "normal-1", "normal-2", "background"]
        );
    }

    #[tokio::test]
    async fn never_exceeds_concurrency_limit() {
        let queue = test_queue::<usize>(2);
        let owner = AgentId::new();
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let current = current.clone();
                let peak = peak.clone();
                queue.submit(owner, Priority::Normal, move || {
                    let current = current.clone();
                    let peak = peak.clone();
                    async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        Ok(i)
                    }
                })
            })
            .collect();

        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(queue.metrics().processed, 4);
    }

    #[tokio::test]
    async fn cancel_only_affects_owner_pending_items() {
        let queue = test_queue::<&'static str>(1);
        let (a, b) = (AgentId::new(), AgentId::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let (gate, blocker) = gated();
        let blocker = queue.submit(a, Priority::Normal, blocker);
        let a_item = queue.submit(a, Priority::Normal, recording(order.clone(), "a"));
        let b_item = queue.submit(b, Priority::Normal, recording(order.clone(), "b"));

        assert_eq!(queue.cancel(&a), 1);
        let err = a_item.await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), "Cancelled");

        gate.send(()).unwrap();
        // Running item is not interrupted.
        assert_eq!(blocker.await.unwrap(), "blocker");
        assert_eq!(b_item.await.unwrap(), "b");
        assert_eq!(*order.lock().unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn cancel_keeps_interleaved_items_of_other_owners_in_order() {
        let queue = test_queue::<&'static str>(1);
        let (a, b) = (AgentId::new(), AgentId::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let (gate, blocker) = gated();
        let blocker = queue.submit(a, Priority::Normal, blocker);
        let a1 = queue.submit(a, Priority::Normal, recording(order.clone(), "a1"));
        let b1 = queue.submit(b, Priority::Normal, recording(order.clone(), "b1"));
        let a2 = queue.submit(a, Priority::High, recording(order.clone(), "a2"));
        let b2 = queue.submit(b, Priority::Low, recording(order.clone(), "b2"));
        let b3 = queue.submit(b, Priority::High, recording(order.clone(), "b3"));

        assert_eq!(queue.cancel(&a), 2);
        assert_eq!(queue.metrics().queued, 3);
        assert!(a1.await.unwrap_err().is_cancelled());
        assert!(a2.await.unwrap_err().is_cancelled());

        gate.send(()).unwrap();
        blocker.await.unwrap();
        for item in [b1, b2, b3] {
            item.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["b3", "b1", "b2"]);
    }

    #[tokio::test]
    async fn cancel_all_rejects_every_pending_item() {
        let queue = test_queue::<&'static str>(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let (gate, blocker) = gated();
        let blocker = queue.submit(AgentId::new(), Priority::Normal, blocker);
        let x = queue.submit(AgentId::new(), Priority::High, recording(order.clone(), "x"));
        let y = queue.submit(AgentId::new(), Priority::Low, recording(order.clone(), "y"));

        assert_eq!(queue.cancel_all(), 2);
        assert!(x.await.unwrap_err().is_cancelled());
        assert!(y.await.unwrap_err().is_cancelled());

        gate.send(()).unwrap();
        blocker.await.unwrap();
        assert!(order.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rate_limited_task_is_retried_after_cooldown() {
        let queue = test_queue::<usize>(2);
        let attempts = Arc::new(AtomicUsize::new(0));
        let started = Instant::now();

        let counter = attempts.clone();
        let result = queue
            .enqueue(AgentId::new(), Priority::Normal, move || {
                let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if attempt == 1 {
                        Err(LlmError::rate_limited("429 Too Many Requests", None))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() >= Duration::from_millis(50));

        let metrics = queue.metrics();
        assert_eq!(metrics.errors, 0);
        assert_eq!(metrics.processed, 1);
        assert!(!metrics.paused);
    }

    #[tokio::test]
    async fn rate_limit_pauses_all_priorities() {
        let queue = test_queue::<&'static str>(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let attempts = Arc::new(AtomicUsize::new(0));

        let counter = attempts.clone();
        let log = order.clone();
        let limited = queue.submit(AgentId::new(), Priority::Low, move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            log.lock().unwrap().push("limited");
            async move {
                if attempt == 0 {
                    Err(LlmError::rate_limited("slow down", None))
                } else {
                    Ok("limited")
                }
            }
        });
        let critical =
            queue.submit(AgentId::new(), Priority::Critical, recording(order.clone(), "critical"));

        limited.await.unwrap();
        critical.await.unwrap();

        // The requeued item went to the very front, ahead of the critical one.
        assert_eq!(
            *order.lock().unwrap(),
            vec!["limited", "limited", "critical"]
        );
    }

    #[tokio::test]
    async fn non_retryable_failure_is_reported_and_counted() {
        let queue = test_queue::<&'static str>(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let failing = queue.submit(AgentId::new(), Priority::High, || async {
            Err(LlmError::client_error(400, "bad request"))
        });
        let ok = queue.submit(AgentId::new(), Priority::Normal, recording(order, "ok"));

        match failing.await {
            Err(QueueError::Failed(e)) => assert_eq!(e.status_code, Some(400)),
            other => panic!("expected failure, got {:?}", other.map(|_| ())),
        }
        assert_eq!(ok.await.unwrap(), "ok");

        let metrics = queue.metrics();
        assert_eq!(metrics.errors, 1);
        assert_eq!(metrics.processed, 1);
        assert_eq!(metrics.queued, 0);
        assert_eq!(metrics.in_flight, 0);
    }

    #[tokio::test]
    async fn panicking_task_fails_and_frees_its_slot() {
        let queue = test_queue::<&'static str>(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let panicking = queue.submit(AgentId::new(), Priority::Normal, || async {
            if true {
                panic!("model client blew up");
            }
            Ok("unreachable")
        });
        let next = queue.submit(AgentId::new(), Priority::Normal, recording(order, "next"));

        match panicking.await {
            Err(QueueError::Panicked(message)) => assert_eq!(message, "model client blew up"),
            other => panic!("expected a panic error, got {:?}", other.map(|_| ())),
        }
        let next = tokio::time::timeout(Duration::from_secs(2), next)
            .await
            .expect("queue stalled after a panic");
        assert_eq!(next.unwrap(), "next");

        let metrics = queue.metrics();
        assert_eq!(metrics.in_flight, 0);
        assert_eq!(metrics.errors, 1);
        assert_eq!(metrics.processed, 1);
    }
}
