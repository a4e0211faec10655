//! Task Queue
//!
//! Keyed scheduler for sync and maintenance work. Work for one key never
//! overlaps; distinct keys run concurrently up to `max_concurrency`.
//!
//! - at most one pending entry per key: a later `add` replaces the pending
//!   entry's version and body in place
//! - an `add` whose version equals the in-flight run's version is dropped
//! - the runner takes entries in arrival order but skips keys that are
//!   already running, so one busy key does not block the others
//!
//! Task failures are logged and swallowed; a task that needs its outcome
//! observed must report it itself.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type TaskFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Where a new entry enters the pending list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    /// Tail of the list
    #[default]
    Normal,
    /// Head of the list
    High,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddOptions {
    /// Version of the work, used to drop re-triggers of an in-flight run.
    /// Entries without a version are never dropped.
    pub version: Option<String>,
    pub priority: Priority,
}

impl AddOptions {
    pub fn versioned(version: impl Into<String>) -> Self {
        Self {
            version: Some(version.into()),
            priority: Priority::Normal,
        }
    }

    pub fn high(mut self) -> Self {
        self.priority = Priority::High;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub max_concurrency: usize,
    /// After running dry, wait this long before picking up new work so
    /// bursts of adds coalesce. `wait()` cuts the delay short.
    pub delay_when_empty: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            delay_when_empty: Duration::ZERO,
        }
    }
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Entries waiting to run
    pub pending: usize,
    /// Entries currently running
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    /// Adds folded into an existing pending entry or dropped as in flight
    pub coalesced: usize,
}

struct PendingEntry {
    version: Option<String>,
    run: TaskFn,
}

#[derive(Default)]
struct QueueState {
    order: VecDeque<String>,
    entry_by_key: HashMap<String, PendingEntry>,
    /// In-flight keys and the version each is running.
    active: HashMap<String, Option<String>>,
    pause_count: usize,
    running: bool,
    options: QueueOptions,
}

impl QueueState {
    /// Nothing more will happen without a new `add` or `start`.
    fn is_settled(&self) -> bool {
        self.active.is_empty() && (self.order.is_empty() || !self.running)
    }

    /// Move the first runnable entry from pending to active.
    fn take_next(&mut self) -> Option<(String, PendingEntry)> {
        if self.pause_count > 0 || self.active.len() >= self.options.max_concurrency {
            return None;
        }
        let position = self
            .order
            .iter()
            .position(|key| !self.active.contains_key(key))?;
        let key = self.order.remove(position)?;
        let entry = self.entry_by_key.remove(&key)?;
        self.active.insert(key.clone(), entry.version.clone());
        Some((key, entry))
    }
}

struct Shared {
    state: Mutex<QueueState>,
    stats: RwLock<QueueStats>,
    /// Runner wake-up: new work, freed capacity, unpause or stop.
    wake: Notify,
    skip_delay: Notify,
    /// Fired whenever the queue settles.
    idle: Notify,
}

impl Shared {
    fn refresh_counts(&self, state: &QueueState) {
        let mut stats = self.stats.write();
        stats.pending = state.order.len();
        stats.active = state.active.len();
    }
}

/// Keyed, priority-aware scheduler with bounded concurrency.
pub struct TaskQueue {
    shared: Arc<Shared>,
    runner: Mutex<Option<JoinHandle<()>>>,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                stats: RwLock::new(QueueStats::default()),
                wake: Notify::new(),
                skip_delay: Notify::new(),
                idle: Notify::new(),
            }),
            runner: Mutex::new(None),
        }
    }

    /// Schedule `task` under `key`.
    pub fn add<F, Fut>(&self, key: impl Into<String>, options: AddOptions, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let key = key.into();
        let run: TaskFn = Box::new(move || task().boxed());
        let mut state = self.shared.state.lock();

        if let Some(existing) = state.entry_by_key.get_mut(&key) {
            existing.version = options.version;
            existing.run = run;
            if options.priority == Priority::High {
                if let Some(position) = state.order.iter().position(|k| *k == key) {
                    state.order.remove(position);
                }
                state.order.push_front(key.clone());
            }
            self.shared.stats.write().coalesced += 1;
            debug!(key = %key, "Replaced pending task");
            return;
        }

        if options.version.is_some() && state.active.get(&key) == Some(&options.version) {
            self.shared.stats.write().coalesced += 1;
            debug!(key = %key, version = ?options.version, "Task already running at this version");
            return;
        }

        match options.priority {
            Priority::High => state.order.push_front(key.clone()),
            Priority::Normal => state.order.push_back(key.clone()),
        }
        state.entry_by_key.insert(
            key.clone(),
            PendingEntry {
                version: options.version,
                run,
            },
        );
        self.shared.refresh_counts(&state);
        drop(state);

        debug!(key = %key, "Queued task");
        self.shared.wake.notify_one();
    }

    /// Start the runner. A second call while running is a no-op.
    pub fn start(&self, options: QueueOptions) {
        {
            let mut state = self.shared.state.lock();
            if state.running {
                return;
            }
            state.running = true;
            state.options = QueueOptions {
                max_concurrency: options.max_concurrency.max(1),
                ..options
            };
        }

        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            Self::run_loop(shared).await;
        });
        *self.runner.lock() = Some(handle);
        info!(
            max_concurrency = options.max_concurrency,
            delay_when_empty_ms = options.delay_when_empty.as_millis() as u64,
            "Started task queue"
        );
    }

    /// Stop picking up pending entries and wait for active ones to finish.
    /// Pending entries stay queued for a later `start`.
    pub async fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
        }
        self.shared.wake.notify_one();

        let runner = self.runner.lock().take();
        if let Some(handle) = runner {
            let _ = handle.await;
        }
        self.wait_until(|state| state.active.is_empty()).await;
        info!("Stopped task queue");
    }

    /// Hold back new runs until every `pause` is matched by an `unpause`.
    pub fn pause(&self) {
        self.shared.state.lock().pause_count += 1;
    }

    pub fn unpause(&self) {
        let resumed = {
            let mut state = self.shared.state.lock();
            state.pause_count = state.pause_count.saturating_sub(1);
            state.pause_count == 0
        };
        if resumed {
            self.shared.wake.notify_one();
        }
    }

    /// Resolve once nothing is pending or running. A stopped queue resolves
    /// as soon as its active work is done.
    pub async fn wait(&self) {
        if self.shared.state.lock().is_settled() {
            return;
        }
        self.shared.skip_delay.notify_one();
        self.shared.wake.notify_one();
        self.wait_until(QueueState::is_settled).await;
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    pub fn is_empty(&self) -> bool {
        let state = self.shared.state.lock();
        state.order.is_empty() && state.active.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        self.shared.stats.read().clone()
    }

    async fn wait_until(&self, condition: impl Fn(&QueueState) -> bool) {
        loop {
            let idle = self.shared.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if condition(&*self.shared.state.lock()) {
                return;
            }
            idle.await;
        }
    }

    async fn run_loop(shared: Arc<Shared>) {
        debug!("Task queue runner started");
        loop {
            let (started, ran_dry, delay) = {
                let mut state = shared.state.lock();
                if !state.running {
                    break;
                }
                let mut started = Vec::new();
                while let Some(next) = state.take_next() {
                    started.push(next);
                }
                shared.refresh_counts(&state);
                (
                    started,
                    state.order.is_empty() && state.active.is_empty(),
                    state.options.delay_when_empty,
                )
            };

            if !started.is_empty() {
                for (key, entry) in started {
                    Self::spawn_task(Arc::clone(&shared), key, entry);
                }
                continue;
            }

            shared.wake.notified().await;
            if ran_dry && !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shared.skip_delay.notified() => {}
                }
            }
        }

        // Stopping may settle a queue that still has pending entries.
        if shared.state.lock().is_settled() {
            shared.idle.notify_waiters();
        }
        debug!("Task queue runner exited");
    }

    fn spawn_task(shared: Arc<Shared>, key: String, entry: PendingEntry) {
        debug!(key = %key, version = ?entry.version, "Running task");
        tokio::spawn(async move {
            let started = Instant::now();
            // Run in a nested task so a panicking body still releases its key.
            let outcome = tokio::spawn((entry.run)()).await;
            let failed = match outcome {
                Ok(Ok(())) => false,
                Ok(Err(err)) => {
                    warn!(key = %key, error = %err, "Task failed");
                    true
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "Task panicked");
                    true
                }
            };

            let settled = {
                let mut state = shared.state.lock();
                state.active.remove(&key);
                {
                    let mut stats = shared.stats.write();
                    if failed {
                        stats.failed += 1;
                    } else {
                        stats.completed += 1;
                    }
                }
                shared.refresh_counts(&state);
                state.is_settled()
            };
            debug!(
                key = %key,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Task finished"
            );

            shared.wake.notify_one();
            if settled || !shared.state.lock().running {
                shared.idle.notify_waiters();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_wait_on_empty_queue_resolves() {
        let queue = TaskQueue::new();
        queue.start(QueueOptions::default());
        assert!(queue.is_empty());
        queue.wait().await;
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_failed_task_is_counted_not_fatal() {
        let queue = TaskQueue::new();
        queue.start(QueueOptions::default());
        queue.add("bad", AddOptions::default(), || async { Err(anyhow::anyhow!("boom")) });
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        queue.add("good", AddOptions::default(), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        queue.wait().await;

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        let stats = queue.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 1);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_panicking_task_releases_key() {
        let queue = TaskQueue::new();
        queue.start(QueueOptions::default());
        queue.add("k", AddOptions::default(), || async {
            let explode = true;
            if explode {
                panic!("task panicked");
            }
            Ok(())
        });
        queue.wait().await;

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        queue.add("k", AddOptions::default(), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        queue.wait().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_pause_is_reference_counted() {
        let queue = TaskQueue::new();
        queue.start(QueueOptions::default());
        queue.pause();
        queue.pause();

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        queue.add("k", AddOptions::default(), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        queue.unpause();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(!queue.is_empty());

        queue.unpause();
        queue.wait().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_high_priority_runs_first() {
        let queue = TaskQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for key in ["a", "b"] {
            let order = order.clone();
            queue.add(key, AddOptions::default(), move || async move {
                order.lock().push(key);
                Ok(())
            });
        }
        let urgent = order.clone();
        queue.add("c", AddOptions::default().high(), move || async move {
            urgent.lock().push("c");
            Ok(())
        });

        queue.start(QueueOptions {
            max_concurrency: 1,
            delay_when_empty: Duration::ZERO,
        });
        queue.wait().await;
        assert_eq!(*order.lock(), vec!["c", "a", "b"]);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_stop_leaves_pending_entries() {
        let queue = TaskQueue::new();
        queue.start(QueueOptions {
            max_concurrency: 1,
            delay_when_empty: Duration::ZERO,
        });
        queue.add("slow", AddOptions::default(), || async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        queue.add("next", AddOptions::default(), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        queue.stop().await;
        assert_eq!(queue.stats().completed, 1);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(!queue.is_empty());
    }
}
