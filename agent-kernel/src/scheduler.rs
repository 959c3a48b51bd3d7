//! Background task registry for one agent.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::{Semaphore, oneshot};
use tokio::task::AbortHandle;
use tracing::debug;

const DEFAULT_MAX_CONCURRENCY: NonZeroUsize = match NonZeroUsize::new(32) {
    Some(limit) => limit,
    None => NonZeroUsize::MIN,
};

/// Maximum number of kickoff tasks allowed to run at once per agent.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    max_concurrency: NonZeroUsize,
}

impl SchedulerConfig {
    /// Creates a new configuration with the supplied concurrency limit.
    #[must_use]
    pub const fn new(max_concurrency: NonZeroUsize) -> Self {
        Self { max_concurrency }
    }

    /// Returns the configured concurrency limit.
    #[must_use]
    pub const fn max_concurrency(self) -> NonZeroUsize {
        self.max_concurrency
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENCY)
    }
}

/// Handle to a task spawned through a [`TaskScheduler`].
#[derive(Debug)]
pub struct TaskHandle {
    id: u64,
    name: &'static str,
    abort: AbortHandle,
}

impl TaskHandle {
    /// Returns the scheduler-assigned identifier.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Returns the label given at spawn time.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Cancels the task at its next suspension point.
    pub fn abort(&self) {
        self.abort.abort();
    }

    /// Returns `true` once the task completed or was cancelled.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

struct Tracked {
    name: &'static str,
    abort: AbortHandle,
}

/// Spawns and tracks an agent's background tasks so they can be cancelled
/// individually or all at once.
///
/// Clones share the same registry.
#[derive(Clone)]
pub struct TaskScheduler {
    semaphore: Arc<Semaphore>,
    tasks: Arc<Mutex<HashMap<u64, Tracked>>>,
    next_id: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
    config: SchedulerConfig,
}

impl fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("config", &self.config)
            .field("active", &self.active_tasks())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl TaskScheduler {
    /// Constructs a scheduler using the provided configuration.
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        let permits = config.max_concurrency().get();
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            closed: Arc::new(AtomicBool::new(false)),
            config,
        }
    }

    /// Returns the associated configuration.
    #[must_use]
    pub const fn config(&self) -> SchedulerConfig {
        self.config
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) ran.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns the number of tasks that have not finished yet.
    #[must_use]
    pub fn active_tasks(&self) -> usize {
        lock(&self.tasks).len()
    }

    /// Spawns a long-lived background task.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Closed`] after shutdown.
    pub fn spawn<F>(&self, name: &'static str, future: F) -> SchedulerResult<TaskHandle>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.track(name, future)
    }

    /// Spawns a task that waits for one of the configured concurrency permits
    /// before running.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Closed`] after shutdown.
    pub fn spawn_bounded<F>(&self, name: &'static str, future: F) -> SchedulerResult<TaskHandle>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        self.track(name, async move {
            let Ok(permit) = semaphore.acquire_owned().await else {
                debug!(task = name, "scheduler closed while awaiting permit");
                return;
            };
            future.await;
            drop(permit);
        })
    }

    /// Aborts every tracked task and refuses new ones.
    ///
    /// Returns `true` on the first call and `false` on every later call.
    pub fn shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.semaphore.close();

        let drained: Vec<(u64, Tracked)> = lock(&self.tasks).drain().collect();
        for (id, task) in &drained {
            debug!(task = task.name, id, "aborting background task");
            task.abort.abort();
        }
        debug!(aborted = drained.len(), "scheduler shut down");
        true
    }

    fn track<F>(&self, name: &'static str, future: F) -> SchedulerResult<TaskHandle>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_closed() {
            return Err(SchedulerError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deregister = Deregister {
            registry: Arc::clone(&self.tasks),
            id,
        };
        // The task only starts once it is registered, so it cannot deregister first.
        let (registered, gate) = oneshot::channel::<()>();
        let join = tokio::spawn(async move {
            let _deregister = deregister;
            if gate.await.is_ok() {
                future.await;
            }
        });

        let registered_in_time = {
            let mut tasks = lock(&self.tasks);
            if self.is_closed() {
                false
            } else {
                tasks.insert(
                    id,
                    Tracked {
                        name,
                        abort: join.abort_handle(),
                    },
                );
                true
            }
        };
        if !registered_in_time {
            join.abort();
            return Err(SchedulerError::Closed);
        }
        let _ = registered.send(());

        Ok(TaskHandle {
            id,
            name,
            abort: join.abort_handle(),
        })
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

/// Removes a task from the registry when its future completes or is dropped.
struct Deregister {
    registry: Arc<Mutex<HashMap<u64, Tracked>>>,
    id: u64,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        lock(&self.registry).remove(&self.id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Errors produced by the scheduler.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// Scheduler is closed and will not accept new tasks.
    #[error("scheduler closed")]
    Closed,
}

/// Result alias for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn bounded_tasks_respect_max_concurrency() {
        let config = SchedulerConfig::new(NonZeroUsize::new(2).unwrap());
        let scheduler = TaskScheduler::new(config);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let in_flight = Arc::clone(&in_flight);
            let max_seen = Arc::clone(&max_seen);
            let done = Arc::clone(&done);
            scheduler
                .spawn_bounded("kickoff", async move {
                    let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(current, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        while done.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn finished_tasks_leave_the_registry() {
        let scheduler = TaskScheduler::default();
        let handle = scheduler.spawn("quick", async {}).unwrap();
        while !handle.is_finished() {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(scheduler.active_tasks(), 0);
    }

    #[tokio::test]
    async fn handles_abort_individually() {
        let scheduler = TaskScheduler::default();
        let slow = scheduler
            .spawn("slow", tokio::time::sleep(Duration::from_secs(60)))
            .unwrap();
        let other = scheduler
            .spawn("other", tokio::time::sleep(Duration::from_secs(60)))
            .unwrap();
        assert_eq!(slow.name(), "slow");
        assert_ne!(slow.id(), other.id());

        slow.abort();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(slow.is_finished());
        assert!(!other.is_finished());
        assert_eq!(scheduler.active_tasks(), 1);
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn shutdown_aborts_everything_once() {
        let scheduler = TaskScheduler::default();
        let handle = scheduler
            .spawn("heartbeat", tokio::time::sleep(Duration::from_secs(60)))
            .unwrap();
        assert_eq!(scheduler.active_tasks(), 1);

        assert!(scheduler.shutdown());
        assert!(!scheduler.shutdown());
        assert_eq!(scheduler.active_tasks(), 0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(handle.is_finished());

        let result = scheduler.spawn("late", async {});
        assert_eq!(result.unwrap_err(), SchedulerError::Closed);
    }
}
