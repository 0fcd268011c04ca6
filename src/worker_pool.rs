//! Auto-scaling worker pool: N workers pulling from a shared priority queue,
//! scaled up/down by a monitor loop reacting to queue depth.

use crate::error::Result;
use crate::queue::WorkQueue;
use crate::task::Task;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Injected callable that does the actual work for a dequeued task.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    async fn process(&self, task: &Task) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub scale_up_threshold: usize,
    pub scale_down_threshold: usize,
    pub scale_check_interval_secs: u64,
    pub task_deadline_secs: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: num_cpus::get().max(1),
            scale_up_threshold: 10,
            scale_down_threshold: 2,
            scale_check_interval_secs: 5,
            task_deadline_secs: 60,
            shutdown_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerPoolStats {
    pub worker_count: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub scale_ups: u64,
    pub scale_downs: u64,
}

struct WorkerHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
    busy: Arc<AtomicBool>,
}

/// Pool of workers draining a [`SharedQueue`], auto-scaled by a monitor loop.
/// Failed tasks are handed back to the queue's retry path; tasks whose
/// retries are exhausted invoke `on_exhausted` (typically diverting to the
/// event router's DLQ).
pub struct WorkerPool {
    name: String,
    queue: Arc<dyn WorkQueue>,
    processor: Arc<dyn TaskProcessor>,
    on_exhausted: Arc<dyn Fn(Task) + Send + Sync>,
    config: WorkerPoolConfig,
    cancel: CancellationToken,
    workers: tokio::sync::Mutex<Vec<WorkerHandle>>,
    next_worker_id: AtomicUsize,
    scale_ups: AtomicUsize,
    scale_downs: AtomicUsize,
    monitor_handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        name: impl Into<String>,
        queue: Arc<dyn WorkQueue>,
        processor: Arc<dyn TaskProcessor>,
        on_exhausted: Arc<dyn Fn(Task) + Send + Sync>,
        config: WorkerPoolConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            queue,
            processor,
            on_exhausted,
            config,
            cancel: CancellationToken::new(),
            workers: tokio::sync::Mutex::new(Vec::new()),
            next_worker_id: AtomicUsize::new(0),
            scale_ups: AtomicUsize::new(0),
            scale_downs: AtomicUsize::new(0),
            monitor_handle: tokio::sync::Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn `min_workers` and start the scaling monitor.
    pub async fn start(self: &Arc<Self>) {
        for _ in 0..self.config.min_workers {
            self.spawn_worker().await;
        }

        let pool = Arc::clone(self);
        let handle = tokio::spawn(async move { pool.monitor_loop().await });
        *self.monitor_handle.lock().await = Some(handle);

        info!(pool = %self.name, workers = self.config.min_workers, "worker pool started");
    }

    async fn spawn_worker(self: &Arc<Self>) {
        let worker_id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);
        let token = self.cancel.child_token();
        let pool = Arc::clone(self);
        let worker_token = token.clone();
        let busy = Arc::new(AtomicBool::new(false));
        let worker_busy = Arc::clone(&busy);

        let join = tokio::spawn(async move {
            pool.worker_loop(worker_id, worker_token, worker_busy).await;
        });

        self.workers.lock().await.push(WorkerHandle { token, join, busy });
        debug!(pool = %self.name, worker_id, "worker spawned");
    }

    /// Resize directly to `target` workers, bypassing the scale thresholds.
    /// Used for an operator-driven resize rather than the depth-reactive
    /// monitor loop.
    pub async fn scale_to(self: &Arc<Self>, target: usize) {
        let target = target.clamp(self.config.min_workers, self.config.max_workers);
        let current = self.workers.lock().await.len();
        if target > current {
            for _ in 0..(target - current) {
                self.spawn_worker().await;
            }
        } else {
            for _ in 0..(current - target) {
                self.retire_one_worker().await;
            }
        }
    }

    /// Forced retire used by an operator-driven `scale_to`: drops the
    /// youngest worker regardless of whether it is mid-task.
    async fn retire_one_worker(&self) {
        let mut workers = self.workers.lock().await;
        if let Some(handle) = workers.pop() {
            handle.token.cancel();
        }
    }

    /// Retire the youngest worker only if it is idle. Used by the scaling
    /// monitor, which must never cancel a worker mid-task. Returns whether a
    /// worker was actually retired.
    async fn retire_idle_youngest(&self) -> bool {
        let mut workers = self.workers.lock().await;
        let idle = matches!(workers.last(), Some(handle) if !handle.busy.load(Ordering::SeqCst));
        if !idle {
            return false;
        }
        if let Some(handle) = workers.pop() {
            handle.token.cancel();
        }
        true
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, token: CancellationToken, busy: Arc<AtomicBool>) {
        loop {
            let task = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                result = self.queue.get() => result,
            };

            let mut task = match task {
                Ok(task) => task,
                Err(_) => break, // queue closed
            };

            let worker_name = format!("{}-{worker_id}", self.name);
            if task.start(&worker_name).is_err() {
                continue;
            }

            busy.store(true, Ordering::SeqCst);
            let deadline = Duration::from_secs(self.config.task_deadline_secs);
            let started = Instant::now();
            let outcome = tokio::time::timeout(deadline, self.processor.process(&task)).await;
            busy.store(false, Ordering::SeqCst);

            let elapsed = started.elapsed();
            match outcome {
                Ok(Ok(())) => {
                    let _ = task.complete();
                    self.queue.task_done(&task.id, true, elapsed);
                }
                Ok(Err(e)) => {
                    let category = e.category();
                    let _ = task.fail(e.to_string(), category);
                    self.queue.task_done(&task.id, false, elapsed);
                    self.hand_off_failure(task);
                }
                Err(_) => {
                    let _ = task.fail("task deadline exceeded", crate::error::ErrorCategory::Transient);
                    self.queue.task_done(&task.id, false, elapsed);
                    self.hand_off_failure(task);
                }
            }
        }
        debug!(pool = %self.name, worker_id, "worker exited");
    }

    fn hand_off_failure(&self, task: Task) {
        let fallback = task.clone();
        match self.queue.retry(task) {
            Ok(()) => {}
            Err(crate::error::PipelineError::RouterExhausted { .. }) => {
                warn!(pool = %self.name, task_id = %fallback.id, "retries exhausted, handing off to escalation");
                (self.on_exhausted)(fallback);
            }
            Err(e) => {
                warn!(pool = %self.name, error = %e, "failed to requeue task");
            }
        }
    }

    async fn monitor_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.scale_check_interval_secs.max(1));
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let depth = self.queue.depth();
            let n = self.workers.lock().await.len();

            if depth > self.config.scale_up_threshold && n < self.config.max_workers {
                self.spawn_worker().await;
                self.scale_ups.fetch_add(1, Ordering::Relaxed);
                info!(pool = %self.name, depth, workers = n + 1, "scaled up");
            } else if depth < self.config.scale_down_threshold && n > self.config.min_workers {
                if self.retire_idle_youngest().await {
                    self.scale_downs.fetch_add(1, Ordering::Relaxed);
                    info!(pool = %self.name, depth, workers = n.saturating_sub(1), "scaled down");
                } else {
                    debug!(pool = %self.name, depth, "scale down skipped, youngest worker busy");
                }
            }
        }
    }

    pub fn stats_sync(&self, worker_count: usize) -> WorkerPoolStats {
        WorkerPoolStats {
            worker_count,
            min_workers: self.config.min_workers,
            max_workers: self.config.max_workers,
            scale_ups: self.scale_ups.load(Ordering::Relaxed) as u64,
            scale_downs: self.scale_downs.load(Ordering::Relaxed) as u64,
        }
    }

    pub async fn stats(&self) -> WorkerPoolStats {
        let n = self.workers.lock().await.len();
        self.stats_sync(n)
    }

    /// Stop the pool. `graceful=true` stops admission, waits up to
    /// `shutdown_timeout_secs` for in-flight tasks, then cancels whatever
    /// remains. `graceful=false` aborts immediately.
    pub async fn stop(&self, graceful: bool) {
        self.cancel.cancel();
        if let Some(handle) = self.monitor_handle.lock().await.take() {
            handle.abort();
        }

        let mut workers = self.workers.lock().await;
        if graceful {
            let timeout = Duration::from_secs(self.config.shutdown_timeout_secs);
            let joins: Vec<JoinHandle<()>> = workers.drain(..).map(|w| w.join).collect();
            let all = futures::future::join_all(joins);
            if tokio::time::timeout(timeout, all).await.is_err() {
                warn!(pool = %self.name, "graceful shutdown timed out, in-flight tasks abandoned");
            }
        } else {
            for w in workers.drain(..) {
                w.join.abort();
            }
        }
        info!(pool = %self.name, graceful, "worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::PriorityTaskQueue;
    use crate::task::{Priority, TaskPayload};
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    fn dev_task(id: &str) -> Task {
        Task::new(
            id,
            TaskPayload::Dev {
                target_path: format!("{id}.py"),
                language_hint: None,
                instructions: "x".to_string(),
                extra: serde_json::Value::Null,
            },
            Priority::NORMAL,
        )
    }

    struct CountingProcessor {
        calls: Arc<StdAtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl TaskProcessor for CountingProcessor {
        async fn process(&self, _task: &Task) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(crate::error::PipelineError::StageExecutionFailed("boom".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_pool_processes_tasks() {
        let queue = Arc::new(PriorityTaskQueue::new("dev", 10));
        queue.put(dev_task("a")).unwrap();
        queue.put(dev_task("b")).unwrap();

        let calls = Arc::new(StdAtomicUsize::new(0));
        let processor = Arc::new(CountingProcessor {
            calls: calls.clone(),
            fail: false,
        });

        let pool = WorkerPool::new(
            "dev",
            queue.clone(),
            processor,
            Arc::new(|_| {}),
            WorkerPoolConfig {
                min_workers: 2,
                max_workers: 2,
                ..Default::default()
            },
        );
        pool.start().await;

        queue.wait_until_empty().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        pool.stop(true).await;
    }

    #[tokio::test]
    async fn test_failed_task_is_retried_then_exhausted() {
        let queue = Arc::new(PriorityTaskQueue::new("dev", 10));
        let mut task = dev_task("a");
        task.max_retries = 1;
        queue.put(task).unwrap();

        let calls = Arc::new(StdAtomicUsize::new(0));
        let processor = Arc::new(CountingProcessor {
            calls: calls.clone(),
            fail: true,
        });

        let exhausted = Arc::new(StdAtomicUsize::new(0));
        let exhausted2 = exhausted.clone();

        let pool = WorkerPool::new(
            "dev",
            queue.clone(),
            processor,
            Arc::new(move |_task| {
                exhausted2.fetch_add(1, Ordering::SeqCst);
            }),
            WorkerPoolConfig {
                min_workers: 1,
                max_workers: 1,
                ..Default::default()
            },
        );
        pool.start().await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        // one initial attempt + one retry = 2 calls, then exhausted
        assert!(calls.load(Ordering::SeqCst) >= 2);
        assert_eq!(exhausted.load(Ordering::SeqCst), 1);

        pool.stop(false).await;
    }

    #[tokio::test]
    async fn test_graceful_stop_drains_queue() {
        let queue = Arc::new(PriorityTaskQueue::new("dev", 10));
        for i in 0..3 {
            queue.put(dev_task(&format!("t{i}"))).unwrap();
        }
        let calls = Arc::new(StdAtomicUsize::new(0));
        let processor = Arc::new(CountingProcessor {
            calls: calls.clone(),
            fail: false,
        });
        let pool = WorkerPool::new(
            "dev",
            queue.clone(),
            processor,
            Arc::new(|_| {}),
            WorkerPoolConfig {
                min_workers: 1,
                max_workers: 1,
                ..Default::default()
            },
        );
        pool.start().await;
        queue.wait_until_empty().await;
        pool.stop(true).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    struct GatedProcessor {
        calls: Arc<StdAtomicUsize>,
        gate: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl TaskProcessor for GatedProcessor {
        async fn process(&self, _task: &Task) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_idle_retire_refuses_to_cancel_a_busy_worker() {
        let queue = Arc::new(PriorityTaskQueue::new("dev", 10));
        let gate = Arc::new(tokio::sync::Notify::new());
        let calls = Arc::new(StdAtomicUsize::new(0));
        let processor = Arc::new(GatedProcessor {
            calls: calls.clone(),
            gate: gate.clone(),
        });

        let pool = WorkerPool::new(
            "dev",
            queue.clone(),
            processor,
            Arc::new(|_| {}),
            WorkerPoolConfig {
                min_workers: 1,
                max_workers: 1,
                ..Default::default()
            },
        );
        pool.start().await;
        queue.put(dev_task("a")).unwrap();

        while calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(!pool.retire_idle_youngest().await);
        assert_eq!(pool.workers.lock().await.len(), 1);

        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(pool.retire_idle_youngest().await);
        assert_eq!(pool.workers.lock().await.len(), 0);
    }
}
