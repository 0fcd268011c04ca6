//! Bounded priority task queue: a min-by-priority heap with FIFO tiebreak,
//! retry-with-degrade, and a dead-letter diversion path.

use crate::error::{PipelineError, Result};
use crate::task::Task;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
    pub processed: u64,
    pub failed: u64,
    pub retried: u64,
    pub avg_processing_time_ms: f64,
    pub success_rate: f64,
}

struct Inner {
    heap: BinaryHeap<Task>,
    in_flight: std::collections::HashMap<String, Instant>,
    closed: bool,

    processed: u64,
    failed: u64,
    retried: u64,
    total_processing_time_ms: u64,
}

/// A bounded, priority-ordered task queue.
///
/// `put` fails fast with [`PipelineError::QueueFull`] once `capacity` pending
/// tasks are held; `get` suspends until a task is available, the queue is
/// closed, or the caller's future is dropped/cancelled.
pub struct PriorityTaskQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
    name: String,
    depth_gauge: AtomicU64,
}

impl PriorityTaskQueue {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                in_flight: std::collections::HashMap::new(),
                closed: false,
                processed: 0,
                failed: 0,
                retried: 0,
                total_processing_time_ms: 0,
            }),
            notify: Notify::new(),
            capacity,
            name: name.into(),
            depth_gauge: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a task, failing fast if the queue is saturated.
    pub fn put(&self, task: Task) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(PipelineError::QueueClosed);
        }
        if inner.heap.len() >= self.capacity {
            return Err(PipelineError::QueueFull {
                capacity: self.capacity,
            });
        }
        debug!(queue = %self.name, task_id = %task.id, priority = task.priority.get(), "enqueue");
        inner.heap.push(task);
        self.depth_gauge.store(inner.heap.len() as u64, Ordering::Relaxed);
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    /// Enqueue, waiting up to `timeout` for room if the queue is full.
    pub async fn put_with_timeout(&self, task: Task, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.put(task.clone()) {
                Ok(()) => return Ok(()),
                Err(PipelineError::QueueFull { .. }) => {
                    if Instant::now() >= deadline {
                        return Err(PipelineError::QueueFull {
                            capacity: self.capacity,
                        });
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Pop the highest-priority task, suspending until one is available or
    /// the queue is closed.
    pub async fn get(&self) -> Result<Task> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(task) = inner.heap.pop() {
                    inner.in_flight.insert(task.id.clone(), Instant::now());
                    self.depth_gauge.store(inner.heap.len() as u64, Ordering::Relaxed);
                    return Ok(task);
                }
                if inner.closed {
                    return Err(PipelineError::QueueClosed);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking pop: returns `None` immediately if nothing is pending.
    pub fn try_get(&self) -> Option<Task> {
        let mut inner = self.inner.lock();
        let task = inner.heap.pop()?;
        inner.in_flight.insert(task.id.clone(), Instant::now());
        self.depth_gauge.store(inner.heap.len() as u64, Ordering::Relaxed);
        Some(task)
    }

    pub fn has_in_flight(&self, task_id: &str) -> bool {
        self.inner.lock().in_flight.contains_key(task_id)
    }

    /// Record the outcome of a dequeued task.
    pub fn task_done(&self, task_id: &str, success: bool, duration: Duration) {
        let mut inner = self.inner.lock();
        inner.in_flight.remove(task_id);
        if success {
            inner.processed += 1;
        } else {
            inner.failed += 1;
        }
        inner.total_processing_time_ms += duration.as_millis() as u64;
    }

    /// Re-enqueue a failed task with degraded priority. The caller (router)
    /// is expected to have already called [`Task::prepare_retry`]; if it
    /// errors (retries exhausted), this returns that error so the caller can
    /// divert to the DLQ instead.
    pub fn retry(&self, mut task: Task) -> Result<()> {
        task.prepare_retry()?;
        let mut inner = self.inner.lock();
        inner.retried += 1;
        drop(inner);
        self.put(task)
    }

    /// Block until the queue has no pending or in-flight tasks.
    pub async fn wait_until_empty(&self) {
        loop {
            {
                let inner = self.inner.lock();
                if inner.heap.is_empty() && inner.in_flight.is_empty() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        drop(inner);
        self.notify.notify_waiters();
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        let total = inner.processed + inner.failed;
        let success_rate = if total > 0 {
            inner.processed as f64 / total as f64
        } else {
            0.0
        };
        let avg = if inner.processed + inner.failed > 0 {
            inner.total_processing_time_ms as f64 / (inner.processed + inner.failed) as f64
        } else {
            0.0
        };
        QueueStats {
            pending: inner.heap.len(),
            in_flight: inner.in_flight.len(),
            processed: inner.processed,
            failed: inner.failed,
            retried: inner.retried,
            avg_processing_time_ms: avg,
            success_rate,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth_gauge.load(Ordering::Relaxed) as usize
    }
}

/// Shared handle, the form every other component holds a queue by.
pub type SharedQueue = Arc<PriorityTaskQueue>;

/// Object-safe surface a worker pool needs from whatever it drains — either
/// a plain [`PriorityTaskQueue`] or a composite like the unified dev/fix
/// queue that routes across two underlying queues.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn get(&self) -> Result<Task>;
    fn task_done(&self, task_id: &str, success: bool, duration: Duration);
    fn retry(&self, task: Task) -> Result<()>;
    fn depth(&self) -> usize;
    async fn wait_until_empty(&self);
}

#[async_trait]
impl WorkQueue for PriorityTaskQueue {
    async fn get(&self) -> Result<Task> {
        PriorityTaskQueue::get(self).await
    }

    fn task_done(&self, task_id: &str, success: bool, duration: Duration) {
        PriorityTaskQueue::task_done(self, task_id, success, duration)
    }

    fn retry(&self, task: Task) -> Result<()> {
        PriorityTaskQueue::retry(self, task)
    }

    fn depth(&self) -> usize {
        PriorityTaskQueue::depth(self)
    }

    async fn wait_until_empty(&self) {
        PriorityTaskQueue::wait_until_empty(self).await
    }
}
