//! Unified dev/fix pool: one worker budget shared by two task types, with
//! fix tasks preempting admission over new dev work.
//!
//! Rather than relying on `Priority::FIX`'s numeric value to sort first in a
//! single heap (it sorts last under the "lower number wins" convention, by
//! design — see [`crate::task::Priority`]), this pool keeps dev and fix work
//! in two separate priority queues and always drains the fix queue before
//! the dev queue. That is the actual shape of "fixes preempt admission":
//! whenever a fix task is waiting, it is dispatched next, regardless of how
//! deep the dev queue's priority 1 work runs.

use crate::error::{PipelineError, Result};
use crate::queue::{PriorityTaskQueue, QueueStats, WorkQueue};
use crate::task::{Task, TaskType};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DevFixStats {
    pub dev: QueueStats,
    pub fix: QueueStats,
}

/// Routes tasks to one of two internal queues by [`TaskType`] and drains
/// the fix queue with strict priority over the dev queue.
pub struct DevFixQueue {
    dev: Arc<PriorityTaskQueue>,
    fix: Arc<PriorityTaskQueue>,
}

impl DevFixQueue {
    pub fn new(dev_capacity: usize, fix_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            dev: Arc::new(PriorityTaskQueue::new("dev", dev_capacity)),
            fix: Arc::new(PriorityTaskQueue::new("fix", fix_capacity)),
        })
    }

    pub fn submit(&self, task: Task) -> Result<()> {
        match task.task_type() {
            TaskType::Fix => self.fix.put(task),
            TaskType::Dev => self.dev.put(task),
            other => Err(PipelineError::MalformedPlan(format!(
                "dev/fix pool cannot accept task type {other}"
            ))),
        }
    }

    pub fn dev_queue(&self) -> &Arc<PriorityTaskQueue> {
        &self.dev
    }

    pub fn fix_queue(&self) -> &Arc<PriorityTaskQueue> {
        &self.fix
    }

    pub fn stats(&self) -> DevFixStats {
        DevFixStats {
            dev: self.dev.stats(),
            fix: self.fix.stats(),
        }
    }
}

#[async_trait]
impl WorkQueue for DevFixQueue {
    async fn get(&self) -> Result<Task> {
        loop {
            // Non-blocking check: if a fix task is already waiting, take it
            // immediately rather than racing it against the dev queue.
            if let Some(task) = self.fix.try_get() {
                debug!(task_id = %task.id, "fix task preempting admission");
                return Ok(task);
            }

            tokio::select! {
                biased;
                fix_task = self.fix.get() => return fix_task,
                dev_task = self.dev.get() => return dev_task,
            }
        }
    }

    fn task_done(&self, task_id: &str, success: bool, duration: Duration) {
        // Both queues track in-flight tasks by id independently; try dev
        // first since it is the common case, falling back to fix.
        if self.dev.has_in_flight(task_id) {
            self.dev.task_done(task_id, success, duration);
        } else {
            self.fix.task_done(task_id, success, duration);
        }
    }

    fn retry(&self, task: Task) -> Result<()> {
        match task.task_type() {
            TaskType::Fix => self.fix.retry(task),
            _ => self.dev.retry(task),
        }
    }

    fn depth(&self) -> usize {
        self.dev.depth() + self.fix.depth()
    }

    async fn wait_until_empty(&self) {
        tokio::join!(self.dev.wait_until_empty(), self.fix.wait_until_empty());
    }
}
