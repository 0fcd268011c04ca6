//! Task model: the unit of work flowing through the dev/QA/fix/deploy stages.

use crate::error::{ErrorCategory, PipelineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Monotonic tiebreaker for FIFO ordering within a priority level.
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

fn next_sequence() -> u64 {
    SEQUENCE.fetch_add(1, AtomicOrdering::Relaxed)
}

/// Task kind; determines which queue a task flows through and which agent
/// callable handles it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    Dev,
    Fix,
    Qa,
    Deploy,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Dev => "dev",
            TaskType::Fix => "fix",
            TaskType::Qa => "qa",
            TaskType::Deploy => "deploy",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Priority: lower numeric value means higher scheduling priority.
/// Valid range is `[1, 5]`; fixes are always pinned to [`Priority::FIX`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(u8);

impl Priority {
    pub const CRITICAL: Priority = Priority(1);
    pub const HIGH: Priority = Priority(2);
    pub const NORMAL: Priority = Priority(3);
    pub const LOW: Priority = Priority(4);
    pub const FIX: Priority = Priority(5);

    pub fn new(value: u8) -> Self {
        Priority(value.clamp(1, 5))
    }

    pub fn get(&self) -> u8 {
        self.0
    }

    /// Degrade (numerically increase, i.e. lower priority) by one step,
    /// capped at the lowest priority band.
    pub fn degrade(self) -> Self {
        Priority::new(self.0.saturating_add(1).min(5))
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

/// Opaque agent-specific data the pipeline never interprets.
pub type OpaqueExtra = serde_json::Value;

/// A single QA-reported issue, carried from `QA_FAILED` into a `fix` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub file: String,
    pub line: Option<u32>,
    pub severity: String,
    pub description: String,
    pub suggested_fix: Option<String>,
}

/// Tagged-variant payload: each task type carries only the fields it needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    Dev {
        target_path: String,
        language_hint: Option<String>,
        instructions: String,
        #[serde(default)]
        extra: OpaqueExtra,
    },
    Fix {
        target_path: String,
        issues: Vec<Issue>,
        #[serde(default)]
        extra: OpaqueExtra,
    },
    Qa {
        target_path: String,
        files: Vec<String>,
        #[serde(default)]
        extra: OpaqueExtra,
    },
    Deploy {
        artifact: String,
        #[serde(default)]
        extra: OpaqueExtra,
    },
}

impl TaskPayload {
    pub fn target_path(&self) -> Option<&str> {
        match self {
            TaskPayload::Dev { target_path, .. } => Some(target_path),
            TaskPayload::Fix { target_path, .. } => Some(target_path),
            TaskPayload::Qa { target_path, .. } => Some(target_path),
            TaskPayload::Deploy { .. } => None,
        }
    }

    pub fn task_type(&self) -> TaskType {
        match self {
            TaskPayload::Dev { .. } => TaskType::Dev,
            TaskPayload::Fix { .. } => TaskType::Fix,
            TaskPayload::Qa { .. } => TaskType::Qa,
            TaskPayload::Deploy { .. } => TaskType::Deploy,
        }
    }

    /// Stable, field-order-independent serialization used as the cache key
    /// input: `serde_json::Value` normalizes object key order on its own,
    /// so round-tripping through it is sufficient for canonicalization.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let value = serde_json::to_value(self).map_err(PipelineError::serialization)?;
        serde_json::to_vec(&value).map_err(PipelineError::serialization)
    }
}

/// Task lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskState {
    Queued {
        queued_at: DateTime<Utc>,
    },
    Running {
        started_at: DateTime<Utc>,
        worker_id: String,
    },
    Completed {
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        duration_ms: u64,
    },
    Failed {
        failed_at: DateTime<Utc>,
        error: String,
        error_category: ErrorCategory,
    },
    Cancelled {
        cancelled_at: DateTime<Utc>,
        reason: String,
    },
}

impl TaskState {
    pub fn name(&self) -> &'static str {
        match self {
            TaskState::Queued { .. } => "queued",
            TaskState::Running { .. } => "running",
            TaskState::Completed { .. } => "completed",
            TaskState::Failed { .. } => "failed",
            TaskState::Cancelled { .. } => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed { .. } | TaskState::Failed { .. } | TaskState::Cancelled { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub payload: TaskPayload,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub state: TaskState,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    /// Monotonic tiebreaker; assigned once at construction.
    pub enqueue_sequence: u64,
}

impl Task {
    pub fn new(id: impl Into<String>, payload: TaskPayload, priority: Priority) -> Self {
        let priority = if payload.task_type() == TaskType::Fix {
            Priority::FIX
        } else {
            priority
        };

        Self {
            id: id.into(),
            payload,
            priority,
            created_at: Utc::now(),
            state: TaskState::Queued {
                queued_at: Utc::now(),
            },
            retry_count: 0,
            max_retries: 3,
            last_error: None,
            enqueue_sequence: next_sequence(),
        }
    }

    pub fn task_type(&self) -> TaskType {
        self.payload.task_type()
    }

    pub fn start(&mut self, worker_id: impl Into<String>) -> Result<()> {
        match &self.state {
            TaskState::Queued { .. } => {
                self.state = TaskState::Running {
                    started_at: Utc::now(),
                    worker_id: worker_id.into(),
                };
                Ok(())
            }
            other => Err(PipelineError::InvalidStateTransition {
                from: other.name().to_string(),
                to: "running".to_string(),
            }),
        }
    }

    pub fn complete(&mut self) -> Result<()> {
        match &self.state {
            TaskState::Running { started_at, .. } => {
                let now = Utc::now();
                let duration_ms = (now - *started_at).num_milliseconds().max(0) as u64;
                self.state = TaskState::Completed {
                    started_at: *started_at,
                    completed_at: now,
                    duration_ms,
                };
                Ok(())
            }
            other => Err(PipelineError::InvalidStateTransition {
                from: other.name().to_string(),
                to: "completed".to_string(),
            }),
        }
    }

    pub fn fail(&mut self, error: impl Into<String>, category: ErrorCategory) -> Result<()> {
        match &self.state {
            TaskState::Running { .. } | TaskState::Failed { .. } => {
                let error = error.into();
                self.last_error = Some(error.clone());
                self.state = TaskState::Failed {
                    failed_at: Utc::now(),
                    error,
                    error_category: category,
                };
                Ok(())
            }
            other => Err(PipelineError::InvalidStateTransition {
                from: other.name().to_string(),
                to: "failed".to_string(),
            }),
        }
    }

    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<()> {
        if self.state.is_terminal() {
            return Err(PipelineError::InvalidStateTransition {
                from: self.state.name().to_string(),
                to: "cancelled".to_string(),
            });
        }
        self.state = TaskState::Cancelled {
            cancelled_at: Utc::now(),
            reason: reason.into(),
        };
        Ok(())
    }

    /// Prepare this task for re-enqueue: bump retry count, degrade priority,
    /// reset to queued. Returns `Err` if retries are exhausted — the caller
    /// (the event router) diverts the task to the DLQ in that case.
    pub fn prepare_retry(&mut self) -> Result<()> {
        if self.retry_count >= self.max_retries {
            return Err(PipelineError::RouterExhausted {
                event_id: self.id.clone(),
            });
        }
        self.retry_count += 1;
        self.priority = self.priority.degrade();
        self.state = TaskState::Queued {
            queued_at: Utc::now(),
        };
        Ok(())
    }
}

/// Ordering for the priority queue's `BinaryHeap` (a max-heap): we want the
/// numerically *lowest* priority first, so `Task` orders such that lower
/// priority values compare as greater, and within a priority level the
/// earlier `enqueue_sequence` compares as greater (FIFO).
impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.enqueue_sequence == other.enqueue_sequence
    }
}
impl Eq for Task {}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Task {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.enqueue_sequence.cmp(&self.enqueue_sequence))
    }
}
