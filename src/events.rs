//! Event router: dispatches stage-transition events to registered handlers
//! with retry-with-backoff, diverting exhausted chains to the DLQ and
//! emitting an `ESCALATE` event for the planner adapter.

use crate::error::{PipelineError, Result};
use crate::persistence::{DlqRecord, DlqStore};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    FileCompleted,
    FileFailed,
    QaPassed,
    QaFailed,
    DeployOk,
    DeployFail,
    Escalate,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::FileCompleted => "FILE_COMPLETED",
            EventType::FileFailed => "FILE_FAILED",
            EventType::QaPassed => "QA_PASSED",
            EventType::QaFailed => "QA_FAILED",
            EventType::DeployOk => "DEPLOY_OK",
            EventType::DeployFail => "DEPLOY_FAIL",
            EventType::Escalate => "ESCALATE",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub task_id: String,
    pub payload: serde_json::Value,
    pub timestamp: chrono::DateTime<Utc>,
    pub delivery_retry_count: u32,
}

impl Event {
    pub fn new(event_type: EventType, task_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type,
            task_id: task_id.into(),
            payload,
            timestamp: Utc::now(),
            delivery_retry_count: 0,
        }
    }
}

/// Injected handler for a routed event. Handlers are the orchestrator's
/// bridge into its queues (e.g. "enqueue onto QA Queue").
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub max_retries: u32,
    pub backoff_base_seconds: u64,
    pub handler_timeout_seconds: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_seconds: 1,
            handler_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RouterStats {
    pub routed: u64,
    pub failed: u64,
    pub dlq_size: usize,
    pub failure_rate: f64,
}

/// Registry mapping `EventType -> [handler]`, with retry-with-backoff and a
/// dead-letter diversion path for exhausted chains.
pub struct EventRouter {
    handlers: Mutex<HashMap<EventType, Vec<Arc<dyn EventHandler>>>>,
    dlq: Arc<dyn DlqStore>,
    config: RouterConfig,
    routed: AtomicU64,
    failed: AtomicU64,
}

impl EventRouter {
    pub fn new(dlq: Arc<dyn DlqStore>, config: RouterConfig) -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            dlq,
            config,
            routed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub async fn register(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        self.handlers.lock().await.entry(event_type).or_default().push(handler);
    }

    /// Dispatch `event` to every registered handler. On handler failure,
    /// retries that single handler with exponential backoff
    /// (`2^retry_count` seconds, capped at `max_retries`); once exhausted,
    /// the event is pushed to the DLQ and an `ESCALATE` event returned to
    /// the caller so it can be re-routed.
    pub async fn route(&self, mut event: Event) -> Result<Option<Event>> {
        let handlers = {
            let guard = self.handlers.lock().await;
            guard.get(&event.event_type).cloned().unwrap_or_default()
        };

        if handlers.is_empty() {
            warn!(event_type = %event.event_type, "no handlers registered");
            return Ok(None);
        }

        for handler in &handlers {
            let mut failure_chain = Vec::new();

            loop {
                let timeout = std::time::Duration::from_secs(self.config.handler_timeout_seconds);
                let outcome = tokio::time::timeout(timeout, handler.handle(&event)).await;

                let failure_message = match outcome {
                    Ok(Ok(())) => {
                        self.routed.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                    Ok(Err(e)) => e.to_string(),
                    Err(_) => "handler timed out".to_string(),
                };
                failure_chain.push(failure_message);

                if event.delivery_retry_count >= self.config.max_retries {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    error!(task_id = %event.task_id, event_type = %event.event_type, "retries exhausted, diverting to DLQ");

                    self.dlq
                        .push(DlqRecord {
                            task_id: event.task_id.clone(),
                            original_event_type: event.event_type.as_str().to_string(),
                            failure_chain,
                            escalated_at: Utc::now(),
                        })
                        .await?;

                    let escalate = Event::new(
                        EventType::Escalate,
                        event.task_id.clone(),
                        serde_json::json!({ "original_event": event.event_type.as_str() }),
                    );
                    return Ok(Some(escalate));
                }

                let backoff = 2u64.saturating_pow(event.delivery_retry_count);
                warn!(task_id = %event.task_id, backoff_secs = backoff, "handler failed, retrying");
                event.delivery_retry_count += 1;
                tokio::time::sleep(std::time::Duration::from_secs(
                    backoff * self.config.backoff_base_seconds,
                ))
                .await;
            }
        }

        Ok(None)
    }

    pub async fn stats(&self) -> RouterStats {
        let routed = self.routed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let total = routed + failed;
        RouterStats {
            routed,
            failed,
            dlq_size: self.dlq.len().await.unwrap_or(0),
            failure_rate: if total > 0 { failed as f64 / total as f64 } else { 0.0 },
        }
    }
}

/// Static routing table from §4.8: which queue an event type lands on.
/// Returned as a description rather than a live enqueue so the orchestrator
/// (which owns the queues) can act on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    QaQueue,
    DeployQueue,
    FixQueue,
    RetryOrEscalate,
    None,
}

pub fn route_target(event_type: EventType) -> RouteTarget {
    match event_type {
        EventType::FileCompleted => RouteTarget::QaQueue,
        EventType::QaPassed => RouteTarget::DeployQueue,
        EventType::QaFailed => RouteTarget::FixQueue,
        EventType::DeployFail => RouteTarget::RetryOrEscalate,
        EventType::FileFailed | EventType::DeployOk | EventType::Escalate => RouteTarget::None,
    }
}
