//! Canary deployment controller: progressive traffic staging gated on
//! boundary health checks, with an optional mid-stage probe that can only
//! trigger an early rollback, never an early advance.

use crate::error::{PipelineError, Result};
use crate::persistence::{CanaryRecord, CanaryStore};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Failed,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Failed => "failed",
        }
    }
}

/// A single health observation fed to the controller by the deploy agent's
/// health probe. The controller never collects metrics itself.
#[derive(Debug, Clone, Copy)]
pub struct HealthSample {
    pub error_rate: f64,
    pub p95_latency_ms: f64,
}

#[derive(Debug, Clone)]
pub struct CanaryConfig {
    pub stages: Vec<u8>,
    pub stage_duration_secs: u64,
    pub error_rate_threshold: f64,
    pub latency_threshold_ms: f64,
    pub health_check_interval_secs: u64,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            stages: vec![10, 25, 50, 75, 100],
            stage_duration_secs: 300,
            error_rate_threshold: 0.10,
            latency_threshold_ms: 200.0,
            health_check_interval_secs: 30,
        }
    }
}

struct Deployment {
    config: CanaryConfig,
    stage_index: usize,
    stage_started_at: Instant,
    history: Vec<u8>,
    health: HealthStatus,
    rollback_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CanaryStats {
    pub deployment_id: String,
    pub current_stage_percent: u8,
    pub health: String,
    pub rollback_reason: Option<String>,
}

/// Outcome of advancing (or probing) a deployment, used by the caller to
/// decide which event to emit (`DEPLOY_OK` / `DEPLOY_FAIL`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Advanced { to_percent: u8 },
    Completed,
    RolledBack { reason: String },
    NotYetDue,
}

/// Progressive rollout controller. Concurrent deployments are tracked
/// independently, keyed by `deployment_id`.
pub struct CanaryController {
    deployments: Mutex<HashMap<String, Deployment>>,
    store: Arc<dyn CanaryStore>,
}

impl CanaryController {
    pub fn new(store: Arc<dyn CanaryStore>) -> Arc<Self> {
        Arc::new(Self {
            deployments: Mutex::new(HashMap::new()),
            store,
        })
    }

    /// Begin a new canary at the first configured stage.
    pub async fn start(&self, deployment_id: impl Into<String>, config: CanaryConfig) -> Result<()> {
        let deployment_id = deployment_id.into();
        if config.stages.is_empty() {
            return Err(PipelineError::MalformedPlan(
                "canary config must declare at least one stage".to_string(),
            ));
        }

        let first = config.stages[0];
        let deployment = Deployment {
            config,
            stage_index: 0,
            stage_started_at: Instant::now(),
            history: vec![first],
            health: HealthStatus::Healthy,
            rollback_reason: None,
        };

        info!(deployment_id = %deployment_id, stage_percent = first, "canary started");
        self.deployments.lock().await.insert(deployment_id.clone(), deployment);
        self.persist(&deployment_id).await
    }

    /// Mid-stage probe: may only trigger an early rollback, never an early
    /// advance. Call this on a faster cadence than `stage_duration`.
    pub async fn probe(&self, deployment_id: &str, sample: HealthSample) -> Result<StageOutcome> {
        let mut deployments = self.deployments.lock().await;
        let deployment = deployments
            .get_mut(deployment_id)
            .ok_or_else(|| PipelineError::DeploymentNotFound(deployment_id.to_string()))?;

        if let Some(reason) = unhealthy_reason(&deployment.config, sample) {
            deployment.health = HealthStatus::Failed;
            deployment.rollback_reason = Some(reason.clone());
            warn!(deployment_id, reason = %reason, "canary mid-stage probe failed, rolling back");
            drop(deployments);
            self.persist(deployment_id).await?;
            return Ok(StageOutcome::RolledBack { reason });
        }

        deployment.health = HealthStatus::Healthy;
        Ok(StageOutcome::NotYetDue)
    }

    /// Boundary-authoritative check: advances, completes, or rolls back the
    /// deployment once `stage_duration` has elapsed since the current stage
    /// began. Returns `NotYetDue` if the duration has not yet elapsed.
    pub async fn check_boundary(&self, deployment_id: &str, sample: HealthSample) -> Result<StageOutcome> {
        let mut deployments = self.deployments.lock().await;
        let deployment = deployments
            .get_mut(deployment_id)
            .ok_or_else(|| PipelineError::DeploymentNotFound(deployment_id.to_string()))?;

        let due = Duration::from_secs(deployment.config.stage_duration_secs);
        if deployment.stage_started_at.elapsed() < due {
            return Ok(StageOutcome::NotYetDue);
        }

        let outcome = if let Some(reason) = unhealthy_reason(&deployment.config, sample) {
            deployment.health = HealthStatus::Failed;
            deployment.rollback_reason = Some(reason.clone());
            warn!(deployment_id, reason = %reason, "canary stage boundary failed, rolling back");
            StageOutcome::RolledBack { reason }
        } else if deployment.stage_index + 1 < deployment.config.stages.len() {
            deployment.stage_index += 1;
            deployment.stage_started_at = Instant::now();
            deployment.health = HealthStatus::Healthy;
            let to_percent = deployment.config.stages[deployment.stage_index];
            deployment.history.push(to_percent);
            info!(deployment_id, stage_percent = to_percent, "canary advanced");
            StageOutcome::Advanced { to_percent }
        } else {
            deployment.health = HealthStatus::Healthy;
            info!(deployment_id, "canary completed at 100%");
            StageOutcome::Completed
        };

        drop(deployments);
        self.persist(deployment_id).await?;
        Ok(outcome)
    }

    /// Externally-triggered rollback, e.g. from an operator or an upstream
    /// `DEPLOY_FAIL` event unrelated to this controller's own health checks.
    pub async fn rollback(&self, deployment_id: &str, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        {
            let mut deployments = self.deployments.lock().await;
            let deployment = deployments
                .get_mut(deployment_id)
                .ok_or_else(|| PipelineError::DeploymentNotFound(deployment_id.to_string()))?;
            deployment.health = HealthStatus::Failed;
            deployment.rollback_reason = Some(reason.clone());
        }
        warn!(deployment_id, reason = %reason, "canary rolled back externally");
        self.persist(deployment_id).await
    }

    pub async fn stats(&self, deployment_id: &str) -> Result<CanaryStats> {
        let deployments = self.deployments.lock().await;
        let deployment = deployments
            .get(deployment_id)
            .ok_or_else(|| PipelineError::DeploymentNotFound(deployment_id.to_string()))?;
        Ok(CanaryStats {
            deployment_id: deployment_id.to_string(),
            current_stage_percent: deployment.config.stages[deployment.stage_index],
            health: deployment.health.as_str().to_string(),
            rollback_reason: deployment.rollback_reason.clone(),
        })
    }

    pub async fn list_ids(&self) -> Vec<String> {
        self.deployments.lock().await.keys().cloned().collect()
    }

    async fn persist(&self, deployment_id: &str) -> Result<()> {
        let record = {
            let deployments = self.deployments.lock().await;
            let deployment = deployments
                .get(deployment_id)
                .ok_or_else(|| PipelineError::DeploymentNotFound(deployment_id.to_string()))?;
            CanaryRecord {
                deployment_id: deployment_id.to_string(),
                stage_history: deployment.history.clone(),
                current_health: deployment.health.as_str().to_string(),
                updated_at: Utc::now(),
            }
        };
        self.store.upsert(record).await
    }
}

fn unhealthy_reason(config: &CanaryConfig, sample: HealthSample) -> Option<String> {
    if sample.error_rate > config.error_rate_threshold {
        return Some(format!(
            "error rate {:.3} exceeds threshold {:.3}",
            sample.error_rate, config.error_rate_threshold
        ));
    }
    if sample.p95_latency_ms > config.latency_threshold_ms {
        return Some(format!(
            "p95 latency {:.1}ms exceeds threshold {:.1}ms",
            sample.p95_latency_ms, config.latency_threshold_ms
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryCanaryStore;

    fn healthy() -> HealthSample {
        HealthSample {
            error_rate: 0.01,
            p95_latency_ms: 50.0,
        }
    }

    fn unhealthy() -> HealthSample {
        HealthSample {
            error_rate: 0.5,
            p95_latency_ms: 400.0,
        }
    }

    fn fast_config() -> CanaryConfig {
        CanaryConfig {
            stages: vec![10, 50, 100],
            stage_duration_secs: 0,
            ..CanaryConfig::default()
        }
    }

    #[tokio::test]
    async fn test_start_begins_at_first_stage() {
        let controller = CanaryController::new(InMemoryCanaryStore::new());
        controller.start("d1", fast_config()).await.unwrap();
        let stats = controller.stats("d1").await.unwrap();
        assert_eq!(stats.current_stage_percent, 10);
    }

    #[tokio::test]
    async fn test_boundary_advances_on_healthy_sample() {
        let controller = CanaryController::new(InMemoryCanaryStore::new());
        controller.start("d1", fast_config()).await.unwrap();

        let outcome = controller.check_boundary("d1", healthy()).await.unwrap();
        assert_eq!(outcome, StageOutcome::Advanced { to_percent: 50 });
    }

    #[tokio::test]
    async fn test_boundary_completes_at_final_stage() {
        let controller = CanaryController::new(InMemoryCanaryStore::new());
        controller.start("d1", fast_config()).await.unwrap();
        controller.check_boundary("d1", healthy()).await.unwrap();
        controller.check_boundary("d1", healthy()).await.unwrap();
        let outcome = controller.check_boundary("d1", healthy()).await.unwrap();
        assert_eq!(outcome, StageOutcome::Completed);
    }

    #[tokio::test]
    async fn test_boundary_rolls_back_on_unhealthy_sample() {
        let controller = CanaryController::new(InMemoryCanaryStore::new());
        controller.start("d1", fast_config()).await.unwrap();

        let outcome = controller.check_boundary("d1", unhealthy()).await.unwrap();
        assert!(matches!(outcome, StageOutcome::RolledBack { .. }));
        assert_eq!(controller.stats("d1").await.unwrap().health, "failed");
    }

    #[tokio::test]
    async fn test_probe_can_rollback_but_never_advances() {
        let controller = CanaryController::new(InMemoryCanaryStore::new());
        let config = CanaryConfig {
            stages: vec![10, 50, 100],
            stage_duration_secs: 3600,
            ..CanaryConfig::default()
        };
        controller.start("d1", config).await.unwrap();

        let healthy_probe = controller.probe("d1", healthy()).await.unwrap();
        assert_eq!(healthy_probe, StageOutcome::NotYetDue);
        assert_eq!(controller.stats("d1").await.unwrap().current_stage_percent, 10);

        let unhealthy_probe = controller.probe("d1", unhealthy()).await.unwrap();
        assert!(matches!(unhealthy_probe, StageOutcome::RolledBack { .. }));
    }

    #[tokio::test]
    async fn test_boundary_not_yet_due_before_duration_elapses() {
        let controller = CanaryController::new(InMemoryCanaryStore::new());
        let config = CanaryConfig {
            stages: vec![10, 50],
            stage_duration_secs: 3600,
            ..CanaryConfig::default()
        };
        controller.start("d1", config).await.unwrap();

        let outcome = controller.check_boundary("d1", healthy()).await.unwrap();
        assert_eq!(outcome, StageOutcome::NotYetDue);
    }

    #[tokio::test]
    async fn test_external_rollback() {
        let controller = CanaryController::new(InMemoryCanaryStore::new());
        controller.start("d1", fast_config()).await.unwrap();
        controller.rollback("d1", "operator abort").await.unwrap();
        let stats = controller.stats("d1").await.unwrap();
        assert_eq!(stats.health, "failed");
        assert_eq!(stats.rollback_reason.as_deref(), Some("operator abort"));
    }

    #[tokio::test]
    async fn test_concurrent_deployments_are_independent() {
        let controller = CanaryController::new(InMemoryCanaryStore::new());
        controller.start("d1", fast_config()).await.unwrap();
        controller.start("d2", fast_config()).await.unwrap();

        controller.check_boundary("d1", healthy()).await.unwrap();

        assert_eq!(controller.stats("d1").await.unwrap().current_stage_percent, 50);
        assert_eq!(controller.stats("d2").await.unwrap().current_stage_percent, 10);
    }

    #[tokio::test]
    async fn test_unknown_deployment_id_errors() {
        let controller = CanaryController::new(InMemoryCanaryStore::new());
        let err = controller.stats("nope").await.unwrap_err();
        assert!(matches!(err, PipelineError::DeploymentNotFound(_)));
    }
}
