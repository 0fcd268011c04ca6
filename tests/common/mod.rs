//! Shared fixtures for the integration tests under `tests/`.

use agentflow_pipeline::{
    DeployAgent, DeployResult, DevAgent, DevResult, PipelineConfig, PipelineOrchestrator, QaAgent, QaResult,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

static INIT: Once = Once::new();

/// Installs a `tracing` subscriber once per test binary so failures carry
/// structured log output instead of silence.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// Dev agent that counts invocations and always succeeds, echoing a
/// single generated file back.
pub struct CountingDevAgent {
    pub calls: Arc<AtomicUsize>,
}

impl CountingDevAgent {
    pub fn new() -> (Arc<Self>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (Arc::new(Self { calls: calls.clone() }), calls)
    }
}

#[async_trait]
impl DevAgent for CountingDevAgent {
    async fn run(
        &self,
        target_path: &str,
        _language_hint: Option<&str>,
        _instructions: &str,
        _extra: &serde_json::Value,
    ) -> agentflow_pipeline::Result<DevResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut files = HashMap::new();
        files.insert(target_path.to_string(), "generated".to_string());
        Ok(DevResult { files, logs: vec![] })
    }
}

pub struct AlwaysPassQa;

#[async_trait]
impl QaAgent for AlwaysPassQa {
    async fn review(&self, _target_path: &str, _files: &[String], _extra: &serde_json::Value) -> agentflow_pipeline::Result<QaResult> {
        Ok(QaResult {
            passed: true,
            issues: vec![],
            stats: HashMap::new(),
        })
    }
}

/// QA agent that fails the first review for a given target path exactly
/// once, then passes every review after (including the re-review after a
/// fix task lands).
pub struct FailOnceQa {
    already_failed: parking_lot::Mutex<std::collections::HashSet<String>>,
}

impl FailOnceQa {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            already_failed: parking_lot::Mutex::new(std::collections::HashSet::new()),
        })
    }
}

#[async_trait]
impl QaAgent for FailOnceQa {
    async fn review(&self, target_path: &str, _files: &[String], _extra: &serde_json::Value) -> agentflow_pipeline::Result<QaResult> {
        let mut failed = self.already_failed.lock();
        if failed.contains(target_path) {
            Ok(QaResult {
                passed: true,
                issues: vec![],
                stats: HashMap::new(),
            })
        } else {
            failed.insert(target_path.to_string());
            Ok(QaResult {
                passed: false,
                issues: vec![agentflow_pipeline::Issue {
                    file: target_path.to_string(),
                    line: Some(1),
                    severity: "error".to_string(),
                    description: "missing null check".to_string(),
                    suggested_fix: None,
                }],
                stats: HashMap::new(),
            })
        }
    }
}

pub struct AlwaysDeploy {
    pub calls: Arc<AtomicUsize>,
}

impl AlwaysDeploy {
    pub fn new() -> (Arc<Self>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (Arc::new(Self { calls: calls.clone() }), calls)
    }
}

#[async_trait]
impl DeployAgent for AlwaysDeploy {
    async fn deploy(&self, artifact: &str, _extra: &serde_json::Value) -> agentflow_pipeline::Result<DeployResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(DeployResult {
            deployment_id: format!("dep-{artifact}"),
            endpoints: vec![],
            health: "ok".to_string(),
        })
    }
}

pub fn build_orchestrator(
    dev: Arc<dyn DevAgent>,
    qa: Arc<dyn QaAgent>,
    deploy: Arc<dyn DeployAgent>,
) -> Arc<PipelineOrchestrator> {
    PipelineOrchestrator::new(
        PipelineConfig::default(),
        dev,
        qa,
        deploy,
        agentflow_pipeline::InMemoryDlqStore::new(),
        agentflow_pipeline::InMemoryCanaryStore::new(),
    )
}
