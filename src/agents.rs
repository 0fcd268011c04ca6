//! Agent contracts: the injected callables that actually do dev/QA/deploy
//! work. The orchestrator never interprets their output beyond these shapes;
//! everything else is opaque per-agent detail.

use crate::error::Result;
use crate::task::Issue;
use async_trait::async_trait;
use std::collections::HashMap;

/// Output of a dev agent run: generated or modified files, keyed by path,
/// plus free-form logs for observability.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct DevResult {
    pub files: HashMap<String, String>,
    pub logs: Vec<String>,
}

#[async_trait]
pub trait DevAgent: Send + Sync {
    async fn run(
        &self,
        target_path: &str,
        language_hint: Option<&str>,
        instructions: &str,
        extra: &serde_json::Value,
    ) -> Result<DevResult>;
}

/// Output of a QA agent review.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct QaResult {
    pub passed: bool,
    pub issues: Vec<Issue>,
    pub stats: HashMap<String, f64>,
}

#[async_trait]
pub trait QaAgent: Send + Sync {
    async fn review(&self, target_path: &str, files: &[String], extra: &serde_json::Value) -> Result<QaResult>;
}

/// Output of a deploy agent run.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct DeployResult {
    pub deployment_id: String,
    pub endpoints: Vec<String>,
    pub health: String,
}

#[async_trait]
pub trait DeployAgent: Send + Sync {
    async fn deploy(&self, artifact: &str, extra: &serde_json::Value) -> Result<DeployResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoDevAgent;

    #[async_trait]
    impl DevAgent for EchoDevAgent {
        async fn run(
            &self,
            target_path: &str,
            _language_hint: Option<&str>,
            _instructions: &str,
            _extra: &serde_json::Value,
        ) -> Result<DevResult> {
            let mut files = HashMap::new();
            files.insert(target_path.to_string(), "generated".to_string());
            Ok(DevResult {
                files,
                logs: vec!["ok".to_string()],
            })
        }
    }

    #[tokio::test]
    async fn test_dev_agent_contract() {
        let agent = EchoDevAgent;
        let result = agent
            .run("a.py", Some("python"), "write it", &serde_json::Value::Null)
            .await
            .unwrap();
        assert_eq!(result.files.get("a.py"), Some(&"generated".to_string()));
    }
}
