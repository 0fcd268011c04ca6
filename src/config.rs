//! Aggregate configuration: every component's `*Config` under one struct,
//! buildable programmatically or deserialized from a TOML file.

use crate::breaker::BreakerConfig;
use crate::cache::CacheConfig;
use crate::canary::CanaryConfig;
use crate::error::{PipelineError, Result};
use crate::events::RouterConfig;
use crate::metrics::MetricsConfig;
use crate::worker_pool::WorkerPoolConfig;
use serde::{Deserialize, Serialize};

/// One aggregate struct a caller can build from a literal or load from disk.
/// Every field defaults to the value this document's component sections
/// name; `PipelineConfig::default()` is a fully-usable configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub dev_pool: WorkerPoolConfigToml,
    #[serde(default)]
    pub qa_pool: WorkerPoolConfigToml,
    #[serde(default)]
    pub deploy_pool: WorkerPoolConfigToml,
    #[serde(default)]
    pub cache: CacheConfigToml,
    #[serde(default)]
    pub breaker: BreakerConfigToml,
    #[serde(default)]
    pub router: RouterConfigToml,
    #[serde(default)]
    pub canary: CanaryConfigToml,
    #[serde(default)]
    pub metrics: MetricsConfigToml,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dev_pool: WorkerPoolConfig::default().into(),
            qa_pool: WorkerPoolConfig::default().into(),
            deploy_pool: WorkerPoolConfig::default().into(),
            cache: CacheConfig::default().into(),
            breaker: BreakerConfig::default().into(),
            router: RouterConfig::default().into(),
            canary: CanaryConfig::default().into(),
            metrics: MetricsConfig::default().into(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(PipelineError::config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(PipelineError::config)
    }
}

/// Serde-friendly mirror of [`WorkerPoolConfig`] (the original holds no
/// `Serialize`/`Deserialize` derive since it's constructed programmatically
/// in most call sites; the TOML surface converts through this shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfigToml {
    pub min_workers: usize,
    pub max_workers: usize,
    pub scale_up_threshold: usize,
    pub scale_down_threshold: usize,
    pub scale_check_interval_secs: u64,
    pub task_deadline_secs: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for WorkerPoolConfigToml {
    fn default() -> Self {
        WorkerPoolConfig::default().into()
    }
}

impl From<WorkerPoolConfig> for WorkerPoolConfigToml {
    fn from(c: WorkerPoolConfig) -> Self {
        Self {
            min_workers: c.min_workers,
            max_workers: c.max_workers,
            scale_up_threshold: c.scale_up_threshold,
            scale_down_threshold: c.scale_down_threshold,
            scale_check_interval_secs: c.scale_check_interval_secs,
            task_deadline_secs: c.task_deadline_secs,
            shutdown_timeout_secs: c.shutdown_timeout_secs,
        }
    }
}

impl From<WorkerPoolConfigToml> for WorkerPoolConfig {
    fn from(c: WorkerPoolConfigToml) -> Self {
        Self {
            min_workers: c.min_workers,
            max_workers: c.max_workers,
            scale_up_threshold: c.scale_up_threshold,
            scale_down_threshold: c.scale_down_threshold,
            scale_check_interval_secs: c.scale_check_interval_secs,
            task_deadline_secs: c.task_deadline_secs,
            shutdown_timeout_secs: c.shutdown_timeout_secs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfigToml {
    pub ttl_seconds: u64,
    pub max_size: usize,
}

impl Default for CacheConfigToml {
    fn default() -> Self {
        CacheConfig::default().into()
    }
}

impl From<CacheConfig> for CacheConfigToml {
    fn from(c: CacheConfig) -> Self {
        Self {
            ttl_seconds: c.ttl_seconds,
            max_size: c.max_size,
        }
    }
}

impl From<CacheConfigToml> for CacheConfig {
    fn from(c: CacheConfigToml) -> Self {
        Self {
            ttl_seconds: c.ttl_seconds,
            max_size: c.max_size,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfigToml {
    pub failure_threshold: f64,
    pub timeout_seconds: u64,
    pub success_threshold: u32,
    pub window_size: usize,
}

impl Default for BreakerConfigToml {
    fn default() -> Self {
        BreakerConfig::default().into()
    }
}

impl From<BreakerConfig> for BreakerConfigToml {
    fn from(c: BreakerConfig) -> Self {
        Self {
            failure_threshold: c.failure_threshold,
            timeout_seconds: c.timeout_seconds,
            success_threshold: c.success_threshold,
            window_size: c.window_size,
        }
    }
}

impl From<BreakerConfigToml> for BreakerConfig {
    fn from(c: BreakerConfigToml) -> Self {
        Self {
            failure_threshold: c.failure_threshold,
            timeout_seconds: c.timeout_seconds,
            success_threshold: c.success_threshold,
            window_size: c.window_size,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfigToml {
    pub max_retries: u32,
    pub backoff_base_seconds: u64,
    pub handler_timeout_seconds: u64,
}

impl Default for RouterConfigToml {
    fn default() -> Self {
        RouterConfig::default().into()
    }
}

impl From<RouterConfig> for RouterConfigToml {
    fn from(c: RouterConfig) -> Self {
        Self {
            max_retries: c.max_retries,
            backoff_base_seconds: c.backoff_base_seconds,
            handler_timeout_seconds: c.handler_timeout_seconds,
        }
    }
}

impl From<RouterConfigToml> for RouterConfig {
    fn from(c: RouterConfigToml) -> Self {
        Self {
            max_retries: c.max_retries,
            backoff_base_seconds: c.backoff_base_seconds,
            handler_timeout_seconds: c.handler_timeout_seconds,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryConfigToml {
    pub stages: Vec<u8>,
    pub stage_duration_secs: u64,
    pub error_rate_threshold: f64,
    pub latency_threshold_ms: f64,
    pub health_check_interval_secs: u64,
}

impl Default for CanaryConfigToml {
    fn default() -> Self {
        CanaryConfig::default().into()
    }
}

impl From<CanaryConfig> for CanaryConfigToml {
    fn from(c: CanaryConfig) -> Self {
        Self {
            stages: c.stages,
            stage_duration_secs: c.stage_duration_secs,
            error_rate_threshold: c.error_rate_threshold,
            latency_threshold_ms: c.latency_threshold_ms,
            health_check_interval_secs: c.health_check_interval_secs,
        }
    }
}

impl From<CanaryConfigToml> for CanaryConfig {
    fn from(c: CanaryConfigToml) -> Self {
        Self {
            stages: c.stages,
            stage_duration_secs: c.stage_duration_secs,
            error_rate_threshold: c.error_rate_threshold,
            latency_threshold_ms: c.latency_threshold_ms,
            health_check_interval_secs: c.health_check_interval_secs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfigToml {
    pub heartbeat_interval_secs: u64,
    pub connection_timeout_secs: u64,
    pub retention_seconds: u64,
    pub per_type_window: usize,
    pub subscriber_buffer_size: usize,
}

impl Default for MetricsConfigToml {
    fn default() -> Self {
        MetricsConfig::default().into()
    }
}

impl From<MetricsConfig> for MetricsConfigToml {
    fn from(c: MetricsConfig) -> Self {
        Self {
            heartbeat_interval_secs: c.heartbeat_interval_secs,
            connection_timeout_secs: c.connection_timeout_secs,
            retention_seconds: c.retention_seconds,
            per_type_window: c.per_type_window,
            subscriber_buffer_size: c.subscriber_buffer_size,
        }
    }
}

impl From<MetricsConfigToml> for MetricsConfig {
    fn from(c: MetricsConfigToml) -> Self {
        Self {
            heartbeat_interval_secs: c.heartbeat_interval_secs,
            connection_timeout_secs: c.connection_timeout_secs,
            retention_seconds: c.retention_seconds,
            per_type_window: c.per_type_window,
            subscriber_buffer_size: c.subscriber_buffer_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_roundtrips_through_toml() {
        let config = PipelineConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        let reloaded = PipelineConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(reloaded.cache.ttl_seconds, config.cache.ttl_seconds);
        assert_eq!(reloaded.breaker.failure_threshold, config.breaker.failure_threshold);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let partial = "[breaker]\nfailure_threshold = 0.75\ntimeout_seconds = 10\nsuccess_threshold = 5\nwindow_size = 50\n";
        let config = PipelineConfig::from_toml_str(partial).unwrap();
        assert_eq!(config.breaker.failure_threshold, 0.75);
        assert_eq!(config.cache.ttl_seconds, CacheConfig::default().ttl_seconds);
    }

    #[test]
    fn test_defaults_match_spec_values() {
        let config = PipelineConfig::default();
        assert_eq!(config.dev_pool.scale_up_threshold, 10);
        assert_eq!(config.router.max_retries, 3);
        assert_eq!(config.canary.stages, vec![10, 25, 50, 75, 100]);
        assert_eq!(config.metrics.heartbeat_interval_secs, 30);
    }
}
