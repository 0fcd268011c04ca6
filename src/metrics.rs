//! Metrics stream manager: fan-out of metric events to subscribers with
//! heartbeat-based liveness, per-type ring buffers, and a drop-oldest
//! backpressure policy so a slow subscriber never stalls `broadcast`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

const RING_BUFFER_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricType {
    QueueDepth,
    WorkerCount,
    CacheHitRate,
    BreakerState,
    TaskLatencyMs,
    DlqSize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub metric_type: MetricType,
    pub source: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl Metric {
    pub fn new(metric_type: MetricType, source: impl Into<String>, value: f64) -> Self {
        Self {
            metric_type,
            source: source.into(),
            value,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub heartbeat_interval_secs: u64,
    pub connection_timeout_secs: u64,
    pub retention_seconds: u64,
    pub per_type_window: usize,
    pub subscriber_buffer_size: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            connection_timeout_secs: 60,
            retention_seconds: 3600,
            per_type_window: RING_BUFFER_SIZE,
            subscriber_buffer_size: 64,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricSummary {
    pub avg: f64,
    pub p50: f64,
    pub p95: f64,
    pub count: usize,
}

struct Subscriber {
    sender: mpsc::Sender<Metric>,
    types: Option<Vec<MetricType>>,
    last_seen: Instant,
}

/// Fan-out manager. Owns only the ring buffers and subscriber registry; the
/// actual wire transport (WebSocket framing) is an external collaborator.
pub struct MetricsStreamManager {
    config: MetricsConfig,
    subscribers: Mutex<HashMap<String, Subscriber>>,
    buffers: Mutex<HashMap<MetricType, VecDeque<Metric>>>,
}

impl MetricsStreamManager {
    pub fn new(config: MetricsConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            subscribers: Mutex::new(HashMap::new()),
            buffers: Mutex::new(HashMap::new()),
        })
    }

    /// Register a subscriber, returning the receiving half of its channel.
    /// `types = None` subscribes to every metric type.
    pub async fn subscribe(&self, id: impl Into<String>, types: Option<Vec<MetricType>>) -> mpsc::Receiver<Metric> {
        let (tx, rx) = mpsc::channel(self.config.subscriber_buffer_size);
        let id = id.into();
        self.subscribers.lock().await.insert(
            id,
            Subscriber {
                sender: tx,
                types,
                last_seen: Instant::now(),
            },
        );
        rx
    }

    pub async fn unsubscribe(&self, id: &str) {
        self.subscribers.lock().await.remove(id);
    }

    /// Mark a subscriber as having acknowledged a heartbeat, resetting its
    /// eviction clock.
    pub async fn acknowledge(&self, id: &str) {
        if let Some(subscriber) = self.subscribers.lock().await.get_mut(id) {
            subscriber.last_seen = Instant::now();
        }
    }

    /// Fan out a metric to every matching subscriber and append it to that
    /// type's ring buffer. Never blocks: a full subscriber buffer has its
    /// oldest queued metric dropped to make room.
    pub async fn broadcast(&self, metric: Metric) {
        {
            let mut buffers = self.buffers.lock().await;
            let buffer = buffers.entry(metric.metric_type).or_default();
            buffer.push_back(metric.clone());
            while buffer.len() > self.config.per_type_window {
                buffer.pop_front();
            }

            let cutoff = Utc::now() - chrono::Duration::seconds(self.config.retention_seconds as i64);
            while matches!(buffer.front(), Some(oldest) if oldest.timestamp < cutoff) {
                buffer.pop_front();
            }
        }

        let subscribers = self.subscribers.lock().await;
        for (id, subscriber) in subscribers.iter() {
            if let Some(types) = &subscriber.types {
                if !types.contains(&metric.metric_type) {
                    continue;
                }
            }

            match subscriber.sender.try_send(metric.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(pending)) => {
                    debug!(subscriber = %id, "outbound buffer full, dropping oldest");
                    let _ = subscriber.sender.try_recv();
                    let _ = subscriber.sender.try_send(pending);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!(subscriber = %id, "subscriber channel closed, will be reaped");
                }
            }
        }
    }

    /// Drop subscribers that have not acknowledged a heartbeat within
    /// `connection_timeout`. Call this on the `heartbeat_interval` cadence.
    pub async fn reap_stale_subscribers(&self) -> usize {
        let timeout = Duration::from_secs(self.config.connection_timeout_secs);
        let mut subscribers = self.subscribers.lock().await;
        let before = subscribers.len();
        subscribers.retain(|id, subscriber| {
            let alive = subscriber.last_seen.elapsed() < timeout;
            if !alive {
                warn!(subscriber = %id, "evicting stale metrics subscriber");
            }
            alive
        });
        before - subscribers.len()
    }

    pub async fn summary(&self, metric_type: MetricType) -> MetricSummary {
        let buffers = self.buffers.lock().await;
        let Some(buffer) = buffers.get(&metric_type) else {
            return MetricSummary::default();
        };
        if buffer.is_empty() {
            return MetricSummary::default();
        }

        let mut values: Vec<f64> = buffer.iter().map(|m| m.value).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());

        let count = values.len();
        let avg = values.iter().sum::<f64>() / count as f64;
        let p50 = percentile(&values, 0.50);
        let p95 = percentile(&values, 0.95);

        MetricSummary { avg, p50, p95, count }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }
}

fn percentile(sorted_values: &[f64], fraction: f64) -> f64 {
    if sorted_values.is_empty() {
        return 0.0;
    }
    let rank = (fraction * (sorted_values.len() - 1) as f64).round() as usize;
    sorted_values[rank.min(sorted_values.len() - 1)]
}
