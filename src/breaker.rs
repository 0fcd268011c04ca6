//! Three-state circuit breaker isolating a single upstream dependency.

use crate::error::{PipelineError, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: f64,
    pub timeout_seconds: u64,
    pub success_threshold: u32,
    pub window_size: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 0.5,
            timeout_seconds: 30,
            success_threshold: 3,
            window_size: 20,
        }
    }
}

struct Inner {
    state: CircuitState,
    window: VecDeque<bool>, // true = success
    opened_at: Option<Instant>,
    consecutive_successes: u32,
    half_open_probe_in_flight: bool,
}

/// Per-dependency circuit breaker.
///
/// State machine: `CLOSED -> OPEN` on a rolling failure rate above
/// `failure_threshold`; `OPEN -> HALF_OPEN` after `timeout_seconds`;
/// `HALF_OPEN -> CLOSED` after `success_threshold` consecutive successes;
/// `HALF_OPEN -> OPEN` on any failure. At most one probe is admitted while
/// half-open.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                window: VecDeque::new(),
                opened_at: None,
                consecutive_successes: 0,
                half_open_probe_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.transition_if_due();
        self.inner.lock().state
    }

    /// How long this breaker has been continuously `OPEN`, if it is.
    pub fn open_duration(&self) -> Option<Duration> {
        self.transition_if_due();
        let inner = self.inner.lock();
        if inner.state == CircuitState::Open {
            inner.opened_at.map(|t| t.elapsed())
        } else {
            None
        }
    }

    /// Re-evaluate `OPEN -> HALF_OPEN` based on elapsed time. Called on every
    /// state read and before every call admission so the timeout is honored
    /// without a background timer.
    fn transition_if_due(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= Duration::from_secs(self.config.timeout_seconds) {
                    inner.state = CircuitState::HalfOpen;
                    inner.consecutive_successes = 0;
                    inner.half_open_probe_in_flight = false;
                    info!(breaker = %self.name, "circuit transitioning to half-open");
                }
            }
        }
    }

    /// Execute `fut` under the breaker, enforcing `deadline` as a timeout.
    /// Expiry counts as a failure for the rolling window.
    pub async fn call<F, T>(&self, deadline: Duration, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.transition_if_due();

        {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Open => {
                    return Err(PipelineError::CircuitOpen(self.name.clone()));
                }
                CircuitState::HalfOpen => {
                    if inner.half_open_probe_in_flight {
                        return Err(PipelineError::CircuitOpen(self.name.clone()));
                    }
                    inner.half_open_probe_in_flight = true;
                }
                CircuitState::Closed => {}
            }
        }

        let outcome = tokio::time::timeout(deadline, fut).await;
        let result = match outcome {
            Ok(Ok(value)) => {
                self.record_outcome(true);
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record_outcome(false);
                Err(e)
            }
            Err(_) => {
                self.record_outcome(false);
                Err(PipelineError::Timeout(deadline))
            }
        };

        if self.inner.lock().state == CircuitState::HalfOpen {
            self.inner.lock().half_open_probe_in_flight = false;
        }

        result
    }

    fn record_outcome(&self, success: bool) {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::HalfOpen => {
                if success {
                    inner.consecutive_successes += 1;
                    if inner.consecutive_successes >= self.config.success_threshold {
                        inner.state = CircuitState::Closed;
                        inner.window.clear();
                        inner.opened_at = None;
                        info!(breaker = %self.name, "circuit closed after probes succeeded");
                    }
                } else {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.consecutive_successes = 0;
                    warn!(breaker = %self.name, "circuit re-opened: half-open probe failed");
                }
                return;
            }
            CircuitState::Open => {
                // A call raced the OPEN->HALF_OPEN transition; ignore.
                return;
            }
            CircuitState::Closed => {}
        }

        inner.window.push_back(success);
        if inner.window.len() > self.config.window_size {
            inner.window.pop_front();
        }

        let failures = inner.window.iter().filter(|s| !**s).count();
        let rate = failures as f64 / inner.window.len() as f64;

        if inner.window.len() >= self.config.window_size && rate > self.config.failure_threshold {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            warn!(breaker = %self.name, failure_rate = rate, "circuit opened");
        }
    }
}
