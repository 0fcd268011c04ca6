//! Pipeline orchestrator: wires the queue, cache, breakers, worker pools,
//! event router, canary controller and metrics stream manager into the
//! dev -> qa -> (fix) -> deploy flow, gating admission on dependency batches.

use crate::agents::{DeployAgent, DevAgent, DevResult, QaAgent};
use crate::breaker::CircuitBreaker;
use crate::cache::ResultCache;
use crate::canary::{CanaryConfig, CanaryController, HealthSample, StageOutcome};
use crate::config::PipelineConfig;
use crate::dependency::{AnalysisResult, DependencyAnalyzer, DependencyStats};
use crate::dev_fix_pool::DevFixQueue;
use crate::error::{PipelineError, Result};
use crate::events::{Event, EventHandler, EventRouter, EventType};
use crate::metrics::{Metric, MetricType, MetricsStreamManager};
use crate::persistence::{CanaryStore, DlqRecord, DlqStore};
use crate::plan::{Plan, PlanEntry};
use crate::priority::PriorityAssigner;
use crate::queue::{PriorityTaskQueue, WorkQueue};
use crate::task::{Issue, Priority, Task, TaskPayload, TaskType};
use crate::worker_pool::{TaskProcessor, WorkerPool, WorkerPoolStats};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const QUEUE_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub stall_threshold_secs: u64,
    pub open_alarm_secs: u64,
    pub dlq_alarm: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            stall_threshold_secs: 120,
            open_alarm_secs: 60,
            dlq_alarm: 50,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub stalled_queues: Vec<String>,
    pub open_breakers: Vec<String>,
    pub dlq_size: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct OrchestratorStats {
    pub dev_fix_pool: WorkerPoolStats,
    pub qa_pool: WorkerPoolStats,
    pub deploy_pool: WorkerPoolStats,
    pub dev_fix_queue: crate::dev_fix_pool::DevFixStats,
    pub qa_queue: crate::queue::QueueStats,
    pub deploy_queue: crate::queue::QueueStats,
    pub cache: crate::cache::CacheStats,
    pub router: crate::events::RouterStats,
}

/// Build the synchronous `on_exhausted` callback `WorkerPool` requires,
/// bridging into the async `DlqStore::push`. Mirrors what `EventRouter::route`
/// does on its own exhaustion: persist the record, then route an `ESCALATE`
/// event so every DLQ entry still corresponds to exactly one such event.
fn make_exhaustion_handler(
    dlq: Arc<dyn DlqStore>,
    router: Arc<EventRouter>,
    original_event_type: EventType,
) -> Arc<dyn Fn(Task) + Send + Sync> {
    Arc::new(move |task: Task| {
        let dlq = Arc::clone(&dlq);
        let router = Arc::clone(&router);
        let task_id = task.id.clone();
        let last_error = task.last_error.clone().unwrap_or_else(|| "retries exhausted".to_string());

        tokio::spawn(async move {
            let record = DlqRecord {
                task_id: task_id.clone(),
                original_event_type: original_event_type.as_str().to_string(),
                failure_chain: vec![last_error],
                escalated_at: Utc::now(),
            };
            if let Err(e) = dlq.push(record).await {
                error!(error = %e, "failed to persist exhausted task to dlq");
                return;
            }

            let escalate = Event::new(
                EventType::Escalate,
                task_id,
                serde_json::json!({ "original_event": original_event_type.as_str() }),
            );
            if let Err(e) = router.route(escalate).await {
                error!(error = %e, "failed to route escalate event for exhausted task");
            }
        });
    })
}

fn describe_issues(issues: &[Issue]) -> String {
    issues
        .iter()
        .map(|i| format!("[{}] {}: {}", i.severity, i.file, i.description))
        .collect::<Vec<_>>()
        .join("\n")
}

struct GateState {
    remaining_batches: VecDeque<Vec<PlanEntry>>,
    awaiting: HashSet<String>,
    critical_path: HashSet<String>,
}

/// Tracks which dependency batch is currently admitted and releases the next
/// one once every member of the current batch has reached `QA_PASSED`.
/// Gating admission at batch granularity is a conservative concretization of
/// "admit a file only after all of its transitive dependencies have passed
/// QA": topological batching guarantees every predecessor of a batch-k file
/// lives strictly in an earlier, already-drained batch.
pub struct DependencyGate {
    state: Mutex<GateState>,
    dev_fix_queue: Arc<DevFixQueue>,
    assigner: PriorityAssigner,
}

impl DependencyGate {
    fn new(dev_fix_queue: Arc<DevFixQueue>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GateState {
                remaining_batches: VecDeque::new(),
                awaiting: HashSet::new(),
                critical_path: HashSet::new(),
            }),
            dev_fix_queue,
            assigner: PriorityAssigner::new(),
        })
    }

    async fn seed(
        &self,
        batches: Vec<Vec<PathBuf>>,
        entries_by_path: &HashMap<String, PlanEntry>,
        critical_path: Vec<PathBuf>,
    ) -> Result<()> {
        let batch_entries: VecDeque<Vec<PlanEntry>> = batches
            .into_iter()
            .map(|paths| {
                paths
                    .into_iter()
                    .filter_map(|p| entries_by_path.get(&p.display().to_string()).cloned())
                    .collect()
            })
            .collect();
        let critical: HashSet<String> = critical_path.into_iter().map(|p| p.display().to_string()).collect();

        {
            let mut state = self.state.lock().await;
            state.remaining_batches = batch_entries;
            state.critical_path = critical;
            state.awaiting.clear();
        }

        self.admit_ready_batches().await
    }

    async fn admit_ready_batches(&self) -> Result<()> {
        loop {
            let batch = {
                let mut state = self.state.lock().await;
                if !state.awaiting.is_empty() {
                    return Ok(());
                }
                match state.remaining_batches.pop_front() {
                    Some(batch) => batch,
                    None => return Ok(()),
                }
            };

            let critical = self.state.lock().await.critical_path.clone();
            let mut awaiting = HashSet::new();
            for entry in &batch {
                let mut priority = self.assigner.classify(entry);
                if critical.contains(&entry.target_file_path) {
                    priority = Priority::new(priority.get().saturating_sub(1));
                }

                let task = Task::new(
                    format!("dev-{}", entry.id),
                    TaskPayload::Dev {
                        target_path: entry.target_file_path.clone(),
                        language_hint: entry.language_hint.clone(),
                        instructions: entry.title.clone(),
                        extra: serde_json::Value::Null,
                    },
                    priority,
                );
                self.dev_fix_queue.submit(task)?;
                awaiting.insert(entry.target_file_path.clone());
            }

            self.state.lock().await.awaiting = awaiting;
        }
    }

    /// Mark `target_path` as having reached `QA_PASSED`; releases the next
    /// batch once this clears the last outstanding member of the current one.
    async fn mark_complete(&self, target_path: &str) -> Result<()> {
        self.state.lock().await.awaiting.remove(target_path);
        self.admit_ready_batches().await
    }
}

/// Processes both dev and fix tasks pulled from the unified dev/fix pool,
/// branching on the task's payload tag. Dev tasks are served from cache on
/// hit; fix tasks always invoke the agent fresh with issue-derived
/// instructions and skip the cache, since each fix is unique.
struct DevFixProcessor {
    cache: Arc<ResultCache>,
    breaker: Arc<CircuitBreaker>,
    agent: Arc<dyn DevAgent>,
    router: Arc<EventRouter>,
    deadline: Duration,
}

impl DevFixProcessor {
    async fn emit_file_completed(&self, task_id: &str, target_path: &str, result: DevResult, cache_hit: bool) -> Result<()> {
        let event = Event::new(
            EventType::FileCompleted,
            task_id,
            serde_json::json!({
                "target_path": target_path,
                "files": result.files,
                "cache_hit": cache_hit,
            }),
        );
        if let Some(escalated) = self.router.route(event).await? {
            self.router.route(escalated).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TaskProcessor for DevFixProcessor {
    async fn process(&self, task: &Task) -> Result<()> {
        match &task.payload {
            TaskPayload::Dev {
                target_path,
                language_hint,
                instructions,
                extra,
            } => {
                if let Some(bytes) = self.cache.get(task)? {
                    let result = crate::cache::decode::<DevResult>(&bytes)?;
                    return self.emit_file_completed(&task.id, target_path, result, true).await;
                }

                let agent = Arc::clone(&self.agent);
                let target = target_path.clone();
                let hint = language_hint.clone();
                let instructions = instructions.clone();
                let extra = extra.clone();
                let result = self
                    .breaker
                    .call(self.deadline, async move { agent.run(&target, hint.as_deref(), &instructions, &extra).await })
                    .await?;
                self.cache.set(task, crate::cache::encode(&result)?)?;
                self.emit_file_completed(&task.id, target_path, result, false).await
            }
            TaskPayload::Fix { target_path, issues, extra } => {
                let agent = Arc::clone(&self.agent);
                let target = target_path.clone();
                let instructions = describe_issues(issues);
                let extra = extra.clone();
                let result = self
                    .breaker
                    .call(self.deadline, async move { agent.run(&target, None, &instructions, &extra).await })
                    .await?;
                self.emit_file_completed(&task.id, target_path, result, false).await
            }
            other => Err(PipelineError::MalformedPlan(format!(
                "dev/fix pool cannot process task type {}",
                other.task_type()
            ))),
        }
    }
}

struct QaProcessor {
    breaker: Arc<CircuitBreaker>,
    agent: Arc<dyn QaAgent>,
    router: Arc<EventRouter>,
    deadline: Duration,
}

#[async_trait]
impl TaskProcessor for QaProcessor {
    async fn process(&self, task: &Task) -> Result<()> {
        let TaskPayload::Qa { target_path, files, extra } = &task.payload else {
            return Err(PipelineError::MalformedPlan("qa pool received a non-qa task".to_string()));
        };

        let agent = Arc::clone(&self.agent);
        let target = target_path.clone();
        let files_clone = files.clone();
        let extra = extra.clone();
        let result = self
            .breaker
            .call(self.deadline, async move { agent.review(&target, &files_clone, &extra).await })
            .await?;

        let event_type = if result.passed { EventType::QaPassed } else { EventType::QaFailed };
        let event = Event::new(
            event_type,
            task.id.clone(),
            serde_json::json!({
                "target_path": target_path,
                "issues": result.issues,
                "stats": result.stats,
            }),
        );
        if let Some(escalated) = self.router.route(event).await? {
            self.router.route(escalated).await?;
        }
        Ok(())
    }
}

struct DeployProcessor {
    breaker: Arc<CircuitBreaker>,
    agent: Arc<dyn DeployAgent>,
    router: Arc<EventRouter>,
    canary: Arc<CanaryController>,
    canary_config: CanaryConfig,
    deadline: Duration,
}

#[async_trait]
impl TaskProcessor for DeployProcessor {
    async fn process(&self, task: &Task) -> Result<()> {
        let TaskPayload::Deploy { artifact, extra } = &task.payload else {
            return Err(PipelineError::MalformedPlan("deploy pool received a non-deploy task".to_string()));
        };

        let agent = Arc::clone(&self.agent);
        let artifact_clone = artifact.clone();
        let extra_clone = extra.clone();
        let outcome = self
            .breaker
            .call(self.deadline, async move { agent.deploy(&artifact_clone, &extra_clone).await })
            .await;

        let event = match &outcome {
            Ok(deploy_result) => {
                if let Err(e) = self.canary.start(deploy_result.deployment_id.clone(), self.canary_config.clone()).await {
                    warn!(deployment_id = %deploy_result.deployment_id, error = %e, "failed to start canary rollout");
                }
                Event::new(
                    EventType::DeployOk,
                    task.id.clone(),
                    serde_json::json!({
                        "deployment_id": deploy_result.deployment_id,
                        "endpoints": deploy_result.endpoints,
                        "health": deploy_result.health,
                    }),
                )
            }
            Err(e) => Event::new(
                EventType::DeployFail,
                task.id.clone(),
                serde_json::json!({ "artifact": artifact, "error": e.to_string() }),
            ),
        };

        if let Some(escalated) = self.router.route(event).await? {
            self.router.route(escalated).await?;
        }

        outcome.map(|_| ())
    }
}

/// Bridges `FILE_COMPLETED` to the QA Queue.
struct FileCompletedHandler {
    qa_queue: Arc<PriorityTaskQueue>,
}

#[async_trait]
impl EventHandler for FileCompletedHandler {
    async fn handle(&self, event: &Event) -> Result<()> {
        let target_path = event
            .payload
            .get("target_path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| PipelineError::MalformedPlan("FILE_COMPLETED missing target_path".to_string()))?
            .to_string();

        let files: Vec<String> = event
            .payload
            .get("files")
            .and_then(|v| v.as_object())
            .map(|obj| obj.values().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        let task = Task::new(
            format!("qa-{}", event.task_id),
            TaskPayload::Qa {
                target_path,
                files,
                extra: serde_json::Value::Null,
            },
            Priority::NORMAL,
        );
        self.qa_queue.put(task)
    }
}

/// Bridges `QA_PASSED` to the Deploy Queue and releases the dependency gate
/// for the file that just passed.
struct QaPassedHandler {
    deploy_queue: Arc<PriorityTaskQueue>,
    gate: Arc<DependencyGate>,
}

#[async_trait]
impl EventHandler for QaPassedHandler {
    async fn handle(&self, event: &Event) -> Result<()> {
        let target_path = event
            .payload
            .get("target_path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| PipelineError::MalformedPlan("QA_PASSED missing target_path".to_string()))?
            .to_string();

        self.gate.mark_complete(&target_path).await?;

        let task = Task::new(
            format!("deploy-{}", event.task_id),
            TaskPayload::Deploy {
                artifact: target_path,
                extra: serde_json::Value::Null,
            },
            Priority::NORMAL,
        );
        self.deploy_queue.put(task)
    }
}

/// Bridges `QA_FAILED` to a fix task on the unified dev/fix pool. The fix
/// task re-enters the same `FILE_COMPLETED` path as a fresh dev task once
/// done, naturally looping back through QA.
struct QaFailedHandler {
    dev_fix_queue: Arc<DevFixQueue>,
}

#[async_trait]
impl EventHandler for QaFailedHandler {
    async fn handle(&self, event: &Event) -> Result<()> {
        let target_path = event
            .payload
            .get("target_path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| PipelineError::MalformedPlan("QA_FAILED missing target_path".to_string()))?
            .to_string();

        let issues: Vec<Issue> = event
            .payload
            .get("issues")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        let task = Task::new(
            format!("fix-{}", event.task_id),
            TaskPayload::Fix {
                target_path,
                issues,
                extra: serde_json::Value::Null,
            },
            Priority::NORMAL,
        );
        self.dev_fix_queue.submit(task)
    }
}

/// Wires every component in this crate into the dev -> qa -> (fix) -> deploy
/// flow and exposes the orchestrator-level operations a caller needs:
/// submission, draining, shutdown, scaling and a combined health view.
pub struct PipelineOrchestrator {
    dev_fix_queue: Arc<DevFixQueue>,
    qa_queue: Arc<PriorityTaskQueue>,
    deploy_queue: Arc<PriorityTaskQueue>,
    dev_fix_pool: Arc<WorkerPool>,
    qa_pool: Arc<WorkerPool>,
    deploy_pool: Arc<WorkerPool>,
    cache: Arc<ResultCache>,
    breakers: HashMap<&'static str, Arc<CircuitBreaker>>,
    router: Arc<EventRouter>,
    gate: Arc<DependencyGate>,
    analyzer: DependencyAnalyzer,
    canary: Arc<CanaryController>,
    metrics: Arc<MetricsStreamManager>,
    metrics_handle: Mutex<Option<JoinHandle<()>>>,
    heartbeat_interval_secs: u64,
    health_config: HealthConfig,
    stall_tracker: Mutex<HashMap<&'static str, Option<Instant>>>,
}

impl PipelineOrchestrator {
    pub fn new(
        config: PipelineConfig,
        dev_agent: Arc<dyn DevAgent>,
        qa_agent: Arc<dyn QaAgent>,
        deploy_agent: Arc<dyn DeployAgent>,
        dlq_store: Arc<dyn DlqStore>,
        canary_store: Arc<dyn CanaryStore>,
    ) -> Arc<Self> {
        let dev_fix_queue = DevFixQueue::new(QUEUE_CAPACITY, QUEUE_CAPACITY);
        let qa_queue = Arc::new(PriorityTaskQueue::new("qa", QUEUE_CAPACITY));
        let deploy_queue = Arc::new(PriorityTaskQueue::new("deploy", QUEUE_CAPACITY));

        let cache = Arc::new(ResultCache::new(config.cache.clone().into()));

        let dev_breaker = Arc::new(CircuitBreaker::new("dev_agent", config.breaker.clone().into()));
        let qa_breaker = Arc::new(CircuitBreaker::new("qa_agent", config.breaker.clone().into()));
        let deploy_breaker = Arc::new(CircuitBreaker::new("deploy_agent", config.breaker.clone().into()));

        let router = Arc::new(EventRouter::new(Arc::clone(&dlq_store), config.router.clone().into()));
        let canary = CanaryController::new(canary_store);
        let metrics = MetricsStreamManager::new(config.metrics.clone().into());

        let gate = DependencyGate::new(Arc::clone(&dev_fix_queue));

        let dev_deadline = Duration::from_secs(config.dev_pool.task_deadline_secs);
        let qa_deadline = Duration::from_secs(config.qa_pool.task_deadline_secs);
        let deploy_deadline = Duration::from_secs(config.deploy_pool.task_deadline_secs);

        let dev_fix_processor = Arc::new(DevFixProcessor {
            cache: Arc::clone(&cache),
            breaker: Arc::clone(&dev_breaker),
            agent: dev_agent,
            router: Arc::clone(&router),
            deadline: dev_deadline,
        });
        let qa_processor = Arc::new(QaProcessor {
            breaker: Arc::clone(&qa_breaker),
            agent: qa_agent,
            router: Arc::clone(&router),
            deadline: qa_deadline,
        });
        let deploy_processor = Arc::new(DeployProcessor {
            breaker: Arc::clone(&deploy_breaker),
            agent: deploy_agent,
            router: Arc::clone(&router),
            canary: Arc::clone(&canary),
            canary_config: config.canary.clone().into(),
            deadline: deploy_deadline,
        });

        let dev_fix_pool = WorkerPool::new(
            "dev_fix",
            Arc::clone(&dev_fix_queue) as Arc<dyn WorkQueue>,
            dev_fix_processor,
            make_exhaustion_handler(Arc::clone(&dlq_store), Arc::clone(&router), EventType::FileFailed),
            config.dev_pool.clone().into(),
        );
        let qa_pool = WorkerPool::new(
            "qa",
            Arc::clone(&qa_queue) as Arc<dyn WorkQueue>,
            qa_processor,
            make_exhaustion_handler(Arc::clone(&dlq_store), Arc::clone(&router), EventType::QaFailed),
            config.qa_pool.clone().into(),
        );
        let deploy_pool = WorkerPool::new(
            "deploy",
            Arc::clone(&deploy_queue) as Arc<dyn WorkQueue>,
            deploy_processor,
            make_exhaustion_handler(Arc::clone(&dlq_store), Arc::clone(&router), EventType::DeployFail),
            config.deploy_pool.clone().into(),
        );

        let mut breakers: HashMap<&'static str, Arc<CircuitBreaker>> = HashMap::new();
        breakers.insert("dev", dev_breaker);
        breakers.insert("qa", qa_breaker);
        breakers.insert("deploy", deploy_breaker);

        Arc::new(Self {
            dev_fix_queue,
            qa_queue,
            deploy_queue,
            dev_fix_pool,
            qa_pool,
            deploy_pool,
            cache,
            breakers,
            router,
            gate,
            analyzer: DependencyAnalyzer::new(),
            canary,
            metrics,
            metrics_handle: Mutex::new(None),
            heartbeat_interval_secs: config.metrics.heartbeat_interval_secs,
            health_config: HealthConfig::default(),
            stall_tracker: Mutex::new(HashMap::new()),
        })
    }

    /// Register event handlers, start every worker pool, and begin the
    /// periodic metrics heartbeat. Split from `new` so handlers can hold
    /// `Arc` references to the specific sibling queues they need rather than
    /// a back-reference to `self` — keeps the router's handler registry free
    /// of a reference cycle through the orchestrator.
    pub async fn start(self: &Arc<Self>) {
        self.router
            .register(
                EventType::FileCompleted,
                Arc::new(FileCompletedHandler {
                    qa_queue: Arc::clone(&self.qa_queue),
                }),
            )
            .await;
        self.router
            .register(
                EventType::QaPassed,
                Arc::new(QaPassedHandler {
                    deploy_queue: Arc::clone(&self.deploy_queue),
                    gate: Arc::clone(&self.gate),
                }),
            )
            .await;
        self.router
            .register(
                EventType::QaFailed,
                Arc::new(QaFailedHandler {
                    dev_fix_queue: Arc::clone(&self.dev_fix_queue),
                }),
            )
            .await;

        self.dev_fix_pool.start().await;
        self.qa_pool.start().await;
        self.deploy_pool.start().await;

        let orchestrator = Arc::clone(self);
        let interval = Duration::from_secs(self.heartbeat_interval_secs.max(1));
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                orchestrator.broadcast_metrics().await;
            }
        });
        *self.metrics_handle.lock().await = Some(handle);

        info!("pipeline orchestrator started");
    }

    async fn broadcast_metrics(&self) {
        self.metrics
            .broadcast(Metric::new(MetricType::QueueDepth, "dev_fix_queue", self.dev_fix_queue.depth() as f64))
            .await;
        self.metrics
            .broadcast(Metric::new(MetricType::QueueDepth, "qa_queue", self.qa_queue.depth() as f64))
            .await;
        self.metrics
            .broadcast(Metric::new(MetricType::QueueDepth, "deploy_queue", self.deploy_queue.depth() as f64))
            .await;
        self.metrics
            .broadcast(Metric::new(MetricType::CacheHitRate, "cache", self.cache.stats().hit_rate()))
            .await;
        let dlq_size = self.router.stats().await.dlq_size;
        self.metrics.broadcast(Metric::new(MetricType::DlqSize, "router", dlq_size as f64)).await;
    }

    /// Analyze `plan` into dependency batches and admit the first batch.
    /// Returns the dependency statistics so the caller can observe cycles,
    /// missing targets, and batch count.
    pub async fn submit(&self, plan: Plan) -> Result<DependencyStats> {
        plan.validate()?;

        let AnalysisResult { batches, critical_path, stats } = self.analyzer.analyze(&plan);

        let entries_by_path: HashMap<String, PlanEntry> = plan
            .entries
            .iter()
            .cloned()
            .map(|e| (e.target_file_path.clone(), e))
            .collect();

        self.gate.seed(batches, &entries_by_path, critical_path).await?;
        Ok(stats)
    }

    /// Submit a standalone fix task (e.g. from an external triage flow,
    /// rather than as a `QA_FAILED` reaction).
    pub async fn submit_fix(&self, task: Task) -> Result<()> {
        if task.task_type() != TaskType::Fix {
            return Err(PipelineError::MalformedPlan(
                "submit_fix requires a task with a fix payload".to_string(),
            ));
        }
        self.dev_fix_queue.submit(task)
    }

    /// Block until every queue is empty of pending and in-flight work.
    pub async fn drain(&self) {
        tokio::join!(
            self.dev_fix_queue.wait_until_empty(),
            self.qa_queue.wait_until_empty(),
            self.deploy_queue.wait_until_empty(),
        );
    }

    /// Stop every worker pool and the metrics heartbeat. `graceful=true`
    /// waits up to `timeout` for in-flight tasks to finish before cancelling
    /// what remains.
    pub async fn stop(&self, graceful: bool, timeout: Duration) {
        if let Some(handle) = self.metrics_handle.lock().await.take() {
            handle.abort();
        }

        let stop_all = async {
            tokio::join!(
                self.dev_fix_pool.stop(graceful),
                self.qa_pool.stop(graceful),
                self.deploy_pool.stop(graceful),
            );
        };
        if tokio::time::timeout(timeout, stop_all).await.is_err() {
            warn!("orchestrator shutdown exceeded timeout, pools may still be unwinding");
        }
        info!(graceful, "pipeline orchestrator stopped");
    }

    pub async fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            dev_fix_pool: self.dev_fix_pool.stats().await,
            qa_pool: self.qa_pool.stats().await,
            deploy_pool: self.deploy_pool.stats().await,
            dev_fix_queue: self.dev_fix_queue.stats(),
            qa_queue: self.qa_queue.stats(),
            deploy_queue: self.deploy_queue.stats(),
            cache: self.cache.stats(),
            router: self.router.stats().await,
        }
    }

    /// Resize the dev/fix and/or QA worker pools. `None` leaves that pool
    /// untouched.
    pub async fn scale(&self, dev: Option<usize>, qa: Option<usize>) {
        if let Some(target) = dev {
            self.dev_fix_pool.scale_to(target).await;
        }
        if let Some(target) = qa {
            self.qa_pool.scale_to(target).await;
        }
    }

    pub fn canary(&self) -> &Arc<CanaryController> {
        &self.canary
    }

    pub fn metrics(&self) -> &Arc<MetricsStreamManager> {
        &self.metrics
    }

    /// Combined health view: no queue stalled beyond `stall_threshold_secs`,
    /// no breaker open for more than `open_alarm_secs`, and the DLQ below
    /// `dlq_alarm`.
    pub async fn health(&self) -> HealthReport {
        let mut stalled = Vec::new();
        {
            let mut tracker = self.stall_tracker.lock().await;
            let depths: [(&'static str, usize); 3] = [
                ("dev_fix", self.dev_fix_queue.depth()),
                ("qa", self.qa_queue.depth()),
                ("deploy", self.deploy_queue.depth()),
            ];
            for (name, depth) in depths {
                let slot = tracker.entry(name).or_insert(None);
                if depth == 0 {
                    *slot = None;
                } else if slot.is_none() {
                    *slot = Some(Instant::now());
                }
                if let Some(since) = slot {
                    if since.elapsed() > Duration::from_secs(self.health_config.stall_threshold_secs) {
                        stalled.push(name.to_string());
                    }
                }
            }
        }

        let mut open_breakers = Vec::new();
        for (name, breaker) in &self.breakers {
            if let Some(open_for) = breaker.open_duration() {
                if open_for > Duration::from_secs(self.health_config.open_alarm_secs) {
                    open_breakers.push((*name).to_string());
                }
            }
        }

        let router_stats = self.router.stats().await;
        let healthy = stalled.is_empty() && open_breakers.is_empty() && router_stats.dlq_size < self.health_config.dlq_alarm;

        HealthReport {
            healthy,
            stalled_queues: stalled,
            open_breakers,
            dlq_size: router_stats.dlq_size,
        }
    }

    /// Drive one boundary check for an in-flight canary, emitting the right
    /// event for the outcome. Callers (typically a scheduled loop) supply the
    /// latest health sample; the controller itself never collects metrics.
    pub async fn tick_canary(&self, deployment_id: &str, sample: HealthSample) -> Result<StageOutcome> {
        self.canary.check_boundary(deployment_id, sample).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{DeployResult, QaResult};
    use crate::persistence::{InMemoryCanaryStore, InMemoryDlqStore};
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoDevAgent {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DevAgent for EchoDevAgent {
        async fn run(
            &self,
            target_path: &str,
            _language_hint: Option<&str>,
            _instructions: &str,
            _extra: &serde_json::Value,
        ) -> Result<DevResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut files = StdHashMap::new();
            files.insert(target_path.to_string(), "generated".to_string());
            Ok(DevResult { files, logs: vec![] })
        }
    }

    struct AlwaysPassQa;

    #[async_trait]
    impl QaAgent for AlwaysPassQa {
        async fn review(&self, _target_path: &str, _files: &[String], _extra: &serde_json::Value) -> Result<QaResult> {
            Ok(QaResult {
                passed: true,
                issues: vec![],
                stats: StdHashMap::new(),
            })
        }
    }

    struct AlwaysDeploy;

    #[async_trait]
    impl DeployAgent for AlwaysDeploy {
        async fn deploy(&self, artifact: &str, _extra: &serde_json::Value) -> Result<DeployResult> {
            Ok(DeployResult {
                deployment_id: format!("dep-{artifact}"),
                endpoints: vec![],
                health: "ok".to_string(),
            })
        }
    }

    fn test_orchestrator(dev_calls: Arc<AtomicUsize>) -> Arc<PipelineOrchestrator> {
        PipelineOrchestrator::new(
            PipelineConfig::default(),
            Arc::new(EchoDevAgent { calls: dev_calls }),
            Arc::new(AlwaysPassQa),
            Arc::new(AlwaysDeploy),
            InMemoryDlqStore::new(),
            InMemoryCanaryStore::new(),
        )
    }

    #[tokio::test]
    async fn test_linear_plan_flows_dev_to_qa_to_deploy() {
        let dev_calls = Arc::new(AtomicUsize::new(0));
        let orchestrator = test_orchestrator(dev_calls.clone());
        orchestrator.start().await;

        let plan = Plan::new(vec![
            PlanEntry::new("a", "A", "A.py"),
            PlanEntry::new("b", "B", "B.py").with_dependencies(vec!["a".to_string()]),
        ]);
        let stats = orchestrator.submit(plan).await.unwrap();
        assert_eq!(stats.batch_count, 2);

        orchestrator.drain().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dev_calls.load(Ordering::SeqCst), 2);

        orchestrator.stop(true, Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_submit_rejects_malformed_plan() {
        let orchestrator = test_orchestrator(Arc::new(AtomicUsize::new(0)));
        let plan = Plan::new(vec![PlanEntry::new("", "t", "a.py")]);
        assert!(orchestrator.submit(plan).await.is_err());
    }

    #[tokio::test]
    async fn test_submit_fix_rejects_non_fix_task() {
        let orchestrator = test_orchestrator(Arc::new(AtomicUsize::new(0)));
        let dev_task = Task::new(
            "t1",
            TaskPayload::Dev {
                target_path: "a.py".to_string(),
                language_hint: None,
                instructions: "x".to_string(),
                extra: serde_json::Value::Null,
            },
            Priority::NORMAL,
        );
        assert!(orchestrator.submit_fix(dev_task).await.is_err());
    }

    #[tokio::test]
    async fn test_health_starts_clean() {
        let orchestrator = test_orchestrator(Arc::new(AtomicUsize::new(0)));
        let health = orchestrator.health().await;
        assert!(health.healthy);
        assert!(health.stalled_queues.is_empty());
        assert!(health.open_breakers.is_empty());
    }

    #[tokio::test]
    async fn test_scale_resizes_dev_pool() {
        let orchestrator = test_orchestrator(Arc::new(AtomicUsize::new(0)));
        orchestrator.start().await;
        orchestrator.scale(Some(2), None).await;
        let stats = orchestrator.dev_fix_pool.stats().await;
        assert_eq!(stats.worker_count, 2);
        orchestrator.stop(false, Duration::from_secs(1)).await;
    }
}
