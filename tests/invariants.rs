//! Property-based invariants over small synthetic inputs, per the pipeline's
//! testable-properties list: dependency-batch ordering, cache idempotence,
//! priority monotonicity, and the circuit breaker's state graph.

use agentflow_pipeline::{
    BreakerConfig, CacheConfig, CircuitBreaker, CircuitState, DependencyAnalyzer, Plan, PipelineError, PlanEntry, Priority,
    PriorityTaskQueue, ResultCache, Task, TaskPayload,
};
use proptest::prelude::*;
use std::time::Duration;

fn dev_task(id: &str, target_path: &str, priority: u8) -> Task {
    Task::new(
        id,
        TaskPayload::Dev {
            target_path: target_path.to_string(),
            language_hint: None,
            instructions: "x".to_string(),
            extra: serde_json::Value::Null,
        },
        Priority::new(priority),
    )
}

fn run<F: std::future::Future>(fut: F) -> F::Output {
    tokio::runtime::Runtime::new().unwrap().block_on(fut)
}

proptest! {
    /// Invariant 1 (batch ordering concretization): for a random acyclic chain
    /// of N files where file k depends on file k-1, analyzing the plan must
    /// place file k strictly after file k-1's batch.
    #[test]
    fn dependency_batches_respect_declared_order(n in 1usize..12) {
        let mut entries = Vec::new();
        for i in 0..n {
            let id = format!("f{i}");
            let path = format!("f{i}.py");
            let mut entry = PlanEntry::new(id, format!("File {i}"), path);
            if i > 0 {
                entry = entry.with_dependencies(vec![format!("f{}", i - 1)]);
            }
            entries.push(entry);
        }
        let plan = Plan::new(entries);
        let result = DependencyAnalyzer::new().analyze(&plan);

        prop_assert!(!result.stats.has_circular_dependencies);
        prop_assert_eq!(result.batches.len(), n);
        for (batch_index, batch) in result.batches.iter().enumerate() {
            prop_assert_eq!(batch.len(), 1);
            prop_assert_eq!(batch[0].display().to_string(), format!("f{batch_index}.py"));
        }
    }

    /// Invariant 2: `get(k)` after `set(k, v)` within TTL returns exactly `v`.
    #[test]
    fn cache_get_after_set_returns_exact_value(value in proptest::collection::vec(any::<u8>(), 0..64)) {
        let cache = ResultCache::new(CacheConfig::default());
        let task = dev_task("t", "a.py", 3);
        cache.set(&task, value.clone()).unwrap();
        prop_assert_eq!(cache.get(&task).unwrap(), Some(value));
    }

    /// Invariant 3: among tasks enqueued back-to-back (no intervening await),
    /// dequeue order follows ascending priority, FIFO within a priority band.
    #[test]
    fn priority_queue_dequeues_in_ascending_priority_order(
        mut priorities in proptest::collection::vec(1u8..5, 1..20)
    ) {
        let queue = PriorityTaskQueue::new("dev", priorities.len() + 1);
        for (i, p) in priorities.iter().enumerate() {
            queue.put(dev_task(&format!("t{i}"), &format!("f{i}.py"), *p)).unwrap();
        }

        priorities.sort();
        let mut dequeued = Vec::new();
        for _ in 0..priorities.len() {
            let task = run(queue.get()).unwrap();
            dequeued.push(task.priority.get());
        }
        prop_assert_eq!(dequeued, priorities);
    }

    /// Invariant 4: the breaker only ever reports one of the three
    /// documented states, and an all-success sequence from a closed breaker
    /// never opens it.
    #[test]
    fn breaker_stays_closed_under_an_all_success_sequence(call_count in 1usize..50) {
        let breaker = CircuitBreaker::new("dep", BreakerConfig::default());
        for _ in 0..call_count {
            run(breaker.call(Duration::from_secs(1), async { Ok(()) })).unwrap();
        }
        prop_assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn breaker_never_reports_other_than_the_three_documented_states(
        outcomes in proptest::collection::vec(any::<bool>(), 0..40)
    ) {
        let breaker = CircuitBreaker::new(
            "dep",
            BreakerConfig { failure_threshold: 0.5, window_size: 5, timeout_seconds: 3600, success_threshold: 2 },
        );
        for success in outcomes {
            let outcome = if success {
                run(breaker.call(Duration::from_secs(1), async { Ok(()) }))
            } else {
                run(breaker.call(Duration::from_secs(1), async {
                    Err(PipelineError::StageExecutionFailed("x".to_string()))
                }))
            };
            let _ = outcome;
            prop_assert!(matches!(
                breaker.state(),
                CircuitState::Closed | CircuitState::Open | CircuitState::HalfOpen
            ));
        }
    }
}
