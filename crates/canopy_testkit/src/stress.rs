//! Concurrency stress helpers.
//!
//! These run many units of work at once through
//! [`TransactionManager::run`] and report how many committed.

use canopy_codec::Value;
use canopy_core::{CoreError, PersistentObject, TransactionManager};
use canopy_storage::Oid;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result of a stress run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total units of work attempted.
    pub total_ops: usize,
    /// Units that committed.
    pub successful_ops: usize,
    /// Units that gave up.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Units per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the run.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total units: {}", self.total_ops);
        println!("Committed: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} units/sec", self.ops_per_second);
    }
}

/// Configuration for stress runs.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of concurrent tasks.
    pub tasks: usize,
    /// Units of work per task.
    pub operations_per_task: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            tasks: 4,
            operations_per_task: 25,
        }
    }
}

async fn join_all(
    handles: Vec<tokio::task::JoinHandle<Result<(), CoreError>>>,
    start: Instant,
) -> StressTestResult {
    let mut successful = 0usize;
    let mut failed = 0usize;
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => successful += 1,
            _ => failed += 1,
        }
    }
    StressTestResult::new(successful, failed, start.elapsed())
}

/// Increments integer field `field` of `oid` from many tasks at once.
///
/// With a correct strategy the final value equals the number of
/// successful units.
pub async fn stress_counter(
    manager: Arc<TransactionManager>,
    oid: Oid,
    field: &'static str,
    config: &StressConfig,
) -> StressTestResult {
    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..config.tasks {
        for _ in 0..config.operations_per_task {
            let manager = Arc::clone(&manager);
            let oid = oid.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .run(move |txn| {
                        let oid = oid.clone();
                        Box::pin(async move {
                            let object = txn.edit(&oid).await?;
                            let current = object.get(field).and_then(Value::as_integer).unwrap_or(0);
                            object.set(field, current + 1);
                            Ok(())
                        })
                    })
                    .await
            }));
        }
    }
    join_all(handles, start).await
}

/// Adds distinctly named children of `parent` from many tasks at once.
pub async fn stress_add_children(
    manager: Arc<TransactionManager>,
    parent: Oid,
    config: &StressConfig,
) -> StressTestResult {
    let start = Instant::now();
    let mut handles = Vec::new();
    for task in 0..config.tasks {
        for op in 0..config.operations_per_task {
            let manager = Arc::clone(&manager);
            let parent = parent.clone();
            let name = format!("child-{task}-{op}");
            handles.push(tokio::spawn(async move {
                manager
                    .run(move |txn| {
                        let parent = parent.clone();
                        let name = name.clone();
                        Box::pin(async move {
                            let child = PersistentObject::new("item").with_field("task", task as i64);
                            txn.add_child(&parent, &name, child).await?;
                            Ok(())
                        })
                    })
                    .await
            }));
        }
    }
    join_all(handles, start).await
}
