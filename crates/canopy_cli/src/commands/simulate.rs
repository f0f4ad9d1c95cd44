//! Simulate command implementation.
//!
//! Runs many units of work at once through one manager and reports how the
//! chosen strategy coped: how many committed, how many conflicts were
//! merged, and, for the counter workload, how many increments were lost.

use crate::error::CliError;
use canopy_core::{
    Config, KindRegistry, PersistentObject, StatsSnapshot, StrategyKind, TransactionManager, Value,
};
use canopy_storage::{FileBackend, InMemoryBackend, Oid, StorageBackend};
use canopy_testkit::{read_field, stress_add_children, stress_counter, StressConfig, StressTestResult};
use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

const COUNTER_NAME: &str = "counter";
const COUNTER_FIELD: &str = "value";

/// What each unit of work does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workload {
    /// Every unit increments the same field of one object.
    Counter,
    /// Every unit adds a distinctly named child to one folder.
    Children,
}

impl FromStr for Workload {
    type Err = CliError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "counter" => Ok(Self::Counter),
            "children" => Ok(Self::Children),
            other => Err(CliError::UnknownWorkload(other.to_string())),
        }
    }
}

/// Simulation parameters.
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    /// Strategy of the manager.
    pub strategy: StrategyKind,
    /// Workload to run.
    pub workload: Workload,
    /// Concurrent tasks.
    pub tasks: usize,
    /// Units of work per task.
    pub operations_per_task: usize,
    /// Attempts per unit of work.
    pub max_retries: u32,
    /// Snapshot file to run against; in-memory if `None`.
    pub path: Option<PathBuf>,
}

/// Simulation report.
#[derive(Debug, Serialize)]
pub struct SimulateReport {
    /// Strategy name.
    pub strategy: String,
    /// `"memory"` or the snapshot path.
    pub backend: String,
    /// Units of work attempted.
    pub units: usize,
    /// Units that committed.
    pub committed: usize,
    /// Units that gave up.
    pub failed: usize,
    /// Wall time in milliseconds.
    pub duration_ms: u128,
    /// Units per second.
    pub units_per_second: f64,
    /// Counter increments that committed but are missing from the result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lost_updates: Option<i64>,
    /// Children present in the folder after the run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<usize>,
    /// Manager counters.
    pub stats: StatsReport,
}

/// Serializable copy of the manager counters.
#[derive(Debug, Serialize)]
pub struct StatsReport {
    /// Transactions begun.
    pub started: u64,
    /// Transactions committed.
    pub committed: u64,
    /// Transactions aborted.
    pub aborted: u64,
    /// Votes that reported a conflict.
    pub conflicts: u64,
    /// Objects merged by a resolver.
    pub resolved: u64,
    /// Replayed units of work.
    pub retries: u64,
}

impl From<StatsSnapshot> for StatsReport {
    fn from(s: StatsSnapshot) -> Self {
        Self {
            started: s.started,
            committed: s.committed,
            aborted: s.aborted,
            conflicts: s.conflicts,
            resolved: s.resolved,
            retries: s.retries,
        }
    }
}

/// Runs the simulate command.
pub async fn run(options: &SimulateOptions, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let report = simulate(options).await?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            print_text_output(&report);
        }
    }

    Ok(())
}

/// Runs the workload and collects the report.
pub async fn simulate(options: &SimulateOptions) -> Result<SimulateReport, Box<dyn std::error::Error>> {
    let (storage, backend): (Arc<dyn StorageBackend>, String) = match &options.path {
        Some(path) => (
            Arc::new(FileBackend::open_with_create_dirs(path)?),
            path.display().to_string(),
        ),
        None => (Arc::new(InMemoryBackend::new()), "memory".to_string()),
    };
    let config = Config::default()
        .strategy(options.strategy)
        .max_retries(options.max_retries);
    let manager = Arc::new(TransactionManager::new(
        storage,
        Arc::new(KindRegistry::new()),
        config,
        None,
    ));
    manager.initialize().await?;

    let stress = StressConfig {
        tasks: options.tasks,
        operations_per_task: options.operations_per_task,
    };

    let (result, lost_updates, children) = match options.workload {
        Workload::Counter => {
            let (oid, initial) = counter(&manager).await?;
            let result = stress_counter(Arc::clone(&manager), oid.clone(), COUNTER_FIELD, &stress).await;
            let last = read_field(&manager, &oid, COUNTER_FIELD)
                .await
                .and_then(|v| v.as_integer())
                .unwrap_or(0);
            let expected = initial + result.successful_ops as i64;
            (result, Some(expected - last), None)
        }
        Workload::Children => {
            let folder = folder(&manager).await?;
            let result = stress_add_children(Arc::clone(&manager), folder.clone(), &stress).await;
            let mut txn = manager.begin_read_only().await?;
            let count = txn.len(&folder).await?;
            txn.abort().await?;
            (result, None, Some(count))
        }
    };

    Ok(report(options, backend, &result, lost_updates, children, manager.stats().snapshot()))
}

/// Finds or creates the counter object; returns its oid and current value.
async fn counter(manager: &TransactionManager) -> Result<(Oid, i64), Box<dyn std::error::Error>> {
    let mut txn = manager.begin().await?;
    if let Some(existing) = txn.get_child(&Oid::root(), COUNTER_NAME).await? {
        let value = existing
            .get(COUNTER_FIELD)
            .and_then(Value::as_integer)
            .unwrap_or(0);
        txn.abort().await?;
        return Ok((existing.oid().clone(), value));
    }
    let object = PersistentObject::new("counter").with_field(COUNTER_FIELD, 0i64);
    let oid = txn.add_child(&Oid::root(), COUNTER_NAME, object).await?;
    txn.commit().await?;
    Ok((oid, 0))
}

/// Creates a fresh folder for one children run.
async fn folder(manager: &TransactionManager) -> Result<Oid, Box<dyn std::error::Error>> {
    let mut txn = manager.begin().await?;
    let run = manager.storage().current_tid().await?;
    let name = format!("simulation-{run}");
    let oid = txn
        .add_child(&Oid::root(), &name, PersistentObject::new("folder"))
        .await?;
    txn.commit().await?;
    Ok(oid)
}

fn report(
    options: &SimulateOptions,
    backend: String,
    result: &StressTestResult,
    lost_updates: Option<i64>,
    children: Option<usize>,
    stats: StatsSnapshot,
) -> SimulateReport {
    SimulateReport {
        strategy: options.strategy.to_string(),
        backend,
        units: result.total_ops,
        committed: result.successful_ops,
        failed: result.failed_ops,
        duration_ms: result.duration.as_millis(),
        units_per_second: result.ops_per_second,
        lost_updates,
        children,
        stats: stats.into(),
    }
}

fn print_text_output(report: &SimulateReport) {
    println!("Simulation ({} on {}):", report.strategy, report.backend);
    println!("  Units:          {}", report.units);
    println!("  Committed:      {}", report.committed);
    println!("  Failed:         {}", report.failed);
    println!("  Duration:       {} ms", report.duration_ms);
    println!("  Throughput:     {:.2} units/sec", report.units_per_second);
    if let Some(lost) = report.lost_updates {
        println!("  Lost updates:   {}", lost);
    }
    if let Some(children) = report.children {
        println!("  Children:       {}", children);
    }
    println!();
    println!("Transactions:");
    println!("  Started:        {}", report.stats.started);
    println!("  Committed:      {}", report.stats.committed);
    println!("  Aborted:        {}", report.stats.aborted);
    println!("  Conflicts:      {}", report.stats.conflicts);
    println!("  Resolved:       {}", report.stats.resolved);
    println!("  Retries:        {}", report.stats.retries);
}
