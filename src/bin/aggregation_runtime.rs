//! Aggregation Runtime
//!
//! Periodic bar rollup job:
//! - Opens the SQLite database and runs schema migrations
//! - Reconciles aggregation tasks with the instrument registry
//! - Triggers an orchestrator run every `AGG_RUN_INTERVAL_MS`
//!
//! Usage:
//!   cargo run --release --bin aggregation_runtime [--once | --sync | --health | --reset-task <id>
//!                                                  | --regenerate <id> <from_ts>]
//!
//! - `--once`        single run, summary printed as JSON
//! - `--sync`        registry sync only, report printed as JSON
//! - `--health`      task health rows printed as JSON
//! - `--reset-task`  return a hard_failed / disabled / orphaned task to idle
//! - `--regenerate`  soft-delete a task's bars from `from_ts` on and rewind
//!                   its cursor so the next runs rebuild them
//!
//! Environment variables: see `AggregationConfig::from_env`.

use barflow::pipeline::{
    config::AggregationConfig,
    db::open_database,
    registry::{sync_tasks_from_registry, SqliteRegistry, SyncSettings},
    scheduler::{run_periodic, AggregationOrchestrator, PeriodicJob},
    tasks::{reset_task, rewind_task, task_health},
};
use dotenv::dotenv;
use log::{error, info};
use std::env;
use std::sync::{Arc, Mutex};

enum Command {
    Serve,
    Once,
    Sync,
    Health,
    ResetTask(i64),
    Regenerate { task_id: i64, from: i64 },
}

fn parse_command() -> Result<Command, String> {
    let args: Vec<String> = env::args().skip(1).collect();
    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        [] => Ok(Command::Serve),
        ["--once"] => Ok(Command::Once),
        ["--sync"] => Ok(Command::Sync),
        ["--health"] => Ok(Command::Health),
        ["--reset-task", id] => id
            .parse()
            .map(Command::ResetTask)
            .map_err(|_| format!("invalid task id '{}'", id)),
        ["--regenerate", id, from] => {
            let task_id = id.parse().map_err(|_| format!("invalid task id '{}'", id))?;
            let from = from.parse().map_err(|_| format!("invalid timestamp '{}'", from))?;
            Ok(Command::Regenerate { task_id, from })
        }
        other => Err(format!("unrecognised arguments: {}", other.join(" "))),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::init();

    let command = parse_command()?;
    let config = AggregationConfig::from_env()?;
    let now = chrono::Utc::now().timestamp();

    let conn = open_database(&config.db_path)?;

    match command {
        Command::Health => {
            println!("{}", serde_json::to_string_pretty(&task_health(&conn, now)?)?);
            return Ok(());
        }
        Command::ResetTask(task_id) => {
            reset_task(&conn, task_id, now)?;
            return Ok(());
        }
        Command::Regenerate { task_id, from } => {
            let deleted = rewind_task(&conn, task_id, from, now)?;
            println!("{}", serde_json::json!({ "task_id": task_id, "bars_soft_deleted": deleted }));
            return Ok(());
        }
        _ => {}
    }

    let registry = Arc::new(SqliteRegistry::open(&config.db_path)?);

    if matches!(command, Command::Sync) {
        let report = sync_tasks_from_registry(&conn, registry.as_ref(), &SyncSettings::from(&config), now)?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    info!("🚀 Aggregation Runtime");
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Worker: {} (job '{}')", config.worker_id, config.job_name);
    info!("   ├─ Targets: {:?}", config.target_timeframes);
    info!("   ├─ Budget: {}ms per run, {} windows per task", config.execution_budget_ms, config.max_windows_per_task);
    info!("   └─ Lease: {}s", config.lock_lease_secs);

    if matches!(command, Command::Serve) {
        // Reconcile once at startup, outside any aggregation run
        if let Err(e) = sync_tasks_from_registry(&conn, registry.as_ref(), &SyncSettings::from(&config), now) {
            error!("❌ Startup registry sync failed: {}", e);
        }
    }

    let run_interval_ms = config.run_interval_ms;
    let conn = Arc::new(Mutex::new(conn));
    let orchestrator = Arc::new(AggregationOrchestrator::new(conn, config, registry)?);

    if matches!(command, Command::Once) {
        let outcome = orchestrator.run_once(now).await?;
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    info!("🔄 Press CTRL+C to shutdown gracefully");

    tokio::select! {
        _ = run_periodic(orchestrator, run_interval_ms) => {}
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("⚠️  Received CTRL+C, shutting down..."),
                Err(err) => error!("❌ Failed to listen for CTRL+C: {}", err),
            }
        }
    }

    info!("✅ Aggregation runtime stopped");
    Ok(())
}
