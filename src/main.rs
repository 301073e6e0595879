use std::sync::Arc;

use dj_worker::store::{LedgerStore, LibSqlLedger};
use dj_worker::worker::workers_progress;

/// Number of error records printed.
const RECENT_ERROR_LIMIT: usize = 20;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let db_path = std::env::var("WORKER_LEDGER_PATH")
        .unwrap_or_else(|_| "./data/worker-ledger.db".to_string());

    let backtrack_minutes: i64 = std::env::var("WORKER_BACKTRACK_MINUTES")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(60);

    eprintln!("dj-worker status v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Ledger: {}\n", db_path);

    let db_path_ref = std::path::Path::new(&db_path);
    if !db_path_ref.exists() {
        eprintln!("Error: no ledger database at {}", db_path);
        eprintln!("  export WORKER_LEDGER_PATH=/path/to/worker-ledger.db");
        std::process::exit(1);
    }

    let ledger: Arc<dyn LedgerStore> = Arc::new(LibSqlLedger::new_local(db_path_ref).await?);

    // ── Registered workers ─────────────────────────────────────────────
    let workers = ledger.list_registered_workers().await?;
    println!("Registered workers ({})", workers.len());
    for worker in &workers {
        println!(
            "  {}  registered {}  config {}",
            worker.worker_name,
            worker.registration_time.format("%Y-%m-%d %H:%M:%S"),
            worker.worker_config_fingerprint
        );
        if let Some(registration) = ledger.get_registration(&worker.worker_name).await? {
            for process in &registration.processes {
                println!("    {:>2}. {}", process.process_index, process.process_name);
            }
        }
    }

    // ── Job progress ───────────────────────────────────────────────────
    // No job queue is attached to this binary.
    let progress = workers_progress(ledger.as_ref(), &[]).await?;
    println!("\nTable processes ({})", progress.len());
    for p in &progress {
        match p.counts {
            Some(c) => println!(
                "  {:<24} {:<40} reserved {:>4}  error {:>4}  ignore {:>4}",
                p.worker_name, p.process_name, c.reserved, c.error, c.ignore
            ),
            None => println!(
                "  {:<24} {:<40} {}  (queue not attached)",
                p.worker_name, p.process_name, p.full_table_name
            ),
        }
    }

    // ── Recent activity ────────────────────────────────────────────────
    let recent = ledger.recent_activity(backtrack_minutes).await?;
    println!("\nActivity in the last {backtrack_minutes} minutes ({} processes)", recent.len());
    for activity in &recent {
        println!(
            "  {:<40} workers {:>3}  oldest {:>4}m ago  newest {:>4}m ago",
            activity.process_name,
            activity.worker_count,
            activity.minutes_since_oldest,
            activity.minutes_since_newest
        );
    }

    // ── Errors ─────────────────────────────────────────────────────────
    let errors = ledger.list_errors(None).await?;
    println!("\nLogged errors ({} total)", errors.len());
    for error in errors.iter().take(RECENT_ERROR_LIMIT) {
        let message: String = error.error_message.chars().take(120).collect();
        println!(
            "  {}  {}  {}\n      {}",
            error.timestamp.format("%Y-%m-%d %H:%M:%S"),
            error.process_name,
            error.key,
            message
        );
    }

    Ok(())
}
