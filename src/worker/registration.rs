//! Worker registration: fingerprint the step list and persist it once.

use chrono::Utc;
use serde_json::{Map, Value, json};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::DatabaseError;
use crate::fingerprint::fingerprint;
use crate::store::{LedgerStore, RegisteredProcess, RegisteredWorker, Registration};
use crate::worker::naming::PrefixStripper;
use crate::worker::step::{ProcessStep, StepKind};

/// Build the registration describing `steps` as configured right now.
///
/// Each process fingerprint covers the worker name, process name, index,
/// backing table, job-source snapshot and invocation args. The worker
/// fingerprint covers the ordered `{index: process fingerprint}` map.
pub fn build_registration(
    config: &WorkerConfig,
    steps: &[ProcessStep],
    stripper: &PrefixStripper,
) -> Result<Registration, DatabaseError> {
    let mut processes = Vec::with_capacity(steps.len());
    let mut by_index = Map::new();

    for (index, step) in steps.iter().enumerate() {
        let process_name = step.process_name(stripper);
        let job_source_query = match &step.kind {
            StepKind::Queryable(job) => Some(job.key_source_snapshot()),
            StepKind::Callable(_) => None,
        };

        let mut entry = Map::new();
        entry.insert("worker_name".into(), json!(config.name));
        entry.insert("process".into(), json!(process_name));
        entry.insert("process_index".into(), json!(index));
        entry.insert("full_table_name".into(), json!(step.full_table_name()));
        entry.insert("key_source_sql".into(), json!(job_source_query));
        entry.insert(
            "process_kwargs".into(),
            Value::Object(step.invocation_args.clone()),
        );
        let process_config_fingerprint = fingerprint(&entry);

        by_index.insert(
            index.to_string(),
            json!(process_config_fingerprint.to_string()),
        );
        processes.push(RegisteredProcess {
            process_index: index,
            process_name,
            full_table_name: step.full_table_name().to_string(),
            job_source_query,
            invocation_args: step.invocation_args.clone(),
            process_config_fingerprint,
        });
    }

    let worker_kwargs = serde_json::to_value(config)
        .map_err(|e| DatabaseError::Serialization(format!("worker config: {e}")))?;

    Ok(Registration {
        worker: RegisteredWorker {
            worker_name: config.name.clone(),
            registration_time: Utc::now(),
            worker_kwargs,
            worker_config_fingerprint: fingerprint(&by_index),
        },
        processes,
    })
}

/// Persist `registration` unless the same fingerprint is already registered.
///
/// Returns `true` when a new registration was written.
pub async fn register(
    ledger: &dyn LedgerStore,
    registration: &Registration,
) -> Result<bool, DatabaseError> {
    let worker = &registration.worker;
    if ledger
        .registration_exists(&worker.worker_name, worker.worker_config_fingerprint)
        .await?
    {
        debug!(
            worker = %worker.worker_name,
            fingerprint = %worker.worker_config_fingerprint,
            "Worker already registered"
        );
        return Ok(false);
    }

    ledger.replace_registration(registration).await?;
    info!(
        worker = %worker.worker_name,
        fingerprint = %worker.worker_config_fingerprint,
        processes = registration.processes.len(),
        "Worker registered"
    );
    Ok(true)
}

/// Fingerprint of the registration `steps` would produce.
pub fn worker_fingerprint(
    config: &WorkerConfig,
    steps: &[ProcessStep],
    stripper: &PrefixStripper,
) -> Result<Uuid, DatabaseError> {
    Ok(build_registration(config, steps, stripper)?
        .worker
        .worker_config_fingerprint)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::LibSqlLedger;
    use crate::worker::step::{FnStep, StepArgs, StepFn};

    fn callable(name: &str, args: serde_json::Value) -> ProcessStep {
        let step: Arc<dyn StepFn> = Arc::new(FnStep::new(name, |_args: StepArgs| async { Ok(()) }));
        ProcessStep {
            kind: StepKind::Callable(step),
            invocation_args: args.as_object().cloned().unwrap_or_default(),
            position: 0,
        }
    }

    fn stripper() -> PrefixStripper {
        PrefixStripper::new(&[String::new()]).unwrap()
    }

    #[test]
    fn fingerprint_is_stable_and_arg_sensitive() {
        let config = WorkerConfig::new("w", "ledger");
        let a = vec![callable("export", json!({"limit": 1}))];
        let b = vec![callable("export", json!({"limit": 1}))];
        let c = vec![callable("export", json!({"limit": 2}))];

        let fa = worker_fingerprint(&config, &a, &stripper()).unwrap();
        assert_eq!(fa, worker_fingerprint(&config, &b, &stripper()).unwrap());
        assert_ne!(fa, worker_fingerprint(&config, &c, &stripper()).unwrap());
    }

    #[test]
    fn step_order_changes_fingerprint() {
        let config = WorkerConfig::new("w", "ledger");
        let ab = vec![callable("a", json!({})), callable("b", json!({}))];
        let ba = vec![callable("b", json!({})), callable("a", json!({}))];
        assert_ne!(
            worker_fingerprint(&config, &ab, &stripper()).unwrap(),
            worker_fingerprint(&config, &ba, &stripper()).unwrap()
        );
    }

    #[test]
    fn worker_kwargs_hold_config() {
        let config = WorkerConfig::new("w", "ledger");
        let reg = build_registration(&config, &[], &stripper()).unwrap();
        assert_eq!(reg.worker.worker_kwargs["name"], "w");
        assert_eq!(reg.worker.worker_kwargs["stale_timeout_hours"], 24);
        assert!(reg.processes.is_empty());
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let ledger = LibSqlLedger::new_memory().await.unwrap();
        let config = WorkerConfig::new("w", "ledger");
        let steps = vec![callable("export", json!({"limit": 1}))];

        let reg = build_registration(&config, &steps, &stripper()).unwrap();
        assert!(register(&ledger, &reg).await.unwrap());
        let again = build_registration(&config, &steps, &stripper()).unwrap();
        assert!(!register(&ledger, &again).await.unwrap());

        assert_eq!(ledger.list_registered_workers().await.unwrap().len(), 1);
    }
}
