//! Per-process job progress of every registered worker.
//!
//! Joins the registered table processes with the job-queue rows of their
//! table, counted by status.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::Result;
use crate::queue::{JobFilter, JobQueue, JobStatus};
use crate::store::LedgerStore;

/// Queue rows of one table, by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub reserved: usize,
    pub error: usize,
    pub ignore: usize,
}

/// Progress of one registered table process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessProgress {
    pub worker_name: String,
    pub process_name: String,
    pub full_table_name: String,
    /// `None` when no queue for the table's namespace was supplied.
    pub counts: Option<JobCounts>,
}

/// Job counts for every registered process that has a job source.
///
/// `queues` are matched to processes by namespace. Callable processes are
/// skipped, as is a repeat of the same process within one worker.
pub async fn workers_progress(
    ledger: &dyn LedgerStore,
    queues: &[Arc<dyn JobQueue>],
) -> Result<Vec<ProcessProgress>> {
    let mut progress = Vec::new();

    for worker in ledger.list_registered_workers().await? {
        let Some(registration) = ledger.get_registration(&worker.worker_name).await? else {
            continue;
        };
        let mut seen = HashSet::new();

        for process in registration.processes {
            if process.job_source_query.is_none() || !seen.insert(process.process_name.clone()) {
                continue;
            }

            let counts = match split_table_name(&process.full_table_name)
                .and_then(|(schema, table)| {
                    queues
                        .iter()
                        .find(|q| q.namespace() == schema)
                        .map(|q| (q, table))
                }) {
                Some((queue, table)) => Some(count_jobs(queue.as_ref(), table).await?),
                None => None,
            };

            progress.push(ProcessProgress {
                worker_name: worker.worker_name.clone(),
                process_name: process.process_name,
                full_table_name: process.full_table_name,
                counts,
            });
        }
    }
    Ok(progress)
}

async fn count_jobs(queue: &dyn JobQueue, table: &str) -> Result<JobCounts> {
    let mut counts = JobCounts::default();
    for job in queue
        .list_jobs(&JobFilter::default().with_table(table))
        .await?
    {
        match job.status {
            JobStatus::Reserved => counts.reserved += 1,
            JobStatus::Error => counts.error += 1,
            JobStatus::Ignore => counts.ignore += 1,
        }
    }
    Ok(counts)
}

/// `` `schema`.`table` `` into its bare parts.
fn split_table_name(full_table_name: &str) -> Option<(&str, &str)> {
    let (schema, table) = full_table_name.split_once('.')?;
    Some((schema.trim_matches('`'), table.trim_matches('`')))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::key_hash;
    use crate::queue::{JobEntry, JobKey, MemoryJobQueue};
    use crate::store::{LibSqlLedger, RegisteredProcess, RegisteredWorker, Registration};
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn key(n: i64) -> JobKey {
        json!({"session": n}).as_object().cloned().unwrap()
    }

    fn process(index: usize, name: &str, table: &str, source: Option<&str>) -> RegisteredProcess {
        RegisteredProcess {
            process_index: index,
            process_name: name.to_string(),
            full_table_name: table.to_string(),
            job_source_query: source.map(str::to_string),
            invocation_args: Default::default(),
            process_config_fingerprint: Uuid::nil(),
        }
    }

    async fn ledger_with(processes: Vec<RegisteredProcess>) -> LibSqlLedger {
        let ledger = LibSqlLedger::new_memory().await.unwrap();
        ledger
            .replace_registration(&Registration {
                worker: RegisteredWorker {
                    worker_name: "standard_worker".into(),
                    registration_time: Utc::now(),
                    worker_kwargs: json!({}),
                    worker_config_fingerprint: Uuid::nil(),
                },
                processes,
            })
            .await
            .unwrap();
        ledger
    }

    #[tokio::test]
    async fn counts_jobs_by_status_per_table() {
        let ledger = ledger_with(vec![
            process(0, "ephys.Clustering", "`lab_ephys`.`__clustering`", Some("SELECT 1")),
            process(1, "export_results", "", None),
            process(2, "ephys.Curation", "`lab_ephys`.`_curation`", Some("SELECT 2")),
        ])
        .await;

        let q = Arc::new(MemoryJobQueue::new("lab_ephys"));
        q.reserve("__clustering", key(1), 3, Utc::now()).await;
        q.push_error("__clustering", key(2), "ValueError: boom").await;
        q.push_error("__clustering", key(3), "ValueError: boom").await;
        q.insert(JobEntry {
            table_name: "__clustering".into(),
            key_hash: key_hash(&key(4)),
            key: key(4),
            status: JobStatus::Ignore,
            error_message: String::new(),
            error_stack: None,
            timestamp: Utc::now(),
            connection_id: 0,
            host: String::new(),
            user: String::new(),
            pid: 0,
        })
        .await;
        q.push_error("__spike_sorting", key(1), "ValueError: other table").await;

        let queues = vec![q as Arc<dyn JobQueue>];
        let progress = workers_progress(&ledger, &queues).await.unwrap();

        assert_eq!(progress.len(), 2);
        assert_eq!(progress[0].process_name, "ephys.Clustering");
        assert_eq!(
            progress[0].counts,
            Some(JobCounts {
                reserved: 1,
                error: 2,
                ignore: 1
            })
        );
        assert_eq!(progress[1].process_name, "ephys.Curation");
        assert_eq!(progress[1].counts, Some(JobCounts::default()));
    }

    #[tokio::test]
    async fn unknown_namespace_has_no_counts() {
        let ledger = ledger_with(vec![process(
            0,
            "imaging.Segmentation",
            "`lab_imaging`.`__segmentation`",
            Some("SELECT 1"),
        )])
        .await;

        let queues = vec![Arc::new(MemoryJobQueue::new("lab_ephys")) as Arc<dyn JobQueue>];
        let progress = workers_progress(&ledger, &queues).await.unwrap();

        assert_eq!(progress.len(), 1);
        assert_eq!(progress[0].counts, None);
    }

    #[test]
    fn split_strips_backticks() {
        assert_eq!(
            split_table_name("`lab_ephys`.`__clustering`"),
            Some(("lab_ephys", "__clustering"))
        );
        assert_eq!(split_table_name("export_results"), None);
    }
}
