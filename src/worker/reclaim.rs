//! Stale reservation handling.
//!
//! A reservation is stale when it has been held for longer than the
//! timeout AND the session that took it is no longer connected. The live
//! session list is a point-in-time snapshot, not a lock.

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::QueueError;
use crate::queue::{JobEntry, JobFilter, JobId, JobQueue, JobStatus};

/// Message written to reclaimed jobs.
pub const STALE_JOB_MESSAGE: &str =
    "Stale reserved job (process crashed or terminated without error)";

/// What to do with stale reservations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleAction {
    /// Move them to error status.
    Error,
    /// Delete them from the queue.
    Remove,
    /// Only report them.
    Inspect,
}

/// Find stale reservations in `queue` and apply `action`.
///
/// Returns the stale rows as they were before `action` was applied. A
/// non-positive `stale_timeout_hours` disables the check.
pub async fn handle_stale_reserved_jobs(
    queue: &dyn JobQueue,
    stale_timeout_hours: i64,
    action: StaleAction,
) -> Result<Vec<JobEntry>, QueueError> {
    if stale_timeout_hours <= 0 {
        return Ok(Vec::new());
    }

    let now = Utc::now();
    let live = queue.live_connections().await?;
    let reserved = JobFilter::status(JobStatus::Reserved);
    let stale: Vec<JobEntry> = queue
        .list_jobs(&reserved)
        .await?
        .into_iter()
        .filter(|job| (now - job.timestamp).num_hours() > stale_timeout_hours)
        .filter(|job| !live.contains(&job.connection_id))
        .collect();

    if stale.is_empty() {
        return Ok(stale);
    }

    match action {
        StaleAction::Inspect => {}
        StaleAction::Remove => {
            let ids: Vec<JobId> = stale.iter().map(JobEntry::id).collect();
            let removed = queue.delete_matching(&ids, &reserved).await?;
            info!(namespace = queue.namespace(), count = removed, "Removed stale reserved jobs");
        }
        StaleAction::Error => {
            for job in &stale {
                match queue
                    .mark_error(&job.table_name, &job.key, STALE_JOB_MESSAGE)
                    .await
                {
                    Ok(()) => debug!(
                        namespace = queue.namespace(),
                        table = %job.table_name,
                        key_hash = %job.key_hash,
                        connection_id = job.connection_id,
                        "Marked stale reserved job as error"
                    ),
                    Err(e) => warn!(
                        namespace = queue.namespace(),
                        table = %job.table_name,
                        key_hash = %job.key_hash,
                        error = %e,
                        "Failed to mark stale reserved job"
                    ),
                }
            }
        }
    }

    Ok(stale)
}
