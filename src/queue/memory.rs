//! In-memory job queue.
//!
//! Holds queue rows and the set of live session ids behind a `RwLock`.
//! Useful for tests and for embedding the worker without a database.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::QueueError;
use crate::fingerprint::key_hash;
use crate::queue::{JobEntry, JobFilter, JobId, JobKey, JobQueue, JobStatus};

#[derive(Default)]
struct QueueState {
    jobs: Vec<JobEntry>,
    live: HashSet<u64>,
}

/// Job queue kept entirely in memory.
pub struct MemoryJobQueue {
    namespace: String,
    state: RwLock<QueueState>,
}

impl MemoryJobQueue {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            state: RwLock::new(QueueState::default()),
        }
    }

    /// Insert a row, replacing any existing row with the same identity.
    pub async fn insert(&self, entry: JobEntry) {
        let mut state = self.state.write().await;
        let id = entry.id();
        state.jobs.retain(|j| j.id() != id);
        state.jobs.push(entry);
    }

    /// Reserve `key` for `table_name` on behalf of session `connection_id`.
    pub async fn reserve(
        &self,
        table_name: &str,
        key: JobKey,
        connection_id: u64,
        at: DateTime<Utc>,
    ) -> JobId {
        let entry = JobEntry {
            table_name: table_name.to_string(),
            key_hash: key_hash(&key),
            key,
            status: JobStatus::Reserved,
            error_message: String::new(),
            error_stack: None,
            timestamp: at,
            connection_id,
            host: String::new(),
            user: String::new(),
            pid: 0,
        };
        let id = entry.id();
        self.insert(entry).await;
        id
    }

    /// Record a failed job directly.
    pub async fn push_error(&self, table_name: &str, key: JobKey, message: &str) -> JobId {
        let entry = JobEntry {
            table_name: table_name.to_string(),
            key_hash: key_hash(&key),
            key,
            status: JobStatus::Error,
            error_message: message.to_string(),
            error_stack: None,
            timestamp: Utc::now(),
            connection_id: 0,
            host: String::new(),
            user: String::new(),
            pid: 0,
        };
        let id = entry.id();
        self.insert(entry).await;
        id
    }

    /// Replace the set of live session ids.
    pub async fn set_live_connections(&self, ids: impl IntoIterator<Item = u64>) {
        self.state.write().await.live = ids.into_iter().collect();
    }

    /// Look up one row.
    pub async fn get(&self, id: &JobId) -> Option<JobEntry> {
        self.state
            .read()
            .await
            .jobs
            .iter()
            .find(|j| j.id() == *id)
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobEntry>, QueueError> {
        Ok(self
            .state
            .read()
            .await
            .jobs
            .iter()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect())
    }

    async fn delete_jobs(&self, ids: &[JobId]) -> Result<usize, QueueError> {
        let mut state = self.state.write().await;
        let before = state.jobs.len();
        state.jobs.retain(|j| !ids.contains(&j.id()));
        Ok(before - state.jobs.len())
    }

    async fn delete_matching(
        &self,
        ids: &[JobId],
        filter: &JobFilter,
    ) -> Result<usize, QueueError> {
        let mut state = self.state.write().await;
        let before = state.jobs.len();
        state
            .jobs
            .retain(|j| !(ids.contains(&j.id()) && filter.matches(j)));
        Ok(before - state.jobs.len())
    }

    async fn mark_error(
        &self,
        table_name: &str,
        key: &JobKey,
        message: &str,
    ) -> Result<(), QueueError> {
        let hash = key_hash(key);
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .iter_mut()
            .find(|j| j.table_name == table_name && j.key_hash == hash)
            .ok_or_else(|| QueueError::NotFound {
                namespace: self.namespace.clone(),
                table_name: table_name.to_string(),
                key_hash: hash.clone(),
            })?;
        job.status = JobStatus::Error;
        job.error_message = message.to_string();
        job.timestamp = Utc::now();
        Ok(())
    }

    async fn live_connections(&self) -> Result<HashSet<u64>, QueueError> {
        Ok(self.state.read().await.live.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(n: i64) -> JobKey {
        json!({"session": n}).as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn reserve_then_mark_error() {
        let q = MemoryJobQueue::new("lab_ephys");
        let id = q.reserve("__clustering", key(1), 7, Utc::now()).await;

        q.mark_error("__clustering", &key(1), "boom").await.unwrap();

        let job = q.get(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error_message, "boom");
    }

    #[tokio::test]
    async fn mark_error_on_missing_job_fails() {
        let q = MemoryJobQueue::new("lab_ephys");
        let err = q.mark_error("__clustering", &key(1), "boom").await;
        assert!(matches!(err, Err(QueueError::NotFound { .. })));
    }

    #[tokio::test]
    async fn delete_removes_only_listed_rows() {
        let q = MemoryJobQueue::new("lab_ephys");
        let a = q.push_error("__clustering", key(1), "x").await;
        q.push_error("__clustering", key(2), "y").await;

        let removed = q.delete_jobs(&[a.clone()]).await.unwrap();
        assert_eq!(removed, 1);
        assert!(q.get(&a).await.is_none());
        assert_eq!(q.len().await, 1);
    }

    #[tokio::test]
    async fn delete_matching_skips_rows_that_changed() {
        let q = MemoryJobQueue::new("lab_ephys");
        let a = q.push_error("__clustering", key(1), "Deadlock found").await;
        let b = q.push_error("__clustering", key(2), "Deadlock found").await;
        q.reserve("__clustering", key(2), 77, Utc::now()).await;

        let filter = JobFilter::status(JobStatus::Error).with_error_like(["%Deadlock%"]);
        let removed = q.delete_matching(&[a.clone(), b.clone()], &filter).await.unwrap();

        assert_eq!(removed, 1);
        assert!(q.get(&a).await.is_none());
        assert_eq!(q.get(&b).await.unwrap().status, JobStatus::Reserved);
    }

    #[tokio::test]
    async fn same_key_replaces_row() {
        let q = MemoryJobQueue::new("lab_ephys");
        q.reserve("__clustering", key(1), 7, Utc::now()).await;
        q.push_error("__clustering", key(1), "x").await;
        assert_eq!(q.len().await, 1);
    }

    #[tokio::test]
    async fn live_connections_roundtrip() {
        let q = MemoryJobQueue::new("lab_ephys");
        q.set_live_connections([3, 4]).await;
        let live = q.live_connections().await.unwrap();
        assert!(live.contains(&3) && live.contains(&4));
    }
}
