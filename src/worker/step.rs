//! Process steps: what a worker runs each cycle.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::queue::{JobKey, QueryableJob};
use crate::worker::naming::PrefixStripper;

/// Keyword arguments a step is invoked with.
pub type StepArgs = Map<String, Value>;

/// Typed failure of a callable step.
///
/// `key` identifies the input that failed, when the step knows it.
#[derive(Debug, Clone, PartialEq)]
pub struct StepFailure {
    pub kind: String,
    pub message: String,
    pub key: Option<JobKey>,
    pub stack: Option<String>,
}

impl StepFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            key: None,
            stack: None,
        }
    }

    pub fn with_key(mut self, key: JobKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// `"Kind: message"`, or just `"Kind"` when there is no message.
    pub fn error_message(&self) -> String {
        if self.message.is_empty() {
            self.kind.clone()
        } else {
            format!("{}: {}", self.kind, self.message)
        }
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error_message())
    }
}

impl std::error::Error for StepFailure {}

impl From<anyhow::Error> for StepFailure {
    fn from(err: anyhow::Error) -> Self {
        Self {
            kind: "Error".to_string(),
            message: err.to_string(),
            key: None,
            stack: Some(format!("{err:?}")),
        }
    }
}

/// A named async callable run as a worker step.
#[async_trait]
pub trait StepFn: Send + Sync {
    fn name(&self) -> &str;

    async fn call(&self, args: &StepArgs) -> Result<(), StepFailure>;
}

/// [`StepFn`] over a closure returning a future.
pub struct FnStep<F> {
    name: String,
    f: F,
}

impl<F, Fut> FnStep<F>
where
    F: Fn(StepArgs) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), StepFailure>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> StepFn for FnStep<F>
where
    F: Fn(StepArgs) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), StepFailure>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, args: &StepArgs) -> Result<(), StepFailure> {
        (self.f)(args.clone()).await
    }
}

/// What a step runs.
#[derive(Clone)]
pub enum StepKind {
    /// Incremental populate of a table bound to a job queue.
    Queryable(Arc<dyn QueryableJob>),
    /// Any other unit of work.
    Callable(Arc<dyn StepFn>),
}

impl std::fmt::Debug for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queryable(job) => write!(f, "Queryable({})", job.full_table_name()),
            Self::Callable(step) => write!(f, "Callable({})", step.name()),
        }
    }
}

impl From<Arc<dyn QueryableJob>> for StepKind {
    fn from(job: Arc<dyn QueryableJob>) -> Self {
        Self::Queryable(job)
    }
}

impl From<Arc<dyn StepFn>> for StepKind {
    fn from(step: Arc<dyn StepFn>) -> Self {
        Self::Callable(step)
    }
}

/// One step of a worker, in execution order.
#[derive(Debug, Clone)]
pub struct ProcessStep {
    pub kind: StepKind,
    pub invocation_args: StepArgs,
    pub position: usize,
}

impl ProcessStep {
    /// Name recorded in the ledger for this step.
    pub fn process_name(&self, stripper: &PrefixStripper) -> String {
        match &self.kind {
            StepKind::Queryable(job) => stripper
                .process_name_for(job.full_table_name())
                .unwrap_or_else(|| {
                    stripper.process_name(job.schema_name().unwrap_or_default(), job.table_name())
                }),
            StepKind::Callable(step) => step.name().to_string(),
        }
    }

    pub fn full_table_name(&self) -> &str {
        match &self.kind {
            StepKind::Queryable(job) => job.full_table_name(),
            StepKind::Callable(_) => "",
        }
    }

    pub fn as_queryable(&self) -> Option<&Arc<dyn QueryableJob>> {
        match &self.kind {
            StepKind::Queryable(job) => Some(job),
            StepKind::Callable(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_message_with_and_without_text() {
        assert_eq!(
            StepFailure::new("ValueError", "boom").error_message(),
            "ValueError: boom"
        );
        assert_eq!(StepFailure::new("KeyboardInterrupt", "").error_message(), "KeyboardInterrupt");
    }

    #[test]
    fn from_anyhow_keeps_chain_as_stack() {
        let err = anyhow::anyhow!("disk full").context("writing results");
        let failure = StepFailure::from(err);
        assert_eq!(failure.kind, "Error");
        assert_eq!(failure.message, "writing results");
        assert!(failure.stack.unwrap().contains("disk full"));
    }

    #[tokio::test]
    async fn fn_step_passes_args() {
        let step = FnStep::new("export_results", |args: StepArgs| async move {
            match args.get("fail") {
                Some(Value::Bool(true)) => Err(StepFailure::new("ValueError", "asked to fail")),
                _ => Ok(()),
            }
        });

        assert_eq!(step.name(), "export_results");
        let ok = json!({"fail": false}).as_object().cloned().unwrap();
        assert!(step.call(&ok).await.is_ok());
        let fail = json!({"fail": true}).as_object().cloned().unwrap();
        assert_eq!(
            step.call(&fail).await.unwrap_err().error_message(),
            "ValueError: asked to fail"
        );
    }

    #[test]
    fn callable_process_name_is_step_name() {
        let step: Arc<dyn StepFn> = Arc::new(FnStep::new("sync_archive", |_args: StepArgs| async {
            Ok(())
        }));
        let process = ProcessStep {
            kind: StepKind::Callable(step),
            invocation_args: StepArgs::new(),
            position: 0,
        };
        let stripper = PrefixStripper::new(&[String::new()]).unwrap();
        assert_eq!(process.process_name(&stripper), "sync_archive");
        assert_eq!(process.full_table_name(), "");
    }
}
