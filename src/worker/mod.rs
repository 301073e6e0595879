//! Worker system: a supervised loop over populate steps.
//!
//! Core components:
//! - `step`: ProcessStep, the tagged table / callable variant
//! - `state`: Worker state machine (Idle → Running → Stopping → Stopped)
//! - `naming`: Ledger process names
//! - `registration`: Fingerprinted, idempotent worker registration
//! - `reclaim`: Stale reservation detection
//! - `cleanup`: Per-cycle queue cleanup and the shutdown purge
//! - `progress`: Job counts per registered process
//! - `runloop`: WorkerLoop, the supervisor

pub mod cleanup;
pub mod naming;
pub mod progress;
pub mod reclaim;
pub mod registration;
pub mod runloop;
pub mod state;
pub mod step;

pub use cleanup::{CleanupReport, GENERIC_ERROR_PATTERNS, clean_up_namespace, purge_invalid_jobs};
pub use naming::{PrefixStripper, to_camel_case};
pub use progress::{JobCounts, ProcessProgress, workers_progress};
pub use reclaim::{STALE_JOB_MESSAGE, StaleAction, handle_stale_reserved_jobs};
pub use runloop::WorkerLoop;
pub use state::WorkerState;
pub use step::{FnStep, ProcessStep, StepArgs, StepFailure, StepFn, StepKind};
