//! dj-worker: supervised worker loop over an external populate job queue.

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod notify;
pub mod queue;
pub mod store;
pub mod worker;
