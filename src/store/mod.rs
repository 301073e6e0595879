//! Persistence layer: libSQL-backed ledger for registrations, activity and errors.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlLedger;
pub use traits::{
    ActivityRecord, ErrorRecord, LedgerStore, Origin, RecentActivity, RegisteredProcess,
    RegisteredWorker, Registration,
};
