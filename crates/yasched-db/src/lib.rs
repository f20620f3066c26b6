//! yasched-db — persistent task queue and node registry over PostgreSQL.
//!
//! Two tables, narrow typed operations, no business logic:
//!
//! - `yascheduler_tasks` — the task queue (TO_DO → RUNNING → DONE)
//! - `yascheduler_nodes` — the node registry (static and cloud-leased)
//!
//! Claiming pairs TO_DO tasks with free nodes inside one transaction
//! under `FOR UPDATE SKIP LOCKED`, so concurrent reconcilers partition
//! the queue instead of double-assigning. Transient connection errors
//! are retried with capped backoff; server-reported errors are fatal.

pub mod error;
pub mod models;
pub mod pairing;
pub mod store;

pub use error::{DbError, DbResult};
pub use models::{Node, Task, TaskMetadata, TaskStatus};
pub use pairing::FreeNode;
pub use store::TaskStore;
