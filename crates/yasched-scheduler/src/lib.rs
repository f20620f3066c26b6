//! yasched-scheduler — the central reconciler.
//!
//! One tick: harvest finished tasks (download outputs, mark DONE, fire
//! webhooks), then assign ready tasks to free nodes (deploy engine,
//! upload inputs, spawn detached). Startup additionally recovers
//! RUNNING rows left over from the previous process. Webhooks drain in
//! their own worker under the configured concurrency limit.
//!
//! The reconciler never dies on a single operation's failure: transient
//! errors log and retry next tick; permanent node failures disable the
//! node and, for cloud nodes, request deallocation.

pub mod scheduler;
pub mod submit;
pub mod webhook;

pub use scheduler::Scheduler;
pub use submit::{submit_task, SubmitError};
pub use webhook::{webhook_channel, WebhookNotice, WebhookQueue, WebhookWorker};
