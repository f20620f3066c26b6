//! yasched-cloud — cloud adapters and the node-fleet coordinator.
//!
//! A `CloudAdapter` is a thin driver over one provider's REST API
//! (create / delete / list). `CloudProvider` wraps an adapter with the
//! provider-scoped settings, an operation semaphore, SSH-readiness
//! waiting with create-timeout teardown, and cool-off shunning after
//! API errors. The `CloudCoordinator` owns the fleet: it scales up to
//! satisfy pending work and scales down nodes that stay idle past their
//! provider's tolerance.

pub mod adapter;
pub mod coordinator;
pub mod error;
pub mod hetzner;
pub mod provider;
pub mod upcloud;

pub use adapter::{CloudAdapter, CloudInit, CreateContext};
pub use coordinator::CloudCoordinator;
pub use error::{CloudError, CloudResult};
pub use provider::CloudProvider;
