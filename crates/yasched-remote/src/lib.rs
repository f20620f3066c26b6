//! yasched-remote — SSH remote machine driver.
//!
//! One logical SSH session per node, pooled and rate-limited:
//!
//! - `RemoteMachine` — exec, detached spawn, platform/cpu probes,
//!   process-liveness checks, package install, SFTP transfers with
//!   per-file retry and partial-failure reporting
//! - `MachinePool` — per-ip session cache behind the global connect
//!   gate, per-node operation mutex, idle metadata for scale-down
//! - `KeyStore` — the process-wide `yakey*` keypair (mode 0600)
//! - `deploy` — idempotent engine deployment onto a node
//!
//! Paths are flavor-aware: POSIX nodes get forward slashes, Windows
//! nodes backslashes; absolute configured paths are used verbatim,
//! relative ones resolve under the remote user's home.

pub mod deploy;
pub mod error;
pub mod keys;
pub mod machine;
pub mod platform;
pub mod pool;

pub use error::{RemoteError, RemoteResult};
pub use keys::KeyStore;
pub use machine::{ExecResult, RemoteMachine, TransferReport};
pub use platform::{PathFlavor, PlatformInfo};
pub use pool::MachinePool;
