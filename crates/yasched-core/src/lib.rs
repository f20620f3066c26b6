//! yasched-core — configuration model and engine declarations.
//!
//! Everything the rest of the workspace agrees on lives here:
//!
//! - Typed configuration loaded from the INI file (`[db]`, `[local]`,
//!   `[remote]`, `[clouds]`, `[engine.<name>]` sections)
//! - `Engine` declarations with closed deployment-source and
//!   liveness-check variants, validated at parse time
//! - Strict spawn-template rendering (`{task_path}`, `{engine_path}`,
//!   `{ncpus}`)
//! - `Gate`, the bounded admission primitive behind every per-process
//!   rate limit

pub mod config;
pub mod engine;
pub mod error;
pub mod gate;

pub use config::{CloudConfig, CloudCredentials, Config, DbConfig, LocalConfig, RemoteConfig};
pub use engine::{DeploySource, Engine, EngineRepository, ProcessCheck};
pub use error::{ConfigError, ConfigResult};
pub use gate::{Gate, GatePass};
