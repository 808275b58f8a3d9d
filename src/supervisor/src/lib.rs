//! Bootstrap supervisor
//!
//! Run-time half of the service bootstrap. Reads the sealed image manifest and
//! the container environment once, picks a plain or TLS listener, then execs
//! the application in its place.

pub mod accelerator;
pub mod config;
pub mod error;
pub mod health;
pub mod launch;
pub mod listener;
pub mod supervisor;

pub use accelerator::{check_accelerator, AcceleratorStatus};
pub use config::{RuntimeConfig, RuntimeDefaults};
pub use error::{Result, SupervisorError};
pub use health::{health_url, probe_readiness, Readiness};
pub use launch::LaunchCommand;
pub use listener::{
    resolve_listener, select_mode, verify_tls_for_identity, ListenerDecision, ListenerMode,
    VerifiedTls,
};
pub use supervisor::{capture_env, Supervisor};
