//! Image assembler
//!
//! Build-time half of the service bootstrap. Resolves [`BuildParameters`] into
//! a provisioned image: optional non-root identity, exactly one inference
//! runtime, self-signed TLS material, warmed and verified model caches and a
//! startup script, then seals the result with an [`ImageManifest`] that the
//! run-time supervisor reads.

pub mod config;
pub mod error;
pub mod identity;
pub mod layout;
pub mod manifest;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod runtime;
pub mod script;
pub mod tls;
pub mod vpn;

pub use config::{
    BuildParameters, ComputeRuntime, GpuPolicy, LaunchTemplate, ModelSelection, TelemetryPolicy,
    VpnAgent,
};
pub use error::{AssembleError, Result};
pub use identity::{assign_ownership, resolve_identity, Identity, IdentityBackend, SystemAccounts};
pub use layout::ImageLayout;
pub use manifest::{seal_manifest, ImageManifest, LaunchPlan};
pub use models::{
    plan_cache_entries, warm_and_verify_cache, CommandProbe, ModelCacheEntry, ModelKind,
    ModelProbe,
};
pub use pipeline::{AssemblyStep, ImageAssembler};
pub use progress::{AssemblyProgress, LogProgressReporter, ProgressReporter};
pub use runtime::{install_runtime, CommandInstaller, RuntimeInstaller, RuntimeReport};
pub use script::emit_startup_script;
pub use tls::{provision_tls, KeyAlgorithm, TlsMaterial, TlsSpec};
pub use vpn::verify_vpn_agent;
