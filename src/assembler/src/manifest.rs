//! The sealed image manifest.
//!
//! Written last by the assembler; its presence is what marks an image as
//! assembled. The supervisor reads it at every container start.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::{BuildParameters, ComputeRuntime, GpuPolicy};
use crate::error::{AssembleError, Result};
use crate::identity::{Identity, IdentityBackend};
use crate::models::ModelCacheEntry;
use crate::runtime::RuntimeReport;
use crate::tls::TlsMaterial;

pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";
pub const DEFAULT_PLAIN_PORT: u16 = 8080;
pub const DEFAULT_SSL_PORT: u16 = 8443;

/// Everything the supervisor needs to start the application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchPlan {
    pub program: String,
    pub working_dir: Option<PathBuf>,
    pub args: Vec<String>,
    pub ssl_args: Vec<String>,
    /// Defaults; the operator's environment wins on conflict
    pub env: BTreeMap<String, String>,
    pub bind_host: String,
    pub plain_port: u16,
    pub ssl_port: u16,
    pub default_ssl_key_path: PathBuf,
    pub default_ssl_cert_path: PathBuf,
}

impl LaunchPlan {
    pub fn from_params(
        params: &BuildParameters,
        tls: &TlsMaterial,
        caches: &[ModelCacheEntry],
    ) -> Self {
        let mut env = BTreeMap::new();
        env.insert("BUILD_HASH".to_string(), params.build_identifier.clone());
        env.insert(
            "HOME".to_string(),
            params.layout.home_dir.to_string_lossy().to_string(),
        );
        for (key, value) in params.telemetry.env() {
            env.insert(key.to_string(), value.to_string());
        }
        for entry in caches {
            env.insert(
                entry.kind.cache_env_var().to_string(),
                entry.local_cache_dir.to_string_lossy().to_string(),
            );
        }
        env.insert(
            "USE_GPU".to_string(),
            params.compute.is_gpu().to_string(),
        );
        for (key, value) in &params.launch.env {
            env.insert(key.clone(), value.clone());
        }

        Self {
            program: params.launch.program.clone(),
            working_dir: params.launch.working_dir.clone(),
            args: params.launch.args.clone(),
            ssl_args: params.launch.ssl_args.clone(),
            env,
            bind_host: DEFAULT_BIND_HOST.to_string(),
            plain_port: DEFAULT_PLAIN_PORT,
            ssl_port: DEFAULT_SSL_PORT,
            default_ssl_key_path: tls.key_path.clone(),
            default_ssl_cert_path: tls.cert_path.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageManifest {
    pub build_identifier: String,
    pub assembled_at: DateTime<Utc>,
    pub identity: Identity,
    pub compute: ComputeRuntime,
    pub gpu_policy: GpuPolicy,
    pub runtime: RuntimeReport,
    pub vpn_agent: bool,
    pub tls: TlsMaterial,
    pub model_caches: Vec<ModelCacheEntry>,
    pub launch: LaunchPlan,
}

impl ImageManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AssembleError::Config(format!("Failed to read manifest {:?}: {}", path, e))
        })?;
        let manifest = serde_json::from_str(&content)?;
        Ok(manifest)
    }
}

/// Atomically write the manifest to `host_path` (temp file + rename) and hand
/// it to the manifest's identity.
///
/// The manifest is created after the ownership pass, so this is its only chown.
/// If the chown fails the seal is removed again.
pub fn seal_manifest(
    host_path: &Path,
    manifest: &ImageManifest,
    accounts: &dyn IdentityBackend,
) -> Result<()> {
    let parent = host_path
        .parent()
        .ok_or_else(|| AssembleError::Config(format!("Manifest path {:?} has no parent", host_path)))?;
    std::fs::create_dir_all(parent)?;

    let tmp_path = host_path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(manifest)?;
    {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, host_path)?;

    let identity = &manifest.identity;
    if !identity.is_root() {
        if let Err(e) = accounts.chown(host_path, identity.uid, identity.gid) {
            std::fs::remove_file(host_path)?;
            return Err(e);
        }
    }

    tracing::info!("[assembler] Image manifest sealed at {:?}", host_path);
    Ok(())
}
