//! Ordered image assembly.
//!
//! Steps run strictly in sequence; later steps depend on the filesystem state
//! earlier ones leave behind. Fail-fast: the first failing step aborts the
//! build and the manifest is never sealed.
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::config::BuildParameters;
use crate::error::{AssembleError, Result};
use crate::identity::{assign_ownership, resolve_identity, IdentityBackend};
use crate::manifest::{seal_manifest, ImageManifest, LaunchPlan};
use crate::models::{plan_cache_entries, warm_and_verify_cache, ModelProbe};
use crate::progress::{LogProgressReporter, ProgressReporter};
use crate::runtime::{install_runtime, RuntimeInstaller};
use crate::script::emit_startup_script;
use crate::tls::provision_tls;
use crate::vpn::verify_vpn_agent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssemblyStep {
    Validate,
    ResolveIdentity,
    InstallRuntime,
    VerifyVpnAgent,
    ProvisionTls,
    WarmModelCaches,
    EmitStartupScript,
    AssignOwnership,
    SealManifest,
}

impl AssemblyStep {
    pub const ALL: [AssemblyStep; 9] = [
        AssemblyStep::Validate,
        AssemblyStep::ResolveIdentity,
        AssemblyStep::InstallRuntime,
        AssemblyStep::VerifyVpnAgent,
        AssemblyStep::ProvisionTls,
        AssemblyStep::WarmModelCaches,
        AssemblyStep::EmitStartupScript,
        AssemblyStep::AssignOwnership,
        AssemblyStep::SealManifest,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            AssemblyStep::Validate => "validate",
            AssemblyStep::ResolveIdentity => "resolve-identity",
            AssemblyStep::InstallRuntime => "install-runtime",
            AssemblyStep::VerifyVpnAgent => "verify-vpn-agent",
            AssemblyStep::ProvisionTls => "provision-tls",
            AssemblyStep::WarmModelCaches => "warm-model-caches",
            AssemblyStep::EmitStartupScript => "emit-startup-script",
            AssemblyStep::AssignOwnership => "assign-ownership",
            AssemblyStep::SealManifest => "seal-manifest",
        }
    }

    fn position(&self) -> usize {
        Self::ALL.iter().position(|s| s == self).unwrap_or(0)
    }
}

impl std::fmt::Display for AssemblyStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

pub struct ImageAssembler<'a> {
    params: &'a BuildParameters,
    accounts: &'a dyn IdentityBackend,
    installer: &'a dyn RuntimeInstaller,
    probe: &'a dyn ModelProbe,
    reporter: &'a dyn ProgressReporter,
}

impl<'a> ImageAssembler<'a> {
    pub fn new(
        params: &'a BuildParameters,
        accounts: &'a dyn IdentityBackend,
        installer: &'a dyn RuntimeInstaller,
        probe: &'a dyn ModelProbe,
    ) -> Self {
        Self {
            params,
            accounts,
            installer,
            probe,
            reporter: &LogProgressReporter,
        }
    }

    pub fn with_reporter(mut self, reporter: &'a dyn ProgressReporter) -> Self {
        self.reporter = reporter;
        self
    }

    fn run_step<T>(&self, step: AssemblyStep, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let total = AssemblyStep::ALL.len() as u32;
        let index = step.position() as u32;
        self.reporter
            .emit_step(index * 100 / total, format!("Executing {}", step), step);

        let step_start = Instant::now();
        match f() {
            Ok(value) => {
                tracing::info!(
                    "[TIMING] Step {} completed in {}ms",
                    step,
                    step_start.elapsed().as_millis()
                );
                self.reporter
                    .emit_step((index + 1) * 100 / total, format!("Completed {}", step), step);
                Ok(value)
            }
            Err(e) => {
                tracing::error!(
                    "[assembler] Step '{}' failed after {}ms: {}",
                    step,
                    step_start.elapsed().as_millis(),
                    e
                );
                Err(AssembleError::Step {
                    step,
                    source: Box::new(e),
                })
            }
        }
    }

    /// Run every step and seal the manifest. Nothing is published on failure.
    pub fn assemble(&self) -> Result<ImageManifest> {
        let params = self.params;
        let layout = &params.layout;
        let manifest_host_path = layout.host_path(&layout.manifest_path());

        self.run_step(AssemblyStep::Validate, || {
            params.validate()?;
            // A stale seal from an earlier build must not survive a failed one
            if manifest_host_path.exists() {
                std::fs::remove_file(&manifest_host_path)?;
            }
            Ok(())
        })?;

        let identity = self.run_step(AssemblyStep::ResolveIdentity, || {
            resolve_identity(
                self.accounts,
                params.uid,
                params.gid,
                &params.user_name,
                &params.group_name,
                &layout.home_dir,
            )
        })?;

        let runtime = self.run_step(AssemblyStep::InstallRuntime, || {
            install_runtime(self.installer, &params.compute, params.gpu_policy)
        })?;

        let vpn_agent = self.run_step(AssemblyStep::VerifyVpnAgent, || {
            verify_vpn_agent(layout, &params.vpn_agent)
        })?;

        let tls = self.run_step(AssemblyStep::ProvisionTls, || {
            provision_tls(layout, &params.tls)
        })?;

        let model_caches = self.run_step(AssemblyStep::WarmModelCaches, || {
            plan_cache_entries(&params.models, layout)
                .iter()
                .map(|entry| warm_and_verify_cache(self.probe, layout, entry))
                .collect::<Result<Vec<_>>>()
        })?;

        self.run_step(AssemblyStep::EmitStartupScript, || {
            emit_startup_script(layout, &params.supervisor_binary)
        })?;

        self.run_step(AssemblyStep::AssignOwnership, || {
            for dir in [&layout.app_dir, &layout.data_dir, &layout.home_cache_dir()] {
                std::fs::create_dir_all(layout.host_path(dir))?;
            }
            let host_paths: Vec<_> = layout
                .owned_paths()
                .iter()
                .map(|p| layout.host_path(p))
                .collect();
            assign_ownership(self.accounts, &identity, &host_paths)
        })?;

        let manifest = ImageManifest {
            build_identifier: params.build_identifier.clone(),
            assembled_at: chrono::Utc::now(),
            launch: LaunchPlan::from_params(params, &tls, &model_caches),
            identity,
            compute: params.compute.clone(),
            gpu_policy: params.gpu_policy,
            runtime,
            vpn_agent,
            tls,
            model_caches,
        };

        self.run_step(AssemblyStep::SealManifest, || {
            seal_manifest(&manifest_host_path, &manifest, self.accounts)
        })?;

        Ok(manifest)
    }
}
