//! Inference runtime installation and post-install verification.
use serde::{Deserialize, Serialize};
use std::process::Command;

use crate::config::{ComputeRuntime, GpuPolicy, InstallerCommands, PLACEHOLDER_VARIANT};
use crate::error::{AssembleError, Result};

/// What the installed runtime says about itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeReport {
    /// Runtime was built with accelerator support (CUDA/ROCm)
    pub accelerator_build: bool,
    /// An accelerator device was visible when probed
    pub device_visible: bool,
    #[serde(default)]
    pub version: String,
}

/// Installs the inference runtime into the image.
pub trait RuntimeInstaller {
    fn install_cpu(&self) -> Result<()>;

    fn install_gpu(&self, variant: &str) -> Result<()>;

    /// Interrogate whatever got installed.
    fn probe(&self) -> Result<RuntimeReport>;
}

/// Installer driven by configured command templates.
pub struct CommandInstaller {
    commands: InstallerCommands,
}

impl CommandInstaller {
    pub fn new(commands: InstallerCommands) -> Self {
        Self { commands }
    }

    fn run(&self, argv: &[String]) -> Result<String> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| AssembleError::Install("Empty installer command".to_string()))?;

        tracing::info!("[assembler] Running {} {}", program, args.join(" "));
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| AssembleError::Install(format!("Failed to run {}: {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let last_line = stderr.lines().last().unwrap_or("No output available");
            return Err(AssembleError::Install(format!(
                "{} failed ({}): {}",
                program, output.status, last_line
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl RuntimeInstaller for CommandInstaller {
    fn install_cpu(&self) -> Result<()> {
        self.run(&self.commands.cpu).map(|_| ())
    }

    fn install_gpu(&self, variant: &str) -> Result<()> {
        let argv: Vec<String> = self
            .commands
            .gpu
            .iter()
            .map(|a| a.replace(PLACEHOLDER_VARIANT, variant))
            .collect();
        self.run(&argv).map(|_| ())
    }

    fn probe(&self) -> Result<RuntimeReport> {
        let stdout = self.run(&self.commands.probe)?;
        // Last non-empty line carries the report; loaders may log before it
        let line = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| AssembleError::Install("Runtime probe printed nothing".to_string()))?;
        serde_json::from_str(line.trim()).map_err(|e| {
            AssembleError::Install(format!("Malformed runtime probe output '{}': {}", line, e))
        })
    }
}

/// Install exactly one runtime flavour and verify the result matches the request.
///
/// A GPU request that ends up with a CPU-only build is always fatal; a GPU
/// build that sees no device is fatal only under [`GpuPolicy::Require`].
pub fn install_runtime(
    installer: &dyn RuntimeInstaller,
    compute: &ComputeRuntime,
    policy: GpuPolicy,
) -> Result<RuntimeReport> {
    match compute {
        ComputeRuntime::Cpu => installer.install_cpu()?,
        ComputeRuntime::Gpu { variant } => installer.install_gpu(variant)?,
    }

    let report = installer.probe()?;
    verify_runtime(compute, policy, &report)?;
    Ok(report)
}

fn verify_runtime(
    compute: &ComputeRuntime,
    policy: GpuPolicy,
    report: &RuntimeReport,
) -> Result<()> {
    match compute {
        ComputeRuntime::Cpu => {
            if report.accelerator_build {
                return Err(AssembleError::RuntimeMismatch {
                    requested: compute.to_string(),
                    reported: format!("accelerator build {}", report.version),
                });
            }
            tracing::info!("[assembler] CPU runtime installed ({})", report.version);
        }
        ComputeRuntime::Gpu { variant } => {
            if !report.accelerator_build {
                return Err(AssembleError::RuntimeMismatch {
                    requested: compute.to_string(),
                    reported: format!("CPU-only build {}", report.version),
                });
            }
            if !report.device_visible {
                match policy {
                    GpuPolicy::Require => {
                        return Err(AssembleError::AcceleratorUnavailable(format!(
                            "runtime {} ({}) installed but no GPU device is visible",
                            report.version, variant
                        )));
                    }
                    GpuPolicy::Warn => {
                        tracing::warn!(
                            "[assembler] GPU runtime {} ({}) installed but no device visible at build time",
                            report.version,
                            variant
                        );
                    }
                }
            } else {
                tracing::info!(
                    "[assembler] GPU runtime installed ({}, {}), device visible",
                    report.version,
                    variant
                );
            }
        }
    }
    Ok(())
}
