use assembler::{ComputeRuntime, GpuPolicy};
use std::path::Path;

use crate::error::{Result, SupervisorError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceleratorStatus {
    /// CPU image, nothing to check
    NotRequested,
    Visible(String),
    /// GPU image without a device, tolerated by [`GpuPolicy::Warn`]
    Missing,
}

/// Device nodes that indicate the variant's accelerator is passed through.
fn device_nodes(variant: &str) -> &'static [&'static str] {
    if variant.to_lowercase().starts_with("rocm") {
        &["kfd"]
    } else {
        &["nvidiactl", "nvidia0"]
    }
}

/// Check GPU visibility for GPU images, applying the image's policy.
pub fn check_accelerator(
    compute: &ComputeRuntime,
    policy: GpuPolicy,
    dev_root: &Path,
) -> Result<AcceleratorStatus> {
    let variant = match compute {
        ComputeRuntime::Cpu => return Ok(AcceleratorStatus::NotRequested),
        ComputeRuntime::Gpu { variant } => variant,
    };

    let nodes = device_nodes(variant);
    if let Some(node) = nodes.iter().find(|n| dev_root.join(n).exists()) {
        tracing::info!("[supervisor] GPU device {} visible ({})", node, variant);
        return Ok(AcceleratorStatus::Visible(node.to_string()));
    }

    let message = format!(
        "GPU image ({}) but none of {:?} exist under {}",
        variant,
        nodes,
        dev_root.display()
    );
    match policy {
        GpuPolicy::Require => Err(SupervisorError::AcceleratorUnavailable(message)),
        GpuPolicy::Warn => {
            tracing::warn!("[supervisor] {}; inference will run on CPU", message);
            eprintln!("  WARNING: {}; inference will run on CPU", message);
            Ok(AcceleratorStatus::Missing)
        }
    }
}
