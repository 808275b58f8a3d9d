use std::os::unix::fs::PermissionsExt;

use crate::config::VpnAgent;
use crate::error::{AssembleError, Result};
use crate::layout::ImageLayout;

/// Check that a requested VPN agent actually made it into the image.
///
/// Returns whether an agent is present, for the manifest.
pub fn verify_vpn_agent(layout: &ImageLayout, agent: &VpnAgent) -> Result<bool> {
    match agent {
        VpnAgent::Absent => {
            tracing::info!("[assembler] No VPN agent requested");
            Ok(false)
        }
        VpnAgent::Present { binary } => {
            let host_binary = layout.host_path(binary);
            let metadata = std::fs::metadata(&host_binary).map_err(|e| {
                AssembleError::VpnAgent(format!("Agent binary {:?} not found: {}", binary, e))
            })?;
            if !metadata.is_file() || metadata.permissions().mode() & 0o111 == 0 {
                return Err(AssembleError::VpnAgent(format!(
                    "Agent binary {:?} is not an executable file",
                    binary
                )));
            }
            tracing::info!("[assembler] VPN agent present at {:?}", binary);
            Ok(true)
        }
    }
}
