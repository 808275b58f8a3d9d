use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::layout::ImageLayout;

pub const STARTUP_SCRIPT_MODE: u32 = 0o755;

/// Render the container entrypoint.
///
/// All conditional installation already happened at build time; the plain/TLS
/// choice belongs to the supervisor, so the script only hands over to it.
pub fn render_startup_script(supervisor_binary: &Path, manifest_path: &Path) -> String {
    format!(
        "#!/bin/sh\n\
         # Generated by image-assembler. Listener selection happens in the supervisor.\n\
         exec {} --manifest {} \"$@\"\n",
        shell_quote(&supervisor_binary.to_string_lossy()),
        shell_quote(&manifest_path.to_string_lossy()),
    )
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Write the entrypoint script into the image and make it executable.
pub fn emit_startup_script(layout: &ImageLayout, supervisor_binary: &Path) -> Result<PathBuf> {
    let script_path = layout.startup_script_path();
    let host_path = layout.host_path(&script_path);
    if let Some(parent) = host_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let script = render_startup_script(supervisor_binary, &layout.manifest_path());
    std::fs::write(&host_path, script)?;
    std::fs::set_permissions(&host_path, std::fs::Permissions::from_mode(STARTUP_SCRIPT_MODE))?;

    tracing::info!("[assembler] Startup script written to {:?}", script_path);
    Ok(script_path)
}
