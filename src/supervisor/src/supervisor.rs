use assembler::ImageManifest;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::accelerator::check_accelerator;
use crate::config::{RuntimeConfig, RuntimeDefaults};
use crate::error::{Result, SupervisorError};
use crate::launch::LaunchCommand;
use crate::listener::{resolve_listener, verify_tls_for_identity, ListenerDecision, ListenerMode};

pub const DEFAULT_DEV_ROOT: &str = "/dev";

/// Snapshot of the process environment. Variables that are not valid UTF-8 are skipped.
pub fn capture_env() -> BTreeMap<String, String> {
    std::env::vars_os()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
        .collect()
}

/// Container entrypoint. Decides the listener once and hands the process to the application.
pub struct Supervisor {
    manifest: ImageManifest,
    env: BTreeMap<String, String>,
    config: RuntimeConfig,
    dev_root: PathBuf,
}

impl Supervisor {
    /// Resolve the runtime config from `env`. The same snapshot later decides
    /// which launch defaults the operator has overridden.
    pub fn from_snapshot(manifest: ImageManifest, env: BTreeMap<String, String>) -> Result<Self> {
        let config = RuntimeConfig::from_lookup(
            |key| env.get(key).cloned(),
            &RuntimeDefaults::from(&manifest.launch),
        )?;
        Ok(Self {
            manifest,
            env,
            config,
            dev_root: PathBuf::from(DEFAULT_DEV_ROOT),
        })
    }

    pub fn with_dev_root(mut self, dev_root: impl Into<PathBuf>) -> Self {
        self.dev_root = dev_root.into();
        self
    }

    /// Load the sealed manifest and snapshot the process environment.
    pub fn from_manifest_path(path: &Path) -> Result<Self> {
        let manifest = ImageManifest::load(path)
            .map_err(|e| SupervisorError::Manifest(format!("{}: {}", path.display(), e)))?;
        Self::from_snapshot(manifest, capture_env())
    }

    pub fn manifest(&self) -> &ImageManifest {
        &self.manifest
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Every check that can fail runs here, before anything is executed.
    ///
    /// When the launch drops privileges, TLS files are checked again for the
    /// identity the application will run as.
    pub fn prepare(&self, current_uid: u32) -> Result<(ListenerDecision, LaunchCommand)> {
        check_accelerator(
            &self.manifest.compute,
            self.manifest.gpu_policy,
            &self.dev_root,
        )?;
        let decision = resolve_listener(&self.config, &self.manifest.launch.bind_host)?;
        let command = LaunchCommand::build(
            &self.manifest.launch,
            &decision,
            &self.manifest.identity,
            |key| self.env.get(key).cloned(),
            current_uid,
        );
        if let (Some((uid, gid)), Some(tls)) = (command.drop_to, decision.tls()) {
            verify_tls_for_identity(tls, uid, gid)?;
        }
        Ok((decision, command))
    }

    pub fn run(&self) -> Result<std::convert::Infallible> {
        let start = Instant::now();
        let current_uid = nix::unistd::getuid().as_raw();
        let (decision, command) = self.prepare(current_uid)?;

        announce(&decision, &self.manifest.build_identifier);
        tracing::info!(
            "[TIMING] Bootstrap decision took {:?}",
            start.elapsed()
        );

        Err(command.exec())
    }
}

fn announce(decision: &ListenerDecision, build: &str) {
    match decision.mode() {
        ListenerMode::Ssl => eprintln!(
            "Starting with SSL on {}:{} (build {})",
            decision.host(),
            decision.port(),
            build
        ),
        ListenerMode::Plain => eprintln!(
            "Starting without SSL on {}:{} (build {})",
            decision.host(),
            decision.port(),
            build
        ),
    }
    tracing::info!(
        "[supervisor] Listener mode={} port={}",
        decision.mode(),
        decision.port()
    );
}
