//! Integration tests for the ordered image assembly pipeline
//!
//! Accounts, runtime installer and model loaders are replaced by recording
//! fakes; the filesystem work happens under a scratch root.

use assembler::progress::RecordingProgressReporter;
use assembler::{
    AssembleError, AssemblyStep, BuildParameters, ComputeRuntime, GpuPolicy, IdentityBackend,
    ImageAssembler, ImageLayout, ImageManifest, KeyAlgorithm, ModelCacheEntry, ModelKind,
    ModelProbe, RuntimeInstaller, RuntimeReport, VpnAgent,
};
use std::cell::RefCell;
use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    GroupCreated(String, u32),
    UserCreated(String, u32, u32, PathBuf),
    Chown(PathBuf, u32, u32),
}

#[derive(Default)]
struct FakeAccounts {
    existing_gids: Vec<u32>,
    fail_user_creation: bool,
    fail_chown_of: Option<&'static str>,
    events: RefCell<Vec<Event>>,
}

impl IdentityBackend for FakeAccounts {
    fn group_exists(&self, gid: u32) -> assembler::Result<bool> {
        Ok(self.existing_gids.contains(&gid))
    }

    fn create_group(&self, name: &str, gid: u32) -> assembler::Result<()> {
        self.events
            .borrow_mut()
            .push(Event::GroupCreated(name.to_string(), gid));
        Ok(())
    }

    fn create_user(&self, name: &str, uid: u32, gid: u32, home: &Path) -> assembler::Result<()> {
        if self.fail_user_creation {
            return Err(AssembleError::Identity("useradd failed (exit 4): uid in use".to_string()));
        }
        self.events.borrow_mut().push(Event::UserCreated(
            name.to_string(),
            uid,
            gid,
            home.to_path_buf(),
        ));
        Ok(())
    }

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> assembler::Result<()> {
        if let Some(name) = self.fail_chown_of {
            if path.ends_with(name) {
                return Err(AssembleError::Ownership(format!("Failed to chown {:?}", path)));
            }
        }
        self.events
            .borrow_mut()
            .push(Event::Chown(path.to_path_buf(), uid, gid));
        Ok(())
    }
}

impl FakeAccounts {
    fn chowned(&self) -> Vec<PathBuf> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                Event::Chown(p, _, _) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    fn created(&self) -> Vec<Event> {
        self.events
            .borrow()
            .iter()
            .filter(|e| !matches!(e, Event::Chown(..)))
            .cloned()
            .collect()
    }
}

struct FakeInstaller {
    report: RuntimeReport,
}

impl FakeInstaller {
    fn cpu() -> Self {
        Self {
            report: RuntimeReport {
                accelerator_build: false,
                device_visible: false,
                version: "2.3.0+cpu".to_string(),
            },
        }
    }
}

impl RuntimeInstaller for FakeInstaller {
    fn install_cpu(&self) -> assembler::Result<()> {
        Ok(())
    }

    fn install_gpu(&self, _variant: &str) -> assembler::Result<()> {
        Ok(())
    }

    fn probe(&self) -> assembler::Result<RuntimeReport> {
        Ok(self.report.clone())
    }
}

/// Writes a file into each cache dir, failing for one kind if asked to.
#[derive(Default)]
struct FakeProbe {
    fail_kind: Option<ModelKind>,
}

impl ModelProbe for FakeProbe {
    fn load_and_discard(&self, entry: &ModelCacheEntry, host_cache_dir: &Path) -> Result<(), String> {
        if self.fail_kind == Some(entry.kind) {
            return Err(format!("could not resolve '{}'", entry.source_identifier));
        }
        std::fs::write(host_cache_dir.join("model.bin"), b"weights").map_err(|e| e.to_string())
    }
}

fn test_params(root: &Path) -> BuildParameters {
    let mut params = BuildParameters::default();
    params.layout = ImageLayout::default().with_root(root);
    params.tls.key_algorithm = KeyAlgorithm::EcdsaP256;
    params.build_identifier = "test-build".to_string();
    params
}

fn walk(path: &Path, out: &mut Vec<PathBuf>) {
    out.push(path.to_path_buf());
    if path.is_dir() {
        for entry in std::fs::read_dir(path).unwrap() {
            walk(&entry.unwrap().path(), out);
        }
    }
}

fn manifest_host_path(params: &BuildParameters) -> PathBuf {
    params.layout.host_path(&params.layout.manifest_path())
}

#[test]
fn test_root_identity_creates_nothing_and_keeps_ownership() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let params = test_params(temp_dir.path());
    let accounts = FakeAccounts::default();

    let manifest = ImageAssembler::new(&params, &accounts, &FakeInstaller::cpu(), &FakeProbe::default())
        .assemble()
        .unwrap();

    assert!(accounts.events.borrow().is_empty());
    assert_eq!(manifest.identity.uid, 0);
    assert_eq!(manifest.identity.gid, 0);
    assert!(manifest_host_path(&params).exists());
}

#[test]
fn test_non_root_identity_owns_every_provisioned_path_once() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let mut params = test_params(temp_dir.path());
    params.uid = 1000;
    params.gid = 1000;
    let accounts = FakeAccounts::default();

    let manifest = ImageAssembler::new(&params, &accounts, &FakeInstaller::cpu(), &FakeProbe::default())
        .assemble()
        .unwrap();

    assert_eq!(
        accounts.created(),
        vec![
            Event::GroupCreated("app".to_string(), 1000),
            Event::UserCreated("app".to_string(), 1000, 1000, PathBuf::from("/root")),
        ]
    );

    // Identity exists before any ownership change
    let events = accounts.events.borrow();
    let first_chown = events.iter().position(|e| matches!(e, Event::Chown(..))).unwrap();
    let last_create = events.iter().rposition(|e| !matches!(e, Event::Chown(..))).unwrap();
    assert!(last_create < first_chown);
    assert!(events
        .iter()
        .all(|e| !matches!(e, Event::Chown(_, uid, gid) if (*uid, *gid) != (1000, 1000))));
    drop(events);

    let chowned = accounts.chowned();
    let unique: HashSet<_> = chowned.iter().collect();
    assert_eq!(unique.len(), chowned.len(), "an entry was chowned twice");

    let layout = &params.layout;
    let mut expected = Vec::new();
    walk(&layout.host_path(&layout.app_dir), &mut expected);
    walk(&layout.host_path(&layout.home_cache_dir()), &mut expected);
    let manifest_path = manifest_host_path(&params);
    assert!(expected.contains(&manifest_path));
    for path in &expected {
        assert!(unique.contains(path), "{:?} was not chowned", path);
    }
    // The seal is written after the ownership pass and handed over on its own
    assert_eq!(chowned.last(), Some(&manifest_path));

    assert!(unique.contains(&layout.host_path(&manifest.tls.key_path)));
    assert!(unique.contains(&layout.host_path(&layout.startup_script_path())));
    for entry in &manifest.model_caches {
        assert!(unique.contains(&layout.host_path(&entry.local_cache_dir)));
    }
}

#[test]
fn test_manifest_chown_failure_leaves_no_seal() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let mut params = test_params(temp_dir.path());
    params.uid = 1000;
    params.gid = 1000;
    let accounts = FakeAccounts {
        fail_chown_of: Some("image-manifest.json"),
        ..FakeAccounts::default()
    };

    let err = ImageAssembler::new(&params, &accounts, &FakeInstaller::cpu(), &FakeProbe::default())
        .assemble()
        .unwrap_err();

    assert_eq!(err.step(), Some(AssemblyStep::SealManifest));
    assert!(!manifest_host_path(&params).exists());
}

#[test]
fn test_gid_zero_skips_group_creation() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let mut params = test_params(temp_dir.path());
    params.uid = 1000;
    params.gid = 0;
    let accounts = FakeAccounts::default();

    ImageAssembler::new(&params, &accounts, &FakeInstaller::cpu(), &FakeProbe::default())
        .assemble()
        .unwrap();

    assert_eq!(
        accounts.created(),
        vec![Event::UserCreated("app".to_string(), 1000, 0, PathBuf::from("/root"))]
    );
}

#[test]
fn test_existing_group_is_reused() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let mut params = test_params(temp_dir.path());
    params.uid = 1000;
    params.gid = 100;
    let accounts = FakeAccounts {
        existing_gids: vec![100],
        ..FakeAccounts::default()
    };

    ImageAssembler::new(&params, &accounts, &FakeInstaller::cpu(), &FakeProbe::default())
        .assemble()
        .unwrap();

    let created = accounts.created();
    assert_eq!(created.len(), 1);
    assert!(matches!(created[0], Event::UserCreated(_, 1000, 100, _)));
}

#[test]
fn test_identity_failure_aborts_before_anything_else() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let mut params = test_params(temp_dir.path());
    params.uid = 1000;
    params.gid = 1000;
    let accounts = FakeAccounts {
        fail_user_creation: true,
        ..FakeAccounts::default()
    };

    let err = ImageAssembler::new(&params, &accounts, &FakeInstaller::cpu(), &FakeProbe::default())
        .assemble()
        .unwrap_err();

    assert_eq!(err.step(), Some(AssemblyStep::ResolveIdentity));
    assert!(accounts.chowned().is_empty());
    assert!(!params.layout.host_path(&params.layout.tls_dir).exists());
    assert!(!manifest_host_path(&params).exists());
}

#[test]
fn test_model_probe_failure_aborts_build() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let mut params = test_params(temp_dir.path());
    params.uid = 1000;
    params.gid = 1000;
    params.models.embedding = "nonexistent/unreachable-model".to_string();
    let accounts = FakeAccounts::default();
    let probe = FakeProbe {
        fail_kind: Some(ModelKind::Embedding),
    };

    let err = ImageAssembler::new(&params, &accounts, &FakeInstaller::cpu(), &probe)
        .assemble()
        .unwrap_err();

    assert_eq!(err.step(), Some(AssemblyStep::WarmModelCaches));
    assert!(err.to_string().contains("unreachable-model"));
    assert!(accounts.chowned().is_empty());
    assert!(!manifest_host_path(&params).exists());
    assert!(!params
        .layout
        .host_path(&params.layout.startup_script_path())
        .exists());
}

#[test]
fn test_gpu_request_with_cpu_runtime_aborts_build() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let mut params = test_params(temp_dir.path());
    params.compute = ComputeRuntime::Gpu {
        variant: "cu121".to_string(),
    };
    params.gpu_policy = GpuPolicy::Warn;

    let err = ImageAssembler::new(
        &params,
        &FakeAccounts::default(),
        &FakeInstaller::cpu(),
        &FakeProbe::default(),
    )
    .assemble()
    .unwrap_err();

    assert_eq!(err.step(), Some(AssemblyStep::InstallRuntime));
    assert!(!manifest_host_path(&params).exists());
}

#[test]
fn test_vpn_agent_must_exist_when_requested() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let mut params = test_params(temp_dir.path());
    params.vpn_agent = VpnAgent::Present {
        binary: PathBuf::from("/usr/sbin/tailscaled"),
    };

    let err = ImageAssembler::new(
        &params,
        &FakeAccounts::default(),
        &FakeInstaller::cpu(),
        &FakeProbe::default(),
    )
    .assemble()
    .unwrap_err();
    assert_eq!(err.step(), Some(AssemblyStep::VerifyVpnAgent));

    let agent = params.layout.host_path(Path::new("/usr/sbin/tailscaled"));
    std::fs::create_dir_all(agent.parent().unwrap()).unwrap();
    std::fs::write(&agent, b"#!/bin/sh\n").unwrap();
    std::fs::set_permissions(&agent, std::fs::Permissions::from_mode(0o755)).unwrap();

    let manifest = ImageAssembler::new(
        &params,
        &FakeAccounts::default(),
        &FakeInstaller::cpu(),
        &FakeProbe::default(),
    )
    .assemble()
    .unwrap();
    assert!(manifest.vpn_agent);
}

#[test]
fn test_failed_rebuild_removes_stale_manifest() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let params = test_params(temp_dir.path());

    ImageAssembler::new(
        &params,
        &FakeAccounts::default(),
        &FakeInstaller::cpu(),
        &FakeProbe::default(),
    )
    .assemble()
    .unwrap();
    assert!(manifest_host_path(&params).exists());

    let probe = FakeProbe {
        fail_kind: Some(ModelKind::SpeechToText),
    };
    assert!(ImageAssembler::new(&params, &FakeAccounts::default(), &FakeInstaller::cpu(), &probe)
        .assemble()
        .is_err());
    assert!(!manifest_host_path(&params).exists());
}

#[test]
fn test_sealed_manifest_round_trips_and_carries_launch_plan() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let mut params = test_params(temp_dir.path());
    params.models.reranking = Some("BAAI/bge-reranker-base".to_string());

    let manifest = ImageAssembler::new(
        &params,
        &FakeAccounts::default(),
        &FakeInstaller::cpu(),
        &FakeProbe::default(),
    )
    .assemble()
    .unwrap();

    let loaded = ImageManifest::load(&manifest_host_path(&params)).unwrap();
    assert_eq!(loaded, manifest);

    assert_eq!(loaded.model_caches.len(), 4);
    assert!(loaded.model_caches.iter().all(|e| e.verified));

    let env = &loaded.launch.env;
    assert_eq!(env.get("BUILD_HASH").map(String::as_str), Some("test-build"));
    assert_eq!(env.get("DO_NOT_TRACK").map(String::as_str), Some("true"));
    assert_eq!(
        env.get("SENTENCE_TRANSFORMERS_HOME").map(String::as_str),
        Some("/app/backend/data/cache/embedding/models")
    );
    assert_eq!(loaded.launch.plain_port, 8080);
    assert_eq!(loaded.launch.ssl_port, 8443);
    assert_eq!(loaded.launch.default_ssl_key_path, PathBuf::from("/app/ssl/key.pem"));

    let script = params.layout.host_path(&params.layout.startup_script_path());
    let mode = std::fs::metadata(&script).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o755);
}

#[test]
fn test_progress_reports_steps_in_order() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let params = test_params(temp_dir.path());
    let reporter = RecordingProgressReporter::default();

    ImageAssembler::new(
        &params,
        &FakeAccounts::default(),
        &FakeInstaller::cpu(),
        &FakeProbe::default(),
    )
    .with_reporter(&reporter)
    .assemble()
    .unwrap();

    let mut steps: Vec<AssemblyStep> = reporter.updates().iter().filter_map(|u| u.step).collect();
    steps.dedup();
    assert_eq!(steps, AssemblyStep::ALL.to_vec());
    assert_eq!(reporter.updates().last().map(|u| u.percentage), Some(100));
}
