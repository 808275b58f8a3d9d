//! Non-root identity creation and the single ownership pass.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{AssembleError, Result};

/// Operating-system identity the application runs as
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
    pub home_dir: PathBuf,
}

impl Identity {
    pub fn root(home_dir: impl Into<PathBuf>) -> Self {
        Self {
            uid: 0,
            gid: 0,
            home_dir: home_dir.into(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

/// Account and ownership operations against the image being assembled.
pub trait IdentityBackend {
    fn group_exists(&self, gid: u32) -> Result<bool>;

    fn create_group(&self, name: &str, gid: u32) -> Result<()>;

    /// Create a user with a locked password and the given home, without populating it.
    fn create_user(&self, name: &str, uid: u32, gid: u32, home: &Path) -> Result<()>;

    /// Change ownership of a single entry without following symlinks.
    fn chown(&self, path: &Path, uid: u32, gid: u32) -> Result<()>;
}

/// Backend using the host's shadow-utils (`groupadd`/`useradd`).
pub struct SystemAccounts {
    root: PathBuf,
}

impl SystemAccounts {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn chroot_args(&self) -> Vec<String> {
        if self.root == Path::new("/") {
            Vec::new()
        } else {
            vec!["--root".to_string(), self.root.to_string_lossy().to_string()]
        }
    }

    fn run(&self, program: &str, args: Vec<String>) -> Result<()> {
        tracing::debug!("[assembler] Running {} {:?}", program, args);
        let output = Command::new(program)
            .args(&args)
            .output()
            .map_err(|e| AssembleError::Identity(format!("Failed to run {}: {}", program, e)))?;

        if !output.status.success() {
            return Err(AssembleError::Identity(format!(
                "{} failed ({}): {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

impl IdentityBackend for SystemAccounts {
    fn group_exists(&self, gid: u32) -> Result<bool> {
        if self.root != Path::new("/") {
            // The host's group database says nothing about a scratch root
            let group_file = self.root.join("etc/group");
            let content = match std::fs::read_to_string(&group_file) {
                Ok(c) => c,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
                Err(e) => return Err(e.into()),
            };
            let wanted = gid.to_string();
            return Ok(content
                .lines()
                .any(|line| line.split(':').nth(2) == Some(wanted.as_str())));
        }

        nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid))
            .map(|g| g.is_some())
            .map_err(|e| AssembleError::Identity(format!("Failed to look up gid {}: {}", gid, e)))
    }

    fn create_group(&self, name: &str, gid: u32) -> Result<()> {
        let mut args = self.chroot_args();
        args.extend(["--gid".to_string(), gid.to_string(), name.to_string()]);
        self.run("groupadd", args)
    }

    fn create_user(&self, name: &str, uid: u32, gid: u32, home: &Path) -> Result<()> {
        let mut args = self.chroot_args();
        args.extend([
            "--uid".to_string(),
            uid.to_string(),
            "--gid".to_string(),
            gid.to_string(),
            "--home-dir".to_string(),
            home.to_string_lossy().to_string(),
            "--no-create-home".to_string(),
            "--shell".to_string(),
            "/usr/sbin/nologin".to_string(),
            name.to_string(),
        ]);
        // useradd leaves the password locked unless one is supplied
        self.run("useradd", args)
    }

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> Result<()> {
        std::os::unix::fs::lchown(path, Some(uid), Some(gid))
            .map_err(|e| AssembleError::Ownership(format!("Failed to chown {:?}: {}", path, e)))
    }
}

/// Resolve the runtime identity, creating the group and user when `uid != 0`.
/// The first failure aborts assembly.
pub fn resolve_identity(
    backend: &dyn IdentityBackend,
    uid: u32,
    gid: u32,
    user_name: &str,
    group_name: &str,
    home: &Path,
) -> Result<Identity> {
    if uid == 0 {
        tracing::info!("[assembler] uid 0 requested, keeping the default root identity");
        return Ok(Identity::root(home));
    }

    if gid != 0 {
        if backend.group_exists(gid)? {
            tracing::info!("[assembler] Group with gid {} already exists, reusing it", gid);
        } else {
            tracing::info!("[assembler] Creating group '{}' (gid {})", group_name, gid);
            backend.create_group(group_name, gid)?;
        }
    }

    tracing::info!(
        "[assembler] Creating user '{}' (uid {}, gid {}, home {:?})",
        user_name,
        uid,
        gid,
        home
    );
    backend.create_user(user_name, uid, gid, home)?;

    Ok(Identity {
        uid,
        gid,
        home_dir: home.to_path_buf(),
    })
}

/// Chown every entry under each host path to the identity.
///
/// Must run once, after every provisioned file exists. `paths` must not nest;
/// see [`crate::layout::ImageLayout::owned_paths`]. Missing paths are skipped.
pub fn assign_ownership(
    backend: &dyn IdentityBackend,
    identity: &Identity,
    paths: &[PathBuf],
) -> Result<usize> {
    if identity.is_root() {
        tracing::info!("[assembler] Root identity, leaving ownership unchanged");
        return Ok(0);
    }

    fn walk(
        backend: &dyn IdentityBackend,
        path: &Path,
        identity: &Identity,
        count: &mut usize,
    ) -> Result<()> {
        backend.chown(path, identity.uid, identity.gid)?;
        *count += 1;
        let metadata = std::fs::symlink_metadata(path)?;
        if metadata.is_dir() {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(path)?
                .map(|entry| entry.map(|e| e.path()))
                .collect::<std::io::Result<_>>()?;
            entries.sort();
            for entry in entries {
                walk(backend, &entry, identity, count)?;
            }
        }
        Ok(())
    }

    let mut count = 0;
    for path in paths {
        if std::fs::symlink_metadata(path).is_err() {
            tracing::debug!("[assembler] Skipping ownership of missing path {:?}", path);
            continue;
        }
        walk(backend, path, identity, &mut count)?;
    }

    tracing::info!(
        "[assembler] Assigned {} entries to {}:{}",
        count,
        identity.uid,
        identity.gid
    );
    Ok(count)
}
