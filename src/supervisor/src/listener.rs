//! Listener selection.
//!
//! Init reads the resolved config once and moves to exactly one terminal
//! state, PlainListen or SslListen. There is no way back and no fallback from
//! SslListen to PlainListen: a requested TLS listener that cannot be set up
//! stops the container instead of silently downgrading it.
use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::config::{RuntimeConfig, ENV_SSL_CERT_PATH, ENV_SSL_KEY_PATH};
use crate::error::{Result, SupervisorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerMode {
    Plain,
    Ssl,
}

impl std::fmt::Display for ListenerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerMode::Plain => f.write_str("plain"),
            ListenerMode::Ssl => f.write_str("ssl"),
        }
    }
}

/// TLS files that were opened successfully during selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedTls {
    pub key_path: PathBuf,
    pub cert_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerDecision {
    PlainListen { host: String, port: u16 },
    SslListen { host: String, port: u16, tls: VerifiedTls },
}

impl ListenerDecision {
    pub fn mode(&self) -> ListenerMode {
        match self {
            ListenerDecision::PlainListen { .. } => ListenerMode::Plain,
            ListenerDecision::SslListen { .. } => ListenerMode::Ssl,
        }
    }

    pub fn host(&self) -> &str {
        match self {
            ListenerDecision::PlainListen { host, .. } | ListenerDecision::SslListen { host, .. } => {
                host
            }
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            ListenerDecision::PlainListen { port, .. } | ListenerDecision::SslListen { port, .. } => {
                *port
            }
        }
    }

    pub fn tls(&self) -> Option<&VerifiedTls> {
        match self {
            ListenerDecision::PlainListen { .. } => None,
            ListenerDecision::SslListen { tls, .. } => Some(tls),
        }
    }
}

/// Pure mode selection; touches nothing on disk.
pub fn select_mode(config: &RuntimeConfig) -> ListenerMode {
    if config.use_ssl {
        ListenerMode::Ssl
    } else {
        ListenerMode::Plain
    }
}

fn verify_readable(var: &'static str, path: Option<&Path>) -> Result<PathBuf> {
    let path = path.ok_or(SupervisorError::MissingTlsPath(var))?;
    let unusable = |reason: String| SupervisorError::TlsMaterial {
        var,
        path: path.to_path_buf(),
        reason,
    };

    let metadata = std::fs::metadata(path).map_err(|e| unusable(e.to_string()))?;
    if !metadata.is_file() {
        return Err(unusable("not a regular file".to_string()));
    }
    File::open(path).map_err(|e| unusable(e.to_string()))?;
    Ok(path.to_path_buf())
}

/// Resolve the terminal listener state for this process.
pub fn resolve_listener(config: &RuntimeConfig, host: &str) -> Result<ListenerDecision> {
    match select_mode(config) {
        ListenerMode::Plain => Ok(ListenerDecision::PlainListen {
            host: host.to_string(),
            port: config.plain_port,
        }),
        ListenerMode::Ssl => {
            let key_path = verify_readable(ENV_SSL_KEY_PATH, config.ssl_key_path.as_deref())?;
            let cert_path = verify_readable(ENV_SSL_CERT_PATH, config.ssl_cert_path.as_deref())?;
            Ok(ListenerDecision::SslListen {
                host: host.to_string(),
                port: config.ssl_port,
                tls: VerifiedTls {
                    key_path,
                    cert_path,
                },
            })
        }
    }
}

/// Check that `path` grants read permission to `(uid, gid)` through its mode bits.
///
/// Owner bits apply when the file is owned by `uid`, group bits when it belongs
/// to `gid`, other bits otherwise. Supplementary groups and ACLs are not consulted.
fn verify_readable_as(var: &'static str, path: &Path, uid: u32, gid: u32) -> Result<()> {
    let metadata = std::fs::metadata(path).map_err(|e| SupervisorError::TlsMaterial {
        var,
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let mode = metadata.mode();
    let readable = if metadata.uid() == uid {
        mode & 0o400 != 0
    } else if metadata.gid() == gid {
        mode & 0o040 != 0
    } else {
        mode & 0o004 != 0
    };

    if !readable {
        return Err(SupervisorError::TlsMaterial {
            var,
            path: path.to_path_buf(),
            reason: format!(
                "not readable by {}:{} (owner {}:{}, mode {:o})",
                uid,
                gid,
                metadata.uid(),
                metadata.gid(),
                mode & 0o777
            ),
        });
    }
    Ok(())
}

/// Re-check verified TLS files for the identity the application will run as.
pub fn verify_tls_for_identity(tls: &VerifiedTls, uid: u32, gid: u32) -> Result<()> {
    verify_readable_as(ENV_SSL_KEY_PATH, &tls.key_path, uid, gid)?;
    verify_readable_as(ENV_SSL_CERT_PATH, &tls.cert_path, uid, gid)
}
