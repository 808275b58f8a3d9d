//! Filesystem layout of the assembled image.
//!
//! Paths are stored as they appear inside the image (absolute). Host-side
//! operations go through [`ImageLayout::host_path`], which re-roots them under
//! the assembly root so the same layout can be provisioned into a scratch tree.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::models::ModelKind;

pub const DEFAULT_APP_DIR: &str = "/app";
pub const DEFAULT_HOME_DIR: &str = "/root";
pub const DEFAULT_DATA_DIR: &str = "/app/backend/data";
pub const DEFAULT_CACHE_ROOT: &str = "/app/backend/data/cache";
pub const DEFAULT_TLS_DIR: &str = "/app/ssl";

pub const CERT_FILE_NAME: &str = "cert.pem";
pub const KEY_FILE_NAME: &str = "key.pem";
pub const MANIFEST_FILE_NAME: &str = "image-manifest.json";
pub const STARTUP_SCRIPT_NAME: &str = "start.sh";

/// Default location of the sealed manifest inside the image.
pub const DEFAULT_MANIFEST_PATH: &str = "/app/image-manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageLayout {
    /// Host directory the image paths are rooted at (`/` inside an image build)
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_app_dir")]
    pub app_dir: PathBuf,
    #[serde(default = "default_home_dir")]
    pub home_dir: PathBuf,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_cache_root")]
    pub cache_root: PathBuf,
    #[serde(default = "default_tls_dir")]
    pub tls_dir: PathBuf,
}

fn default_root() -> PathBuf {
    PathBuf::from("/")
}

fn default_app_dir() -> PathBuf {
    PathBuf::from(DEFAULT_APP_DIR)
}

fn default_home_dir() -> PathBuf {
    PathBuf::from(DEFAULT_HOME_DIR)
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(DEFAULT_DATA_DIR)
}

fn default_cache_root() -> PathBuf {
    PathBuf::from(DEFAULT_CACHE_ROOT)
}

fn default_tls_dir() -> PathBuf {
    PathBuf::from(DEFAULT_TLS_DIR)
}

impl Default for ImageLayout {
    fn default() -> Self {
        Self {
            root: default_root(),
            app_dir: default_app_dir(),
            home_dir: default_home_dir(),
            data_dir: default_data_dir(),
            cache_root: default_cache_root(),
            tls_dir: default_tls_dir(),
        }
    }
}

impl ImageLayout {
    /// Same layout, provisioned under a different host root.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Map an image path onto the host filesystem.
    pub fn host_path(&self, image_path: &Path) -> PathBuf {
        let relative = image_path.strip_prefix("/").unwrap_or(image_path);
        self.root.join(relative)
    }

    pub fn cert_path(&self) -> PathBuf {
        self.tls_dir.join(CERT_FILE_NAME)
    }

    pub fn key_path(&self) -> PathBuf {
        self.tls_dir.join(KEY_FILE_NAME)
    }

    pub fn cache_dir(&self, kind: ModelKind) -> PathBuf {
        self.cache_root.join(kind.cache_dir_name())
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.app_dir.join(MANIFEST_FILE_NAME)
    }

    pub fn startup_script_path(&self) -> PathBuf {
        self.app_dir.join(STARTUP_SCRIPT_NAME)
    }

    /// Home-directory caches used by the model loaders (`~/.cache`).
    pub fn home_cache_dir(&self) -> PathBuf {
        self.home_dir.join(".cache")
    }

    /// Every application-writable path, with nested entries removed so a
    /// recursive walk over the result visits each file exactly once.
    pub fn owned_paths(&self) -> Vec<PathBuf> {
        let candidates = [
            self.app_dir.clone(),
            self.home_cache_dir(),
            self.tls_dir.clone(),
            self.data_dir.clone(),
        ];

        let mut owned: Vec<PathBuf> = Vec::new();
        for candidate in candidates {
            let covered = owned.iter().any(|p| candidate.starts_with(p));
            if covered {
                continue;
            }
            owned.retain(|p| !p.starts_with(&candidate));
            owned.push(candidate);
        }
        owned
    }
}
