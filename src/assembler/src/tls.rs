use chrono::{DateTime, Utc};
use rcgen::{CertificateParams, DistinguishedName, KeyPair, SanType};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::error::{AssembleError, Result};
use crate::layout::ImageLayout;

pub const DEFAULT_SUBJECT_CN: &str = "localhost";
pub const DEFAULT_VALIDITY_DAYS: u32 = 365;
pub const DEFAULT_RSA_BITS: usize = 4096;

/// Owner read/write only
pub const KEY_FILE_MODE: u32 = 0o600;
/// World readable
pub const CERT_FILE_MODE: u32 = 0o644;

/// Private key algorithm for the self-signed pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum KeyAlgorithm {
    Rsa { bits: usize },
    EcdsaP256,
}

impl Default for KeyAlgorithm {
    fn default() -> Self {
        KeyAlgorithm::Rsa {
            bits: DEFAULT_RSA_BITS,
        }
    }
}

/// Parameters of the self-signed certificate generated at build time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsSpec {
    #[serde(default)]
    pub key_algorithm: KeyAlgorithm,
    #[serde(default = "default_subject_cn")]
    pub subject_cn: String,
    #[serde(default = "default_dns_names")]
    pub dns_names: Vec<String>,
    #[serde(default = "default_ip_addresses")]
    pub ip_addresses: Vec<IpAddr>,
    #[serde(default = "default_validity_days")]
    pub validity_days: u32,
}

fn default_subject_cn() -> String {
    DEFAULT_SUBJECT_CN.to_string()
}

fn default_dns_names() -> Vec<String> {
    vec!["localhost".to_string()]
}

fn default_ip_addresses() -> Vec<IpAddr> {
    vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]
}

fn default_validity_days() -> u32 {
    DEFAULT_VALIDITY_DAYS
}

impl Default for TlsSpec {
    fn default() -> Self {
        Self {
            key_algorithm: KeyAlgorithm::default(),
            subject_cn: default_subject_cn(),
            dns_names: default_dns_names(),
            ip_addresses: default_ip_addresses(),
            validity_days: default_validity_days(),
        }
    }
}

/// Generated certificate/key pair as laid out in the image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsMaterial {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub subject_cn: String,
    /// `DNS:<name>` / `IP:<addr>` entries
    pub san_entries: Vec<String>,
    pub validity_days: u32,
    pub not_after: DateTime<Utc>,
}

/// PEM-encoded pair fresh out of the generator
pub struct GeneratedPair {
    pub cert_pem: String,
    pub key_pem: String,
    pub not_after: DateTime<Utc>,
}

fn generate_key_pair(algorithm: KeyAlgorithm) -> Result<KeyPair> {
    match algorithm {
        KeyAlgorithm::EcdsaP256 => KeyPair::generate()
            .map_err(|e| AssembleError::Tls(format!("Failed to generate key pair: {}", e))),
        KeyAlgorithm::Rsa { bits } => {
            use rsa::pkcs8::{EncodePrivateKey, LineEnding};

            // rcgen signs with RSA keys but cannot create them
            let mut rng = rand::thread_rng();
            let private_key = rsa::RsaPrivateKey::new(&mut rng, bits).map_err(|e| {
                AssembleError::Tls(format!("Failed to generate {}-bit RSA key: {}", bits, e))
            })?;
            let pem = private_key.to_pkcs8_pem(LineEnding::LF).map_err(|e| {
                AssembleError::Tls(format!("Failed to encode RSA key: {}", e))
            })?;
            KeyPair::from_pem(&pem)
                .map_err(|e| AssembleError::Tls(format!("Failed to load RSA key: {}", e)))
        }
    }
}

/// Generate a self-signed certificate for the requested names
pub fn generate_self_signed(spec: &TlsSpec) -> Result<GeneratedPair> {
    let mut params = CertificateParams::new(spec.dns_names.clone()).map_err(|e| {
        AssembleError::Tls(format!("Failed to create certificate params: {}", e))
    })?;

    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, spec.subject_cn.as_str());

    for ip in &spec.ip_addresses {
        params.subject_alt_names.push(SanType::IpAddress(*ip));
    }

    let not_before = SystemTime::now();
    let not_after = not_before + Duration::from_secs(u64::from(spec.validity_days) * 24 * 60 * 60);
    params.not_before = not_before.into();
    params.not_after = not_after.into();

    let key_pair = generate_key_pair(spec.key_algorithm)?;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| AssembleError::Tls(format!("Failed to generate certificate: {}", e)))?;

    let expiry = DateTime::from_timestamp(
        not_after
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_err(|e| AssembleError::Tls(format!("Failed to calculate expiry: {}", e)))?
            .as_secs() as i64,
        0,
    )
    .ok_or_else(|| AssembleError::Tls("Invalid expiry timestamp".to_string()))?;

    Ok(GeneratedPair {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
        not_after: expiry,
    })
}

/// Write `contents` to `path` with `mode`, replacing any existing file.
///
/// The mode is applied at creation so the key is never briefly world readable.
fn write_with_mode(path: &Path, contents: &str, mode: u32) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(path)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    // umask may have masked bits off at creation
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Generate and write the image's TLS material.
///
/// Runs unconditionally: whether TLS is used is decided at container start.
pub fn provision_tls(layout: &ImageLayout, spec: &TlsSpec) -> Result<TlsMaterial> {
    let tls_dir = layout.host_path(&layout.tls_dir);
    std::fs::create_dir_all(&tls_dir)?;

    tracing::info!(
        "[assembler] Generating self-signed certificate for CN={} ({:?})",
        spec.subject_cn,
        spec.key_algorithm
    );
    let pair = generate_self_signed(spec)?;

    let cert_path = layout.cert_path();
    let key_path = layout.key_path();
    write_with_mode(&layout.host_path(&key_path), &pair.key_pem, KEY_FILE_MODE)?;
    write_with_mode(&layout.host_path(&cert_path), &pair.cert_pem, CERT_FILE_MODE)?;

    let san_entries = spec
        .dns_names
        .iter()
        .map(|name| format!("DNS:{}", name))
        .chain(spec.ip_addresses.iter().map(|ip| format!("IP:{}", ip)))
        .collect();

    tracing::info!(
        "[assembler] TLS material written to {:?} (expires {})",
        tls_dir,
        pair.not_after
    );

    Ok(TlsMaterial {
        cert_path,
        key_path,
        subject_cn: spec.subject_cn.clone(),
        san_entries,
        validity_days: spec.validity_days,
        not_after: pair.not_after,
    })
}
