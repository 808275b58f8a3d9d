//! Run-time configuration, resolved once from a single environment snapshot.
use assembler::LaunchPlan;
use std::path::PathBuf;

use crate::error::{Result, SupervisorError};

pub const ENV_USE_SSL: &str = "USE_SSL";
pub const ENV_PORT: &str = "PORT";
pub const ENV_SSL_PORT: &str = "SSL_PORT";
pub const ENV_SSL_KEY_PATH: &str = "SSL_KEY_PATH";
pub const ENV_SSL_CERT_PATH: &str = "SSL_CERT_PATH";

/// The only `USE_SSL` value that selects TLS. Matched exactly.
pub const SSL_ENABLED_LITERAL: &str = "true";

/// Values baked into the image that the environment may override
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeDefaults {
    pub plain_port: u16,
    pub ssl_port: u16,
    pub ssl_key_path: Option<PathBuf>,
    pub ssl_cert_path: Option<PathBuf>,
}

impl Default for RuntimeDefaults {
    fn default() -> Self {
        Self {
            plain_port: assembler::manifest::DEFAULT_PLAIN_PORT,
            ssl_port: assembler::manifest::DEFAULT_SSL_PORT,
            ssl_key_path: None,
            ssl_cert_path: None,
        }
    }
}

impl From<&LaunchPlan> for RuntimeDefaults {
    fn from(plan: &LaunchPlan) -> Self {
        Self {
            plain_port: plan.plain_port,
            ssl_port: plan.ssl_port,
            ssl_key_path: Some(plan.default_ssl_key_path.clone()),
            ssl_cert_path: Some(plan.default_ssl_cert_path.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub use_ssl: bool,
    pub plain_port: u16,
    pub ssl_port: u16,
    pub ssl_key_path: Option<PathBuf>,
    pub ssl_cert_path: Option<PathBuf>,
}

/// Unset and empty are the same thing, as with `${VAR:-default}`.
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn parse_port(var: &'static str, value: Option<String>, default: u16) -> Result<u16> {
    match non_empty(value) {
        None => Ok(default),
        Some(raw) => match raw.trim().parse::<u16>() {
            Ok(port) if port != 0 => Ok(port),
            _ => Err(SupervisorError::InvalidPort { var, value: raw }),
        },
    }
}

impl RuntimeConfig {
    /// Build the config from any variable source. Every variable is read exactly once.
    pub fn from_lookup<F>(lookup: F, defaults: &RuntimeDefaults) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let use_ssl = lookup(ENV_USE_SSL).as_deref() == Some(SSL_ENABLED_LITERAL);
        let plain_port = parse_port(ENV_PORT, lookup(ENV_PORT), defaults.plain_port)?;
        let ssl_port = parse_port(ENV_SSL_PORT, lookup(ENV_SSL_PORT), defaults.ssl_port)?;
        let ssl_key_path = non_empty(lookup(ENV_SSL_KEY_PATH))
            .map(PathBuf::from)
            .or_else(|| defaults.ssl_key_path.clone());
        let ssl_cert_path = non_empty(lookup(ENV_SSL_CERT_PATH))
            .map(PathBuf::from)
            .or_else(|| defaults.ssl_cert_path.clone());

        Ok(Self {
            use_ssl,
            plain_port,
            ssl_port,
            ssl_key_path,
            ssl_cert_path,
        })
    }

    pub fn from_env(defaults: &RuntimeDefaults) -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok(), defaults)
    }

    /// Port of whichever listener this config selects.
    pub fn active_port(&self) -> u16 {
        if self.use_ssl {
            self.ssl_port
        } else {
            self.plain_port
        }
    }
}
