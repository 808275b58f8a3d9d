//! Readiness probe against the application's health endpoint.
use serde::Deserialize;
use std::time::Duration;

use crate::config::RuntimeConfig;

pub const HEALTH_PATH: &str = "/health";
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct HealthPayload {
    status: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady(String),
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

/// Loopback URL of the listener the config selects.
pub fn health_url(config: &RuntimeConfig) -> String {
    let scheme = if config.use_ssl { "https" } else { "http" };
    format!(
        "{}://127.0.0.1:{}{}",
        scheme,
        config.active_port(),
        HEALTH_PATH
    )
}

/// Ready only on a 2xx whose JSON body carries `"status": true`.
///
/// The certificate is self-signed, so verification is disabled.
pub async fn probe_readiness(url: &str, timeout: Duration) -> Readiness {
    let client = match reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(timeout)
        .build()
    {
        Ok(client) => client,
        Err(e) => return Readiness::NotReady(format!("client: {}", e)),
    };

    let response = match client.get(url).send().await {
        Ok(response) => response,
        Err(e) => return Readiness::NotReady(format!("request failed: {}", e)),
    };

    let status = response.status();
    if !status.is_success() {
        return Readiness::NotReady(format!("HTTP {}", status));
    }

    match response.json::<HealthPayload>().await {
        Ok(HealthPayload { status: true }) => Readiness::Ready,
        Ok(HealthPayload { status: false }) => {
            Readiness::NotReady("application reported status false".to_string())
        }
        Err(e) => Readiness::NotReady(format!("malformed health payload: {}", e)),
    }
}
