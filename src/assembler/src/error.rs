use thiserror::Error;

use crate::pipeline::AssemblyStep;

pub type Result<T> = std::result::Result<T, AssembleError>;

/// Build-fatal errors. Any of these aborts image assembly; no manifest is sealed.
#[derive(Error, Debug)]
pub enum AssembleError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Identity error: {0}")]
    Identity(String),

    #[error("Runtime install error: {0}")]
    Install(String),

    #[error("Runtime mismatch: requested {requested}, installed runtime reports {reported}")]
    RuntimeMismatch { requested: String, reported: String },

    #[error("Accelerator unavailable: {0}")]
    AcceleratorUnavailable(String),

    #[error("VPN agent error: {0}")]
    VpnAgent(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Model cache probe failed for {kind} ({source_id}): {reason}")]
    ModelProbe {
        kind: String,
        source_id: String,
        reason: String,
    },

    #[error("Ownership error: {0}")]
    Ownership(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Step '{step}' failed: {source}")]
    Step {
        step: AssemblyStep,
        #[source]
        source: Box<AssembleError>,
    },
}

impl AssembleError {
    /// The step that failed, when the error came out of the assembly pipeline.
    pub fn step(&self) -> Option<AssemblyStep> {
        match self {
            AssembleError::Step { step, .. } => Some(*step),
            _ => None,
        }
    }
}
