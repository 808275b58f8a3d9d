use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Bootstrap-fatal errors. The application is never launched when one occurs.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Invalid port in {var}: '{value}'")]
    InvalidPort { var: &'static str, value: String },

    #[error("SSL requested but {0} is not set and the image has no default")]
    MissingTlsPath(&'static str),

    #[error("SSL requested but {path:?} ({var}) is unusable: {reason}")]
    TlsMaterial {
        var: &'static str,
        path: PathBuf,
        reason: String,
    },

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Accelerator unavailable: {0}")]
    AcceleratorUnavailable(String),

    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
}
