//! Build parameters for image assembly
//! Loaded from image-build.toml, with CLI overrides applied by the binary
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{AssembleError, Result};
use crate::layout::ImageLayout;
use crate::tls::TlsSpec;

/// Placeholders substituted into launch argument templates at container start.
pub const PLACEHOLDER_HOST: &str = "{host}";
pub const PLACEHOLDER_PORT: &str = "{port}";
pub const PLACEHOLDER_SSL_KEYFILE: &str = "{ssl_keyfile}";
pub const PLACEHOLDER_SSL_CERTFILE: &str = "{ssl_certfile}";

/// Placeholders substituted into installer and probe command templates.
pub const PLACEHOLDER_VARIANT: &str = "{variant}";
pub const PLACEHOLDER_SOURCE: &str = "{source}";
pub const PLACEHOLDER_CACHE_DIR: &str = "{cache_dir}";

pub const DEFAULT_SUPERVISOR_BINARY: &str = "/usr/local/bin/bootstrap-supervisor";

/// Inference runtime flavour installed into the image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ComputeRuntime {
    #[default]
    Cpu,
    Gpu {
        /// Runtime build variant, e.g. `cu121` or `rocm6.0`
        variant: String,
    },
}

impl ComputeRuntime {
    pub fn is_gpu(&self) -> bool {
        matches!(self, ComputeRuntime::Gpu { .. })
    }
}

impl std::fmt::Display for ComputeRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComputeRuntime::Cpu => write!(f, "cpu"),
            ComputeRuntime::Gpu { variant } => write!(f, "gpu ({})", variant),
        }
    }
}

/// What to do when a GPU image cannot see a GPU device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GpuPolicy {
    /// Missing device is fatal
    Require,
    /// Missing device is logged loudly, startup continues
    #[default]
    Warn,
}

impl<'de> Deserialize<'de> for GpuPolicy {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(|_| {
            serde::de::Error::custom(format!(
                "unknown variant `{}`, expected one of `require`, `warn`",
                s
            ))
        })
    }
}

impl std::str::FromStr for GpuPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "require" => Ok(GpuPolicy::Require),
            "warn" => Ok(GpuPolicy::Warn),
            _ => Err(format!("Unknown GPU policy: {}", s)),
        }
    }
}

/// Overlay-network agent shipped in the image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum VpnAgent {
    #[default]
    Absent,
    Present {
        /// Agent binary inside the image
        binary: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TelemetryPolicy {
    #[default]
    OptOut,
    Allow,
}

impl TelemetryPolicy {
    /// Environment the launched application receives for this policy.
    pub fn env(&self) -> Vec<(&'static str, &'static str)> {
        match self {
            TelemetryPolicy::OptOut => vec![
                ("SCARF_NO_ANALYTICS", "true"),
                ("DO_NOT_TRACK", "true"),
                ("ANONYMIZED_TELEMETRY", "false"),
            ],
            TelemetryPolicy::Allow => Vec::new(),
        }
    }
}

/// Model identifiers warmed into the image caches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSelection {
    #[serde(default = "default_embedding_model")]
    pub embedding: String,
    /// Empty string in the config file means no reranker
    #[serde(default, deserialize_with = "empty_as_none")]
    pub reranking: Option<String>,
    #[serde(default = "default_speech_to_text_model")]
    pub speech_to_text: String,
    #[serde(default = "default_tokenizer_encoding")]
    pub tokenizer_encoding: String,
}

fn default_embedding_model() -> String {
    "sentence-transformers/all-MiniLM-L6-v2".to_string()
}

fn default_speech_to_text_model() -> String {
    "base".to_string()
}

fn default_tokenizer_encoding() -> String {
    "cl100k_base".to_string()
}

fn empty_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.trim().is_empty()))
}

impl Default for ModelSelection {
    fn default() -> Self {
        Self {
            embedding: default_embedding_model(),
            reranking: None,
            speech_to_text: default_speech_to_text_model(),
            tokenizer_encoding: default_tokenizer_encoding(),
        }
    }
}

/// How the application process is started once a listener is chosen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchTemplate {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_working_dir")]
    pub working_dir: Option<PathBuf>,
    /// Arguments for every launch; `{host}` and `{port}` are substituted
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    /// Appended only when listening with TLS
    #[serde(default = "default_ssl_args")]
    pub ssl_args: Vec<String>,
    /// Extra environment defaults for the application
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_program() -> String {
    "uvicorn".to_string()
}

fn default_working_dir() -> Option<PathBuf> {
    Some(PathBuf::from("/app/backend"))
}

fn default_args() -> Vec<String> {
    [
        "main:app",
        "--host",
        PLACEHOLDER_HOST,
        "--port",
        PLACEHOLDER_PORT,
        "--forwarded-allow-ips",
        "*",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_ssl_args() -> Vec<String> {
    [
        "--ssl-keyfile",
        PLACEHOLDER_SSL_KEYFILE,
        "--ssl-certfile",
        PLACEHOLDER_SSL_CERTFILE,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for LaunchTemplate {
    fn default() -> Self {
        Self {
            program: default_program(),
            working_dir: default_working_dir(),
            args: default_args(),
            ssl_args: default_ssl_args(),
            env: BTreeMap::new(),
        }
    }
}

/// Commands that install and interrogate the inference runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallerCommands {
    #[serde(default = "default_cpu_install")]
    pub cpu: Vec<String>,
    /// `{variant}` is replaced with the GPU runtime variant
    #[serde(default = "default_gpu_install")]
    pub gpu: Vec<String>,
    /// Must print a JSON runtime report on stdout
    #[serde(default = "default_runtime_probe")]
    pub probe: Vec<String>,
}

const TORCH_INDEX: &str = "https://download.pytorch.org/whl";

const RUNTIME_PROBE_SCRIPT: &str = "import json, torch; \
print(json.dumps({'accelerator_build': bool(torch.version.cuda or getattr(torch.version, 'hip', None)), \
'device_visible': torch.cuda.is_available(), 'version': torch.__version__}))";

fn pip_torch(index: String) -> Vec<String> {
    vec![
        "pip3".to_string(),
        "install".to_string(),
        "--no-cache-dir".to_string(),
        "torch".to_string(),
        "torchvision".to_string(),
        "torchaudio".to_string(),
        "--index-url".to_string(),
        index,
    ]
}

fn default_cpu_install() -> Vec<String> {
    pip_torch(format!("{}/cpu", TORCH_INDEX))
}

fn default_gpu_install() -> Vec<String> {
    pip_torch(format!("{}/{}", TORCH_INDEX, PLACEHOLDER_VARIANT))
}

fn default_runtime_probe() -> Vec<String> {
    vec![
        "python3".to_string(),
        "-c".to_string(),
        RUNTIME_PROBE_SCRIPT.to_string(),
    ]
}

impl Default for InstallerCommands {
    fn default() -> Self {
        Self {
            cpu: default_cpu_install(),
            gpu: default_gpu_install(),
            probe: default_runtime_probe(),
        }
    }
}

/// Load-and-discard probes per model kind; `{source}` and `{cache_dir}` are substituted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeCommands {
    #[serde(default = "default_tokenizer_probe")]
    pub tokenizer: Vec<String>,
    #[serde(default = "default_embedding_probe")]
    pub embedding: Vec<String>,
    #[serde(default = "default_reranking_probe")]
    pub reranking: Vec<String>,
    #[serde(default = "default_speech_to_text_probe")]
    pub speech_to_text: Vec<String>,
}

fn python_probe(script: &str) -> Vec<String> {
    vec![
        "python3".to_string(),
        "-c".to_string(),
        script.to_string(),
        PLACEHOLDER_SOURCE.to_string(),
    ]
}

fn default_tokenizer_probe() -> Vec<String> {
    python_probe("import sys, tiktoken; tiktoken.get_encoding(sys.argv[1])")
}

fn default_embedding_probe() -> Vec<String> {
    python_probe(
        "import sys; from sentence_transformers import SentenceTransformer; \
         SentenceTransformer(sys.argv[1], device='cpu')",
    )
}

fn default_reranking_probe() -> Vec<String> {
    python_probe(
        "import sys; from sentence_transformers import CrossEncoder; \
         CrossEncoder(sys.argv[1], device='cpu')",
    )
}

fn default_speech_to_text_probe() -> Vec<String> {
    python_probe(
        "import os, sys; from faster_whisper import WhisperModel; \
         WhisperModel(sys.argv[1], device='cpu', compute_type='int8', \
         download_root=os.environ['WHISPER_MODEL_DIR'])",
    )
}

impl Default for ProbeCommands {
    fn default() -> Self {
        Self {
            tokenizer: default_tokenizer_probe(),
            embedding: default_embedding_probe(),
            reranking: default_reranking_probe(),
            speech_to_text: default_speech_to_text_probe(),
        }
    }
}

/// Image build parameters
/// Immutable once assembly starts; fixes the set of installed optional subsystems
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildParameters {
    #[serde(default)]
    pub compute: ComputeRuntime,
    #[serde(default)]
    pub gpu_policy: GpuPolicy,
    #[serde(default)]
    pub vpn_agent: VpnAgent,
    #[serde(default)]
    pub models: ModelSelection,
    #[serde(default)]
    pub telemetry: TelemetryPolicy,
    /// Version marker exported to the application as `BUILD_HASH`
    #[serde(default = "default_build_identifier")]
    pub build_identifier: String,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(default = "default_account_name")]
    pub user_name: String,
    #[serde(default = "default_account_name")]
    pub group_name: String,
    #[serde(default)]
    pub layout: ImageLayout,
    #[serde(default)]
    pub tls: TlsSpec,
    #[serde(default)]
    pub launch: LaunchTemplate,
    #[serde(default)]
    pub installer: InstallerCommands,
    #[serde(default)]
    pub probes: ProbeCommands,
    #[serde(default = "default_supervisor_binary")]
    pub supervisor_binary: PathBuf,
}

fn default_build_identifier() -> String {
    "dev-build".to_string()
}

fn default_account_name() -> String {
    "app".to_string()
}

fn default_supervisor_binary() -> PathBuf {
    PathBuf::from(DEFAULT_SUPERVISOR_BINARY)
}

impl Default for BuildParameters {
    fn default() -> Self {
        Self {
            compute: ComputeRuntime::default(),
            gpu_policy: GpuPolicy::default(),
            vpn_agent: VpnAgent::default(),
            models: ModelSelection::default(),
            telemetry: TelemetryPolicy::default(),
            build_identifier: default_build_identifier(),
            uid: 0,
            gid: 0,
            user_name: default_account_name(),
            group_name: default_account_name(),
            layout: ImageLayout::default(),
            tls: TlsSpec::default(),
            launch: LaunchTemplate::default(),
            installer: InstallerCommands::default(),
            probes: ProbeCommands::default(),
            supervisor_binary: default_supervisor_binary(),
        }
    }
}

impl BuildParameters {
    /// Load parameters from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AssembleError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let params: BuildParameters = toml::from_str(&content).map_err(|e| {
            AssembleError::Config(format!("Failed to parse config file {:?}: {}", path, e))
        })?;

        tracing::info!("[assembler] Loaded build parameters from {:?}", path);
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if self.models.embedding.trim().is_empty() {
            return Err(AssembleError::Config(
                "Embedding model identifier must not be empty".to_string(),
            ));
        }
        if self.models.tokenizer_encoding.trim().is_empty() {
            return Err(AssembleError::Config(
                "Tokenizer encoding name must not be empty".to_string(),
            ));
        }
        if self.models.speech_to_text.trim().is_empty() {
            return Err(AssembleError::Config(
                "Speech-to-text model identifier must not be empty".to_string(),
            ));
        }
        if let ComputeRuntime::Gpu { variant } = &self.compute {
            if variant.trim().is_empty() {
                return Err(AssembleError::Config(
                    "GPU runtime variant must not be empty".to_string(),
                ));
            }
        }
        if let VpnAgent::Present { binary } = &self.vpn_agent {
            if !binary.is_absolute() {
                return Err(AssembleError::Config(format!(
                    "VPN agent binary must be an absolute image path: {:?}",
                    binary
                )));
            }
        }
        if self.uid != 0 && (self.user_name.is_empty() || self.group_name.is_empty()) {
            return Err(AssembleError::Config(
                "User and group names are required for a non-root identity".to_string(),
            ));
        }
        if self.uid == 0 && self.gid != 0 {
            tracing::warn!(
                "[assembler] uid is 0, ignoring gid {} (running as the default root identity)",
                self.gid
            );
        }
        if self.launch.program.trim().is_empty() {
            return Err(AssembleError::Config(
                "Launch program must not be empty".to_string(),
            ));
        }
        if !self.launch.args.iter().any(|a| a.contains(PLACEHOLDER_PORT)) {
            return Err(AssembleError::Config(format!(
                "Launch arguments must reference {} so the chosen listener port reaches the application",
                PLACEHOLDER_PORT
            )));
        }
        Ok(())
    }
}
