//! Model cache warming.
//!
//! Each optional ML subsystem gets its own cache directory under the cache
//! root. A cache entry is only marked verified after the loader managed to
//! load the model from that directory and throw it away again.
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Command;

use crate::config::{ModelSelection, ProbeCommands, PLACEHOLDER_CACHE_DIR, PLACEHOLDER_SOURCE};
use crate::error::{AssembleError, Result};
use crate::layout::ImageLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelKind {
    Tokenizer,
    Embedding,
    Reranking,
    SpeechToText,
}

impl ModelKind {
    pub fn cache_dir_name(&self) -> &'static str {
        match self {
            ModelKind::Tokenizer => "tiktoken",
            ModelKind::Embedding => "embedding/models",
            ModelKind::Reranking => "reranking/models",
            ModelKind::SpeechToText => "whisper/models",
        }
    }

    /// Variable the loader reads its cache location from.
    pub fn cache_env_var(&self) -> &'static str {
        match self {
            ModelKind::Tokenizer => "TIKTOKEN_CACHE_DIR",
            ModelKind::Embedding => "SENTENCE_TRANSFORMERS_HOME",
            ModelKind::Reranking => "RERANKING_MODEL_DIR",
            ModelKind::SpeechToText => "WHISPER_MODEL_DIR",
        }
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelKind::Tokenizer => "tokenizer",
            ModelKind::Embedding => "embedding",
            ModelKind::Reranking => "reranking",
            ModelKind::SpeechToText => "speech-to-text",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCacheEntry {
    pub kind: ModelKind,
    pub source_identifier: String,
    /// Image path of the cache directory
    pub local_cache_dir: PathBuf,
    pub verified: bool,
}

/// Loads a model into its cache directory and discards it.
pub trait ModelProbe {
    /// `host_cache_dir` is where the cache lives on the assembling host.
    fn load_and_discard(
        &self,
        entry: &ModelCacheEntry,
        host_cache_dir: &std::path::Path,
    ) -> std::result::Result<(), String>;
}

/// Probe that shells out to the configured loader command per kind.
pub struct CommandProbe {
    commands: ProbeCommands,
}

impl CommandProbe {
    pub fn new(commands: ProbeCommands) -> Self {
        Self { commands }
    }

    fn template(&self, kind: ModelKind) -> &[String] {
        match kind {
            ModelKind::Tokenizer => &self.commands.tokenizer,
            ModelKind::Embedding => &self.commands.embedding,
            ModelKind::Reranking => &self.commands.reranking,
            ModelKind::SpeechToText => &self.commands.speech_to_text,
        }
    }
}

impl ModelProbe for CommandProbe {
    fn load_and_discard(
        &self,
        entry: &ModelCacheEntry,
        host_cache_dir: &std::path::Path,
    ) -> std::result::Result<(), String> {
        let cache_dir = host_cache_dir.to_string_lossy();
        let argv: Vec<String> = self
            .template(entry.kind)
            .iter()
            .map(|a| {
                a.replace(PLACEHOLDER_SOURCE, &entry.source_identifier)
                    .replace(PLACEHOLDER_CACHE_DIR, &cache_dir)
            })
            .collect();
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| format!("No probe command configured for {}", entry.kind))?;

        let output = Command::new(program)
            .args(args)
            .env(entry.kind.cache_env_var(), host_cache_dir)
            .env("HF_HOME", host_cache_dir)
            .output()
            .map_err(|e| format!("Failed to run {}: {}", program, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let last_line = stderr.lines().last().unwrap_or("No output available");
            return Err(format!("{} exited with {}: {}", program, output.status, last_line));
        }
        Ok(())
    }
}

/// Cache entries in probe order. Reranking is skipped when no model is selected.
pub fn plan_cache_entries(models: &ModelSelection, layout: &ImageLayout) -> Vec<ModelCacheEntry> {
    let mut planned = vec![
        (ModelKind::Tokenizer, models.tokenizer_encoding.clone()),
        (ModelKind::Embedding, models.embedding.clone()),
    ];
    if let Some(reranking) = &models.reranking {
        planned.push((ModelKind::Reranking, reranking.clone()));
    }
    planned.push((ModelKind::SpeechToText, models.speech_to_text.clone()));

    planned
        .into_iter()
        .map(|(kind, source_identifier)| ModelCacheEntry {
            kind,
            source_identifier,
            local_cache_dir: layout.cache_dir(kind),
            verified: false,
        })
        .collect()
}

/// Warm one cache and mark it verified. Any probe failure is build-fatal.
pub fn warm_and_verify_cache(
    probe: &dyn ModelProbe,
    layout: &ImageLayout,
    entry: &ModelCacheEntry,
) -> Result<ModelCacheEntry> {
    let host_cache_dir = layout.host_path(&entry.local_cache_dir);
    std::fs::create_dir_all(&host_cache_dir)?;

    tracing::info!(
        "[assembler] Warming {} cache with '{}' into {:?}",
        entry.kind,
        entry.source_identifier,
        entry.local_cache_dir
    );

    probe
        .load_and_discard(entry, &host_cache_dir)
        .map_err(|reason| AssembleError::ModelProbe {
            kind: entry.kind.to_string(),
            source_id: entry.source_identifier.clone(),
            reason,
        })?;

    Ok(ModelCacheEntry {
        verified: true,
        ..entry.clone()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_skips_reranking_when_unset() {
        let entries = plan_cache_entries(&ModelSelection::default(), &ImageLayout::default());
        let kinds: Vec<ModelKind> = entries.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ModelKind::Tokenizer,
                ModelKind::Embedding,
                ModelKind::SpeechToText
            ]
        );
        assert!(entries.iter().all(|e| !e.verified));
    }

    #[test]
    fn test_plan_includes_reranking_before_speech() {
        let models = ModelSelection {
            reranking: Some("BAAI/bge-reranker-base".to_string()),
            ..ModelSelection::default()
        };
        let entries = plan_cache_entries(&models, &ImageLayout::default());
        assert_eq!(entries[2].kind, ModelKind::Reranking);
        assert_eq!(
            entries[2].local_cache_dir,
            PathBuf::from("/app/backend/data/cache/reranking/models")
        );
    }

    #[test]
    fn test_command_probe_substitutes_placeholders() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("marker");
        let probe = CommandProbe::new(ProbeCommands {
            tokenizer: vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("echo {{source}} > {}", marker.display()),
            ],
            ..ProbeCommands::default()
        });
        let entry = ModelCacheEntry {
            kind: ModelKind::Tokenizer,
            source_identifier: "cl100k_base".to_string(),
            local_cache_dir: PathBuf::from("/cache/tiktoken"),
            verified: false,
        };
        probe.load_and_discard(&entry, dir.path()).unwrap();
        let written = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(written.trim(), "cl100k_base");
    }
}
