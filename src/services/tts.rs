//! TTS Adapter
//!
//! Speech synthesis behind a trait so stage code never cares which backend
//! is wired in. The mock backend is deterministic and filesystem-only,
//! which keeps assembly testable without credentials.

use crate::config::{Config, TtsProviderKind};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const OPENAI_SPEECH_URL: &str = "https://api.openai.com/v1/audio/speech";

/// Average narration pace used to estimate spoken duration from text.
const WORDS_PER_MINUTE: f64 = 150.0;

#[derive(Debug, Clone, Default)]
pub struct TtsOptions {
    pub voice: Option<String>,
    pub model: Option<String>,
    pub speed: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TtsResult {
    pub audio_path: PathBuf,
    pub duration: f64,
    pub format: String,
}

#[async_trait]
pub trait TtsProvider: Send + Sync {
    async fn generate(&self, text: &str, output_path: &Path, options: &TtsOptions)
        -> Result<TtsResult>;

    fn voices(&self) -> Vec<String>;
}

pub fn build_tts(config: &Config) -> Arc<dyn TtsProvider> {
    match config.tts_provider {
        TtsProviderKind::OpenAi => Arc::new(OpenAiTts::new(config)),
        TtsProviderKind::Mock => Arc::new(MockTts),
    }
}

pub fn estimated_duration_seconds(text: &str) -> f64 {
    let words = text.split_whitespace().count() as f64;
    words / WORDS_PER_MINUTE * 60.0
}

pub struct OpenAiTts {
    client: reqwest::Client,
    api_key: Option<String>,
    default_voice: String,
}

impl OpenAiTts {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: config.openai_api_key.clone(),
            default_voice: config.tts_default_voice.clone(),
        }
    }
}

#[async_trait]
impl TtsProvider for OpenAiTts {
    async fn generate(
        &self,
        text: &str,
        output_path: &Path,
        options: &TtsOptions,
    ) -> Result<TtsResult> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| AppError::Unavailable("OPENAI_API_KEY not configured".to_string()))?;

        let voice = options.voice.clone().unwrap_or_else(|| self.default_voice.clone());
        let body = serde_json::json!({
            "model": options.model.clone().unwrap_or_else(|| "tts-1".to_string()),
            "voice": voice,
            "input": text,
            "speed": options.speed.unwrap_or(1.0),
            "response_format": "mp3",
        });

        let response = self
            .client
            .post(OPENAI_SPEECH_URL)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::HttpStatus { service: "tts", status, body });
        }

        let bytes = response.bytes().await?;
        if let Some(parent) = output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(output_path, &bytes).await?;
        debug!("TTS wrote {} bytes to {}", bytes.len(), output_path.display());

        Ok(TtsResult {
            audio_path: output_path.to_path_buf(),
            duration: estimated_duration_seconds(text),
            format: "mp3".to_string(),
        })
    }

    fn voices(&self) -> Vec<String> {
        ["alloy", "echo", "fable", "onyx", "nova", "shimmer"]
            .iter()
            .map(|v| v.to_string())
            .collect()
    }
}

/// Deterministic test backend: writes a placeholder file and reports the
/// word-count duration estimate.
pub struct MockTts;

#[async_trait]
impl TtsProvider for MockTts {
    async fn generate(
        &self,
        text: &str,
        output_path: &Path,
        _options: &TtsOptions,
    ) -> Result<TtsResult> {
        if let Some(parent) = output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(output_path, text.as_bytes()).await?;

        Ok(TtsResult {
            audio_path: output_path.to_path_buf(),
            duration: estimated_duration_seconds(text),
            format: "mp3".to_string(),
        })
    }

    fn voices(&self) -> Vec<String> {
        vec!["mock".to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_estimate_tracks_word_count() {
        // 150 words at 150 wpm is one minute.
        let minute = vec!["word"; 150].join(" ");
        assert!((estimated_duration_seconds(&minute) - 60.0).abs() < 1e-9);
        assert_eq!(estimated_duration_seconds(""), 0.0);
    }

    #[tokio::test]
    async fn mock_backend_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("narrator_intro.mp3");

        let first = MockTts
            .generate("twenty five words of narration", &out, &TtsOptions::default())
            .await
            .unwrap();
        let second = MockTts
            .generate("twenty five words of narration", &out, &TtsOptions::default())
            .await
            .unwrap();

        assert!(out.exists());
        assert_eq!(first, second);
        assert!((first.duration - 5.0 / 150.0 * 60.0).abs() < 1e-9);
    }
}
