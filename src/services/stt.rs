//! STT Adapter
//!
//! Uniform speech-to-text interface with segment timestamps. Two paths: a
//! remote OpenAI-compatible transcription API, and a local whisper.cpp
//! binary. Neither path chunks input; the transcription stage owns sizing.

use crate::config::{Config, SttMode};
use crate::error::{AppError, Result};
use crate::models::TranscriptSegment;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tokio::process::Command;
use tracing::debug;

const OPENAI_TRANSCRIPTION_URL: &str = "https://api.openai.com/v1/audio/transcriptions";

#[derive(Debug, Clone, Default)]
pub struct SttOptions {
    /// Pin the language instead of letting the model detect it. The
    /// transcription stage pins chunks 2..N to chunk 1's detection.
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SttResult {
    pub text: String,
    /// Timestamps in seconds relative to the input file's start.
    pub segments: Vec<TranscriptSegment>,
    pub language: Option<String>,
    pub duration: Option<f64>,
}

#[async_trait]
pub trait SttProvider: Send + Sync {
    async fn transcribe(&self, path: &Path, options: &SttOptions) -> Result<SttResult>;
}

pub fn build_stt(config: &Config) -> Arc<dyn SttProvider> {
    match config.stt_mode {
        SttMode::Api => Arc::new(ApiStt::new(config)),
        SttMode::Local => Arc::new(LocalWhisper::new(config)),
    }
}

/// Remote OpenAI-compatible `audio/transcriptions` endpoint.
pub struct ApiStt {
    client: reqwest::Client,
    api_key: Option<String>,
    model: String,
}

impl ApiStt {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: config.openai_api_key.clone(),
            model: config.stt_model.clone(),
        }
    }
}

#[async_trait]
impl SttProvider for ApiStt {
    async fn transcribe(&self, path: &Path, options: &SttOptions) -> Result<SttResult> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| AppError::Unavailable("OPENAI_API_KEY not configured".to_string()))?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "audio.mp3".to_string());
        let bytes = tokio::fs::read(path).await?;

        let mut form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(bytes)
                    .file_name(file_name)
                    .mime_str("audio/mpeg")
                    .map_err(|e| AppError::Parse(e.to_string()))?,
            )
            .text("model", self.model.clone())
            .text("response_format", "verbose_json");

        if let Some(language) = &options.language {
            form = form.text("language", language.clone());
        }

        let response = self
            .client
            .post(OPENAI_TRANSCRIPTION_URL)
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::HttpStatus { service: "stt", status, body });
        }

        let raw = response.text().await?;
        parse_verbose_json(&raw)
    }
}

/// Local whisper.cpp invocation. Writes a JSON sidecar next to the input
/// and reads it back.
pub struct LocalWhisper {
    binary: String,
    model_path: Option<String>,
}

impl LocalWhisper {
    pub fn new(config: &Config) -> Self {
        Self {
            binary: config.whisper_binary.clone(),
            model_path: config.whisper_model_path.clone(),
        }
    }
}

#[async_trait]
impl SttProvider for LocalWhisper {
    async fn transcribe(&self, path: &Path, options: &SttOptions) -> Result<SttResult> {
        let output_prefix = path.with_extension("");

        let mut cmd = Command::new(&self.binary);
        if let Some(model) = &self.model_path {
            cmd.arg("-m").arg(model);
        }
        cmd.arg("-f").arg(path);
        cmd.arg("--output-json");
        cmd.arg("--output-file").arg(&output_prefix);
        cmd.arg("-l")
            .arg(options.language.as_deref().unwrap_or("auto"));

        debug!("Running local whisper on {}", path.display());
        let output = cmd
            .output()
            .await
            .map_err(|e| AppError::Subprocess(format!("failed to spawn {}: {}", self.binary, e)))?;

        if !output.status.success() {
            return Err(AppError::Subprocess(format!(
                "whisper exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let sidecar = output_prefix.with_extension("json");
        let raw = tokio::fs::read_to_string(&sidecar).await?;
        let result = parse_whisper_cpp_json(&raw);
        let _ = tokio::fs::remove_file(&sidecar).await;
        result
    }
}

#[derive(Debug, Deserialize)]
struct VerboseJsonResponse {
    text: String,
    language: Option<String>,
    duration: Option<f64>,
    #[serde(default)]
    segments: Vec<VerboseJsonSegment>,
}

#[derive(Debug, Deserialize)]
struct VerboseJsonSegment {
    start: f64,
    end: f64,
    text: String,
}

fn parse_verbose_json(raw: &str) -> Result<SttResult> {
    let parsed: VerboseJsonResponse = serde_json::from_str(raw)
        .map_err(|e| AppError::Parse(format!("unreadable STT response: {}", e)))?;

    Ok(SttResult {
        text: parsed.text.trim().to_string(),
        segments: parsed
            .segments
            .into_iter()
            .map(|s| TranscriptSegment {
                start: s.start,
                end: s.end,
                text: s.text.trim().to_string(),
            })
            .collect(),
        language: parsed.language,
        duration: parsed.duration,
    })
}

#[derive(Debug, Deserialize)]
struct WhisperCppJson {
    result: Option<WhisperCppResult>,
    #[serde(default)]
    transcription: Vec<WhisperCppSegment>,
}

#[derive(Debug, Deserialize)]
struct WhisperCppResult {
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WhisperCppSegment {
    offsets: WhisperCppOffsets,
    text: String,
}

#[derive(Debug, Deserialize)]
struct WhisperCppOffsets {
    from: u64,
    to: u64,
}

fn parse_whisper_cpp_json(raw: &str) -> Result<SttResult> {
    let parsed: WhisperCppJson = serde_json::from_str(raw)
        .map_err(|e| AppError::Parse(format!("unreadable whisper.cpp output: {}", e)))?;

    let segments: Vec<TranscriptSegment> = parsed
        .transcription
        .into_iter()
        .map(|s| TranscriptSegment {
            // whisper.cpp reports millisecond offsets.
            start: s.offsets.from as f64 / 1000.0,
            end: s.offsets.to as f64 / 1000.0,
            text: s.text.trim().to_string(),
        })
        .collect();

    let duration = segments.last().map(|s| s.end);
    let text = segments
        .iter()
        .map(|s| s.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");

    Ok(SttResult {
        text,
        segments,
        language: parsed.result.and_then(|r| r.language),
        duration,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_json_parses() {
        let raw = r#"{
            "text": " Hello there. General Kenobi.",
            "language": "english",
            "duration": 4.2,
            "segments": [
                {"id": 0, "start": 0.0, "end": 2.0, "text": " Hello there."},
                {"id": 1, "start": 2.0, "end": 4.2, "text": " General Kenobi."}
            ]
        }"#;
        let result = parse_verbose_json(raw).unwrap();
        assert_eq!(result.text, "Hello there. General Kenobi.");
        assert_eq!(result.segments.len(), 2);
        assert_eq!(result.segments[1].start, 2.0);
        assert_eq!(result.segments[1].text, "General Kenobi.");
        assert_eq!(result.duration, Some(4.2));
    }

    #[test]
    fn whisper_cpp_offsets_convert_to_seconds() {
        let raw = r#"{
            "result": {"language": "en"},
            "transcription": [
                {"offsets": {"from": 0, "to": 1500}, "text": " First bit."},
                {"offsets": {"from": 1500, "to": 4250}, "text": " Second bit."}
            ]
        }"#;
        let result = parse_whisper_cpp_json(raw).unwrap();
        assert_eq!(result.segments[0].end, 1.5);
        assert_eq!(result.segments[1].start, 1.5);
        assert_eq!(result.segments[1].end, 4.25);
        assert_eq!(result.language.as_deref(), Some("en"));
        assert_eq!(result.duration, Some(4.25));
        assert_eq!(result.text, "First bit. Second bit.");
    }
}
