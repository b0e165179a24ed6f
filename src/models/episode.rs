use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Pipeline state of a single episode. Transitions are strictly forward via
/// conditional row updates; `failed` episodes may be reset to `pending`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum EpisodeStatus {
    #[sqlx(rename = "pending")]
    Pending,
    #[sqlx(rename = "downloading")]
    Downloading,
    #[sqlx(rename = "transcribing")]
    Transcribing,
    #[sqlx(rename = "transcribed")]
    Transcribed,
    #[sqlx(rename = "analyzing")]
    Analyzing,
    #[sqlx(rename = "analyzed")]
    Analyzed,
    #[sqlx(rename = "failed")]
    Failed,
}

impl EpisodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpisodeStatus::Pending => "pending",
            EpisodeStatus::Downloading => "downloading",
            EpisodeStatus::Transcribing => "transcribing",
            EpisodeStatus::Transcribed => "transcribed",
            EpisodeStatus::Analyzing => "analyzing",
            EpisodeStatus::Analyzed => "analyzed",
            EpisodeStatus::Failed => "failed",
        }
    }

    /// True while a worker may still be mutating this episode.
    pub fn is_processing(&self) -> bool {
        matches!(
            self,
            EpisodeStatus::Pending
                | EpisodeStatus::Downloading
                | EpisodeStatus::Transcribing
                | EpisodeStatus::Transcribed
                | EpisodeStatus::Analyzing
        )
    }
}

/// A single speech-to-text unit. Times are seconds relative to the
/// original episode audio.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Canonical timestamped transcript, persisted once per episode and shared
/// by every user's analysis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub segments: Vec<TranscriptSegment>,
    pub language: String,
    pub duration: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Episode {
    pub id: Uuid,
    pub podcast_id: Uuid,
    /// RSS item guid, unique within a podcast.
    pub guid: String,
    pub title: String,
    pub audio_url: String,
    pub published_at: DateTime<Utc>,
    pub duration_seconds: Option<f64>,
    pub status: EpisodeStatus,
    pub transcript: Option<sqlx::types::Json<Transcript>>,
}

impl Episode {
    pub fn transcript(&self) -> Option<&Transcript> {
        self.transcript.as_ref().map(|j| &j.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processing_states() {
        assert!(EpisodeStatus::Pending.is_processing());
        assert!(EpisodeStatus::Transcribed.is_processing());
        assert!(!EpisodeStatus::Analyzed.is_processing());
        assert!(!EpisodeStatus::Failed.is_processing());
    }

    #[test]
    fn transcript_round_trips_through_json() {
        let t = Transcript {
            text: "hello world".to_string(),
            segments: vec![TranscriptSegment {
                start: 0.0,
                end: 2.5,
                text: "hello world".to_string(),
            }],
            language: "en".to_string(),
            duration: 2.5,
        };
        let encoded = serde_json::to_string(&t).unwrap();
        let decoded: Transcript = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, t);
    }
}
