use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum DigestStatus {
    #[sqlx(rename = "pending")]
    Pending,
    #[sqlx(rename = "curating")]
    Curating,
    #[sqlx(rename = "generating_script")]
    GeneratingScript,
    #[sqlx(rename = "generating_audio")]
    GeneratingAudio,
    #[sqlx(rename = "stitching")]
    Stitching,
    #[sqlx(rename = "ready")]
    Ready,
    #[sqlx(rename = "failed")]
    Failed,
}

impl DigestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestStatus::Pending => "pending",
            DigestStatus::Curating => "curating",
            DigestStatus::GeneratingScript => "generating_script",
            DigestStatus::GeneratingAudio => "generating_audio",
            DigestStatus::Stitching => "stitching",
            DigestStatus::Ready => "ready",
            DigestStatus::Failed => "failed",
        }
    }
}

/// The narration pieces wrapped around the clips, persisted as a JSON
/// string on the digest row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NarratorScript {
    pub intro: String,
    /// One per adjacent clip pair; length should equal clip count - 1.
    pub transitions: Vec<String>,
    pub outro: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Digest {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: DigestStatus,
    /// Primary source podcast, when one dominates.
    pub podcast_id: Option<Uuid>,
    #[sqlx(json)]
    pub episode_ids: Vec<Uuid>,
    /// Serialized NarratorScript.
    pub narrator_script: Option<String>,
    pub audio_url: Option<String>,
    pub duration_seconds: Option<f64>,
    pub is_public: bool,
    pub share_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Digest {
    pub fn script(&self) -> Option<NarratorScript> {
        self.narrator_script
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
    }
}

/// Playback-order association between a digest and its clips.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DigestClip {
    pub digest_id: Uuid,
    pub clip_id: Uuid,
    /// 0-based, contiguous per digest.
    pub position: i32,
}

/// DigestClip joined through to the clip and its episode/podcast, in
/// playback order, as assembly consumes it.
#[derive(Debug, Clone, FromRow)]
pub struct DigestClipRow {
    pub clip_id: Uuid,
    pub position: i32,
    pub episode_id: Uuid,
    pub start_time: f64,
    pub end_time: f64,
    pub duration: f64,
    pub summary: String,
    pub audio_url: String,
    pub episode_title: String,
    pub podcast_title: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_round_trips() {
        let script = NarratorScript {
            intro: "Welcome back.".to_string(),
            transitions: vec!["Next up".to_string()],
            outro: "That's all for today.".to_string(),
        };
        let encoded = serde_json::to_string(&script).unwrap();
        let decoded: NarratorScript = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, script);
    }
}
