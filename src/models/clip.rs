use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A contiguous sub-interval of an episode's audio selected by analysis.
/// One canonical clip set exists per episode; re-analysis replaces it
/// wholesale.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Clip {
    pub id: Uuid,
    pub episode_id: Uuid,
    pub start_time: f64,
    pub end_time: f64,
    pub duration: f64,
    /// Text of the transcript segments covering [start_time, end_time].
    pub transcript: String,
    /// Combined topic-match x depth metric, 0-100.
    pub relevance_score: i32,
    pub reasoning: String,
    pub summary: String,
    /// Back-reference to the digest that adopted this clip, if any.
    pub digest_id: Option<Uuid>,
}

/// Insert shape for the bulk clip replacement performed by analysis.
#[derive(Debug, Clone)]
pub struct NewClip {
    pub episode_id: Uuid,
    pub start_time: f64,
    pub end_time: f64,
    pub transcript: String,
    pub relevance_score: i32,
    pub reasoning: String,
    pub summary: String,
}

/// Clip joined with its episode and podcast titles, as curation sees it.
#[derive(Debug, Clone, FromRow)]
pub struct ClipCandidate {
    pub id: Uuid,
    pub episode_id: Uuid,
    pub start_time: f64,
    pub end_time: f64,
    pub duration: f64,
    pub transcript: String,
    pub relevance_score: i32,
    pub summary: String,
    pub episode_title: String,
    pub podcast_title: String,
}
