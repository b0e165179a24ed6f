#![allow(dead_code)]

use crate::error::{AppError, Result};
use crate::models::{Episode, EpisodeStatus, Transcript};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

/// Feed-side insert. Episodes are keyed by `(podcast_id, guid)`; a
/// re-polled item refreshes metadata without disturbing pipeline state.
pub async fn upsert_from_feed(
    db: &PgPool,
    podcast_id: Uuid,
    guid: &str,
    title: &str,
    audio_url: &str,
    published_at: DateTime<Utc>,
    duration_seconds: Option<f64>,
) -> Result<Episode> {
    let episode = sqlx::query_as::<_, Episode>(
        "INSERT INTO episodes (podcast_id, guid, title, audio_url, published_at, duration_seconds)
         VALUES ($1, $2, $3, $4, $5, $6)
         ON CONFLICT (podcast_id, guid) DO UPDATE SET
             title = EXCLUDED.title,
             audio_url = EXCLUDED.audio_url,
             published_at = EXCLUDED.published_at,
             duration_seconds = COALESCE(EXCLUDED.duration_seconds, episodes.duration_seconds)
         RETURNING *",
    )
    .bind(podcast_id)
    .bind(guid)
    .bind(title)
    .bind(audio_url)
    .bind(published_at)
    .bind(duration_seconds)
    .fetch_one(db)
    .await?;

    Ok(episode)
}

pub async fn get(db: &PgPool, id: Uuid) -> Result<Episode> {
    sqlx::query_as::<_, Episode>("SELECT * FROM episodes WHERE id = $1")
        .bind(id)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Episode {} not found", id)))
}

pub async fn get_many(db: &PgPool, ids: &[Uuid]) -> Result<Vec<Episode>> {
    let episodes = sqlx::query_as::<_, Episode>("SELECT * FROM episodes WHERE id = ANY($1)")
        .bind(ids)
        .fetch_all(db)
        .await?;

    Ok(episodes)
}

/// Episodes from the user's subscribed podcasts published at or after
/// `since`, newest first.
pub async fn recent_for_user(
    db: &PgPool,
    user_id: Uuid,
    since: DateTime<Utc>,
) -> Result<Vec<Episode>> {
    let episodes = sqlx::query_as::<_, Episode>(
        "SELECT e.* FROM episodes e
         JOIN subscriptions s ON s.podcast_id = e.podcast_id
         WHERE s.user_id = $1 AND e.published_at >= $2
         ORDER BY e.published_at DESC",
    )
    .bind(user_id)
    .bind(since)
    .fetch_all(db)
    .await?;

    Ok(episodes)
}

/// Atomically move the episode from one of `prev` to `next`. Returns false
/// when the row was not in an accepted state, which means another worker
/// got there first.
pub async fn transition(
    db: &PgPool,
    id: Uuid,
    prev: &[EpisodeStatus],
    next: EpisodeStatus,
) -> Result<bool> {
    let prev: Vec<String> = prev.iter().map(|s| s.as_str().to_string()).collect();

    let result = sqlx::query("UPDATE episodes SET status = $1 WHERE id = $2 AND status = ANY($3)")
        .bind(next.as_str())
        .bind(id)
        .bind(prev)
        .execute(db)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Unconditional failure mark, used when a stage handler unwinds.
pub async fn set_failed(db: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query("UPDATE episodes SET status = 'failed' WHERE id = $1")
        .bind(id)
        .execute(db)
        .await?;

    Ok(())
}

/// Persist the merged transcript and flip to `transcribed` in one write.
pub async fn set_transcript(db: &PgPool, id: Uuid, transcript: &Transcript) -> Result<()> {
    sqlx::query(
        "UPDATE episodes
         SET transcript = $1, duration_seconds = $2, status = 'transcribed'
         WHERE id = $3",
    )
    .bind(sqlx::types::Json(transcript))
    .bind(transcript.duration)
    .bind(id)
    .execute(db)
    .await?;

    Ok(())
}
