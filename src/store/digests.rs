#![allow(dead_code)]

use crate::error::{AppError, Result};
use crate::models::{Digest, DigestClip, DigestClipRow, DigestStatus};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sqlx::PgPool;
use uuid::Uuid;

pub async fn get(db: &PgPool, id: Uuid) -> Result<Digest> {
    sqlx::query_as::<_, Digest>("SELECT * FROM digests WHERE id = $1")
        .bind(id)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Digest {} not found", id)))
}

pub async fn create(
    db: &PgPool,
    user_id: Uuid,
    podcast_id: Option<Uuid>,
    episode_ids: &[Uuid],
    status: DigestStatus,
) -> Result<Digest> {
    let digest = sqlx::query_as::<_, Digest>(
        "INSERT INTO digests (user_id, podcast_id, episode_ids, status)
         VALUES ($1, $2, $3, $4)
         RETURNING *",
    )
    .bind(user_id)
    .bind(podcast_id)
    .bind(sqlx::types::Json(episode_ids))
    .bind(status.as_str())
    .fetch_one(db)
    .await?;

    Ok(digest)
}

pub async fn transition(
    db: &PgPool,
    id: Uuid,
    prev: &[DigestStatus],
    next: DigestStatus,
) -> Result<bool> {
    let prev: Vec<String> = prev.iter().map(|s| s.as_str().to_string()).collect();

    let result = sqlx::query(
        "UPDATE digests SET status = $1, updated_at = NOW()
         WHERE id = $2 AND status = ANY($3)",
    )
    .bind(next.as_str())
    .bind(id)
    .bind(prev)
    .execute(db)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn set_status(db: &PgPool, id: Uuid, status: DigestStatus) -> Result<()> {
    sqlx::query("UPDATE digests SET status = $1, updated_at = NOW() WHERE id = $2")
        .bind(status.as_str())
        .bind(id)
        .execute(db)
        .await?;

    Ok(())
}

/// Persist (or clear, with None) the serialized narrator script.
pub async fn set_script(db: &PgPool, id: Uuid, script_json: Option<&str>) -> Result<()> {
    sqlx::query("UPDATE digests SET narrator_script = $1, updated_at = NOW() WHERE id = $2")
        .bind(script_json)
        .bind(id)
        .execute(db)
        .await?;

    Ok(())
}

/// Final publish: audio handle, estimated duration, `ready`.
pub async fn publish(db: &PgPool, id: Uuid, audio_url: &str, duration_seconds: f64) -> Result<()> {
    sqlx::query(
        "UPDATE digests
         SET audio_url = $1, duration_seconds = $2, status = 'ready', updated_at = NOW()
         WHERE id = $3",
    )
    .bind(audio_url)
    .bind(duration_seconds)
    .bind(id)
    .execute(db)
    .await?;

    Ok(())
}

/// Replace the digest's clip associations with the given playback order.
pub async fn replace_clips(
    db: &PgPool,
    digest_id: Uuid,
    ordered_clip_ids: &[Uuid],
) -> Result<Vec<DigestClip>> {
    let mut tx = db.begin().await?;

    sqlx::query("DELETE FROM digest_clips WHERE digest_id = $1")
        .bind(digest_id)
        .execute(&mut *tx)
        .await?;

    let mut inserted = Vec::with_capacity(ordered_clip_ids.len());
    for (position, clip_id) in ordered_clip_ids.iter().enumerate() {
        let row = sqlx::query_as::<_, DigestClip>(
            "INSERT INTO digest_clips (digest_id, clip_id, position)
             VALUES ($1, $2, $3)
             RETURNING *",
        )
        .bind(digest_id)
        .bind(clip_id)
        .bind(position as i32)
        .fetch_one(&mut *tx)
        .await?;
        inserted.push(row);
    }

    tx.commit().await?;

    Ok(inserted)
}

pub async fn clip_count(db: &PgPool, digest_id: Uuid) -> Result<i64> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM digest_clips WHERE digest_id = $1")
            .bind(digest_id)
            .fetch_one(db)
            .await?;

    Ok(count)
}

/// The digest's clips joined through to episode and podcast, in playback
/// order.
pub async fn clips_in_order(db: &PgPool, digest_id: Uuid) -> Result<Vec<DigestClipRow>> {
    let rows = sqlx::query_as::<_, DigestClipRow>(
        "SELECT dc.clip_id, dc.position, c.episode_id, c.start_time, c.end_time,
                c.duration, c.summary, e.audio_url,
                e.title AS episode_title, p.title AS podcast_title
         FROM digest_clips dc
         JOIN clips c ON c.id = dc.clip_id
         JOIN episodes e ON e.id = c.episode_id
         JOIN podcasts p ON p.id = e.podcast_id
         WHERE dc.digest_id = $1
         ORDER BY dc.position ASC",
    )
    .bind(digest_id)
    .fetch_all(db)
    .await?;

    Ok(rows)
}

/// Mark the digest public, minting a share token on first use.
pub async fn make_public(db: &PgPool, id: Uuid) -> Result<String> {
    let digest = get(db, id).await?;
    if let Some(share_id) = digest.share_id {
        sqlx::query("UPDATE digests SET is_public = TRUE, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(db)
            .await?;
        return Ok(share_id);
    }

    let share_id: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();

    sqlx::query("UPDATE digests SET is_public = TRUE, share_id = $1, updated_at = NOW() WHERE id = $2")
        .bind(&share_id)
        .bind(id)
        .execute(db)
        .await?;

    Ok(share_id)
}
