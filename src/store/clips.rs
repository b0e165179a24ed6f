use crate::error::Result;
use crate::models::{Clip, ClipCandidate, NewClip};
use sqlx::PgPool;
use uuid::Uuid;

pub async fn for_episode(db: &PgPool, episode_id: Uuid) -> Result<Vec<Clip>> {
    let clips = sqlx::query_as::<_, Clip>(
        "SELECT * FROM clips WHERE episode_id = $1 ORDER BY relevance_score DESC",
    )
    .bind(episode_id)
    .fetch_all(db)
    .await?;

    Ok(clips)
}

/// Replace the episode's clip set wholesale. The delete and inserts share a
/// transaction so a crash cannot leave a half-replaced set.
pub async fn replace_for_episode(
    db: &PgPool,
    episode_id: Uuid,
    clips: &[NewClip],
) -> Result<Vec<Clip>> {
    let mut tx = db.begin().await?;

    sqlx::query("DELETE FROM clips WHERE episode_id = $1")
        .bind(episode_id)
        .execute(&mut *tx)
        .await?;

    let mut inserted = Vec::with_capacity(clips.len());
    for clip in clips {
        let row = sqlx::query_as::<_, Clip>(
            "INSERT INTO clips
                 (episode_id, start_time, end_time, duration, transcript,
                  relevance_score, reasoning, summary)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING *",
        )
        .bind(clip.episode_id)
        .bind(clip.start_time)
        .bind(clip.end_time)
        .bind(clip.end_time - clip.start_time)
        .bind(&clip.transcript)
        .bind(clip.relevance_score)
        .bind(&clip.reasoning)
        .bind(&clip.summary)
        .fetch_one(&mut *tx)
        .await?;
        inserted.push(row);
    }

    tx.commit().await?;

    Ok(inserted)
}

/// Curation candidates: every clip of the given episodes with its episode
/// and podcast titles, best-scored first.
pub async fn candidates_for_episodes(
    db: &PgPool,
    episode_ids: &[Uuid],
) -> Result<Vec<ClipCandidate>> {
    let candidates = sqlx::query_as::<_, ClipCandidate>(
        "SELECT c.id, c.episode_id, c.start_time, c.end_time, c.duration,
                c.transcript, c.relevance_score, c.summary,
                e.title AS episode_title, p.title AS podcast_title
         FROM clips c
         JOIN episodes e ON e.id = c.episode_id
         JOIN podcasts p ON p.id = e.podcast_id
         WHERE c.episode_id = ANY($1)
         ORDER BY c.relevance_score DESC",
    )
    .bind(episode_ids)
    .fetch_all(db)
    .await?;

    Ok(candidates)
}

/// Point the adopted clips back at their digest.
pub async fn set_digest(db: &PgPool, clip_ids: &[Uuid], digest_id: Uuid) -> Result<()> {
    sqlx::query("UPDATE clips SET digest_id = $1 WHERE id = ANY($2)")
        .bind(digest_id)
        .bind(clip_ids)
        .execute(db)
        .await?;

    Ok(())
}
