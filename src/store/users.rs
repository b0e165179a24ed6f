#![allow(dead_code)]

use crate::error::{AppError, Result};
use crate::models::User;
use sqlx::PgPool;
use uuid::Uuid;

pub async fn get(db: &PgPool, id: Uuid) -> Result<User> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
        .bind(id)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("User {} not found", id)))
}

/// Idempotent subscribe; re-subscribing is a no-op.
pub async fn subscribe(db: &PgPool, user_id: Uuid, podcast_id: Uuid) -> Result<()> {
    sqlx::query(
        "INSERT INTO subscriptions (user_id, podcast_id) VALUES ($1, $2)
         ON CONFLICT (user_id, podcast_id) DO NOTHING",
    )
    .bind(user_id)
    .bind(podcast_id)
    .execute(db)
    .await?;

    Ok(())
}

pub async fn unsubscribe(db: &PgPool, user_id: Uuid, podcast_id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM subscriptions WHERE user_id = $1 AND podcast_id = $2")
        .bind(user_id)
        .bind(podcast_id)
        .execute(db)
        .await?;

    Ok(())
}

/// Podcast ids the user is subscribed to.
pub async fn subscribed_podcast_ids(db: &PgPool, user_id: Uuid) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> =
        sqlx::query_as("SELECT podcast_id FROM subscriptions WHERE user_id = $1")
            .bind(user_id)
            .fetch_all(db)
            .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}
