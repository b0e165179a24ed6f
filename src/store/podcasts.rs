#![allow(dead_code)]

use crate::error::{AppError, Result};
use crate::models::Podcast;
use sqlx::PgPool;
use uuid::Uuid;

pub async fn get(db: &PgPool, id: Uuid) -> Result<Podcast> {
    sqlx::query_as::<_, Podcast>("SELECT * FROM podcasts WHERE id = $1")
        .bind(id)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Podcast {} not found", id)))
}

/// Stamp the feed-poll time. Called by the RSS ingester after each check.
pub async fn touch_last_checked(db: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query("UPDATE podcasts SET last_checked_at = NOW() WHERE id = $1")
        .bind(id)
        .execute(db)
        .await?;

    Ok(())
}
