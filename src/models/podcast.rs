use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Podcast {
    pub id: Uuid,
    pub rss_url: String,
    pub title: String,
    pub author: Option<String>,
    pub image_url: Option<String>,
    /// Set by the RSS ingester each time the feed is polled.
    pub last_checked_at: Option<DateTime<Utc>>,
}
