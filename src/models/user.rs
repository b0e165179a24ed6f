use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "snake_case")]
pub enum DigestFrequency {
    #[sqlx(rename = "daily")]
    Daily,
    #[sqlx(rename = "weekly")]
    Weekly,
}

impl DigestFrequency {
    /// Window of episode publish dates a digest run considers.
    pub fn lookback(&self) -> chrono::Duration {
        match self {
            DigestFrequency::Daily => chrono::Duration::hours(24),
            DigestFrequency::Weekly => chrono::Duration::days(7),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DigestFrequency::Daily => "daily",
            DigestFrequency::Weekly => "weekly",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    /// Free-text topic tags, e.g. "machine learning", "startup finance".
    #[sqlx(json)]
    pub interests: Vec<String>,
    pub frequency: DigestFrequency,
    pub digest_duration_minutes: i32,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookback_windows() {
        assert_eq!(DigestFrequency::Daily.lookback(), chrono::Duration::hours(24));
        assert_eq!(DigestFrequency::Weekly.lookback(), chrono::Duration::days(7));
    }
}
