//! Streamed HTTP downloads for episode audio. Podcast CDNs flake, so every
//! download gets a small retry budget with exponential backoff and a
//! wall-clock ceiling per attempt.

use crate::config::Config;
use crate::error::{AppError, Result};
use futures::StreamExt;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Identifies the service to podcast hosts.
pub const USER_AGENT: &str = "sifter/0.1 (podcast digest pipeline)";

const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct Downloader {
    client: reqwest::Client,
    timeout: Duration,
}

impl Downloader {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent(USER_AGENT)
                .redirect(reqwest::redirect::Policy::limited(10))
                .build()
                .expect("reqwest client construction is infallible with these options"),
            timeout: config.download_timeout,
        }
    }

    /// Download `url` to `dest` with streamed writes. Returns the byte
    /// length written. Retries transient failures up to three attempts
    /// with 1s/2s/4s backoff.
    pub async fn download_to(&self, url: &str, dest: &Path) -> Result<u64> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut last_error = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match tokio::time::timeout(self.timeout, self.attempt(url, dest)).await {
                Ok(Ok(bytes)) => {
                    debug!("Downloaded {} ({} bytes, attempt {})", url, bytes, attempt);
                    return Ok(bytes);
                }
                Ok(Err(e)) => {
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    warn!("Download attempt {}/{} for {} failed: {}", attempt, MAX_ATTEMPTS, url, e);
                    last_error = Some(e);
                }
                Err(_) => {
                    warn!(
                        "Download attempt {}/{} for {} timed out after {:?}",
                        attempt, MAX_ATTEMPTS, url, self.timeout
                    );
                    last_error = Some(AppError::Transport(format!(
                        "download of {} exceeded {:?}",
                        url, self.timeout
                    )));
                }
            }

            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
        }

        Err(last_error.unwrap_or_else(|| AppError::Transport(format!("download of {} failed", url))))
    }

    async fn attempt(&self, url: &str, dest: &Path) -> Result<u64> {
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::HttpStatus {
                service: "download",
                status,
                body,
            });
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        Ok(written)
    }
}

/// 1s, 2s, 4s for attempts 1, 2, 3.
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1 << (attempt - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
    }
}
