//! Queue Substrate
//!
//! Named durable queues on Redis with at-least-once delivery, per-key
//! dedup, and retries with exponential backoff. Layout per queue:
//!
//!   sifter:q:{queue}:waiting    list of ready job ids (FIFO)
//!   sifter:q:{queue}:delayed    zset of job ids scored by ready-at millis
//!   sifter:q:{queue}:job:{id}   hash holding payload and bookkeeping
//!   sifter:q:{queue}:dedup:{k}  guard key held while a keyed job is live
//!
//! Retried jobs re-enter through the delayed zset, so FIFO holds only for
//! first deliveries. Nothing orders jobs across queues.

use crate::error::{AppError, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const KEY_PREFIX: &str = "sifter:q";
/// Completed/failed job hashes are kept around briefly for inspection.
const JOB_RETENTION_SECONDS: i64 = 24 * 60 * 60;
/// How long an idle worker sleeps before re-polling.
const POLL_INTERVAL: Duration = Duration::from_millis(1000);
/// How many due delayed jobs are promoted per poll.
const PROMOTE_BATCH: isize = 64;

#[derive(Debug, Clone)]
pub struct AddOpts {
    /// Dedup key: while a job added with this id is waiting, delayed or
    /// active, further adds with the same id are dropped.
    pub job_id: Option<String>,
    pub attempts: u32,
    pub backoff_delay_ms: u64,
}

impl Default for AddOpts {
    fn default() -> Self {
        Self {
            job_id: None,
            attempts: 3,
            backoff_delay_ms: 5000,
        }
    }
}

/// A claimed job, handed to a handler. Cloning is cheap; the connection
/// manager multiplexes.
#[derive(Clone)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub data: serde_json::Value,
    /// 1-based attempt number for the current delivery.
    pub attempts_made: u32,
    queue_name: String,
    redis: ConnectionManager,
}

impl Job {
    pub async fn update_progress(&self, pct: u8) -> Result<()> {
        let mut conn = self.redis.clone();
        let key = job_key(&self.queue_name, &self.id);
        conn.hset::<_, _, _, ()>(key, "progress", pct.min(100)).await?;
        Ok(())
    }

    pub fn log(&self, msg: &str) {
        info!("[{}:{}] {}", self.queue_name, self.id, msg);
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: Job) -> Result<serde_json::Value>;
}

#[derive(Clone)]
pub struct Queue {
    name: String,
    redis: ConnectionManager,
}

impl Queue {
    pub fn new(name: impl Into<String>, redis: ConnectionManager) -> Self {
        Self { name: name.into(), redis }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a job. Returns the internal job id, or None when a live job
    /// already holds the dedup key.
    pub async fn add<P: Serialize>(
        &self,
        job_name: &str,
        payload: &P,
        opts: AddOpts,
    ) -> Result<Option<String>> {
        let mut conn = self.redis.clone();

        if let Some(dedup) = &opts.job_id {
            let key = dedup_key(&self.name, dedup);
            let claimed: bool = redis::cmd("SET")
                .arg(&key)
                .arg("1")
                .arg("NX")
                .query_async::<_, Option<String>>(&mut conn)
                .await?
                .is_some();
            if !claimed {
                debug!("Dropping duplicate job {} on {}", dedup, self.name);
                return Ok(None);
            }
        }

        let id = Uuid::new_v4().to_string();
        let data = serde_json::to_string(payload)?;

        conn.hset_multiple::<_, _, _, ()>(
            job_key(&self.name, &id),
            &[
                ("name", job_name.to_string()),
                ("data", data),
                ("state", "waiting".to_string()),
                ("attempts_made", "0".to_string()),
                ("max_attempts", opts.attempts.max(1).to_string()),
                ("backoff_ms", opts.backoff_delay_ms.to_string()),
                ("progress", "0".to_string()),
                ("dedup", opts.job_id.clone().unwrap_or_default()),
            ],
        )
        .await?;
        conn.rpush::<_, _, ()>(waiting_key(&self.name), &id).await?;

        debug!("Enqueued {} job {} ({})", self.name, id, job_name);
        Ok(Some(id))
    }

    /// Move due delayed jobs back onto the waiting list.
    async fn promote_due(&self) -> Result<()> {
        let mut conn = self.redis.clone();
        let now = chrono::Utc::now().timestamp_millis();

        let due: Vec<String> = conn
            .zrangebyscore_limit(delayed_key(&self.name), 0i64, now, 0, PROMOTE_BATCH)
            .await?;

        for id in due {
            let removed: i64 = conn.zrem(delayed_key(&self.name), &id).await?;
            if removed > 0 {
                conn.hset::<_, _, _, ()>(job_key(&self.name, &id), "state", "waiting").await?;
                conn.rpush::<_, _, ()>(waiting_key(&self.name), &id).await?;
            }
        }
        Ok(())
    }

    /// Pop the next ready job and mark it active. None when the queue is
    /// idle.
    async fn claim_next(&self) -> Result<Option<Job>> {
        let mut conn = self.redis.clone();

        let id: Option<String> = conn.lpop(waiting_key(&self.name), None).await?;
        let Some(id) = id else { return Ok(None) };

        let key = job_key(&self.name, &id);
        let fields: std::collections::HashMap<String, String> = conn.hgetall(&key).await?;
        if fields.is_empty() {
            warn!("Job {} on {} has no backing hash, dropping", id, self.name);
            return Ok(None);
        }

        let attempts_made: u32 = fields
            .get("attempts_made")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
            + 1;

        conn.hset_multiple::<_, _, _, ()>(
            &key,
            &[
                ("state", "active".to_string()),
                ("attempts_made", attempts_made.to_string()),
            ],
        )
        .await?;

        let data = fields
            .get("data")
            .map(|d| serde_json::from_str(d))
            .transpose()?
            .unwrap_or(serde_json::Value::Null);

        Ok(Some(Job {
            id,
            name: fields.get("name").cloned().unwrap_or_default(),
            data,
            attempts_made,
            queue_name: self.name.clone(),
            redis: self.redis.clone(),
        }))
    }

    async fn complete(&self, job: &Job, result: &serde_json::Value) -> Result<()> {
        let mut conn = self.redis.clone();
        let key = job_key(&self.name, &job.id);

        conn.hset_multiple::<_, _, _, ()>(
            &key,
            &[
                ("state", "completed".to_string()),
                ("result", serde_json::to_string(result)?),
                ("progress", "100".to_string()),
            ],
        )
        .await?;
        conn.expire::<_, ()>(&key, JOB_RETENTION_SECONDS).await?;
        self.release_dedup(job).await?;
        Ok(())
    }

    /// Retry with backoff while attempts remain and the error is
    /// retryable; otherwise surface the job as failed.
    async fn fail(&self, job: &Job, err: &AppError) -> Result<()> {
        let mut conn = self.redis.clone();
        let key = job_key(&self.name, &job.id);

        let fields: std::collections::HashMap<String, String> = conn.hgetall(&key).await?;
        let max_attempts: u32 = fields
            .get("max_attempts")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);
        let backoff_ms: u64 = fields
            .get("backoff_ms")
            .and_then(|v| v.parse().ok())
            .unwrap_or(5000);

        if should_retry(err, job.attempts_made, max_attempts) {
            let delay = retry_delay_ms(backoff_ms, job.attempts_made);
            let ready_at = chrono::Utc::now().timestamp_millis() + delay as i64;

            warn!(
                "Job {} on {} failed (attempt {}/{}), retrying in {} ms: {}",
                job.id, self.name, job.attempts_made, max_attempts, delay, err
            );
            conn.hset_multiple::<_, _, _, ()>(
                &key,
                &[("state", "delayed".to_string()), ("error", err.to_string())],
            )
            .await?;
            conn.zadd::<_, _, _, ()>(delayed_key(&self.name), &job.id, ready_at).await?;
        } else {
            error!(
                "Job {} on {} failed permanently after {} attempts: {}",
                job.id, self.name, job.attempts_made, err
            );
            conn.hset_multiple::<_, _, _, ()>(
                &key,
                &[("state", "failed".to_string()), ("error", err.to_string())],
            )
            .await?;
            conn.expire::<_, ()>(&key, JOB_RETENTION_SECONDS).await?;
            self.release_dedup(job).await?;
        }
        Ok(())
    }

    async fn release_dedup(&self, job: &Job) -> Result<()> {
        let mut conn = self.redis.clone();
        let dedup: Option<String> = conn.hget(job_key(&self.name, &job.id), "dedup").await?;
        if let Some(dedup) = dedup {
            if !dedup.is_empty() {
                conn.del::<_, ()>(dedup_key(&self.name, &dedup)).await?;
            }
        }
        Ok(())
    }
}

/// Per-queue worker pool. `run` drives the claim loop until shutdown
/// flips, then drains in-flight jobs.
pub struct Worker {
    queue: Queue,
    handler: Arc<dyn JobHandler>,
    concurrency: usize,
}

impl Worker {
    pub fn new(queue: Queue, handler: Arc<dyn JobHandler>, concurrency: usize) -> Self {
        Self {
            queue,
            handler,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        info!(
            "Worker for queue '{}' started (concurrency {})",
            self.queue.name(),
            self.concurrency
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.queue.promote_due().await {
                warn!("Failed to promote delayed jobs on {}: {}", self.queue.name(), e);
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            match self.queue.claim_next().await {
                Ok(Some(job)) => {
                    let queue = self.queue.clone();
                    let handler = self.handler.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let outcome = handler.handle(job.clone()).await;
                        let bookkeeping = match &outcome {
                            Ok(result) => queue.complete(&job, result).await,
                            Err(e) => queue.fail(&job, e).await,
                        };
                        if let Err(e) = bookkeeping {
                            error!("Queue bookkeeping failed for job {}: {}", job.id, e);
                        }
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(POLL_INTERVAL) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    warn!("Failed to claim job on {}: {}", self.queue.name(), e);
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }

        // Drain: wait for every permit to come home.
        let _ = semaphore.acquire_many(self.concurrency as u32).await;
        info!("Worker for queue '{}' stopped", self.queue.name());
    }
}

/// Re-deliver while the error kind allows it and attempts remain. Kinds
/// with their own retry limit (parse failures retry once) tighten the
/// job's attempt budget rather than replace it.
fn should_retry(err: &AppError, attempts_made: u32, max_attempts: u32) -> bool {
    if !err.is_retryable() {
        return false;
    }
    let allowed_attempts = match err.retry_limit() {
        Some(retries) => max_attempts.min(retries + 1),
        None => max_attempts,
    };
    attempts_made < allowed_attempts
}

/// Doubles the base per failed attempt: 5s, 10s, 20s for the default base.
fn retry_delay_ms(base_ms: u64, attempts_made: u32) -> u64 {
    base_ms.saturating_mul(1u64 << (attempts_made.saturating_sub(1)).min(16))
}

fn waiting_key(queue: &str) -> String {
    format!("{}:{}:waiting", KEY_PREFIX, queue)
}

fn delayed_key(queue: &str) -> String {
    format!("{}:{}:delayed", KEY_PREFIX, queue)
}

fn job_key(queue: &str, id: &str) -> String {
    format!("{}:{}:job:{}", KEY_PREFIX, queue, id)
}

fn dedup_key(queue: &str, dedup: &str) -> String {
    format!("{}:{}:dedup:{}", KEY_PREFIX, queue, dedup)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_is_exponential() {
        assert_eq!(retry_delay_ms(5000, 1), 5000);
        assert_eq!(retry_delay_ms(5000, 2), 10000);
        assert_eq!(retry_delay_ms(5000, 3), 20000);
        assert_eq!(retry_delay_ms(1000, 1), 1000);
    }

    #[test]
    fn transient_errors_use_the_full_attempt_budget() {
        let err = AppError::Transport("connection reset".into());
        assert!(should_retry(&err, 1, 3));
        assert!(should_retry(&err, 2, 3));
        assert!(!should_retry(&err, 3, 3));
    }

    #[test]
    fn parse_errors_retry_once_then_fail() {
        let err = AppError::Parse("bad json".into());
        // First delivery failed: one retry is allowed.
        assert!(should_retry(&err, 1, 3));
        // The retry also failed to parse: done, despite budget remaining.
        assert!(!should_retry(&err, 2, 3));
    }

    #[test]
    fn fatal_errors_never_retry() {
        assert!(!should_retry(&AppError::NotFound("episode".into()), 1, 3));
        assert!(!should_retry(&AppError::Busy("claimed".into()), 1, 3));
    }

    #[test]
    fn retry_delay_saturates_instead_of_overflowing() {
        let delay = retry_delay_ms(u64::MAX / 2, 40);
        assert!(delay >= u64::MAX / 2);
    }

    #[test]
    fn keys_are_namespaced_per_queue() {
        assert_eq!(waiting_key("transcription"), "sifter:q:transcription:waiting");
        assert_eq!(delayed_key("digest"), "sifter:q:digest:delayed");
        assert_eq!(job_key("analysis", "abc"), "sifter:q:analysis:job:abc");
        assert_eq!(
            dedup_key("transcription", "transcription-42"),
            "sifter:q:transcription:dedup:transcription-42"
        );
    }
}
