//! The five pipeline stages and their shared plumbing. Stage bodies take a
//! `StageContext` rather than a queue job so the orchestrator can run
//! curation and assembly inline with a synthetic context.

#![allow(dead_code)]

pub mod analysis;
pub mod assembly;
pub mod curation;
pub mod orchestrator;
pub mod transcription;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::DigestFrequency;
use crate::services::download::Downloader;
use crate::services::queue::{Job, JobHandler, Queue, Worker};
use crate::services::stt::SttProvider;
use crate::services::tts::TtsProvider;
use crate::services::{AudioToolkit, BlobCache, LlmAdapter};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

pub const TRANSCRIPTION_QUEUE: &str = "transcription";
pub const ANALYSIS_QUEUE: &str = "analysis";
pub const CURATION_QUEUE: &str = "curation";
pub const DIGEST_QUEUE: &str = "digest";
pub const ORCHESTRATOR_QUEUE: &str = "orchestrator";

pub fn transcription_dedup_key(episode_id: Uuid) -> String {
    format!("transcription-{}", episode_id)
}

pub fn analysis_dedup_key(episode_id: Uuid, user_id: Uuid) -> String {
    format!("analysis-{}-{}", episode_id, user_id)
}

pub fn curation_dedup_key(digest_id: Uuid) -> String {
    format!("curation-{}", digest_id)
}

pub fn digest_dedup_key(digest_id: Uuid) -> String {
    format!("digest-{}", digest_id)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionPayload {
    pub episode_id: Uuid,
    pub audio_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisPayload {
    pub episode_id: Uuid,
    pub user_id: Uuid,
    pub user_interests: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClipCountRange {
    pub min: usize,
    pub max: usize,
}

impl Default for ClipCountRange {
    fn default() -> Self {
        Self { min: 6, max: 8 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurationPayload {
    pub digest_id: Uuid,
    pub user_id: Uuid,
    pub episode_ids: Vec<Uuid>,
    pub user_interests: Vec<String>,
    #[serde(default)]
    pub target_duration: Option<f64>,
    #[serde(default)]
    pub target_clip_count: Option<ClipCountRange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExistingTtsPaths {
    pub intro: PathBuf,
    pub transitions: Vec<PathBuf>,
    pub outro: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestPayload {
    pub digest_id: Uuid,
    pub user_id: Uuid,
    pub clip_ids: Vec<Uuid>,
    pub podcast_id: Option<Uuid>,
    pub episode_ids: Vec<Uuid>,
    #[serde(default)]
    pub skip_script_generation: bool,
    #[serde(default)]
    pub existing_tts_paths: Option<ExistingTtsPaths>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorPayload {
    pub user_id: Uuid,
    pub frequency: DigestFrequency,
}

/// Kick off a full digest run for one user. Orchestrator jobs are
/// deliberately single-attempt and never deduplicated: a second request
/// means the user wants a second run.
pub async fn enqueue_digest_run(
    ctx: &AppContext,
    user_id: Uuid,
    frequency: DigestFrequency,
) -> Result<Option<String>> {
    ctx.queue(ORCHESTRATOR_QUEUE)
        .add(
            "run-digest",
            &OrchestratorPayload { user_id, frequency },
            crate::services::queue::AddOpts {
                job_id: None,
                attempts: 1,
                backoff_delay_ms: 5000,
            },
        )
        .await
}

/// Direct-queue assembly path, used to rebuild an existing digest without
/// re-running the orchestrator. Deduped per digest.
pub async fn enqueue_digest_rebuild(ctx: &AppContext, request: DigestPayload) -> Result<Option<String>> {
    let dedup = digest_dedup_key(request.digest_id);
    ctx.queue(DIGEST_QUEUE)
        .add(
            "assemble-digest",
            &request,
            crate::services::queue::AddOpts {
                job_id: Some(dedup),
                ..Default::default()
            },
        )
        .await
}

/// Everything a stage needs, constructed once at startup and injected.
pub struct AppContext {
    pub db: PgPool,
    pub config: Config,
    pub audio: AudioToolkit,
    pub blobs: BlobCache,
    pub downloader: Downloader,
    pub stt: Arc<dyn SttProvider>,
    pub llm: Arc<LlmAdapter>,
    pub tts: Arc<dyn TtsProvider>,
    pub redis: ConnectionManager,
}

impl AppContext {
    pub fn queue(&self, name: &str) -> Queue {
        Queue::new(name, self.redis.clone())
    }
}

/// What a stage body sees of its job: identity, payload, progress and
/// logging. Queue workers pass the real job; the orchestrator passes an
/// in-process shim.
#[async_trait]
pub trait StageContext: Send + Sync {
    fn id(&self) -> &str;
    fn data(&self) -> &serde_json::Value;
    /// Best-effort; progress loss is never worth failing a stage over.
    async fn update_progress(&self, pct: u8);
    fn log(&self, msg: &str);
}

#[async_trait]
impl StageContext for Job {
    fn id(&self) -> &str {
        &self.id
    }

    fn data(&self) -> &serde_json::Value {
        &self.data
    }

    async fn update_progress(&self, pct: u8) {
        if let Err(e) = Job::update_progress(self, pct).await {
            warn!("Failed to record progress for job {}: {}", self.id, e);
        }
    }

    fn log(&self, msg: &str) {
        Job::log(self, msg);
    }
}

/// Synthetic context used when the orchestrator runs curation and assembly
/// inline instead of through the queue.
pub struct InlineJob {
    id: String,
    data: serde_json::Value,
    progress: AtomicU8,
}

impl InlineJob {
    pub fn new(id: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            data,
            progress: AtomicU8::new(0),
        }
    }

    pub fn progress(&self) -> u8 {
        self.progress.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl StageContext for InlineJob {
    fn id(&self) -> &str {
        &self.id
    }

    fn data(&self) -> &serde_json::Value {
        &self.data
    }

    async fn update_progress(&self, pct: u8) {
        self.progress.store(pct.min(100), Ordering::Relaxed);
    }

    fn log(&self, msg: &str) {
        info!("[inline:{}] {}", self.id, msg);
    }
}

/// Decode a context's payload into the stage's typed shape.
pub fn payload<T: DeserializeOwned>(ctx: &dyn StageContext) -> Result<T> {
    serde_json::from_value(ctx.data().clone())
        .map_err(|e| AppError::Parse(format!("bad payload for job {}: {}", ctx.id(), e)))
}

struct StageJobHandler<F> {
    run: F,
}

#[async_trait]
impl<F, Fut> JobHandler for StageJobHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<serde_json::Value>> + Send + 'static,
{
    async fn handle(&self, job: Job) -> Result<serde_json::Value> {
        (self.run)(job).await
    }
}

/// Boot one worker per queue. Returned handles resolve once shutdown flips
/// and in-flight jobs drain.
pub fn spawn_workers(
    ctx: Arc<AppContext>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let concurrency = ctx.config.queue_concurrency;
    let mut handles = Vec::new();

    let transcription_ctx = ctx.clone();
    handles.push(spawn_worker(
        ctx.queue(TRANSCRIPTION_QUEUE),
        concurrency,
        shutdown.clone(),
        move |job| {
            let ctx = transcription_ctx.clone();
            async move { transcription::handle(ctx, job).await }
        },
    ));

    let analysis_ctx = ctx.clone();
    handles.push(spawn_worker(
        ctx.queue(ANALYSIS_QUEUE),
        concurrency,
        shutdown.clone(),
        move |job| {
            let ctx = analysis_ctx.clone();
            async move { analysis::handle(ctx, job).await }
        },
    ));

    let curation_ctx = ctx.clone();
    handles.push(spawn_worker(
        ctx.queue(CURATION_QUEUE),
        concurrency,
        shutdown.clone(),
        move |job| {
            let ctx = curation_ctx.clone();
            async move { curation::handle(ctx, job).await }
        },
    ));

    let digest_ctx = ctx.clone();
    handles.push(spawn_worker(
        ctx.queue(DIGEST_QUEUE),
        concurrency,
        shutdown.clone(),
        move |job| {
            let ctx = digest_ctx.clone();
            async move { assembly::handle(ctx, job).await }
        },
    ));

    let orchestrator_ctx = ctx.clone();
    handles.push(spawn_worker(
        ctx.queue(ORCHESTRATOR_QUEUE),
        concurrency,
        shutdown,
        move |job| {
            let ctx = orchestrator_ctx.clone();
            async move { orchestrator::handle(ctx, job).await }
        },
    ));

    handles
}

fn spawn_worker<F, Fut>(
    queue: Queue,
    concurrency: usize,
    shutdown: watch::Receiver<bool>,
    run: F,
) -> JoinHandle<()>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<serde_json::Value>> + Send + 'static,
{
    let worker = Worker::new(queue, Arc::new(StageJobHandler { run }), concurrency);
    tokio::spawn(worker.run(shutdown))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_keys_are_entity_scoped() {
        let e = Uuid::nil();
        let u = Uuid::nil();
        assert_eq!(
            transcription_dedup_key(e),
            format!("transcription-{}", Uuid::nil())
        );
        assert_eq!(
            analysis_dedup_key(e, u),
            format!("analysis-{}-{}", Uuid::nil(), Uuid::nil())
        );
    }

    #[test]
    fn payloads_round_trip_camel_case() {
        let payload = DigestPayload {
            digest_id: Uuid::nil(),
            user_id: Uuid::nil(),
            clip_ids: vec![],
            podcast_id: None,
            episode_ids: vec![],
            skip_script_generation: true,
            existing_tts_paths: None,
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert!(value.get("digestId").is_some());
        assert!(value.get("skipScriptGeneration").is_some());

        let decoded: DigestPayload = serde_json::from_value(value).unwrap();
        assert!(decoded.skip_script_generation);
    }

    #[test]
    fn payload_defaults_tolerate_missing_optionals() {
        let decoded: DigestPayload = serde_json::from_str(
            r#"{"digestId": "00000000-0000-0000-0000-000000000000",
                "userId": "00000000-0000-0000-0000-000000000000",
                "clipIds": [], "podcastId": null, "episodeIds": []}"#,
        )
        .unwrap();
        assert!(!decoded.skip_script_generation);
        assert!(decoded.existing_tts_paths.is_none());
    }

    #[tokio::test]
    async fn inline_job_records_progress() {
        let job = InlineJob::new("curation-inline", serde_json::json!({}));
        job.update_progress(42).await;
        assert_eq!(job.progress(), 42);
        job.update_progress(200).await;
        assert_eq!(job.progress(), 100);
    }
}
