//! End-to-end driver: fan episodes out to transcription and analysis,
//! poll for readiness, then run curation and assembly inline to produce
//! one digest for one user.

use crate::error::{AppError, Result};
use crate::models::{DigestStatus, Episode, EpisodeStatus};
use crate::pipeline::{
    analysis_dedup_key, curation, assembly, payload, transcription_dedup_key, AnalysisPayload,
    AppContext, CurationPayload, DigestPayload, InlineJob, OrchestratorPayload, StageContext,
    ANALYSIS_QUEUE, TRANSCRIPTION_QUEUE, TranscriptionPayload,
};
use crate::services::queue::{AddOpts, Job};
use crate::store;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status")]
pub enum OrchestratorOutcome {
    #[serde(rename = "no_episodes")]
    NoEpisodes,
    #[serde(rename = "ready", rename_all = "camelCase")]
    Ready {
        digest_id: Uuid,
        audio_url: String,
        duration: f64,
        episode_count: usize,
        clip_count: usize,
    },
}

pub async fn handle(ctx: Arc<AppContext>, job: Job) -> Result<serde_json::Value> {
    let request: OrchestratorPayload = payload(&job)?;
    let outcome = run(&ctx, &job, &request).await?;
    Ok(serde_json::to_value(outcome)?)
}

pub async fn run(
    ctx: &AppContext,
    stage: &dyn StageContext,
    request: &OrchestratorPayload,
) -> Result<OrchestratorOutcome> {
    let user = store::users::get(&ctx.db, request.user_id).await?;
    let since = chrono::Utc::now() - request.frequency.lookback();

    let episodes = store::episodes::recent_for_user(&ctx.db, user.id, since).await?;
    if episodes.is_empty() {
        stage.log(&format!(
            "No episodes published since {} for user {}",
            since, user.id
        ));
        return Ok(OrchestratorOutcome::NoEpisodes);
    }

    stage.log(&format!(
        "Found {} episodes in the {} window for user {}",
        episodes.len(),
        user.frequency.as_str(),
        user.id
    ));

    let episode_ids: Vec<Uuid> = episodes.iter().map(|e| e.id).collect();
    fan_out(ctx, &episodes, &user.id, &user.interests).await?;

    // Poll until every episode settles or the ceiling cuts us off.
    let deadline = Instant::now() + ctx.config.orchestrator_poll_ceiling;
    let total = episode_ids.len();
    let analyzed_ids: Vec<Uuid>;

    loop {
        tokio::time::sleep(ctx.config.orchestrator_poll_interval).await;

        let current = store::episodes::get_many(&ctx.db, &episode_ids).await?;
        let mut analyzed = Vec::new();
        let mut failed = 0usize;
        let mut processing = 0usize;

        for episode in &current {
            match episode.status {
                EpisodeStatus::Analyzed => analyzed.push(episode.id),
                EpisodeStatus::Failed => failed += 1,
                EpisodeStatus::Transcribed => {
                    // Freshly transcribed since the last pass; dedup makes
                    // the repeat enqueue free.
                    enqueue_analysis(ctx, episode.id, &user.id, &user.interests).await?;
                    processing += 1;
                }
                _ => processing += 1,
            }
        }

        stage
            .update_progress(poll_progress(analyzed.len() + failed, total))
            .await;

        if processing == 0 {
            if analyzed.is_empty() {
                return Err(AppError::InvariantViolation(format!(
                    "all {} episodes failed for user {}",
                    total, user.id
                )));
            }
            analyzed_ids = analyzed;
            break;
        }

        if Instant::now() >= deadline {
            warn!(
                "Orchestrator poll ceiling reached with {} episodes still processing",
                processing
            );
            if analyzed.is_empty() {
                return Err(AppError::InvariantViolation(format!(
                    "no episodes finished analysis within the poll ceiling for user {}",
                    user.id
                )));
            }
            analyzed_ids = analyzed;
            break;
        }
    }

    stage.log(&format!("{} episodes analyzed, creating digest", analyzed_ids.len()));

    let analyzed_episodes = store::episodes::get_many(&ctx.db, &analyzed_ids).await?;
    let podcast_id = dominant_podcast(&analyzed_episodes);

    let digest = store::digests::create(
        &ctx.db,
        user.id,
        podcast_id,
        &analyzed_ids,
        DigestStatus::Curating,
    )
    .await?;

    // Curation and assembly run inline on synthetic jobs; the queue path
    // stays reserved for API-triggered rebuilds.
    let outcome = compose(ctx, request, &user.interests, user.digest_duration_minutes, &digest.id, podcast_id, &analyzed_ids).await;

    match outcome {
        Ok((clip_count, audio_url, duration)) => {
            stage.update_progress(100).await;
            Ok(OrchestratorOutcome::Ready {
                digest_id: digest.id,
                audio_url,
                duration,
                episode_count: analyzed_ids.len(),
                clip_count,
            })
        }
        Err(e) => {
            if let Err(mark) =
                store::digests::set_status(&ctx.db, digest.id, DigestStatus::Failed).await
            {
                warn!("Could not mark digest {} failed: {}", digest.id, mark);
            }
            Err(e)
        }
    }
}

/// Reset failures and enqueue the per-episode work.
async fn fan_out(
    ctx: &AppContext,
    episodes: &[Episode],
    user_id: &Uuid,
    interests: &[String],
) -> Result<()> {
    let transcription = ctx.queue(TRANSCRIPTION_QUEUE);

    for episode in episodes {
        match episode.status {
            EpisodeStatus::Pending | EpisodeStatus::Failed => {
                if episode.status == EpisodeStatus::Failed {
                    store::episodes::transition(
                        &ctx.db,
                        episode.id,
                        &[EpisodeStatus::Failed],
                        EpisodeStatus::Pending,
                    )
                    .await?;
                }
                transcription
                    .add(
                        "transcribe-episode",
                        &TranscriptionPayload {
                            episode_id: episode.id,
                            audio_url: episode.audio_url.clone(),
                        },
                        AddOpts {
                            job_id: Some(transcription_dedup_key(episode.id)),
                            attempts: 3,
                            backoff_delay_ms: 5000,
                        },
                    )
                    .await?;
            }
            EpisodeStatus::Transcribed => {
                enqueue_analysis(ctx, episode.id, user_id, interests).await?;
            }
            // In flight or already analyzed; the poll loop picks these up.
            _ => {}
        }
    }

    Ok(())
}

async fn enqueue_analysis(
    ctx: &AppContext,
    episode_id: Uuid,
    user_id: &Uuid,
    interests: &[String],
) -> Result<()> {
    ctx.queue(ANALYSIS_QUEUE)
        .add(
            "analyze-episode",
            &AnalysisPayload {
                episode_id,
                user_id: *user_id,
                user_interests: interests.to_vec(),
            },
            AddOpts {
                job_id: Some(analysis_dedup_key(episode_id, *user_id)),
                ..Default::default()
            },
        )
        .await?;
    Ok(())
}

async fn compose(
    ctx: &AppContext,
    request: &OrchestratorPayload,
    interests: &[String],
    digest_duration_minutes: i32,
    digest_id: &Uuid,
    podcast_id: Option<Uuid>,
    episode_ids: &[Uuid],
) -> Result<(usize, String, f64)> {
    let curation_payload = CurationPayload {
        digest_id: *digest_id,
        user_id: request.user_id,
        episode_ids: episode_ids.to_vec(),
        user_interests: interests.to_vec(),
        target_duration: Some(f64::from(digest_duration_minutes) * 60.0),
        target_clip_count: None,
    };
    let curation_job = InlineJob::new(
        format!("curation-{}", digest_id),
        serde_json::to_value(&curation_payload)?,
    );
    let clip_ids = curation::run(ctx, &curation_job, &curation_payload).await?;

    let digest_payload = DigestPayload {
        digest_id: *digest_id,
        user_id: request.user_id,
        clip_ids: clip_ids.clone(),
        podcast_id,
        episode_ids: episode_ids.to_vec(),
        skip_script_generation: false,
        existing_tts_paths: None,
    };
    let digest_job = InlineJob::new(
        format!("digest-{}", digest_id),
        serde_json::to_value(&digest_payload)?,
    );
    let output = assembly::run(ctx, &digest_job, &digest_payload).await?;

    info!(
        "Digest {} composed for user {}: {} clips, {:.0}s",
        digest_id, request.user_id, output.clip_count, output.duration
    );
    Ok((output.clip_count, output.audio_url, output.duration))
}

/// Most frequent source podcast among the digest's episodes.
fn dominant_podcast(episodes: &[Episode]) -> Option<Uuid> {
    let mut counts: HashMap<Uuid, usize> = HashMap::new();
    for episode in episodes {
        *counts.entry(episode.podcast_id).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(id, _)| id)
}

/// Episode settlement maps onto the first half of the progress bar,
/// rounded up.
fn poll_progress(settled: usize, total: usize) -> u8 {
    if total == 0 {
        return 50;
    }
    ((settled * 50 + total - 1) / total).min(50) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn episode(podcast_id: Uuid) -> Episode {
        Episode {
            id: Uuid::new_v4(),
            podcast_id,
            guid: "guid".to_string(),
            title: "t".to_string(),
            audio_url: "https://example.com/a.mp3".to_string(),
            published_at: Utc::now(),
            duration_seconds: None,
            status: EpisodeStatus::Analyzed,
            transcript: None,
        }
    }

    #[test]
    fn poll_progress_halves_the_bar() {
        assert_eq!(poll_progress(0, 4), 0);
        assert_eq!(poll_progress(1, 4), 13);
        assert_eq!(poll_progress(2, 4), 25);
        assert_eq!(poll_progress(4, 4), 50);
    }

    #[test]
    fn dominant_podcast_wins_by_count() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let episodes = vec![episode(a), episode(b), episode(b)];
        assert_eq!(dominant_podcast(&episodes), Some(b));
        assert_eq!(dominant_podcast(&[]), None);
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let value = serde_json::to_value(OrchestratorOutcome::NoEpisodes).unwrap();
        assert_eq!(value["status"], "no_episodes");

        let value = serde_json::to_value(OrchestratorOutcome::Ready {
            digest_id: Uuid::nil(),
            audio_url: "/audio/digests/x.mp3".to_string(),
            duration: 431.0,
            episode_count: 3,
            clip_count: 6,
        })
        .unwrap();
        assert_eq!(value["status"], "ready");
        assert_eq!(value["clipCount"], 6);
    }
}
