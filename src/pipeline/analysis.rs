//! Analysis stage: mine a transcribed episode for clip candidates matched
//! to a user's interests. Clips are a per-episode resource; each run
//! replaces the episode's clip set wholesale.

use crate::error::{AppError, Result};
use crate::models::{Clip, EpisodeStatus, NewClip, Transcript};
use crate::pipeline::{payload, AnalysisPayload, AppContext, StageContext};
use crate::services::llm::{self, ChatMessage, CompletionRequest};
use crate::services::queue::Job;
use crate::store;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

const MAX_CLIPS_PER_EPISODE: usize = 5;

const SYSTEM_PROMPT: &str = "You are an expert podcast editor who finds the most \
compelling, self-contained moments in episodes.\n\n\
Rules for picking clips:\n\
- Strongly prefer clips of 90 seconds or more; acceptable range is 60-180 seconds.\n\
- Return 3-5 clips. Fewer is fine for short or thin episodes.\n\
- Every clip must stand alone: no ads, no housekeeping, no filler, no \
mid-sentence starts.\n\
- Reward depth: complete stories, case studies, specific numbers and names. \
Penalize generic platitudes and one-line soundbites.\n\
- relevanceScore combines topic match with depth on a 0-100 scale.\n\n\
Respond with ONLY a JSON object of the form:\n\
{\"clips\": [{\"startTime\": <seconds>, \"endTime\": <seconds>, \
\"transcript\": \"...\", \"relevanceScore\": 0-100, \"reasoning\": \"...\", \
\"summary\": \"...\"}]}";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzedClip {
    pub start_time: f64,
    pub end_time: f64,
    pub transcript: String,
    pub relevance_score: f64,
    pub reasoning: String,
    pub summary: String,
}

#[derive(Debug, Deserialize)]
struct AnalysisResponse {
    clips: Vec<AnalyzedClip>,
}

pub async fn handle(ctx: Arc<AppContext>, job: Job) -> Result<serde_json::Value> {
    let request: AnalysisPayload = payload(&job)?;

    match run(&ctx, &job, &request).await {
        Ok(clips) => Ok(serde_json::json!({
            "episodeId": request.episode_id,
            "clipCount": clips.len(),
        })),
        Err(e) => {
            if !matches!(e, AppError::Busy(_)) {
                if let Err(mark) = store::episodes::set_failed(&ctx.db, request.episode_id).await {
                    warn!("Could not mark episode {} failed: {}", request.episode_id, mark);
                }
            }
            Err(e)
        }
    }
}

pub async fn run(
    ctx: &AppContext,
    stage: &dyn StageContext,
    request: &AnalysisPayload,
) -> Result<Vec<Clip>> {
    let episode_id = request.episode_id;
    let episode = store::episodes::get(&ctx.db, episode_id).await?;

    match episode.status {
        EpisodeStatus::Analyzed => {
            stage.log(&format!("Episode {} already analyzed, reusing clips", episode_id));
            return store::clips::for_episode(&ctx.db, episode_id).await;
        }
        EpisodeStatus::Analyzing => {
            return Err(AppError::Busy(format!(
                "episode {} is already being analyzed",
                episode_id
            )));
        }
        // Transcription still owns the episode; yield instead of failing
        // it out from under the other worker.
        EpisodeStatus::Pending | EpisodeStatus::Downloading | EpisodeStatus::Transcribing => {
            return Err(AppError::Busy(format!(
                "episode {} is not transcribed yet",
                episode_id
            )));
        }
        EpisodeStatus::Transcribed | EpisodeStatus::Failed => {}
    }

    let transcript = episode
        .transcript()
        .ok_or_else(|| {
            AppError::InvariantViolation(format!("episode {} has no transcript", episode_id))
        })?
        .clone();

    // Failed is accepted so a retry after a failed analysis attempt can
    // reclaim the episode; the transcript check above guarantees the
    // failure was not transcription's.
    let claimed = store::episodes::transition(
        &ctx.db,
        episode_id,
        &[EpisodeStatus::Transcribed, EpisodeStatus::Failed],
        EpisodeStatus::Analyzing,
    )
    .await?;
    if !claimed {
        return Err(AppError::Busy(format!(
            "episode {} was claimed by another analysis worker",
            episode_id
        )));
    }

    let podcast = store::podcasts::get(&ctx.db, episode.podcast_id).await?;

    stage.log(&format!(
        "Analyzing episode {} against interests [{}]",
        episode_id,
        request.user_interests.join(", ")
    ));
    stage.update_progress(10).await;

    let user_prompt = build_user_prompt(
        &request.user_interests,
        &podcast.title,
        &episode.title,
        &transcript,
    );

    let completion = ctx
        .llm
        .complete(&CompletionRequest {
            model: ctx.llm.default_model.clone(),
            messages: vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user_prompt)],
            temperature: Some(0.7),
            max_tokens: Some(4000),
        })
        .await?;

    stage.update_progress(70).await;

    let response: AnalysisResponse = llm::parse_response(&completion.content)?;
    let valid = validate_clips(response.clips, transcript.duration);
    if valid.is_empty() {
        warn!("Episode {} analysis produced no usable clips", episode_id);
    }

    let new_clips: Vec<NewClip> = valid
        .into_iter()
        .take(MAX_CLIPS_PER_EPISODE)
        .map(|c| NewClip {
            episode_id,
            start_time: c.start_time,
            end_time: c.end_time,
            transcript: c.transcript,
            relevance_score: c.relevance_score.round().clamp(0.0, 100.0) as i32,
            reasoning: c.reasoning,
            summary: c.summary,
        })
        .collect();

    let clips = store::clips::replace_for_episode(&ctx.db, episode_id, &new_clips).await?;

    store::episodes::transition(
        &ctx.db,
        episode_id,
        &[EpisodeStatus::Analyzing],
        EpisodeStatus::Analyzed,
    )
    .await?;

    stage.update_progress(100).await;
    info!("Episode {} analyzed: {} clips", episode_id, clips.len());

    Ok(clips)
}

/// The transcript reaches the model with one `[start-end]: text` line per
/// segment so it can cite timestamps that actually exist.
fn build_user_prompt(
    interests: &[String],
    podcast_title: &str,
    episode_title: &str,
    transcript: &Transcript,
) -> String {
    let annotated = transcript
        .segments
        .iter()
        .map(|s| format!("[{:.1}-{:.1}]: {}", s.start, s.end, s.text))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "LISTENER INTERESTS: {}\n\n\
         PODCAST: {}\n\
         EPISODE: {}\n\
         DURATION: {:.0} seconds\n\n\
         TRANSCRIPT (each line is [start-end]: text, in seconds):\n{}",
        interests.join(", "),
        podcast_title,
        episode_title,
        transcript.duration,
        annotated
    )
}

/// Drop clips the model hallucinated outside the episode, and inverted
/// ranges.
fn validate_clips(clips: Vec<AnalyzedClip>, transcript_duration: f64) -> Vec<AnalyzedClip> {
    clips
        .into_iter()
        .filter(|c| {
            let in_range =
                c.start_time >= 0.0 && c.end_time <= transcript_duration && c.end_time > c.start_time;
            if !in_range {
                warn!(
                    "Dropping clip outside episode bounds: start={} end={} duration={}",
                    c.start_time, c.end_time, transcript_duration
                );
            }
            in_range
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TranscriptSegment;

    fn clip(start: f64, end: f64) -> AnalyzedClip {
        AnalyzedClip {
            start_time: start,
            end_time: end,
            transcript: "words".to_string(),
            relevance_score: 80.0,
            reasoning: "deep".to_string(),
            summary: "a moment".to_string(),
        }
    }

    #[test]
    fn validation_drops_out_of_range_and_inverted_clips() {
        let clips = vec![
            clip(0.0, 90.0),
            clip(-5.0, 60.0),     // negative start
            clip(1000.0, 1100.0), // past the end
            clip(200.0, 150.0),   // inverted
            clip(100.0, 100.0),   // empty
            clip(500.0, 600.0),
        ];
        let valid = validate_clips(clips, 600.0);
        assert_eq!(valid.len(), 2);
        assert_eq!(valid[0].start_time, 0.0);
        assert_eq!(valid[1].end_time, 600.0);
    }

    #[test]
    fn clip_ending_exactly_at_duration_survives() {
        let valid = validate_clips(vec![clip(500.0, 600.0)], 600.0);
        assert_eq!(valid.len(), 1);
    }

    #[test]
    fn user_prompt_annotates_segments() {
        let transcript = Transcript {
            text: "a b".to_string(),
            segments: vec![
                TranscriptSegment { start: 0.0, end: 4.5, text: "a".to_string() },
                TranscriptSegment { start: 4.5, end: 9.0, text: "b".to_string() },
            ],
            language: "en".to_string(),
            duration: 9.0,
        };
        let prompt = build_user_prompt(
            &["startups".to_string()],
            "Acquired",
            "The NVIDIA Story",
            &transcript,
        );
        assert!(prompt.contains("LISTENER INTERESTS: startups"));
        assert!(prompt.contains("[0.0-4.5]: a"));
        assert!(prompt.contains("[4.5-9.0]: b"));
        assert!(prompt.contains("DURATION: 9 seconds"));
    }

    #[test]
    fn analysis_response_decodes_fenced_camel_case() {
        let body = "```json\n{\"clips\": [{\"startTime\": 12.0, \"endTime\": 105.5, \
                    \"transcript\": \"...\", \"relevanceScore\": 88, \
                    \"reasoning\": \"specific\", \"summary\": \"story\"}]}\n```";
        let parsed: AnalysisResponse = llm::parse_response(body).unwrap();
        assert_eq!(parsed.clips.len(), 1);
        assert_eq!(parsed.clips[0].end_time, 105.5);
        assert_eq!(parsed.clips[0].relevance_score, 88.0);
    }
}
