//! Curation stage: pick 6-8 clips across a digest's source episodes that
//! fit the duration target and cover distinct topics, then pin their
//! playback order.

use crate::error::{AppError, Result};
use crate::models::{ClipCandidate, DigestStatus};
use crate::pipeline::{payload, AppContext, ClipCountRange, CurationPayload, StageContext};
use crate::services::llm::{self, ChatMessage, CompletionRequest};
use crate::services::queue::Job;
use crate::store;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const DEFAULT_TARGET_DURATION_SECONDS: f64 = 420.0;
const TARGET_DURATION_TOLERANCE_SECONDS: f64 = 60.0;
/// How much of each candidate's transcript the model sees.
const TRANSCRIPT_PREVIEW_CHARS: usize = 600;

const SYSTEM_PROMPT: &str = "You are the editor of a personalized podcast digest. \
From the candidate clips below, select the set that makes the best short \
listen.\n\n\
Selection criteria, in order:\n\
1. Depth beats score: a 92-scored platitude loses to an 80-scored full story.\n\
2. One clip per topic. Never select two clips covering the same ground.\n\
3. Source diversity: take at most 2-3 clips from any single episode.\n\
4. Order the selection as a logical progression for the listener.\n\
5. Land the combined duration close to the target.\n\n\
Respond with ONLY a JSON object:\n\
{\"selectedClipIds\": [\"...\"], \"reasoning\": \"...\", \
\"estimatedDuration\": <seconds>, \"topicCoverage\": [\"...\"]}";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CurationResponse {
    selected_clip_ids: Vec<String>,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    estimated_duration: Option<f64>,
    #[serde(default)]
    topic_coverage: Vec<String>,
}

pub async fn handle(ctx: Arc<AppContext>, job: Job) -> Result<serde_json::Value> {
    let request: CurationPayload = payload(&job)?;

    match run(&ctx, &job, &request).await {
        Ok(clip_ids) => Ok(serde_json::json!({
            "digestId": request.digest_id,
            "clipCount": clip_ids.len(),
        })),
        Err(e) => {
            if let Err(mark) = store::digests::set_status(&ctx.db, request.digest_id, DigestStatus::Failed).await {
                warn!("Could not mark digest {} failed: {}", request.digest_id, mark);
            }
            Err(e)
        }
    }
}

/// Returns the digest's clip ids in playback order.
pub async fn run(
    ctx: &AppContext,
    stage: &dyn StageContext,
    request: &CurationPayload,
) -> Result<Vec<Uuid>> {
    let digest_id = request.digest_id;
    let digest = store::digests::get(&ctx.db, digest_id).await?;

    // Re-deliveries reuse prior selections: with clips and a script the
    // whole stage is a no-op, with clips alone only assembly remains.
    let existing = store::digests::clips_in_order(&ctx.db, digest_id).await?;
    if !existing.is_empty() {
        let ids: Vec<Uuid> = existing.iter().map(|c| c.clip_id).collect();
        if digest.narrator_script.is_some() {
            stage.log(&format!("Digest {} already curated and scripted, skipping", digest_id));
        } else {
            stage.log(&format!("Digest {} already curated, reusing {} clips", digest_id, ids.len()));
        }
        return Ok(ids);
    }

    store::digests::set_status(&ctx.db, digest_id, DigestStatus::Curating).await?;
    stage.update_progress(10).await;

    let candidates = store::clips::candidates_for_episodes(&ctx.db, &request.episode_ids).await?;
    if candidates.is_empty() {
        return Err(AppError::NotFound(format!(
            "no clips found for digest {} episodes",
            digest_id
        )));
    }

    let range = request.target_clip_count.unwrap_or_default();
    let target_duration = request.target_duration.unwrap_or(DEFAULT_TARGET_DURATION_SECONDS);

    stage.log(&format!(
        "Curating {} candidates down to {}-{} clips (~{:.0}s)",
        candidates.len(),
        range.min,
        range.max,
        target_duration
    ));

    let user_prompt = build_user_prompt(&candidates, &request.user_interests, target_duration, range);

    let completion = ctx
        .llm
        .complete(&CompletionRequest {
            model: ctx.llm.default_model.clone(),
            messages: vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user_prompt)],
            temperature: Some(0.7),
            max_tokens: Some(2000),
        })
        .await?;
    stage.update_progress(60).await;

    let response: CurationResponse = llm::parse_response(&completion.content)?;
    info!(
        "Digest {} curation reasoning: {} (topics: {})",
        digest_id,
        response.reasoning,
        response.topic_coverage.join(", ")
    );
    if let Some(estimate) = response.estimated_duration {
        let drift = (estimate - target_duration).abs();
        if drift > TARGET_DURATION_TOLERANCE_SECONDS {
            warn!(
                "Digest {} selection estimates {:.0}s against a {:.0}s target",
                digest_id, estimate, target_duration
            );
        }
    }

    let ordered = select_clips(&response.selected_clip_ids, &candidates, range.min);
    if ordered.is_empty() {
        return Err(AppError::Parse(format!(
            "curation for digest {} selected no valid clips",
            digest_id
        )));
    }

    store::digests::replace_clips(&ctx.db, digest_id, &ordered).await?;
    store::clips::set_digest(&ctx.db, &ordered, digest_id).await?;

    // The clip set changed, so any previously generated script is stale.
    store::digests::set_script(&ctx.db, digest_id, None).await?;
    store::digests::set_status(&ctx.db, digest_id, DigestStatus::Pending).await?;

    stage.update_progress(100).await;
    info!("Digest {} curated: {} clips", digest_id, ordered.len());

    Ok(ordered)
}

fn build_user_prompt(
    candidates: &[ClipCandidate],
    interests: &[String],
    target_duration: f64,
    range: ClipCountRange,
) -> String {
    let descriptions = candidates
        .iter()
        .map(|c| {
            let preview: String = c.transcript.chars().take(TRANSCRIPT_PREVIEW_CHARS).collect();
            format!(
                "ID: {} | {} — {} | score {} | {:.0}s\nSummary: {}\nTranscript: {}",
                c.id, c.podcast_title, c.episode_title, c.relevance_score, c.duration, c.summary, preview
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "TARGET DURATION: {:.0} seconds (within {:.0}s either way)\n\
         CLIP COUNT: between {} and {}\n\
         LISTENER INTERESTS: {}\n\n\
         CANDIDATE CLIPS:\n{}",
        target_duration,
        TARGET_DURATION_TOLERANCE_SECONDS,
        range.min,
        range.max,
        interests.join(", "),
        descriptions
    )
}

/// Keep the model's picks (in its order) that actually exist, then top up
/// with the highest-scored leftovers until `min` is reached. Candidates
/// arrive pre-sorted by relevance descending.
fn select_clips(selected_ids: &[String], candidates: &[ClipCandidate], min: usize) -> Vec<Uuid> {
    let known: HashSet<Uuid> = candidates.iter().map(|c| c.id).collect();

    let mut ordered: Vec<Uuid> = Vec::new();
    let mut seen: HashSet<Uuid> = HashSet::new();
    for raw in selected_ids {
        match raw.parse::<Uuid>() {
            Ok(id) if known.contains(&id) => {
                if seen.insert(id) {
                    ordered.push(id);
                }
            }
            _ => warn!("Curation returned unknown clip id {:?}, dropping", raw),
        }
    }

    if ordered.len() < min {
        for candidate in candidates {
            if ordered.len() >= min {
                break;
            }
            if seen.insert(candidate.id) {
                ordered.push(candidate.id);
            }
        }
    }

    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: Uuid, score: i32) -> ClipCandidate {
        ClipCandidate {
            id,
            episode_id: Uuid::new_v4(),
            start_time: 0.0,
            end_time: 90.0,
            duration: 90.0,
            transcript: "t".repeat(1000),
            relevance_score: score,
            summary: "s".to_string(),
            episode_title: "ep".to_string(),
            podcast_title: "pod".to_string(),
        }
    }

    #[test]
    fn unknown_ids_are_dropped_and_backfilled_by_score() {
        // Ten candidates sorted by score descending, as the store returns
        // them.
        let candidates: Vec<ClipCandidate> =
            (0..10).map(|i| candidate(Uuid::new_v4(), 100 - i)).collect();

        // The model picked three real clips and two inventions.
        let mut picks: Vec<String> = vec![
            candidates[7].id.to_string(),
            candidates[2].id.to_string(),
            candidates[9].id.to_string(),
        ];
        picks.push(Uuid::new_v4().to_string());
        picks.push("not-even-a-uuid".to_string());

        let ordered = select_clips(&picks, &candidates, 6);
        assert_eq!(ordered.len(), 6);
        // Model order survives for the valid picks...
        assert_eq!(ordered[0], candidates[7].id);
        assert_eq!(ordered[1], candidates[2].id);
        assert_eq!(ordered[2], candidates[9].id);
        // ...and the fill takes the best unselected scores in order.
        assert_eq!(ordered[3], candidates[0].id);
        assert_eq!(ordered[4], candidates[1].id);
        assert_eq!(ordered[5], candidates[3].id);
    }

    #[test]
    fn duplicates_from_the_model_collapse() {
        let candidates: Vec<ClipCandidate> =
            (0..6).map(|i| candidate(Uuid::new_v4(), 90 - i)).collect();
        let picks = vec![
            candidates[1].id.to_string(),
            candidates[1].id.to_string(),
            candidates[4].id.to_string(),
        ];
        let ordered = select_clips(&picks, &candidates, 2);
        assert_eq!(ordered, vec![candidates[1].id, candidates[4].id]);
    }

    #[test]
    fn fill_stops_when_candidates_run_out() {
        let candidates: Vec<ClipCandidate> =
            (0..4).map(|i| candidate(Uuid::new_v4(), 90 - i)).collect();
        let ordered = select_clips(&[], &candidates, 6);
        assert_eq!(ordered.len(), 4);
    }

    #[test]
    fn curation_response_decodes() {
        let body = r#"{"selectedClipIds": ["a", "b"], "reasoning": "diverse",
                       "estimatedDuration": 410, "topicCoverage": ["ai", "chips"]}"#;
        let parsed: CurationResponse = llm::parse_response(body).unwrap();
        assert_eq!(parsed.selected_clip_ids.len(), 2);
        assert_eq!(parsed.estimated_duration, Some(410.0));
        assert_eq!(parsed.topic_coverage, vec!["ai", "chips"]);
    }
}
