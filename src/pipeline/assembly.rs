//! Digest assembly: narrator script, TTS synthesis, clip extraction, and
//! deterministic concatenation into the published MP3.

use crate::error::{AppError, Result};
use crate::models::{DigestClipRow, DigestStatus, NarratorScript};
use crate::pipeline::{payload, AppContext, DigestPayload, ExistingTtsPaths, StageContext};
use crate::services::audio::SliceOptions;
use crate::services::llm::{self, ChatMessage, CompletionRequest};
use crate::services::queue::Job;
use crate::services::tts::TtsOptions;
use crate::store;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Clip boundaries get a short fade so cuts never click.
const CLIP_FADE_SECONDS: f64 = 0.3;
/// The published artifact is canonical-format CBR, so size divided by the
/// byte rate is a tight duration estimate.
const CANONICAL_BYTES_PER_SECOND: f64 = 128.0 * 1024.0 / 8.0;

const SYSTEM_PROMPT: &str = "You write narration for a personalized podcast digest. \
The listener will hear your intro, then each clip with your transitions \
between them, then your outro.\n\n\
Requirements:\n\
- intro: 100-125 words. Name every podcast and episode featured and preview \
the key themes. Warm but efficient; no filler.\n\
- transitions: exactly one fewer than the clip count. Each is 25-35 words, \
sets up the NEXT clip, and names its podcast and what to listen for.\n\
- outro: under 20 seconds when spoken. Wrap up and sign off.\n\n\
Respond with ONLY a JSON object:\n\
{\"intro\": \"...\", \"transitions\": [\"...\"], \"outro\": \"...\"}";

#[derive(Debug, Clone)]
pub struct AssemblyOutput {
    pub audio_url: String,
    pub duration: f64,
    pub clip_count: usize,
}

/// Narrator audio on disk, in sequence position order.
struct NarratorAudio {
    intro: PathBuf,
    transitions: Vec<PathBuf>,
    outro: PathBuf,
}

pub async fn handle(ctx: Arc<AppContext>, job: Job) -> Result<serde_json::Value> {
    let request: DigestPayload = payload(&job)?;

    match run(&ctx, &job, &request).await {
        Ok(output) => Ok(serde_json::json!({
            "digestId": request.digest_id,
            "audioUrl": output.audio_url,
            "duration": output.duration,
            "clipCount": output.clip_count,
        })),
        Err(e) => {
            if !matches!(e, AppError::Busy(_)) {
                if let Err(mark) =
                    store::digests::set_status(&ctx.db, request.digest_id, DigestStatus::Failed).await
                {
                    warn!("Could not mark digest {} failed: {}", request.digest_id, mark);
                }
            }
            Err(e)
        }
    }
}

pub async fn run(
    ctx: &AppContext,
    stage: &dyn StageContext,
    request: &DigestPayload,
) -> Result<AssemblyOutput> {
    let digest_id = request.digest_id;

    let claimed = store::digests::transition(
        &ctx.db,
        digest_id,
        &[DigestStatus::Pending, DigestStatus::Failed],
        DigestStatus::GeneratingScript,
    )
    .await?;
    if !claimed {
        return Err(AppError::Busy(format!(
            "digest {} is already being assembled",
            digest_id
        )));
    }

    let work_dir = ctx.blobs.digest_work_dir(digest_id);
    tokio::fs::create_dir_all(&work_dir).await?;

    let outcome = assemble(ctx, stage, request, &work_dir).await;

    // The work dir goes either way; only the published file survives.
    if let Err(e) = ctx.blobs.cleanup(&work_dir).await {
        warn!("Cleanup of {} failed: {}", work_dir.display(), e);
    }

    outcome
}

async fn assemble(
    ctx: &AppContext,
    stage: &dyn StageContext,
    request: &DigestPayload,
    work_dir: &Path,
) -> Result<AssemblyOutput> {
    let digest_id = request.digest_id;

    let clips = store::digests::clips_in_order(&ctx.db, digest_id).await?;
    if clips.is_empty() {
        return Err(AppError::InvariantViolation(format!(
            "digest {} has no clips to assemble",
            digest_id
        )));
    }
    let clip_count = clips.len();

    // 1. Narrator script.
    let script = obtain_script(ctx, stage, request, &clips).await?;
    if script.transitions.len() != clip_count - 1 {
        warn!(
            "Digest {} script has {} transitions for {} clips; proceeding anyway",
            digest_id,
            script.transitions.len(),
            clip_count
        );
    }
    stage.update_progress(15).await;

    // 2. Narrator audio.
    store::digests::set_status(&ctx.db, digest_id, DigestStatus::GeneratingAudio).await?;
    let narrator = obtain_narrator_audio(ctx, stage, request, &script, work_dir).await?;
    stage.update_progress(50).await;

    // 3. Clip audio.
    let mut clip_paths = Vec::with_capacity(clip_count);
    for (i, clip) in clips.iter().enumerate() {
        stage.log(&format!(
            "Extracting clip {}/{} from \"{}\"",
            i + 1,
            clip_count,
            clip.episode_title
        ));

        let episode_temp = work_dir.join(format!("episode_{}.mp3", i));
        ctx.downloader.download_to(&clip.audio_url, &episode_temp).await?;

        let clip_path = work_dir.join(format!("clip_{}.mp3", i));
        ctx.audio
            .slice_clip(
                &episode_temp,
                &clip_path,
                SliceOptions {
                    start_time: clip.start_time,
                    end_time: clip.end_time,
                    fade_in: CLIP_FADE_SECONDS,
                    fade_out: CLIP_FADE_SECONDS,
                },
            )
            .await?;

        // The full episode is only needed for the slice.
        ctx.blobs.cleanup(&episode_temp).await?;

        clip_paths.push(clip_path);
        stage.update_progress(clip_progress(i + 1, clip_count)).await;
    }

    // 4. Stitch.
    store::digests::set_status(&ctx.db, digest_id, DigestStatus::Stitching).await?;
    let sequence = build_sequence(&narrator.intro, &clip_paths, &narrator.transitions, &narrator.outro);
    let stitched = work_dir.join("final_digest.mp3");
    stage.log(&format!("Concatenating {} pieces", sequence.len()));
    ctx.audio.concatenate(&sequence, &stitched).await?;
    stage.update_progress(90).await;

    // 5. Publish.
    let published = ctx.blobs.digest_output_path(digest_id);
    if let Some(parent) = published.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(&stitched, &published).await?;

    let bytes = tokio::fs::metadata(&published).await?.len();
    let duration = estimate_duration_from_size(bytes);
    let audio_url = format!("/audio/digests/{}.mp3", digest_id);

    store::digests::publish(&ctx.db, digest_id, &audio_url, duration).await?;
    stage.update_progress(100).await;
    info!(
        "Digest {} ready: {} clips, {:.0}s, {}",
        digest_id, clip_count, duration, audio_url
    );

    Ok(AssemblyOutput { audio_url, duration, clip_count })
}

/// Reuse the persisted script when resumption asks for it; otherwise ask
/// the LLM and persist the result.
async fn obtain_script(
    ctx: &AppContext,
    stage: &dyn StageContext,
    request: &DigestPayload,
    clips: &[DigestClipRow],
) -> Result<NarratorScript> {
    if request.skip_script_generation {
        let digest = store::digests::get(&ctx.db, request.digest_id).await?;
        if let Some(script) = digest.script() {
            stage.log("Reusing persisted narrator script");
            return Ok(script);
        }
        warn!(
            "Digest {} asked to skip script generation but has no script, generating",
            request.digest_id
        );
    }

    let user = store::users::get(&ctx.db, request.user_id).await?;
    let user_prompt = build_script_prompt(clips, user.name.as_deref());

    stage.log("Generating narrator script");
    let completion = ctx
        .llm
        .complete(&CompletionRequest {
            model: ctx.llm.default_model.clone(),
            messages: vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user_prompt)],
            temperature: Some(0.7),
            max_tokens: Some(2000),
        })
        .await?;

    let script: NarratorScript = llm::parse_response(&completion.content)?;
    let serialized = serde_json::to_string(&script)?;
    store::digests::set_script(&ctx.db, request.digest_id, Some(&serialized)).await?;

    Ok(script)
}

/// Synthesize the narrator pieces, or adopt the files from a previous
/// partially-successful run.
async fn obtain_narrator_audio(
    ctx: &AppContext,
    stage: &dyn StageContext,
    request: &DigestPayload,
    script: &NarratorScript,
    work_dir: &Path,
) -> Result<NarratorAudio> {
    if let Some(existing) = &request.existing_tts_paths {
        verify_existing_paths(existing).await?;
        stage.log("Reusing narrator audio from previous run");
        return Ok(NarratorAudio {
            intro: existing.intro.clone(),
            transitions: existing.transitions.clone(),
            outro: existing.outro.clone(),
        });
    }

    let voice = TtsOptions {
        voice: Some(ctx.config.tts_default_voice.clone()),
        ..Default::default()
    };

    stage.log("Synthesizing narrator audio");
    let intro = work_dir.join("narrator_intro.mp3");
    ctx.tts.generate(&script.intro, &intro, &voice).await?;

    let mut transitions = Vec::with_capacity(script.transitions.len());
    for (i, text) in script.transitions.iter().enumerate() {
        let path = work_dir.join(format!("narrator_transition_{}.mp3", i));
        ctx.tts.generate(text, &path, &voice).await?;
        transitions.push(path);
    }

    let outro = work_dir.join("narrator_outro.mp3");
    ctx.tts.generate(&script.outro, &outro, &voice).await?;

    Ok(NarratorAudio { intro, transitions, outro })
}

async fn verify_existing_paths(existing: &ExistingTtsPaths) -> Result<()> {
    let mut all = vec![existing.intro.clone(), existing.outro.clone()];
    all.extend(existing.transitions.iter().cloned());

    for path in all {
        if tokio::fs::metadata(&path).await.is_err() {
            return Err(AppError::NotFound(format!(
                "existing TTS file missing: {}",
                path.display()
            )));
        }
    }
    Ok(())
}

fn build_script_prompt(clips: &[DigestClipRow], user_name: Option<&str>) -> String {
    let total_seconds: f64 = clips.iter().map(|c| c.duration).sum();

    let clip_lines = clips
        .iter()
        .enumerate()
        .map(|(i, c)| {
            format!(
                "{}. {} — \"{}\" ({:.0}s): {}",
                i + 1,
                c.podcast_title,
                c.episode_title,
                c.duration,
                c.summary
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let greeting = match user_name {
        Some(name) => format!("LISTENER NAME: {}\n", name),
        None => String::new(),
    };

    format!(
        "{}CLIP COUNT: {}\n\
         TOTAL CLIP DURATION: {:.1} minutes\n\n\
         CLIPS IN ORDER:\n{}",
        greeting,
        clips.len(),
        total_seconds / 60.0,
        clip_lines
    )
}

/// Playback order: intro, then clips with a transition between each
/// adjacent pair, then outro. When the script came back with the wrong
/// transition count, clips simply run back-to-back once transitions run
/// out.
fn build_sequence(
    intro: &Path,
    clips: &[PathBuf],
    transitions: &[PathBuf],
    outro: &Path,
) -> Vec<PathBuf> {
    let mut sequence = Vec::with_capacity(clips.len() * 2 + 1);
    sequence.push(intro.to_path_buf());

    for (i, clip) in clips.iter().enumerate() {
        sequence.push(clip.clone());
        if i + 1 < clips.len() {
            if let Some(transition) = transitions.get(i) {
                sequence.push(transition.clone());
            }
        }
    }

    sequence.push(outro.to_path_buf());
    sequence
}

/// Clip extraction owns the 50-80 band of the progress bar, rounding up
/// so the bar always moves.
fn clip_progress(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 80;
    }
    (50 + (done * 30 + total - 1) / total).min(80) as u8
}

fn estimate_duration_from_size(bytes: u64) -> f64 {
    bytes as f64 / CANONICAL_BYTES_PER_SECOND
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(prefix: &str, n: usize) -> Vec<PathBuf> {
        (0..n).map(|i| PathBuf::from(format!("/w/{}_{}.mp3", prefix, i))).collect()
    }

    #[test]
    fn sequence_interleaves_clips_and_transitions() {
        let clips = paths("clip", 6);
        let transitions = paths("narrator_transition", 5);
        let sequence = build_sequence(
            Path::new("/w/narrator_intro.mp3"),
            &clips,
            &transitions,
            Path::new("/w/narrator_outro.mp3"),
        );

        let names: Vec<String> = sequence
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "narrator_intro.mp3",
                "clip_0.mp3",
                "narrator_transition_0.mp3",
                "clip_1.mp3",
                "narrator_transition_1.mp3",
                "clip_2.mp3",
                "narrator_transition_2.mp3",
                "clip_3.mp3",
                "narrator_transition_3.mp3",
                "clip_4.mp3",
                "narrator_transition_4.mp3",
                "clip_5.mp3",
                "narrator_outro.mp3",
            ]
        );
    }

    #[test]
    fn short_transition_list_degrades_to_back_to_back_clips() {
        let clips = paths("clip", 3);
        let transitions = paths("narrator_transition", 1);
        let sequence = build_sequence(
            Path::new("/w/intro.mp3"),
            &clips,
            &transitions,
            Path::new("/w/outro.mp3"),
        );
        // intro, clip0, t0, clip1, clip2, outro
        assert_eq!(sequence.len(), 6);
        assert_eq!(sequence[3], clips[1]);
        assert_eq!(sequence[4], clips[2]);
    }

    #[test]
    fn single_clip_needs_no_transitions() {
        let clips = paths("clip", 1);
        let sequence = build_sequence(
            Path::new("/w/intro.mp3"),
            &clips,
            &[],
            Path::new("/w/outro.mp3"),
        );
        assert_eq!(sequence.len(), 3);
    }

    #[test]
    fn duration_estimate_assumes_canonical_bitrate() {
        // 128 kbps is 16384 bytes per second.
        assert!((estimate_duration_from_size(16384) - 1.0).abs() < 1e-9);
        assert!((estimate_duration_from_size(16384 * 420) - 420.0).abs() < 1e-9);
    }

    #[test]
    fn clip_progress_spans_50_to_80() {
        assert_eq!(clip_progress(1, 6), 55);
        assert_eq!(clip_progress(6, 6), 80);
        assert_eq!(clip_progress(1, 1), 80);
        let mut last = 50;
        for done in 1..=6 {
            let pct = clip_progress(done, 6);
            assert!(pct > last);
            last = pct;
        }
    }

    #[test]
    fn script_prompt_lists_clips_and_total_minutes() {
        let clips: Vec<DigestClipRow> = (0..2)
            .map(|i| DigestClipRow {
                clip_id: uuid::Uuid::new_v4(),
                position: i,
                episode_id: uuid::Uuid::new_v4(),
                start_time: 0.0,
                end_time: 90.0,
                duration: 90.0,
                summary: "a story".to_string(),
                audio_url: "https://example.com/ep.mp3".to_string(),
                episode_title: format!("Episode {}", i),
                podcast_title: "The Show".to_string(),
            })
            .collect();

        let prompt = build_script_prompt(&clips, Some("Sam"));
        assert!(prompt.contains("LISTENER NAME: Sam"));
        assert!(prompt.contains("CLIP COUNT: 2"));
        assert!(prompt.contains("TOTAL CLIP DURATION: 3.0 minutes"));
        assert!(prompt.contains("1. The Show — \"Episode 0\" (90s): a story"));
    }
}
