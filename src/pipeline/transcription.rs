//! Transcription stage: one episode in, one canonical timestamped
//! transcript out. Oversized audio is compressed and, if still over the
//! STT upload limit, time-sliced into overlapping windows whose
//! transcripts are merged back onto the original timeline.

use crate::error::{AppError, Result};
use crate::models::{EpisodeStatus, Transcript, TranscriptSegment};
use crate::pipeline::{payload, AppContext, StageContext, TranscriptionPayload};
use crate::services::audio::Bitrate;
use crate::services::queue::Job;
use crate::services::stt::{SttOptions, SttResult};
use crate::store;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// How far a window may stretch past the configured duration target when
/// the stream's bitrate leaves headroom under the chunk byte target.
/// Compressed 64 kbps audio packs more seconds per byte, so its windows
/// run a quarter longer than the 128 kbps default.
const WINDOW_STRETCH_FACTOR: f64 = 1.25;

/// One slice of the source audio on the original timeline.
#[derive(Debug, Clone)]
pub struct ChunkWindow {
    pub index: usize,
    pub path: PathBuf,
    pub start_time: f64,
    pub end_time: f64,
    pub duration: f64,
}

/// A window plus what the STT service made of it.
#[derive(Debug)]
pub struct ChunkTranscript {
    pub window: ChunkWindow,
    pub result: SttResult,
}

pub async fn handle(ctx: Arc<AppContext>, job: Job) -> Result<serde_json::Value> {
    let request: TranscriptionPayload = payload(&job)?;

    match run(&ctx, &job, &request).await {
        Ok(transcript) => Ok(serde_json::json!({
            "episodeId": request.episode_id,
            "segments": transcript.segments.len(),
            "duration": transcript.duration,
        })),
        Err(e) => {
            // A busy episode belongs to another worker; leave its status
            // alone. Everything else marks the episode failed before the
            // queue decides on a retry.
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
    request: &TranscriptionPayload,
) -> Result<Transcript> {
    let episode_id = request.episode_id;
    let episode = store::episodes::get(&ctx.db, episode_id).await?;

    // Shared-transcript dedup: hand back existing work instead of paying
    // for the STT call twice. A pending or failed row that already carries
    // a transcript gets its status repaired so analysis can pick it up.
    if let Some(transcript) = episode.transcript() {
        let transcript = transcript.clone();
        if matches!(episode.status, EpisodeStatus::Pending | EpisodeStatus::Failed) {
            store::episodes::transition(
                &ctx.db,
                episode_id,
                &[EpisodeStatus::Pending, EpisodeStatus::Failed],
                EpisodeStatus::Transcribed,
            )
            .await?;
        }
        stage.log(&format!("Episode {} already transcribed, skipping", episode_id));
        return Ok(transcript);
    }
    match episode.status {
        EpisodeStatus::Transcribed | EpisodeStatus::Analyzing | EpisodeStatus::Analyzed => {
            return Err(AppError::InvariantViolation(format!(
                "episode {} is {} but has no transcript",
                episode_id,
                episode.status.as_str()
            )));
        }
        EpisodeStatus::Downloading | EpisodeStatus::Transcribing => {
            return Err(AppError::Busy(format!(
                "episode {} is already being processed",
                episode_id
            )));
        }
        EpisodeStatus::Pending | EpisodeStatus::Failed => {}
    }

    let claimed = store::episodes::transition(
        &ctx.db,
        episode_id,
        &[EpisodeStatus::Pending, EpisodeStatus::Failed],
        EpisodeStatus::Downloading,
    )
    .await?;
    if !claimed {
        return Err(AppError::Busy(format!(
            "episode {} was claimed by another worker",
            episode_id
        )));
    }

    let source_path = ctx.blobs.episode_temp(episode_id, "mp3");
    let compressed_path = ctx.blobs.episode_temp(episode_id, "64k.mp3");
    let chunk_dir = ctx.blobs.chunk_dir(episode_id);

    let outcome = transcribe_episode(ctx, stage, request, &source_path, &compressed_path).await;

    // Temp and chunk files go regardless of how the attempt ended.
    for path in [&source_path, &compressed_path] {
        if let Err(e) = ctx.blobs.cleanup(path).await {
            warn!("Cleanup of {} failed: {}", path.display(), e);
        }
    }
    if let Err(e) = ctx.blobs.cleanup(&chunk_dir).await {
        warn!("Cleanup of {} failed: {}", chunk_dir.display(), e);
    }

    let transcript = outcome?;
    store::episodes::set_transcript(&ctx.db, episode_id, &transcript).await?;
    info!(
        "Episode {} transcribed: {} segments over {:.0}s",
        episode_id,
        transcript.segments.len(),
        transcript.duration
    );

    Ok(transcript)
}

async fn transcribe_episode(
    ctx: &AppContext,
    stage: &dyn StageContext,
    request: &TranscriptionPayload,
    source_path: &PathBuf,
    compressed_path: &PathBuf,
) -> Result<Transcript> {
    let episode_id = request.episode_id;

    stage.log(&format!("Downloading {}", request.audio_url));
    let bytes = ctx.downloader.download_to(&request.audio_url, source_path).await?;

    let windows =
        prepare_chunks(ctx, stage, episode_id, bytes, source_path, compressed_path).await?;

    let moved = store::episodes::transition(
        &ctx.db,
        episode_id,
        &[EpisodeStatus::Downloading],
        EpisodeStatus::Transcribing,
    )
    .await?;
    if !moved {
        return Err(AppError::Busy(format!(
            "episode {} left the downloading state unexpectedly",
            episode_id
        )));
    }

    // Chunks run sequentially: STT providers rate-limit hard, and the
    // first chunk's detected language pins the rest.
    let total = windows.len();
    let mut language: Option<String> = None;
    let mut chunks = Vec::with_capacity(total);

    for window in windows {
        stage.log(&format!(
            "Transcribing chunk {}/{} [{:.0}s - {:.0}s]",
            window.index + 1,
            total,
            window.start_time,
            window.end_time
        ));
        let result = ctx
            .stt
            .transcribe(&window.path, &SttOptions { language: language.clone() })
            .await?;

        if language.is_none() {
            language = result.language.clone();
        }

        let done = window.index + 1;
        stage.update_progress(progress_pct(done, total)).await;
        chunks.push(ChunkTranscript { window, result });
    }

    Ok(merge_chunks(chunks))
}

/// Decide how the source reaches the STT service: as-is, compressed once,
/// or compressed and sliced into overlapping windows.
async fn prepare_chunks(
    ctx: &AppContext,
    stage: &dyn StageContext,
    episode_id: Uuid,
    source_bytes: u64,
    source_path: &PathBuf,
    compressed_path: &PathBuf,
) -> Result<Vec<ChunkWindow>> {
    let limit = ctx.config.stt_max_file_size;

    // Strictly greater: a file exactly at the limit still fits.
    if source_bytes <= limit {
        stage.log(&format!(
            "Source is {} bytes, under the {} byte STT limit",
            source_bytes, limit
        ));
        return Ok(vec![whole_file_window(source_path.clone())]);
    }

    stage.log(&format!(
        "Source is {} bytes, compressing to {} before chunking",
        source_bytes,
        Bitrate::Kbps64.as_arg()
    ));
    ctx.audio.compress(source_path, compressed_path, Bitrate::Kbps64).await?;

    let compressed_bytes = tokio::fs::metadata(compressed_path).await?.len();
    if compressed_bytes <= limit {
        stage.log(&format!("Compressed to {} bytes, single chunk", compressed_bytes));
        return Ok(vec![whole_file_window(compressed_path.clone())]);
    }

    let probed = ctx.audio.probe(compressed_path).await?;
    let window = window_seconds(
        ctx.config.default_chunk_duration_seconds,
        ctx.config.target_chunk_size,
        probed.bitrate_kbps,
    );
    let spans = plan_windows(probed.duration, window, ctx.config.chunk_overlap_seconds);
    stage.log(&format!(
        "Compressed file is still {} bytes; slicing {:.0}s of audio into {} windows",
        compressed_bytes,
        probed.duration,
        spans.len()
    ));

    let chunk_dir = ctx.blobs.chunk_dir(episode_id);
    tokio::fs::create_dir_all(&chunk_dir).await?;

    let mut windows = Vec::with_capacity(spans.len());
    for (index, (start, end)) in spans.into_iter().enumerate() {
        let path = chunk_dir.join(format!("chunk_{:03}.mp3", index));
        ctx.audio
            .extract_window(compressed_path, &path, start, end - start)
            .await?;
        windows.push(ChunkWindow {
            index,
            path,
            start_time: start,
            end_time: end,
            duration: end - start,
        });
    }

    Ok(windows)
}

fn whole_file_window(path: PathBuf) -> ChunkWindow {
    ChunkWindow {
        index: 0,
        path,
        start_time: 0.0,
        end_time: 0.0,
        duration: 0.0,
    }
}

/// Window length for time-slicing: as many seconds as fit the chunk byte
/// target at the stream's bitrate, capped at the configured duration
/// target plus its stretch allowance. Both knobs are operator-facing;
/// shrinking either shrinks the windows.
pub fn window_seconds(duration_target: f64, target_chunk_bytes: u64, bitrate_kbps: u32) -> f64 {
    // The compression pass encodes at 64 kbps; treat an unreadable probe
    // bitrate as that.
    let kbps = if bitrate_kbps == 0 { 64 } else { bitrate_kbps };
    let bytes_per_second = kbps as f64 * 1000.0 / 8.0;
    let size_cap = target_chunk_bytes as f64 / bytes_per_second;

    size_cap.min(duration_target * WINDOW_STRETCH_FACTOR)
}

/// Overlapping window plan over `[0, duration]`. Consecutive windows share
/// `overlap` seconds as a safety margin against STT cutting words at the
/// boundary; the merge keeps both copies.
pub fn plan_windows(duration: f64, window: f64, overlap: f64) -> Vec<(f64, f64)> {
    let step = (window - overlap).max(1.0);
    let mut spans = Vec::new();
    let mut start = 0.0;

    while start < duration {
        let end = (start + window).min(duration);
        spans.push((start, end));
        if end >= duration {
            break;
        }
        start += step;
    }

    if spans.is_empty() {
        spans.push((0.0, duration.max(0.0)));
    }
    spans
}

/// Stitch per-chunk transcripts back onto the original timeline: offset
/// each chunk's segment timestamps by the chunk's start, concatenate the
/// texts, and sort the combined segment list. Overlap-region duplicates
/// are kept; the overlap exists to survive STT cutoffs, not to filter
/// content.
pub fn merge_chunks(chunks: Vec<ChunkTranscript>) -> Transcript {
    let mut segments: Vec<TranscriptSegment> = Vec::new();
    let mut texts: Vec<String> = Vec::new();
    let mut language: Option<String> = None;
    let mut duration: f64 = 0.0;

    for chunk in &chunks {
        let offset = chunk.window.start_time;
        for segment in &chunk.result.segments {
            segments.push(TranscriptSegment {
                start: segment.start + offset,
                end: segment.end + offset,
                text: segment.text.clone(),
            });
        }
        if !chunk.result.text.is_empty() {
            texts.push(chunk.result.text.clone());
        }
        if language.is_none() {
            language = chunk.result.language.clone();
        }

        let chunk_extent = offset + chunk.result.duration.unwrap_or(chunk.window.duration);
        duration = duration.max(chunk_extent);
    }

    segments.sort_by(|a, b| a.start.partial_cmp(&b.start).unwrap_or(std::cmp::Ordering::Equal));

    Transcript {
        text: texts.join(" "),
        segments,
        language: language.unwrap_or_else(|| "en".to_string()),
        duration,
    }
}

/// Monotonic chunk progress, done/total scaled to 100 and rounded up.
fn progress_pct(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done * 100 + total - 1) / total).min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(start: f64, end: f64, segments: Vec<(f64, f64, &str)>, reported: Option<f64>) -> ChunkTranscript {
        let text = segments.iter().map(|(_, _, t)| *t).collect::<Vec<_>>().join(" ");
        ChunkTranscript {
            window: ChunkWindow {
                index: 0,
                path: PathBuf::from("/tmp/chunk.mp3"),
                start_time: start,
                end_time: end,
                duration: end - start,
            },
            result: SttResult {
                text,
                segments: segments
                    .into_iter()
                    .map(|(s, e, t)| TranscriptSegment { start: s, end: e, text: t.to_string() })
                    .collect(),
                language: Some("en".to_string()),
                duration: reported,
            },
        }
    }

    #[test]
    fn single_chunk_merges_without_offsets() {
        let merged = merge_chunks(vec![chunk(
            0.0,
            1080.0,
            vec![(0.0, 4.0, "First."), (4.0, 9.5, "Second.")],
            Some(1080.0),
        )]);
        assert_eq!(merged.text, "First. Second.");
        assert_eq!(merged.segments[0].start, 0.0);
        assert_eq!(merged.segments[1].end, 9.5);
        assert_eq!(merged.duration, 1080.0);
        assert_eq!(merged.language, "en");
    }

    #[test]
    fn offsets_apply_and_segments_sort() {
        let merged = merge_chunks(vec![
            chunk(1498.0, 2998.0, vec![(0.5, 5.0, "Later words.")], Some(1500.0)),
            chunk(0.0, 1500.0, vec![(0.0, 6.0, "Early words.")], Some(1500.0)),
        ]);
        // Sorted by absolute start despite arrival order.
        assert_eq!(merged.segments[0].text, "Early words.");
        assert_eq!(merged.segments[1].start, 1498.5);
        assert_eq!(merged.segments[1].end, 1503.0);
        // Max of (chunkStart + reported duration).
        assert_eq!(merged.duration, 2998.0);
        // Every merged segment starts at or after its chunk's window start.
        assert!(merged.segments[1].start >= 1498.0);
    }

    #[test]
    fn merge_falls_back_to_window_duration() {
        let merged = merge_chunks(vec![chunk(3000.0, 3600.0, vec![(0.0, 595.0, "Tail.")], None)]);
        assert_eq!(merged.duration, 3600.0);
    }

    #[test]
    fn window_length_follows_both_sizing_knobs() {
        let target_bytes = 22 * 1024 * 1024;

        // Compressed 64 kbps stream at the defaults: the byte target
        // would allow ~2884s, so the duration cap wins at 25 minutes.
        assert!((window_seconds(1200.0, target_bytes, 64) - 1500.0).abs() < 1e-9);

        // At 128 kbps the byte target binds first (~1442s).
        let w = window_seconds(1200.0, target_bytes, 128);
        assert!((w - 1441.792).abs() < 1e-3);

        // A smaller byte target shrinks the window directly.
        let w = window_seconds(1200.0, 8 * 1024 * 1024, 64);
        assert!((w - 1048.576).abs() < 1e-3);

        // A smaller duration target shrinks the cap.
        assert!((window_seconds(600.0, target_bytes, 64) - 750.0).abs() < 1e-9);

        // An unreadable probe bitrate falls back to the compression
        // bitrate rather than dividing by zero.
        assert_eq!(
            window_seconds(1200.0, target_bytes, 0),
            window_seconds(1200.0, target_bytes, 64)
        );
    }

    #[test]
    fn window_plan_covers_full_duration_with_overlap() {
        // One hour at 25-minute windows, 2 s overlap: 0-1500, 1498-2998,
        // 2996-3600.
        let spans = plan_windows(3600.0, 1500.0, 2.0);
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[0], (0.0, 1500.0));
        assert_eq!(spans[1], (1498.0, 2998.0));
        assert_eq!(spans[2], (2996.0, 3600.0));
        // Adjacent windows overlap by exactly the configured margin.
        assert!((spans[0].1 - spans[1].0 - 2.0).abs() < 1e-9);
    }

    #[test]
    fn short_audio_is_one_window() {
        let spans = plan_windows(600.0, 1500.0, 2.0);
        assert_eq!(spans, vec![(0.0, 600.0)]);
    }

    #[test]
    fn progress_is_monotonic_and_caps_at_100() {
        assert_eq!(progress_pct(1, 3), 34);
        assert_eq!(progress_pct(2, 3), 67);
        assert_eq!(progress_pct(3, 3), 100);
        assert_eq!(progress_pct(1, 1), 100);
        let mut last = 0;
        for done in 1..=7 {
            let pct = progress_pct(done, 7);
            assert!(pct > last);
            last = pct;
        }
    }
}
