//! Audio Toolkit
//!
//! Thin, stateless wrapper around ffmpeg/ffprobe. Every intermediate file
//! the pipeline produces shares the canonical format (128 kbps, 44.1 kHz,
//! stereo MP3) so concatenation works at the container level with stream
//! copy. Binary paths come from configuration; nothing here assumes an
//! install location.

#![allow(dead_code)]

use crate::config::Config;
use crate::error::{AppError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

pub const CANONICAL_BITRATE: &str = "128k";
pub const CANONICAL_SAMPLE_RATE: u32 = 44100;
pub const CANONICAL_CHANNELS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bitrate {
    Kbps64,
    Kbps96,
    Kbps128,
}

impl Bitrate {
    pub fn as_arg(&self) -> &'static str {
        match self {
            Bitrate::Kbps64 => "64k",
            Bitrate::Kbps96 => "96k",
            Bitrate::Kbps128 => "128k",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub duration: f64,
    pub sample_rate: u32,
    pub channels: u32,
    pub codec: String,
    pub bitrate_kbps: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct SliceOptions {
    pub start_time: f64,
    pub end_time: f64,
    pub fade_in: f64,
    pub fade_out: f64,
}

#[derive(Debug, Clone)]
pub struct MixTrack {
    pub path: PathBuf,
    pub volume: f64,
}

/// Output-codec selection for a built command.
#[derive(Debug, Clone)]
enum OutputCodec {
    /// Re-encode to the canonical format at the given bitrate.
    Mp3(&'static str),
    /// Container-level stream copy.
    Copy,
}

/// Typed ffmpeg argument builder. Argument order is emitted by `build`, not
/// by call order, which pins the fast-seek convention: `-ss` always lands
/// ahead of the first `-i` so ffmpeg seeks on the demuxer before decoding.
#[derive(Debug, Clone)]
struct FfmpegCommand {
    fast_seek: Option<f64>,
    input_format: Option<&'static str>,
    inputs: Vec<PathBuf>,
    limit_duration: Option<f64>,
    audio_filter: Option<String>,
    filter_complex: Option<(String, String)>,
    codec: OutputCodec,
    output: PathBuf,
}

impl FfmpegCommand {
    fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            fast_seek: None,
            input_format: None,
            inputs: Vec::new(),
            limit_duration: None,
            audio_filter: None,
            filter_complex: None,
            codec: OutputCodec::Mp3(CANONICAL_BITRATE),
            output: output.into(),
        }
    }

    fn fast_seek(mut self, seconds: f64) -> Self {
        self.fast_seek = Some(seconds);
        self
    }

    fn input_format(mut self, format: &'static str) -> Self {
        self.input_format = Some(format);
        self
    }

    fn input(mut self, path: impl Into<PathBuf>) -> Self {
        self.inputs.push(path.into());
        self
    }

    fn limit_duration(mut self, seconds: f64) -> Self {
        self.limit_duration = Some(seconds);
        self
    }

    fn audio_filter(mut self, filter: impl Into<String>) -> Self {
        self.audio_filter = Some(filter.into());
        self
    }

    /// Filtergraph plus the output pad label to map.
    fn filter_complex(mut self, graph: impl Into<String>, map: impl Into<String>) -> Self {
        self.filter_complex = Some((graph.into(), map.into()));
        self
    }

    fn bitrate(mut self, bitrate: Bitrate) -> Self {
        self.codec = OutputCodec::Mp3(bitrate.as_arg());
        self
    }

    fn copy_codec(mut self) -> Self {
        self.codec = OutputCodec::Copy;
        self
    }

    fn build(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-y".into(),
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-nostdin".into(),
        ];

        if let Some(seek) = self.fast_seek {
            args.push("-ss".into());
            args.push(format!("{:.3}", seek));
        }

        for input in &self.inputs {
            if let Some(format) = self.input_format {
                args.push("-f".into());
                args.push(format.into());
                args.push("-safe".into());
                args.push("0".into());
            }
            args.push("-i".into());
            args.push(input.display().to_string());
        }

        if let Some(duration) = self.limit_duration {
            args.push("-t".into());
            args.push(format!("{:.3}", duration));
        }

        if let Some(filter) = &self.audio_filter {
            args.push("-af".into());
            args.push(filter.clone());
        }

        if let Some((graph, map)) = &self.filter_complex {
            args.push("-filter_complex".into());
            args.push(graph.clone());
            args.push("-map".into());
            args.push(map.clone());
        }

        match &self.codec {
            OutputCodec::Mp3(bitrate) => {
                args.push("-c:a".into());
                args.push("libmp3lame".into());
                args.push("-b:a".into());
                args.push((*bitrate).into());
                args.push("-ar".into());
                args.push(CANONICAL_SAMPLE_RATE.to_string());
                args.push("-ac".into());
                args.push(CANONICAL_CHANNELS.to_string());
            }
            OutputCodec::Copy => {
                args.push("-c".into());
                args.push("copy".into());
            }
        }

        args.push(self.output.display().to_string());
        args
    }
}

#[derive(Debug, Clone)]
pub struct AudioToolkit {
    ffmpeg: String,
    ffprobe: String,
}

impl AudioToolkit {
    pub fn new(config: &Config) -> Self {
        Self {
            ffmpeg: config.ffmpeg_path.clone(),
            ffprobe: config.ffprobe_path.clone(),
        }
    }

    /// True when the configured ffmpeg binary runs at all.
    pub async fn available(&self) -> bool {
        Command::new(&self.ffmpeg)
            .arg("-version")
            .output()
            .await
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    pub async fn probe(&self, path: &Path) -> Result<ProbeResult> {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .output()
            .await
            .map_err(|e| AppError::Subprocess(format!("failed to spawn {}: {}", self.ffprobe, e)))?;

        if !output.status.success() {
            return Err(AppError::Subprocess(format!(
                "ffprobe failed on {}: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        parse_probe_output(&String::from_utf8_lossy(&output.stdout))
    }

    /// Cut `[start_time, end_time]` into a canonical-format clip with fades.
    /// The fast seek happens before the input is opened, so decode cost is
    /// proportional to the clip, not the episode.
    pub async fn slice_clip(&self, input: &Path, output: &Path, opts: SliceOptions) -> Result<()> {
        let length = opts.end_time - opts.start_time;
        if length <= 0.0 {
            return Err(AppError::InvariantViolation(format!(
                "clip slice has non-positive length: start={} end={}",
                opts.start_time, opts.end_time
            )));
        }

        let cmd = FfmpegCommand::new(output)
            .fast_seek(opts.start_time)
            .input(input)
            .limit_duration(length)
            .audio_filter(fade_filter(length, opts.fade_in, opts.fade_out));

        self.run(cmd).await
    }

    /// Re-encode a `[start, start+duration]` window to the canonical
    /// format, fast-seeking before the input opens so timestamps stay
    /// monotonic across windows.
    pub async fn extract_window(
        &self,
        input: &Path,
        output: &Path,
        start_time: f64,
        duration: f64,
    ) -> Result<()> {
        let cmd = FfmpegCommand::new(output)
            .fast_seek(start_time)
            .input(input)
            .limit_duration(duration);

        self.run(cmd).await
    }

    pub async fn compress(&self, input: &Path, output: &Path, bitrate: Bitrate) -> Result<()> {
        let cmd = FfmpegCommand::new(output).input(input).bitrate(bitrate);
        self.run(cmd).await
    }

    /// Concatenate canonical-format files. A single input is copied
    /// unchanged; multiple inputs go through the concat demuxer with stream
    /// copy, which is lossless for same-format MP3s.
    pub async fn concatenate(&self, inputs: &[PathBuf], output: &Path) -> Result<()> {
        match inputs {
            [] => Err(AppError::InvariantViolation(
                "concatenate called with no inputs".to_string(),
            )),
            [single] => {
                ensure_parent_dir(output).await?;
                tokio::fs::copy(single, output).await?;
                Ok(())
            }
            _ => {
                ensure_parent_dir(output).await?;
                let list_path = output.with_extension("concat.txt");
                tokio::fs::write(&list_path, concat_list(inputs)).await?;

                let cmd = FfmpegCommand::new(output)
                    .input_format("concat")
                    .input(&list_path)
                    .copy_codec();
                let result = self.run(cmd).await;

                let _ = tokio::fs::remove_file(&list_path).await;
                result
            }
        }
    }

    pub async fn add_fades(
        &self,
        input: &Path,
        output: &Path,
        fade_in: f64,
        fade_out: f64,
    ) -> Result<()> {
        let probed = self.probe(input).await?;
        let cmd = FfmpegCommand::new(output)
            .input(input)
            .audio_filter(fade_filter(probed.duration, fade_in, fade_out));

        self.run(cmd).await
    }

    /// Mix N tracks with per-track gain; output runs as long as the longest
    /// input.
    pub async fn mix_tracks(&self, tracks: &[MixTrack], output: &Path) -> Result<()> {
        if tracks.is_empty() {
            return Err(AppError::InvariantViolation(
                "mix_tracks called with no tracks".to_string(),
            ));
        }

        let mut cmd = FfmpegCommand::new(output);
        for track in tracks {
            cmd = cmd.input(&track.path);
        }

        let (graph, map) = mix_filtergraph(tracks);
        self.run(cmd.filter_complex(graph, map)).await
    }

    async fn run(&self, cmd: FfmpegCommand) -> Result<()> {
        ensure_parent_dir(&cmd.output).await?;

        let args = cmd.build();
        debug!("{} {}", self.ffmpeg, args.join(" "));

        let output = Command::new(&self.ffmpeg)
            .args(&args)
            .output()
            .await
            .map_err(|e| AppError::Subprocess(format!("failed to spawn {}: {}", self.ffmpeg, e)))?;

        if !output.status.success() {
            return Err(AppError::Subprocess(format!(
                "ffmpeg exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        Ok(())
    }
}

async fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

fn fade_filter(length: f64, fade_in: f64, fade_out: f64) -> String {
    let fade_out_start = (length - fade_out).max(0.0);
    format!(
        "afade=t=in:st=0:d={:.3},afade=t=out:st={:.3}:d={:.3}",
        fade_in, fade_out_start, fade_out
    )
}

fn concat_list(inputs: &[PathBuf]) -> String {
    let mut list = String::new();
    for input in inputs {
        // ffconcat single-quote escaping: ' -> '\''
        let escaped = input.display().to_string().replace('\'', "'\\''");
        list.push_str(&format!("file '{}'\n", escaped));
    }
    list
}

fn mix_filtergraph(tracks: &[MixTrack]) -> (String, String) {
    let mut graph = String::new();
    for (i, track) in tracks.iter().enumerate() {
        graph.push_str(&format!("[{}:a]volume={:.3}[a{}];", i, track.volume, i));
    }
    for i in 0..tracks.len() {
        graph.push_str(&format!("[a{}]", i));
    }
    graph.push_str(&format!(
        "amix=inputs={}:duration=longest[mix]",
        tracks.len()
    ));
    (graph, "[mix]".to_string())
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    sample_rate: Option<String>,
    channels: Option<u32>,
}

fn parse_probe_output(raw: &str) -> Result<ProbeResult> {
    let parsed: FfprobeOutput = serde_json::from_str(raw)
        .map_err(|e| AppError::Parse(format!("unreadable ffprobe output: {}", e)))?;

    let format = parsed
        .format
        .ok_or_else(|| AppError::Parse("ffprobe output missing format section".to_string()))?;

    let duration = format
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .ok_or_else(|| AppError::Parse("ffprobe output missing duration".to_string()))?;

    let bitrate_kbps = format
        .bit_rate
        .as_deref()
        .and_then(|b| b.parse::<u64>().ok())
        .map(|bps| (bps / 1000) as u32)
        .unwrap_or(0);

    let audio = parsed
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"))
        .ok_or_else(|| AppError::Parse("no audio stream in ffprobe output".to_string()))?;

    Ok(ProbeResult {
        duration,
        sample_rate: audio
            .sample_rate
            .as_deref()
            .and_then(|r| r.parse().ok())
            .unwrap_or(0),
        channels: audio.channels.unwrap_or(0),
        codec: audio.codec_name.clone().unwrap_or_default(),
        bitrate_kbps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_seek_precedes_input() {
        let args = FfmpegCommand::new("/tmp/out.mp3")
            .fast_seek(120.0)
            .input("/tmp/in.mp3")
            .limit_duration(90.0)
            .build();

        let ss = args.iter().position(|a| a == "-ss").unwrap();
        let i = args.iter().position(|a| a == "-i").unwrap();
        assert!(ss < i, "-ss must come before -i: {:?}", args);
        assert_eq!(args[ss + 1], "120.000");
        assert_eq!(args.last().unwrap(), "/tmp/out.mp3");
    }

    #[test]
    fn canonical_encode_args() {
        let args = FfmpegCommand::new("/tmp/out.mp3").input("/tmp/in.mp3").build();
        let joined = args.join(" ");
        assert!(joined.contains("-c:a libmp3lame"));
        assert!(joined.contains("-b:a 128k"));
        assert!(joined.contains("-ar 44100"));
        assert!(joined.contains("-ac 2"));
    }

    #[test]
    fn concat_uses_stream_copy() {
        let args = FfmpegCommand::new("/tmp/out.mp3")
            .input_format("concat")
            .input("/tmp/list.txt")
            .copy_codec()
            .build();
        let joined = args.join(" ");
        assert!(joined.contains("-f concat -safe 0 -i /tmp/list.txt"));
        assert!(joined.contains("-c copy"));
        assert!(!joined.contains("libmp3lame"));
    }

    #[test]
    fn fade_filter_clamps_fade_out_start() {
        assert_eq!(
            fade_filter(90.0, 0.3, 0.3),
            "afade=t=in:st=0:d=0.300,afade=t=out:st=89.700:d=0.300"
        );
        // Shorter than the fade: fade-out starts at zero rather than negative.
        assert_eq!(
            fade_filter(0.2, 0.3, 0.3),
            "afade=t=in:st=0:d=0.300,afade=t=out:st=0.000:d=0.300"
        );
    }

    #[test]
    fn concat_list_escapes_quotes() {
        let list = concat_list(&[
            PathBuf::from("/tmp/a.mp3"),
            PathBuf::from("/tmp/it's here.mp3"),
        ]);
        assert_eq!(list, "file '/tmp/a.mp3'\nfile '/tmp/it'\\''s here.mp3'\n");
    }

    #[test]
    fn mix_filtergraph_per_track_gain() {
        let (graph, map) = mix_filtergraph(&[
            MixTrack { path: PathBuf::from("a.mp3"), volume: 1.0 },
            MixTrack { path: PathBuf::from("b.mp3"), volume: 0.25 },
        ]);
        assert_eq!(
            graph,
            "[0:a]volume=1.000[a0];[1:a]volume=0.250[a1];[a0][a1]amix=inputs=2:duration=longest[mix]"
        );
        assert_eq!(map, "[mix]");
    }

    #[test]
    fn probe_output_parses() {
        let raw = r#"{
            "streams": [
                {"codec_type": "audio", "codec_name": "mp3", "sample_rate": "44100", "channels": 2}
            ],
            "format": {"duration": "1083.428571", "bit_rate": "128000"}
        }"#;
        let probed = parse_probe_output(raw).unwrap();
        assert!((probed.duration - 1083.428571).abs() < 1e-9);
        assert_eq!(probed.sample_rate, 44100);
        assert_eq!(probed.channels, 2);
        assert_eq!(probed.codec, "mp3");
        assert_eq!(probed.bitrate_kbps, 128);
    }

    #[test]
    fn probe_output_without_audio_stream_is_an_error() {
        let raw = r#"{"streams": [{"codec_type": "video"}], "format": {"duration": "1.0"}}"#;
        assert!(parse_probe_output(raw).is_err());
    }
}
