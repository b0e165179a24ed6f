//! Working-directory manager for transient audio files. Everything under
//! the temp root is reproducible from upstream data; the digest root holds
//! the published artifacts and is never cleaned.

use crate::config::Config;
use crate::error::Result;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct BlobCache {
    temp_root: PathBuf,
    digest_root: PathBuf,
}

impl BlobCache {
    pub fn new(config: &Config) -> Self {
        Self {
            temp_root: config.temp_root.clone(),
            digest_root: config.digest_root.clone(),
        }
    }

    /// Temp path for a downloaded episode, e.g. `{root}/episodes/{id}.mp3`.
    pub fn episode_temp(&self, episode_id: Uuid, ext: &str) -> PathBuf {
        self.temp_root
            .join("episodes")
            .join(format!("{}.{}", episode_id, ext))
    }

    /// Directory for an episode's transcription chunks. Caller creates it.
    pub fn chunk_dir(&self, episode_id: Uuid) -> PathBuf {
        self.temp_root
            .join("episodes")
            .join(format!("{}_chunks", episode_id))
    }

    /// Scratch directory for one digest's narrator/clip files.
    pub fn digest_work_dir(&self, digest_id: Uuid) -> PathBuf {
        self.temp_root
            .join("episodes")
            .join(format!("{}_chunks", digest_id))
    }

    /// Durable location of the published digest MP3.
    pub fn digest_output_path(&self, digest_id: Uuid) -> PathBuf {
        self.digest_root.join(format!("{}.mp3", digest_id))
    }

    /// Remove a file or directory tree. Idempotent; a missing path is not
    /// an error.
    pub async fn cleanup(&self, path: &Path) -> Result<()> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => {
                tokio::fs::remove_dir_all(path).await?;
            }
            Ok(_) => {
                tokio::fs::remove_file(path).await?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cache_at(root: &Path) -> BlobCache {
        let config = Config {
            temp_root: root.to_path_buf(),
            digest_root: root.join("digests"),
            ..test_config()
        };
        BlobCache::new(&config)
    }

    fn test_config() -> Config {
        Config {
            database_url: String::new(),
            redis_url: String::new(),
            anthropic_api_key: None,
            openai_api_key: None,
            llm_provider: crate::config::LlmProviderKind::Anthropic,
            default_llm_model: "claude-sonnet".to_string(),
            llm_fallback_to_openai: false,
            stt_mode: crate::config::SttMode::Api,
            stt_model: "whisper-1".to_string(),
            stt_max_file_size: 25 * 1024 * 1024,
            target_chunk_size: 22 * 1024 * 1024,
            default_chunk_duration_seconds: 1200.0,
            chunk_overlap_seconds: 2.0,
            whisper_binary: "whisper-cli".to_string(),
            whisper_model_path: None,
            tts_provider: crate::config::TtsProviderKind::Mock,
            tts_default_voice: "alloy".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            temp_root: PathBuf::from("/tmp/sifter"),
            digest_root: PathBuf::from("/tmp/sifter/digests"),
            download_timeout: Duration::from_secs(1800),
            orchestrator_poll_interval: Duration::from_secs(5),
            orchestrator_poll_ceiling: Duration::from_secs(1200),
            queue_concurrency: 4,
        }
    }

    #[test]
    fn paths_are_keyed_by_entity() {
        let cache = cache_at(Path::new("/tmp/sifter-test"));
        let id = Uuid::nil();
        assert_eq!(
            cache.episode_temp(id, "mp3"),
            PathBuf::from(format!("/tmp/sifter-test/episodes/{}.mp3", id))
        );
        assert_eq!(
            cache.chunk_dir(id),
            PathBuf::from(format!("/tmp/sifter-test/episodes/{}_chunks", id))
        );
        assert_eq!(
            cache.digest_output_path(id),
            PathBuf::from(format!("/tmp/sifter-test/digests/{}.mp3", id))
        );
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path());

        let file = dir.path().join("scratch.mp3");
        tokio::fs::write(&file, b"x").await.unwrap();
        cache.cleanup(&file).await.unwrap();
        assert!(!file.exists());
        // Second pass: already gone, still Ok.
        cache.cleanup(&file).await.unwrap();

        let sub = dir.path().join("work");
        tokio::fs::create_dir_all(sub.join("nested")).await.unwrap();
        tokio::fs::write(sub.join("nested/a.mp3"), b"x").await.unwrap();
        cache.cleanup(&sub).await.unwrap();
        assert!(!sub.exists());
    }
}
