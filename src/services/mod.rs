pub mod audio;
pub mod blob_cache;
pub mod download;
pub mod llm;
pub mod queue;
pub mod stt;
pub mod tts;

pub use audio::AudioToolkit;
pub use blob_cache::BlobCache;
pub use llm::LlmAdapter;
pub use queue::Queue;
