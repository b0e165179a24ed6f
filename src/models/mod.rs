pub mod clip;
pub mod digest;
pub mod episode;
pub mod podcast;
pub mod user;

pub use clip::{Clip, ClipCandidate, NewClip};
pub use digest::{Digest, DigestClip, DigestClipRow, DigestStatus, NarratorScript};
pub use episode::{Episode, EpisodeStatus, Transcript, TranscriptSegment};
pub use podcast::Podcast;
pub use user::{DigestFrequency, User};
