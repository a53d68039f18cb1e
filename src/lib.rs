/// tubedex - channel-wide transcript search
///
/// Indexes the spoken content of a curated set of YouTube channels and
/// serves stem-tolerant phrase search over the transcripts. Captions come
/// from the platform when available; everything else goes through a local
/// download/transcode/transcribe pipeline driven by a persistent failure
/// queue.

pub mod config;
pub mod error;
pub mod index;
pub mod pipeline;
pub mod scheduler;
pub mod search;
pub mod server;
pub mod stem;
pub mod store;
pub mod youtube;

// Re-export main types for easy access
pub use crate::config::Config;
pub use crate::error::Error;
pub use crate::index::{IndexOutcome, Indexer};
pub use crate::pipeline::Pipeline;
pub use crate::search::{search_channel, search_video, SearchResult};
pub use crate::store::Store;
pub use crate::youtube::{Client, Platform};
