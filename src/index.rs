use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::Error;
use crate::stem::stem_line;
use crate::store::{Channel, FailureType, NewTranscriptLine, NewVideo, Store, TranscriptType};
use crate::youtube::{self, CaptionKind, Platform, PlaylistItem};

/// Per-page indexing concurrency. Deliberately low so we don't get
/// banned/blocked by the platform.
const PAGE_WORKERS: usize = 2;

/// How a channel walk ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    /// The whole uploads playlist was walked.
    Completed,
    /// The walk reached a video that was already indexed; everything newer
    /// is now in the store.
    CaughtUp,
    /// The platform quota ran out mid-walk; a page-quota failure records
    /// where to resume.
    QuotaExhausted,
}

/// Walks upload playlists and turns platform captions into indexed videos.
#[derive(Clone)]
pub struct Indexer {
    store: Store,
    platform: Arc<dyn Platform>,
}

enum WorkerSignal {
    Indexed,
    CaughtUp,
    Skipped,
}

impl Indexer {
    pub fn new(store: Store, platform: Arc<dyn Platform>) -> Self {
        Self { store, platform }
    }

    /// Fetch the channel from the store, or look it up on the platform and
    /// create it on first mention.
    pub async fn ensure_channel(&self, id: &str) -> Result<Channel> {
        if let Some(channel) = self.store.channel(id).await? {
            return Ok(channel);
        }

        let info = self
            .platform
            .channel_info(id)
            .await
            .context("getting channel info through the API")?;

        self.store
            .create_channel(
                &info.id,
                &info.title,
                &info.uploads_playlist_id,
                &info.thumbnail_url,
            )
            .await
            .context("creating channel in database")
    }

    /// Walk the channel's uploads newest-first, indexing every video not yet
    /// stored. Stops cleanly when it reaches the most recently published
    /// stored video, or when the platform quota runs out (recording the page
    /// to resume from in the failures queue).
    pub async fn index_channel(&self, channel: &Channel) -> Result<IndexOutcome> {
        let last_video_id = self
            .store
            .last_video(&channel.id)
            .await?
            .map(|video| video.id);

        let mut page_token: Option<String> = None;
        loop {
            let page = match self
                .platform
                .playlist_page(&channel.videos_list_id, page_token.as_deref())
                .await
            {
                Ok(page) => page,
                Err(err) if Error::is(&err, &Error::QuotaExceeded) => {
                    warn!("quota exceeded, adding the page we left off at to the failures queue");
                    self.store
                        .create_failure(
                            &channel.id,
                            FailureType::PageQuota,
                            page_token.as_deref().unwrap_or(""),
                        )
                        .await
                        .context("creating quota failure")?;
                    return Ok(IndexOutcome::QuotaExhausted);
                }
                Err(err) => return Err(err.context("retrieving playlist page")),
            };

            let cancel = CancellationToken::new();
            let semaphore = Arc::new(Semaphore::new(PAGE_WORKERS));
            let mut workers = JoinSet::new();

            for item in page.items {
                let indexer = self.clone();
                let channel_id = channel.id.clone();
                let last_video_id = last_video_id.clone();
                let cancel = cancel.clone();
                let semaphore = Arc::clone(&semaphore);

                workers.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.unwrap();

                    if cancel.is_cancelled() {
                        return Ok(WorkerSignal::Skipped);
                    }

                    if last_video_id.as_deref() == Some(item.video_id.as_str()) {
                        // Everything from here on is already in the store.
                        cancel.cancel();
                        return Ok(WorkerSignal::CaughtUp);
                    }

                    info!("📼 indexing {:?} - {:?}", item.video_id, item.title);
                    match indexer.index_video(&channel_id, &item).await {
                        Ok(()) => Ok(WorkerSignal::Indexed),
                        Err(err) => {
                            cancel.cancel();
                            Err(err.context(format!("indexing {} failed", item.video_id)))
                        }
                    }
                });
            }

            let mut caught_up = false;
            let mut first_err: Option<anyhow::Error> = None;
            while let Some(joined) = workers.join_next().await {
                match joined.context("index worker panicked")? {
                    Ok(WorkerSignal::CaughtUp) => caught_up = true,
                    Ok(_) => {}
                    Err(err) => {
                        first_err.get_or_insert(err);
                    }
                }
            }

            if let Some(err) = first_err {
                return Err(err);
            }

            if caught_up {
                info!("found already indexed video, stopping the walk");
                return Ok(IndexOutcome::CaughtUp);
            }

            page_token = page.next_page_token;
            if page_token.is_none() {
                return Ok(IndexOutcome::Completed);
            }
        }
    }

    /// Acquire captions for one playlist item and commit the video together
    /// with its transcript lines. A video without platform captions is
    /// enqueued for local transcription instead, and an unavailable video is
    /// skipped; neither fails the walk.
    pub async fn index_video(&self, channel_id: &str, item: &PlaylistItem) -> Result<()> {
        let video_id = &item.video_id;

        let (captions, kind) = match self.platform.captions(video_id).await {
            Ok(result) => result,
            Err(err) if Error::is(&err, &Error::NoCaptions) => {
                warn!("no captions for {:?}, adding to failures", video_id);
                self.store
                    .create_failure(channel_id, FailureType::NoCaptions, video_id)
                    .await
                    .with_context(|| format!("can't create failure for video {video_id:?}"))?;
                return Ok(());
            }
            Err(err) if Error::is(&err, &Error::Unavailable) => {
                warn!("skipping {:?}: {:#}", video_id, err);
                return Ok(());
            }
            Err(err) => {
                return Err(err.context(format!("retrieving captions for {video_id:?}")))
            }
        };

        let published = youtube::parse_published(&item.published_at)?;

        let transcript_type = match kind {
            CaptionKind::Manual => TranscriptType::TubeManual,
            CaptionKind::Auto => TranscriptType::TubeAuto,
        };

        let lines = captions
            .into_iter()
            .map(|line| {
                let text = html_escape::decode_html_entities(&line.text).into_owned();
                NewTranscriptLine {
                    start: line.start,
                    duration: line.duration,
                    stemmed: stem_line(&text),
                    text,
                }
            })
            .collect();

        self.store
            .insert_video_with_transcript(
                NewVideo {
                    id: video_id.clone(),
                    channel_id: channel_id.to_string(),
                    published_at: published,
                    title: item.title.clone(),
                    description: item.description.clone(),
                    thumbnail_url: item.thumbnail_url.clone(),
                    transcript_type,
                },
                lines,
            )
            .await
            .with_context(|| format!("creating video {video_id:?}"))?;

        info!("✅ indexed {:?} - {:?}", video_id, item.title);
        Ok(())
    }
}
