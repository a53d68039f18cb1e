mod schema;

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use tokio_rusqlite::Connection;

use schema::SCHEMA;

/// How a video's transcript was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptType {
    /// Manually added captions (creator or community).
    TubeManual,
    /// Auto generated captions from the platform.
    TubeAuto,
    /// Locally transcribed with the whisper base model.
    WhisperBase,
}

impl TranscriptType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranscriptType::TubeManual => "tube_manual",
            TranscriptType::TubeAuto => "tube_auto",
            TranscriptType::WhisperBase => "whisper_base",
        }
    }

    fn from_str(value: &str) -> Option<Self> {
        match value {
            "tube_manual" => Some(TranscriptType::TubeManual),
            "tube_auto" => Some(TranscriptType::TubeAuto),
            "whisper_base" => Some(TranscriptType::WhisperBase),
            _ => None,
        }
    }
}

/// Durable record of an acquisition task that has not yet succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// No captions available from the platform; data is the video id.
    NoCaptions,
    /// Quota ran out while paging a channel; data is the page token that failed.
    PageQuota,
}

impl FailureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureType::NoCaptions => "no_captions",
            FailureType::PageQuota => "page_quota",
        }
    }

    fn from_str(value: &str) -> Option<Self> {
        match value {
            "no_captions" => Some(FailureType::NoCaptions),
            "page_quota" => Some(FailureType::PageQuota),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Channel {
    pub id: String,
    pub title: String,
    pub videos_list_id: String,
    pub thumbnail_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Video {
    pub id: String,
    pub channel_id: String,
    pub published_at: DateTime<Utc>,
    pub title: String,
    pub description: String,
    pub thumbnail_url: String,
    pub searchable_transcript: String,
    pub transcript_type: TranscriptType,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptLine {
    pub id: i64,
    pub video_id: String,
    /// Offset into the video, in seconds.
    pub start: f64,
    pub duration: Option<f64>,
    /// Raw caption text, HTML entities decoded, not stemmed.
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct Failure {
    pub id: i64,
    pub channel_id: String,
    pub failure_type: FailureType,
    pub data: String,
    pub created_at: DateTime<Utc>,
}

/// A video about to be written, transcript lines alongside.
#[derive(Debug, Clone)]
pub struct NewVideo {
    pub id: String,
    pub channel_id: String,
    pub published_at: DateTime<Utc>,
    pub title: String,
    pub description: String,
    pub thumbnail_url: String,
    pub transcript_type: TranscriptType,
}

/// One transcript line about to be written. `stemmed` is the stemmed form of
/// `text`, accumulated into the video's searchable transcript.
#[derive(Debug, Clone)]
pub struct NewTranscriptLine {
    pub start: f64,
    pub duration: Option<f64>,
    pub text: String,
    pub stemmed: String,
}

/// SQLite-backed persistence for channels, videos, transcript lines and the
/// failures queue.
#[derive(Clone)]
pub struct Store {
    conn: Connection,
}

impl Store {
    pub async fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path.to_path_buf())
            .await
            .with_context(|| format!("opening database {}", db_path.display()))?;
        Self::init(conn).await
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .await
            .context("opening in-memory database")?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .context("applying schema")?;

        Ok(Self { conn })
    }

    // Channel operations

    pub async fn channel(&self, id: &str) -> Result<Option<Channel>> {
        let id = id.to_string();
        let channel = self
            .conn
            .call(move |conn| {
                let channel = conn
                    .query_row(
                        "SELECT id, title, videos_list_id, thumbnail_url, created_at, updated_at
                         FROM channels WHERE id = ?1",
                        params![id],
                        channel_from_row,
                    )
                    .optional()?;
                Ok(channel)
            })
            .await?;
        Ok(channel)
    }

    pub async fn channels(&self) -> Result<Vec<Channel>> {
        let channels = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, title, videos_list_id, thumbnail_url, created_at, updated_at
                     FROM channels ORDER BY title",
                )?;
                let channels = stmt
                    .query_map([], channel_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(channels)
            })
            .await?;
        Ok(channels)
    }

    pub async fn create_channel(
        &self,
        id: &str,
        title: &str,
        videos_list_id: &str,
        thumbnail_url: &str,
    ) -> Result<Channel> {
        let channel = Channel {
            id: id.to_string(),
            title: title.to_string(),
            videos_list_id: videos_list_id.to_string(),
            thumbnail_url: thumbnail_url.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let row = channel.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO channels (id, title, videos_list_id, thumbnail_url, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        row.id,
                        row.title,
                        row.videos_list_id,
                        row.thumbnail_url,
                        row.created_at,
                        row.updated_at
                    ],
                )?;
                Ok(())
            })
            .await
            .context("creating channel")?;

        Ok(channel)
    }

    // Video operations

    pub async fn video(&self, id: &str) -> Result<Option<Video>> {
        let id = id.to_string();
        let video = self
            .conn
            .call(move |conn| {
                let video = conn
                    .query_row(
                        &format!("{VIDEO_COLUMNS} WHERE id = ?1"),
                        params![id],
                        video_from_row,
                    )
                    .optional()?;
                Ok(video)
            })
            .await?;
        Ok(video)
    }

    /// Most recently published video of a channel; the indexer's catch-up
    /// marker.
    pub async fn last_video(&self, channel_id: &str) -> Result<Option<Video>> {
        let channel_id = channel_id.to_string();
        let video = self
            .conn
            .call(move |conn| {
                let video = conn
                    .query_row(
                        &format!(
                            "{VIDEO_COLUMNS} WHERE channel_id = ?1
                             ORDER BY published_at DESC LIMIT 1"
                        ),
                        params![channel_id],
                        video_from_row,
                    )
                    .optional()?;
                Ok(video)
            })
            .await?;
        Ok(video)
    }

    /// Videos of the channel whose searchable transcript contains every one
    /// of `words` as a substring. An optimistic pre-filter: hits still need
    /// the exact scan of the search module. Words must be stemmed, which
    /// guarantees they are free of quoting metacharacters.
    pub async fn videos_of_channel_with_words(
        &self,
        channel_id: &str,
        words: &[String],
    ) -> Result<Vec<Video>> {
        if words.is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = format!("{VIDEO_COLUMNS} WHERE channel_id = ?1");
        for i in 0..words.len() {
            sql.push_str(&format!(
                " AND searchable_transcript LIKE '%' || ?{} || '%'",
                i + 2
            ));
        }

        let args: Vec<String> = std::iter::once(channel_id.to_string())
            .chain(words.iter().cloned())
            .collect();

        let videos = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let videos = stmt
                    .query_map(params_from_iter(args), video_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(videos)
            })
            .await?;
        Ok(videos)
    }

    /// Write a video and its transcript lines in one transaction. Lines are
    /// inserted in order; the searchable transcript interleaves each line's
    /// rowid with its stemmed text as `~<id>~<stemmed>`.
    pub async fn insert_video_with_transcript(
        &self,
        video: NewVideo,
        lines: Vec<NewTranscriptLine>,
    ) -> Result<()> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                write_video_with_transcript(&tx, &video, &lines)?;
                tx.commit()?;
                Ok(())
            })
            .await
            .context("inserting video with transcript")?;
        Ok(())
    }

    /// Same as [`Self::insert_video_with_transcript`] but also consumes the
    /// originating failure, all in the same transaction.
    pub async fn insert_transcribed_video(
        &self,
        video: NewVideo,
        lines: Vec<NewTranscriptLine>,
        failure_id: i64,
    ) -> Result<()> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                write_video_with_transcript(&tx, &video, &lines)?;
                tx.execute("DELETE FROM failures WHERE id = ?1", params![failure_id])?;
                tx.commit()?;
                Ok(())
            })
            .await
            .context("inserting transcribed video")?;
        Ok(())
    }

    // Transcript operations

    /// Bulk fetch of transcript lines keyed by id.
    pub async fn transcripts_by_ids(&self, ids: &[i64]) -> Result<HashMap<i64, TranscriptLine>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let ids = ids.to_vec();
        let lines = self
            .conn
            .call(move |conn| {
                let placeholders = vec!["?"; ids.len()].join(",");
                let mut stmt = conn.prepare(&format!(
                    "SELECT id, video_id, start, duration, text
                     FROM transcripts WHERE id IN ({placeholders})"
                ))?;
                let lines = stmt
                    .query_map(params_from_iter(ids), transcript_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(lines)
            })
            .await?;

        Ok(lines.into_iter().map(|line| (line.id, line)).collect())
    }

    // Failure queue operations

    pub async fn create_failure(
        &self,
        channel_id: &str,
        failure_type: FailureType,
        data: &str,
    ) -> Result<()> {
        let channel_id = channel_id.to_string();
        let data = data.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO failures (channel_id, type, data, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![channel_id, failure_type.as_str(), data, Utc::now()],
                )?;
                Ok(())
            })
            .await
            .context("creating failure")?;
        Ok(())
    }

    pub async fn delete_failure(&self, id: i64) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM failures WHERE id = ?1", params![id])?;
                Ok(())
            })
            .await
            .context("deleting failure")?;
        Ok(())
    }

    /// Strictly-monotone cursor over the failure queue: the first failure of
    /// the given type with id greater than `after_id`, or `None` when the
    /// queue is drained. Callers pass the last id they saw so progress is
    /// guaranteed even when an item could not be deleted.
    pub async fn next_failure(
        &self,
        after_id: i64,
        failure_type: FailureType,
    ) -> Result<Option<Failure>> {
        let failure = self
            .conn
            .call(move |conn| {
                let failure = conn
                    .query_row(
                        "SELECT id, channel_id, type, data, created_at FROM failures
                         WHERE id > ?1 AND type = ?2 ORDER BY id ASC LIMIT 1",
                        params![after_id, failure_type.as_str()],
                        failure_from_row,
                    )
                    .optional()?;
                Ok(failure)
            })
            .await?;
        Ok(failure)
    }

    pub async fn count_failures(&self, failure_type: FailureType) -> Result<i64> {
        let count = self
            .conn
            .call(move |conn| {
                let count = conn.query_row(
                    "SELECT COUNT(*) FROM failures WHERE type = ?1",
                    params![failure_type.as_str()],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await?;
        Ok(count)
    }
}

const VIDEO_COLUMNS: &str = "SELECT id, channel_id, published_at, title, description, \
                             thumbnail_url, searchable_transcript, transcript_type, created_at \
                             FROM videos";

/// The shared transactional write: video row first (with an empty searchable
/// transcript, so the line inserts satisfy the foreign key), then the lines
/// in source order, then the accumulated searchable transcript.
fn write_video_with_transcript(
    tx: &rusqlite::Transaction<'_>,
    video: &NewVideo,
    lines: &[NewTranscriptLine],
) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO videos (id, channel_id, published_at, title, description, thumbnail_url,
                             searchable_transcript, transcript_type, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, '', ?7, ?8)",
        params![
            video.id,
            video.channel_id,
            video.published_at,
            video.title,
            video.description,
            video.thumbnail_url,
            video.transcript_type.as_str(),
            Utc::now(),
        ],
    )?;

    let mut searchable = String::new();
    {
        let mut insert = tx.prepare(
            "INSERT INTO transcripts (video_id, start, duration, text) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for line in lines {
            insert.execute(params![video.id, line.start, line.duration, line.text])?;
            let id = tx.last_insert_rowid();
            searchable.push('~');
            searchable.push_str(&id.to_string());
            searchable.push('~');
            searchable.push_str(&line.stemmed);
        }
    }

    tx.execute(
        "UPDATE videos SET searchable_transcript = ?1 WHERE id = ?2",
        params![searchable, video.id],
    )?;

    Ok(())
}

fn channel_from_row(row: &Row) -> rusqlite::Result<Channel> {
    Ok(Channel {
        id: row.get(0)?,
        title: row.get(1)?,
        videos_list_id: row.get(2)?,
        thumbnail_url: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn video_from_row(row: &Row) -> rusqlite::Result<Video> {
    let transcript_type: String = row.get(7)?;
    Ok(Video {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        published_at: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        thumbnail_url: row.get(5)?,
        searchable_transcript: row.get(6)?,
        transcript_type: TranscriptType::from_str(&transcript_type).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                7,
                rusqlite::types::Type::Text,
                format!("unknown transcript type {transcript_type:?}").into(),
            )
        })?,
        created_at: row.get(8)?,
    })
}

fn transcript_from_row(row: &Row) -> rusqlite::Result<TranscriptLine> {
    Ok(TranscriptLine {
        id: row.get(0)?,
        video_id: row.get(1)?,
        start: row.get(2)?,
        duration: row.get(3)?,
        text: row.get(4)?,
    })
}

fn failure_from_row(row: &Row) -> rusqlite::Result<Failure> {
    let failure_type: String = row.get(2)?;
    Ok(Failure {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        failure_type: FailureType::from_str(&failure_type).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                format!("unknown failure type {failure_type:?}").into(),
            )
        })?,
        data: row.get(3)?,
        created_at: row.get(4)?,
    })
}
