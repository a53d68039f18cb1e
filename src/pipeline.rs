use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ToolsConfig, WhisperConfig};
use crate::error::Error;
use crate::stem::stem_line;
use crate::store::{Failure, FailureType, NewTranscriptLine, NewVideo, Store, TranscriptType};
use crate::youtube::{self, Platform, VideoInfo};

/// Audio handed from the download stage to the transcription stage.
struct DownloadMsg {
    failure_id: i64,
    video_id: String,
    /// 16 kHz mono PCM wav, owned by the transcription stage from here on.
    path: PathBuf,
    video: VideoInfo,
}

/// Transcription output handed to the indexing stage.
struct WhisperMsg {
    failure_id: i64,
    video_id: String,
    csv_path: PathBuf,
    video: VideoInfo,
}

/// The fallback acquisition pipeline: drains the no-captions failure queue
/// by downloading audio, transcoding it, transcribing locally and indexing
/// the result.
///
/// Four single-worker stages run pipelined with capacity-1 hand-offs, so a
/// slow stage backpressures the ones before it. One cancellation token stops
/// everything cooperatively, including in-flight external processes.
#[derive(Clone)]
pub struct Pipeline {
    store: Store,
    platform: Arc<dyn Platform>,
    whisper: WhisperConfig,
    tools: ToolsConfig,
}

impl Pipeline {
    pub fn new(
        store: Store,
        platform: Arc<dyn Platform>,
        whisper: WhisperConfig,
        tools: ToolsConfig,
    ) -> Self {
        Self {
            store,
            platform,
            whisper,
            tools,
        }
    }

    /// Process no-captions failures until the queue drains, an error occurs
    /// or the user interrupts. Reports queue depth once a minute.
    pub async fn run(&self) -> Result<()> {
        let cancel = CancellationToken::new();
        let (err_tx, mut err_rx) = mpsc::channel::<anyhow::Error>(5);

        let (failure_tx, failure_rx) = mpsc::channel::<Failure>(1);
        let (download_tx, download_rx) = mpsc::channel::<DownloadMsg>(1);
        let (whisper_tx, whisper_rx) = mpsc::channel::<WhisperMsg>(1);

        tokio::spawn(source_stage(
            self.store.clone(),
            failure_tx,
            err_tx.clone(),
            cancel.clone(),
        ));
        tokio::spawn(self.clone().download_stage(
            failure_rx,
            download_tx,
            err_tx.clone(),
            cancel.clone(),
        ));
        tokio::spawn(self.clone().transcribe_stage(
            download_rx,
            whisper_tx,
            err_tx.clone(),
            cancel.clone(),
        ));
        let mut index_task = tokio::spawn(self.clone().index_stage(
            whisper_rx,
            err_tx.clone(),
            cancel.clone(),
        ));

        let mut report = tokio::time::interval(Duration::from_secs(60));
        report.tick().await; // the first tick fires immediately

        let mut first_err: Option<anyhow::Error> = None;
        loop {
            tokio::select! {
                joined = &mut index_task => {
                    if let Err(e) = joined {
                        error!("index stage panicked: {e}");
                    }
                    break;
                }
                Some(err) = err_rx.recv() => {
                    error!("🛑 pipeline error: {err:#}");
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                    cancel.cancel();
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received, winding the pipeline down");
                    cancel.cancel();
                }
                _ = report.tick() => {
                    match self.store.count_failures(FailureType::NoCaptions).await {
                        Ok(count) => info!("⏳ {} failures in the queue", count),
                        Err(err) => warn!("counting failures: {err:#}"),
                    }
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// S2: turn a failure into a 16 kHz mono wav on disk.
    async fn download_stage(
        self,
        mut rx: mpsc::Receiver<Failure>,
        tx: mpsc::Sender<DownloadMsg>,
        errs: mpsc::Sender<anyhow::Error>,
        cancel: CancellationToken,
    ) {
        loop {
            let failure = tokio::select! {
                _ = cancel.cancelled() => return,
                received = rx.recv() => match received {
                    Some(failure) => failure,
                    None => return,
                },
            };

            match self.download_one(failure, &tx, &cancel).await {
                Ok(()) => {}
                Err(err) if Error::is_cancelled(&err) => return,
                Err(err) => {
                    let _ = errs.send(err).await;
                    return;
                }
            }
        }
    }

    async fn download_one(
        &self,
        failure: Failure,
        tx: &mpsc::Sender<DownloadMsg>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let video_id = failure.data.clone();

        if self.store.video(&video_id).await?.is_some() {
            warn!("video {:?} already in database, removing failure", video_id);
            self.store
                .delete_failure(failure.id)
                .await
                .context("deleting indexed failure")?;
            return Ok(());
        }

        let video = self
            .platform
            .video(&video_id)
            .await
            .context("getting video info")?;

        if video.is_broadcast() {
            warn!("video {:?} is a broadcast, can't index, skipping", video_id);
            return Ok(());
        }

        let wav = format!("{video_id}.wav");
        let wav_16k = format!("{video_id}.16k.wav");

        // Everything under the video's prefix is ours to delete, except the
        // 16 kHz file the next stage takes over.
        let mut cleanup = CleanupGuard::new(".", format!("{video_id}."));
        cleanup.keep(&wav_16k);

        info!("⬇️  downloading audio of {:?}", video.title);
        let mut download = Command::new(&self.tools.ytdlp);
        download
            .args(["-f", "bestaudio", "--ignore-config", "--no-progress", "--output"])
            .arg(&wav)
            .args(["--extract-audio", "--audio-format", "wav"])
            .arg(format!("https://www.youtube.com/watch?v={video_id}"));
        run_command(download, "yt-dlp", cancel).await?;

        info!("🎚  transcoding {:?} to 16 kHz mono", wav);
        let mut transcode = Command::new(&self.tools.ffmpeg);
        transcode
            .arg("-i")
            .arg(&wav)
            .args(["-ar", "16000", "-ac", "1", "-c:a", "pcm_s16le", "--"])
            .arg(&wav_16k);
        run_command(transcode, "ffmpeg", cancel).await?;

        let msg = DownloadMsg {
            failure_id: failure.id,
            video_id,
            path: PathBuf::from(wav_16k),
            video,
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled.into()),
            sent = tx.send(msg) => sent.map_err(|_| Error::Cancelled.into()),
        }
    }

    /// S3: run the local speech-to-text engine over the 16 kHz audio.
    async fn transcribe_stage(
        self,
        mut rx: mpsc::Receiver<DownloadMsg>,
        tx: mpsc::Sender<WhisperMsg>,
        errs: mpsc::Sender<anyhow::Error>,
        cancel: CancellationToken,
    ) {
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => return,
                received = rx.recv() => match received {
                    Some(msg) => msg,
                    None => return,
                },
            };

            match self.transcribe_one(msg, &tx, &cancel).await {
                Ok(()) => {}
                Err(err) if Error::is_cancelled(&err) => return,
                Err(err) => {
                    let _ = errs.send(err).await;
                    return;
                }
            }
        }
    }

    async fn transcribe_one(
        &self,
        msg: DownloadMsg,
        tx: &mpsc::Sender<WhisperMsg>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        // Owns the 16 kHz file and the CSV until the CSV is handed over.
        let mut cleanup = CleanupGuard::new(".", format!("{}.", msg.video_id));

        info!("🎤 transcribing {}", msg.path.display());
        let mut transcribe = Command::new(&self.whisper.binary);
        transcribe
            .arg("-m")
            .arg(&self.whisper.model)
            .arg("-f")
            .arg(&msg.path)
            .arg("-ocsv")
            .arg("-t")
            .arg(self.whisper.threads.to_string())
            .arg("-p")
            .arg(self.whisper.processors.to_string());
        run_command(transcribe, "whisper", cancel).await?;

        let csv_path = PathBuf::from(format!("{}.csv", msg.path.display()));
        cleanup.keep(&csv_path.to_string_lossy());

        let whisper_msg = WhisperMsg {
            failure_id: msg.failure_id,
            video_id: msg.video_id,
            csv_path,
            video: msg.video,
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled.into()),
            sent = tx.send(whisper_msg) => sent.map_err(|_| Error::Cancelled.into()),
        }
    }

    /// S4: parse the transcription CSV and commit the video, its lines and
    /// the failure deletion in one transaction.
    async fn index_stage(
        self,
        mut rx: mpsc::Receiver<WhisperMsg>,
        errs: mpsc::Sender<anyhow::Error>,
        cancel: CancellationToken,
    ) {
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => return,
                received = rx.recv() => match received {
                    Some(msg) => msg,
                    None => return,
                },
            };

            match self.index_one(msg).await {
                Ok(()) => {}
                Err(err) if Error::is_cancelled(&err) => return,
                Err(err) => {
                    let _ = errs.send(err).await;
                    return;
                }
            }
        }
    }

    async fn index_one(&self, msg: WhisperMsg) -> Result<()> {
        // The CSV is spent once this scope exits, parsed or not.
        let _cleanup = CleanupGuard::new(".", msg.csv_path.to_string_lossy().into_owned());

        let rows = parse_whisper_csv(&msg.csv_path, &msg.video_id)?;
        let published = youtube::parse_published(&msg.video.published_at)
            .context("parsing video published time")?;

        let lines = rows
            .into_iter()
            .map(|row| NewTranscriptLine {
                start: row.start_ms as f64 / 1000.0,
                duration: Some((row.end_ms - row.start_ms) as f64 / 1000.0),
                stemmed: stem_line(&row.text),
                text: row.text,
            })
            .collect::<Vec<_>>();

        let count = lines.len();
        self.store
            .insert_transcribed_video(
                NewVideo {
                    id: msg.video_id.clone(),
                    channel_id: msg.video.channel_id.clone(),
                    published_at: published,
                    title: msg.video.title.clone(),
                    description: msg.video.description.clone(),
                    thumbnail_url: msg.video.thumbnail_url.clone(),
                    transcript_type: TranscriptType::WhisperBase,
                },
                lines,
                msg.failure_id,
            )
            .await?;

        info!("💾 indexed {:?} with {} transcribed lines", msg.video_id, count);
        Ok(())
    }
}

/// S1: walk the failure queue with a strictly-monotone cursor. The cursor
/// advances even when an item is later dropped downstream, so a pathological
/// item never blocks the queue; restart resumes at the next failure id.
async fn source_stage(
    store: Store,
    tx: mpsc::Sender<Failure>,
    errs: mpsc::Sender<anyhow::Error>,
    cancel: CancellationToken,
) {
    let mut last_id = 0;
    loop {
        if cancel.is_cancelled() {
            return;
        }

        match store.next_failure(last_id, FailureType::NoCaptions).await {
            Ok(Some(failure)) => {
                last_id = failure.id;
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = tx.send(failure) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
            Ok(None) => {
                info!("📭 failure queue drained");
                return;
            }
            Err(err) => {
                let _ = errs.send(err.context("getting next failure")).await;
                return;
            }
        }
    }
}

#[derive(Debug)]
struct WhisperRow {
    start_ms: i64,
    end_ms: i64,
    text: String,
}

/// Parse whisper.cpp's CSV output: a header row to discard, then exactly
/// `start_ms, end_ms, text` rows. A malformed file is copied to
/// `failed-<video id>.csv` for offline inspection.
fn parse_whisper_csv(path: &Path, video_id: &str) -> Result<Vec<WhisperRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;

    let malformed = |detail: String| -> anyhow::Error {
        let dump = PathBuf::from(format!("failed-{video_id}.csv"));
        warn!(
            "reading csv failed, writing failed csv to {} and stopping: {detail}",
            dump.display()
        );
        if let Err(copy_err) = std::fs::copy(path, &dump) {
            warn!("could not write failed csv: {copy_err}");
        }
        Error::Malformed {
            what: "whisper csv",
            detail,
            dump: Some(dump),
        }
        .into()
    };

    let mut rows = Vec::new();
    let mut record = csv::StringRecord::new();
    loop {
        match reader.read_record(&mut record) {
            Ok(false) => break,
            Ok(true) => {
                if record.len() != 3 {
                    return Err(malformed(format!(
                        "expected 3 fields, got {} in row {:?}",
                        record.len(),
                        record
                    )));
                }

                let start_ms: i64 = match record[0].trim().parse() {
                    Ok(ms) => ms,
                    Err(e) => {
                        return Err(malformed(format!(
                            "bad start ms {:?}: {e}",
                            record[0].to_string()
                        )))
                    }
                };
                let end_ms: i64 = match record[1].trim().parse() {
                    Ok(ms) => ms,
                    Err(e) => {
                        return Err(malformed(format!(
                            "bad end ms {:?}: {e}",
                            record[1].to_string()
                        )))
                    }
                };

                rows.push(WhisperRow {
                    start_ms,
                    end_ms,
                    text: record[2].trim().to_string(),
                });
            }
            Err(e) => return Err(malformed(e.to_string())),
        }
    }

    Ok(rows)
}

/// Run an external process with captured output, killing it on cancellation.
///
/// Stdout is captured too: some of these binaries report errors there. A
/// process that dies without an exit code was killed by the cancel signal
/// and is reported as [`Error::Cancelled`].
async fn run_command(mut cmd: Command, bin: &str, cancel: &CancellationToken) -> Result<()> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawning {bin}"))?;

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = stdout_pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = stderr_pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });

    let status = tokio::select! {
        _ = cancel.cancelled() => {
            warn!("{bin}: cancelled, killing");
            let _ = child.kill().await;
            return Err(Error::Cancelled.into());
        }
        status = child.wait() => status.with_context(|| format!("waiting for {bin}"))?,
    };

    if status.success() {
        return Ok(());
    }

    match status.code() {
        // Killed by a signal: that's the cancel reaching the process.
        None => Err(Error::Cancelled.into()),
        Some(code) => {
            let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).into_owned();
            let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).into_owned();
            Err(Error::ProcessFailed {
                bin: bin.to_string(),
                code,
                stdout,
                stderr,
            }
            .into())
        }
    }
}

/// Deletes every file in `dir` whose name starts with `prefix` when the
/// scope exits, except the names added to the allow-list. Files handed to a
/// downstream stage go on the allow-list; everything else is this stage's
/// garbage.
struct CleanupGuard {
    dir: PathBuf,
    prefix: String,
    keep: Vec<String>,
}

impl CleanupGuard {
    fn new(dir: impl Into<PathBuf>, prefix: String) -> Self {
        Self {
            dir: dir.into(),
            prefix,
            keep: Vec::new(),
        }
    }

    fn keep(&mut self, name: &str) {
        self.keep.push(name.to_string());
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("cleanup scan of {} failed: {err}", self.dir.display());
                return;
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(&self.prefix) || self.keep.iter().any(|k| *k == name) {
                continue;
            }

            info!("🧹 deleting file {:?} (cleanup)", name);
            if let Err(err) = std::fs::remove_file(entry.path()) {
                warn!("could not delete {:?}: {err}", name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::youtube::{CaptionKind, CaptionLine, ChannelInfo, PlaylistPage};
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct NullPlatform;

    #[async_trait]
    impl Platform for NullPlatform {
        async fn channel_info(&self, _id: &str) -> Result<ChannelInfo> {
            Err(Error::NotFound.into())
        }

        async fn playlist_page(
            &self,
            _playlist_id: &str,
            _page_token: Option<&str>,
        ) -> Result<PlaylistPage> {
            Err(Error::NotFound.into())
        }

        async fn video(&self, _id: &str) -> Result<VideoInfo> {
            Err(Error::NotFound.into())
        }

        async fn captions(&self, _video_id: &str) -> Result<(Vec<CaptionLine>, CaptionKind)> {
            Err(Error::NoCaptions.into())
        }
    }

    #[tokio::test]
    async fn test_index_stage_commits_transcribed_video_and_consumes_failure() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .create_channel("chan1", "Test", "uploads", "")
            .await
            .unwrap();
        store
            .create_failure("chan1", FailureType::NoCaptions, "vid1")
            .await
            .unwrap();
        let failure = store
            .next_failure(0, FailureType::NoCaptions)
            .await
            .unwrap()
            .unwrap();

        let dir = TempDir::new().unwrap();
        let csv_path = dir.path().join("vid1.16k.wav.csv");
        std::fs::write(
            &csv_path,
            "start,end,text\n0,2500,\" thanks for watching\"\n2500,5000,\" see you next time\"\n",
        )
        .unwrap();

        let config = Config::default();
        let pipeline = Pipeline::new(
            store.clone(),
            Arc::new(NullPlatform),
            config.whisper,
            config.tools,
        );

        pipeline
            .index_one(WhisperMsg {
                failure_id: failure.id,
                video_id: "vid1".to_string(),
                csv_path,
                video: VideoInfo {
                    id: "vid1".to_string(),
                    channel_id: "chan1".to_string(),
                    published_at: "2023-04-25T21:27:49Z".to_string(),
                    title: "locally transcribed".to_string(),
                    description: String::new(),
                    thumbnail_url: String::new(),
                    live_broadcast_content: "none".to_string(),
                },
            })
            .await
            .unwrap();

        // One video row, transcript lines = csv rows minus the header, and
        // the failure is gone.
        let video = store.video("vid1").await.unwrap().unwrap();
        assert_eq!(video.transcript_type, TranscriptType::WhisperBase);
        assert_eq!(store.count_failures(FailureType::NoCaptions).await.unwrap(), 0);

        let ids: Vec<i64> = video
            .searchable_transcript
            .split('~')
            .skip(1)
            .step_by(2)
            .map(|m| m.parse().unwrap())
            .collect();
        assert_eq!(ids.len(), 2);

        let lines = store.transcripts_by_ids(&ids).await.unwrap();
        assert_eq!(lines[&ids[0]].text, "thanks for watching");
        assert_eq!(lines[&ids[0]].start, 0.0);
        assert_eq!(lines[&ids[1]].start, 2.5);
        assert_eq!(lines[&ids[1]].duration, Some(2.5));
    }

    #[test]
    fn test_parse_whisper_csv_discards_header_and_counts_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audio.16k.wav.csv");
        std::fs::write(
            &path,
            "start,end,text\n0,2500,\" hello there\"\n2500,5000,\" general, kenobi\"\n",
        )
        .unwrap();

        let rows = parse_whisper_csv(&path, "vid1").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].start_ms, 0);
        assert_eq!(rows[0].end_ms, 2500);
        assert_eq!(rows[0].text, "hello there");
        // Quoted field keeps its embedded comma.
        assert_eq!(rows[1].text, "general, kenobi");
    }

    #[test]
    fn test_parse_whisper_csv_malformed_row_dumps_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audio.16k.wav.csv");
        std::fs::write(&path, "start,end,text\nnot_a_number,2500,\" hi\"\n").unwrap();

        let cwd = std::env::current_dir().unwrap();
        let err = parse_whisper_csv(&path, "vid-csv-test").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Malformed { .. })
        ));

        let dump = cwd.join("failed-vid-csv-test.csv");
        assert!(dump.exists());
        std::fs::remove_file(dump).unwrap();
    }

    #[test]
    fn test_parse_whisper_csv_wrong_field_count() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audio.16k.wav.csv");
        std::fs::write(&path, "start,end,text\n0,2500\n").unwrap();

        let err = parse_whisper_csv(&path, "vid-field-test").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Malformed { .. })
        ));
        let _ = std::fs::remove_file("failed-vid-field-test.csv");
    }

    #[test]
    fn test_cleanup_guard_respects_allow_list() {
        let dir = TempDir::new().unwrap();
        for name in ["vid1.wav", "vid1.16k.wav", "vid1.16k.wav.csv", "other.wav"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        {
            let mut guard = CleanupGuard::new(dir.path(), "vid1.".to_string());
            guard.keep("vid1.16k.wav");
        }

        assert!(!dir.path().join("vid1.wav").exists());
        assert!(!dir.path().join("vid1.16k.wav.csv").exists());
        assert!(dir.path().join("vid1.16k.wav").exists());
        assert!(dir.path().join("other.wav").exists());
    }

    #[tokio::test]
    async fn test_run_command_classifies_exit_code() {
        let cancel = CancellationToken::new();
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo from-stdout; echo from-stderr >&2; exit 3"]);

        let err = run_command(cmd, "sh", &cancel).await.unwrap_err();
        match err.downcast_ref::<Error>() {
            Some(Error::ProcessFailed {
                bin,
                code,
                stdout,
                stderr,
            }) => {
                assert_eq!(bin, "sh");
                assert_eq!(*code, 3);
                assert!(stdout.contains("from-stdout"));
                assert!(stderr.contains("from-stderr"));
            }
            other => panic!("expected ProcessFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_command_cancellation_is_silent() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut cmd = Command::new("sleep");
        cmd.arg("30");

        let err = run_command(cmd, "sleep", &cancel).await.unwrap_err();
        assert!(Error::is_cancelled(&err));
    }

    #[tokio::test]
    async fn test_run_command_success() {
        let cancel = CancellationToken::new();
        run_command(Command::new("true"), "true", &cancel).await.unwrap();
    }
}
