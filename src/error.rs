use std::path::PathBuf;

/// Classified failures of the remote platform and the acquisition pipeline.
///
/// These are the error kinds the orchestration layers branch on; callers
/// match them out of an [`anyhow::Error`] chain with `downcast_ref`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The platform denied the request because the daily API quota is spent.
    #[error("quota exceeded")]
    QuotaExceeded,

    /// The video has no caption tracks at all.
    #[error("no caption tracks")]
    NoCaptions,

    /// The video is not playable (unlisted, removed, region locked).
    #[error("video unavailable")]
    Unavailable,

    /// The watch page served a captcha; we are being rate limited.
    #[error("too many requests")]
    TooManyRequests,

    /// Lookup of a single resource came back empty.
    #[error("not found")]
    NotFound,

    /// A remote endpoint answered with an unexpected status code.
    #[error("unexpected status code {0}")]
    UnexpectedStatus(u16),

    /// An external binary exited unsuccessfully.
    #[error("{bin} exited with code {code}: stderr {stderr:?}, stdout {stdout:?}")]
    ProcessFailed {
        bin: String,
        code: i32,
        stdout: String,
        stderr: String,
    },

    /// The run was cancelled; propagates silently up to the driver.
    #[error("cancelled")]
    Cancelled,

    /// Input that should be machine-readable was not; the raw bytes may have
    /// been dumped to `dump` for offline inspection.
    #[error("malformed {what}: {detail}")]
    Malformed {
        what: &'static str,
        detail: String,
        dump: Option<PathBuf>,
    },
}

impl Error {
    /// True when `err`'s chain contains this exact classified kind.
    pub fn is(err: &anyhow::Error, kind: &Error) -> bool {
        matches!(
            err.downcast_ref::<Error>(),
            Some(e) if std::mem::discriminant(e) == std::mem::discriminant(kind)
        )
    }

    pub fn is_cancelled(err: &anyhow::Error) -> bool {
        Self::is(err, &Error::Cancelled)
    }
}
