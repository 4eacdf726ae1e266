// Error types for the download core and its resolver backends

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::diagnostics::{diagnose_error, error_context, BlockingReason};
use super::task::TaskId;

/// Why a URL could not be turned into a list of quality options
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    /// Structural check failed, nothing was sent to the resolver
    #[error("malformed URL: {0:?}")]
    MalformedUrl(String),

    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("URL not recognized: {0}")]
    Unrecognized(String),

    /// Private, removed or otherwise empty media
    #[error("no formats available: {0}")]
    NoFormats(String),
}

/// Errors surfaced synchronously by the orchestrator API
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DownloadError {
    /// Bad output path or a filename collision
    #[error("configuration error: {0}")]
    Config(String),

    #[error("resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("invalid quality selection: {0}")]
    Selection(String),

    /// Missing or broken external binary
    #[error("environment error: {0}")]
    Environment(String),

    #[error("unknown task: {0}")]
    NotFound(TaskId),
}

impl DownloadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Resolution(_) => ErrorKind::Resolution,
            Self::Selection(_) => ErrorKind::Selection,
            Self::Environment(_) => ErrorKind::Environment,
            Self::NotFound(_) => ErrorKind::NotFound,
        }
    }
}

/// Failures reported by a resolver backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolverError {
    /// Timeouts, resets, throttling. The only retryable kind.
    #[error("network error: {0}")]
    Network(String),

    #[error("media unavailable: {0}")]
    Unavailable(String),

    #[error("unsupported URL: {0}")]
    Unsupported(String),

    #[error("{0} not found; verify it is installed and on PATH")]
    ToolNotFound(String),

    #[error("merge failed: {0}; verify ffmpeg is installed and working")]
    Merge(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("filename collision: {0}")]
    Collision(String),

    #[error("download error: {0}")]
    Execution(String),

    #[error("cancelled")]
    Cancelled,
}

impl ResolverError {
    /// Whether the bounded retry policy applies
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// Classify the stderr of a failed yt-dlp run
    pub fn from_stderr(stderr: &str) -> Self {
        let lower = stderr.to_lowercase();
        let context = error_context(stderr);

        // Merger / post-processor problems come first: they mention URLs and
        // HTTP noise that would otherwise look like network errors.
        if lower.contains("ffmpeg is not installed")
            || lower.contains("ffmpeg not found")
            || lower.contains("ffprobe and ffmpeg not found")
        {
            return Self::ToolNotFound("ffmpeg".to_string());
        }
        if lower.contains("postprocessing") || lower.contains("conversion failed") {
            return Self::Merge(context);
        }

        if lower.contains("unsupported url") || lower.contains("is not a valid url") {
            return Self::Unsupported(context);
        }

        if lower.contains("no space left") || lower.contains("permission denied") {
            return Self::Io(context);
        }

        match diagnose_error(stderr) {
            Some(reason) if reason.is_retryable() => Self::Network(context),
            Some(reason) if reason.is_permanent() || reason.blocks_access() => {
                Self::Unavailable(format!("{} ({})", reason.description(), context))
            }
            Some(BlockingReason::Unknown) | None => Self::Execution(context),
            Some(_) => Self::Execution(context),
        }
    }
}

impl From<ResolverError> for DownloadError {
    fn from(err: ResolverError) -> Self {
        match err {
            ResolverError::Network(msg) => ResolutionError::NetworkUnreachable(msg).into(),
            ResolverError::Unsupported(msg) | ResolverError::Execution(msg) => {
                ResolutionError::Unrecognized(msg).into()
            }
            ResolverError::Unavailable(msg) => ResolutionError::NoFormats(msg).into(),
            ResolverError::ToolNotFound(_) | ResolverError::Merge(_) => {
                Self::Environment(err.to_string())
            }
            ResolverError::Io(msg) | ResolverError::Collision(msg) => Self::Config(msg),
            ResolverError::Cancelled => Self::Config("operation cancelled".to_string()),
        }
    }
}

/// Taxonomy kind used to explain a task failure to the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Config,
    Resolution,
    Selection,
    Environment,
    NotFound,
    /// Network or I/O failure during the transfer, after retries ran out
    Download,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Config => "configuration error",
            Self::Resolution => "resolution error",
            Self::Selection => "selection error",
            Self::Environment => "environment error",
            Self::NotFound => "not found",
            Self::Download => "download error",
        };
        f.write_str(name)
    }
}

/// Terminal failure attached to a task snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&ResolverError> for TaskFailure {
    fn from(err: &ResolverError) -> Self {
        let kind = match err {
            ResolverError::Network(_) | ResolverError::Execution(_) => ErrorKind::Download,
            ResolverError::Unavailable(_) | ResolverError::Unsupported(_) => {
                ErrorKind::Resolution
            }
            ResolverError::ToolNotFound(_) | ResolverError::Merge(_) => ErrorKind::Environment,
            ResolverError::Io(_) | ResolverError::Collision(_) => ErrorKind::Config,
            ResolverError::Cancelled => ErrorKind::Download,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<&DownloadError> for TaskFailure {
    fn from(err: &DownloadError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
