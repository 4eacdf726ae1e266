// Resolver backend trait definition

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use super::errors::ResolverError;
use super::models::{MediaInfo, PlaylistEntry, QualityOption};

/// Everything a backend needs to fetch one item
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadJob {
    pub url: String,
    pub option: QualityOption,
    /// Backend-specific format expression
    pub format_spec: String,
    pub output_dir: PathBuf,
    /// File name without extension, unique within `output_dir`
    pub file_stem: String,
}

/// Raw transfer statistics reported by a backend
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressSample {
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    /// 0.0 - 100.0 across the whole job
    pub percent: f32,
    pub speed_bps: Option<f64>,
    pub eta_secs: Option<u64>,
}

/// Events a backend reports while a download runs
#[derive(Debug, Clone, PartialEq)]
pub enum ResolverEvent {
    Progress(ProgressSample),
    /// The muxer started combining separate streams
    Merging,
    /// Final or intermediate output path announced by the backend
    Destination(PathBuf),
}

/// Progress emitter helper handed to `Resolver::download`
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: UnboundedSender<ResolverEvent>,
}

impl ProgressSink {
    pub fn new(tx: UnboundedSender<ResolverEvent>) -> Self {
        Self { tx }
    }

    pub fn emit(&self, event: ResolverEvent) {
        let _ = self.tx.send(event);
    }

    pub fn progress(&self, sample: ProgressSample) {
        self.emit(ResolverEvent::Progress(sample));
    }
}

/// External capability that lists and fetches media formats for a URL
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Name of the backend (for logging)
    fn name(&self) -> &'static str;

    /// Verify the binaries needed to fetch `option` are present
    async fn check_environment(&self, _option: &QualityOption) -> Result<(), ResolverError> {
        Ok(())
    }

    /// Metadata and raw formats for a single item
    async fn resolve(&self, url: &str) -> Result<MediaInfo, ResolverError>;

    /// Ordered entries of a playlist
    async fn list_entries(&self, url: &str) -> Result<Vec<PlaylistEntry>, ResolverError>;

    /// Fetch (and merge, when needed) one item. Must return
    /// `ResolverError::Cancelled` promptly once `cancel` fires.
    async fn download(
        &self,
        job: &DownloadJob,
        sink: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<(), ResolverError>;
}
