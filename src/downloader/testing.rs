// Scripted in-memory resolver and helpers for orchestrator tests

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::errors::ResolverError;
use super::models::{MediaInfo, PlaylistEntry, QualityOption, RawFormat};
use super::traits::{DownloadJob, ProgressSample, ProgressSink, Resolver, ResolverEvent};

/// Install a test-writer subscriber once per process
#[macro_export]
macro_rules! init_test_tracing {
    () => {
        $crate::init_test_tracing!(DEBUG);
    };
    ($level:ident) => {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::$level)
            .with_test_writer()
            .try_init();
    };
}

pub fn video_format(height: u32, vcodec: &str) -> RawFormat {
    RawFormat {
        format_id: format!("v{}", height),
        ext: "mp4".to_string(),
        width: Some(height * 16 / 9),
        height: Some(height),
        vcodec: Some(vcodec.to_string()),
        acodec: Some("none".to_string()),
        filesize: Some(height as u64 * 100_000),
        ..Default::default()
    }
}

pub fn audio_format() -> RawFormat {
    RawFormat {
        format_id: "140".to_string(),
        ext: "m4a".to_string(),
        vcodec: Some("none".to_string()),
        acodec: Some("mp4a.40.2".to_string()),
        filesize: Some(3_000_000),
        abr: Some(128.0),
        ..Default::default()
    }
}

pub struct FakeResolver {
    title: String,
    formats: Vec<RawFormat>,
    entries: Vec<PlaylistEntry>,
    resolve_failures: HashMap<String, ResolverError>,
    download_failures: HashMap<String, ResolverError>,
    script: Mutex<VecDeque<Result<(), ResolverError>>>,
    block: bool,
    ffmpeg: bool,
    merge_step: bool,
    resolve_calls: AtomicUsize,
    download_calls: AtomicUsize,
    format_specs: Mutex<Vec<String>>,
}

impl FakeResolver {
    pub fn new() -> Self {
        Self {
            title: "Fake Video".to_string(),
            formats: vec![
                video_format(1080, "avc1.640028"),
                video_format(720, "avc1.4d401f"),
                audio_format(),
            ],
            entries: Vec::new(),
            resolve_failures: HashMap::new(),
            download_failures: HashMap::new(),
            script: Mutex::new(VecDeque::new()),
            block: false,
            ffmpeg: true,
            merge_step: true,
            resolve_calls: AtomicUsize::new(0),
            download_calls: AtomicUsize::new(0),
            format_specs: Mutex::new(Vec::new()),
        }
    }

    pub fn entry_url(index: usize) -> String {
        format!("https://site/watch?v=entry{}", index)
    }

    pub fn with_formats(mut self, formats: Vec<RawFormat>) -> Self {
        self.formats = formats;
        self
    }

    /// Playlist of `count` entries titled "Entry 1".."Entry N"
    pub fn with_entries(mut self, count: usize) -> Self {
        self.entries = (0..count)
            .map(|i| PlaylistEntry {
                id: format!("entry{}", i),
                title: format!("Entry {}", i + 1),
                url: Self::entry_url(i),
            })
            .collect();
        self
    }

    pub fn fail_resolve(mut self, url: &str, err: ResolverError) -> Self {
        self.resolve_failures.insert(url.to_string(), err);
        self
    }

    /// Every download of `url` fails with `err`
    pub fn fail_download(mut self, url: &str, err: ResolverError) -> Self {
        self.download_failures.insert(url.to_string(), err);
        self
    }

    /// Results handed out to successive downloads; `Ok` once exhausted
    pub fn script_downloads(self, results: Vec<Result<(), ResolverError>>) -> Self {
        *self.script.lock() = results.into();
        self
    }

    /// Downloads report some progress, then wait for cancellation
    pub fn block_until_cancelled(mut self) -> Self {
        self.block = true;
        self
    }

    pub fn without_ffmpeg(mut self) -> Self {
        self.ffmpeg = false;
        self
    }

    /// Downloads never announce a merge, like a pre-muxed fallback format
    pub fn without_merge_step(mut self) -> Self {
        self.merge_step = false;
        self
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    pub fn download_calls(&self) -> usize {
        self.download_calls.load(Ordering::SeqCst)
    }

    pub fn format_specs(&self) -> Vec<String> {
        self.format_specs.lock().clone()
    }

    fn sample(percent: f32) -> ProgressSample {
        ProgressSample {
            downloaded_bytes: (percent * 1000.0) as u64,
            total_bytes: Some(100_000),
            percent,
            speed_bps: Some(1_000_000.0),
            eta_secs: Some(((100.0 - percent) / 10.0) as u64),
        }
    }
}

#[async_trait]
impl Resolver for FakeResolver {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn check_environment(&self, option: &QualityOption) -> Result<(), ResolverError> {
        if !self.ffmpeg && (option.requires_merge || option.is_audio) {
            return Err(ResolverError::ToolNotFound("ffmpeg".to_string()));
        }
        Ok(())
    }

    async fn resolve(&self, url: &str) -> Result<MediaInfo, ResolverError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.resolve_failures.get(url) {
            return Err(err.clone());
        }

        let title = self
            .entries
            .iter()
            .find(|entry| entry.url == url)
            .map(|entry| entry.title.clone())
            .unwrap_or_else(|| self.title.clone());

        Ok(MediaInfo {
            id: "fake".to_string(),
            title,
            uploader: "Tester".to_string(),
            duration_seconds: 60,
            webpage_url: url.to_string(),
            formats: self.formats.clone(),
        })
    }

    async fn list_entries(&self, _url: &str) -> Result<Vec<PlaylistEntry>, ResolverError> {
        Ok(self.entries.clone())
    }

    async fn download(
        &self,
        job: &DownloadJob,
        sink: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<(), ResolverError> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        self.format_specs.lock().push(job.format_spec.clone());
        sink.progress(Self::sample(10.0));

        if self.block {
            cancel.cancelled().await;
            return Err(ResolverError::Cancelled);
        }

        if let Some(err) = self.download_failures.get(&job.url) {
            return Err(err.clone());
        }

        sink.progress(Self::sample(50.0));
        let scripted = self.script.lock().pop_front();
        if let Some(Err(err)) = scripted {
            return Err(err);
        }

        sink.progress(Self::sample(100.0));
        if job.option.requires_merge && self.merge_step {
            sink.emit(ResolverEvent::Merging);
        }

        let extension = if job.option.is_audio { "mp3" } else { "mp4" };
        let path = job.output_dir.join(format!("{}.{}", job.file_stem, extension));
        std::fs::write(&path, b"media").map_err(|e| ResolverError::Io(e.to_string()))?;
        Ok(())
    }
}
