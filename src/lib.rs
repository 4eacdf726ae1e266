// Download-orchestration core over yt-dlp and ffmpeg, plus a console front-end

pub mod console;
pub mod downloader;

pub use downloader::{
    DownloadError, DownloadRequest, Orchestrator, OrchestratorConfig, QualitySelector, TaskId,
    TaskSnapshot, TaskState, YtDlpResolver,
};
