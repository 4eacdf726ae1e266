// Downloader module - download-orchestration core

pub mod backends;
pub mod config;
pub mod diagnostics;
pub mod errors;
pub mod format_selector;
pub mod models;
pub mod orchestrator;
pub mod selection;
pub mod task;
pub mod tools;
pub mod traits;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use backends::YtDlpResolver;
pub use config::OrchestratorConfig;
pub use errors::{DownloadError, ErrorKind, ResolutionError, ResolverError, TaskFailure};
pub use models::{DownloadMode, DownloadRequest, NetworkConfig, QualityOption, QualitySelector};
pub use orchestrator::Orchestrator;
pub use task::{ItemResult, Progress, TaskEvent, TaskId, TaskSnapshot, TaskState};
pub use traits::{DownloadJob, ProgressSample, ProgressSink, Resolver, ResolverEvent};
