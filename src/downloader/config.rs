// Orchestrator configuration: retry policy, playlist policy, progress cadence

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::errors::DownloadError;
use super::models::NetworkConfig;

const CONFIG_DIR_NAME: &str = "youtube-downloader";
const CONFIG_FILE_NAME: &str = "config.json";

/// Configuration for the download orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Retries for transient network errors, per item and per phase
    pub max_retries: u32,

    /// First backoff delay; doubled on every retry
    pub backoff_base_ms: u64,

    /// Ceiling for the backoff delay
    pub backoff_max_ms: u64,

    /// End a playlist as failed on the first item failure
    pub stop_on_first_failure: bool,

    /// Minimum spacing between coalesced progress events
    pub progress_interval_ms: u64,

    pub network: NetworkConfig,

    /// Explicit yt-dlp binary instead of a PATH lookup
    pub ytdlp_path: Option<PathBuf>,

    /// Explicit ffmpeg binary, also handed to yt-dlp as --ffmpeg-location
    pub ffmpeg_path: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            stop_on_first_failure: false,
            progress_interval_ms: 250,
            network: NetworkConfig::default(),
            ytdlp_path: None,
            ffmpeg_path: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base_ms = base.as_millis() as u64;
        self
    }

    pub fn with_stop_on_first_failure(mut self, stop: bool) -> Self {
        self.stop_on_first_failure = stop;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.network.proxy = proxy;
        self
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self.backoff_base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.backoff_max_ms.max(self.backoff_base_ms)))
    }

    pub fn progress_interval(&self) -> Duration {
        // tokio::time::interval panics on a zero period
        Duration::from_millis(self.progress_interval_ms.max(1))
    }

    /// Default location: `<config_dir>/youtube-downloader/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Read a JSON config file; missing keys take their defaults
    pub fn load(path: &Path) -> Result<Self, DownloadError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DownloadError::Config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            DownloadError::Config(format!("invalid config {}: {}", path.display(), e))
        })
    }

    /// An explicit path must exist; the default path is optional
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self, DownloadError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        match Self::default_path() {
            Some(path) if path.is_file() => {
                debug!(path = %path.display(), "loading config");
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_retries, 3);
        assert!(!config.stop_on_first_failure);
        assert_eq!(config.network.socket_timeout_secs, 30);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = OrchestratorConfig {
            backoff_base_ms: 100,
            backoff_max_ms: 500,
            ..Default::default()
        };
        assert_eq!(config.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(config.backoff_delay(4), Duration::from_millis(500));
        assert_eq!(config.backoff_delay(60), Duration::from_millis(500));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "max_retries": 5, "stop_on_first_failure": true, "network": {{ "proxy": "socks5://127.0.0.1:1080" }} }}"#
        )
        .unwrap();

        let config = OrchestratorConfig::load(file.path()).unwrap();
        assert_eq!(config.max_retries, 5);
        assert!(config.stop_on_first_failure);
        assert_eq!(config.network.proxy.as_deref(), Some("socks5://127.0.0.1:1080"));
        assert_eq!(config.network.socket_timeout_secs, 30);
        assert_eq!(config.backoff_base_ms, 1_000);
    }

    #[test]
    fn test_missing_explicit_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(matches!(
            OrchestratorConfig::load_or_default(Some(&missing)),
            Err(DownloadError::Config(_))
        ));
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            OrchestratorConfig::load(file.path()),
            Err(DownloadError::Config(_))
        ));
    }
}
