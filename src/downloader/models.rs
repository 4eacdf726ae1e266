// Common data models for the download core

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::DownloadError;

/// Whether a request targets one item or a whole playlist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DownloadMode {
    Single,
    Playlist,
}

impl fmt::Display for DownloadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single => write!(f, "single"),
            Self::Playlist => write!(f, "playlist"),
        }
    }
}

/// User-supplied quality choice, before it is matched against resolved options
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QualitySelector {
    /// Best available; valid without a prior resolution
    Best,
    /// Audio only, extracted to MP3
    Audio,
    /// Exact video height, e.g. 720 for "720p"
    Height(u32),
    /// Option identifier or label as returned by the resolver
    Id(String),
    /// 1-based position in the resolved option list
    Index(usize),
}

impl QualitySelector {
    pub fn is_best(&self) -> bool {
        matches!(self, Self::Best)
    }
}

impl FromStr for QualitySelector {
    type Err = DownloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(DownloadError::Selection("empty quality selector".to_string()));
        }

        let lower = trimmed.to_lowercase();
        match lower.as_str() {
            "best" | "best (best available)" | "best available" => return Ok(Self::Best),
            "audio" | "audio-only" | "audio only" => return Ok(Self::Audio),
            _ => {}
        }

        if let Some(index) = lower.strip_prefix('#') {
            return index
                .parse::<usize>()
                .ok()
                .filter(|i| *i > 0)
                .map(Self::Index)
                .ok_or_else(|| DownloadError::Selection(format!("invalid index {:?}", trimmed)));
        }

        let digits = lower.strip_suffix('p').unwrap_or(&lower);
        if let Ok(height) = digits.parse::<u32>() {
            if height > 0 {
                return Ok(Self::Height(height));
            }
        }

        Ok(Self::Id(trimmed.to_string()))
    }
}

impl fmt::Display for QualitySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Best => write!(f, "best"),
            Self::Audio => write!(f, "audio"),
            Self::Height(h) => write!(f, "{}p", h),
            Self::Id(id) => write!(f, "{}", id),
            Self::Index(i) => write!(f, "#{}", i),
        }
    }
}

/// An immutable download request, validated by the orchestrator on `start`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DownloadRequest {
    url: String,
    output_dir: PathBuf,
    quality: QualitySelector,
    mode: DownloadMode,
}

impl DownloadRequest {
    pub fn new(
        url: impl Into<String>,
        output_dir: impl Into<PathBuf>,
        quality: QualitySelector,
        mode: DownloadMode,
    ) -> Self {
        Self {
            url: url.into().trim().to_string(),
            output_dir: output_dir.into(),
            quality,
            mode,
        }
    }

    pub fn single(url: impl Into<String>, output_dir: impl Into<PathBuf>, quality: QualitySelector) -> Self {
        Self::new(url, output_dir, quality, DownloadMode::Single)
    }

    pub fn playlist(url: impl Into<String>, output_dir: impl Into<PathBuf>, quality: QualitySelector) -> Self {
        Self::new(url, output_dir, quality, DownloadMode::Playlist)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn quality(&self) -> &QualitySelector {
        &self.quality
    }

    pub fn mode(&self) -> DownloadMode {
        self.mode
    }
}

/// Quality option for UI display and selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityOption {
    /// Opaque key ("best", "1080p", "audio")
    pub id: String,

    /// Display label (e.g., "1080p (1920x1080, H.264, ~150 MB)")
    pub label: String,

    /// Audio and video are separate streams that need muxing
    pub requires_merge: bool,

    /// Resolution in pixels (e.g., 1080)
    pub height: Option<u32>,

    /// Estimated file size (e.g., "150 MB")
    pub estimated_size: Option<String>,

    /// Codec info (e.g., "H.264" or "VP9")
    pub codec: Option<String>,

    pub is_audio: bool,
}

impl QualityOption {
    /// Placeholder used when "best" is requested without a resolution snapshot
    pub fn best_available() -> Self {
        Self {
            id: "best".to_string(),
            label: "Best Quality".to_string(),
            requires_merge: true,
            height: None,
            estimated_size: None,
            codec: None,
            is_audio: false,
        }
    }

    pub fn is_best(&self) -> bool {
        self.id == "best"
    }
}

/// Format descriptor as reported by the resolver
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawFormat {
    /// Format ID (e.g., "137", "140")
    pub format_id: String,
    /// File extension (mp4, webm, m4a)
    pub ext: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f32>,
    /// Video codec (avc1, vp9, av01, none)
    pub vcodec: Option<String>,
    /// Audio codec (mp4a, opus, none)
    pub acodec: Option<String>,
    pub filesize: Option<u64>,
    /// Approximate file size (when exact is unknown)
    pub filesize_approx: Option<u64>,
    /// Total bitrate in kbps
    pub tbr: Option<f32>,
    /// Audio bitrate in kbps
    pub abr: Option<f32>,
    pub format_note: Option<String>,
}

impl RawFormat {
    /// Get effective file size (exact or approximate)
    pub fn effective_size(&self) -> Option<u64> {
        self.filesize.or(self.filesize_approx)
    }

    pub fn has_video(&self) -> bool {
        self.vcodec
            .as_deref()
            .map_or(false, |v| v != "none" && !v.is_empty())
    }

    pub fn has_audio(&self) -> bool {
        self.acodec
            .as_deref()
            .map_or(false, |a| a != "none" && !a.is_empty())
    }

    /// Video stream without audio; needs a merge with an audio stream
    pub fn is_video_only(&self) -> bool {
        self.has_video() && !self.has_audio()
    }

    pub fn is_audio_only(&self) -> bool {
        self.has_audio() && !self.has_video()
    }

    pub fn is_h264(&self) -> bool {
        self.vcodec.as_deref().map_or(false, |v| v.starts_with("avc1"))
    }

    pub fn is_vp9(&self) -> bool {
        self.vcodec.as_deref().map_or(false, |v| v.starts_with("vp9") || v.starts_with("vp09"))
    }

    pub fn is_av1(&self) -> bool {
        self.vcodec.as_deref().map_or(false, |v| v.starts_with("av01"))
    }

    /// Check if audio is AAC (m4a)
    pub fn is_aac(&self) -> bool {
        self.acodec.as_deref().map_or(false, |a| a.starts_with("mp4a"))
    }
}

/// Media metadata with every format the resolver knows about
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaInfo {
    pub id: String,
    pub title: String,
    pub uploader: String,
    pub duration_seconds: u64,
    pub webpage_url: String,
    pub formats: Vec<RawFormat>,
}

/// One entry of a flat playlist listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistEntry {
    pub id: String,
    pub title: String,
    pub url: String,
}

/// Network configuration for backends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// SOCKS5/HTTP proxy URL (e.g., "socks5://127.0.0.1:1080")
    pub proxy: Option<String>,

    /// Socket timeout handed to yt-dlp, in seconds
    pub socket_timeout_secs: u32,

    /// Upper bound for metadata calls (format listing, playlist listing)
    pub command_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            socket_timeout_secs: 30,
            command_timeout_secs: 120,
        }
    }
}
