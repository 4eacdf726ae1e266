// External tool detection (yt-dlp, ffmpeg)

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::config::OrchestratorConfig;
use super::errors::ResolverError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ToolType {
    YtDlp,
    Ffmpeg,
}

impl ToolType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolType::YtDlp => "yt-dlp",
            ToolType::Ffmpeg => "ffmpeg",
        }
    }

    fn version_arg(&self) -> &'static str {
        match self {
            ToolType::YtDlp => "--version",
            ToolType::Ffmpeg => "-version",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub tool_type: ToolType,
    pub version: Option<String>,
    pub path: Option<PathBuf>,
    pub is_available: bool,
}

/// Locates the external binaries the resolver shells out to
#[derive(Debug, Clone, Default)]
pub struct ToolManager {
    ytdlp_override: Option<PathBuf>,
    ffmpeg_override: Option<PathBuf>,
}

impl ToolManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Honour the `ytdlp_path` / `ffmpeg_path` overrides of the config
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            ytdlp_override: config.ytdlp_path.clone(),
            ffmpeg_override: config.ffmpeg_path.clone(),
        }
    }

    /// Path of `tool`: the configured override if it exists, else a PATH lookup
    pub fn locate(&self, tool: ToolType) -> Option<PathBuf> {
        let configured = match tool {
            ToolType::YtDlp => self.ytdlp_override.as_deref(),
            ToolType::Ffmpeg => self.ffmpeg_override.as_deref(),
        };

        if let Some(path) = configured {
            return path.is_file().then(|| path.to_path_buf());
        }

        which::which(tool.as_str()).ok()
    }

    /// Like `locate`, but a missing binary is an error
    pub fn require(&self, tool: ToolType) -> Result<PathBuf, ResolverError> {
        self.locate(tool).ok_or_else(|| {
            debug!(tool = tool.as_str(), "binary not found");
            ResolverError::ToolNotFound(tool.as_str().to_string())
        })
    }

    pub fn get_tool_info(&self, tool_type: ToolType) -> ToolInfo {
        let path = self.locate(tool_type);
        let version = path.as_deref().and_then(|p| Self::get_version(p, tool_type));

        ToolInfo {
            name: tool_type.as_str().to_string(),
            tool_type,
            version,
            is_available: path.is_some(),
            path,
        }
    }

    pub fn get_all_tools(&self) -> Vec<ToolInfo> {
        vec![
            self.get_tool_info(ToolType::YtDlp),
            self.get_tool_info(ToolType::Ffmpeg),
        ]
    }

    fn get_version(path: &Path, tool_type: ToolType) -> Option<String> {
        match Command::new(path).arg(tool_type.version_arg()).output() {
            Ok(output) if output.status.success() => {
                let out = String::from_utf8_lossy(&output.stdout);
                parse_version(tool_type, &out)
            }
            _ => None,
        }
    }
}

/// First meaningful token of a `--version` output
fn parse_version(tool_type: ToolType, output: &str) -> Option<String> {
    let first = output.lines().next()?.trim();
    if first.is_empty() {
        return None;
    }

    match tool_type {
        // "ffmpeg version 6.1.1 Copyright (c) 2000-2023 ..."
        ToolType::Ffmpeg => first
            .strip_prefix("ffmpeg version ")
            .and_then(|rest| rest.split_whitespace().next())
            .map(str::to_string)
            .or_else(|| Some(first.to_string())),
        ToolType::YtDlp => Some(first.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        assert_eq!(
            parse_version(ToolType::Ffmpeg, "ffmpeg version 6.1.1 Copyright (c) 2000-2023\nbuilt with gcc"),
            Some("6.1.1".to_string())
        );
        assert_eq!(
            parse_version(ToolType::YtDlp, "2024.08.06\n"),
            Some("2024.08.06".to_string())
        );
        assert_eq!(parse_version(ToolType::YtDlp, ""), None);
    }

    #[test]
    fn test_missing_override_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig {
            ytdlp_path: Some(dir.path().join("no-such-yt-dlp")),
            ..Default::default()
        };
        let manager = ToolManager::from_config(&config);

        assert!(manager.locate(ToolType::YtDlp).is_none());
        assert_eq!(
            manager.require(ToolType::YtDlp).unwrap_err(),
            ResolverError::ToolNotFound("yt-dlp".to_string())
        );
        assert!(!manager.get_tool_info(ToolType::YtDlp).is_available);
    }

    #[test]
    fn test_existing_override_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("ffmpeg");
        std::fs::write(&fake, b"").unwrap();
        let config = OrchestratorConfig {
            ffmpeg_path: Some(fake.clone()),
            ..Default::default()
        };

        assert_eq!(ToolManager::from_config(&config).locate(ToolType::Ffmpeg), Some(fake));
    }
}
