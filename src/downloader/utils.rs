// Helper functions shared by the orchestrator and the backends

use std::path::Path;
use std::process::Stdio;

use lazy_static::lazy_static;
use regex::Regex;
use tokio::io::AsyncReadExt;
use tokio::process::Command as TokioCommand;
use tokio::time::{timeout, Duration as TokioDuration};

use super::errors::{ResolutionError, ResolverError};

const MAX_FILE_STEM_CHARS: usize = 200;

lazy_static! {
    // scheme://host[:port] followed by a path or query
    static ref URL_RE: Regex = Regex::new(
        r"^https?://[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?)*(?::\d{1,5})?(?:/[^\s]*|\?[^\s]+)$"
    ).unwrap();
    static ref PLAYLIST_RE: Regex = Regex::new(r"(?:[?&]list=[\w-]+|/playlist(?:$|[/?]))").unwrap();
}

/// Shape of a structurally valid media URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlKind {
    Video,
    Playlist,
}

/// Structural URL check, no network involved
pub fn validate_url(url: &str) -> Result<UrlKind, ResolutionError> {
    let trimmed = url.trim();
    if trimmed.is_empty() || !URL_RE.is_match(trimmed) {
        return Err(ResolutionError::MalformedUrl(url.to_string()));
    }

    // A bare host with "/" carries nothing to resolve
    let after_scheme = trimmed.splitn(2, "://").nth(1).unwrap_or("");
    let rest = after_scheme.find(['/', '?']).map(|i| &after_scheme[i..]).unwrap_or("");
    if rest.trim_start_matches('/').is_empty() {
        return Err(ResolutionError::MalformedUrl(url.to_string()));
    }

    if PLAYLIST_RE.is_match(trimmed) {
        Ok(UrlKind::Playlist)
    } else {
        Ok(UrlKind::Video)
    }
}

pub fn is_youtube_url(url: &str) -> bool {
    let lower = url.to_lowercase();
    lower.contains("youtube.com") || lower.contains("youtu.be")
}

/// Deterministic, filesystem-safe file stem derived from a media title
pub fn sanitize_filename(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_matches(|c: char| c == '.' || c == ' ');
    let truncated: String = trimmed.chars().take(MAX_FILE_STEM_CHARS).collect();
    let truncated = truncated.trim_end_matches(|c: char| c == '.' || c == ' ');

    if truncated.is_empty() {
        "download".to_string()
    } else {
        truncated.to_string()
    }
}

/// Format file size for display
pub fn format_size(bytes: u64) -> String {
    let mb = bytes as f64 / 1_048_576.0;
    if mb >= 1024.0 {
        format!("{:.1} GB", mb / 1024.0)
    } else if mb >= 1.0 {
        format!("{:.0} MB", mb)
    } else {
        format!("{:.0} KB", bytes as f64 / 1024.0)
    }
}

/// "1:02:03" / "4:05" style duration for ETA display
pub fn format_eta(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{}:{:02}", minutes, secs)
    }
}

/// Run command with timeout and collect its output
pub async fn run_output_with_timeout(
    program: &Path,
    args: Vec<String>,
    timeout_secs: u64,
) -> Result<std::process::Output, ResolverError> {
    let name = program.display().to_string();
    let mut child = TokioCommand::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ResolverError::ToolNotFound(name.clone()),
            _ => ResolverError::Execution(format!("failed to start {}: {}", name, e)),
        })?;

    let mut stdout_pipe = child
        .stdout
        .take()
        .ok_or_else(|| ResolverError::Execution(format!("failed to capture stdout from {}", name)))?;
    let mut stderr_pipe = child
        .stderr
        .take()
        .ok_or_else(|| ResolverError::Execution(format!("failed to capture stderr from {}", name)))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stdout_pipe.read_to_end(&mut buf).await.map(|_| buf)
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr_pipe.read_to_end(&mut buf).await.map(|_| buf)
    });

    let waited = timeout(TokioDuration::from_secs(timeout_secs), child.wait()).await;
    match waited {
        Ok(status_res) => {
            let status = status_res
                .map_err(|e| ResolverError::Execution(format!("failed to wait for {}: {}", name, e)))?;
            let stdout = join_pipe(stdout_task, "stdout").await?;
            let stderr = join_pipe(stderr_task, "stderr").await?;
            Ok(std::process::Output { status, stdout, stderr })
        }
        Err(_) => {
            let _ = child.kill().await;
            stdout_task.abort();
            stderr_task.abort();
            Err(ResolverError::Network(format!(
                "{} timed out after {}s",
                name, timeout_secs
            )))
        }
    }
}

async fn join_pipe(
    task: tokio::task::JoinHandle<std::io::Result<Vec<u8>>>,
    pipe: &str,
) -> Result<Vec<u8>, ResolverError> {
    task.await
        .map_err(|e| ResolverError::Execution(format!("{} reader failed: {}", pipe, e)))?
        .map_err(|e| ResolverError::Io(format!("failed to read {}: {}", pipe, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_urls() {
        assert_eq!(validate_url("https://site/watch?v=abc"), Ok(UrlKind::Video));
        assert_eq!(
            validate_url("https://www.youtube.com/watch?v=dQw4w9WgXcQ"),
            Ok(UrlKind::Video)
        );
        assert_eq!(validate_url("https://youtu.be/dQw4w9WgXcQ"), Ok(UrlKind::Video));
        assert_eq!(
            validate_url("https://www.youtube.com/playlist?list=PL1234abcd"),
            Ok(UrlKind::Playlist)
        );
        assert_eq!(
            validate_url("https://www.youtube.com/watch?v=abc&list=PL99"),
            Ok(UrlKind::Playlist)
        );
        assert_eq!(validate_url("http://localhost:8080/v/1"), Ok(UrlKind::Video));
    }

    #[test]
    fn test_malformed_urls() {
        for url in [
            "",
            "   ",
            "not a url",
            "www.youtube.com/watch?v=abc",
            "ftp://site/file",
            "https://",
            "https://site",
            "https://site/",
            "https://exa mple.com/watch",
            "https://site/watch?v=a b",
            "javascript:alert(1)",
        ] {
            assert!(
                matches!(validate_url(url), Err(ResolutionError::MalformedUrl(_))),
                "{:?} should be rejected",
                url
            );
        }
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("My Video: Part 1/2"), "My Video_ Part 1_2");
        assert_eq!(sanitize_filename("  ..hidden.. "), "hidden");
        assert_eq!(sanitize_filename("tab\there"), "tab_here");
        assert_eq!(sanitize_filename("???"), "___");
        assert_eq!(sanitize_filename(""), "download");
        assert_eq!(sanitize_filename(&"x".repeat(500)).chars().count(), 200);
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_size(150 * 1_048_576), "150 MB");
        assert_eq!(format_size(3 * 1_073_741_824), "3.0 GB");
        assert_eq!(format_size(2048), "2 KB");
        assert_eq!(format_eta(65), "1:05");
        assert_eq!(format_eta(3723), "1:02:03");
    }
}
