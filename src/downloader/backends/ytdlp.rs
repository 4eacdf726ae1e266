// yt-dlp backend - drives the `yt-dlp` binary
//
// Metadata comes from `--dump-json`, playlists from `--flat-playlist`.
// Downloads stream `--newline` output so progress, destination and merge
// lines can be forwarded while the child runs.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::downloader::config::OrchestratorConfig;
use crate::downloader::errors::ResolverError;
use crate::downloader::models::{MediaInfo, NetworkConfig, PlaylistEntry, QualityOption, RawFormat};
use crate::downloader::tools::{ToolManager, ToolType};
use crate::downloader::traits::{DownloadJob, ProgressSample, ProgressSink, Resolver, ResolverEvent};
use crate::downloader::utils::{is_youtube_url, run_output_with_timeout};

/// Machine-readable progress line: downloaded, total, estimated total, speed, eta
const PROGRESS_TEMPLATE: &str = "download:[progress] %(progress.downloaded_bytes)s %(progress.total_bytes)s %(progress.total_bytes_estimate)s %(progress.speed)s %(progress.eta)s";

lazy_static! {
    static ref PROGRESS_RE: Regex =
        Regex::new(r"^\[progress\]\s+(\S+)\s+(\S+)\s+(\S+)\s+(\S+)\s+(\S+)").unwrap();
    static ref DEST_RE: Regex = Regex::new(r"^\[download\]\s+Destination:\s+(.+)$").unwrap();
    static ref MERGE_RE: Regex = Regex::new(r#"^\[Merger\]\s+Merging formats into\s+"(.+)"$"#).unwrap();
    static ref EXTRACT_RE: Regex = Regex::new(r"^\[ExtractAudio\]\s+Destination:\s+(.+)$").unwrap();
    static ref ALREADY_RE: Regex =
        Regex::new(r"^\[download\]\s+(.+) has already been downloaded").unwrap();
}

/// Resolver backed by the yt-dlp command line tool
pub struct YtDlpResolver {
    tools: ToolManager,
    network: NetworkConfig,
    ffmpeg_location: Option<PathBuf>,
}

impl YtDlpResolver {
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            tools: ToolManager::from_config(config),
            network: config.network.clone(),
            ffmpeg_location: config.ffmpeg_path.clone(),
        }
    }

    /// Flags shared by every invocation
    fn common_args(&self) -> Vec<String> {
        let mut args = vec![
            "--no-warnings".to_string(),
            "--socket-timeout".to_string(),
            self.network.socket_timeout_secs.to_string(),
        ];

        if let Some(proxy) = &self.network.proxy {
            args.push("--proxy".to_string());
            args.push(proxy.clone());
        }

        args
    }

    fn build_resolve_args(&self, url: &str) -> Vec<String> {
        let mut args = vec!["--dump-json".to_string()];
        if url.contains("/playlist") {
            // Formats of the first entry stand in for the whole playlist
            args.push("--playlist-items".to_string());
            args.push("1".to_string());
        } else {
            args.push("--no-playlist".to_string());
        }
        args.extend(self.common_args());
        args.push(url.to_string());
        args
    }

    fn build_list_args(&self, url: &str) -> Vec<String> {
        let mut args = vec!["--flat-playlist".to_string(), "--dump-json".to_string()];
        args.extend(self.common_args());
        args.push(url.to_string());
        args
    }

    fn build_download_args(&self, job: &DownloadJob) -> Vec<String> {
        let template = job.output_dir.join(format!("{}.%(ext)s", job.file_stem));
        let mut args = vec![
            "-f".to_string(),
            job.format_spec.clone(),
            "--newline".to_string(),
            "--no-playlist".to_string(),
            "--progress-template".to_string(),
            PROGRESS_TEMPLATE.to_string(),
            "-o".to_string(),
            template.to_string_lossy().to_string(),
        ];

        if job.option.is_audio {
            args.extend(["-x", "--audio-format", "mp3"].map(str::to_string));
        } else {
            args.extend(["--merge-output-format", "mp4"].map(str::to_string));
        }

        if let Some(ffmpeg) = &self.ffmpeg_location {
            args.push("--ffmpeg-location".to_string());
            args.push(ffmpeg.to_string_lossy().to_string());
        }

        args.extend(self.common_args());
        args.push(job.url.clone());
        args
    }

    async fn run_json(&self, args: Vec<String>) -> Result<String, ResolverError> {
        let ytdlp = self.tools.require(ToolType::YtDlp)?;
        debug!(binary = %ytdlp.display(), args = %args.join(" "), "running yt-dlp");

        let output = run_output_with_timeout(&ytdlp, args, self.network.command_timeout_secs).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ResolverError::from_stderr(&stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Resolver for YtDlpResolver {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn check_environment(&self, option: &QualityOption) -> Result<(), ResolverError> {
        self.tools.require(ToolType::YtDlp)?;
        if option.requires_merge || option.is_audio {
            self.tools.require(ToolType::Ffmpeg)?;
        }
        Ok(())
    }

    async fn resolve(&self, url: &str) -> Result<MediaInfo, ResolverError> {
        let stdout = self.run_json(self.build_resolve_args(url)).await?;
        let first = stdout
            .lines()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| ResolverError::Unavailable(format!("no metadata returned for {}", url)))?;

        let info = parse_media_info(first)?;
        info!(url, title = %info.title, formats = info.formats.len(), "metadata fetched");
        Ok(info)
    }

    async fn list_entries(&self, url: &str) -> Result<Vec<PlaylistEntry>, ResolverError> {
        let stdout = self.run_json(self.build_list_args(url)).await?;
        let entries = parse_playlist_entries(&stdout, is_youtube_url(url));
        info!(url, entries = entries.len(), "playlist listed");
        Ok(entries)
    }

    async fn download(
        &self,
        job: &DownloadJob,
        sink: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<(), ResolverError> {
        let ytdlp = self.tools.require(ToolType::YtDlp)?;
        let args = self.build_download_args(job);
        debug!(binary = %ytdlp.display(), args = %args.join(" "), "spawning yt-dlp");

        let mut child = Command::new(&ytdlp)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ResolverError::ToolNotFound("yt-dlp".to_string()),
                _ => ResolverError::Execution(format!("failed to start yt-dlp: {}", e)),
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ResolverError::Execution("failed to capture yt-dlp stdout".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| ResolverError::Execution("failed to capture yt-dlp stderr".to_string()))?;

        // Raw bytes on both pipes: a title in the wrong code page must not stop the reader
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).into_owned()
        });

        let streams = if job.option.requires_merge { 2 } else { 1 };
        let mut parser = OutputParser::new(streams);
        let mut lines = BufReader::new(stdout).split(b'\n');

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    stderr_task.abort();
                    info!(url = %job.url, "yt-dlp killed after cancellation");
                    return Err(ResolverError::Cancelled);
                }
                line = lines.next_segment() => match line {
                    Ok(Some(line)) => {
                        for event in parser.parse(&String::from_utf8_lossy(&line)) {
                            sink.emit(event);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "failed to read yt-dlp output");
                        let _ = child.kill().await;
                        stderr_task.abort();
                        return Err(ResolverError::Execution(format!("failed to read yt-dlp output: {}", e)));
                    }
                }
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                stderr_task.abort();
                return Err(ResolverError::Cancelled);
            }
            status = child.wait() => status
                .map_err(|e| ResolverError::Execution(format!("failed to wait for yt-dlp: {}", e)))?,
        };

        let stderr = stderr_task.await.unwrap_or_default();
        if status.success() {
            Ok(())
        } else {
            debug!(code = ?status.code(), stderr = %stderr, "yt-dlp failed");
            Err(ResolverError::from_stderr(&stderr))
        }
    }
}

/// Turns `--newline` output into resolver events.
///
/// Separate video and audio streams are each given an equal share of the
/// overall percentage, so a second stream does not restart at zero.
struct OutputParser {
    streams: u32,
    /// Streams announced so far via "Destination:" lines
    started: u32,
}

impl OutputParser {
    fn new(streams: u32) -> Self {
        Self {
            streams: streams.max(1),
            started: 0,
        }
    }

    fn parse(&mut self, line: &str) -> Vec<ResolverEvent> {
        let line = line.trim();

        if let Some(caps) = PROGRESS_RE.captures(line) {
            return self.progress(&caps).into_iter().collect();
        }

        if let Some(caps) = DEST_RE.captures(line) {
            self.started += 1;
            return vec![ResolverEvent::Destination(PathBuf::from(&caps[1]))];
        }

        if let Some(caps) = MERGE_RE.captures(line) {
            return vec![
                ResolverEvent::Merging,
                ResolverEvent::Destination(PathBuf::from(&caps[1])),
            ];
        }

        if let Some(caps) = EXTRACT_RE.captures(line) {
            return vec![ResolverEvent::Destination(PathBuf::from(&caps[1]))];
        }

        if let Some(caps) = ALREADY_RE.captures(line) {
            self.started = self.streams;
            return vec![
                ResolverEvent::Destination(PathBuf::from(&caps[1])),
                ResolverEvent::Progress(ProgressSample {
                    percent: 100.0,
                    ..Default::default()
                }),
            ];
        }

        Vec::new()
    }

    fn progress(&self, caps: &regex::Captures<'_>) -> Option<ResolverEvent> {
        let downloaded = parse_number(&caps[1])? as u64;
        let total = parse_number(&caps[2]).or_else(|| parse_number(&caps[3])).map(|t| t as u64);
        let speed = parse_number(&caps[4]);
        let eta = parse_number(&caps[5]).map(|e| e as u64);

        let stream_percent = match total {
            Some(total) if total > 0 => (downloaded as f64 / total as f64 * 100.0).min(100.0),
            _ => 0.0,
        };
        let stream_index = self.started.saturating_sub(1).min(self.streams - 1);
        let percent = (stream_index as f64 + stream_percent / 100.0) / self.streams as f64 * 100.0;

        Some(ResolverEvent::Progress(ProgressSample {
            downloaded_bytes: downloaded,
            total_bytes: total,
            percent: percent as f32,
            speed_bps: speed,
            eta_secs: eta,
        }))
    }
}

/// yt-dlp prints "NA" for unknown template fields
fn parse_number(field: &str) -> Option<f64> {
    match field {
        "NA" | "None" => None,
        other => other.parse::<f64>().ok().filter(|n| n.is_finite() && *n >= 0.0),
    }
}

fn parse_media_info(json_line: &str) -> Result<MediaInfo, ResolverError> {
    let json: serde_json::Value = serde_json::from_str(json_line)
        .map_err(|e| ResolverError::Execution(format!("invalid JSON from yt-dlp: {}", e)))?;

    let formats = json["formats"]
        .as_array()
        .map(|formats| formats.iter().map(parse_format).collect())
        .unwrap_or_default();

    Ok(MediaInfo {
        id: json["id"].as_str().unwrap_or("unknown").to_string(),
        title: json["title"].as_str().unwrap_or("").to_string(),
        uploader: json["uploader"].as_str().unwrap_or("Unknown").to_string(),
        duration_seconds: json["duration"].as_f64().unwrap_or(0.0) as u64,
        webpage_url: json["webpage_url"].as_str().unwrap_or("").to_string(),
        formats,
    })
}

fn parse_format(f: &serde_json::Value) -> RawFormat {
    RawFormat {
        format_id: f["format_id"].as_str().unwrap_or("").to_string(),
        ext: f["ext"].as_str().unwrap_or("").to_string(),
        width: f["width"].as_u64().map(|w| w as u32),
        height: f["height"].as_u64().map(|h| h as u32),
        fps: f["fps"].as_f64().map(|fps| fps as f32),
        vcodec: f["vcodec"].as_str().map(|s| s.to_string()),
        acodec: f["acodec"].as_str().map(|s| s.to_string()),
        filesize: f["filesize"].as_u64(),
        filesize_approx: f["filesize_approx"].as_u64(),
        tbr: f["tbr"].as_f64().map(|t| t as f32),
        abr: f["abr"].as_f64().map(|a| a as f32),
        format_note: f["format_note"].as_str().map(|s| s.to_string()),
    }
}

/// One JSON object per line; entries without a usable URL are skipped
fn parse_playlist_entries(stdout: &str, youtube: bool) -> Vec<PlaylistEntry> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<serde_json::Value>(line) {
            Ok(json) => Some(json),
            Err(e) => {
                warn!(error = %e, "skipping unparsable playlist entry");
                None
            }
        })
        .filter_map(|json| {
            let id = json["id"].as_str().unwrap_or("").to_string();
            let url = match json["url"].as_str().or_else(|| json["webpage_url"].as_str()) {
                Some(url) if url.starts_with("http") => url.to_string(),
                _ if youtube && !id.is_empty() => format!("https://www.youtube.com/watch?v={}", id),
                _ => return None,
            };
            Some(PlaylistEntry {
                title: json["title"].as_str().unwrap_or(&id).to_string(),
                id,
                url,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(is_audio: bool) -> DownloadJob {
        DownloadJob {
            url: "https://site/watch?v=abc".to_string(),
            option: QualityOption {
                id: if is_audio { "audio" } else { "best" }.to_string(),
                label: String::new(),
                requires_merge: !is_audio,
                height: None,
                estimated_size: None,
                codec: None,
                is_audio,
            },
            format_spec: "bestvideo+bestaudio/best".to_string(),
            output_dir: PathBuf::from("/out"),
            file_stem: "My Video".to_string(),
        }
    }

    fn percent(events: &[ResolverEvent]) -> f32 {
        match events {
            [ResolverEvent::Progress(sample)] => sample.percent,
            other => panic!("expected progress, got {:?}", other),
        }
    }

    #[test]
    fn test_download_args() {
        let config = OrchestratorConfig::default().with_proxy(Some("socks5://127.0.0.1:1080".to_string()));
        let resolver = YtDlpResolver::new(&config);

        let args = resolver.build_download_args(&job(false));
        assert!(args.windows(2).any(|w| w == ["-f", "bestvideo+bestaudio/best"]));
        assert!(args.windows(2).any(|w| w == ["--merge-output-format", "mp4"]));
        assert!(args.windows(2).any(|w| w == ["-o", "/out/My Video.%(ext)s"]));
        assert!(args.windows(2).any(|w| w == ["--proxy", "socks5://127.0.0.1:1080"]));
        assert!(args.contains(&"--newline".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("https://site/watch?v=abc"));

        let audio = resolver.build_download_args(&job(true));
        assert!(audio.windows(3).any(|w| w == ["-x", "--audio-format", "mp3"]));
        assert!(!audio.contains(&"--merge-output-format".to_string()));
    }

    #[test]
    fn test_resolve_args_for_playlist_url() {
        let resolver = YtDlpResolver::new(&OrchestratorConfig::default());
        let args = resolver.build_resolve_args("https://www.youtube.com/playlist?list=PL1");
        assert!(args.windows(2).any(|w| w == ["--playlist-items", "1"]));

        let args = resolver.build_resolve_args("https://www.youtube.com/watch?v=abc&list=PL1");
        assert!(args.contains(&"--no-playlist".to_string()));
    }

    #[test]
    fn test_progress_is_weighted_per_stream() {
        let mut parser = OutputParser::new(2);

        assert!(matches!(
            &parser.parse("[download] Destination: /out/My Video.f137.mp4")[..],
            [ResolverEvent::Destination(_)]
        ));
        assert_eq!(percent(&parser.parse("[progress] 50 100 NA 1024.5 3")), 25.0);

        parser.parse("[download] Destination: /out/My Video.f140.m4a");
        assert_eq!(percent(&parser.parse("[progress] 10 10 NA NA NA")), 100.0);

        let merge = parser.parse(r#"[Merger] Merging formats into "/out/My Video.mp4""#);
        assert_eq!(
            merge,
            vec![
                ResolverEvent::Merging,
                ResolverEvent::Destination(PathBuf::from("/out/My Video.mp4"))
            ]
        );
    }

    #[test]
    fn test_progress_with_estimated_total() {
        let mut parser = OutputParser::new(1);
        parser.parse("[download] Destination: /out/a.webm");
        match &parser.parse("[progress] 256 NA 1024 NA NA")[..] {
            [ResolverEvent::Progress(sample)] => {
                assert_eq!(sample.total_bytes, Some(1024));
                assert_eq!(sample.percent, 25.0);
                assert_eq!(sample.speed_bps, None);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(parser.parse("[youtube] abc: Downloading webpage").is_empty());
    }

    #[test]
    fn test_already_downloaded_counts_as_done() {
        let mut parser = OutputParser::new(2);
        let events = parser.parse("[download] /out/a.mp4 has already been downloaded");
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[1], ResolverEvent::Progress(s) if s.percent == 100.0));
    }

    #[test]
    fn test_parse_media_info() {
        let json = r#"{"id":"abc","title":"A Title","uploader":"Someone","duration":61.5,
            "webpage_url":"https://site/watch?v=abc","formats":[
            {"format_id":"137","ext":"mp4","width":1920,"height":1080,"vcodec":"avc1.640028","acodec":"none","filesize":1000},
            {"format_id":"140","ext":"m4a","vcodec":"none","acodec":"mp4a.40.2","abr":129.5}]}"#
            .replace('\n', "");

        let info = parse_media_info(&json).unwrap();
        assert_eq!(info.title, "A Title");
        assert_eq!(info.duration_seconds, 61);
        assert_eq!(info.formats.len(), 2);
        assert!(info.formats[0].is_video_only());
        assert!(info.formats[1].is_audio_only());

        assert!(matches!(parse_media_info("not json"), Err(ResolverError::Execution(_))));
    }

    #[test]
    fn test_parse_playlist_entries() {
        let stdout = concat!(
            r#"{"id":"a1","title":"First","url":"https://www.youtube.com/watch?v=a1"}"#,
            "\n",
            r#"{"id":"b2","title":"Second"}"#,
            "\n",
            "garbage\n",
            "\n",
        );

        let entries = parse_playlist_entries(stdout, true);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].url, "https://www.youtube.com/watch?v=b2");
        assert_eq!(entries[1].title, "Second");

        assert_eq!(parse_playlist_entries(stdout, false).len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_download_survives_non_utf8_output() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("yt-dlp");
        std::fs::write(
            &script,
            concat!(
                "#!/bin/sh\n",
                "printf '[download] Destination: /out/x\\377\\376.mp4\\n'\n",
                "i=0\n",
                "while [ $i -lt 6000 ]; do\n",
                "  echo \"[download] filler line $i to fill the pipe buffer well past its size\"\n",
                "  i=$((i+1))\n",
                "done\n",
                "printf '\\377 on stderr\\n' >&2\n",
                "echo '[progress] 100 100 NA NA 0'\n",
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = OrchestratorConfig::default();
        config.ytdlp_path = Some(script);
        let resolver = YtDlpResolver::new(&config);

        let mut job = job(false);
        job.option.requires_merge = false;
        job.output_dir = dir.path().to_path_buf();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(20),
            resolver.download(&job, ProgressSink::new(tx), CancellationToken::new()),
        )
        .await
        .expect("download did not finish");
        assert_eq!(result, Ok(()));

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(events.iter().any(|event| matches!(
            event,
            ResolverEvent::Destination(path) if path.to_string_lossy().contains('\u{FFFD}')
        )));
        assert!(events
            .iter()
            .any(|event| matches!(event, ResolverEvent::Progress(sample) if sample.percent == 100.0)));
    }
}
