// Interactive console front-end
//
// Prompts for a URL and a quality, starts the download and renders the
// task's event stream as a progress bar. Ctrl-C cancels the task.

use std::path::PathBuf;

use dialoguer::{theme::ColorfulTheme, Input, Select};
use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;

use crate::downloader::utils::{format_eta, format_size};
use crate::downloader::{
    DownloadError, DownloadMode, DownloadRequest, Orchestrator, Progress, QualityOption,
    QualitySelector, TaskEvent, TaskSnapshot, TaskState,
};

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error("prompt failed: {0}")]
    Prompt(String),
}

/// What the user asked for on the command line
#[derive(Debug, Clone)]
pub struct Session {
    pub url: Option<String>,
    pub playlist: Option<String>,
    pub output_dir: PathBuf,
    /// Skips the quality prompt when set
    pub quality: Option<QualitySelector>,
}

/// Run one download end to end and return its terminal snapshot
pub async fn run(orchestrator: &Orchestrator, session: Session) -> Result<TaskSnapshot, ConsoleError> {
    let (url, mode) = match (session.playlist, session.url) {
        (Some(playlist), _) => (playlist, DownloadMode::Playlist),
        (None, Some(url)) => (url, DownloadMode::Single),
        (None, None) => (prompt_url().await?, DownloadMode::Single),
    };

    let quality = match session.quality {
        Some(QualitySelector::Best) => QualitySelector::Best,
        Some(selector) => {
            with_spinner("Fetching available qualities...", orchestrator.resolve_qualities(&url)).await?;
            selector
        }
        None => {
            let options =
                with_spinner("Fetching available qualities...", orchestrator.resolve_qualities(&url)).await?;
            print_options(&options);
            let index = prompt_quality(&options).await?;
            QualitySelector::Index(index + 1)
        }
    };

    let request = DownloadRequest::new(url, session.output_dir, quality, mode);
    let id = orchestrator.start(request)?;
    let mut events = orchestrator.subscribe(id)?;
    let bar = progress_bar();

    let interrupted = tokio::select! {
        _ = render(&mut events, &bar) => false,
        _ = tokio::signal::ctrl_c() => true,
    };
    if interrupted {
        bar.println("Cancelling...");
        orchestrator.cancel(id)?;
        render(&mut events, &bar).await;
    }

    let snapshot = orchestrator.poll(id)?;
    bar.finish_and_clear();
    println!("{}", summary_line(&snapshot));
    Ok(snapshot)
}

async fn prompt_url() -> Result<String, ConsoleError> {
    tokio::task::spawn_blocking(|| {
        Input::<String>::with_theme(&ColorfulTheme::default())
            .with_prompt("Enter video URL")
            .interact_text()
    })
    .await
    .map_err(|e| ConsoleError::Prompt(e.to_string()))?
    .map(|url| url.trim().to_string())
    .map_err(|e| ConsoleError::Prompt(e.to_string()))
}

fn print_options(options: &[QualityOption]) {
    println!("\nAvailable qualities:");
    for (i, option) in options.iter().enumerate() {
        println!("  {}. {}", i + 1, option.label);
    }
    println!();
}

/// 0-based index of the chosen option; the first option is the default
async fn prompt_quality(options: &[QualityOption]) -> Result<usize, ConsoleError> {
    let labels: Vec<String> = options.iter().map(|o| o.label.clone()).collect();
    tokio::task::spawn_blocking(move || {
        Select::with_theme(&ColorfulTheme::default())
            .with_prompt("Select quality")
            .items(&labels)
            .default(0)
            .interact()
    })
    .await
    .map_err(|e| ConsoleError::Prompt(e.to_string()))?
    .map_err(|e| ConsoleError::Prompt(e.to_string()))
}

async fn with_spinner<T, F>(message: &'static str, fut: F) -> Result<T, DownloadError>
where
    F: std::future::Future<Output = Result<T, DownloadError>>,
{
    let spinner = ProgressBar::new_spinner();
    spinner.set_message(message);
    spinner.enable_steady_tick(std::time::Duration::from_millis(100));
    let result = fut.await;
    spinner.finish_and_clear();
    result
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(100);
    let style = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("#>-");
    bar.set_style(style);
    bar
}

/// Drive `bar` until the task's event stream closes
async fn render(events: &mut UnboundedReceiver<TaskEvent>, bar: &ProgressBar) {
    while let Some(event) = events.recv().await {
        match event {
            TaskEvent::Snapshot(snapshot) => {
                bar.set_position(snapshot.progress.percent as u64);
                bar.set_message(snapshot.state.to_string());
            }
            TaskEvent::StateChanged { to, message, .. } => {
                debug!(state = %to, "state changed");
                bar.set_message(message.unwrap_or_else(|| to.to_string()));
            }
            TaskEvent::Progress { progress, .. } => {
                bar.set_position(progress.percent as u64);
                bar.set_message(progress_message(&progress));
            }
            TaskEvent::ItemChanged { item, .. } if item.state.is_terminal() => {
                let name = item.title.as_deref().unwrap_or(&item.url);
                bar.println(format!("  [{}] {}: {}", item.index + 1, item.state, name));
            }
            TaskEvent::ItemChanged { .. } => {}
        }
    }
}

fn progress_message(progress: &Progress) -> String {
    let mut parts = Vec::new();
    match progress.total_bytes {
        Some(total) => parts.push(format!(
            "{} / {}",
            format_size(progress.downloaded_bytes),
            format_size(total)
        )),
        None => parts.push(format_size(progress.downloaded_bytes)),
    }
    if let Some(speed) = progress.speed_bps {
        parts.push(format!("{}/s", format_size(speed as u64)));
    }
    if let Some(eta) = progress.eta_secs {
        parts.push(format!("ETA {}", format_eta(eta)));
    }
    parts.join("  ")
}

fn summary_line(snapshot: &TaskSnapshot) -> String {
    match snapshot.state {
        TaskState::Completed if snapshot.mode == DownloadMode::Playlist => {
            let done = snapshot
                .items
                .iter()
                .filter(|item| item.state == TaskState::Completed)
                .count();
            format!("Playlist finished: {} of {} items downloaded", done, snapshot.items.len())
        }
        TaskState::Completed => match &snapshot.destination {
            Some(path) => format!("Download completed: {}", path.display()),
            None => "Download completed".to_string(),
        },
        TaskState::Cancelled => "Download cancelled".to_string(),
        TaskState::Failed => match &snapshot.failure {
            Some(failure) => format!("Download failed ({}): {}", failure.kind, failure.message),
            None => "Download failed".to_string(),
        },
        state => format!("Download ended in state {}", state),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::{ErrorKind, ItemResult, TaskFailure, TaskId};

    fn snapshot(state: TaskState) -> TaskSnapshot {
        TaskSnapshot {
            id: TaskId::new(),
            url: "https://site/watch?v=abc".to_string(),
            mode: DownloadMode::Single,
            quality: QualitySelector::Best,
            state,
            progress: Progress::default(),
            message: None,
            failure: None,
            destination: None,
            items: Vec::new(),
            attempts: 1,
        }
    }

    #[test]
    fn test_summary_lines() {
        let mut done = snapshot(TaskState::Completed);
        done.destination = Some(PathBuf::from("/out/A.mp4"));
        assert_eq!(summary_line(&done), "Download completed: /out/A.mp4");

        let mut failed = snapshot(TaskState::Failed);
        failed.failure = Some(TaskFailure::new(ErrorKind::Environment, "ffmpeg not found"));
        assert_eq!(
            summary_line(&failed),
            "Download failed (environment error): ffmpeg not found"
        );

        let mut playlist = snapshot(TaskState::Completed);
        playlist.mode = DownloadMode::Playlist;
        let mut first = ItemResult::new(0, "https://site/watch?v=1", None);
        first.state = TaskState::Completed;
        let mut second = ItemResult::new(1, "https://site/watch?v=2", None);
        second.state = TaskState::Failed;
        playlist.items = vec![first, second];
        assert_eq!(summary_line(&playlist), "Playlist finished: 1 of 2 items downloaded");
    }

    #[test]
    fn test_progress_message() {
        let progress = Progress {
            downloaded_bytes: 50 * 1_048_576,
            total_bytes: Some(100 * 1_048_576),
            percent: 50.0,
            speed_bps: Some(2.0 * 1_048_576.0),
            eta_secs: Some(25),
        };
        assert_eq!(progress_message(&progress), "50 MB / 100 MB  2 MB/s  ETA 0:25");
    }
}
