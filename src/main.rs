use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{debug, error};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use youtube_downloader_lib::console::{self, ConsoleError, Session};
use youtube_downloader_lib::downloader::tools::ToolManager;
use youtube_downloader_lib::{
    DownloadError, Orchestrator, OrchestratorConfig, QualitySelector, TaskState, YtDlpResolver,
};

const EXIT_FAILURE: u8 = 1;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(
    name = "youtube-downloader",
    version,
    about = "Resolve quality options for a video URL and download it with yt-dlp"
)]
struct Cli {
    /// Video URL; prompted for when omitted
    url: Option<String>,

    /// Output directory (defaults to the user's download directory)
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Use the console interface
    #[arg(long)]
    console: bool,

    /// Download every entry of a playlist
    #[arg(long, value_name = "URL")]
    playlist: Option<String>,

    /// Quality to download: best, audio, 720p or #N; skips the prompt
    #[arg(short, long, value_name = "QUALITY")]
    quality: Option<QualitySelector>,

    /// End a playlist on its first failed item
    #[arg(long)]
    stop_on_failure: bool,

    /// Retries for transient network errors
    #[arg(long, value_name = "N")]
    retries: Option<u32>,

    /// Proxy URL handed to yt-dlp (e.g. socks5://127.0.0.1:1080)
    #[arg(long, value_name = "URL")]
    proxy: Option<String>,

    /// JSON configuration file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Show where yt-dlp and ffmpeg were found and exit
    #[arg(long)]
    check_tools: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %err, "aborting");
            eprintln!("Error: {}", err);
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, ConsoleError> {
    let mut config = OrchestratorConfig::load_or_default(cli.config.as_deref())?;
    if let Some(retries) = cli.retries {
        config = config.with_max_retries(retries);
    }
    if cli.stop_on_failure {
        config = config.with_stop_on_first_failure(true);
    }
    if cli.proxy.is_some() {
        config = config.with_proxy(cli.proxy.clone());
    }

    if cli.check_tools {
        return Ok(check_tools(&config));
    }

    debug!(console = cli.console, ?config, "starting");
    let output_dir = cli
        .output
        .or_else(dirs::download_dir)
        .unwrap_or_else(|| PathBuf::from("."));

    let resolver = Arc::new(YtDlpResolver::new(&config));
    let orchestrator = Orchestrator::new(resolver, config);

    let session = Session {
        url: cli.url,
        playlist: cli.playlist,
        output_dir,
        quality: cli.quality,
    };

    let snapshot = console::run(&orchestrator, session).await?;
    Ok(match snapshot.state {
        TaskState::Completed => ExitCode::SUCCESS,
        TaskState::Cancelled => ExitCode::from(EXIT_INTERRUPTED),
        _ => ExitCode::from(EXIT_FAILURE),
    })
}

fn check_tools(config: &OrchestratorConfig) -> ExitCode {
    let manager = ToolManager::from_config(config);
    let mut ready = true;

    for tool in manager.get_all_tools() {
        match (&tool.path, &tool.version) {
            (Some(path), version) => println!(
                "{:<8} {} ({})",
                tool.name,
                version.as_deref().unwrap_or("unknown version"),
                path.display()
            ),
            (None, _) => {
                ready = false;
                println!("{:<8} not found", tool.name);
            }
        }
    }

    if ready {
        ExitCode::SUCCESS
    } else {
        eprintln!("{}", DownloadError::Environment("install the missing tools and make sure they are on PATH".to_string()));
        ExitCode::from(EXIT_FAILURE)
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}
