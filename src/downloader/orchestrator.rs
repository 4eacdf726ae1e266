// Download orchestrator: validation, task registry and per-task workers

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::OrchestratorConfig;
use super::errors::{DownloadError, ErrorKind, ResolutionError, ResolverError, TaskFailure};
use super::format_selector::FormatSelector;
use super::models::{DownloadMode, DownloadRequest, QualityOption, QualitySelector};
use super::selection::{select, QualitySnapshot};
use super::task::{ItemResult, Progress, TaskEvent, TaskId, TaskRecord, TaskSnapshot, TaskState};
use super::traits::{DownloadJob, ProgressSink, Resolver, ResolverEvent};
use super::utils::{sanitize_filename, validate_url};

const SKIPPED_MESSAGE: &str = "skipped after earlier failure";

/// Coordinates resolution, validation and download tasks.
///
/// Every instance owns its own registry; dropping it cancels all of its
/// unfinished tasks.
pub struct Orchestrator {
    shared: Arc<Shared>,
}

struct Shared {
    resolver: Arc<dyn Resolver>,
    config: OrchestratorConfig,
    tasks: RwLock<HashMap<TaskId, Arc<TaskRecord>>>,
    last_snapshot: Mutex<Option<QualitySnapshot>>,
    claims: Mutex<HashSet<PathBuf>>,
    shutdown: CancellationToken,
    /// Workers run here, whichever thread calls `start`
    runtime: Handle,
}

/// Where state changes of one download run are recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    /// The task itself (single mode)
    Task,
    /// One playlist entry; the task stays `downloading`
    Item { index: usize, total: usize },
}

#[derive(Debug)]
enum ItemOutcome {
    Completed(PathBuf),
    Failed(TaskFailure),
    Cancelled,
}

impl ItemOutcome {
    fn from_error(err: ResolverError) -> Self {
        match err {
            ResolverError::Cancelled => Self::Cancelled,
            other => Self::Failed(TaskFailure::from(&other)),
        }
    }
}

/// What a backend reported during one download attempt
#[derive(Debug, Default)]
struct AttemptReport {
    destination: Option<PathBuf>,
}

/// Destination reserved for one active item; released on drop
struct Claim<'a> {
    claims: &'a Mutex<HashSet<PathBuf>>,
    path: PathBuf,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.claims.lock().remove(&self.path);
    }
}

impl Orchestrator {
    /// Bind to the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a runtime; use [`Orchestrator::with_runtime`] there.
    pub fn new(resolver: Arc<dyn Resolver>, config: OrchestratorConfig) -> Self {
        Self::with_runtime(resolver, config, Handle::current())
    }

    pub fn with_runtime(resolver: Arc<dyn Resolver>, config: OrchestratorConfig, runtime: Handle) -> Self {
        Self {
            shared: Arc::new(Shared {
                resolver,
                config,
                tasks: RwLock::new(HashMap::new()),
                last_snapshot: Mutex::new(None),
                claims: Mutex::new(HashSet::new()),
                shutdown: CancellationToken::new(),
                runtime,
            }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.shared.config
    }

    /// List the quality options of `url`, best first.
    ///
    /// Malformed URLs are rejected before the resolver is consulted. A
    /// successful call replaces the snapshot used to validate `start`.
    pub async fn resolve_qualities(&self, url: &str) -> Result<Vec<QualityOption>, DownloadError> {
        let url = url.trim();
        validate_url(url)?;

        debug!(url, backend = self.shared.resolver.name(), "resolving qualities");
        let info = self.shared.resolver.resolve(url).await?;
        if info.formats.is_empty() {
            return Err(ResolutionError::NoFormats(url.to_string()).into());
        }

        let options = FormatSelector::build_quality_options(&info.formats);
        info!(url, title = %info.title, options = options.len(), "resolved qualities");

        *self.shared.last_snapshot.lock() = Some(QualitySnapshot::new(url, options.clone()));
        Ok(options)
    }

    /// Validate `request` and start it in the background.
    ///
    /// Checks run in order: URL shape, output directory, quality selection,
    /// duplicate active request. On error no task is created.
    pub fn start(&self, request: DownloadRequest) -> Result<TaskId, DownloadError> {
        validate_url(request.url())?;
        prepare_output_dir(request.output_dir())?;

        let option = {
            let snapshot = self.shared.last_snapshot.lock();
            select(snapshot.as_ref(), request.url(), request.quality())?
        };

        let id = TaskId::new();
        let record = {
            let mut tasks = self.shared.tasks.write();
            let duplicate = tasks
                .values()
                .any(|task| task.request() == &request && !task.is_terminal());
            if duplicate {
                return Err(DownloadError::Config(format!(
                    "{} is already being downloaded to {}",
                    request.url(),
                    request.output_dir().display()
                )));
            }

            let record = Arc::new(TaskRecord::new(
                id,
                request,
                self.shared.shutdown.child_token(),
            ));
            tasks.insert(id, record.clone());
            record
        };

        info!(
            task = %id,
            url = record.request().url(),
            mode = %record.request().mode(),
            quality = %option.label,
            "task queued"
        );

        let shared = self.shared.clone();
        self.shared.runtime.spawn(async move {
            shared.run(record, option).await;
        });

        Ok(id)
    }

    /// Current snapshot of a task. Never fails because of the task's own errors.
    pub fn poll(&self, id: TaskId) -> Result<TaskSnapshot, DownloadError> {
        self.shared.record(id).map(|record| record.snapshot())
    }

    /// Request cooperative cancellation. Cancelling a finished task is a no-op.
    pub fn cancel(&self, id: TaskId) -> Result<(), DownloadError> {
        let record = self.shared.record(id)?;
        if !record.is_terminal() {
            info!(task = %id, "cancellation requested");
        }
        record.cancel_token().cancel();
        Ok(())
    }

    /// Event stream of a task, starting with its current snapshot
    pub fn subscribe(&self, id: TaskId) -> Result<UnboundedReceiver<TaskEvent>, DownloadError> {
        self.shared.record(id).map(|record| record.subscribe())
    }

    /// Snapshots of every task started by this orchestrator
    pub fn tasks(&self) -> Vec<TaskSnapshot> {
        self.shared
            .tasks
            .read()
            .values()
            .map(|record| record.snapshot())
            .collect()
    }

    /// Wait until the task reaches a terminal state
    pub async fn wait(&self, id: TaskId) -> Result<TaskSnapshot, DownloadError> {
        let mut events = self.subscribe(id)?;
        while events.recv().await.is_some() {}
        self.poll(id)
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

/// Create the directory when absent and make sure files can be written into it
fn prepare_output_dir(dir: &Path) -> Result<(), DownloadError> {
    if dir.as_os_str().is_empty() {
        return Err(DownloadError::Config("output directory is empty".to_string()));
    }

    if dir.exists() && !dir.is_dir() {
        return Err(DownloadError::Config(format!(
            "output path {} is not a directory",
            dir.display()
        )));
    }

    std::fs::create_dir_all(dir).map_err(|e| {
        DownloadError::Config(format!("cannot create {}: {}", dir.display(), e))
    })?;

    let probe = dir.join(format!(".write-test-{}", TaskId::new()));
    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&probe)
        .and_then(|_| std::fs::remove_file(&probe))
        .map_err(|e| {
            DownloadError::Config(format!("output directory {} is not writable: {}", dir.display(), e))
        })
}

/// Selector that reproduces `option` on another item's option list
fn selector_for(option: &QualityOption) -> QualitySelector {
    if option.is_best() {
        QualitySelector::Best
    } else if option.is_audio {
        QualitySelector::Audio
    } else if let Some(height) = option.height {
        QualitySelector::Height(height)
    } else {
        QualitySelector::Id(option.id.clone())
    }
}

impl Shared {
    fn record(&self, id: TaskId) -> Result<Arc<TaskRecord>, DownloadError> {
        self.tasks
            .read()
            .get(&id)
            .cloned()
            .ok_or(DownloadError::NotFound(id))
    }

    async fn run(&self, record: Arc<TaskRecord>, option: QualityOption) {
        let selector = selector_for(&option);
        match record.request().mode() {
            DownloadMode::Single => self.run_single(&record, &selector).await,
            DownloadMode::Playlist => self.run_playlist(&record, &selector).await,
        }

        let snapshot = record.snapshot();
        info!(
            task = %snapshot.id,
            state = %snapshot.state,
            attempts = snapshot.attempts,
            "task finished"
        );
    }

    async fn run_single(&self, record: &TaskRecord, selector: &QualitySelector) {
        let url = record.request().url().to_string();

        match self.run_item(record, Scope::Task, &url, selector).await {
            ItemOutcome::Completed(path) => {
                let message = format!("saved to {}", path.display());
                record.set_destination(path);
                record.transition(TaskState::Completed, Some(message));
            }
            ItemOutcome::Failed(failure) => {
                error!(task = %record.id(), kind = %failure.kind, error = %failure.message, "download failed");
                record.fail(failure);
            }
            ItemOutcome::Cancelled => {
                record.transition(TaskState::Cancelled, Some("cancelled".to_string()));
            }
        }
    }

    async fn run_playlist(&self, record: &TaskRecord, selector: &QualitySelector) {
        let id = record.id();
        let url = record.request().url().to_string();
        let cancel = record.cancel_token().clone();

        if cancel.is_cancelled() {
            record.transition(TaskState::Cancelled, Some("cancelled".to_string()));
            return;
        }
        record.transition(TaskState::Resolving, Some("listing playlist entries".to_string()));

        let entries = match self
            .with_retries(record, "list", || self.resolver.list_entries(&url))
            .await
        {
            Ok(entries) => entries,
            Err(ResolverError::Cancelled) => {
                record.transition(TaskState::Cancelled, Some("cancelled".to_string()));
                return;
            }
            Err(err) => {
                error!(task = %id, error = %err, "playlist listing failed");
                record.fail(TaskFailure::from(&err));
                return;
            }
        };

        if entries.is_empty() {
            let err = DownloadError::from(ResolutionError::NoFormats(format!("playlist {} has no entries", url)));
            record.fail(TaskFailure::from(&err));
            return;
        }

        let total = entries.len();
        record.set_items(
            entries
                .iter()
                .enumerate()
                .map(|(index, entry)| {
                    let title = (!entry.title.is_empty()).then(|| entry.title.clone());
                    ItemResult::new(index, entry.url.clone(), title)
                })
                .collect(),
        );
        record.transition(TaskState::Downloading, Some(format!("downloading {} items", total)));

        let mut completed = 0usize;
        let mut first_failure: Option<(usize, TaskFailure)> = None;

        for (index, entry) in entries.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }

            let outcome = self
                .run_item(record, Scope::Item { index, total }, &entry.url, selector)
                .await;

            match outcome {
                ItemOutcome::Completed(path) => {
                    completed += 1;
                    record.update_item(index, |item| {
                        item.state = TaskState::Completed;
                        item.message = Some(format!("saved to {}", path.display()));
                        item.destination = Some(path);
                    });
                }
                ItemOutcome::Failed(failure) => {
                    warn!(task = %id, item = index + 1, kind = %failure.kind, error = %failure.message, "playlist item failed");
                    record.update_item(index, |item| {
                        item.state = TaskState::Failed;
                        item.message = Some(failure.message.clone());
                        item.failure = Some(failure.clone());
                    });
                    if self.config.stop_on_first_failure {
                        first_failure = Some((index, failure));
                        break;
                    }
                }
                ItemOutcome::Cancelled => break,
            }
        }

        if cancel.is_cancelled() {
            self.close_remaining(record, total, "cancelled");
            record.transition(TaskState::Cancelled, Some("cancelled".to_string()));
        } else if let Some((index, failure)) = first_failure {
            self.close_remaining(record, total, SKIPPED_MESSAGE);
            record.fail(TaskFailure::new(
                failure.kind,
                format!("item {} of {} failed: {}", index + 1, total, failure.message),
            ));
        } else {
            record.transition(
                TaskState::Completed,
                Some(format!("{} of {} items downloaded", completed, total)),
            );
        }
    }

    /// Record every non-terminal item as cancelled
    fn close_remaining(&self, record: &TaskRecord, total: usize, message: &str) {
        for index in 0..total {
            if record.item_state(index).map_or(false, |state| !state.is_terminal()) {
                record.update_item(index, |item| {
                    item.state = TaskState::Cancelled;
                    item.message = Some(message.to_string());
                });
            }
        }
    }

    /// Resolve, check, claim, download and merge one item
    async fn run_item(
        &self,
        record: &TaskRecord,
        scope: Scope,
        url: &str,
        selector: &QualitySelector,
    ) -> ItemOutcome {
        let cancel = record.cancel_token();
        if cancel.is_cancelled() {
            return ItemOutcome::Cancelled;
        }

        self.enter(record, scope, TaskState::Resolving, "resolving media".to_string());
        let info = match self
            .with_retries(record, "resolve", || self.resolver.resolve(url))
            .await
        {
            Ok(info) => info,
            Err(err) => return ItemOutcome::from_error(err),
        };

        if info.formats.is_empty() {
            let err = DownloadError::from(ResolutionError::NoFormats(url.to_string()));
            return ItemOutcome::Failed(TaskFailure::from(&err));
        }

        let options = FormatSelector::build_quality_options(&info.formats);
        let option = FormatSelector::closest_option(&options, selector);
        debug!(task = %record.id(), url, quality = %option.id, merge = option.requires_merge, "quality chosen");

        if let Err(err) = self.resolver.check_environment(&option).await {
            return ItemOutcome::from_error(err);
        }

        let title = if info.title.trim().is_empty() { info.id.clone() } else { info.title.clone() };
        let output_dir = record.request().output_dir().to_path_buf();
        let file_stem = sanitize_filename(&title);
        let extension = if option.is_audio { "mp3" } else { "mp4" };
        let destination = output_dir.join(format!("{}.{}", file_stem, extension));

        let _claim = match self.claim(&output_dir, &file_stem, &destination) {
            Ok(claim) => claim,
            Err(failure) => return ItemOutcome::Failed(failure),
        };

        if let Scope::Item { index, .. } = scope {
            record.update_item(index, |item| item.title = Some(title.clone()));
        }
        self.enter(
            record,
            scope,
            TaskState::Downloading,
            format!("downloading {} ({})", title, option.label),
        );

        let job = DownloadJob {
            url: url.to_string(),
            format_spec: FormatSelector::format_spec(&option),
            option,
            output_dir,
            file_stem,
        };

        let report = match self
            .with_retries(record, "download", || self.download_attempt(record, scope, &job))
            .await
        {
            Ok(report) => report,
            Err(err) => return ItemOutcome::from_error(err),
        };

        if cancel.is_cancelled() {
            return ItemOutcome::Cancelled;
        }

        if destination.exists() {
            ItemOutcome::Completed(destination)
        } else {
            ItemOutcome::Completed(report.destination.unwrap_or(destination))
        }
    }

    /// Reserve `destination`; fails if another item holds it or it is on disk
    fn claim<'a>(
        &'a self,
        output_dir: &Path,
        file_stem: &str,
        destination: &Path,
    ) -> Result<Claim<'a>, TaskFailure> {
        let collision = |reason: &str| {
            TaskFailure::new(
                ErrorKind::Config,
                format!("filename collision: {} {}", destination.display(), reason),
            )
        };

        let mut claims = self.claims.lock();
        if claims.contains(destination) {
            return Err(collision("is being written by another download"));
        }
        if destination.exists() || has_partial_file(output_dir, file_stem) {
            return Err(collision("already exists"));
        }

        claims.insert(destination.to_path_buf());
        Ok(Claim {
            claims: &self.claims,
            path: destination.to_path_buf(),
        })
    }

    /// Run `op`, retrying transient failures with capped exponential backoff
    async fn with_retries<T, F, Fut>(&self, record: &TaskRecord, phase: &str, mut op: F) -> Result<T, ResolverError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResolverError>>,
    {
        let cancel = record.cancel_token();
        let max_retries = self.config.max_retries;
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(ResolverError::Cancelled);
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < max_retries && !cancel.is_cancelled() => {
                    attempt += 1;
                    let delay = self.config.backoff_delay(attempt);
                    warn!(
                        task = %record.id(),
                        phase,
                        attempt,
                        max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    record.set_message(format!("retrying {} ({}/{}): {}", phase, attempt, max_retries, err));

                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ResolverError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => {
                    if cancel.is_cancelled() {
                        return Err(ResolverError::Cancelled);
                    }
                    if err.is_transient() {
                        warn!(task = %record.id(), phase, attempts = attempt + 1, error = %err, "retries exhausted");
                    }
                    return Err(err);
                }
            }
        }
    }

    /// One backend download, forwarding its events while it runs
    async fn download_attempt(
        &self,
        record: &TaskRecord,
        scope: Scope,
        job: &DownloadJob,
    ) -> Result<AttemptReport, ResolverError> {
        let attempt = record.record_attempt();
        debug!(task = %record.id(), attempt, url = %job.url, format = %job.format_spec, "starting download");

        let (tx, mut events) = mpsc::unbounded_channel();
        let interval = self.config.progress_interval();
        let mut heartbeat = tokio::time::interval(interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut report = AttemptReport::default();
        let download = self
            .resolver
            .download(job, ProgressSink::new(tx), record.cancel_token().clone());
        tokio::pin!(download);

        let result = loop {
            tokio::select! {
                biased;
                Some(event) = events.recv() => self.apply_event(record, scope, event, &mut report),
                result = &mut download => break result,
                _ = heartbeat.tick() => {
                    record.heartbeat(interval);
                }
            }
        };

        while let Ok(event) = events.try_recv() {
            self.apply_event(record, scope, event, &mut report);
        }

        result.map(|_| report)
    }

    fn apply_event(&self, record: &TaskRecord, scope: Scope, event: ResolverEvent, report: &mut AttemptReport) {
        match event {
            ResolverEvent::Progress(sample) => {
                let mut progress = Progress::from(sample);
                if let Scope::Item { index, total } = scope {
                    let done = index as f32 + progress.percent / 100.0;
                    progress.percent = done / total as f32 * 100.0;
                }
                record.update_progress(progress, self.config.progress_interval());
            }
            ResolverEvent::Merging => {
                self.enter(record, scope, TaskState::Merging, "merging streams".to_string());
            }
            ResolverEvent::Destination(path) => {
                debug!(task = %record.id(), path = %path.display(), "destination");
                report.destination = Some(path);
            }
        }
    }

    /// Move the task or the playlist item to a non-terminal state
    fn enter(&self, record: &TaskRecord, scope: Scope, state: TaskState, message: String) {
        match scope {
            Scope::Task => {
                if record.current_state() != state {
                    record.transition(state, Some(message));
                }
            }
            Scope::Item { index, .. } => {
                if record.item_state(index) != Some(state) {
                    record.update_item(index, |item| {
                        item.state = state;
                        item.message = Some(message);
                    });
                }
            }
        }
    }
}

/// A `.part` file left by an earlier or concurrent run of the same title
fn has_partial_file(dir: &Path, file_stem: &str) -> bool {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .any(|entry| is_partial_of(&entry.file_name().to_string_lossy(), file_stem))
        })
        .unwrap_or(false)
}

/// `<stem>.<ext>.part` or `<stem>.f<format id>.<ext>.part`, as yt-dlp names them
fn is_partial_of(name: &str, file_stem: &str) -> bool {
    let Some(middle) = name
        .strip_prefix(file_stem)
        .and_then(|rest| rest.strip_prefix('.'))
        .and_then(|rest| rest.strip_suffix(".part"))
    else {
        return false;
    };

    let is_ext = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric());
    match middle.split('.').collect::<Vec<_>>()[..] {
        [ext] => is_ext(ext),
        [format, ext] => {
            format.len() > 1
                && format.starts_with('f')
                && format.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
                && is_ext(ext)
        }
        _ => false,
    }
}
