// Download task record: lifecycle state, progress and event fan-out

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::errors::TaskFailure;
use super::models::{DownloadMode, DownloadRequest, QualitySelector};
use super::traits::ProgressSample;

/// Opaque task handle returned by `Orchestrator::start`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle state of a task or playlist item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Resolving,
    Downloading,
    Merging,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Queued, Resolving | Failed | Cancelled)
                | (Resolving, Downloading | Failed | Cancelled)
                | (Downloading, Merging | Completed | Failed | Cancelled)
                | (Merging, Completed | Failed | Cancelled)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Queued => "queued",
            Self::Resolving => "resolving",
            Self::Downloading => "downloading",
            Self::Merging => "merging",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Transfer progress as seen by the presentation layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    /// 0.0 - 100.0, never decreases within a task
    pub percent: f32,
    pub speed_bps: Option<f64>,
    pub eta_secs: Option<u64>,
}

impl From<ProgressSample> for Progress {
    fn from(sample: ProgressSample) -> Self {
        Self {
            downloaded_bytes: sample.downloaded_bytes,
            total_bytes: sample.total_bytes,
            percent: sample.percent.clamp(0.0, 100.0),
            speed_bps: sample.speed_bps,
            eta_secs: sample.eta_secs,
        }
    }
}

/// Outcome of one playlist item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    /// 0-based position in the playlist
    pub index: usize,
    pub url: String,
    pub title: Option<String>,
    pub state: TaskState,
    pub message: Option<String>,
    pub destination: Option<PathBuf>,
    pub failure: Option<TaskFailure>,
}

impl ItemResult {
    pub fn new(index: usize, url: impl Into<String>, title: Option<String>) -> Self {
        Self {
            index,
            url: url.into(),
            title,
            state: TaskState::Queued,
            message: None,
            destination: None,
            failure: None,
        }
    }
}

/// Point-in-time copy of a task, returned by `poll`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub url: String,
    pub mode: DownloadMode,
    pub quality: QualitySelector,
    pub state: TaskState,
    pub progress: Progress,
    /// Last human-readable status line
    pub message: Option<String>,
    pub failure: Option<TaskFailure>,
    pub destination: Option<PathBuf>,
    /// Playlist items in order; empty for single downloads
    pub items: Vec<ItemResult>,
    /// Download attempts made so far, retries included
    pub attempts: u32,
}

/// Events pushed to subscribers, in the order the worker produced them
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    /// Current state at subscription time
    Snapshot(TaskSnapshot),
    StateChanged {
        id: TaskId,
        from: TaskState,
        to: TaskState,
        message: Option<String>,
    },
    Progress {
        id: TaskId,
        progress: Progress,
    },
    ItemChanged {
        id: TaskId,
        item: ItemResult,
    },
}

impl TaskEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::StateChanged { to, .. } if to.is_terminal())
    }
}

struct RecordState {
    snapshot: TaskSnapshot,
    subscribers: Vec<UnboundedSender<TaskEvent>>,
    last_emit: Option<Instant>,
}

impl RecordState {
    fn broadcast(&mut self, event: TaskEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Task owned by the orchestrator. The worker is the only writer.
pub(crate) struct TaskRecord {
    request: DownloadRequest,
    cancel: CancellationToken,
    state: RwLock<RecordState>,
}

impl TaskRecord {
    pub fn new(id: TaskId, request: DownloadRequest, cancel: CancellationToken) -> Self {
        let snapshot = TaskSnapshot {
            id,
            url: request.url().to_string(),
            mode: request.mode(),
            quality: request.quality().clone(),
            state: TaskState::Queued,
            progress: Progress::default(),
            message: None,
            failure: None,
            destination: None,
            items: Vec::new(),
            attempts: 0,
        };

        Self {
            request,
            cancel,
            state: RwLock::new(RecordState {
                snapshot,
                subscribers: Vec::new(),
                last_emit: None,
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.state.read().snapshot.id
    }

    pub fn request(&self) -> &DownloadRequest {
        &self.request
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.state.read().snapshot.clone()
    }

    pub fn current_state(&self) -> TaskState {
        self.state.read().snapshot.state
    }

    pub fn is_terminal(&self) -> bool {
        self.current_state().is_terminal()
    }

    /// Receiver seeded with the current snapshot. Closed once the task is terminal.
    pub fn subscribe(&self) -> UnboundedReceiver<TaskEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.write();
        let _ = tx.send(TaskEvent::Snapshot(state.snapshot.clone()));
        if !state.snapshot.state.is_terminal() {
            state.subscribers.push(tx);
        }
        rx
    }

    /// Move to `to`. Illegal transitions are logged and ignored.
    pub fn transition(&self, to: TaskState, message: Option<String>) -> bool {
        self.finish_with(to, message, None)
    }

    /// Terminal `failed` with the failure attached
    pub fn fail(&self, failure: TaskFailure) -> bool {
        let message = Some(failure.message.clone());
        self.finish_with(TaskState::Failed, message, Some(failure))
    }

    fn finish_with(&self, to: TaskState, message: Option<String>, failure: Option<TaskFailure>) -> bool {
        let mut state = self.state.write();
        let from = state.snapshot.state;
        let id = state.snapshot.id;

        if !from.can_transition_to(to) {
            warn!(task = %id, %from, %to, "ignoring illegal state transition");
            return false;
        }

        debug!(task = %id, %from, %to, "state transition");
        state.snapshot.state = to;
        if message.is_some() {
            state.snapshot.message = message.clone();
        }
        if failure.is_some() {
            state.snapshot.failure = failure;
        }
        if to == TaskState::Completed {
            state.snapshot.progress.percent = 100.0;
            state.snapshot.progress.eta_secs = Some(0);
        }

        state.broadcast(TaskEvent::StateChanged { id, from, to, message });
        state.last_emit = Some(Instant::now());

        if to.is_terminal() {
            // Dropping the senders closes every subscriber's receiver
            state.subscribers.clear();
        }
        true
    }

    /// Store progress and emit it if the last event is at least `interval` old.
    /// Returns whether an event was emitted.
    pub fn update_progress(&self, mut progress: Progress, interval: Duration) -> bool {
        let mut state = self.state.write();
        if state.snapshot.state.is_terminal() {
            return false;
        }

        progress.percent = progress
            .percent
            .clamp(0.0, 100.0)
            .max(state.snapshot.progress.percent);
        state.snapshot.progress = progress;

        let now = Instant::now();
        let due = state
            .last_emit
            .map_or(true, |last| now.duration_since(last) >= interval);
        if !due {
            return false;
        }

        let event = TaskEvent::Progress {
            id: state.snapshot.id,
            progress: state.snapshot.progress.clone(),
        };
        state.broadcast(event);
        state.last_emit = Some(now);
        true
    }

    /// Re-emit the current progress when nothing was sent for `interval`
    pub fn heartbeat(&self, interval: Duration) -> bool {
        let mut state = self.state.write();
        if !matches!(state.snapshot.state, TaskState::Downloading | TaskState::Merging) {
            return false;
        }

        let now = Instant::now();
        if state
            .last_emit
            .map_or(false, |last| now.duration_since(last) < interval)
        {
            return false;
        }

        let event = TaskEvent::Progress {
            id: state.snapshot.id,
            progress: state.snapshot.progress.clone(),
        };
        state.broadcast(event);
        state.last_emit = Some(now);
        true
    }

    pub fn set_message(&self, message: impl Into<String>) {
        self.state.write().snapshot.message = Some(message.into());
    }

    pub fn set_destination(&self, path: PathBuf) {
        self.state.write().snapshot.destination = Some(path);
    }

    pub fn record_attempt(&self) -> u32 {
        let mut state = self.state.write();
        state.snapshot.attempts += 1;
        state.snapshot.attempts
    }

    pub fn set_items(&self, items: Vec<ItemResult>) {
        self.state.write().snapshot.items = items;
    }

    pub fn item_state(&self, index: usize) -> Option<TaskState> {
        self.state.read().snapshot.items.get(index).map(|item| item.state)
    }

    /// Apply `update` to item `index` and announce the result.
    /// Terminal items are frozen.
    pub fn update_item<F>(&self, index: usize, update: F) -> bool
    where
        F: FnOnce(&mut ItemResult),
    {
        let mut state = self.state.write();
        let id = state.snapshot.id;
        let Some(item) = state.snapshot.items.get_mut(index) else {
            return false;
        };
        if item.state.is_terminal() {
            return false;
        }

        let before = item.state;
        update(item);
        if before != item.state && !before.can_transition_to(item.state) {
            warn!(task = %id, item = index, from = %before, to = %item.state, "ignoring illegal item transition");
            item.state = before;
            return false;
        }

        let item = item.clone();
        state.broadcast(TaskEvent::ItemChanged { id, item });
        true
    }
}
