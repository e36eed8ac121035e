//! Batch download coordinator.
//!
//! # State Machine
//!
//! ```text
//! Idle --[start_batch, adapter accepted every request]--> Downloading
//! Downloading --[poll: every job Done or Failed]--> Finished
//! Downloading | Finished --[clear_batch]--> Idle
//! ```
//!
//! The coordinator never does I/O itself. It hands requests to a [`Transport`],
//! samples the handles it gets back whenever enough time has been fed through
//! [`Coordinator::tick`], and publishes state changes to its subscribers.
//!
//! # Threading
//!
//! All methods take `&mut self`; the coordinator lives on a single timeline.
//! Hosts with several threads wrap it in one mutex or keep it inside one task.

use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::mem;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::CoordinatorError;
use crate::transport::{JobHandle, TransferRequest, TransferSnapshot, TransferStatus, Transport};
use crate::utils::{destination_path, get_unique_filepath};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Minimum time between two polls of the transport (default: 500ms).
    pub update_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CoordinatorState {
    /// No batch.
    Idle,
    /// A batch is running and at least one job is not terminal.
    Downloading,
    /// Every job of the batch is Done or Failed.
    Finished,
}

impl CoordinatorState {
    /// A new batch may only be started from Idle.
    pub fn can_start(self) -> bool {
        self == CoordinatorState::Idle
    }

    /// Whether a host should offer "clear". `clear_batch` itself also works
    /// while downloading, as a forced cancel.
    pub fn can_clear(self) -> bool {
        self == CoordinatorState::Finished
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CoordinatorState::Idle => "idle",
            CoordinatorState::Downloading => "downloading",
            CoordinatorState::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// One URL to fetch, with an optional expected SHA-256.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadItem {
    pub url: String,
    pub hash: Option<String>,
}

impl DownloadItem {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            hash: None,
        }
    }

    /// Parses a task-file line: `url` or `url|sha256`. Blank lines yield `None`.
    pub fn parse_line(line: &str) -> Option<Self> {
        let raw = line.trim();
        if raw.is_empty() {
            return None;
        }
        let mut parts = raw.splitn(2, '|');
        let url = parts.next().unwrap_or_default().trim().to_string();
        let hash = parts
            .next()
            .map(|h| h.trim().to_string())
            .filter(|s| !s.is_empty());
        if url.is_empty() {
            return None;
        }
        Some(Self { url, hash })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadJob {
    pub url: String,
    pub dest_path: PathBuf,
    pub status: TransferStatus,
    pub progress: f32,
    /// Set only while `status` is `Failed`.
    pub error: Option<String>,
    handle: JobHandle,
}

impl DownloadJob {
    fn new(request: TransferRequest, handle: JobHandle) -> Self {
        Self {
            url: request.url,
            dest_path: request.dest_path,
            status: TransferStatus::Pending,
            progress: 0.0,
            error: None,
            handle,
        }
    }

    pub fn handle(&self) -> JobHandle {
        self.handle
    }

    fn apply(&mut self, snapshot: TransferSnapshot) {
        self.progress = clamp_progress(snapshot.progress);
        self.status = snapshot.status;
        self.error = match snapshot.status {
            TransferStatus::Failed => Some(
                snapshot
                    .error
                    .unwrap_or_else(|| "unknown error".to_string()),
            ),
            _ => None,
        };
    }
}

fn clamp_progress(progress: f32) -> f32 {
    if progress.is_nan() {
        0.0
    } else {
        progress.clamp(0.0, 1.0)
    }
}

/// Jobs started together by one `start_batch` call. Membership never changes.
#[derive(Debug)]
pub struct Batch {
    dest_dir: PathBuf,
    jobs: Vec<DownloadJob>,
}

impl Batch {
    pub fn dest_dir(&self) -> &Path {
        &self.dest_dir
    }

    pub fn jobs(&self) -> &[DownloadJob] {
        &self.jobs
    }

    fn all_terminal(&self) -> bool {
        self.jobs.iter().all(|job| job.status.is_terminal())
    }

    fn mean_progress(&self) -> f32 {
        if self.jobs.is_empty() {
            return 0.0;
        }
        let total: f32 = self.jobs.iter().map(|job| job.progress).sum();
        clamp_progress(total / self.jobs.len() as f32)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedJob {
    pub index: usize,
    pub url: String,
    pub error: String,
}

/// Outcome of a batch, computed once when it enters `Finished`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub success_count: usize,
    /// First failed job in batch order.
    pub first_error: Option<FailedJob>,
}

impl BatchSummary {
    fn from_batch(batch: &Batch) -> Self {
        let success_count = batch
            .jobs
            .iter()
            .filter(|job| job.status == TransferStatus::Done)
            .count();
        let first_error = batch
            .jobs
            .iter()
            .enumerate()
            .find(|(_, job)| job.status == TransferStatus::Failed)
            .map(|(index, job)| FailedJob {
                index,
                url: job.url.clone(),
                error: job.error.clone().unwrap_or_default(),
            });

        Self {
            total: batch.jobs.len(),
            success_count,
            first_error,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.success_count == self.total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Observer = Box<dyn FnMut(CoordinatorState) + Send>;

pub struct Coordinator<T: Transport> {
    transport: T,
    config: CoordinatorConfig,
    state: CoordinatorState,
    batch: Option<Batch>,
    progress: f32,
    timer: Duration,
    summary: Option<BatchSummary>,
    observers: Vec<(SubscriptionId, Observer)>,
    next_subscription: u64,
}

impl<T: Transport> Coordinator<T> {
    pub fn new(transport: T, config: CoordinatorConfig) -> Self {
        Self {
            transport,
            config,
            state: CoordinatorState::Idle,
            batch: None,
            progress: 0.0,
            timer: Duration::ZERO,
            summary: None,
            observers: Vec::new(),
            next_subscription: 0,
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    /// Mean progress of the active batch in `[0, 1]`, or 0 when idle.
    pub fn aggregate_progress(&self) -> f32 {
        self.progress
    }

    /// Present only while the batch is `Finished`.
    pub fn summary(&self) -> Option<&BatchSummary> {
        self.summary.as_ref()
    }

    pub fn batch(&self) -> Option<&Batch> {
        self.batch.as_ref()
    }

    pub fn jobs(&self) -> &[DownloadJob] {
        self.batch.as_ref().map(Batch::jobs).unwrap_or(&[])
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn subscribe<F>(&mut self, observer: F) -> SubscriptionId
    where
        F: FnMut(CoordinatorState) + Send + 'static,
    {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.observers.push((id, Box::new(observer)));
        id
    }

    /// Returns false if the id was not subscribed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(sub, _)| *sub != id);
        self.observers.len() != before
    }

    pub fn start_batch<S: AsRef<str>>(
        &mut self,
        dest_dir: impl AsRef<Path>,
        urls: &[S],
    ) -> Result<(), CoordinatorError> {
        let items: Vec<DownloadItem> = urls
            .iter()
            .map(|url| DownloadItem::new(url.as_ref()))
            .collect();
        self.start_items(dest_dir, &items)
    }

    /// Starts one job per item. On error nothing changes: no job is created
    /// and no transfer is left running.
    pub fn start_items(
        &mut self,
        dest_dir: impl AsRef<Path>,
        items: &[DownloadItem],
    ) -> Result<(), CoordinatorError> {
        if !self.state.can_start() {
            error!("Can't start download, current state is {}.", self.state);
            return Err(CoordinatorError::NotIdle(self.state));
        }
        if items.is_empty() {
            warn!("Can't start download, no urls given.");
            return Err(CoordinatorError::EmptyBatch);
        }

        let dest_dir = dest_dir.as_ref();
        let mut requests = Vec::with_capacity(items.len());
        let mut taken = HashSet::with_capacity(items.len());
        for item in items {
            let url = Url::parse(&item.url).map_err(|source| CoordinatorError::InvalidUrl {
                url: item.url.clone(),
                source,
            })?;
            // Two urls ending in the same name must not share a file.
            let dest_path = get_unique_filepath(destination_path(dest_dir, &url), &taken);
            taken.insert(dest_path.clone());
            requests.push(TransferRequest {
                url: item.url.clone(),
                dest_path,
                sha256: item.hash.clone(),
            });
        }

        let handles = self.transport.begin(&requests)?;
        if handles.len() != requests.len() {
            error!(
                expected = requests.len(),
                actual = handles.len(),
                "transport broke the begin contract"
            );
            for handle in &handles {
                self.transport.dispose(*handle);
            }
            return Err(CoordinatorError::AdapterContract {
                expected: requests.len(),
                actual: handles.len(),
            });
        }

        let jobs = requests
            .into_iter()
            .zip(handles)
            .map(|(request, handle)| DownloadJob::new(request, handle))
            .collect();
        self.batch = Some(Batch {
            dest_dir: dest_dir.to_path_buf(),
            jobs,
        });
        self.summary = None;
        self.progress = 0.0;
        self.timer = Duration::ZERO;
        self.set_state(CoordinatorState::Downloading);
        Ok(())
    }

    /// Feeds host time into the poll timer. At most one poll per call, however
    /// large `elapsed` is.
    pub fn tick(&mut self, elapsed: Duration) {
        if self.state != CoordinatorState::Downloading {
            return;
        }
        self.timer += elapsed;
        if self.timer >= self.config.update_interval {
            self.timer = Duration::ZERO;
            self.refresh();
        }
    }

    /// Polls every unfinished job now and recomputes progress and state.
    pub fn refresh(&mut self) {
        if self.state != CoordinatorState::Downloading {
            return;
        }
        let Some(batch) = self.batch.as_mut() else {
            return;
        };

        for job in batch.jobs.iter_mut().filter(|job| !job.status.is_terminal()) {
            let snapshot = self.transport.poll(job.handle);
            job.apply(snapshot);
        }

        self.progress = batch.mean_progress();
        let finished = batch.all_terminal();
        debug!(progress = self.progress, finished, "batch polled");

        if finished {
            self.set_state(CoordinatorState::Finished);
        }
    }

    /// Disposes every job of the current batch and returns to Idle. Jobs still
    /// running are cancelled. Without a batch this does nothing.
    pub fn clear_batch(&mut self) {
        let Some(batch) = self.batch.take() else {
            return;
        };

        if self.state == CoordinatorState::Downloading {
            let unfinished = batch
                .jobs
                .iter()
                .filter(|job| !job.status.is_terminal())
                .count();
            warn!("Cancelling {} unfinished downloads.", unfinished);
        }
        for job in &batch.jobs {
            self.transport.dispose(job.handle);
        }

        self.summary = None;
        self.progress = 0.0;
        self.timer = Duration::ZERO;
        self.set_state(CoordinatorState::Idle);
    }

    fn set_state(&mut self, state: CoordinatorState) {
        if self.state == state {
            return;
        }
        let previous = mem::replace(&mut self.state, state);
        debug!(from = %previous, to = %state, "state changed");

        self.on_state_changed(state);
        for (_, observer) in self.observers.iter_mut() {
            observer(state);
        }
    }

    fn on_state_changed(&mut self, state: CoordinatorState) {
        match state {
            CoordinatorState::Idle => {
                info!("Download batch cleared.");
            }
            CoordinatorState::Downloading => {
                info!("Start downloading {} files.", self.jobs().len());
            }
            CoordinatorState::Finished => {
                let Some(batch) = self.batch.as_ref() else {
                    return;
                };
                let summary = BatchSummary::from_batch(batch);
                if summary.all_succeeded() {
                    info!(
                        "Finished downloading files, {}/{} succeeded.",
                        summary.success_count, summary.total
                    );
                } else {
                    error!(
                        "Finished downloading files, {}/{} succeeded.",
                        summary.success_count, summary.total
                    );
                    if let Some(first) = &summary.first_error {
                        error!("First error: {} {}", first.url, first.error);
                    }
                }
                self.summary = Some(summary);
            }
        }
    }
}

impl<T: Transport> Drop for Coordinator<T> {
    fn drop(&mut self) {
        if let Some(batch) = self.batch.take() {
            for job in &batch.jobs {
                self.transport.dispose(job.handle);
            }
        }
    }
}
