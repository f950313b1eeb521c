// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Agent lifecycle: wires event sources, deduplication, stabilization and
//! the routing/baseline engines behind one start/stop switch

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::baseline::{is_marker, BaselineEngine, BaselineOutcome};
use crate::config::{AppConfig, WatchedFolder};
use crate::history::History;
use crate::lock::{LockRetry, UnlockedCheck};
use crate::router::{CopyOutcome, Router};
use crate::stability::StabilityDetector;
use crate::watcher::{should_process, Deduplicator, EventHandler, FileEvent, FileEventKind, NotificationSource};
use crate::{Result, WardenError};

/// Interval of the periodic compare-folder rename pass
pub const MATCH_PASS_INTERVAL: Duration = Duration::from_secs(10);

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// What happened to one processed file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Copied,
    Deferred,
    Unrouted,
    BaselineRecorded,
    BaselineRejected(String),
    Failed(String),
}

/// Notifications for the logging collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    Processed {
        source: PathBuf,
        destination: Option<PathBuf>,
        outcome: Outcome,
    },
    Renamed {
        from: PathBuf,
        to: PathBuf,
    },
}

/// Entry point for notification callbacks
struct Pipeline {
    accepting: AtomicBool,
    active: Arc<AtomicBool>,
    dedup: Deduplicator,
    stability: Arc<StabilityDetector>,
}

impl Pipeline {
    fn handle(&self, event: FileEvent) {
        if !self.accepting.load(Ordering::SeqCst) {
            return;
        }
        if !self.active.load(Ordering::SeqCst) {
            debug!("Agent inactive, not forwarding {:?} {:?}", event.kind, event.path);
            return;
        }
        if !should_process(&event.path) {
            trace!("Ignoring {:?}", event.path);
            return;
        }

        let now = Instant::now();
        if !self.dedup.accept(&event) {
            debug!("Suppressed {:?} for {:?}", event.kind, event.path);
            if event.kind != FileEventKind::Deleted {
                if let Err(e) = self.stability.touch(&event.path, now) {
                    error!("Failed to refresh {:?}: {}", event.path, e);
                }
            }
            return;
        }

        info!("{:?}: {:?}", event.kind, event.path);
        if event.kind == FileEventKind::Deleted {
            // Tracked entries for deleted paths are evicted by the ticker
            return;
        }
        if let Err(e) = self.stability.observe(&event.path, now) {
            error!("Failed to track {:?}: {}", event.path, e);
        }
    }
}

/// Consumes stable paths; shared by the dispatcher and the match timer
#[derive(Clone)]
struct Dispatch {
    router: Arc<Router>,
    baseline: Option<Arc<BaselineEngine>>,
    events: broadcast::Sender<AgentEvent>,
    /// Wakes the match timer for an early rename pass
    pass_requested: Arc<Notify>,
}

impl Dispatch {
    fn emit(&self, event: AgentEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn processed(&self, source: &Path, destination: Option<PathBuf>, outcome: Outcome) {
        self.emit(AgentEvent::Processed {
            source: source.to_path_buf(),
            destination,
            outcome,
        });
    }

    /// Handle one stable file. Errors stop at this boundary.
    fn process(&self, path: &Path) {
        if let Some(engine) = self.baseline.as_deref().filter(|e| e.owns(path)) {
            if is_marker(path) {
                self.request_rename_pass();
                return;
            }
            match engine.process_baseline(path) {
                Ok(BaselineOutcome::Recorded { marker, .. }) => {
                    self.processed(path, Some(marker), Outcome::BaselineRecorded);
                    self.request_rename_pass();
                }
                Ok(BaselineOutcome::Rejected { reason }) => {
                    self.processed(path, None, Outcome::BaselineRejected(reason));
                }
                Err(e) => {
                    error!("Failed to process baseline {:?}: {}", path, e);
                    self.processed(path, None, Outcome::Failed(e.to_string()));
                }
            }
            return;
        }

        match self.router.copy_to_destination(path) {
            Ok(CopyOutcome::Copied { destination, .. }) => {
                self.processed(path, Some(destination), Outcome::Copied)
            }
            Ok(CopyOutcome::Deferred { destination }) => {
                self.processed(path, Some(destination), Outcome::Deferred)
            }
            Ok(CopyOutcome::Unrouted) => self.processed(path, None, Outcome::Unrouted),
            Err(e) => {
                error!("Failed to process {:?}: {}", path, e);
                self.processed(path, None, Outcome::Failed(e.to_string()));
            }
        }
    }

    /// Renames can wait on locked files for a long time, so they only ever
    /// run on the match timer task. Requests made while a pass runs collapse
    /// into one follow-up pass.
    fn request_rename_pass(&self) {
        self.pass_requested.notify_one();
    }

    fn rename_pass(&self, engine: &BaselineEngine) {
        match engine.rename_pass() {
            Ok(jobs) => {
                for job in jobs {
                    self.emit(AgentEvent::Renamed {
                        from: job.source,
                        to: job.target,
                    });
                }
            }
            Err(e) => error!("Rename pass failed: {}", e),
        }
    }
}

struct Session {
    pipeline: Arc<Pipeline>,
    folders: Vec<WatchedFolder>,
    tasks: Vec<JoinHandle<()>>,
}

/// The watch agent
pub struct Agent {
    config: AppConfig,
    dispatch: Dispatch,
    source: Box<dyn NotificationSource>,
    active: Arc<AtomicBool>,
    lock_retry: LockRetry,
    unlocked: Option<UnlockedCheck>,
    session: Option<Session>,
}

/// Build the baseline engine described by `config`, if it names a base folder
pub fn baseline_engine(config: &AppConfig, retry: LockRetry) -> Option<BaselineEngine> {
    let folder = config.baseline_folder()?;
    Some(
        BaselineEngine::new(folder, config.resolved_compare_folders())
            .with_retry(retry)
            .with_history(History::new(config.history.path.clone())),
    )
}

/// Files in `folder`, descending into subfolders when it is recursive.
/// Unreadable directories are logged and skipped.
fn existing_files(folder: &WatchedFolder) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut pending = vec![folder.path.clone()];

    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot scan {:?}: {}", dir, e);
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                if folder.recursive {
                    pending.push(path);
                }
            } else if path.is_file() && should_process(&path) {
                files.push(path);
            }
        }
    }

    files.sort();
    files
}

impl Agent {
    pub fn new(config: AppConfig, source: Box<dyn NotificationSource>) -> Result<Self> {
        let router = Router::from_config(&config.routing_rules)?;
        let baseline = baseline_engine(&config, LockRetry::DEFAULT).map(Arc::new);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            config,
            dispatch: Dispatch {
                router: Arc::new(router),
                baseline,
                events,
                pass_requested: Arc::new(Notify::new()),
            },
            source,
            active: Arc::new(AtomicBool::new(true)),
            lock_retry: LockRetry::DEFAULT,
            unlocked: None,
            session: None,
        })
    }

    fn rebuild_baseline(&mut self) {
        self.dispatch.baseline = baseline_engine(&self.config, self.lock_retry).map(|engine| {
            let engine = match &self.unlocked {
                Some(check) => engine.with_unlocked_check(Arc::clone(check)),
                None => engine,
            };
            Arc::new(engine)
        });
    }

    /// Use a different lock retry policy for compare-file renames
    pub fn with_lock_retry(mut self, retry: LockRetry) -> Self {
        self.lock_retry = retry;
        self.rebuild_baseline();
        self
    }

    /// Use a different check for compare files still held open
    pub fn with_unlocked_check(mut self, unlocked: UnlockedCheck) -> Self {
        self.unlocked = Some(unlocked);
        self.rebuild_baseline();
        self
    }

    /// Share an externally owned "agent active" flag
    pub fn with_active_flag(mut self, active: Arc<AtomicBool>) -> Self {
        self.active = active;
        self
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_watching(&self) -> bool {
        self.session.is_some()
    }

    /// Receive processed-file and rename notifications
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.dispatch.events.subscribe()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Folders to subscribe: configured ones plus the baseline folder
    fn folders(&self) -> Vec<WatchedFolder> {
        let mut folders = self.config.watch_folders.clone();
        if let Some(baseline) = self.config.baseline_folder() {
            if !folders.iter().any(|f| f.path == baseline) {
                folders.push(WatchedFolder::new(baseline));
            }
        }
        folders
    }

    /// Subscribe to every folder and start the background tasks.
    ///
    /// Missing folders are skipped with a warning; only when none can be
    /// watched does this fail. Must be called inside a tokio runtime.
    pub fn start_watching(&mut self) -> Result<()> {
        if self.session.is_some() {
            debug!("Already watching");
            return Ok(());
        }
        let runtime = Handle::try_current()
            .map_err(|_| WardenError::State("start_watching needs a tokio runtime".to_string()))?;

        let (ready_tx, mut ready_rx) = mpsc::unbounded_channel::<PathBuf>();
        let pipeline = Arc::new(Pipeline {
            accepting: AtomicBool::new(true),
            active: Arc::clone(&self.active),
            dedup: Deduplicator::default(),
            stability: StabilityDetector::new(ready_tx),
        });

        let mut watched = Vec::new();
        for folder in self.folders() {
            let target = Arc::clone(&pipeline);
            let handler: EventHandler = Arc::new(move |event| target.handle(event));
            match self.source.subscribe(&folder, handler) {
                Ok(()) => watched.push(folder),
                Err(WardenError::FolderNotFound(path)) => {
                    warn!("Watched folder {:?} does not exist, skipping", path)
                }
                Err(e) => warn!("Failed to watch {:?}: {}", folder.path, e),
            }
        }

        if watched.is_empty() {
            self.source.unsubscribe();
            return Err(WardenError::NoValidFolders);
        }

        if let Some(engine) = &self.dispatch.baseline {
            for folder in engine.compare_folders() {
                if !folder.is_dir() {
                    warn!("Compare folder {:?} does not exist, skipping", folder);
                }
            }
        }

        let mut tasks = Vec::new();

        // One task per stable file, so a slow copy never holds up the next
        let dispatch = self.dispatch.clone();
        tasks.push(runtime.spawn(async move {
            while let Some(path) = ready_rx.recv().await {
                let worker = dispatch.clone();
                tokio::spawn(async move {
                    let job = tokio::task::spawn_blocking(move || worker.process(&path));
                    if let Err(e) = job.await {
                        error!("File processing task failed: {}", e);
                    }
                });
            }
        }));

        if self.dispatch.baseline.is_some() {
            let dispatch = self.dispatch.clone();
            tasks.push(runtime.spawn(async move {
                let mut ticks = tokio::time::interval(MATCH_PASS_INTERVAL);
                ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticks.tick() => {}
                        _ = dispatch.pass_requested.notified() => debug!("Rename pass requested"),
                    }
                    let worker = dispatch.clone();
                    let job = tokio::task::spawn_blocking(move || {
                        if let Some(engine) = worker.baseline.as_deref() {
                            worker.rename_pass(engine);
                        }
                    });
                    if let Err(e) = job.await {
                        error!("Rename pass task failed: {}", e);
                    }
                }
            }));
        }

        info!("Watching {} folder(s)", watched.len());
        self.session = Some(Session {
            pipeline,
            folders: watched,
            tasks,
        });
        Ok(())
    }

    /// Unsubscribe all sources and cancel every background task.
    ///
    /// Callbacks already running may finish; none start afterwards.
    pub fn stop_watching(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        session.pipeline.accepting.store(false, Ordering::SeqCst);
        self.source.unsubscribe();
        session.pipeline.stability.stop();
        for task in session.tasks {
            task.abort();
        }
        info!("Stopped watching");
    }

    /// Feed files already present in the watched folders through
    /// stabilization. Returns how many were queued.
    pub fn process_existing(&self) -> Result<usize> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| WardenError::State("agent is not watching".to_string()))?;

        let now = Instant::now();
        let mut queued = 0;
        for folder in &session.folders {
            for path in existing_files(folder) {
                session.pipeline.stability.observe(&path, now)?;
                queued += 1;
            }
        }
        info!("Queued {} existing file(s)", queued);
        Ok(queued)
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.stop_watching();
    }
}
