// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! File system event sources and burst deduplication

use chrono::{DateTime, Utc};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::config::WatchedFolder;
use crate::{Result, WardenError};

/// Events for the same path closer together than this collapse into one
pub const DEDUP_WINDOW: Duration = Duration::from_secs(5);

/// Map size above which stale dedup entries are pruned
const DEDUP_PRUNE_THRESHOLD: usize = 1024;

/// Kind of filesystem change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileEventKind {
    Created,
    Modified,
    Deleted,
}

/// One observed filesystem change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: FileEventKind,
    /// Capture time, not file time
    pub timestamp: DateTime<Utc>,
}

impl FileEvent {
    pub fn new(path: impl Into<PathBuf>, kind: FileEventKind) -> Self {
        Self::at(path, kind, Utc::now())
    }

    pub fn at(path: impl Into<PathBuf>, kind: FileEventKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            path: path.into(),
            kind,
            timestamp,
        }
    }
}

/// Callback invoked for every normalized event
pub type EventHandler = Arc<dyn Fn(FileEvent) + Send + Sync>;

/// Capability that delivers filesystem notifications for a folder
pub trait NotificationSource: Send {
    /// Begin monitoring `folder`, delivering events to `handler`.
    ///
    /// Fails with [`WardenError::FolderNotFound`] when the folder is missing.
    fn subscribe(&mut self, folder: &WatchedFolder, handler: EventHandler) -> Result<()>;

    /// Drop every subscription. Calling it twice is harmless.
    fn unsubscribe(&mut self);
}

/// Notification source backed by the platform watcher
#[derive(Default)]
pub struct NotifySource {
    watchers: Vec<(PathBuf, RecommendedWatcher)>,
}

impl NotifySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get currently watched paths
    pub fn watched_paths(&self) -> Vec<&Path> {
        self.watchers.iter().map(|(p, _)| p.as_path()).collect()
    }
}

impl NotificationSource for NotifySource {
    fn subscribe(&mut self, folder: &WatchedFolder, handler: EventHandler) -> Result<()> {
        if !folder.path.is_dir() {
            return Err(WardenError::FolderNotFound(folder.path.clone()));
        }

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for file_event in convert_event(event) {
                    handler(file_event);
                }
            }
            Err(e) => warn!("Watch error: {}", e),
        })?;

        let mode = if folder.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(&folder.path, mode)?;
        self.watchers.push((folder.path.clone(), watcher));
        info!("Watching: {:?}", folder.path);

        Ok(())
    }

    fn unsubscribe(&mut self) {
        for (path, mut watcher) in self.watchers.drain(..) {
            if let Err(e) = watcher.unwatch(&path) {
                debug!("Unwatch {:?} failed: {}", path, e);
            }
            info!("Stopped watching: {:?}", path);
        }
    }
}

/// Convert a notify event into zero or more of our events
fn convert_event(event: Event) -> Vec<FileEvent> {
    let kind = match event.kind {
        EventKind::Create(_) => FileEventKind::Created,
        EventKind::Remove(_) => FileEventKind::Deleted,
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => FileEventKind::Deleted,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => FileEventKind::Created,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut events = Vec::with_capacity(2);
            if let Some(from) = event.paths.first() {
                events.push(FileEvent::new(from.clone(), FileEventKind::Deleted));
            }
            if let Some(to) = event.paths.get(1) {
                events.push(FileEvent::new(to.clone(), FileEventKind::Created));
            }
            return events;
        }
        EventKind::Modify(_) => FileEventKind::Modified,
        _ => return Vec::new(),
    };

    event
        .paths
        .first()
        .map(|p| vec![FileEvent::new(p.clone(), kind)])
        .unwrap_or_default()
}

/// Synthetic notification source: events are pushed in with [`InjectedSource::emit`]
#[derive(Clone, Default)]
pub struct InjectedSource {
    subscriptions: Arc<Mutex<Vec<(WatchedFolder, EventHandler)>>>,
}

impl InjectedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to every subscription covering its path
    pub fn emit(&self, event: FileEvent) {
        let handlers: Vec<EventHandler> = match self.subscriptions.lock() {
            Ok(subs) => subs
                .iter()
                .filter(|(folder, _)| covers(folder, &event.path))
                .map(|(_, h)| Arc::clone(h))
                .collect(),
            Err(_) => return,
        };
        for handler in handlers {
            handler(event.clone());
        }
    }

    /// Number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl NotificationSource for InjectedSource {
    fn subscribe(&mut self, folder: &WatchedFolder, handler: EventHandler) -> Result<()> {
        if !folder.path.is_dir() {
            return Err(WardenError::FolderNotFound(folder.path.clone()));
        }
        self.subscriptions
            .lock()
            .map_err(|_| WardenError::State("Injected source lock poisoned".to_string()))?
            .push((folder.clone(), handler));
        Ok(())
    }

    fn unsubscribe(&mut self) {
        if let Ok(mut subs) = self.subscriptions.lock() {
            subs.clear();
        }
    }
}

fn covers(folder: &WatchedFolder, path: &Path) -> bool {
    if folder.recursive {
        path.starts_with(&folder.path)
    } else {
        path.parent() == Some(folder.path.as_path())
    }
}

/// Suppresses repeated events for a path within [`DEDUP_WINDOW`]
pub struct Deduplicator {
    window: chrono::Duration,
    accepted: Mutex<HashMap<PathBuf, DateTime<Utc>>>,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DEDUP_WINDOW)
    }
}

impl Deduplicator {
    pub fn new(window: Duration) -> Self {
        Self {
            window: chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::seconds(5)),
            accepted: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if the event should be forwarded.
    ///
    /// Compares against the last *accepted* event for the path, so a steady
    /// stream of writes forwards one event per window.
    pub fn accept(&self, event: &FileEvent) -> bool {
        let mut accepted = match self.accepted.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(last) = accepted.get(&event.path) {
            if event.timestamp - *last < self.window {
                trace!("Suppressed duplicate {:?} for {:?}", event.kind, event.path);
                return false;
            }
        }

        accepted.insert(event.path.clone(), event.timestamp);

        if accepted.len() > DEDUP_PRUNE_THRESHOLD {
            let window = self.window;
            let now = event.timestamp;
            accepted.retain(|_, last| now - *last < window);
        }

        true
    }

    /// Number of paths currently remembered
    pub fn len(&self) -> usize {
        self.accepted.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget everything
    pub fn clear(&self) {
        if let Ok(mut map) = self.accepted.lock() {
            map.clear();
        }
    }
}

/// Check if a file should be processed
pub fn should_process(path: &Path) -> bool {
    let filename = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n,
        None => return false,
    };

    // Skip hidden files
    if filename.starts_with('.') {
        return false;
    }

    // Skip temporary files
    let temp_extensions = [".tmp", ".part", ".partial", ".swp", ".lock"];
    if temp_extensions.iter().any(|ext| filename.ends_with(ext)) {
        return false;
    }

    // Skip system files
    let skip_names = ["desktop.ini", "thumbs.db", ".ds_store"];
    if skip_names.iter().any(|n| filename.eq_ignore_ascii_case(n)) {
        return false;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use notify::event::CreateKind;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 15, 4, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    #[test]
    fn test_events_within_window_collapse() {
        let dedup = Deduplicator::default();
        assert!(dedup.accept(&FileEvent::at("/in/run7.log", FileEventKind::Created, at(0))));
        assert!(!dedup.accept(&FileEvent::at("/in/run7.log", FileEventKind::Modified, at(1))));
        assert!(!dedup.accept(&FileEvent::at("/in/run7.log", FileEventKind::Modified, at(4))));
    }

    #[test]
    fn test_events_past_window_both_forward() {
        let dedup = Deduplicator::default();
        assert!(dedup.accept(&FileEvent::at("/in/a.log", FileEventKind::Created, at(0))));
        assert!(dedup.accept(&FileEvent::at("/in/a.log", FileEventKind::Modified, at(5))));
    }

    #[test]
    fn test_window_measured_from_last_accepted() {
        let dedup = Deduplicator::default();
        assert!(dedup.accept(&FileEvent::at("/in/a.log", FileEventKind::Created, at(0))));
        // Suppressed events do not push the window forward
        assert!(!dedup.accept(&FileEvent::at("/in/a.log", FileEventKind::Modified, at(3))));
        assert!(dedup.accept(&FileEvent::at("/in/a.log", FileEventKind::Modified, at(6))));
    }

    #[test]
    fn test_paths_are_independent() {
        let dedup = Deduplicator::default();
        assert!(dedup.accept(&FileEvent::at("/in/a.log", FileEventKind::Created, at(0))));
        assert!(dedup.accept(&FileEvent::at("/in/b.log", FileEventKind::Created, at(0))));
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn test_stale_entries_pruned() {
        let dedup = Deduplicator::default();
        for i in 0..=DEDUP_PRUNE_THRESHOLD {
            dedup.accept(&FileEvent::at(format!("/in/{}.log", i), FileEventKind::Created, at(0)));
        }
        dedup.accept(&FileEvent::at("/in/late.log", FileEventKind::Created, at(60)));
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn test_convert_create_and_rename() {
        let create = Event::new(EventKind::Create(CreateKind::File)).add_path(PathBuf::from("/in/x.log"));
        let events = convert_event(create);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, FileEventKind::Created);

        let rename = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/in/x.tmp"))
            .add_path(PathBuf::from("/in/x.log"));
        let events = convert_event(rename);
        assert_eq!(events[0].kind, FileEventKind::Deleted);
        assert_eq!(events[1].path, PathBuf::from("/in/x.log"));
        assert_eq!(events[1].kind, FileEventKind::Created);

        let access = Event::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path(PathBuf::from("/in/x.log"));
        assert!(convert_event(access).is_empty());
    }

    #[test]
    fn test_injected_source_requires_folder() {
        let mut source = InjectedSource::new();
        let handler: EventHandler = Arc::new(|_| {});
        let missing = WatchedFolder::new("/definitely/not/here");
        assert!(matches!(
            source.subscribe(&missing, handler),
            Err(WardenError::FolderNotFound(_))
        ));
    }

    #[test]
    fn test_injected_source_delivers_to_covering_folder() {
        let dir = tempfile::tempdir().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let mut source = InjectedSource::new();
        source
            .subscribe(
                &WatchedFolder::new(dir.path()),
                Arc::new(move |e| sink.lock().unwrap().push(e.path)),
            )
            .unwrap();

        source.emit(FileEvent::new(dir.path().join("a.log"), FileEventKind::Created));
        source.emit(FileEvent::new(dir.path().join("sub/b.log"), FileEventKind::Created));
        assert_eq!(*seen.lock().unwrap(), vec![dir.path().join("a.log")]);

        source.unsubscribe();
        source.unsubscribe();
        assert_eq!(source.subscription_count(), 0);
    }

    #[test]
    fn test_should_process() {
        assert!(should_process(Path::new("/in/run7.log")));
        assert!(!should_process(Path::new("/in/.hidden")));
        assert!(!should_process(Path::new("/in/run7.log.tmp")));
        assert!(!should_process(Path::new("/in/Thumbs.db")));
    }
}
