// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Write-settle detection
//!
//! Turns a burst of create/modify events for a path into a single "ready"
//! signal once the file's size and modification time stop changing. A
//! periodic ticker re-samples every tracked path; it only runs while
//! something is tracked.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::{Result, WardenError};

/// A file unchanged for this long is declared stable
pub const STABILITY_THRESHOLD: Duration = Duration::from_secs(2);

/// Interval between re-samples of tracked paths
pub const STABILITY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Consecutive ticks a path may be missing before it is evicted
const MISSING_TICK_LIMIT: u8 = 2;

/// Size and modification time of a file at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSample {
    pub size: u64,
    pub modified: SystemTime,
}

impl FileSample {
    /// What a missing file looks like; never equal to a real sample
    const MISSING: FileSample = FileSample {
        size: 0,
        modified: UNIX_EPOCH,
    };
}

/// Reads size/mtime for a path
pub trait FileProbe: Send + Sync {
    /// `None` when the file does not exist (or cannot be stat'ed)
    fn sample(&self, path: &Path) -> Option<FileSample>;
}

/// Probe backed by `std::fs::metadata`
pub struct FsProbe;

impl FileProbe for FsProbe {
    fn sample(&self, path: &Path) -> Option<FileSample> {
        let meta = std::fs::metadata(path).ok()?;
        if !meta.is_file() {
            return None;
        }
        Some(FileSample {
            size: meta.len(),
            modified: meta.modified().unwrap_or(UNIX_EPOCH),
        })
    }
}

#[derive(Debug)]
struct TrackedFile {
    last_event: Instant,
    last: FileSample,
    missing_ticks: u8,
}

#[derive(Default)]
struct State {
    tracked: HashMap<PathBuf, TrackedFile>,
    ticker: Option<JoinHandle<()>>,
}

/// Owns the in-flight tracking map; stable paths leave through `ready_tx`
pub struct StabilityDetector {
    probe: Arc<dyn FileProbe>,
    state: Mutex<State>,
    ready_tx: UnboundedSender<PathBuf>,
    runtime: Option<Handle>,
    threshold: Duration,
    interval: Duration,
}

impl StabilityDetector {
    /// Create a detector using the filesystem probe and the fixed timings.
    ///
    /// The ticker is spawned on the tokio runtime current at construction;
    /// without one, callers drive [`StabilityDetector::sample`] themselves.
    pub fn new(ready_tx: UnboundedSender<PathBuf>) -> Arc<Self> {
        Self::with_probe(ready_tx, Arc::new(FsProbe))
    }

    pub fn with_probe(ready_tx: UnboundedSender<PathBuf>, probe: Arc<dyn FileProbe>) -> Arc<Self> {
        Self::with_timings(ready_tx, probe, STABILITY_THRESHOLD, STABILITY_POLL_INTERVAL)
    }

    pub fn with_timings(
        ready_tx: UnboundedSender<PathBuf>,
        probe: Arc<dyn FileProbe>,
        threshold: Duration,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            probe,
            state: Mutex::new(State::default()),
            ready_tx,
            runtime: Handle::try_current().ok(),
            threshold,
            interval,
        })
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| WardenError::State("Stability map lock poisoned".to_string()))
    }

    /// Start (or refresh) tracking of `path` and arm the ticker if idle
    pub fn observe(self: &Arc<Self>, path: &Path, now: Instant) -> Result<()> {
        let sample = self.probe.sample(path).unwrap_or(FileSample::MISSING);

        let mut state = self.lock_state()?;
        state.tracked.insert(
            path.to_path_buf(),
            TrackedFile {
                last_event: now,
                last: sample,
                missing_ticks: 0,
            },
        );
        trace!("Tracking {:?} ({} bytes)", path, sample.size);

        if state.ticker.is_none() {
            if let Some(runtime) = &self.runtime {
                state.ticker = Some(runtime.spawn(run_ticker(Arc::downgrade(self), self.interval)));
                debug!("Stability ticker armed");
            }
        }
        Ok(())
    }

    /// Refresh `path` only if it is already tracked. Returns whether it was.
    pub fn touch(&self, path: &Path, now: Instant) -> Result<bool> {
        if !self.is_tracked(path) {
            return Ok(false);
        }
        let sample = self.probe.sample(path).unwrap_or(FileSample::MISSING);

        let mut state = self.lock_state()?;
        match state.tracked.get_mut(path) {
            Some(entry) => {
                entry.last_event = now;
                entry.last = sample;
                entry.missing_ticks = 0;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Re-sample every tracked path, returning the ones that became stable.
    ///
    /// Stable paths are removed from tracking and also sent on the ready
    /// channel.
    pub fn sample(&self, now: Instant) -> Result<Vec<PathBuf>> {
        let (stable, _) = self.sample_inner(now, false)?;
        Ok(stable)
    }

    /// Returns the stable paths and whether the ticker should keep running
    fn sample_inner(&self, now: Instant, from_ticker: bool) -> Result<(Vec<PathBuf>, bool)> {
        let paths: Vec<PathBuf> = self.lock_state()?.tracked.keys().cloned().collect();

        // Probe outside the lock
        let probes: Vec<(PathBuf, Option<FileSample>)> = paths
            .into_iter()
            .map(|p| {
                let sample = self.probe.sample(&p);
                (p, sample)
            })
            .collect();

        let mut stable = Vec::new();
        let mut state = self.lock_state()?;

        for (path, probe) in probes {
            let Some(entry) = state.tracked.get_mut(&path) else {
                continue;
            };

            match probe {
                None => {
                    entry.missing_ticks += 1;
                    entry.last = FileSample::MISSING;
                    if entry.missing_ticks >= MISSING_TICK_LIMIT {
                        debug!("Evicting {:?}: missing for {} ticks", path, entry.missing_ticks);
                        state.tracked.remove(&path);
                    }
                }
                Some(current) if current != entry.last => {
                    trace!("{:?} still being written ({} bytes)", path, current.size);
                    entry.last = current;
                    entry.last_event = now;
                    entry.missing_ticks = 0;
                }
                Some(_) => {
                    entry.missing_ticks = 0;
                    if now.saturating_duration_since(entry.last_event) >= self.threshold {
                        state.tracked.remove(&path);
                        stable.push(path);
                    }
                }
            }
        }

        let keep_running = !state.tracked.is_empty();
        if from_ticker && !keep_running {
            state.ticker = None;
            debug!("Stability ticker idle");
        }
        drop(state);

        for path in &stable {
            debug!("Stable: {:?}", path);
            if self.ready_tx.send(path.clone()).is_err() {
                debug!("Ready channel closed, dropping {:?}", path);
            }
        }

        Ok((stable, keep_running))
    }

    pub fn is_tracked(&self, path: &Path) -> bool {
        self.lock_state()
            .map(|s| s.tracked.contains_key(path))
            .unwrap_or(false)
    }

    pub fn tracked_count(&self) -> usize {
        self.lock_state().map(|s| s.tracked.len()).unwrap_or(0)
    }

    /// Whether the periodic ticker is currently scheduled
    pub fn ticker_armed(&self) -> bool {
        self.lock_state().map(|s| s.ticker.is_some()).unwrap_or(false)
    }

    /// Cancel the ticker and forget all tracked paths
    pub fn stop(&self) {
        if let Ok(mut state) = self.lock_state() {
            if let Some(ticker) = state.ticker.take() {
                ticker.abort();
            }
            state.tracked.clear();
        }
    }
}

async fn run_ticker(detector: Weak<StabilityDetector>, interval: Duration) {
    let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        ticks.tick().await;
        let Some(detector) = detector.upgrade() else {
            break;
        };
        match detector.sample_inner(Instant::now(), true) {
            Ok((_, true)) => {}
            Ok((_, false)) => break,
            Err(e) => {
                tracing::error!("Stability sampling failed: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    /// Probe whose answers are set by the test
    #[derive(Default)]
    struct FakeProbe {
        files: Mutex<HashMap<PathBuf, FileSample>>,
    }

    impl FakeProbe {
        fn write(&self, path: &str, size: u64) {
            let modified = UNIX_EPOCH + Duration::from_secs(1_700_000_000 + size);
            self.files
                .lock()
                .unwrap()
                .insert(PathBuf::from(path), FileSample { size, modified });
        }

        fn remove(&self, path: &str) {
            self.files.lock().unwrap().remove(Path::new(path));
        }
    }

    impl FileProbe for FakeProbe {
        fn sample(&self, path: &Path) -> Option<FileSample> {
            self.files.lock().unwrap().get(path).copied()
        }
    }

    fn secs(base: Instant, s: f64) -> Instant {
        base + Duration::from_secs_f64(s)
    }

    fn detector() -> (Arc<StabilityDetector>, Arc<FakeProbe>, mpsc::UnboundedReceiver<PathBuf>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let probe = Arc::new(FakeProbe::default());
        let detector = StabilityDetector::with_probe(tx, probe.clone());
        (detector, probe, rx)
    }

    #[test]
    fn test_unchanged_file_becomes_stable_after_threshold() {
        let (detector, probe, mut rx) = detector();
        let t0 = Instant::now();
        probe.write("/in/run7.log", 10);
        detector.observe(Path::new("/in/run7.log"), t0).unwrap();

        assert!(detector.sample(secs(t0, 1.0)).unwrap().is_empty());
        let stable = detector.sample(secs(t0, 2.0)).unwrap();
        assert_eq!(stable, vec![PathBuf::from("/in/run7.log")]);
        assert_eq!(detector.tracked_count(), 0);
        assert_eq!(rx.try_recv().unwrap(), PathBuf::from("/in/run7.log"));
    }

    #[test]
    fn test_file_written_every_second_never_stable() {
        let (detector, probe, _rx) = detector();
        let t0 = Instant::now();
        let path = Path::new("/in/busy.log");
        probe.write("/in/busy.log", 1);
        detector.observe(path, t0).unwrap();

        let mut last_write = 0.0;
        for second in 1..=20u64 {
            probe.write("/in/busy.log", 1 + second);
            detector.touch(path, secs(t0, second as f64)).unwrap();
            last_write = second as f64;
            if second % 2 == 0 {
                assert!(detector.sample(secs(t0, second as f64 + 0.5)).unwrap().is_empty());
            }
        }

        // Writes stop; ticks continue on the 2 s grid offset by 0.5 s
        let mut declared = None;
        let mut tick = 20.5;
        while declared.is_none() && tick < 30.0 {
            tick += 2.0;
            if !detector.sample(secs(t0, tick)).unwrap().is_empty() {
                declared = Some(tick);
            }
        }
        let elapsed = declared.unwrap() - last_write;
        assert!((2.0..4.0).contains(&elapsed), "declared {elapsed} s after last write");
    }

    #[test]
    fn test_change_between_ticks_resets_clock() {
        let (detector, probe, _rx) = detector();
        let t0 = Instant::now();
        probe.write("/in/a.log", 1);
        detector.observe(Path::new("/in/a.log"), t0).unwrap();

        probe.write("/in/a.log", 2);
        assert!(detector.sample(secs(t0, 2.0)).unwrap().is_empty());
        assert!(detector.sample(secs(t0, 3.9)).unwrap().is_empty());
        assert_eq!(detector.sample(secs(t0, 4.0)).unwrap().len(), 1);
    }

    #[test]
    fn test_missing_file_never_stabilizes_and_is_evicted() {
        let (detector, probe, _rx) = detector();
        let t0 = Instant::now();
        probe.write("/in/gone.log", 5);
        detector.observe(Path::new("/in/gone.log"), t0).unwrap();
        probe.remove("/in/gone.log");

        assert!(detector.sample(secs(t0, 2.0)).unwrap().is_empty());
        assert!(detector.is_tracked(Path::new("/in/gone.log")));
        assert!(detector.sample(secs(t0, 4.0)).unwrap().is_empty());
        assert!(!detector.is_tracked(Path::new("/in/gone.log")));
    }

    #[test]
    fn test_missing_at_first_observation_then_created() {
        let (detector, probe, _rx) = detector();
        let t0 = Instant::now();
        detector.observe(Path::new("/in/late.log"), t0).unwrap();
        probe.write("/in/late.log", 3);

        assert!(detector.sample(secs(t0, 2.0)).unwrap().is_empty());
        assert_eq!(detector.sample(secs(t0, 4.0)).unwrap().len(), 1);
    }

    #[test]
    fn test_touch_ignores_untracked_paths() {
        let (detector, probe, _rx) = detector();
        probe.write("/in/a.log", 1);
        assert!(!detector.touch(Path::new("/in/a.log"), Instant::now()).unwrap());
        assert_eq!(detector.tracked_count(), 0);
    }

    #[test]
    fn test_no_ticker_without_runtime() {
        let (detector, probe, _rx) = detector();
        probe.write("/in/a.log", 1);
        detector.observe(Path::new("/in/a.log"), Instant::now()).unwrap();
        assert!(!detector.ticker_armed());
    }

    #[tokio::test]
    async fn test_ticker_arms_and_disarms() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let probe = Arc::new(FakeProbe::default());
        let detector = StabilityDetector::with_timings(
            tx,
            probe.clone(),
            Duration::from_millis(100),
            Duration::from_millis(50),
        );

        probe.write("/in/a.log", 1);
        detector.observe(Path::new("/in/a.log"), Instant::now()).unwrap();
        assert!(detector.ticker_armed());

        let ready = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert_eq!(ready.unwrap(), Some(PathBuf::from("/in/a.log")));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!detector.ticker_armed());

        // Re-armed by the next observation
        probe.write("/in/b.log", 1);
        detector.observe(Path::new("/in/b.log"), Instant::now()).unwrap();
        assert!(detector.ticker_armed());
        detector.stop();
        assert!(!detector.ticker_armed());
        assert_eq!(detector.tracked_count(), 0);
    }
}
