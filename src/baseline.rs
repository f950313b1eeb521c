// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Baseline timestamp extraction and compare-folder renames
//!
//! A baseline file carries a `Date and Time:` line. Once parsed, an empty
//! marker file named `<yyyyMMdd_HHmmss>_<stem>.info` is written next to it.
//! Marker names are the durable record: each rename pass re-reads them,
//! derives `(time_info, prefix, cassette_tag)` and renames compare files
//! whose names carry both the timestamp and the prefix, swapping the
//! placeholder token for the cassette tag.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};
use tracing::{debug, error, info, warn};

use crate::history::{History, HistoryEntry};
use crate::lock::{default_unlocked_check, wait_until, LockRetry, UnlockedCheck};
use crate::{Result, WardenError};

/// Extension of marker artifacts
pub const MARKER_EXTENSION: &str = "info";

/// Token in compare filenames replaced by the cassette tag
pub const PLACEHOLDER_TOKEN: &str = "#1";

/// chrono format of `time_info`
pub const TIME_INFO_FORMAT: &str = "%Y%m%d_%H%M%S";

fn timestamp_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"Date and Time:\s*(\d{1,2})/(\d{1,2})/(\d{4})\s+(\d{1,2}):(\d{2}):(\d{2})\s*([AaPp][Mm])",
        )
        .expect("timestamp pattern is valid")
    })
}

fn marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d{8}_\d{6})_([^_]+)(?:_(.+))?$").expect("marker pattern is valid")
    })
}

/// Find and parse `Date and Time: MM/DD/YYYY HH:MM:SS AM|PM` in `text`
pub fn extract_timestamp(text: &str) -> Result<NaiveDateTime> {
    let caps = timestamp_regex()
        .captures(text)
        .ok_or_else(|| WardenError::Baseline("no 'Date and Time:' field".to_string()))?;

    let num = |i: usize| -> Result<u32> {
        caps[i]
            .parse()
            .map_err(|_| WardenError::Baseline(format!("bad number '{}'", &caps[i])))
    };
    let (month, day, year) = (num(1)?, num(2)?, num(3)? as i32);
    let (hour12, minute, second) = (num(4)?, num(5)?, num(6)?);
    let pm = caps[7].eq_ignore_ascii_case("pm");

    if !(1..=12).contains(&hour12) {
        return Err(WardenError::Baseline(format!("hour {} out of range", hour12)));
    }
    let hour = match (hour12, pm) {
        (12, false) => 0,
        (12, true) => 12,
        (h, false) => h,
        (h, true) => h + 12,
    };

    let date = NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| WardenError::Baseline(format!("invalid date {}/{}/{}", month, day, year)))?;
    let time = NaiveTime::from_hms_opt(hour, minute, second)
        .ok_or_else(|| WardenError::Baseline(format!("invalid time {}:{}:{}", hour, minute, second)))?;

    Ok(NaiveDateTime::new(date, time))
}

/// `<yyyyMMdd_HHmmss>_<stem>.info`
pub fn marker_file_name(timestamp: &NaiveDateTime, stem: &str) -> String {
    format!("{}_{}.{}", timestamp.format(TIME_INFO_FORMAT), stem, MARKER_EXTENSION)
}

pub fn is_marker(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(MARKER_EXTENSION))
}

/// Metadata recovered from one marker name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BaselineRecord {
    /// `yyyyMMdd_HHmmss`
    pub time_info: String,
    pub prefix: String,
    pub cassette_tag: Option<String>,
}

impl BaselineRecord {
    /// Parse `<14-digit timestamp>_<prefix>[_<tag>]`, with or without the
    /// `.info` extension
    pub fn from_marker_name(name: &str) -> Option<Self> {
        let stem = name
            .strip_suffix(MARKER_EXTENSION)
            .and_then(|s| s.strip_suffix('.'))
            .unwrap_or(name);
        let caps = marker_regex().captures(stem)?;
        Some(Self {
            time_info: caps[1].to_string(),
            prefix: caps[2].to_string(),
            cassette_tag: caps.get(3).map(|m| m.as_str().to_string()),
        })
    }

    /// The baseline stem this record came from (`<prefix>[_<tag>]`)
    pub fn baseline_stem(&self) -> String {
        match &self.cassette_tag {
            Some(tag) => format!("{}_{}", self.prefix, tag),
            None => self.prefix.clone(),
        }
    }

    /// Marker name without the extension; unique per record
    pub fn marker_stem(&self) -> String {
        format!("{}_{}", self.time_info, self.baseline_stem())
    }

    /// Whether `file_name` carries both this record's timestamp and prefix
    pub fn matches(&self, file_name: &str) -> bool {
        file_name.contains(&self.time_info) && file_name.contains(&self.prefix)
    }

    /// New name for `file_name`, if it matches and still has the placeholder
    pub fn renamed(&self, file_name: &str) -> Option<String> {
        let tag = self.cassette_tag.as_deref()?;
        if !file_name.contains(PLACEHOLDER_TOKEN) || !self.matches(file_name) {
            return None;
        }
        Some(file_name.replace(PLACEHOLDER_TOKEN, tag))
    }
}

/// A proposed compare-file rename
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameJob {
    pub source: PathBuf,
    pub target: PathBuf,
}

/// Where a baseline file ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaselineOutcome {
    /// Timestamp parsed and marker written
    Recorded { marker: PathBuf, record: BaselineRecord },
    /// Timestamp missing or invalid; never retried
    Rejected { reason: String },
}

/// Owns the recorded baselines and performs compare-folder renames
pub struct BaselineEngine {
    baseline_folder: PathBuf,
    compare_folders: Vec<PathBuf>,
    /// Keyed by marker stem, so a baseline measured twice keeps both
    records: Mutex<HashMap<String, BaselineRecord>>,
    /// Serializes rename passes so two passes never race on one file
    pass: Mutex<()>,
    retry: LockRetry,
    unlocked: UnlockedCheck,
    history: Option<History>,
}

impl BaselineEngine {
    pub fn new(baseline_folder: impl Into<PathBuf>, compare_folders: Vec<PathBuf>) -> Self {
        Self {
            baseline_folder: baseline_folder.into(),
            compare_folders,
            records: Mutex::new(HashMap::new()),
            pass: Mutex::new(()),
            retry: LockRetry::DEFAULT,
            unlocked: default_unlocked_check(),
            history: None,
        }
    }

    pub fn with_retry(mut self, retry: LockRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the check deciding whether a compare file is still held open
    pub fn with_unlocked_check(mut self, unlocked: UnlockedCheck) -> Self {
        self.unlocked = unlocked;
        self
    }

    /// Journal every rename to `history`
    pub fn with_history(mut self, history: History) -> Self {
        self.history = Some(history);
        self
    }

    pub fn baseline_folder(&self) -> &Path {
        &self.baseline_folder
    }

    pub fn compare_folders(&self) -> &[PathBuf] {
        &self.compare_folders
    }

    fn lock_records(&self) -> Result<MutexGuard<'_, HashMap<String, BaselineRecord>>> {
        self.records
            .lock()
            .map_err(|_| WardenError::State("Baseline record lock poisoned".to_string()))
    }

    /// Whether `path` sits directly in the baseline folder
    pub fn owns(&self, path: &Path) -> bool {
        path.parent() == Some(self.baseline_folder.as_path())
    }

    /// Snapshot of the known records, keyed by marker stem
    pub fn records(&self) -> Result<HashMap<String, BaselineRecord>> {
        Ok(self.lock_records()?.clone())
    }

    /// Store `record` if its marker is new. Returns whether it was added.
    fn remember(&self, record: BaselineRecord) -> Result<bool> {
        let mut records = self.lock_records()?;
        let key = record.marker_stem();
        if records.contains_key(&key) {
            return Ok(false);
        }
        debug!("Known baseline {}", key);
        records.insert(key, record);
        Ok(true)
    }

    /// Parse a stabilized baseline file and write its marker
    pub fn process_baseline(&self, path: &Path) -> Result<BaselineOutcome> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| WardenError::Baseline(format!("unusable file name {:?}", path)))?;

        let bytes = fs::read(path)?;
        let text = String::from_utf8_lossy(&bytes);

        let timestamp = match extract_timestamp(&text) {
            Ok(ts) => ts,
            Err(e) => {
                error!("Rejected baseline {:?}: {}", path, e);
                return Ok(BaselineOutcome::Rejected { reason: e.to_string() });
            }
        };

        let name = marker_file_name(&timestamp, stem);
        let Some(record) = BaselineRecord::from_marker_name(&name) else {
            let reason = format!("stem '{}' does not yield a marker record", stem);
            error!("Rejected baseline {:?}: {}", path, reason);
            return Ok(BaselineOutcome::Rejected { reason });
        };

        fs::create_dir_all(&self.baseline_folder)?;
        let marker = self.baseline_folder.join(&name);
        fs::File::create(&marker)?;
        self.remember(record.clone())?;
        info!("Recorded baseline {:?} as {}", path, name);

        Ok(BaselineOutcome::Recorded { marker, record })
    }

    /// Merge every marker found in the baseline folder into the record set
    pub fn load_markers(&self) -> Result<usize> {
        if !self.baseline_folder.is_dir() {
            debug!("Baseline folder {:?} missing", self.baseline_folder);
            return Ok(0);
        }

        let mut names: Vec<String> = fs::read_dir(&self.baseline_folder)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && is_marker(p))
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(String::from))
            .collect();
        names.sort();

        let mut added = 0;
        for name in names {
            match BaselineRecord::from_marker_name(&name) {
                Some(record) => {
                    if self.remember(record)? {
                        added += 1;
                    }
                }
                None => debug!("Ignoring unparsable marker {}", name),
            }
        }
        Ok(added)
    }

    /// Jobs for every compare file matching a known record
    pub fn plan_renames(&self) -> Result<Vec<RenameJob>> {
        let mut records: Vec<BaselineRecord> = self.lock_records()?.values().cloned().collect();
        records.sort_by(|a, b| {
            a.time_info
                .cmp(&b.time_info)
                .then_with(|| a.prefix.cmp(&b.prefix))
                .then_with(|| a.cassette_tag.cmp(&b.cassette_tag))
        });

        let mut jobs = Vec::new();
        for folder in &self.compare_folders {
            let entries = match fs::read_dir(folder) {
                Ok(entries) => entries,
                Err(e) => {
                    debug!("Skipping compare folder {:?}: {}", folder, e);
                    continue;
                }
            };

            for entry in entries.filter_map(|e| e.ok()) {
                let source = entry.path();
                if !source.is_file() {
                    continue;
                }
                let Some(name) = source.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if let Some(new_name) = records.iter().find_map(|r| r.renamed(name)) {
                    jobs.push(RenameJob {
                        target: folder.join(new_name),
                        source,
                    });
                }
            }
        }
        jobs.sort_by(|a, b| a.source.cmp(&b.source));
        Ok(jobs)
    }

    /// Load markers, then rename every matching compare file.
    ///
    /// Failures are logged per file and never stop the pass. Returns the
    /// renames that happened.
    pub fn rename_pass(&self) -> Result<Vec<RenameJob>> {
        let _pass = self
            .pass
            .lock()
            .map_err(|_| WardenError::State("Rename pass lock poisoned".to_string()))?;
        self.load_markers()?;
        let jobs = self.plan_renames()?;

        let mut done = Vec::new();
        for job in jobs {
            match self.execute(&job) {
                Ok(true) => done.push(job),
                Ok(false) => {}
                Err(e) => error!("Rename {:?} -> {:?} failed: {}", job.source, job.target, e),
            }
        }
        if !done.is_empty() {
            info!("Rename pass renamed {} file(s)", done.len());
        }
        Ok(done)
    }

    fn execute(&self, job: &RenameJob) -> Result<bool> {
        if !job.source.exists() {
            debug!("{:?} vanished before rename", job.source);
            return Ok(false);
        }
        if job.target.exists() {
            warn!("Not renaming {:?}: {:?} already exists", job.source, job.target);
            return Ok(false);
        }
        wait_until(&job.source, self.retry, |p: &Path| (self.unlocked)(p))?;
        fs::rename(&job.source, &job.target)?;
        info!("Renamed {:?} -> {:?}", job.source, job.target);

        if let Some(history) = &self.history {
            let entry = HistoryEntry::new(job.source.clone(), job.target.clone());
            if let Err(e) = history.append(&entry) {
                warn!("Failed to journal rename: {}", e);
            }
        }
        Ok(true)
    }
}
