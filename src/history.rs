// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Journal of compare-file renames, one JSON object per line, so a bad
//! cassette tag can be rolled back with `history undo`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{Result, WardenError};

/// One compare-file rename
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Name carrying the placeholder token
    pub original_path: PathBuf,
    /// Name carrying the cassette tag
    pub new_path: PathBuf,
    #[serde(default)]
    pub undone: bool,
}

impl HistoryEntry {
    /// A fresh entry for `original_path -> new_path`, stamped now
    pub fn new(original_path: PathBuf, new_path: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            original_path,
            new_path,
            undone: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct History {
    path: PathBuf,
}

impl History {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &HistoryEntry) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", serde_json::to_string(entry)?)?;
        Ok(())
    }

    /// Every entry in journal order. Lines that do not parse are skipped.
    pub fn read_all(&self) -> Result<Vec<HistoryEntry>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Skipping journal line {}: {}", number + 1, e),
            }
        }
        Ok(entries)
    }

    /// The newest `count` entries, newest first
    pub fn recent(&self, count: usize) -> Result<Vec<HistoryEntry>> {
        Ok(self.read_all()?.into_iter().rev().take(count).collect())
    }

    /// Entries that can still be rolled back, in journal order
    pub fn pending(&self) -> Result<Vec<HistoryEntry>> {
        Ok(self.read_all()?.into_iter().filter(|e| !e.undone).collect())
    }

    /// Rename the newest `count` pending entries back, newest first.
    ///
    /// Entries whose renamed file is gone are skipped. The journal is
    /// rewritten once for the whole batch, including when a rename fails
    /// part way through.
    pub fn undo(&self, count: usize, dry_run: bool) -> Result<Vec<HistoryEntry>> {
        let mut entries = self.read_all()?;
        let batch: Vec<HistoryEntry> = entries.iter().rev().filter(|e| !e.undone).take(count).cloned().collect();

        let mut restored = Vec::new();
        let mut failure = None;
        for entry in batch {
            if !entry.new_path.exists() {
                warn!("{:?} is gone, cannot undo", entry.new_path);
                continue;
            }
            if entry.original_path.exists() {
                failure = Some(WardenError::Config(format!(
                    "cannot undo, {:?} exists again",
                    entry.original_path
                )));
                break;
            }
            if !dry_run {
                if let Err(e) = fs::rename(&entry.new_path, &entry.original_path) {
                    failure = Some(e.into());
                    break;
                }
                info!("Restored {:?}", entry.original_path);
            }
            restored.push(entry);
        }

        if !dry_run && !restored.is_empty() {
            let ids: HashSet<&str> = restored.iter().map(|e| e.id.as_str()).collect();
            for entry in entries.iter_mut().filter(|e| ids.contains(e.id.as_str())) {
                entry.undone = true;
            }
            self.rewrite(&entries)?;
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(restored),
        }
    }

    /// Replace the journal with `entries`
    fn rewrite(&self, entries: &[HistoryEntry]) -> Result<()> {
        let mut writer = BufWriter::new(File::create(&self.path)?);
        for entry in entries {
            writeln!(writer, "{}", serde_json::to_string(entry)?)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn renamed(dir: &Path, from: &str, to: &str) -> HistoryEntry {
        fs::write(dir.join(to), b"x").unwrap();
        HistoryEntry::new(dir.join(from), dir.join(to))
    }

    #[test]
    fn test_append_and_recent() {
        let dir = tempfile::tempdir().unwrap();
        let history = History::new(dir.path().join("h.jsonl"));
        history.append(&renamed(dir.path(), "a_#1.dat", "a_T1.dat")).unwrap();
        history.append(&renamed(dir.path(), "b_#1.dat", "b_T1.dat")).unwrap();

        let recent = history.recent(1).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].new_path, dir.path().join("b_T1.dat"));
    }

    #[test]
    fn test_undo_restores_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let history = History::new(dir.path().join("h.jsonl"));
        history.append(&renamed(dir.path(), "a_#1.dat", "a_T1.dat")).unwrap();
        history.append(&renamed(dir.path(), "b_#1.dat", "b_T1.dat")).unwrap();

        let dry = history.undo(1, true).unwrap();
        assert_eq!(dry.len(), 1);
        assert!(dir.path().join("b_T1.dat").exists());
        assert_eq!(history.pending().unwrap().len(), 2);

        let undone = history.undo(1, false).unwrap();
        assert_eq!(undone[0].original_path, dir.path().join("b_#1.dat"));
        assert!(dir.path().join("b_#1.dat").exists());
        assert_eq!(history.pending().unwrap().len(), 1);
    }

    #[test]
    fn test_undo_batch_marks_every_entry() {
        let dir = tempfile::tempdir().unwrap();
        let history = History::new(dir.path().join("h.jsonl"));
        for name in ["a", "b", "c"] {
            let entry = renamed(dir.path(), &format!("{}_#1.dat", name), &format!("{}_T1.dat", name));
            history.append(&entry).unwrap();
        }
        // Gone before the undo; skipped and left pending
        fs::remove_file(dir.path().join("b_T1.dat")).unwrap();

        let undone = history.undo(10, false).unwrap();
        assert_eq!(undone.len(), 2);
        let journal = history.read_all().unwrap();
        assert_eq!(journal.len(), 3);
        assert_eq!(journal.iter().filter(|e| e.undone).count(), 2);
        assert!(!journal[1].undone);
        assert!(history.undo(10, false).unwrap().is_empty());
    }

    #[test]
    fn test_failed_undo_keeps_earlier_progress() {
        let dir = tempfile::tempdir().unwrap();
        let history = History::new(dir.path().join("h.jsonl"));
        history.append(&renamed(dir.path(), "a_#1.dat", "a_T1.dat")).unwrap();
        history.append(&renamed(dir.path(), "b_#1.dat", "b_T1.dat")).unwrap();
        // The older original name is occupied again
        fs::write(dir.path().join("a_#1.dat"), b"new").unwrap();

        assert!(history.undo(2, false).is_err());
        let pending = history.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].new_path, dir.path().join("a_T1.dat"));
        assert!(dir.path().join("b_#1.dat").exists());
    }

    #[test]
    fn test_corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("h.jsonl");
        fs::write(&path, "not json\n\n").unwrap();
        let history = History::new(path);
        history.append(&renamed(dir.path(), "a_#1.dat", "a_T1.dat")).unwrap();
        assert_eq!(history.read_all().unwrap().len(), 1);

        history.clear().unwrap();
        assert!(history.read_all().unwrap().is_empty());
        history.clear().unwrap();
    }
}
