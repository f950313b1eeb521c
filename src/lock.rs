// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Checks for files still held open by the instrument software

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::{Result, WardenError};

/// Bounded retry policy for lock checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl LockRetry {
    /// 30 attempts, one second apart
    pub const DEFAULT: LockRetry = LockRetry {
        attempts: 30,
        delay: Duration::from_secs(1),
    };

    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }
}

impl Default for LockRetry {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Whether the file can currently be opened for shared reading
pub fn can_read_shared(path: &Path) -> bool {
    OpenOptions::new().read(true).open(path).is_ok()
}

/// Decides whether a file is free to be renamed
pub type UnlockedCheck = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

/// Whether the file can currently be opened for writing, which fails while
/// another process holds it exclusively on platforms with mandatory locks.
///
/// A file we may not write to (read-only exports) is not locked as long as
/// it can still be read: renaming needs write access to the folder only.
pub fn can_open_exclusive(path: &Path) -> bool {
    match OpenOptions::new().read(true).write(true).open(path) {
        Ok(_) => true,
        Err(e) if e.kind() == ErrorKind::PermissionDenied => can_read_shared(path),
        Err(_) => false,
    }
}

/// The check used unless a caller supplies its own
pub fn default_unlocked_check() -> UnlockedCheck {
    Arc::new(can_open_exclusive)
}

/// Block until `path` is not locked, retrying per `retry`.
///
/// Returns [`WardenError::Locked`] when every attempt fails.
pub fn wait_until_unlocked(path: &Path, retry: LockRetry) -> Result<()> {
    wait_until(path, retry, can_open_exclusive)
}

/// [`wait_until_unlocked`] with a caller-supplied `is_unlocked` check
pub fn wait_until<F>(path: &Path, retry: LockRetry, is_unlocked: F) -> Result<()>
where
    F: Fn(&Path) -> bool,
{
    for attempt in 1..=retry.attempts.max(1) {
        if is_unlocked(path) {
            return Ok(());
        }
        debug!("{:?} locked (attempt {}/{})", path, attempt, retry.attempts);
        if attempt < retry.attempts {
            std::thread::sleep(retry.delay);
        }
    }
    warn!("Giving up on {:?} after {} attempts", path, retry.attempts);
    Err(WardenError::Locked(path.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_existing_file_is_unlocked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.dat");
        std::fs::write(&path, b"x").unwrap();

        assert!(can_read_shared(&path));
        assert!(wait_until_unlocked(&path, LockRetry::new(1, Duration::ZERO)).is_ok());
    }

    #[test]
    fn test_missing_file_exhausts_retries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.dat");

        assert!(!can_read_shared(&path));
        let err = wait_until_unlocked(&path, LockRetry::new(3, Duration::from_millis(1))).unwrap_err();
        assert!(matches!(err, WardenError::Locked(p) if p == path));
    }

    #[cfg(unix)]
    #[test]
    fn test_read_only_file_is_not_locked() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export_#1.dat");
        std::fs::write(&path, b"x").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o444)).unwrap();

        assert!(can_open_exclusive(&path));
        assert!(wait_until_unlocked(&path, LockRetry::new(1, Duration::ZERO)).is_ok());
    }

    #[test]
    fn test_wait_until_retries_custom_check() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let calls = AtomicU32::new(0);
        let free_on_third = |_: &Path| calls.fetch_add(1, Ordering::SeqCst) + 1 >= 3;
        let path = Path::new("held.dat");

        assert!(wait_until(path, LockRetry::new(5, Duration::from_millis(1)), &free_on_third).is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let never = |_: &Path| false;
        let err = wait_until(path, LockRetry::new(2, Duration::from_millis(1)), never).unwrap_err();
        assert!(matches!(err, WardenError::Locked(_)));
    }

    #[test]
    fn test_default_policy() {
        assert_eq!(LockRetry::default(), LockRetry::new(30, Duration::from_secs(1)));
    }
}
