use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use log::{debug, warn};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::time::{Instant, sleep};

use crate::error::HistoryError;

/// A lock file older than this is left over from a crashed process.
pub const STALE_AFTER: Duration = Duration::from_secs(120);

const POLL: Duration = Duration::from_millis(50);

static TAKEOVERS: AtomicU64 = AtomicU64::new(0);

/// Cross-process exclusive access to one dataset file.
///
/// Held as `<dataset>.lock`, created with `create_new`, removed on drop.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    pub async fn acquire(target: &Path, wait: Duration) -> Result<Self, HistoryError> {
        let path = sibling(target, ".lock");
        let deadline = Instant::now() + wait;

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path).await {
                Ok(mut f) => {
                    let _ = f.write_all(format!("{}\n", std::process::id()).as_bytes()).await;
                    debug!("acquired {}", path.display());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(&path).await && take_over_stale(&path).await {
                        warn!("removed stale lock {}", path.display());
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(HistoryError::Lock {
                            path: target.to_path_buf(),
                            waited: wait,
                        });
                    }
                    sleep(POLL).await;
                }
                Err(e) => return Err(HistoryError::Write { path, source: e }),
            }
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("could not remove {}: {e}", self.path.display());
        }
    }
}

async fn is_stale(path: &Path) -> bool {
    let Ok(meta) = fs::metadata(path).await else {
        return false;
    };
    meta.modified()
        .ok()
        .and_then(|m| SystemTime::now().duration_since(m).ok())
        .is_some_and(|age| age > STALE_AFTER)
}

/// Moves a stale lock aside before deleting it, so two processes that
/// both judged it stale cannot delete each other's fresh lock.
///
/// Returns false when the file moved aside turned out to be a fresh
/// lock; it is linked back unless a new holder already exists.
async fn take_over_stale(path: &Path) -> bool {
    let n = TAKEOVERS.fetch_add(1, Ordering::Relaxed);
    let aside = sibling(path, &format!(".stale.{}.{n}", std::process::id()));

    if fs::rename(path, &aside).await.is_err() {
        // already gone
        return false;
    }
    if is_stale(&aside).await {
        let _ = fs::remove_file(&aside).await;
        return true;
    }

    if let Err(e) = fs::hard_link(&aside, path).await {
        warn!("could not restore lock {}: {e}", path.display());
    }
    let _ = fs::remove_file(&aside).await;
    false
}

/// `data.json` -> `data.json<suffix>`
pub fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_holder_times_out_then_succeeds_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("data.json");

        let first = LockFile::acquire(&target, Duration::from_millis(100)).await.unwrap();
        assert!(sibling(&target, ".lock").exists());

        let err = LockFile::acquire(&target, Duration::from_millis(120)).await.unwrap_err();
        assert!(matches!(err, HistoryError::Lock { .. }));

        drop(first);
        assert!(!sibling(&target, ".lock").exists());
        LockFile::acquire(&target, Duration::from_millis(100)).await.unwrap();
    }

    fn age(path: &Path, by: Duration) {
        let f = std::fs::File::options().write(true).open(path).unwrap();
        f.set_modified(SystemTime::now() - by).unwrap();
    }

    #[tokio::test]
    async fn stale_lock_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("data.json");
        let lock = sibling(&target, ".lock");
        std::fs::write(&lock, "4242\n").unwrap();
        age(&lock, STALE_AFTER + Duration::from_secs(30));

        let held = LockFile::acquire(&target, Duration::from_millis(100)).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(&lock).unwrap(),
            format!("{}\n", std::process::id())
        );
        drop(held);

        let names: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(names.is_empty(), "leftover files: {names:?}");
    }

    #[tokio::test]
    async fn fresh_lock_moved_aside_is_restored() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("data.json.lock");
        std::fs::write(&lock, "4242\n").unwrap();

        assert!(!take_over_stale(&lock).await);
        assert_eq!(std::fs::read_to_string(&lock).unwrap(), "4242\n");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn racing_takeovers_leave_a_single_holder() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("data.json");
        let lock = sibling(&target, ".lock");
        std::fs::write(&lock, "4242\n").unwrap();
        age(&lock, STALE_AFTER + Duration::from_secs(30));

        let wait = Duration::from_millis(300);
        let (a, b) = tokio::join!(
            LockFile::acquire(&target, wait),
            LockFile::acquire(&target, wait)
        );
        assert_eq!(
            a.is_ok() as u8 + b.is_ok() as u8,
            1,
            "exactly one holder expected: {a:?} {b:?}"
        );
    }

    #[test]
    fn sibling_appends_suffix() {
        assert_eq!(
            sibling(Path::new("/tmp/all_banks_data.json"), ".corrupt"),
            PathBuf::from("/tmp/all_banks_data.json.corrupt")
        );
    }
}
