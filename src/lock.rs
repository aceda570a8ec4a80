//! Process-level build exclusion: at most one instance may mutate the
//! store at a time.

use crate::db::{DbError, TUP_DIR};
use fs4::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::time::Duration;

const ATTEMPTS: u32 = 10;
const BACKOFF: Duration = Duration::from_millis(50);

/// Holds `.tup/lock` for the life of the value; released on drop.
pub struct BuildLock {
    file: File,
}

impl BuildLock {
    /// Tries to take the lock with a short back-off.  A concurrent holder
    /// makes this fail with AlreadyLocked rather than blocking forever.
    pub fn acquire(top: &Path) -> Result<BuildLock, DbError> {
        let path = top.join(TUP_DIR).join("lock");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)?;
        for attempt in 0..ATTEMPTS {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(BuildLock { file }),
                Err(_) if attempt + 1 < ATTEMPTS => std::thread::sleep(BACKOFF),
                Err(_) => break,
            }
        }
        Err(DbError::AlreadyLocked)
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(TUP_DIR)).unwrap();
        let lock = BuildLock::acquire(dir.path()).unwrap();
        assert!(matches!(
            BuildLock::acquire(dir.path()),
            Err(DbError::AlreadyLocked)
        ));
        drop(lock);
        BuildLock::acquire(dir.path()).unwrap();
    }
}
