//! File locking for mutual exclusion between CLI instances.
//!
//! Uses flock() for advisory locking on the data directory. Commands that
//! write the store (train, clear) hold the lock for their whole run; queries
//! only read and do not lock.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Lock file name placed in the data directory
const LOCK_FILE_NAME: &str = "chatmem.lock";

/// A held file lock that releases on drop
pub struct FileLock {
    #[allow(dead_code)]
    file: File,
}

impl FileLock {
    /// Attempt to acquire an exclusive lock on the data directory.
    /// Returns `Ok(FileLock)` if acquired, or a `WouldBlock` error if another
    /// process holds it.
    pub fn try_acquire(base_path: &Path) -> io::Result<Self> {
        let lock_path = base_path.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        Self::try_lock_exclusive(&file)?;

        Ok(FileLock { file })
    }

    #[cfg(unix)]
    fn try_lock_exclusive(file: &File) -> io::Result<()> {
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock
                || err.raw_os_error() == Some(libc::EWOULDBLOCK)
                || err.raw_os_error() == Some(libc::EAGAIN)
            {
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "Memory store is locked by another chatmem process",
                ));
            }
            return Err(err);
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock_exclusive(_file: &File) -> io::Result<()> {
        // no locking on non-Unix platforms
        Ok(())
    }
}

#[cfg(unix)]
impl Drop for FileLock {
    fn drop(&mut self) {
        let fd = self.file.as_raw_fd();
        // Release the lock - ignore errors on drop
        unsafe { libc::flock(fd, libc::LOCK_UN) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();

        let lock1 = FileLock::try_acquire(dir.path());
        assert!(lock1.is_ok(), "First lock should succeed");

        let lock2 = FileLock::try_acquire(dir.path());
        let err = lock2.err().expect("Second lock should fail");
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        drop(lock1);

        let lock3 = FileLock::try_acquire(dir.path());
        assert!(lock3.is_ok(), "Third lock should succeed after release");
    }

    #[test]
    fn test_lock_file_created() {
        let dir = tempfile::tempdir().unwrap();
        let _lock = FileLock::try_acquire(dir.path()).unwrap();
        assert!(dir.path().join(LOCK_FILE_NAME).exists());
    }
}
