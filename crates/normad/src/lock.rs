//! Run Lock (C10): a single exclusive file lock enforcing the WIP limit of
//! one in-progress run at a time.
//!
//! Lock first, write the pid only after the lock is held — a failed lock
//! attempt must never clobber another holder's pid file.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lock already held")]
    AlreadyHeld,
}

pub type Result<T> = std::result::Result<T, LockError>;

/// Held exclusive lock on `<norma_dir>/locks/run.lock`. Dropping this value
/// releases the lock.
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    fn lock_path(norma_dir: &Path) -> PathBuf {
        norma_dir.join("locks/run.lock")
    }

    fn open(norma_dir: &Path) -> Result<(File, PathBuf)> {
        let path = Self::lock_path(norma_dir);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok((file, path))
    }

    /// Block until the lock is acquired.
    pub fn acquire(norma_dir: &Path) -> Result<Self> {
        let (file, path) = Self::open(norma_dir)?;
        file.lock_exclusive()?;
        Self::write_pid(&file)?;
        Ok(Self { file, path })
    }

    /// Acquire without blocking; returns `Err(LockError::AlreadyHeld)` if
    /// another process holds the lock.
    pub fn try_acquire(norma_dir: &Path) -> Result<Self> {
        let (file, path) = Self::open(norma_dir)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                Self::write_pid(&file)?;
                Ok(Self { file, path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(LockError::AlreadyHeld),
            Err(e) => Err(LockError::Io(e)),
        }
    }

    fn write_pid(file: &File) -> Result<()> {
        let mut file = file;
        file.set_len(0)?;
        use std::io::Seek;
        file.seek(std::io::SeekFrom::Start(0))?;
        write!(file, "{}", std::process::id())?;
        file.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        FileExt::unlock(&self.file).ok();
    }
}
