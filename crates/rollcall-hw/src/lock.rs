//! Exclusive ownership of a capture device.
//!
//! Uses a non-blocking `flock(LOCK_EX)` on the device node, so a second
//! session (in this process or another) fails fast instead of sharing frames.
//! The lock is released when the [`DeviceLock`] is dropped.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("{0} is held by another session")]
    Busy(PathBuf),
    #[error("failed to lock {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Held exclusive lock on a device node.
#[derive(Debug)]
pub struct DeviceLock {
    file: File,
    path: PathBuf,
}

impl DeviceLock {
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let file = File::open(path).map_err(|source| LockError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        // SAFETY: the fd is valid for the lifetime of `file`.
        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            return Err(if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                LockError::Busy(path.to_path_buf())
            } else {
                LockError::Io {
                    path: path.to_path_buf(),
                    source: err,
                }
            });
        }

        tracing::debug!(device = %path.display(), "device lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DeviceLock {
    fn drop(&mut self) {
        // Closing the fd would release it too; unlock explicitly so the
        // release is not deferred by a duplicated descriptor.
        // SAFETY: the fd is still owned by `self.file`.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        tracing::debug!(device = %self.path.display(), "device lock released");
    }
}
