//! Locked access to the backing file.
//!
//! Locks are advisory `flock(2)` locks on the properties file itself: shared
//! for reads, exclusive for rewrites. A [`LockedFile`] releases its lock when
//! dropped.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use tracing::warn;

use crate::action::Properties;
use crate::codec;
use crate::error::{Result, StoreError};

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockMode {
    Shared,
    Exclusive,
}

/// Cheap identity of the file's current content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Fingerprint {
    len: u64,
    modified: Option<SystemTime>,
}

#[derive(Debug)]
pub(crate) struct BackingFile {
    path: PathBuf,
    lock_timeout: Option<Duration>,
}

impl BackingFile {
    pub(crate) fn new(path: impl Into<PathBuf>, lock_timeout: Option<Duration>) -> Self {
        Self {
            path: path.into(),
            lock_timeout,
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Open (creating if needed) and lock the file.
    pub(crate) fn lock(&self, mode: LockMode) -> Result<LockedFile<'_>> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| StoreError::io(&self.path, e))?;

        match self.lock_timeout {
            None => sys::lock(&file, mode).map_err(|e| StoreError::io(&self.path, e))?,
            Some(timeout) => self.lock_with_deadline(&file, mode, timeout)?,
        }
        Ok(LockedFile {
            file,
            path: &self.path,
        })
    }

    fn lock_with_deadline(&self, file: &File, mode: LockMode, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if sys::try_lock(file, mode).map_err(|e| StoreError::io(&self.path, e))? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(path = %self.path.display(), ?mode, "lock wait timed out");
                return Err(StoreError::LockTimeout {
                    path: self.path.clone(),
                    waited_ms: timeout.as_millis() as u64,
                });
            }
            std::thread::sleep(LOCK_RETRY_INTERVAL);
        }
    }
}

/// An open, locked handle on the backing file.
pub(crate) struct LockedFile<'a> {
    file: File,
    path: &'a Path,
}

impl LockedFile<'_> {
    pub(crate) fn fingerprint(&self) -> Result<Fingerprint> {
        let meta = self
            .file
            .metadata()
            .map_err(|e| StoreError::io(self.path, e))?;
        Ok(Fingerprint {
            len: meta.len(),
            modified: meta.modified().ok(),
        })
    }

    pub(crate) fn read(&mut self) -> Result<Properties> {
        let mut raw = Vec::new();
        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.read_to_end(&mut raw))
            .map_err(|e| StoreError::io(self.path, e))?;
        let text = String::from_utf8(raw).map_err(|e| StoreError::Codec {
            path: self.path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(codec::decode(&text))
    }

    /// Truncate and rewrite the whole file. Requires an exclusive lock.
    pub(crate) fn write(&mut self, props: &Properties) -> Result<Fingerprint> {
        let text = codec::encode(props);
        self.file
            .set_len(0)
            .and_then(|_| self.file.seek(SeekFrom::Start(0)))
            .and_then(|_| self.file.write_all(text.as_bytes()))
            .and_then(|_| self.file.sync_data())
            .map_err(|e| StoreError::io(self.path, e))?;
        self.fingerprint()
    }
}

impl Drop for LockedFile<'_> {
    fn drop(&mut self) {
        sys::unlock(&self.file);
    }
}

#[cfg(unix)]
mod sys {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    use super::LockMode;

    fn operation(mode: LockMode) -> libc::c_int {
        match mode {
            LockMode::Shared => libc::LOCK_SH,
            LockMode::Exclusive => libc::LOCK_EX,
        }
    }

    pub(super) fn lock(file: &File, mode: LockMode) -> io::Result<()> {
        loop {
            let ret = unsafe { libc::flock(file.as_raw_fd(), operation(mode)) };
            if ret == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// Returns `Ok(false)` if another holder blocks the lock.
    pub(super) fn try_lock(file: &File, mode: LockMode) -> io::Result<bool> {
        let ret = unsafe { libc::flock(file.as_raw_fd(), operation(mode) | libc::LOCK_NB) };
        if ret == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == libc::EWOULDBLOCK || code == libc::EINTR => Ok(false),
            _ => Err(err),
        }
    }

    pub(super) fn unlock(file: &File) {
        unsafe {
            libc::flock(file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

// Without flock the in-process mutex is the only exclusion.
#[cfg(not(unix))]
mod sys {
    use std::fs::File;
    use std::io;

    use super::LockMode;

    pub(super) fn lock(_file: &File, _mode: LockMode) -> io::Result<()> {
        Ok(())
    }

    pub(super) fn try_lock(_file: &File, _mode: LockMode) -> io::Result<bool> {
        Ok(true)
    }

    pub(super) fn unlock(_file: &File) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let backing = BackingFile::new(dir.path().join("nested/dss.properties"), None);

        let mut props = Properties::new();
        props.insert("a.b".to_string(), "1".to_string());

        let written = {
            let mut locked = backing.lock(LockMode::Exclusive).unwrap();
            locked.write(&props).unwrap()
        };
        let mut locked = backing.lock(LockMode::Shared).unwrap();
        assert_eq!(locked.fingerprint().unwrap(), written);
        assert_eq!(locked.read().unwrap(), props);
    }

    #[test]
    fn test_rewrite_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let backing = BackingFile::new(dir.path().join("dss.properties"), None);

        let mut props = Properties::new();
        props.insert("long.key.name".to_string(), "a long value".to_string());
        backing.lock(LockMode::Exclusive).unwrap().write(&props).unwrap();

        props.clear();
        props.insert("k".to_string(), "v".to_string());
        backing.lock(LockMode::Exclusive).unwrap().write(&props).unwrap();

        let text = std::fs::read_to_string(backing.path()).unwrap();
        assert_eq!(text, "k=v\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_exclusive_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dss.properties");
        let holder = BackingFile::new(&path, None);
        let waiter = BackingFile::new(&path, Some(Duration::from_millis(50)));

        let _held = holder.lock(LockMode::Exclusive).unwrap();
        let err = waiter.lock(LockMode::Shared).err().unwrap();
        assert!(matches!(err, StoreError::LockTimeout { .. }));
        assert!(err.is_io());
    }

    #[cfg(unix)]
    #[test]
    fn test_shared_locks_coexist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dss.properties");
        let first = BackingFile::new(&path, None);
        let second = BackingFile::new(&path, Some(Duration::from_millis(50)));

        let _a = first.lock(LockMode::Shared).unwrap();
        assert!(second.lock(LockMode::Shared).is_ok());
    }

    #[test]
    fn test_invalid_utf8_is_codec_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dss.properties");
        std::fs::write(&path, [0x6b, 0x3d, 0xff, 0xfe]).unwrap();

        let backing = BackingFile::new(&path, None);
        let err = backing.lock(LockMode::Shared).unwrap().read().unwrap_err();
        assert!(matches!(err, StoreError::Codec { .. }));
    }
}
