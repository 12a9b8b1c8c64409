//! PID file (§7): a single advisory-locked file preventing two
//! instances of the daemon running against the same case directory at
//! once. Locking is `flock(2)` via `nix`, not a lock-file-existence
//! check, so a crashed process's stale file is harmless.

use crate::error::{self, StartupError};
use nix::fcntl::{flock, FlockArg};
use snafu::ResultExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

pub struct PidFile {
    path: PathBuf,
    file: File,
}

impl PidFile {
    /// Open (creating if absent), exclusively lock, and stamp `path`
    /// with the current process id. If another live process already
    /// holds the lock, returns `StartupError::AlreadyRunning` with the
    /// PID read back from the file.
    pub fn acquire(path: &Path) -> Result<Self, StartupError> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .context(error::PidFile { path: path.to_path_buf() })?;

        if let Err(nix::Error::Sys(nix::errno::Errno::EWOULDBLOCK)) =
            flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock)
        {
            let mut contents = String::new();
            file.read_to_string(&mut contents).ok();
            let pid = contents.trim().parse().unwrap_or(-1);
            return error::AlreadyRunning {
                path: path.to_path_buf(),
                pid,
            }
            .fail();
        }

        file.set_len(0).context(error::PidFile { path: path.to_path_buf() })?;
        file.seek(SeekFrom::Start(0)).context(error::PidFile { path: path.to_path_buf() })?;
        write!(file, "{}", std::process::id()).context(error::PidFile { path: path.to_path_buf() })?;
        file.flush().context(error::PidFile { path: path.to_path_buf() })?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_own_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zpoold.pid");
        let guard = PidFile::acquire(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, std::process::id().to_string());
        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn second_acquire_fails_while_first_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zpoold.pid");
        let _first = PidFile::acquire(&path).unwrap();
        let err = PidFile::acquire(&path).unwrap_err();
        assert!(matches!(err, StartupError::AlreadyRunning { .. }));
    }
}
