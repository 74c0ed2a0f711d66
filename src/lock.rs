use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::config::Config;
use crate::constants::{LOCK_RETRY_INTERVAL, LOCK_TIMEOUT};
use crate::error::{Result, SwitcherError};
use crate::util;

/// Advisory file lock guarding read-modify-write operations against the
/// store and the credential file.
///
/// The kernel drops the flock when the process dies, so a crashed holder
/// never wedges the fleet; the PID sidecar only exists so a waiting process
/// can name the holder.
pub struct ProcessLock {
    lock_path: PathBuf,
    pid_path: PathBuf,
    file: Option<File>,
    acquired: bool,
}

impl ProcessLock {
    pub fn new(lock_path: PathBuf, pid_path: PathBuf) -> Self {
        Self {
            lock_path,
            pid_path,
            file: None,
            acquired: false,
        }
    }

    /// Acquire the lock, retrying every 100ms up to `timeout`.
    pub fn acquire(&mut self, timeout: Duration) -> Result<()> {
        if self.acquired {
            return Ok(());
        }

        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent)?;
            util::set_mode(parent, 0o700);
        }

        let file = File::create(&self.lock_path)?;
        util::set_mode(&self.lock_path, 0o600);

        let start = Instant::now();
        let mut warned = false;

        loop {
            if try_flock(&file) {
                if let Err(e) = std::fs::write(&self.pid_path, format!("{}\n", std::process::id()))
                {
                    warn!("Failed to write lock PID file: {e}");
                } else {
                    util::set_mode(&self.pid_path, 0o600);
                }
                self.file = Some(file);
                self.acquired = true;
                return Ok(());
            }

            if start.elapsed() >= timeout {
                let message = match self.read_holder_pid() {
                    Some(pid) => format!(
                        "Timeout waiting for another c2switcher operation (PID: {pid}) to complete"
                    ),
                    None => "Timeout waiting for another c2switcher operation to complete".into(),
                };
                return Err(SwitcherError::LockTimeout(message));
            }

            if !warned {
                match self.read_holder_pid() {
                    Some(pid) => warn!(
                        "Waiting for another c2switcher operation to complete (PID: {pid})..."
                    ),
                    None => warn!("Waiting for another c2switcher operation to complete..."),
                }
                warned = true;
            }

            std::thread::sleep(LOCK_RETRY_INTERVAL);
        }
    }

    fn read_holder_pid(&self) -> Option<String> {
        std::fs::read_to_string(&self.pid_path)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn release(&mut self) {
        if self.acquired {
            if let Some(file) = self.file.take() {
                funlock(&file);
            }
            let _ = std::fs::remove_file(&self.pid_path);
            self.acquired = false;
        }
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(unix)]
fn try_flock(file: &File) -> bool {
    use std::os::unix::io::AsRawFd;
    unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) == 0 }
}

#[cfg(unix)]
fn funlock(file: &File) {
    use std::os::unix::io::AsRawFd;
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

#[cfg(not(unix))]
fn try_flock(_file: &File) -> bool {
    true
}

#[cfg(not(unix))]
fn funlock(_file: &File) {}

// A single lock handle per process, guarded by an atomic so re-entrant
// acquisition from nested command paths stays idempotent.
static LOCK_HELD: AtomicBool = AtomicBool::new(false);
static PROCESS_LOCK: Mutex<Option<ProcessLock>> = Mutex::new(None);

/// Acquire the process-wide lock (idempotent). Held until process exit or
/// an explicit [`release_process_lock`].
pub fn acquire_process_lock(config: &Config) -> Result<()> {
    if LOCK_HELD.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    let mut lock = ProcessLock::new(config.lock_path(), config.lock_pid_path());
    match lock.acquire(LOCK_TIMEOUT) {
        Ok(()) => {
            *PROCESS_LOCK.lock().expect("lock registry poisoned") = Some(lock);
            Ok(())
        }
        Err(e) => {
            LOCK_HELD.store(false, Ordering::SeqCst);
            Err(e)
        }
    }
}

/// Release the process-wide lock if held. Called on the way out of main;
/// the kernel would reclaim the flock anyway, this just tidies the PID file.
pub fn release_process_lock() {
    if LOCK_HELD.swap(false, Ordering::SeqCst)
        && let Some(mut lock) = PROCESS_LOCK.lock().expect("lock registry poisoned").take()
    {
        lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_writes_pid_and_release_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join(".lock");
        let pid_path = dir.path().join(".lock.pid");

        let mut lock = ProcessLock::new(lock_path.clone(), pid_path.clone());
        lock.acquire(Duration::from_secs(1)).unwrap();

        let pid = std::fs::read_to_string(&pid_path).unwrap();
        assert_eq!(pid.trim(), std::process::id().to_string());

        lock.release();
        assert!(!pid_path.exists());
        assert!(lock_path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_contended_lock_times_out_naming_holder() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join(".lock");
        let pid_path = dir.path().join(".lock.pid");

        let mut first = ProcessLock::new(lock_path.clone(), pid_path.clone());
        first.acquire(Duration::from_secs(1)).unwrap();

        // flock is per open-file-description, so a second handle contends
        // even inside one process.
        let mut second = ProcessLock::new(lock_path, pid_path);
        let err = second.acquire(Duration::from_millis(300)).unwrap_err();
        match err {
            SwitcherError::LockTimeout(msg) => {
                assert!(msg.contains(&std::process::id().to_string()), "{msg}");
            }
            other => panic!("expected LockTimeout, got {other:?}"),
        }

        first.release();
        second.acquire(Duration::from_millis(300)).unwrap();
    }

    #[test]
    fn test_acquire_is_idempotent_per_handle() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = ProcessLock::new(dir.path().join(".lock"), dir.path().join(".lock.pid"));
        lock.acquire(Duration::from_secs(1)).unwrap();
        lock.acquire(Duration::from_secs(1)).unwrap();
        lock.release();
    }
}
