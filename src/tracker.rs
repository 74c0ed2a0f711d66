use std::path::{Path, PathBuf};
use std::time::SystemTime;

use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tracing::debug;

use crate::constants::CLEANUP_INTERVAL_SECS;
use crate::error::{Result, SwitcherError};
use crate::models::Session;
use crate::store::sessions::SessionFingerprint;
use crate::store::Store;

/// Registers consumer processes and prunes sessions whose process has gone
/// away. Liveness is judged against the fingerprint captured at
/// registration, not the PID alone.
pub struct SessionTracker {
    store: Store,
    cleanup_marker: PathBuf,
}

impl SessionTracker {
    pub fn new(store: Store, cleanup_marker: PathBuf) -> Self {
        Self {
            store,
            cleanup_marker,
        }
    }

    /// Capture the process fingerprint for `pid` and persist the session.
    pub async fn register(
        &self,
        session_id: &str,
        pid: u32,
        parent_pid: Option<u32>,
        cwd: &str,
    ) -> Result<Session> {
        let mut fingerprint = fingerprint_process(pid);
        fingerprint.parent_pid = parent_pid.map(i64::from).or(fingerprint.parent_pid);
        fingerprint.cwd = Some(cwd.to_string());

        self.store
            .create_session(session_id, &fingerprint)
            .await
            .map_err(|e| SwitcherError::SessionRegistration(e.to_string()))
    }

    /// Three-factor liveness check. Each factor alone can disprove liveness;
    /// all must hold to confirm it:
    /// 1. a process with the stored PID exists and is running,
    /// 2. its start time matches the stored one within 1s (PID reuse),
    /// 3. its executable path matches, when stored and readable.
    pub fn is_alive(&self, session: &Session) -> bool {
        let pid = Pid::from_u32(session.pid as u32);
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

        let Some(process) = system.process(pid) else {
            debug!(pid = session.pid, "session liveness: no such process");
            return false;
        };

        if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
            debug!(pid = session.pid, "session liveness: process not running");
            return false;
        }

        if let Some(stored) = session.proc_start_time
            && stored != 0.0
            && (process.start_time() as f64 - stored).abs() >= 1.0
        {
            debug!(
                pid = session.pid,
                proc_start = process.start_time(),
                stored_start = stored,
                "session liveness: start time mismatch"
            );
            return false;
        }

        if let Some(stored_exe) = session.exe.as_deref() {
            // exe() is None when the OS denies reading the link; skip then.
            if let Some(exe) = process.exe()
                && exe != Path::new(stored_exe)
            {
                debug!(
                    pid = session.pid,
                    ?exe,
                    stored_exe,
                    "session liveness: exe mismatch"
                );
                return false;
            }
        }

        debug!(pid = session.pid, "session liveness: alive");
        true
    }

    /// Walk all active sessions: bump last-checked on the live ones, mark
    /// the rest ended. Returns how many were ended.
    pub async fn cleanup_dead_sessions(&self) -> Result<usize> {
        let active = self.store.list_active_sessions().await?;
        let mut ended = 0;

        for session in &active {
            if self.is_alive(session) {
                self.store
                    .update_session_last_checked(&session.session_id)
                    .await?;
            } else {
                self.store.mark_session_ended(&session.session_id).await?;
                ended += 1;
            }
        }

        Ok(ended)
    }

    /// Rate-limited cleanup: the marker file's mtime throttles sweeps
    /// across invocations.
    pub async fn maybe_cleanup(&self) -> Result<()> {
        if let Ok(meta) = std::fs::metadata(&self.cleanup_marker)
            && let Ok(modified) = meta.modified()
            && let Ok(elapsed) = SystemTime::now().duration_since(modified)
            && elapsed.as_secs() < CLEANUP_INTERVAL_SECS
        {
            return Ok(());
        }

        self.cleanup_dead_sessions().await?;

        if let Some(parent) = self.cleanup_marker.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.cleanup_marker, b"")?;
        Ok(())
    }
}

/// Best-effort process fingerprint; unreadable fields stay unset, matching
/// the liveness checks that skip them.
fn fingerprint_process(pid: u32) -> SessionFingerprint {
    let sys_pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);

    let Some(process) = system.process(sys_pid) else {
        return SessionFingerprint {
            pid: i64::from(pid),
            ..Default::default()
        };
    };

    let cmdline = process
        .cmd()
        .iter()
        .map(|part| part.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ");

    SessionFingerprint {
        pid: i64::from(pid),
        parent_pid: process.parent().map(|p| i64::from(p.as_u32())),
        proc_start_time: Some(process.start_time() as f64),
        exe: process.exe().map(|p| p.to_string_lossy().into_owned()),
        cmdline: (!cmdline.is_empty()).then_some(cmdline),
        cwd: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::*;

    // Far above default pid_max; can never name a live process.
    const DEAD_PID: u32 = 4_190_000;

    async fn tracker() -> (SessionTracker, tempfile::TempDir) {
        let (store, dir) = open_store().await;
        let marker = dir.path().join(".last_cleanup");
        (SessionTracker::new(store.clone(), marker), dir)
    }

    #[tokio::test]
    async fn test_register_and_liveness_for_own_process() {
        let (tracker, _dir) = tracker().await;

        let session = tracker
            .register("self", std::process::id(), None, "/tmp")
            .await
            .unwrap();

        assert_eq!(session.pid, i64::from(std::process::id()));
        assert!(session.proc_start_time.unwrap_or(0.0) > 0.0);
        assert!(tracker.is_alive(&session));
        // Stable across repeated checks.
        assert!(tracker.is_alive(&session));
    }

    #[tokio::test]
    async fn test_start_time_mismatch_disproves_liveness() {
        let (tracker, _dir) = tracker().await;

        let mut session = tracker
            .register("self", std::process::id(), None, "/tmp")
            .await
            .unwrap();
        session.proc_start_time = session.proc_start_time.map(|t| t + 100.0);
        assert!(!tracker.is_alive(&session));
    }

    #[tokio::test]
    async fn test_cleanup_marks_dead_sessions_ended() {
        let (tracker, _dir) = tracker().await;

        tracker
            .register("alive", std::process::id(), None, "/tmp")
            .await
            .unwrap();
        tracker.register("dead", DEAD_PID, None, "/tmp").await.unwrap();

        let ended = tracker.cleanup_dead_sessions().await.unwrap();
        assert_eq!(ended, 1);

        let alive = tracker.store.get_session("alive").await.unwrap().unwrap();
        let dead = tracker.store.get_session("dead").await.unwrap().unwrap();
        assert!(alive.is_active());
        assert!(!dead.is_active());
    }

    #[tokio::test]
    async fn test_maybe_cleanup_is_rate_limited() {
        let (tracker, _dir) = tracker().await;

        tracker.register("dead1", DEAD_PID, None, "/tmp").await.unwrap();
        tracker.maybe_cleanup().await.unwrap();
        assert!(
            !tracker
                .store
                .get_session("dead1")
                .await
                .unwrap()
                .unwrap()
                .is_active()
        );

        // A second sweep inside the interval is skipped.
        tracker
            .register("dead2", DEAD_PID + 1, None, "/tmp")
            .await
            .unwrap();
        tracker.maybe_cleanup().await.unwrap();
        assert!(
            tracker
                .store
                .get_session("dead2")
                .await
                .unwrap()
                .unwrap()
                .is_active()
        );
    }
}
