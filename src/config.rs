use std::env;
use std::path::PathBuf;

use dotenvy::dotenv;

/// Filesystem layout and environment toggles.
///
/// Everything hangs off `$HOME`: the switcher state directory and the
/// consumer-facing Claude credential file.
pub struct Config {
    pub switcher_dir: PathBuf,
    pub claude_dir: PathBuf,
    pub debug_sessions: bool,
    pub debug_balancer: bool,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv().ok();

        let home = env::var("HOME")
            .map(PathBuf::from)
            .ok()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."));

        let debug_sessions = env::var("DEBUG_SESSIONS").map(|v| v == "1").unwrap_or(false);
        let debug_balancer = env::var("C2SWITCHER_DEBUG_BALANCER")
            .map(|v| v == "1")
            .unwrap_or(false);

        Self {
            switcher_dir: home.join(".c2switcher"),
            claude_dir: home.join(".claude"),
            debug_sessions,
            debug_balancer,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.switcher_dir.join("store.db")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.switcher_dir.join(".lock")
    }

    pub fn lock_pid_path(&self) -> PathBuf {
        self.switcher_dir.join(".lock.pid")
    }

    pub fn cleanup_marker_path(&self) -> PathBuf {
        self.switcher_dir.join(".last_cleanup")
    }

    pub fn legacy_state_path(&self) -> PathBuf {
        self.switcher_dir.join("load_balancer_state.json")
    }

    pub fn current_account_path(&self) -> PathBuf {
        self.switcher_dir.join("current_account")
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.claude_dir.join(".credentials.json")
    }
}
