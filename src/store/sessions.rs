use std::collections::HashMap;
use std::path::Path;

use chrono::{Duration, Utc};

use super::Store;
use crate::error::{Result, SwitcherError};
use crate::models::{Account, Session};
use crate::util;

/// Process fingerprint captured when a session registers. Used later to
/// disprove liveness after PID reuse.
#[derive(Debug, Clone, Default)]
pub struct SessionFingerprint {
    pub pid: i64,
    pub parent_pid: Option<i64>,
    pub proc_start_time: Option<f64>,
    pub exe: Option<String>,
    pub cmdline: Option<String>,
    pub cwd: Option<String>,
}

impl Store {
    pub async fn create_session(
        &self,
        session_id: &str,
        fingerprint: &SessionFingerprint,
    ) -> Result<Session> {
        let now = util::now_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO sessions (
                session_id, pid, parent_pid, proc_start_time,
                exe, cmdline, cwd, created_at, last_checked_alive
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session_id)
        .bind(fingerprint.pid)
        .bind(fingerprint.parent_pid)
        .bind(fingerprint.proc_start_time)
        .bind(&fingerprint.exe)
        .bind(&fingerprint.cmdline)
        .bind(&fingerprint.cwd)
        .bind(&now)
        .bind(&now)
        .execute(self.pool())
        .await?;

        self.get_session(session_id)
            .await?
            .ok_or_else(|| SwitcherError::Database("session missing after insert".into()))
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(session)
    }

    /// Bind a session to an account. A session holds at most one account.
    pub async fn assign_session_to_account(
        &self,
        session_id: &str,
        account_uuid: &str,
    ) -> Result<()> {
        sqlx::query("UPDATE sessions SET account_uuid = ? WHERE session_id = ?")
            .bind(account_uuid)
            .bind(session_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// The active session together with its assigned account, if both exist.
    pub async fn get_session_account(
        &self,
        session_id: &str,
    ) -> Result<Option<(Session, Account)>> {
        let session = sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions WHERE session_id = ? AND ended_at IS NULL",
        )
        .bind(session_id)
        .fetch_optional(self.pool())
        .await?;

        let Some(session) = session else {
            return Ok(None);
        };
        let Some(uuid) = session.account_uuid.clone() else {
            return Ok(None);
        };
        let Some(account) = self.get_account_by_uuid(&uuid).await? else {
            return Ok(None);
        };
        Ok(Some((session, account)))
    }

    pub async fn list_active_sessions(&self) -> Result<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions WHERE ended_at IS NULL ORDER BY created_at DESC",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(sessions)
    }

    pub async fn active_session_counts(&self) -> Result<HashMap<String, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT account_uuid, COUNT(*) FROM sessions \
             WHERE ended_at IS NULL AND account_uuid IS NOT NULL \
             GROUP BY account_uuid",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().collect())
    }

    /// Sessions created within the last `minutes`, per account.
    pub async fn recent_session_counts(&self, minutes: i64) -> Result<HashMap<String, i64>> {
        let cutoff = util::to_rfc3339(Utc::now() - Duration::minutes(minutes));
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT account_uuid, COUNT(*) FROM sessions \
             WHERE account_uuid IS NOT NULL AND created_at >= ? \
             GROUP BY account_uuid",
        )
        .bind(&cutoff)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().collect())
    }

    pub async fn mark_session_ended(&self, session_id: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET ended_at = ? WHERE session_id = ?")
            .bind(util::now_rfc3339())
            .bind(session_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn update_session_last_checked(&self, session_id: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET last_checked_alive = ? WHERE session_id = ?")
            .bind(util::now_rfc3339())
            .bind(session_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Ended sessions of at least `min_duration_seconds`, newest first.
    pub async fn get_session_history(
        &self,
        min_duration_seconds: i64,
        limit: i64,
    ) -> Result<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions \
             WHERE ended_at IS NOT NULL \
             AND (julianday(ended_at) - julianday(created_at)) * 86400 >= ? \
             ORDER BY ended_at DESC LIMIT ?",
        )
        .bind(min_duration_seconds)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(sessions)
    }

    // Round-robin cursor state

    pub async fn get_round_robin_last(&self, window: &str) -> Result<Option<String>> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT last_account_uuid FROM round_robin_state WHERE window = ?")
                .bind(window)
                .fetch_optional(self.pool())
                .await?;
        Ok(row.and_then(|(uuid,)| uuid))
    }

    pub async fn set_round_robin_last(&self, window: &str, account_uuid: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO round_robin_state (window, last_account_uuid, updated_at) \
             VALUES (?, ?, ?) \
             ON CONFLICT(window) DO UPDATE SET \
                last_account_uuid = excluded.last_account_uuid, \
                updated_at = excluded.updated_at",
        )
        .bind(window)
        .bind(account_uuid)
        .bind(util::now_rfc3339())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// One-time import of the legacy JSON round-robin state. The file is
    /// renamed with a `.migrated` suffix after a successful import. Failure
    /// is non-fatal; the cursor simply starts fresh.
    pub async fn migrate_legacy_round_robin_state(&self, legacy_path: &Path) -> Result<usize> {
        if !legacy_path.exists() {
            return Ok(0);
        }

        let Ok(contents) = std::fs::read_to_string(legacy_path) else {
            return Ok(0);
        };
        let Ok(state) = serde_json::from_str::<serde_json::Value>(&contents) else {
            return Ok(0);
        };
        let Some(round_robin) = state.get("round_robin").and_then(|v| v.as_object()) else {
            return Ok(0);
        };

        let mut migrated = 0;
        for (window, uuid) in round_robin {
            if let Some(uuid) = uuid.as_str().filter(|s| !s.is_empty()) {
                self.set_round_robin_last(window, uuid).await?;
                migrated += 1;
            }
        }

        let mut migrated_path = legacy_path.as_os_str().to_owned();
        migrated_path.push(".migrated");
        let _ = std::fs::rename(legacy_path, &migrated_path);

        Ok(migrated)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    fn fingerprint(pid: i64) -> SessionFingerprint {
        SessionFingerprint {
            pid,
            parent_pid: Some(1),
            proc_start_time: Some(1000.0),
            exe: Some("/usr/bin/claude".into()),
            cmdline: Some("claude --continue".into()),
            cwd: Some("/work".into()),
        }
    }

    async fn store_with_accounts() -> (crate::store::Store, tempfile::TempDir) {
        let (store, dir) = open_store().await;
        for (uuid, email) in [("uuid-a", "a@example.com"), ("uuid-b", "b@example.com")] {
            store
                .save_account(&profile(uuid, email), &credentials(uuid), None)
                .await
                .unwrap();
        }
        (store, dir)
    }

    #[tokio::test]
    async fn test_session_lifecycle_and_counts() {
        let (store, _dir) = store_with_accounts().await;

        let session = store.create_session("s1", &fingerprint(4242)).await.unwrap();
        assert!(session.is_active());
        assert_eq!(session.pid, 4242);

        store.assign_session_to_account("s1", "uuid-a").await.unwrap();
        store.create_session("s2", &fingerprint(4243)).await.unwrap();
        store.assign_session_to_account("s2", "uuid-a").await.unwrap();

        let active = store.active_session_counts().await.unwrap();
        assert_eq!(active.get("uuid-a"), Some(&2));
        assert_eq!(active.get("uuid-b"), None);

        let recent = store.recent_session_counts(5).await.unwrap();
        assert_eq!(recent.get("uuid-a"), Some(&2));

        store.mark_session_ended("s1").await.unwrap();
        let active = store.active_session_counts().await.unwrap();
        assert_eq!(active.get("uuid-a"), Some(&1));

        // Recent counts include ended sessions created inside the window.
        let recent = store.recent_session_counts(5).await.unwrap();
        assert_eq!(recent.get("uuid-a"), Some(&2));

        let (found, account) = store.get_session_account("s2").await.unwrap().unwrap();
        assert_eq!(found.session_id, "s2");
        assert_eq!(account.uuid, "uuid-a");

        // Ended sessions no longer resolve to an account.
        assert!(store.get_session_account("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_session_history_filters_short_sessions() {
        let (store, _dir) = store_with_accounts().await;

        store.create_session("long", &fingerprint(1)).await.unwrap();
        store.create_session("short", &fingerprint(2)).await.unwrap();

        // Backdate the long session's start so its duration clears the bar.
        let earlier = util::to_rfc3339(Utc::now() - Duration::seconds(120));
        sqlx::query("UPDATE sessions SET created_at = ? WHERE session_id = 'long'")
            .bind(&earlier)
            .execute(store.pool())
            .await
            .unwrap();

        store.mark_session_ended("long").await.unwrap();
        store.mark_session_ended("short").await.unwrap();

        let history = store.get_session_history(60, 50).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].session_id, "long");
        assert!(history[0].duration_seconds().unwrap() >= 60.0);
    }

    #[tokio::test]
    async fn test_round_robin_cursor_upsert() {
        let (store, _dir) = store_with_accounts().await;

        assert!(store.get_round_robin_last("overall").await.unwrap().is_none());

        store.set_round_robin_last("overall", "uuid-a").await.unwrap();
        store.set_round_robin_last("overall", "uuid-b").await.unwrap();
        store.set_round_robin_last("opus", "uuid-a").await.unwrap();

        assert_eq!(
            store.get_round_robin_last("overall").await.unwrap().as_deref(),
            Some("uuid-b")
        );
        assert_eq!(
            store.get_round_robin_last("opus").await.unwrap().as_deref(),
            Some("uuid-a")
        );
    }

    #[tokio::test]
    async fn test_legacy_round_robin_migration() {
        let (store, dir) = store_with_accounts().await;

        let legacy = dir.path().join("load_balancer_state.json");
        std::fs::write(
            &legacy,
            r#"{"round_robin": {"overall": "uuid-b", "opus": ""}}"#,
        )
        .unwrap();

        let migrated = store.migrate_legacy_round_robin_state(&legacy).await.unwrap();
        assert_eq!(migrated, 1);
        assert_eq!(
            store.get_round_robin_last("overall").await.unwrap().as_deref(),
            Some("uuid-b")
        );
        assert!(!legacy.exists());
        assert!(dir.path().join("load_balancer_state.json.migrated").exists());

        // Second call is a no-op.
        assert_eq!(
            store.migrate_legacy_round_robin_state(&legacy).await.unwrap(),
            0
        );
    }
}
