pub mod sessions;
mod usage;

use serde_json::Value;
use sqlx::SqlitePool;

use crate::api::Profile;
use crate::error::{Result, SwitcherError};
use crate::models::Account;
use crate::util;

/// Repository over the store database. Owns every persistent record:
/// accounts, usage history, sessions, and round-robin cursors.
///
/// Cheap to clone — the connection pool is Arc-backed.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// All accounts ordered by index.
    pub async fn list_accounts(&self) -> Result<Vec<Account>> {
        let accounts = sqlx::query_as::<_, Account>("SELECT * FROM accounts ORDER BY index_num")
            .fetch_all(&self.pool)
            .await?;
        Ok(accounts)
    }

    pub async fn get_account_by_uuid(&self, uuid: &str) -> Result<Option<Account>> {
        let account = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(account)
    }

    /// Resolve an account by index (all-digits), nickname, email, or UUID.
    pub async fn get_account_by_identifier(&self, identifier: &str) -> Result<Option<Account>> {
        if !identifier.is_empty() && identifier.chars().all(|c| c.is_ascii_digit()) {
            let index: i64 = identifier.parse().unwrap_or(-1);
            let by_index =
                sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE index_num = ?")
                    .bind(index)
                    .fetch_optional(&self.pool)
                    .await?;
            if by_index.is_some() {
                return Ok(by_index);
            }
        }

        let account = sqlx::query_as::<_, Account>(
            "SELECT * FROM accounts WHERE nickname = ?1 OR email = ?1 OR uuid = ?1 LIMIT 1",
        )
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    /// Upsert an account from profile data. New accounts get the next free
    /// index (`max + 1`, or 0 for an empty fleet); updates keep an existing
    /// nickname when the caller passes none. Runs in a single transaction.
    ///
    /// Returns the stored account and whether it was newly inserted.
    pub async fn save_account(
        &self,
        profile: &Profile,
        credentials: &Value,
        nickname: Option<&str>,
    ) -> Result<(Account, bool)> {
        let uuid = profile.account.uuid.as_str();
        if uuid.is_empty() {
            return Err(SwitcherError::InvalidCredentials(
                "profile data missing account UUID".into(),
            ));
        }

        let credentials_json = serde_json::to_string(credentials)
            .map_err(|e| SwitcherError::Database(format!("Failed to serialize credentials: {e}")))?;
        let org = profile.organization.clone().unwrap_or_default();
        let now = util::now_rfc3339();

        let mut tx = self.pool.begin().await?;

        let existing: Option<(i64,)> = sqlx::query_as("SELECT index_num FROM accounts WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(&mut *tx)
            .await?;
        let is_new = existing.is_none();

        if is_new {
            let (max_index,): (Option<i64>,) = sqlx::query_as("SELECT MAX(index_num) FROM accounts")
                .fetch_one(&mut *tx)
                .await?;
            let index_num = max_index.map(|m| m + 1).unwrap_or(0);

            sqlx::query(
                r#"
                INSERT INTO accounts (
                    uuid, index_num, nickname, email, full_name, display_name,
                    has_claude_max, has_claude_pro, org_uuid, org_name, org_type,
                    billing_type, rate_limit_tier, credentials_json, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(uuid)
            .bind(index_num)
            .bind(nickname)
            .bind(&profile.account.email)
            .bind(&profile.account.full_name)
            .bind(&profile.account.display_name)
            .bind(profile.account.has_claude_max)
            .bind(profile.account.has_claude_pro)
            .bind(&org.uuid)
            .bind(&org.name)
            .bind(&org.organization_type)
            .bind(&org.billing_type)
            .bind(&org.rate_limit_tier)
            .bind(&credentials_json)
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                r#"
                UPDATE accounts SET
                    nickname = COALESCE(?, nickname),
                    email = ?,
                    full_name = ?,
                    display_name = ?,
                    has_claude_max = ?,
                    has_claude_pro = ?,
                    org_uuid = ?,
                    org_name = ?,
                    org_type = ?,
                    billing_type = ?,
                    rate_limit_tier = ?,
                    credentials_json = ?,
                    updated_at = ?
                WHERE uuid = ?
                "#,
            )
            .bind(nickname)
            .bind(&profile.account.email)
            .bind(&profile.account.full_name)
            .bind(&profile.account.display_name)
            .bind(profile.account.has_claude_max)
            .bind(profile.account.has_claude_pro)
            .bind(&org.uuid)
            .bind(&org.name)
            .bind(&org.organization_type)
            .bind(&org.billing_type)
            .bind(&org.rate_limit_tier)
            .bind(&credentials_json)
            .bind(&now)
            .bind(uuid)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        let account = self
            .get_account_by_uuid(uuid)
            .await?
            .ok_or_else(|| SwitcherError::Database("account missing after save".into()))?;
        Ok((account, is_new))
    }

    /// Replace an account's credential blob, e.g. after a token refresh.
    pub async fn update_credentials(&self, uuid: &str, credentials: &Value) -> Result<()> {
        let credentials_json = serde_json::to_string(credentials)
            .map_err(|e| SwitcherError::Database(format!("Failed to serialize credentials: {e}")))?;
        sqlx::query("UPDATE accounts SET credentials_json = ?, updated_at = ? WHERE uuid = ?")
            .bind(&credentials_json)
            .bind(util::now_rfc3339())
            .bind(uuid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::api::{Profile, ProfileAccount, ProfileOrg};
    use crate::db;
    use tempfile::TempDir;

    pub async fn open_store() -> (Store, TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = db::init_db(&dir.path().join("store.db"))
            .await
            .expect("init db");
        (Store::new(pool), dir)
    }

    pub fn profile(uuid: &str, email: &str) -> Profile {
        Profile {
            account: ProfileAccount {
                uuid: uuid.to_string(),
                email: email.to_string(),
                full_name: Some("Test User".into()),
                display_name: Some("Test".into()),
                has_claude_max: true,
                has_claude_pro: false,
            },
            organization: Some(ProfileOrg {
                uuid: Some(uuid::Uuid::new_v4().to_string()),
                name: Some("Test Org".into()),
                organization_type: Some("claude_max".into()),
                billing_type: None,
                rate_limit_tier: Some("default_claude_max_20x".into()),
            }),
        }
    }

    pub fn credentials(token: &str) -> serde_json::Value {
        serde_json::json!({
            "claudeAiOauth": {
                "accessToken": token,
                "refreshToken": format!("refresh-{token}"),
                "expiresAt": crate::util::now_millis() + 3_600_000,
                "scopes": ["user:inference", "user:profile"],
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;

    #[tokio::test]
    async fn test_save_account_allocates_dense_indices() {
        let (store, _dir) = open_store().await;

        let (a, new_a) = store
            .save_account(&profile("uuid-a", "a@example.com"), &credentials("tok-a"), None)
            .await
            .unwrap();
        let (b, new_b) = store
            .save_account(&profile("uuid-b", "b@example.com"), &credentials("tok-b"), None)
            .await
            .unwrap();

        assert!(new_a && new_b);
        assert_eq!(a.index_num, 0);
        assert_eq!(b.index_num, 1);
    }

    #[tokio::test]
    async fn test_save_account_upsert_preserves_nickname() {
        let (store, _dir) = open_store().await;

        let (_, is_new) = store
            .save_account(
                &profile("uuid-a", "a@example.com"),
                &credentials("tok-a"),
                Some("work"),
            )
            .await
            .unwrap();
        assert!(is_new);

        // Re-save without a nickname: existing one must survive.
        let (updated, is_new) = store
            .save_account(&profile("uuid-a", "a2@example.com"), &credentials("tok-a2"), None)
            .await
            .unwrap();
        assert!(!is_new);
        assert_eq!(updated.nickname.as_deref(), Some("work"));
        assert_eq!(updated.email, "a2@example.com");
        assert_eq!(updated.index_num, 0);
    }

    #[tokio::test]
    async fn test_get_account_by_identifier_variants() {
        let (store, _dir) = open_store().await;
        store
            .save_account(
                &profile("uuid-a", "a@example.com"),
                &credentials("tok-a"),
                Some("work"),
            )
            .await
            .unwrap();

        for ident in ["0", "work", "a@example.com", "uuid-a"] {
            let found = store.get_account_by_identifier(ident).await.unwrap();
            assert_eq!(
                found.map(|a| a.uuid),
                Some("uuid-a".to_string()),
                "identifier {ident}"
            );
        }

        assert!(store.get_account_by_identifier("7").await.unwrap().is_none());
        assert!(
            store
                .get_account_by_identifier("nobody@example.com")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_store_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let (_store, dir) = open_store().await;
        let dir_mode = std::fs::metadata(dir.path()).unwrap().permissions().mode();
        let db_mode = std::fs::metadata(dir.path().join("store.db"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);
        assert_eq!(db_mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_update_credentials_round_trip() {
        let (store, _dir) = open_store().await;
        store
            .save_account(&profile("uuid-a", "a@example.com"), &credentials("tok-a"), None)
            .await
            .unwrap();

        let fresh = credentials("tok-rotated");
        store.update_credentials("uuid-a", &fresh).await.unwrap();

        let account = store.get_account_by_uuid("uuid-a").await.unwrap().unwrap();
        let stored: serde_json::Value = serde_json::from_str(&account.credentials_json).unwrap();
        assert_eq!(stored["claudeAiOauth"]["accessToken"], "tok-rotated");
    }
}
