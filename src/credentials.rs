use std::io::Write;
use std::path::PathBuf;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::constants::{
    DEFAULT_TOKEN_EXPIRES_IN_SECS, OAUTH_CLIENT_ID, OAUTH_TOKEN_URL, TOKEN_REFRESH_BUFFER_MS,
    TOKEN_REFRESH_TIMEOUT,
};
use crate::error::{Result, SwitcherError};
use crate::util;

#[derive(Debug, Serialize, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

/// OAuth token lifecycle and credential file synchronization.
///
/// Credential blobs are handled as raw JSON objects end to end so that
/// unrecognized keys written by the consumer tool survive every rewrite.
#[derive(Clone)]
pub struct CredentialStore {
    credentials_path: PathBuf,
    current_account_path: PathBuf,
    client: Client,
}

impl CredentialStore {
    pub fn new(credentials_path: PathBuf, current_account_path: PathBuf, client: Client) -> Self {
        Self {
            credentials_path,
            current_account_path,
            client,
        }
    }

    /// Parse a credential blob, validating the oauth wrapper object.
    pub fn parse_credentials(&self, credentials_json: &str) -> Result<Value> {
        let creds: Value = serde_json::from_str(credentials_json)
            .map_err(|e| SwitcherError::InvalidCredentials(format!("invalid JSON: {e}")))?;
        if !creds.is_object() {
            return Err(SwitcherError::InvalidCredentials(
                "credentials must be a JSON object".into(),
            ));
        }
        if !creds
            .get("claudeAiOauth")
            .map(Value::is_object)
            .unwrap_or(false)
        {
            return Err(SwitcherError::InvalidCredentials(
                "missing claudeAiOauth field".into(),
            ));
        }
        Ok(creds)
    }

    pub fn access_token(credentials: &Value) -> Option<&str> {
        credentials
            .get("claudeAiOauth")
            .and_then(|o| o.get("accessToken"))
            .and_then(Value::as_str)
    }

    /// A token is fresh while it has more than the refresh buffer left.
    pub fn is_token_fresh(credentials: &Value) -> bool {
        let expires_at = credentials
            .get("claudeAiOauth")
            .and_then(|o| o.get("expiresAt"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        expires_at - TOKEN_REFRESH_BUFFER_MS > util::now_millis()
    }

    /// Ensure the blob carries a usable access token, refreshing through the
    /// token endpoint when stale (or always, with `force`). Returns the
    /// (possibly unchanged) credential object.
    pub async fn refresh_access_token(&self, credentials_json: &str, force: bool) -> Result<Value> {
        let creds = self.parse_credentials(credentials_json)?;

        if !force && Self::is_token_fresh(&creds) {
            return Ok(creds);
        }

        let refresh_token = creds
            .get("claudeAiOauth")
            .and_then(|o| o.get("refreshToken"))
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| SwitcherError::TokenUnavailable("no refresh token available".into()))?;

        info!("Refreshing access token");

        let response = self
            .client
            .post(OAUTH_TOKEN_URL)
            .header("content-type", "application/json")
            .timeout(TOKEN_REFRESH_TIMEOUT)
            .json(&serde_json::json!({
                "grant_type": "refresh_token",
                "refresh_token": refresh_token,
                "client_id": OAUTH_CLIENT_ID,
            }))
            .send()
            .await
            .map_err(|e| SwitcherError::TokenUnavailable(format!("OAuth request failed: {e}")))?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(SwitcherError::TokenUnavailable(format!(
                "OAuth endpoint returned {}",
                response.status()
            )));
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            SwitcherError::TokenUnavailable(format!("Failed to parse token response: {e}"))
        })?;

        let mut refreshed = creds;
        let oauth = refreshed
            .get_mut("claudeAiOauth")
            .and_then(Value::as_object_mut)
            .expect("validated by parse_credentials");
        oauth.insert("accessToken".into(), Value::from(token.access_token));
        oauth.insert(
            "refreshToken".into(),
            Value::from(token.refresh_token.unwrap_or(refresh_token)),
        );
        let expires_in = token.expires_in.unwrap_or(DEFAULT_TOKEN_EXPIRES_IN_SECS);
        oauth.insert(
            "expiresAt".into(),
            Value::from(util::now_millis() + expires_in * 1000),
        );

        Ok(refreshed)
    }

    /// Atomically replace the consumer credential file: temp sibling, fsync,
    /// chmod 0600, rename. The destination directory is created 0700.
    pub fn write_credentials(&self, credentials: &Value) -> Result<()> {
        let body = serde_json::to_string_pretty(credentials)
            .map_err(|e| SwitcherError::InvalidCredentials(format!("unserializable blob: {e}")))?;
        atomic_write(&self.credentials_path, body.as_bytes())
    }

    pub fn read_credentials_file(&self) -> Result<Option<Value>> {
        match std::fs::read_to_string(&self.credentials_path) {
            Ok(contents) => self.parse_credentials(&contents).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Record which account the credential file now belongs to. Matching by
    /// access token breaks the moment a token rotates; the sidecar does not.
    pub fn record_current_account(&self, account_uuid: &str) -> Result<()> {
        atomic_write(&self.current_account_path, account_uuid.as_bytes())
    }

    pub fn read_current_account(&self) -> Option<String> {
        std::fs::read_to_string(&self.current_account_path)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

fn atomic_write(path: &PathBuf, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
        util::set_mode(parent, 0o700);
    }

    let mut tmp_path = path.as_os_str().to_owned();
    tmp_path.push(".tmp");
    let tmp_path = PathBuf::from(tmp_path);

    let write_result = (|| -> Result<()> {
        let mut file = std::fs::File::create(&tmp_path)?;
        util::set_mode(&tmp_path, 0o600);
        file.write_all(contents)?;
        file.flush()?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    })();

    if write_result.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }
    write_result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &std::path::Path) -> CredentialStore {
        CredentialStore::new(
            dir.join(".claude").join(".credentials.json"),
            dir.join(".c2switcher").join("current_account"),
            Client::new(),
        )
    }

    fn blob(expires_at: i64) -> Value {
        serde_json::json!({
            "claudeAiOauth": {
                "accessToken": "tok",
                "refreshToken": "refresh",
                "expiresAt": expires_at,
                "scopes": ["user:inference"],
            },
            "someOtherTool": {"keep": "me"},
        })
    }

    #[test]
    fn test_parse_rejects_malformed_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        assert!(matches!(
            store.parse_credentials("not json"),
            Err(SwitcherError::InvalidCredentials(_))
        ));
        assert!(matches!(
            store.parse_credentials("[1, 2]"),
            Err(SwitcherError::InvalidCredentials(_))
        ));
        assert!(matches!(
            store.parse_credentials(r#"{"claudeAiOauth": "nope"}"#),
            Err(SwitcherError::InvalidCredentials(_))
        ));
        assert!(store.parse_credentials(r#"{"claudeAiOauth": {}}"#).is_ok());
    }

    #[test]
    fn test_token_freshness_buffer() {
        // 20 minutes out: fresh. 5 minutes out: inside the 10-minute buffer.
        assert!(CredentialStore::is_token_fresh(&blob(
            util::now_millis() + 20 * 60 * 1000
        )));
        assert!(!CredentialStore::is_token_fresh(&blob(
            util::now_millis() + 5 * 60 * 1000
        )));
        assert!(!CredentialStore::is_token_fresh(&blob(0)));
    }

    #[test]
    fn test_write_credentials_preserves_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        store.write_credentials(&blob(12345)).unwrap();

        let read_back = store.read_credentials_file().unwrap().unwrap();
        assert_eq!(read_back["someOtherTool"]["keep"], "me");
        assert_eq!(read_back["claudeAiOauth"]["expiresAt"], 12345);

        // No stray temp file after a successful write.
        let entries: Vec<_> = std::fs::read_dir(dir.path().join(".claude"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from(".credentials.json")]);
    }

    #[cfg(unix)]
    #[test]
    fn test_credential_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.write_credentials(&blob(1)).unwrap();

        let claude_dir = dir.path().join(".claude");
        let file_mode = std::fs::metadata(claude_dir.join(".credentials.json"))
            .unwrap()
            .permissions()
            .mode();
        let dir_mode = std::fs::metadata(&claude_dir).unwrap().permissions().mode();
        assert_eq!(file_mode & 0o777, 0o600);
        assert_eq!(dir_mode & 0o777, 0o700);
    }

    #[test]
    fn test_current_account_sidecar_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        assert!(store.read_current_account().is_none());
        store.record_current_account("uuid-a").unwrap();
        assert_eq!(store.read_current_account().as_deref(), Some("uuid-a"));
        store.record_current_account("uuid-b").unwrap();
        assert_eq!(store.read_current_account().as_deref(), Some("uuid-b"));
    }
}
