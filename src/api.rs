use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{
    ANTHROPIC_PROFILE_URL, ANTHROPIC_USAGE_URL, ANTHROPIC_VERSION, API_REQUEST_TIMEOUT,
    OAUTH_BETA_HEADER, USAGE_NULL_RETRIES, USER_AGENT,
};
use crate::error::{Result, SwitcherError};
use crate::models::{CacheSource, UsageSnapshot, UsageWindow};
use crate::util;

// --- API response types ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileAccount {
    pub uuid: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub has_claude_max: bool,
    #[serde(default)]
    pub has_claude_pro: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileOrg {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub organization_type: Option<String>,
    #[serde(default)]
    pub billing_type: Option<String>,
    #[serde(default)]
    pub rate_limit_tier: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub account: ProfileAccount,
    #[serde(default)]
    pub organization: Option<ProfileOrg>,
}

/// Raw usage endpoint payload. Unknown windows (e.g. per-model breakdowns
/// the API grows later) ride along in `extra` so the stored raw response
/// stays faithful.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageResponse {
    pub five_hour: Option<UsageWindow>,
    pub seven_day: Option<UsageWindow>,
    pub seven_day_opus: Option<UsageWindow>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl UsageResponse {
    /// The usage endpoint intermittently answers with every window null.
    pub fn has_any_data(&self) -> bool {
        self.five_hour.is_some() || self.seven_day.is_some() || self.seven_day_opus.is_some()
    }

    pub fn into_snapshot(
        self,
        account_uuid: &str,
        queried_at: String,
        cache_source: CacheSource,
        cache_age_seconds: f64,
    ) -> UsageSnapshot {
        UsageSnapshot {
            account_uuid: account_uuid.to_string(),
            five_hour: self.five_hour.unwrap_or_default(),
            seven_day: self.seven_day.unwrap_or_default(),
            seven_day_opus: self.seven_day_opus.unwrap_or_default(),
            queried_at,
            cache_source,
            cache_age_seconds,
        }
    }

    pub fn live_snapshot(self, account_uuid: &str) -> UsageSnapshot {
        self.into_snapshot(account_uuid, util::now_rfc3339(), CacheSource::Live, 0.0)
    }
}

/// Claude API client for the OAuth profile and usage endpoints.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
}

impl ApiClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn get(&self, url: &str, token: &str) -> reqwest::RequestBuilder {
        self.client
            .get(url)
            .header("authorization", format!("Bearer {token}"))
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("anthropic-beta", OAUTH_BETA_HEADER)
            .header("content-type", "application/json")
            .header("user-agent", USER_AGENT)
            .header("accept", "application/json")
            .timeout(API_REQUEST_TIMEOUT)
    }

    pub async fn get_profile(&self, token: &str) -> Result<Profile> {
        let response = self.get(ANTHROPIC_PROFILE_URL, token).send().await?;
        if !response.status().is_success() {
            return Err(SwitcherError::UsageFetch(format!(
                "profile endpoint returned {}",
                response.status()
            )));
        }
        let profile = response
            .json::<Profile>()
            .await
            .map_err(|e| SwitcherError::UsageFetch(format!("Failed to parse profile: {e}")))?;
        Ok(profile)
    }

    /// Fetch usage, retrying when every window comes back null.
    ///
    /// Backoff is 0.5s then 1s; after the final attempt the all-null payload
    /// is returned as-is and the caller decides whether to fall back to a
    /// cached snapshot.
    pub async fn get_usage(&self, token: &str) -> Result<UsageResponse> {
        let mut last = UsageResponse::default();

        for attempt in 0..USAGE_NULL_RETRIES {
            let response = self.get(ANTHROPIC_USAGE_URL, token).send().await?;
            if !response.status().is_success() {
                return Err(SwitcherError::UsageFetch(format!(
                    "usage endpoint returned {}",
                    response.status()
                )));
            }

            let usage = response
                .json::<UsageResponse>()
                .await
                .map_err(|e| SwitcherError::UsageFetch(format!("Failed to parse usage: {e}")))?;

            if usage.has_any_data() {
                return Ok(usage);
            }

            debug!("usage endpoint returned all-null payload (attempt {})", attempt + 1);
            last = usage;

            if attempt + 1 < USAGE_NULL_RETRIES {
                let backoff = Duration::from_millis(500u64 << attempt);
                tokio::time::sleep(backoff).await;
            }
        }

        Ok(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_response_round_trips_unknown_windows() {
        let raw = serde_json::json!({
            "five_hour": {"utilization": 12.0, "resets_at": "2026-08-01T10:00:00Z"},
            "seven_day": {"utilization": 40.0, "resets_at": null},
            "seven_day_opus": null,
            "seven_day_sonnet": {"utilization": 3.0, "resets_at": null},
            "extra_usage": {"is_enabled": false}
        });

        let parsed: UsageResponse = serde_json::from_value(raw.clone()).unwrap();
        assert!(parsed.has_any_data());
        assert!(parsed.seven_day_opus.is_none());
        assert_eq!(parsed.extra.len(), 2);

        let back = serde_json::to_value(&parsed).unwrap();
        assert_eq!(back["seven_day_sonnet"]["utilization"], 3.0);
        assert_eq!(back["extra_usage"]["is_enabled"], false);
    }

    #[test]
    fn test_all_null_detection() {
        let parsed: UsageResponse = serde_json::from_value(serde_json::json!({
            "five_hour": null, "seven_day": null, "seven_day_opus": null
        }))
        .unwrap();
        assert!(!parsed.has_any_data());
    }

    #[test]
    fn test_live_snapshot_defaults_missing_windows() {
        let parsed: UsageResponse = serde_json::from_value(serde_json::json!({
            "seven_day": {"utilization": 55.0, "resets_at": null}
        }))
        .unwrap();
        let snapshot = parsed.live_snapshot("uuid-a");
        assert_eq!(snapshot.cache_source, CacheSource::Live);
        assert_eq!(snapshot.seven_day.utilization, Some(55.0));
        assert!(snapshot.five_hour.utilization.is_none());
    }
}
