use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::constants::WINDOW_LENGTH_HOURS;
use crate::util;

/// Registered subscription account with profile metadata and the serialized
/// credential blob. `index_num` is the stable small integer operators type
/// on the command line.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Account {
    pub uuid: String,
    pub index_num: i64,
    pub nickname: Option<String>,
    pub email: String,
    pub full_name: Option<String>,
    pub display_name: Option<String>,
    pub has_claude_max: bool,
    pub has_claude_pro: bool,
    pub org_uuid: Option<String>,
    pub org_name: Option<String>,
    pub org_type: Option<String>,
    pub billing_type: Option<String>,
    pub rate_limit_tier: Option<String>,
    pub credentials_json: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Account {
    /// Nickname, display name, or email — whichever is present first.
    pub fn display_identifier(&self) -> &str {
        self.nickname
            .as_deref()
            .or(self.display_name.as_deref())
            .unwrap_or(&self.email)
    }

    pub fn plan_label(&self) -> &'static str {
        if self.has_claude_max {
            "Max"
        } else if self.has_claude_pro {
            "Pro"
        } else {
            "Free"
        }
    }

    pub fn masked_email(&self) -> String {
        util::mask_email(&self.email)
    }
}

/// Usage metrics for a single limit window (5h, 7d, or 7d-opus).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageWindow {
    pub utilization: Option<f64>,
    pub resets_at: Option<String>,
}

impl UsageWindow {
    /// Hours until this window resets. Missing or unparseable timestamps
    /// fall back to a full week; already-passed resets report a small
    /// positive horizon so drain math never divides by zero.
    pub fn hours_until_reset(&self) -> f64 {
        let Some(resets_at) = self.resets_at.as_deref() else {
            return WINDOW_LENGTH_HOURS;
        };
        match util::parse_timestamp(resets_at) {
            Some(reset) => {
                let hours = (reset - Utc::now()).num_milliseconds() as f64 / 3_600_000.0;
                if hours < 0.0 { 0.1 } else { hours.max(1.0 / 60.0) }
            }
            None => WINDOW_LENGTH_HOURS,
        }
    }
}

/// Where a snapshot came from in this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSource {
    Live,
    Cache,
}

impl std::fmt::Display for CacheSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheSource::Live => write!(f, "live"),
            CacheSource::Cache => write!(f, "cache"),
        }
    }
}

/// Point-in-time reading of one account's three limit windows, decorated
/// with provenance and cache age.
#[derive(Debug, Clone)]
pub struct UsageSnapshot {
    pub account_uuid: String,
    pub five_hour: UsageWindow,
    pub seven_day: UsageWindow,
    pub seven_day_opus: UsageWindow,
    pub queried_at: String,
    pub cache_source: CacheSource,
    pub cache_age_seconds: f64,
}

impl UsageSnapshot {
    /// True when at least one window carries data. The usage endpoint
    /// intermittently answers with every window null.
    pub fn has_any_data(&self) -> bool {
        [&self.five_hour, &self.seven_day, &self.seven_day_opus]
            .iter()
            .any(|w| w.utilization.is_some() || w.resets_at.is_some())
    }
}

/// One consumer-side process holding (or waiting for) an account assignment.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Session {
    pub session_id: String,
    pub account_uuid: Option<String>,
    pub pid: i64,
    pub parent_pid: Option<i64>,
    pub proc_start_time: Option<f64>,
    pub exe: Option<String>,
    pub cmdline: Option<String>,
    pub cwd: Option<String>,
    pub created_at: String,
    pub last_checked_alive: String,
    pub ended_at: Option<String>,
}

impl Session {
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        let created = util::parse_timestamp(&self.created_at)?;
        let ended = util::parse_timestamp(self.ended_at.as_deref()?)?;
        Some((ended - created).num_milliseconds() as f64 / 1000.0)
    }
}
