//! Pure scoring for load-balanced account selection. No I/O here: inputs
//! are an account, its usage snapshot, a burst estimate, and session
//! counters; the output is a totally ordered [`Candidate`].

use serde::Serialize;

use crate::constants::{
    BURST_THRESHOLD, EXHAUSTED_THRESHOLD, FIVE_HOUR_PENALTIES, FIVE_HOUR_ROTATION_CAP,
    HIGH_OPUS_PENALTY, HIGH_OPUS_PENALTY_THRESHOLD, HIGH_PRIORITY_REFRESH_THRESHOLD,
    LOW_USAGE_FLOOR, LOW_USAGE_MAX_BONUS, LOW_USAGE_OPUS_CEILING, LOW_USAGE_WINDOW_CEILING,
    MAX_PACE_ADJUSTMENT, PACE_AHEAD_DAMPING, PACE_GAIN, PACE_OPUS_GATE, SIMILAR_DRAIN_THRESHOLD,
    STALE_CACHE_SECONDS, WINDOW_LENGTH_HOURS,
};
use crate::models::{Account, CacheSource, UsageSnapshot};

/// Which weekly window a candidate is scored against. The overall window is
/// preferred while it still has headroom; opus is the fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    Overall,
    Opus,
}

impl WindowKind {
    pub fn label(self) -> &'static str {
        match self {
            WindowKind::Overall => "overall",
            WindowKind::Opus => "opus",
        }
    }

    pub fn tier(self) -> i64 {
        match self {
            WindowKind::Overall => 2,
            WindowKind::Opus => 1,
        }
    }
}

/// Scored account, transient to one selection pass.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub account: Account,
    pub usage: UsageSnapshot,
    pub tier: i64,
    pub window: WindowKind,
    pub utilization: f64,
    pub headroom: f64,
    pub hours_to_reset: f64,
    pub drain_rate: f64,
    pub expected_utilization: f64,
    pub pace_gap: f64,
    pub pace_adjustment: f64,
    pub low_usage_bonus: f64,
    pub high_opus_penalty: f64,
    pub priority_drain: f64,
    pub five_hour_utilization: f64,
    pub five_hour_factor: f64,
    pub adjusted_drain: f64,
    pub expected_burst: f64,
    pub burst_blocked: bool,
    pub active_sessions: i64,
    pub recent_sessions: i64,
    pub refreshed: bool,
}

impl Candidate {
    /// Multi-dimensional sort key; selection sorts by this descending.
    pub fn rank(&self) -> [f64; 6] {
        [
            self.adjusted_drain,
            self.utilization,
            -self.hours_to_reset,
            -self.five_hour_utilization,
            -(self.active_sessions as f64),
            -(self.recent_sessions as f64),
        ]
    }
}

/// Score one account. Returns `None` when both weekly windows sit at or
/// above the effective ceiling.
///
/// Null utilizations read as 0 (untracked, not exhausted); null reset
/// timestamps fall back to a full week via the snapshot windows.
pub fn build_candidate(
    account: &Account,
    usage: &UsageSnapshot,
    burst_buffer: f64,
    active_sessions: i64,
    recent_sessions: i64,
    refreshed: bool,
) -> Option<Candidate> {
    let opus_util = usage.seven_day_opus.utilization.unwrap_or(0.0);
    let overall_util = usage.seven_day.utilization.unwrap_or(0.0);

    // Exhausted on both windows
    if opus_util >= EXHAUSTED_THRESHOLD && overall_util >= EXHAUSTED_THRESHOLD {
        return None;
    }

    // Prefer the overall window while it has headroom; fall back to opus.
    let (window, utilization, hours_to_reset) = if overall_util < EXHAUSTED_THRESHOLD {
        (
            WindowKind::Overall,
            overall_util,
            usage.seven_day.hours_until_reset(),
        )
    } else {
        (
            WindowKind::Opus,
            opus_util,
            usage.seven_day_opus.hours_until_reset(),
        )
    };

    // Core metrics
    let headroom = (EXHAUSTED_THRESHOLD - utilization).max(0.0);
    let effective_hours_left = hours_to_reset.max(0.001);
    let drain_rate = if headroom > 0.0 {
        headroom / effective_hours_left
    } else {
        0.0
    };

    // Pace alignment: how far ahead/behind of uniform drain this window is.
    // Only applied while the opus window is hot but not exhausted.
    let elapsed_hours = (WINDOW_LENGTH_HOURS - hours_to_reset.min(WINDOW_LENGTH_HOURS)).max(0.0);
    let expected_utilization = ((elapsed_hours / WINDOW_LENGTH_HOURS) * 100.0).clamp(0.0, 100.0);
    let pace_gap = expected_utilization - utilization;
    let mut pace_adjustment = 0.0;
    if (PACE_OPUS_GATE..EXHAUSTED_THRESHOLD).contains(&opus_util) && headroom > 0.0 {
        pace_adjustment = (pace_gap / effective_hours_left) * PACE_GAIN;
        if pace_gap < 0.0 {
            pace_adjustment *= PACE_AHEAD_DAMPING;
        }
        pace_adjustment = pace_adjustment.clamp(-MAX_PACE_ADJUSTMENT, MAX_PACE_ADJUSTMENT);
    }

    // Low-utilization bonus, tapering to zero at the window ceiling
    let mut low_usage_bonus = 0.0;
    if opus_util < LOW_USAGE_OPUS_CEILING
        && utilization < LOW_USAGE_WINDOW_CEILING
        && headroom > 0.0
    {
        let clamped = utilization.max(LOW_USAGE_FLOOR);
        let normalized = (LOW_USAGE_WINDOW_CEILING - clamped) / LOW_USAGE_WINDOW_CEILING;
        low_usage_bonus = normalized * LOW_USAGE_MAX_BONUS;
    }

    let high_opus_penalty = if opus_util >= HIGH_OPUS_PENALTY_THRESHOLD {
        HIGH_OPUS_PENALTY
    } else {
        0.0
    };

    let priority_drain = drain_rate + pace_adjustment + low_usage_bonus - high_opus_penalty;

    // Tiered multiplicative penalty from the short burst window
    let five_hour_utilization = usage.five_hour.utilization.unwrap_or(0.0);
    let mut five_hour_factor = 1.0;
    for &(threshold, factor) in FIVE_HOUR_PENALTIES {
        if five_hour_utilization >= threshold {
            five_hour_factor = factor;
            break;
        }
    }

    let adjusted_drain = priority_drain * five_hour_factor;

    let burst_blocked = utilization + burst_buffer >= BURST_THRESHOLD;

    Some(Candidate {
        account: account.clone(),
        usage: usage.clone(),
        tier: window.tier(),
        window,
        utilization,
        headroom,
        hours_to_reset,
        drain_rate,
        expected_utilization,
        pace_gap,
        pace_adjustment,
        low_usage_bonus,
        high_opus_penalty,
        priority_drain,
        five_hour_utilization,
        five_hour_factor,
        adjusted_drain,
        expected_burst: burst_buffer,
        burst_blocked,
        active_sessions,
        recent_sessions,
        refreshed,
    })
}

/// Soft filtering then rank sort: prefer non-burst-blocked candidates, then
/// cool burst windows; admit everyone only when a stage would empty the pool.
pub fn sort_filtered(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    if candidates.is_empty() {
        return candidates;
    }

    let usable: Vec<Candidate> = candidates
        .iter()
        .filter(|c| !c.burst_blocked)
        .cloned()
        .collect();
    if !usable.is_empty() {
        candidates = usable;
    }

    let cool: Vec<Candidate> = candidates
        .iter()
        .filter(|c| c.five_hour_utilization < FIVE_HOUR_ROTATION_CAP)
        .cloned()
        .collect();
    if !cool.is_empty() {
        candidates = cool;
    }

    candidates.sort_by(|a, b| {
        b.rank()
            .partial_cmp(&a.rank())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates
}

/// The leader's tie group: every candidate with the leader's tier whose
/// adjusted drain is within the similarity threshold.
pub fn select_top_similar(sorted: &[Candidate]) -> Vec<Candidate> {
    let Some(top) = sorted.first() else {
        return Vec::new();
    };

    sorted
        .iter()
        .filter(|c| {
            c.tier == top.tier
                && (top.adjusted_drain - c.adjusted_drain).abs() <= SIMILAR_DRAIN_THRESHOLD
        })
        .cloned()
        .collect()
}

/// Whether a candidate's cached usage should be refetched live: stale cache,
/// or a high-priority candidate with anything but very fresh data.
pub fn needs_refresh(candidate: &Candidate) -> bool {
    if candidate.refreshed || candidate.usage.cache_source == CacheSource::Live {
        return false;
    }

    let cache_age = candidate.usage.cache_age_seconds;
    if cache_age > STALE_CACHE_SECONDS {
        return true;
    }
    candidate.priority_drain >= HIGH_PRIORITY_REFRESH_THRESHOLD && cache_age > 10.0
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::models::UsageWindow;
    use crate::util;
    use chrono::{Duration, Utc};

    pub fn account(uuid: &str, index: i64) -> Account {
        Account {
            uuid: uuid.to_string(),
            index_num: index,
            nickname: None,
            email: format!("{uuid}@example.com"),
            full_name: None,
            display_name: None,
            has_claude_max: true,
            has_claude_pro: false,
            org_uuid: None,
            org_name: None,
            org_type: None,
            billing_type: None,
            rate_limit_tier: None,
            credentials_json: "{}".into(),
            created_at: util::now_rfc3339(),
            updated_at: util::now_rfc3339(),
        }
    }

    pub fn snapshot(
        uuid: &str,
        five_hour: Option<f64>,
        overall: Option<f64>,
        opus: Option<f64>,
        reset_hours: f64,
    ) -> UsageSnapshot {
        let resets_at = util::to_rfc3339(Utc::now() + Duration::seconds((reset_hours * 3600.0) as i64));
        let window = |utilization: Option<f64>| UsageWindow {
            utilization,
            resets_at: Some(resets_at.clone()),
        };
        UsageSnapshot {
            account_uuid: uuid.to_string(),
            five_hour: window(five_hour),
            seven_day: window(overall),
            seven_day_opus: window(opus),
            queried_at: util::now_rfc3339(),
            cache_source: CacheSource::Live,
            cache_age_seconds: 0.0,
        }
    }

    pub fn candidate(
        uuid: &str,
        index: i64,
        five_hour: f64,
        overall: f64,
        opus: f64,
        reset_hours: f64,
    ) -> Candidate {
        build_candidate(
            &account(uuid, index),
            &snapshot(uuid, Some(five_hour), Some(overall), Some(opus), reset_hours),
            4.0,
            0,
            0,
            false,
        )
        .expect("candidate")
    }
}
