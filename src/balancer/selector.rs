use std::collections::{HashMap, HashSet};

use futures_util::stream::{self, StreamExt};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::scorer::{self, Candidate};
use crate::api::ApiClient;
use crate::constants::{
    CACHE_TTL_SECONDS, EXHAUSTED_THRESHOLD, MAX_PARALLEL_FETCHES, RECENT_SESSION_MINUTES,
    USAGE_FALLBACK_MAX_AGE_SECONDS,
};
use crate::credentials::CredentialStore;
use crate::error::{Result, SwitcherError};
use crate::models::{Account, UsageSnapshot};
use crate::store::Store;
use crate::tracker::SessionTracker;

#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    /// Session to reuse or bind the decision to.
    pub session_id: Option<String>,
    /// Refresh tokens but leave the credential file alone.
    pub token_only: bool,
    /// Score and report without binding, refreshing, or writing credentials.
    pub dry_run: bool,
}

/// Outcome of a selection pass, with full scoring diagnostics.
#[derive(Debug, Clone)]
pub struct SelectionDecision {
    pub candidate: Candidate,
    pub reused: bool,
}

impl SelectionDecision {
    pub fn account(&self) -> &Account {
        &self.candidate.account
    }

    pub fn to_json(&self) -> Value {
        let c = &self.candidate;
        json!({
            "account": {
                "index": c.account.index_num,
                "uuid": c.account.uuid,
                "nickname": c.account.nickname,
                "email": c.account.email,
            },
            "tier": c.tier,
            "window": c.window.label(),
            "opus_usage": c.usage.seven_day_opus.utilization,
            "overall_usage": c.usage.seven_day.utilization,
            "utilization": c.utilization,
            "headroom": c.headroom,
            "hours_to_reset": c.hours_to_reset,
            "drain_rate": c.drain_rate,
            "expected_utilization": c.expected_utilization,
            "pace_gap": c.pace_gap,
            "pace_adjustment": c.pace_adjustment,
            "low_usage_bonus": c.low_usage_bonus,
            "high_opus_penalty": c.high_opus_penalty,
            "priority_drain": c.priority_drain,
            "five_hour_utilization": c.five_hour_utilization,
            "five_hour_factor": c.five_hour_factor,
            "adjusted_drain": c.adjusted_drain,
            "expected_burst": c.expected_burst,
            "burst_blocked": c.burst_blocked,
            "active_sessions": c.active_sessions,
            "recent_sessions": c.recent_sessions,
            "cache_source": c.usage.cache_source.to_string(),
            "cache_age_seconds": c.usage.cache_age_seconds,
            "refreshed": c.refreshed,
            "reused": self.reused,
        })
    }
}

/// Orchestrates a selection pass: cleanup, session reuse, cache collection,
/// parallel fetch, scoring, stale refresh, soft filtering, round-robin
/// tie-break, and finally binding plus credential materialization.
pub struct Selector {
    store: Store,
    credentials: CredentialStore,
    api: ApiClient,
    tracker: SessionTracker,
    debug_balancer: bool,
}

impl Selector {
    pub fn new(
        store: Store,
        credentials: CredentialStore,
        api: ApiClient,
        tracker: SessionTracker,
        debug_balancer: bool,
    ) -> Self {
        Self {
            store,
            credentials,
            api,
            tracker,
            debug_balancer,
        }
    }

    pub async fn select_optimal(&self, opts: &SelectOptions) -> Result<SelectionDecision> {
        self.tracker.maybe_cleanup().await?;

        // Session stickiness: a healthy prior assignment short-circuits
        // scoring entirely.
        if let Some(session_id) = opts.session_id.as_deref()
            && let Some(decision) = self.try_reuse_session(session_id).await?
        {
            if !opts.dry_run && !opts.token_only {
                let creds = self
                    .credentials
                    .parse_credentials(&decision.candidate.account.credentials_json)?;
                self.credentials.write_credentials(&creds)?;
                self.credentials
                    .record_current_account(&decision.candidate.account.uuid)?;
            }
            return Ok(decision);
        }

        let accounts = self.store.list_accounts().await?;
        if accounts.is_empty() {
            return Err(SwitcherError::NoAccountsAvailable(
                "no accounts registered".into(),
            ));
        }

        // Collect cached usage under the TTL; fetch the rest in parallel.
        let mut usage_map: HashMap<String, UsageSnapshot> = HashMap::new();
        let mut missing: Vec<Account> = Vec::new();
        for account in &accounts {
            match self
                .store
                .get_recent_usage(&account.uuid, CACHE_TTL_SECONDS, false)
                .await?
            {
                Some(snapshot) => {
                    usage_map.insert(account.uuid.clone(), snapshot);
                }
                None => missing.push(account.clone()),
            }
        }

        if !missing.is_empty() {
            usage_map.extend(self.fetch_usage_batch(&missing, "initial").await);
        }

        if usage_map.is_empty() {
            return Err(SwitcherError::NoAccountsAvailable(
                "could not fetch usage for any account".into(),
            ));
        }

        let active_counts = self.store.active_session_counts().await?;
        let recent_counts = self.store.recent_session_counts(RECENT_SESSION_MINUTES).await?;
        let mut burst_cache: HashMap<String, f64> = HashMap::new();
        let mut refreshed_ids: HashSet<String> = HashSet::new();

        let mut candidates = self
            .build_candidates(
                &accounts,
                &usage_map,
                &active_counts,
                &recent_counts,
                &mut burst_cache,
                &refreshed_ids,
            )
            .await?;

        // Stale refresh pass: refetch candidates whose cache is too old for
        // their priority, then re-score with the fresh snapshots.
        let refresh_accounts: Vec<Account> = accounts
            .iter()
            .filter(|account| {
                candidates
                    .iter()
                    .any(|c| c.account.uuid == account.uuid && scorer::needs_refresh(c))
            })
            .cloned()
            .collect();

        if !refresh_accounts.is_empty() {
            let fetched = self.fetch_usage_batch(&refresh_accounts, "refresh").await;
            for uuid in fetched.keys() {
                refreshed_ids.insert(uuid.clone());
                burst_cache.remove(uuid);
            }
            usage_map.extend(fetched);

            candidates = self
                .build_candidates(
                    &accounts,
                    &usage_map,
                    &active_counts,
                    &recent_counts,
                    &mut burst_cache,
                    &refreshed_ids,
                )
                .await?;
        }

        if candidates.is_empty() {
            return Err(SwitcherError::NoAccountsAvailable(
                "all accounts exhausted".into(),
            ));
        }

        let sorted = scorer::sort_filtered(candidates);
        if self.debug_balancer {
            log_candidates(&sorted);
        }

        let similar = scorer::select_top_similar(&sorted);
        let mut selected = if similar.len() > 1 {
            self.choose_round_robin(similar).await?
        } else {
            sorted.into_iter().next().expect("pool is non-empty")
        };

        if let Some(session_id) = opts.session_id.as_deref()
            && !opts.dry_run
        {
            self.store
                .assign_session_to_account(session_id, &selected.account.uuid)
                .await?;
        }

        if !opts.dry_run {
            let original = self
                .credentials
                .parse_credentials(&selected.account.credentials_json)?;
            let refreshed = self
                .credentials
                .refresh_access_token(&selected.account.credentials_json, false)
                .await?;

            if !opts.token_only {
                self.credentials.write_credentials(&refreshed)?;
                self.credentials.record_current_account(&selected.account.uuid)?;
            }

            if refreshed != original {
                self.store
                    .update_credentials(&selected.account.uuid, &refreshed)
                    .await?;
                selected.account.credentials_json = serde_json::to_string(&refreshed)
                    .map_err(|e| SwitcherError::Database(e.to_string()))?;
            }
        }

        Ok(SelectionDecision {
            candidate: selected,
            reused: false,
        })
    }

    /// Direct switch to a specific account by identifier.
    pub async fn switch_to(&self, identifier: &str, token_only: bool) -> Result<Account> {
        let mut account = self
            .store
            .get_account_by_identifier(identifier)
            .await?
            .ok_or_else(|| SwitcherError::AccountNotFound(identifier.to_string()))?;

        let original = self.credentials.parse_credentials(&account.credentials_json)?;
        let refreshed = self
            .credentials
            .refresh_access_token(&account.credentials_json, false)
            .await?;

        if !token_only {
            self.credentials.write_credentials(&refreshed)?;
            self.credentials.record_current_account(&account.uuid)?;
        }

        if refreshed != original {
            self.store.update_credentials(&account.uuid, &refreshed).await?;
            account.credentials_json = serde_json::to_string(&refreshed)
                .map_err(|e| SwitcherError::Database(e.to_string()))?;
        }

        Ok(account)
    }

    /// Check a previously assigned account; reuse it unless a weekly window
    /// is exhausted. Fetch failures fall back to a full selection.
    async fn try_reuse_session(&self, session_id: &str) -> Result<Option<SelectionDecision>> {
        let Some((_, account)) = self.store.get_session_account(session_id).await? else {
            return Ok(None);
        };

        let usage = match self.fetch_and_persist(&account).await {
            Ok(usage) => usage,
            Err(e) => {
                warn!(
                    "Could not verify reused account {} for session {session_id}: {e}",
                    account.email
                );
                return Ok(None);
            }
        };

        let opus_ok = usage
            .seven_day_opus
            .utilization
            .map(|u| u < EXHAUSTED_THRESHOLD)
            .unwrap_or(true);
        let overall_ok = usage
            .seven_day
            .utilization
            .map(|u| u < EXHAUSTED_THRESHOLD)
            .unwrap_or(true);
        if !opus_ok || !overall_ok {
            info!(
                "Session {session_id} assignment to {} discarded (window exhausted)",
                account.email
            );
            return Ok(None);
        }

        // The fetch may have rotated credentials; reload before reporting.
        let account = self
            .store
            .get_account_by_uuid(&account.uuid)
            .await?
            .unwrap_or(account);

        let active_counts = self.store.active_session_counts().await?;
        let recent_counts = self.store.recent_session_counts(RECENT_SESSION_MINUTES).await?;
        let burst = self.store.burst_percentile(&account.uuid).await?;

        let Some(candidate) = scorer::build_candidate(
            &account,
            &usage,
            burst,
            active_counts.get(&account.uuid).copied().unwrap_or(0),
            recent_counts.get(&account.uuid).copied().unwrap_or(0),
            true,
        ) else {
            return Ok(None);
        };

        Ok(Some(SelectionDecision {
            candidate,
            reused: true,
        }))
    }

    /// Refresh the account's token if needed, pull live usage, and persist
    /// both. All-null payloads fall back to the newest non-null snapshot
    /// within 24h.
    async fn fetch_and_persist(&self, account: &Account) -> Result<UsageSnapshot> {
        let original = self.credentials.parse_credentials(&account.credentials_json)?;
        let refreshed = self
            .credentials
            .refresh_access_token(&account.credentials_json, false)
            .await?;
        let token = CredentialStore::access_token(&refreshed)
            .ok_or_else(|| SwitcherError::UsageFetch("no access token in credentials".into()))?
            .to_string();

        let response = self.api.get_usage(&token).await?;
        self.store.save_usage(&account.uuid, &response).await?;

        if refreshed != original {
            self.store.update_credentials(&account.uuid, &refreshed).await?;
        }

        if !response.has_any_data()
            && let Some(fallback) = self
                .store
                .get_recent_usage(&account.uuid, USAGE_FALLBACK_MAX_AGE_SECONDS, true)
                .await?
        {
            debug!(
                "Usage for {} came back all-null; using cached snapshot ({:.0}s old)",
                account.email, fallback.cache_age_seconds
            );
            return Ok(fallback);
        }

        Ok(response.live_snapshot(&account.uuid))
    }

    /// Fetch usage for several accounts with bounded parallelism. Per-account
    /// failures are logged and the account is skipped for this pass.
    pub(crate) async fn fetch_usage_batch(
        &self,
        accounts: &[Account],
        label: &str,
    ) -> HashMap<String, UsageSnapshot> {
        if accounts.is_empty() {
            return HashMap::new();
        }

        let limit = accounts.len().min(MAX_PARALLEL_FETCHES);
        let results: Vec<(String, String, Result<UsageSnapshot>)> =
            stream::iter(accounts.iter().map(|account| {
                let account = account.clone();
                async move {
                    let result = self.fetch_and_persist(&account).await;
                    (account.uuid, account.email, result)
                }
            }))
            .buffer_unordered(limit)
            .collect()
            .await;

        let mut fetched = HashMap::new();
        for (uuid, email, result) in results {
            match result {
                Ok(snapshot) => {
                    fetched.insert(uuid, snapshot);
                }
                Err(e) => warn!("Could not fetch usage for {email} ({label}): {e}"),
            }
        }
        fetched
    }

    async fn build_candidates(
        &self,
        accounts: &[Account],
        usage_map: &HashMap<String, UsageSnapshot>,
        active_counts: &HashMap<String, i64>,
        recent_counts: &HashMap<String, i64>,
        burst_cache: &mut HashMap<String, f64>,
        refreshed_ids: &HashSet<String>,
    ) -> Result<Vec<Candidate>> {
        let mut candidates = Vec::new();

        for account in accounts {
            let Some(usage) = usage_map.get(&account.uuid) else {
                continue;
            };

            let burst = match burst_cache.get(&account.uuid) {
                Some(burst) => *burst,
                None => {
                    let burst = self.store.burst_percentile(&account.uuid).await?;
                    burst_cache.insert(account.uuid.clone(), burst);
                    burst
                }
            };

            if let Some(candidate) = scorer::build_candidate(
                account,
                usage,
                burst,
                active_counts.get(&account.uuid).copied().unwrap_or(0),
                recent_counts.get(&account.uuid).copied().unwrap_or(0),
                refreshed_ids.contains(&account.uuid),
            ) {
                candidates.push(candidate);
            }
        }

        Ok(candidates)
    }

    /// Rotate among near-tied candidates: fewest active sessions, fewest
    /// recent sessions, then advance the durable cursor for this window.
    async fn choose_round_robin(&self, mut pool: Vec<Candidate>) -> Result<Candidate> {
        if pool.len() == 1 {
            return Ok(pool.remove(0));
        }

        let min_active = pool.iter().map(|c| c.active_sessions).min().unwrap_or(0);
        pool.retain(|c| c.active_sessions == min_active);
        let min_recent = pool.iter().map(|c| c.recent_sessions).min().unwrap_or(0);
        pool.retain(|c| c.recent_sessions == min_recent);
        pool.sort_by_key(|c| c.account.index_num);

        let window = pool[0].window.label();
        let last_uuid = self.store.get_round_robin_last(window).await?;

        let mut next_idx = 0;
        if let Some(last_uuid) = last_uuid
            && let Some(idx) = pool.iter().position(|c| c.account.uuid == last_uuid)
        {
            next_idx = (idx + 1) % pool.len();
        }

        let selected = pool.remove(next_idx);
        self.store
            .set_round_robin_last(window, &selected.account.uuid)
            .await?;
        Ok(selected)
    }
}

fn log_candidates(candidates: &[Candidate]) {
    info!("load-balancer candidates:");
    for c in candidates {
        info!(
            "- {}: tier={} drain={:.3} adj={:.3} factor={:.2} util={:.1} headroom={:.1} \
             burst={:.1} blocked={} hours={:.1} five_hour={:.1} active={} recent={} \
             cache={} age={:.0}s{}",
            c.account.email,
            c.tier,
            c.drain_rate,
            c.adjusted_drain,
            c.five_hour_factor,
            c.utilization,
            c.headroom,
            c.expected_burst,
            c.burst_blocked as u8,
            c.hours_to_reset,
            c.five_hour_utilization,
            c.active_sessions,
            c.recent_sessions,
            c.usage.cache_source,
            c.usage.cache_age_seconds,
            if c.refreshed { " (refreshed)" } else { "" },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UsageWindow;
    use crate::store::test_support::{credentials, open_store, profile};
    use crate::util;
    use chrono::{Duration, Utc};

    fn usage_response(
        five_hour: f64,
        overall: f64,
        opus: f64,
        reset_hours: f64,
    ) -> crate::api::UsageResponse {
        let resets_at =
            util::to_rfc3339(Utc::now() + Duration::seconds((reset_hours * 3600.0) as i64));
        let window = |utilization: f64| {
            Some(UsageWindow {
                utilization: Some(utilization),
                resets_at: Some(resets_at.clone()),
            })
        };
        crate::api::UsageResponse {
            five_hour: window(five_hour),
            seven_day: window(overall),
            seven_day_opus: window(opus),
            extra: Default::default(),
        }
    }

    async fn selector(store: &Store, dir: &tempfile::TempDir) -> Selector {
        let client = reqwest::Client::new();
        let credentials = CredentialStore::new(
            dir.path().join(".claude").join(".credentials.json"),
            dir.path().join("current_account"),
            client.clone(),
        );
        let tracker = SessionTracker::new(store.clone(), dir.path().join(".last_cleanup"));
        Selector::new(
            store.clone(),
            credentials,
            ApiClient::new(client),
            tracker,
            false,
        )
    }

    fn dry_run() -> SelectOptions {
        SelectOptions {
            dry_run: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_empty_fleet_errors() {
        let (store, dir) = open_store().await;
        let selector = selector(&store, &dir).await;
        let err = selector.select_optimal(&dry_run()).await.unwrap_err();
        assert!(matches!(err, SwitcherError::NoAccountsAvailable(_)));
    }

    #[tokio::test]
    async fn test_single_account_with_headroom_is_chosen() {
        let (store, dir) = open_store().await;
        for (uuid, email) in [("uuid-a", "a@example.com"), ("uuid-b", "b@example.com")] {
            store
                .save_account(&profile(uuid, email), &credentials(uuid), None)
                .await
                .unwrap();
        }
        // A exhausted on both weekly windows, B wide open.
        store
            .save_usage("uuid-a", &usage_response(10.0, 99.0, 100.0, 80.0))
            .await
            .unwrap();
        store
            .save_usage("uuid-b", &usage_response(10.0, 40.0, 70.0, 80.0))
            .await
            .unwrap();

        let selector = selector(&store, &dir).await;
        let decision = selector.select_optimal(&dry_run()).await.unwrap();
        assert_eq!(decision.account().uuid, "uuid-b");
        assert!(!decision.reused);
        assert_eq!(decision.candidate.window.label(), "overall");
    }

    #[tokio::test]
    async fn test_all_exhausted_errors() {
        let (store, dir) = open_store().await;
        store
            .save_account(&profile("uuid-a", "a@example.com"), &credentials("a"), None)
            .await
            .unwrap();
        store
            .save_usage("uuid-a", &usage_response(10.0, 100.0, 99.5, 80.0))
            .await
            .unwrap();

        let selector = selector(&store, &dir).await;
        let err = selector.select_optimal(&dry_run()).await.unwrap_err();
        match err {
            SwitcherError::NoAccountsAvailable(msg) => assert!(msg.contains("exhausted")),
            other => panic!("expected NoAccountsAvailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_round_robin_rotates_near_ties() {
        let (store, dir) = open_store().await;
        for (uuid, email) in [
            ("uuid-a", "a@example.com"),
            ("uuid-b", "b@example.com"),
            ("uuid-c", "c@example.com"),
        ] {
            store
                .save_account(&profile(uuid, email), &credentials(uuid), None)
                .await
                .unwrap();
            store
                .save_usage(uuid, &usage_response(10.0, 50.0, 70.0, 100.0))
                .await
                .unwrap();
        }

        let selector = selector(&store, &dir).await;

        let mut picks = Vec::new();
        for _ in 0..4 {
            let decision = selector.select_optimal(&dry_run()).await.unwrap();
            picks.push(decision.account().uuid.clone());
        }

        // Indices 0,1,2 rotate in order and wrap, cursor persisted each pass.
        assert_eq!(picks, ["uuid-a", "uuid-b", "uuid-c", "uuid-a"]);
        assert_eq!(
            store.get_round_robin_last("overall").await.unwrap().as_deref(),
            Some("uuid-a")
        );
    }

    #[tokio::test]
    async fn test_idempotent_when_not_tied() {
        let (store, dir) = open_store().await;
        for (uuid, email, overall) in [
            ("uuid-a", "a@example.com", 20.0),
            ("uuid-b", "b@example.com", 80.0),
        ] {
            store
                .save_account(&profile(uuid, email), &credentials(uuid), None)
                .await
                .unwrap();
            store
                .save_usage(uuid, &usage_response(10.0, overall, 70.0, 100.0))
                .await
                .unwrap();
        }

        let selector = selector(&store, &dir).await;
        let first = selector.select_optimal(&dry_run()).await.unwrap();
        let second = selector.select_optimal(&dry_run()).await.unwrap();
        assert_eq!(first.account().uuid, "uuid-a");
        assert_eq!(second.account().uuid, "uuid-a");
        // No tie, so the cursor was never touched.
        assert!(store.get_round_robin_last("overall").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_round_robin_prefers_fewest_active_sessions() {
        let (store, dir) = open_store().await;
        for (uuid, email) in [("uuid-a", "a@example.com"), ("uuid-b", "b@example.com")] {
            store
                .save_account(&profile(uuid, email), &credentials(uuid), None)
                .await
                .unwrap();
            store
                .save_usage(uuid, &usage_response(10.0, 50.0, 70.0, 100.0))
                .await
                .unwrap();
        }

        // Give A an active session; the tie then resolves to B.
        let fingerprint = crate::store::sessions::SessionFingerprint {
            pid: i64::from(std::process::id()),
            proc_start_time: None,
            ..Default::default()
        };
        store.create_session("s1", &fingerprint).await.unwrap();
        store.assign_session_to_account("s1", "uuid-a").await.unwrap();

        let selector = selector(&store, &dir).await;
        let decision = selector.select_optimal(&dry_run()).await.unwrap();
        assert_eq!(decision.account().uuid, "uuid-b");
    }
}
