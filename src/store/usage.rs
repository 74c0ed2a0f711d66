use chrono::{Duration, Utc};

use super::Store;
use crate::api::UsageResponse;
use crate::constants::{BURST_HISTORY_LIMIT, BURST_PERCENTILE, DEFAULT_BURST_BUFFER};
use crate::error::{Result, SwitcherError};
use crate::models::{CacheSource, UsageSnapshot};
use crate::util;

impl Store {
    /// Append a usage snapshot to the history. Snapshots are never updated.
    pub async fn save_usage(&self, account_uuid: &str, response: &UsageResponse) -> Result<()> {
        self.save_usage_at(account_uuid, response, &util::now_rfc3339())
            .await
    }

    pub(crate) async fn save_usage_at(
        &self,
        account_uuid: &str,
        response: &UsageResponse,
        queried_at: &str,
    ) -> Result<()> {
        let raw = serde_json::to_string(response)
            .map_err(|e| SwitcherError::Database(format!("Failed to serialize usage: {e}")))?;
        let five_hour = response.five_hour.clone().unwrap_or_default();
        let seven_day = response.seven_day.clone().unwrap_or_default();
        let seven_day_opus = response.seven_day_opus.clone().unwrap_or_default();

        sqlx::query(
            r#"
            INSERT INTO usage_history (
                account_uuid, queried_at,
                five_hour_utilization, five_hour_resets_at,
                seven_day_utilization, seven_day_resets_at,
                seven_day_opus_utilization, seven_day_opus_resets_at,
                raw_response
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(account_uuid)
        .bind(queried_at)
        .bind(five_hour.utilization)
        .bind(&five_hour.resets_at)
        .bind(seven_day.utilization)
        .bind(&seven_day.resets_at)
        .bind(seven_day_opus.utilization)
        .bind(&seven_day_opus.resets_at)
        .bind(&raw)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Newest snapshot within `max_age_seconds`, decorated with cache
    /// provenance and computed age. `require_data` skips rows where every
    /// window is null.
    pub async fn get_recent_usage(
        &self,
        account_uuid: &str,
        max_age_seconds: i64,
        require_data: bool,
    ) -> Result<Option<UsageSnapshot>> {
        let cutoff = util::to_rfc3339(Utc::now() - Duration::seconds(max_age_seconds));

        let sql = if require_data {
            "SELECT raw_response, queried_at FROM usage_history \
             WHERE account_uuid = ? AND queried_at > ? \
             AND (seven_day_utilization IS NOT NULL \
                  OR seven_day_opus_utilization IS NOT NULL \
                  OR five_hour_utilization IS NOT NULL) \
             ORDER BY queried_at DESC LIMIT 1"
        } else {
            "SELECT raw_response, queried_at FROM usage_history \
             WHERE account_uuid = ? AND queried_at > ? \
             ORDER BY queried_at DESC LIMIT 1"
        };

        let row: Option<(String, String)> = sqlx::query_as(sql)
            .bind(account_uuid)
            .bind(&cutoff)
            .fetch_optional(self.pool())
            .await?;

        let Some((raw, queried_at)) = row else {
            return Ok(None);
        };

        let response: UsageResponse = serde_json::from_str(&raw)
            .map_err(|e| SwitcherError::Database(format!("Corrupt usage row: {e}")))?;
        let cache_age = util::age_seconds(&queried_at).unwrap_or(0.0);

        Ok(Some(response.into_snapshot(
            account_uuid,
            queried_at,
            CacheSource::Cache,
            cache_age,
        )))
    }

    /// Burst estimate: the p95 of absolute successive deltas across the two
    /// weekly windows, over the last 25 snapshots. Sparse history falls back
    /// to a flat default.
    pub async fn burst_percentile(&self, account_uuid: &str) -> Result<f64> {
        let rows: Vec<(Option<f64>, Option<f64>)> = sqlx::query_as(
            "SELECT seven_day_utilization, seven_day_opus_utilization \
             FROM usage_history WHERE account_uuid = ? \
             ORDER BY queried_at DESC LIMIT ?",
        )
        .bind(account_uuid)
        .bind(BURST_HISTORY_LIMIT)
        .fetch_all(self.pool())
        .await?;

        if rows.len() < 2 {
            return Ok(DEFAULT_BURST_BUFFER);
        }

        let mut deltas: Vec<f64> = Vec::new();
        let mut prev_overall: Option<f64> = None;
        let mut prev_opus: Option<f64> = None;

        for (overall, opus) in rows {
            if let (Some(prev), Some(cur)) = (prev_overall, overall) {
                deltas.push((prev - cur).abs());
            }
            if let (Some(prev), Some(cur)) = (prev_opus, opus) {
                deltas.push((prev - cur).abs());
            }
            prev_overall = overall.or(prev_overall);
            prev_opus = opus.or(prev_opus);
        }

        if deltas.is_empty() {
            return Ok(DEFAULT_BURST_BUFFER);
        }

        deltas.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        Ok(percentile(&deltas, BURST_PERCENTILE))
    }

    /// Latest snapshot at or before `timestamp`.
    pub async fn get_usage_before(
        &self,
        account_uuid: &str,
        timestamp: &str,
    ) -> Result<Option<(UsageResponse, String)>> {
        self.usage_adjacent(account_uuid, timestamp, "<=", "DESC")
            .await
    }

    /// Earliest snapshot at or after `timestamp`.
    pub async fn get_usage_after(
        &self,
        account_uuid: &str,
        timestamp: &str,
    ) -> Result<Option<(UsageResponse, String)>> {
        self.usage_adjacent(account_uuid, timestamp, ">=", "ASC")
            .await
    }

    async fn usage_adjacent(
        &self,
        account_uuid: &str,
        timestamp: &str,
        cmp: &str,
        order: &str,
    ) -> Result<Option<(UsageResponse, String)>> {
        let sql = format!(
            "SELECT raw_response, queried_at FROM usage_history \
             WHERE account_uuid = ? AND queried_at {cmp} ? \
             ORDER BY queried_at {order} LIMIT 1"
        );
        let row: Option<(String, String)> = sqlx::query_as(&sql)
            .bind(account_uuid)
            .bind(timestamp)
            .fetch_optional(self.pool())
            .await?;

        match row {
            Some((raw, queried_at)) => {
                let response: UsageResponse = serde_json::from_str(&raw)
                    .map_err(|e| SwitcherError::Database(format!("Corrupt usage row: {e}")))?;
                Ok(Some((response, queried_at)))
            }
            None => Ok(None),
        }
    }
}

/// Linear interpolation percentile over a sorted slice.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    let pct = pct.clamp(0.0, 100.0);
    let pos = pct / 100.0 * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = (lower + 1).min(sorted.len() - 1);
    if lower == upper {
        return sorted[lower];
    }
    let frac = pos - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * frac
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::models::UsageWindow;

    fn response(five_hour: Option<f64>, overall: Option<f64>, opus: Option<f64>) -> UsageResponse {
        let window = |util: Option<f64>| {
            util.map(|u| UsageWindow {
                utilization: Some(u),
                resets_at: Some(crate::util::to_rfc3339(
                    Utc::now() + Duration::hours(100),
                )),
            })
        };
        UsageResponse {
            five_hour: window(five_hour),
            seven_day: window(overall),
            seven_day_opus: window(opus),
            extra: Default::default(),
        }
    }

    async fn seeded_store() -> (crate::store::Store, tempfile::TempDir) {
        let (store, dir) = open_store().await;
        store
            .save_account(&profile("uuid-a", "a@example.com"), &credentials("tok-a"), None)
            .await
            .unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_recent_usage_respects_age_window() {
        let (store, _dir) = seeded_store().await;

        let old = util::to_rfc3339(Utc::now() - Duration::seconds(400));
        store
            .save_usage_at("uuid-a", &response(Some(10.0), Some(20.0), Some(30.0)), &old)
            .await
            .unwrap();

        assert!(
            store
                .get_recent_usage("uuid-a", 300, false)
                .await
                .unwrap()
                .is_none()
        );

        let snapshot = store
            .get_recent_usage("uuid-a", 600, false)
            .await
            .unwrap()
            .expect("within window");
        assert_eq!(snapshot.cache_source, CacheSource::Cache);
        assert!(snapshot.cache_age_seconds > 395.0);
        assert_eq!(snapshot.seven_day.utilization, Some(20.0));
    }

    #[tokio::test]
    async fn test_recent_usage_require_data_skips_null_rows() {
        let (store, _dir) = seeded_store().await;

        let earlier = util::to_rfc3339(Utc::now() - Duration::seconds(120));
        store
            .save_usage_at("uuid-a", &response(Some(5.0), Some(42.0), Some(7.0)), &earlier)
            .await
            .unwrap();
        store
            .save_usage("uuid-a", &response(None, None, None))
            .await
            .unwrap();

        // Plain lookup returns the newest (all-null) row.
        let latest = store
            .get_recent_usage("uuid-a", 300, false)
            .await
            .unwrap()
            .unwrap();
        assert!(latest.seven_day.utilization.is_none());

        // require_data falls back past the null row.
        let with_data = store
            .get_recent_usage("uuid-a", 300, true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(with_data.seven_day.utilization, Some(42.0));
    }

    #[tokio::test]
    async fn test_burst_percentile_sparse_history_uses_default() {
        let (store, _dir) = seeded_store().await;
        assert_eq!(store.burst_percentile("uuid-a").await.unwrap(), 4.0);

        store
            .save_usage("uuid-a", &response(Some(1.0), Some(10.0), Some(5.0)))
            .await
            .unwrap();
        assert_eq!(store.burst_percentile("uuid-a").await.unwrap(), 4.0);
    }

    #[tokio::test]
    async fn test_burst_percentile_interpolates_deltas() {
        let (store, _dir) = seeded_store().await;

        // Overall walks 10 → 12 → 15, opus stays flat: deltas {2, 3, 0, 0}.
        let base = Utc::now() - Duration::seconds(30);
        for (i, overall) in [10.0, 12.0, 15.0].iter().enumerate() {
            let at = util::to_rfc3339(base + Duration::seconds(i as i64));
            store
                .save_usage_at("uuid-a", &response(Some(1.0), Some(*overall), Some(50.0)), &at)
                .await
                .unwrap();
        }

        let p95 = store.burst_percentile("uuid-a").await.unwrap();
        // sorted deltas [0, 0, 2, 3], p95 lands between 2 and 3
        assert!(p95 > 2.0 && p95 <= 3.0, "got {p95}");
    }

    #[test]
    fn test_percentile_interpolation() {
        let sorted = [0.0, 0.0, 2.0, 3.0];
        assert!((percentile(&sorted, 95.0) - 2.85).abs() < 1e-9);
        assert_eq!(percentile(&sorted, 0.0), 0.0);
        assert_eq!(percentile(&sorted, 100.0), 3.0);
        assert_eq!(percentile(&[5.0], 95.0), 5.0);
    }

    #[tokio::test]
    async fn test_usage_before_and_after() {
        let (store, _dir) = seeded_store().await;

        let t0 = util::to_rfc3339(Utc::now() - Duration::seconds(100));
        let t1 = util::to_rfc3339(Utc::now() - Duration::seconds(50));
        store
            .save_usage_at("uuid-a", &response(None, Some(10.0), None), &t0)
            .await
            .unwrap();
        store
            .save_usage_at("uuid-a", &response(None, Some(30.0), None), &t1)
            .await
            .unwrap();

        let mid = util::to_rfc3339(Utc::now() - Duration::seconds(75));
        let (before, _) = store.get_usage_before("uuid-a", &mid).await.unwrap().unwrap();
        let (after, _) = store.get_usage_after("uuid-a", &mid).await.unwrap().unwrap();
        assert_eq!(before.seven_day.unwrap().utilization, Some(10.0));
        assert_eq!(after.seven_day.unwrap().utilization, Some(30.0));
    }
}
