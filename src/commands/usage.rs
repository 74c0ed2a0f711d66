use serde_json::json;

use super::AppContext;
use crate::constants::CACHE_TTL_SECONDS;
use crate::error::Result;
use crate::models::{UsageSnapshot, UsageWindow};
use crate::util;

/// Show per-account usage across the three limit windows. Cached snapshots
/// are used under the TTL unless `force` demands live readings.
pub async fn usage(ctx: &AppContext, json: bool, force: bool) -> Result<()> {
    let accounts = ctx.store.list_accounts().await?;

    if accounts.is_empty() {
        if json {
            println!("[]");
        } else {
            eprintln!("No accounts found. Add one with 'c2switcher add'");
        }
        return Ok(());
    }

    // Partition into cached and to-fetch, then fetch the rest in parallel.
    let mut snapshots: Vec<(usize, Option<UsageSnapshot>)> = Vec::new();
    let mut missing = Vec::new();
    for (i, account) in accounts.iter().enumerate() {
        let cached = if force {
            None
        } else {
            ctx.store
                .get_recent_usage(&account.uuid, CACHE_TTL_SECONDS, false)
                .await?
        };
        if cached.is_none() {
            missing.push(account.clone());
        }
        snapshots.push((i, cached));
    }

    if !missing.is_empty() {
        let selector = ctx.selector();
        let fetched = selector.fetch_usage_batch(&missing, "usage").await;
        for (i, slot) in snapshots.iter_mut() {
            if slot.is_none() {
                *slot = fetched.get(&accounts[*i].uuid).cloned();
            }
        }
    }

    if json {
        let entries: Vec<_> = snapshots
            .iter()
            .map(|(i, snapshot)| {
                let account = &accounts[*i];
                match snapshot {
                    Some(s) => json!({
                        "index": account.index_num,
                        "email": account.email,
                        "nickname": account.nickname,
                        "five_hour": s.five_hour,
                        "seven_day": s.seven_day,
                        "seven_day_opus": s.seven_day_opus,
                        "cache_source": s.cache_source.to_string(),
                        "cache_age_seconds": s.cache_age_seconds,
                    }),
                    None => json!({
                        "index": account.index_num,
                        "email": account.email,
                        "nickname": account.nickname,
                        "error": "usage unavailable",
                    }),
                }
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries).unwrap_or_default());
        return Ok(());
    }

    for (i, snapshot) in &snapshots {
        let account = &accounts[*i];
        eprintln!(
            "[{}] {} ({})",
            account.index_num,
            account.display_identifier(),
            account.plan_label()
        );

        match snapshot {
            Some(s) => {
                eprintln!("  5h:      {}", format_window(&s.five_hour));
                eprintln!("  7d:      {}", format_window(&s.seven_day));
                eprintln!("  7d opus: {}", format_window(&s.seven_day_opus));
                eprintln!("  ({}, {:.0}s old)", s.cache_source, s.cache_age_seconds);
            }
            None => eprintln!("  usage unavailable"),
        }
    }
    Ok(())
}

fn format_window(window: &UsageWindow) -> String {
    let utilization = window
        .utilization
        .map(|u| format!("{u:.0}%"))
        .unwrap_or_else(|| "--".into());
    match window.resets_at.as_deref().and_then(util::parse_timestamp) {
        Some(reset) => {
            let remaining = (reset - chrono::Utc::now()).num_seconds();
            format!("{utilization:<5} resets in {}", format_remaining(remaining))
        }
        None => utilization,
    }
}

fn format_remaining(seconds: i64) -> String {
    if seconds <= 0 {
        return "expired".into();
    }
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3600;
    let minutes = (seconds % 3600) / 60;
    if days > 0 {
        format!("{days}d{hours}h")
    } else if hours > 0 {
        format!("{hours}h{minutes}m")
    } else {
        format!("{minutes}m")
    }
}
