use serde_json::json;

use super::AppContext;
use super::accounts::resolve_current_account;
use crate::balancer::{SelectOptions, SelectionDecision};
use crate::credentials::CredentialStore;
use crate::error::{Result, SwitcherError};

/// Run a load-balanced selection and (unless dry-run) switch to the winner.
pub async fn optimal(
    ctx: &AppContext,
    opts: SelectOptions,
    quiet: bool,
    json: bool,
    verbose: bool,
) -> Result<()> {
    let decision = ctx.selector().select_optimal(&opts).await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&decision.to_json()).unwrap_or_default()
        );
        return Ok(());
    }

    if opts.token_only {
        let creds = ctx
            .credentials
            .parse_credentials(&decision.account().credentials_json)?;
        let token = CredentialStore::access_token(&creds)
            .ok_or_else(|| SwitcherError::TokenUnavailable("no access token".into()))?;
        println!("{token}");
    }

    if !quiet {
        print_decision(&decision, opts.dry_run, verbose);
    }
    Ok(())
}

fn print_decision(decision: &SelectionDecision, dry_run: bool, verbose: bool) {
    let c = &decision.candidate;
    let account = &c.account;

    let mut headline = format!(
        "Optimal account (={}) - Tier {}",
        account.index_num, c.tier
    );
    if decision.reused {
        headline.push_str(" (reused session assignment)");
    } else if dry_run {
        headline.push_str(" (dry run)");
    }
    eprintln!("{headline}");

    eprintln!("  Nickname: {}", account.nickname.as_deref().unwrap_or("--"));
    eprintln!("  Email: {}", account.masked_email());
    eprintln!(
        "  Window: {} | usage {:.0}% | opus {} | overall {}",
        c.window.label(),
        c.utilization,
        c.usage
            .seven_day_opus
            .utilization
            .map(|u| format!("{u:.0}%"))
            .unwrap_or_else(|| "--".into()),
        c.usage
            .seven_day
            .utilization
            .map(|u| format!("{u:.0}%"))
            .unwrap_or_else(|| "--".into()),
    );

    if verbose {
        eprintln!(
            "  headroom={:.1} hours_to_reset={:.1} drain={:.3}%/h",
            c.headroom, c.hours_to_reset, c.drain_rate
        );
        eprintln!(
            "  pace: expected={:.1} gap={:+.1} adjustment={:+.3}%/h",
            c.expected_utilization, c.pace_gap, c.pace_adjustment
        );
        eprintln!(
            "  bonus={:+.3} opus_penalty={:.1} priority={:.3} five_hour_factor={:.2} adjusted={:.3}",
            c.low_usage_bonus, c.high_opus_penalty, c.priority_drain, c.five_hour_factor,
            c.adjusted_drain
        );
        eprintln!(
            "  five_hour={:.0}% burst={:.1} blocked={} sessions: active={} recent={}",
            c.five_hour_utilization,
            c.expected_burst,
            c.burst_blocked,
            c.active_sessions,
            c.recent_sessions
        );
        eprintln!(
            "  usage source: {} (age {:.0}s){}",
            c.usage.cache_source,
            c.usage.cache_age_seconds,
            if c.refreshed { ", refreshed" } else { "" }
        );
    }
}

/// Switch directly to a specific account.
pub async fn switch(
    ctx: &AppContext,
    identifier: &str,
    token_only: bool,
    json: bool,
) -> Result<()> {
    let account = ctx.selector().switch_to(identifier, token_only).await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "index": account.index_num,
                "uuid": account.uuid,
                "nickname": account.nickname,
                "email": account.email,
            }))
            .unwrap_or_default()
        );
        return Ok(());
    }

    if token_only {
        let creds = ctx.credentials.parse_credentials(&account.credentials_json)?;
        let token = CredentialStore::access_token(&creds)
            .ok_or_else(|| SwitcherError::TokenUnavailable("no access token".into()))?;
        println!("{token}");
        return Ok(());
    }

    eprintln!("Switched to account (={})", account.index_num);
    eprintln!("  Nickname: {}", account.nickname.as_deref().unwrap_or("--"));
    eprintln!("  Email: {}", account.masked_email());
    Ok(())
}

/// Switch to the next account in index order relative to the current one.
pub async fn cycle(ctx: &AppContext) -> Result<()> {
    let accounts = ctx.store.list_accounts().await?;

    if accounts.is_empty() {
        eprintln!("No accounts found. Add one with 'c2switcher add'");
        return Ok(());
    }
    if accounts.len() == 1 {
        eprintln!("Only one account available");
        return Ok(());
    }

    let next = match resolve_current_account(ctx).await? {
        Some(current) => accounts
            .iter()
            .position(|a| a.uuid == current.uuid)
            .map(|i| accounts[(i + 1) % accounts.len()].clone())
            .unwrap_or_else(|| accounts[0].clone()),
        None => accounts[0].clone(),
    };

    let account = ctx.selector().switch_to(&next.uuid, false).await?;
    eprintln!(
        "Switched to next account: [{}] {}",
        account.index_num,
        account
            .nickname
            .as_deref()
            .map(str::to_owned)
            .unwrap_or_else(|| account.masked_email())
    );
    Ok(())
}
