use std::path::Path;

use serde_json::json;

use super::AppContext;
use crate::credentials::CredentialStore;
use crate::error::{Result, SwitcherError};
use crate::models::Account;
use crate::util;

/// Register a new account (or update an existing one) from a credentials
/// file, defaulting to the live consumer credential file.
pub async fn add(
    ctx: &AppContext,
    nickname: Option<&str>,
    creds_file: Option<&Path>,
) -> Result<()> {
    let credentials_json = match creds_file {
        Some(path) => std::fs::read_to_string(path)?,
        None => {
            let path = ctx.config.credentials_path();
            std::fs::read_to_string(&path).map_err(|_| {
                SwitcherError::InvalidCredentials(format!(
                    "{} not found; pass --creds-file",
                    path.display()
                ))
            })?
        }
    };

    ctx.credentials.parse_credentials(&credentials_json)?;
    let refreshed = ctx
        .credentials
        .refresh_access_token(&credentials_json, false)
        .await?;
    let token = CredentialStore::access_token(&refreshed)
        .ok_or_else(|| SwitcherError::InvalidCredentials("no access token available".into()))?
        .to_string();

    let profile = ctx.api.get_profile(&token).await?;
    let (account, is_new) = ctx
        .store
        .save_account(&profile, &refreshed, nickname)
        .await?;

    eprintln!(
        "Account {}: [{}] {} ({})",
        if is_new { "added" } else { "updated" },
        account.index_num,
        account.email,
        account.plan_label(),
    );
    if let Some(nickname) = &account.nickname {
        eprintln!("  Nickname: {nickname}");
    }
    Ok(())
}

/// List all accounts, ordered by index.
pub async fn ls(ctx: &AppContext, json: bool) -> Result<()> {
    let accounts = ctx.store.list_accounts().await?;

    if json {
        let entries: Vec<_> = accounts
            .iter()
            .map(|acc| {
                json!({
                    "index": acc.index_num,
                    "uuid": acc.uuid,
                    "nickname": acc.nickname,
                    "email": acc.email,
                    "full_name": acc.full_name,
                    "display_name": acc.display_name,
                    "has_claude_max": acc.has_claude_max,
                    "has_claude_pro": acc.has_claude_pro,
                    "org_type": acc.org_type,
                    "rate_limit_tier": acc.rate_limit_tier,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries).unwrap_or_default());
        return Ok(());
    }

    if accounts.is_empty() {
        eprintln!("No accounts found. Add one with 'c2switcher add'");
        return Ok(());
    }

    eprintln!(
        "{:<6} {:<14} {:<32} {:<6} {}",
        "INDEX", "NICKNAME", "EMAIL", "PLAN", "TIER"
    );
    for acc in &accounts {
        eprintln!(
            "{:<6} {:<14} {:<32} {:<6} {}",
            acc.index_num,
            acc.nickname.as_deref().unwrap_or("--"),
            acc.email,
            acc.plan_label(),
            acc.rate_limit_tier.as_deref().unwrap_or("--"),
        );
    }
    Ok(())
}

/// Resolve the account the consumer credential file currently belongs to:
/// the sidecar UUID first, then access-token equality for pre-sidecar
/// installs.
pub(crate) async fn resolve_current_account(ctx: &AppContext) -> Result<Option<Account>> {
    if let Some(uuid) = ctx.credentials.read_current_account()
        && let Some(account) = ctx.store.get_account_by_uuid(&uuid).await?
    {
        return Ok(Some(account));
    }

    let Some(creds) = ctx.credentials.read_credentials_file()? else {
        return Ok(None);
    };
    let Some(token) = CredentialStore::access_token(&creds).map(str::to_owned) else {
        return Ok(None);
    };

    for account in ctx.store.list_accounts().await? {
        let Ok(stored) = ctx.credentials.parse_credentials(&account.credentials_json) else {
            continue;
        };
        if CredentialStore::access_token(&stored) == Some(token.as_str()) {
            return Ok(Some(account));
        }
    }
    Ok(None)
}

/// Show the account currently materialized in the credential file.
pub async fn current(ctx: &AppContext, json: bool) -> Result<()> {
    let Some(account) = resolve_current_account(ctx).await? else {
        if json {
            println!("{}", json!({"error": "Current account not found in database"}));
        } else {
            eprintln!("Current account not found in database");
            eprintln!("→ Run 'c2switcher add' to add this account");
        }
        return Ok(());
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "index": account.index_num,
                "uuid": account.uuid,
                "nickname": account.nickname,
                "email": account.email,
                "full_name": account.full_name,
                "display_name": account.display_name,
            }))
            .unwrap_or_default()
        );
    } else {
        eprintln!("Current account (={})", account.index_num);
        eprintln!("  Nickname: {}", account.nickname.as_deref().unwrap_or("--"));
        eprintln!("  Email: {}", account.masked_email());
        eprintln!(
            "  Name: {}",
            account
                .display_name
                .as_deref()
                .or(account.full_name.as_deref())
                .unwrap_or("--")
        );
    }
    Ok(())
}

/// Unconditionally refresh tokens for one account, or the whole fleet.
pub async fn force_refresh(ctx: &AppContext, identifier: Option<&str>) -> Result<()> {
    let accounts = match identifier {
        Some(identifier) => {
            let account = ctx
                .store
                .get_account_by_identifier(identifier)
                .await?
                .ok_or_else(|| SwitcherError::AccountNotFound(identifier.to_string()))?;
            vec![account]
        }
        None => ctx.store.list_accounts().await?,
    };

    if accounts.is_empty() {
        eprintln!("No accounts to refresh");
        return Ok(());
    }

    eprintln!("Force refreshing {} account(s)...", accounts.len());

    for account in &accounts {
        let label = format!("[{}] {}", account.index_num, account.display_identifier());
        match ctx
            .credentials
            .refresh_access_token(&account.credentials_json, true)
            .await
        {
            Ok(refreshed) => {
                ctx.store.update_credentials(&account.uuid, &refreshed).await?;
                let expires_at = refreshed["claudeAiOauth"]["expiresAt"].as_i64().unwrap_or(0);
                let expires_in_hours =
                    (expires_at - util::now_millis()) as f64 / 1000.0 / 3600.0;
                eprintln!("✓ {label} - expires in {expires_in_hours:.1}h");
            }
            Err(e) => eprintln!("✗ {label} - {e}"),
        }
    }
    Ok(())
}
