use serde_json::json;

use super::AppContext;
use crate::error::Result;
use crate::models::Session;

/// Register a consumer session. Registration failures surface as a warning
/// only; they must never block selection.
pub async fn start_session(
    ctx: &AppContext,
    session_id: &str,
    pid: u32,
    parent_pid: Option<u32>,
    cwd: &str,
) -> Result<()> {
    match ctx.tracker().register(session_id, pid, parent_pid, cwd).await {
        Ok(session) => {
            eprintln!("Session {} registered (PID {})", session.session_id, session.pid);
        }
        Err(e) => {
            eprintln!("Warning: {e}");
        }
    }
    Ok(())
}

pub async fn end_session(ctx: &AppContext, session_id: &str) -> Result<()> {
    match ctx.store.get_session(session_id).await? {
        Some(session) if session.is_active() => {
            ctx.store.mark_session_ended(session_id).await?;
            eprintln!("Session {session_id} ended");
        }
        Some(_) => eprintln!("Session {session_id} was already ended"),
        None => eprintln!("Warning: no such session: {session_id}"),
    }
    Ok(())
}

/// List active sessions after a liveness sweep.
pub async fn sessions(ctx: &AppContext, json: bool) -> Result<()> {
    ctx.tracker().cleanup_dead_sessions().await?;
    let active = ctx.store.list_active_sessions().await?;

    if json {
        let mut entries = Vec::new();
        for session in &active {
            entries.push(json!({
                "session_id": session.session_id,
                "pid": session.pid,
                "account": account_label(ctx, session).await?,
                "created_at": session.created_at,
                "cwd": session.cwd,
            }));
        }
        println!("{}", serde_json::to_string_pretty(&entries).unwrap_or_default());
        return Ok(());
    }

    if active.is_empty() {
        eprintln!("No active sessions");
        return Ok(());
    }

    eprintln!("{:<38} {:<8} {:<32} {}", "SESSION", "PID", "ACCOUNT", "STARTED");
    for session in &active {
        eprintln!(
            "{:<38} {:<8} {:<32} {}",
            session.session_id,
            session.pid,
            account_label(ctx, session).await?.unwrap_or_else(|| "--".into()),
            session.created_at,
        );
    }
    Ok(())
}

/// Ended sessions of meaningful duration, newest first, with the opus
/// utilization consumed across each session when history allows.
pub async fn session_history(
    ctx: &AppContext,
    limit: i64,
    min_duration: i64,
    json: bool,
) -> Result<()> {
    let history = ctx.store.get_session_history(min_duration, limit).await?;

    if json {
        let mut entries = Vec::new();
        for session in &history {
            entries.push(json!({
                "session_id": session.session_id,
                "account": account_label(ctx, session).await?,
                "created_at": session.created_at,
                "ended_at": session.ended_at,
                "duration_seconds": session.duration_seconds(),
                "opus_delta": opus_delta(ctx, session).await?,
            }));
        }
        println!("{}", serde_json::to_string_pretty(&entries).unwrap_or_default());
        return Ok(());
    }

    if history.is_empty() {
        eprintln!("No session history");
        return Ok(());
    }

    eprintln!(
        "{:<38} {:<32} {:<10} {}",
        "SESSION", "ACCOUNT", "DURATION", "OPUS Δ"
    );
    for session in &history {
        let duration = session
            .duration_seconds()
            .map(format_duration)
            .unwrap_or_else(|| "--".into());
        let delta = opus_delta(ctx, session)
            .await?
            .map(|d| format!("{d:+.0}%"))
            .unwrap_or_else(|| "--".into());
        eprintln!(
            "{:<38} {:<32} {:<10} {}",
            session.session_id,
            account_label(ctx, session).await?.unwrap_or_else(|| "--".into()),
            duration,
            delta,
        );
    }
    Ok(())
}

async fn account_label(ctx: &AppContext, session: &Session) -> Result<Option<String>> {
    let Some(uuid) = session.account_uuid.as_deref() else {
        return Ok(None);
    };
    Ok(ctx
        .store
        .get_account_by_uuid(uuid)
        .await?
        .map(|a| a.email.clone()))
}

/// Opus utilization consumed across a session, estimated from the nearest
/// snapshots bracketing it.
async fn opus_delta(ctx: &AppContext, session: &Session) -> Result<Option<f64>> {
    let Some(uuid) = session.account_uuid.as_deref() else {
        return Ok(None);
    };
    let Some(ended_at) = session.ended_at.as_deref() else {
        return Ok(None);
    };

    let before = ctx.store.get_usage_before(uuid, &session.created_at).await?;
    let after = ctx.store.get_usage_after(uuid, ended_at).await?;

    let (Some((before, _)), Some((after, _))) = (before, after) else {
        return Ok(None);
    };
    let before_opus = before.seven_day_opus.and_then(|w| w.utilization);
    let after_opus = after.seven_day_opus.and_then(|w| w.utilization);

    match (before_opus, after_opus) {
        (Some(before), Some(after)) => Ok(Some(after - before)),
        _ => Ok(None),
    }
}

fn format_duration(seconds: f64) -> String {
    let total = seconds as i64;
    if total >= 3600 {
        format!("{}h{}m", total / 3600, (total % 3600) / 60)
    } else if total >= 60 {
        format!("{}m{}s", total / 60, total % 60)
    } else {
        format!("{total}s")
    }
}
