use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};

/// Current time in epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Current time as a fixed-width RFC-3339 UTC string.
///
/// All repository timestamps use this format so lexicographic comparison in
/// SQL matches chronological order.
pub fn now_rfc3339() -> String {
    to_rfc3339(Utc::now())
}

pub fn to_rfc3339(ts: DateTime<Utc>) -> String {
    // Millisecond precision keeps the strings compatible with SQLite's
    // date functions (julianday and friends).
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored or API-supplied timestamp, tolerating a trailing `Z`.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Age in seconds of an RFC-3339 timestamp, clamped at zero.
pub fn age_seconds(value: &str) -> Option<f64> {
    let ts = parse_timestamp(value)?;
    Some((Utc::now() - ts).num_milliseconds().max(0) as f64 / 1000.0)
}

#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) {
    use std::fs::Permissions;
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, Permissions::from_mode(mode));
}

#[cfg(not(unix))]
pub fn set_mode(_path: &Path, _mode: u32) {}

/// Mask an email keeping the first two and last two letters of the local part.
pub fn mask_email(email: &str) -> String {
    let Some((local, domain)) = email.split_once('@') else {
        return email.to_string();
    };

    if local.chars().count() <= 4 {
        let mut chars = local.chars();
        let first = chars.next();
        let last = chars.next_back();
        return match (first, last) {
            (Some(f), Some(l)) => format!("{f}***{l}@{domain}"),
            _ => format!("{local}@{domain}"),
        };
    }

    let chars: Vec<char> = local.chars().collect();
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    let stars = "*".repeat(chars.len() - 4);
    format!("{head}{stars}{tail}@{domain}")
}
