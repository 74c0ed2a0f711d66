use std::time::Duration;

/// Anthropic API URL for subscription usage (OAuth)
pub const ANTHROPIC_USAGE_URL: &str = "https://api.anthropic.com/api/oauth/usage";

/// Anthropic API URL for the OAuth profile (account metadata, plan detection)
pub const ANTHROPIC_PROFILE_URL: &str = "https://api.anthropic.com/api/oauth/profile";

/// Anthropic OAuth token endpoint (refresh_token grant)
pub const OAUTH_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";

/// Fixed OAuth client id used by the Claude CLI
pub const OAUTH_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

/// Anthropic API version header value
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// OAuth beta features header value (matches Claude Code 2.1.32)
pub const OAUTH_BETA_HEADER: &str = "claude-code-20250219,oauth-2025-04-20,interleaved-thinking-2025-05-14,fine-grained-tool-streaming-2025-05-14";

/// User agent string for OAuth requests (mimics Claude CLI)
pub const USER_AGENT: &str = "claude-cli/2.1.32 (external, cli)";

/// Connect timeout for profile/usage calls
pub const API_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Total request timeout for profile/usage calls
pub const API_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Request timeout for the token refresh call
pub const TOKEN_REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

/// Access tokens are refreshed this long before their stored expiry (ms)
pub const TOKEN_REFRESH_BUFFER_MS: i64 = 600_000;

/// Token expiry assumed when the refresh response omits expires_in (seconds)
pub const DEFAULT_TOKEN_EXPIRES_IN_SECS: i64 = 3600;

/// Retries for the usage endpoint when every window comes back null
pub const USAGE_NULL_RETRIES: u32 = 3;

/// Accept a cached usage snapshot up to this old during selection (seconds)
pub const CACHE_TTL_SECONDS: i64 = 300;

/// Force a live refresh when the cache is older than this (seconds)
pub const STALE_CACHE_SECONDS: f64 = 60.0;

/// Priority score (%/hour) that warrants a fresh usage pull past 10s of cache
pub const HIGH_PRIORITY_REFRESH_THRESHOLD: f64 = 1.0;

/// Oldest non-null snapshot accepted when the API keeps returning nulls (seconds)
pub const USAGE_FALLBACK_MAX_AGE_SECONDS: i64 = 86_400;

/// Utilization at or above which a weekly window counts as exhausted
pub const EXHAUSTED_THRESHOLD: f64 = 99.0;

/// %/hour margin within which candidates are considered interchangeable
pub const SIMILAR_DRAIN_THRESHOLD: f64 = 0.05;

/// Tiered multiplicative penalties on priority by 5h utilization;
/// first matching threshold wins.
pub const FIVE_HOUR_PENALTIES: &[(f64, f64)] = &[(90.0, 0.5), (85.0, 0.7), (80.0, 0.85)];

/// Avoid rotating onto accounts above this 5h utilization when possible
pub const FIVE_HOUR_ROTATION_CAP: f64 = 90.0;

/// Mark candidates burst-blocked when utilization + expected burst reaches this
pub const BURST_THRESHOLD: f64 = 94.0;

/// Fallback burst estimate when usage history is sparse (percent)
pub const DEFAULT_BURST_BUFFER: f64 = 4.0;

/// Percentile of successive usage deltas used as the burst estimate
pub const BURST_PERCENTILE: f64 = 95.0;

/// Usage rows consulted for the burst percentile
pub const BURST_HISTORY_LIMIT: i64 = 25;

/// Length of the weekly limit windows, also the null-reset fallback horizon
pub const WINDOW_LENGTH_HOURS: f64 = 168.0;

/// Pace alignment gain (%/hour per % of pace gap per hour left)
pub const PACE_GAIN: f64 = 1.0;

/// Damping applied to the pace adjustment when ahead of schedule
pub const PACE_AHEAD_DAMPING: f64 = 0.5;

/// Absolute cap on the pace adjustment (%/hour)
pub const MAX_PACE_ADJUSTMENT: f64 = 4.0;

/// Opus utilization from which pace alignment kicks in
pub const PACE_OPUS_GATE: f64 = 90.0;

/// Opus utilization from which the flat high-opus penalty applies
pub const HIGH_OPUS_PENALTY_THRESHOLD: f64 = 95.0;

/// Flat penalty subtracted from priority for hot opus windows (%/hour)
pub const HIGH_OPUS_PENALTY: f64 = 2.0;

/// Opus utilization below which the low-usage bonus may fire
pub const LOW_USAGE_OPUS_CEILING: f64 = 85.0;

/// Chosen-window utilization below which the low-usage bonus may fire
pub const LOW_USAGE_WINDOW_CEILING: f64 = 60.0;

/// Utilization floor used when normalizing the low-usage bonus
pub const LOW_USAGE_FLOOR: f64 = 20.0;

/// Maximum low-usage bonus (%/hour)
pub const LOW_USAGE_MAX_BONUS: f64 = 5.0;

/// Upper bound on concurrent usage fetches during selection
pub const MAX_PARALLEL_FETCHES: usize = 10;

/// Sessions created within this many minutes count as "recent"
pub const RECENT_SESSION_MINUTES: i64 = 5;

/// Minimum seconds between dead-session sweeps
pub const CLEANUP_INTERVAL_SECS: u64 = 30;

/// Total time to wait for the process lock before giving up
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay between lock acquisition attempts
pub const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);
