use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use tracing::info;

use crate::error::Result;
use crate::util;

// ---------------------------------------------------------------------------
// Migration framework
// ---------------------------------------------------------------------------

type MigrationFn = fn(&SqlitePool) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

struct Migration {
    version: i64,
    description: &'static str,
    migrate: MigrationFn,
}

/// Ordered list of all migrations. Each migration assumes all prior migrations
/// have already been applied. New migrations are appended at the end.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "initial schema: accounts, usage_history, sessions, round_robin_state",
    migrate: migrate_v1,
}];

/// Read the current schema version (0 if the table is empty).
async fn get_schema_version(pool: &SqlitePool) -> Result<i64> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT version FROM schema_version LIMIT 1")
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(v,)| v).unwrap_or(0))
}

/// Set the schema version (replace the single row).
async fn set_schema_version(pool: &SqlitePool, version: i64) -> Result<()> {
    sqlx::query("DELETE FROM schema_version")
        .execute(pool)
        .await?;
    sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

/// Run all pending migrations.
async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")
        .execute(pool)
        .await?;

    let mut current = get_schema_version(pool).await?;

    for migration in MIGRATIONS {
        if migration.version > current {
            info!(
                "Running migration v{}: {}",
                migration.version, migration.description
            );
            (migration.migrate)(pool).await?;
            set_schema_version(pool, migration.version).await?;
            current = migration.version;
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Migration v1 — accounts, usage history, sessions, round-robin state
// ---------------------------------------------------------------------------

fn migrate_v1(pool: &SqlitePool) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
    Box::pin(async move {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid TEXT UNIQUE NOT NULL,
                index_num INTEGER UNIQUE NOT NULL,
                nickname TEXT,
                email TEXT NOT NULL,
                full_name TEXT,
                display_name TEXT,
                has_claude_max INTEGER NOT NULL DEFAULT 0,
                has_claude_pro INTEGER NOT NULL DEFAULT 0,
                org_uuid TEXT,
                org_name TEXT,
                org_type TEXT,
                billing_type TEXT,
                rate_limit_tier TEXT,
                credentials_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS usage_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_uuid TEXT NOT NULL REFERENCES accounts(uuid),
                queried_at TEXT NOT NULL,
                five_hour_utilization REAL,
                five_hour_resets_at TEXT,
                seven_day_utilization REAL,
                seven_day_resets_at TEXT,
                seven_day_opus_utilization REAL,
                seven_day_opus_resets_at TEXT,
                raw_response TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_usage_account_queried \
             ON usage_history(account_uuid, queried_at DESC)",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                account_uuid TEXT REFERENCES accounts(uuid) ON DELETE SET NULL,
                pid INTEGER NOT NULL,
                parent_pid INTEGER,
                proc_start_time REAL,
                exe TEXT,
                cmdline TEXT,
                cwd TEXT,
                created_at TEXT NOT NULL,
                last_checked_alive TEXT NOT NULL,
                ended_at TEXT
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sessions_active_created \
             ON sessions(created_at DESC) WHERE ended_at IS NULL",
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_account ON sessions(account_uuid)")
            .execute(pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS round_robin_state (
                window TEXT PRIMARY KEY,
                last_account_uuid TEXT,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    })
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Open (creating if missing) the store database and run pending migrations.
///
/// The parent directory is created with owner-only permissions; the database
/// file itself ends up 0600. WAL journaling keeps readers concurrent with the
/// single writer, and the 5s busy timeout absorbs short write contention.
pub async fn init_db(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
        util::set_mode(parent, 0o700);
    }

    let opts = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(opts)
        .await?;

    run_migrations(&pool).await?;
    util::set_mode(path, 0o600);

    Ok(pool)
}
