mod api;
mod balancer;
mod commands;
mod config;
mod constants;
mod credentials;
mod db;
mod error;
mod lock;
mod models;
mod store;
mod tracker;
mod util;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use balancer::SelectOptions;
use commands::AppContext;
use config::Config;
use error::Result;

#[derive(Parser)]
#[command(name = "c2switcher")]
#[command(about = "Load-balance Claude Code across multiple subscription accounts")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register an account from a credentials file (default: the live
    /// ~/.claude/.credentials.json)
    Add {
        /// Optional nickname for the account
        #[arg(short, long)]
        nickname: Option<String>,
        /// Path to a credentials JSON file
        #[arg(short = 'f', long)]
        creds_file: Option<PathBuf>,
    },
    /// List all accounts
    Ls {
        #[arg(long)]
        json: bool,
    },
    /// Select the optimal account and switch the credential file to it
    Optimal {
        /// Score and report without switching
        #[arg(long)]
        dry_run: bool,
        /// Session ID for sticky assignment
        #[arg(long)]
        session_id: Option<String>,
        /// Refresh the token but leave the credential file alone; prints the
        /// access token to stdout
        #[arg(long)]
        token_only: bool,
        /// Suppress the human-readable summary
        #[arg(long)]
        quiet: bool,
        #[arg(long)]
        json: bool,
        /// Show detailed scoring metrics
        #[arg(short, long)]
        verbose: bool,
    },
    /// Switch to a specific account by index, nickname, email, or UUID
    Switch {
        identifier: String,
        /// Refresh the token without touching the credential file; prints
        /// the access token to stdout
        #[arg(long)]
        token_only: bool,
        #[arg(long)]
        json: bool,
    },
    /// Switch to the next account in index order
    Cycle,
    /// Unconditionally refresh tokens for one account, or all
    ForceRefresh { identifier: Option<String> },
    /// Register a consumer session for load-balancing stickiness
    StartSession {
        #[arg(long)]
        session_id: String,
        #[arg(long)]
        pid: u32,
        #[arg(long)]
        parent_pid: Option<u32>,
        #[arg(long)]
        cwd: String,
    },
    /// Mark a session ended
    EndSession {
        #[arg(long)]
        session_id: String,
    },
    /// List active sessions
    Sessions {
        #[arg(long)]
        json: bool,
    },
    /// Show ended sessions
    SessionHistory {
        #[arg(long, default_value_t = 50)]
        limit: i64,
        /// Hide sessions shorter than this many seconds
        #[arg(long, default_value_t = 5)]
        min_duration: i64,
        #[arg(long)]
        json: bool,
    },
    /// Show which account the credential file belongs to
    Current {
        #[arg(long)]
        json: bool,
    },
    /// Show usage for all accounts
    Usage {
        #[arg(long)]
        json: bool,
        /// Bypass the usage cache
        #[arg(long)]
        force: bool,
    },
}

impl Command {
    fn wants_json(&self) -> bool {
        match self {
            Command::Ls { json }
            | Command::Optimal { json, .. }
            | Command::Switch { json, .. }
            | Command::Sessions { json }
            | Command::SessionHistory { json, .. }
            | Command::Current { json }
            | Command::Usage { json, .. } => *json,
            _ => false,
        }
    }

    /// Whether this command performs read-modify-write against the store or
    /// the credential file and therefore needs the process lock.
    fn needs_lock(&self) -> bool {
        !matches!(
            self,
            Command::Ls { .. } | Command::Current { .. } | Command::SessionHistory { .. }
        )
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = Config::from_env();

    let default_filter = if config.debug_sessions {
        "c2switcher=debug"
    } else {
        "c2switcher=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let wants_json = cli.command.wants_json();
    let result = run(cli.command, config).await;
    lock::release_process_lock();

    if let Err(e) = result {
        if wants_json {
            println!("{}", serde_json::json!({ "error": e.to_string() }));
        } else {
            eprintln!("Error: {e}");
            if let Some(hint) = e.hint() {
                eprintln!("{hint}");
            }
        }
        std::process::exit(1);
    }
}

async fn run(command: Command, config: Config) -> Result<()> {
    if command.needs_lock() {
        lock::acquire_process_lock(&config)?;
    }

    let ctx = AppContext::init(config).await?;

    match command {
        Command::Add {
            nickname,
            creds_file,
        } => commands::accounts::add(&ctx, nickname.as_deref(), creds_file.as_deref()).await,
        Command::Ls { json } => commands::accounts::ls(&ctx, json).await,
        Command::Optimal {
            dry_run,
            session_id,
            token_only,
            quiet,
            json,
            verbose,
        } => {
            let opts = SelectOptions {
                session_id,
                token_only,
                dry_run,
            };
            commands::switching::optimal(&ctx, opts, quiet, json, verbose).await
        }
        Command::Switch {
            identifier,
            token_only,
            json,
        } => commands::switching::switch(&ctx, &identifier, token_only, json).await,
        Command::Cycle => commands::switching::cycle(&ctx).await,
        Command::ForceRefresh { identifier } => {
            commands::accounts::force_refresh(&ctx, identifier.as_deref()).await
        }
        Command::StartSession {
            session_id,
            pid,
            parent_pid,
            cwd,
        } => commands::sessions::start_session(&ctx, &session_id, pid, parent_pid, &cwd).await,
        Command::EndSession { session_id } => {
            commands::sessions::end_session(&ctx, &session_id).await
        }
        Command::Sessions { json } => commands::sessions::sessions(&ctx, json).await,
        Command::SessionHistory {
            limit,
            min_duration,
            json,
        } => commands::sessions::session_history(&ctx, limit, min_duration, json).await,
        Command::Current { json } => commands::accounts::current(&ctx, json).await,
        Command::Usage { json, force } => commands::usage::usage(&ctx, json, force).await,
    }
}
