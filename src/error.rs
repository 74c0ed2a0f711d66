#[derive(Debug, thiserror::Error)]
pub enum SwitcherError {
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Token unavailable: {0}")]
    TokenUnavailable(String),

    #[error("Usage fetch failed: {0}")]
    UsageFetch(String),

    #[error("No accounts available: {0}")]
    NoAccountsAvailable(String),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Failed to register session: {0}")]
    SessionRegistration(String),

    #[error("{0}")]
    LockTimeout(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<sqlx::Error> for SwitcherError {
    fn from(err: sqlx::Error) -> Self {
        SwitcherError::Database(err.to_string())
    }
}

impl SwitcherError {
    /// Short remediation hint appended to human-readable output.
    /// JSON consumers get the bare error instead.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            SwitcherError::NoAccountsAvailable(_) => {
                Some("→ Run 'c2switcher add' to register an account")
            }
            SwitcherError::AccountNotFound(_) => {
                Some("→ Run 'c2switcher ls' to see available accounts")
            }
            SwitcherError::InvalidCredentials(_) | SwitcherError::TokenUnavailable(_) => {
                Some("→ Re-authenticate with Claude Code, then run 'c2switcher add'")
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SwitcherError>;
