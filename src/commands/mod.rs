pub mod accounts;
pub mod sessions;
pub mod switching;
pub mod usage;

use reqwest::Client;

use crate::api::ApiClient;
use crate::balancer::Selector;
use crate::config::Config;
use crate::constants::API_CONNECT_TIMEOUT;
use crate::credentials::CredentialStore;
use crate::db;
use crate::error::Result;
use crate::store::Store;
use crate::tracker::SessionTracker;

/// Shared wiring for command handlers: store, credential store, API client.
///
/// Human-readable output goes to stderr; stdout carries only tokens and
/// JSON so the tool composes in shell pipelines.
pub struct AppContext {
    pub config: Config,
    pub store: Store,
    pub credentials: CredentialStore,
    pub api: ApiClient,
}

impl AppContext {
    pub async fn init(config: Config) -> Result<Self> {
        let pool = db::init_db(&config.db_path()).await?;
        let store = Store::new(pool);
        store
            .migrate_legacy_round_robin_state(&config.legacy_state_path())
            .await?;

        let client = Client::builder()
            .connect_timeout(API_CONNECT_TIMEOUT)
            .pool_max_idle_per_host(10)
            .build()?;

        let credentials = CredentialStore::new(
            config.credentials_path(),
            config.current_account_path(),
            client.clone(),
        );
        let api = ApiClient::new(client);

        Ok(Self {
            config,
            store,
            credentials,
            api,
        })
    }

    pub fn tracker(&self) -> SessionTracker {
        SessionTracker::new(self.store.clone(), self.config.cleanup_marker_path())
    }

    pub fn selector(&self) -> Selector {
        Selector::new(
            self.store.clone(),
            self.credentials.clone(),
            self.api.clone(),
            self.tracker(),
            self.config.debug_balancer,
        )
    }
}
