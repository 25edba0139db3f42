use std::sync::Arc;
use std::time::Duration;

use pagewire_cache::Cache;

use crate::auth::{IdCipher, SecurityError};
use crate::config::AppConfig;
use crate::model::ZERO_SESSION;
use crate::stats::ConnectionStats;
use crate::store::Store;

/// Everything a connection or background task needs; cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub config: Arc<AppConfig>,
    pub cipher: IdCipher,
    pub stats: Arc<ConnectionStats>,
}

impl AppState {
    pub fn new(cache: Arc<dyn Cache>, config: AppConfig) -> Result<Self, SecurityError> {
        Ok(Self {
            store: Store::new(cache, config.limit_session_size_bytes),
            cipher: IdCipher::from_master_secret(&config.master_secret_key)?,
            config: Arc::new(config),
            stats: Arc::new(ConnectionStats::new()),
        })
    }

    /// Zero sessions back long-lived shared pages; every other session
    /// belongs to an app and expires sooner.
    pub fn session_lifetime(&self, session_id: &str) -> Duration {
        if session_id == ZERO_SESSION {
            self.config.page_lifetime()
        } else {
            self.config.app_lifetime()
        }
    }
}
