use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RedisSettings {
    #[serde(default)]
    pub url: Option<String>,
}

/// Server settings, read from the environment (`REDIS__URL` style nesting).
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub redis: RedisSettings,
    #[serde(default = "default_page_lifetime_minutes")]
    pub page_lifetime_minutes: u64,
    #[serde(default = "default_app_lifetime_minutes")]
    pub app_lifetime_minutes: u64,
    #[serde(default = "default_client_refresh_secs")]
    pub client_refresh_secs: u64,
    #[serde(default = "default_client_expiration_secs")]
    pub client_expiration_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_ws_max_message_size")]
    pub ws_max_message_size: usize,
    #[serde(default = "default_outbound_queue_depth")]
    pub outbound_queue_depth: usize,
    #[serde(default)]
    pub check_page_ip: bool,
    #[serde(default)]
    pub limit_pages_per_hour: i64,
    #[serde(default)]
    pub limit_sessions_per_hour: i64,
    #[serde(default)]
    pub limit_session_size_bytes: usize,
    #[serde(default)]
    pub reserved_account_names: Option<String>,
    #[serde(default)]
    pub reserved_page_names: Option<String>,
    #[serde(default)]
    pub allow_remote_host_clients: bool,
    #[serde(default)]
    pub host_clients_auth_token: Option<String>,
    #[serde(default = "default_master_secret_key")]
    pub master_secret_key: String,
    #[serde(default)]
    pub fallback_page_name: Option<String>,
    #[serde(default)]
    pub shutdown_idle_secs: Option<u64>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            redis: RedisSettings::default(),
            page_lifetime_minutes: default_page_lifetime_minutes(),
            app_lifetime_minutes: default_app_lifetime_minutes(),
            client_refresh_secs: default_client_refresh_secs(),
            client_expiration_secs: default_client_expiration_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            ws_max_message_size: default_ws_max_message_size(),
            outbound_queue_depth: default_outbound_queue_depth(),
            check_page_ip: false,
            limit_pages_per_hour: 0,
            limit_sessions_per_hour: 0,
            limit_session_size_bytes: 0,
            reserved_account_names: None,
            reserved_page_names: None,
            allow_remote_host_clients: false,
            host_clients_auth_token: None,
            master_secret_key: default_master_secret_key(),
            fallback_page_name: None,
            shutdown_idle_secs: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        config::Config::builder()
            .add_source(config::Environment::default().separator("__"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map(AppConfig::normalize)
            .unwrap_or_else(|err| {
                warn!(error = %err, "invalid configuration; using defaults");
                AppConfig::default().normalize()
            })
    }

    fn normalize(mut self) -> Self {
        self.redis.url = Self::normalize_opt(self.redis.url.take());
        self.reserved_account_names = Self::normalize_opt(self.reserved_account_names.take());
        self.reserved_page_names = Self::normalize_opt(self.reserved_page_names.take());
        self.host_clients_auth_token = Self::normalize_opt(self.host_clients_auth_token.take());
        self.fallback_page_name = Self::normalize_opt(self.fallback_page_name.take());
        self.outbound_queue_depth = self.outbound_queue_depth.max(1);
        self
    }

    fn normalize_opt(value: Option<String>) -> Option<String> {
        value.and_then(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn split_list(value: &Option<String>) -> Vec<String> {
        value
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(|item| item.trim().to_lowercase())
            .filter(|item| !item.is_empty())
            .collect()
    }

    pub fn reserved_accounts(&self) -> Vec<String> {
        Self::split_list(&self.reserved_account_names)
    }

    pub fn reserved_pages(&self) -> Vec<String> {
        Self::split_list(&self.reserved_page_names)
    }

    pub fn page_lifetime(&self) -> Duration {
        Duration::from_secs(self.page_lifetime_minutes * 60)
    }

    pub fn app_lifetime(&self) -> Duration {
        Duration::from_secs(self.app_lifetime_minutes * 60)
    }

    pub fn client_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.client_refresh_secs.max(1))
    }

    pub fn client_expiration(&self) -> Duration {
        Duration::from_secs(self.client_expiration_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8550".to_string()
}

fn default_page_lifetime_minutes() -> u64 {
    1440
}

fn default_app_lifetime_minutes() -> u64 {
    60
}

fn default_client_refresh_secs() -> u64 {
    5
}

fn default_client_expiration_secs() -> u64 {
    20
}

fn default_sweep_interval_secs() -> u64 {
    10
}

fn default_ws_max_message_size() -> usize {
    2 * 1024 * 1024
}

fn default_outbound_queue_depth() -> usize {
    256
}

fn default_master_secret_key() -> String {
    "master_secret_key".to_string()
}
