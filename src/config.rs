//! Configuration loaded from `mailhub.toml`.
//!
//! Every section carries defaults, so an empty file yields a working setup that
//! talks to no accounts. Durations are stored as whole seconds to keep the file
//! readable and converted with the accessor methods.

use crate::model::MailAccount;

use anyhow::Context as _;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Hard upper bound on worker connections per user. Mail servers commonly reject
/// more than a handful of concurrent logins for the same account.
pub const MAX_WORKERS_PER_USER: usize = 3;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pool: PoolConfig,
    pub sync: SyncConfig,
    pub listener: ListenerConfig,
    pub hub: HubConfig,
    pub search: SearchConfig,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub accounts: Vec<AccountConfig>,
}

impl Config {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml(&raw)
            .with_context(|| format!("failed to load config file {}", path.display()))
            .map_err(Into::into)
    }

    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let mut config: Config = toml::from_str(raw).context("invalid TOML")?;
        config.normalize()?;
        Ok(config)
    }

    fn normalize(&mut self) -> anyhow::Result<()> {
        self.pool.max_workers_per_user = self.pool.max_workers_per_user.clamp(1, MAX_WORKERS_PER_USER);
        self.hub.max_clients_per_user = self.hub.max_clients_per_user.max(1);
        self.hub.queue_capacity = self.hub.queue_capacity.max(1);
        self.sync.header_batch_size = self.sync.header_batch_size.max(1);
        self.sync.body_batch_size = self.sync.body_batch_size.max(1);
        self.sync.max_body_bytes = self.sync.max_body_bytes.max(1024);
        self.search.max_limit = self.search.max_limit.max(1);
        self.search.default_limit = self.search.default_limit.clamp(1, self.search.max_limit);
        self.listener.initial_backoff_secs = self.listener.initial_backoff_secs.max(1);
        self.listener.max_backoff_secs = self
            .listener
            .max_backoff_secs
            .max(self.listener.initial_backoff_secs);

        let listener_folder = self.listener.folder.trim().to_string();
        self.listener.folder = if listener_folder.is_empty() {
            "INBOX".to_string()
        } else {
            listener_folder
        };

        let mut seen = std::collections::HashSet::new();
        for account in &self.accounts {
            if account.user.trim().is_empty() {
                anyhow::bail!("account entry with empty user id");
            }
            if account.host.trim().is_empty() {
                anyhow::bail!("account for user '{}' has no host", account.user);
            }
            if !seen.insert(account.user.clone()) {
                anyhow::bail!("duplicate account entry for user '{}'", account.user);
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_workers_per_user: usize,
    /// How long `acquire` waits for a free worker slot before giving up.
    pub acquire_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Handles idle longer than this get a NOOP probe before reuse.
    pub health_check_after_secs: u64,
    /// Worker handles idle longer than this are closed by the sweeper.
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers_per_user: MAX_WORKERS_PER_USER,
            acquire_timeout_secs: 30,
            connect_timeout_secs: 5,
            health_check_after_secs: 60,
            idle_timeout_secs: 600,
            sweep_interval_secs: 60,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn health_check_after(&self) -> Duration {
        Duration::from_secs(self.health_check_after_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// A folder synced longer ago than this is considered stale.
    pub freshness_secs: u64,
    pub header_batch_size: usize,
    pub body_batch_size: usize,
    pub max_body_bytes: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            freshness_secs: 300,
            header_batch_size: 200,
            body_batch_size: 50,
            max_body_bytes: 1024 * 1024,
        }
    }
}

impl SyncConfig {
    pub fn freshness(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.freshness_secs as i64)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub folder: String,
    /// Re-issue IDLE at this interval; many NATs drop silent connections at ~30 minutes.
    pub idle_refresh_secs: u64,
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub max_retries: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            folder: "INBOX".to_string(),
            idle_refresh_secs: 20 * 60,
            initial_backoff_secs: 5,
            max_backoff_secs: 300,
            max_retries: 10,
        }
    }
}

impl ListenerConfig {
    pub fn idle_refresh(&self) -> Duration {
        Duration::from_secs(self.idle_refresh_secs.max(1))
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_secs(self.initial_backoff_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub max_clients_per_user: usize,
    pub queue_capacity: usize,
    pub write_timeout_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_clients_per_user: 10,
            queue_capacity: 32,
            write_timeout_secs: 10,
        }
    }
}

impl HubConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub default_folder: String,
    pub default_limit: usize,
    pub max_limit: usize,
    /// Newest matches kept before fetching headers.
    pub max_matches: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_folder: "INBOX".to_string(),
            default_limit: 25,
            max_limit: 100,
            max_matches: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Header carrying the user id resolved by the upstream authentication layer.
    pub user_header: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8025,
            user_header: "x-mailhub-user".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://mailhub.db?mode=rwc".to_string(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct AccountConfig {
    pub user: String,
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default = "default_true")]
    pub use_tls: bool,
}

impl std::fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountConfig")
            .field("user", &self.user)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &"[REDACTED]")
            .field("password", &"[REDACTED]")
            .field("use_tls", &self.use_tls)
            .finish()
    }
}

impl AccountConfig {
    pub fn to_account(&self) -> MailAccount {
        MailAccount {
            host: self.host.trim().to_string(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
            use_tls: self.use_tls,
        }
    }
}

fn default_imap_port() -> u16 {
    993
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::{Config, MAX_WORKERS_PER_USER};

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.pool.max_workers_per_user, MAX_WORKERS_PER_USER);
        assert_eq!(config.pool.idle_timeout_secs, 600);
        assert_eq!(config.sync.freshness_secs, 300);
        assert_eq!(config.hub.max_clients_per_user, 10);
        assert_eq!(config.listener.folder, "INBOX");
        assert!(config.accounts.is_empty());
    }

    #[test]
    fn worker_cap_is_clamped() {
        let config = Config::from_toml("[pool]\nmax_workers_per_user = 12\n").unwrap();
        assert_eq!(config.pool.max_workers_per_user, MAX_WORKERS_PER_USER);

        let config = Config::from_toml("[pool]\nmax_workers_per_user = 0\n").unwrap();
        assert_eq!(config.pool.max_workers_per_user, 1);
    }

    #[test]
    fn accounts_parse_with_defaults() {
        let config = Config::from_toml(
            r#"
            [[accounts]]
            user = "u1"
            host = "imap.example.com"
            username = "alice@example.com"
            password = "secret"
            "#,
        )
        .unwrap();

        let account = config.accounts[0].to_account();
        assert_eq!(account.port, 993);
        assert!(account.use_tls);
        assert!(!format!("{:?}", config.accounts[0]).contains("secret"));
    }

    #[test]
    fn duplicate_accounts_are_rejected() {
        let raw = r#"
            [[accounts]]
            user = "u1"
            host = "a"
            username = "x"
            password = "y"

            [[accounts]]
            user = "u1"
            host = "b"
            username = "x"
            password = "y"
        "#;
        assert!(Config::from_toml(raw).is_err());
    }
}
