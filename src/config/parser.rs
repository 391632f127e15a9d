use super::ConfigError;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::db::LedgerDefaults;
use crate::db::models::{DEFAULT_DOWNVOTE_SYMBOL, DEFAULT_SCORE_OFFSET, DEFAULT_UPVOTE_SYMBOL};

const MAX_PAGE_SIZE: u8 = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub auth: AuthConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub scan: ScanConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "empty_secret")]
    pub bot_token: SecretString,
    #[serde(default = "default_use_privileged_intents")]
    pub use_privileged_intents: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(alias = "console", default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            filename: Some(default_database_filename()),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl DatabaseConfig {
    pub fn connection_string(&self) -> String {
        if let Some(ref url) = self.url {
            url.clone()
        } else if let Some(ref file) = self.filename {
            format!("sqlite://{}", file)
        } else {
            String::new()
        }
    }

    pub fn sqlite_path(&self) -> String {
        let url = self.connection_string();
        url.strip_prefix("sqlite://").unwrap_or(&url).to_string()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_web_enabled")]
    pub enabled: bool,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default)]
    pub admin_token: Option<SecretString>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: default_web_enabled(),
            port: default_port(),
            bind_address: default_bind_address(),
            admin_token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LedgerConfig {
    #[serde(default = "default_score_offset")]
    pub default_score_offset: i64,
    #[serde(default = "default_upvote_symbol")]
    pub default_upvote_symbol: String,
    #[serde(default = "default_downvote_symbol")]
    pub default_downvote_symbol: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            default_score_offset: default_score_offset(),
            default_upvote_symbol: default_upvote_symbol(),
            default_downvote_symbol: default_downvote_symbol(),
        }
    }
}

impl LedgerConfig {
    pub fn defaults(&self) -> LedgerDefaults {
        LedgerDefaults {
            score_offset: self.default_score_offset,
            upvote_symbol: self.default_upvote_symbol.clone(),
            downvote_symbol: self.default_downvote_symbol.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScanConfig {
    #[serde(default = "default_page_size")]
    pub page_size: u8,
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    #[serde(default)]
    pub excluded_channels: Vec<i64>,
    #[serde(default)]
    pub communities: Vec<i64>,
    #[serde(default = "default_refill_concurrency")]
    pub refill_concurrency: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            page_delay_ms: default_page_delay_ms(),
            retry_attempts: default_retry_attempts(),
            retry_initial_ms: default_retry_initial_ms(),
            retry_max_ms: default_retry_max_ms(),
            excluded_channels: Vec::new(),
            communities: Vec::new(),
            refill_concurrency: default_refill_concurrency(),
        }
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_yaml::from_str(content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.connection_string().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "database connection string cannot be empty".to_string(),
            ));
        }

        if self.database.max_connections == 0 {
            return Err(ConfigError::InvalidConfig(
                "database.max_connections must be at least 1".to_string(),
            ));
        }

        if self.web.enabled && self.web.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "web.port must be between 1 and 65535".to_string(),
            ));
        }

        if self.ledger.default_upvote_symbol.is_empty()
            || self.ledger.default_downvote_symbol.is_empty()
        {
            return Err(ConfigError::InvalidConfig(
                "ledger vote symbols cannot be empty".to_string(),
            ));
        }

        if self.ledger.default_upvote_symbol == self.ledger.default_downvote_symbol {
            return Err(ConfigError::InvalidConfig(
                "ledger upvote and downvote symbols must differ".to_string(),
            ));
        }

        if self.scan.page_size == 0 || self.scan.page_size > MAX_PAGE_SIZE {
            return Err(ConfigError::InvalidConfig(format!(
                "scan.page_size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }

        if self.scan.retry_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "scan.retry_attempts must be at least 1".to_string(),
            ));
        }

        if self.scan.refill_concurrency == 0 {
            return Err(ConfigError::InvalidConfig(
                "scan.refill_concurrency must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn require_bot_token(&self) -> Result<&str, ConfigError> {
        let token = self.auth.bot_token.expose_secret();
        if token.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "auth.bot_token cannot be empty".to_string(),
            ));
        }
        Ok(token)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("REPUTATION_LEDGER_BOT_TOKEN") {
            self.auth.bot_token = SecretString::from(value);
        }
        if let Ok(value) = std::env::var("REPUTATION_LEDGER_DATABASE_URL") {
            self.database.url = Some(value);
        }
        if let Ok(value) = std::env::var("REPUTATION_LEDGER_ADMIN_TOKEN") {
            self.web.admin_token = Some(SecretString::from(value));
        }
    }
}

fn empty_secret() -> SecretString {
    SecretString::from(String::new())
}

fn default_use_privileged_intents() -> bool {
    false
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_database_filename() -> String {
    "reputation.db".to_string()
}

fn default_max_connections() -> u32 {
    4
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_web_enabled() -> bool {
    true
}

fn default_port() -> u16 {
    9005
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_score_offset() -> i64 {
    DEFAULT_SCORE_OFFSET
}

fn default_upvote_symbol() -> String {
    DEFAULT_UPVOTE_SYMBOL.to_string()
}

fn default_downvote_symbol() -> String {
    DEFAULT_DOWNVOTE_SYMBOL.to_string()
}

fn default_page_size() -> u8 {
    MAX_PAGE_SIZE
}

fn default_page_delay_ms() -> u64 {
    250
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_initial_ms() -> u64 {
    500
}

fn default_retry_max_ms() -> u64 {
    30_000
}

fn default_refill_concurrency() -> usize {
    4
}
