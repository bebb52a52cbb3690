use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::limiter::{Jitter, RateLimitProfile};
use crate::models::Credential;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub tokens: TokensConfig,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default = "default_jitter_min_ms")]
    pub jitter_min_ms: u64,
    #[serde(default = "default_jitter_max_ms")]
    pub jitter_max_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_app_name")]
    pub app_name: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_requests_per_second(),
            burst: default_burst(),
            jitter_min_ms: default_jitter_min_ms(),
            jitter_max_ms: default_jitter_max_ms(),
            timeout_secs: default_timeout_secs(),
            app_name: default_app_name(),
        }
    }
}

fn default_requests_per_second() -> f64 {
    1.5
}
fn default_burst() -> u32 {
    3
}
fn default_jitter_min_ms() -> u64 {
    500
}
fn default_jitter_max_ms() -> u64 {
    2000
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_app_name() -> String {
    "App".to_string()
}

impl ClientConfig {
    pub fn profile(&self) -> RateLimitProfile {
        RateLimitProfile {
            requests_per_second: self.requests_per_second,
            burst: self.burst,
        }
    }

    pub fn jitter(&self) -> Jitter {
        Jitter::new(
            Duration::from_millis(self.jitter_min_ms),
            Duration::from_millis(self.jitter_max_ms),
        )
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,
    #[serde(default = "default_max_retry_after_secs")]
    pub max_retry_after_secs: u64,
    #[serde(default = "default_max_consecutive_page_failures")]
    pub max_consecutive_page_failures: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            min_backoff_ms: default_min_backoff_ms(),
            max_retry_after_secs: default_max_retry_after_secs(),
            max_consecutive_page_failures: default_max_consecutive_page_failures(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_min_backoff_ms() -> u64 {
    2000
}
fn default_max_retry_after_secs() -> u64 {
    300
}
fn default_max_consecutive_page_failures() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    #[serde(default = "default_poll_secs")]
    pub poll_secs: u64,
    #[serde(default = "default_token_sweep_minutes")]
    pub token_sweep_minutes: u64,
    #[serde(default = "default_cleanup_hour")]
    pub cleanup_hour: u32,
    #[serde(default)]
    pub cleanup_minute: u32,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            poll_secs: default_poll_secs(),
            token_sweep_minutes: default_token_sweep_minutes(),
            cleanup_hour: default_cleanup_hour(),
            cleanup_minute: 0,
            retention_days: default_retention_days(),
        }
    }
}

fn default_poll_secs() -> u64 {
    20
}
fn default_token_sweep_minutes() -> u64 {
    25
}
fn default_cleanup_hour() -> u32 {
    3
}
fn default_retention_days() -> u32 {
    90
}

#[derive(Debug, Deserialize, Clone)]
pub struct TokensConfig {
    #[serde(default = "default_refresh_lead_secs")]
    pub refresh_lead_secs: u64,
}

impl Default for TokensConfig {
    fn default() -> Self {
        Self {
            refresh_lead_secs: default_refresh_lead_secs(),
        }
    }
}

fn default_refresh_lead_secs() -> u64 {
    300
}

/// Which upstream API family a source speaks.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    Zahcode,
    BenSoliman,
    PagedRest,
}

impl AdapterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zahcode => "zahcode",
            Self::BenSoliman => "ben_soliman",
            Self::PagedRest => "paged_rest",
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub adapter: AdapterKind,
    pub base_url: String,
    /// Minute of the hour the hourly scrape fires.
    #[serde(default)]
    pub minute: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub username_env: String,
    pub password_env: String,
    #[serde(default)]
    pub requests_per_second: Option<f64>,
    #[serde(default)]
    pub burst: Option<u32>,
    /// Token lifetime assumed when the login response carries no expiry.
    /// Absent means the token is treated as long-lived.
    #[serde(default)]
    pub token_lifetime_secs: Option<u64>,
    #[serde(default = "default_app_version")]
    pub app_version: String,
    #[serde(default)]
    pub app_name: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub products_method: HttpMethod,
    #[serde(default)]
    pub domain_id: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_enabled() -> bool {
    true
}
fn default_app_version() -> String {
    "1.0.0".to_string()
}
fn default_page_size() -> u32 {
    50
}

impl SourceConfig {
    pub fn profile(&self, defaults: &ClientConfig) -> RateLimitProfile {
        RateLimitProfile {
            requests_per_second: self
                .requests_per_second
                .unwrap_or(defaults.requests_per_second),
            burst: self.burst.unwrap_or(defaults.burst),
        }
    }

    pub fn token_lifetime(&self) -> Option<Duration> {
        self.token_lifetime_secs.map(Duration::from_secs)
    }

    /// Resolve login material from the environment variables this source names.
    pub fn credential(&self, source: &str) -> Result<Credential> {
        let identifier = std::env::var(&self.username_env).with_context(|| {
            format!(
                "sources.{}: environment variable {} is not set",
                source, self.username_env
            )
        })?;
        let secret = std::env::var(&self.password_env).with_context(|| {
            format!(
                "sources.{}: environment variable {} is not set",
                source, self.password_env
            )
        })?;
        Ok(Credential {
            source: source.to_string(),
            identifier,
            secret,
        })
    }
}

impl Config {
    pub fn enabled_sources(&self) -> impl Iterator<Item = (&String, &SourceConfig)> {
        self.sources.iter().filter(|(_, s)| s.enabled)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate client
    if !(config.client.requests_per_second > 0.0) {
        anyhow::bail!("client.requests_per_second must be > 0");
    }
    if config.client.burst == 0 {
        anyhow::bail!("client.burst must be >= 1");
    }
    if config.client.jitter_min_ms > config.client.jitter_max_ms {
        anyhow::bail!("client.jitter_min_ms must be <= client.jitter_max_ms");
    }
    if config.client.timeout_secs == 0 {
        anyhow::bail!("client.timeout_secs must be > 0");
    }

    // Validate retry
    if config.retry.max_attempts == 0 {
        anyhow::bail!("retry.max_attempts must be >= 1");
    }
    if config.retry.min_backoff_ms == 0 {
        anyhow::bail!("retry.min_backoff_ms must be >= 1");
    }
    if config.retry.max_consecutive_page_failures == 0 {
        anyhow::bail!("retry.max_consecutive_page_failures must be >= 1");
    }

    // Validate schedule
    if config.schedule.poll_secs == 0 {
        anyhow::bail!("schedule.poll_secs must be > 0");
    }
    if config.schedule.token_sweep_minutes == 0 {
        anyhow::bail!("schedule.token_sweep_minutes must be > 0");
    }
    if config.schedule.cleanup_hour > 23 || config.schedule.cleanup_minute > 59 {
        anyhow::bail!("schedule.cleanup_hour/cleanup_minute must be a valid time of day");
    }
    if config.schedule.retention_days == 0 {
        anyhow::bail!("schedule.retention_days must be >= 1");
    }

    // Validate sources
    for (name, source) in &config.sources {
        if name.trim().is_empty() {
            anyhow::bail!("source names must not be empty");
        }
        if !source.base_url.starts_with("http://") && !source.base_url.starts_with("https://") {
            anyhow::bail!(
                "sources.{}.base_url must start with http:// or https://",
                name
            );
        }
        if source.minute > 59 {
            anyhow::bail!("sources.{}.minute must be in [0, 59]", name);
        }
        if let Some(rps) = source.requests_per_second {
            if !(rps > 0.0) {
                anyhow::bail!("sources.{}.requests_per_second must be > 0", name);
            }
        }
        if source.burst == Some(0) {
            anyhow::bail!("sources.{}.burst must be >= 1", name);
        }
        if source.token_lifetime_secs == Some(0) {
            anyhow::bail!("sources.{}.token_lifetime_secs must be > 0", name);
        }
        if source.page_size == 0 {
            anyhow::bail!("sources.{}.page_size must be >= 1", name);
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[db]
path = "./data/pricewatch.sqlite"

[sources.alpha]
adapter = "zahcode"
base_url = "https://alpha.example.com/api"
minute = 5
username_env = "ALPHA_USER"
password_env = "ALPHA_PASS"
token_lifetime_secs = 1800
products_method = "post"

[sources.beta]
adapter = "ben_soliman"
base_url = "https://beta.example.com"
minute = 35
username_env = "BETA_USER"
password_env = "BETA_PASS"
domain_id = "2"
"#;

    #[test]
    fn test_defaults_applied() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.client.requests_per_second, 1.5);
        assert_eq!(config.client.burst, 3);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.schedule.token_sweep_minutes, 25);
        assert_eq!(config.schedule.cleanup_hour, 3);
        assert_eq!(config.schedule.retention_days, 90);
        assert_eq!(config.tokens.refresh_lead_secs, 300);

        let alpha = &config.sources["alpha"];
        assert_eq!(alpha.adapter, AdapterKind::Zahcode);
        assert_eq!(alpha.products_method, HttpMethod::Post);
        assert_eq!(alpha.token_lifetime(), Some(Duration::from_secs(1800)));
        assert!(alpha.enabled);

        let beta = &config.sources["beta"];
        assert_eq!(beta.token_lifetime(), None);
        assert_eq!(beta.profile(&config.client).burst, 3);
    }

    #[test]
    fn test_rejects_bad_minute() {
        let bad = MINIMAL.replace("minute = 35", "minute = 75");
        let err = parse_config(&bad).unwrap_err();
        assert!(err.to_string().contains("sources.beta.minute"));
    }

    #[test]
    fn test_rejects_unknown_adapter() {
        let bad = MINIMAL.replace("adapter = \"ben_soliman\"", "adapter = \"graphql\"");
        assert!(parse_config(&bad).is_err());
    }

    #[test]
    fn test_rejects_inverted_jitter() {
        let bad = format!("{MINIMAL}\n[client]\njitter_min_ms = 3000\njitter_max_ms = 1000\n");
        let err = parse_config(&bad).unwrap_err();
        assert!(err.to_string().contains("jitter"));
    }

    #[test]
    fn test_rejects_zero_min_backoff() {
        let bad = format!("{MINIMAL}\n[retry]\nmin_backoff_ms = 0\n");
        let err = parse_config(&bad).unwrap_err();
        assert!(err.to_string().contains("retry.min_backoff_ms"));
    }

    #[test]
    fn test_credential_from_env() {
        std::env::set_var("PW_TEST_CRED_USER", "01000000000");
        std::env::set_var("PW_TEST_CRED_PASS", "hunter2");
        let mut config = parse_config(MINIMAL).unwrap();
        let alpha = config.sources.get_mut("alpha").unwrap();
        alpha.username_env = "PW_TEST_CRED_USER".into();
        alpha.password_env = "PW_TEST_CRED_PASS".into();
        let cred = alpha.credential("alpha").unwrap();
        assert_eq!(cred.identifier, "01000000000");
        assert!(!format!("{cred:?}").contains("hunter2"));

        alpha.password_env = "PW_TEST_CRED_MISSING".into();
        assert!(alpha.credential("alpha").is_err());
    }
}
