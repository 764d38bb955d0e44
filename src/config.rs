use std::{
    collections::HashMap,
    env,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::error::{AdapterError, StoreError};

/// Keys read from the config store at runtime.
pub mod keys {
    pub const CHATBASE_CHATBOT_ID: &str = "chatbase_chatbot_id";
    pub const CHATBASE_API_KEY: &str = "chatbase_api_key";
    pub const WHATSAPP_ACCESS_TOKEN: &str = "whatsapp_access_token";
    pub const WHATSAPP_PHONE_NUMBER_ID: &str = "whatsapp_phone_number_id";
    pub const WHATSAPP_SEND_MODE: &str = "whatsapp_send_mode";
    pub const WHATSAPP_TEMPLATE_NAME: &str = "whatsapp_template_name";
    pub const WHATSAPP_TEMPLATE_LANGUAGE: &str = "whatsapp_template_language";
    pub const WHATSAPP_VERIFY_TOKEN: &str = "whatsapp_verify_token";
    pub const WHATSAPP_APP_SECRET: &str = "whatsapp_app_secret";
    pub const DEBOUNCE_MS: &str = "debounce_ms";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

/// Retry schedule for failed jobs: `base * multiplier^attempts` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay_secs: u64,
    pub multiplier: u32,
    pub max_attempts: u32,
    pub retry_config_errors: bool,
}

const MAX_RETRY_DELAY_SECS: u64 = 24 * 60 * 60;

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_secs: 5,
            multiplier: 2,
            max_attempts: 3,
            retry_config_errors: true,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempts: u32) -> chrono::Duration {
        let factor = u64::from(self.multiplier).saturating_pow(attempts);
        let secs = self
            .base_delay_secs
            .saturating_mul(factor)
            .min(MAX_RETRY_DELAY_SECS);
        chrono::Duration::seconds(secs as i64)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

/// Process-level settings resolved once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub database_url: String,
    pub store_backend: StoreBackend,
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub debounce_window: Duration,
    pub retry: RetryPolicy,
    pub stale_after: Duration,
    pub config_cache_ttl: Duration,
    pub chatbase_api_base: String,
    pub whatsapp_graph_base: String,
    pub admin_token: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 4000,
            database_url: String::new(),
            store_backend: StoreBackend::Postgres,
            poll_interval: Duration::from_millis(4000),
            batch_size: 10,
            debounce_window: Duration::from_millis(3000),
            retry: RetryPolicy::default(),
            stale_after: Duration::from_secs(300),
            config_cache_ttl: Duration::from_secs(30),
            chatbase_api_base: "https://www.chatbase.co/api/v1".to_string(),
            whatsapp_graph_base: "https://graph.facebook.com/v21.0".to_string(),
            admin_token: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn env_text(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let defaults = Settings::default();
        let store_backend = match env_text("STORE_BACKEND").as_deref() {
            Some("memory") => StoreBackend::Memory,
            _ => StoreBackend::Postgres,
        };
        let retry = RetryPolicy {
            base_delay_secs: env_parse("RETRY_BASE_DELAY_SECS")
                .unwrap_or(defaults.retry.base_delay_secs),
            multiplier: env_parse("RETRY_MULTIPLIER").unwrap_or(defaults.retry.multiplier),
            max_attempts: env_parse::<u32>("MAX_ATTEMPTS")
                .unwrap_or(defaults.retry.max_attempts)
                .max(1),
            retry_config_errors: env_text("RETRY_CONFIG_ERRORS")
                .and_then(|v| parse_bool(&v))
                .unwrap_or(defaults.retry.retry_config_errors),
        };

        Self {
            port: env_parse("PORT").unwrap_or(defaults.port),
            database_url: resolve_database_url(),
            store_backend,
            poll_interval: env_parse("POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            batch_size: env_parse::<usize>("POLL_BATCH_SIZE")
                .unwrap_or(defaults.batch_size)
                .max(1),
            debounce_window: env_parse("DEBOUNCE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.debounce_window),
            retry,
            stale_after: env_parse("STALE_PROCESSING_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.stale_after),
            config_cache_ttl: env_parse("CONFIG_CACHE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.config_cache_ttl),
            chatbase_api_base: env_text("CHATBASE_API_BASE")
                .unwrap_or(defaults.chatbase_api_base)
                .trim_end_matches('/')
                .to_string(),
            whatsapp_graph_base: env_text("WHATSAPP_GRAPH_BASE")
                .unwrap_or(defaults.whatsapp_graph_base)
                .trim_end_matches('/')
                .to_string(),
            admin_token: env_text("ADMIN_TOKEN"),
        }
    }
}

fn resolve_database_url() -> String {
    if let Some(url) = env_text("DATABASE_URL") {
        return url;
    }
    let host = env::var("POSTGRES_HOST")
        .or_else(|_| env::var("PGHOST"))
        .unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("POSTGRES_PORT")
        .or_else(|_| env::var("PGPORT"))
        .unwrap_or_else(|_| "5432".to_string());
    let user = env::var("POSTGRES_USER")
        .or_else(|_| env::var("PGUSER"))
        .unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("POSTGRES_PASSWORD")
        .or_else(|_| env::var("PGPASSWORD"))
        .unwrap_or_else(|_| "postgres".to_string());
    let db = env::var("POSTGRES_DB")
        .or_else(|_| env::var("PGDATABASE"))
        .unwrap_or_else(|_| "wa_relay".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}

/// Read-only key/value access to credentials and tunables.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
}

/// Returns the trimmed value, treating blanks as missing.
pub async fn optional(source: &dyn ConfigSource, key: &str) -> Result<Option<String>, AdapterError> {
    Ok(source
        .get(key)
        .await?
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty()))
}

pub async fn required(source: &dyn ConfigSource, key: &str) -> Result<String, AdapterError> {
    optional(source, key)
        .await?
        .ok_or_else(|| AdapterError::Config(key.to_string()))
}

/// Looks keys up as upper-cased environment variables.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvConfig;

#[async_trait]
impl ConfigSource for EnvConfig {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(env_text(&key.to_ascii_uppercase()))
    }
}

#[derive(Debug, Default)]
pub struct MemoryConfig {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryConfig {
    pub fn new<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: RwLock::new(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    pub async fn set(&self, key: &str, value: &str) {
        self.values
            .write()
            .await
            .insert(key.to_string(), value.to_string());
    }
}

#[async_trait]
impl ConfigSource for MemoryConfig {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values.read().await.get(key).cloned())
    }
}

/// First source with a value wins.
pub struct LayeredConfig {
    layers: Vec<Arc<dyn ConfigSource>>,
}

impl LayeredConfig {
    pub fn new(layers: Vec<Arc<dyn ConfigSource>>) -> Self {
        Self { layers }
    }
}

#[async_trait]
impl ConfigSource for LayeredConfig {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        for layer in &self.layers {
            if let Some(value) = layer.get(key).await? {
                if !value.trim().is_empty() {
                    return Ok(Some(value));
                }
            }
        }
        Ok(None)
    }
}

/// Short-TTL cache in front of another source. Misses are cached too.
pub struct CachedConfig {
    inner: Arc<dyn ConfigSource>,
    ttl: Duration,
    cache: Mutex<HashMap<String, (Instant, Option<String>)>>,
}

impl CachedConfig {
    pub fn new(inner: Arc<dyn ConfigSource>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ConfigSource for CachedConfig {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        {
            let cache = self.cache.lock().await;
            if let Some((fetched_at, value)) = cache.get(key) {
                if fetched_at.elapsed() < self.ttl {
                    return Ok(value.clone());
                }
            }
        }
        let value = self.inner.get(key).await?;
        self.cache
            .lock()
            .await
            .insert(key.to_string(), (Instant::now(), value.clone()));
        Ok(value)
    }
}
