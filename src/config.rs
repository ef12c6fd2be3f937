use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::services::RegistryOptions;
use crate::services::retry::{Backoff, BackoffKind, RetryPolicy};

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";
pub const ENV_PREFIX: &str = "REGISTRY_";

/// 配置加载错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid environment override: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub registry: RegistryConfig,
    pub retry: RetryConfig,
    pub options_retry: RetryConfig,
    pub watch: WatchConfig,
    pub log: LogConfig,
    pub announce: Option<AnnounceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            registry: RegistryConfig::default(),
            retry: RetryConfig::default(),
            options_retry: RetryConfig {
                backoff: BackoffKind::Fixed,
                ..RetryConfig::default()
            },
            watch: WatchConfig::default(),
            log: LogConfig::default(),
            announce: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Etcd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub endpoints: Vec<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// 记录租约时长（秒）
    pub ttl_seconds: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { ttl_seconds: 120 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: BackoffKind::Linear,
            delay_ms: 100,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        let delay = Duration::from_millis(self.delay_ms);
        match self.backoff {
            BackoffKind::Fixed => RetryPolicy::fixed(self.max_attempts, delay),
            BackoffKind::Linear => RetryPolicy::linear(self.max_attempts, delay),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            reconnect_base_ms: 200,
            reconnect_max_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// 进程启动时自注册的服务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnounceConfig {
    pub name: String,
    pub connection: Value,
    #[serde(default)]
    pub options: Option<Value>,
    /// 续约间隔，缺省为 TTL 的一半
    #[serde(default)]
    pub renew_interval_seconds: Option<u64>,
}

// REGISTRY_* 环境变量覆盖
#[derive(Debug, Default, Deserialize)]
struct EnvOverrides {
    ttl_seconds: Option<u64>,
    store_backend: Option<StoreBackend>,
    store_endpoints: Option<Vec<String>>,
    log_level: Option<String>,
}

impl Config {
    /// 依次加载 `.env`、`REGISTRY_CONFIG` 指定的 TOML 文件（默认 `config.toml`，不存在时使用默认值）
    /// 以及 `REGISTRY_*` 环境变量覆盖
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "Loaded .env file");
        }

        let path = std::env::var(format!("{ENV_PREFIX}CONFIG"))
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        let mut config = Self::from_file(&path)?;
        config.apply_env_overrides(std::env::vars())?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(config_str) => Self::from_toml(&config_str),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    pub fn from_toml(config_str: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(config_str)?;
        config.validate()?;
        Ok(config)
    }

    /// 应用 `vars` 中的 `REGISTRY_*` 变量，其他变量忽略
    pub fn apply_env_overrides<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let overrides: EnvOverrides = envy::prefixed(ENV_PREFIX).from_iter(vars)?;

        if let Some(ttl_seconds) = overrides.ttl_seconds {
            self.registry.ttl_seconds = ttl_seconds;
        }
        if let Some(backend) = overrides.store_backend {
            self.store.backend = backend;
        }
        if let Some(endpoints) = overrides.store_endpoints {
            self.store.endpoints = endpoints;
        }
        if let Some(level) = overrides.log_level {
            self.log.level = level;
        }

        self.validate()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.registry.ttl_seconds == 0 {
            return Err(ConfigError::Invalid("registry.ttl_seconds must be positive".into()));
        }
        if self.store.backend == StoreBackend::Etcd && self.store.endpoints.is_empty() {
            return Err(ConfigError::Invalid("store.endpoints is empty".into()));
        }
        if self.watch.reconnect_base_ms > self.watch.reconnect_max_ms {
            return Err(ConfigError::Invalid(
                "watch.reconnect_base_ms exceeds watch.reconnect_max_ms".into(),
            ));
        }
        if let Some(announce) = &self.announce {
            if announce.name.is_empty() || announce.name.contains('/') {
                return Err(ConfigError::Invalid(format!(
                    "announce.name {:?} is not a valid service name",
                    announce.name
                )));
            }
        }
        Ok(())
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.registry.ttl_seconds)
    }

    /// 续约间隔：显式配置或 TTL 的一半
    pub fn renew_interval(&self) -> Duration {
        self.announce
            .as_ref()
            .and_then(|announce| announce.renew_interval_seconds)
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.ttl() / 2)
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            ttl: self.ttl(),
            lookup_retry: self.retry.policy(),
            options_retry: self.options_retry.policy(),
            watch_reconnect: Backoff::Exponential {
                base: Duration::from_millis(self.watch.reconnect_base_ms),
                max: Duration::from_millis(self.watch.reconnect_max_ms),
            },
        }
    }
}
