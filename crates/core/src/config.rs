use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_usize(profile: &str, key: &str, default: usize) -> usize {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_bool(profile: &str, key: &str) -> bool {
    profiled_env_opt(profile, key)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn profiled_env_list(profile: &str, key: &str) -> Vec<String> {
    profiled_env_opt(profile, key)
        .map(|v| split_list(&v))
        .unwrap_or_default()
}

/// Split a comma-separated list, dropping blanks.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Number of logical CPUs, used as the default worker count.
pub fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub environment: Environment,
    pub kafka: KafkaConfig,
    pub log: LogConfig,
    pub batch: BatchConsumerConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `MICROBATCH_PROFILE` env var. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let profile = env_or("MICROBATCH_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Result<Self, ConfigError> {
        let p = profile.to_uppercase();
        let p = p.as_str();
        let kafka = KafkaConfig::from_env_profiled(p)?;
        let mut batch = BatchConsumerConfig::from_env_profiled(p)?;
        if batch.group_name.is_empty() {
            batch.group_name = kafka.group.clone();
        }
        Ok(Self {
            profile: p.to_string(),
            environment: profiled_env_or(p, "APP_ENV", "prod").parse()?,
            kafka,
            log: LogConfig::from_env_profiled(p),
            batch,
        })
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}, env: {}):", self.profile_label(), self.environment);
        tracing::info!(
            "  kafka:  client_id={}, consumers={}, group={}, offset={}",
            self.kafka.client_id,
            self.kafka.consumer_hosts.join(","),
            self.kafka.group,
            self.kafka.initial_offset
        );
        tracing::info!(
            "  batch:  topics={}, size={}, pool={}, buffer={}, linger_ms={}",
            self.batch.topics.join(","),
            self.batch.batch_size,
            self.batch.pool_size,
            self.batch.channel_buffer_size,
            self.batch.linger_ms
        );
        tracing::info!(
            "  log:    category={}, value_limit={}, consumer={}",
            self.log.category,
            self.log.limit,
            self.log.log_consumer
        );
    }
}

// ── Environment ───────────────────────────────────────────────

/// Deployment environment the process runs in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Local,
    Dev,
    Test,
    Gray,
    #[default]
    Prod,
}

impl Environment {
    /// Local and dev share brokers with other developers, so their consumer
    /// groups get an isolating suffix.
    pub fn is_development(self) -> bool {
        matches!(self, Environment::Local | Environment::Dev)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Dev => "dev",
            Environment::Test => "test",
            Environment::Gray => "gray",
            Environment::Prod => "prod",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Environment::Local),
            "dev" | "development" => Ok(Environment::Dev),
            "test" => Ok(Environment::Test),
            "gray" | "grey" => Ok(Environment::Gray),
            "prod" | "production" => Ok(Environment::Prod),
            other => Err(ConfigError::Invalid {
                key: "APP_ENV".into(),
                value: other.to_string(),
            }),
        }
    }
}

// ── Kafka ─────────────────────────────────────────────────────

/// Where a consumer group starts reading when it has no committed offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitialOffset {
    #[default]
    Oldest,
    Newest,
}

impl fmt::Display for InitialOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitialOffset::Oldest => f.write_str("oldest"),
            InitialOffset::Newest => f.write_str("newest"),
        }
    }
}

impl FromStr for InitialOffset {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "oldest" | "earliest" => Ok(InitialOffset::Oldest),
            "newest" | "latest" => Ok(InitialOffset::Newest),
            other => Err(ConfigError::Invalid {
                key: "INITIAL_OFFSET".into(),
                value: other.to_string(),
            }),
        }
    }
}

fn parse_offset_opt(p: &str, key: &str) -> Result<Option<InitialOffset>, ConfigError> {
    profiled_env_opt(p, key)
        .map(|v| {
            v.parse().map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value: v,
            })
        })
        .transpose()
}

/// Broker connection and header conventions shared by every consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    pub client_id: String,
    pub consumer_hosts: Vec<String>,
    /// Default consumer group when a consumer does not name its own.
    pub group: String,
    pub initial_offset: InitialOffset,
    /// Header carrying the request trace id.
    pub trace_id_key: String,
    /// Header carrying the per-message unique id.
    pub msg_id_key: String,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            client_id: "microbatch".to_string(),
            consumer_hosts: vec!["localhost:9092".to_string()],
            group: String::new(),
            initial_offset: InitialOffset::Oldest,
            trace_id_key: "X-Request-Id".to_string(),
            msg_id_key: "msgId".to_string(),
        }
    }
}

impl KafkaConfig {
    fn from_env_profiled(p: &str) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let consumer_hosts = profiled_env_list(p, "KAFKA_CONSUMER_HOST");
        Ok(Self {
            client_id: profiled_env_or(p, "KAFKA_CLIENT_ID", &defaults.client_id),
            consumer_hosts: if consumer_hosts.is_empty() { defaults.consumer_hosts } else { consumer_hosts },
            group: profiled_env_or(p, "KAFKA_GROUP", ""),
            initial_offset: parse_offset_opt(p, "KAFKA_INITIAL_OFFSET")?.unwrap_or_default(),
            trace_id_key: profiled_env_or(p, "KAFKA_TRACE_ID_KEY", &defaults.trace_id_key),
            msg_id_key: profiled_env_or(p, "KAFKA_MSG_ID_KEY", &defaults.msg_id_key),
        })
    }
}

// ── Logging ───────────────────────────────────────────────────

/// Consumer/producer logging conventions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Emitted as the `category` field on every broker log line.
    pub category: String,
    /// Message values longer than this (in chars) are truncated in logs; 0 disables.
    pub limit: usize,
    /// Placed between the kept head and tail of a truncated value.
    pub replace_str: String,
    /// Log successful consumer batches, not only failures.
    pub log_consumer: bool,
    /// Log successful produce calls.
    pub log_producer: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            category: "kafka".to_string(),
            limit: 0,
            replace_str: "...".to_string(),
            log_consumer: false,
            log_producer: false,
        }
    }
}

impl LogConfig {
    fn from_env_profiled(p: &str) -> Self {
        let defaults = Self::default();
        Self {
            category: profiled_env_or(p, "LOG_CATEGORY", &defaults.category),
            limit: profiled_env_usize(p, "LOG_VALUE_LIMIT", defaults.limit),
            replace_str: profiled_env_or(p, "LOG_REPLACE_STR", &defaults.replace_str),
            log_consumer: profiled_env_bool(p, "LOG_CONSUMER"),
            log_producer: profiled_env_bool(p, "LOG_PRODUCER"),
        }
    }
}

// ── Batch consumer ────────────────────────────────────────────

/// Settings for one batch consumer (topics, group and aggregator sizing).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConsumerConfig {
    pub topics: Vec<String>,
    pub group_name: String,
    /// Flush once this many messages are buffered.
    pub batch_size: usize,
    /// In-process queue capacity; raised to the worker count when smaller.
    pub channel_buffer_size: usize,
    /// Worker count in best-effort mode. Consistency mode always uses one.
    pub pool_size: usize,
    /// Flush a partial batch this long after its first message.
    pub linger_ms: u64,
    /// Overrides `KafkaConfig::initial_offset` when set.
    pub initial_offset: Option<InitialOffset>,
}

impl Default for BatchConsumerConfig {
    fn default() -> Self {
        Self {
            topics: Vec::new(),
            group_name: String::new(),
            batch_size: 8,
            channel_buffer_size: 0,
            pool_size: cpu_count(),
            linger_ms: 60_000,
            initial_offset: None,
        }
    }
}

impl BatchConsumerConfig {
    fn from_env_profiled(p: &str) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            topics: profiled_env_list(p, "BATCH_TOPICS"),
            group_name: profiled_env_or(p, "BATCH_GROUP", ""),
            batch_size: profiled_env_usize(p, "BATCH_SIZE", defaults.batch_size),
            channel_buffer_size: profiled_env_usize(p, "BATCH_CHANNEL_BUFFER", defaults.channel_buffer_size),
            pool_size: profiled_env_usize(p, "BATCH_POOL_SIZE", defaults.pool_size),
            linger_ms: profiled_env_u64(p, "BATCH_LINGER_MS", defaults.linger_ms),
            initial_offset: parse_offset_opt(p, "BATCH_INITIAL_OFFSET")?,
        })
    }

    /// A consumer cannot join without topics and a group.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topics.is_empty() {
            return Err(ConfigError::Missing("BATCH_TOPICS".into()));
        }
        if self.group_name.is_empty() {
            return Err(ConfigError::Missing("BATCH_GROUP".into()));
        }
        Ok(())
    }

    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }

    /// Consumer group actually joined in `env`: development environments get
    /// a `_dev` suffix so they never steal partitions from shared deployments.
    pub fn effective_group(&self, env: Environment) -> String {
        if env.is_development() {
            format!("{}_{}", self.group_name, Environment::Dev)
        } else {
            self.group_name.clone()
        }
    }
}
