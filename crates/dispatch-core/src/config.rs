//! Service configuration.
//!
//! Defaults are overridden from `DISPATCH_*` environment variables. Retry
//! limits and backoff constants are deliberately not configurable; see
//! [`crate::MAX_ATTEMPTS`] and [`crate::backoff`].

use crate::events::DEFAULT_EVENT_TOPICS;
use crate::{CoreError, CoreResult};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_CONSUMER_GROUP: &str = "dispatch";
const DEFAULT_METRICS_ADDR: &str = "127.0.0.1:9464";

/// Dispatch service configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// SQLite database file.
    pub database_path: PathBuf,
    /// Redis connection URL for the Streams broker.
    pub redis_url: String,
    /// Base consumer group name. Each subscriber derives its own group from it.
    pub consumer_group: String,
    /// Consumer name within the groups; unique per process.
    pub consumer_name: String,
    /// How often the outbox drain runs.
    pub outbox_poll_interval: Duration,
    /// Maximum outbox rows published per drain.
    pub outbox_batch_size: usize,
    /// How often the due-retry sweeper runs.
    pub sweep_interval: Duration,
    /// Maximum deliveries re-enqueued per sweep.
    pub sweep_batch_size: usize,
    /// Timeout for a single webhook HTTP request.
    pub http_timeout: Duration,
    /// Domain event topics the delivery creator subscribes to.
    pub event_topics: Vec<String>,
    /// Listen address for `/metrics` and `/healthz`.
    pub metrics_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            redis_url: DEFAULT_REDIS_URL.to_string(),
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            consumer_name: format!("dispatch-{}", uuid::Uuid::new_v4().simple()),
            outbox_poll_interval: Duration::from_millis(5_000),
            outbox_batch_size: 100,
            sweep_interval: Duration::from_millis(5_000),
            sweep_batch_size: 100,
            http_timeout: Duration::from_millis(5_000),
            event_topics: DEFAULT_EVENT_TOPICS.iter().map(|t| t.to_string()).collect(),
            metrics_addr: DEFAULT_METRICS_ADDR
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 9464))),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

/// `~/.dispatch/dispatch.db`, or `./dispatch.db` without a home directory.
fn default_database_path() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".dispatch").join("dispatch.db"))
        .unwrap_or_else(|| PathBuf::from("dispatch.db"))
}

impl DispatchConfig {
    /// Create a new config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Consumer group used by the delivery creator.
    pub fn creator_group(&self) -> String {
        format!("{}-creator", self.consumer_group)
    }

    /// Consumer group used by the execution worker.
    pub fn delivery_group(&self) -> String {
        format!("{}-delivery", self.consumer_group)
    }

    fn load_from_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from a key lookup. Unparseable values keep the default.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("DISPATCH_DATABASE_PATH") {
            self.database_path = PathBuf::from(path);
        }
        if let Some(url) = lookup("DISPATCH_REDIS_URL") {
            self.redis_url = url;
        }
        if let Some(group) = lookup("DISPATCH_CONSUMER_GROUP") {
            self.consumer_group = group;
        }
        if let Some(name) = lookup("DISPATCH_CONSUMER_NAME") {
            self.consumer_name = name;
        }
        if let Some(ms) = parsed::<u64>(&lookup, "DISPATCH_OUTBOX_POLL_INTERVAL_MS") {
            self.outbox_poll_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(n) = parsed::<usize>(&lookup, "DISPATCH_OUTBOX_BATCH_SIZE") {
            self.outbox_batch_size = n.max(1);
        }
        if let Some(ms) = parsed::<u64>(&lookup, "DISPATCH_SWEEP_INTERVAL_MS") {
            self.sweep_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(n) = parsed::<usize>(&lookup, "DISPATCH_SWEEP_BATCH_SIZE") {
            self.sweep_batch_size = n.max(1);
        }
        if let Some(ms) = parsed::<u64>(&lookup, "DISPATCH_HTTP_TIMEOUT_MS") {
            self.http_timeout = Duration::from_millis(ms.max(1));
        }
        if let Some(topics) = lookup("DISPATCH_EVENT_TOPICS") {
            let topics: Vec<String> = topics
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
            if !topics.is_empty() {
                self.event_topics = topics;
            }
        }
        if let Some(addr) = parsed::<SocketAddr>(&lookup, "DISPATCH_METRICS_ADDR") {
            self.metrics_addr = addr;
        }
        if let Some(level) = lookup("DISPATCH_LOG_LEVEL") {
            self.log_level = level;
        }
    }
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable config value");
            None
        }
    }
}

/// Validates a webhook endpoint URL. Only absolute http(s) URLs with a host
/// are accepted.
pub fn parse_endpoint_url(raw: &str) -> CoreResult<Url> {
    let url = Url::parse(raw)?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(CoreError::UnsupportedUrl(format!(
            "scheme must be http or https: {raw}"
        )));
    }
    if url.host_str().is_none() {
        return Err(CoreError::UnsupportedUrl(format!("missing host: {raw}")));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn with(vars: &[(&str, &str)]) -> DispatchConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut config = DispatchConfig::default();
        config.apply_overrides(|key| vars.get(key).cloned());
        config
    }

    #[test]
    fn test_default_config() {
        let config = DispatchConfig::default();
        assert_eq!(config.outbox_poll_interval, Duration::from_secs(5));
        assert_eq!(config.sweep_interval, Duration::from_secs(5));
        assert_eq!(config.http_timeout, Duration::from_secs(5));
        assert_eq!(config.redis_url, DEFAULT_REDIS_URL);
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert!(config.event_topics.iter().any(|t| t == "order.created"));
        assert!(config.consumer_name.starts_with("dispatch-"));
        assert!(config.database_path.ends_with("dispatch.db"));
    }

    #[test]
    fn test_env_overrides() {
        let config = with(&[
            ("DISPATCH_DATABASE_PATH", "/tmp/d.db"),
            ("DISPATCH_OUTBOX_POLL_INTERVAL_MS", "250"),
            ("DISPATCH_SWEEP_BATCH_SIZE", "7"),
            ("DISPATCH_EVENT_TOPICS", "order.created, return.created ,,"),
            ("DISPATCH_METRICS_ADDR", "0.0.0.0:9000"),
            ("DISPATCH_CONSUMER_GROUP", "blue"),
        ]);

        assert_eq!(config.database_path, PathBuf::from("/tmp/d.db"));
        assert_eq!(config.outbox_poll_interval, Duration::from_millis(250));
        assert_eq!(config.sweep_batch_size, 7);
        assert_eq!(config.event_topics, vec!["order.created", "return.created"]);
        assert_eq!(config.metrics_addr.port(), 9000);
        assert_eq!(config.creator_group(), "blue-creator");
        assert_eq!(config.delivery_group(), "blue-delivery");
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = with(&[
            ("DISPATCH_HTTP_TIMEOUT_MS", "soon"),
            ("DISPATCH_OUTBOX_BATCH_SIZE", "-3"),
            ("DISPATCH_EVENT_TOPICS", " , "),
        ]);
        let defaults = DispatchConfig::default();

        assert_eq!(config.http_timeout, defaults.http_timeout);
        assert_eq!(config.outbox_batch_size, defaults.outbox_batch_size);
        assert_eq!(config.event_topics, defaults.event_topics);
    }

    #[test]
    fn test_zero_batch_is_clamped() {
        let config = with(&[("DISPATCH_OUTBOX_BATCH_SIZE", "0")]);
        assert_eq!(config.outbox_batch_size, 1);
    }

    #[test]
    fn test_parse_endpoint_url() {
        assert!(parse_endpoint_url("https://hooks.example.com/in").is_ok());
        assert!(parse_endpoint_url("http://localhost:8080").is_ok());
        assert!(matches!(
            parse_endpoint_url("ftp://example.com"),
            Err(CoreError::UnsupportedUrl(_))
        ));
        assert!(matches!(
            parse_endpoint_url("not a url"),
            Err(CoreError::InvalidUrl(_))
        ));
    }
}
