//! Connector configuration
//!
//! Everything is read from the environment once at startup. Variable names
//! follow the dotted property names of the feed settings (`gnip.account.name`
//! is `GNIP_ACCOUNT_NAME`).

use chrono::{DateTime, NaiveDateTime, Utc};
use core_config::{
    env_optional, env_or_default, env_parse_optional, env_parse_or, env_required,
    property_env_name, ConfigError, FromEnv,
};
use std::fmt;
use std::time::Duration;
use stream_producer::{PipelineConfig, RateLimit, RedisStreamConfig, RetryPolicy};
use strum::{Display, EnumString};
use tracing::info;

/// Replay dates use minute precision, e.g. `201501011230`
pub const REPLAY_DATE_FORMAT: &str = "%Y%m%d%H%M";

const DEFAULT_HOST: &str = "https://gnip-stream.twitter.com";

/// Where records come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum SourceKind {
    /// Long-lived HTTP streaming connection
    Http,
    /// Newline-delimited records on standard input
    Stdin,
}

/// Basic-auth credentials; the password never shows up in `Debug`
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Historical window for replay streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl ReplayWindow {
    /// Parse both ends in [`REPLAY_DATE_FORMAT`]; `from` must precede `to`.
    pub fn parse(from: &str, to: &str) -> Result<Self, ConfigError> {
        let from = parse_replay_date("GNIP_FROM_DATE", from)?;
        let to = parse_replay_date("GNIP_TO_DATE", to)?;
        if from >= to {
            return Err(ConfigError::invalid(
                "GNIP_FROM_DATE",
                format!("replay window start {} is not before its end {}", from, to),
            ));
        }
        Ok(Self { from, to })
    }
}

fn parse_replay_date(key: &str, raw: &str) -> Result<DateTime<Utc>, ConfigError> {
    NaiveDateTime::parse_from_str(raw.trim(), REPLAY_DATE_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| ConfigError::ParseError {
            key: key.to_string(),
            details: format!("{} (value: {:?}, expected yyyyMMddHHmm)", e, raw),
        })
}

/// Streaming endpoint settings
#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    pub host: String,
    pub account: String,
    pub product: String,
    pub label: String,
    pub publisher: String,
    /// Partitioned-stream client id; only ids above zero are sent
    pub client_id: Option<u32>,
    pub credentials: Credentials,
    pub replay: Option<ReplayWindow>,
    pub connect_timeout: Duration,
    /// Reconnect when no bytes (not even keep-alives) arrive for this long
    pub stall_timeout: Duration,
    /// Backoff between reconnect attempts
    pub reconnect: RetryPolicy,
}

impl HttpSourceConfig {
    /// Full endpoint URL including client id and replay window.
    pub fn endpoint_url(&self) -> String {
        let kind = if self.replay.is_some() { "replay" } else { "stream" };
        let mut url = format!(
            "{}/{}/{}/accounts/{}/publishers/{}/{}.json",
            self.host.trim_end_matches('/'),
            kind,
            self.product,
            self.account,
            self.publisher,
            self.label
        );

        let mut query = Vec::new();
        if let Some(client_id) = self.client_id.filter(|id| *id > 0) {
            query.push(format!("client={}", client_id));
        }
        if let Some(window) = &self.replay {
            query.push(format!("fromDate={}", window.from.format(REPLAY_DATE_FORMAT)));
            query.push(format!("toDate={}", window.to.format(REPLAY_DATE_FORMAT)));
        }
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query.join("&"));
        }
        url
    }
}

impl FromEnv for HttpSourceConfig {
    /// - `GNIP_ACCOUNT_NAME`, `GNIP_PRODUCT`, `GNIP_STREAM_LABEL` (required)
    /// - `GNIP_USER_NAME`, `GNIP_USER_PASSWORD` (required)
    /// - `GNIP_PUBLISHER` (default `twitter`), `GNIP_CLIENT_ID`, `GNIP_HOST`
    /// - `GNIP_REPLAY` (`true` enables replay), `GNIP_FROM_DATE`, `GNIP_TO_DATE`
    /// - `SOURCE_CONNECT_TIMEOUT_SECS` (10), `SOURCE_STALL_TIMEOUT_SECS` (90)
    /// - `SOURCE_RECONNECT_BASE_MS` (1000), `SOURCE_RECONNECT_CAP_SECS` (300)
    fn from_env() -> Result<Self, ConfigError> {
        let property = |name: &str| property_env_name(name);

        let replay_enabled = env_optional(&property("gnip.replay"))
            .map(|raw| raw.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let replay = if replay_enabled {
            Some(ReplayWindow::parse(
                &env_required(&property("gnip.from.date"))?,
                &env_required(&property("gnip.to.date"))?,
            )?)
        } else {
            None
        };

        let reconnect = RetryPolicy::new()
            .with_max_attempts(u32::MAX)
            .with_base_delay(Duration::from_millis(env_parse_or(
                "SOURCE_RECONNECT_BASE_MS",
                1_000,
            )?))
            .with_max_delay(Duration::from_secs(env_parse_or(
                "SOURCE_RECONNECT_CAP_SECS",
                300,
            )?));
        reconnect
            .validate()
            .map_err(|e| ConfigError::invalid("SOURCE_RECONNECT_BASE_MS", e.to_string()))?;

        Ok(Self {
            host: env_or_default("GNIP_HOST", DEFAULT_HOST),
            account: env_required(&property("gnip.account.name"))?,
            product: env_required(&property("gnip.product"))?,
            label: env_required(&property("gnip.stream.label"))?,
            publisher: env_or_default(&property("gnip.publisher"), "twitter"),
            client_id: env_parse_optional(&property("gnip.client.id"))?,
            credentials: Credentials {
                username: env_required(&property("gnip.user.name"))?,
                password: env_required(&property("gnip.user.password"))?,
            },
            replay,
            connect_timeout: Duration::from_secs(env_parse_or("SOURCE_CONNECT_TIMEOUT_SECS", 10)?),
            stall_timeout: Duration::from_secs(env_parse_or("SOURCE_STALL_TIMEOUT_SECS", 90)?),
            reconnect,
        })
    }
}

/// Selected record source
#[derive(Debug, Clone)]
pub enum SourceConfig {
    Http(HttpSourceConfig),
    Stdin,
}

impl FromEnv for SourceConfig {
    /// `FIREHOSE_SOURCE`: `http` (default) or `stdin`
    fn from_env() -> Result<Self, ConfigError> {
        match env_parse_or("FIREHOSE_SOURCE", SourceKind::Http)? {
            SourceKind::Http => Ok(SourceConfig::Http(HttpSourceConfig::from_env()?)),
            SourceKind::Stdin => Ok(SourceConfig::Stdin),
        }
    }
}

/// Complete connector configuration
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub pipeline: PipelineConfig,
    pub redis: RedisStreamConfig,
    pub source: SourceConfig,
    pub health_port: u16,
}

impl FromEnv for ConnectorConfig {
    /// `FIREHOSE_HEALTH_PORT`, then `HEALTH_PORT`, then 8080
    fn from_env() -> Result<Self, ConfigError> {
        let health_port = match env_parse_optional("FIREHOSE_HEALTH_PORT")? {
            Some(port) => port,
            None => env_parse_or("HEALTH_PORT", 8080)?,
        };

        Ok(Self {
            pipeline: PipelineConfig::from_env()?,
            redis: RedisStreamConfig::from_env()?,
            source: SourceConfig::from_env()?,
            health_port,
        })
    }
}

impl ConnectorConfig {
    /// Resolved settings as `(property, value)` pairs, secrets redacted
    pub fn properties(&self) -> Vec<(&'static str, String)> {
        let pipeline = &self.pipeline;
        let rate_limit = match pipeline.rate_limit {
            RateLimit::Disabled => "unlimited".to_string(),
            RateLimit::PerSecond { per_second, burst } => {
                format!("{}/s (burst {})", per_second, burst)
            }
        };

        let mut properties = vec![
            ("stream.name", pipeline.stream_name.clone()),
            ("shard.count", pipeline.shard_count.get().to_string()),
            ("producer.thread.count", pipeline.worker_count.to_string()),
            ("message.queue.size", pipeline.queue_capacity.to_string()),
            ("partitioner", pipeline.partition_strategy.to_string()),
            ("rate.limit", rate_limit),
            ("retry.max.attempts", pipeline.retry.max_attempts.to_string()),
            ("queue.full.policy", format!("{:?}", pipeline.full_queue_policy)),
            ("shutdown.policy", pipeline.shutdown_policy.to_string()),
            (
                "metric.report.interval.seconds",
                pipeline.report_interval.as_secs().to_string(),
            ),
            ("redis.url", self.redis.redis.redacted_url()),
            ("health.port", self.health_port.to_string()),
        ];

        match &self.source {
            SourceConfig::Stdin => properties.push(("firehose.source", "stdin".to_string())),
            SourceConfig::Http(http) => {
                properties.push(("firehose.source", "http".to_string()));
                properties.push(("gnip.endpoint", http.endpoint_url()));
                properties.push(("gnip.user.name", http.credentials.username.clone()));
                properties.push(("gnip.user.password", "***".to_string()));
            }
        }
        properties
    }

    /// Log every resolved setting once at startup
    pub fn log_properties(&self) {
        for (key, value) in self.properties() {
            info!(property = key, value = %value, "Configuration");
        }
    }
}
