//! Environment configuration.

use crate::delivery::RetryPolicy;
use crate::error::ConfigError;
use crate::publisher::PublisherSettings;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
    pub api_base: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_url: String,
    pub api_key: String,
    pub from: String,
    pub to: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub url: String,
    pub request_queue: String,
    pub reply_queue: String,
    pub rpc_timeout: Duration,
    pub reconnect_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub data_dir: PathBuf,
    pub publisher: PublisherSettings,
    /// Secret for auto-registered subscriptions.
    pub webhook_secret: String,
    pub event_logger_secret: String,
    pub notifier_secret: String,
    /// URLs subscribed to every event at startup.
    pub endpoints: Vec<String>,
    pub replay_window: chrono::Duration,
    pub retry: RetryPolicy,
    pub http_timeout: Duration,
    pub worker_concurrency: usize,
    /// SUCCESS/FAILED delivery rows kept before the oldest are dropped.
    pub delivery_retention: usize,
    /// How long per-channel notification records are kept.
    pub notification_retention: chrono::Duration,
    pub telegram: Option<TelegramConfig>,
    pub email: Option<EmailConfig>,
    pub broker: BrokerConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `WEBHOOK_SECRET`: shared HMAC secret
    ///
    /// Optional (defaults in parentheses):
    /// - `BIND_ADDR` (`0.0.0.0:3000`), `DATA_DIR` (`./data`)
    /// - `APP_ENV` (`development`), `WEBHOOK_SOURCE` (`gym-api`), `WEBHOOK_VERSION` (`1.0`)
    /// - `EVENT_LOGGER_SECRET`, `NOTIFIER_SECRET` (`WEBHOOK_SECRET`)
    /// - `WEBHOOK_ENDPOINTS`: comma-separated URLs
    /// - `WEBHOOK_REPLAY_WINDOW_SECS` (300), `WEBHOOK_MAX_ATTEMPTS` (5),
    ///   `WEBHOOK_BACKOFF_BASE_MS` (2000), `WEBHOOK_BACKOFF_MAX_MS` (3600000),
    ///   `WEBHOOK_HTTP_TIMEOUT_SECS` (10), `WEBHOOK_WORKER_CONCURRENCY` (5)
    /// - `WEBHOOK_DELIVERY_RETENTION` (10000), `NOTIFICATION_RETENTION_HOURS` (168)
    /// - `TELEGRAM_BOT_TOKEN` with `TELEGRAM_CHAT_ID`, optional `TELEGRAM_API_BASE`
    /// - `EMAIL_API_URL` with `EMAIL_API_KEY`, `EMAIL_FROM`, `EMAIL_TO`
    /// - `BROKER_URL` (`amqp://localhost:5672`), `RPC_REQUEST_QUEUE`,
    ///   `RPC_REPLY_QUEUE`, `RPC_TIMEOUT_MS` (5000), `BROKER_RECONNECT_MS` (1000)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Same as [`Config::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        let webhook_secret = vars.required("WEBHOOK_SECRET")?;
        let event_logger_secret = vars
            .optional("EVENT_LOGGER_SECRET")
            .unwrap_or_else(|| webhook_secret.clone());
        let notifier_secret = vars
            .optional("NOTIFIER_SECRET")
            .unwrap_or_else(|| webhook_secret.clone());

        let max_attempts: u32 = vars.parsed("WEBHOOK_MAX_ATTEMPTS", 5)?;
        if max_attempts == 0 {
            return Err(invalid("WEBHOOK_MAX_ATTEMPTS", "must be at least 1"));
        }
        let worker_concurrency: usize = vars.parsed("WEBHOOK_WORKER_CONCURRENCY", 5)?;
        if worker_concurrency == 0 {
            return Err(invalid("WEBHOOK_WORKER_CONCURRENCY", "must be at least 1"));
        }
        let replay_secs: i64 = vars.parsed("WEBHOOK_REPLAY_WINDOW_SECS", 300)?;
        if replay_secs <= 0 {
            return Err(invalid("WEBHOOK_REPLAY_WINDOW_SECS", "must be positive"));
        }

        let retention_hours: i64 = vars.parsed("NOTIFICATION_RETENTION_HOURS", 168)?;
        if retention_hours <= 0 {
            return Err(invalid("NOTIFICATION_RETENTION_HOURS", "must be positive"));
        }

        let telegram = match vars.optional("TELEGRAM_BOT_TOKEN") {
            Some(bot_token) => Some(TelegramConfig {
                bot_token,
                chat_id: vars.required("TELEGRAM_CHAT_ID")?,
                api_base: vars.optional("TELEGRAM_API_BASE"),
            }),
            None => None,
        };

        let email = match vars.optional("EMAIL_API_URL") {
            Some(api_url) => {
                let to = split_list(&vars.required("EMAIL_TO")?);
                if to.is_empty() {
                    return Err(invalid("EMAIL_TO", "no recipients"));
                }
                Some(EmailConfig {
                    api_url,
                    api_key: vars.required("EMAIL_API_KEY")?,
                    from: vars.required("EMAIL_FROM")?,
                    to,
                })
            }
            None => None,
        };

        Ok(Self {
            bind_addr: vars.parsed("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 3000)))?,
            data_dir: PathBuf::from(vars.or("DATA_DIR", "./data")),
            publisher: PublisherSettings {
                source: vars.or("WEBHOOK_SOURCE", "gym-api"),
                environment: vars.or("APP_ENV", "development"),
                version: vars.or("WEBHOOK_VERSION", "1.0"),
            },
            webhook_secret,
            event_logger_secret,
            notifier_secret,
            endpoints: vars
                .optional("WEBHOOK_ENDPOINTS")
                .map(|v| split_list(&v))
                .unwrap_or_default(),
            replay_window: chrono::Duration::seconds(replay_secs),
            retry: RetryPolicy {
                max_attempts,
                backoff_base: Duration::from_millis(vars.parsed("WEBHOOK_BACKOFF_BASE_MS", 2000)?),
                max_delay: Duration::from_millis(vars.parsed("WEBHOOK_BACKOFF_MAX_MS", 3_600_000)?),
            },
            http_timeout: Duration::from_secs(vars.parsed("WEBHOOK_HTTP_TIMEOUT_SECS", 10)?),
            worker_concurrency,
            delivery_retention: vars.parsed("WEBHOOK_DELIVERY_RETENTION", 10_000)?,
            notification_retention: chrono::Duration::hours(retention_hours),
            telegram,
            email,
            broker: BrokerConfig {
                url: vars.or("BROKER_URL", "amqp://localhost:5672"),
                request_queue: vars.or("RPC_REQUEST_QUEUE", "gym.rpc.requests"),
                reply_queue: vars.or("RPC_REPLY_QUEUE", "gym.rpc.replies"),
                rpc_timeout: Duration::from_millis(vars.parsed("RPC_TIMEOUT_MS", 5000)?),
                reconnect_interval: Duration::from_millis(
                    vars.parsed("BROKER_RECONNECT_MS", 1000)?,
                ),
            },
        })
    }
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Unset and blank are treated alike.
    fn optional(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn or(&self, var: &str, default: &str) -> String {
        self.optional(var).unwrap_or_else(|| default.to_string())
    }

    fn required(&self, var: &str) -> Result<String, ConfigError> {
        self.optional(var).ok_or_else(|| ConfigError::Missing {
            var: var.to_string(),
        })
    }

    fn parsed<T>(&self, var: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(var) {
            Some(v) => v
                .parse()
                .map_err(|e: T::Err| invalid(var, &format!("{v:?}: {e}"))),
            None => Ok(default),
        }
    }
}

fn invalid(var: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        var: var.to_string(),
        reason: reason.to_string(),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
