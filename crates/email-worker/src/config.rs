//! Configuration for the email worker.

use crate::error::{WorkerError, WorkerResult};
use std::time::Duration;
use url::Url;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5672;
pub const DEFAULT_USERNAME: &str = "ops1";
pub const DEFAULT_PASSWORD: &str = "ops1";
pub const DEFAULT_VHOST: &str = "/";
pub const DEFAULT_QUEUE: &str = "ordering.emailworker";
pub const DEFAULT_AUTHORIZED_SENDER: &str = "ops0";

/// Worker configuration.
///
/// Read once at startup; not reloadable.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Broker host name
    pub host: String,

    /// Broker port
    pub port: u16,

    /// Broker user name
    pub username: String,

    /// Broker password (never logged)
    pub password: String,

    /// AMQP virtual host
    pub vhost: String,

    /// Pre-existing queue to consume from (declared passively)
    pub queue: String,

    /// The only producer identity whose messages are processed
    pub authorized_sender: String,

    /// Consumer tag (unique per instance)
    pub consumer_tag: String,

    /// Lower bound of the simulated send latency
    pub send_delay_min: Duration,

    /// Upper bound of the simulated send latency
    pub send_delay_max: Duration,

    /// Maximum number of payload bytes echoed into the receipt log line
    pub preview_len: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            username: DEFAULT_USERNAME.to_string(),
            password: DEFAULT_PASSWORD.to_string(),
            vhost: DEFAULT_VHOST.to_string(),
            queue: DEFAULT_QUEUE.to_string(),
            authorized_sender: DEFAULT_AUTHORIZED_SENDER.to_string(),
            consumer_tag: format!("email-worker-{}", uuid::Uuid::new_v4()),
            send_delay_min: Duration::from_millis(1000),
            send_delay_max: Duration::from_millis(2000),
            preview_len: 256,
        }
    }
}

impl WorkerConfig {
    /// Build a config from defaults overridden by environment variables.
    pub fn from_env() -> WorkerResult<Self> {
        let defaults = Self::default();

        let host = std::env::var("RABBIT_HOSTNAME").unwrap_or(defaults.host);

        let port = match std::env::var("RABBIT_PORT") {
            Ok(s) => s
                .parse()
                .map_err(|_| WorkerError::Config(format!("RABBIT_PORT is not a port: {}", s)))?,
            Err(_) => defaults.port,
        };

        let username = std::env::var("RABBIT_USERNAME").unwrap_or(defaults.username);
        let password = std::env::var("RABBIT_PASSWORD").unwrap_or(defaults.password);
        let vhost = std::env::var("RABBIT_VHOST").unwrap_or(defaults.vhost);
        let queue = std::env::var("EMAIL_WORKER_QUEUE").unwrap_or(defaults.queue);
        let authorized_sender =
            std::env::var("EMAIL_WORKER_SENDER").unwrap_or(defaults.authorized_sender);

        let send_delay_min = std::env::var("EMAIL_WORKER_DELAY_MIN_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.send_delay_min);

        let send_delay_max = std::env::var("EMAIL_WORKER_DELAY_MAX_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.send_delay_max);

        let config = Self {
            host,
            port,
            username,
            password,
            vhost,
            queue,
            authorized_sender,
            consumer_tag: defaults.consumer_tag,
            send_delay_min,
            send_delay_max,
            preview_len: defaults.preview_len,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that the rest of the worker relies on.
    pub fn validate(&self) -> WorkerResult<()> {
        if self.queue.trim().is_empty() {
            return Err(WorkerError::Config("queue name must not be empty".into()));
        }
        if self.authorized_sender.is_empty() {
            return Err(WorkerError::Config(
                "authorized sender must not be empty".into(),
            ));
        }
        if self.send_delay_min > self.send_delay_max {
            return Err(WorkerError::Config(format!(
                "send delay range is inverted: {:?} > {:?}",
                self.send_delay_min, self.send_delay_max
            )));
        }
        Ok(())
    }

    /// AMQP URI for the broker, with credentials and vhost percent-encoded.
    pub fn amqp_uri(&self) -> WorkerResult<String> {
        let invalid = || WorkerError::Config(format!("invalid broker host: {}", self.host));

        let mut url = Url::parse(&format!("amqp://{}", self.host)).map_err(|_| invalid())?;
        url.set_port(Some(self.port)).map_err(|_| invalid())?;
        url.set_username(&self.username).map_err(|_| invalid())?;
        url.set_password(Some(&self.password))
            .map_err(|_| invalid())?;

        // The default vhost is an empty path; others are one percent-encoded
        // path segment, so "/" becomes %2F and a space %20.
        if self.vhost != DEFAULT_VHOST {
            url.path_segments_mut()
                .map_err(|_| invalid())?
                .push(&self.vhost);
        }

        Ok(url.to_string())
    }

    /// Broker address without credentials, for logging.
    pub fn redacted_endpoint(&self) -> String {
        format!("amqp://{}:{}{}", self.host, self.port, self.vhost)
    }
}
