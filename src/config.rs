//! Server configuration.
//!
//! Configuration is plain data: the connection engine reads these values and
//! never reloads them. A YAML file can be supplied through `SENTINEL_CONFIG`;
//! the listen address can always be overridden with `LISTEN`.
//!
//! ```yaml
//! listen_addr: "0.0.0.0:8080"
//! allow_synchronous_io: false
//! limits:
//!   keep_alive_timeout: 130
//!   request_headers_timeout: 30
//!   min_request_body_data_rate:
//!     bytes_per_second: 240
//!     grace_period: 5
//!   max_request_body_size: 30000000
//! ```

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,

    /// Whether handlers may use the blocking body/response calls.
    pub allow_synchronous_io: bool,

    /// How often timeouts are checked.
    #[serde(with = "secs")]
    pub heartbeat_interval: Duration,

    /// Emit a `Date` header on every response.
    pub add_date_header: bool,

    /// Value of the `Server` header, if any.
    pub server_header: Option<String>,

    pub limits: Limits,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            allow_synchronous_io: false,
            heartbeat_interval: Duration::from_secs(1),
            add_date_header: true,
            server_header: None,
            limits: Limits::default(),
        }
    }
}

/// Per-connection timing and size limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Limits {
    /// Idle time allowed between requests on a kept-alive connection.
    #[serde(with = "secs")]
    pub keep_alive_timeout: Duration,

    /// Time allowed from the first byte of a request until its header block
    /// is complete.
    #[serde(with = "secs")]
    pub request_headers_timeout: Duration,

    pub min_request_body_data_rate: Option<MinDataRate>,

    pub min_response_data_rate: Option<MinDataRate>,

    /// `None` disables the limit.
    pub max_request_body_size: Option<u64>,

    pub max_request_line_size: usize,

    pub max_request_headers_total_size: usize,

    pub max_request_header_count: usize,

    /// Time allowed to discard request body bytes the handler left unread.
    #[serde(with = "secs")]
    pub request_body_drain_timeout: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            keep_alive_timeout: Duration::from_secs(130),
            request_headers_timeout: Duration::from_secs(30),
            min_request_body_data_rate: Some(MinDataRate::new(240, Duration::from_secs(5))),
            min_response_data_rate: Some(MinDataRate::new(240, Duration::from_secs(5))),
            max_request_body_size: Some(30_000_000),
            max_request_line_size: 8 * 1024,
            max_request_headers_total_size: 32 * 1024,
            max_request_header_count: 100,
            request_body_drain_timeout: Duration::from_secs(5),
        }
    }
}

/// A minimum throughput, enforced once `grace_period` has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct MinDataRate {
    pub bytes_per_second: u64,
    #[serde(with = "secs")]
    pub grace_period: Duration,
}

impl MinDataRate {
    pub fn new(bytes_per_second: u64, grace_period: Duration) -> Self {
        Self {
            bytes_per_second,
            grace_period,
        }
    }
}

impl Config {
    /// Loads configuration from the environment.
    ///
    /// Reads the YAML file named by `SENTINEL_CONFIG` if set, then applies the
    /// `LISTEN` override.
    pub fn load() -> anyhow::Result<Self> {
        let mut cfg = match std::env::var("SENTINEL_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };

        if let Ok(listen_addr) = std::env::var("LISTEN") {
            cfg.listen_addr = listen_addr;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml_str(&content)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_yaml_str(content: &str) -> anyhow::Result<Self> {
        let cfg: Config = serde_yaml::from_str(content)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.heartbeat_interval.is_zero() {
            bail!("heartbeat_interval must be greater than zero");
        }

        let limits = &self.limits;
        for (name, rate) in [
            ("min_request_body_data_rate", limits.min_request_body_data_rate),
            ("min_response_data_rate", limits.min_response_data_rate),
        ] {
            if let Some(rate) = rate {
                if rate.bytes_per_second == 0 {
                    bail!("{name}.bytes_per_second must be greater than zero");
                }
                if rate.grace_period < self.heartbeat_interval {
                    bail!(
                        "{name}.grace_period must be at least the heartbeat interval ({:?})",
                        self.heartbeat_interval
                    );
                }
            }
        }

        if limits.max_request_line_size == 0
            || limits.max_request_headers_total_size == 0
            || limits.max_request_header_count == 0
        {
            bail!("request line and header limits must be greater than zero");
        }

        Ok(())
    }
}

/// Serde adapter storing a `Duration` as (fractional) seconds.
mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
