//! YAML configuration for the bridge process.
//!
//! ```yaml
//! server:
//!   port: 8554
//! auth:
//!   enabled: true
//!   username: user
//!   password: pass
//! streams:
//!   cam1:
//!     url: https://example.com/stream.m3u8
//! metrics:
//!   enabled: true
//!   interval: 30s
//! reconnect_delay: 5s
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::auth::Credentials;
use crate::error::{Error, Result};

/// Top-level configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub auth: AuthConfig,

    /// Sources keyed by stream name; the name is the RTSP path.
    #[serde(default)]
    pub streams: BTreeMap<String, StreamConfig>,

    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Wait between a failed or ended connection and the next attempt.
    #[serde(default = "default_reconnect_delay", deserialize_with = "deserialize_duration")]
    pub reconnect_delay: Duration,
}

/// RTSP listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    /// TCP port; accepts `8554` or `"8554"`.
    #[serde(default = "default_port", deserialize_with = "deserialize_port")]
    pub port: u16,

    /// Host advertised in SDP instead of the one inferred per request.
    #[serde(default)]
    pub public_host: Option<String>,
}

fn default_port() -> u16 {
    8554
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            public_host: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    #[serde(default)]
    pub url: String,
}

/// Drift/jitter reporting.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    #[serde(default = "default_metrics_interval", deserialize_with = "deserialize_duration")]
    pub interval: Duration,
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_interval() -> Duration {
    Duration::from_secs(30)
}

/// Upper bound for configured delays and intervals.
pub const MAX_DURATION: Duration = Duration::from_secs(7 * 24 * 3600);

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(5)
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            interval: default_metrics_interval(),
        }
    }
}

impl Config {
    /// Read, parse and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {}", path.display(), e)))?;
        Self::from_yaml(&data)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(data).map_err(|e| Error::Config(format!("parse: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.streams.is_empty() {
            return Err(Error::Config("no streams configured".to_string()));
        }

        for (name, stream) in &self.streams {
            if name.is_empty() || name.contains('/') {
                return Err(Error::Config(format!("invalid stream name {:?}", name)));
            }
            if stream.url.is_empty() {
                return Err(Error::Config(format!("stream {:?}: url is required", name)));
            }
            let url = url::Url::parse(&stream.url)
                .map_err(|e| Error::Config(format!("stream {:?}: {}", name, e)))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(Error::Config(format!(
                    "stream {:?}: unsupported scheme {:?}",
                    name,
                    url.scheme()
                )));
            }
        }

        if self.auth.enabled && self.auth.username.is_empty() {
            return Err(Error::Config("auth enabled without a username".to_string()));
        }
        if self.metrics.interval.is_zero() {
            return Err(Error::Config("metrics interval must be non-zero".to_string()));
        }
        if self.metrics.interval > MAX_DURATION || self.reconnect_delay > MAX_DURATION {
            return Err(Error::Config(format!(
                "metrics interval and reconnect delay must not exceed {}s",
                MAX_DURATION.as_secs()
            )));
        }

        Ok(())
    }

    /// Credentials clients must present, when auth is enabled.
    pub fn credentials(&self) -> Option<Credentials> {
        self.auth
            .enabled
            .then(|| Credentials::new(&self.auth.username, &self.auth.password))
    }

    /// Address the RTSP listener binds to.
    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.server.port)
    }
}

fn deserialize_port<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(port) => Ok(port),
        Port::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid port {:?}", text))),
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

/// Parse durations such as `30s`, `500ms`, `1.5m` or `1h30m`.
pub fn parse_duration(text: &str) -> std::result::Result<Duration, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = 0.0f64;
    let mut rest = text;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(number_len);
        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);

        let value: f64 = number
            .parse()
            .map_err(|_| format!("invalid duration {:?}", text))?;
        let scale = match unit {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(format!("invalid duration unit in {:?}", text)),
        };
        total += value * scale;
        rest = tail;
    }

    Duration::try_from_secs_f64(total).map_err(|_| format!("duration {:?} out of range", text))
}
