//! Gateway configuration, read from the environment.

use anyhow::{bail, Context};
use common::BackoffConfig;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Longest accepted heartbeat interval.
pub const MAX_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3600);

/// Origins allowed to call the gateway from a browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedOrigins {
    Any,
    List(Vec<String>),
}

impl FromStr for AllowedOrigins {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let origins: Vec<String> = s
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(String::from)
            .collect();
        if origins.is_empty() || origins.iter().any(|o| o == "*") {
            Ok(AllowedOrigins::Any)
        } else {
            Ok(AllowedOrigins::List(origins))
        }
    }
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub execution_url: String,
    pub execution_timeout: Duration,
    pub execution_startup_check: bool,
    pub event_bus_url: String,
    pub event_bus_reconnect: BackoffConfig,
    pub signing_secret: String,
    pub signature_bucket: Duration,
    pub signature_window: Duration,
    pub reservation_timeout: Duration,
    pub idle_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub allowed_origins: AllowedOrigins,
    pub max_subscriptions_per_token: usize,
    pub topic_prefix: String,
    pub subscription_queue_size: usize,
    pub stream_buffer_size: usize,
    /// Consecutive execution failures before a subscription is closed. Zero disables.
    pub max_consecutive_failures: u32,
    pub enable_publish_endpoint: bool,
    /// Zero disables the Prometheus exporter.
    pub metrics_port: u16,
}

impl GatewayConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        fn parse<T>(key: &str, raw: String) -> anyhow::Result<T>
        where
            T: FromStr,
            T::Err: std::error::Error + Send + Sync + 'static,
        {
            raw.trim()
                .parse()
                .with_context(|| format!("{} has an invalid value: {:?}", key, raw))
        }

        let millis = |key: &str, default: &str| -> anyhow::Result<Duration> {
            Ok(Duration::from_millis(parse(key, var(key, default))?))
        };
        let secs = |key: &str, default: &str| -> anyhow::Result<Duration> {
            Ok(Duration::from_secs(parse(key, var(key, default))?))
        };

        let signing_secret = lookup("SIGNING_SECRET").context("SIGNING_SECRET must be set")?;
        if signing_secret.len() < execution::signing::MIN_SECRET_LEN {
            bail!(
                "SIGNING_SECRET must be at least {} bytes",
                execution::signing::MIN_SECRET_LEN
            );
        }

        let heartbeat_interval = secs("HEARTBEAT_INTERVAL_SECS", "15")?;
        if heartbeat_interval.is_zero() || heartbeat_interval > MAX_HEARTBEAT_INTERVAL {
            bail!(
                "HEARTBEAT_INTERVAL_SECS must be between 1 and {}",
                MAX_HEARTBEAT_INTERVAL.as_secs()
            );
        }

        let subscription_queue_size: usize =
            parse("SUBSCRIPTION_QUEUE_SIZE", var("SUBSCRIPTION_QUEUE_SIZE", "64"))?;
        let stream_buffer_size: usize =
            parse("STREAM_BUFFER_SIZE", var("STREAM_BUFFER_SIZE", "256"))?;
        if subscription_queue_size == 0 || stream_buffer_size == 0 {
            bail!("SUBSCRIPTION_QUEUE_SIZE and STREAM_BUFFER_SIZE must be greater than zero");
        }

        Ok(Self {
            bind_addr: parse("GATEWAY_BIND_ADDR", var("GATEWAY_BIND_ADDR", "0.0.0.0:4000"))?,
            execution_url: var("EXECUTION_ENGINE_URL", "http://localhost:4001/graphql"),
            execution_timeout: millis("EXECUTION_TIMEOUT_MS", "5000")?,
            execution_startup_check: parse(
                "EXECUTION_STARTUP_CHECK",
                var("EXECUTION_STARTUP_CHECK", "true"),
            )?,
            event_bus_url: var("EVENT_BUS_URL", "redis://localhost:6379"),
            event_bus_reconnect: BackoffConfig {
                initial_delay: millis("EVENT_BUS_RECONNECT_INITIAL_MS", "500")?,
                max_delay: millis("EVENT_BUS_RECONNECT_MAX_MS", "30000")?,
                max_attempts: None,
            },
            signing_secret,
            signature_bucket: millis("SIGNATURE_BUCKET_MS", "1000")?,
            signature_window: millis("SIGNATURE_WINDOW_MS", "30000")?,
            reservation_timeout: secs("RESERVATION_TIMEOUT_SECS", "30")?,
            idle_timeout: secs("IDLE_TIMEOUT_SECS", "300")?,
            heartbeat_interval,
            allowed_origins: parse("ALLOWED_ORIGINS", var("ALLOWED_ORIGINS", "*"))?,
            max_subscriptions_per_token: parse(
                "MAX_SUBSCRIPTIONS_PER_TOKEN",
                var("MAX_SUBSCRIPTIONS_PER_TOKEN", "32"),
            )?,
            topic_prefix: var("TOPIC_PREFIX", ""),
            subscription_queue_size,
            stream_buffer_size,
            max_consecutive_failures: parse(
                "MAX_CONSECUTIVE_FAILURES",
                var("MAX_CONSECUTIVE_FAILURES", "0"),
            )?,
            enable_publish_endpoint: parse(
                "ENABLE_PUBLISH_ENDPOINT",
                var("ENABLE_PUBLISH_ENDPOINT", "false"),
            )?,
            metrics_port: parse("METRICS_PORT", var("METRICS_PORT", "9095"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config =
            GatewayConfig::from_lookup(lookup(&[("SIGNING_SECRET", "0123456789abcdef")])).unwrap();

        assert_eq!(config.bind_addr, "0.0.0.0:4000".parse().unwrap());
        assert_eq!(config.execution_url, "http://localhost:4001/graphql");
        assert_eq!(config.execution_timeout, Duration::from_secs(5));
        assert!(config.execution_startup_check);
        assert_eq!(config.event_bus_url, "redis://localhost:6379");
        assert_eq!(config.event_bus_reconnect.max_delay, Duration::from_secs(30));
        assert_eq!(config.signature_bucket, Duration::from_secs(1));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(config.allowed_origins, AllowedOrigins::Any);
        assert_eq!(config.max_subscriptions_per_token, 32);
        assert_eq!(config.topic_prefix, "");
        assert_eq!(config.max_consecutive_failures, 0);
        assert!(!config.enable_publish_endpoint);
        assert_eq!(config.metrics_port, 9095);
    }

    #[test]
    fn test_overrides() {
        let config = GatewayConfig::from_lookup(lookup(&[
            ("SIGNING_SECRET", "0123456789abcdef"),
            ("GATEWAY_BIND_ADDR", "127.0.0.1:9000"),
            ("ALLOWED_ORIGINS", "https://a.example, https://b.example"),
            ("TOPIC_PREFIX", "app:"),
            ("ENABLE_PUBLISH_ENDPOINT", "true"),
            ("IDLE_TIMEOUT_SECS", "60"),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(
            config.allowed_origins,
            AllowedOrigins::List(vec![
                "https://a.example".to_string(),
                "https://b.example".to_string()
            ])
        );
        assert_eq!(config.topic_prefix, "app:");
        assert!(config.enable_publish_endpoint);
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_rejects_missing_or_short_secret() {
        assert!(GatewayConfig::from_lookup(lookup(&[])).is_err());
        assert!(GatewayConfig::from_lookup(lookup(&[("SIGNING_SECRET", "short")])).is_err());
    }

    #[test]
    fn test_heartbeat_interval_bounds() {
        for value in ["0", "3601", "18446744073709551615"] {
            let err = GatewayConfig::from_lookup(lookup(&[
                ("SIGNING_SECRET", "0123456789abcdef"),
                ("HEARTBEAT_INTERVAL_SECS", value),
            ]))
            .unwrap_err();
            assert!(err.to_string().contains("HEARTBEAT_INTERVAL_SECS"));
        }

        let config = GatewayConfig::from_lookup(lookup(&[
            ("SIGNING_SECRET", "0123456789abcdef"),
            ("HEARTBEAT_INTERVAL_SECS", "3600"),
        ]))
        .unwrap();
        assert_eq!(config.heartbeat_interval, MAX_HEARTBEAT_INTERVAL);
    }

    #[test]
    fn test_invalid_number_names_the_variable() {
        let err = GatewayConfig::from_lookup(lookup(&[
            ("SIGNING_SECRET", "0123456789abcdef"),
            ("EXECUTION_TIMEOUT_MS", "soon"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("EXECUTION_TIMEOUT_MS"));
    }
}
