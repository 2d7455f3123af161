// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent configuration.
//!
//! [`Config`] deserializes with serde, every field optional, and its
//! `Default` is a runnable loopback setup. [`Config::from_env`] builds one
//! from the usual `DD_*` environment variables.

use crate::aggregator::{AggregatorConfig, HistogramAggregate};
use crate::constants;
use crate::datadog::{DdDdUrl, MetricsIntakeUrlPrefix, RetryStrategy, Site, UrlError};
use crate::dogstatsd::ListenerConfig;
use crate::health::HealthConfig;
use crate::scheduler::BackpressurePolicy;
use crate::util::{
    deserialize_duration, parse_bool, parse_duration, parse_metric_namespace, split_list,
};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

const VALID_LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Url(#[from] UrlError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Forwarder and backpressure settings.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ForwarderConfig {
    pub https_proxy: Option<String>,
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
    #[serde(skip)]
    pub retry_strategy: RetryStrategy,
    /// zstd level, `None` sends uncompressed payloads
    pub compression_level: Option<i32>,
    pub max_payload_bytes: usize,
    pub max_in_flight: usize,
    #[serde(deserialize_with = "deserialize_duration")]
    pub max_linger: Duration,
    /// Snapshots the forwarder accepts before the scheduler holds them back.
    pub queue_size: usize,
    /// Continuous failure after which the forwarder reports itself degraded.
    #[serde(deserialize_with = "deserialize_duration")]
    pub degraded_after: Duration,
    pub backpressure: BackpressurePolicy,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            https_proxy: None,
            timeout: constants::DEFAULT_REQUEST_TIMEOUT,
            retry_strategy: RetryStrategy::default(),
            compression_level: Some(constants::DEFAULT_COMPRESSION_LEVEL),
            max_payload_bytes: constants::DEFAULT_MAX_PAYLOAD_BYTES,
            max_in_flight: constants::DEFAULT_MAX_IN_FLIGHT,
            max_linger: constants::DEFAULT_MAX_LINGER,
            queue_size: constants::DEFAULT_MAX_PENDING_SNAPSHOTS,
            degraded_after: constants::DEFAULT_DEGRADED_AFTER,
            backpressure: BackpressurePolicy::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub api_key: String,
    pub site: String,
    /// Overrides the intake URL derived from `site`.
    pub dd_url: Option<String>,
    pub hostname: Option<String>,
    /// Tags added to every context, event and service check.
    pub tags: Vec<String>,
    #[serde(deserialize_with = "deserialize_duration")]
    pub flush_interval: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub shutdown_grace: Duration,
    /// Capacity of the queue between decoders and the aggregator, in batches.
    pub sample_queue_size: usize,
    pub log_level: String,
    pub listener: ListenerConfig,
    pub aggregator: AggregatorConfig,
    pub forwarder: ForwarderConfig,
    pub health: HealthConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            site: constants::DEFAULT_SITE.to_string(),
            dd_url: None,
            hostname: None,
            tags: Vec::new(),
            flush_interval: constants::DEFAULT_FLUSH_INTERVAL,
            shutdown_grace: constants::DEFAULT_SHUTDOWN_GRACE,
            sample_queue_size: constants::DEFAULT_SAMPLE_QUEUE_SIZE,
            log_level: "info".to_string(),
            listener: ListenerConfig::default(),
            aggregator: AggregatorConfig::default(),
            forwarder: ForwarderConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Config {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a configuration from `lookup`, falling back to defaults for
    /// missing or unparsable values.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Config::default();

        if let Some(api_key) = var("DD_API_KEY") {
            config.api_key = api_key.trim().to_string();
        }
        if let Some(site) = var("DD_SITE") {
            config.site = site.trim().to_string();
        }
        config.dd_url = var("DD_DD_URL");
        config.hostname = var("DD_HOSTNAME").map(|h| h.trim().to_string());
        if let Some(tags) = var("DD_TAGS") {
            config.tags = split_list(&tags);
        }
        if let Some(log_level) = var("DD_LOG_LEVEL") {
            config.log_level = log_level.trim().to_lowercase();
        }
        if let Some(interval) = parsed(&var, "DD_FLUSH_INTERVAL", parse_duration) {
            config.flush_interval = interval;
        }

        let listener = &mut config.listener;
        // 0 disables the UDP listener
        if let Some(port) = parsed(&var, "DD_DOGSTATSD_PORT", |v| v.parse::<u16>().ok()) {
            listener.port = (port != 0).then_some(port);
        }
        listener.socket_path = var("DD_DOGSTATSD_SOCKET").map(PathBuf::from);
        listener.stream_socket_path = var("DD_DOGSTATSD_STREAM_SOCKET").map(PathBuf::from);
        if let Some(non_local) = var("DD_DOGSTATSD_NON_LOCAL_TRAFFIC") {
            listener.non_local_traffic = parse_bool(&non_local);
        }
        if let Some(size) = parsed(&var, "DD_DOGSTATSD_BUFFER_SIZE", |v| v.parse().ok()) {
            listener.buffer_size = size;
        }
        if let Some(size) = parsed(&var, "DD_DOGSTATSD_QUEUE_SIZE", |v| v.parse().ok()) {
            listener.queue_size = size;
        }
        if let Some(workers) = parsed(&var, "DD_DOGSTATSD_WORKERS", |v| v.parse().ok()) {
            listener.decoder_workers = workers;
        }
        listener.metric_namespace =
            var("DD_STATSD_METRIC_NAMESPACE").and_then(|ns| parse_metric_namespace(&ns));

        if let Some(percentiles) = parsed(&var, "DD_HISTOGRAM_PERCENTILES", |v| {
            split_list(v)
                .iter()
                .map(|p| p.parse::<f64>().ok())
                .collect::<Option<Vec<_>>>()
        }) {
            config.aggregator.histogram_percentiles = percentiles;
        }
        if let Some(aggregates) = parsed(&var, "DD_HISTOGRAM_AGGREGATES", |v| {
            split_list(v)
                .iter()
                .map(|a| HistogramAggregate::from_str(a).ok())
                .collect::<Option<Vec<_>>>()
        }) {
            config.aggregator.histogram_aggregates = aggregates;
        }

        if let Some(policy) = parsed(&var, "DD_FORWARDER_BACKPRESSURE_POLICY", |v| {
            BackpressurePolicy::from_str(v).ok()
        }) {
            config.forwarder.backpressure = policy;
        }
        config.forwarder.https_proxy = var("DD_PROXY_HTTPS").or_else(|| var("HTTPS_PROXY"));

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.intake_url_prefix()?;
        if self.flush_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "flush interval must be greater than 0".to_string(),
            ));
        }
        if self.health.enabled && self.health.interval.is_zero() {
            return Err(ConfigError::Invalid(
                "health interval must be greater than 0".to_string(),
            ));
        }
        self.aggregator
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }
        Ok(())
    }

    /// Intake base URL: `dd_url` when set, otherwise derived from `site`.
    pub fn intake_url_prefix(&self) -> Result<MetricsIntakeUrlPrefix, ConfigError> {
        let dd_url = self.dd_url.as_deref().map(DdDdUrl::new).transpose()?;
        let site = match dd_url {
            Some(_) => None,
            None => Some(Site::new(self.site.as_str())?),
        };
        Ok(MetricsIntakeUrlPrefix::new(site, dd_url)?)
    }
}

fn parsed<V, T, P>(var: &V, key: &str, parse: P) -> Option<T>
where
    V: Fn(&str) -> Option<String>,
    P: Fn(&str) -> Option<T>,
{
    let raw = var(key)?;
    let value = parse(raw.trim());
    if value.is_none() {
        warn!("Ignoring invalid {}: '{}'", key, raw);
    }
    value
}
