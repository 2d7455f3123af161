// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Types and client for the Datadog intake API.

use crate::aggregator::{SeriesPoint, SeriesType};
use crate::constants;
use crate::event::{Event, ServiceCheck};
use crate::flusher::ShippingError;
use regex::Regex;
use reqwest::{Client, Response, StatusCode};
use serde::Serialize;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UrlError {
    #[error("invalid site '{0}', expected characters [a-zA-Z0-9._:-]")]
    Site(String),
    #[error("invalid URL '{0}', expected http:// or https://")]
    Url(String),
    #[error("neither a site nor a URL override was provided")]
    Missing,
}

#[allow(clippy::unwrap_used)]
fn site_regex() -> &'static Regex {
    static SITE: OnceLock<Regex> = OnceLock::new();
    SITE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9._:-]+$").unwrap())
}

#[allow(clippy::unwrap_used)]
fn url_regex() -> &'static Regex {
    static URL: OnceLock<Regex> = OnceLock::new();
    URL.get_or_init(|| Regex::new(r"^https?://[a-zA-Z0-9._:\-\[\]]+(/[^\s]*)?$").unwrap())
}

/// Datadog site, e.g. `datadoghq.com` or `datadoghq.eu`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Site(String);

impl Site {
    pub fn new(site: impl Into<String>) -> Result<Self, UrlError> {
        let site = site.into();
        if site_regex().is_match(&site) {
            Ok(Self(site))
        } else {
            Err(UrlError::Site(site))
        }
    }
}

/// Full base URL override, `DD_DD_URL`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DdDdUrl(String);

impl DdDdUrl {
    pub fn new(url: impl Into<String>) -> Result<Self, UrlError> {
        let url = url.into();
        if url_regex().is_match(&url) {
            Ok(Self(url.trim_end_matches('/').to_string()))
        } else {
            Err(UrlError::Url(url))
        }
    }
}

/// Scheme and host every intake path is appended to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricsIntakeUrlPrefix(String);

impl MetricsIntakeUrlPrefix {
    /// The URL override wins over the site.
    pub fn new(site: Option<Site>, dd_url: Option<DdDdUrl>) -> Result<Self, UrlError> {
        match (dd_url, site) {
            (Some(DdDdUrl(url)), _) => Ok(Self(url)),
            (None, Some(Site(site))) => Ok(Self(format!("https://api.{site}"))),
            (None, None) => Err(UrlError::Missing),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RetryStrategy {
    /// Up to n attempts, no delay.
    Immediate(u64),
    /// Up to n attempts, fixed delay in milliseconds.
    LinearBackoff(u64, u64),
    /// Doubling delay from `base_delay` capped at `max_delay`; gives up after
    /// `max_attempts` or once `max_elapsed` would be exceeded.
    Exponential {
        max_attempts: u64,
        base_delay: Duration,
        max_delay: Duration,
        max_elapsed: Duration,
    },
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::Exponential {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            max_elapsed: Duration::from_secs(30),
        }
    }
}

impl RetryStrategy {
    pub fn max_attempts(&self) -> u64 {
        match self {
            Self::Immediate(n) | Self::LinearBackoff(n, _) => (*n).max(1),
            Self::Exponential { max_attempts, .. } => (*max_attempts).max(1),
        }
    }

    /// Wait before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn delay(&self, attempt: u64) -> Duration {
        match self {
            Self::Immediate(_) => Duration::ZERO,
            Self::LinearBackoff(_, ms) => Duration::from_millis(*ms),
            Self::Exponential {
                base_delay,
                max_delay,
                ..
            } => {
                let exp = u32::try_from(attempt.saturating_sub(1)).unwrap_or(u32::MAX).min(16);
                base_delay.saturating_mul(1 << exp).min(*max_delay)
            }
        }
    }

    fn max_elapsed(&self) -> Option<Duration> {
        match self {
            Self::Exponential { max_elapsed, .. } => Some(*max_elapsed),
            _ => None,
        }
    }
}

/// Transient responses worth retrying.
pub fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Series,
    CheckRun,
    Events,
}

impl Endpoint {
    pub fn path(self) -> &'static str {
        match self {
            Self::Series => constants::SERIES_PATH,
            Self::CheckRun => constants::CHECK_RUN_PATH,
            Self::Events => constants::EVENTS_PATH,
        }
    }

    /// JSON surrounding the comma separated items of one payload.
    fn envelope(self) -> (&'static str, &'static str) {
        match self {
            Self::Series => (r#"{"series":["#, "]}"),
            Self::CheckRun => ("[", "]"),
            Self::Events => (r#"{"events":{"api":["#, "]}}"),
        }
    }
}

#[derive(Debug, Serialize)]
struct Point {
    timestamp: i64,
    value: f64,
}

#[derive(Debug, Serialize)]
struct Resource<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
}

/// One element of the v2 series payload.
#[derive(Debug, Serialize)]
pub struct Series<'a> {
    metric: &'a str,
    #[serde(rename = "type")]
    kind: u8,
    points: [Point; 1],
    tags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    resources: Vec<Resource<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    interval: Option<u64>,
}

impl<'a> Series<'a> {
    pub fn new(point: &'a SeriesPoint, timestamp: i64, interval: Duration) -> Self {
        let kind = match point.series_type {
            SeriesType::Count => 1,
            SeriesType::Rate => 2,
            SeriesType::Gauge => 3,
        };
        Self {
            metric: point.name.as_str(),
            kind,
            points: [Point {
                timestamp,
                value: point.value,
            }],
            tags: point.tags.to_strings(),
            resources: point
                .host
                .as_ref()
                .map(|h| {
                    vec![Resource {
                        name: h.as_str(),
                        kind: "host",
                    }]
                })
                .unwrap_or_default(),
            interval: (point.series_type != SeriesType::Gauge).then(|| interval.as_secs()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CheckRun<'a> {
    check: &'a str,
    host_name: &'a str,
    timestamp: i64,
    status: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
    tags: Vec<String>,
}

impl<'a> CheckRun<'a> {
    pub fn new(check: &'a ServiceCheck, default_timestamp: i64) -> Self {
        Self {
            check: &check.name,
            host_name: check.host.as_deref().unwrap_or_default(),
            timestamp: check.timestamp.unwrap_or(default_timestamp),
            status: check.status as u8,
            message: check.message.as_deref(),
            tags: check.tags.to_strings(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct IntakeEvent<'a> {
    title: &'a str,
    text: &'a str,
    date_happened: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    host: Option<&'a str>,
    priority: crate::event::Priority,
    alert_type: crate::event::AlertType,
    #[serde(skip_serializing_if = "Option::is_none")]
    aggregation_key: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_type_name: Option<&'a str>,
    tags: Vec<String>,
}

impl<'a> IntakeEvent<'a> {
    pub fn new(event: &'a Event, default_timestamp: i64) -> Self {
        Self {
            title: &event.title,
            text: &event.text,
            date_happened: event.timestamp.unwrap_or(default_timestamp),
            host: event.host.as_deref(),
            priority: event.priority,
            alert_type: event.alert_type,
            aggregation_key: event.aggregation_key.as_deref(),
            source_type_name: event.source_type_name.as_deref(),
            tags: event.tags.to_strings(),
        }
    }
}

/// Payloads built for one endpoint.
#[derive(Debug, Default)]
pub struct SplitPayloads {
    pub payloads: Vec<Vec<u8>>,
    /// Items that alone exceed the size ceiling, or fail to serialize.
    pub dropped: usize,
}

/// Serializes `items` into as few JSON payloads as fit under `max_bytes`.
pub fn split_payloads<T: Serialize>(
    endpoint: Endpoint,
    items: &[T],
    max_bytes: usize,
) -> SplitPayloads {
    let (prefix, suffix) = endpoint.envelope();
    let overhead = prefix.len() + suffix.len();
    let mut out = SplitPayloads::default();
    let mut current: Vec<u8> = Vec::new();

    for item in items {
        let encoded = match serde_json::to_vec(item) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!("Failed to serialize payload item: {}", e);
                out.dropped += 1;
                continue;
            }
        };
        if encoded.len() + overhead > max_bytes {
            warn!(
                "Dropping item of {} bytes, larger than the {} byte payload ceiling",
                encoded.len(),
                max_bytes
            );
            out.dropped += 1;
            continue;
        }
        // +1 for the separating comma
        if !current.is_empty() && current.len() + 1 + encoded.len() + suffix.len() > max_bytes {
            current.extend_from_slice(suffix.as_bytes());
            out.payloads.push(std::mem::take(&mut current));
        }
        if current.is_empty() {
            current.extend_from_slice(prefix.as_bytes());
        } else {
            current.push(b',');
        }
        current.extend_from_slice(&encoded);
    }
    if !current.is_empty() {
        current.extend_from_slice(suffix.as_bytes());
        out.payloads.push(current);
    }
    out
}

/// Client for the intake endpoints.
#[derive(Clone, Debug)]
pub struct DdApi {
    api_key: String,
    metrics_intake_url_prefix: MetricsIntakeUrlPrefix,
    client: Client,
    retry_strategy: RetryStrategy,
    compression_level: Option<i32>,
}

impl DdApi {
    /// `compression_level` of `None` sends plain JSON.
    pub fn new(
        api_key: String,
        metrics_intake_url_prefix: MetricsIntakeUrlPrefix,
        https_proxy: Option<String>,
        timeout: Duration,
        retry_strategy: RetryStrategy,
        compression_level: Option<i32>,
    ) -> Self {
        let client = build_client(https_proxy, timeout).unwrap_or_else(|e| {
            error!("Unable to build HTTP client with proxy, falling back to direct: {}", e);
            Client::new()
        });
        DdApi {
            api_key,
            metrics_intake_url_prefix,
            client,
            retry_strategy,
            compression_level,
        }
    }

    pub fn url(&self, endpoint: Endpoint) -> String {
        format!("{}{}", self.metrics_intake_url_prefix.as_str(), endpoint.path())
    }

    /// Compresses and posts one JSON payload with retries.
    pub async fn ship(&self, endpoint: Endpoint, body: Vec<u8>) -> Result<Response, ShippingError> {
        let body = match self.compression_level {
            Some(level) => zstd::stream::encode_all(body.as_slice(), level)
                .map_err(|e| ShippingError::Payload(format!("Failed to compress payload: {e}")))?,
            None => body,
        };
        debug!("Sending {} bytes to {}", body.len(), endpoint.path());

        let mut builder = self
            .client
            .post(self.url(endpoint))
            .header("DD-API-KEY", &self.api_key)
            .header("Content-Type", "application/json")
            .header(
                "User-Agent",
                concat!("dogstatsd-rs/", env!("CARGO_PKG_VERSION")),
            );
        if self.compression_level.is_some() {
            builder = builder.header("Content-Encoding", "zstd");
        }
        self.send_with_retry(builder.body(body)).await
    }

    async fn send_with_retry(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<Response, ShippingError> {
        let max_attempts = self.retry_strategy.max_attempts();
        let started = Instant::now();
        let mut attempts = 0;
        loop {
            attempts += 1;
            let request = builder
                .try_clone()
                .ok_or_else(|| ShippingError::Payload("request body is not cloneable".to_string()))?;

            let last_status = match request.send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    if !is_retryable(status) {
                        let body = response.text().await.unwrap_or_default();
                        return Err(ShippingError::Destination(
                            Some(status),
                            format!("Permanent failure: {body}"),
                        ));
                    }
                    debug!("Attempt {} got {}", attempts, status);
                    Some(status)
                }
                Err(e) => {
                    debug!("Attempt {} failed: {}", attempts, e);
                    e.status()
                }
            };

            let delay = self.retry_strategy.delay(attempts);
            let out_of_time = self
                .retry_strategy
                .max_elapsed()
                .is_some_and(|max| started.elapsed() + delay > max);
            if attempts >= max_attempts || out_of_time {
                return Err(ShippingError::Destination(
                    last_status,
                    format!("Failed to send request after {attempts} attempts"),
                ));
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn build_client(https_proxy: Option<String>, timeout: Duration) -> Result<Client, reqwest::Error> {
    let mut builder = Client::builder().timeout(timeout);
    if let Some(proxy) = https_proxy {
        builder = builder.proxy(reqwest::Proxy::https(proxy)?);
    }
    builder.build()
}
