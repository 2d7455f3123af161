// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helpers for turning loosely formatted configuration values into typed ones.

use serde::{Deserialize, Deserializer};
use std::time::Duration;
use tracing::error;

/// Validates a metric namespace: it must start with an ASCII letter and
/// contain only ASCII alphanumerics, `_` and `.`. Surrounding whitespace is
/// trimmed. Invalid values are logged and ignored.
///
/// ```
/// use dogstatsd::util::parse_metric_namespace;
///
/// assert_eq!(parse_metric_namespace("my_app.metrics"), Some("my_app.metrics".to_string()));
/// assert_eq!(parse_metric_namespace("1invalid"), None);
/// assert_eq!(parse_metric_namespace("my-app"), None);
/// ```
pub fn parse_metric_namespace(namespace: &str) -> Option<String> {
    let trimmed = namespace.trim();
    let first = trimmed.chars().next()?;
    if !first.is_ascii_alphabetic() {
        error!(
            "Metric namespace must start with a letter, got: '{}'. Ignoring namespace.",
            trimmed
        );
        return None;
    }
    if let Some(bad) = trimmed
        .chars()
        .find(|&ch| !ch.is_ascii_alphanumeric() && ch != '_' && ch != '.')
    {
        error!(
            "Metric namespace contains invalid character '{}' in '{}'. Ignoring namespace.",
            bad, trimmed
        );
        return None;
    }
    Some(trimmed.to_string())
}

/// Splits a comma or space separated list, skipping empty entries.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Lenient boolean: `true`, `1`, `yes` and `on` are truthy, case insensitive.
pub fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

/// Parses a duration given in seconds (`10`, `0.5`) or with an `ms`/`s`
/// suffix (`250ms`, `2s`).
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let (number, millis) = match raw.strip_suffix("ms") {
        Some(n) => (n, true),
        None => (raw.strip_suffix('s').unwrap_or(raw), false),
    };
    let value: f64 = number.trim().parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let secs = if millis { value / 1000.0 } else { value };
    Duration::try_from_secs_f64(secs).ok()
}

/// Serde helper for durations written as seconds or as [`parse_duration`]
/// strings.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(f64),
        Text(String),
    }

    let parsed = match Raw::deserialize(deserializer)? {
        Raw::Secs(secs) if secs.is_finite() && secs >= 0.0 => {
            Duration::try_from_secs_f64(secs).ok()
        }
        Raw::Secs(_) => None,
        Raw::Text(text) => parse_duration(&text),
    };
    parsed.ok_or_else(|| serde::de::Error::custom("invalid duration"))
}
