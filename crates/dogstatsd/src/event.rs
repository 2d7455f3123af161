// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Events and service checks.
//!
//! ```text
//! _e{title_len,text_len}:title|text[|d:timestamp][|h:hostname][|p:priority][|t:alert_type][|k:aggregation_key][|s:source_type][|#tags]
//! _sc|name|status[|d:timestamp][|h:hostname][|#tags][|m:message]
//! ```

use crate::errors::ParseError;
use crate::metric::SortedTags;
use derive_more::Display;
use serde::Serialize;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    #[display("normal")]
    Normal,
    #[display("low")]
    Low,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum AlertType {
    #[display("error")]
    Error,
    #[display("warning")]
    Warning,
    #[default]
    #[display("info")]
    Info,
    #[display("success")]
    Success,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub title: String,
    pub text: String,
    pub timestamp: Option<i64>,
    pub host: Option<String>,
    pub priority: Priority,
    pub alert_type: AlertType,
    pub aggregation_key: Option<String>,
    pub source_type_name: Option<String>,
    pub tags: SortedTags,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum ServiceCheckStatus {
    #[display("OK")]
    Ok = 0,
    #[display("WARNING")]
    Warning = 1,
    #[display("CRITICAL")]
    Critical = 2,
    #[display("UNKNOWN")]
    Unknown = 3,
}

impl TryFrom<u8> for ServiceCheckStatus {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Ok),
            1 => Ok(Self::Warning),
            2 => Ok(Self::Critical),
            3 => Ok(Self::Unknown),
            other => Err(ParseError::InvalidValue(format!(
                "service check status {other}"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ServiceCheck {
    pub name: String,
    pub status: ServiceCheckStatus,
    pub timestamp: Option<i64>,
    pub host: Option<String>,
    pub message: Option<String>,
    pub tags: SortedTags,
}

impl ServiceCheck {
    pub fn new(name: impl Into<String>, status: ServiceCheckStatus) -> Self {
        Self {
            name: name.into(),
            status,
            timestamp: None,
            host: None,
            message: None,
            tags: SortedTags::default(),
        }
    }
}

fn parse_timestamp(raw: &str) -> Result<i64, ParseError> {
    raw.parse()
        .map_err(|_| ParseError::InvalidValue(format!("timestamp '{raw}'")))
}

fn parse_len(raw: &str) -> Result<usize, ParseError> {
    raw.parse()
        .map_err(|_| ParseError::InvalidValue(format!("length '{raw}'")))
}

/// Parses an `_e{...}` line. The declared lengths are byte lengths and must
/// match exactly.
pub fn parse_event(line: &str) -> Result<Event, ParseError> {
    let rest = line
        .strip_prefix("_e{")
        .ok_or_else(|| ParseError::Raw("event must start with '_e{'".to_string()))?;
    let (header, body) = rest
        .split_once("}:")
        .ok_or_else(|| ParseError::Raw("malformed event header".to_string()))?;
    let (title_len, text_len) = header
        .split_once(',')
        .ok_or_else(|| ParseError::Raw("event header needs two lengths".to_string()))?;
    let title_len = parse_len(title_len)?;
    let text_len = parse_len(text_len)?;

    let title_end = title_len;
    let overflow = || ParseError::LengthMismatch {
        declared: usize::MAX,
        actual: body.len(),
    };
    let text_start = title_end.checked_add(1).ok_or_else(overflow)?;
    let text_end = text_start.checked_add(text_len).ok_or_else(overflow)?;
    // `|` separates title from text
    if body.len() < text_end {
        return Err(ParseError::LengthMismatch {
            declared: title_len.saturating_add(text_len),
            actual: body.len().saturating_sub(1),
        });
    }
    if !body.is_char_boundary(title_end) || body.as_bytes().get(title_end) != Some(&b'|') {
        return Err(ParseError::LengthMismatch {
            declared: title_len,
            actual: body.find('|').unwrap_or(body.len()),
        });
    }
    let Some(text) = body.get(text_start..text_end) else {
        return Err(ParseError::LengthMismatch {
            declared: text_len,
            actual: body.len() - text_start,
        });
    };
    if text_end < body.len() && body.as_bytes().get(text_end) != Some(&b'|') {
        let actual = body
            .get(text_start..)
            .and_then(|t| t.find('|'))
            .unwrap_or(body.len() - text_start);
        return Err(ParseError::LengthMismatch {
            declared: text_len,
            actual,
        });
    }

    let title = &body[..title_end];
    if title.is_empty() {
        return Err(ParseError::Raw("empty event title".to_string()));
    }
    // the text encodes newlines as `\n` literals
    let text = text.replace("\\n", "\n");

    let mut event = Event {
        title: title.to_string(),
        text,
        timestamp: None,
        host: None,
        priority: Priority::default(),
        alert_type: AlertType::default(),
        aggregation_key: None,
        source_type_name: None,
        tags: SortedTags::default(),
    };

    let trailer = body.get(text_end + 1..).unwrap_or_default();
    for field in trailer.split('|').filter(|f| !f.is_empty()) {
        if let Some(ts) = field.strip_prefix("d:") {
            event.timestamp = Some(parse_timestamp(ts)?);
        } else if let Some(host) = field.strip_prefix("h:") {
            event.host = Some(host.to_string());
        } else if let Some(priority) = field.strip_prefix("p:") {
            event.priority = match priority {
                "normal" => Priority::Normal,
                "low" => Priority::Low,
                other => return Err(ParseError::InvalidValue(format!("priority '{other}'"))),
            };
        } else if let Some(alert) = field.strip_prefix("t:") {
            event.alert_type = match alert {
                "error" => AlertType::Error,
                "warning" => AlertType::Warning,
                "info" => AlertType::Info,
                "success" => AlertType::Success,
                other => {
                    return Err(ParseError::InvalidValue(format!("alert type '{other}'")))
                }
            };
        } else if let Some(key) = field.strip_prefix("k:") {
            event.aggregation_key = Some(key.to_string());
        } else if let Some(source) = field.strip_prefix("s:") {
            event.source_type_name = Some(source.to_string());
        } else if let Some(tags) = field.strip_prefix('#') {
            event.tags = SortedTags::parse(tags)?;
        }
    }
    Ok(event)
}

/// Parses an `_sc|...` line.
pub fn parse_service_check(line: &str) -> Result<ServiceCheck, ParseError> {
    let mut fields = line.split('|');
    if fields.next() != Some("_sc") {
        return Err(ParseError::Raw(
            "service check must start with '_sc|'".to_string(),
        ));
    }
    let name = fields
        .next()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ParseError::Raw("missing service check name".to_string()))?;
    let status = fields
        .next()
        .ok_or_else(|| ParseError::Raw("missing service check status".to_string()))?;
    let status: u8 = status
        .parse()
        .map_err(|_| ParseError::InvalidValue(format!("service check status '{status}'")))?;
    let mut check = ServiceCheck::new(name, ServiceCheckStatus::try_from(status)?);

    for field in fields.filter(|f| !f.is_empty()) {
        if let Some(ts) = field.strip_prefix("d:") {
            check.timestamp = Some(parse_timestamp(ts)?);
        } else if let Some(host) = field.strip_prefix("h:") {
            check.host = Some(host.to_string());
        } else if let Some(message) = field.strip_prefix("m:") {
            check.message = Some(message.replace("\\n", "\n"));
        } else if let Some(tags) = field.strip_prefix('#') {
            check.tags = SortedTags::parse(tags)?;
        }
    }
    Ok(check)
}
