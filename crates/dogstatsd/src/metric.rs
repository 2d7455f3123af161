// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Metric samples, tag canonicalization and the metric line grammar.
//!
//! ```text
//! name:value[:value...]|type[|@sample_rate][|#tag1,tag2,...][|c:container_id]
//! ```

use crate::constants;
use crate::errors::ParseError;
use derive_more::Display;
use ustr::Ustr;

pub const EMPTY_TAGS: SortedTags = SortedTags { values: Vec::new() };

/// A canonical tag set: sorted and deduplicated so that `{a,b}` and `{b,a}`
/// compare and hash identically.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SortedTags {
    // (key, value); a bare tag has an empty value
    values: Vec<(Ustr, Ustr)>,
}

impl SortedTags {
    /// Parses a comma separated tag list. Empty entries are skipped.
    pub fn parse(tags_section: &str) -> Result<Self, ParseError> {
        let mut values: Vec<(Ustr, Ustr)> = tags_section
            .split(',')
            .filter(|t| !t.is_empty())
            .map(split_tag)
            .collect();
        values.sort_unstable();
        values.dedup();
        if values.len() > constants::MAX_TAGS {
            return Err(ParseError::Raw(format!(
                "Too many tags, more than {c}",
                c = constants::MAX_TAGS
            )));
        }
        Ok(Self { values })
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn find_all(&self, key: &str) -> Vec<&Ustr> {
        self.values
            .iter()
            .filter(|(k, _)| k.as_str() == key)
            .map(|(_, v)| v)
            .collect()
    }

    /// Merges `other` into `self`, keeping the set canonical.
    pub fn extend(&mut self, other: &SortedTags) {
        if other.is_empty() {
            return;
        }
        self.values.extend_from_slice(&other.values);
        self.values.sort_unstable();
        self.values.dedup();
    }

    pub fn insert(&mut self, key: &str, value: &str) {
        let tag = (Ustr::from(key), Ustr::from(value));
        if let Err(pos) = self.values.binary_search(&tag) {
            self.values.insert(pos, tag);
        }
    }

    /// Removes every tag with `key`, returning the last value seen.
    pub fn remove_key(&mut self, key: &str) -> Option<Ustr> {
        let mut removed = None;
        self.values.retain(|(k, v)| {
            if k.as_str() == key {
                removed = Some(*v);
                false
            } else {
                true
            }
        });
        removed
    }

    /// Renders the tags in wire form (`key:value` or `key`).
    pub fn to_strings(&self) -> Vec<String> {
        self.values
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.to_string()
                } else {
                    format!("{k}:{v}")
                }
            })
            .collect()
    }
}

fn split_tag(tag: &str) -> (Ustr, Ustr) {
    match tag.split_once(':') {
        Some((k, v)) => (Ustr::from(k), Ustr::from(v)),
        None => (Ustr::from(tag), Ustr::from("")),
    }
}

/// The metric type tag. `Rate` has no wire form and is only created
/// programmatically.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
pub enum MetricType {
    #[display("count")]
    Count,
    #[display("gauge")]
    Gauge,
    #[display("rate")]
    Rate,
    #[display("set")]
    Set,
    #[display("histogram")]
    Histogram,
    #[display("timer")]
    Timer,
    #[display("distribution")]
    Distribution,
}

impl MetricType {
    pub fn from_wire(tag: &str) -> Result<Self, ParseError> {
        match tag {
            "c" => Ok(Self::Count),
            "g" => Ok(Self::Gauge),
            "s" => Ok(Self::Set),
            "h" => Ok(Self::Histogram),
            "ms" => Ok(Self::Timer),
            "d" => Ok(Self::Distribution),
            other => Err(ParseError::UnsupportedType(other.to_string())),
        }
    }

    pub fn wire_tag(self) -> Option<&'static str> {
        match self {
            Self::Count => Some("c"),
            Self::Gauge => Some("g"),
            Self::Set => Some("s"),
            Self::Histogram => Some("h"),
            Self::Timer => Some("ms"),
            Self::Distribution => Some("d"),
            Self::Rate => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MetricValue {
    Count(f64),
    Gauge(f64),
    Rate(f64),
    Set(Ustr),
    Histogram(f64),
    Timer(f64),
    Distribution(f64),
}

impl MetricValue {
    pub fn metric_type(&self) -> MetricType {
        match self {
            Self::Count(_) => MetricType::Count,
            Self::Gauge(_) => MetricType::Gauge,
            Self::Rate(_) => MetricType::Rate,
            Self::Set(_) => MetricType::Set,
            Self::Histogram(_) => MetricType::Histogram,
            Self::Timer(_) => MetricType::Timer,
            Self::Distribution(_) => MetricType::Distribution,
        }
    }

    /// Numeric payload, `None` for set members.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Count(v)
            | Self::Gauge(v)
            | Self::Rate(v)
            | Self::Histogram(v)
            | Self::Timer(v)
            | Self::Distribution(v) => Some(*v),
            Self::Set(_) => None,
        }
    }

    fn from_wire(metric_type: MetricType, raw: &str) -> Result<Self, ParseError> {
        if metric_type == MetricType::Set {
            return Ok(Self::Set(Ustr::from(raw)));
        }
        let v: f64 = raw
            .parse()
            .map_err(|_| ParseError::InvalidValue(raw.to_string()))?;
        if !v.is_finite() {
            return Err(ParseError::InvalidValue(raw.to_string()));
        }
        Ok(match metric_type {
            MetricType::Count => Self::Count(v),
            MetricType::Gauge => Self::Gauge(v),
            MetricType::Rate => Self::Rate(v),
            MetricType::Histogram => Self::Histogram(v),
            MetricType::Timer => Self::Timer(v),
            MetricType::Distribution => Self::Distribution(v),
            MetricType::Set => Self::Set(Ustr::from(raw)),
        })
    }
}

/// One decoded metric sample.
#[derive(Clone, Debug, PartialEq)]
pub struct Metric {
    pub name: Ustr,
    pub value: MetricValue,
    /// Explicit `@rate`; `None` means 1.
    pub sample_rate: Option<f64>,
    pub tags: Option<SortedTags>,
    /// Sender container, from `|c:` or resolved from the socket peer.
    pub container_id: Option<Ustr>,
}

impl Metric {
    pub fn new(name: Ustr, value: MetricValue, tags: Option<SortedTags>) -> Self {
        Self {
            name,
            value,
            sample_rate: None,
            tags,
            container_id: None,
        }
    }

    pub fn metric_type(&self) -> MetricType {
        self.value.metric_type()
    }

    /// Factor applied to counts to undo client side sampling.
    pub fn weight(&self) -> f64 {
        self.sample_rate.map_or(1.0, |rate| 1.0 / rate)
    }

    /// Re-encodes a single sample in wire form. Only used to check decoding
    /// against the original line.
    #[cfg(test)]
    pub(crate) fn to_statsd_line(&self) -> String {
        use std::fmt::Write as _;

        let mut line = format!("{}:", self.name);
        match &self.value {
            MetricValue::Set(member) => line.push_str(member),
            other => {
                let _ = write!(line, "{}", other.as_f64().unwrap_or_default());
            }
        }
        let _ = write!(line, "|{}", self.metric_type().wire_tag().unwrap_or("c"));
        if let Some(rate) = self.sample_rate {
            let _ = write!(line, "|@{rate}");
        }
        if let Some(tags) = self.tags.as_ref().filter(|t| !t.is_empty()) {
            let _ = write!(line, "|#{}", tags.to_strings().join(","));
        }
        if let Some(cid) = self.container_id {
            let _ = write!(line, "|c:{cid}");
        }
        line
    }
}

/// Parses one metric line, yielding one [`Metric`] per packed value.
pub fn parse_line(line: &str) -> Result<Vec<Metric>, ParseError> {
    let mut fields = line.split('|');
    let head = fields.next().unwrap_or_default();
    let (name, raw_values) = head
        .split_once(':')
        .ok_or_else(|| ParseError::Raw(format!("missing value separator in '{line}'")))?;
    if name.is_empty() {
        return Err(ParseError::Raw("empty metric name".to_string()));
    }
    let type_tag = fields
        .next()
        .ok_or_else(|| ParseError::Raw(format!("missing metric type in '{line}'")))?;
    let metric_type = MetricType::from_wire(type_tag)?;

    let mut sample_rate = None;
    let mut tags = None;
    let mut container_id = None;
    for field in fields {
        if let Some(rate) = field.strip_prefix('@') {
            let rate: f64 = rate
                .parse()
                .map_err(|_| ParseError::InvalidValue(format!("sample rate '{rate}'")))?;
            if !(rate > 0.0 && rate <= 1.0) {
                return Err(ParseError::InvalidValue(format!(
                    "sample rate {rate} outside (0, 1]"
                )));
            }
            sample_rate = Some(rate);
        } else if let Some(section) = field.strip_prefix('#') {
            tags = Some(SortedTags::parse(section)?);
        } else if let Some(cid) = field.strip_prefix("c:") {
            if !cid.is_empty() {
                container_id = Some(Ustr::from(cid));
            }
        }
        // other optional fields (e.g. `T<timestamp>`) are accepted and ignored
    }

    let name = Ustr::from(name);
    raw_values
        .split(':')
        .map(|raw| {
            if raw.is_empty() {
                return Err(ParseError::InvalidValue("empty value".to_string()));
            }
            Ok(Metric {
                name,
                value: MetricValue::from_wire(metric_type, raw)?,
                sample_rate,
                tags: tags.clone(),
                container_id,
            })
        })
        .collect()
}

/// Parses a line carrying exactly one value.
pub fn parse(line: &str) -> Result<Metric, ParseError> {
    let mut metrics = parse_line(line)?;
    if metrics.len() != 1 {
        return Err(ParseError::Raw(format!(
            "expected a single value, found {}",
            metrics.len()
        )));
    }
    Ok(metrics.remove(0))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parse_counter() {
        let m = parse("foo:1|c").unwrap();
        assert_eq!(m.name.as_str(), "foo");
        assert_eq!(m.value, MetricValue::Count(1.0));
        assert_eq!(m.sample_rate, None);
        assert!(m.tags.is_none());
    }

    #[test]
    fn parse_all_types() {
        assert_eq!(parse("a:1|g").unwrap().metric_type(), MetricType::Gauge);
        assert_eq!(parse("a:1|h").unwrap().metric_type(), MetricType::Histogram);
        assert_eq!(parse("a:1|ms").unwrap().metric_type(), MetricType::Timer);
        assert_eq!(
            parse("a:1|d").unwrap().metric_type(),
            MetricType::Distribution
        );
        assert_eq!(
            parse("a:alice|s").unwrap().value,
            MetricValue::Set(Ustr::from("alice"))
        );
    }

    #[test]
    fn parse_optional_fields() {
        let m = parse("page.views:3|c|@0.5|#env:prod,service:web|c:abc123").unwrap();
        assert_eq!(m.sample_rate, Some(0.5));
        assert_eq!(m.weight(), 2.0);
        assert_eq!(m.container_id, Some(Ustr::from("abc123")));
        let tags = m.tags.unwrap();
        assert_eq!(tags.find_all("env"), vec![&Ustr::from("prod")]);
        assert_eq!(tags.len(), 2);
    }

    #[test]
    fn parse_multi_value() {
        let metrics = parse_line("lat:1:2:3|h|@0.5").unwrap();
        assert_eq!(metrics.len(), 3);
        assert!(metrics.iter().all(|m| m.sample_rate == Some(0.5)));
        assert_eq!(metrics[2].value, MetricValue::Histogram(3.0));
        assert!(parse("lat:1:2|h").is_err());
    }

    #[test]
    fn ignores_unknown_optional_fields() {
        let m = parse("foo:1|c|T1656581409|x:whatever").unwrap();
        assert_eq!(m.value, MetricValue::Count(1.0));
    }

    #[test]
    fn rejects_malformed() {
        assert!(matches!(
            parse("foo:1|q"),
            Err(ParseError::UnsupportedType(_))
        ));
        assert!(parse("foo|c").is_err());
        assert!(parse("foo:1").is_err());
        assert!(parse(":1|c").is_err());
        assert!(matches!(
            parse("foo:abc|c"),
            Err(ParseError::InvalidValue(_))
        ));
        assert!(parse("foo:inf|g").is_err());
        assert!(parse("foo:1|c|@0").is_err());
        assert!(parse("foo:1|c|@1.5").is_err());
        assert!(parse("foo::1|c").is_err());
    }

    #[test]
    fn rejects_too_many_tags() {
        let tags = (0..=constants::MAX_TAGS)
            .map(|i| format!("t{i}:v"))
            .collect::<Vec<_>>()
            .join(",");
        assert!(parse(&format!("foo:1|c|#{tags}")).is_err());
    }

    #[test]
    fn sorted_tags_canonical() {
        let a = SortedTags::parse("tag:b,tag:a,solo").unwrap();
        let b = SortedTags::parse("solo,tag:a,tag:b,tag:a,").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_strings(), vec!["solo", "tag:a", "tag:b"]);
    }

    #[test]
    fn sorted_tags_extend_and_remove() {
        let mut tags = SortedTags::parse("b:2,host:h1").unwrap();
        tags.extend(&SortedTags::parse("a:1,b:2").unwrap());
        assert_eq!(tags.to_strings(), vec!["a:1", "b:2", "host:h1"]);
        assert_eq!(tags.remove_key("host"), Some(Ustr::from("h1")));
        tags.insert("c", "3");
        tags.insert("a", "1");
        assert_eq!(tags.to_strings(), vec!["a:1", "b:2", "c:3"]);
    }

    #[test]
    fn tag_value_keeps_extra_colons() {
        let tags = SortedTags::parse("url:http://x").unwrap();
        assert_eq!(tags.find_all("url"), vec![&Ustr::from("http://x")]);
    }

    proptest! {
        #[test]
        fn tag_order_does_not_matter(mut tags in prop::collection::vec("[a-z]{1,6}:[a-z0-9]{1,6}", 1..12)) {
            let forward = SortedTags::parse(&tags.join(",")).unwrap();
            tags.reverse();
            let reversed = SortedTags::parse(&tags.join(",")).unwrap();
            prop_assert_eq!(forward, reversed);
        }

        #[test]
        fn decode_then_encode_keeps_identity(
            name in "[a-z][a-z0-9_.]{0,20}",
            value in -1.0e6f64..1.0e6,
            kind in prop::sample::select(vec!["c", "g", "h", "ms", "d"]),
            tags in prop::collection::vec("[a-z]{1,5}:[a-z0-9]{1,5}", 0..6),
        ) {
            let mut line = format!("{name}:{value}|{kind}");
            if !tags.is_empty() {
                line.push_str(&format!("|#{}", tags.join(",")));
            }
            let decoded = parse(&line).unwrap();
            let again = parse(&decoded.to_statsd_line()).unwrap();
            prop_assert_eq!(again.name, decoded.name);
            prop_assert_eq!(again.metric_type(), decoded.metric_type());
            prop_assert_eq!(again.value.as_f64(), Some(value));
            prop_assert_eq!(again.tags.unwrap_or_default(), decoded.tags.unwrap_or_default());
        }
    }
}
