// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Time-windowed aggregation of decoded samples.
//!
//! The [`Aggregator`] owns one accumulator per [`Context`]. At flush time the
//! whole map is detached as a [`Window`] and replaced by a fresh map seeded
//! only with the counters and gauges that must keep reporting; building the
//! [`FlushSnapshot`] from the detached window happens outside the owner so
//! ingestion is never stalled by serialization work.

use crate::constants;
use crate::decoder::Sample;
use crate::errors::{Creation, Insert};
use crate::event::{Event, ServiceCheck};
use crate::metric::{Metric, MetricType, MetricValue, SortedTags};
use derive_more::Display;
use fnv::FnvBuildHasher;
use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use ustr::Ustr;

type ContextMap = HashMap<Context, Entry, FnvBuildHasher>;

/// The aggregation identity of a metric.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Display)]
#[display("{name}|{metric_type}|{}|{}", tags.to_strings().join(","), host.map(|h| h.to_string()).unwrap_or_default())]
pub struct Context {
    pub name: Ustr,
    pub metric_type: MetricType,
    pub tags: SortedTags,
    pub host: Option<Ustr>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum HistogramAggregate {
    #[display("max")]
    Max,
    #[display("min")]
    Min,
    #[display("median")]
    Median,
    #[display("avg")]
    Avg,
    #[display("sum")]
    Sum,
    #[display("count")]
    Count,
}

impl FromStr for HistogramAggregate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "max" => Ok(Self::Max),
            "min" => Ok(Self::Min),
            "median" => Ok(Self::Median),
            "avg" => Ok(Self::Avg),
            "sum" => Ok(Self::Sum),
            "count" => Ok(Self::Count),
            other => Err(format!("unknown histogram aggregate '{other}'")),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Refuse new contexts past this many live ones.
    pub max_context: usize,
    /// Flushes without a sample before a counter or gauge context is dropped.
    pub context_expiry_windows: u32,
    pub histogram_aggregates: Vec<HistogramAggregate>,
    pub histogram_percentiles: Vec<f64>,
    /// Samples kept per histogram context; reservoir sampled above this.
    pub histogram_reservoir_size: usize,
    pub max_events_per_window: usize,
}

impl AggregatorConfig {
    pub fn validate(&self) -> Result<(), Creation> {
        if self.max_context == 0 {
            return Err(Creation::Contexts);
        }
        if self.context_expiry_windows == 0 {
            return Err(Creation::Expiry);
        }
        let mut seen: Vec<(String, f64)> = Vec::with_capacity(self.histogram_percentiles.len());
        for &p in &self.histogram_percentiles {
            if !(p > 0.0 && p < 1.0) {
                return Err(Creation::Percentile(p));
            }
            let suffix = percentile_suffix(p);
            if let Some((_, first)) = seen.iter().find(|(s, _)| *s == suffix) {
                return Err(Creation::DuplicatePercentile(*first, p));
            }
            seen.push((suffix, p));
        }
        Ok(())
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_context: constants::CONTEXTS,
            context_expiry_windows: constants::DEFAULT_CONTEXT_EXPIRY_WINDOWS,
            histogram_aggregates: vec![
                HistogramAggregate::Max,
                HistogramAggregate::Min,
                HistogramAggregate::Median,
                HistogramAggregate::Avg,
                HistogramAggregate::Sum,
                HistogramAggregate::Count,
            ],
            histogram_percentiles: vec![0.95],
            histogram_reservoir_size: constants::DEFAULT_HISTOGRAM_RESERVOIR,
            max_events_per_window: constants::DEFAULT_MAX_EVENTS_PER_WINDOW,
        }
    }
}

/// Samples observed by a histogram, timer or distribution context.
#[derive(Clone, Debug, PartialEq)]
pub struct Histogram {
    count: f64,
    sum: f64,
    min: f64,
    max: f64,
    seen: u64,
    reservoir: Vec<f64>,
}

impl Histogram {
    fn new() -> Self {
        Self {
            count: 0.0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            seen: 0,
            reservoir: Vec::new(),
        }
    }

    fn add(&mut self, value: f64, weight: f64, cap: usize) {
        self.count += weight;
        self.sum += value * weight;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.seen += 1;
        if self.reservoir.len() < cap {
            self.reservoir.push(value);
        } else if cap > 0 {
            // uniform reservoir sampling over everything seen this window
            let slot = fastrand::u64(..self.seen);
            if let Ok(slot) = usize::try_from(slot) {
                if slot < cap {
                    self.reservoir[slot] = value;
                }
            }
        }
    }

    pub fn count(&self) -> f64 {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn samples(&self) -> &[f64] {
        &self.reservoir
    }
}

/// Nearest-rank percentile of an ascending slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

/// `0.95` gives `95percentile`, `0.999` gives `99_9percentile`.
fn percentile_suffix(p: f64) -> String {
    let pct = (p * 100.0 * 1e6).round() / 1e6;
    format!("{pct}percentile").replace('.', "_")
}

/// Per-context mutable state.
#[derive(Clone, Debug, PartialEq)]
pub enum Accumulator {
    Count(f64),
    Rate(f64),
    Gauge(f64),
    Set(HashSet<Ustr, FnvBuildHasher>),
    Histogram(Histogram),
}

impl Accumulator {
    fn for_type(metric_type: MetricType) -> Self {
        match metric_type {
            MetricType::Count => Self::Count(0.0),
            MetricType::Rate => Self::Rate(0.0),
            MetricType::Gauge => Self::Gauge(0.0),
            MetricType::Set => Self::Set(HashSet::with_hasher(FnvBuildHasher::default())),
            MetricType::Histogram | MetricType::Timer | MetricType::Distribution => {
                Self::Histogram(Histogram::new())
            }
        }
    }

    fn apply(&mut self, metric: &Metric, reservoir: usize) {
        let weight = metric.weight();
        match (self, &metric.value) {
            (Self::Count(sum), MetricValue::Count(v)) | (Self::Rate(sum), MetricValue::Rate(v)) => {
                *sum += v * weight;
            }
            (Self::Gauge(last), MetricValue::Gauge(v)) => *last = *v,
            (Self::Set(members), MetricValue::Set(member)) => {
                members.insert(*member);
            }
            (
                Self::Histogram(h),
                MetricValue::Histogram(v) | MetricValue::Timer(v) | MetricValue::Distribution(v),
            ) => h.add(*v, weight, reservoir),
            // the context key includes the type, so kinds always line up
            _ => {}
        }
    }

    /// State carried into the next window, if any: counters restart at zero,
    /// gauges keep their value, everything else is dropped.
    fn carry_over(&self) -> Option<Self> {
        match self {
            Self::Count(_) => Some(Self::Count(0.0)),
            Self::Rate(_) => Some(Self::Rate(0.0)),
            Self::Gauge(v) => Some(Self::Gauge(*v)),
            Self::Set(_) | Self::Histogram(_) => None,
        }
    }
}

#[derive(Clone, Debug)]
struct Entry {
    accumulator: Accumulator,
    touched: bool,
    idle_windows: u32,
}

/// Series type understood by the intake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum SeriesType {
    #[display("count")]
    Count,
    #[display("rate")]
    Rate,
    #[display("gauge")]
    Gauge,
}

/// One finalized value.
#[derive(Clone, Debug, PartialEq)]
pub struct SeriesPoint {
    pub name: Ustr,
    pub series_type: SeriesType,
    pub value: f64,
    pub tags: SortedTags,
    pub host: Option<Ustr>,
}

/// Everything produced at one flush tick. Immutable once built.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FlushSnapshot {
    /// End of the window, seconds since the epoch.
    pub timestamp: i64,
    pub interval: Duration,
    pub series: Vec<SeriesPoint>,
    pub events: Vec<Event>,
    pub service_checks: Vec<ServiceCheck>,
}

impl FlushSnapshot {
    pub fn is_empty(&self) -> bool {
        self.series.is_empty() && self.events.is_empty() && self.service_checks.is_empty()
    }

    /// Finds a point by name and exact tags, mostly for inspection in tests.
    pub fn find(&self, name: &str, tags: &SortedTags) -> Option<&SeriesPoint> {
        self.series
            .iter()
            .find(|p| p.name.as_str() == name && &p.tags == tags)
    }
}

/// Settings needed to finalize a window.
#[derive(Clone, Debug)]
struct EmitSettings {
    aggregates: Vec<HistogramAggregate>,
    percentiles: Vec<f64>,
}

/// A detached accumulation map awaiting finalization.
pub struct Window {
    entries: ContextMap,
    events: Vec<Event>,
    service_checks: Vec<ServiceCheck>,
    settings: Arc<EmitSettings>,
}

impl Window {
    pub fn context_count(&self) -> usize {
        self.entries.len()
    }

    pub fn into_snapshot(self, timestamp: i64, interval: Duration) -> FlushSnapshot {
        let interval_secs = interval.as_secs_f64().max(1.0);
        let mut series = Vec::with_capacity(self.entries.len());
        for (context, entry) in self.entries {
            let point = |name: Ustr, series_type: SeriesType, value: f64| SeriesPoint {
                name,
                series_type,
                value,
                tags: context.tags.clone(),
                host: context.host,
            };
            match entry.accumulator {
                Accumulator::Count(sum) => series.push(point(context.name, SeriesType::Count, sum)),
                Accumulator::Rate(sum) => {
                    series.push(point(context.name, SeriesType::Rate, sum / interval_secs));
                }
                Accumulator::Gauge(v) => series.push(point(context.name, SeriesType::Gauge, v)),
                Accumulator::Set(members) => {
                    #[allow(clippy::cast_precision_loss)]
                    let cardinality = members.len() as f64;
                    series.push(point(context.name, SeriesType::Gauge, cardinality));
                }
                Accumulator::Histogram(mut h) => {
                    if h.seen == 0 {
                        continue;
                    }
                    h.reservoir.sort_unstable_by(f64::total_cmp);
                    let derived =
                        |suffix: &str| Ustr::from(format!("{}.{suffix}", context.name).as_str());
                    for aggregate in &self.settings.aggregates {
                        let (series_type, value) = match aggregate {
                            HistogramAggregate::Max => (SeriesType::Gauge, h.max),
                            HistogramAggregate::Min => (SeriesType::Gauge, h.min),
                            HistogramAggregate::Median => {
                                (SeriesType::Gauge, percentile(&h.reservoir, 0.5))
                            }
                            HistogramAggregate::Avg => (SeriesType::Gauge, h.sum / h.count),
                            HistogramAggregate::Sum => (SeriesType::Gauge, h.sum),
                            HistogramAggregate::Count => (SeriesType::Count, h.count),
                        };
                        series.push(point(derived(&aggregate.to_string()), series_type, value));
                    }
                    for p in &self.settings.percentiles {
                        series.push(point(
                            derived(&percentile_suffix(*p)),
                            SeriesType::Gauge,
                            percentile(&h.reservoir, *p),
                        ));
                    }
                }
            }
        }
        FlushSnapshot {
            timestamp,
            interval,
            series,
            events: self.events,
            service_checks: self.service_checks,
        }
    }
}

pub struct Aggregator {
    config: AggregatorConfig,
    hostname: Option<Ustr>,
    global_tags: SortedTags,
    contexts: ContextMap,
    events: Vec<Event>,
    service_checks: Vec<ServiceCheck>,
    settings: Arc<EmitSettings>,
}

impl Aggregator {
    pub fn new(
        config: AggregatorConfig,
        hostname: Option<String>,
        global_tags: SortedTags,
    ) -> Result<Self, Creation> {
        config.validate()?;
        let settings = Arc::new(EmitSettings {
            aggregates: config.histogram_aggregates.clone(),
            percentiles: config.histogram_percentiles.clone(),
        });
        Ok(Self {
            hostname: hostname.filter(|h| !h.is_empty()).map(|h| Ustr::from(h.as_str())),
            global_tags,
            contexts: ContextMap::with_capacity_and_hasher(
                config.max_context.min(1024),
                FnvBuildHasher::default(),
            ),
            events: Vec::new(),
            service_checks: Vec::new(),
            settings,
            config,
        })
    }

    pub fn insert(&mut self, sample: Sample) -> Result<(), Insert> {
        match sample {
            Sample::Metric(metric) => self.insert_metric(&metric),
            Sample::Event(mut event) => {
                self.check_event_capacity()?;
                if event.host.is_none() {
                    event.host = self.hostname.map(|h| h.to_string());
                }
                event.tags.extend(&self.global_tags);
                self.events.push(event);
                Ok(())
            }
            Sample::ServiceCheck(mut check) => {
                self.check_event_capacity()?;
                if check.host.is_none() {
                    check.host = self.hostname.map(|h| h.to_string());
                }
                check.tags.extend(&self.global_tags);
                self.service_checks.push(check);
                Ok(())
            }
        }
    }

    fn check_event_capacity(&self) -> Result<(), Insert> {
        if self.events.len() + self.service_checks.len() >= self.config.max_events_per_window {
            return Err(Insert::EventsFull);
        }
        Ok(())
    }

    pub fn insert_metric(&mut self, metric: &Metric) -> Result<(), Insert> {
        let context = self.context_for(metric);
        let reservoir = self.config.histogram_reservoir_size;
        if let Some(entry) = self.contexts.get_mut(&context) {
            entry.accumulator.apply(metric, reservoir);
            entry.touched = true;
            entry.idle_windows = 0;
            return Ok(());
        }
        if self.contexts.len() >= self.config.max_context {
            return Err(Insert::Overflow(self.config.max_context));
        }
        let mut accumulator = Accumulator::for_type(context.metric_type);
        accumulator.apply(metric, reservoir);
        self.contexts.insert(
            context,
            Entry {
                accumulator,
                touched: true,
                idle_windows: 0,
            },
        );
        Ok(())
    }

    /// Builds the identity of `metric`: the `host` tag overrides the
    /// configured hostname, global tags and the origin container are merged
    /// into the canonical tag set.
    pub fn context_for(&self, metric: &Metric) -> Context {
        let mut tags = metric.tags.clone().unwrap_or_default();
        let host = tags
            .remove_key("host")
            .filter(|h| !h.is_empty())
            .or(self.hostname);
        tags.extend(&self.global_tags);
        if let Some(cid) = metric.container_id {
            tags.insert("container_id", cid.as_str());
        }
        Context {
            name: metric.name,
            metric_type: metric.metric_type(),
            tags,
            host,
        }
    }

    pub fn get_entry(&self, context: &Context) -> Option<&Accumulator> {
        self.contexts.get(context).map(|e| &e.accumulator)
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    /// Detaches the current window and installs the next one.
    pub fn take_window(&mut self) -> Window {
        let mut next = ContextMap::with_capacity_and_hasher(
            self.contexts.len(),
            FnvBuildHasher::default(),
        );
        for (context, entry) in &self.contexts {
            let idle_windows = if entry.touched {
                0
            } else {
                entry.idle_windows + 1
            };
            if idle_windows >= self.config.context_expiry_windows {
                continue;
            }
            if let Some(accumulator) = entry.accumulator.carry_over() {
                next.insert(
                    context.clone(),
                    Entry {
                        accumulator,
                        touched: false,
                        idle_windows,
                    },
                );
            }
        }
        Window {
            entries: std::mem::replace(&mut self.contexts, next),
            events: std::mem::take(&mut self.events),
            service_checks: std::mem::take(&mut self.service_checks),
            settings: Arc::clone(&self.settings),
        }
    }

    /// Detaches and finalizes in one step.
    pub fn flush(&mut self, timestamp: i64, interval: Duration) -> FlushSnapshot {
        self.take_window().into_snapshot(timestamp, interval)
    }
}
