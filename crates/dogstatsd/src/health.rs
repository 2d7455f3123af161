// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Self-health emitter.
//!
//! On its own timer, independent of traffic, injects a `datadog.agent.up`
//! service check straight into the aggregator. Seeing it at the intake
//! proves the aggregator, the flush scheduler and the forwarder are all
//! moving. Optionally the pipeline counters are injected alongside as rates.

use crate::constants;
use crate::decoder::Sample;
use crate::dogstatsd::Ingestor;
use crate::event::{ServiceCheck, ServiceCheckStatus};
use crate::metric::{Metric, MetricValue, SortedTags};
use crate::telemetry::{Telemetry, TelemetrySnapshot};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use ustr::Ustr;

const TELEMETRY_PREFIX: &str = "datadog.dogstatsd";

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    #[serde(deserialize_with = "crate::util::deserialize_duration")]
    pub interval: Duration,
    /// Extra tags on the health check, `key:value` or bare.
    pub tags: Vec<String>,
    /// Also report the pipeline counters as `datadog.dogstatsd.<counter>`.
    pub report_telemetry: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: constants::DEFAULT_HEALTH_INTERVAL,
            tags: Vec::new(),
            report_telemetry: false,
        }
    }
}

pub struct HealthEmitter {
    ingestor: Ingestor,
    telemetry: Arc<Telemetry>,
    interval: Duration,
    tags: SortedTags,
    report_telemetry: bool,
    last: TelemetrySnapshot,
}

impl HealthEmitter {
    pub fn new(config: &HealthConfig, ingestor: Ingestor, telemetry: Arc<Telemetry>) -> Self {
        let tags = SortedTags::parse(&config.tags.join(",")).unwrap_or_else(|e| {
            warn!("Ignoring health check tags: {}", e);
            SortedTags::default()
        });
        Self {
            ingestor,
            telemetry,
            interval: config.interval,
            tags,
            report_telemetry: config.report_telemetry,
            last: TelemetrySnapshot::default(),
        }
    }

    /// Emits immediately, then on every tick until cancelled.
    pub async fn run(mut self, cancel_token: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel_token.cancelled() => break,
                _ = ticker.tick() => self.emit().await,
            }
        }
        debug!("Health emitter stopped");
    }

    pub async fn emit(&mut self) {
        let mut samples = vec![Sample::ServiceCheck(self.health_check())];
        if self.report_telemetry {
            let current = self.telemetry.snapshot();
            samples.extend(telemetry_rates(&self.last, &current).map(Sample::Metric));
            self.last = current;
        }
        if let Err(e) = self.ingestor.ingest(samples).await {
            warn!("Failed to inject health check: {}", e);
        }
    }

    fn health_check(&self) -> ServiceCheck {
        let mut check = ServiceCheck::new(constants::HEALTH_CHECK_NAME, ServiceCheckStatus::Ok);
        check.tags = self.tags.clone();
        check
    }
}

/// Counter increments since `previous`, one rate metric per counter.
fn telemetry_rates(
    previous: &TelemetrySnapshot,
    current: &TelemetrySnapshot,
) -> impl Iterator<Item = Metric> {
    let as_map = |s: &TelemetrySnapshot| match serde_json::to_value(s) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    let before = as_map(previous);
    as_map(current)
        .into_iter()
        .filter_map(move |(name, value)| {
            let now = value.as_u64()?;
            let then = before.get(&name).and_then(serde_json::Value::as_u64).unwrap_or(0);
            let delta = now.saturating_sub(then);
            #[allow(clippy::cast_precision_loss)]
            let delta = delta as f64;
            Some(Metric::new(
                Ustr::from(format!("{TELEMETRY_PREFIX}.{name}").as_str()),
                MetricValue::Rate(delta),
                None,
            ))
        })
}
