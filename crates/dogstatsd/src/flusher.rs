// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Forwarder: batches flush snapshots and ships them to the intake.
//!
//! Snapshots arrive on a bounded queue. They are grouped until the estimated
//! payload reaches the size ceiling or the oldest one has waited `max_linger`,
//! then serialized, split per endpoint and sent by concurrent tasks limited by
//! a semaphore. Transient failures are retried inside [`DdApi`]; a batch that
//! still fails is dropped and counted. When the intake has been failing for
//! longer than `degraded_after` the status channel flips to
//! [`ForwarderStatus::Degraded`] so upstream stages can shed load.

use crate::aggregator::FlushSnapshot;
use crate::api_key::ApiKeyFactory;
use crate::constants;
use crate::datadog::{
    split_payloads, CheckRun, DdApi, Endpoint, IntakeEvent, MetricsIntakeUrlPrefix, RetryStrategy,
    Series,
};
use crate::telemetry::Telemetry;
use derive_more::Display;
use reqwest::{Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, OnceCell, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ShippingError {
    /// The payload itself is unusable; never retried.
    #[error("payload error: {0}")]
    Payload(String),
    #[error("destination error ({0:?}): {1}")]
    Destination(Option<StatusCode>, String),
}

impl ShippingError {
    /// Whether the intake rejected the request for good.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Payload(_) => true,
            Self::Destination(status, _) => {
                status.is_some_and(|s| s.is_client_error() && !crate::datadog::is_retryable(s))
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display)]
pub enum ForwarderStatus {
    #[default]
    #[display("healthy")]
    Healthy,
    #[display("degraded")]
    Degraded,
}

pub struct FlusherConfig {
    // Allow accepting a future so the API key resolution is deferred until the flush happens
    pub api_key_factory: Arc<ApiKeyFactory>,
    pub metrics_intake_url_prefix: MetricsIntakeUrlPrefix,
    pub https_proxy: Option<String>,
    pub timeout: Duration,
    pub retry_strategy: RetryStrategy,
    /// `None` disables compression
    pub compression_level: Option<i32>,
    pub max_payload_bytes: usize,
    pub max_in_flight: usize,
    pub max_linger: Duration,
    pub queue_size: usize,
    pub degraded_after: Duration,
}

impl FlusherConfig {
    pub fn new(
        api_key_factory: Arc<ApiKeyFactory>,
        metrics_intake_url_prefix: MetricsIntakeUrlPrefix,
    ) -> Self {
        Self {
            api_key_factory,
            metrics_intake_url_prefix,
            https_proxy: None,
            timeout: constants::DEFAULT_REQUEST_TIMEOUT,
            retry_strategy: RetryStrategy::default(),
            compression_level: Some(constants::DEFAULT_COMPRESSION_LEVEL),
            max_payload_bytes: constants::DEFAULT_MAX_PAYLOAD_BYTES,
            max_in_flight: constants::DEFAULT_MAX_IN_FLIGHT,
            max_linger: constants::DEFAULT_MAX_LINGER,
            queue_size: constants::DEFAULT_MAX_PENDING_SNAPSHOTS,
            degraded_after: constants::DEFAULT_DEGRADED_AFTER,
        }
    }
}

/// Sending side of the forwarder.
#[derive(Clone)]
pub struct FlusherHandle {
    tx: mpsc::Sender<FlushSnapshot>,
    status: watch::Receiver<ForwarderStatus>,
}

impl FlusherHandle {
    pub(crate) fn from_parts(
        tx: mpsc::Sender<FlushSnapshot>,
        status: watch::Receiver<ForwarderStatus>,
    ) -> Self {
        Self { tx, status }
    }

    /// Offers a snapshot without waiting; a full queue hands it back.
    pub fn try_send(
        &self,
        snapshot: FlushSnapshot,
    ) -> Result<(), mpsc::error::TrySendError<FlushSnapshot>> {
        self.tx.try_send(snapshot)
    }

    /// Waits for queue room.
    pub async fn send(
        &self,
        snapshot: FlushSnapshot,
    ) -> Result<(), mpsc::error::SendError<FlushSnapshot>> {
        self.tx.send(snapshot).await
    }

    pub fn status(&self) -> ForwarderStatus {
        *self.status.borrow()
    }

    /// Whether the input queue is empty.
    pub fn is_idle(&self) -> bool {
        self.tx.capacity() == self.tx.max_capacity()
    }

    pub fn subscribe(&self) -> watch::Receiver<ForwarderStatus> {
        self.status.clone()
    }
}

/// Result of shipping one batch.
#[derive(Debug, Default, PartialEq, Eq)]
struct BatchOutcome {
    payloads_sent: u64,
    payloads_dropped: u64,
    bytes_sent: u64,
    /// Retries exhausted on a transient failure.
    transient_failure: bool,
}

pub struct Flusher {
    api_key_factory: Arc<ApiKeyFactory>,
    metrics_intake_url_prefix: MetricsIntakeUrlPrefix,
    https_proxy: Option<String>,
    timeout: Duration,
    retry_strategy: RetryStrategy,
    compression_level: Option<i32>,
    max_payload_bytes: usize,
    max_linger: Duration,
    degraded_after: Duration,
    dd_api: OnceCell<DdApi>,
    in_flight: Arc<Semaphore>,
    rx: mpsc::Receiver<FlushSnapshot>,
    status_tx: watch::Sender<ForwarderStatus>,
    failing_since: Option<Instant>,
    telemetry: Arc<Telemetry>,
}

impl Flusher {
    pub fn new(config: FlusherConfig, telemetry: Arc<Telemetry>) -> (Self, FlusherHandle) {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let (status_tx, status_rx) = watch::channel(ForwarderStatus::Healthy);
        let flusher = Flusher {
            api_key_factory: config.api_key_factory,
            metrics_intake_url_prefix: config.metrics_intake_url_prefix,
            https_proxy: config.https_proxy,
            timeout: config.timeout,
            retry_strategy: config.retry_strategy,
            compression_level: config.compression_level,
            max_payload_bytes: config.max_payload_bytes.max(1),
            max_linger: config.max_linger,
            degraded_after: config.degraded_after,
            dd_api: OnceCell::new(),
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            rx,
            status_tx,
            failing_since: None,
            telemetry,
        };
        (flusher, FlusherHandle::from_parts(tx, status_rx))
    }

    async fn get_dd_api(&self) -> &DdApi {
        self.dd_api
            .get_or_init(|| async {
                let api_key = self.api_key_factory.get_api_key().await;
                if api_key.is_empty() {
                    warn!("API key is empty, the intake will reject payloads");
                }
                DdApi::new(
                    api_key.to_string(),
                    self.metrics_intake_url_prefix.clone(),
                    self.https_proxy.clone(),
                    self.timeout,
                    self.retry_strategy.clone(),
                    self.compression_level,
                )
            })
            .await
    }

    /// Runs until `cancel_token` fires or every handle is dropped, then ships
    /// what is still queued and waits for in-flight requests.
    pub async fn run(mut self, cancel_token: CancellationToken) {
        debug!("Forwarder started");
        let mut tasks: JoinSet<BatchOutcome> = JoinSet::new();
        let mut pending: Vec<FlushSnapshot> = Vec::new();
        let mut pending_bytes = 0;
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;
                () = cancel_token.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    self.record(joined);
                }
                received = self.rx.recv() => {
                    let Some(snapshot) = received else { break };
                    pending_bytes += estimate_bytes(&snapshot);
                    pending.push(snapshot);
                    deadline.get_or_insert_with(|| Instant::now() + self.max_linger);
                    if pending_bytes >= self.max_payload_bytes {
                        self.dispatch(&mut tasks, std::mem::take(&mut pending)).await;
                        pending_bytes = 0;
                        deadline = None;
                    }
                }
                () = sleep_until(deadline), if deadline.is_some() => {
                    self.dispatch(&mut tasks, std::mem::take(&mut pending)).await;
                    pending_bytes = 0;
                    deadline = None;
                }
            }
        }

        // drain: everything already handed over gets one shipping attempt
        self.rx.close();
        while let Some(snapshot) = self.rx.recv().await {
            pending.push(snapshot);
        }
        if !pending.is_empty() {
            info!("Forwarder draining {} snapshots", pending.len());
            self.dispatch(&mut tasks, pending).await;
        }
        while let Some(joined) = tasks.join_next().await {
            self.record(joined);
        }
        debug!("Forwarder stopped");
    }

    async fn dispatch(&self, tasks: &mut JoinSet<BatchOutcome>, snapshots: Vec<FlushSnapshot>) {
        if snapshots.iter().all(FlushSnapshot::is_empty) {
            return;
        }
        let dd_api = self.get_dd_api().await.clone();
        let max_payload_bytes = self.max_payload_bytes;
        // waiting here stops the queue from draining, which is what pushes
        // back on the scheduler
        let Ok(permit) = Arc::clone(&self.in_flight).acquire_owned().await else {
            error!("Forwarder semaphore closed, {} snapshots dropped", snapshots.len());
            return;
        };
        tasks.spawn(async move {
            let outcome = ship_batch(&dd_api, &snapshots, max_payload_bytes).await;
            drop(permit);
            outcome
        });
    }

    fn record(&mut self, joined: Result<BatchOutcome, tokio::task::JoinError>) {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Forwarder task failed: {}", e);
                return;
            }
        };
        self.telemetry.batches_sent(outcome.payloads_sent);
        self.telemetry.batches_dropped(outcome.payloads_dropped);
        self.telemetry.payload_bytes_sent(outcome.bytes_sent);

        if outcome.transient_failure {
            self.telemetry.batches_failed(1);
            let since = *self.failing_since.get_or_insert_with(Instant::now);
            if since.elapsed() >= self.degraded_after {
                self.set_status(ForwarderStatus::Degraded);
            }
        } else if outcome.payloads_sent > 0 {
            self.failing_since = None;
            self.set_status(ForwarderStatus::Healthy);
        }
    }

    fn set_status(&self, status: ForwarderStatus) {
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            match status {
                ForwarderStatus::Degraded => warn!("Intake unreachable, forwarder degraded"),
                ForwarderStatus::Healthy => info!("Intake reachable again, forwarder healthy"),
            }
            *current = status;
            true
        });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Rough serialized size, good enough to decide when a batch is full.
fn estimate_bytes(snapshot: &FlushSnapshot) -> usize {
    let series: usize = snapshot
        .series
        .iter()
        .map(|p| 96 + p.name.len() + p.tags.to_strings().iter().map(|t| t.len() + 3).sum::<usize>())
        .sum();
    let checks: usize = snapshot
        .service_checks
        .iter()
        .map(|c| 96 + c.name.len() + c.message.as_ref().map_or(0, String::len))
        .sum();
    let events: usize = snapshot
        .events
        .iter()
        .map(|e| 160 + e.title.len() + e.text.len())
        .sum();
    series + checks + events
}

async fn ship_batch(
    dd_api: &DdApi,
    snapshots: &[FlushSnapshot],
    max_payload_bytes: usize,
) -> BatchOutcome {
    let series: Vec<Series> = snapshots
        .iter()
        .flat_map(|s| s.series.iter().map(|p| Series::new(p, s.timestamp, s.interval)))
        .collect();
    let checks: Vec<CheckRun> = snapshots
        .iter()
        .flat_map(|s| s.service_checks.iter().map(|c| CheckRun::new(c, s.timestamp)))
        .collect();
    let events: Vec<IntakeEvent> = snapshots
        .iter()
        .flat_map(|s| s.events.iter().map(|e| IntakeEvent::new(e, s.timestamp)))
        .collect();

    let mut outcome = BatchOutcome::default();
    let mut work = Vec::new();
    for (endpoint, split) in [
        (Endpoint::Series, split_payloads(Endpoint::Series, &series, max_payload_bytes)),
        (Endpoint::CheckRun, split_payloads(Endpoint::CheckRun, &checks, max_payload_bytes)),
        (Endpoint::Events, split_payloads(Endpoint::Events, &events, max_payload_bytes)),
    ] {
        outcome.payloads_dropped += u64::try_from(split.dropped).unwrap_or(u64::MAX);
        work.extend(split.payloads.into_iter().map(|p| (endpoint, p)));
    }
    debug!(
        "Flushing {} series, {} service checks and {} events in {} payloads",
        series.len(),
        checks.len(),
        events.len(),
        work.len()
    );

    let total = work.len();
    for (index, (endpoint, payload)) in work.into_iter().enumerate() {
        let size = u64::try_from(payload.len()).unwrap_or(u64::MAX);
        match classify(dd_api.ship(endpoint, payload).await) {
            Delivery::Sent => {
                outcome.payloads_sent += 1;
                outcome.bytes_sent += size;
            }
            Delivery::Dropped => outcome.payloads_dropped += 1,
            Delivery::Failed => {
                // the intake is struggling, the rest of the batch goes too
                outcome.transient_failure = true;
                outcome.payloads_dropped += u64::try_from(total - index).unwrap_or(u64::MAX);
                break;
            }
        }
    }
    outcome
}

enum Delivery {
    Sent,
    /// Rejected for good, move on to the next payload.
    Dropped,
    /// Retries exhausted.
    Failed,
}

fn classify(resp: Result<Response, ShippingError>) -> Delivery {
    match resp {
        Ok(_) => Delivery::Sent,
        Err(ShippingError::Payload(msg)) => {
            error!("Failed to prepare payload. Data dropped: {}", msg);
            Delivery::Dropped
        }
        Err(e) if e.is_permanent() => {
            error!("Intake rejected payload, data dropped: {}", e);
            Delivery::Dropped
        }
        Err(e) => {
            error!("Error shipping data, giving up on batch: {}", e);
            Delivery::Failed
        }
    }
}
