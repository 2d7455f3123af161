// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Flush timer and backpressure between the aggregator and the forwarder.

use crate::aggregator::FlushSnapshot;
use crate::aggregator_service::AggregatorHandle;
use crate::flusher::{FlusherHandle, ForwarderStatus};
use crate::telemetry::Telemetry;
use serde::Deserialize;
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// What happens to a snapshot the forwarder cannot take right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum BackpressurePolicy {
    /// Hold up to `max_pending` snapshots, dropping the oldest past that.
    Buffer { max_pending: usize },
    /// Drop the new snapshot.
    Drop,
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        Self::Buffer {
            max_pending: crate::constants::DEFAULT_MAX_PENDING_SNAPSHOTS,
        }
    }
}

impl FromStr for BackpressurePolicy {
    type Err = String;

    /// Accepts `drop`, `buffer` or `buffer:<max_pending>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().split_once(':') {
            None if s.trim() == "drop" => Ok(Self::Drop),
            None if s.trim() == "buffer" => Ok(Self::default()),
            Some(("buffer", n)) => n
                .trim()
                .parse()
                .map(|max_pending| Self::Buffer { max_pending })
                .map_err(|_| format!("invalid pending snapshot count '{n}'")),
            _ => Err(format!("unknown backpressure policy '{s}'")),
        }
    }
}

pub struct FlushScheduler {
    aggregator_handle: AggregatorHandle,
    flusher_handle: FlusherHandle,
    flush_interval: Duration,
    policy: BackpressurePolicy,
    pending: VecDeque<FlushSnapshot>,
    pending_count: Arc<AtomicUsize>,
    telemetry: Arc<Telemetry>,
}

impl FlushScheduler {
    pub fn new(
        aggregator_handle: AggregatorHandle,
        flusher_handle: FlusherHandle,
        flush_interval: Duration,
        policy: BackpressurePolicy,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            aggregator_handle,
            flusher_handle,
            flush_interval,
            policy,
            pending: VecDeque::new(),
            pending_count: Arc::new(AtomicUsize::new(0)),
            telemetry,
        }
    }

    /// Live count of snapshots waiting for the forwarder.
    pub fn pending_count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.pending_count)
    }

    /// Flushes on every tick until cancelled, then performs a final flush
    /// and hands everything still pending to the forwarder.
    pub async fn run(mut self, cancel_token: CancellationToken) {
        let mut ticker = interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel_token.cancelled() => break,
                _ = ticker.tick() => self.flush().await,
            }
        }

        debug!("Final flush");
        if let Some(snapshot) = self.close_window().await {
            self.pending.push_back(snapshot);
        }
        while let Some(snapshot) = self.pending.pop_front() {
            if self.flusher_handle.send(snapshot).await.is_err() {
                error!("Forwarder gone, final snapshot dropped");
                self.telemetry.snapshots_dropped(1);
            }
        }
        self.update_pending_count();
    }

    /// One flush cycle.
    pub async fn flush(&mut self) {
        if let Some(snapshot) = self.close_window().await {
            self.offer(snapshot);
        } else {
            self.release_pending();
        }
        self.update_pending_count();
    }

    async fn close_window(&self) -> Option<FlushSnapshot> {
        match self.aggregator_handle.flush(self.flush_interval).await {
            Ok(snapshot) if snapshot.is_empty() => None,
            Ok(snapshot) => {
                self.telemetry.snapshots_emitted(1);
                Some(snapshot)
            }
            Err(e) => {
                error!("Failed to flush aggregator: {}", e);
                None
            }
        }
    }

    /// A degraded forwarder is handed one snapshot at a time, and only once
    /// its queue is empty, so it can find out when the intake is back.
    fn accepts(&self) -> bool {
        self.flusher_handle.status() != ForwarderStatus::Degraded || self.flusher_handle.is_idle()
    }

    /// Moves pending snapshots, oldest first, while the forwarder takes them.
    fn release_pending(&mut self) {
        while self.accepts() {
            let Some(snapshot) = self.pending.pop_front() else {
                break;
            };
            match self.flusher_handle.try_send(snapshot) {
                Ok(()) => {}
                Err(TrySendError::Full(snapshot)) => {
                    self.pending.push_front(snapshot);
                    break;
                }
                Err(TrySendError::Closed(_)) => {
                    self.telemetry.snapshots_dropped(1);
                    error!("Forwarder gone, snapshot dropped");
                }
            }
        }
    }

    fn offer(&mut self, snapshot: FlushSnapshot) {
        match self.policy {
            BackpressurePolicy::Buffer { max_pending } => {
                self.pending.push_back(snapshot);
                self.release_pending();
                while self.pending.len() > max_pending {
                    self.pending.pop_front();
                    self.telemetry.snapshots_dropped(1);
                    warn!(
                        "Forwarder backed up, dropped oldest snapshot ({} pending)",
                        max_pending
                    );
                }
            }
            BackpressurePolicy::Drop => {
                if !self.accepts() {
                    self.telemetry.snapshots_dropped(1);
                    warn!("Forwarder degraded, snapshot dropped");
                    return;
                }
                if let Err(e) = self.flusher_handle.try_send(snapshot) {
                    self.telemetry.snapshots_dropped(1);
                    warn!("Forwarder queue unavailable, snapshot dropped: {}", e);
                }
            }
        }
    }

    fn update_pending_count(&self) {
        self.pending_count.store(self.pending.len(), Ordering::Relaxed);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::aggregator::{Aggregator, AggregatorConfig};
    use crate::aggregator_service::AggregatorService;
    use crate::decoder::Sample;
    use crate::metric::{parse, EMPTY_TAGS};
    use tokio::sync::{mpsc, watch};

    struct Harness {
        scheduler: FlushScheduler,
        aggregator: AggregatorHandle,
        forwarder_rx: mpsc::Receiver<FlushSnapshot>,
        status_tx: watch::Sender<ForwarderStatus>,
        telemetry: Arc<Telemetry>,
    }

    fn harness(policy: BackpressurePolicy) -> Harness {
        let telemetry = Arc::new(Telemetry::default());
        let aggregator = Aggregator::new(AggregatorConfig::default(), None, EMPTY_TAGS).unwrap();
        let (service, aggregator_handle) =
            AggregatorService::new(aggregator, 16, Arc::clone(&telemetry));
        tokio::spawn(service.run());
        let (tx, forwarder_rx) = mpsc::channel(1);
        let (status_tx, status_rx) = watch::channel(ForwarderStatus::Healthy);
        let scheduler = FlushScheduler::new(
            aggregator_handle.clone(),
            FlusherHandle::from_parts(tx, status_rx),
            Duration::from_secs(10),
            policy,
            Arc::clone(&telemetry),
        );
        Harness {
            scheduler,
            aggregator: aggregator_handle,
            forwarder_rx,
            status_tx,
            telemetry,
        }
    }

    async fn one_window(h: &mut Harness) {
        h.aggregator
            .send_batch(vec![Sample::Metric(parse("c:1|c").unwrap())])
            .await
            .unwrap();
        h.scheduler.flush().await;
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("drop".parse(), Ok(BackpressurePolicy::Drop));
        assert_eq!(
            "buffer".parse(),
            Ok(BackpressurePolicy::Buffer { max_pending: 5 })
        );
        assert_eq!(
            "buffer:2".parse(),
            Ok(BackpressurePolicy::Buffer { max_pending: 2 })
        );
        assert!("block".parse::<BackpressurePolicy>().is_err());
    }

    #[tokio::test]
    async fn test_buffer_bounds_pending_when_degraded() {
        let mut h = harness(BackpressurePolicy::Buffer { max_pending: 3 });
        h.status_tx.send(ForwarderStatus::Degraded).unwrap();
        for _ in 0..10 {
            one_window(&mut h).await;
            assert!(h.scheduler.pending_count().load(Ordering::Relaxed) <= 3);
        }
        // the first window went out as a probe, the queue never emptied after
        assert_eq!(h.scheduler.pending_count().load(Ordering::Relaxed), 3);
        assert_eq!(h.telemetry.snapshot().snapshots_dropped, 6);
        assert!(h.forwarder_rx.try_recv().is_ok());
        assert!(h.forwarder_rx.try_recv().is_err());

        // recovery releases what the queue can take
        h.status_tx.send(ForwarderStatus::Healthy).unwrap();
        h.scheduler.flush().await;
        assert!(h.forwarder_rx.try_recv().is_ok());
        assert_eq!(h.scheduler.pending_count().load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_degraded_probe_waits_for_empty_queue() {
        let mut h = harness(BackpressurePolicy::default());
        h.status_tx.send(ForwarderStatus::Degraded).unwrap();
        one_window(&mut h).await;
        one_window(&mut h).await;
        assert_eq!(h.scheduler.pending_count().load(Ordering::Relaxed), 1);
        h.forwarder_rx.recv().await.unwrap();
        // the probe was taken, the next tick sends another one
        h.scheduler.flush().await;
        assert!(h.forwarder_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_buffer_holds_when_queue_full() {
        let mut h = harness(BackpressurePolicy::default());
        one_window(&mut h).await;
        one_window(&mut h).await;
        // queue of one: first delivered, second waiting
        assert_eq!(h.scheduler.pending_count().load(Ordering::Relaxed), 1);
        h.forwarder_rx.recv().await.unwrap();
        // the next tick releases it even with nothing new
        h.scheduler.flush().await;
        // counter contexts carry over, so this tick also produced a snapshot
        assert!(h.forwarder_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_drop_policy() {
        let mut h = harness(BackpressurePolicy::Drop);
        h.status_tx.send(ForwarderStatus::Degraded).unwrap();
        for _ in 0..4 {
            one_window(&mut h).await;
        }
        assert_eq!(h.scheduler.pending_count().load(Ordering::Relaxed), 0);
        // one probe delivered, the rest dropped
        assert_eq!(h.telemetry.snapshot().snapshots_dropped, 3);
        assert!(h.forwarder_rx.try_recv().is_ok());
        assert!(h.forwarder_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_final_flush_on_cancel() {
        let h = harness(BackpressurePolicy::default());
        let Harness {
            scheduler,
            aggregator,
            mut forwarder_rx,
            ..
        } = h;
        aggregator
            .send_batch(vec![Sample::Metric(parse("last:1|c").unwrap())])
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        scheduler.run(cancel).await;
        let snapshot = forwarder_rx.recv().await.unwrap();
        assert_eq!(snapshot.series[0].name.as_str(), "last");
    }
}
