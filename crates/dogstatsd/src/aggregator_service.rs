// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Single-owner task around the [`Aggregator`].
//!
//! Decoded samples arrive on a bounded queue so a slow aggregator pushes back
//! on the decoders instead of growing memory. Control commands (flush,
//! inspection, shutdown) use a separate unbounded channel and are always
//! served first, so a flood of samples can never delay a flush tick.

use crate::aggregator::{Accumulator, Aggregator, Context, FlushSnapshot};
use crate::decoder::Sample;
use crate::errors::Insert;
use crate::telemetry::Telemetry;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

#[derive(Debug)]
pub enum AggregatorCommand {
    Flush {
        interval: Duration,
        response_tx: oneshot::Sender<FlushSnapshot>,
    },
    GetEntry {
        context: Context,
        response_tx: oneshot::Sender<Option<Accumulator>>,
    },
    Shutdown,
}

#[derive(Clone)]
pub struct AggregatorHandle {
    samples: mpsc::Sender<Vec<Sample>>,
    control: mpsc::UnboundedSender<AggregatorCommand>,
}

impl AggregatorHandle {
    /// Queues a batch without waiting. A full queue drops the whole batch.
    pub fn insert_batch(&self, samples: Vec<Sample>) -> Result<(), Insert> {
        self.samples.try_send(samples).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Insert::QueueFull,
            mpsc::error::TrySendError::Closed(_) => Insert::Closed,
        })
    }

    /// Queues a batch, waiting for room.
    pub async fn send_batch(&self, samples: Vec<Sample>) -> Result<(), Insert> {
        self.samples.send(samples).await.map_err(|_| Insert::Closed)
    }

    /// Closes the current window and returns its finalized snapshot. Samples
    /// queued before this call are part of the window.
    pub async fn flush(&self, interval: Duration) -> Result<FlushSnapshot, String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.control
            .send(AggregatorCommand::Flush {
                interval,
                response_tx,
            })
            .map_err(|e| format!("Failed to send flush command: {e}"))?;

        response_rx
            .await
            .map_err(|e| format!("Failed to receive flush response: {e}"))
    }

    pub async fn get_entry(&self, context: Context) -> Result<Option<Accumulator>, String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.control
            .send(AggregatorCommand::GetEntry {
                context,
                response_tx,
            })
            .map_err(|e| format!("Failed to send get_entry command: {e}"))?;

        response_rx
            .await
            .map_err(|e| format!("Failed to receive get_entry response: {e}"))
    }

    pub fn shutdown(&self) -> Result<(), mpsc::error::SendError<AggregatorCommand>> {
        self.control.send(AggregatorCommand::Shutdown)
    }
}

pub struct AggregatorService {
    aggregator: Aggregator,
    samples: mpsc::Receiver<Vec<Sample>>,
    control: mpsc::UnboundedReceiver<AggregatorCommand>,
    telemetry: Arc<Telemetry>,
}

impl AggregatorService {
    pub fn new(
        aggregator: Aggregator,
        queue_size: usize,
        telemetry: Arc<Telemetry>,
    ) -> (Self, AggregatorHandle) {
        let (samples_tx, samples_rx) = mpsc::channel(queue_size.max(1));
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let service = Self {
            aggregator,
            samples: samples_rx,
            control: control_rx,
            telemetry,
        };
        let handle = AggregatorHandle {
            samples: samples_tx,
            control: control_tx,
        };
        (service, handle)
    }

    pub async fn run(mut self) {
        debug!("Aggregator service started");

        loop {
            tokio::select! {
                biased;
                command = self.control.recv() => {
                    match command {
                        Some(AggregatorCommand::Flush { interval, response_tx }) => {
                            self.drain_queued();
                            self.flush(interval, response_tx);
                        }
                        Some(AggregatorCommand::GetEntry { context, response_tx }) => {
                            self.drain_queued();
                            let entry = self.aggregator.get_entry(&context).cloned();
                            if response_tx.send(entry).is_err() {
                                error!("Failed to send get_entry response - receiver dropped");
                            }
                        }
                        Some(AggregatorCommand::Shutdown) | None => {
                            debug!("Aggregator service shutting down");
                            break;
                        }
                    }
                }
                batch = self.samples.recv() => {
                    match batch {
                        Some(batch) => self.insert_batch(batch),
                        // handles own both channels, so this means all are gone
                        None => break,
                    }
                }
            }
        }
    }

    fn drain_queued(&mut self) {
        while let Ok(batch) = self.samples.try_recv() {
            self.insert_batch(batch);
        }
    }

    fn insert_batch(&mut self, batch: Vec<Sample>) {
        let mut refused = 0;
        let mut events_dropped = 0;
        for sample in batch {
            match self.aggregator.insert(sample) {
                Ok(()) => {}
                Err(Insert::Overflow(_)) => refused += 1,
                Err(_) => events_dropped += 1,
            }
        }
        if refused > 0 {
            self.telemetry.contexts_refused(refused);
            warn!("Total of {} samples refused, context ceiling reached", refused);
        }
        if events_dropped > 0 {
            self.telemetry.events_dropped(events_dropped);
            warn!("Total of {} events or service checks dropped", events_dropped);
        }
    }

    fn flush(&mut self, interval: Duration, response_tx: oneshot::Sender<FlushSnapshot>) {
        let window = self.aggregator.take_window();
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
            .unwrap_or_default();
        debug!("Closing window with {} contexts", window.context_count());
        // finalization is CPU bound and must not hold up ingestion
        tokio::task::spawn_blocking(move || {
            let snapshot = window.into_snapshot(timestamp, interval);
            if response_tx.send(snapshot).is_err() {
                error!("Failed to send flush response - receiver dropped");
            }
        });
    }
}
