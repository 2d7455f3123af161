// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wires the pipeline together and owns its shutdown sequence.

use crate::aggregator::Aggregator;
use crate::aggregator_service::{AggregatorHandle, AggregatorService};
use crate::api_key::ApiKeyFactory;
use crate::config::{Config, ConfigError};
use crate::decoder::Decoder;
use crate::dogstatsd::{DogStatsD, Ingestor, RunningListener};
use crate::errors::ListenerError;
use crate::flusher::{Flusher, FlusherConfig, ForwarderStatus};
use crate::health::HealthEmitter;
use crate::metric::SortedTags;
use crate::scheduler::FlushScheduler;
use crate::telemetry::Telemetry;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Listener(#[from] ListenerError),
}

/// A running agent. Dropping it without [`Agent::stop`] loses the final
/// flush.
pub struct Agent {
    telemetry: Arc<Telemetry>,
    aggregator_handle: AggregatorHandle,
    ingestor: Ingestor,
    listener: RunningListener,
    udp_addr: Option<SocketAddr>,
    forwarder_status: watch::Receiver<ForwarderStatus>,
    pending_snapshots: Arc<AtomicUsize>,
    aggregator_task: JoinHandle<()>,
    scheduler_cancel: CancellationToken,
    scheduler_task: JoinHandle<()>,
    forwarder_cancel: CancellationToken,
    forwarder_task: JoinHandle<()>,
    health_cancel: CancellationToken,
    health_task: Option<JoinHandle<()>>,
}

impl Agent {
    /// Validates `config`, binds the sockets and starts every stage. Nothing
    /// is spawned if binding fails.
    pub async fn start(config: Config) -> Result<Agent, AgentError> {
        config.validate()?;
        let intake_url_prefix = config.intake_url_prefix()?;
        let global_tags = SortedTags::parse(&config.tags.join(","))
            .map_err(|e| ConfigError::Invalid(format!("global tags: {e}")))?;
        let aggregator = Aggregator::new(
            config.aggregator.clone(),
            config.hostname.clone(),
            global_tags,
        )
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let telemetry = Arc::new(Telemetry::default());
        let server = DogStatsD::bind(&config.listener, Arc::clone(&telemetry)).await?;
        let udp_addr = server.local_udp_addr();

        let (service, aggregator_handle) =
            AggregatorService::new(aggregator, config.sample_queue_size, Arc::clone(&telemetry));
        let aggregator_task = tokio::spawn(service.run());

        let forwarder = &config.forwarder;
        let mut flusher_config = FlusherConfig::new(
            Arc::new(ApiKeyFactory::new_from_static_key(&config.api_key)),
            intake_url_prefix,
        );
        flusher_config.https_proxy.clone_from(&forwarder.https_proxy);
        flusher_config.timeout = forwarder.timeout;
        flusher_config.retry_strategy = forwarder.retry_strategy.clone();
        flusher_config.compression_level = forwarder.compression_level;
        flusher_config.max_payload_bytes = forwarder.max_payload_bytes;
        flusher_config.max_in_flight = forwarder.max_in_flight;
        flusher_config.max_linger = forwarder.max_linger;
        flusher_config.queue_size = forwarder.queue_size;
        flusher_config.degraded_after = forwarder.degraded_after;
        let (flusher, flusher_handle) = Flusher::new(flusher_config, Arc::clone(&telemetry));
        let forwarder_status = flusher_handle.subscribe();
        let forwarder_cancel = CancellationToken::new();
        let forwarder_task = tokio::spawn(flusher.run(forwarder_cancel.clone()));

        let scheduler = FlushScheduler::new(
            aggregator_handle.clone(),
            flusher_handle,
            config.flush_interval,
            forwarder.backpressure,
            Arc::clone(&telemetry),
        );
        let pending_snapshots = scheduler.pending_count();
        let scheduler_cancel = CancellationToken::new();
        let scheduler_task = tokio::spawn(scheduler.run(scheduler_cancel.clone()));

        let listener = server.spawn(aggregator_handle.clone());

        let ingestor = Ingestor::new(
            Decoder::new(config.listener.metric_namespace.clone()),
            aggregator_handle.clone(),
            Arc::clone(&telemetry),
        );
        let health_cancel = CancellationToken::new();
        let health_task = config.health.enabled.then(|| {
            let emitter =
                HealthEmitter::new(&config.health, ingestor.clone(), Arc::clone(&telemetry));
            tokio::spawn(emitter.run(health_cancel.clone()))
        });

        info!(
            "DogStatsD agent started, flushing every {:?}",
            config.flush_interval
        );
        Ok(Agent {
            telemetry,
            aggregator_handle,
            ingestor,
            listener,
            udp_addr,
            forwarder_status,
            pending_snapshots,
            aggregator_task,
            scheduler_cancel,
            scheduler_task,
            forwarder_cancel,
            forwarder_task,
            health_cancel,
            health_task,
        })
    }

    /// Bound UDP address, with the real port when 0 was configured.
    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_addr
    }

    pub fn aggregator_handle(&self) -> &AggregatorHandle {
        &self.aggregator_handle
    }

    /// Injects samples without going through a socket.
    pub fn ingestor(&self) -> &Ingestor {
        &self.ingestor
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    pub fn forwarder_status(&self) -> ForwarderStatus {
        *self.forwarder_status.borrow()
    }

    /// Snapshots held back by the flush scheduler.
    pub fn pending_snapshots(&self) -> usize {
        self.pending_snapshots.load(Ordering::Relaxed)
    }

    /// Stops reading, flushes what was received and gives the forwarder
    /// until `grace` runs out to deliver it.
    pub async fn stop(mut self, grace: Duration) {
        info!("DogStatsD agent stopping");
        let deadline = Instant::now() + grace;

        self.health_cancel.cancel();
        if let Some(task) = self.health_task.take() {
            join("health emitter", task).await;
        }

        self.listener.stop_readers().await;
        self.listener.drain_decoders().await;

        self.scheduler_cancel.cancel();
        match timeout_at(deadline, &mut self.scheduler_task).await {
            Ok(res) => log_join("flush scheduler", res),
            Err(_) => {
                warn!("Final flush did not finish within {:?}", grace);
                self.scheduler_task.abort();
            }
        }

        self.forwarder_cancel.cancel();
        match timeout_at(deadline, &mut self.forwarder_task).await {
            Ok(res) => log_join("forwarder", res),
            Err(_) => {
                warn!(
                    "Forwarder did not drain within {:?}, dropping in-flight payloads",
                    grace
                );
                self.forwarder_task.abort();
            }
        }

        if self.aggregator_handle.shutdown().is_err() {
            debug!("Aggregator already stopped");
        }
        join("aggregator", self.aggregator_task).await;

        self.listener.remove_socket_files();
        info!("DogStatsD agent stopped");
    }
}

async fn join(name: &str, task: JoinHandle<()>) {
    log_join(name, task.await);
}

fn log_join(name: &str, res: Result<(), tokio::task::JoinError>) {
    if let Err(e) = res {
        error!("{} task failed: {}", name, e);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::constants;
    use std::time::Duration;
    use tokio::net::UdpSocket;

    fn local_config() -> Config {
        let mut config = Config {
            api_key: "test".to_string(),
            dd_url: Some("http://127.0.0.1:1".to_string()),
            hostname: Some("agent-test".to_string()),
            flush_interval: Duration::from_secs(3600),
            ..Config::default()
        };
        config.listener.port = Some(0);
        config.health.enabled = false;
        config
    }

    #[tokio::test]
    async fn test_start_binds_ephemeral_port() {
        let agent = Agent::start(local_config()).await.unwrap();
        let addr = agent.udp_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(agent.forwarder_status(), ForwarderStatus::Healthy);
        agent.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut config = local_config();
        config.listener.port = Some(taken.local_addr().unwrap().port());
        let err = Agent::start(config).await.err().unwrap();
        assert!(matches!(
            err,
            AgentError::Listener(ListenerError::BindUdp { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = local_config();
        config.site = "not a site".to_string();
        config.dd_url = None;
        assert!(matches!(
            Agent::start(config).await.err().unwrap(),
            AgentError::Config(_)
        ));
    }

    #[tokio::test]
    async fn test_udp_sample_reaches_aggregator() {
        let agent = Agent::start(local_config()).await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(b"page.views:1|c|#env:prod", agent.udp_addr().unwrap())
            .await
            .unwrap();

        let mut received = 0;
        for _ in 0..100 {
            received = agent.telemetry().snapshot().packets_received;
            if received > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(received, 1);

        // let the decoder hand the batch over before flushing
        tokio::time::sleep(Duration::from_millis(50)).await;
        let snapshot = agent
            .aggregator_handle()
            .flush(Duration::from_secs(10))
            .await
            .unwrap();
        let point = snapshot
            .series
            .iter()
            .find(|p| p.name.as_str() == "page.views")
            .unwrap();
        assert!((point.value - 1.0).abs() < f64::EPSILON);
        assert_eq!(point.host.as_ref().map(ustr::Ustr::as_str), Some("agent-test"));
        agent.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_ingestor_applies_namespace() {
        let mut config = local_config();
        config.listener.metric_namespace = Some("app".to_string());
        let agent = Agent::start(config).await.unwrap();
        agent.ingestor().ingest_payload(b"hits:2|c").await.unwrap();
        let snapshot = agent
            .aggregator_handle()
            .flush(constants::DEFAULT_FLUSH_INTERVAL)
            .await
            .unwrap();
        assert!(snapshot.series.iter().any(|p| p.name.as_str() == "app.hits"));
        agent.stop(Duration::from_millis(200)).await;
    }
}
