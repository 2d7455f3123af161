// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! DogStatsD transport listener.
//!
//! Readers own the sockets (UDP, Unix datagram, Unix stream) and never wait
//! on anything downstream: every read becomes a [`RawPacket`] that is offered
//! to a decoder worker's bounded queue and dropped, with a counter, if that
//! queue is full. Decoder workers turn packets into samples and hand them to
//! the aggregator, waiting for room when it falls behind.

use crate::aggregator_service::AggregatorHandle;
use crate::constants;
use crate::decoder::{Decoder, RawPacket, Sample, Transport};
use crate::errors::{Insert, ListenerError};
use crate::origin::ContainerResolver;
use crate::telemetry::Telemetry;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

#[cfg(unix)]
use {
    tokio::io::AsyncReadExt,
    tokio::net::{UnixDatagram, UnixListener, UnixStream},
};

/// Configuration for the DogStatsD listener
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Host to bind the UDP socket to (e.g., "127.0.0.1")
    pub host: String,
    /// UDP port, `None` leaves the network socket unbound. `Some(0)` binds an
    /// ephemeral port.
    pub port: Option<u16>,
    /// Unix datagram socket path
    pub socket_path: Option<PathBuf>,
    /// Unix stream socket path, length prefixed frames
    pub stream_socket_path: Option<PathBuf>,
    /// Accept UDP packets from non-loopback sources
    pub non_local_traffic: bool,
    /// Largest packet accepted, in bytes
    pub buffer_size: usize,
    /// Packets queued per decoder worker before reads start dropping
    pub queue_size: usize,
    pub reader_workers: usize,
    pub decoder_workers: usize,
    /// Optional namespace to prepend to all metric names (e.g., "myapp")
    pub metric_namespace: Option<String>,
    /// Tag stream socket traffic with the sender's container
    pub origin_detection: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: constants::DEFAULT_HOST.to_string(),
            port: Some(constants::DEFAULT_PORT),
            socket_path: None,
            stream_socket_path: None,
            non_local_traffic: false,
            buffer_size: constants::DEFAULT_BUFFER_SIZE,
            queue_size: constants::DEFAULT_PACKET_QUEUE_SIZE,
            reader_workers: 1,
            decoder_workers: 2,
            metric_namespace: None,
            origin_detection: true,
        }
    }
}

// BufferReader abstracts connectionless transports.
enum BufferReader {
    UdpSocket(Arc<UdpSocket>),

    #[cfg(unix)]
    UnixDatagram(Arc<UnixDatagram>),

    /// Mirror reader for testing - replays a fixed buffer
    #[allow(dead_code)]
    MirrorTest(Vec<u8>, SocketAddr),
}

impl BufferReader {
    /// Blocks until one packet arrives.
    async fn read(&self, buf: &mut [u8]) -> std::io::Result<(usize, Transport)> {
        match self {
            BufferReader::UdpSocket(socket) => {
                let (amt, src) = socket.recv_from(buf).await?;
                Ok((amt, Transport::Udp(src)))
            }
            #[cfg(unix)]
            BufferReader::UnixDatagram(socket) => {
                let amt = socket.recv(buf).await?;
                Ok((amt, Transport::UnixDatagram))
            }
            BufferReader::MirrorTest(data, src) => {
                let amt = data.len().min(buf.len());
                buf[..amt].copy_from_slice(&data[..amt]);
                Ok((amt, Transport::Udp(*src)))
            }
        }
    }

    fn share(&self) -> Self {
        match self {
            BufferReader::UdpSocket(s) => BufferReader::UdpSocket(Arc::clone(s)),
            #[cfg(unix)]
            BufferReader::UnixDatagram(s) => BufferReader::UnixDatagram(Arc::clone(s)),
            BufferReader::MirrorTest(data, src) => BufferReader::MirrorTest(data.clone(), *src),
        }
    }
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback()),
    }
}

/// Spreads packets over the decoder queues without ever waiting.
struct PacketRouter {
    queues: Vec<mpsc::Sender<RawPacket>>,
    next: AtomicUsize,
    non_local_traffic: bool,
    telemetry: Arc<Telemetry>,
}

impl PacketRouter {
    fn route(&self, packet: RawPacket) {
        self.telemetry.packets_received(1);
        self.telemetry
            .bytes_received(u64::try_from(packet.payload.len()).unwrap_or(u64::MAX));
        if let Transport::Udp(src) = packet.transport {
            if !self.non_local_traffic && !is_loopback(src.ip()) {
                trace!("Dropping packet from non-local source {}", src);
                self.telemetry.packets_dropped_non_local(1);
                return;
            }
        }
        if self.queues.is_empty() {
            return;
        }
        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.queues.len();
        if let Err(e) = self.queues[slot].try_send(packet) {
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    self.telemetry.packets_dropped_queue_full(1);
                    trace!("Decoder queue {} full, packet dropped", slot);
                }
                mpsc::error::TrySendError::Closed(_) => {
                    self.telemetry.packets_dropped_queue_closed(1);
                    warn!("Decoder queue {} closed, packet dropped", slot);
                }
            }
        }
    }
}

/// Decodes packets and feeds the aggregator.
#[derive(Clone)]
pub struct Ingestor {
    decoder: Arc<Decoder>,
    aggregator_handle: AggregatorHandle,
    telemetry: Arc<Telemetry>,
}

impl Ingestor {
    pub fn new(
        decoder: Decoder,
        aggregator_handle: AggregatorHandle,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            decoder: Arc::new(decoder),
            aggregator_handle,
            telemetry,
        }
    }

    /// Decodes `payload` as if it had arrived on a socket. Returns the number
    /// of samples handed to the aggregator.
    pub async fn ingest_payload(&self, payload: &[u8]) -> Result<usize, Insert> {
        self.ingest_packet(RawPacket::new(payload.to_vec(), Transport::Internal))
            .await
    }

    pub async fn ingest_packet(&self, packet: RawPacket) -> Result<usize, Insert> {
        let decoded = self.decoder.decode(&packet);
        if !decoded.errors.is_empty() {
            self.telemetry
                .decode_errors(u64::try_from(decoded.errors.len()).unwrap_or(u64::MAX));
            for e in &decoded.errors {
                debug!("Dropped line from {}: {}", packet.transport, e);
            }
        }
        let count = decoded.samples.len();
        self.ingest(decoded.samples).await?;
        Ok(count)
    }

    /// Hands already typed samples to the aggregator.
    pub async fn ingest(&self, samples: Vec<Sample>) -> Result<(), Insert> {
        if samples.is_empty() {
            return Ok(());
        }
        let count = u64::try_from(samples.len()).unwrap_or(u64::MAX);
        self.aggregator_handle
            .send_batch(samples)
            .await
            .inspect_err(|e| {
                self.telemetry.samples_dropped(count);
                warn!("Failed to send {} samples to aggregator: {}", count, e);
            })
    }
}

/// DogStatsD server with its sockets bound but not yet reading.
pub struct DogStatsD {
    config: ListenerConfig,
    readers: Vec<BufferReader>,
    #[cfg(unix)]
    stream_listener: Option<UnixListener>,
    socket_paths: Vec<PathBuf>,
    udp_addr: Option<SocketAddr>,
    telemetry: Arc<Telemetry>,
}

impl DogStatsD {
    /// Binds every configured transport. A bind failure is fatal.
    pub async fn bind(
        config: &ListenerConfig,
        telemetry: Arc<Telemetry>,
    ) -> Result<DogStatsD, ListenerError> {
        if config.port.is_none()
            && config.socket_path.is_none()
            && config.stream_socket_path.is_none()
        {
            return Err(ListenerError::NoTransport);
        }

        let mut readers = Vec::new();
        let mut socket_paths = Vec::new();
        let mut udp_addr = None;

        if let Some(port) = config.port {
            let addr = format!("{}:{}", config.host, port);
            let socket = UdpSocket::bind(&addr)
                .await
                .map_err(|source| ListenerError::BindUdp {
                    addr: addr.clone(),
                    source,
                })?;
            let local = socket
                .local_addr()
                .map_err(|source| ListenerError::BindUdp { addr, source })?;
            info!("DogStatsD listening on udp://{}", local);
            udp_addr = Some(local);
            readers.push(BufferReader::UdpSocket(Arc::new(socket)));
        }

        #[cfg(unix)]
        let stream_listener = {
            if let Some(path) = &config.socket_path {
                remove_stale_socket(path);
                let socket = UnixDatagram::bind(path).map_err(|source| ListenerError::BindUnix {
                    path: path.clone(),
                    source,
                })?;
                info!("DogStatsD listening on unixgram://{}", path.display());
                socket_paths.push(path.clone());
                readers.push(BufferReader::UnixDatagram(Arc::new(socket)));
            }
            match &config.stream_socket_path {
                Some(path) => {
                    remove_stale_socket(path);
                    let listener =
                        UnixListener::bind(path).map_err(|source| ListenerError::BindUnix {
                            path: path.clone(),
                            source,
                        })?;
                    info!("DogStatsD listening on unix://{}", path.display());
                    socket_paths.push(path.clone());
                    Some(listener)
                }
                None => None,
            }
        };

        #[cfg(not(unix))]
        if config.socket_path.is_some() || config.stream_socket_path.is_some() {
            return Err(ListenerError::UnixUnsupported);
        }

        Ok(DogStatsD {
            config: config.clone(),
            readers,
            #[cfg(unix)]
            stream_listener,
            socket_paths,
            udp_addr,
            telemetry,
        })
    }

    /// Address of the UDP socket, with the real port when 0 was requested.
    pub fn local_udp_addr(&self) -> Option<SocketAddr> {
        self.udp_addr
    }

    /// Starts decoder workers and readers.
    pub fn spawn(self, aggregator_handle: AggregatorHandle) -> RunningListener {
        let cancel_token = CancellationToken::new();
        let telemetry = Arc::clone(&self.telemetry);
        let ingestor = Ingestor::new(
            Decoder::new(self.config.metric_namespace.clone()),
            aggregator_handle,
            Arc::clone(&telemetry),
        );

        let mut decoders = JoinSet::new();
        let mut queues = Vec::new();
        for worker in 0..self.config.decoder_workers.max(1) {
            let (tx, rx) = mpsc::channel(self.config.queue_size.max(1));
            queues.push(tx);
            decoders.spawn(run_decoder(worker, rx, ingestor.clone()));
        }
        let router = Arc::new(PacketRouter {
            queues,
            next: AtomicUsize::new(0),
            non_local_traffic: self.config.non_local_traffic,
            telemetry,
        });

        let mut readers = JoinSet::new();
        for reader in &self.readers {
            for _ in 0..self.config.reader_workers.max(1) {
                readers.spawn(spin(
                    reader.share(),
                    self.config.buffer_size,
                    Arc::clone(&router),
                    cancel_token.clone(),
                ));
            }
        }

        #[cfg(unix)]
        if let Some(listener) = self.stream_listener {
            let resolver = self
                .config
                .origin_detection
                .then(|| Arc::new(ContainerResolver::new()));
            readers.spawn(accept_streams(
                listener,
                self.config.buffer_size,
                resolver,
                Arc::clone(&router),
                cancel_token.clone(),
            ));
        }

        RunningListener {
            cancel_token,
            readers,
            decoders,
            socket_paths: self.socket_paths,
        }
    }
}

/// Reader and decoder tasks of a started listener.
pub struct RunningListener {
    cancel_token: CancellationToken,
    readers: JoinSet<()>,
    decoders: JoinSet<()>,
    socket_paths: Vec<PathBuf>,
}

impl RunningListener {
    /// Stops reading. Packets already queued are still decoded.
    pub async fn stop_readers(&mut self) {
        self.cancel_token.cancel();
        while let Some(res) = self.readers.join_next().await {
            if let Err(e) = res {
                error!("Listener reader task failed: {}", e);
            }
        }
    }

    /// Waits for decoders to empty their queues. Call after
    /// [`RunningListener::stop_readers`].
    pub async fn drain_decoders(&mut self) {
        while let Some(res) = self.decoders.join_next().await {
            if let Err(e) = res {
                error!("Decoder task failed: {}", e);
            }
        }
    }

    pub fn remove_socket_files(&self) {
        for path in &self.socket_paths {
            match std::fs::remove_file(path) {
                Ok(()) => debug!("Removed socket file {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove socket file {}: {}", path.display(), e),
            }
        }
    }
}

#[cfg(unix)]
fn remove_stale_socket(path: &std::path::Path) {
    if path.exists() {
        debug!("Removing stale socket file {}", path.display());
        if let Err(e) = std::fs::remove_file(path) {
            warn!("Failed to remove stale socket {}: {}", path.display(), e);
        }
    }
}

/// Main read loop of one reader worker.
async fn spin(
    reader: BufferReader,
    buffer_size: usize,
    router: Arc<PacketRouter>,
    cancel_token: CancellationToken,
) {
    // one spare byte tells a full datagram from a truncated one
    let mut buf = vec![0u8; buffer_size.max(1) + 1];
    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            read = consume_statsd(&reader, &mut buf, &router) => {
                if let Err(e) = read {
                    // transient socket errors such as EAGAIN are retried
                    warn!("Failed to read from socket: {}", e);
                }
            }
        }
    }
    debug!("Reader stopped");
}

/// Receives one packet from the transport and routes it.
async fn consume_statsd(
    reader: &BufferReader,
    buf: &mut [u8],
    router: &PacketRouter,
) -> std::io::Result<()> {
    let (amt, transport) = reader.read(buf).await?;
    trace!("Received {} bytes from {}", amt, transport);
    if amt >= buf.len() {
        // the kernel cut the datagram, its last line cannot be trusted
        router.telemetry.packets_dropped_oversized(1);
        warn!(
            "Dropping datagram from {} larger than the {} byte buffer",
            transport,
            buf.len() - 1
        );
        return Ok(());
    }
    router.route(RawPacket::new(buf[..amt].to_vec(), transport));
    Ok(())
}

async fn run_decoder(worker: usize, mut rx: mpsc::Receiver<RawPacket>, ingestor: Ingestor) {
    debug!("Decoder {} started", worker);
    while let Some(packet) = rx.recv().await {
        // failures are counted and logged by the ingestor
        let _ = ingestor.ingest_packet(packet).await;
    }
    debug!("Decoder {} drained", worker);
}

#[cfg(unix)]
async fn accept_streams(
    listener: UnixListener,
    buffer_size: usize,
    resolver: Option<Arc<ContainerResolver>>,
    router: Arc<PacketRouter>,
    cancel_token: CancellationToken,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    connections.spawn(read_frames(
                        stream,
                        buffer_size,
                        resolver.clone(),
                        Arc::clone(&router),
                        cancel_token.clone(),
                    ));
                }
                Err(e) => warn!("Failed to accept stream connection: {}", e),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    while connections.join_next().await.is_some() {}
    debug!("Stream listener stopped");
}

#[cfg(unix)]
async fn read_frames(
    mut stream: UnixStream,
    buffer_size: usize,
    resolver: Option<Arc<ContainerResolver>>,
    router: Arc<PacketRouter>,
    cancel_token: CancellationToken,
) {
    let origin = match (resolver, stream.peer_cred().ok().and_then(|c| c.pid())) {
        (Some(resolver), Some(pid)) => tokio::task::spawn_blocking(move || resolver.resolve(pid))
            .await
            .ok()
            .flatten(),
        _ => None,
    };
    trace!("Stream connection opened, origin {:?}", origin);

    loop {
        let frame = tokio::select! {
            () = cancel_token.cancelled() => break,
            frame = read_frame(&mut stream, buffer_size) => frame,
        };
        match frame {
            Ok(Some(payload)) => {
                let mut packet = RawPacket::new(payload, Transport::UnixStream);
                packet.origin = origin;
                router.route(packet);
            }
            Ok(None) => break,
            Err(e) => {
                if e.kind() == std::io::ErrorKind::InvalidData {
                    router.telemetry.packets_dropped_oversized(1);
                }
                debug!("Closing stream connection: {}", e);
                break;
            }
        }
    }
}

/// Reads one `u32` little endian length prefixed frame. `None` on a clean
/// close between frames.
#[cfg(unix)]
async fn read_frame(stream: &mut UnixStream, buffer_size: usize) -> std::io::Result<Option<Vec<u8>>> {
    let len = match stream.read_u32_le().await {
        Ok(len) => usize::try_from(len).unwrap_or(usize::MAX),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if len > buffer_size {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds buffer size {buffer_size}"),
        ));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::aggregator::{Aggregator, AggregatorConfig, FlushSnapshot};
    use crate::aggregator_service::AggregatorService;
    use crate::metric::EMPTY_TAGS;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tracing_test::traced_test;

    const WINDOW: Duration = Duration::from_secs(10);

    fn aggregator_service() -> (AggregatorService, AggregatorHandle) {
        let aggregator = Aggregator::new(AggregatorConfig::default(), None, EMPTY_TAGS).unwrap();
        AggregatorService::new(aggregator, 64, Arc::new(Telemetry::default()))
    }

    async fn setup_and_consume_dogstatsd(
        statsd_string: &str,
        source: IpAddr,
        non_local_traffic: bool,
    ) -> (FlushSnapshot, Arc<Telemetry>) {
        let (service, handle) = aggregator_service();
        let service_task = tokio::spawn(service.run());
        let telemetry = Arc::new(Telemetry::default());

        let (tx, rx) = mpsc::channel(8);
        let router = PacketRouter {
            queues: vec![tx],
            next: AtomicUsize::new(0),
            non_local_traffic,
            telemetry: Arc::clone(&telemetry),
        };
        let reader = BufferReader::MirrorTest(
            statsd_string.as_bytes().to_vec(),
            SocketAddr::new(source, 0),
        );
        let mut buf = vec![0u8; constants::DEFAULT_BUFFER_SIZE];
        consume_statsd(&reader, &mut buf, &router).await.unwrap();
        drop(router);

        let ingestor = Ingestor::new(Decoder::default(), handle.clone(), Arc::clone(&telemetry));
        run_decoder(0, rx, ingestor).await;

        let snapshot = handle.flush(WINDOW).await.expect("Failed to flush");
        handle.shutdown().expect("Failed to shutdown");
        service_task.await.expect("Service task failed");
        (snapshot, telemetry)
    }

    #[tokio::test]
    async fn test_dogstatsd_multi_metric() {
        let (snapshot, telemetry) = setup_and_consume_dogstatsd(
            "metric3:3|c|#tag3:val3,tag4:val4\nmetric1:1|c\nmetric2:2|c|#tag2:val2\n",
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            false,
        )
        .await;
        assert_eq!(snapshot.series.len(), 3);
        assert_eq!(telemetry.snapshot().packets_received, 1);
    }

    #[tokio::test]
    async fn test_non_local_traffic_dropped() {
        let (snapshot, telemetry) = setup_and_consume_dogstatsd(
            "metric1:1|c",
            IpAddr::V4(Ipv4Addr::new(111, 112, 113, 114)),
            false,
        )
        .await;
        assert!(snapshot.is_empty());
        assert_eq!(telemetry.snapshot().packets_dropped_non_local, 1);
    }

    #[tokio::test]
    async fn test_non_local_traffic_allowed() {
        let (snapshot, _) = setup_and_consume_dogstatsd(
            "metric1:1|c",
            IpAddr::V4(Ipv4Addr::new(111, 112, 113, 114)),
            true,
        )
        .await;
        assert_eq!(snapshot.series.len(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unsupported_type_is_not_an_error_log() {
        let (snapshot, telemetry) = setup_and_consume_dogstatsd(
            "metric1:1|zz\n_sc|servicecheck|0\n_e{5,10}:event|test event",
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            false,
        )
        .await;
        assert!(snapshot.series.is_empty());
        assert_eq!(snapshot.service_checks.len(), 1);
        assert_eq!(snapshot.events.len(), 1);
        assert_eq!(telemetry.snapshot().decode_errors, 1);
        assert!(logs_contain("unsupported metric type"));
        assert!(!logs_contain("ERROR"));
    }

    #[tokio::test]
    async fn test_full_decoder_queue_drops() {
        let telemetry = Arc::new(Telemetry::default());
        let (tx, _rx) = mpsc::channel(1);
        let router = PacketRouter {
            queues: vec![tx],
            next: AtomicUsize::new(0),
            non_local_traffic: false,
            telemetry: Arc::clone(&telemetry),
        };
        for _ in 0..3 {
            router.route(RawPacket::new(b"a:1|c".to_vec(), Transport::UnixDatagram));
        }
        let snap = telemetry.snapshot();
        assert_eq!(snap.packets_received, 3);
        assert_eq!(snap.packets_dropped_queue_full, 2);
    }

    #[tokio::test]
    async fn test_closed_decoder_queue_counts_drop() {
        let telemetry = Arc::new(Telemetry::default());
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let router = PacketRouter {
            queues: vec![tx],
            next: AtomicUsize::new(0),
            non_local_traffic: false,
            telemetry: Arc::clone(&telemetry),
        };
        router.route(RawPacket::new(b"a:1|c".to_vec(), Transport::UnixDatagram));
        assert_eq!(telemetry.snapshot().packets_dropped_queue_closed, 1);
    }

    #[tokio::test]
    async fn test_huge_event_lengths_keep_decoder_alive() {
        let (service, handle) = aggregator_service();
        let service_task = tokio::spawn(service.run());
        let telemetry = Arc::new(Telemetry::default());
        let (tx, rx) = mpsc::channel(8);
        let router = PacketRouter {
            queues: vec![tx],
            next: AtomicUsize::new(0),
            non_local_traffic: false,
            telemetry: Arc::clone(&telemetry),
        };
        let ingestor = Ingestor::new(Decoder::default(), handle.clone(), Arc::clone(&telemetry));
        let decoder = tokio::spawn(run_decoder(0, rx, ingestor));

        let bad = format!("_e{{1,{}}}:a|b", usize::MAX);
        router.route(RawPacket::new(bad.into_bytes(), Transport::UnixDatagram));
        router.route(RawPacket::new(b"good:1|c".to_vec(), Transport::UnixDatagram));
        drop(router);
        decoder.await.unwrap();

        let snapshot = handle.flush(WINDOW).await.unwrap();
        assert_eq!(snapshot.find("good", &EMPTY_TAGS).unwrap().value, 1.0);
        let snap = telemetry.snapshot();
        assert_eq!(snap.decode_errors, 1);
        assert_eq!(snap.packets_dropped_queue_closed, 0);

        handle.shutdown().unwrap();
        service_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_truncated_datagram_is_dropped() {
        let telemetry = Arc::new(Telemetry::default());
        let (tx, mut rx) = mpsc::channel(8);
        let router = PacketRouter {
            queues: vec![tx],
            next: AtomicUsize::new(0),
            non_local_traffic: false,
            telemetry: Arc::clone(&telemetry),
        };
        let source = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        // 18 byte buffer plus the spare byte
        let mut buf = vec![0u8; 19];

        let long = BufferReader::MirrorTest(b"req:1|c|#env:production".to_vec(), source);
        consume_statsd(&long, &mut buf, &router).await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(telemetry.snapshot().packets_dropped_oversized, 1);

        let exact = BufferReader::MirrorTest(b"req:1|c|#env:prod1".to_vec(), source);
        consume_statsd(&exact, &mut buf, &router).await.unwrap();
        assert_eq!(rx.try_recv().unwrap().payload, b"req:1|c|#env:prod1".to_vec());
        assert_eq!(telemetry.snapshot().packets_dropped_oversized, 1);
    }

    #[tokio::test]
    async fn test_oversized_udp_datagram_not_decoded() {
        let (service, handle) = aggregator_service();
        let service_task = tokio::spawn(service.run());
        let config = ListenerConfig {
            port: Some(0),
            buffer_size: 18,
            ..ListenerConfig::default()
        };
        let telemetry = Arc::new(Telemetry::default());
        let dogstatsd = DogStatsD::bind(&config, Arc::clone(&telemetry))
            .await
            .unwrap();
        let addr = dogstatsd.local_udp_addr().unwrap();
        let mut running = dogstatsd.spawn(handle.clone());

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(b"req:1|c|#env:production", addr)
            .await
            .unwrap();
        client.send_to(b"ok:1|c", addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        running.stop_readers().await;
        running.drain_decoders().await;
        let snapshot = handle.flush(WINDOW).await.unwrap();
        assert_eq!(snapshot.series.len(), 1);
        assert!(snapshot.find("ok", &EMPTY_TAGS).is_some());
        assert_eq!(telemetry.snapshot().packets_dropped_oversized, 1);

        handle.shutdown().unwrap();
        service_task.await.unwrap();
    }

    #[test]
    fn test_loopback_detection() {
        assert!(is_loopback("127.0.0.1".parse().unwrap()));
        assert!(is_loopback("::1".parse().unwrap()));
        assert!(is_loopback("::ffff:127.0.0.1".parse().unwrap()));
        assert!(!is_loopback("10.0.0.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_bind_requires_a_transport() {
        let config = ListenerConfig {
            port: None,
            ..ListenerConfig::default()
        };
        assert!(matches!(
            DogStatsD::bind(&config, Arc::new(Telemetry::default())).await,
            Err(ListenerError::NoTransport)
        ));
    }

    #[tokio::test]
    async fn test_udp_end_to_end() {
        let (service, handle) = aggregator_service();
        let service_task = tokio::spawn(service.run());
        let config = ListenerConfig {
            port: Some(0),
            ..ListenerConfig::default()
        };
        let dogstatsd = DogStatsD::bind(&config, Arc::new(Telemetry::default()))
            .await
            .unwrap();
        let addr = dogstatsd.local_udp_addr().unwrap();
        assert_ne!(addr.port(), 0);
        let mut running = dogstatsd.spawn(handle.clone());

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"foo:1|c\nfoo:2|c", addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        running.stop_readers().await;
        running.drain_decoders().await;
        let snapshot = handle.flush(WINDOW).await.unwrap();
        assert_eq!(snapshot.series.len(), 1);
        assert_eq!(snapshot.series[0].value, 3.0);

        handle.shutdown().unwrap();
        service_task.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_stream_frames() {
        use tokio::io::AsyncWriteExt;

        let (service, handle) = aggregator_service();
        let service_task = tokio::spawn(service.run());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dsd.sock");
        let config = ListenerConfig {
            port: None,
            stream_socket_path: Some(path.clone()),
            ..ListenerConfig::default()
        };
        let telemetry = Arc::new(Telemetry::default());
        let mut running = DogStatsD::bind(&config, Arc::clone(&telemetry))
            .await
            .unwrap()
            .spawn(handle.clone());

        let mut client = UnixStream::connect(&path).await.unwrap();
        for payload in [&b"a:1|c"[..], &b"a:4|c\nb:2|g"[..]] {
            let len = u32::try_from(payload.len()).unwrap();
            client.write_all(&len.to_le_bytes()).await.unwrap();
            client.write_all(payload).await.unwrap();
        }
        // oversized frame closes the connection
        client.write_all(&u32::MAX.to_le_bytes()).await.unwrap();
        client.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        running.stop_readers().await;
        running.drain_decoders().await;
        running.remove_socket_files();
        assert!(!path.exists());

        let snapshot = handle.flush(WINDOW).await.unwrap();
        let a = snapshot.series.iter().find(|p| p.name.as_str() == "a").unwrap();
        assert_eq!(a.value, 5.0);
        assert_eq!(snapshot.series.len(), 2);
        assert_eq!(telemetry.snapshot().packets_dropped_oversized, 1);

        handle.shutdown().unwrap();
        service_task.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stale_socket_file_is_replaced() {
        let (service, handle) = aggregator_service();
        let service_task = tokio::spawn(service.run());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dsd.sock");
        std::fs::write(&path, b"leftover").unwrap();

        let config = ListenerConfig {
            port: None,
            socket_path: Some(path.clone()),
            ..ListenerConfig::default()
        };
        let mut running = DogStatsD::bind(&config, Arc::new(Telemetry::default()))
            .await
            .unwrap()
            .spawn(handle.clone());

        let client = UnixDatagram::unbound().unwrap();
        client.send_to(b"uds.metric:7|g", &path).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        running.stop_readers().await;
        running.drain_decoders().await;
        running.remove_socket_files();
        assert!(!path.exists());

        let snapshot = handle.flush(WINDOW).await.unwrap();
        let point = snapshot.find("uds.metric", &EMPTY_TAGS).unwrap();
        assert_eq!(point.value, 7.0);

        handle.shutdown().unwrap();
        service_task.await.unwrap();
    }
}
