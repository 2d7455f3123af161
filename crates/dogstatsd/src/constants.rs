// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Maximum number of tags accepted on a single line.
pub const MAX_TAGS: usize = 100;

/// Default ceiling on live contexts held by the aggregator.
pub const CONTEXTS: usize = 10_240;

/// Default read buffer; matches the Go agent's default `dogstatsd_buffer_size`.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

pub const DEFAULT_PORT: u16 = 8125;
pub const DEFAULT_HOST: &str = "127.0.0.1";

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(15);

/// Capacity of the queue between socket readers and decoder workers, in packets.
pub const DEFAULT_PACKET_QUEUE_SIZE: usize = 1024;
/// Capacity of the queue between decoder workers and the aggregator, in batches.
pub const DEFAULT_SAMPLE_QUEUE_SIZE: usize = 1024;

/// Counters and gauges idle for this many flushes are dropped.
pub const DEFAULT_CONTEXT_EXPIRY_WINDOWS: u32 = 30;
pub const DEFAULT_HISTOGRAM_RESERVOIR: usize = 1000;
pub const DEFAULT_MAX_EVENTS_PER_WINDOW: usize = 10_000;

pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 5 * 1024 * 1024;
pub const DEFAULT_MAX_IN_FLIGHT: usize = 4;
pub const DEFAULT_MAX_LINGER: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_PENDING_SNAPSHOTS: usize = 5;
pub const DEFAULT_DEGRADED_AFTER: Duration = Duration::from_secs(60);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 6;

/// Name of the synthetic service check proving the pipeline is alive.
pub const HEALTH_CHECK_NAME: &str = "datadog.agent.up";

pub const SERIES_PATH: &str = "/api/v2/series";
pub const CHECK_RUN_PATH: &str = "/api/v1/check_run";
pub const EVENTS_PATH: &str = "/intake/";

pub const DEFAULT_SITE: &str = "datadoghq.com";
