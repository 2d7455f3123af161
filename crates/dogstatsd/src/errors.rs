// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

/// Errors produced while decoding a single DogStatsD line.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("parse failure: {0}")]
    Raw(String),
    #[error("unsupported metric type: {0}")]
    UnsupportedType(String),
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("length mismatch: header declares {declared} bytes, found {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("line is not valid UTF-8")]
    Utf8,
}

/// Errors produced when constructing an aggregator.
#[derive(Debug, thiserror::Error)]
pub enum Creation {
    #[error("context ceiling must be greater than zero")]
    Contexts,
    #[error("invalid percentile {0}, must be within (0, 1)")]
    Percentile(f64),
    #[error("percentiles {0} and {1} map to the same series name")]
    DuplicatePercentile(f64, f64),
    #[error("context expiry must be at least one window")]
    Expiry,
}

/// Errors produced when a sample cannot be accepted.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Insert {
    #[error("context ceiling of {0} reached, new context refused")]
    Overflow(usize),
    #[error("event buffer full, sample dropped")]
    EventsFull,
    #[error("aggregator queue full")]
    QueueFull,
    #[error("aggregator is shut down")]
    Closed,
}

/// Errors binding the ingestion sockets. These are the only fatal errors.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("no transport configured: set a UDP port or a socket path")]
    NoTransport,
    #[error("failed to bind UDP socket on {addr}: {source}")]
    BindUdp {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to bind Unix socket at {path}: {source}")]
    BindUnix {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Unix domain sockets are not supported on this platform")]
    UnixUnsupported,
}
