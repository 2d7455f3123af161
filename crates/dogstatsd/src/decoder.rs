// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns raw datagrams into typed samples.
//!
//! Decoding is pure: a [`Decoder`] only holds immutable settings and can be
//! shared by any number of worker tasks. A malformed line is dropped on its
//! own and reported in [`Decoded::errors`]; it never affects its siblings.

use crate::errors::ParseError;
use crate::event::{parse_event, parse_service_check, Event, ServiceCheck};
use crate::metric::{parse_line, Metric};
use derive_more::Display;
use std::net::SocketAddr;
use ustr::Ustr;

/// Where a packet came from.
#[derive(Clone, Debug, PartialEq, Eq, Display)]
pub enum Transport {
    #[display("udp:{_0}")]
    Udp(SocketAddr),
    #[display("unix-datagram")]
    UnixDatagram,
    #[display("unix-stream")]
    UnixStream,
    /// Injected in process, bypassing the sockets.
    #[display("internal")]
    Internal,
}

/// One read from a socket. Consumed by a single decode pass.
#[derive(Clone, Debug)]
pub struct RawPacket {
    pub payload: Vec<u8>,
    pub transport: Transport,
    /// Container of the sending process when the transport exposes it.
    pub origin: Option<Ustr>,
}

impl RawPacket {
    pub fn new(payload: Vec<u8>, transport: Transport) -> Self {
        Self {
            payload,
            transport,
            origin: None,
        }
    }
}

/// The closed set of decoded messages.
#[derive(Clone, Debug, PartialEq)]
pub enum Sample {
    Metric(Metric),
    Event(Event),
    ServiceCheck(ServiceCheck),
}

#[derive(Debug, Default)]
pub struct Decoded {
    pub samples: Vec<Sample>,
    pub errors: Vec<ParseError>,
}

#[derive(Clone, Debug, Default)]
pub struct Decoder {
    metric_namespace: Option<String>,
}

impl Decoder {
    pub fn new(metric_namespace: Option<String>) -> Self {
        Self { metric_namespace }
    }

    /// Decodes every newline separated line of `packet`, preserving order.
    pub fn decode(&self, packet: &RawPacket) -> Decoded {
        let mut decoded = Decoded::default();
        for raw_line in packet.payload.split(|&b| b == b'\n') {
            let raw_line = raw_line.strip_suffix(b"\r").unwrap_or(raw_line);
            if raw_line.is_empty() {
                continue;
            }
            let Ok(line) = std::str::from_utf8(raw_line) else {
                decoded.errors.push(ParseError::Utf8);
                continue;
            };
            if let Err(e) = self.decode_line(line, packet.origin, &mut decoded.samples) {
                decoded.errors.push(e);
            }
        }
        decoded
    }

    fn decode_line(
        &self,
        line: &str,
        origin: Option<Ustr>,
        out: &mut Vec<Sample>,
    ) -> Result<(), ParseError> {
        if line.starts_with("_e{") {
            out.push(Sample::Event(parse_event(line)?));
        } else if line.starts_with("_sc|") {
            out.push(Sample::ServiceCheck(parse_service_check(line)?));
        } else {
            let metrics = parse_line(line)?;
            out.extend(metrics.into_iter().map(|mut metric| {
                if let Some(ns) = self.metric_namespace.as_deref() {
                    metric.name = Ustr::from(format!("{ns}.{}", metric.name).as_str());
                }
                if metric.container_id.is_none() {
                    metric.container_id = origin;
                }
                Sample::Metric(metric)
            }));
        }
        Ok(())
    }
}
