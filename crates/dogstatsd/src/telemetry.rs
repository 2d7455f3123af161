// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pipeline health counters.
//!
//! Every counter lives in a shared atomic so the agent can inspect it, and is
//! mirrored to the `metrics` facade under `dogstatsd.<name>` so whichever
//! recorder the embedding process installs can scrape it.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($field:ident),+ $(,)?) => {
        #[derive(Debug, Default)]
        pub struct Telemetry {
            $($field: AtomicU64,)+
        }

        /// Point in time copy of [`Telemetry`].
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
        pub struct TelemetrySnapshot {
            $(pub $field: u64,)+
        }

        impl Telemetry {
            $(
                pub fn $field(&self, n: u64) {
                    self.$field.fetch_add(n, Ordering::Relaxed);
                    metrics::counter!(concat!("dogstatsd.", stringify!($field))).increment(n);
                }
            )+

            pub fn snapshot(&self) -> TelemetrySnapshot {
                TelemetrySnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)+
                }
            }
        }
    };
}

counters!(
    packets_received,
    bytes_received,
    packets_dropped_non_local,
    packets_dropped_queue_full,
    packets_dropped_queue_closed,
    packets_dropped_oversized,
    decode_errors,
    samples_dropped,
    contexts_refused,
    events_dropped,
    snapshots_emitted,
    snapshots_dropped,
    batches_sent,
    batches_failed,
    batches_dropped,
    payload_bytes_sent,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let t = Telemetry::default();
        t.packets_received(2);
        t.packets_received(3);
        t.decode_errors(1);
        let snap = t.snapshot();
        assert_eq!(snap.packets_received, 5);
        assert_eq!(snap.decode_errors, 1);
        assert_eq!(snap.batches_sent, 0);
    }
}
