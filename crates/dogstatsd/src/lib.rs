// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Local DogStatsD agent: receives StatsD datagrams, aggregates them into
//! fixed flush windows and forwards the results to the Datadog intake.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod agent;
pub mod aggregator;
pub mod aggregator_service;
pub mod api_key;
pub mod config;
pub mod constants;
pub mod datadog;
pub mod decoder;
pub mod dogstatsd;
pub mod errors;
pub mod event;
pub mod flusher;
pub mod health;
pub mod metric;
pub mod origin;
pub mod scheduler;
pub mod telemetry;
pub mod util;
