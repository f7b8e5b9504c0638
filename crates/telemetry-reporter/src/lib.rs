// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process telemetry delivery pipeline.
//!
//! Producers hand fully formed [`event::Event`]s to a [`reporter::ReporterHandle`].
//! A single reporter task owns the pending [`queue::EventQueue`] and the
//! [`retry::Scheduler`], posts batches through a [`transport::Transport`], and
//! re-queues retryable failures with adaptive backoff. Nothing in this crate is
//! allowed to fail the host application: delivery problems are logged and the
//! affected events are eventually dropped.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod cache;
pub mod coalesce;
pub mod config;
pub mod constants;
pub mod errors;
pub mod event;
pub mod identity;
pub mod queue;
pub mod reporter;
pub mod retry;
pub mod scrub;
pub mod store;
pub mod transport;
