// Copyright 2022 Jeff Kim <hiking90@gmail.com>
// SPDX-License-Identifier: Apache-2.0

//! # jobvitals: windowed vitals for job queues
//!
//! `jobvitals` observes lifecycle events of jobs flowing through a queue system
//! and periodically emits a [`Report`] with throughput, success/failure/ghost
//! counts and average processing time, globally and per queue.
//!
//! ## Core Concepts
//!
//! - **[`Aggregator`]**: buffers raw job events for the current window and
//!   reduces them into a [`Report`]. Pure in-memory logic, no timers.
//! - **[`SamplingController`]**: owns the aggregator inside a tokio task,
//!   attaches to a [`JobEventSource`] while it has subscribers, and flushes a
//!   report to every subscriber once per period.
//! - **[`ControllerRef`]**: a cloneable handle used to subscribe, unsubscribe,
//!   change the period and stop the controller.
//! - **[`JobEventBus`]**: an in-process [`JobEventSource`] the queue system
//!   publishes `(kind, snapshot)` events into.
//! - **[`FileLogger`]**: an optional subscriber appending reports to log files.
//!
//! ## Windows
//!
//! A window spans from the previous flush (or activation) to the current one.
//! Each job event carries the job's whole run history; only run entries that
//! *started* inside the window are counted, and each job id is counted at most
//! once per event kind.
//!
//! ## Getting Started
//!
//! ```rust
//! use std::time::Duration;
//! use jobvitals::{
//!     subscriber, ControllerConfig, JobEventBus, JobSnapshot, RunEntry, RunState,
//!     SamplingController,
//! };
//!
//! # #[tokio::main]
//! # async fn main() -> jobvitals::Result<()> {
//! let bus = JobEventBus::new();
//! let (controller, handle) = SamplingController::spawn(
//!     bus.clone(),
//!     ControllerConfig::default().with_period(Duration::from_millis(50)),
//! );
//!
//! let (tx, mut reports) = tokio::sync::mpsc::unbounded_channel();
//! let printer = subscriber(move |report| {
//!     let _ = tx.send(report.clone());
//! });
//! controller.subscribe(printer.clone()).await?;
//!
//! // the queue system publishes job events
//! bus.publish("create", JobSnapshot::new("1", "send-email"));
//!
//! let report = reports.recv().await.expect("controller stopped");
//! assert_eq!(report.job_stats.created, 1);
//! assert_eq!(report.period, 50);
//!
//! controller.unsubscribe(&printer).await?;
//! controller.stop().await?;
//! handle.await.expect("controller task failed");
//! # Ok(())
//! # }
//! ```

mod aggregator;
mod clock;
mod config;
mod controller;
mod error;
mod job;
mod logfile;
mod report;
mod source;

pub use aggregator::{Aggregator, EventBuffer};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ControllerConfig, FileLogConfig, DEFAULT_MAILBOX_CAPACITY, DEFAULT_PERIOD};
pub use controller::{
    subscriber, ControllerRef, ControllerStatus, SamplingController, SamplingState, Subscriber,
};
pub use error::{Error, Result};
pub use job::{EventKind, JobEvent, JobSnapshot, RunEntry, RunState};
pub use logfile::{main_line, queue_line, slug, FileLogger};
pub use report::{ErrorCounts, JobStats, Report};
pub use source::{EventSink, JobEventBus, JobEventSource, SourceSubscription};
