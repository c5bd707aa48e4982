// Copyright 2022 Jeff Kim <hiking90@gmail.com>
// SPDX-License-Identifier: Apache-2.0

//! Sampling lifecycle: when aggregation runs, how often it flushes and who
//! receives the reports.
//!
//! A [`SamplingController`] runs in its own tokio task and owns the
//! [`Aggregator`]. Commands from [`ControllerRef`] handles, job events from the
//! [`JobEventSource`] and timer ticks are all handled by that one task, so a
//! tick never observes a half-applied event.
//!
//! Sampling is refcounted by subscriber: the first subscriber attaches to the
//! source and starts the timer, removing the last one detaches, stops the timer
//! and discards the partial window.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::aggregator::Aggregator;
use crate::clock::{Clock, SystemClock};
use crate::config::{is_valid_period, ControllerConfig};
use crate::error::{Error, Result};
use crate::job::JobEvent;
use crate::report::Report;
use crate::source::{JobEventSource, SourceSubscription};

/// Callback receiving every computed [`Report`].
///
/// Identity is the allocation behind the `Arc`: registering the same `Arc`
/// twice creates two registrations, each removable on its own.
pub type Subscriber = Arc<dyn Fn(&Report) + Send + Sync>;

/// Wraps a closure into a [`Subscriber`].
pub fn subscriber<F>(callback: F) -> Subscriber
where
    F: Fn(&Report) + Send + Sync + 'static,
{
    Arc::new(callback)
}

fn same_subscriber(a: &Subscriber, b: &Subscriber) -> bool {
    // compare the data pointers only; vtable pointers are not unique
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&str>() {
            Ok(message) => message.to_string(),
            Err(_) => "Unknown panic occurred which couldn't be coerced to a string".to_string(),
        },
    }
}

/// Whether the controller is currently sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingState {
    Inactive,
    Active,
}

/// Snapshot of a controller's lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerStatus {
    pub state: SamplingState,
    /// Number of live registrations.
    pub subscribers: usize,
    /// Period of the flush timer.
    pub period: Duration,
}

impl ControllerStatus {
    pub fn is_active(&self) -> bool {
        self.state == SamplingState::Active
    }
}

enum Command {
    Subscribe {
        subscriber: Subscriber,
        period: Option<Duration>,
        reply: oneshot::Sender<usize>,
    },
    Unsubscribe {
        subscriber: Subscriber,
        reply: oneshot::Sender<bool>,
    },
    UnsubscribeAll {
        reply: oneshot::Sender<usize>,
    },
    SetPeriod {
        period: Duration,
        reply: oneshot::Sender<bool>,
    },
    Status {
        reply: oneshot::Sender<ControllerStatus>,
    },
    Stop,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Subscribe { period, .. } => f
                .debug_struct("Subscribe")
                .field("period", period)
                .finish_non_exhaustive(),
            Command::Unsubscribe { .. } => f.write_str("Unsubscribe"),
            Command::UnsubscribeAll { .. } => f.write_str("UnsubscribeAll"),
            Command::SetPeriod { period, .. } => f
                .debug_struct("SetPeriod")
                .field("period", period)
                .finish_non_exhaustive(),
            Command::Status { .. } => f.write_str("Status"),
            Command::Stop => f.write_str("Stop"),
        }
    }
}

/// A handle to a running [`SamplingController`].
///
/// Handles are cheap to clone. The controller task ends once it is stopped or
/// every handle has been dropped.
#[derive(Clone, Debug)]
pub struct ControllerRef {
    sender: mpsc::Sender<Command>,
}

impl ControllerRef {
    async fn ask<R>(&self, command: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.sender.send(command(reply_tx)).await.is_err() {
            return Err(Error::Send {
                details: "Mailbox channel closed".to_string(),
            });
        }
        reply_rx.await.map_err(|_| Error::Receive {
            details: "Reply channel closed".to_string(),
        })
    }

    /// Returns `true` while the controller task is accepting commands.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Registers `subscriber` for every future report.
    ///
    /// The first registration activates sampling. Returns the number of
    /// registrations after this one.
    pub async fn subscribe(&self, subscriber: Subscriber) -> Result<usize> {
        self.ask(|reply| Command::Subscribe {
            subscriber,
            period: None,
            reply,
        })
        .await
    }

    /// Registers `subscriber` and applies `period` as with
    /// [`set_period`](Self::set_period).
    pub async fn subscribe_with_period(
        &self,
        subscriber: Subscriber,
        period: Duration,
    ) -> Result<usize> {
        self.ask(|reply| Command::Subscribe {
            subscriber,
            period: Some(period),
            reply,
        })
        .await
    }

    /// Removes one registration of `subscriber`.
    ///
    /// Returns `false` if it was never registered. Removing the last
    /// registration deactivates sampling and drops the partial window.
    pub async fn unsubscribe(&self, subscriber: &Subscriber) -> Result<bool> {
        let subscriber = Arc::clone(subscriber);
        self.ask(|reply| Command::Unsubscribe { subscriber, reply })
            .await
    }

    /// Removes every registration and deactivates sampling unconditionally.
    ///
    /// Returns how many registrations were dropped.
    pub async fn unsubscribe_all(&self) -> Result<usize> {
        self.ask(|reply| Command::UnsubscribeAll { reply }).await
    }

    /// Changes the flush period.
    ///
    /// A period below one millisecond is rejected with `false`. While sampling, the timer is
    /// restarted with the new period but the open window and its buffered
    /// events are kept.
    pub async fn set_period(&self, period: Duration) -> Result<bool> {
        self.ask(|reply| Command::SetPeriod { period, reply }).await
    }

    pub async fn status(&self) -> Result<ControllerStatus> {
        self.ask(|reply| Command::Status { reply }).await
    }

    /// Like [`status`](Self::status) but gives up after `timeout`.
    pub async fn status_with_timeout(&self, timeout: Duration) -> Result<ControllerStatus> {
        tokio::time::timeout(timeout, self.status())
            .await
            .map_err(|_| Error::Timeout {
                timeout,
                operation: "status".to_string(),
            })?
    }

    /// Stops the controller task after the commands already queued.
    ///
    /// Sampling is deactivated without emitting the partial window. Stopping
    /// an already stopped controller is not an error.
    pub async fn stop(&self) -> Result<()> {
        info!("Sending Stop to vitals controller");
        if self.sender.send(Command::Stop).await.is_err() {
            warn!("Failed to send Stop to vitals controller: mailbox closed. Controller might already be stopped.");
        }
        Ok(())
    }
}

struct Activation {
    subscription: SourceSubscription,
    /// `None` once the source dropped its sender.
    events: Option<mpsc::UnboundedReceiver<JobEvent>>,
    timer: Interval,
}

enum Activity {
    Event(JobEvent),
    SourceClosed,
    Tick,
}

fn flush_timer(period: Duration) -> Interval {
    let mut timer = tokio::time::interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

async fn recv_event(events: &mut Option<mpsc::UnboundedReceiver<JobEvent>>) -> Option<JobEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_activity(active: &mut Option<Activation>) -> Activity {
    let Some(activation) = active else {
        return std::future::pending().await;
    };

    tokio::select! {
        biased;

        // a due tick wins over a busy source; on_tick drains what is queued
        _ = activation.timer.tick() => Activity::Tick,
        event = recv_event(&mut activation.events) => match event {
            Some(event) => Activity::Event(event),
            None => Activity::SourceClosed,
        },
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}

/// Owns the [`Aggregator`] and drives it from a single tokio task.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use jobvitals::{subscriber, ControllerConfig, JobEventBus, SamplingController};
///
/// # #[tokio::main]
/// # async fn main() -> jobvitals::Result<()> {
/// let bus = JobEventBus::new();
/// let (controller, handle) = SamplingController::spawn(bus.clone(), ControllerConfig::default());
///
/// let printer = subscriber(|report| println!("{:?}", report.job_stats));
/// controller.subscribe_with_period(printer.clone(), Duration::from_secs(2)).await?;
/// assert_eq!(bus.subscriber_count(), 1);
///
/// controller.unsubscribe(&printer).await?;
/// assert_eq!(bus.subscriber_count(), 0);
///
/// controller.stop().await?;
/// handle.await.expect("controller task failed");
/// # Ok(())
/// # }
/// ```
pub struct SamplingController {
    source: Arc<dyn JobEventSource>,
    clock: Arc<dyn Clock>,
    aggregator: Aggregator,
    subscribers: Vec<Subscriber>,
    period: Duration,
    window_start: u64,
    active: Option<Activation>,
    commands: mpsc::Receiver<Command>,
}

impl fmt::Debug for SamplingController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamplingController")
            .field("active", &self.active.is_some())
            .field("subscribers", &self.subscribers.len())
            .field("period", &self.period)
            .field("window_start", &self.window_start)
            .finish_non_exhaustive()
    }
}

impl SamplingController {
    /// Spawns a controller reading wall-clock time from [`SystemClock`].
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<S>(source: S, config: ControllerConfig) -> (ControllerRef, JoinHandle<()>)
    where
        S: JobEventSource,
    {
        Self::spawn_with_clock(source, SystemClock, config)
    }

    /// Spawns a controller using `clock` for window bounds and report times.
    pub fn spawn_with_clock<S, C>(
        source: S,
        clock: C,
        config: ControllerConfig,
    ) -> (ControllerRef, JoinHandle<()>)
    where
        S: JobEventSource,
        C: Clock,
    {
        let (sender, commands) = mpsc::channel(config.mailbox_capacity());
        let controller = SamplingController {
            source: Arc::new(source),
            clock: Arc::new(clock),
            aggregator: Aggregator::new(),
            subscribers: Vec::new(),
            period: config.period(),
            window_start: 0,
            active: None,
            commands,
        };

        debug!(period_ms = millis(config.period()), "Spawning vitals controller");
        let handle = tokio::spawn(controller.run());
        (ControllerRef { sender }, handle)
    }

    async fn run(mut self) {
        info!("Vitals controller is running.");

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Stop) => {
                        info!("Vitals controller received Stop.");
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        info!("All vitals controller handles dropped.");
                        break;
                    }
                },
                activity = next_activity(&mut self.active) => match activity {
                    Activity::Event(event) => self.on_event(event),
                    Activity::SourceClosed => self.on_source_closed(),
                    Activity::Tick => self.on_tick(),
                },
            }
        }

        self.deactivate();
        info!("Vitals controller finished.");
    }

    fn handle_command(&mut self, command: Command) {
        trace!(?command, "Handling controller command");
        match command {
            Command::Subscribe {
                subscriber,
                period,
                reply,
            } => {
                let count = self.subscribe(subscriber, period);
                let _ = reply.send(count);
            }
            Command::Unsubscribe { subscriber, reply } => {
                let removed = self.unsubscribe(&subscriber);
                let _ = reply.send(removed);
            }
            Command::UnsubscribeAll { reply } => {
                let removed = self.unsubscribe_all();
                let _ = reply.send(removed);
            }
            Command::SetPeriod { period, reply } => {
                let applied = self.set_period(period);
                let _ = reply.send(applied);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            // handled by the run loop
            Command::Stop => {}
        }
    }

    fn subscribe(&mut self, subscriber: Subscriber, period: Option<Duration>) -> usize {
        self.subscribers.push(subscriber);
        info!(subscribers = self.subscribers.len(), "Vitals subscriber added");

        if self.subscribers.len() == 1 {
            self.activate();
        }
        if let Some(period) = period {
            self.set_period(period);
        }
        self.subscribers.len()
    }

    fn unsubscribe(&mut self, subscriber: &Subscriber) -> bool {
        let Some(index) = self
            .subscribers
            .iter()
            .position(|registered| same_subscriber(registered, subscriber))
        else {
            debug!("Ignoring removal of unknown vitals subscriber");
            return false;
        };

        self.subscribers.remove(index);
        info!(subscribers = self.subscribers.len(), "Vitals subscriber removed");

        if self.subscribers.is_empty() {
            self.deactivate();
        }
        true
    }

    fn unsubscribe_all(&mut self) -> usize {
        let removed = self.subscribers.len();
        self.subscribers.clear();
        info!(removed, "All vitals subscribers removed");
        self.deactivate();
        removed
    }

    fn set_period(&mut self, period: Duration) -> bool {
        if !is_valid_period(period) {
            debug!(period = ?period, "Ignoring sampling period below one millisecond");
            return false;
        }

        self.period = period;
        if let Some(activation) = self.active.as_mut() {
            activation.timer = flush_timer(period);
        }
        debug!(period_ms = millis(period), "Sampling period updated");
        true
    }

    fn status(&self) -> ControllerStatus {
        ControllerStatus {
            state: if self.active.is_some() {
                SamplingState::Active
            } else {
                SamplingState::Inactive
            },
            subscribers: self.subscribers.len(),
            period: self.period,
        }
    }

    fn activate(&mut self) {
        if self.active.is_some() {
            return;
        }

        self.aggregator.clear();
        let (sink, events) = mpsc::unbounded_channel();
        let subscription = self.source.subscribe(sink);
        self.window_start = self.clock.now_millis();
        self.active = Some(Activation {
            subscription,
            events: Some(events),
            timer: flush_timer(self.period),
        });

        info!(
            period_ms = millis(self.period),
            window_start = self.window_start,
            "Vitals sampling activated"
        );
    }

    fn deactivate(&mut self) {
        let Some(activation) = self.active.take() else {
            return;
        };

        self.source.unsubscribe(activation.subscription);
        self.aggregator.clear();
        info!("Vitals sampling deactivated, partial window discarded");
    }

    fn on_event(&mut self, event: JobEvent) {
        if self.active.is_none() {
            trace!(event.kind = %event.kind, "Dropping job event while inactive");
            return;
        }
        self.aggregator.feed(&event.kind, event.job);
    }

    fn on_source_closed(&mut self) {
        if let Some(activation) = self.active.as_mut() {
            warn!("Job event source closed its sink; reports will carry no new events");
            activation.events = None;
        }
    }

    /// Feeds the events already queued when the tick fired. Events published
    /// while draining wait for the next window.
    fn drain_queued_events(&mut self) {
        let Some(events) = self.active.as_mut().and_then(|a| a.events.as_mut()) else {
            return;
        };

        let queued = events.len();
        for _ in 0..queued {
            match events.try_recv() {
                Ok(event) => {
                    self.aggregator.feed(&event.kind, event.job);
                }
                Err(_) => break,
            }
        }
        if queued > 0 {
            trace!(queued, "Drained queued job events before flush");
        }
    }

    fn on_tick(&mut self) {
        self.drain_queued_events();

        let now = self.clock.now_millis();
        let report = self
            .aggregator
            .compute_window(self.window_start, millis(self.period), now);
        self.window_start = now;

        debug!(
            created = report.job_stats.created,
            processed = report.job_stats.processed,
            queues = report.job_queues.len(),
            "Vitals window computed"
        );

        for subscriber in &self.subscribers {
            let delivered =
                std::panic::catch_unwind(AssertUnwindSafe(|| subscriber(&report)));
            if let Err(payload) = delivered {
                error!(
                    panic = %panic_message(payload),
                    "Vitals subscriber panicked while handling a report"
                );
            }
        }
    }
}
