// Copyright 2022 Jeff Kim <hiking90@gmail.com>
// SPDX-License-Identifier: Apache-2.0

//! Windowed reduction of job events into a [`Report`].
//!
//! The [`Aggregator`] only buffers while a window is open. All counting happens
//! in [`Aggregator::compute_window`], which reduces the buffers in three
//! independent phases and then assembles the report:
//!
//! 1. the SUCCESS buffer is deduplicated by job id and its run entries that
//!    started inside the window are tallied,
//! 2. the FAIL buffer is handled the same way, splitting entries into fails and
//!    ghosts,
//! 3. the CREATED buffer is counted per queue.
//!
//! Each phase returns its own immutable tally; nothing is shared between them
//! until assembly.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tracing::trace;

use crate::job::{EventKind, JobSnapshot, RunState};
use crate::report::{average, ErrorCounts, JobStats, Report};

/// Per-kind buffers of the current window, in arrival order.
#[derive(Debug, Default)]
pub struct EventBuffer {
    created: Vec<Arc<JobSnapshot>>,
    queued: Vec<Arc<JobSnapshot>>,
    success: Vec<Arc<JobSnapshot>>,
    fail: Vec<Arc<JobSnapshot>>,
}

impl EventBuffer {
    fn slot_mut(&mut self, kind: &EventKind) -> Option<&mut Vec<Arc<JobSnapshot>>> {
        match kind {
            EventKind::Created => Some(&mut self.created),
            EventKind::Queued => Some(&mut self.queued),
            EventKind::Success => Some(&mut self.success),
            EventKind::Fail => Some(&mut self.fail),
            EventKind::Other(_) => None,
        }
    }

    /// Number of snapshots buffered for `kind`.
    pub fn len(&self, kind: &EventKind) -> usize {
        match kind {
            EventKind::Created => self.created.len(),
            EventKind::Queued => self.queued.len(),
            EventKind::Success => self.success.len(),
            EventKind::Fail => self.fail.len(),
            EventKind::Other(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
            && self.queued.is_empty()
            && self.success.is_empty()
            && self.fail.is_empty()
    }

    fn clear(&mut self) {
        self.created.clear();
        self.queued.clear();
        self.success.clear();
        self.fail.clear();
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Durations {
    total: u64,
    count: u64,
}

impl Durations {
    fn add(&mut self, millis: u64) {
        self.total = self.total.saturating_add(millis);
        self.count += 1;
    }

    fn merge(self, other: Durations) -> Durations {
        Durations {
            total: self.total.saturating_add(other.total),
            count: self.count + other.count,
        }
    }

    fn average(&self) -> f64 {
        average(self.total, self.count)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct RunTally {
    success: u64,
    failed: u64,
    ghosts: u64,
    durations: Durations,
}

impl RunTally {
    fn merge(self, other: RunTally) -> RunTally {
        RunTally {
            success: self.success + other.success,
            failed: self.failed + other.failed,
            ghosts: self.ghosts + other.ghosts,
            durations: self.durations.merge(other.durations),
        }
    }

    fn into_stats(self, created: u64) -> JobStats {
        JobStats {
            created,
            processed: self.success + self.failed + self.ghosts,
            success: self.success,
            failed: self.failed,
            ghosts: self.ghosts,
            avg_processing_time: self.durations.average(),
        }
    }
}

/// Result of reducing one buffer: a global tally plus one tally per queue.
#[derive(Debug, Default)]
struct WindowTally {
    global: RunTally,
    queues: BTreeMap<String, RunTally>,
}

impl WindowTally {
    fn queue_mut(&mut self, queue: &str) -> &mut RunTally {
        self.queues.entry(queue.to_string()).or_default()
    }

    fn merge(mut self, other: WindowTally) -> WindowTally {
        self.global = self.global.merge(other.global);
        for (queue, tally) in other.queues {
            let entry = self.queues.entry(queue).or_default();
            *entry = entry.merge(tally);
        }
        self
    }
}

/// Yields each job id once, keeping its first occurrence in buffer order.
fn unique_jobs(jobs: &[Arc<JobSnapshot>]) -> Vec<&JobSnapshot> {
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(jobs.len());
    for job in jobs {
        if seen.insert(job.id.as_str()) {
            unique.push(job.as_ref());
        }
    }
    unique
}

fn tally_success(jobs: &[Arc<JobSnapshot>], window_start: u64) -> WindowTally {
    let mut tally = WindowTally::default();
    for job in unique_jobs(jobs) {
        for run in job.runs_since(window_start) {
            tally.global.success += 1;
            tally.global.durations.add(run.process_time);

            let queue = tally.queue_mut(&job.name);
            queue.success += 1;
            queue.durations.add(run.process_time);
        }
    }
    tally
}

fn tally_fail(jobs: &[Arc<JobSnapshot>], window_start: u64) -> WindowTally {
    let mut tally = WindowTally::default();
    for job in unique_jobs(jobs) {
        for run in job.runs_since(window_start) {
            match run.state {
                RunState::Ghost => {
                    tally.global.ghosts += 1;
                    tally.queue_mut(&job.name).ghosts += 1;
                }
                RunState::Fail => {
                    tally.global.failed += 1;
                    tally.global.durations.add(run.process_time);

                    let queue = tally.queue_mut(&job.name);
                    queue.failed += 1;
                    queue.durations.add(run.process_time);
                }
                // earlier successful attempts or ones still running
                RunState::Success | RunState::Processing => {}
            }
        }
    }
    tally
}

fn created_per_queue(jobs: &[Arc<JobSnapshot>]) -> BTreeMap<String, u64> {
    let mut created = BTreeMap::new();
    for job in jobs {
        *created.entry(job.name.clone()).or_default() += 1;
    }
    created
}

/// Buffers job events for the current window and reduces them into a [`Report`].
///
/// The aggregator has no notion of time of its own: the caller decides where a
/// window starts and when it ends.
///
/// # Example
///
/// ```rust
/// use jobvitals::{Aggregator, EventKind, JobSnapshot, RunEntry, RunState};
///
/// let mut aggregator = Aggregator::new();
/// let job = JobSnapshot::new("1", "send-email")
///     .with_run(RunEntry::new(1_010, 120, RunState::Success));
///
/// aggregator.feed(&EventKind::Created, job.clone().into());
/// aggregator.feed(&EventKind::Success, job.into());
///
/// let report = aggregator.compute_window(1_000, 300_000, 2_000);
/// assert_eq!(report.job_stats.created, 1);
/// assert_eq!(report.job_stats.success, 1);
/// assert_eq!(report.job_stats.avg_processing_time, 120.0);
/// assert!(aggregator.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct Aggregator {
    buffer: EventBuffer,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers `job` under `kind`.
    ///
    /// Returns `false` and leaves the buffers untouched when `kind` is not one
    /// of the tracked kinds.
    pub fn feed(&mut self, kind: &EventKind, job: Arc<JobSnapshot>) -> bool {
        match self.buffer.slot_mut(kind) {
            Some(slot) => {
                trace!(event.kind = %kind, job.id = %job.id, "Buffered job event");
                slot.push(job);
                true
            }
            None => {
                trace!(event.kind = %kind, job.id = %job.id, "Ignored untracked job event");
                false
            }
        }
    }

    /// Drops every buffered snapshot.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn buffer(&self) -> &EventBuffer {
        &self.buffer
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Reduces the buffered window into a report and clears the buffers.
    ///
    /// * `window_start` - only run entries starting at or after this timestamp
    ///   (ms since the Unix epoch) are counted
    /// * `period` - sampling period in milliseconds, copied into the report
    /// * `now` - report timestamp in milliseconds since the Unix epoch
    pub fn compute_window(&mut self, window_start: u64, period: u64, now: u64) -> Report {
        let runs = tally_success(&self.buffer.success, window_start)
            .merge(tally_fail(&self.buffer.fail, window_start));
        let created = created_per_queue(&self.buffer.created);

        let job_stats = runs.global.into_stats(self.buffer.created.len() as u64);

        let mut job_queues: BTreeMap<String, JobStats> = created
            .iter()
            .map(|(queue, count)| {
                (
                    queue.clone(),
                    JobStats {
                        created: *count,
                        ..Default::default()
                    },
                )
            })
            .collect();
        for (queue, tally) in runs.queues {
            let created = created.get(&queue).copied().unwrap_or_default();
            job_queues.insert(queue, tally.into_stats(created));
        }

        self.clear();

        Report {
            time: now,
            period,
            errors: ErrorCounts::default(),
            job_stats,
            job_queues,
        }
    }
}
