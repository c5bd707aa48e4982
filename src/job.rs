// Copyright 2022 Jeff Kim <hiking90@gmail.com>
// SPDX-License-Identifier: Apache-2.0

//! Job data consumed from the queue system.
//!
//! Every event carries the *entire* run history of the job it concerns, not a
//! delta, so the same run entry can be observed many times across windows.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Outcome of a single processing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    /// The attempt is still running.
    Processing,
    /// The attempt completed successfully.
    Success,
    /// The attempt failed explicitly.
    Fail,
    /// The attempt was abandoned or timed out without an explicit outcome.
    Ghost,
}

/// One processing attempt of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEntry {
    /// When the attempt started, in milliseconds since the Unix epoch.
    pub start_time: u64,
    /// How long the attempt took, in milliseconds.
    pub process_time: u64,
    pub state: RunState,
}

impl RunEntry {
    pub fn new(start_time: u64, process_time: u64, state: RunState) -> Self {
        Self {
            start_time,
            process_time,
            state,
        }
    }
}

/// Read-only view of a job as published by the queue system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    /// Stable job identifier.
    pub id: String,
    /// Name of the queue (job type) the job belongs to.
    pub name: String,
    /// Run history, one entry per processing attempt, oldest first.
    #[serde(default)]
    pub runs: Vec<RunEntry>,
}

impl JobSnapshot {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            runs: Vec::new(),
        }
    }

    /// Appends a run entry, builder style.
    pub fn with_run(mut self, run: RunEntry) -> Self {
        self.runs.push(run);
        self
    }

    /// Run entries that started at or after `window_start`.
    pub fn runs_since(&self, window_start: u64) -> impl Iterator<Item = &RunEntry> {
        self.runs
            .iter()
            .filter(move |run| run.start_time >= window_start)
    }
}

/// Kind of job event published by the queue system.
///
/// Only the first four kinds are buffered; every other metric name the queue
/// system emits is carried as [`EventKind::Other`] and ignored by the aggregator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    Queued,
    Success,
    Fail,
    Other(String),
}

impl EventKind {
    /// Returns `true` for the kinds the aggregator keeps a buffer for.
    pub fn is_tracked(&self) -> bool {
        !matches!(self, EventKind::Other(_))
    }
}

impl From<&str> for EventKind {
    fn from(name: &str) -> Self {
        match name {
            "create" | "created" => EventKind::Created,
            "queued" => EventKind::Queued,
            "success" => EventKind::Success,
            "fail" => EventKind::Fail,
            other => EventKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Created => f.write_str("create"),
            EventKind::Queued => f.write_str("queued"),
            EventKind::Success => f.write_str("success"),
            EventKind::Fail => f.write_str("fail"),
            EventKind::Other(name) => f.write_str(name),
        }
    }
}

/// A `(kind, snapshot)` pair delivered by a [`JobEventSource`](crate::JobEventSource).
///
/// Snapshots are shared, never mutated, and dropped by the aggregator at the
/// end of each window.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub kind: EventKind,
    pub job: Arc<JobSnapshot>,
}

impl JobEvent {
    pub fn new(kind: impl Into<EventKind>, job: impl Into<Arc<JobSnapshot>>) -> Self {
        Self {
            kind: kind.into(),
            job: job.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_from_producer_names() {
        assert_eq!(EventKind::from("create"), EventKind::Created);
        assert_eq!(EventKind::from("created"), EventKind::Created);
        assert_eq!(EventKind::from("queued"), EventKind::Queued);
        assert_eq!(EventKind::from("success"), EventKind::Success);
        assert_eq!(EventKind::from("fail"), EventKind::Fail);
        assert_eq!(
            EventKind::from("ghost"),
            EventKind::Other("ghost".to_string())
        );
        assert!(!EventKind::from("delete").is_tracked());
        assert!(EventKind::Queued.is_tracked());
    }

    #[test]
    fn test_event_kind_display_uses_producer_names() {
        assert_eq!(EventKind::Created.to_string(), "create");
        assert_eq!(EventKind::Other("retry".into()).to_string(), "retry");
    }

    #[test]
    fn test_runs_since_filters_by_start_time() {
        let job = JobSnapshot::new("1", "send-email")
            .with_run(RunEntry::new(90, 5, RunState::Fail))
            .with_run(RunEntry::new(100, 7, RunState::Fail))
            .with_run(RunEntry::new(120, 9, RunState::Success));

        let starts: Vec<u64> = job.runs_since(100).map(|run| run.start_time).collect();
        assert_eq!(starts, vec![100, 120]);
    }

    #[test]
    fn test_snapshot_deserializes_producer_payload() {
        let job: JobSnapshot = serde_json::from_str(
            r#"{"id":"42","name":"zit-zot-pop","runs":[
                {"startTime":1000,"processTime":250,"state":"ghost"}
            ]}"#,
        )
        .unwrap();

        assert_eq!(job.id, "42");
        assert_eq!(job.runs[0], RunEntry::new(1000, 250, RunState::Ghost));

        let bare: JobSnapshot = serde_json::from_str(r#"{"id":"7","name":"q"}"#).unwrap();
        assert!(bare.runs.is_empty());
    }
}
