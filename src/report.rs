// Copyright 2022 Jeff Kim <hiking90@gmail.com>
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

use serde::Serialize;

/// Error counters surfaced in every report.
///
/// Nothing inside this crate increments them; they are kept so the report
/// schema stays stable for an external error-reporting collaborator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ErrorCounts {
    /// Database error count.
    pub db: u64,
    /// Application error count.
    pub app: u64,
}

/// Job statistics for one window, used both globally and per queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    /// Jobs created during the window.
    pub created: u64,
    /// Always `success + failed + ghosts`.
    pub processed: u64,
    /// Successful run entries that started in the window.
    pub success: u64,
    /// Failed run entries that started in the window.
    pub failed: u64,
    /// Ghost run entries that started in the window.
    pub ghosts: u64,
    /// Mean duration of counted success and fail runs in milliseconds,
    /// floored to two decimals.
    ///
    /// `0.0` when nothing was counted.
    pub avg_processing_time: f64,
}

/// Point-in-time summary of one sampling window.
///
/// Serializes as
/// `{time, period, errors: {db, app}, jobStats: {..}, jobQueues: {<name>: {..}}}`.
///
/// # Example
///
/// ```rust
/// use jobvitals::Report;
///
/// let report = Report::default();
/// assert_eq!(report.job_stats.processed, 0);
/// assert!(report.job_queues.is_empty());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    /// When the report was computed, in milliseconds since the Unix epoch.
    pub time: u64,
    /// Sampling period in milliseconds.
    pub period: u64,
    pub errors: ErrorCounts,
    pub job_stats: JobStats,
    /// Per-queue breakdown, keyed by queue name.
    ///
    /// A queue shows up only if it had activity during the window.
    pub job_queues: BTreeMap<String, JobStats>,
}

impl Report {
    /// Returns the per-queue stats for `queue`, if it had any activity.
    pub fn queue(&self, queue: &str) -> Option<&JobStats> {
        self.job_queues.get(queue)
    }
}

/// `floor(x * 100) / 100`.
pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).floor() / 100.0
}

/// Average of `total` over `count`, floored to two decimals. Zero counts yield
/// `0.0` rather than NaN.
pub(crate) fn average(total: u64, count: u64) -> f64 {
    if count == 0 {
        return 0.0;
    }
    round2(total as f64 / count as f64)
}
