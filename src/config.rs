// Copyright 2022 Jeff Kim <hiking90@gmail.com>
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::time::Duration;

/// Sampling period used until one is configured: five minutes.
pub const DEFAULT_PERIOD: Duration = Duration::from_millis(300_000);

/// Default capacity of the controller's command mailbox.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 32;

/// Whether `period` is usable as a sampling period: at least one millisecond.
pub(crate) fn is_valid_period(period: Duration) -> bool {
    period >= Duration::from_millis(1)
}

/// Settings for a [`SamplingController`](crate::SamplingController).
///
/// ```rust
/// use std::time::Duration;
/// use jobvitals::ControllerConfig;
///
/// let config = ControllerConfig::default().with_period(Duration::from_secs(2));
/// assert_eq!(config.period(), Duration::from_secs(2));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    period: Duration,
    mailbox_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            period: DEFAULT_PERIOD,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        }
    }
}

impl ControllerConfig {
    /// Sets the initial sampling period. Periods shorter than one millisecond
    /// are ignored, since reports carry the period in whole milliseconds.
    pub fn with_period(mut self, period: Duration) -> Self {
        if is_valid_period(period) {
            self.period = period;
        }
        self
    }

    /// Sets the command mailbox capacity, clamped to at least 1.
    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity.max(1);
        self
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn mailbox_capacity(&self) -> usize {
        self.mailbox_capacity
    }
}

/// Settings for a [`FileLogger`](crate::FileLogger).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLogConfig {
    /// Directory the log files are written to. Created when missing.
    pub log_path: PathBuf,
    /// File name of the main log inside `log_path`.
    pub log_filename: String,
    /// Whether per-queue log files are written as well.
    pub save_queues: bool,
    /// Prefix of per-queue log file names.
    pub queue_prefix: String,
}

impl Default for FileLogConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("./log"),
            log_filename: "kickq-vitals.log".to_string(),
            save_queues: true,
            queue_prefix: "queue-".to_string(),
        }
    }
}

impl FileLogConfig {
    pub fn with_log_path(mut self, log_path: impl Into<PathBuf>) -> Self {
        self.log_path = log_path.into();
        self
    }

    pub fn with_log_filename(mut self, log_filename: impl Into<String>) -> Self {
        self.log_filename = log_filename.into();
        self
    }

    pub fn with_save_queues(mut self, save_queues: bool) -> Self {
        self.save_queues = save_queues;
        self
    }

    pub fn with_queue_prefix(mut self, queue_prefix: impl Into<String>) -> Self {
        self.queue_prefix = queue_prefix.into();
        self
    }

    /// Full path of the main log file.
    pub fn main_log_file(&self) -> PathBuf {
        self.log_path.join(&self.log_filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_config_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.period(), Duration::from_millis(300_000));
        assert_eq!(config.mailbox_capacity(), 32);
    }

    #[test]
    fn test_controller_config_rejects_zero_values() {
        let config = ControllerConfig::default()
            .with_period(Duration::ZERO)
            .with_mailbox_capacity(0);
        assert_eq!(config.period(), DEFAULT_PERIOD);
        assert_eq!(config.mailbox_capacity(), 1);
    }

    #[test]
    fn test_controller_config_ignores_sub_millisecond_period() {
        let config = ControllerConfig::default().with_period(Duration::from_micros(500));
        assert_eq!(config.period(), DEFAULT_PERIOD);

        let config = ControllerConfig::default().with_period(Duration::from_millis(1));
        assert_eq!(config.period(), Duration::from_millis(1));
    }

    #[test]
    fn test_file_log_config_defaults() {
        let config = FileLogConfig::default();
        assert_eq!(config.log_path, PathBuf::from("./log"));
        assert_eq!(config.main_log_file(), PathBuf::from("./log/kickq-vitals.log"));
        assert!(config.save_queues);
        assert_eq!(config.queue_prefix, "queue-");
    }
}
