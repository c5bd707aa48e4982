// Copyright 2022 Jeff Kim <hiking90@gmail.com>
// SPDX-License-Identifier: Apache-2.0

//! Appends reports to plain-text log files.
//!
//! One line per report goes to the main log; with
//! [`FileLogConfig::save_queues`] every queue of the report also gets a line in
//! its own `<prefix><slug>.log` file:
//!
//! ```text
//! 2024/03/01 12:00:00.000 [vitals-main] period:300000 db-errors:0 app-errors:0 created:3 processed:3 success:1 failed:1 ghosts:1 avgProcessingTime:100
//! 2024/03/01 12:00:00.000 [queue: send email] created:1 processed:2 success:0 failed:1 ghosts:1 avgProcessingTime:80
//! ```

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::FileLogConfig;
use crate::controller::{subscriber, Subscriber};
use crate::error::{Error, Result};
use crate::report::{JobStats, Report};

/// `yyyy/mm/dd hh:mm:ss.mmm` in local time.
fn date_string(millis: u64) -> String {
    let Some(utc) = i64::try_from(millis)
        .ok()
        .and_then(DateTime::from_timestamp_millis)
    else {
        return millis.to_string();
    };
    utc.with_timezone(&Local)
        .format("%Y/%m/%d %H:%M:%S%.3f")
        .to_string()
}

/// File-name safe form of a queue name: whitespace becomes `-`, anything
/// outside `[A-Za-z0-9._~-]` is dropped.
pub fn slug(name: &str) -> String {
    name.chars()
        .filter_map(|c| {
            if c.is_whitespace() {
                Some('-')
            } else if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~') {
                Some(c)
            } else {
                None
            }
        })
        .collect()
}

/// The main log line of `report`, without trailing newline.
pub fn main_line(report: &Report) -> String {
    let stats = &report.job_stats;
    format!(
        "{} [vitals-main] period:{} db-errors:{} app-errors:{} created:{} processed:{} success:{} failed:{} ghosts:{} avgProcessingTime:{}",
        date_string(report.time),
        report.period,
        report.errors.db,
        report.errors.app,
        stats.created,
        stats.processed,
        stats.success,
        stats.failed,
        stats.ghosts,
        stats.avg_processing_time,
    )
}

/// The per-queue log line for `queue`, without trailing newline.
pub fn queue_line(time: u64, queue: &str, stats: &JobStats) -> String {
    format!(
        "{} [queue: {}] created:{} processed:{} success:{} failed:{} ghosts:{} avgProcessingTime:{}",
        date_string(time),
        queue,
        stats.created,
        stats.processed,
        stats.success,
        stats.failed,
        stats.ghosts,
        stats.avg_processing_time,
    )
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let io_error = |source| Error::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_error)?;
    writeln!(file, "{line}").map_err(io_error)
}

fn ensure_log_path(path: &Path) -> Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    if path.exists() {
        return Err(Error::InvalidLogPath {
            path: path.to_path_buf(),
        });
    }
    std::fs::create_dir_all(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Report sink writing to the files described by a [`FileLogConfig`].
#[derive(Debug, Clone)]
pub struct FileLogger {
    config: FileLogConfig,
}

impl FileLogger {
    /// Creates the logger, creating the log directory when it is missing.
    ///
    /// Fails with [`Error::InvalidLogPath`] if the log path exists but is not
    /// a directory.
    pub fn new(config: FileLogConfig) -> Result<Self> {
        ensure_log_path(&config.log_path)?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &FileLogConfig {
        &self.config
    }

    /// Path of the log file for `queue`.
    pub fn queue_log_file(&self, queue: &str) -> PathBuf {
        self.config
            .log_path
            .join(format!("{}{}.log", self.config.queue_prefix, slug(queue)))
    }

    /// Appends `report` to the main log and, if enabled, to each queue log.
    ///
    /// A failing queue file is logged and skipped; the error of the main log,
    /// if any, is returned after all queue files were attempted.
    pub fn write_report(&self, report: &Report) -> Result<()> {
        let main = append_line(&self.config.main_log_file(), &main_line(report));

        if self.config.save_queues {
            for (queue, stats) in &report.job_queues {
                let path = self.queue_log_file(queue);
                if let Err(err) = append_line(&path, &queue_line(report.time, queue, stats)) {
                    warn!(queue = %queue, error = %err, "Failed to append queue vitals");
                }
            }
        }

        main
    }

    /// Adapts the logger into a [`Subscriber`] backed by a writer task.
    ///
    /// The subscriber only queues a copy of each report, so the controller
    /// never waits on the disk. The writer task appends reports in the order
    /// they were queued, one `spawn_blocking` call at a time, and logs write
    /// failures. It ends after the last clone of the subscriber is dropped and
    /// the queue is drained; the returned handle resolves then.
    ///
    /// Must be called from within a tokio runtime.
    pub fn into_subscriber(self) -> (Subscriber, JoinHandle<()>) {
        let (sender, mut reports) = mpsc::unbounded_channel::<Report>();
        let logger = Arc::new(self);

        let writer = tokio::spawn(async move {
            while let Some(report) = reports.recv().await {
                let logger = Arc::clone(&logger);
                match tokio::task::spawn_blocking(move || logger.write_report(&report)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        error!(error = %err, "Could not append vitals to log file");
                    }
                    Err(err) => {
                        error!(error = %err, "Vitals log write task failed");
                    }
                }
            }
            debug!("Vitals log writer finished");
        });

        let subscriber = subscriber(move |report| {
            if sender.send(report.clone()).is_err() {
                warn!("Vitals log writer is gone; dropping report");
            }
        });
        (subscriber, writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::ErrorCounts;

    fn sample_report() -> Report {
        let mut report = Report {
            time: 1_700_000_000_123,
            period: 300_000,
            errors: ErrorCounts::default(),
            ..Default::default()
        };
        report.job_stats = JobStats {
            created: 3,
            processed: 3,
            success: 1,
            failed: 1,
            ghosts: 1,
            avg_processing_time: 100.0,
        };
        report.job_queues.insert(
            "send email".to_string(),
            JobStats {
                created: 1,
                processed: 2,
                failed: 1,
                ghosts: 1,
                avg_processing_time: 80.5,
                ..Default::default()
            },
        );
        report
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("send-email"), "send-email");
        assert_eq!(slug("try me"), "try-me");
        assert_eq!(slug("zit/zot:pop"), "zitzotpop");
    }

    #[test]
    fn test_main_line_layout() {
        let line = main_line(&sample_report());
        assert!(line.ends_with(
            "[vitals-main] period:300000 db-errors:0 app-errors:0 created:3 processed:3 success:1 failed:1 ghosts:1 avgProcessingTime:100"
        ));
        // yyyy/mm/dd hh:mm:ss.mmm
        assert_eq!(line.find(" [vitals-main]"), Some(23));
    }

    #[test]
    fn test_queue_line_layout() {
        let report = sample_report();
        let line = queue_line(report.time, "send email", &report.job_queues["send email"]);
        assert!(line.ends_with(
            "[queue: send email] created:1 processed:2 success:0 failed:1 ghosts:1 avgProcessingTime:80.5"
        ));
    }

    #[test]
    fn test_new_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("nested").join("log");

        let logger = FileLogger::new(FileLogConfig::default().with_log_path(&log_path)).unwrap();

        assert!(log_path.is_dir());
        assert_eq!(logger.config().log_path, log_path);
    }

    #[test]
    fn test_new_rejects_file_as_log_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("occupied");
        std::fs::write(&file, b"").unwrap();

        let result = FileLogger::new(FileLogConfig::default().with_log_path(&file));

        assert!(matches!(result, Err(Error::InvalidLogPath { .. })));
    }

    #[test]
    fn test_write_report_appends_main_and_queue_lines() {
        let dir = tempfile::tempdir().unwrap();
        let logger = FileLogger::new(
            FileLogConfig::default()
                .with_log_path(dir.path())
                .with_log_filename("vitals.log"),
        )
        .unwrap();

        logger.write_report(&sample_report()).unwrap();
        logger.write_report(&sample_report()).unwrap();

        let main = std::fs::read_to_string(dir.path().join("vitals.log")).unwrap();
        assert_eq!(main.lines().count(), 2);
        assert!(main.lines().all(|line| line.contains("[vitals-main]")));

        let queue = std::fs::read_to_string(dir.path().join("queue-send-email.log")).unwrap();
        assert_eq!(queue.lines().count(), 2);
        assert!(queue.contains("[queue: send email]"));
    }

    #[test]
    fn test_write_report_skips_queues_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let logger = FileLogger::new(
            FileLogConfig::default()
                .with_log_path(dir.path())
                .with_save_queues(false),
        )
        .unwrap();

        logger.write_report(&sample_report()).unwrap();

        assert!(dir.path().join("kickq-vitals.log").exists());
        assert!(!logger.queue_log_file("send email").exists());
    }

    #[tokio::test]
    async fn test_subscriber_writes_report() {
        let dir = tempfile::tempdir().unwrap();
        let logger = FileLogger::new(
            FileLogConfig::default()
                .with_log_path(dir.path())
                .with_queue_prefix("q_"),
        )
        .unwrap();
        let queue_file = logger.queue_log_file("send email");

        let (subscriber, writer) = logger.into_subscriber();
        subscriber(&sample_report());
        drop(subscriber);
        writer.await.unwrap();

        assert_eq!(queue_file, dir.path().join("q_send-email.log"));
        assert!(queue_file.exists());
    }

    #[tokio::test]
    async fn test_subscriber_returns_before_the_write() {
        let dir = tempfile::tempdir().unwrap();
        let logger = FileLogger::new(FileLogConfig::default().with_log_path(dir.path())).unwrap();
        let main_file = logger.config().main_log_file();

        let (subscriber, writer) = logger.into_subscriber();
        subscriber(&sample_report());

        // the writer task has not run yet on this single-threaded runtime
        assert!(!main_file.exists());

        drop(subscriber);
        writer.await.unwrap();
        assert!(main_file.exists());
    }

    #[tokio::test]
    async fn test_subscriber_keeps_report_order() {
        let dir = tempfile::tempdir().unwrap();
        let logger = FileLogger::new(
            FileLogConfig::default()
                .with_log_path(dir.path())
                .with_save_queues(false),
        )
        .unwrap();
        let main_file = logger.config().main_log_file();

        let (subscriber, writer) = logger.into_subscriber();
        for period in 1..=20 {
            let report = Report {
                period,
                ..sample_report()
            };
            subscriber(&report);
        }
        drop(subscriber);
        writer.await.unwrap();

        let main = std::fs::read_to_string(main_file).unwrap();
        let periods: Vec<String> = main
            .lines()
            .map(|line| {
                let rest = line.split(" period:").nth(1).unwrap();
                rest.split(' ').next().unwrap().to_string()
            })
            .collect();
        let expected: Vec<String> = (1..=20).map(|p: u64| p.to_string()).collect();
        assert_eq!(periods, expected);
    }
}
