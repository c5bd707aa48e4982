// Copyright 2022 Jeff Kim <hiking90@gmail.com>
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug)]
/// Represents errors that can occur while talking to the vitals controller or
/// one of its report sinks.
///
/// Malformed input never shows up here: unknown event kinds, invalid periods and
/// unknown subscribers are reported through plain `bool` results instead.
pub enum Error {
    /// Error when sending a command to the controller
    Send {
        /// Additional context about the error
        details: String,
    },
    /// Error when receiving a reply from the controller
    Receive {
        /// Additional context about the error
        details: String,
    },
    /// Error when a request to the controller times out
    Timeout {
        /// The duration after which the request timed out
        timeout: Duration,
        /// Type of operation that timed out (e.g., "subscribe", "status")
        operation: String,
    },
    /// Error when writing a report to disk fails
    Io {
        /// The file or directory involved
        path: PathBuf,
        /// The original I/O error
        source: std::io::Error,
    },
    /// Error when the configured log path exists but is not a directory
    InvalidLogPath {
        /// The offending path
        path: PathBuf,
    },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Send { details } => {
                write!(f, "Failed to send command to vitals controller: {details}")
            }
            Error::Receive { details } => {
                write!(f, "Failed to receive reply from vitals controller: {details}")
            }
            Error::Timeout { timeout, operation } => {
                write!(
                    f,
                    "{operation} operation to vitals controller timed out after {timeout:?}"
                )
            }
            Error::Io { path, source } => {
                write!(f, "I/O error on {}: {}", path.display(), source)
            }
            Error::InvalidLogPath { path } => {
                write!(
                    f,
                    "Log path exists and is not a directory: {}",
                    path.display()
                )
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// A Result type specialized for controller and report sink operations.
pub type Result<T> = std::result::Result<T, Error>;
