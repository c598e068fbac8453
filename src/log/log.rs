// SPDX-License-Identifier: GPL-2.0-or-later

use common::{ILogger, LogEntry, LogLevel, time::UnixNano};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Logger used everywhere across the application.
pub struct Logger {
    /// Internal logging feed.
    feed: broadcast::Sender<LogEntryWithTime>,
}

impl Logger {
    #[must_use]
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(64);
        Self { feed }
    }

    /// Subscribes to the log feed and returns a channel that
    /// receives all log entries.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntryWithTime> {
        self.feed.subscribe()
    }

    /// Prints entries at or above `level` to stdout until cancelled.
    pub fn print_to_stdout(&self, token: CancellationToken, level: LogLevel) {
        let mut feed = self.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => return,
                    entry = feed.recv() => {
                        let Ok(entry) = entry else {
                            continue
                        };
                        if entry.level.as_u8() <= level.as_u8() {
                            println!("{entry}");
                        }
                    }
                }
            }
        });
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl ILogger for Logger {
    /// Sends log entry to all subscribers. The timestamp is applied now.
    fn log(&self, entry: LogEntry) {
        let entry = LogEntryWithTime {
            level: entry.level,
            time: UnixNano::now(),
            source: entry.source,
            monitor_id: entry.monitor_id,
            message: entry.message,
        };

        // Returns an error if there are no subscribers.
        _ = self.feed.send(entry);
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct LogEntryWithTime {
    pub level: LogLevel,
    pub time: UnixNano,
    pub source: &'static str,

    #[serde(rename = "monitorID")]
    pub monitor_id: Option<String>,

    pub message: String,
}

impl std::fmt::Display for LogEntryWithTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let level = match self.level {
            LogLevel::Error => "ERROR",
            LogLevel::Warning => "WARNING",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        };
        match &self.monitor_id {
            Some(monitor_id) => {
                write!(f, "[{level}] {}: {}: {}", self.source, monitor_id, self.message)
            }
            None => write!(f, "[{level}] {}: {}", self.source, self.message),
        }
    }
}
