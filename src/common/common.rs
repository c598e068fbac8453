// SPDX-License-Identifier: GPL-2.0-or-later

mod event;
pub mod monitor;
pub mod recording;
pub mod time;
mod video;

pub use event::*;
pub use video::*;

use serde::Deserialize;
use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
use thiserror::Error;

pub type DynError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
#[error("cancelled")]
pub struct Cancelled;

pub type ArcLogger = Arc<dyn ILogger + Send + Sync>;

pub trait ILogger {
    /// Send log.
    fn log(&self, _: LogEntry) {}
}

/// Log entry. The timestamp is applied by the logger.
#[derive(Clone, Debug)]
pub struct LogEntry {
    pub level: LogLevel,
    pub source: &'static str,
    pub monitor_id: Option<String>,
    pub message: String,
}

impl LogEntry {
    #[must_use]
    pub fn new(level: LogLevel, source: &'static str, monitor_id: &str, message: &str) -> Self {
        Self {
            level,
            source,
            monitor_id: Some(monitor_id.to_owned()),
            message: message.to_owned(),
        }
    }
}

/// Severity of the log message.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Something requires attention.
    Error,

    /// Something may require attention.
    Warning,

    /// Standard information.
    Info,

    /// Verbose debugging information.
    Debug,
}

impl LogLevel {
    #[must_use]
    pub fn as_u8(&self) -> u8 {
        match self {
            LogLevel::Error => 16,
            LogLevel::Warning => 24,
            LogLevel::Info => 32,
            LogLevel::Debug => 48,
        }
    }
}

#[derive(Debug, Error)]
pub enum ParseLogLevelError {
    #[error("unknown log level: '{0}'")]
    UnknownLevel(String),
}

impl FromStr for LogLevel {
    type Err = ParseLogLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "error" => Ok(LogLevel::Error),
            "warning" => Ok(LogLevel::Warning),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            _ => Err(ParseLogLevelError::UnknownLevel(s.to_owned())),
        }
    }
}

pub type ArcMsgLogger = Arc<dyn MsgLogger + Send + Sync>;

pub trait MsgLogger {
    fn log(&self, level: LogLevel, msg: &str);
}

pub struct DummyLogger;

impl DummyLogger {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(DummyLogger {})
    }
}

impl ILogger for DummyLogger {
    fn log(&self, _: LogEntry) {}
}

impl MsgLogger for DummyLogger {
    fn log(&self, _level: LogLevel, _msg: &str) {}
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Main,
    Sub,
}

impl StreamType {
    #[must_use]
    pub fn is_main(&self) -> bool {
        *self == StreamType::Main
    }

    #[must_use]
    pub fn is_sub(&self) -> bool {
        *self == StreamType::Sub
    }

    #[must_use]
    pub fn name(&self) -> &str {
        if self.is_main() { "main" } else { "sub" }
    }
}

impl fmt::Debug for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// How completed recordings are materialised on disk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecFormat {
    // Raw `.meta` and `.mdat` files.
    #[default]
    Raw,

    // Self-contained `.mp4`.
    Mp4,

    // `.mp4` copied from the HLS stream by the external transcoder.
    Ffmpeg,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct Flags {
    #[serde(rename = "recFormat", default)]
    pub rec_format: RecFormat,
}

/// File system environment of the subsystem.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigEnv {
    pub config_dir: PathBuf,
    pub recordings_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub ffmpeg_bin: PathBuf,
    pub flags: Flags,
}

pub const CONFIG_DIR_MODE: u32 = 0o700;
pub const FILE_MODE: u32 = 0o600;
pub const DIR_MODE: u32 = 0o755;

// Creates a directory and any missing parents with the given mode.
// An existing directory is not an error.
pub fn create_dir_all(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(path)
}

// Writes a file with the given mode through a temporary file and a
// rename so that a partial write can never be observed at `path`.
pub async fn write_file_atomic(
    path: PathBuf,
    temp_path: PathBuf,
    mode: u32,
    data: Vec<u8>,
) -> std::io::Result<()> {
    tokio::task::spawn_blocking(move || {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&temp_path, &path)
    })
    .await
    .expect("join")
}

// Serializes a value as pretty json with 4-space indentation.
pub fn serialize_indented<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut serializer)?;
    Ok(buf)
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_serialize_indented() {
        let value = serde_json::json!({"a": {"b": 1}});
        let want = "{\n    \"a\": {\n        \"b\": 1\n    }\n}";
        let got = serialize_indented(&value).unwrap();
        assert_eq!(want, String::from_utf8(got).unwrap());
    }

    #[tokio::test]
    async fn test_write_file_atomic() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("file");
        let temp_path = temp_dir.path().join("file.tmp");

        write_file_atomic(path.clone(), temp_path.clone(), FILE_MODE, b"abc".to_vec())
            .await
            .unwrap();

        assert_eq!(b"abc", &std::fs::read(&path).unwrap()[..]);
        assert!(!temp_path.exists());

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(FILE_MODE, mode & 0o777);
    }
}
