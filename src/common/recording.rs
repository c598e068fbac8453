// SPDX-License-Identifier: GPL-2.0-or-later

use crate::{
    Event,
    time::UnixNano,
};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;

// Recording data serialized to json and saved next to the video
// and thumbnail files.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordingData {
    #[serde(with = "crate::time::rfc3339")]
    pub start: UnixNano,

    #[serde(with = "crate::time::rfc3339")]
    pub end: UnixNano,

    pub events: Vec<Event>,
}

#[derive(Debug, Error)]
pub enum RecordingIdError {
    #[error("invalid string: {0}")]
    InvalidString(String),

    #[error("time out of range: {0:?}")]
    TimeOutOfRange(UnixNano),
}

// "YYYY-MM-DD_HH-MM-SS_<monitorID>".
#[repr(transparent)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordingId(String);

impl RecordingId {
    pub fn new(start_time: UnixNano, monitor_id: &str) -> Result<Self, RecordingIdError> {
        let time = start_time
            .as_chrono()
            .ok_or(RecordingIdError::TimeOutOfRange(start_time))?;
        Ok(Self(format!(
            "{}_{}",
            time.format("%Y-%m-%d_%H-%M-%S"),
            monitor_id
        )))
    }

    #[must_use]
    pub fn year_month_day(&self) -> [PathBuf; 3] {
        [
            PathBuf::from(&self.0[..4]),   // Year.
            PathBuf::from(&self.0[5..7]),  // Month.
            PathBuf::from(&self.0[8..10]), // Day.
        ]
    }

    #[must_use]
    pub fn monitor_id(&self) -> &str {
        &self.0[20..]
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn as_path(&self) -> &Path {
        Path::new(&self.0)
    }

    // "YYYY/MM/DD/<monitorID>/YYYY-MM-DD_HH-MM-SS_<monitorID>".
    #[must_use]
    pub fn as_full_path(&self) -> PathBuf {
        let [year, month, day] = self.year_month_day();
        year.join(month)
            .join(day)
            .join(self.monitor_id())
            .join(self.as_path())
    }
}

impl FromStr for RecordingId {
    type Err = RecordingIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use RecordingIdError::*;
        let b = s.as_bytes();
        if b.len() < 21 {
            return Err(InvalidString(s.to_owned()));
        }

        // "xxxx-xx-xx_xx-xx-xx_x"
        if b[4] != b'-'
            || b[7] != b'-'
            || b[10] != b'_'
            || b[13] != b'-'
            || b[16] != b'-'
            || b[19] != b'_'
        {
            return Err(InvalidString(s.to_owned()));
        }
        Ok(Self(s.to_owned()))
    }
}

impl std::fmt::Display for RecordingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::SECOND;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_recording_id_new() {
        // 2000-01-02 03:04:05 UTC.
        let time = UnixNano::new(946_782_245 * SECOND);
        let id = RecordingId::new(time, "m1").unwrap();
        assert_eq!("2000-01-02_03-04-05_m1", id.as_str());
        assert_eq!("m1", id.monitor_id());
        assert_eq!(
            Path::new("2000/01/02/m1/2000-01-02_03-04-05_m1"),
            id.as_full_path(),
        );
    }

    #[test]
    fn test_recording_id_parse() {
        let id: RecordingId = "2000-01-02_03-04-05_m1".parse().unwrap();
        assert_eq!("m1", id.monitor_id());

        assert!(RecordingId::from_str("x").is_err());
        assert!(RecordingId::from_str("2000-01-02 03-04-05_m1").is_err());
    }
}
