// SPDX-License-Identifier: GPL-2.0-or-later

use crate::time::{Duration, UnixNano};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// Recording trigger event. `rec_duration` extends the deadline of the
// recorder session and is never persisted.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(with = "crate::time::rfc3339")]
    pub time: UnixNano,

    pub detections: Detections,

    pub duration: Duration,

    #[serde(skip)]
    pub rec_duration: Duration,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("value missing: {0}")]
pub struct ValueMissingError(pub &'static str);

impl Event {
    pub fn validate(&self) -> Result<(), ValueMissingError> {
        if self.time.is_zero() {
            return Err(ValueMissingError("Time"));
        }
        if self.rec_duration.is_zero() {
            return Err(ValueMissingError("RecDuration"));
        }
        Ok(())
    }
}

pub type Detections = Vec<Detection>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub score: f32,
    pub region: Region,
}

// Region where the detection occurred.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub rect: Option<Rect>,
    pub polygon: Option<Polygon>,
}

// Top, left, bottom, right.
pub type Rect = [u32; 4];

pub type Point = [u32; 2];
pub type Polygon = Vec<Point>;
