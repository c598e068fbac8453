// SPDX-License-Identifier: GPL-2.0-or-later

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    ops::Deref,
    time::{SystemTime, UNIX_EPOCH},
};

pub const NANOSECOND: i64 = 1;
pub const MICROSECOND: i64 = NANOSECOND * 1000;
pub const MILLISECOND: i64 = MICROSECOND * 1000;
pub const SECOND: i64 = MILLISECOND * 1000;
pub const MINUTE: i64 = SECOND * 60;
pub const HOUR: i64 = MINUTE * 60;

// Nanoseconds since the Unix epoch.
#[repr(transparent)]
#[derive(
    Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct UnixNano(i64);

impl UnixNano {
    #[must_use]
    pub const fn new(v: i64) -> Self {
        Self(v)
    }

    #[must_use]
    pub fn now() -> Self {
        Self(
            i64::try_from(
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .expect("time went backwards")
                    .as_nanos(),
            )
            .expect("timestamp to fit i64"),
        )
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(&self, duration: Duration) -> Option<Self> {
        Some(Self(self.0.checked_add(duration.0)?))
    }

    pub fn checked_sub(&self, duration: Duration) -> Option<Self> {
        Some(Self(self.0.checked_sub(duration.0)?))
    }

    // Reports whether the time instant `self` is after `other`.
    #[must_use]
    pub fn after(&self, other: Self) -> bool {
        self.0 > other.0
    }

    // Reports whether the time instant `self` is before `other`.
    #[must_use]
    pub fn before(&self, other: Self) -> bool {
        self.0 < other.0
    }

    // Returns the duration `self - other`.
    pub fn sub(&self, other: Self) -> Option<Duration> {
        self.0.checked_sub(other.0).map(Duration)
    }

    #[must_use]
    pub fn as_chrono(&self) -> Option<DateTime<Utc>> {
        let sec = self.0.div_euclid(SECOND);
        let nsec = u32::try_from(self.0.rem_euclid(SECOND)).ok()?;
        DateTime::from_timestamp(sec, nsec)
    }

    pub const MAX: UnixNano = UnixNano(i64::MAX);
}

impl From<i64> for UnixNano {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

impl From<UnixH264> for UnixNano {
    fn from(v: UnixH264) -> Self {
        v.as_nanos()
    }
}

impl Deref for UnixNano {
    type Target = i64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// `std::time::Duration` but signed and without the u128 conversions.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Duration(i64);

impl Duration {
    #[must_use]
    pub const fn new(nanos: i64) -> Self {
        Self(nanos)
    }

    #[must_use]
    pub fn from_millis(millis: i64) -> Self {
        Self(millis * MILLISECOND)
    }

    #[must_use]
    pub fn from_secs(secs: i64) -> Self {
        Self(secs * SECOND)
    }

    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::as_conversions
    )]
    pub fn from_minutes_f64(minutes: f64) -> Self {
        Self((minutes * (MINUTE as f64)) as i64)
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn as_secs(&self) -> i64 {
        self.0 / SECOND
    }

    pub fn as_std(&self) -> Option<std::time::Duration> {
        Some(std::time::Duration::from_nanos(u64::try_from(self.0).ok()?))
    }

    #[must_use]
    pub fn as_h264(&self) -> DurationH264 {
        DurationH264::new(nano_to_timescale(self.0, H264_TIMESCALE.into()))
    }

    // Duration from now until `time`. Negative if `time` is in the past.
    #[must_use]
    pub fn until(time: UnixNano) -> Option<Self> {
        time.0.checked_sub(*UnixNano::now()).map(Self)
    }
}

impl From<i64> for Duration {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

impl Deref for Duration {
    type Target = i64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// The number of time units that pass per second.
pub const H264_TIMESCALE: u32 = 90000;

pub const H264_SECOND: i64 = H264_TIMESCALE as i64;
pub const H264_MILLISECOND: i64 = H264_SECOND / 1000;

// 90khz time since the Unix epoch.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct UnixH264(i64);

impl UnixH264 {
    #[must_use]
    pub const fn new(v: i64) -> Self {
        Self(v)
    }

    pub fn checked_add(&self, duration: DurationH264) -> Option<Self> {
        Some(Self(self.0.checked_add(duration.0)?))
    }

    pub fn checked_sub(&self, other: Self) -> Option<Self> {
        Some(Self(self.0.checked_sub(other.0)?))
    }

    #[must_use]
    pub fn as_nanos(&self) -> UnixNano {
        let clock_rate = i64::from(H264_TIMESCALE);
        let secs = self.0 / clock_rate;
        let dec = self.0 % clock_rate;
        UnixNano((secs * SECOND) + ((dec * SECOND) / clock_rate))
    }

    // Reports whether the time instant `self` is after `other`.
    #[must_use]
    pub fn after(&self, other: Self) -> bool {
        self.0 > other.0
    }
}

impl From<i64> for UnixH264 {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

impl From<UnixNano> for UnixH264 {
    fn from(v: UnixNano) -> Self {
        Self(nano_to_timescale(v.0, H264_TIMESCALE.into()))
    }
}

impl From<DtsOffset> for UnixH264 {
    fn from(v: DtsOffset) -> Self {
        Self(i64::from(v.0))
    }
}

impl Deref for UnixH264 {
    type Target = i64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// H264 duration with 90khz timescale.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct DurationH264(i64);

impl DurationH264 {
    #[must_use]
    pub const fn new(v: i64) -> Self {
        Self(v)
    }

    pub fn checked_add(&self, rhs: Self) -> Option<Self> {
        Some(Self(self.0.checked_add(rhs.0)?))
    }

    pub fn checked_sub(&self, rhs: Self) -> Option<Self> {
        Some(Self(self.0.checked_sub(rhs.0)?))
    }

    pub fn as_i32(&self) -> Result<i32, std::num::TryFromIntError> {
        i32::try_from(self.0)
    }

    pub fn as_u32(&self) -> Result<u32, std::num::TryFromIntError> {
        u32::try_from(self.0)
    }

    #[must_use]
    pub fn as_millis(&self) -> i64 {
        self.as_nanos() / MILLISECOND
    }

    #[must_use]
    pub fn as_nanos(&self) -> i64 {
        let clock_rate = i64::from(H264_TIMESCALE);
        let secs = self.0 / clock_rate;
        let dec = self.0 % clock_rate;
        (secs * SECOND) + ((dec * SECOND) / clock_rate)
    }
}

impl From<i64> for DurationH264 {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

impl From<u32> for DurationH264 {
    fn from(v: u32) -> Self {
        Self(i64::from(v))
    }
}

impl From<UnixH264> for DurationH264 {
    fn from(time: UnixH264) -> Self {
        Self(time.0)
    }
}

impl Deref for DurationH264 {
    type Target = i64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// Composition time offset `pts - dts` of a single sample.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DtsOffset(i32);

impl DtsOffset {
    #[must_use]
    pub const fn new(v: i32) -> Self {
        Self(v)
    }
}

impl Deref for DtsOffset {
    type Target = i32;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// Converts value in nanoseconds into a different timescale.
#[must_use]
pub fn nano_to_timescale(value: i64, timescale: i64) -> i64 {
    let secs = value / SECOND;
    let dec = value % SECOND;
    (secs * timescale) + (dec * timescale / SECOND)
}

// Serializes a `UnixNano` as a RFC 3339 string. Used by the recording
// sidecar where timestamps should be human readable.
pub mod rfc3339 {
    use super::UnixNano;
    use chrono::{DateTime, SecondsFormat};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &UnixNano, serializer: S) -> Result<S::Ok, S::Error> {
        let Some(time) = time.as_chrono() else {
            return Err(serde::ser::Error::custom("time out of range"));
        };
        serializer.serialize_str(&time.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<UnixNano, D::Error> {
        let s = String::deserialize(deserializer)?;
        let time = DateTime::parse_from_rfc3339(&s).map_err(serde::de::Error::custom)?;
        let Some(nanos) = time.timestamp_nanos_opt() else {
            return Err(serde::de::Error::custom("time out of range"));
        };
        Ok(UnixNano::new(nanos))
    }
}
