use std::fmt;
use std::ops::{Add, Sub};
use std::time;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A duration wrapper providing convenient conversions.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Duration {
    nanos: u64,
}

impl Duration {
    pub const ZERO: Duration = Duration { nanos: 0 };

    pub fn from_nanos(nanos: u64) -> Self {
        Self { nanos }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self {
            nanos: millis * 1_000_000,
        }
    }

    pub fn from_secs(secs: u64) -> Self {
        Self {
            nanos: secs * 1_000_000_000,
        }
    }

    pub fn as_nanos(&self) -> u64 {
        self.nanos
    }

    pub fn as_millis(&self) -> u64 {
        self.nanos / 1_000_000
    }

    pub fn as_secs(&self) -> u64 {
        self.nanos / 1_000_000_000
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.nanos as f64 / 1_000_000_000.0
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Duration({}ns)", self.nanos)
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nanos >= 1_000_000_000 {
            write!(f, "{:.3}s", self.as_secs_f64())
        } else if self.nanos >= 1_000_000 {
            write!(f, "{}ms", self.as_millis())
        } else {
            write!(f, "{}ns", self.nanos)
        }
    }
}

impl Default for Duration {
    fn default() -> Self {
        Self::ZERO
    }
}

impl From<time::Duration> for Duration {
    fn from(d: time::Duration) -> Self {
        Self {
            nanos: d.as_nanos() as u64,
        }
    }
}

impl From<Duration> for time::Duration {
    fn from(d: Duration) -> Self {
        time::Duration::from_nanos(d.nanos)
    }
}

impl Add for Duration {
    type Output = Duration;
    fn add(self, rhs: Duration) -> Duration {
        Duration {
            nanos: self.nanos + rhs.nanos,
        }
    }
}

impl Sub for Duration {
    type Output = Duration;
    fn sub(self, rhs: Duration) -> Duration {
        Duration {
            nanos: self.nanos.saturating_sub(rhs.nanos),
        }
    }
}

/// A UTC timestamp wrapper around `chrono::DateTime<Utc>`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UtcTime {
    inner: DateTime<Utc>,
}

impl UtcTime {
    /// Get the current UTC time.
    pub fn now() -> Self {
        Self { inner: Utc::now() }
    }

    /// Access the inner `DateTime<Utc>`.
    pub fn as_chrono(&self) -> &DateTime<Utc> {
        &self.inner
    }

    /// Milliseconds since Unix epoch.
    pub fn timestamp_millis(&self) -> i64 {
        self.inner.timestamp_millis()
    }

    /// Seconds since Unix epoch.
    pub fn timestamp(&self) -> i64 {
        self.inner.timestamp()
    }

    /// Elapsed wall-clock time since this timestamp, zero if in the future.
    pub fn elapsed(&self) -> Duration {
        let delta = Utc::now() - self.inner;
        Duration::from_nanos(delta.num_nanoseconds().unwrap_or(0).max(0) as u64)
    }
}

impl fmt::Debug for UtcTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UtcTime({})", self.inner.to_rfc3339())
    }
}

impl fmt::Display for UtcTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.to_rfc3339())
    }
}

impl Default for UtcTime {
    fn default() -> Self {
        Self {
            inner: DateTime::<Utc>::default(),
        }
    }
}

impl From<DateTime<Utc>> for UtcTime {
    fn from(dt: DateTime<Utc>) -> Self {
        Self { inner: dt }
    }
}
