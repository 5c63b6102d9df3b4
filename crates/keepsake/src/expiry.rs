//! Time-to-live freshness checks and the clock they read.
//!
//! Entries are invalidated lazily: a lookup that finds a stale entry removes
//! it and reports a miss. Nothing sweeps the store in the background.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    /// Convert `amount` of this unit to milliseconds, truncating sub-millisecond
    /// units and saturating on overflow.
    pub fn to_millis(self, amount: u64) -> u64 {
        match self {
            TimeUnit::Nanoseconds => amount / 1_000_000,
            TimeUnit::Microseconds => amount / 1_000,
            TimeUnit::Milliseconds => amount,
            TimeUnit::Seconds => amount.saturating_mul(1_000),
            TimeUnit::Minutes => amount.saturating_mul(60_000),
            TimeUnit::Hours => amount.saturating_mul(3_600_000),
            TimeUnit::Days => amount.saturating_mul(86_400_000),
        }
    }

    pub fn to_duration(self, amount: u64) -> Duration {
        match self {
            TimeUnit::Nanoseconds => Duration::from_nanos(amount),
            TimeUnit::Microseconds => Duration::from_micros(amount),
            _ => Duration::from_millis(self.to_millis(amount)),
        }
    }
}

impl FromStr for TimeUnit {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ns" | "nanoseconds" => Ok(TimeUnit::Nanoseconds),
            "us" | "microseconds" => Ok(TimeUnit::Microseconds),
            "ms" | "milliseconds" => Ok(TimeUnit::Milliseconds),
            "s" | "seconds" => Ok(TimeUnit::Seconds),
            "m" | "minutes" => Ok(TimeUnit::Minutes),
            "h" | "hours" => Ok(TimeUnit::Hours),
            "d" | "days" => Ok(TimeUnit::Days),
            _ => Err(ConfigError::UnknownTimeUnit(s.to_string())),
        }
    }
}

/// Maximum age of a cached response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ttl {
    pub duration: u64,
    pub unit: TimeUnit,
}

impl Ttl {
    pub const fn new(duration: u64, unit: TimeUnit) -> Self {
        Self { duration, unit }
    }

    pub const fn seconds(duration: u64) -> Self {
        Self::new(duration, TimeUnit::Seconds)
    }

    pub const fn minutes(duration: u64) -> Self {
        Self::new(duration, TimeUnit::Minutes)
    }

    pub const fn hours(duration: u64) -> Self {
        Self::new(duration, TimeUnit::Hours)
    }

    pub fn as_millis(&self) -> u64 {
        self.unit.to_millis(self.duration)
    }
}

impl Default for Ttl {
    fn default() -> Self {
        Ttl::hours(24)
    }
}

/// True iff a response received at `received_at_millis` is still within `ttl`
/// at `now_millis`. A receive time in the future counts as age zero.
pub fn is_fresh(received_at_millis: u64, ttl: Ttl, now_millis: u64) -> bool {
    now_millis.saturating_sub(received_at_millis) <= ttl.as_millis()
}

/// Source of wall-clock milliseconds for freshness checks and timestamps.
pub trait Clock: Send + Sync + 'static {
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(now_millis),
        }
    }

    pub fn set(&self, now_millis: u64) {
        self.now.store(now_millis, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
