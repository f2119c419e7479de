//! Stored entries

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// A key/value pair with the metadata used to order two versions of it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    pub value: Vec<u8>,
    /// Write time in unix nanoseconds
    pub timestamp: i64,
    /// Expiry in unix milliseconds, 0 for none
    pub ttl: i64,
}

impl Entry {
    /// Create an entry stamped with the current time
    #[must_use]
    pub fn new(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            value,
            timestamp: now_nanos(),
            ttl: 0,
        }
    }

    /// Create an entry with explicit version metadata
    #[must_use]
    pub fn with_version(key: impl Into<String>, value: Vec<u8>, timestamp: i64, ttl: i64) -> Self {
        Self {
            key: key.into(),
            value,
            timestamp,
            ttl,
        }
    }

    /// Approximate in-memory footprint
    #[must_use]
    pub fn size(&self) -> usize {
        self.key.len() + self.value.len() + 16
    }

    /// Check whether the entry has expired at `now_millis`
    #[must_use]
    pub const fn is_expired(&self, now_millis: i64) -> bool {
        self.ttl != 0 && self.ttl <= now_millis
    }
}

/// Current unix time in nanoseconds
#[must_use]
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
}

/// Current unix time in milliseconds
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}
