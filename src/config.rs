//! Admission control settings.
//!
//! Loading is left to the caller; with the `serde` feature the struct can be
//! read from any serde format. Durations are expressed in milliseconds there:
//!
//! ```json
//! { "global_capacity": 50, "global_window_ms": 1000, "bucket_expiry_grace_ms": 1000 }
//! ```

use crate::error::ConfigError;
use std::time::Duration;

const DEFAULT_GLOBAL_CAPACITY: u32 = 50;
const DEFAULT_GLOBAL_WINDOW_MILLIS: u64 = 1_000;
const DEFAULT_BUCKET_EXPIRY_GRACE_MILLIS: u64 = 1_000;

/// Tunables for [`AdmissionPolicy`](crate::AdmissionPolicy).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct AdmissionConfig {
    global_capacity: u32,
    #[cfg_attr(feature = "serde", serde(rename = "global_window_ms", with = "millis"))]
    global_window: Duration,
    #[cfg_attr(feature = "serde", serde(rename = "bucket_expiry_grace_ms", with = "millis"))]
    bucket_expiry_grace: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            global_capacity: DEFAULT_GLOBAL_CAPACITY,
            global_window: Duration::from_millis(DEFAULT_GLOBAL_WINDOW_MILLIS),
            bucket_expiry_grace: Duration::from_millis(DEFAULT_BUCKET_EXPIRY_GRACE_MILLIS),
        }
    }
}

impl AdmissionConfig {
    /// Create a validated config.
    pub fn new(
        global_capacity: u32,
        global_window: Duration,
        bucket_expiry_grace: Duration,
    ) -> Result<Self, ConfigError> {
        let cfg = Self { global_capacity, global_window, bucket_expiry_grace };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Requests admitted per global window.
    pub fn global_capacity(&self) -> u32 {
        self.global_capacity
    }

    /// Length of the global window.
    pub fn global_window(&self) -> Duration {
        self.global_window
    }

    /// How long a bucket outlives its reset instant before eviction.
    pub fn bucket_expiry_grace(&self) -> Duration {
        self.bucket_expiry_grace
    }

    /// Override the global capacity; must be > 0.
    pub fn with_global_capacity(mut self, capacity: u32) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        self.global_capacity = capacity;
        Ok(self)
    }

    /// Override the global window; must be > 0.
    pub fn with_global_window(mut self, window: Duration) -> Result<Self, ConfigError> {
        if window.is_zero() {
            return Err(ConfigError::ZeroWindow);
        }
        self.global_window = window;
        Ok(self)
    }

    /// Override the bucket expiry grace. Zero is allowed.
    pub fn with_bucket_expiry_grace(mut self, grace: Duration) -> Self {
        self.bucket_expiry_grace = grace;
        self
    }

    /// Check a config built through deserialization.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.global_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.global_window.is_zero() {
            return Err(ConfigError::ZeroWindow);
        }
        Ok(())
    }
}

#[cfg(feature = "serde")]
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
