//! Process-wide request ceiling.

use crate::bucket::{Bucket, BucketSnapshot, Decision};
use crate::error::BucketError;
use crate::AdmissionConfig;
use std::time::Duration;

const GLOBAL_HASH: &str = "global";

/// A fixed-capacity bucket shared by every request that opts into global
/// limiting.
///
/// The window opens on the first check after the previous one elapsed, not
/// on a wall-clock grid, so under sustained load the boundary drifts forward.
#[derive(Debug)]
pub struct GlobalBucket {
    bucket: Bucket,
    window: Duration,
}

impl GlobalBucket {
    /// Create a global bucket admitting `capacity` requests per `window`.
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self { bucket: Bucket::new(GLOBAL_HASH, capacity, capacity, 0), window }
    }

    /// Build from the `global_*` settings of a config.
    pub fn from_config(config: &AdmissionConfig) -> Self {
        Self::new(config.global_capacity(), config.global_window())
    }

    /// Roll the window if it has elapsed, then try to take a permit.
    ///
    /// Reset and take happen under one lock, so callers racing the window
    /// boundary trigger at most one reset between them.
    pub fn check(&self, now: u64) -> Result<Decision, BucketError> {
        self.bucket.check_rolling(now, self.window)
    }

    /// Maximum requests per window.
    pub fn capacity(&self) -> u32 {
        self.bucket.limit()
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Current window state.
    pub fn snapshot(&self) -> BucketSnapshot {
        self.bucket.snapshot()
    }
}

impl Default for GlobalBucket {
    fn default() -> Self {
        Self::from_config(&AdmissionConfig::default())
    }
}
