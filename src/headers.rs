//! Header names read from responses and written on synthesized denials.

use http::HeaderValue;
use std::time::Duration;

/// Integer capacity of the bucket.
pub const RATE_LIMIT_LIMIT: &str = "rate-limit-limit";
/// Integer number of requests left in the current window.
pub const RATE_LIMIT_REMAINING: &str = "rate-limit-remaining";
/// Fractional seconds since the UNIX epoch at which the window resets.
pub const RATE_LIMIT_RESET: &str = "rate-limit-reset";
/// Opaque bucket identity. Absent or empty means the route is unlimited.
pub const RATE_LIMIT_BUCKET_ID: &str = "rate-limit-bucket-id";
/// Marker on locally synthesized denials: `global` or `endpoint`.
pub const RATE_LIMIT_ORIGIN: &str = "rate-limit-origin";
/// Seconds to wait before retrying, with millisecond precision.
pub const RETRY_AFTER: &str = "retry-after";

/// Render a retry-after duration as fractional seconds, e.g. `"0.250"`.
pub fn retry_after_value(wait: Duration) -> HeaderValue {
    let millis = wait.as_millis();
    let text = format!("{}.{:03}", millis / 1000, millis % 1000);
    // Only ASCII digits and a dot.
    HeaderValue::from_str(&text).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

/// Parse a retry-after value written in (fractional) seconds.
///
/// HTTP-date forms are not used by the remote service and yield `None`.
pub fn parse_retry_after(value: &HeaderValue) -> Option<Duration> {
    let secs: f64 = value.to_str().ok()?.trim().parse().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(Duration::from_millis((secs * 1000.0).round() as u64))
}
