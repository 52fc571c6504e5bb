use crate::policy::Origin;
use std::fmt;
use std::time::Duration;

/// Events emitted by [`AdmissionPolicy`](crate::AdmissionPolicy).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionEvent {
    /// A request was denied locally without contacting the remote service.
    Throttled {
        /// Route key of the denied request.
        route: String,
        /// Which bucket denied it.
        origin: Origin,
        /// Time until that bucket resets.
        retry_after: Duration,
    },
    /// The transport call completed and its response was returned.
    Executed {
        /// Route key of the request.
        route: String,
        /// HTTP status of the response.
        status: u16,
        /// Time spent in the transport call.
        duration: Duration,
    },
    /// A response carried quota for a concrete bucket.
    BucketObserved {
        /// Route key of the request.
        route: String,
        /// Bucket identity reported by the remote service.
        hash: String,
        /// Reported capacity.
        limit: u32,
        /// Reported requests left.
        remaining: u32,
    },
    /// The remote service moved a route to a different bucket.
    BucketRemapped {
        /// Route key that moved.
        route: String,
        /// Identity it pointed at before.
        from: String,
        /// Identity it points at now.
        to: String,
    },
    /// A response carried quota without a bucket id; the route is unlimited.
    Unlimited {
        /// Route key of the request.
        route: String,
    },
}

impl AdmissionEvent {
    /// Route key the event concerns.
    pub fn route(&self) -> &str {
        match self {
            AdmissionEvent::Throttled { route, .. }
            | AdmissionEvent::Executed { route, .. }
            | AdmissionEvent::BucketObserved { route, .. }
            | AdmissionEvent::BucketRemapped { route, .. }
            | AdmissionEvent::Unlimited { route } => route,
        }
    }

    /// True for local throttles.
    pub fn is_throttle(&self) -> bool {
        matches!(self, AdmissionEvent::Throttled { .. })
    }
}

impl fmt::Display for AdmissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionEvent::Throttled { route, origin, retry_after } => write!(
                f,
                "Throttled(route={}, origin={}, retry_after={:?})",
                route, origin, retry_after
            ),
            AdmissionEvent::Executed { route, status, duration } => {
                write!(f, "Executed(route={}, status={}, duration={:?})", route, status, duration)
            }
            AdmissionEvent::BucketObserved { route, hash, limit, remaining } => write!(
                f,
                "BucketObserved(route={}, hash={}, {}/{})",
                route, hash, remaining, limit
            ),
            AdmissionEvent::BucketRemapped { route, from, to } => {
                write!(f, "BucketRemapped(route={}, {} -> {})", route, from, to)
            }
            AdmissionEvent::Unlimited { route } => write!(f, "Unlimited(route={})", route),
        }
    }
}
