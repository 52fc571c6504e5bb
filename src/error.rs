//! Error types for admission control.
//!
//! A local throttle is not an error: it comes back as
//! [`Admission::Throttled`](crate::Admission::Throttled). The types here cover
//! what is left over: transport failures passed through untouched, header
//! extraction misses (swallowed by the store), bad configuration, and the one
//! fatal logic fault, a bucket reset that would move time backwards.
use std::fmt;

/// Fatal bucket bookkeeping faults.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BucketError {
    /// A reset tried to move `reset_at` to an earlier instant.
    #[error("bucket reset would move reset_at backwards ({requested} < {current})")]
    ResetWentBackward {
        /// The bucket's current reset instant (epoch millis).
        current: u64,
        /// The rejected reset instant (epoch millis).
        requested: u64,
    },
}

/// Why a response carried no usable quota information.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    /// A required header was absent.
    #[error("missing header {header}")]
    Missing {
        /// Header name.
        header: &'static str,
    },
    /// A required header was present but could not be parsed.
    #[error("malformed header {header}: {value:?}")]
    Malformed {
        /// Header name.
        header: &'static str,
        /// Raw (lossy) header value.
        value: String,
    },
}

/// Errors produced when validating [`AdmissionConfig`](crate::AdmissionConfig).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Global capacity must be > 0.
    #[error("global_capacity must be > 0")]
    ZeroCapacity,
    /// Global window must be > 0.
    #[error("global_window must be > 0")]
    ZeroWindow,
}

/// Failure of [`AdmissionPolicy::admit_and_execute`](crate::AdmissionPolicy::admit_and_execute).
#[derive(Debug, Clone)]
pub enum AdmissionError<E> {
    /// The transport call itself failed. Bucket state was not updated.
    Transport(E),
    /// Bucket bookkeeping hit a logic fault. Not retryable.
    Invariant(BucketError),
}

impl<E: fmt::Display> fmt::Display for AdmissionError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "{}", e),
            Self::Invariant(e) => write!(f, "admission invariant violated: {}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for AdmissionError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Invariant(e) => Some(e),
        }
    }
}

impl<E> From<BucketError> for AdmissionError<E> {
    fn from(err: BucketError) -> Self {
        Self::Invariant(err)
    }
}

impl<E> AdmissionError<E> {
    /// Check if this error wraps a transport failure.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Check if this error is a bookkeeping invariant violation.
    pub fn is_invariant(&self) -> bool {
        matches!(self, Self::Invariant(_))
    }

    /// Get the transport error if this is a `Transport` variant.
    pub fn into_transport(self) -> Option<E> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the transport error if present.
    pub fn as_transport(&self) -> Option<&E> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the invariant violation if present.
    pub fn as_invariant(&self) -> Option<&BucketError> {
        match self {
            Self::Invariant(e) => Some(e),
            _ => None,
        }
    }
}
