//! Telemetry for admission decisions.
//!
//! The policy emits an [`AdmissionEvent`] for every local throttle, every
//! executed request and every change in what it knows about buckets. Events
//! flow through a [`TelemetrySink`], which is just a
//! `tower::Service<AdmissionEvent, Response = ()>`, so sinks compose with
//! standard tower combinators.
//!
//! ```rust
//! use bucketgate::telemetry::{AdmissionEvent, MemorySink};
//! use bucketgate::Origin;
//! use std::time::Duration;
//!
//! let event = AdmissionEvent::Throttled {
//!     route: "POST /channels/1/messages".into(),
//!     origin: Origin::Endpoint,
//!     retry_after: Duration::from_millis(750),
//! };
//! assert_eq!(
//!     event.to_string(),
//!     "Throttled(route=POST /channels/1/messages, origin=endpoint, retry_after=750ms)"
//! );
//! let _sink = MemorySink::with_capacity(128);
//! ```
//!
//! Emission is best-effort: a sink that is not ready or fails loses the
//! event, and nothing is emitted while a bucket lock is held.

pub mod events;
pub mod sinks;

pub use events::AdmissionEvent;
pub use sinks::{emit_best_effort, LogSink, MemorySink, NullSink, TelemetrySink};
