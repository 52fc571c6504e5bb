#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # bucketgate
//!
//! Client-side admission control for outbound HTTP requests against a
//! remote service that publishes its rate limits in response headers.
//!
//! Requests are checked against two kinds of token buckets before they hit
//! the network:
//!
//! - **Global bucket**: a process-wide ceiling of N requests per window
//!   (50 per second by default) for requests that opt in.
//! - **Endpoint buckets**: learned from `rate-limit-*` response headers and
//!   shared by every route the remote service maps onto the same bucket id.
//!
//! A denial is local: the transport is never called and the caller gets a
//! [`Throttle`] carrying the wait and which bucket denied. Responses are
//! handed back exactly as received after their quota headers are recorded.
//!
//! ## Quick Start
//!
//! ```rust
//! use bucketgate::{Admission, AdmissionConfig, AdmissionPolicy};
//! use http::Response;
//!
//! #[tokio::main]
//! async fn main() {
//!     let policy = AdmissionPolicy::new(AdmissionConfig::default());
//!
//!     let outcome = policy
//!         .admit_and_execute("GET /users/@me", true, || async {
//!             // Your HTTP client call here
//!             Ok::<_, std::io::Error>(Response::new(Vec::<u8>::new()))
//!         })
//!         .await
//!         .unwrap();
//!
//!     match outcome {
//!         Admission::Executed(response) => assert!(response.status().is_success()),
//!         Admission::Throttled(throttle) => println!("retry in {:?}", throttle.retry_after()),
//!     }
//! }
//! ```
//!
//! As tower middleware, see [`AdmissionLayer`].

pub mod bucket;
pub mod clock;
pub mod config;
pub mod error;
pub mod global;
pub mod headers;
pub mod middleware;
pub mod policy;
pub mod store;
pub mod telemetry;

// Re-exports
pub use bucket::{Bucket, BucketSnapshot, Decision, UNLIMITED};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AdmissionConfig;
pub use error::{AdmissionError, BucketError, ConfigError, ExtractError};
pub use global::GlobalBucket;
pub use middleware::{AdmissionLayer, AdmissionService, RouteKey};
pub use policy::{is_remote_throttle, Admission, AdmissionPolicy, Origin, Throttle};
pub use store::{BucketStore, JanitorHandle, RecordOutcome};
pub use telemetry::{AdmissionEvent, LogSink, MemorySink, NullSink, TelemetrySink};
