//! Outbound request admission.
//!
//! [`AdmissionPolicy::admit_and_execute`] wraps one transport call:
//!
//! 1. If the request opts into global limiting, take a permit from the
//!    [`GlobalBucket`]; on denial return [`Origin::Global`].
//! 2. Resolve the route's bucket in the [`BucketStore`]; if a live bucket
//!    denies, return [`Origin::Endpoint`].
//! 3. Otherwise invoke the transport exactly once.
//! 4. Record the response's quota headers and hand the response back as is.
//!
//! Steps 1 and 2 are synchronous. Nothing is awaited between deciding and
//! calling the transport, and no lock is held while the transport runs, so
//! dropping the returned future can never leave a bucket half-updated.

use crate::bucket::Decision;
use crate::clock::{Clock, SystemClock};
use crate::error::{AdmissionError, BucketError};
use crate::global::GlobalBucket;
use crate::headers::{self, RATE_LIMIT_ORIGIN};
use crate::store::{BucketStore, RecordOutcome};
use crate::telemetry::{emit_best_effort, AdmissionEvent, NullSink};
use crate::AdmissionConfig;
use http::{HeaderValue, Response, StatusCode};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Which local bucket produced a denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// The process-wide ceiling.
    Global,
    /// The route's own bucket.
    Endpoint,
}

impl Origin {
    /// Header value for this origin.
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Global => "global",
            Origin::Endpoint => "endpoint",
        }
    }

    /// Origin marker of a locally synthesized denial, `None` for anything
    /// else (including a genuine 429 from the remote service).
    pub fn of_response<B>(response: &Response<B>) -> Option<Origin> {
        if response.status() != StatusCode::TOO_MANY_REQUESTS {
            return None;
        }
        match response.headers().get(RATE_LIMIT_ORIGIN)?.to_str().ok()? {
            "global" => Some(Origin::Global),
            "endpoint" => Some(Origin::Endpoint),
            _ => None,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// True for a 429 that came from the remote service rather than from this
/// crate.
pub fn is_remote_throttle<B>(response: &Response<B>) -> bool {
    response.status() == StatusCode::TOO_MANY_REQUESTS
        && !response.headers().contains_key(RATE_LIMIT_ORIGIN)
}

/// A local denial. The caller should retry after [`retry_after`](Self::retry_after).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Throttle {
    route: String,
    origin: Origin,
    retry_after: Duration,
}

impl Throttle {
    fn new(route: &str, origin: Origin, retry_after: Duration) -> Self {
        Self { route: route.to_string(), origin, retry_after }
    }

    /// Route key of the denied request.
    pub fn route(&self) -> &str {
        &self.route
    }

    /// Which bucket denied the request.
    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Time until the denying bucket resets.
    pub fn retry_after(&self) -> Duration {
        self.retry_after
    }

    /// Synthesize the denial as a `429 Too Many Requests` response carrying
    /// `retry-after` and the origin marker.
    pub fn into_response<B: Default>(self) -> Response<B> {
        let mut response = Response::new(B::default());
        *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
        let map = response.headers_mut();
        map.insert(headers::RETRY_AFTER, headers::retry_after_value(self.retry_after));
        map.insert(RATE_LIMIT_ORIGIN, HeaderValue::from_static(self.origin.as_str()));
        response
    }
}

impl fmt::Display for Throttle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} throttled locally ({} bucket), retry after {:?}",
            self.route, self.origin, self.retry_after
        )
    }
}

/// Outcome of [`AdmissionPolicy::admit_and_execute`].
#[derive(Debug)]
pub enum Admission<B> {
    /// The transport ran; this is its response, unmodified.
    Executed(Response<B>),
    /// Denied locally; the transport was not called.
    Throttled(Throttle),
}

impl<B> Admission<B> {
    /// Check if the transport was called.
    pub fn is_executed(&self) -> bool {
        matches!(self, Admission::Executed(_))
    }

    /// Check if the request was denied locally.
    pub fn is_throttled(&self) -> bool {
        matches!(self, Admission::Throttled(_))
    }

    /// Borrow the local denial if present.
    pub fn throttle(&self) -> Option<&Throttle> {
        match self {
            Admission::Throttled(t) => Some(t),
            Admission::Executed(_) => None,
        }
    }

    /// Borrow the transport response if present.
    pub fn response(&self) -> Option<&Response<B>> {
        match self {
            Admission::Executed(r) => Some(r),
            Admission::Throttled(_) => None,
        }
    }

    /// Fold both outcomes into a response, synthesizing one for denials.
    pub fn into_response(self) -> Response<B>
    where
        B: Default,
    {
        match self {
            Admission::Executed(response) => response,
            Admission::Throttled(throttle) => throttle.into_response(),
        }
    }
}

/// Decides whether outbound requests reach the network.
///
/// Clones share the same global bucket and bucket store.
#[derive(Clone)]
pub struct AdmissionPolicy<S = NullSink> {
    global: Arc<GlobalBucket>,
    store: Arc<BucketStore>,
    clock: Arc<dyn Clock>,
    config: AdmissionConfig,
    sink: S,
}

impl<S> fmt::Debug for AdmissionPolicy<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionPolicy")
            .field("config", &self.config)
            .field("global", &self.global.snapshot())
            .field("buckets", &self.store.bucket_count())
            .field("routes", &self.store.route_count())
            .field("sink", &"<sink>")
            .finish()
    }
}

impl AdmissionPolicy<NullSink> {
    /// Create a policy on the system clock with telemetry disabled.
    ///
    /// # Examples
    /// ```
    /// use bucketgate::{AdmissionConfig, AdmissionPolicy};
    ///
    /// let policy = AdmissionPolicy::new(AdmissionConfig::default());
    /// assert_eq!(policy.config().global_capacity(), 50);
    /// ```
    pub fn new(config: AdmissionConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let grace = config.bucket_expiry_grace();
        Self {
            global: Arc::new(GlobalBucket::from_config(&config)),
            store: Arc::new(BucketStore::with_shared_clock(grace, clock.clone())),
            clock,
            config,
            sink: NullSink,
        }
    }
}

impl Default for AdmissionPolicy<NullSink> {
    fn default() -> Self {
        Self::new(AdmissionConfig::default())
    }
}

impl<S> AdmissionPolicy<S> {
    /// Swap the clock. Bucket state starts over, so call this while building.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(clock);
        self.global = Arc::new(GlobalBucket::from_config(&self.config));
        let grace = self.config.bucket_expiry_grace();
        self.store = Arc::new(BucketStore::with_shared_clock(grace, clock.clone()));
        self.clock = clock;
        self
    }

    /// Route telemetry to `sink`.
    pub fn with_sink<T>(self, sink: T) -> AdmissionPolicy<T> {
        AdmissionPolicy {
            global: self.global,
            store: self.store,
            clock: self.clock,
            config: self.config,
            sink,
        }
    }

    /// Configuration the policy was built from.
    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// The shared global bucket.
    pub fn global(&self) -> &GlobalBucket {
        &self.global
    }

    /// The shared bucket store, e.g. for [`BucketStore::spawn_janitor`].
    pub fn store(&self) -> &Arc<BucketStore> {
        &self.store
    }

    /// Admission decision alone: `Some` when the request must be denied.
    ///
    /// A global permit taken here is not returned if the route's bucket then
    /// denies.
    pub fn check(
        &self,
        route: &str,
        subject_to_global: bool,
    ) -> Result<Option<Throttle>, BucketError> {
        let now = self.clock.now_millis();

        if subject_to_global {
            if let Decision::Denied { retry_after } = self.global.check(now)? {
                return Ok(Some(Throttle::new(route, Origin::Global, retry_after)));
            }
        }

        if let Some(bucket) = self.store.resolve(route) {
            if let Decision::Denied { retry_after } = bucket.check(now) {
                return Ok(Some(Throttle::new(route, Origin::Endpoint, retry_after)));
            }
        }

        Ok(None)
    }
}

impl<S> AdmissionPolicy<S>
where
    S: tower::Service<AdmissionEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    /// Run `perform` if local bookkeeping admits the request.
    ///
    /// `perform` is called at most once. Its response is returned untouched
    /// after its quota headers have been recorded; a transport error is
    /// passed through as [`AdmissionError::Transport`] and records nothing.
    ///
    /// # Examples
    /// ```
    /// use bucketgate::{AdmissionPolicy, Admission};
    /// use http::Response;
    ///
    /// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
    /// let policy = AdmissionPolicy::default();
    /// let outcome = policy
    ///     .admit_and_execute("GET /gateway", true, || async {
    ///         Ok::<_, std::io::Error>(Response::new(String::from("ok")))
    ///     })
    ///     .await
    ///     .unwrap();
    /// assert!(matches!(outcome, Admission::Executed(_)));
    /// # });
    /// ```
    pub async fn admit_and_execute<B, E, Fut, Op>(
        &self,
        route: &str,
        subject_to_global: bool,
        perform: Op,
    ) -> Result<Admission<B>, AdmissionError<E>>
    where
        Op: FnOnce() -> Fut,
        Fut: Future<Output = Result<Response<B>, E>>,
    {
        if let Some(throttle) = self.check(route, subject_to_global)? {
            let retry_after_ms =
                u64::try_from(throttle.retry_after().as_millis()).unwrap_or(u64::MAX);
            tracing::debug!(
                route,
                origin = %throttle.origin(),
                retry_after_ms,
                "request throttled locally"
            );
            self.emit(AdmissionEvent::Throttled {
                route: route.to_string(),
                origin: throttle.origin(),
                retry_after: throttle.retry_after(),
            })
            .await;
            return Ok(Admission::Throttled(throttle));
        }

        let started = Instant::now();
        let response = perform().await.map_err(AdmissionError::Transport)?;
        let duration = started.elapsed();

        let outcome = self.store.record(route, response.headers());
        self.emit(AdmissionEvent::Executed {
            route: route.to_string(),
            status: response.status().as_u16(),
            duration,
        })
        .await;
        self.emit_recorded(route, outcome).await;

        Ok(Admission::Executed(response))
    }

    async fn emit_recorded(&self, route: &str, outcome: RecordOutcome) {
        match outcome {
            RecordOutcome::NoQuota => {}
            RecordOutcome::Unlimited => {
                self.emit(AdmissionEvent::Unlimited { route: route.to_string() }).await;
            }
            RecordOutcome::Bucket { hash, previous } => {
                if let Some(from) = previous.filter(|p| *p != hash) {
                    self.emit(AdmissionEvent::BucketRemapped {
                        route: route.to_string(),
                        from,
                        to: hash.clone(),
                    })
                    .await;
                }
                if let Some(bucket) = self.store.resolve(route) {
                    let snapshot = bucket.snapshot();
                    self.emit(AdmissionEvent::BucketObserved {
                        route: route.to_string(),
                        hash,
                        limit: snapshot.limit,
                        remaining: snapshot.remaining,
                    })
                    .await;
                }
            }
        }
    }

    async fn emit(&self, event: AdmissionEvent) {
        emit_best_effort(self.sink.clone(), event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::headers::{
        RATE_LIMIT_BUCKET_ID, RATE_LIMIT_LIMIT, RATE_LIMIT_REMAINING, RATE_LIMIT_RESET,
    };
    use crate::telemetry::MemorySink;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn policy(capacity: u32) -> (AdmissionPolicy<MemorySink>, ManualClock, MemorySink) {
        let clock = ManualClock::new(1_000_000);
        let sink = MemorySink::new();
        let config = AdmissionConfig::default().with_global_capacity(capacity).unwrap();
        let policy =
            AdmissionPolicy::new(config).with_clock(clock.clone()).with_sink(sink.clone());
        (policy, clock, sink)
    }

    fn limited(limit: u32, remaining: u32, reset_secs: u64, hash: &str) -> Response<()> {
        let mut response = Response::new(());
        let h = response.headers_mut();
        h.insert(RATE_LIMIT_LIMIT, HeaderValue::from(limit));
        h.insert(RATE_LIMIT_REMAINING, HeaderValue::from(remaining));
        h.insert(RATE_LIMIT_RESET, HeaderValue::from(reset_secs));
        h.insert(RATE_LIMIT_BUCKET_ID, HeaderValue::from_str(hash).unwrap());
        response
    }

    #[tokio::test]
    async fn response_is_returned_unmodified() {
        let (policy, _, _) = policy(50);
        let outcome = policy
            .admit_and_execute("A", false, || async {
                let mut response = Response::new("payload");
                *response.status_mut() = StatusCode::CREATED;
                Ok::<_, io::Error>(response)
            })
            .await
            .unwrap();

        let response = outcome.response().expect("executed");
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(*response.body(), "payload");
    }

    #[tokio::test]
    async fn transport_errors_pass_through_without_recording() {
        let (policy, _, _) = policy(50);
        let err = policy
            .admit_and_execute::<(), _, _, _>("A", false, || async {
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            })
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert_eq!(policy.store().bucket_count(), 0);
    }

    #[tokio::test]
    async fn endpoint_denial_skips_transport() {
        let (policy, _, sink) = policy(50);
        let calls = Arc::new(AtomicUsize::new(0));

        // 1000s on the clock; bucket resets at 1010s.
        let first = policy
            .admit_and_execute("A", false, || async {
                Ok::<_, io::Error>(limited(1, 0, 1_010, "h1"))
            })
            .await
            .unwrap();
        assert!(first.is_executed());

        let calls_clone = calls.clone();
        let second = policy
            .admit_and_execute("A", false, || async move {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok::<_, io::Error>(Response::new(()))
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let throttle = second.throttle().expect("denied");
        assert_eq!(throttle.origin(), Origin::Endpoint);
        assert_eq!(throttle.retry_after(), Duration::from_secs(10));
        assert!(sink.events().iter().any(|e| e.is_throttle()));
    }

    #[tokio::test]
    async fn global_denial_is_marked_global() {
        let (policy, clock, _) = policy(1);
        let ok = || async { Ok::<_, io::Error>(Response::new(())) };

        assert!(policy.admit_and_execute("A", true, ok).await.unwrap().is_executed());
        let denied = policy.admit_and_execute("B", true, ok).await.unwrap();
        assert_eq!(denied.throttle().map(Throttle::origin), Some(Origin::Global));

        // Opting out of global limiting bypasses the ceiling.
        assert!(policy.admit_and_execute("C", false, ok).await.unwrap().is_executed());

        clock.advance(Duration::from_secs(1));
        assert!(policy.admit_and_execute("B", true, ok).await.unwrap().is_executed());
    }

    #[test]
    fn synthesized_denial_carries_markers() {
        let throttle = Throttle::new("A", Origin::Global, Duration::from_millis(1_500));
        let response: Response<Vec<u8>> = throttle.clone().into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[headers::RETRY_AFTER], "1.500");
        assert_eq!(
            headers::parse_retry_after(&response.headers()[headers::RETRY_AFTER]),
            Some(Duration::from_millis(1_500))
        );
        assert_eq!(response.headers()[RATE_LIMIT_ORIGIN], "global");
        assert!(response.body().is_empty());
        assert_eq!(Origin::of_response(&response), Some(Origin::Global));
        assert!(!is_remote_throttle(&response));
        assert_eq!(throttle.to_string(), "A throttled locally (global bucket), retry after 1.5s");
    }

    #[test]
    fn remote_throttle_has_no_origin_marker() {
        let mut response = Response::new(());
        *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
        assert!(is_remote_throttle(&response));
        assert_eq!(Origin::of_response(&response), None);

        let ok = Response::new(());
        assert!(!is_remote_throttle(&ok));
    }

    #[tokio::test]
    async fn remap_emits_event() {
        let (policy, _, sink) = policy(50);
        for (remaining, hash) in [(4, "h1"), (3, "h2")] {
            policy
                .admit_and_execute("A", false, || async move {
                    Ok::<_, io::Error>(limited(5, remaining, 1_010, hash))
                })
                .await
                .unwrap();
        }

        let remaps: Vec<_> = sink
            .events()
            .into_iter()
            .filter(|e| matches!(e, AdmissionEvent::BucketRemapped { .. }))
            .collect();
        let expected = AdmissionEvent::BucketRemapped {
            route: "A".into(),
            from: "h1".into(),
            to: "h2".into(),
        };
        assert_eq!(remaps, vec![expected]);
    }
}
