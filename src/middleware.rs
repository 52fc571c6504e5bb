use crate::error::AdmissionError;
use crate::policy::AdmissionPolicy;
use crate::telemetry::{AdmissionEvent, NullSink};
use http::{Request, Response};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Request extension naming the route key a request is accounted under.
///
/// Requests without one are keyed by their URI path and are subject to the
/// global limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteKey {
    key: String,
    global: bool,
}

impl RouteKey {
    /// Key subject to the global limit.
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into(), global: true }
    }

    /// Key that bypasses the global limit.
    pub fn exempt(key: impl Into<String>) -> Self {
        Self { key: key.into(), global: false }
    }

    /// Route key the request is accounted under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// True when the request counts against the global limit.
    pub fn is_global(&self) -> bool {
        self.global
    }

    fn of<B>(req: &Request<B>) -> Self {
        req.extensions()
            .get::<RouteKey>()
            .cloned()
            .unwrap_or_else(|| RouteKey::new(req.uri().path()))
    }
}

/// A layer that puts an [`AdmissionPolicy`] in front of an HTTP client service.
#[derive(Clone, Debug)]
pub struct AdmissionLayer<S = NullSink> {
    policy: AdmissionPolicy<S>,
}

impl<S> AdmissionLayer<S> {
    /// Create a new admission layer. Services it produces share the policy's
    /// buckets.
    pub fn new(policy: AdmissionPolicy<S>) -> Self {
        Self { policy }
    }
}

impl<Inner, S: Clone> Layer<Inner> for AdmissionLayer<S> {
    type Service = AdmissionService<Inner, S>;

    fn layer(&self, service: Inner) -> Self::Service {
        AdmissionService { inner: service, policy: self.policy.clone() }
    }
}

/// Middleware service that admits or locally throttles each request.
///
/// Local denials come back as `Ok` with a synthesized 429 response; see
/// [`Origin::of_response`](crate::Origin::of_response) to tell them apart
/// from remote ones.
#[derive(Clone, Debug)]
pub struct AdmissionService<Inner, S = NullSink> {
    inner: Inner,
    policy: AdmissionPolicy<S>,
}

impl<Inner, S, ReqB, ResB> Service<Request<ReqB>> for AdmissionService<Inner, S>
where
    Inner: Service<Request<ReqB>, Response = Response<ResB>> + Clone + Send + 'static,
    Inner::Future: Send + 'static,
    Inner::Error: Send + 'static,
    S: Service<AdmissionEvent, Response = ()> + Send + Sync + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
    ReqB: Send + 'static,
    ResB: Default + Send + 'static,
{
    type Response = Response<ResB>;
    type Error = AdmissionError<Inner::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(AdmissionError::Transport)
    }

    fn call(&mut self, req: Request<ReqB>) -> Self::Future {
        let policy = self.policy.clone();
        // `poll_ready` readied `self.inner`; that instance must take the call.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let route = RouteKey::of(&req);

        Box::pin(async move {
            let admission = policy
                .admit_and_execute(route.key(), route.is_global(), move || inner.call(req))
                .await?;
            Ok(admission.into_response())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::headers::{RATE_LIMIT_BUCKET_ID, RATE_LIMIT_LIMIT, RATE_LIMIT_REMAINING};
    use crate::headers::{RATE_LIMIT_RESET, RETRY_AFTER};
    use crate::{AdmissionConfig, Origin};
    use http::{HeaderValue, StatusCode};
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::{service_fn, ServiceBuilder, ServiceExt};

    fn policy(capacity: u32) -> AdmissionPolicy {
        let config = AdmissionConfig::default().with_global_capacity(capacity).unwrap();
        AdmissionPolicy::new(config).with_clock(ManualClock::new(1_000_000))
    }

    #[tokio::test]
    async fn global_denial_is_a_synthesized_429() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let svc = ServiceBuilder::new().layer(AdmissionLayer::new(policy(1))).service_fn(
            move |_req: Request<()>| {
                c.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, Infallible>(Response::new(String::from("ok"))) }
            },
        );

        let first = svc.clone().oneshot(Request::new(())).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.body(), "ok");

        let second = svc.clone().oneshot(Request::new(())).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(Origin::of_response(&second), Some(Origin::Global));
        assert_eq!(second.headers()[RETRY_AFTER], "1.000");
        assert!(second.body().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn route_key_extension_selects_bucket_and_global_flag() {
        let policy = policy(1);
        let store = policy.store().clone();
        let svc = AdmissionLayer::new(policy).layer(service_fn(|_req: Request<()>| async {
            let mut response = Response::new(String::new());
            let h = response.headers_mut();
            h.insert(RATE_LIMIT_LIMIT, HeaderValue::from(2u32));
            h.insert(RATE_LIMIT_REMAINING, HeaderValue::from(0u32));
            h.insert(RATE_LIMIT_RESET, HeaderValue::from(1_005u64));
            h.insert(RATE_LIMIT_BUCKET_ID, HeaderValue::from_static("h1"));
            Ok::<_, Infallible>(response)
        }));

        let keyed = || {
            let mut req = Request::new(());
            req.extensions_mut().insert(RouteKey::exempt("GET /guilds/1"));
            req
        };

        // Exempt from global, so capacity 1 does not matter; the route bucket does.
        let first = svc.clone().oneshot(keyed()).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(store.route_identity("GET /guilds/1").as_deref(), Some("h1"));

        let second = svc.clone().oneshot(keyed()).await.unwrap();
        assert_eq!(Origin::of_response(&second), Some(Origin::Endpoint));
        assert_eq!(second.headers()[RETRY_AFTER], "5.000");
    }

    #[tokio::test]
    async fn transport_errors_surface_as_service_errors() {
        let svc = AdmissionLayer::new(policy(5)).layer(service_fn(|_req: Request<()>| async {
            Err::<Response<()>, _>(std::io::Error::new(std::io::ErrorKind::Other, "refused"))
        }));

        let err = svc.clone().oneshot(Request::new(())).await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(err.to_string(), "refused");
    }

    #[tokio::test]
    async fn readied_inner_service_takes_the_call() {
        let mut svc = ServiceBuilder::new()
            .layer(AdmissionLayer::new(policy(50)))
            .concurrency_limit(1)
            .service_fn(|_req: Request<()>| async {
                Ok::<_, Infallible>(Response::new(String::from("ok")))
            });

        for _ in 0..3 {
            let ready = ServiceExt::<Request<()>>::ready(&mut svc).await.unwrap();
            let call = ready.call(Request::new(()));
            let response = tokio::time::timeout(Duration::from_secs(2), call)
                .await
                .expect("call must not wait on a second permit")
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[test]
    fn route_key_defaults_to_path() {
        let req = Request::get("https://api.example.com/v10/users/@me").body(()).unwrap();
        let key = RouteKey::of(&req);
        assert_eq!(key.key(), "/v10/users/@me");
        assert!(key.is_global());
    }
}
