//! Axum middleware that admits or rejects requests through a limiter.
//!
//! ```ignore
//! let interceptor = Interceptor::new(registry.require("login")?);
//! let app = Router::new()
//!     .route("/auth/login", post(login))
//!     .route_layer(middleware::from_fn_with_state(interceptor, enforce));
//! ```

use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, FromRequestParts, RawPathParams, Request, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{debug, error, instrument};

use crate::ratelimit::{Decision, KeyInputs, RateLimiter};

const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";
const X_FORWARDED_FOR: &str = "x-forwarded-for";

const KEY_UNAVAILABLE: &str = "rate limit key unavailable";

/// Identity established by the host's authentication layer.
///
/// Insert it as a request extension before the interceptor runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedSubject(pub String);

/// Where the client address is read from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClientIpSource {
    /// The peer address of the connection
    #[default]
    ConnectInfo,
    /// The first `X-Forwarded-For` entry, falling back to the peer address.
    /// Only safe behind a proxy that overwrites the header.
    ForwardedFor,
}

impl ClientIpSource {
    fn resolve(self, parts: &Parts) -> Option<IpAddr> {
        let peer = || {
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0.ip())
        };

        match self {
            ClientIpSource::ConnectInfo => peer(),
            ClientIpSource::ForwardedFor => forwarded_for(&parts.headers).or_else(peer),
        }
    }
}

fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get(X_FORWARDED_FOR)?
        .to_str()
        .ok()?
        .split(',')
        .next()?
        .trim()
        .parse()
        .ok()
}

/// Middleware state binding one limiter to a route.
#[derive(Debug, Clone)]
pub struct Interceptor {
    limiter: RateLimiter,
    client_ip: ClientIpSource,
}

impl Interceptor {
    pub fn new(limiter: RateLimiter) -> Self {
        Self {
            limiter,
            client_ip: ClientIpSource::default(),
        }
    }

    pub fn with_client_ip(mut self, client_ip: ClientIpSource) -> Self {
        self.client_ip = client_ip;
        self
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    async fn key_inputs(&self, parts: &mut Parts) -> KeyInputs {
        let resource = match self.limiter.config().key.resource_param() {
            Some(param) => RawPathParams::from_request_parts(parts, &())
                .await
                .ok()
                .and_then(|params| {
                    params
                        .iter()
                        .find(|(name, _)| *name == param)
                        .map(|(_, value)| value.to_string())
                }),
            None => None,
        };

        KeyInputs {
            client_addr: self.client_ip.resolve(parts),
            subject: parts
                .extensions
                .get::<AuthenticatedSubject>()
                .map(|subject| subject.0.clone()),
            resource,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    message: &'a str,
    #[serde(rename = "retryAfter", skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

/// Admit the request through the interceptor's limiter or reject it.
///
/// Allowed responses carry the `X-RateLimit-*` headers. Denied requests
/// never reach the next stage and receive `429` with `Retry-After`. A
/// request whose key cannot be derived is rejected with `500`.
#[instrument(skip_all, fields(limiter = %interceptor.limiter.name(), path = %request.uri().path()))]
pub async fn enforce(
    State(interceptor): State<Interceptor>,
    request: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = request.into_parts();
    let inputs = interceptor.key_inputs(&mut parts).await;
    let request = Request::from_parts(parts, body);

    let limiter = &interceptor.limiter;
    let key = match limiter.key_for(&inputs) {
        Ok(key) => key,
        Err(e) => {
            error!(error = %e, "Failed to derive rate limit key");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, KEY_UNAVAILABLE, None);
        }
    };

    if !limiter.config().skip_failed_requests {
        let decision = limiter.admit(&key).await;
        if !decision.is_allowed() {
            return reject(limiter, &decision);
        }
        let mut response = next.run(request).await;
        apply_headers(response.headers_mut(), &decision);
        return response;
    }

    // Only successful responses are charged, so the attempt is recorded
    // after the downstream handler has answered.
    let preview = limiter.preview(&key).await;
    if !preview.is_allowed() {
        return reject(limiter, &preview);
    }

    let mut response = next.run(request).await;
    if response.status().as_u16() < 400 {
        let decision = limiter.admit(&key).await;
        apply_headers(response.headers_mut(), &decision);
    } else {
        debug!(key = %key, status = %response.status(), "Failed request not counted");
        apply_headers(response.headers_mut(), &preview);
    }
    response
}

fn reject(limiter: &RateLimiter, decision: &Decision) -> Response {
    let mut response = error_response(
        StatusCode::TOO_MANY_REQUESTS,
        &limiter.config().message,
        Some(decision.retry_after_secs),
    );
    let headers = response.headers_mut();
    apply_headers(headers, decision);
    headers.insert(header::RETRY_AFTER, HeaderValue::from(decision.retry_after_secs));
    response
}

fn error_response(status: StatusCode, message: &str, retry_after: Option<u64>) -> Response {
    let body = ErrorBody {
        error: ErrorDetail {
            message,
            retry_after,
        },
    };
    (status, Json(body)).into_response()
}

fn apply_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_epoch_secs()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::routing::post;
    use axum::{middleware, Router};
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::ratelimit::{KeyStrategy, LimiterConfig, SlidingWindow};
    use crate::store::testing::FailingStore;
    use crate::store::{MemoryWindowStore, WindowStore};

    const CLIENT: [u8; 4] = [1, 2, 3, 4];

    fn login_limiter(store: Arc<dyn WindowStore>, max_events: u64) -> RateLimiter {
        let config = LimiterConfig::new(
            "login",
            Duration::from_secs(15 * 60),
            max_events,
            KeyStrategy::ClientAddress,
            "Too many login attempts",
        );
        RateLimiter::new(config, SlidingWindow::new(store, Duration::from_millis(250)))
    }

    fn chat_limiter(store: Arc<dyn WindowStore>, max_events: u64) -> RateLimiter {
        let config = LimiterConfig::new(
            "chat",
            Duration::from_secs(60),
            max_events,
            KeyStrategy::SubjectAndResource {
                param: "persona_id".to_string(),
            },
            "Too many messages",
        );
        RateLimiter::new(config, SlidingWindow::new(store, Duration::from_millis(250)))
    }

    /// Router whose handlers count how often they run.
    fn app(interceptor: Interceptor, hits: Arc<AtomicUsize>) -> Router {
        let ok = {
            let hits = hits.clone();
            move || async move {
                hits.fetch_add(1, Ordering::SeqCst);
                "ok"
            }
        };
        let unauthorized = move || async move {
            hits.fetch_add(1, Ordering::SeqCst);
            StatusCode::UNAUTHORIZED
        };

        Router::new()
            .route("/login", post(ok.clone()))
            .route("/personas/{persona_id}/chat", post(ok))
            .route("/fail", post(unauthorized))
            .route_layer(middleware::from_fn_with_state(interceptor, enforce))
    }

    fn request(uri: &str) -> axum::http::request::Builder {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .extension(ConnectInfo(SocketAddr::from((CLIENT, 40000))))
    }

    fn header(response: &Response, name: &str) -> String {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_login_headers_then_rejection() {
        let hits = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(MemoryWindowStore::default());
        let app = app(Interceptor::new(login_limiter(store, 5)), hits.clone());
        let now_secs = chrono::Utc::now().timestamp();

        for remaining in (0..5).rev() {
            let response = app
                .clone()
                .oneshot(request("/login").body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(header(&response, X_RATELIMIT_LIMIT), "5");
            assert_eq!(header(&response, X_RATELIMIT_REMAINING), remaining.to_string());
            let reset: i64 = header(&response, X_RATELIMIT_RESET).parse().unwrap();
            assert!(reset >= now_secs + 15 * 60);
        }

        let response = app
            .clone()
            .oneshot(request("/login").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header(&response, X_RATELIMIT_REMAINING), "0");
        let retry_header: u64 = header(&response, "retry-after").parse().unwrap();

        let body = json_body(response).await;
        assert_eq!(body["error"]["message"], "Too many login attempts");
        let retry_after = body["error"]["retryAfter"].as_u64().unwrap();
        assert!(retry_after > 0 && retry_after <= 900);
        assert_eq!(retry_after, retry_header);

        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_store_failure_forwards() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(
            Interceptor::new(login_limiter(Arc::new(FailingStore), 1)),
            hits.clone(),
        );

        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(request("/login").body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(header(&response, X_RATELIMIT_REMAINING), "0");
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_missing_subject_fails_closed() {
        let hits = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(MemoryWindowStore::default());
        let app = app(Interceptor::new(chat_limiter(store, 5)), hits.clone());

        let response = app
            .oneshot(request("/personas/p1/chat").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = json_body(response).await;
        assert_eq!(body["error"]["message"], KEY_UNAVAILABLE);
        assert!(body["error"].get("retryAfter").is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_chat_keys_by_subject_and_persona() {
        let hits = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(MemoryWindowStore::default());
        let app = app(Interceptor::new(chat_limiter(store.clone(), 2)), hits);

        let send = |subject: &str, persona: &str| {
            request(&format!("/personas/{}/chat", persona))
                .extension(AuthenticatedSubject(subject.to_string()))
                .body(Body::empty())
                .unwrap()
        };

        for _ in 0..2 {
            let response = app.clone().oneshot(send("alice", "p1")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = app.clone().oneshot(send("alice", "p1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let response = app.clone().oneshot(send("alice", "p2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.clone().oneshot(send("bob", "p1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        assert_eq!(store.inspect("chat:alice:p1").await.unwrap().count, 3);
        assert_eq!(store.inspect("chat:bob:p1").await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_skip_failed_requests_counts_successes_only() {
        let hits = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(MemoryWindowStore::default());
        let limiter = login_limiter(store.clone(), 2);
        let limiter = RateLimiter::new(
            limiter.config().clone().skipping_failed_requests(),
            SlidingWindow::new(store.clone(), Duration::from_millis(250)),
        );
        let app = app(Interceptor::new(limiter), hits.clone());

        for _ in 0..4 {
            let response = app
                .clone()
                .oneshot(request("/fail").body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
        assert_eq!(store.inspect("login:1.2.3.4").await.unwrap().count, 0);

        for remaining in [1, 0] {
            let response = app
                .clone()
                .oneshot(request("/login").body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(header(&response, X_RATELIMIT_REMAINING), remaining.to_string());
        }

        let response = app
            .clone()
            .oneshot(request("/login").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(hits.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_forwarded_for_source() {
        let hits = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(MemoryWindowStore::default());
        let forwarded = Interceptor::new(login_limiter(store.clone(), 5))
            .with_client_ip(ClientIpSource::ForwardedFor);
        let app = app(forwarded, hits.clone());

        let response = app
            .oneshot(
                request("/login")
                    .header(X_FORWARDED_FOR, "203.0.113.7, 10.0.0.1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(store.inspect("login:203.0.113.7").await.unwrap().count, 1);
        assert_eq!(store.inspect("login:1.2.3.4").await.unwrap().count, 0);

        // The peer address wins unless forwarding is trusted.
        let app = self::app(Interceptor::new(login_limiter(store.clone(), 5)), hits);
        let response = app
            .oneshot(
                request("/login")
                    .header(X_FORWARDED_FOR, "203.0.113.7")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(store.inspect("login:1.2.3.4").await.unwrap().count, 1);
    }

    #[test]
    fn test_forwarded_for_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(forwarded_for(&headers), None);

        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("not-an-ip"));
        assert_eq!(forwarded_for(&headers), None);

        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static(" 2001:db8::1 , 10.0.0.1"));
        assert_eq!(forwarded_for(&headers), Some("2001:db8::1".parse().unwrap()));
    }
}
