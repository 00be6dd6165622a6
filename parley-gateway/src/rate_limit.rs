//! Per-client request throttling.
//!
//! Every request is fingerprinted by caller identity and endpoint class. A
//! fingerprint may pass at most once per class interval; denied checks leave
//! the stored timestamp untouched.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use parley_common::RateLimitConfig;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::Instrument;

use crate::routes::ErrorResponse;

/// Text returned with every denied request.
pub const SLOW_DOWN: &str = "Slow down! You're sending too many requests!";

const FORWARDED_FOR: &str = "x-forwarded-for";

// ============================================================================
// Endpoint Classes
// ============================================================================

/// Operation class, each with its own minimum interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    General,
    Debug,
    /// Message sends, which may trigger upstream calls
    Api,
}

impl EndpointClass {
    /// Classify a request path. Slashes and spaces are ignored.
    pub fn from_path(path: &str) -> Self {
        let compact: String = path.chars().filter(|c| *c != '/' && *c != ' ').collect();
        if compact.ends_with("message") {
            Self::Api
        } else if compact.ends_with("debug") {
            Self::Debug
        } else {
            Self::General
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Debug => "debug",
            Self::Api => "api",
        }
    }
}

impl fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Minimum spacing between allowed requests, per class.
#[derive(Debug, Clone)]
pub struct RateLimitIntervals {
    pub general: Duration,
    pub debug: Duration,
    pub api: Duration,
}

impl RateLimitIntervals {
    pub fn longest(&self) -> Duration {
        self.general.max(self.debug).max(self.api)
    }

    pub fn for_class(&self, class: EndpointClass) -> Duration {
        match class {
            EndpointClass::General => self.general,
            EndpointClass::Debug => self.debug,
            EndpointClass::Api => self.api,
        }
    }
}

impl Default for RateLimitIntervals {
    fn default() -> Self {
        Self::from(&RateLimitConfig::default())
    }
}

impl From<&RateLimitConfig> for RateLimitIntervals {
    fn from(config: &RateLimitConfig) -> Self {
        Self {
            general: Duration::from_millis(config.general_ms),
            debug: Duration::from_millis(config.debug_ms),
            api: Duration::from_millis(config.api_ms),
        }
    }
}

/// Key under which a caller's last allowed request is remembered.
pub fn fingerprint(client: &str, class: EndpointClass) -> String {
    format!("{client}:{class}")
}

// ============================================================================
// Client Identity
// ============================================================================

/// Resolve the caller's address.
///
/// `X-Forwarded-For` is only trusted when the direct peer is a private
/// address, i.e. a reverse proxy on the local network.
pub fn resolve_client(peer: IpAddr, forwarded_for: Option<&str>) -> String {
    if is_private(peer) {
        let forwarded = forwarded_for
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|first| !first.is_empty());
        if let Some(client) = forwarded {
            return client.to_string();
        }
    }
    peer.to_string()
}

fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

// ============================================================================
// Limiter
// ============================================================================

/// Fingerprint → last allowed request.
pub struct RateLimiter {
    intervals: RateLimitIntervals,
    last_allowed: Mutex<HashMap<String, Instant>>,
}

impl RateLimiter {
    pub fn new(intervals: RateLimitIntervals) -> Self {
        Self {
            intervals,
            last_allowed: Mutex::new(HashMap::new()),
        }
    }

    pub fn intervals(&self) -> &RateLimitIntervals {
        &self.intervals
    }

    /// Returns true and records the request if the fingerprint is allowed.
    pub async fn check_and_mark(&self, fingerprint: &str, class: EndpointClass) -> bool {
        self.check_and_mark_at(fingerprint, class, Instant::now()).await
    }

    pub async fn check_and_mark_at(
        &self,
        fingerprint: &str,
        class: EndpointClass,
        now: Instant,
    ) -> bool {
        let interval = self.intervals.for_class(class);
        let mut last_allowed = self.last_allowed.lock().await;

        if let Some(previous) = last_allowed.get(fingerprint) {
            if now.saturating_duration_since(*previous) < interval {
                return false;
            }
        }
        last_allowed.insert(fingerprint.to_string(), now);
        true
    }

    /// Forget fingerprints idle for longer than `max_age`. Returns how many.
    ///
    /// `max_age` is raised to the longest class interval, so an entry is never
    /// dropped while it still blocks requests.
    pub async fn prune(&self, max_age: Duration) -> usize {
        self.prune_at(max_age, Instant::now()).await
    }

    pub async fn prune_at(&self, max_age: Duration, now: Instant) -> usize {
        let max_age = max_age.max(self.intervals.longest());
        let mut last_allowed = self.last_allowed.lock().await;
        let before = last_allowed.len();
        last_allowed.retain(|_, seen| now.saturating_duration_since(*seen) <= max_age);
        before - last_allowed.len()
    }

    pub async fn len(&self) -> usize {
        self.last_allowed.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.last_allowed.lock().await.is_empty()
    }
}

// ============================================================================
// Middleware
// ============================================================================

/// Throttle every request and tag it with a trace id.
///
/// Requests without connection info (e.g. driven directly through the
/// router) are treated as coming from loopback.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    request: Request,
    next: Next,
) -> Response {
    let peer_ip = peer
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let client = resolve_client(peer_ip, forwarded_for(request.headers()));
    let class = EndpointClass::from_path(request.uri().path());

    if !limiter.check_and_mark(&fingerprint(&client, class), class).await {
        tracing::warn!(client = %client, class = %class, "Request rejected: rate limited");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(ErrorResponse {
                error: SLOW_DOWN.into(),
                code: "rate_limited".into(),
            }),
        )
            .into_response();
    }

    let span = tracing::info_span!(
        "request",
        trace_id = %parley_common::logging::generate_trace_id(),
        method = %request.method(),
        class = %class,
    );
    next.run(request).instrument(span).await
}

fn forwarded_for(headers: &HeaderMap) -> Option<&str> {
    headers.get(FORWARDED_FOR).and_then(|v| v.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    fn limiter() -> RateLimiter {
        RateLimiter::new(RateLimitIntervals {
            general: Duration::from_millis(500),
            debug: Duration::from_secs(1),
            api: Duration::from_secs(5),
        })
    }

    #[tokio::test]
    async fn test_allowed_denied_then_allowed_after_interval() {
        let limiter = limiter();
        let fp = fingerprint("10.0.0.1", EndpointClass::Api);
        let start = Instant::now();

        assert!(limiter.check_and_mark_at(&fp, EndpointClass::Api, start).await);
        assert!(
            !limiter
                .check_and_mark_at(&fp, EndpointClass::Api, start + Duration::from_secs(1))
                .await
        );
        assert!(
            limiter
                .check_and_mark_at(&fp, EndpointClass::Api, start + Duration::from_secs(5))
                .await
        );
    }

    #[tokio::test]
    async fn test_denied_check_does_not_extend_window() {
        let limiter = limiter();
        let fp = fingerprint("10.0.0.1", EndpointClass::General);
        let start = Instant::now();

        assert!(limiter.check_and_mark_at(&fp, EndpointClass::General, start).await);
        assert!(
            !limiter
                .check_and_mark_at(&fp, EndpointClass::General, start + Duration::from_millis(400))
                .await
        );
        // Measured from the first allowed request, not the denied one.
        assert!(
            limiter
                .check_and_mark_at(&fp, EndpointClass::General, start + Duration::from_millis(600))
                .await
        );
    }

    #[tokio::test]
    async fn test_fingerprints_are_independent() {
        let limiter = limiter();
        let now = Instant::now();

        assert!(
            limiter
                .check_and_mark_at(&fingerprint("a", EndpointClass::Api), EndpointClass::Api, now)
                .await
        );
        assert!(
            limiter
                .check_and_mark_at(&fingerprint("a", EndpointClass::Debug), EndpointClass::Debug, now)
                .await
        );
        assert!(
            limiter
                .check_and_mark_at(&fingerprint("b", EndpointClass::Api), EndpointClass::Api, now)
                .await
        );
        assert_eq!(limiter.len().await, 3);
    }

    #[tokio::test]
    async fn test_concurrent_checks_admit_one() {
        let limiter = Arc::new(limiter());
        let now = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.check_and_mark_at("same", EndpointClass::Api, now).await
            }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 1);
    }

    #[tokio::test]
    async fn test_prune_evicts_idle_fingerprints() {
        let limiter = limiter();
        let start = Instant::now();
        limiter.check_and_mark_at("old", EndpointClass::General, start).await;
        limiter
            .check_and_mark_at("fresh", EndpointClass::General, start + Duration::from_secs(3000))
            .await;

        let pruned = limiter
            .prune_at(Duration::from_secs(3600), start + Duration::from_secs(3700))
            .await;
        assert_eq!(pruned, 1);
        assert_eq!(limiter.len().await, 1);
        // A pruned fingerprint starts over.
        assert!(
            limiter
                .check_and_mark_at("old", EndpointClass::General, start + Duration::from_secs(3700))
                .await
        );
    }

    #[tokio::test]
    async fn test_prune_keeps_fingerprints_inside_their_window() {
        let limiter = limiter();
        let start = Instant::now();
        let fp = fingerprint("10.0.0.1", EndpointClass::Api);
        assert!(limiter.check_and_mark_at(&fp, EndpointClass::Api, start).await);

        let later = start + Duration::from_secs(2);
        assert_eq!(limiter.prune_at(Duration::ZERO, later).await, 0);
        assert!(!limiter.check_and_mark_at(&fp, EndpointClass::Api, later).await);

        let expired = start + Duration::from_secs(6);
        assert_eq!(limiter.prune_at(Duration::ZERO, expired).await, 1);
    }

    #[test]
    fn test_endpoint_class_from_path() {
        assert_eq!(EndpointClass::from_path("/pw/chat/message"), EndpointClass::Api);
        assert_eq!(EndpointClass::from_path("/pw/chat/message/"), EndpointClass::Api);
        assert_eq!(EndpointClass::from_path("/pw/chat/debug"), EndpointClass::Debug);
        assert_eq!(EndpointClass::from_path("/pw/chat"), EndpointClass::General);
        assert_eq!(EndpointClass::from_path("/pw/chat/pop/top/1"), EndpointClass::General);
        assert_eq!(EndpointClass::from_path("/"), EndpointClass::General);
    }

    #[test]
    fn test_resolve_client_trusts_private_proxies_only() {
        let proxy = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 2));
        assert_eq!(
            resolve_client(proxy, Some("203.0.113.9, 10.0.0.1")),
            "203.0.113.9"
        );
        assert_eq!(resolve_client(proxy, None), "192.168.1.2");
        assert_eq!(resolve_client(proxy, Some(" ")), "192.168.1.2");

        let public = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7));
        assert_eq!(resolve_client(public, Some("203.0.113.9")), "198.51.100.7");

        let loopback6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
        assert_eq!(resolve_client(loopback6, Some("203.0.113.9")), "203.0.113.9");

        let unique_local = IpAddr::V6("fd00::1".parse().unwrap());
        assert_eq!(resolve_client(unique_local, Some("203.0.113.9")), "203.0.113.9");

        let global6 = IpAddr::V6("2001:db8::1".parse().unwrap());
        assert_eq!(resolve_client(global6, Some("203.0.113.9")), "2001:db8::1");
    }

    #[test]
    fn test_intervals_from_config() {
        let intervals = RateLimitIntervals::from(&RateLimitConfig::default());
        assert_eq!(intervals.for_class(EndpointClass::General), Duration::from_millis(500));
        assert_eq!(intervals.for_class(EndpointClass::Debug), Duration::from_secs(1));
        assert_eq!(intervals.for_class(EndpointClass::Api), Duration::from_secs(5));
    }
}
