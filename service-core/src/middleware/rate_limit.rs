use crate::error::AppError;
use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use governor::{
    clock::{Clock, DefaultClock},
    state::keyed::DashMapStateStore,
    Quota, RateLimiter,
};
use std::{
    net::{IpAddr, SocketAddr},
    num::NonZeroU32,
    sync::Arc,
    time::Duration,
};

/// Rate limiter keyed by client IP address
pub type IpRateLimiter = Arc<RateLimiter<IpAddr, DashMapStateStore<IpAddr>, DefaultClock>>;

/// `attempts` requests per `window_seconds`, refilled evenly across the window.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitRule {
    pub attempts: u32,
    pub window_seconds: u64,
}

impl RateLimitRule {
    pub fn new(attempts: u32, window_seconds: u64) -> Self {
        Self {
            attempts,
            window_seconds,
        }
    }

    fn quota(&self) -> Quota {
        let attempts = NonZeroU32::new(self.attempts).unwrap_or(NonZeroU32::MIN);
        let period_ms = (self.window_seconds.max(1) * 1000) / u64::from(attempts.get());
        // A zero period is rejected by governor; clamp to one millisecond.
        let period = Duration::from_millis(period_ms.max(1));
        Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(attempts))
            .allow_burst(attempts)
    }
}

/// Create a keyed rate limiter (by IP)
pub fn create_ip_rate_limiter(rule: RateLimitRule) -> IpRateLimiter {
    Arc::new(RateLimiter::dashmap(rule.quota()))
}

/// Resolves the caller's address, preferring the first `x-forwarded-for` hop.
pub fn client_ip(request: &Request) -> Option<IpAddr> {
    let forwarded_ip = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .and_then(|s| s.trim().parse::<IpAddr>().ok());

    forwarded_ip.or_else(|| {
        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
    })
}

/// Middleware for IP-based rate limiting
pub async fn ip_rate_limit_middleware(
    State(limiter): State<IpRateLimiter>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    match client_ip(&request) {
        Some(ip) => match limiter.check_key(&ip) {
            Ok(_) => Ok(next.run(request).await),
            Err(negative) => {
                let wait_time = negative.wait_time_from(DefaultClock::default().now());
                tracing::warn!(ip = %ip, "Rate limit exceeded");
                Err(AppError::TooManyRequests(
                    "Too many requests. Please try again later.".to_string(),
                    Some(wait_time.as_secs()),
                ))
            }
        },
        None => {
            tracing::warn!("Could not determine IP for rate limiting");
            Ok(next.run(request).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::StatusCode, middleware::from_fn_with_state, routing::get, Router};
    use tower::ServiceExt;

    fn app(rule: RateLimitRule) -> Router {
        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(from_fn_with_state(
                create_ip_rate_limiter(rule),
                ip_rate_limit_middleware,
            ))
    }

    fn request_from(ip: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .uri("/")
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn burst_is_allowed_then_limited() {
        let app = app(RateLimitRule::new(2, 3600));

        for _ in 0..2 {
            let res = app.clone().oneshot(request_from("10.0.0.1")).await.unwrap();
            assert_eq!(res.status(), StatusCode::OK);
        }
        let res = app.clone().oneshot(request_from("10.0.0.1")).await.unwrap();
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn limits_are_per_ip() {
        let app = app(RateLimitRule::new(1, 3600));

        let res = app.clone().oneshot(request_from("10.0.0.1")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let res = app.clone().oneshot(request_from("10.0.0.2")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }
}
