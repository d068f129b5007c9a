use super::ApiError;
use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Client windows kept before expired ones are swept.
const SWEEP_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window request limiter keyed by client address.
///
/// A limit of 0 disables limiting.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    clients: DashMap<String, Window>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            clients: DashMap::new(),
        }
    }

    pub fn per_minute(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }

    /// Count one request from `client`. Over the limit, returns how long
    /// until the client's window resets.
    pub fn check(&self, client: &str) -> Result<(), Duration> {
        if self.limit == 0 {
            return Ok(());
        }
        if self.clients.len() > SWEEP_THRESHOLD {
            self.sweep();
        }

        let now = Instant::now();
        let mut window = self.clients.entry(client.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.duration_since(window.started) >= self.window {
            *window = Window {
                started: now,
                count: 0,
            };
        }
        if window.count >= self.limit {
            return Err(self.window.saturating_sub(now.duration_since(window.started)));
        }
        window.count += 1;
        Ok(())
    }

    fn sweep(&self) {
        let now = Instant::now();
        self.clients
            .retain(|_, window| now.duration_since(window.started) < self.window);
    }
}

/// Client identity: peer IP, or `unknown` when the server was not started
/// with connect info (e.g. in-process tests).
fn client_id(request: &Request) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Middleware rejecting requests over the limiter's budget with 429.
pub async fn enforce(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let client = client_id(&request);
    if let Err(retry_after) = limiter.check(&client) {
        debug!(client = %client, path = %request.uri().path(), "Rate limit exceeded");
        // Round up so clients never retry before the window resets
        let retry_after_secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
        return ApiError::TooManyRequests { retry_after_secs }.into_response();
    }
    next.run(request).await
}
