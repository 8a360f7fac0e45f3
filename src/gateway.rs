//! Cache-aside front door
//!
//! Looks the request URL up in the response cache, and only on a miss parses
//! it and asks the renderer for fresh bytes. Successful renders are written
//! back to the cache in the background; errors never are.

use crate::{
    CachedResponse, Metrics, RenderError, RenderOutput, RenderRequest, RequestParser,
    ResponseCache, MAX_CACHE_TTL_SECONDS,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info};
use uuid::Uuid;

/// Produces rendered output for a request on behalf of a session key.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, key: &str, request: &RenderRequest)
        -> Result<RenderOutput, RenderError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl GatewayResponse {
    /// A successful render, fresh for `ttl_seconds` from `now`.
    ///
    /// The TTL is clamped to [`MAX_CACHE_TTL_SECONDS`].
    pub fn rendered(output: RenderOutput, ttl_seconds: u64, now: SystemTime) -> Self {
        let ttl_seconds = ttl_seconds.min(MAX_CACHE_TTL_SECONDS);
        let expires_at: DateTime<Utc> = expiry(now, ttl_seconds).into();

        Self {
            status: 200,
            headers: vec![
                (
                    "Cache-Control".to_string(),
                    format!("public, max-age={ttl_seconds}"),
                ),
                ("Content-Type".to_string(), output.content_type),
                ("Expires".to_string(), http_date(expires_at)),
            ],
            body: output.data,
        }
    }

    pub fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            headers: vec![
                ("Cache-Control".to_string(), "no-store".to_string()),
                (
                    "Content-Type".to_string(),
                    "text/plain; charset=utf-8".to_string(),
                ),
            ],
            body: message.as_bytes().to_vec(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

fn expiry(now: SystemTime, ttl_seconds: u64) -> SystemTime {
    let ttl = Duration::from_secs(ttl_seconds.min(MAX_CACHE_TTL_SECONDS));
    now.checked_add(ttl).unwrap_or(now)
}

fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// The cache key is the request URL exactly as the client sent it.
pub fn cache_key(request_url: &str) -> String {
    request_url.to_string()
}

pub struct CacheAsideGateway {
    parser: RequestParser,
    renderer: Arc<dyn Renderer>,
    cache: Arc<dyn ResponseCache>,
    session_key: String,
    metrics: Arc<Metrics>,
}

impl CacheAsideGateway {
    pub fn new(
        parser: RequestParser,
        renderer: Arc<dyn Renderer>,
        cache: Arc<dyn ResponseCache>,
        session_key: impl Into<String>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            parser,
            renderer,
            cache,
            session_key: session_key.into(),
            metrics,
        }
    }

    pub async fn handle(&self, request_url: &str) -> GatewayResponse {
        let request_id = Uuid::new_v4();
        let key = cache_key(request_url);

        if let Some(entry) = self.cache.get(&key).await {
            self.metrics.record_cache_lookup(true);
            debug!("[{}] Cache hit for {}", request_id, request_url);
            return entry.response;
        }
        self.metrics.record_cache_lookup(false);

        let request = match self.parser.parse(request_url) {
            Ok(request) => request,
            Err(e) => {
                self.metrics.parse_failures.increment(1);
                debug!("[{}] Rejected {}: {}", request_id, request_url, e);
                return GatewayResponse::error(e.status_code(), &e.to_string());
            }
        };

        info!(
            "[{}] Cache miss, rendering {} as {:?} ({}x{}@{}x)",
            request_id,
            request.target_url,
            request.output_format,
            request.width,
            request.height,
            request.scale
        );

        match self.renderer.render(&self.session_key, &request).await {
            Ok(output) => {
                let now = SystemTime::now();
                let ttl = request.cache_ttl_seconds;
                let response = GatewayResponse::rendered(output, ttl, now);

                let entry = CachedResponse {
                    response: response.clone(),
                    expires_at: expiry(now, ttl),
                };
                let cache = self.cache.clone();
                tokio::spawn(async move {
                    cache.put(key, entry).await;
                });

                response
            }
            Err(e) => {
                error!(
                    "[{}] Render of {} failed ({}): {}",
                    request_id,
                    request.target_url,
                    e.kind(),
                    e
                );
                GatewayResponse::error(e.status_code(), &e.to_string())
            }
        }
    }
}
