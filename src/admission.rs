//! Token-bucket admission control, keyed by route class and client.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderName, HeaderValue, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::errors::AccessError;
use crate::settings::RateLimit;

const DEFAULT_CLASS: &str = "default";
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3_600);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    pub capacity: u32,
    pub refill_per_sec: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Allowed { remaining: u32 },
    Rejected { retry_after: Duration },
}

#[derive(Debug)]
struct Bucket {
    config: BucketConfig,
    permits: f64,
    last_refill: Instant,
    last_seen: Instant,
}

impl Bucket {
    fn full(config: BucketConfig, now: Instant) -> Self {
        Self {
            config,
            permits: f64::from(config.capacity),
            last_refill: now,
            last_seen: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let capacity = f64::from(self.config.capacity);
        self.permits = (self.permits + elapsed * self.config.refill_per_sec).min(capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    fn is_full_at(&self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.permits + elapsed * self.config.refill_per_sec >= f64::from(self.config.capacity)
    }
}

#[derive(Debug, Clone)]
struct RouteClass {
    name: String,
    prefix: String,
    config: BucketConfig,
}

pub struct AdmissionController {
    enabled: bool,
    default: BucketConfig,
    classes: Vec<RouteClass>,
    exempt: Vec<String>,
    trust_forwarded_for: bool,
    max_tracked_keys: usize,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl AdmissionController {
    pub fn new(cfg: &RateLimit) -> Self {
        let mut classes: Vec<RouteClass> = cfg
            .classes
            .iter()
            .map(|c| RouteClass {
                name: c.name.clone(),
                prefix: c.prefix.clone(),
                config: BucketConfig {
                    capacity: c.capacity,
                    refill_per_sec: c.refill_per_sec,
                },
            })
            .collect();
        // longest prefix first
        classes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

        Self {
            enabled: cfg.enabled,
            default: BucketConfig {
                capacity: cfg.capacity,
                refill_per_sec: cfg.refill_per_sec,
            },
            classes,
            exempt: cfg.exempt.clone(),
            trust_forwarded_for: cfg.trust_forwarded_for,
            max_tracked_keys: cfg.max_tracked_keys.max(1),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt.iter().any(|pattern| match pattern.strip_suffix('*') {
            Some(prefix) => path.starts_with(prefix),
            None => path == pattern,
        })
    }

    /// Bucket class for a request path: the longest matching class prefix, else the default.
    pub fn class_for(&self, path: &str) -> (&str, BucketConfig) {
        self.classes
            .iter()
            .find(|c| path.starts_with(&c.prefix))
            .map(|c| (c.name.as_str(), c.config))
            .unwrap_or((DEFAULT_CLASS, self.default))
    }

    pub fn try_acquire(&self, key: &str, config: BucketConfig) -> Admission {
        self.try_acquire_at(key, config, Instant::now())
    }

    /// Refill and take one permit in a single critical section.
    pub fn try_acquire_at(&self, key: &str, config: BucketConfig, now: Instant) -> Admission {
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);

        if !buckets.contains_key(key) && buckets.len() >= self.max_tracked_keys {
            evict(&mut buckets, self.max_tracked_keys, now);
        }
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::full(config, now));
        bucket.config = config;
        bucket.refill(now);
        bucket.last_seen = bucket.last_seen.max(now);

        if bucket.permits >= 1.0 {
            bucket.permits -= 1.0;
            Admission::Allowed {
                remaining: bucket.permits.floor() as u32,
            }
        } else if config.refill_per_sec > 0.0 {
            // clamp before converting: tiny rates overflow `Duration`
            let wait = ((1.0 - bucket.permits) / config.refill_per_sec)
                .min(MAX_RETRY_AFTER.as_secs_f64());
            Admission::Rejected {
                retry_after: Duration::from_secs_f64(wait),
            }
        } else {
            Admission::Rejected {
                retry_after: MAX_RETRY_AFTER,
            }
        }
    }

    /// Whole permits currently available for `key`, without consuming any.
    pub fn available(&self, key: &str) -> Option<u32> {
        let buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        buckets.get(key).map(|b| {
            let elapsed = Instant::now()
                .saturating_duration_since(b.last_refill)
                .as_secs_f64();
            (b.permits + elapsed * b.config.refill_per_sec)
                .min(f64::from(b.config.capacity))
                .floor() as u32
        })
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Make room for one more bucket: drop buckets that have refilled to capacity,
/// then the least recently seen ones.
fn evict(buckets: &mut HashMap<String, Bucket>, max: usize, now: Instant) {
    let before = buckets.len();
    buckets.retain(|_, b| !b.is_full_at(now));
    while buckets.len() >= max {
        let Some(oldest) = buckets
            .iter()
            .min_by_key(|(_, b)| b.last_seen)
            .map(|(k, _)| k.clone())
        else {
            break;
        };
        buckets.remove(&oldest);
    }
    tracing::debug!(evicted = before - buckets.len(), "Evicted rate-limit buckets");
}

/// Bucket key for the caller. `X-Forwarded-For` is only honoured behind a
/// trusted proxy, otherwise the peer address is used.
fn client_key<B>(request: &Request<B>, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(client) = forwarded {
            return client.to_string();
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Middleware: admit or reject each request before it reaches a handler.
pub async fn admission_gate(
    State(controller): State<Arc<AdmissionController>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if !controller.is_enabled() || controller.is_exempt(&path) {
        return next.run(request).await;
    }

    let (class, config) = controller.class_for(&path);
    let key = format!(
        "{class}:{}",
        client_key(&request, controller.trust_forwarded_for)
    );

    match controller.try_acquire(&key, config) {
        Admission::Allowed { remaining } => {
            let mut response = next.run(request).await;
            response.headers_mut().insert(
                HeaderName::from_static("x-ratelimit-remaining"),
                HeaderValue::from(remaining),
            );
            response
        }
        Admission::Rejected { retry_after } => {
            let retry_after_secs = retry_after.as_secs_f64().ceil().max(1.0) as u64;
            tracing::warn!(key = %key, path = %path, retry_after_secs, "Request rejected by admission control");
            AccessError::RateLimited {
                retry_after_secs,
                details: format!("bucket `{class}` exhausted"),
            }
            .into_response()
        }
    }
}
