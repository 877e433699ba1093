//! # RPC Envelope
//!
//! The outer shape shared by every protocol handler: bounded body read,
//! bounded JSON decode, timestamp-window validation, and per-handler
//! token-bucket rate limiting, plus the correlation-id dedup cache the
//! maybeAct pipeline uses for idempotence.
//!
//! Enumerated failure kinds — payload too large, timestamp out of window,
//! TTL exhausted, rate limited, malformed — are ordinary return values
//! ([`EnvelopeError`] / [`RejectKind`]) counted in diagnostics; only host
//! runtime faults travel as `anyhow` errors and are caught at the
//! outermost handler frame.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::time::timeout;
use tracing::trace;

use crate::protocols::InboundStream;

/// Accepted clock drift for wire timestamps (5 minutes).
pub const MAX_TIMESTAMP_DRIFT_MS: u64 = 5 * 60 * 1000;

/// Wait for the first body chunk before giving up on a silent stream.
pub const FIRST_CHUNK_TIMEOUT: Duration = Duration::from_secs(5);

/// Idle gap after the first chunk treated as end-of-message. Works around
/// multiplexers that never surface remote-close as EOF.
pub const IDLE_GAP: Duration = Duration::from_millis(100);

/// Default time-to-live of a dedup cache entry.
pub const DEDUP_TTL: Duration = Duration::from_secs(30);

/// Default dedup cache capacity.
pub const DEDUP_MAX: usize = 1024;

/// Rejection categories surfaced in diagnostics counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectKind {
    PayloadTooLarge,
    TimestampBounds,
    TtlExpired,
    RateLimited,
    MalformedMessage,
}

/// Failure of the decode/validate layer. These are control flow, not
/// crashes: handlers translate them into benign responses.
#[derive(Debug)]
pub enum EnvelopeError {
    PayloadTooLarge { received: usize, max: usize },
    Malformed(String),
    StreamClosedEarly,
}

impl EnvelopeError {
    pub fn kind(&self) -> RejectKind {
        match self {
            EnvelopeError::PayloadTooLarge { .. } => RejectKind::PayloadTooLarge,
            EnvelopeError::Malformed(_) => RejectKind::MalformedMessage,
            EnvelopeError::StreamClosedEarly => RejectKind::MalformedMessage,
        }
    }
}

impl std::fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvelopeError::PayloadTooLarge { received, max } => {
                write!(f, "payload too large: {received} bytes (max {max})")
            }
            EnvelopeError::Malformed(detail) => write!(f, "malformed message: {detail}"),
            EnvelopeError::StreamClosedEarly => write!(f, "stream closed before any data"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// `|now - ts| <= max_drift`, both bounds inclusive.
pub fn validate_timestamp(ts_ms: u64, now_ms: u64, max_drift_ms: u64) -> bool {
    now_ms.abs_diff(ts_ms) <= max_drift_ms
}

/// Accumulate the inbound body, aborting as soon as the running total would
/// exceed `max_bytes`. The first chunk may take up to [`FIRST_CHUNK_TIMEOUT`];
/// after that an idle gap longer than [`IDLE_GAP`] ends the message.
pub async fn read_all_bounded(
    stream: &mut dyn InboundStream,
    max_bytes: usize,
) -> Result<Vec<u8>, EnvelopeError> {
    let mut body: Vec<u8> = Vec::new();
    let mut first = true;
    loop {
        let wait = if first { FIRST_CHUNK_TIMEOUT } else { IDLE_GAP };
        let chunk = match timeout(wait, stream.next_chunk()).await {
            Err(_elapsed) if first => return Err(EnvelopeError::StreamClosedEarly),
            Err(_elapsed) => break,
            Ok(Err(e)) => return Err(EnvelopeError::Malformed(e.to_string())),
            Ok(Ok(None)) => break,
            Ok(Ok(Some(chunk))) => chunk,
        };
        first = false;
        if body.len() + chunk.len() > max_bytes {
            return Err(EnvelopeError::PayloadTooLarge {
                received: body.len() + chunk.len(),
                max: max_bytes,
            });
        }
        body.extend_from_slice(&chunk);
    }
    if body.is_empty() {
        return Err(EnvelopeError::StreamClosedEarly);
    }
    Ok(body)
}

/// Bounded JSON decode: length check before parsing, parse errors mapped to
/// [`EnvelopeError::Malformed`].
pub fn decode_bounded<T: serde::de::DeserializeOwned>(
    bytes: &[u8],
    max_bytes: usize,
) -> Result<T, EnvelopeError> {
    if bytes.len() > max_bytes {
        return Err(EnvelopeError::PayloadTooLarge {
            received: bytes.len(),
            max: max_bytes,
        });
    }
    serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Malformed(e.to_string()))
}

/// Leaky bucket over a monotonic clock: capacity `C`, refill `rate`
/// tokens per second.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, rate_per_sec: f64) -> Self {
        TokenBucket {
            capacity: capacity as f64,
            rate: rate_per_sec.max(f64::MIN_POSITIVE),
            tokens: capacity as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token if available.
    pub fn try_take(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Milliseconds until the next whole token.
    pub fn retry_after_ms(&self) -> u64 {
        if self.tokens >= 1.0 {
            return 0;
        }
        (((1.0 - self.tokens) / self.rate) * 1000.0).ceil() as u64
    }
}

/// Bounded TTL cache with insertion-order eviction.
///
/// Keyed by correlation id on the maybeAct path and by peer id on the
/// announce path. On insert at capacity, expired entries are swept first;
/// if the cache is still full, the oldest-inserted entry goes.
#[derive(Debug)]
pub struct DedupCache<V> {
    max: usize,
    ttl: Duration,
    order: VecDeque<String>,
    entries: HashMap<String, (V, Instant)>,
}

impl<V: Clone> DedupCache<V> {
    pub fn new(max: usize, ttl: Duration) -> Self {
        DedupCache {
            max: max.max(1),
            ttl,
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fetch a live entry; an expired one is dropped and reported absent.
    pub fn get(&mut self, key: &str) -> Option<V> {
        let (_, expires) = self.entries.get(key)?;
        if *expires <= Instant::now() {
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key).map(|(v, _)| v.clone())
    }

    pub fn contains(&mut self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Insert or refresh. A refreshed key keeps its original position in
    /// the eviction order.
    pub fn insert(&mut self, key: &str, value: V) {
        let expires = Instant::now() + self.ttl;
        if self.entries.contains_key(key) {
            self.entries.insert(key.to_string(), (value, expires));
            return;
        }
        if self.entries.len() >= self.max {
            self.sweep_expired();
        }
        while self.entries.len() >= self.max {
            match self.order.pop_front() {
                Some(oldest) => {
                    if self.entries.remove(&oldest).is_some() {
                        trace!(key = %oldest, "dedup cache evicted oldest entry");
                    }
                }
                None => break,
            }
        }
        self.order.push_back(key.to_string());
        self.entries.insert(key.to_string(), (value, expires));
    }

    fn sweep_expired(&mut self) {
        let now = Instant::now();
        self.entries.retain(|_, (_, expires)| *expires > now);
        self.order.retain(|k| self.entries.contains_key(k));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;

    struct ChunkStream {
        chunks: Vec<Vec<u8>>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl InboundStream for ChunkStream {
        async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
            if self.chunks.is_empty() {
                // simulate a multiplexer that never reports EOF
                tokio::time::sleep(Duration::from_secs(60)).await;
                return Ok(None);
            }
            if let Some(delay) = self.delay {
                if self.chunks.len() == 1 {
                    tokio::time::sleep(delay).await;
                }
            }
            Ok(Some(self.chunks.remove(0)))
        }
    }

    #[tokio::test]
    async fn bounded_read_returns_exact_concatenation() {
        let mut stream = ChunkStream {
            chunks: vec![b"hello ".to_vec(), b"world".to_vec()],
            delay: None,
        };
        let body = read_all_bounded(&mut stream, 64).await.unwrap();
        assert_eq!(body, b"hello world");
    }

    #[tokio::test]
    async fn bounded_read_rejects_oversized_totals() {
        let mut stream = ChunkStream {
            chunks: vec![vec![0x41; 300], vec![0x41; 300]],
            delay: None,
        };
        match read_all_bounded(&mut stream, 512).await {
            Err(EnvelopeError::PayloadTooLarge { received, max }) => {
                assert_eq!(max, 512);
                assert!(received > 512);
            }
            other => panic!("expected payload-too-large, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn idle_gap_after_first_chunk_ends_the_message() {
        let mut stream = ChunkStream {
            chunks: vec![b"first".to_vec(), b"late".to_vec()],
            delay: Some(Duration::from_millis(250)),
        };
        let body = read_all_bounded(&mut stream, 64).await.unwrap();
        assert_eq!(body, b"first");
    }

    #[tokio::test]
    async fn silent_stream_is_closed_early() {
        tokio::time::pause();
        let mut stream = ChunkStream {
            chunks: vec![],
            delay: None,
        };
        let result = read_all_bounded(&mut stream, 64).await;
        assert!(matches!(result, Err(EnvelopeError::StreamClosedEarly)));
    }

    #[test]
    fn timestamp_window_is_inclusive() {
        let now = 1_700_000_000_000u64;
        assert!(validate_timestamp(now - 299_999, now, 300_000));
        assert!(validate_timestamp(now + 299_999, now, 300_000));
        assert!(validate_timestamp(now - 300_000, now, 300_000));
        assert!(!validate_timestamp(now - 300_001, now, 300_000));
        assert!(!validate_timestamp(now + 300_001, now, 300_000));
    }

    #[test]
    fn decode_bounded_separates_size_from_shape_errors() {
        let ok: Result<serde_json::Value, _> = decode_bounded(br#"{"a":1}"#, 64);
        assert!(ok.is_ok());

        let too_big: Result<serde_json::Value, _> = decode_bounded(&[0x41; 100], 64);
        assert!(matches!(too_big, Err(EnvelopeError::PayloadTooLarge { .. })));

        let garbage: Result<serde_json::Value, _> = decode_bounded(b"not json", 64);
        assert!(matches!(garbage, Err(EnvelopeError::Malformed(_))));
    }

    #[test]
    fn token_bucket_drains_and_reports_retry() {
        let mut bucket = TokenBucket::new(2, 0.001);
        assert!(bucket.try_take());
        assert!(bucket.try_take());
        assert!(!bucket.try_take());
        assert!(bucket.retry_after_ms() > 0);
    }

    #[test]
    fn token_bucket_refills_over_time() {
        let mut bucket = TokenBucket::new(1, 1000.0);
        assert!(bucket.try_take());
        std::thread::sleep(Duration::from_millis(5));
        assert!(bucket.try_take());
    }

    #[test]
    fn dedup_cache_returns_cached_values() {
        let mut cache: DedupCache<String> = DedupCache::new(8, Duration::from_secs(30));
        cache.insert("cid-1", "reply".into());
        assert_eq!(cache.get("cid-1"), Some("reply".into()));
        assert_eq!(cache.get("cid-2"), None);
    }

    #[test]
    fn dedup_cache_evicts_oldest_inserted_when_full() {
        let mut cache: DedupCache<u32> = DedupCache::new(3, Duration::from_secs(30));
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("c", 3);
        cache.insert("d", 4);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(2));
        assert_eq!(cache.get("d"), Some(4));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn dedup_cache_expires_entries() {
        let mut cache: DedupCache<u32> = DedupCache::new(8, Duration::from_millis(1));
        cache.insert("a", 1);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn dedup_cache_sweeps_expired_before_evicting_live() {
        let mut cache: DedupCache<u32> = DedupCache::new(2, Duration::from_millis(1));
        cache.insert("stale-1", 1);
        cache.insert("stale-2", 2);
        std::thread::sleep(Duration::from_millis(5));
        cache.insert("fresh", 3);
        assert_eq!(cache.get("fresh"), Some(3));
        assert!(cache.len() <= 2);
    }
}
