//! Collaborator interfaces (§6): the small capability traits the core
//! depends on for database access, outbound HTTP, caching, rate
//! limiting, public-ID encoding, and logging, plus in-memory reference
//! implementations used by tests and local/dev runs.
//!
//! Grounded on the teacher's `WorkflowStorage`/`ExecutionStorage` trait
//! pair in `n8n-core/src/storage.rs` (async trait + `Arc<RwLock<HashMap<..>>>`
//! in-memory backing) and `n8n-db/src/storage.rs`'s repository-over-pool
//! shape, generalized from "store a workflow/run" to the five
//! collaborator shapes §6 names.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::RwLock;

use flowcore_workflow::context::DeadlineCtx;
use flowcore_workflow::value::Value;

#[derive(Debug, Clone, Error)]
pub enum CollabError {
    #[error("{0}")]
    Other(String),
    #[error("operation timed out or was canceled")]
    Canceled,
}

/// `execute_query(ctx, database, sql, params, opts) -> (rows, rows_affected)`.
#[async_trait]
pub trait Db: Send + Sync {
    async fn execute_query(
        &self,
        ctx: &DeadlineCtx,
        database: &str,
        sql: &str,
        params: &BTreeMap<String, Value>,
        opts: &QueryOpts,
    ) -> Result<(Vec<BTreeMap<String, Value>>, u64), CollabError>;
}

#[derive(Debug, Clone, Default)]
pub struct QueryOpts {
    pub isolation: Option<String>,
    pub lock_timeout_ms: Option<u64>,
    pub deadlock_priority: Option<String>,
    pub json_columns: Vec<String>,
}

/// `do(request) -> (status, headers, body)`.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn do_request(
        &self,
        ctx: &DeadlineCtx,
        req: HttpRequest,
    ) -> Result<HttpResponse, CollabError>;
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// `get(workflow, key) -> (rows, hit)`; `set(workflow, key, rows, ttl) -> bool`.
#[async_trait]
pub trait StepCache: Send + Sync {
    async fn get(
        &self,
        workflow: &str,
        key: &str,
    ) -> Result<Option<Vec<BTreeMap<String, Value>>>, CollabError>;

    async fn set(
        &self,
        workflow: &str,
        key: &str,
        rows: Vec<BTreeMap<String, Value>>,
        ttl: Duration,
    ) -> Result<bool, CollabError>;
}

/// `get(workflow, key) -> (body, status, hit)`; `set(workflow, key, body, status, ttl) -> bool`.
#[async_trait]
pub trait TriggerCache: Send + Sync {
    async fn get(&self, workflow: &str, key: &str) -> Result<Option<(String, u16)>, CollabError>;

    async fn set(
        &self,
        workflow: &str,
        key: &str,
        body: String,
        status: u16,
        ttl: Duration,
    ) -> Result<bool, CollabError>;
}

/// `check(limits, context{ip, params, headers, query, cookies}) -> (allowed, retry_after_sec)`.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(
        &self,
        limits: &RateLimitPolicy,
        context: &RateLimitContext,
    ) -> Result<RateLimitDecision, CollabError>;
}

#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    pub key: String,
    pub requests_per_second: f64,
    pub burst: u32,
}

#[derive(Debug, Clone, Default)]
pub struct RateLimitContext {
    pub ip: String,
    pub params: BTreeMap<String, Value>,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub retry_after_sec: u64,
}

/// `encode(namespace, int64) -> string`; `decode(namespace, string) -> int64`.
pub trait PublicIdCodec: Send + Sync {
    fn encode(&self, namespace: &str, value: i64) -> String;
    fn decode(&self, namespace: &str, value: &str) -> Result<i64, CollabError>;
}

// ---------------------------------------------------------------------
// In-memory reference implementations.
// ---------------------------------------------------------------------

/// A row-store `Db` implementation for tests: tables are pre-seeded and
/// `execute_query` is a dumb full-table scan keyed by the SQL string
/// verbatim (tests register the exact statement they expect to see
/// rendered, mirroring the teacher's `MemoryWorkflowStorage` HashMap
/// lookup-by-key approach rather than parsing SQL).
#[derive(Default)]
pub struct MemoryDb {
    responses: RwLock<BTreeMap<String, (Vec<BTreeMap<String, Value>>, u64)>>,
    calls: AtomicU64,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, sql: &str, rows: Vec<BTreeMap<String, Value>>, rows_affected: u64) {
        self.responses
            .write()
            .await
            .insert(sql.to_string(), (rows, rows_affected));
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Db for MemoryDb {
    async fn execute_query(
        &self,
        _ctx: &DeadlineCtx,
        _database: &str,
        sql: &str,
        _params: &BTreeMap<String, Value>,
        _opts: &QueryOpts,
    ) -> Result<(Vec<BTreeMap<String, Value>>, u64), CollabError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .responses
            .read()
            .await
            .get(sql)
            .cloned()
            .unwrap_or_default())
    }
}

/// An in-process, TTL-less `StepCache`/`TriggerCache` implementation
/// backed by `dashmap`, matching the teacher's choice of `dashmap` for
/// concurrent in-process state (`Cargo.toml`'s `dashmap = "5.5"`).
#[derive(Default)]
pub struct MemoryCache {
    step: DashMap<String, Vec<BTreeMap<String, Value>>>,
    trigger: DashMap<String, (String, u16)>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(workflow: &str, key: &str) -> String {
        format!("{workflow}:{key}")
    }
}

#[async_trait]
impl StepCache for MemoryCache {
    async fn get(
        &self,
        workflow: &str,
        key: &str,
    ) -> Result<Option<Vec<BTreeMap<String, Value>>>, CollabError> {
        Ok(self.step.get(&Self::key(workflow, key)).map(|v| v.clone()))
    }

    async fn set(
        &self,
        workflow: &str,
        key: &str,
        rows: Vec<BTreeMap<String, Value>>,
        _ttl: Duration,
    ) -> Result<bool, CollabError> {
        self.step.insert(Self::key(workflow, key), rows);
        Ok(true)
    }
}

#[async_trait]
impl TriggerCache for MemoryCache {
    async fn get(&self, workflow: &str, key: &str) -> Result<Option<(String, u16)>, CollabError> {
        Ok(self.trigger.get(&Self::key(workflow, key)).map(|v| v.clone()))
    }

    async fn set(
        &self,
        workflow: &str,
        key: &str,
        body: String,
        status: u16,
        _ttl: Duration,
    ) -> Result<bool, CollabError> {
        self.trigger.insert(Self::key(workflow, key), (body, status));
        Ok(true)
    }
}

/// A token-bucket rate limiter keyed by `RateLimitPolicy::key`,
/// mirroring the teacher's `parking_lot::Mutex<HashMap<..>>` choice for
/// in-memory concurrent counters.
pub struct TokenBucketRateLimiter {
    buckets: Mutex<BTreeMap<String, Bucket>>,
}

struct Bucket {
    tokens: f64,
    last_refill: std::time::Instant,
}

impl Default for TokenBucketRateLimiter {
    fn default() -> Self {
        TokenBucketRateLimiter {
            buckets: Mutex::new(BTreeMap::new()),
        }
    }
}

impl TokenBucketRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimiter for TokenBucketRateLimiter {
    async fn check(
        &self,
        limits: &RateLimitPolicy,
        _context: &RateLimitContext,
    ) -> Result<RateLimitDecision, CollabError> {
        let mut buckets = self.buckets.lock();
        let now = std::time::Instant::now();
        let bucket = buckets.entry(limits.key.clone()).or_insert_with(|| Bucket {
            tokens: limits.burst as f64,
            last_refill: now,
        });
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * limits.requests_per_second)
            .min(limits.burst as f64);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(RateLimitDecision {
                allowed: true,
                retry_after_sec: 0,
            })
        } else {
            let deficit = 1.0 - bucket.tokens;
            let wait = if limits.requests_per_second > 0.0 {
                (deficit / limits.requests_per_second).ceil() as u64
            } else {
                1
            };
            Ok(RateLimitDecision {
                allowed: false,
                retry_after_sec: wait.max(1),
            })
        }
    }
}

/// A reversible, non-cryptographic integer<->string codec per
/// namespace: XORs the integer with a namespace-derived mask and
/// appends a namespace-bound checksum before hex-encoding. Not a
/// security boundary (§6 design note) — just enough obfuscation that
/// raw row IDs aren't exposed verbatim. The checksum is what makes
/// namespaces mutually exclusive: an ID minted for namespace `X` has a
/// checksum computed over `X`, so decoding it against namespace `Y`
/// recomputes a different expected checksum and fails rather than
/// silently returning the wrong integer.
pub struct XorPublicIdCodec;

fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    for p in parts {
        hasher.update(p);
    }
    hasher.finalize().into()
}

fn namespace_mask(namespace: &str) -> u64 {
    let digest = sha256(&[namespace.as_bytes()]);
    u64::from_be_bytes(digest[0..8].try_into().unwrap())
}

fn checksum(namespace: &str, masked_bytes: &[u8; 8]) -> [u8; 4] {
    let digest = sha256(&[namespace.as_bytes(), masked_bytes]);
    digest[0..4].try_into().unwrap()
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn from_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

impl PublicIdCodec for XorPublicIdCodec {
    fn encode(&self, namespace: &str, value: i64) -> String {
        let mask = namespace_mask(namespace);
        let masked_bytes = ((value as u64) ^ mask).to_be_bytes();
        let check = checksum(namespace, &masked_bytes);
        let mut combined = Vec::with_capacity(12);
        combined.extend_from_slice(&masked_bytes);
        combined.extend_from_slice(&check);
        to_hex(&combined)
    }

    fn decode(&self, namespace: &str, value: &str) -> Result<i64, CollabError> {
        let bytes = from_hex(value)
            .ok_or_else(|| CollabError::Other(format!("invalid public id '{value}'")))?;
        if bytes.len() != 12 {
            return Err(CollabError::Other(format!("invalid public id '{value}'")));
        }
        let masked_bytes: [u8; 8] = bytes[0..8].try_into().unwrap();
        let given_check: [u8; 4] = bytes[8..12].try_into().unwrap();
        let expected = checksum(namespace, &masked_bytes);
        if given_check != expected {
            return Err(CollabError::Other(format!(
                "public id '{value}' does not belong to namespace '{namespace}'"
            )));
        }
        let mask = namespace_mask(namespace);
        let masked = u64::from_be_bytes(masked_bytes);
        Ok((masked ^ mask) as i64)
    }
}

/// Process-wide swappable handle for the public-ID encoder used by
/// `isValidPublicID` (§5/§9 "process-wide template encoder"). `install`
/// is the `Set...Encoder(value)` call; `teardown` is `Set...Encoder(nil)`.
static PUBLIC_ID_ENCODER: std::sync::OnceLock<Mutex<Option<Arc<dyn PublicIdCodec>>>> =
    std::sync::OnceLock::new();

fn encoder_slot() -> &'static Mutex<Option<Arc<dyn PublicIdCodec>>> {
    PUBLIC_ID_ENCODER.get_or_init(|| Mutex::new(None))
}

pub fn install_public_id_encoder(codec: Arc<dyn PublicIdCodec>) {
    *encoder_slot().lock() = Some(codec);
}

pub fn teardown_public_id_encoder() {
    *encoder_slot().lock() = None;
}

/// Validates a public ID against a namespace using the process-wide
/// installed encoder; `false` (never an error) when nothing is
/// installed or the value fails to decode.
pub fn is_valid_public_id(namespace: &str, value: &str) -> bool {
    let guard = encoder_slot().lock();
    match guard.as_ref() {
        Some(codec) => codec.decode(namespace, value).is_ok(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_db_tracks_call_count_and_seeded_rows() {
        let db = MemoryDb::new();
        let mut row = BTreeMap::new();
        row.insert("id".to_string(), Value::Int(1));
        db.seed("SELECT 1", vec![row], 0).await;

        let ctx = DeadlineCtx::no_timeout();
        let (rows, _) = db
            .execute_query(&ctx, "primary", "SELECT 1", &BTreeMap::new(), &QueryOpts::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(db.call_count(), 1);
    }

    #[tokio::test]
    async fn step_cache_roundtrips() {
        let cache = MemoryCache::new();
        assert!(cache.get("wf", "k").await.unwrap().is_none());
        cache
            .set("wf", "k", vec![BTreeMap::new()], Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get("wf", "k").await.unwrap().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rate_limiter_exhausts_burst_then_denies() {
        let limiter = TokenBucketRateLimiter::new();
        let policy = RateLimitPolicy {
            key: "ip:1.2.3.4".to_string(),
            requests_per_second: 0.0,
            burst: 1,
        };
        let ctx = RateLimitContext::default();
        let first = limiter.check(&policy, &ctx).await.unwrap();
        assert!(first.allowed);
        let second = limiter.check(&policy, &ctx).await.unwrap();
        assert!(!second.allowed);
        assert!(second.retry_after_sec >= 1);
    }

    #[test]
    fn public_id_roundtrips_and_rejects_cross_namespace() {
        let codec = XorPublicIdCodec;
        let encoded = codec.encode("users", 42);
        assert_eq!(codec.decode("users", &encoded).unwrap(), 42);
        assert!(codec.decode("orders", &encoded).is_err());

        install_public_id_encoder(Arc::new(XorPublicIdCodec));
        assert!(is_valid_public_id("users", &encoded));
        assert!(!is_valid_public_id("orders", &encoded));
        teardown_public_id_encoder();
        assert!(!is_valid_public_id("users", &encoded));
    }
}
