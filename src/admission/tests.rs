use super::*;
use crate::config::RuntimeConfig;
use crate::keys::{KeyEnvironment, KeySettings, KeyStore, MemoryKeyStore, SqliteKeyStore};
use crate::store::{CounterStore, MemoryCounterStore};
use chrono::TimeZone;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

/// Counter store that is always down.
struct DownCounterStore;

impl CounterStore for DownCounterStore {
    fn record_in_window(&self, _: &str, _: i64, _: i64, _: i64) -> Result<u64, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
    fn count_in_window(&self, _: &str, _: i64, _: i64) -> Result<u64, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
    fn increment(&self, _: &str, _: i64, _: i64) -> Result<u64, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
    fn get(&self, _: &str, _: i64) -> Result<Option<u64>, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
    fn set_if_absent(&self, _: &str, _: i64, _: i64) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
    fn remove(&self, _: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
    fn push_capped(
        &self,
        _: &str,
        _: f64,
        _: usize,
        _: i64,
        _: i64,
    ) -> Result<usize, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
    fn samples(&self, _: &str, _: i64) -> Result<Vec<f64>, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
    fn purge_expired(&self, _: i64) -> usize {
        0
    }
}

struct Fixture {
    pipeline: AdmissionPipeline,
    registry: KeyRegistry,
    runtime_config: SharedRuntimeConfig,
    rx: mpsc::Receiver<UsageEvent>,
}

fn fixture_with(counters: Arc<dyn CounterStore>) -> Fixture {
    fixture_on(
        Arc::new(MemoryKeyStore::new()),
        counters,
        Duration::from_millis(500),
    )
}

fn fixture_on(
    store: Arc<dyn KeyStore>,
    counters: Arc<dyn CounterStore>,
    store_timeout: Duration,
) -> Fixture {
    for (id, rate_limit, burst_limit) in [("standard", 100, Some(150)), ("tiny", 2, None)] {
        store
            .insert_plan(&Plan {
                id: id.to_string(),
                rate_limit,
                burst_limit,
                quota: Some(10_000),
            })
            .unwrap();
    }
    let registry = KeyRegistry::new(store, KeySettings::default());
    let runtime_config = Arc::new(RwLock::new(RuntimeConfig::default()));
    let (emitter, rx) = UsageEmitter::channel(16);
    let pipeline = AdmissionPipeline::new(
        registry.clone(),
        RateLimiter::new(counters, Duration::from_secs(5)),
        RateWindows::default(),
        runtime_config.clone(),
        store_timeout,
        emitter,
    );
    Fixture {
        pipeline,
        registry,
        runtime_config,
        rx,
    }
}

fn fixture() -> Fixture {
    fixture_with(Arc::new(MemoryCounterStore::new()))
}

fn owner() -> Owner {
    Owner::User("u1".to_string())
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap()
}

fn issue(f: &Fixture, plan: &str, env: KeyEnvironment, at: DateTime<Utc>) -> (String, String) {
    let issued = f.registry.issue_at(owner(), plan, env, at).unwrap();
    (issued.plaintext, issued.record.id)
}

fn key_headers(key: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("x-api-key", key.parse().unwrap());
    headers
}

fn request<'a>(headers: &'a HeaderMap, remote: [u8; 4]) -> AdmissionRequest<'a> {
    AdmissionRequest {
        headers,
        query: None,
        remote_addr: Some(IpAddr::V4(Ipv4Addr::from(remote))),
        method: "GET",
        path: "/v1/items",
    }
}

async fn admit(
    f: &Fixture,
    headers: &HeaderMap,
    now: DateTime<Utc>,
) -> Result<Admitted, Rejection> {
    f.pipeline.admit_at(request(headers, [10, 0, 0, 1]), now).await
}

#[tokio::test]
async fn test_missing_key() {
    let f = fixture();
    let err = admit(&f, &HeaderMap::new(), t0()).await.unwrap_err();
    assert_eq!(err.error, AdmissionError::KeyRequired);
    assert_eq!(err.error.code(), "API_KEY_REQUIRED");
    assert_eq!(err.error.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_malformed_and_unknown_keys() {
    let f = fixture();
    let (key, _) = issue(&f, "standard", KeyEnvironment::Live, t0());

    let err = admit(&f, &key_headers("not-a-key"), t0()).await.unwrap_err();
    assert_eq!(err.error, AdmissionError::MalformedKey);
    assert_eq!(err.error.code(), "INVALID_API_KEY");

    let (head, secret) = key.rsplit_once('.').unwrap();
    let wrong = format!("{}.{}", head, secret.chars().rev().collect::<String>());
    let err = admit(&f, &key_headers(&wrong), t0()).await.unwrap_err();
    assert_eq!(err.error, AdmissionError::InvalidKey);
    assert_eq!(err.error.code(), "INVALID_API_KEY");
}

#[tokio::test]
async fn test_valid_key_is_admitted_with_context() {
    let f = fixture();
    let (key, id) = issue(&f, "standard", KeyEnvironment::Live, t0());

    let admitted = admit(&f, &key_headers(&key), t0()).await.unwrap();
    assert_eq!(admitted.context.record.id, id);
    assert_eq!(admitted.context.owner, owner());
    assert_eq!(admitted.context.plan.id, "standard");
    assert_eq!(admitted.context.record.last_used_at, Some(t0()));

    // Written in the background
    let mut stored = None;
    for _ in 0..100 {
        stored = f.registry.store().get(&id).unwrap().unwrap().last_used_at;
        if stored.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(stored, Some(t0()));

    let rate = admitted.rate.unwrap();
    assert!(rate.allowed);
    assert_eq!(rate.limit, 150);
    assert_eq!(rate.retry_after, None);
}

#[tokio::test]
async fn test_bearer_and_query_keys() {
    let f = fixture();
    let (key, _) = issue(&f, "standard", KeyEnvironment::Live, t0());

    let mut headers = HeaderMap::new();
    headers.insert("authorization", format!("Bearer {}", key).parse().unwrap());
    assert!(admit(&f, &headers, t0()).await.is_ok());

    let query = format!("api_key={}", key);
    let empty = HeaderMap::new();
    let mut req = request(&empty, [10, 0, 0, 1]);
    req.query = Some(&query);
    assert!(f.pipeline.admit_at(req, t0()).await.is_ok());
}

#[tokio::test]
async fn test_ip_whitelist() {
    let f = fixture();
    let (key, id) = issue(&f, "standard", KeyEnvironment::Live, t0());
    let ips: BTreeSet<String> = ["10.0.0.1".to_string()].into_iter().collect();
    f.registry.set_ip_whitelist(&id, &owner(), ips).unwrap();
    let headers = key_headers(&key);

    assert!(f
        .pipeline
        .admit_at(request(&headers, [10, 0, 0, 1]), t0())
        .await
        .is_ok());

    let err = f
        .pipeline
        .admit_at(request(&headers, [10, 0, 0, 2]), t0())
        .await
        .unwrap_err();
    assert_eq!(err.error, AdmissionError::IpNotAllowed(Some("10.0.0.2".to_string())));
    assert_eq!(err.error.code(), "IP_NOT_ALLOWED");
    assert_eq!(err.error.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_forwarded_address_is_checked_against_whitelist() {
    let f = fixture();
    let (key, id) = issue(&f, "standard", KeyEnvironment::Live, t0());
    let ips: BTreeSet<String> = ["203.0.113.7".to_string()].into_iter().collect();
    f.registry.set_ip_whitelist(&id, &owner(), ips).unwrap();

    let mut headers = key_headers(&key);
    headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
    assert!(admit(&f, &headers, t0()).await.is_ok());
}

#[tokio::test]
async fn test_revocation_takes_precedence() {
    let f = fixture();
    let (key, id) = issue(&f, "tiny", KeyEnvironment::Live, t0());
    let ips: BTreeSet<String> = ["10.0.0.1".to_string()].into_iter().collect();
    f.registry.set_ip_whitelist(&id, &owner(), ips).unwrap();
    let headers = key_headers(&key);

    // Exhaust the rate limit from the allowed address
    for _ in 0..3 {
        let _ = admit(&f, &headers, t0()).await;
    }
    f.registry.revoke(&id, &owner()).unwrap();

    // Wrong address and rate limited, but revocation is what is reported
    let err = f
        .pipeline
        .admit_at(request(&headers, [10, 0, 0, 2]), t0())
        .await
        .unwrap_err();
    assert_eq!(err.error, AdmissionError::KeyRevoked);
    assert_eq!(err.error.code(), "API_KEY_REVOKED");
    assert!(err.rate.is_none());
}

#[tokio::test]
async fn test_sandbox_key_expires() {
    let f = fixture();
    let now = t0();
    let (expired, _) = issue(
        &f,
        "standard",
        KeyEnvironment::Sandbox,
        now - chrono::Duration::days(31),
    );
    let (fresh, _) = issue(
        &f,
        "standard",
        KeyEnvironment::Sandbox,
        now - chrono::Duration::days(29),
    );

    let err = admit(&f, &key_headers(&expired), now).await.unwrap_err();
    assert_eq!(err.error, AdmissionError::KeyExpired);
    assert_eq!(err.error.code(), "API_KEY_EXPIRED");
    assert!(admit(&f, &key_headers(&fresh), now).await.is_ok());
}

#[tokio::test]
async fn test_burst_allowance_end_to_end() {
    let f = fixture();
    let (key, _) = issue(&f, "standard", KeyEnvironment::Live, t0());
    let headers = key_headers(&key);

    for i in 0..150 {
        assert!(
            admit(&f, &headers, t0()).await.is_ok(),
            "request {} should be admitted",
            i + 1
        );
    }

    let rejection = admit(&f, &headers, t0()).await.unwrap_err();
    assert_eq!(rejection.error.code(), "RATE_LIMIT_EXCEEDED");
    match rejection.error {
        AdmissionError::RateLimitExceeded { retry_after, .. } => assert!(retry_after > 0),
        ref other => panic!("unexpected rejection {:?}", other),
    }

    let response = rejection.into_response();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let headers = response.headers();
    assert_eq!(headers[RateLimitHeaders::REMAINING], "0");
    assert!(headers.contains_key("retry-after"));
    assert!(headers.contains_key(RateLimitHeaders::RESET));
}

#[tokio::test]
async fn test_rate_limit_disabled_at_runtime() {
    let f = fixture();
    let (key, _) = issue(&f, "tiny", KeyEnvironment::Live, t0());
    let headers = key_headers(&key);
    f.runtime_config.write().unwrap().rate_limit_enabled = false;

    for _ in 0..5 {
        let admitted = admit(&f, &headers, t0()).await.unwrap();
        assert!(admitted.rate.is_none());
    }
}

#[tokio::test]
async fn test_global_ceiling_spans_keys() {
    let f = fixture();
    let (a, _) = issue(&f, "standard", KeyEnvironment::Live, t0());
    let (b, _) = issue(&f, "standard", KeyEnvironment::Live, t0());
    f.runtime_config.write().unwrap().global_limit_per_minute = Some(3);

    assert!(admit(&f, &key_headers(&a), t0()).await.is_ok());
    assert!(admit(&f, &key_headers(&b), t0()).await.is_ok());
    assert!(admit(&f, &key_headers(&a), t0()).await.is_ok());

    let err = admit(&f, &key_headers(&b), t0()).await.unwrap_err();
    assert_eq!(
        err.error,
        AdmissionError::RateLimitExceeded {
            scope: RateScope::Global,
            retry_after: 60
        }
    );
}

#[tokio::test]
async fn test_endpoint_ceiling() {
    let f = fixture();
    let (key, _) = issue(&f, "standard", KeyEnvironment::Live, t0());
    let headers = key_headers(&key);
    f.runtime_config.write().unwrap().endpoint_limit_per_minute = Some(1);

    assert!(admit(&f, &headers, t0()).await.is_ok());
    let err = admit(&f, &headers, t0()).await.unwrap_err();
    assert!(matches!(
        err.error,
        AdmissionError::RateLimitExceeded {
            scope: RateScope::Endpoint,
            ..
        }
    ));

    // A different path has its own ceiling
    let mut req = request(&headers, [10, 0, 0, 1]);
    req.path = "/v1/orders";
    assert!(f.pipeline.admit_at(req, t0()).await.is_ok());
}

#[tokio::test]
async fn test_counter_store_outage_fails_open_by_default() {
    let f = fixture_with(Arc::new(DownCounterStore));
    let (key, _) = issue(&f, "tiny", KeyEnvironment::Live, t0());

    let admitted = admit(&f, &key_headers(&key), t0()).await.unwrap();
    assert!(admitted.rate.is_none());
}

#[tokio::test]
async fn test_counter_store_outage_can_fail_closed() {
    let f = fixture_with(Arc::new(DownCounterStore));
    let (key, _) = issue(&f, "tiny", KeyEnvironment::Live, t0());
    f.runtime_config.write().unwrap().rate_limit_fail_open = false;

    let err = admit(&f, &key_headers(&key), t0()).await.unwrap_err();
    assert!(matches!(err.error, AdmissionError::Unavailable(_)));
    assert_eq!(err.error.code(), "SERVICE_UNAVAILABLE");
    assert_eq!(err.error.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_record_completion_enqueues() {
    let mut f = fixture();
    let event = UsageEvent::new("key-1", "GET /v1/items", 200, t0());
    assert!(f.pipeline.record_completion(event.clone()));
    assert_eq!(f.rx.try_recv().unwrap(), event);
}

#[test]
fn test_admitted_headers_have_no_retry_after() {
    let decision = Decision {
        allowed: true,
        scope: RateScope::Sustained,
        limit: 100,
        remaining: 42,
        reset_at: t0(),
        retry_after: None,
    };
    let mut headers = HeaderMap::new();
    headers.insert("retry-after", HeaderValue::from_static("5"));
    RateLimitHeaders::apply(&mut headers, &decision);

    assert_eq!(headers[RateLimitHeaders::LIMIT], "100");
    assert_eq!(headers[RateLimitHeaders::REMAINING], "42");
    assert_eq!(
        headers[RateLimitHeaders::RESET],
        t0().timestamp().to_string().as_str()
    );
    assert!(!headers.contains_key("retry-after"));
}

#[test]
fn test_error_body() {
    let response = AdmissionError::KeyExpired.into_response();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_admission_while_another_connection_holds_the_write_lock() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keys.db");
    let path = path.to_str().unwrap();
    let store = Arc::new(SqliteKeyStore::new(path).unwrap());
    let f = fixture_on(
        store,
        Arc::new(MemoryCounterStore::new()),
        Duration::from_millis(50),
    );
    let (key, id) = issue(&f, "standard", KeyEnvironment::Live, t0());

    let writer = rusqlite::Connection::open(path).unwrap();
    writer
        .execute_batch("BEGIN IMMEDIATE; UPDATE plans SET rate_limit = rate_limit;")
        .unwrap();

    let admitted = admit(&f, &key_headers(&key), t0()).await.unwrap();
    assert_eq!(admitted.context.record.id, id);
    assert_eq!(admitted.context.plan.id, "standard");

    writer.execute_batch("COMMIT;").unwrap();
}
