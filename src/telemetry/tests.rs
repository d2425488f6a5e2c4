use super::*;
use crate::keys::{KeyEnvironment, KeyRegistry, KeySettings, KeyStore, MemoryKeyStore, Owner, Plan};
use crate::store::MemoryCounterStore;
use chrono::Duration as ChronoDuration;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    fail: bool,
}

impl RecordingNotifier {
    fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(notification.clone());
        if self.fail {
            anyhow::bail!("broker down");
        }
        Ok(())
    }
}

struct Fixture {
    registry: KeyRegistry,
    counters: Arc<MemoryCounterStore>,
    log: Arc<MemoryUsageLog>,
    notifier: Arc<RecordingNotifier>,
    telemetry: UsageTelemetry,
}

fn fixture_with(notifier: RecordingNotifier) -> Fixture {
    let store = Arc::new(MemoryKeyStore::new());
    for (id, quota) in [("metered", Some(10)), ("large", Some(10_000)), ("unlimited", None)] {
        store
            .insert_plan(&Plan {
                id: id.to_string(),
                rate_limit: 100,
                burst_limit: None,
                quota,
            })
            .unwrap();
    }
    let registry = KeyRegistry::new(store.clone(), KeySettings::default());
    let counters = Arc::new(MemoryCounterStore::new());
    let log = Arc::new(MemoryUsageLog::new());
    let notifier = Arc::new(notifier);
    let telemetry = UsageTelemetry::new(
        counters.clone(),
        QuotaTracker::new(store),
        log.clone(),
        notifier.clone(),
        TelemetrySettings::default(),
    );
    Fixture {
        registry,
        counters,
        log,
        notifier,
        telemetry,
    }
}

fn fixture() -> Fixture {
    fixture_with(RecordingNotifier::default())
}

fn issue(f: &Fixture, plan: &str) -> String {
    f.registry
        .issue(Owner::User("u1".to_string()), plan, KeyEnvironment::Live)
        .unwrap()
        .record
        .id
}

fn applied(recorded: Recorded) -> Vec<Notification> {
    match recorded {
        Recorded::Applied(notifications) => notifications,
        Recorded::Duplicate => panic!("event unexpectedly treated as duplicate"),
    }
}

#[test]
fn test_thresholds_fire_once_per_crossing() {
    let f = fixture();
    let key = issue(&f, "large");
    let now = Utc::now();

    let mut fired = Vec::new();
    for call in 1..=10_005u64 {
        let event = UsageEvent::new(&key, "GET /v1/items", 200, now);
        for n in applied(f.telemetry.record(&event).unwrap()) {
            fired.push((call, n.kind));
        }
    }

    assert_eq!(
        fired,
        vec![
            (9_000, NotificationKind::UsageThreshold),
            (10_000, NotificationKind::QuotaExceeded),
        ]
    );
}

#[test]
fn test_threshold_payload_and_owner() {
    let f = fixture();
    let key = issue(&f, "metered");
    let now = Utc::now();

    let mut notifications = Vec::new();
    for _ in 0..9 {
        let event = UsageEvent::new(&key, "GET /v1/items", 200, now);
        notifications.extend(applied(f.telemetry.record(&event).unwrap()));
    }

    assert_eq!(notifications.len(), 1);
    let n = &notifications[0];
    assert_eq!(n.kind, NotificationKind::UsageThreshold);
    assert_eq!(n.owner, Some(Owner::User("u1".to_string())));
    assert_eq!(n.payload["used"], 9);
    assert_eq!(n.payload["quota"], 10);
    assert_eq!(n.payload["remaining"], 1);
}

#[test]
fn test_threshold_fires_again_after_reset() {
    let f = fixture();
    let key = issue(&f, "metered");
    let now = Utc::now();
    let tracker = QuotaTracker::new(f.registry.store().clone());

    let count_thresholds = |f: &Fixture| {
        let mut count = 0;
        for _ in 0..9 {
            let event = UsageEvent::new(&key, "GET /v1/items", 200, now);
            count += applied(f.telemetry.record(&event).unwrap())
                .iter()
                .filter(|n| n.kind == NotificationKind::UsageThreshold)
                .count();
        }
        count
    };

    assert_eq!(count_thresholds(&f), 1);
    tracker.reset_at(&key, now + ChronoDuration::days(40)).unwrap();
    assert_eq!(count_thresholds(&f), 1);
}

#[test]
fn test_duplicate_event_is_not_counted_twice() {
    let f = fixture();
    let key = issue(&f, "metered");
    let event = UsageEvent::new(&key, "GET /v1/items", 200, Utc::now());

    assert!(matches!(f.telemetry.record(&event).unwrap(), Recorded::Applied(_)));
    assert!(matches!(f.telemetry.record(&event).unwrap(), Recorded::Duplicate));

    let record = f.registry.store().get(&key).unwrap().unwrap();
    assert_eq!(record.usage_count, 1);
    assert_eq!(f.log.events().len(), 1);
}

/// Counter store whose first `increment` calls fail.
struct FlakyCounterStore {
    inner: MemoryCounterStore,
    failures_left: AtomicUsize,
}

impl CounterStore for FlakyCounterStore {
    fn record_in_window(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        ttl_ms: i64,
    ) -> Result<u64, StoreError> {
        self.inner.record_in_window(key, now_ms, window_ms, ttl_ms)
    }
    fn count_in_window(&self, key: &str, now_ms: i64, window_ms: i64) -> Result<u64, StoreError> {
        self.inner.count_in_window(key, now_ms, window_ms)
    }
    fn increment(&self, key: &str, now_ms: i64, ttl_ms: i64) -> Result<u64, StoreError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Unavailable("connection reset".to_string()));
        }
        self.inner.increment(key, now_ms, ttl_ms)
    }
    fn get(&self, key: &str, now_ms: i64) -> Result<Option<u64>, StoreError> {
        self.inner.get(key, now_ms)
    }
    fn set_if_absent(&self, key: &str, now_ms: i64, ttl_ms: i64) -> Result<bool, StoreError> {
        self.inner.set_if_absent(key, now_ms, ttl_ms)
    }
    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.inner.remove(key)
    }
    fn push_capped(
        &self,
        key: &str,
        value: f64,
        cap: usize,
        now_ms: i64,
        ttl_ms: i64,
    ) -> Result<usize, StoreError> {
        self.inner.push_capped(key, value, cap, now_ms, ttl_ms)
    }
    fn samples(&self, key: &str, now_ms: i64) -> Result<Vec<f64>, StoreError> {
        self.inner.samples(key, now_ms)
    }
    fn purge_expired(&self, now_ms: i64) -> usize {
        self.inner.purge_expired(now_ms)
    }
}

#[test]
fn test_failed_event_is_retried_on_redelivery() {
    let f = fixture();
    let key = issue(&f, "metered");
    let counters = Arc::new(FlakyCounterStore {
        inner: MemoryCounterStore::new(),
        failures_left: AtomicUsize::new(1),
    });
    let telemetry = UsageTelemetry::new(
        counters.clone(),
        QuotaTracker::new(f.registry.store().clone()),
        f.log.clone(),
        f.notifier.clone(),
        TelemetrySettings::default(),
    );
    let event = UsageEvent::new(&key, "GET /v1/items", 200, Utc::now());
    let now_ms = event.timestamp.timestamp_millis();

    assert!(matches!(
        telemetry.record(&event),
        Err(TelemetryError::Store(StoreError::Unavailable(_)))
    ));
    assert!(matches!(telemetry.record(&event).unwrap(), Recorded::Applied(_)));
    assert!(matches!(telemetry.record(&event).unwrap(), Recorded::Duplicate));

    assert_eq!(
        counters.get(&format!("usage:key:{}", key), now_ms).unwrap(),
        Some(1)
    );
    let record = f.registry.store().get(&key).unwrap().unwrap();
    assert_eq!(record.usage_count, 1);
    assert_eq!(f.log.events().len(), 1);
}

#[test]
fn test_counters_are_updated() {
    let f = fixture();
    let key = issue(&f, "unlimited");
    let ts = Utc::now();
    let now_ms = ts.timestamp_millis();

    for (status, latency) in [(200, 12), (200, 30), (404, 7)] {
        let mut event = UsageEvent::new(&key, "GET /v1/items", status, ts);
        event.latency_ms = latency;
        event.product_id = Some("catalog".to_string());
        f.telemetry.record(&event).unwrap();
    }

    let get = |k: String| f.counters.get(&k, now_ms).unwrap();
    assert_eq!(get(format!("usage:key:{}", key)), Some(3));
    assert_eq!(get("usage:product:catalog".to_string()), Some(3));
    assert_eq!(get(format!("usage:status:{}:200", key)), Some(2));
    assert_eq!(get(format!("usage:status:{}:404", key)), Some(1));
    assert_eq!(get(format!("usage:endpoint:{}:GET /v1/items", key)), Some(3));
    assert_eq!(
        get(format!("usage:day:{}:{}", key, ts.format("%Y%m%d"))),
        Some(3)
    );
    assert_eq!(
        f.telemetry.latency_samples(&key, ts).unwrap(),
        vec![12.0, 30.0, 7.0]
    );
}

#[test]
fn test_unknown_key_is_counted_without_quota() {
    let f = fixture();
    let event = UsageEvent::new("ghost", "GET /v1/items", 200, Utc::now());
    let notifications = applied(f.telemetry.record(&event).unwrap());
    assert!(notifications.is_empty());
    assert_eq!(
        f.counters
            .get("usage:key:ghost", event.timestamp.timestamp_millis())
            .unwrap(),
        Some(1)
    );
}

#[test]
fn test_error_rate_anomaly_fires_once_per_window() {
    let f = fixture();
    let key = issue(&f, "unlimited");
    let now = Utc::now();

    let statuses = [500, 502, 500, 503, 500, 500, 200, 200, 200, 200, 500, 500];
    let mut fired = Vec::new();
    for (i, status) in statuses.iter().enumerate() {
        let event = UsageEvent::new(&key, "POST /v1/orders", *status, now);
        for n in applied(f.telemetry.record(&event).unwrap()) {
            fired.push((i + 1, n));
        }
    }

    assert_eq!(fired.len(), 1);
    let (at, n) = &fired[0];
    assert_eq!(*at, 10);
    assert_eq!(n.kind, NotificationKind::ErrorRate);
    assert_eq!(n.payload["samples"], 10);
    assert_eq!(n.payload["errors"], 6);
    assert_eq!(n.owner, Some(Owner::User("u1".to_string())));
}

#[test]
fn test_error_rate_needs_minimum_samples_and_majority() {
    let f = fixture();
    let few = issue(&f, "unlimited");
    let half = issue(&f, "unlimited");
    let now = Utc::now();

    for _ in 0..9 {
        let event = UsageEvent::new(&few, "GET /v1/items", 500, now);
        assert!(applied(f.telemetry.record(&event).unwrap()).is_empty());
    }
    for status in [500, 200, 500, 200, 500, 200, 500, 200, 500, 200] {
        let event = UsageEvent::new(&half, "GET /v1/items", status, now);
        assert!(applied(f.telemetry.record(&event).unwrap()).is_empty());
    }
}

#[test]
fn test_errors_outside_window_are_ignored() {
    let f = fixture();
    let key = issue(&f, "unlimited");
    let start = Utc::now();

    for _ in 0..10 {
        let event = UsageEvent::new(&key, "GET /v1/items", 500, start);
        f.telemetry.record(&event).unwrap();
    }
    // Ten minutes later the old failures have aged out of the window
    let later = start + ChronoDuration::minutes(10);
    for _ in 0..10 {
        let event = UsageEvent::new(&key, "GET /v1/items", 200, later);
        assert!(applied(f.telemetry.record(&event).unwrap()).is_empty());
    }
}

#[tokio::test]
async fn test_process_survives_notifier_failure() {
    let f = fixture_with(RecordingNotifier::failing());
    let key = issue(&f, "metered");
    let now = Utc::now();

    let mut outcomes = Vec::new();
    for _ in 0..10 {
        outcomes.push(
            f.telemetry
                .process(UsageEvent::new(&key, "GET /v1/items", 200, now))
                .await,
        );
    }

    assert_eq!(outcomes[8], ProcessOutcome::Recorded { notifications: 1 });
    assert_eq!(outcomes[9], ProcessOutcome::Recorded { notifications: 1 });
    assert_eq!(f.notifier.sent().len(), 2);
    assert_eq!(f.registry.store().get(&key).unwrap().unwrap().usage_count, 10);
}

#[tokio::test]
async fn test_process_reports_duplicates() {
    let f = fixture();
    let key = issue(&f, "metered");
    let event = UsageEvent::new(&key, "GET /v1/items", 200, Utc::now());
    assert_eq!(
        f.telemetry.process(event.clone()).await,
        ProcessOutcome::Recorded { notifications: 0 }
    );
    assert_eq!(f.telemetry.process(event).await, ProcessOutcome::Duplicate);
}

#[tokio::test]
async fn test_workers_drain_queue() {
    let f = fixture();
    let key = issue(&f, "unlimited");
    let (emitter, rx) = UsageEmitter::channel(100);
    let handles = spawn_workers(f.telemetry.clone(), rx, 3);

    for _ in 0..25 {
        assert!(emitter.emit(UsageEvent::new(&key, "GET /v1/items", 200, Utc::now())));
    }
    drop(emitter);
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(f.log.count_for_key(&key).unwrap(), 25);
    assert_eq!(f.registry.store().get(&key).unwrap().unwrap().usage_count, 25);
}

#[tokio::test]
async fn test_full_queue_drops_events() {
    let (emitter, _rx) = UsageEmitter::channel(1);
    let event = UsageEvent::new("key-1", "GET /v1/items", 200, Utc::now());
    assert!(emitter.emit(event.clone()));
    assert!(!emitter.emit(event));
    assert_eq!(emitter.dropped(), 1);
}

#[test]
fn test_crossing() {
    assert!(crosses(8_999, 9_000, 10_000, 90.0));
    assert!(!crosses(9_000, 9_001, 10_000, 90.0));
    assert!(!crosses(8_998, 8_999, 10_000, 90.0));
    assert!(crosses(9, 10, 10, 100.0));
    assert!(!crosses(0, 1, 0, 90.0));
}
