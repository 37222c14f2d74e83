//! Tests for the tracking service

use super::*;
use crate::domain::error::StoreError;
use crate::domain::geo::Coordinate;
use crate::domain::types::{DeliveryStatus, StatusEvent, VehicleClass};
use crate::io::mapping_storage::NullStorage;
use crate::io::memory_store::MemoryStore;
use crate::io::sink::{create_tracking_channel, LocationUpdate, TrackingEvent};
use crate::services::channel_mapper::PoolAllocator;
use crate::services::eta::ProximityStatus;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;
use tokio::time::{sleep, Duration};

const T0: u64 = 1_700_000_000_000;

/// Sink that records every event
#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<TrackingEvent>>,
}

impl RecordingSink {
    fn locations(&self) -> Vec<LocationUpdate> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                TrackingEvent::Location { update, .. } => Some(update.clone()),
                _ => None,
            })
            .collect()
    }

    fn statuses(&self) -> Vec<StatusEvent> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                TrackingEvent::Status { status, .. } => Some(status.clone()),
                _ => None,
            })
            .collect()
    }

    fn errors(&self) -> Vec<TrackingError> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                TrackingEvent::Error { error, .. } => Some(error.clone()),
                _ => None,
            })
            .collect()
    }
}

impl TrackingSink for RecordingSink {
    fn on_location(&self, order_id: &OrderId, update: LocationUpdate) -> bool {
        self.events.lock().push(TrackingEvent::Location { order_id: order_id.clone(), update });
        true
    }

    fn on_status(&self, order_id: &OrderId, status: StatusEvent) -> bool {
        self.events.lock().push(TrackingEvent::Status { order_id: order_id.clone(), status });
        true
    }

    fn on_error(&self, order_id: &OrderId, error: TrackingError) -> bool {
        self.events.lock().push(TrackingEvent::Error { order_id: order_id.clone(), error });
        true
    }
}

struct Harness {
    service: TrackingService,
    store: Arc<MemoryStore>,
    config: Config,
}

fn harness() -> Harness {
    harness_with_mapper(OrderChannelMapper::in_memory())
}

fn harness_with_mapper(mapper: OrderChannelMapper) -> Harness {
    let config = Config::default();
    let store = Arc::new(MemoryStore::new());
    let service = TrackingService::new(
        config.clone(),
        store.clone(),
        Arc::new(mapper),
        Arc::new(EtaEstimator::default()),
        Arc::new(Metrics::new()),
    );
    Harness { service, store, config }
}

impl Harness {
    fn location_path(&self, session: &SessionHandle) -> String {
        let channel = session.channel_id().unwrap();
        self.config.location_path(channel.as_str())
    }

    fn status_path(&self, session: &SessionHandle) -> String {
        let channel = session.channel_id().unwrap();
        self.config.status_path(channel.as_str())
    }
}

fn destination() -> Coordinate {
    Coordinate::new(52.52, 13.405)
}

fn opts() -> SessionOptions {
    SessionOptions::new(destination())
}

fn location(lat: f64, lon: f64, timestamp_ms: u64) -> Value {
    json!({ "latitude": lat, "longitude": lon, "speed": 0, "timestamp": timestamp_ms })
}

async fn settle() {
    sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_start_reaches_receiving() {
    let h = harness();
    let sink = Arc::new(RecordingSink::default());
    let order = OrderId::new("order-1");

    let session = h.service.start(order.clone(), sink, opts()).await.unwrap();

    assert_eq!(session.state(), SessionState::Receiving);
    assert_eq!(h.service.session_state(&order), Some(SessionState::Receiving));
    assert_eq!(h.service.active_orders(), vec![order.clone()]);
    assert_eq!(h.store.feed_count(&h.location_path(&session)), 1);
    assert_eq!(h.store.feed_count(&h.status_path(&session)), 1);
    assert_eq!(h.service.mapper().channel_for(&order), session.channel_id());
}

#[tokio::test(start_paused = true)]
async fn test_location_is_enriched() {
    let h = harness();
    let sink = Arc::new(RecordingSink::default());
    let session = h
        .service
        .start(OrderId::new("order-2"), sink.clone(), opts().with_vehicle_class(VehicleClass::Car))
        .await
        .unwrap();

    // ~1.1 km north of the destination at 10 m/s
    h.store
        .set(
            &h.location_path(&session),
            json!({ "lat": 52.53, "lng": 13.405, "speed": 10.0, "timestamp": T0 }),
        )
        .await
        .unwrap();
    settle().await;

    let updates = sink.locations();
    assert_eq!(updates.len(), 1);
    let update = &updates[0];
    assert!((update.distance_km - 1.112).abs() < 0.01);
    assert!((update.speed_kmh - 36.0).abs() < 1e-9);
    assert_eq!(update.status, ProximityStatus::FastTransit);
    assert_eq!(update.eta_minutes, update.eta.minutes);
    assert!(update.eta_minutes >= 2);
}

#[tokio::test(start_paused = true)]
async fn test_speed_falls_back_to_history_average() {
    let h = harness();
    let sink = Arc::new(RecordingSink::default());
    let session = h.service.start(OrderId::new("order-avg"), sink.clone(), opts()).await.unwrap();
    let path = h.location_path(&session);

    h.store.set(&path, location(52.53, 13.405, T0)).await.unwrap();
    sleep(Duration::from_secs(6)).await;
    // ~111 m in 6 s, no reported speed
    h.store.set(&path, location(52.529, 13.405, T0 + 6000)).await.unwrap();
    settle().await;

    let updates = sink.locations();
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0].speed_kmh, 0.0);
    assert!((updates[1].speed_kmh - 66.7).abs() < 0.5, "got {}", updates[1].speed_kmh);
    assert_eq!(updates[1].status, ProximityStatus::FastTransit);
}

#[tokio::test(start_paused = true)]
async fn test_throttle_bounds_delivery_count() {
    let h = harness();
    let sink = Arc::new(RecordingSink::default());
    let session = h.service.start(OrderId::new("order-3"), sink.clone(), opts()).await.unwrap();
    let path = h.location_path(&session);

    // 100 samples, 100 ms apart, each moving ~110 m: 10 s of traffic
    for i in 0..100u64 {
        let lat = 52.60 - i as f64 * 0.001;
        h.store.set(&path, location(lat, 13.405, T0 + i * 100)).await.unwrap();
        sleep(Duration::from_millis(100)).await;
    }

    let delivered = sink.locations().len();
    let bound = 10_000u64.div_ceil(5000) as usize;
    assert!(delivered <= bound);
    assert_eq!(delivered, 2);
    assert_eq!(h.service.metrics().locations_throttled(), 98);
}

#[tokio::test(start_paused = true)]
async fn test_freshness_gate_suppresses_near_duplicates() {
    let h = harness();
    let sink = Arc::new(RecordingSink::default());
    let session = h
        .service
        .start(OrderId::new("order-4"), sink.clone(), opts().with_min_delivery_interval_ms(2000))
        .await
        .unwrap();
    let path = h.location_path(&session);

    h.store.set(&path, location(52.53, 13.41, T0)).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    // < 0.0001 deg on both axes, inside the window
    h.store.set(&path, location(52.53005, 13.41005, T0 + 100)).await.unwrap();
    sleep(Duration::from_millis(3000)).await;
    // Window elapsed, still a near-duplicate
    h.store.set(&path, location(52.53008, 13.41002, T0 + 3100)).await.unwrap();
    settle().await;
    assert_eq!(sink.locations().len(), 1);

    h.store.set(&path, location(52.531, 13.41, T0 + 3200)).await.unwrap();
    settle().await;
    assert_eq!(sink.locations().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_samples_are_dropped_silently() {
    let h = harness();
    let sink = Arc::new(RecordingSink::default());
    let session = h.service.start(OrderId::new("order-5"), sink.clone(), opts()).await.unwrap();
    let path = h.location_path(&session);

    h.store.set(&path, json!({ "latitude": 123.0, "longitude": 13.4 })).await.unwrap();
    h.store.set(&path, json!({ "latitude": "abc" })).await.unwrap();
    h.store.set(&path, json!(null)).await.unwrap();
    settle().await;

    assert!(sink.events.lock().is_empty());
    assert_eq!(session.state(), SessionState::Receiving);
}

#[tokio::test(start_paused = true)]
async fn test_status_delivered_unthrottled_and_deduplicated() {
    let h = harness();
    let sink = Arc::new(RecordingSink::default());
    let session = h.service.start(OrderId::new("order-6"), sink.clone(), opts()).await.unwrap();
    let path = h.status_path(&session);

    for label in ["assigned", "assigned", "picked_up", "in_transit", "in_transit", "assigned"] {
        h.store.set(&path, json!(label)).await.unwrap();
        settle().await;
    }

    let statuses: Vec<DeliveryStatus> = sink.statuses().into_iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![
            DeliveryStatus::Assigned,
            DeliveryStatus::PickedUp,
            DeliveryStatus::InTransit,
            DeliveryStatus::Assigned,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_existing_status_is_delivered_on_subscribe() {
    let h = harness();
    let order = OrderId::new("order-7");
    let channel = h.service.mapper().resolve(&order).unwrap();
    h.store
        .set(&h.config.status_path(channel.as_str()), json!({ "status": "pickedUp", "timestamp": T0 }))
        .await
        .unwrap();

    let sink = Arc::new(RecordingSink::default());
    h.service.start(order, sink.clone(), opts()).await.unwrap();
    settle().await;

    let statuses = sink.statuses();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].status, DeliveryStatus::PickedUp);
    assert_eq!(statuses[0].timestamp_ms, T0);
}

#[tokio::test(start_paused = true)]
async fn test_store_error_is_not_fatal() {
    let h = harness();
    let sink = Arc::new(RecordingSink::default());
    let session = h.service.start(OrderId::new("order-8"), sink.clone(), opts()).await.unwrap();
    let path = h.location_path(&session);

    h.store.inject_error(&path, StoreError::Connectivity("reset".to_string()));
    settle().await;
    h.store.set(&path, location(52.53, 13.41, T0)).await.unwrap();
    settle().await;

    assert_eq!(
        sink.errors(),
        vec![TrackingError::Store(StoreError::Connectivity("reset".to_string()))]
    );
    assert_eq!(sink.locations().len(), 1);
    assert_eq!(session.state(), SessionState::Receiving);
}

#[tokio::test(start_paused = true)]
async fn test_permanent_disconnect_stops_session() {
    let h = harness();
    let sink = Arc::new(RecordingSink::default());
    let order = OrderId::new("order-9");
    let session = h.service.start(order.clone(), sink.clone(), opts()).await.unwrap();

    h.store.disconnect(&h.location_path(&session), "permission revoked");
    settle().await;

    assert_eq!(
        sink.errors(),
        vec![TrackingError::Disconnected("permission revoked".to_string())]
    );
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(h.service.active_orders().is_empty());
    assert_eq!(h.service.session_state(&order), None);
    assert_eq!(h.store.feed_count(&h.status_path(&session)), 0);
    assert!(!h.service.stop(&order));
}

#[tokio::test(start_paused = true)]
async fn test_self_stopped_sessions_leave_the_registry() {
    let h = harness();
    let sink = Arc::new(RecordingSink::default());
    for i in 0..5 {
        let order = OrderId::new(format!("churn-{i}"));
        let session = h.service.start(order.clone(), sink.clone(), opts()).await.unwrap();
        h.store.disconnect(&h.status_path(&session), "revoked");
        settle().await;
        assert_eq!(h.service.session_state(&order), None);
    }

    let order = OrderId::new("handle-stopped");
    let session = h.service.start(order.clone(), sink.clone(), opts()).await.unwrap();
    assert!(session.stop());
    assert_eq!(h.service.session_state(&order), None);
    assert!(h.service.sessions.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_full_channel_does_not_swallow_status() {
    let h = harness();
    let (sink, mut events) = create_tracking_channel(1);
    let order = OrderId::new("order-full");
    let session = h.service.start(order.clone(), Arc::new(sink), opts()).await.unwrap();
    let status_path = h.status_path(&session);

    h.store.set(&status_path, json!("picked_up")).await.unwrap();
    settle().await;
    // Channel is full: refused and left uncommitted
    h.store.set(&status_path, json!("delivered")).await.unwrap();
    settle().await;

    match events.try_recv().unwrap() {
        TrackingEvent::Status { status, .. } => assert_eq!(status.status, DeliveryStatus::PickedUp),
        other => panic!("expected status, got {other:?}"),
    }
    assert!(events.try_recv().is_err());

    h.store.set(&status_path, json!("delivered")).await.unwrap();
    settle().await;
    match events.try_recv().unwrap() {
        TrackingEvent::Status { status, .. } => assert_eq!(status.status, DeliveryStatus::Delivered),
        other => panic!("expected status, got {other:?}"),
    }
    assert_eq!(h.service.metrics().statuses_delivered(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stop_is_idempotent_and_final() {
    let h = harness();
    let sink = Arc::new(RecordingSink::default());
    let order = OrderId::new("order-10");
    let session = h.service.start(order.clone(), sink.clone(), opts()).await.unwrap();
    let location_path = h.location_path(&session);
    let status_path = h.status_path(&session);

    assert!(session.stop());
    assert!(!session.stop());
    assert!(!h.service.stop(&order));
    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(h.store.feed_count(&location_path), 0);
    assert_eq!(h.store.feed_count(&status_path), 0);

    h.store.set(&location_path, location(52.53, 13.41, T0)).await.unwrap();
    h.store.set(&status_path, json!("arrived")).await.unwrap();
    settle().await;
    assert!(sink.events.lock().is_empty());
    assert!(!h.service.stop(&OrderId::new("unknown")));
}

#[tokio::test(start_paused = true)]
async fn test_restart_replaces_previous_session() {
    let h = harness();
    let order = OrderId::new("order-11");
    let first_sink = Arc::new(RecordingSink::default());
    let second_sink = Arc::new(RecordingSink::default());

    let first = h.service.start(order.clone(), first_sink.clone(), opts()).await.unwrap();
    let second = h.service.start(order.clone(), second_sink.clone(), opts()).await.unwrap();

    assert!(first.is_stopped());
    assert_eq!(second.state(), SessionState::Receiving);
    assert_eq!(first.channel_id(), second.channel_id());
    assert_eq!(h.service.active_orders(), vec![order]);
    assert_eq!(h.store.feed_count(&h.location_path(&second)), 1);

    h.store.set(&h.status_path(&second), json!("assigned")).await.unwrap();
    settle().await;
    assert!(first_sink.statuses().is_empty());
    assert_eq!(second_sink.statuses().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_resolution_failure_fails_fast() {
    let mapper = OrderChannelMapper::new(
        Box::new(PoolAllocator::new(Vec::<String>::new())),
        Box::new(NullStorage),
    );
    let h = harness_with_mapper(mapper);
    let order = OrderId::new("order-12");

    let err = h
        .service
        .start(order.clone(), Arc::new(RecordingSink::default()), opts())
        .await
        .unwrap_err();

    assert!(matches!(err, TrackingError::Resolution { .. }));
    assert_eq!(h.service.session_state(&order), None);
    assert!(h.service.active_orders().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_invalid_inputs_rejected() {
    let h = harness();
    let sink = Arc::new(RecordingSink::default());

    let err = h.service.start(OrderId::new(""), sink.clone(), opts()).await.unwrap_err();
    assert!(matches!(err, TrackingError::InvalidOrderId(_)));

    let bad = SessionOptions::new(Coordinate::new(f64::NAN, 13.0));
    let err = h.service.start(OrderId::new("order-13"), sink, bad).await.unwrap_err();
    assert!(matches!(err, TrackingError::InvalidDestination(_)));
    assert!(h.service.active_orders().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stop_all() {
    let h = harness();
    for i in 0..3 {
        h.service
            .start(OrderId::new(format!("order-{i}")), Arc::new(RecordingSink::default()), opts())
            .await
            .unwrap();
    }
    assert_eq!(h.service.active_orders().len(), 3);
    assert_eq!(h.service.stop_all(), 3);
    assert!(h.service.active_orders().is_empty());
    assert_eq!(h.service.stop_all(), 0);
}

/// Sink that stops its own session from inside a callback
struct SelfStoppingSink {
    handle: OnceLock<SessionHandle>,
    calls: AtomicU64,
}

impl TrackingSink for SelfStoppingSink {
    fn on_location(&self, _order_id: &OrderId, _update: LocationUpdate) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn on_status(&self, _order_id: &OrderId, _status: StatusEvent) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.handle.get() {
            handle.stop();
        }
        true
    }

    fn on_error(&self, _order_id: &OrderId, _error: TrackingError) -> bool {
        true
    }
}

#[tokio::test(start_paused = true)]
async fn test_stop_from_inside_callback() {
    let h = harness();
    let sink = Arc::new(SelfStoppingSink { handle: OnceLock::new(), calls: AtomicU64::new(0) });
    let session = h.service.start(OrderId::new("order-14"), sink.clone(), opts()).await.unwrap();
    let _ = sink.handle.set(session.clone());
    let status_path = h.status_path(&session);
    let location_path = h.location_path(&session);

    h.store.set(&status_path, json!("assigned")).await.unwrap();
    settle().await;
    h.store.set(&status_path, json!("picked_up")).await.unwrap();
    h.store.set(&location_path, location(52.53, 13.41, T0)).await.unwrap();
    settle().await;

    assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
    assert_eq!(session.state(), SessionState::Stopped);
}

/// Sink that counts calls made after the test observed `stop()` return
#[derive(Default)]
struct RaceSink {
    stop_returned: AtomicBool,
    calls: AtomicU64,
    late_calls: AtomicU64,
}

impl TrackingSink for RaceSink {
    fn on_location(&self, _order_id: &OrderId, _update: LocationUpdate) -> bool {
        self.record()
    }

    fn on_status(&self, _order_id: &OrderId, _status: StatusEvent) -> bool {
        self.record()
    }

    fn on_error(&self, _order_id: &OrderId, _error: TrackingError) -> bool {
        self.record()
    }
}

impl RaceSink {
    fn record(&self) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.stop_returned.load(Ordering::SeqCst) {
            self.late_calls.fetch_add(1, Ordering::SeqCst);
        }
        true
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_delivery_after_concurrent_stop() {
    let h = harness();
    let sink = Arc::new(RaceSink::default());
    let session = h.service.start(OrderId::new("order-15"), sink.clone(), opts()).await.unwrap();
    let status_path = h.status_path(&session);

    let publishing = Arc::new(AtomicBool::new(true));
    let publisher = {
        let store = h.store.clone();
        let publishing = publishing.clone();
        tokio::spawn(async move {
            let mut seq = 0u64;
            while publishing.load(Ordering::SeqCst) {
                let _ = store.set(&status_path, json!({ "status": "in_transit", "seq": seq })).await;
                seq += 1;
                tokio::task::yield_now().await;
            }
        })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        while sink.calls.load(Ordering::SeqCst) < 10 {
            sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();

    assert!(session.stop());
    sink.stop_returned.store(true, Ordering::SeqCst);

    sleep(Duration::from_millis(50)).await;
    publishing.store(false, Ordering::SeqCst);
    publisher.await.unwrap();

    assert_eq!(sink.late_calls.load(Ordering::SeqCst), 0);
}
