//! End-to-end tests over the in-memory store

use courier_track::domain::{Coordinate, DeliveryStatus, OrderId};
use courier_track::infra::{Config, Metrics};
use courier_track::io::store::FeedEvent;
use courier_track::io::{
    create_tracking_channel, ChannelGeolocation, DevicePosition, MemoryStore, RealtimeStore,
    StoreDispatcher, TrackingEvent,
};
use courier_track::services::{
    GeofenceMonitor, GeofenceSettings, ProximityStatus, SessionOptions, SessionState,
    TrackingService,
};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

const T0: u64 = 1_700_000_000_000;
const METERS_PER_DEG_LAT: f64 = 111_195.0;

fn destination() -> Coordinate {
    Coordinate::new(52.52, 13.405)
}

fn test_config() -> Config {
    Config::default().with_mapper_file("")
}

async fn next_event(events: &mut mpsc::Receiver<TrackingEvent>) -> TrackingEvent {
    timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("no event within 1s")
        .expect("event channel closed")
}

#[tokio::test(start_paused = true)]
async fn test_courier_run_through_channel_sink() {
    let config = test_config();
    let store = Arc::new(MemoryStore::new());
    let metrics = Arc::new(Metrics::new());
    let service = TrackingService::from_config(config.clone(), store.clone(), metrics.clone());

    let (sink, mut events) = create_tracking_channel(config.sink_buffer());
    let order = OrderId::new("order-1");
    let session = service
        .start(order.clone(), Arc::new(sink), SessionOptions::new(destination()))
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Receiving);

    let channel = session.channel_id().unwrap();
    let location_path = config.location_path(channel.as_str());
    let status_path = config.status_path(channel.as_str());

    store.set(&status_path, json!({ "status": "picked_up", "updatedAt": T0 })).await.unwrap();
    match next_event(&mut events).await {
        TrackingEvent::Status { order_id, status } => {
            assert_eq!(order_id, order);
            assert_eq!(status.status, DeliveryStatus::PickedUp);
            assert_eq!(status.timestamp_ms, T0);
        }
        other => panic!("expected status, got {other:?}"),
    }

    let far = json!({ "latitude": 52.53, "longitude": 13.405, "speed": 10, "timestamp": T0 });
    store.set(&location_path, far).await.unwrap();
    let first = match next_event(&mut events).await {
        TrackingEvent::Location { update, .. } => update,
        other => panic!("expected location, got {other:?}"),
    };
    assert!((first.distance_km - 1.112).abs() < 0.01, "got {}", first.distance_km);
    assert_eq!(first.status, ProximityStatus::FastTransit);

    // Inside the throttle window: dropped
    let early = json!({ "latitude": 52.525, "longitude": 13.405, "speed": 10, "timestamp": T0 + 1000 });
    store.set(&location_path, early).await.unwrap();
    sleep(Duration::from_millis(10)).await;
    assert!(events.try_recv().is_err());

    sleep(Duration::from_secs(6)).await;
    let near = json!({ "latitude": 52.5205, "longitude": 13.405, "speed": 2, "timestamp": T0 + 7000 });
    store.set(&location_path, near).await.unwrap();
    let second = match next_event(&mut events).await {
        TrackingEvent::Location { update, .. } => update,
        other => panic!("expected location, got {other:?}"),
    };
    assert!(second.distance_km < first.distance_km);
    assert!(second.eta_minutes <= first.eta_minutes);
    assert_eq!(second.status, ProximityStatus::Nearby);

    store.set(&status_path, json!("delivered")).await.unwrap();
    match next_event(&mut events).await {
        TrackingEvent::Status { status, .. } => assert!(status.status.is_terminal()),
        other => panic!("expected status, got {other:?}"),
    }

    assert!(service.stop(&order));
    store.set(&status_path, json!("picked_up")).await.unwrap();
    sleep(Duration::from_millis(10)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(store.feed_count(&location_path), 0);
    assert_eq!(store.feed_count(&status_path), 0);

    assert_eq!(metrics.locations_delivered(), 2);
    assert_eq!(metrics.locations_throttled(), 1);
    assert_eq!(metrics.statuses_delivered(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_channel_mapping_survives_restart() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("channels.json");
    let config = Config::default().with_mapper_file(file.to_str().unwrap());
    let order = OrderId::new("order-durable");

    let first_channel = {
        let service = TrackingService::from_config(
            config.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(Metrics::new()),
        );
        assert!(service.mapper().is_durable());
        let (sink, _events) = create_tracking_channel(16);
        let session = service
            .start(order.clone(), Arc::new(sink), SessionOptions::new(destination()))
            .await
            .unwrap();
        session.channel_id().unwrap()
    };
    assert!(file.exists());

    let service = TrackingService::from_config(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(Metrics::new()),
    );
    assert_eq!(service.mapper().channel_for(&order), Some(first_channel.clone()));
    assert_eq!(service.mapper().reverse_lookup(&first_channel), Some(order));
}

fn north_of_destination(meters: f64, timestamp_ms: u64) -> DevicePosition {
    let dest = destination();
    DevicePosition::at(dest.lat + meters / METERS_PER_DEG_LAT, dest.lon, timestamp_ms)
}

#[tokio::test(start_paused = true)]
async fn test_geofence_notifications_land_in_store() {
    let config = test_config();
    let store = Arc::new(MemoryStore::new());
    let metrics = Arc::new(Metrics::new());

    let geolocation = ChannelGeolocation::new();
    let device = geolocation.feeder();
    let monitor = GeofenceMonitor::new(
        Arc::new(geolocation),
        Arc::new(StoreDispatcher::from_config(store.clone(), &config)),
        GeofenceSettings::from_config(&config),
        metrics.clone(),
    );

    let order = OrderId::new("o-9");
    let notification_path = config.notification_path(order.as_str());
    let mut notifications = store.subscribe(&notification_path).await.unwrap();

    assert!(monitor.add_geofence(order.clone(), destination(), None).await);
    assert!(monitor.is_watching().await);

    for (i, meters) in [1200.0, 900.0, 600.0, 300.0, 80.0].into_iter().enumerate() {
        device.push(north_of_destination(meters, T0 + i as u64 * 10_000));
        sleep(Duration::from_millis(10)).await;
    }

    let mut thresholds = Vec::new();
    for _ in 0..4 {
        match timeout(Duration::from_secs(1), notifications.recv()).await {
            Ok(Some(FeedEvent::Value(payload))) => {
                assert_eq!(payload["data"]["type"], "proximity");
                assert_eq!(payload["data"]["order_id"], "o-9");
                thresholds.push(payload["data"]["threshold_m"].as_u64().unwrap());
            }
            other => panic!("expected notification, got {other:?}"),
        }
    }
    assert_eq!(thresholds, vec![1000, 500, 200, 100]);
    assert_eq!(metrics.geofence_notifications(), 4);

    assert!(monitor.remove_geofence(&order).await);
    assert!(!monitor.is_watching().await);
    assert!(monitor.active_geofences().await.is_empty());
}
