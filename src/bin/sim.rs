//! courier-sim - drive a synthetic courier toward a destination
//!
//! Runs the whole pipeline in-process against the in-memory store:
//! - a simulated courier writes positions and status changes to the store
//! - a tracking session delivers enriched updates, logged as they arrive
//! - the same positions feed a simulated device for the geofence monitor
//!
//! Usage:
//!   cargo run --bin courier-sim -- --dest 52.520,13.405 --start-km 1.5 --tick-ms 500

use clap::Parser;
use courier_track::domain::geo::{bearing_deg, distance_between, predict_position};
use courier_track::domain::{epoch_ms, Coordinate, OrderId, VehicleClass};
use courier_track::infra::{Config, Metrics};
use courier_track::io::{
    create_tracking_channel, ChannelGeolocation, DevicePosition, LogDispatcher, MemoryStore,
    NotificationDispatcher, RealtimeStore, StoreDispatcher, TrackingEvent,
};
use courier_track::services::{GeofenceMonitor, GeofenceSettings, SessionOptions, TrackingService};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Distance at which the courier reports "arrived"
const ARRIVAL_RADIUS_M: f64 = 50.0;

/// Synthetic courier run over the in-memory store
#[derive(Parser, Debug)]
#[command(name = "courier-sim", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Order id to simulate
    #[arg(long, default_value = "sim-order-1")]
    order: String,

    /// Destination as LAT,LON
    #[arg(long, default_value = "52.520,13.405", value_parser = parse_coordinate)]
    dest: Coordinate,

    /// Starting distance from the destination in km
    #[arg(long, default_value_t = 1.5)]
    start_km: f64,

    /// Bearing from the destination to the starting point in degrees
    #[arg(long, default_value_t = 225.0)]
    approach_deg: f64,

    /// Courier ground speed in km/h
    #[arg(long, default_value_t = 30.0)]
    speed_kmh: f64,

    /// Wall-clock time per simulated step
    #[arg(long, default_value_t = 1000)]
    tick_ms: u64,

    /// Simulated seconds covered by one step
    #[arg(long, default_value_t = 10.0)]
    step_secs: f64,

    /// Upper bound on steps before giving up
    #[arg(long, default_value_t = 500)]
    max_steps: u32,

    #[arg(long, default_value = "cycling")]
    vehicle: String,

    /// Write proximity notifications into the store instead of the log
    #[arg(long)]
    notify_store: bool,

    #[arg(long)]
    log_json: bool,
}

fn parse_coordinate(s: &str) -> Result<Coordinate, String> {
    let (lat, lon) = s.split_once(',').ok_or_else(|| format!("expected LAT,LON, got {s:?}"))?;
    let lat: f64 = lat.trim().parse().map_err(|e| format!("latitude {lat:?}: {e}"))?;
    let lon: f64 = lon.trim().parse().map_err(|e| format!("longitude {lon:?}: {e}"))?;
    let c = Coordinate::new(lat, lon);
    if c.is_valid() {
        Ok(c)
    } else {
        Err(format!("coordinate out of range: {s}"))
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Straight-line courier heading for the destination
struct Courier {
    position: Coordinate,
    destination: Coordinate,
    speed_kmh: f64,
    heading_deg: f64,
}

impl Courier {
    fn new(destination: Coordinate, start_km: f64, approach_deg: f64, speed_kmh: f64) -> Self {
        // Project start_km out from the destination (1 minute at start_km*60 km/h)
        let (lat, lon) =
            predict_position(destination.lat, destination.lon, start_km * 60.0, approach_deg, 1.0);
        let position = Coordinate::new(lat, lon);
        let heading_deg = bearing_deg(lat, lon, destination.lat, destination.lon);
        Self { position, destination, speed_kmh, heading_deg }
    }

    fn remaining_m(&self) -> f64 {
        distance_between(self.position, self.destination) * 1000.0
    }

    /// Advance by `secs` of travel; snaps onto the destination on the last leg
    fn advance(&mut self, secs: f64) {
        let step_m = self.speed_kmh / 3.6 * secs;
        if step_m >= self.remaining_m() {
            self.position = self.destination;
            return;
        }
        self.heading_deg = bearing_deg(
            self.position.lat,
            self.position.lon,
            self.destination.lat,
            self.destination.lon,
        );
        let (lat, lon) = predict_position(
            self.position.lat,
            self.position.lon,
            self.speed_kmh,
            self.heading_deg,
            secs / 60.0,
        );
        self.position = Coordinate::new(lat, lon);
    }

    fn location_payload(&self, now_ms: u64) -> serde_json::Value {
        json!({
            "latitude": self.position.lat,
            "longitude": self.position.lon,
            "speed": self.speed_kmh / 3.6,
            "heading": self.heading_deg,
            "accuracy": 8.0,
            "timestamp": now_ms,
        })
    }

    fn device_position(&self, now_ms: u64) -> DevicePosition {
        DevicePosition {
            lat: self.position.lat,
            lon: self.position.lon,
            speed_mps: self.speed_kmh / 3.6,
            heading_deg: self.heading_deg,
            accuracy_m: 8.0,
            timestamp_ms: now_ms,
        }
    }
}

async fn write_status(store: &dyn RealtimeStore, path: &str, status: &str) {
    let payload = json!({ "status": status, "updatedAt": epoch_ms() });
    if let Err(e) = store.set(path, payload).await {
        warn!(path = %path, error = %e, "sim_status_write_failed");
    }
}

fn log_event(event: &TrackingEvent) {
    match event {
        TrackingEvent::Location { order_id, update } => {
            info!(
                order_id = %order_id,
                distance_km = format!("{:.3}", update.distance_km),
                eta_minutes = %update.eta_minutes,
                speed_kmh = format!("{:.1}", update.speed_kmh),
                status = %update.status,
                "courier_location"
            );
        }
        TrackingEvent::Status { order_id, status } => {
            info!(order_id = %order_id, status = %status.status.as_str(), "courier_status");
        }
        TrackingEvent::Error { order_id, error } => {
            warn!(order_id = %order_id, error = %error, "tracking_error");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_json);

    let config = match args.config.as_deref() {
        Some(path) => Config::load_from_path(path),
        None => Config::default(),
    };
    // Simulated channels are throwaway
    let config = config.with_mapper_file("");

    let order_id = OrderId::new(args.order.as_str());
    let vehicle: VehicleClass = args.vehicle.parse().unwrap_or_default();

    let store = Arc::new(MemoryStore::new());
    let metrics = Arc::new(Metrics::new());
    let service = TrackingService::from_config(config.clone(), store.clone(), metrics.clone());

    let (sink, mut events) = create_tracking_channel(config.sink_buffer());
    let opts = SessionOptions::new(args.dest).with_vehicle_class(vehicle);
    let session = service.start(order_id.clone(), Arc::new(sink), opts).await?;
    let channel = session
        .channel_id()
        .ok_or_else(|| anyhow::anyhow!("session started without a channel"))?;
    let location_path = config.location_path(channel.as_str());
    let status_path = config.status_path(channel.as_str());

    let printer = tokio::spawn(async move {
        let mut delivered = 0usize;
        while let Some(event) = events.recv().await {
            log_event(&event);
            delivered += 1;
        }
        delivered
    });

    let geolocation = ChannelGeolocation::new();
    let device = geolocation.feeder();
    let dispatcher: Arc<dyn NotificationDispatcher> = if args.notify_store {
        Arc::new(StoreDispatcher::from_config(store.clone(), &config))
    } else {
        Arc::new(LogDispatcher)
    };
    let monitor = GeofenceMonitor::new(
        Arc::new(geolocation),
        dispatcher,
        GeofenceSettings::from_config(&config),
        metrics.clone(),
    );
    if !monitor.add_geofence(order_id.clone(), args.dest, None).await {
        warn!(order_id = %order_id, "geofence_not_watching");
    }

    let mut courier = Courier::new(args.dest, args.start_km, args.approach_deg, args.speed_kmh);
    info!(
        order_id = %order_id,
        channel_id = %channel,
        start = %courier.position,
        destination = %args.dest,
        remaining_m = format!("{:.0}", courier.remaining_m()),
        "sim_started"
    );

    write_status(store.as_ref(), &status_path, "picked_up").await;

    let mut ticker = tokio::time::interval(Duration::from_millis(args.tick_ms.max(1)));
    let mut arrived = false;
    for step in 0..args.max_steps {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown_signal_received");
                break;
            }
        }

        let now_ms = epoch_ms();
        if let Err(e) = store.set(&location_path, courier.location_payload(now_ms)).await {
            warn!(error = %e, "sim_location_write_failed");
        }
        device.push(courier.device_position(now_ms));

        if step == 0 {
            write_status(store.as_ref(), &status_path, "in_transit").await;
        }
        if !arrived && courier.remaining_m() <= ARRIVAL_RADIUS_M {
            arrived = true;
            write_status(store.as_ref(), &status_path, "arrived").await;
        }
        if courier.remaining_m() == 0.0 {
            break;
        }
        courier.advance(args.step_secs);
    }

    if arrived {
        write_status(store.as_ref(), &status_path, "delivered").await;
    } else {
        warn!(remaining_m = format!("{:.0}", courier.remaining_m()), "sim_did_not_arrive");
    }

    // Let the session drain before tearing down
    tokio::time::sleep(Duration::from_millis(100)).await;
    monitor.shutdown().await;
    service.stop_all();
    drop(session);
    drop(service);

    let events_logged = printer.await.unwrap_or(0);
    metrics.report(0).log();
    info!(
        events_logged = %events_logged,
        locations_delivered = %metrics.locations_delivered(),
        locations_throttled = %metrics.locations_throttled(),
        notifications = %metrics.geofence_notifications(),
        "sim_finished"
    );
    Ok(())
}
