//! courier-track - live courier tracking against the real-time store
//!
//! Tracks one or more orders given on the command line, logging every
//! location, status, and error event as it is delivered.
//!
//! Module structure:
//! - `domain/` - Core types (ids, samples, geometry, errors)
//! - `io/` - External interfaces (store, geolocation, dispatcher, sink)
//! - `services/` - Business logic (ETA, channel mapping, tracking, geofence)
//! - `infra/` - Infrastructure (Config, Metrics, caches)
//!
//! Usage:
//!   courier-track --config config/dev.toml --order order-42@52.520,13.405

use clap::Parser;
use courier_track::domain::{Coordinate, OrderId, VehicleClass};
use courier_track::infra::{Config, Metrics};
use courier_track::io::{create_tracking_channel, probe_link, MqttStore, TrackingEvent};
use courier_track::services::{SessionOptions, TrackingService};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Live courier tracking client
#[derive(Parser, Debug)]
#[command(name = "courier-track", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Order to track, as ORDER_ID@LAT,LON (repeatable)
    #[arg(short, long = "order", value_parser = parse_order_spec, required = true)]
    orders: Vec<(OrderId, Coordinate)>,

    /// Vehicle class override (walking, cycling, motorbike, car, default)
    #[arg(long)]
    vehicle: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn parse_order_spec(spec: &str) -> Result<(OrderId, Coordinate), String> {
    let (order, coords) =
        spec.split_once('@').ok_or_else(|| format!("expected ORDER_ID@LAT,LON, got {spec:?}"))?;
    let (lat, lon) =
        coords.split_once(',').ok_or_else(|| format!("expected LAT,LON, got {coords:?}"))?;
    let lat: f64 = lat.trim().parse().map_err(|e| format!("latitude {lat:?}: {e}"))?;
    let lon: f64 = lon.trim().parse().map_err(|e| format!("longitude {lon:?}: {e}"))?;
    let destination = Coordinate::new(lat, lon);
    if order.trim().is_empty() || !destination.is_valid() {
        return Err(format!("invalid order spec {spec:?}"));
    }
    Ok((OrderId::new(order.trim()), destination))
}

fn init_logging(json: bool) {
    // Default: INFO, use RUST_LOG=debug for per-sample visibility
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_json);

    info!("courier-track starting");

    let config_path = args.config.clone().unwrap_or_else(|| Config::resolve_config_path(&[]));
    let config = Config::load_from_path(&config_path);
    // Unknown names map to the default class
    let vehicle: Option<VehicleClass> =
        args.vehicle.as_deref().map(|v| v.parse().unwrap_or_default());

    info!(
        config_file = %config.config_file(),
        store_host = %config.store_host(),
        store_port = %config.store_port(),
        min_delivery_interval_ms = %config.min_delivery_interval_ms(),
        vehicle_class = %vehicle.unwrap_or(config.vehicle_class()).as_str(),
        mapper_file = %config.mapper_file(),
        "config_loaded"
    );

    let store = Arc::new(MqttStore::connect(&config));
    // Degraded links are not fatal; the client keeps retrying
    probe_link(store.as_ref(), Duration::from_secs(config.store_probe_timeout_secs())).await;

    let metrics = Arc::new(Metrics::new());
    let service = Arc::new(TrackingService::from_config(config.clone(), store, metrics.clone()));
    if !service.mapper().is_durable() {
        warn!(file = %config.mapper_file(), "channel_mapping_not_durable");
    }

    let (sink, mut events) = create_tracking_channel(config.sink_buffer());
    let sink = Arc::new(sink);

    for (order_id, destination) in &args.orders {
        let mut opts = SessionOptions::new(*destination);
        if let Some(vehicle) = vehicle {
            opts = opts.with_vehicle_class(vehicle);
        }
        if let Err(e) = service.start(order_id.clone(), sink.clone(), opts).await {
            warn!(order_id = %order_id, error = %e, "tracking_start_failed");
        }
    }

    if service.active_orders().is_empty() {
        anyhow::bail!("no order could be tracked");
    }

    // Periodic metrics reporter
    let reporter_service = service.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            interval.tick().await;
            metrics.report(reporter_service.active_orders().len()).log();
        }
    });

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                handle_event(&service, event);
                if service.active_orders().is_empty() {
                    info!("all_orders_finished");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown_signal_received");
                break;
            }
        }
    }

    let stopped = service.stop_all();
    info!(sessions_stopped = %stopped, "courier-track shutdown complete");
    Ok(())
}

fn handle_event(service: &TrackingService, event: TrackingEvent) {
    match event {
        TrackingEvent::Location { order_id, update } => {
            info!(
                order_id = %order_id,
                lat = %update.sample.latitude,
                lon = %update.sample.longitude,
                distance_km = format!("{:.3}", update.distance_km),
                eta_minutes = %update.eta_minutes,
                speed_kmh = format!("{:.1}", update.speed_kmh),
                status = %update.status,
                "courier_location"
            );
        }
        TrackingEvent::Status { order_id, status } => {
            info!(order_id = %order_id, status = %status.status.as_str(), "courier_status");
            if status.status.is_terminal() {
                service.stop(&order_id);
            }
        }
        TrackingEvent::Error { order_id, error } => {
            warn!(order_id = %order_id, error = %error, "tracking_error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_order_spec() {
        let (order, dest) = parse_order_spec("order-42@52.52, 13.405").unwrap();
        assert_eq!(order.as_str(), "order-42");
        assert_eq!(dest, Coordinate::new(52.52, 13.405));

        assert!(parse_order_spec("order-42").is_err());
        assert!(parse_order_spec("@52.5,13.4").is_err());
        assert!(parse_order_spec("o@95.0,13.4").is_err());
        assert!(parse_order_spec("o@abc,13.4").is_err());
    }
}
