//! Proximity geofencing for the local device
//!
//! Each registered order carries a destination and descending distance
//! thresholds. One shared position loop, running while at least one
//! geofence is registered, evaluates every fence on each device position and
//! dispatches a notification for each newly crossed threshold.
//!
//! A threshold fires only while it is strictly below the last fired one,
//! so moving away and coming back never repeats a notification. Crossing
//! several thresholds between two positions fires each of them, largest
//! first. Only a notification the dispatcher confirms counts as sent.
//!
//! The fence table lives behind an async mutex that is held across
//! dispatch; once `remove_geofence` returns, no notification for that
//! order can be in flight.

use crate::domain::error::{DispatchError, GeoError};
use crate::domain::geo::{self, Coordinate};
use crate::domain::types::OrderId;
use crate::infra::config::{normalize_thresholds, Config};
use crate::infra::metrics::Metrics;
use crate::io::dispatcher::NotificationDispatcher;
use crate::io::geolocation::{
    DevicePosition, GeolocationProvider, PermissionState, WatchOptions,
};
use rustc_hash::FxHashMap;
use serde_json::json;
use smallvec::SmallVec;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

pub type Thresholds = SmallVec<[u32; 4]>;

/// Proximity watch for one order
#[derive(Debug, Clone, PartialEq)]
pub struct Geofence {
    pub order_id: OrderId,
    pub destination: Coordinate,
    /// Sorted descending
    pub thresholds_m: Thresholds,
    pub last_fired_m: Option<u32>,
}

impl Geofence {
    pub fn new(order_id: OrderId, destination: Coordinate, thresholds: &[u32]) -> Self {
        Self {
            order_id,
            destination,
            thresholds_m: normalize_thresholds(thresholds.to_vec()).into_iter().collect(),
            last_fired_m: None,
        }
    }

    /// Thresholds newly crossed at `distance_m`, largest first.
    ///
    /// Records the smallest one as the last fired threshold.
    pub fn evaluate(&mut self, distance_m: f64) -> Thresholds {
        if !distance_m.is_finite() {
            return Thresholds::new();
        }
        let fired: Thresholds = self
            .thresholds_m
            .iter()
            .copied()
            .filter(|&t| distance_m <= f64::from(t))
            .filter(|&t| self.last_fired_m.map_or(true, |last| t < last))
            .collect();
        if let Some(&smallest) = fired.last() {
            self.last_fired_m = Some(smallest);
        }
        fired
    }
}

/// Minutes to cover `distance_km` at a constant speed, rounded up
pub fn simple_eta_minutes(distance_km: f64, speed_kmh: f64) -> u32 {
    (distance_km / speed_kmh * 60.0).ceil().max(0.0) as u32
}

/// One notification to dispatch
#[derive(Debug, Clone, PartialEq)]
pub struct ProximityAlert {
    pub order_id: OrderId,
    pub threshold_m: u32,
    pub distance_m: f64,
    pub eta_minutes: u32,
}

#[derive(Debug, Clone)]
pub struct GeofenceSettings {
    pub default_thresholds_m: Vec<u32>,
    pub watch: WatchOptions,
    pub eta_speed_kmh: f64,
    pub dispatch_timeout: Duration,
}

impl GeofenceSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_thresholds_m: config.geofence_thresholds_m().to_vec(),
            watch: WatchOptions {
                accuracy: config.geofence_accuracy(),
                min_interval_ms: config.geofence_watch_interval_ms(),
                min_distance_m: config.geofence_watch_distance_m(),
            },
            eta_speed_kmh: config.geofence_eta_speed_kmh(),
            dispatch_timeout: Duration::from_millis(config.geofence_dispatch_timeout_ms()),
        }
    }
}

impl Default for GeofenceSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Default)]
struct MonitorState {
    fences: FxHashMap<OrderId, Geofence>,
    position_loop: Option<JoinHandle<()>>,
    /// Set after a permission denial; the monitor stays inert
    disabled: bool,
}

impl MonitorState {
    fn stop_loop(&mut self) {
        if let Some(task) = self.position_loop.take() {
            task.abort();
            info!("geofence_loop_stopped");
        }
    }
}

struct Shared {
    state: Mutex<MonitorState>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    settings: GeofenceSettings,
    metrics: Arc<Metrics>,
}

impl Shared {
    /// Evaluate all fences against `pos` and dispatch what fired
    async fn process(&self, pos: DevicePosition) -> usize {
        let mut state = self.state.lock().await;
        let mut alerts = Vec::new();
        for fence in state.fences.values_mut() {
            let distance_km =
                geo::distance_km(pos.lat, pos.lon, fence.destination.lat, fence.destination.lon);
            let distance_m = distance_km * 1000.0;
            for threshold_m in fence.evaluate(distance_m) {
                alerts.push(ProximityAlert {
                    order_id: fence.order_id.clone(),
                    threshold_m,
                    distance_m,
                    eta_minutes: simple_eta_minutes(distance_km, self.settings.eta_speed_kmh),
                });
            }
        }

        let fired = alerts.len();
        for alert in alerts {
            self.dispatch(alert).await;
        }
        drop(state);
        fired
    }

    /// Dispatch failures are logged and swallowed
    async fn dispatch(&self, alert: ProximityAlert) {
        let title = "Approaching destination";
        let body = format!(
            "{} m to go, about {} min",
            alert.distance_m.round() as u64,
            alert.eta_minutes
        );
        let data = json!({
            "type": "proximity",
            "order_id": alert.order_id.as_str(),
            "threshold_m": alert.threshold_m,
            "distance_m": alert.distance_m.round(),
            "eta_minutes": alert.eta_minutes,
        });

        let timeout = self.settings.dispatch_timeout;
        let result =
            match tokio::time::timeout(timeout, self.dispatcher.notify(title, &body, data)).await {
                Ok(result) => result,
                Err(_) => Err(DispatchError::Timeout(timeout.as_millis() as u64)),
            };
        match result {
            Ok(()) => {
                self.metrics.record_geofence_notification();
                info!(
                    order_id = %alert.order_id,
                    threshold_m = %alert.threshold_m,
                    distance_m = format!("{:.0}", alert.distance_m),
                    eta_minutes = %alert.eta_minutes,
                    "geofence_fired"
                );
            }
            Err(e) => {
                self.metrics.record_dispatch_failure();
                warn!(
                    order_id = %alert.order_id,
                    threshold_m = %alert.threshold_m,
                    error = %e,
                    "geofence_dispatch_failed"
                );
            }
        }
    }
}

async fn run_position_loop(mut positions: mpsc::Receiver<DevicePosition>, shared: Arc<Shared>) {
    info!("geofence_loop_started");
    while let Some(pos) = positions.recv().await {
        let fired = shared.process(pos).await;
        debug!(lat = %pos.lat, lon = %pos.lon, fired = %fired, "geofence_position");
    }
    info!("geofence_position_stream_ended");
    shared.state.lock().await.position_loop = None;
}

/// Watches the device position against registered destinations
pub struct GeofenceMonitor {
    provider: Arc<dyn GeolocationProvider>,
    shared: Arc<Shared>,
}

impl GeofenceMonitor {
    pub fn new(
        provider: Arc<dyn GeolocationProvider>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        settings: GeofenceSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            provider,
            shared: Arc::new(Shared {
                state: Mutex::new(MonitorState::default()),
                dispatcher,
                settings,
                metrics,
            }),
        }
    }

    /// Register (or reset) the geofence for `order_id` and make sure the
    /// position loop is running.
    ///
    /// Returns whether device positions are being watched. A permission
    /// denial disables the monitor; the fence is kept but never fires.
    pub async fn add_geofence(
        &self,
        order_id: OrderId,
        destination: Coordinate,
        thresholds: Option<&[u32]>,
    ) -> bool {
        let thresholds = thresholds.unwrap_or(self.shared.settings.default_thresholds_m.as_slice());
        let fence = Geofence::new(order_id.clone(), destination, thresholds);
        debug!(order_id = %order_id, thresholds = ?fence.thresholds_m, "geofence_added");

        let mut state = self.shared.state.lock().await;
        state.fences.insert(order_id, fence);

        if state.disabled {
            return false;
        }
        if state.position_loop.is_some() {
            return true;
        }

        match self.start_watch().await {
            Ok(positions) => {
                let shared = self.shared.clone();
                state.position_loop = Some(tokio::spawn(run_position_loop(positions, shared)));
                true
            }
            Err(GeoError::PermissionDenied) => {
                warn!("geofence_permission_denied");
                state.disabled = true;
                false
            }
        }
    }

    async fn start_watch(&self) -> Result<mpsc::Receiver<DevicePosition>, GeoError> {
        if self.provider.request_permission().await == PermissionState::Denied {
            return Err(GeoError::PermissionDenied);
        }
        self.provider.watch_position(self.shared.settings.watch).await
    }

    /// Remove the geofence for `order_id`; stops the position loop when
    /// none remain. Idempotent.
    pub async fn remove_geofence(&self, order_id: &OrderId) -> bool {
        let mut state = self.shared.state.lock().await;
        let removed = state.fences.remove(order_id).is_some();
        if removed {
            debug!(order_id = %order_id, "geofence_removed");
        }
        if state.fences.is_empty() {
            state.stop_loop();
        }
        removed
    }

    /// Run one device position through every active fence.
    ///
    /// The position loop calls this for each watched position; returns the
    /// number of notifications fired.
    pub async fn process_position(&self, pos: DevicePosition) -> usize {
        self.shared.process(pos).await
    }

    pub async fn active_geofences(&self) -> Vec<OrderId> {
        let state = self.shared.state.lock().await;
        let mut orders: Vec<OrderId> = state.fences.keys().cloned().collect();
        orders.sort();
        orders
    }

    pub async fn geofence(&self, order_id: &OrderId) -> Option<Geofence> {
        self.shared.state.lock().await.fences.get(order_id).cloned()
    }

    pub async fn is_watching(&self) -> bool {
        self.shared.state.lock().await.position_loop.is_some()
    }

    pub async fn is_disabled(&self) -> bool {
        self.shared.state.lock().await.disabled
    }

    /// Remove every fence and stop the loop
    pub async fn shutdown(&self) {
        let mut state = self.shared.state.lock().await;
        state.fences.clear();
        state.stop_loop();
    }
}
