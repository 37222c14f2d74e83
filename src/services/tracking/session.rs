//! One tracking session: lifecycle state, stop guard, and worker task
//!
//! The worker task owns all per-session mutable state (delivery gate,
//! speed history), so there is a single writer per session. The only state
//! shared with callers is the stop guard, which every sink call holds.
//! `stop()` takes the same guard, so once it returns no sink call for the
//! session can start.
//!
//! A location or status is committed to the delivery gate only once the
//! sink accepts it. A value the sink refused is delivered again if the
//! store repeats it.

use super::gate::{DeliveryGate, GateDecision};
use super::SessionRegistry;
use crate::domain::error::TrackingError;
use crate::domain::geo::Coordinate;
use crate::domain::sample::{decode_location, decode_status};
use crate::domain::types::{ChannelId, LocationSample, OrderId, VehicleClass};
use crate::domain::epoch_ms;
use crate::infra::config::{clamp_delivery_interval_ms, Config};
use crate::infra::metrics::Metrics;
use crate::io::sink::{LocationUpdate, TrackingSink};
use crate::io::store::{Feed, FeedEvent, FeedId, RealtimeStore};
use crate::services::eta::EtaEstimator;
use parking_lot::{Mutex, ReentrantMutex};
use serde_json::Value;
use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

/// Session lifecycle: `Idle -> Resolving -> Subscribed -> Receiving -> Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Resolving,
    Subscribed,
    Receiving,
    Stopped,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Resolving => "resolving",
            SessionState::Subscribed => "subscribed",
            SessionState::Receiving => "receiving",
            SessionState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-session options supplied to `TrackingService::start`
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub destination: Coordinate,
    /// Throttle window override, clamped to [2000, 10000] ms
    pub min_delivery_interval_ms: Option<u64>,
    pub vehicle_class: Option<VehicleClass>,
}

impl SessionOptions {
    pub fn new(destination: Coordinate) -> Self {
        Self { destination, min_delivery_interval_ms: None, vehicle_class: None }
    }

    pub fn with_min_delivery_interval_ms(mut self, ms: u64) -> Self {
        self.min_delivery_interval_ms = Some(ms);
        self
    }

    pub fn with_vehicle_class(mut self, vehicle: VehicleClass) -> Self {
        self.vehicle_class = Some(vehicle);
        self
    }
}

/// Paths and ids needed to unregister a session's feeds
#[derive(Debug)]
pub(crate) struct FeedRegistration {
    pub location_path: String,
    pub location_id: FeedId,
    pub status_path: String,
    pub status_id: FeedId,
}

pub(crate) struct SessionInner {
    order_id: OrderId,
    channel_id: Mutex<Option<ChannelId>>,
    state: Mutex<SessionState>,
    /// `true` once stopped. Held for the duration of every sink call;
    /// reentrant so a sink may stop its own session from a callback.
    stop_guard: ReentrantMutex<Cell<bool>>,
    sink: Arc<dyn TrackingSink>,
    store: Arc<dyn RealtimeStore>,
    feeds: Mutex<Option<FeedRegistration>>,
    task: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<Metrics>,
    /// Owning service's session map, for self-removal on disconnect
    registry: Weak<SessionRegistry>,
}

impl SessionInner {
    pub(crate) fn new(
        order_id: OrderId,
        sink: Arc<dyn TrackingSink>,
        store: Arc<dyn RealtimeStore>,
        metrics: Arc<Metrics>,
        registry: Weak<SessionRegistry>,
    ) -> Self {
        Self {
            order_id,
            channel_id: Mutex::new(None),
            state: Mutex::new(SessionState::Idle),
            stop_guard: ReentrantMutex::new(Cell::new(false)),
            sink,
            store,
            feeds: Mutex::new(None),
            task: Mutex::new(None),
            metrics,
            registry,
        }
    }

    /// Advance the lifecycle; `Stopped` is terminal
    pub(crate) fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock();
        if *state != SessionState::Stopped {
            *state = next;
        }
    }

    pub(crate) fn set_channel(&self, channel: ChannelId) {
        *self.channel_id.lock() = Some(channel);
    }

    fn is_stopped(&self) -> bool {
        self.stop_guard.lock().get()
    }

    /// Call the sink unless the session is stopped. True only if the sink
    /// was called and accepted the event.
    fn deliver(&self, f: impl FnOnce(&dyn TrackingSink, &OrderId) -> bool) -> bool {
        let guard = self.stop_guard.lock();
        if guard.get() {
            return false;
        }
        f(self.sink.as_ref(), &self.order_id)
    }

    /// Remove this session from the owning service, if still registered
    fn unregister(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut sessions = registry.lock();
        let registered = sessions
            .get(&self.order_id)
            .is_some_and(|s| std::ptr::eq(Arc::as_ptr(&s.inner), self));
        if registered {
            sessions.remove(&self.order_id);
        }
    }

    /// Install feeds and spawn the worker, unless stopped in the meantime.
    ///
    /// On failure the feeds are unregistered and the spawn closure (with
    /// the feed receivers it owns) is dropped unrun.
    pub(crate) fn attach(
        &self,
        feeds: FeedRegistration,
        spawn: impl FnOnce() -> JoinHandle<()>,
    ) -> bool {
        let guard = self.stop_guard.lock();
        if guard.get() {
            self.store.unsubscribe(&feeds.location_path, feeds.location_id);
            self.store.unsubscribe(&feeds.status_path, feeds.status_id);
            return false;
        }
        *self.feeds.lock() = Some(feeds);
        self.set_state(SessionState::Subscribed);
        *self.task.lock() = Some(spawn());
        self.set_state(SessionState::Receiving);
        true
    }

    /// Mark stopped, unregister feeds and leave the service's session map.
    /// Returns false if already stopped.
    pub(crate) fn shutdown(&self) -> bool {
        {
            let guard = self.stop_guard.lock();
            if guard.get() {
                return false;
            }
            guard.set(true);
        }
        self.unregister();

        let feeds = self.feeds.lock().take();
        if let Some(feeds) = feeds {
            self.store.unsubscribe(&feeds.location_path, feeds.location_id);
            self.store.unsubscribe(&feeds.status_path, feeds.status_id);
            self.metrics.record_session_stopped();
        }
        *self.state.lock() = SessionState::Stopped;
        info!(order_id = %self.order_id, "session_stopped");
        true
    }
}

/// Cancellation handle for a tracking session
#[derive(Clone)]
pub struct SessionHandle {
    pub(crate) inner: Arc<SessionInner>,
}

impl SessionHandle {
    pub(crate) fn new(inner: SessionInner) -> Self {
        Self { inner: Arc::new(inner) }
    }

    pub fn order_id(&self) -> &OrderId {
        &self.inner.order_id
    }

    /// Channel id, once resolved
    pub fn channel_id(&self) -> Option<ChannelId> {
        self.inner.channel_id.lock().clone()
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    /// Stop the session. Idempotent; returns true only for the call that
    /// actually stopped it. No sink call starts after this returns.
    pub fn stop(&self) -> bool {
        let stopped = self.inner.shutdown();
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        stopped
    }

    pub(crate) fn same_session(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("order_id", &self.inner.order_id)
            .field("state", &self.state())
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
enum FeedKind {
    Location,
    Status,
}

/// Event-processing half of a session, owned by its task
pub(crate) struct SessionWorker {
    inner: Arc<SessionInner>,
    destination: Coordinate,
    vehicle: VehicleClass,
    gate: DeliveryGate,
    history: VecDeque<LocationSample>,
    history_len: usize,
    estimator: Arc<EtaEstimator>,
    metrics: Arc<Metrics>,
}

impl SessionWorker {
    pub(crate) fn new(
        inner: Arc<SessionInner>,
        opts: &SessionOptions,
        config: &Config,
        estimator: Arc<EtaEstimator>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let interval_ms = opts
            .min_delivery_interval_ms
            .map(clamp_delivery_interval_ms)
            .unwrap_or_else(|| config.min_delivery_interval_ms());
        let history_len = config.speed_history_len();
        Self {
            inner,
            destination: opts.destination,
            vehicle: opts.vehicle_class.unwrap_or_else(|| config.vehicle_class()),
            gate: DeliveryGate::new(
                Duration::from_millis(interval_ms),
                config.coordinate_epsilon_deg(),
            ),
            history: VecDeque::with_capacity(history_len),
            history_len,
            estimator,
            metrics,
        }
    }

    pub(crate) async fn run(mut self, mut location: Feed, mut status: Feed) {
        debug!(
            order_id = %self.inner.order_id,
            location_path = %location.path(),
            status_path = %status.path(),
            interval_ms = %self.gate.min_interval().as_millis(),
            "session_worker_started"
        );

        loop {
            let keep_running = tokio::select! {
                event = location.recv() => self.on_feed_event(FeedKind::Location, event),
                event = status.recv() => self.on_feed_event(FeedKind::Status, event),
            };
            if !keep_running {
                break;
            }
        }
    }

    fn on_feed_event(&mut self, kind: FeedKind, event: Option<FeedEvent>) -> bool {
        match event {
            Some(FeedEvent::Value(raw)) => {
                match kind {
                    FeedKind::Location => self.handle_location(raw),
                    FeedKind::Status => self.handle_status(raw),
                }
                !self.inner.is_stopped()
            }
            Some(FeedEvent::Error(e)) => {
                self.metrics.record_store_error();
                warn!(order_id = %self.inner.order_id, error = %e, "session_store_error");
                let accepted = self
                    .inner
                    .deliver(|sink, order_id| sink.on_error(order_id, TrackingError::Store(e)));
                if !accepted {
                    debug!(order_id = %self.inner.order_id, "store_error_not_accepted");
                }
                !self.inner.is_stopped()
            }
            Some(FeedEvent::Disconnected(reason)) => {
                self.close(reason);
                false
            }
            None => {
                if !self.inner.is_stopped() {
                    self.close("feed closed".to_string());
                }
                false
            }
        }
    }

    /// Permanent disconnection ends the session
    fn close(&self, reason: String) {
        warn!(order_id = %self.inner.order_id, reason = %reason, "session_disconnected");
        self.inner
            .deliver(|sink, order_id| sink.on_error(order_id, TrackingError::Disconnected(reason)));
        self.inner.shutdown();
    }

    fn handle_location(&mut self, raw: Value) {
        let received_at = Instant::now();
        self.metrics.record_location_received();

        let Some(sample) = decode_location(&raw, epoch_ms()) else {
            self.metrics.record_location_invalid();
            debug!(order_id = %self.inner.order_id, "location_invalid");
            return;
        };

        let now = tokio::time::Instant::now();
        match self.gate.check_location(&sample, now) {
            GateDecision::Deliver => {}
            GateDecision::Stale => {
                self.metrics.record_location_stale();
                debug!(order_id = %self.inner.order_id, "location_stale");
                return;
            }
            GateDecision::Throttled => {
                self.metrics.record_location_throttled();
                debug!(order_id = %self.inner.order_id, "location_throttled");
                return;
            }
        }

        if self.history.len() == self.history_len {
            self.history.pop_front();
        }
        self.history.push_back(sample.clone());

        let update = self.enrich(sample.clone());
        let distance_km = update.distance_km;
        let eta_minutes = update.eta_minutes;
        let accepted =
            self.inner.deliver(move |sink, order_id| sink.on_location(order_id, update));
        if !accepted {
            debug!(order_id = %self.inner.order_id, "location_not_accepted");
            return;
        }
        self.gate.commit_location(sample, now);
        self.metrics.record_location_delivered(received_at.elapsed().as_micros() as u64);
        debug!(
            order_id = %self.inner.order_id,
            distance_km = format!("{:.3}", distance_km),
            eta_minutes = %eta_minutes,
            "location_delivered"
        );
    }

    /// Attach distance, ETA and proximity status to a sample
    fn enrich(&mut self, sample: LocationSample) -> LocationUpdate {
        let speed_kmh = if sample.speed_mps > 0.0 {
            sample.speed_kmh()
        } else {
            self.estimator.average_speed(self.history.make_contiguous())
        };
        let distance_km = self.estimator.distance_km(
            sample.latitude,
            sample.longitude,
            self.destination.lat,
            self.destination.lon,
        );
        let eta = self.estimator.estimate_time(distance_km, Some(speed_kmh), self.vehicle);
        let status = self.estimator.derive_status(distance_km * 1000.0, speed_kmh);
        LocationUpdate { sample, distance_km, eta_minutes: eta.minutes, eta, status, speed_kmh }
    }

    fn handle_status(&mut self, raw: Value) {
        if !self.gate.status_changed(&raw) {
            self.metrics.record_status(false);
            debug!(order_id = %self.inner.order_id, "status_duplicate");
            return;
        }
        let Some(event) = decode_status(&raw, epoch_ms()) else {
            debug!(order_id = %self.inner.order_id, "status_invalid");
            return;
        };
        let label = event.status.as_str().to_string();
        if !self.inner.deliver(move |sink, order_id| sink.on_status(order_id, event)) {
            // Left uncommitted so a repeat of the same status goes out
            warn!(order_id = %self.inner.order_id, status = %label, "status_not_accepted");
            return;
        }
        self.gate.commit_status(raw);
        self.metrics.record_status(true);
        info!(order_id = %self.inner.order_id, status = %label, "status_delivered");
    }
}
