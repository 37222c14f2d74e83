//! Courier tracking sessions
//!
//! `TrackingService` owns every active session and the shared collaborators
//! they use:
//! - the real-time store client (location and status feeds)
//! - the order -> channel mapper
//! - the shared distance/ETA estimator
//!
//! At most one session runs per order. Starting a session for an order
//! that already has one stops the old one first.

mod gate;
mod session;
#[cfg(test)]
mod tests;

pub use gate::{DeliveryGate, GateDecision};
pub use session::{SessionHandle, SessionOptions, SessionState};

use crate::domain::error::{TrackingError, TrackingResult};
use crate::domain::types::OrderId;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::sink::TrackingSink;
use crate::io::store::RealtimeStore;
use crate::services::channel_mapper::OrderChannelMapper;
use crate::services::eta::EtaEstimator;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use session::{FeedRegistration, SessionInner, SessionWorker};
use std::sync::Arc;
use tracing::{info, warn};

/// Live sessions by order. A session removes itself when it stops.
pub(crate) type SessionRegistry = Mutex<FxHashMap<OrderId, SessionHandle>>;

pub struct TrackingService {
    store: Arc<dyn RealtimeStore>,
    mapper: Arc<OrderChannelMapper>,
    estimator: Arc<EtaEstimator>,
    metrics: Arc<Metrics>,
    config: Config,
    sessions: Arc<SessionRegistry>,
}

impl TrackingService {
    pub fn new(
        config: Config,
        store: Arc<dyn RealtimeStore>,
        mapper: Arc<OrderChannelMapper>,
        estimator: Arc<EtaEstimator>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            mapper,
            estimator,
            metrics,
            config,
            sessions: Arc::new(Mutex::new(FxHashMap::default())),
        }
    }

    /// Service with a mapper and estimator built from `config`
    pub fn from_config(config: Config, store: Arc<dyn RealtimeStore>, metrics: Arc<Metrics>) -> Self {
        let mapper = Arc::new(OrderChannelMapper::from_config(&config));
        let estimator = Arc::new(EtaEstimator::new(
            config.distance_cache_capacity(),
            config.eta_cache_capacity(),
        ));
        Self::new(config, store, mapper, estimator, metrics)
    }

    /// Start tracking `order_id`, delivering events to `sink`.
    ///
    /// Fails before any subscription is attempted if the destination is
    /// invalid or no channel can be resolved for the order.
    pub async fn start(
        &self,
        order_id: OrderId,
        sink: Arc<dyn TrackingSink>,
        opts: SessionOptions,
    ) -> TrackingResult<SessionHandle> {
        if !opts.destination.is_valid() {
            return Err(TrackingError::InvalidDestination(opts.destination.to_string()));
        }

        let session = SessionHandle::new(SessionInner::new(
            order_id.clone(),
            sink,
            self.store.clone(),
            self.metrics.clone(),
            Arc::downgrade(&self.sessions),
        ));

        let previous = self.sessions.lock().insert(order_id.clone(), session.clone());
        if let Some(previous) = previous {
            info!(order_id = %order_id, "session_replaced");
            previous.stop();
        }

        session.inner.set_state(SessionState::Resolving);
        let channel = match self.mapper.resolve(&order_id) {
            Ok(channel) => channel,
            Err(e) => {
                self.metrics.record_resolution_failure();
                warn!(order_id = %order_id, error = %e, "session_resolution_failed");
                self.discard(&session);
                return Err(e);
            }
        };
        session.inner.set_channel(channel.clone());

        let location_path = self.config.location_path(channel.as_str());
        let status_path = self.config.status_path(channel.as_str());

        let location = match self.store.subscribe(&location_path).await {
            Ok(feed) => feed,
            Err(e) => {
                warn!(order_id = %order_id, path = %location_path, error = %e, "session_subscribe_failed");
                self.discard(&session);
                return Err(e.into());
            }
        };
        let status = match self.store.subscribe(&status_path).await {
            Ok(feed) => feed,
            Err(e) => {
                warn!(order_id = %order_id, path = %status_path, error = %e, "session_subscribe_failed");
                self.store.unsubscribe(&location_path, location.id());
                self.discard(&session);
                return Err(e.into());
            }
        };

        let registration = FeedRegistration {
            location_path,
            location_id: location.id(),
            status_path,
            status_id: status.id(),
        };
        let worker = SessionWorker::new(
            session.inner.clone(),
            &opts,
            &self.config,
            self.estimator.clone(),
            self.metrics.clone(),
        );

        let attached = session
            .inner
            .attach(registration, move || tokio::spawn(worker.run(location, status)));
        if !attached {
            // Stopped or replaced while resolving/subscribing
            self.discard(&session);
            return Err(TrackingError::SessionStopped);
        }

        self.metrics.record_session_started();
        info!(
            order_id = %order_id,
            channel_id = %channel,
            destination = %opts.destination,
            "session_started"
        );
        Ok(session)
    }

    /// Stop the session for `order_id`. Unknown or stopped orders are a no-op.
    pub fn stop(&self, order_id: &OrderId) -> bool {
        let session = self.sessions.lock().remove(order_id);
        session.map(|s| s.stop()).unwrap_or(false)
    }

    /// Stop every session; returns how many were still running
    pub fn stop_all(&self) -> usize {
        let sessions: Vec<SessionHandle> =
            self.sessions.lock().drain().map(|(_, session)| session).collect();
        sessions.iter().filter(|s| s.stop()).count()
    }

    /// Orders with a live session, sorted
    pub fn active_orders(&self) -> Vec<OrderId> {
        // Snapshot first: a sink stopping its own session holds the stop
        // guard while it takes the registry lock.
        let sessions: Vec<SessionHandle> = self.sessions.lock().values().cloned().collect();
        let mut orders: Vec<OrderId> = sessions
            .iter()
            .filter(|s| !s.is_stopped())
            .map(|s| s.order_id().clone())
            .collect();
        orders.sort();
        orders
    }

    pub fn session_state(&self, order_id: &OrderId) -> Option<SessionState> {
        self.sessions.lock().get(order_id).map(|s| s.state())
    }

    pub fn mapper(&self) -> &Arc<OrderChannelMapper> {
        &self.mapper
    }

    pub fn estimator(&self) -> &Arc<EtaEstimator> {
        &self.estimator
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Drop `session` from the registry (if still registered) and stop it
    fn discard(&self, session: &SessionHandle) {
        {
            let mut sessions = self.sessions.lock();
            if sessions.get(session.order_id()).is_some_and(|s| s.same_session(session)) {
                sessions.remove(session.order_id());
            }
        }
        session.stop();
    }
}

impl Drop for TrackingService {
    fn drop(&mut self) {
        self.stop_all();
    }
}
