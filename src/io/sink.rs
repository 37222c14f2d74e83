//! Sink interface exposed to the surrounding application
//!
//! Sessions report through `TrackingSink`. `ChannelSink` is the preferred
//! implementation: it turns every callback into a `TrackingEvent` on a
//! bounded channel so a single consumer loop handles all orders without
//! callback reentrancy. Sends never block the session task; an event the
//! channel cannot take is reported back as not accepted.

use crate::domain::error::TrackingError;
use crate::domain::types::{LocationSample, OrderId, StatusEvent};
use crate::services::eta::{EtaEstimate, ProximityStatus};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

/// Location delivery enriched with distance and ETA
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationUpdate {
    pub sample: LocationSample,
    pub distance_km: f64,
    pub eta_minutes: u32,
    pub eta: EtaEstimate,
    pub status: ProximityStatus,
    /// Speed fed into the estimator (reported, or averaged from history)
    pub speed_kmh: f64,
}

/// Consumer of tracking events for one or more orders.
///
/// Each callback returns whether the event was accepted. Sessions treat a
/// refused location or status as undelivered.
pub trait TrackingSink: Send + Sync {
    fn on_location(&self, order_id: &OrderId, update: LocationUpdate) -> bool;

    fn on_status(&self, order_id: &OrderId, status: StatusEvent) -> bool;

    fn on_error(&self, order_id: &OrderId, error: TrackingError) -> bool;
}

/// Tagged event carried by `ChannelSink`
#[derive(Debug, Clone, PartialEq)]
pub enum TrackingEvent {
    Location { order_id: OrderId, update: LocationUpdate },
    Status { order_id: OrderId, status: StatusEvent },
    Error { order_id: OrderId, error: TrackingError },
}

impl TrackingEvent {
    pub fn order_id(&self) -> &OrderId {
        match self {
            TrackingEvent::Location { order_id, .. }
            | TrackingEvent::Status { order_id, .. }
            | TrackingEvent::Error { order_id, .. } => order_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TrackingEvent::Location { .. } => "location",
            TrackingEvent::Status { .. } => "status",
            TrackingEvent::Error { .. } => "error",
        }
    }
}

/// Non-blocking sink over a bounded mpsc channel
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<TrackingEvent>,
    dropped: Arc<AtomicU64>,
}

impl ChannelSink {
    fn send(&self, event: TrackingEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    order_id = %event.order_id(),
                    kind = %event.kind(),
                    dropped_total = %dropped,
                    "tracking_event_dropped"
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Events dropped because the consumer fell behind
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl TrackingSink for ChannelSink {
    fn on_location(&self, order_id: &OrderId, update: LocationUpdate) -> bool {
        self.send(TrackingEvent::Location { order_id: order_id.clone(), update })
    }

    fn on_status(&self, order_id: &OrderId, status: StatusEvent) -> bool {
        self.send(TrackingEvent::Status { order_id: order_id.clone(), status })
    }

    fn on_error(&self, order_id: &OrderId, error: TrackingError) -> bool {
        self.send(TrackingEvent::Error { order_id: order_id.clone(), error })
    }
}

/// Create a tracking event channel
///
/// Returns the sink (for sessions) and the receiver (for the consumer loop)
pub fn create_tracking_channel(buffer_size: usize) -> (ChannelSink, mpsc::Receiver<TrackingEvent>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (ChannelSink { tx, dropped: Arc::new(AtomicU64::new(0)) }, rx)
}
