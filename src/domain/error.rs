//! Error types shared across tracking, store, and device interfaces

use thiserror::Error;

/// Errors raised by a real-time store client
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// Link temporarily unreachable; the client retries internally
    #[error("store connectivity: {0}")]
    Connectivity(String),

    #[error("store operation timed out after {0} ms")]
    Timeout(u64),

    #[error("store payload serialization: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Errors surfaced to tracking callers and sinks
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrackingError {
    #[error("invalid order id: {0:?}")]
    InvalidOrderId(String),

    #[error("invalid destination: {0}")]
    InvalidDestination(String),

    /// Channel id could not be allocated for the order
    #[error("channel resolution failed for order {order_id}: {reason}")]
    Resolution { order_id: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The store signalled that the feed will not deliver again
    #[error("feed permanently disconnected: {0}")]
    Disconnected(String),

    #[error("session stopped")]
    SessionStopped,
}

pub type TrackingResult<T> = Result<T, TrackingError>;

/// Errors from the device geolocation provider
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeoError {
    #[error("location permission denied")]
    PermissionDenied,
}

/// Errors from the notification dispatcher
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    #[error("dispatch failed: {0}")]
    Failed(String),

    #[error("dispatch timed out after {0} ms")]
    Timeout(u64),
}

impl From<StoreError> for DispatchError {
    fn from(e: StoreError) -> Self {
        DispatchError::Failed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_converts_into_tracking_error() {
        let err: TrackingError = StoreError::Timeout(15000).into();
        assert_eq!(err.to_string(), "store operation timed out after 15000 ms");
    }

    #[test]
    fn test_dispatch_timeout_names_budget() {
        assert_eq!(DispatchError::Timeout(3000).to_string(), "dispatch timed out after 3000 ms");
    }

    #[test]
    fn test_resolution_message_names_order() {
        let err = TrackingError::Resolution {
            order_id: "order-7".to_string(),
            reason: "channel pool exhausted".to_string(),
        };
        assert!(err.to_string().contains("order-7"));
        assert!(err.to_string().contains("exhausted"));
    }
}
