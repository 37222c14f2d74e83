//! Real-time key/value store contract
//!
//! The backing store addresses values by slash-separated paths and offers
//! subscribe / one-shot snapshot / set primitives. It guarantees nothing
//! beyond eventually delivering the latest value at a path; reconnects and
//! retries are the client's concern.

use crate::domain::error::StoreError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Buffer size for a single subscription feed
pub const FEED_BUFFER: usize = 64;

/// Default time to wait before declaring the link degraded
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(15);

static NEXT_FEED_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one subscription so it can be unregistered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FeedId(pub u64);

impl FeedId {
    pub fn next() -> Self {
        FeedId(NEXT_FEED_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Item delivered on a subscription feed
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// Latest raw value at the path
    Value(Value),
    /// Transient failure; the feed stays open
    Error(StoreError),
    /// The store will never deliver on this feed again
    Disconnected(String),
}

/// Receiving half of a subscription
#[derive(Debug)]
pub struct Feed {
    id: FeedId,
    path: String,
    rx: mpsc::Receiver<FeedEvent>,
}

impl Feed {
    pub fn new(id: FeedId, path: impl Into<String>, rx: mpsc::Receiver<FeedEvent>) -> Self {
        Self { id, path: path.into(), rx }
    }

    pub fn id(&self) -> FeedId {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Next event, or `None` once the store dropped the sending side
    pub async fn recv(&mut self) -> Option<FeedEvent> {
        self.rx.recv().await
    }
}

/// Client for the external real-time store
#[async_trait]
pub trait RealtimeStore: Send + Sync {
    /// Open a feed on `path`. Stores with a current value deliver it first.
    async fn subscribe(&self, path: &str) -> Result<Feed, StoreError>;

    /// Unregister a feed. Unknown ids are ignored.
    fn unsubscribe(&self, path: &str, feed: FeedId);

    /// One-shot read of the value at `path`
    async fn get_snapshot(&self, path: &str) -> Result<Option<Value>, StoreError>;

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError>;

    /// Current link state as seen by the client
    fn is_connected(&self) -> bool;
}

/// Outcome of a connectivity probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    /// Probe timed out; keep operating and let the client retry
    Degraded,
}

/// Wait up to `timeout` for the store to report a live link.
///
/// A timeout yields `Degraded`, never an error.
pub async fn probe_link(store: &dyn RealtimeStore, timeout: Duration) -> LinkState {
    let poll = Duration::from_millis(250);
    let waited = tokio::time::timeout(timeout, async {
        while !store.is_connected() {
            tokio::time::sleep(poll).await;
        }
    })
    .await;

    match waited {
        Ok(()) => {
            info!("store_link_connected");
            LinkState::Connected
        }
        Err(_) => {
            warn!(timeout_ms = %timeout.as_millis(), "store_link_degraded");
            LinkState::Degraded
        }
    }
}
