//! In-process real-time store
//!
//! Keeps the latest value per path and fans out writes to live feeds.
//! Used by the simulator and tests; also a reference for the semantics the
//! tracking layer expects from a real backend.

use crate::domain::error::StoreError;
use crate::io::store::{Feed, FeedEvent, FeedId, RealtimeStore, FEED_BUFFER};
use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

#[derive(Default)]
struct PathState {
    latest: Option<Value>,
    feeds: Vec<(FeedId, mpsc::Sender<FeedEvent>)>,
}

/// Latest-value store held in memory
pub struct MemoryStore {
    paths: Mutex<FxHashMap<String, PathState>>,
    connected: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self { paths: Mutex::new(FxHashMap::default()), connected: AtomicBool::new(true) }
    }

    /// Toggle the reported link state; writes are refused while down
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    /// Push a transient error to every feed on `path`
    pub fn inject_error(&self, path: &str, error: StoreError) {
        self.broadcast(path, FeedEvent::Error(error));
    }

    /// Signal permanent disconnection to every feed on `path` and drop them
    pub fn disconnect(&self, path: &str, reason: &str) {
        self.broadcast(path, FeedEvent::Disconnected(reason.to_string()));
        if let Some(state) = self.paths.lock().get_mut(path) {
            state.feeds.clear();
        }
    }

    /// Number of live feeds on `path`
    pub fn feed_count(&self, path: &str) -> usize {
        self.paths.lock().get(path).map(|s| s.feeds.len()).unwrap_or(0)
    }

    fn broadcast(&self, path: &str, event: FeedEvent) {
        let mut paths = self.paths.lock();
        let Some(state) = paths.get_mut(path) else { return };
        state.feeds.retain(|(id, tx)| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(path = %path, feed = %id.0, "memory_store_feed_full");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }
}

#[async_trait]
impl RealtimeStore for MemoryStore {
    async fn subscribe(&self, path: &str) -> Result<Feed, StoreError> {
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let id = FeedId::next();
        let mut paths = self.paths.lock();
        let state = paths.entry(path.to_string()).or_default();
        if let Some(ref latest) = state.latest {
            // Fresh channel with FEED_BUFFER capacity, cannot be full
            let _ = tx.try_send(FeedEvent::Value(latest.clone()));
        }
        state.feeds.push((id, tx));
        debug!(path = %path, feed = %id.0, "memory_store_subscribed");
        Ok(Feed::new(id, path, rx))
    }

    fn unsubscribe(&self, path: &str, feed: FeedId) {
        if let Some(state) = self.paths.lock().get_mut(path) {
            state.feeds.retain(|(id, _)| *id != feed);
        }
    }

    async fn get_snapshot(&self, path: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.paths.lock().get(path).and_then(|s| s.latest.clone()))
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        if !self.is_connected() {
            return Err(StoreError::Connectivity("link down".to_string()));
        }
        self.paths.lock().entry(path.to_string()).or_default().latest = Some(value.clone());
        self.broadcast(path, FeedEvent::Value(value));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}
