//! MQTT-backed real-time store
//!
//! Store paths map one-to-one onto MQTT topics:
//! - `set` publishes the JSON value retained at QoS 1
//! - `subscribe` fans matching publishes out to feeds
//! - `get_snapshot` returns the last value seen, or waits briefly for the
//!   broker to deliver the retained one
//!
//! The eventloop reconnects on its own; while the link is down every open
//! feed receives `FeedEvent::Error` and keeps its state.

use crate::domain::error::StoreError;
use crate::infra::config::Config;
use crate::io::store::{Feed, FeedEvent, FeedId, RealtimeStore, FEED_BUFFER};
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

type FeedTable = FxHashMap<String, Vec<(FeedId, mpsc::Sender<FeedEvent>)>>;

/// State shared between the client handle and the eventloop task
#[derive(Default)]
struct Shared {
    feeds: Mutex<FeedTable>,
    latest: Mutex<FxHashMap<String, Value>>,
    connected: AtomicBool,
}

impl Shared {
    fn deliver(&self, topic: &str, event: FeedEvent) {
        let mut feeds = self.feeds.lock();
        let Some(list) = feeds.get_mut(topic) else { return };
        list.retain(|(id, tx)| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(topic = %topic, feed = %id.0, "mqtt_store_feed_full");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    fn broadcast_error(&self, error: StoreError) {
        let topics: Vec<String> = self.feeds.lock().keys().cloned().collect();
        for topic in topics {
            self.deliver(&topic, FeedEvent::Error(error.clone()));
        }
    }
}

/// Real-time store client over an MQTT broker
pub struct MqttStore {
    client: AsyncClient,
    shared: Arc<Shared>,
    snapshot_timeout: Duration,
}

impl MqttStore {
    /// Create the client and spawn its eventloop on the current runtime
    pub fn connect(config: &Config) -> Self {
        let mut options =
            MqttOptions::new(config.store_client_id(), config.store_host(), config.store_port());
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);

        if let (Some(username), Some(password)) = (config.store_username(), config.store_password())
        {
            options.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(options, 100);
        let shared = Arc::new(Shared::default());

        tokio::spawn(run_eventloop(eventloop, client.clone(), shared.clone()));

        info!(
            host = %config.store_host(),
            port = %config.store_port(),
            client_id = %config.store_client_id(),
            "mqtt_store_started"
        );

        Self {
            client,
            shared,
            snapshot_timeout: Duration::from_millis(config.store_snapshot_timeout_ms()),
        }
    }

    fn register(&self, path: &str) -> (Feed, bool) {
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let id = FeedId::next();
        let cached = self.shared.latest.lock().get(path).cloned();
        if let Some(latest) = cached {
            let _ = tx.try_send(FeedEvent::Value(latest));
        }
        let mut feeds = self.shared.feeds.lock();
        let list = feeds.entry(path.to_string()).or_default();
        let first = list.is_empty();
        list.push((id, tx));
        (Feed::new(id, path, rx), first)
    }
}

async fn run_eventloop(mut eventloop: EventLoop, client: AsyncClient, shared: Arc<Shared>) {
    // Rate-limit repeated connection errors to one warning per 10 seconds
    let mut last_error_log = Instant::now() - Duration::from_secs(20);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                shared.connected.store(true, Ordering::Relaxed);
                // Clean session: restore broker-side subscriptions for open feeds
                let topics: Vec<String> = shared.feeds.lock().keys().cloned().collect();
                for topic in &topics {
                    if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                        warn!(topic = %topic, error = %e, "mqtt_store_resubscribe_failed");
                    }
                }
                info!(topics = %topics.len(), "mqtt_store_connected");
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let value: Value = match serde_json::from_slice(&publish.payload) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!(topic = %publish.topic, error = %e, "mqtt_store_invalid_payload");
                        continue;
                    }
                };
                shared.latest.lock().insert(publish.topic.clone(), value.clone());
                shared.deliver(&publish.topic, FeedEvent::Value(value));
            }
            Ok(_) => {}
            Err(e) => {
                shared.connected.store(false, Ordering::Relaxed);
                if last_error_log.elapsed() > Duration::from_secs(10) {
                    error!(error = %e, "mqtt_store_error");
                    last_error_log = Instant::now();
                }
                shared.broadcast_error(StoreError::Connectivity(e.to_string()));
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[async_trait]
impl RealtimeStore for MqttStore {
    async fn subscribe(&self, path: &str) -> Result<Feed, StoreError> {
        let (feed, first) = self.register(path);
        if first {
            if let Err(e) = self.client.subscribe(path, QoS::AtLeastOnce).await {
                self.unsubscribe(path, feed.id());
                return Err(StoreError::Connectivity(e.to_string()));
            }
        }
        debug!(path = %path, feed = %feed.id().0, "mqtt_store_subscribed");
        Ok(feed)
    }

    fn unsubscribe(&self, path: &str, feed: FeedId) {
        let mut feeds = self.shared.feeds.lock();
        let Some(list) = feeds.get_mut(path) else { return };
        list.retain(|(id, _)| *id != feed);
        if list.is_empty() {
            feeds.remove(path);
            if let Err(e) = self.client.try_unsubscribe(path) {
                debug!(path = %path, error = %e, "mqtt_store_unsubscribe_failed");
            }
        }
    }

    async fn get_snapshot(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let cached = self.shared.latest.lock().get(path).cloned();
        if cached.is_some() {
            return Ok(cached);
        }

        let mut feed = self.subscribe(path).await?;
        let waited = tokio::time::timeout(self.snapshot_timeout, async {
            while let Some(event) = feed.recv().await {
                if let FeedEvent::Value(v) = event {
                    return Some(v);
                }
            }
            None
        })
        .await;
        self.unsubscribe(path, feed.id());

        match waited {
            Ok(value) => Ok(value),
            // Connected but nothing retained at this path
            Err(_) if self.is_connected() => Ok(None),
            Err(_) => Err(StoreError::Timeout(self.snapshot_timeout.as_millis() as u64)),
        }
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let payload = serde_json::to_vec(&value)?;
        self.client
            .publish(path, QoS::AtLeastOnce, true, payload)
            .await
            .map_err(|e| StoreError::Connectivity(e.to_string()))?;
        self.shared.latest.lock().insert(path.to_string(), value);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }
}
