//! Notification dispatcher contract and implementations
//!
//! - `LogDispatcher` writes each notification to the log
//! - `StoreDispatcher` writes it to `notifications/{order}` on the
//!   real-time store so a remote client can render it

use crate::domain::error::DispatchError;
use crate::infra::config::Config;
use crate::io::store::RealtimeStore;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn notify(&self, title: &str, body: &str, data: Value) -> Result<(), DispatchError>;
}

pub struct LogDispatcher;

#[async_trait]
impl NotificationDispatcher for LogDispatcher {
    async fn notify(&self, title: &str, body: &str, data: Value) -> Result<(), DispatchError> {
        info!(title = %title, body = %body, data = %data, "notification");
        Ok(())
    }
}

/// Publishes notifications on the real-time store
pub struct StoreDispatcher {
    store: Arc<dyn RealtimeStore>,
    path_template: String,
}

impl StoreDispatcher {
    /// `path_template` may contain `{order}`, filled from `data.order_id`
    pub fn new(store: Arc<dyn RealtimeStore>, path_template: impl Into<String>) -> Self {
        Self { store, path_template: path_template.into() }
    }

    pub fn from_config(store: Arc<dyn RealtimeStore>, config: &Config) -> Self {
        Self::new(store, config.notification_path("{order}"))
    }

    fn path_for(&self, data: &Value) -> String {
        let order = data.get("order_id").and_then(Value::as_str).unwrap_or("unknown");
        self.path_template.replace("{order}", order)
    }
}

#[async_trait]
impl NotificationDispatcher for StoreDispatcher {
    async fn notify(&self, title: &str, body: &str, data: Value) -> Result<(), DispatchError> {
        let path = self.path_for(&data);
        let payload = json!({
            "title": title,
            "body": body,
            "data": data,
            "timestamp": crate::domain::epoch_ms(),
        });
        self.store.set(&path, payload).await?;
        Ok(())
    }
}
