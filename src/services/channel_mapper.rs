//! Order id <-> store channel id correlation
//!
//! Order ids are issued by the client, channel ids by the allocator; the
//! two namespaces are independent. A mapping, once created, is reused for
//! the lifetime of the order so reconnects land on the same channel, and
//! the table is snapshotted to durable storage so restarts do too.
//!
//! Storage failures never fail a resolve: the mapper logs them and keeps
//! running in memory only for the rest of the process.

use crate::domain::error::{TrackingError, TrackingResult};
use crate::domain::types::{ChannelId, OrderId};
use crate::infra::config::Config;
use crate::io::mapping_storage::{JsonFileStorage, MappingStorage, MappingTable, NullStorage};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Source of fresh channel ids
pub trait ChannelAllocator: Send + Sync {
    /// Allocate a channel for `order_id`, or `None` when exhausted
    fn allocate(&self, order_id: &OrderId) -> Option<ChannelId>;

    /// Return a channel that is no longer mapped
    fn release(&self, _channel: &ChannelId) {}

    /// Mark a channel restored from storage as in use
    fn reserve(&self, _channel: &ChannelId) {}
}

/// Time-sortable UUIDv7 channel ids, never exhausted
pub struct UuidAllocator;

impl ChannelAllocator for UuidAllocator {
    fn allocate(&self, _order_id: &OrderId) -> Option<ChannelId> {
        Some(ChannelId(Uuid::now_v7().to_string()))
    }
}

/// Fixed pool of pre-provisioned channels handed out first-free
pub struct PoolAllocator {
    free: Mutex<VecDeque<ChannelId>>,
}

impl PoolAllocator {
    pub fn new(channels: impl IntoIterator<Item = String>) -> Self {
        Self { free: Mutex::new(channels.into_iter().map(ChannelId).collect()) }
    }

    pub fn available(&self) -> usize {
        self.free.lock().len()
    }
}

impl ChannelAllocator for PoolAllocator {
    fn allocate(&self, _order_id: &OrderId) -> Option<ChannelId> {
        self.free.lock().pop_front()
    }

    fn release(&self, channel: &ChannelId) {
        let mut free = self.free.lock();
        if !free.contains(channel) {
            free.push_back(channel.clone());
        }
    }

    fn reserve(&self, channel: &ChannelId) {
        self.free.lock().retain(|c| c != channel);
    }
}

#[derive(Default)]
struct Tables {
    forward: FxHashMap<OrderId, ChannelId>,
    reverse: FxHashMap<ChannelId, OrderId>,
}

/// Bidirectional order/channel mapping with durable snapshots
pub struct OrderChannelMapper {
    tables: RwLock<Tables>,
    allocator: Box<dyn ChannelAllocator>,
    storage: Box<dyn MappingStorage>,
    /// Serializes snapshot writes
    persist_lock: Mutex<()>,
    /// Cleared after the first storage failure
    durable: AtomicBool,
}

impl OrderChannelMapper {
    pub fn new(allocator: Box<dyn ChannelAllocator>, storage: Box<dyn MappingStorage>) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            allocator,
            storage,
            persist_lock: Mutex::new(()),
            durable: AtomicBool::new(true),
        }
    }

    /// In-memory mapper with UUID channels
    pub fn in_memory() -> Self {
        Self::new(Box::new(UuidAllocator), Box::new(NullStorage))
    }

    /// Build from configuration and restore any persisted table
    pub fn from_config(config: &Config) -> Self {
        let allocator: Box<dyn ChannelAllocator> = if config.mapper_channel_pool().is_empty() {
            Box::new(UuidAllocator)
        } else {
            Box::new(PoolAllocator::new(config.mapper_channel_pool().iter().cloned()))
        };
        let storage: Box<dyn MappingStorage> = if config.mapper_file().is_empty() {
            Box::new(NullStorage)
        } else {
            Box::new(JsonFileStorage::new(config.mapper_file()))
        };

        let mapper = Self::new(allocator, storage);
        mapper.load();
        mapper
    }

    /// Return the channel for `order_id`, allocating and persisting one on
    /// first use. Repeated calls return the same channel.
    pub fn resolve(&self, order_id: &OrderId) -> TrackingResult<ChannelId> {
        if order_id.as_str().trim().is_empty() {
            return Err(TrackingError::InvalidOrderId(order_id.to_string()));
        }

        if let Some(channel) = self.tables.read().forward.get(order_id) {
            return Ok(channel.clone());
        }

        let channel = {
            let mut tables = self.tables.write();
            // Another resolver may have won the race for this order
            if let Some(channel) = tables.forward.get(order_id) {
                return Ok(channel.clone());
            }

            let channel = self.allocator.allocate(order_id).ok_or_else(|| {
                TrackingError::Resolution {
                    order_id: order_id.to_string(),
                    reason: "no channel available".to_string(),
                }
            })?;

            if let Some(owner) = tables.reverse.get(&channel) {
                return Err(TrackingError::Resolution {
                    order_id: order_id.to_string(),
                    reason: format!("channel {channel} already mapped to order {owner}"),
                });
            }

            tables.forward.insert(order_id.clone(), channel.clone());
            tables.reverse.insert(channel.clone(), order_id.clone());
            channel
        };

        info!(order_id = %order_id, channel_id = %channel, "channel_allocated");
        self.persist();
        Ok(channel)
    }

    /// Look up a mapping without allocating
    pub fn channel_for(&self, order_id: &OrderId) -> Option<ChannelId> {
        self.tables.read().forward.get(order_id).cloned()
    }

    pub fn reverse_lookup(&self, channel: &ChannelId) -> Option<OrderId> {
        self.tables.read().reverse.get(channel).cloned()
    }

    /// Drop the mapping for a finished order and recycle its channel
    pub fn release(&self, order_id: &OrderId) -> Option<ChannelId> {
        let channel = {
            let mut tables = self.tables.write();
            let channel = tables.forward.remove(order_id)?;
            tables.reverse.remove(&channel);
            channel
        };
        self.allocator.release(&channel);
        info!(order_id = %order_id, channel_id = %channel, "channel_released");
        self.persist();
        Some(channel)
    }

    pub fn len(&self) -> usize {
        self.tables.read().forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether snapshots are still being written
    pub fn is_durable(&self) -> bool {
        self.durable.load(Ordering::Relaxed)
    }

    /// Snapshot the table to storage. Returns false when nothing was written.
    pub fn persist(&self) -> bool {
        if !self.is_durable() {
            return false;
        }
        let _guard = self.persist_lock.lock();
        let snapshot: MappingTable = self
            .tables
            .read()
            .forward
            .iter()
            .map(|(o, c)| (o.clone(), c.clone()))
            .collect();

        match self.storage.save(&snapshot) {
            Ok(()) => true,
            Err(e) => {
                self.durable.store(false, Ordering::Relaxed);
                error!(error = %e, entries = %snapshot.len(), "mapping_persist_failed_in_memory_only");
                false
            }
        }
    }

    /// Restore persisted mappings. Returns the number of entries restored.
    pub fn load(&self) -> usize {
        let table = match self.storage.load() {
            Ok(t) => t,
            Err(e) => {
                // Keep the unreadable snapshot intact rather than overwrite it
                self.durable.store(false, Ordering::Relaxed);
                warn!(error = %e, "mapping_load_failed_in_memory_only");
                return 0;
            }
        };

        let mut restored = 0;
        let mut tables = self.tables.write();
        for (order_id, channel) in table {
            if tables.forward.contains_key(&order_id) || tables.reverse.contains_key(&channel) {
                debug!(order_id = %order_id, channel_id = %channel, "mapping_load_skipped_duplicate");
                continue;
            }
            self.allocator.reserve(&channel);
            tables.reverse.insert(channel.clone(), order_id.clone());
            tables.forward.insert(order_id, channel);
            restored += 1;
        }
        info!(entries = %restored, "mapping_table_loaded");
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Arc;
    use tempfile::tempdir;

    struct FailingStorage;

    impl MappingStorage for FailingStorage {
        fn load(&self) -> io::Result<MappingTable> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"))
        }

        fn save(&self, _table: &MappingTable) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"))
        }
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let mapper = OrderChannelMapper::in_memory();
        let order = OrderId::new("order-42");
        let first = mapper.resolve(&order).unwrap();
        for _ in 0..4 {
            assert_eq!(mapper.resolve(&order).unwrap(), first);
        }
        assert_eq!(mapper.reverse_lookup(&first), Some(order));
        assert_eq!(mapper.len(), 1);
    }

    #[test]
    fn test_distinct_orders_get_distinct_channels() {
        let mapper = OrderChannelMapper::in_memory();
        let a = mapper.resolve(&OrderId::new("a")).unwrap();
        let b = mapper.resolve(&OrderId::new("b")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_empty_order_id_rejected() {
        let mapper = OrderChannelMapper::in_memory();
        assert!(matches!(
            mapper.resolve(&OrderId::new("  ")),
            Err(TrackingError::InvalidOrderId(_))
        ));
        assert!(mapper.is_empty());
    }

    #[test]
    fn test_pool_exhaustion_is_resolution_failure() {
        let pool = PoolAllocator::new(vec!["ch-1".to_string()]);
        let mapper = OrderChannelMapper::new(Box::new(pool), Box::new(NullStorage));
        assert_eq!(mapper.resolve(&OrderId::new("a")).unwrap().as_str(), "ch-1");
        assert!(matches!(
            mapper.resolve(&OrderId::new("b")),
            Err(TrackingError::Resolution { .. })
        ));

        // Releasing recycles the channel
        assert_eq!(mapper.release(&OrderId::new("a")).unwrap().as_str(), "ch-1");
        assert_eq!(mapper.resolve(&OrderId::new("b")).unwrap().as_str(), "ch-1");
        assert_eq!(mapper.reverse_lookup(&ChannelId("ch-1".to_string())), Some(OrderId::new("b")));
    }

    #[test]
    fn test_mapping_survives_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("channels.json");

        let channel = {
            let mapper = OrderChannelMapper::new(
                Box::new(UuidAllocator),
                Box::new(JsonFileStorage::new(&path)),
            );
            mapper.resolve(&OrderId::new("order-9")).unwrap()
        };

        let restarted =
            OrderChannelMapper::new(Box::new(UuidAllocator), Box::new(JsonFileStorage::new(&path)));
        assert_eq!(restarted.load(), 1);
        assert_eq!(restarted.resolve(&OrderId::new("order-9")).unwrap(), channel);
    }

    #[test]
    fn test_loaded_pool_channels_are_reserved() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("channels.json");
        let mut table = MappingTable::new();
        table.insert(OrderId::new("old"), ChannelId("ch-1".to_string()));
        JsonFileStorage::new(&path).save(&table).unwrap();

        let pool = PoolAllocator::new(vec!["ch-1".to_string(), "ch-2".to_string()]);
        let mapper = OrderChannelMapper::new(Box::new(pool), Box::new(JsonFileStorage::new(&path)));
        mapper.load();
        assert_eq!(mapper.resolve(&OrderId::new("new")).unwrap().as_str(), "ch-2");
    }

    #[test]
    fn test_storage_failure_degrades_to_memory() {
        let mapper = OrderChannelMapper::new(Box::new(UuidAllocator), Box::new(FailingStorage));
        assert_eq!(mapper.load(), 0);
        assert!(!mapper.is_durable());

        let channel = mapper.resolve(&OrderId::new("order-1")).unwrap();
        assert_eq!(mapper.resolve(&OrderId::new("order-1")).unwrap(), channel);
        assert!(!mapper.persist());
    }

    #[test]
    fn test_concurrent_resolve_same_order() {
        let mapper = Arc::new(OrderChannelMapper::in_memory());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mapper = mapper.clone();
                std::thread::spawn(move || mapper.resolve(&OrderId::new("shared")).unwrap())
            })
            .collect();
        let channels: Vec<ChannelId> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(channels.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(mapper.len(), 1);
    }
}
