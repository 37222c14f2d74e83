//! Durable storage for the order -> channel mapping table
//!
//! The table is small and written whole on every change. The JSON file is
//! written to a sibling temp file and renamed into place so a crash never
//! leaves a truncated table behind.

use crate::domain::types::{ChannelId, OrderId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

pub type MappingTable = BTreeMap<OrderId, ChannelId>;

/// Backend the channel mapper snapshots its table into
pub trait MappingStorage: Send + Sync {
    fn load(&self) -> io::Result<MappingTable>;

    fn save(&self, table: &MappingTable) -> io::Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct MappingFile {
    version: u32,
    channels: MappingTable,
}

/// Mapping table stored as a JSON document on disk
pub struct JsonFileStorage {
    path: PathBuf,
}

impl JsonFileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MappingStorage for JsonFileStorage {
    fn load(&self) -> io::Result<MappingTable> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(MappingTable::new()),
            Err(e) => return Err(e),
        };
        let file: MappingFile = serde_json::from_str(&content)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(file.channels)
    }

    fn save(&self, table: &MappingTable) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = MappingFile { version: 1, channels: table.clone() };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        fs::write(&tmp, json.as_bytes())?;
        fs::rename(&tmp, &self.path)?;

        debug!(file = %self.path.display(), entries = %table.len(), "mapping_table_saved");
        Ok(())
    }
}

/// Storage that keeps nothing; the mapper runs purely in memory
pub struct NullStorage;

impl MappingStorage for NullStorage {
    fn load(&self) -> io::Result<MappingTable> {
        Ok(MappingTable::new())
    }

    fn save(&self, _table: &MappingTable) -> io::Result<()> {
        Ok(())
    }
}
