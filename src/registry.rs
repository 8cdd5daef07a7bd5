use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;

pub const DEFAULT_STORE: &str = "default";

/// Manages per-store engines. Each store gets its own Engine, WAL file and
/// compactor task. Connections pick a store with `USE <name>`.
pub struct StoreManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    lock_timeout: Duration,
}

impl StoreManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, lock_timeout: Duration) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            lock_timeout,
        }
    }

    /// Get or lazily create the engine for `store`.
    ///
    /// Engines are keyed by the sanitized name, so every spelling that maps to
    /// the same WAL file shares one engine.
    pub fn get_or_create(&self, store: &str) -> io::Result<Arc<Engine>> {
        if store.len() > MAX_STORE_NAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "store name too long",
            ));
        }

        // Path traversal guard
        let safe_name: String = store
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty store name",
            ));
        }

        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_STORES {
            return Err(io::Error::other("too many stores"));
        }

        // Replay happens outside the map's shard lock. Two racing first users
        // both open, the loser's engine is dropped unused.
        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let opened = Arc::new(Engine::new(wal_path, self.lock_timeout)?);
        let engine = match self.engines.entry(safe_name.clone()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(slot) => slot.insert(opened).value().clone(),
        };

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        tracing::info!("opened store {safe_name}");
        metrics::gauge!(crate::observability::STORES_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }

    pub fn store_count(&self) -> usize {
        self.engines.len()
    }
}
