use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::engine::Engine;
use crate::limits::*;
use crate::model::Ms;
use crate::notify::NotifyHub;
use crate::reaper;

/// Manages per-property engines. Each property gets its own Engine + WAL +
/// reaper. Property = database name from the pgwire connection.
pub struct PropertyManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    hold_ttl_ms: Ms,
    shutdown: CancellationToken,
}

impl PropertyManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, hold_ttl_ms: Ms) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            hold_ttl_ms,
            shutdown: CancellationToken::new(),
        }
    }

    /// Get or lazily create an engine for the given property.
    pub fn get_or_create(&self, property: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(property) {
            return Ok(engine.value().clone());
        }
        if property.len() > MAX_PROPERTY_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "property name too long",
            ));
        }
        if self.engines.len() >= MAX_PROPERTIES {
            return Err(std::io::Error::other("too many properties"));
        }

        // Sanitize property name to prevent path traversal
        let safe_name: String = property
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty property name",
            ));
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(wal_path, notify, self.hold_ttl_ms)?);

        // Spawn reaper + compactor for this property
        let reaper_engine = engine.clone();
        let reaper_token = self.shutdown.child_token();
        tokio::spawn(async move {
            reaper::run_reaper(reaper_engine, reaper_token).await;
        });
        let compactor_engine = engine.clone();
        let compactor_token = self.shutdown.child_token();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            reaper::run_compactor(compactor_engine, threshold, compactor_token).await;
        });

        self.engines.insert(property.to_string(), engine.clone());
        metrics::gauge!(crate::observability::PROPERTIES_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }

    /// Stop every property's background tasks. Engines stay usable for
    /// in-flight queries; only the periodic work ends.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
