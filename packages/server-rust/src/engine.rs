//! The engine: one database, one model registry, one configuration.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use morango_core::capabilities::Capabilities;
use morango_core::messages::MorangoInfo;

use crate::config::EngineConfig;
use crate::registry::SyncableModelRegistry;
use crate::store::Database;

/// Everything a sync participant needs: storage, the frozen model registry,
/// configuration, and the per-session locks that serialize concurrent
/// operations on one sync session.
pub struct SyncEngine {
    db: Arc<Database>,
    registry: Arc<SyncableModelRegistry>,
    config: EngineConfig,
    session_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SyncEngine {
    #[must_use]
    pub fn new(config: EngineConfig, registry: SyncableModelRegistry) -> Arc<Self> {
        let db = Arc::new(Database::new(config.instance_identity.clone()));
        Arc::new(Self {
            db,
            registry: Arc::new(registry),
            config,
            session_locks: DashMap::new(),
        })
    }

    #[must_use]
    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SyncableModelRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.config.capabilities()
    }

    /// Acquire the lock serializing sync operations for one sync session.
    /// Exactly one transfer runs per sync session at a time.
    pub async fn session_lock(&self, sync_session_id: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .session_locks
            .entry(sync_session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// The instance metadata served from `morangoinfo/`.
    #[must_use]
    pub fn morango_info(&self) -> MorangoInfo {
        let instance = self.db.get_or_create_current_instance();
        MorangoInfo {
            instance_hash: instance.get_proquint(),
            instance_id: instance.id,
            capabilities: self.capabilities().into_iter().collect(),
            custom: None,
        }
    }
}
