use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use kn_core::config::Config;

use crate::orchestrator::Collaborators;
use crate::session::PipelineHandle;

/// Live sessions by id. Each caller owns its registry; there is no global.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<Uuid, Arc<PipelineHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a session that has not been started yet.
    pub fn create(&self, config: Config, collab: Collaborators) -> Arc<PipelineHandle> {
        self.insert(PipelineHandle::new(config, collab))
    }

    pub fn insert(&self, handle: PipelineHandle) -> Arc<PipelineHandle> {
        let handle = Arc::new(handle);
        self.sessions.insert(handle.id(), handle.clone());
        handle
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<PipelineHandle>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Drop a session from the registry, stopping it if it is still running.
    pub fn remove(&self, id: &Uuid) -> Option<Arc<PipelineHandle>> {
        let (_, handle) = self.sessions.remove(id)?;
        handle.stop();
        Some(handle)
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
