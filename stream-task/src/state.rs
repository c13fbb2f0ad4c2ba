use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::StateError;

/// The durable local processor state collaborator (spec §6, flush semantics only — the backend
/// and its storage format are out of scope). `StreamTask::commit` calls `flush` first in the
/// commit protocol (spec §4.7) so replaying from an older committed offset after a crash finds
/// idempotent, already-durable state.
///
/// Also doubles as the register/get facade `ProcessorContext::state_manager()` exposes to user
/// nodes for local state stores (spec §4.6): stores are registered by name and retrieved as
/// type-erased `Any`, downcast by the caller to the concrete store type it registered.
#[async_trait]
pub trait StateManager: Send + Sync {
    async fn flush(&self) -> Result<(), StateError>;

    fn register_store(&self, name: &str, store: Arc<dyn Any + Send + Sync>);

    fn get_store(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>>;
}

/// An in-process `StateManager` backed by a `HashMap`. Suitable as the default for topologies
/// whose "durability" is handled entirely by the surrounding changelog/compaction machinery
/// (out of scope here); `flush` is a no-op that always succeeds.
#[derive(Default)]
pub struct InMemoryStateManager {
    stores: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl InMemoryStateManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateManager for InMemoryStateManager {
    async fn flush(&self) -> Result<(), StateError> {
        Ok(())
    }

    fn register_store(&self, name: &str, store: Arc<dyn Any + Send + Sync>) {
        self.stores
            .lock()
            .expect("state manager lock poisoned")
            .insert(name.to_string(), store);
    }

    fn get_store(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.stores
            .lock()
            .expect("state manager lock poisoned")
            .get(name)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[tokio::test]
    async fn register_and_get_round_trips_a_typed_store() {
        let manager = InMemoryStateManager::new();
        let store: Arc<dyn Any + Send + Sync> = Arc::new(StdMutex::new(HashMap::<String, i64>::new()));
        manager.register_store("counts", store);

        let fetched = manager.get_store("counts").expect("store should be registered");
        let counts = fetched
            .downcast_ref::<StdMutex<HashMap<String, i64>>>()
            .expect("wrong store type");
        counts.lock().unwrap().insert("a".to_string(), 1);
        assert_eq!(*counts.lock().unwrap().get("a").unwrap(), 1);
    }

    #[tokio::test]
    async fn get_of_unregistered_store_is_none() {
        let manager = InMemoryStateManager::new();
        assert!(manager.get_store("missing").is_none());
    }

    #[tokio::test]
    async fn flush_always_succeeds() {
        let manager = InMemoryStateManager::new();
        manager.flush().await.expect("in-memory flush never fails");
    }
}
