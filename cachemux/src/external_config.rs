//! The external configuration-coordination surface. A real deployment backs
//! this with something like etcd or ZooKeeper to push server-list changes
//! out to every client; this crate ships only an in-memory stub
//! implementation, used by tests, plus the trait boundary.

use std::sync::Arc;

use parking_lot::Mutex;

/// Receives server-list (or other barrier data) updates pushed by a
/// `ConfigCoordinator`.
pub trait ConfigListener: Send + Sync {
    fn on_update(&self, data: &str);
}

/// Registers barriers and pushes data to their listeners. Mirrors the
/// register/set/unregister shape of a ZooKeeper-style watch.
pub trait ConfigCoordinator: Send + Sync {
    fn register_barrier(&self, name: &str, listener: Arc<dyn ConfigListener>);
    fn set_data(&self, name: &str, data: &str);
    fn unregister_barrier(&self, name: &str);
}

/// An in-process, non-networked `ConfigCoordinator` for tests: `set_data`
/// immediately invokes every listener registered under that barrier name.
#[derive(Default)]
pub struct InMemoryConfigCoordinator {
    barriers: Mutex<std::collections::HashMap<String, Vec<Arc<dyn ConfigListener>>>>,
}

impl InMemoryConfigCoordinator {
    pub fn new() -> Self {
        InMemoryConfigCoordinator {
            barriers: Mutex::new(std::collections::HashMap::new()),
        }
    }
}

impl ConfigCoordinator for InMemoryConfigCoordinator {
    fn register_barrier(&self, name: &str, listener: Arc<dyn ConfigListener>) {
        self.barriers
            .lock()
            .entry(name.to_string())
            .or_default()
            .push(listener);
    }

    fn set_data(&self, name: &str, data: &str) {
        if let Some(listeners) = self.barriers.lock().get(name) {
            for listener in listeners {
                listener.on_update(data);
            }
        }
    }

    fn unregister_barrier(&self, name: &str) {
        self.barriers.lock().remove(name);
    }
}
