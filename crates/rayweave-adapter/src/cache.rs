//! Mesh-to-adapter cache.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rayweave_core::Instance;

use crate::{Adapter, MeshAdapter};

/// Cache of adapters keyed by mesh identity (`data_index`).
///
/// Adapters are expensive to build (a BVH per mesh) and stateless per
/// call, so one instance serves every placement of its mesh. The hot
/// path is a read lock; only the first miss per mesh takes the write
/// lock. Append-only within a frame.
#[derive(Default)]
pub struct AdapterCache {
    map: RwLock<HashMap<usize, Arc<dyn Adapter>>>,
}

impl AdapterCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adapter for the given instance's mesh, building it on first use.
    pub fn resolve(&self, instance: &Instance) -> Arc<dyn Adapter> {
        if let Some(adapter) = self.map.read().get(&instance.data_index) {
            return adapter.clone();
        }
        let mut map = self.map.write();
        // A racing builder may have beaten us to the write lock.
        map.entry(instance.data_index)
            .or_insert_with(|| Arc::new(MeshAdapter::new(instance.mesh.clone())) as Arc<dyn Adapter>)
            .clone()
    }

    /// Number of cached adapters.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}
