//! Container-scoped state

use super::SchedulerContext;
use dashmap::DashMap;
use std::sync::Arc;

/// A value with one independent instance per container
///
/// Lookups go through the calling carrier's current container, so code that
/// runs inside `a.run(..)` sees `a`'s instance and never `b`'s. Instances are
/// created with `T::default()` on first access.
pub struct ContainerLocal<T> {
    values: DashMap<u64, Arc<T>>,
}

impl<T: Default + Send + Sync> Default for ContainerLocal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Default + Send + Sync> ContainerLocal<T> {
    pub fn new() -> Self {
        Self {
            values: DashMap::new(),
        }
    }

    /// Instance for the calling carrier's current container
    pub fn get(&self, ctx: &SchedulerContext) -> Arc<T> {
        self.for_container(ctx.current_container().id())
    }

    pub fn with<R>(&self, ctx: &SchedulerContext, f: impl FnOnce(&T) -> R) -> R {
        f(&self.get(ctx))
    }

    /// Instance for a specific container id
    pub fn for_container(&self, container_id: u64) -> Arc<T> {
        self.values
            .entry(container_id)
            .or_insert_with(|| Arc::new(T::default()))
            .value()
            .clone()
    }

    /// Drop a container's instance, e.g. after it was destroyed
    pub fn remove(&self, container_id: u64) -> Option<Arc<T>> {
        self.values.remove(&container_id).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
