//! Scheduler context: root container, container registry and carriers

use super::carrier::{CarrierGuard, CarrierRegistry, CarrierSlot};
use super::{ContainerConfig, ResourceContainer, Shared, ROOT_CONTAINER_ID};
use crate::clock::{Clock, MonotonicClock};
use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::models::ContainerSnapshot;
use crate::observability::{SchedMetrics, StructuredLogger};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-level scheduler state, passed around as `Arc<SchedulerContext>`
///
/// Owns the root container, the registry of all containers ever created and
/// the registry of carrier threads. Contexts are independent: a thread can be
/// a carrier of several contexts, each with its own slot.
pub struct SchedulerContext {
    id: u64,
    shared: Arc<Shared>,
    root: Arc<ResourceContainer>,
    containers: DashMap<u64, Arc<ResourceContainer>>,
    next_container_id: AtomicU64,
}

impl SchedulerContext {
    /// Context on the monotonic clock
    pub fn new(config: SchedulerConfig) -> Arc<Self> {
        Self::with_clock(config, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(config: SchedulerConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(Shared {
            config,
            clock,
            carriers: Arc::new(CarrierRegistry::new(id)),
            metrics: SchedMetrics::new(),
            logger: StructuredLogger::new(format!("context-{id}")),
        });
        let root = ResourceContainer::new_root(shared.clone());
        let containers = DashMap::new();
        containers.insert(ROOT_CONTAINER_ID, root.clone());

        Arc::new(Self {
            id,
            shared,
            root,
            containers,
            next_container_id: AtomicU64::new(ROOT_CONTAINER_ID + 1),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.shared.clock
    }

    pub fn metrics(&self) -> &SchedMetrics {
        &self.shared.metrics
    }

    pub fn logger(&self) -> &StructuredLogger {
        &self.shared.logger
    }

    pub fn carriers(&self) -> &Arc<CarrierRegistry> {
        &self.shared.carriers
    }

    pub fn root(&self) -> &Arc<ResourceContainer> {
        &self.root
    }

    /// Validate `config`, create a container and register it
    pub fn create_container(&self, config: ContainerConfig) -> Result<Arc<ResourceContainer>> {
        let id = self.next_container_id.fetch_add(1, Ordering::Relaxed);
        let container = ResourceContainer::build(id, config, self.shared.clone())?;

        self.containers.insert(id, container.clone());
        self.shared.metrics.inc_containers_created();
        self.shared.logger.log_container_created(
            id,
            container.name(),
            container.cpu_group().map(|g| (g.quota_ns(), g.period_ns())),
        );
        Ok(container)
    }

    pub fn container(&self, id: u64) -> Option<Arc<ResourceContainer>> {
        self.containers.get(&id).map(|r| r.value().clone())
    }

    /// Ids of all registered containers, root included, ascending
    pub fn container_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.containers.iter().map(|r| *r.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// The container the calling carrier is attached to
    pub fn current_container(&self) -> Arc<ResourceContainer> {
        self.current_carrier()
            .attached()
            .unwrap_or_else(|| self.root.clone())
    }

    /// The calling thread's carrier slot
    pub fn current_carrier(&self) -> Arc<CarrierSlot> {
        self.shared.carriers.current()
    }

    /// Register the calling thread as a carrier until the guard drops
    pub fn register_carrier(&self) -> CarrierGuard {
        self.shared.carriers.register_current()
    }

    /// Snapshots of every registered container, ordered by id
    pub fn snapshots(&self) -> Vec<ContainerSnapshot> {
        self.container_ids()
            .into_iter()
            .filter_map(|id| self.container(id))
            .map(|c| c.snapshot())
            .collect()
    }
}

impl std::fmt::Debug for SchedulerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerContext")
            .field("id", &self.id)
            .field("containers", &self.containers.len())
            .field("carriers", &self.shared.carriers.len())
            .finish()
    }
}
