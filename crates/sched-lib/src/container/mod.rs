//! Resource containers
//!
//! A [`ResourceContainer`] groups work for CPU quota enforcement and
//! container-scoped state. Work enters a container through
//! [`ResourceContainer::run`], which attaches the calling carrier for the
//! duration of the closure.
//!
//! ## Attach rules
//!
//! | Carrier is in | `A.run(..)`            | `root.run(..)`                     |
//! |---------------|------------------------|------------------------------------|
//! | root          | attach A, run, detach  | run directly                       |
//! | A             | run directly           | detach A, run, re-attach A         |
//! | B (non-root)  | `NestedAttach` error   | detach B, run, re-attach B         |
//!
//! A carrier is never attached to two non-root containers at once. Detach
//! and re-attach are done by scope guards, so they also happen when the
//! closure panics.

mod carrier;
mod context;
mod hooks;
mod local;


pub use carrier::{CarrierGuard, CarrierId, CarrierRegistry, CarrierSlot};
pub use context::SchedulerContext;
pub use hooks::{AttachContext, ContainerHooks, CpuThrottleHook};
pub use local::ContainerLocal;

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::constraint::{Constraint, ResourceType, CPU_PERCENT, HEAP_RETAINED};
use crate::error::{ContainerError, Result};
use crate::models::{ConstraintSnapshot, ContainerSnapshot};
use crate::observability::{SchedMetrics, StructuredLogger};
use crate::quota::CpuQuotaGroup;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Id of the root container in every context
pub const ROOT_CONTAINER_ID: u64 = 0;

/// Lifecycle of a container; `Running -> Destroyed` only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Running,
    Destroyed,
}

impl ContainerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ContainerState::Running,
            _ => ContainerState::Destroyed,
        }
    }
}

/// Parameters for [`SchedulerContext::create_container`]
#[derive(Clone, Default)]
pub struct ContainerConfig {
    pub name: Option<String>,
    pub cpu_percent: Option<i64>,
    pub heap_retained: Option<i64>,
    pub constraints: Vec<Constraint>,
    pub hooks: Vec<Arc<dyn ContainerHooks>>,
}

impl ContainerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Limit the container's CPU share, in percent of one core
    pub fn cpu_percent(mut self, percent: i64) -> Self {
        self.cpu_percent = Some(percent);
        self
    }

    /// Limit the container's retained heap, in bytes
    pub fn heap_retained(mut self, bytes: i64) -> Self {
        self.heap_retained = Some(bytes);
        self
    }

    pub fn constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Append a hook; hooks run after the built-in CPU hook
    pub fn hook(mut self, hook: Arc<dyn ContainerHooks>) -> Self {
        self.hooks.push(hook);
        self
    }
}

impl fmt::Debug for ContainerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerConfig")
            .field("name", &self.name)
            .field("cpu_percent", &self.cpu_percent)
            .field("heap_retained", &self.heap_retained)
            .field("constraints", &self.constraints)
            .field("hooks", &self.hooks.iter().map(|h| h.name()).collect::<Vec<_>>())
            .finish()
    }
}

/// State shared by a context and all of its containers
pub(crate) struct Shared {
    pub(crate) config: SchedulerConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) carriers: Arc<CarrierRegistry>,
    pub(crate) metrics: SchedMetrics,
    pub(crate) logger: StructuredLogger,
}

/// A named scope for CPU quota enforcement and state isolation
pub struct ResourceContainer {
    id: u64,
    name: String,
    is_root: bool,
    state: AtomicU8,
    constraints: RwLock<Vec<Constraint>>,
    cpu_group: RwLock<Option<Arc<CpuQuotaGroup>>>,
    hooks: Vec<Arc<dyn ContainerHooks>>,
    shared: Arc<Shared>,
    me: Weak<ResourceContainer>,
}

impl ResourceContainer {
    pub(crate) fn new_root(shared: Arc<Shared>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id: ROOT_CONTAINER_ID,
            name: "root".to_string(),
            is_root: true,
            state: AtomicU8::new(ContainerState::Running as u8),
            constraints: RwLock::new(Vec::new()),
            cpu_group: RwLock::new(None),
            hooks: Vec::new(),
            shared,
            me: me.clone(),
        })
    }

    /// Validate `config` and build a non-root container
    pub(crate) fn build(id: u64, config: ContainerConfig, shared: Arc<Shared>) -> Result<Arc<Self>> {
        let cores = shared.config.cpu_cores;
        let mut constraints: Vec<Constraint> = Vec::new();

        if let Some(percent) = config.cpu_percent {
            constraints.push(CPU_PERCENT.new_constraint_with_cores(&[percent], cores)?);
        }
        if let Some(bytes) = config.heap_retained.or(shared.config.heap_retained_default) {
            constraints.push(HEAP_RETAINED.new_constraint_with_cores(&[bytes], cores)?);
        }
        for constraint in config.constraints {
            let resource = constraint.resource_type();
            resource.validate_with_cores(&constraint.values(), cores)?;
            constraints.retain(|c| c.resource_type() != resource);
            constraints.push(constraint);
        }

        let cpu_group = match find(&constraints, &CPU_PERCENT).and_then(|c| c.first()) {
            Some(percent) => Some(Arc::new(CpuQuotaGroup::from_percent(
                percent,
                &shared.config,
                shared.clock.clone(),
            )?)),
            None => None,
        };

        let mut hooks: Vec<Arc<dyn ContainerHooks>> =
            vec![Arc::new(CpuThrottleHook::new(shared.metrics.clone()))];
        hooks.extend(config.hooks);

        Ok(Arc::new_cyclic(|me| Self {
            id,
            name: config.name.unwrap_or_else(|| format!("container-{id}")),
            is_root: false,
            state: AtomicU8::new(ContainerState::Running as u8),
            constraints: RwLock::new(constraints),
            cpu_group: RwLock::new(cpu_group),
            hooks,
            shared,
            me: me.clone(),
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn state(&self) -> ContainerState {
        ContainerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Quota group currently enforcing this container's CPU limit
    pub fn cpu_group(&self) -> Option<Arc<CpuQuotaGroup>> {
        self.cpu_group.read().clone()
    }

    pub fn constraints(&self) -> Vec<Constraint> {
        self.constraints.read().clone()
    }

    pub fn constraint(&self, resource: &'static ResourceType) -> Option<Constraint> {
        find(&self.constraints.read(), resource).cloned()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.shared.clock
    }

    pub(crate) fn weak_self(&self) -> Weak<ResourceContainer> {
        self.me.clone()
    }

    /// Run `work` with the calling carrier attached to this container
    ///
    /// See the module docs for the attach rules. Fails with
    /// [`ContainerError::Destroyed`] on a destroyed container and with
    /// [`ContainerError::NestedAttach`] when the carrier is already inside
    /// another non-root container.
    pub fn run<R>(&self, work: impl FnOnce() -> R) -> Result<R> {
        let carrier = self.shared.carriers.current();
        if self.is_root {
            return Ok(self.run_as_root(&carrier, work));
        }
        self.run_on(&carrier, false, work)
    }

    /// Run one scheduler slice whose quota admission was already done
    pub(crate) fn run_admitted<R>(
        &self,
        carrier: &Arc<CarrierSlot>,
        work: impl FnOnce() -> R,
    ) -> Result<R> {
        if self.is_root {
            return Ok(self.run_as_root(carrier, work));
        }
        self.run_on(carrier, true, work)
    }

    fn run_on<R>(
        &self,
        carrier: &Arc<CarrierSlot>,
        admitted: bool,
        work: impl FnOnce() -> R,
    ) -> Result<R> {
        self.ensure_running()?;

        let current = carrier.current_container_id();
        if current == self.id {
            trace!(container_id = self.id, "Re-entering attached container");
            return Ok(work());
        }
        if current != ROOT_CONTAINER_ID {
            return Err(ContainerError::NestedAttach {
                carrier_id: carrier.id().as_u64(),
                current,
                requested: self.id,
            });
        }

        let _attached = AttachGuard::new(self, carrier, admitted);
        Ok(work())
    }

    fn run_as_root<R>(&self, carrier: &Arc<CarrierSlot>, work: impl FnOnce() -> R) -> R {
        match carrier.attached() {
            Some(container) => {
                let _suspended = SuspendGuard::new(container, carrier);
                work()
            }
            None => work(),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state() {
            ContainerState::Running => Ok(()),
            ContainerState::Destroyed => Err(ContainerError::Destroyed { id: self.id }),
        }
    }

    /// Attach the carrier: base update first, then hooks in order
    fn attach(&self, carrier: &CarrierSlot, admitted: bool) {
        debug_assert_eq!(carrier.current_container_id(), ROOT_CONTAINER_ID);
        carrier.set_attached(Some(self));
        self.shared.metrics.inc_attach();
        trace!(container_id = self.id, carrier_id = %carrier.id(), "Attached");

        let task = carrier.task_account();
        let cx = AttachContext {
            container: self,
            carrier,
            task: &task,
            admitted,
        };
        for hook in &self.hooks {
            hook.on_attach(&cx);
        }
    }

    /// Detach the carrier: base update first, then hooks in reverse
    fn detach(&self, carrier: &CarrierSlot, admitted: bool) {
        carrier.set_attached(None);
        self.shared.metrics.inc_detach();
        trace!(container_id = self.id, carrier_id = %carrier.id(), "Detached");

        let task = carrier.task_account();
        let cx = AttachContext {
            container: self,
            carrier,
            task: &task,
            admitted,
        };
        for hook in self.hooks.iter().rev() {
            hook.on_detach(&cx);
        }

        // The rest of a scheduled slice runs outside any group
        if !admitted && carrier.current_task_id() != 0 && task.enter_ts() == 0 {
            task.stamp(self.shared.clock.now_ns());
        }
    }

    /// Replace the constraint of the same resource type
    ///
    /// A new CPU_PERCENT limit replaces the quota group; tasks bound to the
    /// old group finish their slice against it.
    pub fn update_constraint(&self, constraint: Constraint) -> Result<()> {
        if self.is_root {
            return Err(ContainerError::Unsupported("update_constraint"));
        }
        self.ensure_running()?;

        let resource = constraint.resource_type();
        resource.validate_with_cores(&constraint.values(), self.shared.config.cpu_cores)?;

        if resource == &CPU_PERCENT {
            let percent = constraint.first().unwrap_or(1);
            let group =
                CpuQuotaGroup::from_percent(percent, &self.shared.config, self.shared.clock.clone())?;
            *self.cpu_group.write() = Some(Arc::new(group));
        }

        let mut constraints = self.constraints.write();
        constraints.retain(|c| c.resource_type() != resource);
        debug!(
            container_id = self.id,
            resource = resource.name(),
            values = ?constraint.values(),
            "Constraint updated"
        );
        constraints.push(constraint);
        Ok(())
    }

    /// Mark the container destroyed
    ///
    /// Carriers already inside `run` finish normally; later `run` calls
    /// fail. Destroying twice is a no-op. The container stays in the
    /// context registry for monitoring.
    pub fn destroy(&self) -> Result<()> {
        if self.is_root {
            return Err(ContainerError::Unsupported("destroy"));
        }
        let transitioned = self
            .state
            .compare_exchange(
                ContainerState::Running as u8,
                ContainerState::Destroyed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        if transitioned {
            self.shared.metrics.inc_containers_destroyed();
            self.shared
                .logger
                .log_container_destroyed(self.id, &self.name, self.active_carrier_ids().len());
        } else {
            debug!(container_id = self.id, "Container already destroyed");
        }
        Ok(())
    }

    /// Carriers currently attached to this container
    ///
    /// For root, the carriers not attached to any other container.
    pub fn active_carrier_ids(&self) -> Vec<CarrierId> {
        self.shared
            .carriers
            .list()
            .into_iter()
            .filter(|slot| slot.current_container_id() == self.id)
            .map(|slot| slot.id())
            .collect()
    }

    /// Point-in-time view for monitoring
    pub fn snapshot(&self) -> ContainerSnapshot {
        let group = self.cpu_group();
        ContainerSnapshot {
            id: self.id,
            name: self.name.clone(),
            state: self.state(),
            constraints: self
                .constraints()
                .iter()
                .map(|c| ConstraintSnapshot {
                    resource: c.resource_type().name().to_string(),
                    values: c.values(),
                })
                .collect(),
            cpu_consumed_ns: group.as_ref().map_or(0, |g| g.consumed_ns()),
            cpu_limit_reached: group.as_ref().map_or(0, |g| g.limit_reached_count()),
            active_carriers: self
                .active_carrier_ids()
                .into_iter()
                .map(|id| id.as_u64())
                .collect(),
            taken_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

impl fmt::Debug for ResourceContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceContainer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("constraints", &*self.constraints.read())
            .finish()
    }
}

fn find<'a>(constraints: &'a [Constraint], resource: &'static ResourceType) -> Option<&'a Constraint> {
    constraints.iter().find(|c| c.resource_type() == resource)
}

/// Attaches on creation, detaches on drop
struct AttachGuard<'a> {
    container: &'a ResourceContainer,
    carrier: &'a CarrierSlot,
    admitted: bool,
}

impl<'a> AttachGuard<'a> {
    fn new(container: &'a ResourceContainer, carrier: &'a CarrierSlot, admitted: bool) -> Self {
        container.attach(carrier, admitted);
        Self {
            container,
            carrier,
            admitted,
        }
    }
}

impl Drop for AttachGuard<'_> {
    fn drop(&mut self) {
        self.container.detach(self.carrier, self.admitted);
    }
}

/// Detaches on creation, re-attaches on drop
struct SuspendGuard<'a> {
    container: Arc<ResourceContainer>,
    carrier: &'a CarrierSlot,
}

impl<'a> SuspendGuard<'a> {
    fn new(container: Arc<ResourceContainer>, carrier: &'a CarrierSlot) -> Self {
        trace!(container_id = container.id, "Suspending container for root work");
        container.detach(carrier, false);
        Self { container, carrier }
    }
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        self.container.attach(self.carrier, false);
    }
}
