//! Carrier thread state
//!
//! Every thread that runs container work is a carrier. Its slot records which
//! container it is attached to and which task it is executing. Slots live in
//! thread-local storage keyed by context id, and are also listed in the
//! context's carrier registry so monitors can read them.
//!
//! Only the owning thread writes a slot; other threads only read the atomics.

use super::{ResourceContainer, ROOT_CONTAINER_ID};
use crate::observability::SchedMetrics;
use crate::quota::TaskAccount;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Identifier of a carrier within one context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CarrierId(u64);

impl CarrierId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CarrierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "carrier-{}", self.0)
    }
}

/// Per-carrier "current container" and "current task" state
pub struct CarrierSlot {
    id: CarrierId,
    name: String,
    current_container: AtomicU64,
    attached: Mutex<Weak<ResourceContainer>>,
    current_task_id: AtomicU64,
    current_task: Mutex<Option<Arc<TaskAccount>>>,
    thread_account: Arc<TaskAccount>,
}

impl CarrierSlot {
    fn new(id: CarrierId, name: String) -> Self {
        Self {
            id,
            name,
            current_container: AtomicU64::new(ROOT_CONTAINER_ID),
            attached: Mutex::new(Weak::new()),
            current_task_id: AtomicU64::new(0),
            current_task: Mutex::new(None),
            thread_account: Arc::new(TaskAccount::new()),
        }
    }

    pub fn id(&self) -> CarrierId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id of the attached container, or the root id
    pub fn current_container_id(&self) -> u64 {
        self.current_container.load(Ordering::Acquire)
    }

    /// The attached non-root container, if any
    pub fn attached(&self) -> Option<Arc<ResourceContainer>> {
        self.attached.lock().upgrade()
    }

    /// Id of the task being executed, or 0 when the carrier runs its own code
    pub fn current_task_id(&self) -> u64 {
        self.current_task_id.load(Ordering::Acquire)
    }

    /// Accounting record of whatever the carrier is running now
    pub fn task_account(&self) -> Arc<TaskAccount> {
        self.current_task
            .lock()
            .clone()
            .unwrap_or_else(|| self.thread_account.clone())
    }

    pub(crate) fn set_attached(&self, container: Option<&ResourceContainer>) {
        let mut attached = self.attached.lock();
        match container {
            Some(container) => {
                *attached = container.weak_self();
                self.current_container
                    .store(container.id(), Ordering::Release);
            }
            None => {
                *attached = Weak::new();
                self.current_container
                    .store(ROOT_CONTAINER_ID, Ordering::Release);
            }
        }
    }

    pub(crate) fn set_current_task(&self, task: Option<(u64, Arc<TaskAccount>)>) {
        let mut current = self.current_task.lock();
        match task {
            Some((id, account)) => {
                self.current_task_id.store(id, Ordering::Release);
                *current = Some(account);
            }
            None => {
                self.current_task_id.store(0, Ordering::Release);
                *current = None;
            }
        }
    }
}

impl fmt::Debug for CarrierSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CarrierSlot")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("current_container", &self.current_container_id())
            .field("current_task", &self.current_task_id())
            .finish()
    }
}

/// Carriers known to one scheduler context
#[derive(Debug)]
pub struct CarrierRegistry {
    context_id: u64,
    slots: DashMap<CarrierId, Arc<CarrierSlot>>,
    next_id: AtomicU64,
    metrics: SchedMetrics,
}

struct LocalEntry {
    context_id: u64,
    registry: Weak<CarrierRegistry>,
    slot: Arc<CarrierSlot>,
}

/// This thread's carrier slots, one per context it has touched
#[derive(Default)]
struct LocalCarriers {
    entries: Vec<LocalEntry>,
}

impl Drop for LocalCarriers {
    fn drop(&mut self) {
        for entry in self.entries.drain(..) {
            if let Some(registry) = entry.registry.upgrade() {
                registry.slots.remove(&entry.slot.id);
            }
        }
    }
}

thread_local! {
    static LOCAL_CARRIERS: RefCell<LocalCarriers> = RefCell::new(LocalCarriers::default());
}

impl CarrierRegistry {
    pub(crate) fn new(context_id: u64) -> Self {
        Self {
            context_id,
            slots: DashMap::new(),
            next_id: AtomicU64::new(1),
            metrics: SchedMetrics::new(),
        }
    }

    /// The calling thread's slot, registering the thread on first use
    pub fn current(self: &Arc<Self>) -> Arc<CarrierSlot> {
        let found = LOCAL_CARRIERS.try_with(|local| {
            let mut local = local.borrow_mut();
            // Forget contexts that no longer exist
            local
                .entries
                .retain(|entry| entry.registry.strong_count() > 0);
            if let Some(entry) = local
                .entries
                .iter()
                .find(|entry| entry.context_id == self.context_id)
            {
                return entry.slot.clone();
            }
            let slot = self.new_slot();
            local.entries.push(LocalEntry {
                context_id: self.context_id,
                registry: Arc::downgrade(self),
                slot: slot.clone(),
            });
            slot
        });

        // Thread-local storage is gone while the thread is exiting
        found.unwrap_or_else(|_| Arc::new(CarrierSlot::new(CarrierId(0), thread_name())))
    }

    /// Register the calling thread as a carrier until the guard drops
    pub fn register_current(self: &Arc<Self>) -> CarrierGuard {
        let slot = self.current();
        self.metrics.inc_live_carriers();
        debug!(carrier_id = %slot.id, name = %slot.name, "Carrier registered");
        CarrierGuard {
            registry: self.clone(),
            slot,
        }
    }

    pub fn get(&self, id: CarrierId) -> Option<Arc<CarrierSlot>> {
        self.slots.get(&id).map(|r| r.value().clone())
    }

    /// All registered carriers, ordered by id
    pub fn list(&self) -> Vec<Arc<CarrierSlot>> {
        let mut slots: Vec<_> = self.slots.iter().map(|r| r.value().clone()).collect();
        slots.sort_by_key(|slot| slot.id);
        slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn new_slot(&self) -> Arc<CarrierSlot> {
        let id = CarrierId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let slot = Arc::new(CarrierSlot::new(id, thread_name()));
        self.slots.insert(id, slot.clone());
        slot
    }

    fn release(&self, id: CarrierId) {
        self.slots.remove(&id);
        let _ = LOCAL_CARRIERS.try_with(|local| {
            local
                .borrow_mut()
                .entries
                .retain(|entry| !(entry.context_id == self.context_id && entry.slot.id == id));
        });
    }
}

fn thread_name() -> String {
    let thread = std::thread::current();
    thread
        .name()
        .map(str::to_string)
        .unwrap_or_else(|| format!("{:?}", thread.id()))
}

/// Keeps a thread registered as a carrier; unregisters on drop
///
/// Must be dropped on the thread that created it.
pub struct CarrierGuard {
    registry: Arc<CarrierRegistry>,
    slot: Arc<CarrierSlot>,
}

impl CarrierGuard {
    pub fn slot(&self) -> &Arc<CarrierSlot> {
        &self.slot
    }
}

impl Drop for CarrierGuard {
    fn drop(&mut self) {
        debug!(carrier_id = %self.slot.id, "Carrier unregistered");
        self.registry.release(self.slot.id);
        self.registry.metrics.dec_live_carriers();
    }
}
