//! Container attach/detach hooks
//!
//! The base attach/detach only moves the carrier's "current container". Each
//! container kind layers behaviour on top through an ordered list of hooks:
//! attach runs them first to last after the base update, detach runs them
//! last to first after the base update.

use super::carrier::CarrierSlot;
use super::ResourceContainer;
use crate::observability::SchedMetrics;
use crate::quota::TaskAccount;
use tracing::{debug, warn};

/// What a hook sees when a carrier enters or leaves a container
pub struct AttachContext<'a> {
    pub container: &'a ResourceContainer,
    pub carrier: &'a CarrierSlot,
    /// Accounting record of the code running on the carrier
    pub task: &'a TaskAccount,
    /// The scheduler already performed quota admission for this slice
    pub admitted: bool,
}

/// Behaviour layered on a container's attach and detach
pub trait ContainerHooks: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    fn on_attach(&self, cx: &AttachContext<'_>);

    fn on_detach(&self, cx: &AttachContext<'_>);
}

/// Charges the carrier's current task to the container's CPU quota group
///
/// Skips slices the scheduler admitted itself; those are accounted by the
/// scheduler after the slice.
#[derive(Debug, Clone, Default)]
pub struct CpuThrottleHook {
    metrics: SchedMetrics,
}

impl CpuThrottleHook {
    pub fn new(metrics: SchedMetrics) -> Self {
        Self { metrics }
    }
}

impl ContainerHooks for CpuThrottleHook {
    fn name(&self) -> &'static str {
        "cpu_throttle"
    }

    fn on_attach(&self, cx: &AttachContext<'_>) {
        if cx.admitted {
            return;
        }
        let Some(group) = cx.container.cpu_group() else {
            return;
        };

        let delay = group.attach_current(cx.task);
        if delay > 0 {
            self.metrics.inc_quota_rejections();
            self.metrics.observe_quota_delay(delay);
            debug!(
                container_id = cx.container.id(),
                carrier_id = %cx.carrier.id(),
                delay_ns = delay,
                "Carrier waited for CPU quota"
            );
        }
    }

    fn on_detach(&self, cx: &AttachContext<'_>) {
        if cx.admitted {
            return;
        }
        if let Some(group) = cx.task.group() {
            let usage = group.detach_current(cx.task);
            self.metrics.observe_slice_usage(usage);
            return;
        }
        // A container without a group never charged the task on attach
        if cx.container.cpu_group().is_none() {
            return;
        }
        if cx.task.enter_ts() != 0 {
            // The group was replaced and dropped while the carrier was inside
            warn!(
                container_id = cx.container.id(),
                "Quota group gone before detach, usage not charged"
            );
            cx.task.fold_unattributed(cx.container.clock().now_ns());
        }
    }
}
