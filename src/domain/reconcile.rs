//! Status reconciliation
//!
//! The device pushes its full state about once a second and on every change.
//! Locally issued commands register the value they expect ("pending targets");
//! pushes are checked against those targets so observers only see settled
//! states, while changes made on the device itself still come through.

use crate::domain::models::{DeviceState, Field};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, trace};

/// Values in-flight commands expect the device to converge on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingTargetSet {
    targets: BTreeMap<Field, u32>,
}

impl PendingTargetSet {
    pub fn insert(&mut self, field: Field, value: u32) {
        self.targets.insert(field, value);
    }

    pub fn remove(&mut self, field: Field) -> Option<u32> {
        self.targets.remove(&field)
    }

    pub fn get(&self, field: Field) -> Option<u32> {
        self.targets.get(&field).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn fields(&self) -> Vec<Field> {
        self.targets.keys().copied().collect()
    }
}

/// What happened to one status push
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Heartbeat identical to the cached snapshot
    Unchanged,
    /// A field sits one below its target; the next push should settle it
    Transitional(Field),
    /// Targets still outstanding, nothing published
    Withheld,
    /// New snapshot adopted
    Published(DeviceState),
}

#[derive(Debug, Default)]
pub struct StatusReconciler {
    cached: Option<DeviceState>,
    pending: PendingTargetSet,
    last_push: Option<Instant>,
}

impl StatusReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached(&self) -> Option<&DeviceState> {
        self.cached.as_ref()
    }

    pub fn last_push(&self) -> Option<Instant> {
        self.last_push
    }

    pub fn pending(&self) -> &PendingTargetSet {
        &self.pending
    }

    pub fn register_target(&mut self, field: Field, value: u32) {
        trace!("Pending target {} = {}", field, value);
        self.pending.insert(field, value);
    }

    pub fn clear_target(&mut self, field: Field) {
        self.pending.remove(field);
    }

    /// Apply one inbound push received at `now`
    pub fn reconcile(&mut self, incoming: DeviceState, now: Instant) -> ReconcileOutcome {
        self.last_push = Some(now);

        let (status_changed, changed) = diff(self.cached.as_ref(), &incoming);
        if !status_changed && changed.is_empty() {
            return ReconcileOutcome::Unchanged;
        }

        for field in self.pending.fields() {
            if !changed.contains(&field) {
                continue;
            }
            let Some(target) = self.pending.get(field) else {
                continue;
            };
            let value = incoming.get(field);

            if value == target {
                debug!("Target reached: {} = {}", field, value);
                self.pending.remove(field);
            } else if field.is_percent() && target > 0 && value == target - 1 {
                // Heuristic: the firmware echoes the compensated value before
                // settling. A real external change to exactly target - 1 is
                // indistinguishable and resolves on the next push.
                debug!("Transitional {} = {} (target {})", field, value, target);
                return ReconcileOutcome::Transitional(field);
            } else {
                debug!(
                    "Target for {} superseded: expected {}, device reports {}",
                    field, target, value
                );
                self.pending.remove(field);
            }
        }

        if !self.pending.is_empty() {
            return ReconcileOutcome::Withheld;
        }

        self.cached = Some(incoming.clone());
        ReconcileOutcome::Published(incoming)
    }
}

/// Whether the status changed, and which numeric fields changed
fn diff(old: Option<&DeviceState>, new: &DeviceState) -> (bool, Vec<Field>) {
    match old {
        None => (true, Field::ALL.to_vec()),
        Some(old) => (
            old.status != new.status,
            Field::ALL
                .into_iter()
                .filter(|f| old.get(*f) != new.get(*f))
                .collect(),
        ),
    }
}
