//! Validated resource-limit descriptors
//!
//! A [`Constraint`] pairs a [`ResourceType`] with its values. Constraints can
//! only be obtained through [`ResourceType::new_constraint`], so every
//! constraint in the system has passed its type's validation rule.

mod resource_type;

pub use resource_type::{
    expect_range, expect_single, ResourceType, Validator, CPU_PERCENT, HEAP_RETAINED,
};

use std::fmt;
use std::sync::Arc;

/// Immutable `(ResourceType, values)` pair
#[derive(Clone, PartialEq, Eq)]
pub struct Constraint {
    resource: &'static ResourceType,
    values: Arc<[i64]>,
}

impl Constraint {
    pub fn resource_type(&self) -> &'static ResourceType {
        self.resource
    }

    /// Copy of the constraint values
    pub fn values(&self) -> Vec<i64> {
        self.values.to_vec()
    }

    /// First value, for single-valued resource types
    pub fn first(&self) -> Option<i64> {
        self.values.first().copied()
    }
}

impl fmt::Debug for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Constraint")
            .field("resource", &self.resource.name())
            .field("values", &&*self.values)
            .finish()
    }
}
