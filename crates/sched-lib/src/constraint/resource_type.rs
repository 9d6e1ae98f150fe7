//! Throttleable resource identifiers
//!
//! A `ResourceType` is declared once as a `static` and compared by address,
//! so two types with the same name are still distinct. New resource kinds are
//! added by declaring another static with its own validation rule.

use super::Constraint;
use crate::error::ConstraintError;
use std::fmt;
use std::sync::Arc;

/// Validation rule: `(values, cpu_cores)`
pub type Validator = fn(&[i64], usize) -> Result<(), ConstraintError>;

/// CPU share as a percentage of one core, in `[1, cores * 100]`
pub static CPU_PERCENT: ResourceType = ResourceType::new("CPU_PERCENT", validate_cpu_percent);

/// Retained heap limit in bytes, in `[1, i64::MAX]`
pub static HEAP_RETAINED: ResourceType = ResourceType::new("HEAP_RETAINED", validate_heap_retained);

/// Identifier for a resource that a container can limit
pub struct ResourceType {
    name: &'static str,
    validator: Validator,
}

impl ResourceType {
    pub const fn new(name: &'static str, validator: Validator) -> Self {
        Self { name, validator }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Check `values` against this type's rule using the host core count
    pub fn validate(&self, values: &[i64]) -> Result<(), ConstraintError> {
        (self.validator)(values, host_cores())
    }

    pub fn validate_with_cores(&self, values: &[i64], cpu_cores: usize) -> Result<(), ConstraintError> {
        (self.validator)(values, cpu_cores)
    }

    /// Validate and build a constraint
    pub fn new_constraint(&'static self, values: &[i64]) -> Result<Constraint, ConstraintError> {
        self.new_constraint_with_cores(values, host_cores())
    }

    /// Validate against an explicit core count and build a constraint
    pub fn new_constraint_with_cores(
        &'static self,
        values: &[i64],
        cpu_cores: usize,
    ) -> Result<Constraint, ConstraintError> {
        (self.validator)(values, cpu_cores)?;
        Ok(Constraint {
            resource: self,
            values: Arc::from(values),
        })
    }
}

impl PartialEq for ResourceType {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl Eq for ResourceType {}

impl std::hash::Hash for ResourceType {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (self as *const ResourceType).hash(state);
    }
}

impl fmt::Debug for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ResourceType").field(&self.name).finish()
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

fn host_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Shared arity check for single-valued resources
pub fn expect_single(resource: &'static str, values: &[i64]) -> Result<i64, ConstraintError> {
    match values {
        [value] => Ok(*value),
        _ => Err(ConstraintError::Arity {
            resource,
            expected: 1,
            actual: values.len(),
        }),
    }
}

/// Shared inclusive range check
pub fn expect_range(
    resource: &'static str,
    value: i64,
    min: i64,
    max: i64,
) -> Result<(), ConstraintError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConstraintError::OutOfRange {
            resource,
            value,
            min,
            max,
        })
    }
}

fn validate_cpu_percent(values: &[i64], cpu_cores: usize) -> Result<(), ConstraintError> {
    let value = expect_single("CPU_PERCENT", values)?;
    let max = i64::try_from(cpu_cores.max(1))
        .unwrap_or(i64::MAX / 100)
        .saturating_mul(100);
    expect_range("CPU_PERCENT", value, 1, max)
}

fn validate_heap_retained(values: &[i64], _cpu_cores: usize) -> Result<(), ConstraintError> {
    let value = expect_single("HEAP_RETAINED", values)?;
    expect_range("HEAP_RETAINED", value, 1, i64::MAX)
}
