//! Carrier/task scheduling
//!
//! Tasks are step functions run in slices by a [`CarrierPool`]. Before each
//! slice the pool asks the task's container quota group for admission; a
//! rejected task waits on the timer queue and the carrier moves on.

mod pool;
mod task;

#[cfg(test)]
mod tests;

pub use pool::CarrierPool;
pub use task::{Step, TaskBody, TaskContext, TaskHandle, TaskOutcome};
