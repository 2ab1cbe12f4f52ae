//! Task module - the unit of work the kernel schedules.
//!
//! - All status changes go through explicit, validated transitions
//! - Terminal tasks are never removed; they stay for audit

pub mod task;

pub use task::{NewTask, Task, TaskError, TaskId, TaskStatus};
