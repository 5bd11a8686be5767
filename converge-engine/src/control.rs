//! Scheduling primitives for running dependent work concurrently.

pub mod task_tracker;
pub mod thunk;
