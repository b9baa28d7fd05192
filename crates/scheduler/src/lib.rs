//! Block scheduler: turns a render configuration into an executing frame.
//!
//! The scheduler partitions the viewport into blocks, shuffles them into a
//! pending queue, keeps every ready worker fed, composites arriving pixel
//! slabs into the frame buffer and publishes progress events. All of its
//! state transitions happen on one thread; the workers behind the pool are
//! the only source of real parallelism, observed here as receipts processed
//! one at a time.

mod events;
mod run_loop;
mod scheduler_core;


pub use crate::run_loop::{run_scheduler_loop, SchedulerCommand};
pub use crate::scheduler_core::{BlockScheduler, UpdateError};
