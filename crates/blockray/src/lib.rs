//! Driver facade over the block-based render scheduler.
//!
//! A GUI shell talks to the renderer through [`RenderDriver`]: it spawns the
//! scheduler loop on its own thread, funnels renderer-mutating operations
//! (start a frame, scene updates) through the serial job queue so they
//! execute one at a time, and exposes the event subscription and snapshot
//! surface directly.

mod driver;
pub mod test_support;


pub use driver::RenderDriver;
pub use framebuffer::FrameSnapshot;
pub use job_queue::{JobTicket, JobWaitError};
pub use protocol::{
    Block, BlockId, BlockRect, CameraPose, ConfigError, RenderConfig, RenderEvent,
    RenderEventKind, RenderMode, RenderParams, SceneUpdate,
};
pub use scheduler::UpdateError;
pub use worker_pool::{BlockRenderer, RendererFactory};
