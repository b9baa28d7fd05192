//! Bottom message vocabulary of the render scheduler: ids, rectangles,
//! configuration, worker command/receipt messages and outward events.
//! Can be depended on by any workspace crate; depends on none of them.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Identity of one unit of work. Allocated from a monotonic counter and never
/// reused, so a late result can always be matched against the dispatch that
/// produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u64);

/// Identity of one worker slot. Never reused: a recycled pool gets fresh ids,
/// which is what makes receipts from replaced workers detectably stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u64);

/// Identity of one `start()` invocation. The frame buffer and every dispatched
/// in-flight record are stamped with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FrameEpoch(pub u64);

/// Axis-aligned rectangle of viewport pixels, at most `block_size` on an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BlockRect {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Enumerates the full block grid for a viewport, row-major. Edge blocks
    /// are clamped to the viewport, so the rect areas sum to `width * height`.
    /// Caller guarantees all three inputs are nonzero.
    pub fn grid(width: u32, height: u32, block_size: u32) -> Vec<BlockRect> {
        let cols = width.div_ceil(block_size);
        let rows = height.div_ceil(block_size);
        let mut rects = Vec::with_capacity((cols * rows) as usize);
        for by in 0..rows {
            for bx in 0..cols {
                let x = bx * block_size;
                let y = by * block_size;
                rects.push(BlockRect {
                    x,
                    y,
                    width: block_size.min(width - x),
                    height: block_size.min(height - y),
                });
            }
        }
        rects
    }
}

/// A schedulable block: a rect plus the identity it keeps for its lifetime
/// (pending queue, then one worker slot, then composited).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub rect: BlockRect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RenderMode {
    Color,
    Depth,
}

/// Camera placement: translate after rotating around x then y.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraPose {
    pub position: [f32; 3],
    pub rot_x: f32,
    pub rot_y: f32,
}

/// The opaque render-parameter bag. The scheduler moves it verbatim to
/// workers at scene-setup time and never interprets a field of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderParams {
    pub scene_id: u32,
    pub max_ray_depth: u32,
    pub render_mode: RenderMode,
    pub camera: CameraPose,
}

/// Everything one `start()` needs. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderConfig {
    pub block_size: u32,
    pub width: u32,
    pub height: u32,
    pub anti_alias: u32,
    pub de_band: bool,
    pub params: RenderParams,
}

impl RenderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size == 0 {
            return Err(ConfigError::ZeroBlockSize);
        }
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::EmptyViewport {
                width: self.width,
                height: self.height,
            });
        }
        if !matches!(self.anti_alias, 1 | 2 | 4 | 8) {
            return Err(ConfigError::UnsupportedAntiAlias(self.anti_alias));
        }
        Ok(())
    }

    /// Block-grid dimensions (columns, rows). Valid configs only.
    pub fn grid_dims(&self) -> (u32, u32) {
        (
            self.width.div_ceil(self.block_size),
            self.height.div_ceil(self.block_size),
        )
    }

    pub fn block_total(&self) -> u32 {
        let (cols, rows) = self.grid_dims();
        cols * rows
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    ZeroBlockSize,
    EmptyViewport { width: u32, height: u32 },
    UnsupportedAntiAlias(u32),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ZeroBlockSize => write!(formatter, "block size must be at least 1"),
            ConfigError::EmptyViewport { width, height } => {
                write!(formatter, "viewport {width}x{height} has no pixels")
            }
            ConfigError::UnsupportedAntiAlias(level) => {
                write!(formatter, "anti-alias level {level} not in {{1, 2, 4, 8}}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Renderer-mutating payloads beyond scene setup. Broadcast to every pooled
/// worker; the issuing operation drains when every worker has acked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SceneUpdate {
    SelectScene {
        scene_id: u32,
    },
    SetParams {
        max_ray_depth: u32,
        render_mode: RenderMode,
    },
    SetCamera {
        pose: CameraPose,
    },
    StoreMesh {
        mesh_id: u32,
        vertices: Vec<[f32; 3]>,
    },
    StoreTexture {
        texture_id: u32,
        width: u32,
        height: u32,
        rgb: Vec<u8>,
    },
    RebuildAccel {
        bins: u32,
        wide: bool,
    },
}

/// Failure reported by the opaque kernel behind a worker slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// A block render was requested before scene setup resolved on this worker.
    SceneNotReady,
    /// Opaque kernel failure, reported verbatim.
    Kernel(String),
}

impl fmt::Display for RenderError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderError::SceneNotReady => {
                write!(formatter, "render requested before scene setup resolved")
            }
            RenderError::Kernel(message) => write!(formatter, "kernel failure: {message}"),
        }
    }
}

impl std::error::Error for RenderError {}

/// Scheduler-to-worker commands, processed strictly in ring order. Ring order
/// is load-bearing: a render enqueued behind a newer `SetScene` renders with
/// the newer scene, which is what lets scene setup be re-issued freely.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerCommand {
    SetScene {
        width: u32,
        height: u32,
        params: RenderParams,
    },
    Update(SceneUpdate),
    RenderBlock {
        block: Block,
        anti_alias: u32,
    },
    Terminate,
}

/// Worker-to-scheduler completion, tagged with the sending worker's identity.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerReceipt {
    pub worker: WorkerId,
    pub kind: WorkerReceiptKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerReceiptKind {
    /// The init-ready token: scene setup resolved, first dispatch may proceed.
    SceneReady,
    UpdateApplied,
    /// Ack for a failed update. Still counts toward the broadcast drain so a
    /// failing kernel cannot wedge the serializer.
    UpdateFailed {
        error: RenderError,
    },
    BlockRendered {
        block: BlockId,
        /// Packed RGB, row-major, `3 * width * height` bytes of the rect.
        pixels: Vec<u8>,
    },
    RenderFailed {
        block: BlockId,
        error: RenderError,
    },
    Terminated,
}

/// Outward progress events. `Done` is the last event of a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RenderEvent {
    Queued { block: Block },
    Unqueued { block: Block },
    Progress { block: Block, done: u32, total: u32 },
    Done { duration: Duration },
}

impl RenderEvent {
    pub fn kind(&self) -> RenderEventKind {
        match self {
            RenderEvent::Queued { .. } => RenderEventKind::Queued,
            RenderEvent::Unqueued { .. } => RenderEventKind::Unqueued,
            RenderEvent::Progress { .. } => RenderEventKind::Progress,
            RenderEvent::Done { .. } => RenderEventKind::Done,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderEventKind {
    Queued,
    Unqueued,
    Progress,
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(block_size: u32, width: u32, height: u32) -> RenderConfig {
        RenderConfig {
            block_size,
            width,
            height,
            anti_alias: 1,
            de_band: false,
            params: RenderParams {
                scene_id: 0,
                max_ray_depth: 4,
                render_mode: RenderMode::Color,
                camera: CameraPose {
                    position: [0.0, 0.0, -2.0],
                    rot_x: 0.0,
                    rot_y: 0.0,
                },
            },
        }
    }

    #[test]
    fn grid_covers_viewport_exactly_once() {
        let rects = BlockRect::grid(250, 100, 100);
        assert_eq!(rects.len(), 3);
        assert_eq!(
            rects,
            vec![
                BlockRect { x: 0, y: 0, width: 100, height: 100 },
                BlockRect { x: 100, y: 0, width: 100, height: 100 },
                BlockRect { x: 200, y: 0, width: 50, height: 100 },
            ]
        );
        let area: u64 = rects.iter().map(BlockRect::area).sum();
        assert_eq!(area, 250 * 100);
    }

    #[test]
    fn grid_with_oversized_block_is_a_single_rect() {
        let rects = BlockRect::grid(33, 21, 64);
        assert_eq!(
            rects,
            vec![BlockRect { x: 0, y: 0, width: 33, height: 21 }]
        );
    }

    #[test]
    fn grid_area_sums_for_ragged_both_axes() {
        let rects = BlockRect::grid(257, 130, 128);
        assert_eq!(rects.len(), 3 * 2);
        let area: u64 = rects.iter().map(BlockRect::area).sum();
        assert_eq!(area, 257 * 130);
        assert!(rects.iter().all(|r| r.width <= 128 && r.height <= 128));
        assert!(rects.iter().all(|r| r.width >= 1 && r.height >= 1));
    }

    #[test]
    fn config_rejects_zero_block_size() {
        assert_eq!(config(0, 10, 10).validate(), Err(ConfigError::ZeroBlockSize));
    }

    #[test]
    fn config_rejects_empty_viewport() {
        assert_eq!(
            config(16, 0, 10).validate(),
            Err(ConfigError::EmptyViewport { width: 0, height: 10 })
        );
        assert_eq!(
            config(16, 10, 0).validate(),
            Err(ConfigError::EmptyViewport { width: 10, height: 0 })
        );
    }

    #[test]
    fn config_rejects_odd_anti_alias_levels() {
        let mut cfg = config(16, 10, 10);
        for level in [0, 3, 5, 16] {
            cfg.anti_alias = level;
            assert_eq!(cfg.validate(), Err(ConfigError::UnsupportedAntiAlias(level)));
        }
        for level in [1, 2, 4, 8] {
            cfg.anti_alias = level;
            assert_eq!(cfg.validate(), Ok(()));
        }
    }

    #[test]
    fn block_total_matches_grid_len() {
        for (w, h, bs) in [(256, 256, 128), (250, 100, 100), (1, 1, 1), (640, 480, 33)] {
            let cfg = config(bs, w, h);
            assert_eq!(cfg.block_total() as usize, BlockRect::grid(w, h, bs).len());
        }
    }
}
