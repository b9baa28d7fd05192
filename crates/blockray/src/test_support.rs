//! Fake kernel implementations for integration testing.
//!
//! The fakes render a deterministic position gradient so a composited frame
//! can be checked pixel for pixel, and they count every call through shared
//! atomics so tests can observe the driver's traffic without real rendering.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use protocol::{BlockRect, RenderError, RenderParams, SceneUpdate};
use worker_pool::{BlockRenderer, RendererFactory};

/// Expected value of the gradient fake at an absolute pixel position.
pub fn gradient_pixel(x: u32, y: u32) -> [u8; 3] {
    [(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8]
}

pub fn gradient_slab(rect: BlockRect) -> Vec<u8> {
    let mut slab = Vec::with_capacity(rect.area() as usize * 3);
    for j in 0..rect.height {
        for i in 0..rect.width {
            slab.extend_from_slice(&gradient_pixel(rect.x + i, rect.y + j));
        }
    }
    slab
}

/// Shared call counters for every renderer a [`fake_kernel_factory`] built.
#[derive(Clone, Default)]
pub struct FakeKernelStats {
    pub scenes_set: Arc<AtomicUsize>,
    pub updates_applied: Arc<AtomicUsize>,
    pub blocks_rendered: Arc<AtomicUsize>,
    pub terminations: Arc<AtomicUsize>,
}

impl FakeKernelStats {
    pub fn scenes_set(&self) -> usize {
        self.scenes_set.load(Ordering::SeqCst)
    }

    pub fn updates_applied(&self) -> usize {
        self.updates_applied.load(Ordering::SeqCst)
    }

    pub fn blocks_rendered(&self) -> usize {
        self.blocks_rendered.load(Ordering::SeqCst)
    }

    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }
}

struct FakeKernel {
    stats: FakeKernelStats,
}

impl BlockRenderer for FakeKernel {
    fn set_scene(&mut self, _w: u32, _h: u32, _params: &RenderParams) -> Result<(), RenderError> {
        self.stats.scenes_set.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn apply_update(&mut self, _update: &SceneUpdate) -> Result<(), RenderError> {
        self.stats.updates_applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn render_block(&mut self, rect: BlockRect, _anti_alias: u32) -> Result<Vec<u8>, RenderError> {
        self.stats.blocks_rendered.fetch_add(1, Ordering::SeqCst);
        Ok(gradient_slab(rect))
    }

    fn terminate(&mut self) {
        self.stats.terminations.fetch_add(1, Ordering::SeqCst);
    }
}

/// Instant gradient-rendering kernel, plus the counters it reports into.
pub fn fake_kernel_factory() -> (RendererFactory, FakeKernelStats) {
    let stats = FakeKernelStats::default();
    let factory: RendererFactory = Box::new({
        let stats = stats.clone();
        move || {
            Box::new(FakeKernel {
                stats: stats.clone(),
            })
        }
    });
    (factory, stats)
}
