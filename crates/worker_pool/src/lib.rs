//! Worker pool: owns the block-renderer instances and the factory discipline.
//!
//! Each slot pairs an opaque renderer (running on its own thread) with the
//! scheduler-side record of its state: scene readiness and the block it is
//! currently rendering. Commands travel over a per-worker SPSC ring; all
//! completions funnel into one shared receipt channel owned by the scheduler.
//!
//! Determinism rules: iteration is insertion order, shrink removes from the
//! tail, and worker ids are never reused.

use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use protocol::{
    Block, BlockRect, FrameEpoch, RenderError, RenderParams, SceneUpdate, WorkerCommand,
    WorkerId, WorkerReceipt,
};
use rtrb::{Producer, PushError, RingBuffer};

mod runner;

/// Boundary to the opaque raytracer kernel. One instance per worker slot,
/// driven from that worker's thread only.
///
/// `render_block` returns a packed RGB slab, row-major, top-left origin,
/// `3 * rect.width * rect.height` bytes. It is never invoked while a previous
/// invocation on the same instance is outstanding.
pub trait BlockRenderer: Send {
    fn set_scene(&mut self, width: u32, height: u32, params: &RenderParams)
        -> Result<(), RenderError>;

    fn apply_update(&mut self, update: &SceneUpdate) -> Result<(), RenderError>;

    fn render_block(&mut self, rect: BlockRect, anti_alias: u32) -> Result<Vec<u8>, RenderError>;

    /// Releases the instance. Nothing is awaited afterwards.
    fn terminate(&mut self) {}
}

/// Constructor closure for fresh renderer instances, supplied by the shell.
pub type RendererFactory = Box<dyn Fn() -> Box<dyn BlockRenderer> + Send>;

/// Viewport plus parameter bag handed to workers at scene-setup time.
#[derive(Debug, Clone)]
pub struct SceneSetup {
    pub width: u32,
    pub height: u32,
    pub params: RenderParams,
}

/// A block that has been handed to a worker, stamped with the frame it was
/// dispatched for.
#[derive(Debug, Clone, Copy)]
pub struct InFlightBlock {
    pub block: Block,
    pub epoch: FrameEpoch,
}

const COMMAND_RING_CAPACITY: usize = 16;
const COMMAND_PUSH_TIMEOUT: Duration = Duration::from_secs(1);

pub struct WorkerSlot {
    id: WorkerId,
    commands: Producer<WorkerCommand>,
    /// Resolved init-ready token: set when this worker's `SceneReady` receipt
    /// arrives, cleared whenever a new `SetScene` is issued.
    pub scene_ready: bool,
    pub in_flight: Option<InFlightBlock>,
}

impl WorkerSlot {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Pushes one command onto this worker's ring. The ring only backs up if
    /// the scheduler violates the one-render-in-flight rule, so exhausting the
    /// retry window is a bug and panics. A worker whose thread already exited
    /// swallows commands: the slot is stuck either way and the coarse
    /// recovery (resize or restart) is the documented way out.
    pub fn send(&mut self, command: WorkerCommand) {
        if self.commands.is_abandoned() {
            return;
        }
        let mut pending = command;
        let deadline = Instant::now() + COMMAND_PUSH_TIMEOUT;
        loop {
            match self.commands.push(pending) {
                Ok(()) => return,
                Err(PushError::Full(returned)) => {
                    if self.commands.is_abandoned() {
                        return;
                    }
                    if Instant::now() >= deadline {
                        panic!("worker {:?} command ring full past deadline", self.id);
                    }
                    pending = returned;
                    std::thread::yield_now();
                }
            }
        }
    }
}

pub struct WorkerPool {
    factory: RendererFactory,
    receipts: Sender<WorkerReceipt>,
    slots: Vec<WorkerSlot>,
    next_worker: u64,
    max_workers: Option<usize>,
}

impl WorkerPool {
    /// `receipts` is the scheduler's shared completion channel; every spawned
    /// worker gets a clone. `max_workers` optionally caps growth (a shell
    /// typically passes the machine's parallelism).
    pub fn new(
        factory: RendererFactory,
        receipts: Sender<WorkerReceipt>,
        max_workers: Option<usize>,
    ) -> WorkerPool {
        WorkerPool {
            factory,
            receipts,
            slots: Vec::new(),
            next_worker: 0,
            max_workers,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerSlot> + '_ {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut WorkerSlot> + '_ {
        self.slots.iter_mut()
    }

    pub fn slot_mut(&mut self, id: WorkerId) -> Option<&mut WorkerSlot> {
        self.slots.iter_mut().find(|slot| slot.id == id)
    }

    /// The size the pool will actually assume for a requested size.
    pub fn clamp_size(&self, requested: usize) -> usize {
        match self.max_workers {
            Some(cap) => requested.min(cap),
            None => requested,
        }
    }

    /// Grows to the clamped target, constructing fresh workers. When a scene
    /// is active each new worker is immediately sent its setup so it can join
    /// the running frame once ready.
    pub fn grow_to(&mut self, requested: usize, scene: Option<&SceneSetup>) {
        let target = self.clamp_size(requested);
        while self.slots.len() < target {
            let slot = self.construct(scene);
            self.slots.push(slot);
        }
    }

    /// Shrinks to `target` by popping tail slots. Each popped slot's in-flight
    /// block (if any) is reclaimed; the returned blocks are in pop order and
    /// each appears exactly once. Popped workers are told to terminate and
    /// are not waited on.
    pub fn shrink_to(&mut self, target: usize) -> Vec<Block> {
        let mut reclaimed = Vec::new();
        while self.slots.len() > target {
            let Some(mut slot) = self.slots.pop() else {
                break;
            };
            if let Some(in_flight) = slot.in_flight.take() {
                reclaimed.push(in_flight.block);
            }
            slot.send(WorkerCommand::Terminate);
        }
        reclaimed
    }

    /// Terminates every current worker (their in-flight blocks are forgotten,
    /// not reclaimed) and constructs the same number of replacements with
    /// fresh ids. Used when a new frame overtakes an incomplete one.
    pub fn recycle_all(&mut self, scene: Option<&SceneSetup>) {
        let count = self.slots.len();
        for slot in &mut self.slots {
            slot.in_flight = None;
            slot.send(WorkerCommand::Terminate);
        }
        self.slots.clear();
        for _ in 0..count {
            let slot = self.construct(scene);
            self.slots.push(slot);
        }
    }

    /// Re-issues scene setup to every kept worker, resetting their init-ready
    /// tokens. Used when a new frame begins over a completed one.
    pub fn reinitialize_all(&mut self, scene: &SceneSetup) {
        for slot in &mut self.slots {
            slot.scene_ready = false;
            slot.send(WorkerCommand::SetScene {
                width: scene.width,
                height: scene.height,
                params: scene.params.clone(),
            });
        }
    }

    /// Broadcasts an update to every worker; returns how many were sent, which
    /// is the number of acks the operation must await.
    pub fn broadcast_update(&mut self, update: &SceneUpdate) -> usize {
        for slot in &mut self.slots {
            slot.send(WorkerCommand::Update(update.clone()));
        }
        self.slots.len()
    }

    fn construct(&mut self, scene: Option<&SceneSetup>) -> WorkerSlot {
        let id = WorkerId(self.next_worker);
        self.next_worker += 1;

        let (producer, consumer) = RingBuffer::new(COMMAND_RING_CAPACITY);
        let renderer = (self.factory)();
        runner::spawn(id, renderer, consumer, self.receipts.clone());

        let mut slot = WorkerSlot {
            id,
            commands: producer,
            scene_ready: false,
            in_flight: None,
        };
        if let Some(scene) = scene {
            slot.send(WorkerCommand::SetScene {
                width: scene.width,
                height: scene.height,
                params: scene.params.clone(),
            });
        }
        slot
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for slot in &mut self.slots {
            slot.send(WorkerCommand::Terminate);
        }
    }
}
