use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use framebuffer::{FrameBuffer, FrameSnapshot};
use protocol::{
    Block, BlockId, BlockRect, ConfigError, FrameEpoch, RenderConfig, RenderEvent,
    RenderEventKind, SceneUpdate, WorkerCommand, WorkerId, WorkerReceipt, WorkerReceiptKind,
};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use smallvec::SmallVec;
use worker_pool::{InFlightBlock, RendererFactory, SceneSetup, WorkerPool};

use crate::events::EventSinks;

/// Aggregate failure of a scene-update broadcast: the update drained, but
/// some workers reported kernel errors.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateError {
    pub failures: Vec<(WorkerId, protocol::RenderError)>,
}

impl fmt::Display for UpdateError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "scene update failed on {} worker(s)",
            self.failures.len()
        )
    }
}

impl std::error::Error for UpdateError {}

/// Per-frame state. Owned by the scheduler, replaced wholesale by `start`.
struct FrameState {
    buffer: FrameBuffer,
    total: u32,
    done: u32,
    started_at: Instant,
}

impl FrameState {
    fn complete(&self) -> bool {
        self.done == self.total
    }
}

/// A scene-update broadcast that has not drained yet. At most one exists at a
/// time; the serializer upstream guarantees updates do not overlap.
struct PendingUpdate {
    waiting: HashSet<WorkerId>,
    failures: Vec<(WorkerId, protocol::RenderError)>,
    ack: Sender<Result<(), UpdateError>>,
}

pub struct BlockScheduler {
    pool: WorkerPool,
    pending: VecDeque<Block>,
    frame: Option<FrameState>,
    config: Option<RenderConfig>,
    events: EventSinks,
    receipts: Receiver<WorkerReceipt>,
    pending_update: Option<PendingUpdate>,
    next_block: u64,
    next_epoch: u64,
    rng: SmallRng,
}

impl BlockScheduler {
    /// `max_workers` optionally caps `resize_pool`; shells usually pass the
    /// machine's parallelism, tests pass `None` for exact pool sizes.
    pub fn new(factory: RendererFactory, max_workers: Option<usize>) -> BlockScheduler {
        let (receipt_sender, receipts) = unbounded();
        BlockScheduler {
            pool: WorkerPool::new(factory, receipt_sender, max_workers),
            pending: VecDeque::new(),
            frame: None,
            config: None,
            events: EventSinks::default(),
            receipts,
            pending_update: None,
            next_block: 0,
            next_epoch: 0,
            rng: SmallRng::from_os_rng(),
        }
    }

    /// Begins a new frame.
    ///
    /// An incomplete previous frame gets its workers terminated and replaced
    /// (fresh ids, so their late results fail the identity check and vanish);
    /// a complete one keeps its workers and re-initializes them for the new
    /// viewport. Rejected configs have no effect and emit nothing.
    pub fn start(&mut self, config: RenderConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let scene = SceneSetup {
            width: config.width,
            height: config.height,
            params: config.params.clone(),
        };

        let incomplete = self.frame.as_ref().is_some_and(|frame| !frame.complete());
        if incomplete {
            self.pool.recycle_all(Some(&scene));
        } else {
            self.pool.reinitialize_all(&scene);
        }
        self.prune_update_waiters();
        self.pending.clear();

        let epoch = FrameEpoch(self.next_epoch);
        self.next_epoch += 1;
        let buffer = FrameBuffer::new(config.width, config.height, epoch, config.de_band);

        let mut blocks: Vec<Block> =
            BlockRect::grid(config.width, config.height, config.block_size)
                .into_iter()
                .map(|rect| {
                    let id = BlockId(self.next_block);
                    self.next_block += 1;
                    Block { id, rect }
                })
                .collect();
        blocks.shuffle(&mut self.rng);

        self.frame = Some(FrameState {
            buffer,
            total: config.block_total(),
            done: 0,
            started_at: Instant::now(),
        });
        self.pending = blocks.into();
        self.config = Some(config);

        self.dispatch();
        Ok(())
    }

    /// Grows or shrinks the pool toward `requested` (clamped to the cap) and
    /// returns the size actually assumed. Shrinking reclaims the popped
    /// workers' in-flight blocks back into the pending queue, one `Unqueued`
    /// each; growing constructs workers that join the current frame once
    /// their scene setup resolves.
    pub fn resize_pool(&mut self, requested: usize) -> usize {
        let target = self.pool.clamp_size(requested);
        if target < self.pool.len() {
            for block in self.pool.shrink_to(target) {
                self.pending.push_back(block);
                self.events.emit(RenderEvent::Unqueued { block });
            }
            self.prune_update_waiters();
        } else if target > self.pool.len() {
            let scene = self.scene_setup();
            self.pool.grow_to(target, scene.as_ref());
        }
        self.dispatch();
        target
    }

    /// Broadcasts a renderer-mutating update to every pooled worker. The ack
    /// fires once every worker answered (or left the pool); kernel failures
    /// are collected into the ack's error.
    pub fn apply_update(&mut self, update: SceneUpdate, ack: Sender<Result<(), UpdateError>>) {
        if self.pending_update.is_some() {
            panic!("scene update submitted while a previous update is draining");
        }
        let sent = self.pool.broadcast_update(&update);
        if sent == 0 {
            let _ = ack.send(Ok(()));
            return;
        }
        self.pending_update = Some(PendingUpdate {
            waiting: self.pool.iter().map(|slot| slot.id()).collect(),
            failures: Vec::new(),
            ack,
        });
    }

    /// Toggles de-banding on the current frame buffer.
    pub fn set_de_band(&mut self, enabled: bool) {
        if let Some(frame) = &mut self.frame {
            frame.buffer.set_de_band(enabled);
        }
    }

    pub fn subscribe(&mut self, kind: RenderEventKind) -> Receiver<RenderEvent> {
        self.events.subscribe(kind)
    }

    /// The current frame buffer, if a frame was ever started.
    pub fn target(&self) -> Option<&FrameBuffer> {
        self.frame.as_ref().map(|frame| &frame.buffer)
    }

    pub fn snapshot(&self) -> Option<FrameSnapshot> {
        self.target().map(FrameBuffer::snapshot)
    }

    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }

    /// `(done, total)` of the current frame.
    pub fn progress(&self) -> Option<(u32, u32)> {
        self.frame.as_ref().map(|frame| (frame.done, frame.total))
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.pool
            .iter()
            .filter(|slot| slot.in_flight.is_some())
            .count()
    }

    /// A clone of the worker completion channel, for select-based loops.
    pub fn receipt_receiver(&self) -> Receiver<WorkerReceipt> {
        self.receipts.clone()
    }

    /// Handles all receipts that are already queued, without blocking.
    pub fn poll(&mut self) -> usize {
        let batch: SmallVec<[WorkerReceipt; 8]> = self.receipts.try_iter().collect();
        let handled = batch.len();
        for receipt in batch {
            self.handle_receipt(receipt);
        }
        handled
    }

    /// Blocks up to `timeout` for one receipt, then drains the rest.
    pub fn poll_timeout(&mut self, timeout: Duration) -> usize {
        match self.receipts.recv_timeout(timeout) {
            Ok(receipt) => {
                self.handle_receipt(receipt);
                1 + self.poll()
            }
            Err(_) => 0,
        }
    }

    pub fn handle_receipt(&mut self, receipt: WorkerReceipt) {
        match receipt.kind {
            WorkerReceiptKind::SceneReady => {
                if let Some(slot) = self.pool.slot_mut(receipt.worker) {
                    slot.scene_ready = true;
                }
                self.dispatch();
            }
            WorkerReceiptKind::UpdateApplied => self.ack_update(receipt.worker, None),
            WorkerReceiptKind::UpdateFailed { error } => {
                self.ack_update(receipt.worker, Some(error));
            }
            WorkerReceiptKind::BlockRendered { block, pixels } => {
                self.composite(receipt.worker, block, pixels);
            }
            WorkerReceiptKind::RenderFailed { block, error } => {
                // The slot keeps its in-flight block and stays out of
                // dispatch; resize_pool or the next start reclaims it.
                eprintln!(
                    "[scheduler] worker {} failed block {}: {error}",
                    receipt.worker.0, block.0
                );
            }
            WorkerReceiptKind::Terminated => {}
        }
    }

    /// Feeds every idle, scene-ready worker one pending block, emitting
    /// `Queued` per successful assignment.
    fn dispatch(&mut self) {
        let Some(frame) = &self.frame else {
            return;
        };
        let epoch = frame.buffer.epoch();
        let anti_alias = self.config.as_ref().map_or(1, |config| config.anti_alias);

        for slot in self.pool.iter_mut() {
            if !slot.scene_ready || slot.in_flight.is_some() {
                continue;
            }
            let Some(block) = self.pending.pop_front() else {
                break;
            };
            slot.in_flight = Some(InFlightBlock { block, epoch });
            slot.send(WorkerCommand::RenderBlock { block, anti_alias });
            self.events.emit(RenderEvent::Queued { block });
        }
    }

    /// The `on_result` path. Composites only when the result still matches
    /// the dispatch that produced it: the worker must still be pooled, its
    /// in-flight block id must match, and the in-flight record must be
    /// stamped with the current frame. Anything else is stale and dropped.
    fn composite(&mut self, worker: WorkerId, block: BlockId, pixels: Vec<u8>) {
        let Some(slot) = self.pool.slot_mut(worker) else {
            return;
        };
        let Some(in_flight) = slot.in_flight else {
            return;
        };
        if in_flight.block.id != block {
            return;
        }
        let Some(frame) = &mut self.frame else {
            return;
        };
        if in_flight.epoch != frame.buffer.epoch() {
            return;
        }

        slot.in_flight = None;
        frame.done += 1;
        frame.buffer.write_rect(in_flight.block.rect, &pixels);

        let (done, total) = (frame.done, frame.total);
        let elapsed = frame.started_at.elapsed();
        self.events.emit(RenderEvent::Progress {
            block: in_flight.block,
            done,
            total,
        });
        if done == total {
            self.events.emit(RenderEvent::Done { duration: elapsed });
        }
        self.dispatch();
    }

    fn ack_update(&mut self, worker: WorkerId, failure: Option<protocol::RenderError>) {
        let Some(update) = &mut self.pending_update else {
            return;
        };
        if !update.waiting.remove(&worker) {
            return;
        }
        if let Some(error) = failure {
            update.failures.push((worker, error));
        }
        if update.waiting.is_empty() {
            self.settle_update();
        }
    }

    /// Drops waiters that no longer exist in the pool (shrunk or recycled
    /// away) so a reconfiguration cannot wedge a draining update.
    fn prune_update_waiters(&mut self) {
        let Some(update) = &mut self.pending_update else {
            return;
        };
        let live: HashSet<WorkerId> = self.pool.iter().map(|slot| slot.id()).collect();
        update.waiting.retain(|id| live.contains(id));
        if update.waiting.is_empty() {
            self.settle_update();
        }
    }

    fn settle_update(&mut self) {
        let Some(update) = self.pending_update.take() else {
            return;
        };
        let result = if update.failures.is_empty() {
            Ok(())
        } else {
            Err(UpdateError {
                failures: update.failures,
            })
        };
        let _ = update.ack.send(result);
    }

    fn scene_setup(&self) -> Option<SceneSetup> {
        self.config.as_ref().map(|config| SceneSetup {
            width: config.width,
            height: config.height,
            params: config.params.clone(),
        })
    }
}
