//! Render driver: owns the scheduler thread and the operation serializer.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use framebuffer::FrameSnapshot;
use job_queue::{JobTicket, SerialJobQueue};
use protocol::{ConfigError, RenderConfig, RenderEvent, RenderEventKind, SceneUpdate};
use scheduler::{run_scheduler_loop, BlockScheduler, SchedulerCommand, UpdateError};
use worker_pool::RendererFactory;

/// Shell-facing handle to the renderer.
///
/// Frame starts and scene updates are serialized: each runs only after the
/// previous such operation has fully drained, so the stateful kernel only
/// ever observes a linear operation history. Pool resizing, subscriptions
/// and snapshots go to the scheduler directly; resizing in particular is the
/// coarse recovery knob and must never queue behind a wedged operation.
pub struct RenderDriver {
    commands: Sender<SchedulerCommand>,
    jobs: Option<SerialJobQueue>,
    scheduler_thread: Option<JoinHandle<()>>,
}

impl RenderDriver {
    /// Caps the worker pool at the machine's parallelism.
    pub fn new(factory: RendererFactory) -> RenderDriver {
        let cap = thread::available_parallelism()
            .map(|cores| cores.get())
            .unwrap_or(1);
        Self::with_worker_cap(factory, Some(cap))
    }

    /// `max_workers: None` leaves the pool uncapped; tests use this to pin
    /// exact pool sizes.
    pub fn with_worker_cap(factory: RendererFactory, max_workers: Option<usize>) -> RenderDriver {
        let (commands, command_receiver) = unbounded();
        let scheduler_thread = thread::Builder::new()
            .name("block-scheduler".to_string())
            .spawn(move || {
                let scheduler = BlockScheduler::new(factory, max_workers);
                run_scheduler_loop(scheduler, command_receiver);
            })
            .expect("failed to spawn scheduler thread");
        RenderDriver {
            commands,
            jobs: Some(SerialJobQueue::new()),
            scheduler_thread: Some(scheduler_thread),
        }
    }

    /// Begins a new frame. The ticket settles once the frame is set up and
    /// dispatching, or with the validation error; the render itself completes
    /// asynchronously through the event stream.
    pub fn start(&self, config: RenderConfig) -> JobTicket<Result<(), ConfigError>> {
        let commands = self.commands.clone();
        self.jobs().submit(move || {
            round_trip(&commands, |ack| SchedulerCommand::Start { config, ack })
        })
    }

    /// Broadcasts a renderer-mutating update to every worker. The ticket
    /// settles when every worker has acked (or left the pool).
    pub fn apply_update(&self, update: SceneUpdate) -> JobTicket<Result<(), UpdateError>> {
        let commands = self.commands.clone();
        self.jobs().submit(move || {
            round_trip(&commands, |ack| SchedulerCommand::ApplyUpdate { update, ack })
        })
    }

    /// Grows or shrinks the worker pool; returns the size actually assumed
    /// after cap clamping.
    pub fn resize_pool(&self, target: usize) -> usize {
        round_trip(&self.commands, |ack| SchedulerCommand::ResizePool { target, ack })
    }

    pub fn subscribe(&self, kind: RenderEventKind) -> Receiver<RenderEvent> {
        round_trip(&self.commands, |ack| SchedulerCommand::Subscribe { kind, ack })
    }

    /// Copy of the current presentation surface, if a frame was ever started.
    pub fn snapshot(&self) -> Option<FrameSnapshot> {
        round_trip(&self.commands, |ack| SchedulerCommand::Snapshot { ack })
    }

    pub fn set_de_band(&self, enabled: bool) {
        round_trip(&self.commands, |ack| SchedulerCommand::SetDeBand { enabled, ack });
    }

    fn jobs(&self) -> &SerialJobQueue {
        self.jobs.as_ref().expect("driver already shut down")
    }
}

fn round_trip<T>(
    commands: &Sender<SchedulerCommand>,
    build: impl FnOnce(Sender<T>) -> SchedulerCommand,
) -> T {
    let (ack, response) = bounded(1);
    commands
        .send(build(ack))
        .unwrap_or_else(|_| panic!("scheduler thread is gone"));
    response
        .recv()
        .unwrap_or_else(|_| panic!("scheduler thread dropped an ack"))
}

impl Drop for RenderDriver {
    fn drop(&mut self) {
        // Serialized jobs round-trip to the scheduler, so drain them while
        // the loop is still alive, then stop the loop and join it.
        self.jobs = None;
        let _ = self.commands.send(SchedulerCommand::Shutdown);
        if let Some(scheduler_thread) = self.scheduler_thread.take() {
            let _ = scheduler_thread.join();
        }
    }
}
