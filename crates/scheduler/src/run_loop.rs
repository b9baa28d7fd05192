//! The scheduler thread body: one `select!` loop over driver commands and
//! worker receipts, so every state transition happens on this thread.

use crossbeam_channel::{Receiver, Sender};
use framebuffer::FrameSnapshot;
use protocol::{ConfigError, RenderConfig, RenderEvent, RenderEventKind, SceneUpdate};

use crate::scheduler_core::{BlockScheduler, UpdateError};

/// Driver-to-scheduler operations. Acks answer on single-slot channels; the
/// `ApplyUpdate` ack is withheld until the broadcast drains, which is what
/// the serializer upstream blocks on.
pub enum SchedulerCommand {
    Start {
        config: RenderConfig,
        ack: Sender<Result<(), ConfigError>>,
    },
    ResizePool {
        target: usize,
        /// Answers with the size actually assumed after cap clamping.
        ack: Sender<usize>,
    },
    ApplyUpdate {
        update: SceneUpdate,
        ack: Sender<Result<(), UpdateError>>,
    },
    SetDeBand {
        enabled: bool,
        ack: Sender<()>,
    },
    Subscribe {
        kind: RenderEventKind,
        ack: Sender<Receiver<RenderEvent>>,
    },
    Snapshot {
        ack: Sender<Option<FrameSnapshot>>,
    },
    Shutdown,
}

/// Runs until `Shutdown` arrives or the command channel disconnects.
/// Dropping the scheduler on the way out terminates the worker pool.
pub fn run_scheduler_loop(mut scheduler: BlockScheduler, commands: Receiver<SchedulerCommand>) {
    let receipts = scheduler.receipt_receiver();
    loop {
        crossbeam_channel::select! {
            recv(commands) -> message => {
                let Ok(command) = message else {
                    return;
                };
                match command {
                    SchedulerCommand::Start { config, ack } => {
                        let _ = ack.send(scheduler.start(config));
                    }
                    SchedulerCommand::ResizePool { target, ack } => {
                        let _ = ack.send(scheduler.resize_pool(target));
                    }
                    SchedulerCommand::ApplyUpdate { update, ack } => {
                        scheduler.apply_update(update, ack);
                    }
                    SchedulerCommand::SetDeBand { enabled, ack } => {
                        scheduler.set_de_band(enabled);
                        let _ = ack.send(());
                    }
                    SchedulerCommand::Subscribe { kind, ack } => {
                        let _ = ack.send(scheduler.subscribe(kind));
                    }
                    SchedulerCommand::Snapshot { ack } => {
                        let _ = ack.send(scheduler.snapshot());
                    }
                    SchedulerCommand::Shutdown => {
                        return;
                    }
                }
            }
            recv(receipts) -> message => {
                if let Ok(receipt) = message {
                    scheduler.handle_receipt(receipt);
                    scheduler.poll();
                }
            }
        }
    }
}
