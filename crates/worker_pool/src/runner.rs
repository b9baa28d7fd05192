//! Per-worker thread body: drains the command ring in order, drives the
//! opaque renderer, and reports completions on the shared receipt channel.

use std::thread;
use std::time::Duration;

use crossbeam_channel::Sender;
use protocol::{RenderError, WorkerCommand, WorkerId, WorkerReceipt, WorkerReceiptKind};
use rtrb::{Consumer, PopError};

use crate::BlockRenderer;

const IDLE_SLEEP_DURATION: Duration = Duration::from_millis(1);

pub(crate) fn spawn(
    id: WorkerId,
    renderer: Box<dyn BlockRenderer>,
    commands: Consumer<WorkerCommand>,
    receipts: Sender<WorkerReceipt>,
) {
    // Detached on purpose: terminate carries no completion obligation, and a
    // hung kernel must never stall pool reconfiguration.
    thread::Builder::new()
        .name(format!("render-worker-{}", id.0))
        .spawn(move || run_worker_loop(id, renderer, commands, receipts))
        .unwrap_or_else(|error| panic!("failed to spawn worker {:?}: {error}", id));
}

fn run_worker_loop(
    id: WorkerId,
    mut renderer: Box<dyn BlockRenderer>,
    mut commands: Consumer<WorkerCommand>,
    receipts: Sender<WorkerReceipt>,
) {
    // Receipt sends ignore disconnection: a receiver that went away means the
    // result is stale by definition.
    let send = |kind: WorkerReceiptKind| {
        let _ = receipts.send(WorkerReceipt { worker: id, kind });
    };

    let mut scene_set = false;

    loop {
        match commands.pop() {
            Ok(WorkerCommand::SetScene { width, height, params }) => {
                match renderer.set_scene(width, height, &params) {
                    Ok(()) => {
                        scene_set = true;
                        send(WorkerReceiptKind::SceneReady);
                    }
                    Err(error) => {
                        // No ready receipt: the slot stays gated and the
                        // coarse recovery path applies.
                        eprintln!("[worker {}] scene setup failed: {error}", id.0);
                    }
                }
            }
            Ok(WorkerCommand::Update(update)) => match renderer.apply_update(&update) {
                Ok(()) => send(WorkerReceiptKind::UpdateApplied),
                Err(error) => send(WorkerReceiptKind::UpdateFailed { error }),
            },
            Ok(WorkerCommand::RenderBlock { block, anti_alias }) => {
                if !scene_set {
                    send(WorkerReceiptKind::RenderFailed {
                        block: block.id,
                        error: RenderError::SceneNotReady,
                    });
                    continue;
                }
                match renderer.render_block(block.rect, anti_alias) {
                    Ok(pixels) => send(WorkerReceiptKind::BlockRendered {
                        block: block.id,
                        pixels,
                    }),
                    Err(error) => send(WorkerReceiptKind::RenderFailed {
                        block: block.id,
                        error,
                    }),
                }
            }
            Ok(WorkerCommand::Terminate) => {
                renderer.terminate();
                send(WorkerReceiptKind::Terminated);
                return;
            }
            Err(PopError::Empty) => {
                if commands.is_abandoned() {
                    // Producer dropped without a terminate: nothing more can
                    // arrive, release the renderer and exit.
                    renderer.terminate();
                    return;
                }
                thread::sleep(IDLE_SLEEP_DURATION);
            }
        }
    }
}
