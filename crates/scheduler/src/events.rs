//! Broadcast sinks for scheduler progress events.
//!
//! One unbounded channel per subscriber, filtered by event kind. Emission
//! never blocks the scheduler; subscribers that went away are pruned on the
//! next matching emit.

use crossbeam_channel::{unbounded, Receiver, Sender};
use protocol::{RenderEvent, RenderEventKind};

#[derive(Default)]
pub(crate) struct EventSinks {
    subscribers: Vec<(RenderEventKind, Sender<RenderEvent>)>,
}

impl EventSinks {
    pub(crate) fn subscribe(&mut self, kind: RenderEventKind) -> Receiver<RenderEvent> {
        let (sender, receiver) = unbounded();
        self.subscribers.push((kind, sender));
        receiver
    }

    pub(crate) fn emit(&mut self, event: RenderEvent) {
        let kind = event.kind();
        self.subscribers
            .retain(|(subscribed, sender)| *subscribed != kind || sender.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use protocol::{Block, BlockId, BlockRect};

    use super::*;

    fn queued(id: u64) -> RenderEvent {
        RenderEvent::Queued {
            block: Block {
                id: BlockId(id),
                rect: BlockRect { x: 0, y: 0, width: 1, height: 1 },
            },
        }
    }

    #[test]
    fn subscribers_only_see_their_kind() {
        let mut sinks = EventSinks::default();
        let queued_events = sinks.subscribe(RenderEventKind::Queued);
        let done_events = sinks.subscribe(RenderEventKind::Done);

        sinks.emit(queued(1));
        assert_eq!(queued_events.try_iter().count(), 1);
        assert_eq!(done_events.try_iter().count(), 0);
    }

    #[test]
    fn dropped_subscriber_is_pruned_without_blocking_emit() {
        let mut sinks = EventSinks::default();
        let first = sinks.subscribe(RenderEventKind::Queued);
        let second = sinks.subscribe(RenderEventKind::Queued);
        drop(first);

        sinks.emit(queued(1));
        sinks.emit(queued(2));
        assert_eq!(second.try_iter().count(), 2);
    }
}
