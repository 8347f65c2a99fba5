use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{Context, QueueItemProcessor, ReplicationCursor, wait_for_signal};
use crate::indexed_queue::{IndexedStorage, TrackerEvent};
use crate::presence::PresenceEvent;

pub(super) async fn run<S: IndexedStorage, P: QueueItemProcessor>(
    context: Context<S, P>,
    presence_events: flume::Receiver<PresenceEvent>,
    tracker_events: flume::Receiver<TrackerEvent>,
    cancel: CancellationToken,
) {
    info!("{} replicating as leader", context.id());

    loop {
        while !cancel.is_cancelled() && aligned(&context) {
            let Some(item) = context.tracker.dequeue() else {
                break;
            };

            // Followers start chasing while the leader processes
            context.publish_cursor(&item.index);

            debug!("{} processing {} as leader", context.id(), item.index);

            if let Err(e) = context.processor.process(&item).await {
                error!("{} failed to process {}: {}", context.id(), item.index, e);
            }

            tokio::task::yield_now().await;
        }

        if !wait_for_signal(&presence_events, &tracker_events, &cancel, None).await {
            break;
        }
    }

    debug!("{} leader role stopped", context.id());
}

/// Whether every live participant published the local cursor.
fn aligned<S: IndexedStorage, P: QueueItemProcessor>(context: &Context<S, P>) -> bool {
    let local = context.cursor();

    context
        .election
        .presence()
        .participants()
        .iter()
        .all(|participant| ReplicationCursor::of_participant(participant).index == local)
}
