use std::cmp::Ordering;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Context, QueueItemProcessor, ReplicationCursor, wait_for_signal};
use crate::indexed_queue::{IndexedStorage, TrackerEvent};
use crate::presence::PresenceEvent;

enum Step {
    /// Applied an item, try the next one right away.
    Progress,
    /// Caught up or nothing to chase.
    Idle,
    /// Transient failure, try again after the retry delay.
    Retry,
}

pub(super) async fn run<S: IndexedStorage, P: QueueItemProcessor>(
    context: Context<S, P>,
    presence_events: flume::Receiver<PresenceEvent>,
    tracker_events: flume::Receiver<TrackerEvent>,
    cancel: CancellationToken,
) {
    info!("{} replicating as follower", context.id());

    loop {
        let retry_at = loop {
            if cancel.is_cancelled() {
                break None;
            }

            match step(&context).await {
                Step::Progress => tokio::task::yield_now().await,
                Step::Idle => break None,
                Step::Retry => break Some(Instant::now() + context.config.retry_delay),
            }
        };

        if !wait_for_signal(&presence_events, &tracker_events, &cancel, retry_at).await {
            break;
        }
    }

    debug!("{} follower role stopped", context.id());
}

async fn step<S: IndexedStorage, P: QueueItemProcessor>(context: &Context<S, P>) -> Step {
    let Some(leader) = context.election.leader() else {
        return Step::Idle;
    };
    let Some(participant) = context.election.presence().participant(&leader) else {
        return Step::Idle;
    };
    let Some(expected) = ReplicationCursor::of_participant(&participant).index else {
        // No cursor orders below every index, so we are ahead of the leader
        if let Some(ours) = context.cursor() {
            warn!(
                "{} is ahead of leader {} ({} > none), realigning",
                context.id(),
                leader,
                ours
            );
            context.clear_cursor();
        }
        return Step::Idle;
    };

    let Some(after) = context.cursor() else {
        info!("{} starts following at {}", context.id(), expected);
        context.publish_cursor(&expected);
        return Step::Idle;
    };

    match after.cmp(&expected) {
        Ordering::Equal => return Step::Idle,
        Ordering::Greater => {
            warn!(
                "{} is ahead of leader {} ({} > {}), realigning",
                context.id(),
                leader,
                after,
                expected
            );
            context.publish_cursor(&expected);
            return Step::Idle;
        }
        Ordering::Less => {}
    }

    match context.tracker.dequeue_between(&after, &expected).await {
        Ok(Some(item)) => {
            debug!("{} processing {} as follower", context.id(), item.index);

            match context.processor.process(&item).await {
                Ok(()) => {
                    context.publish_cursor(&item.index);
                    Step::Progress
                }
                Err(e) => {
                    warn!("{} failed to process {}: {}", context.id(), item.index, e);
                    Step::Retry
                }
            }
        }
        Ok(None) => {
            warn!(
                "{} found nothing between {} and {}, skipping to {}",
                context.id(),
                after,
                expected,
                expected
            );
            context.publish_cursor(&expected);
            Step::Idle
        }
        Err(e) => {
            warn!("{} could not catch up to {}: {}", context.id(), expected, e);
            Step::Retry
        }
    }
}
