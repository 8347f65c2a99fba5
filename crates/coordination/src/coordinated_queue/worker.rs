use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use beacon_realtime::{
    ClientEvent, CoordinatedAck, CoordinatedMsg, CoordinatedWelcome, EventEmitter, Inbound,
    Lifecycle, ParticipantId, WireMessage, event_names,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::{CoordinatedMessage, QueuedItem};
use crate::leader_election::{LeaderElection, LeaderEvent};
use crate::presence::{Participant, PresenceEvent};

pub(super) enum Command {
    Enqueue(QueuedItem),
    ProcessNext,
}

pub(super) struct Worker {
    id: ParticipantId,
    election: LeaderElection,
    commands: flume::Sender<Command>,
    events: Arc<EventEmitter<CoordinatedMessage>>,
    queued: Arc<AtomicUsize>,
    queue: VecDeque<QueuedItem>,
    /// An ack round is open.
    processing: bool,
    /// Participants whose ack the open round still waits for.
    pending: HashSet<ParticipantId>,
    current_token: String,
    /// Token of the last round surfaced to subscribers.
    surfaced_token: Option<String>,
    connected: bool,
}

impl Worker {
    pub(super) fn new(
        election: LeaderElection,
        commands: flume::Sender<Command>,
        events: Arc<EventEmitter<CoordinatedMessage>>,
        queued: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            id: election.presence().id().clone(),
            election,
            commands,
            events,
            queued,
            queue: VecDeque::new(),
            processing: false,
            pending: HashSet::new(),
            current_token: Uuid::new_v4().to_string(),
            surfaced_token: None,
            connected: true,
        }
    }

    pub(super) async fn run(
        mut self,
        commands: flume::Receiver<Command>,
        client_events: flume::Receiver<ClientEvent>,
        presence_events: flume::Receiver<PresenceEvent>,
        leader_events: flume::Receiver<LeaderEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                command = commands.recv_async() => match command {
                    Ok(Command::Enqueue(item)) => {
                        self.queue.push_back(item);
                        self.sync_len();
                        self.maybe_process_next().await;
                    }
                    Ok(Command::ProcessNext) => self.maybe_process_next().await,
                    Err(_) => break,
                },
                event = client_events.recv_async() => match event {
                    Ok(ClientEvent::Lifecycle(lifecycle)) => self.on_lifecycle(lifecycle).await,
                    Ok(ClientEvent::Message(inbound)) => self.on_message(inbound),
                    Err(_) => break,
                },
                event = presence_events.recv_async() => match event {
                    Ok(PresenceEvent::Change(participants)) => {
                        self.prune_departed(&participants);
                        self.maybe_process_next().await;
                    }
                    Ok(PresenceEvent::Join(participant)) => self.welcome(&participant).await,
                    Ok(_) => {}
                    Err(_) => break,
                },
                event = leader_events.recv_async() => match event {
                    Ok(LeaderEvent::LeadershipStateChanged { is_leader }) => {
                        if is_leader && self.processing {
                            debug!("{} became leader, releasing open round", self.id);
                            self.settle();
                        }
                        self.maybe_process_next().await;
                    }
                    Ok(LeaderEvent::LeaderRequested) => {}
                    Err(_) => break,
                },
            }
        }

        self.queue.clear();
        self.pending.clear();
        self.sync_len();

        debug!("{} queue loop stopped", self.id);
    }

    async fn on_lifecycle(&mut self, lifecycle: Lifecycle) {
        match lifecycle {
            Lifecycle::Disconnect => {
                self.connected = false;
                self.processing = false;
                self.pending.clear();
            }
            Lifecycle::Ready => {
                self.connected = true;
                self.maybe_process_next().await;
            }
            Lifecycle::Connect | Lifecycle::Reconnect => {}
        }
    }

    fn on_message(&mut self, inbound: Inbound) {
        match inbound.message {
            WireMessage::CoordinatedMsg(msg) => self.on_broadcast(inbound.src, msg),
            WireMessage::CoordinatedAck(ack) => self.on_ack(&ack),
            WireMessage::CoordinatedWelcome(CoordinatedWelcome { next_queue_item }) => {
                debug!(
                    "{} welcomed by {}, next item: {:?}",
                    self.id, inbound.src, next_queue_item
                );
            }
            _ => {}
        }
    }

    fn on_broadcast(&mut self, src: ParticipantId, CoordinatedMsg { ack, data }: CoordinatedMsg) {
        if self.surfaced_token.as_ref() == Some(&ack) {
            trace!("{} dropping repeated broadcast {}", self.id, ack);
            return;
        }

        self.current_token.clone_from(&ack);
        self.surfaced_token = Some(ack.clone());
        self.events.emit(&CoordinatedMessage {
            event: event_names::COORDINATED_MSG,
            src,
            ack_token: ack,
            data,
            client: self.election.presence().client().clone(),
        });
    }

    fn on_ack(&mut self, ack: &CoordinatedAck) {
        if ack.ack != self.current_token {
            trace!("{} dropping stale ack from {}", self.id, ack.member);
            return;
        }

        if !self.pending.remove(&ack.member) {
            trace!("{} dropping unexpected ack from {}", self.id, ack.member);
            return;
        }

        if self.processing && self.pending.is_empty() {
            self.settle();
        }
    }

    async fn welcome(&self, participant: &Participant) {
        if !self.election.is_leader() || participant.id == self.id {
            return;
        }

        let welcome = CoordinatedWelcome {
            next_queue_item: self
                .queue
                .front()
                .and_then(|item| serde_json::to_value(item).ok()),
        };

        if let Err(e) = self
            .election
            .presence()
            .client()
            .send(WireMessage::CoordinatedWelcome(welcome))
            .await
        {
            debug!("{} failed to welcome {}: {}", self.id, participant.id, e);
        }
    }

    fn prune_departed(&mut self, participants: &[Participant]) {
        let live = participants.iter().map(|p| &p.id).collect::<HashSet<_>>();
        let before = self.pending.len();

        self.pending.retain(|member| live.contains(member));

        if self.pending.len() < before {
            info!(
                "{} released {} departed participant(s) from the open round",
                self.id,
                before - self.pending.len()
            );
        }

        if self.processing && self.pending.is_empty() {
            self.settle();
        }
    }

    async fn maybe_process_next(&mut self) {
        if self.processing || !self.connected || !self.election.has_leader() {
            return;
        }

        let Some(item) = self.queue.pop_front() else {
            return;
        };
        self.sync_len();

        self.processing = true;
        self.pending = self
            .election
            .presence()
            .participants()
            .into_iter()
            .map(|p| p.id)
            .collect();

        if self.election.is_leader() {
            self.current_token = Uuid::new_v4().to_string();

            let message = serde_json::to_value(&item).map(|data| {
                WireMessage::CoordinatedMsg(CoordinatedMsg {
                    ack: self.current_token.clone(),
                    data,
                })
            });

            match message {
                Ok(message) => {
                    debug!(
                        "{} broadcasting {} to {} participant(s)",
                        self.id,
                        item.nonce,
                        self.pending.len()
                    );
                    if let Err(e) = self.election.presence().client().send(message).await {
                        warn!("{} failed to broadcast {}: {}", self.id, item.nonce, e);
                    }
                }
                Err(e) => warn!("{} cannot encode {}: {}", self.id, item.nonce, e),
            }
        }

        if self.pending.is_empty() {
            self.settle();
        }
    }

    /// Closes the open round and re-submits processing if items remain.
    fn settle(&mut self) {
        self.processing = false;
        self.pending.clear();

        trace!("{} round settled, {} queued", self.id, self.queue.len());

        if !self.queue.is_empty() {
            let _ = self.commands.send(Command::ProcessNext);
        }
    }

    fn sync_len(&self) {
        self.queued.store(self.queue.len(), Ordering::SeqCst);
    }
}
