use std::sync::Arc;

use beacon_realtime::{ClientEvent, EventEmitter, Inbound, Lifecycle, ParticipantId, WireMessage};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::{ElectionState, LeaderEvent, ParticipantComparator, rank};
use crate::config::LeaderElectionConfig;
use crate::presence::{Presence, PresenceEvent};
use crate::timer::sleep_until;

pub(super) struct Worker {
    id: ParticipantId,
    presence: Presence,
    config: LeaderElectionConfig,
    comparator: ParticipantComparator,
    leader: watch::Sender<Option<ParticipantId>>,
    events: Arc<EventEmitter<LeaderEvent>>,
    /// Last leadership value handed to subscribers.
    last_notified: Option<bool>,
    connected: bool,
    /// Whether the warm-up evaluation already ran.
    warm: bool,
    eval_at: Option<Instant>,
    notify_at: Option<Instant>,
}

impl Worker {
    pub(super) fn new(
        presence: Presence,
        config: LeaderElectionConfig,
        comparator: ParticipantComparator,
        leader: watch::Sender<Option<ParticipantId>>,
        events: Arc<EventEmitter<LeaderEvent>>,
    ) -> Self {
        Self {
            id: presence.id().clone(),
            presence,
            config,
            comparator,
            leader,
            events,
            last_notified: None,
            connected: true,
            warm: false,
            eval_at: None,
            notify_at: None,
        }
    }

    pub(super) async fn run(
        mut self,
        client_events: flume::Receiver<ClientEvent>,
        presence_events: flume::Receiver<PresenceEvent>,
        cancel: CancellationToken,
    ) {
        self.request_leader().await;
        self.schedule_eval();

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = client_events.recv_async() => match event {
                    Ok(ClientEvent::Lifecycle(lifecycle)) => self.on_lifecycle(lifecycle).await,
                    Ok(ClientEvent::Message(inbound)) => self.on_message(inbound).await,
                    Err(_) => break,
                },
                event = presence_events.recv_async() => match event {
                    Ok(event) => self.on_presence(&event).await,
                    Err(_) => break,
                },
                () = sleep_until(self.eval_at) => {
                    self.eval_at = None;
                    self.warm = true;
                    self.evaluate().await;
                }
                () = sleep_until(self.notify_at) => {
                    self.notify_at = None;
                    self.notify();
                }
            }
        }

        self.leader.send_replace(None);

        debug!("{} election loop stopped", self.id);
    }

    fn is_leader(&self) -> bool {
        self.leader.borrow().as_ref() == Some(&self.id)
    }

    async fn on_lifecycle(&mut self, lifecycle: Lifecycle) {
        match lifecycle {
            Lifecycle::Ready => {
                self.connected = true;
                self.request_leader().await;
                // Confirmation pass once presence had time to refill
                self.eval_at = Some(Instant::now() + self.config.warmup);
            }
            Lifecycle::Disconnect => {
                let was_leader = self.is_leader();
                self.connected = false;
                self.set_leader(None);
                self.notify_at = None;

                if was_leader {
                    info!("{} lost leadership on disconnect", self.id);
                    self.last_notified = Some(false);
                    self.tag_published_state(false);
                    self.events
                        .emit(&LeaderEvent::LeadershipStateChanged { is_leader: false });
                }
            }
            Lifecycle::Connect | Lifecycle::Reconnect => {}
        }
    }

    async fn on_message(&mut self, inbound: Inbound) {
        match inbound.message {
            WireMessage::LeaderRequested(_) => {
                if self.is_leader() {
                    self.announce().await;
                } else {
                    self.schedule_eval();
                }
            }
            WireMessage::LeaderAnnounced(_) => {
                if self.leader.borrow().as_ref() != Some(&inbound.src) {
                    info!("{} accepts {} as leader", self.id, inbound.src);
                }
                self.set_leader(Some(inbound.src));
                self.schedule_notify();
            }
            _ => {}
        }
    }

    async fn on_presence(&mut self, event: &PresenceEvent) {
        match event {
            PresenceEvent::Join(_) => {
                if self.is_leader() {
                    self.announce().await;
                } else {
                    self.schedule_eval();
                }
            }
            PresenceEvent::Leave(participant) => {
                if self.leader.borrow().as_ref() == Some(&participant.id) {
                    info!("{} lost leader {}", self.id, participant.id);
                    self.set_leader(None);
                    self.schedule_notify();
                }
                self.schedule_eval();
            }
            PresenceEvent::Change(_) => self.schedule_eval(),
            PresenceEvent::StateChange(_) => {}
        }
    }

    async fn request_leader(&self) {
        let state = self.presence.local_state();

        if let Err(e) = self
            .presence
            .client()
            .send(WireMessage::LeaderRequested(state))
            .await
        {
            debug!("{} failed to request leader: {}", self.id, e);
        }

        self.events.emit(&LeaderEvent::LeaderRequested);
    }

    async fn announce(&self) {
        let state = self.presence.local_state();

        if let Err(e) = self
            .presence
            .client()
            .send(WireMessage::LeaderAnnounced(state))
            .await
        {
            debug!("{} failed to announce leadership: {}", self.id, e);
        }
    }

    /// Re-arms the evaluation timer, debouncing bursts of triggers.
    fn schedule_eval(&mut self) {
        let delay = if self.warm {
            self.config.react_delay
        } else {
            self.config.warmup
        };
        self.eval_at = Some(Instant::now() + delay);
    }

    fn schedule_notify(&mut self) {
        self.notify_at = Some(Instant::now() + self.config.notify_debounce);
    }

    async fn evaluate(&mut self) {
        if !self.connected {
            trace!("{} skips evaluation while disconnected", self.id);
            return;
        }

        let mut candidates = self.presence.participants();

        if !self.config.allow_leader_demotion {
            let mut claimants = candidates
                .iter()
                .filter(|p| ElectionState::of(p).is_leader)
                .cloned()
                .collect::<Vec<_>>();

            // Only the best ranked claimant keeps re-announcing
            rank(&mut claimants, &self.comparator);

            if let Some(claimant) = claimants.first() {
                if claimant.id == self.id {
                    self.announce().await;
                } else if self.leader.borrow().is_none() {
                    debug!("{} adopts published leader {}", self.id, claimant.id);
                    self.set_leader(Some(claimant.id.clone()));
                    self.schedule_notify();
                }
                return;
            }
        }

        if candidates.is_empty() {
            if self.leader.borrow().is_some() {
                self.set_leader(None);
                self.schedule_notify();
            }
            return;
        }

        rank(&mut candidates, &self.comparator);

        trace!("{} evaluated {} candidates", self.id, candidates.len());

        if candidates[0].id == self.id {
            if !self.is_leader() {
                info!("{} claims leadership", self.id);
            }
            self.set_leader(Some(self.id.clone()));
            self.announce().await;
            self.schedule_notify();
        }
    }

    fn notify(&mut self) {
        let is_leader = self.is_leader();

        if self.last_notified == Some(is_leader) {
            return;
        }
        self.last_notified = Some(is_leader);

        info!("{} leadership changed: is_leader={}", self.id, is_leader);

        self.tag_published_state(is_leader);
        self.events
            .emit(&LeaderEvent::LeadershipStateChanged { is_leader });
    }

    fn tag_published_state(&self, is_leader: bool) {
        self.presence.update_local_state(|state| {
            let mut election = ElectionState::from_value(state);
            election.is_leader = is_leader;
            *state = election.to_value();
        });
    }

    fn set_leader(&self, leader: Option<ParticipantId>) {
        self.leader.send_replace(leader);
    }
}
