use std::sync::Arc;

use beacon_realtime::{
    ClientEvent, EventEmitter, Inbound, Lifecycle, ParticipantId, RealtimeClient, WireMessage,
};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::{Participant, Participants, PresenceEvent};
use crate::config::PresenceConfig;
use crate::timer::sleep_until;

pub(super) struct Worker {
    client: RealtimeClient,
    config: PresenceConfig,
    participants: Participants,
    snapshot: Arc<watch::Sender<Participants>>,
    events: Arc<EventEmitter<PresenceEvent>>,
    next_heartbeat: Option<Instant>,
}

impl Worker {
    pub(super) fn new(
        client: RealtimeClient,
        config: PresenceConfig,
        snapshot: Arc<watch::Sender<Participants>>,
        events: Arc<EventEmitter<PresenceEvent>>,
    ) -> Self {
        Self {
            client,
            config,
            participants: Participants::new(),
            snapshot,
            events,
            next_heartbeat: None,
        }
    }

    pub(super) async fn run(
        mut self,
        client_events: flume::Receiver<ClientEvent>,
        mut local_state: watch::Receiver<Value>,
        cancel: CancellationToken,
    ) {
        let mut housekeeping = tokio::time::interval(self.config.housekeeping_interval);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = client_events.recv_async() => match event {
                    Ok(ClientEvent::Lifecycle(lifecycle)) => {
                        self.on_lifecycle(lifecycle, &local_state).await;
                    }
                    Ok(ClientEvent::Message(inbound)) => self.on_message(inbound, &local_state).await,
                    Err(_) => break,
                },
                changed = local_state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.heartbeat(&local_state).await;
                }
                () = sleep_until(self.next_heartbeat) => self.heartbeat(&local_state).await,
                _ = housekeeping.tick() => self.evict_silent(),
            }
        }

        debug!("{} presence loop stopped", self.client.id());
    }

    async fn on_lifecycle(&mut self, lifecycle: Lifecycle, local_state: &watch::Receiver<Value>) {
        match lifecycle {
            Lifecycle::Ready => {
                let state = local_state.borrow().clone();
                if let Err(e) = self.client.send(WireMessage::PresenceJoin(state)).await {
                    debug!("{} failed to send join: {}", self.client.id(), e);
                }
                self.heartbeat(local_state).await;
            }
            // Peers keep their entries until they time out
            Lifecycle::Disconnect => self.next_heartbeat = None,
            Lifecycle::Connect | Lifecycle::Reconnect => {}
        }
    }

    async fn on_message(&mut self, inbound: Inbound, local_state: &watch::Receiver<Value>) {
        match inbound.message {
            WireMessage::PresenceJoin(state) | WireMessage::PresenceHeartbeat(state) => {
                let welcome = self.upsert(inbound.src, state);
                if welcome {
                    self.heartbeat(local_state).await;
                }
            }
            WireMessage::PresenceLeave(_) => {
                if let Some(participant) = self.participants.remove(&inbound.src) {
                    info!("{} saw {} leave", self.client.id(), participant.id);
                    self.publish();
                    self.events.emit(&PresenceEvent::Leave(participant));
                    self.emit_change();
                }
            }
            _ => {}
        }
    }

    /// Records a sighting. Returns whether a newcomer should be welcomed.
    fn upsert(&mut self, id: ParticipantId, state: Value) -> bool {
        let now = Instant::now();

        if let Some(participant) = self.participants.get_mut(&id) {
            participant.last_seen = now;

            if participant.state == state {
                self.publish();
                return false;
            }

            participant.state = state;
            let participant = participant.clone();
            trace!("{} saw {} change state", self.client.id(), id);
            self.publish();
            self.events.emit(&PresenceEvent::StateChange(participant));
            self.emit_change();
            return false;
        }

        let participant = Participant {
            id: id.clone(),
            state,
            last_seen: now,
        };
        self.participants.insert(id.clone(), participant.clone());
        info!("{} saw {} join", self.client.id(), id);
        self.publish();
        self.events.emit(&PresenceEvent::Join(participant));
        self.emit_change();

        id != *self.client.id()
    }

    fn evict_silent(&mut self) {
        let timeout = self.config.participant_timeout();
        let now = Instant::now();

        let silent = self
            .participants
            .values()
            .filter(|p| now.duration_since(p.last_seen) > timeout)
            .map(|p| p.id.clone())
            .collect::<Vec<_>>();

        for id in silent {
            if let Some(participant) = self.participants.remove(&id) {
                info!("{} evicted silent participant {}", self.client.id(), id);
                self.publish();
                self.events.emit(&PresenceEvent::Leave(participant));
                self.emit_change();
            }
        }
    }

    async fn heartbeat(&mut self, local_state: &watch::Receiver<Value>) {
        let state = local_state.borrow().clone();

        if let Err(e) = self.client.send(WireMessage::PresenceHeartbeat(state)).await {
            debug!("{} failed to send heartbeat: {}", self.client.id(), e);
        }

        self.next_heartbeat = Some(Instant::now() + self.config.heartbeat_interval);
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.participants.clone());
    }

    fn emit_change(&self) {
        let participants = self.participants.values().cloned().collect();
        self.events.emit(&PresenceEvent::Change(participants));
    }
}
