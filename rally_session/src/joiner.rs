// Joiner role: consume host state, send input, survive host loss.
//
// `JoinerSession` drives one joiner activation through the `JoinerPhase`
// machine (`state.rs`). Every phase change goes through `advance`, which
// applies the pure transition and then performs its side effects in one
// place: dropping the endpoint, arming or cancelling the retry timer, and
// raising status events.
//
// Join handshake: dial the room with the persistent id as connect metadata,
// send `requestStartGame` as the first payload once the channel opens (this
// is what commits admission on the host), then wait for `welcome`. The
// whole attempt is bounded by `join_timeout`.
//
// Loss handling:
// - `hostLeft` / `kicked` are announced departures. The session closes its
//   side right away and ends; it never retries.
// - A channel that closes or errors without notice schedules a rejoin with
//   exponential backoff. `Node` supplies a fresh endpoint (fresh transient
//   id) for every attempt through `begin_retry`.
//
// See also: `host.rs` for the other side of the handshake, `sync.rs` for
// `RemoteView` and `InputThrottle`.

use std::rc::Rc;
use std::time::Instant;

use log::{debug, info, warn};
use rally_protocol::{
    Codec, ConnectionId, Message, Payload, PersistentId, PlayerInput, RoomId, decode, encode,
};

use crate::config::SyncConfig;
use crate::error::SessionError;
use crate::event::SessionEvent;
use crate::reconnect::{Backoff, RetryTimer};
use crate::router::{JoinerRoute, joiner_route};
use crate::state::{EndReason, JoinerInput, JoinerPhase, JoinerStatus, transition};
use crate::sync::{InputThrottle, RemoteView};
use crate::transport::{ConnectMeta, Endpoint, TransportEvent};

pub struct JoinerSession<E: Endpoint> {
    endpoint: Option<E>,
    codec: Rc<dyn Codec>,
    config: SyncConfig,
    room: RoomId,
    host: ConnectionId,
    persistent_id: PersistentId,
    phase: JoinerPhase,
    backoff: Backoff,
    retry: RetryTimer,
    deadline: Option<Instant>,
    my_id: Option<ConnectionId>,
    view: RemoteView,
    throttle: InputThrottle,
    last_position: Option<([f32; 3], f32)>,
    events: Vec<SessionEvent>,
}

impl<E: Endpoint> JoinerSession<E> {
    /// Dial `room` on `endpoint` and start the initial join attempt.
    pub fn start(
        endpoint: E,
        room: RoomId,
        persistent_id: PersistentId,
        config: SyncConfig,
        codec: Rc<dyn Codec>,
        now: Instant,
    ) -> Result<Self, SessionError> {
        let mut session = Self {
            endpoint: None,
            codec,
            host: room.as_connection_id(),
            room,
            persistent_id,
            phase: JoinerPhase::Connecting { attempt: 0 },
            backoff: Backoff::new(&config.reconnect),
            retry: RetryTimer::default(),
            deadline: None,
            my_id: None,
            view: RemoteView::default(),
            throttle: InputThrottle::new(config.input_interval()),
            last_position: None,
            events: vec![SessionEvent::StatusChanged(JoinerStatus::Connecting)],
            config,
        };
        session
            .dial(endpoint, now)
            .map_err(|e| SessionError::JoinInit(e.to_string()))?;
        info!("joining room {}", session.room);
        Ok(session)
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room
    }

    pub fn phase(&self) -> &JoinerPhase {
        &self.phase
    }

    pub fn status(&self) -> JoinerStatus {
        self.phase.status()
    }

    /// Our connection id as the host knows it, once welcomed.
    pub fn my_id(&self) -> Option<&ConnectionId> {
        self.my_id.as_ref()
    }

    pub fn view(&self) -> &RemoteView {
        &self.view
    }

    pub fn is_finished(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Events from the current endpoint, if one is open.
    pub fn poll_endpoint(&mut self) -> Vec<TransportEvent> {
        self.endpoint
            .as_mut()
            .map(Endpoint::poll)
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Application input
    // -----------------------------------------------------------------------

    /// Queue local input. Only the latest is sent, at the uplink rate.
    pub fn send_input(&mut self, input: PlayerInput) {
        self.throttle.push(input);
    }

    /// Remember where the local player is, for position reconciliation on
    /// the next (re)admission.
    pub fn set_local_position(&mut self, position: [f32; 3], rotation: f32) {
        self.last_position = Some((position, rotation));
    }

    /// Report a skill use or a kill to the host.
    pub fn send_gameplay(&mut self, msg: Message) -> Result<(), SessionError> {
        if !self.phase.is_admitted() {
            return Err(SessionError::WrongRole("admitted joiner"));
        }
        self.send(&msg);
        Ok(())
    }

    /// The application came back from a pause. A pending rejoin runs on the
    /// next tick instead of waiting out its backoff (the position then goes
    /// out with the welcome). An admitted session re-sends its position so
    /// the host can re-seed.
    pub fn resume(&mut self, now: Instant) {
        match self.phase {
            JoinerPhase::Reconnecting { attempt } => {
                debug!("resumed; pulling retry {attempt} forward");
                self.retry.fire_now(attempt, now);
            }
            _ if self.phase.is_admitted() => {
                if let Some((position, rotation)) = self.last_position {
                    debug!("resumed in {}; re-sending position", self.room);
                    self.send(&Message::PlayerPosition { position, rotation });
                }
            }
            _ => {}
        }
    }

    /// Leave on purpose. Never triggers a retry.
    pub fn leave(&mut self, now: Instant) {
        self.advance(JoinerInput::LeaveRequested, now);
    }

    // -----------------------------------------------------------------------
    // Transport events
    // -----------------------------------------------------------------------

    pub fn handle_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::Opened { conn, .. } if conn == self.host => {
                debug!("channel to {} open; requesting admission", self.room);
                self.send(&Message::RequestStartGame);
            }
            TransportEvent::Data { conn, payload } if conn == self.host => {
                self.handle_data(&payload, now);
            }
            TransportEvent::Closed { conn } if conn == self.host => {
                self.channel_lost("connection closed".into(), now);
            }
            TransportEvent::Error { conn, reason }
                if conn.is_none() || conn.as_ref() == Some(&self.host) =>
            {
                warn!("channel to {} failed: {reason}", self.room);
                self.channel_lost(reason, now);
            }
            other => debug!("ignoring event for another connection: {other:?}"),
        }
    }

    fn handle_data(&mut self, payload: &Payload, now: Instant) {
        let msg = match decode(self.codec.as_ref(), payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("undecodable payload from host: {e}");
                self.events.push(SessionEvent::ProtocolError {
                    from: self.host.clone(),
                    reason: e.to_string(),
                });
                return;
            }
        };

        match (joiner_route(&msg), msg) {
            (
                JoinerRoute::Welcome,
                Message::Welcome {
                    your_id,
                    color,
                    colors,
                    players,
                    game_running,
                    ..
                },
            ) => {
                if !matches!(self.phase, JoinerPhase::Connecting { .. }) {
                    debug!("duplicate welcome ignored");
                    return;
                }
                self.deadline = None;
                self.view.apply_welcome(&colors, &players);
                self.my_id = Some(your_id.clone());
                self.events.push(SessionEvent::Welcomed { your_id, color });
                self.advance(JoinerInput::Welcomed { game_running }, now);
                if let Some((position, rotation)) = self.last_position {
                    self.send(&Message::PlayerPosition { position, rotation });
                }
            }
            (JoinerRoute::StartGame, _) => self.advance(JoinerInput::GameStarted, now),
            (JoinerRoute::Roster, Message::PlayerJoined { id, color }) => {
                self.view.apply_joined(&id, color.as_ref());
                if self.my_id.as_ref() != Some(&id) {
                    self.events.push(SessionEvent::PeerJoined { id });
                }
            }
            (JoinerRoute::Roster, Message::PlayerLeft { id }) => {
                self.view.apply_left(&id);
                self.events.push(SessionEvent::PeerLeft { id });
            }
            (JoinerRoute::Colors, Message::PlayerColors { colors }) => {
                self.view.apply_colors(&colors);
                self.events.push(SessionEvent::ColorsChanged);
            }
            (JoinerRoute::State, Message::GameState(state)) => {
                let full_sync = self.view.apply_state(&state);
                self.events.push(SessionEvent::StateUpdated { full_sync });
            }
            (JoinerRoute::State, Message::EnemiesRemoved { ids }) => {
                self.view.apply_removed(&ids);
                self.events.push(SessionEvent::StateUpdated { full_sync: false });
            }
            (JoinerRoute::Gameplay, message) => self.events.push(SessionEvent::Gameplay {
                from: self.host.clone(),
                message,
            }),
            (JoinerRoute::Invite, Message::InviteFromHost { room_id, from_name }) => {
                info!("host forwarded an invite to {room_id}");
                self.events.push(SessionEvent::InviteReceived { room_id, from_name });
            }
            (JoinerRoute::HostLeft, _) => self.depart(JoinerInput::HostLeftNotice, now),
            (JoinerRoute::Kicked, Message::Kicked { reason }) => {
                self.depart(JoinerInput::KickedNotice { reason }, now);
            }
            (JoinerRoute::AuthorityViolation, msg) => {
                let violation = SessionError::AuthorityViolation {
                    from: self.host.clone(),
                    tag: msg.tag(),
                };
                debug!("{violation}");
            }
            (route, msg) => debug!("{route:?}: dropping {}", msg.tag()),
        }
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// Enforce the join timeout and flush throttled input.
    pub fn tick(&mut self, now: Instant) {
        if let Some(deadline) = self.deadline {
            if now >= deadline && matches!(self.phase, JoinerPhase::Connecting { .. }) {
                warn!("no welcome from {} in time", self.room);
                self.attempt_failed(SessionError::JoinTimeout, now);
            }
        }
        if self.phase.is_admitted() {
            if let Some(input) = self.throttle.poll(now) {
                self.send(&Message::PlayerInput(input));
            }
        }
    }

    /// If a rejoin is due, return its attempt number. The caller opens a
    /// fresh endpoint and hands it to `begin_retry` (or reports
    /// `retry_open_failed`).
    pub fn take_due_retry(&mut self, now: Instant) -> Option<u32> {
        if !matches!(self.phase, JoinerPhase::Reconnecting { .. }) {
            return None;
        }
        self.retry.take_due(now)
    }

    pub fn begin_retry(&mut self, endpoint: E, now: Instant) {
        self.advance(JoinerInput::RetryStarted, now);
        info!("rejoining {} ({:?})", self.room, self.phase);
        if let Err(e) = self.dial(endpoint, now) {
            self.attempt_failed(SessionError::JoinFailed(e.to_string()), now);
        }
    }

    pub fn retry_open_failed(&mut self, error: SessionError, now: Instant) {
        self.advance(JoinerInput::RetryStarted, now);
        self.attempt_failed(error, now);
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn dial(&mut self, mut endpoint: E, now: Instant) -> Result<(), SessionError> {
        self.view.reset();
        self.my_id = None;
        endpoint.connect(
            &self.host,
            ConnectMeta {
                persistent_id: Some(self.persistent_id.clone()),
            },
        )?;
        self.endpoint = Some(endpoint);
        self.deadline = Some(now + self.config.join_timeout());
        Ok(())
    }

    fn depart(&mut self, notice: JoinerInput, now: Instant) {
        self.advance(notice, now);
        // Close our side instead of waiting for the host's close, which the
        // endpoint would no longer report once closed.
        self.advance(JoinerInput::ChannelLost, now);
    }

    fn channel_lost(&mut self, reason: String, now: Instant) {
        if matches!(self.phase, JoinerPhase::Connecting { .. }) {
            self.attempt_failed(SessionError::JoinFailed(reason), now);
        } else {
            self.advance(JoinerInput::ChannelLost, now);
        }
    }

    fn attempt_failed(&mut self, error: SessionError, now: Instant) {
        let reason = error.to_string();
        self.events.push(SessionEvent::JoinFailed(error));
        self.advance(JoinerInput::AttemptFailed { reason }, now);
    }

    fn advance(&mut self, input: JoinerInput, now: Instant) {
        let before = self.phase.clone();
        self.phase = transition(before.clone(), input, self.backoff.max_attempts);
        if self.phase == before {
            return;
        }

        match self.phase.clone() {
            JoinerPhase::Reconnecting { attempt } => {
                self.drop_endpoint();
                self.deadline = None;
                let delay = self.retry.arm(&self.backoff, attempt, now);
                info!("lost room {}; retry {attempt} in {delay:?}", self.room);
            }
            JoinerPhase::Departing(reason) => {
                info!("host ended our session: {reason:?}");
            }
            JoinerPhase::Ended(reason) => {
                self.drop_endpoint();
                self.deadline = None;
                self.retry.cancel();
                match reason {
                    EndReason::Failed(why) => warn!("giving up on {}: {why}", self.room),
                    other => info!("left room {}: {other:?}", self.room),
                }
            }
            _ => {}
        }

        let status = self.phase.status();
        if status != before.status() {
            self.events.push(SessionEvent::StatusChanged(status));
        }
        if self.phase == JoinerPhase::Playing && before != JoinerPhase::Playing {
            self.events.push(SessionEvent::GameStarted);
        }
    }

    fn drop_endpoint(&mut self) {
        if let Some(mut endpoint) = self.endpoint.take() {
            endpoint.close(&self.host);
            endpoint.shutdown();
        }
    }

    fn send(&mut self, msg: &Message) {
        let Some(endpoint) = self.endpoint.as_mut() else {
            debug!("no channel; {} not sent", msg.tag());
            return;
        };
        if let Err(e) = endpoint.send(&self.host, encode(self.codec.as_ref(), msg)) {
            warn!("send {} to host failed: {e}", msg.tag());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use rally_protocol::{ColorTag, FallbackCodec, GameState};

    use super::*;
    use crate::config::ReconnectConfig;
    use crate::transport::testing::{Recorded, RecordingEndpoint};

    const ROOM: &str = "room";

    fn config() -> SyncConfig {
        SyncConfig {
            join_timeout_ms: 1_000,
            reconnect: ReconnectConfig {
                initial_delay_ms: 100,
                max_delay_ms: 400,
                multiplier: 2.0,
                max_attempts: 2,
            },
            ..SyncConfig::default()
        }
    }

    fn start(now: Instant) -> (JoinerSession<RecordingEndpoint>, Rc<RefCell<Recorded>>) {
        let (endpoint, wire) = RecordingEndpoint::new("j-one");
        let session = JoinerSession::start(
            endpoint,
            RoomId::from(ROOM),
            PersistentId::from("me"),
            config(),
            Rc::new(FallbackCodec),
            now,
        )
        .unwrap();
        (session, wire)
    }

    fn from_host(msg: &Message) -> TransportEvent {
        TransportEvent::Data {
            conn: ConnectionId::from(ROOM),
            payload: encode(&FallbackCodec, msg),
        }
    }

    fn opened() -> TransportEvent {
        TransportEvent::Opened {
            conn: ConnectionId::from(ROOM),
            persistent_id: None,
        }
    }

    fn welcome(running: bool) -> Message {
        let mut colors = BTreeMap::new();
        colors.insert(ConnectionId::from(ROOM), ColorTag::from("#1"));
        colors.insert(ConnectionId::from("j-one"), ColorTag::from("#2"));
        Message::Welcome {
            your_id: ConnectionId::from("j-one"),
            room_id: RoomId::from(ROOM),
            color: ColorTag::from("#2"),
            colors,
            players: vec![ConnectionId::from(ROOM), ConnectionId::from("j-one")],
            game_running: running,
        }
    }

    fn closed() -> TransportEvent {
        TransportEvent::Closed {
            conn: ConnectionId::from(ROOM),
        }
    }

    #[test]
    fn handshake_dials_with_identity_and_requests_start() {
        let now = Instant::now();
        let (mut joiner, wire) = start(now);
        assert_eq!(
            wire.borrow().dialed,
            vec![(
                ConnectionId::from(ROOM),
                ConnectMeta {
                    persistent_id: Some(PersistentId::from("me"))
                }
            )]
        );

        joiner.handle_event(opened(), now);
        assert_eq!(wire.borrow().sent_to(ROOM), vec![Message::RequestStartGame]);

        joiner.set_local_position([1.0, 2.0, 3.0], 0.5);
        joiner.handle_event(from_host(&welcome(false)), now);
        assert_eq!(joiner.status(), JoinerStatus::ConnectedWaiting);
        assert_eq!(joiner.view().colors().len(), 2);
        assert_eq!(
            wire.borrow().sent_to(ROOM).last(),
            Some(&Message::PlayerPosition {
                position: [1.0, 2.0, 3.0],
                rotation: 0.5
            })
        );

        joiner.handle_event(from_host(&Message::StartGame), now);
        joiner.handle_event(from_host(&Message::StartGame), now);
        let started = joiner
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::GameStarted))
            .count();
        assert_eq!(started, 1);
        assert_eq!(joiner.status(), JoinerStatus::InGame);
    }

    #[test]
    fn resume_while_admitted_resends_position() {
        let now = Instant::now();
        let (mut joiner, wire) = start(now);
        joiner.handle_event(opened(), now);
        joiner.handle_event(from_host(&welcome(true)), now);
        joiner.set_local_position([4.0, 0.0, 2.0], 1.5);
        wire.borrow_mut().clear_sent();

        joiner.resume(now + Duration::from_secs(30));
        assert_eq!(
            wire.borrow().sent_to(ROOM),
            vec![Message::PlayerPosition {
                position: [4.0, 0.0, 2.0],
                rotation: 1.5
            }]
        );
        assert_eq!(joiner.status(), JoinerStatus::InGame);
    }

    #[test]
    fn host_left_is_terminal() {
        let now = Instant::now();
        let (mut joiner, wire) = start(now);
        joiner.handle_event(opened(), now);
        joiner.handle_event(from_host(&welcome(true)), now);
        joiner.handle_event(from_host(&Message::HostLeft), now);
        joiner.handle_event(closed(), now);

        assert_eq!(joiner.status(), JoinerStatus::HostLeft);
        assert!(joiner.is_finished());
        assert!(wire.borrow().shut_down);
        assert_eq!(joiner.take_due_retry(now + Duration::from_secs(60)), None);
    }

    #[test]
    fn kicked_is_terminal_with_reason() {
        let now = Instant::now();
        let (mut joiner, _wire) = start(now);
        joiner.handle_event(opened(), now);
        joiner.handle_event(from_host(&welcome(false)), now);
        joiner.handle_event(
            from_host(&Message::Kicked {
                reason: Some("full".into()),
            }),
            now,
        );
        assert_eq!(
            joiner.status(),
            JoinerStatus::Kicked {
                reason: Some("full".into())
            }
        );
        assert!(joiner.is_finished());
    }

    #[test]
    fn unannounced_loss_retries_with_backoff_from_a_fresh_endpoint() {
        let now = Instant::now();
        let (mut joiner, _wire) = start(now);
        joiner.handle_event(opened(), now);
        joiner.handle_event(from_host(&welcome(true)), now);
        joiner.handle_event(closed(), now);

        assert_eq!(joiner.status(), JoinerStatus::Reconnecting { attempt: 1 });
        assert_eq!(joiner.take_due_retry(now + Duration::from_millis(50)), None);
        assert_eq!(joiner.take_due_retry(now + Duration::from_millis(100)), Some(1));

        let (fresh, fresh_wire) = RecordingEndpoint::new("j-two");
        let later = now + Duration::from_millis(100);
        joiner.begin_retry(fresh, later);
        assert_eq!(fresh_wire.borrow().dialed.len(), 1);

        joiner.handle_event(opened(), later);
        joiner.handle_event(from_host(&welcome(true)), later);
        assert_eq!(joiner.status(), JoinerStatus::InGame);
    }

    #[test]
    fn retries_give_up_after_max_attempts() {
        let mut now = Instant::now();
        let (mut joiner, _wire) = start(now);
        joiner.handle_event(opened(), now);
        joiner.handle_event(from_host(&welcome(false)), now);
        joiner.handle_event(closed(), now);

        for _ in 0..2 {
            now += Duration::from_secs(1);
            assert!(joiner.take_due_retry(now).is_some());
            joiner.retry_open_failed(SessionError::JoinFailed("unreachable".into()), now);
        }
        assert!(joiner.is_finished());
        assert!(matches!(joiner.status(), JoinerStatus::Failed(_)));
    }

    #[test]
    fn initial_join_times_out() {
        let now = Instant::now();
        let (mut joiner, _wire) = start(now);
        joiner.handle_event(opened(), now);
        joiner.tick(now + Duration::from_millis(999));
        assert_eq!(joiner.status(), JoinerStatus::Connecting);

        joiner.tick(now + Duration::from_millis(1_000));
        assert!(joiner.is_finished());
        assert!(
            joiner
                .drain_events()
                .iter()
                .any(|e| matches!(e, SessionEvent::JoinFailed(SessionError::JoinTimeout)))
        );
    }

    #[test]
    fn input_is_throttled_and_only_sent_when_admitted() {
        let now = Instant::now();
        let (mut joiner, wire) = start(now);
        joiner.send_input(PlayerInput::default());
        joiner.tick(now);
        assert!(wire.borrow().sent.is_empty());

        joiner.handle_event(opened(), now);
        joiner.handle_event(from_host(&welcome(true)), now);
        wire.borrow_mut().clear_sent();
        joiner.tick(now);
        joiner.send_input(PlayerInput::default());
        joiner.tick(now + Duration::from_millis(5));

        let inputs: Vec<Message> = wire.borrow().sent_to(ROOM);
        assert_eq!(inputs.len(), 1);
        assert!(matches!(inputs[0], Message::PlayerInput(_)));
    }

    #[test]
    fn snapshots_and_uplink_tags_from_host() {
        let now = Instant::now();
        let (mut joiner, _wire) = start(now);
        joiner.handle_event(opened(), now);
        joiner.handle_event(from_host(&welcome(true)), now);
        joiner.drain_events();

        joiner.handle_event(
            from_host(&Message::GameState(GameState {
                full_sync: true,
                ..GameState::default()
            })),
            now,
        );
        joiner.handle_event(
            from_host(&Message::PlayerInput(PlayerInput::default())),
            now,
        );
        assert!(matches!(
            joiner.drain_events().as_slice(),
            [SessionEvent::StateUpdated { full_sync: true }]
        ));
    }

    #[test]
    fn resume_pulls_a_pending_retry_forward() {
        let now = Instant::now();
        let (mut joiner, _wire) = start(now);
        joiner.handle_event(opened(), now);
        joiner.handle_event(from_host(&welcome(true)), now);
        joiner.handle_event(closed(), now);
        assert_eq!(joiner.take_due_retry(now), None);

        joiner.resume(now);
        assert_eq!(joiner.take_due_retry(now), Some(1));
    }
}
