// Host role: the authoritative side of a room.
//
// `HostSession` owns one hosting activation: the endpoint bound to the room
// id, the session directory, the sync engine, and the per-connection
// handshake state. `Node` creates a fresh one on every `become_host` and
// drops it on teardown, so nothing survives from one activation to the next
// except what the joiner store persisted.
//
// Connection lifecycle on the host:
//
//   Opened ──> Probing ──first payload──┬─ statusRequest ─> status, close
//                                       ├─ inviteRequest ─> forward/notify, close
//                                       └─ anything else ─> admit ─> Joined
//   Joined ──Closed/Error/kick──> released (playerLeft to the others)
//
// Admission sends, in order: `welcome` to the new joiner, `playerJoined` to
// everyone else, `playerColors` and `partyBonusUpdate` to everyone. A
// superseded connection is closed first and announced with `playerLeft`, so
// third peers always see leave-then-join for a rejoining device.
//
// Broadcasts encode once and hand the same `Payload` to every peer. Send
// failures on one connection are logged and otherwise ignored: the
// transport reports the broken channel as `Closed`, and teardown happens
// there.
//
// See also: `router.rs` (classification), `directory.rs` (slots and
// colors), `sync.rs` (snapshots).

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::time::Instant;

use log::{debug, info, warn};
use rally_protocol::{
    Codec, ColorTag, ConnectionId, EntityId, EntityState, HostStatus, Message, Payload,
    PersistentId, PlayerInput, RoomId, decode, encode,
};

use crate::config::SyncConfig;
use crate::directory::SessionDirectory;
use crate::error::SessionError;
use crate::event::SessionEvent;
use crate::router::{FirstContact, HostRoute, LinkState, host_route, peek};
use crate::store::JoinerStore;
use crate::sync::{SyncEngine, party_multiplier};
use crate::transport::{Endpoint, TransportEvent};

pub struct HostSession<E: Endpoint> {
    endpoint: E,
    codec: Rc<dyn Codec>,
    config: SyncConfig,
    room: RoomId,
    directory: SessionDirectory,
    sync: SyncEngine,
    links: BTreeMap<ConnectionId, LinkState>,
    /// When each joined connection last sent anything.
    last_heard: HashMap<ConnectionId, Instant>,
    game_running: bool,
    next_broadcast: Instant,
    events: Vec<SessionEvent>,
}

impl<E: Endpoint> HostSession<E> {
    pub fn new(
        endpoint: E,
        config: SyncConfig,
        codec: Rc<dyn Codec>,
        joiner_store: Box<dyn JoinerStore>,
        now: Instant,
    ) -> Self {
        let host_id = endpoint.local_id().clone();
        let room = RoomId(host_id.0.clone());
        let palette = config.palette.iter().map(|c| ColorTag(c.clone())).collect();
        let directory = SessionDirectory::new(room.clone(), host_id.clone(), palette, joiner_store);
        let mut sync = SyncEngine::new(&config);
        sync.add_player(&host_id, directory.host_color());
        info!("hosting room {room}");
        Self {
            endpoint,
            codec,
            next_broadcast: now + config.tick_interval(),
            config,
            room,
            directory,
            sync,
            links: BTreeMap::new(),
            last_heard: HashMap::new(),
            game_running: false,
            events: Vec::new(),
        }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room
    }

    pub fn host_id(&self) -> &ConnectionId {
        self.directory.host_id()
    }

    pub fn game_running(&self) -> bool {
        self.game_running
    }

    pub fn status(&self) -> HostStatus {
        if self.game_running {
            HostStatus::Ingame
        } else {
            HostStatus::Hosting
        }
    }

    pub fn directory(&self) -> &SessionDirectory {
        &self.directory
    }

    pub fn sync(&self) -> &SyncEngine {
        &self.sync
    }

    /// Direct access for the host's simulation (moving entities, players).
    pub fn sync_mut(&mut self) -> &mut SyncEngine {
        &mut self.sync
    }

    pub fn endpoint(&self) -> &E {
        &self.endpoint
    }

    pub fn endpoint_mut(&mut self) -> &mut E {
        &mut self.endpoint
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    // -----------------------------------------------------------------------
    // Transport events
    // -----------------------------------------------------------------------

    pub fn handle_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::Opened {
                conn,
                persistent_id,
            } => {
                debug!("{conn} opened (persistent id {persistent_id:?})");
                self.links.insert(conn, LinkState::Probing { persistent_id });
            }
            TransportEvent::Data { conn, payload } => self.handle_data(conn, &payload, now),
            TransportEvent::Closed { conn } => self.drop_connection(&conn, "closed"),
            TransportEvent::Error {
                conn: Some(conn),
                reason,
            } => {
                warn!("connection {conn} failed: {reason}");
                self.endpoint.close(&conn);
                self.drop_connection(&conn, "errored");
            }
            TransportEvent::Error { conn: None, reason } => {
                warn!("endpoint {} error: {reason}", self.room);
            }
        }
    }

    fn handle_data(&mut self, conn: ConnectionId, payload: &Payload, now: Instant) {
        let msg = match decode(self.codec.as_ref(), payload) {
            Ok(msg) => msg,
            Err(e) => {
                self.protocol_error(&conn, e.to_string());
                return;
            }
        };
        match self.links.get(&conn).cloned() {
            None => debug!("dropping {} from unknown connection {conn}", msg.tag()),
            Some(LinkState::Joined) => {
                self.note_activity(&conn, now);
                self.dispatch(&conn, msg);
            }
            Some(LinkState::Probing { persistent_id }) => match peek(msg) {
                FirstContact::StatusProbe => self.answer_status(&conn),
                FirstContact::InviteProbe {
                    room_id,
                    from_name,
                    target,
                } => self.handle_invite(&conn, room_id, from_name, target),
                FirstContact::Join(first) => {
                    self.admit(&conn, persistent_id);
                    self.last_heard.insert(conn.clone(), now);
                    self.dispatch(&conn, first);
                }
            },
        }
    }

    // -----------------------------------------------------------------------
    // Probes
    // -----------------------------------------------------------------------

    fn answer_status(&mut self, conn: &ConnectionId) {
        let state = self.status();
        self.send_to(conn, &Message::Status { state });
        self.endpoint.close(conn);
        self.links.remove(conn);
        debug!("answered status probe from {conn}: {state:?}");
        self.events.push(SessionEvent::StatusProbed {
            from: conn.clone(),
            state,
        });
    }

    fn handle_invite(
        &mut self,
        conn: &ConnectionId,
        room_id: RoomId,
        from_name: Option<String>,
        target: Option<PersistentId>,
    ) {
        self.endpoint.close(conn);
        self.links.remove(conn);
        let recipient = target
            .as_ref()
            .and_then(|t| self.directory.lookup_by_persistent(t))
            .cloned();
        match recipient {
            Some(joiner) => {
                info!("forwarding invite to {room_id} to joiner {joiner}");
                self.send_to(&joiner, &Message::InviteFromHost { room_id, from_name });
            }
            None => {
                info!("received invite to {room_id}");
                self.events.push(SessionEvent::InviteReceived { room_id, from_name });
            }
        }
    }

    // -----------------------------------------------------------------------
    // Admission and release
    // -----------------------------------------------------------------------

    fn admit(&mut self, conn: &ConnectionId, persistent_id: Option<PersistentId>) {
        let admission = self.directory.admit(conn, persistent_id.as_ref());
        self.links.insert(conn.clone(), LinkState::Joined);

        if let Some(old) = &admission.superseded {
            let old_id = &old.connection_id;
            // Closing first guarantees the old channel's own close event
            // never reaches us and cannot release the new slot.
            self.endpoint.close(old_id);
            self.links.remove(old_id);
            self.last_heard.remove(old_id);
            self.sync.remove_player(old_id);
            debug!("{}", SessionError::SessionSuperseded(old_id.clone()));
            self.broadcast_except(conn, &Message::PlayerLeft { id: old_id.clone() });
        }

        self.sync.add_player(conn, &admission.color);
        let welcome = Message::Welcome {
            your_id: conn.clone(),
            room_id: self.room.clone(),
            color: admission.color.clone(),
            colors: self.directory.colors(),
            players: self.directory.participants(),
            game_running: self.game_running,
        };
        self.send_to(conn, &welcome);
        self.broadcast_except(
            conn,
            &Message::PlayerJoined {
                id: conn.clone(),
                color: Some(admission.color.clone()),
            },
        );
        self.broadcast(&Message::PlayerColors {
            colors: self.directory.colors(),
        });
        self.broadcast_party_bonus();

        self.events.push(match admission.superseded {
            Some(old) => SessionEvent::JoinerReconnected {
                old: old.connection_id,
                new: conn.clone(),
                color: admission.color,
            },
            None => SessionEvent::JoinerJoined {
                id: conn.clone(),
                persistent_id,
                color: admission.color,
            },
        });
    }

    /// Tear down one connection's state. Unknown or already-released
    /// connections are a no-op, so a kick followed by the transport's own
    /// close reports the departure once.
    fn drop_connection(&mut self, conn: &ConnectionId, why: &str) {
        match self.links.remove(conn) {
            None => debug!("{conn} {why}, already released"),
            Some(LinkState::Probing { .. }) => debug!("probe {conn} {why}"),
            Some(LinkState::Joined) => self.release(conn),
        }
    }

    fn release(&mut self, conn: &ConnectionId) {
        self.last_heard.remove(conn);
        if self.directory.release(conn).is_none() {
            return;
        }
        self.sync.remove_player(conn);
        self.broadcast(&Message::PlayerLeft { id: conn.clone() });
        self.broadcast_party_bonus();
        self.events.push(SessionEvent::JoinerLeft { id: conn.clone() });
    }

    /// A joiner heard from after `resume_gap` of silence is back from a
    /// pause; its next `playerPosition` may re-seed the simulation.
    fn note_activity(&mut self, conn: &ConnectionId, now: Instant) {
        let gap = self.config.resume_gap();
        if let Some(last) = self.last_heard.insert(conn.clone(), now) {
            let silence = now.saturating_duration_since(last);
            if silence >= gap {
                debug!("{conn} back after {silence:?}; position may be re-seeded");
                self.sync.reopen_position(conn);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Post-admission dispatch
    // -----------------------------------------------------------------------

    fn dispatch(&mut self, from: &ConnectionId, msg: Message) {
        match (host_route(&msg), msg) {
            (HostRoute::Input, Message::PlayerInput(input)) => {
                if !self.sync.apply_input(from, input) {
                    debug!("stale input from {from} dropped");
                }
            }
            (HostRoute::Position, Message::PlayerPosition { position, rotation }) => {
                match self.sync.seed_position(from, position, rotation) {
                    Ok(true) => debug!("seeded {from} at {position:?}"),
                    Ok(false) => debug!("duplicate position sync from {from} ignored"),
                    Err(e) => self.protocol_error(from, e.to_string()),
                }
            }
            (HostRoute::SkillCast, Message::SkillCast(mut cast)) => {
                cast.caster = Some(from.clone());
                cast.position = None;
                cast.rotation = None;
                let msg = Message::SkillCast(cast);
                self.broadcast_except(from, &msg);
                self.events.push(SessionEvent::Gameplay {
                    from: from.clone(),
                    message: msg,
                });
            }
            (HostRoute::Damage, msg) => {
                self.broadcast_except(from, &msg);
                self.events.push(SessionEvent::Gameplay {
                    from: from.clone(),
                    message: msg,
                });
            }
            (HostRoute::EnemyKilled, Message::EnemyKilled { enemy_id, killer }) => {
                self.kill_enemy(&enemy_id, Some(killer.unwrap_or_else(|| from.clone())));
            }
            (HostRoute::StartRequest, _) => {
                if self.game_running {
                    self.send_to(from, &Message::StartGame);
                } else {
                    debug!("{from} asked to start; waiting for the host");
                }
            }
            (HostRoute::ProbeOutOfPhase, msg) => {
                debug!("{} from admitted {from} ignored", msg.tag());
            }
            (HostRoute::AuthorityViolation, msg) => {
                let violation = SessionError::AuthorityViolation {
                    from: from.clone(),
                    tag: msg.tag(),
                };
                debug!("{violation}");
            }
            (route, msg) => debug!("{route:?} does not match {}", msg.tag()),
        }
    }

    // -----------------------------------------------------------------------
    // Host operations
    // -----------------------------------------------------------------------

    /// Start the match. Idempotent.
    pub fn start_game(&mut self) {
        if self.game_running {
            return;
        }
        self.game_running = true;
        info!("match started in room {}", self.room);
        self.broadcast(&Message::StartGame);
    }

    /// Remove a joiner on purpose. Returns false if it was not admitted.
    pub fn kick(&mut self, conn: &ConnectionId, reason: Option<String>) -> bool {
        if self.links.get(conn) != Some(&LinkState::Joined) {
            return false;
        }
        info!("kicking {conn} ({})", reason.as_deref().unwrap_or("no reason"));
        self.send_to(conn, &Message::Kicked { reason });
        self.endpoint.close(conn);
        self.drop_connection(conn, "kicked");
        true
    }

    /// Announce departure to everyone and close the endpoint.
    pub fn shutdown(&mut self) {
        info!("closing room {}", self.room);
        self.broadcast(&Message::HostLeft);
        let conns: Vec<ConnectionId> = self.links.keys().cloned().collect();
        for conn in conns {
            self.endpoint.close(&conn);
        }
        self.links.clear();
        self.endpoint.shutdown();
    }

    /// Update the host's own player from the local simulation.
    pub fn set_local_player(&mut self, position: [f32; 3], rotation: f32, animation: &str) {
        let host_id = self.directory.host_id().clone();
        if let Some(player) = self.sync.player_mut(&host_id) {
            player.position = position;
            player.rotation = rotation;
            player.animation = animation.to_owned();
        }
    }

    pub fn upsert_entity(&mut self, id: EntityId, state: EntityState) {
        self.sync.upsert_entity(id, state);
    }

    /// Remove an entity without a reward (despawn). Reported in the next
    /// snapshot's removed ids.
    pub fn remove_entity(&mut self, id: &EntityId) -> bool {
        self.sync.remove_entity(id).is_some()
    }

    /// Authoritatively kill an enemy and share its experience. Duplicate
    /// reports for an already removed entity do nothing.
    pub fn kill_enemy(&mut self, enemy_id: &EntityId, killer: Option<ConnectionId>) -> bool {
        let Some(state) = self.sync.remove_entity(enemy_id) else {
            debug!("kill of {enemy_id} ignored: already removed");
            return false;
        };
        self.broadcast(&Message::EnemiesRemoved {
            ids: vec![enemy_id.clone()],
        });
        let party_size = self.directory.participants().len();
        let multiplier = party_multiplier(party_size, self.config.party_bonus_per_member);
        let experience = (state.experience as f32 * multiplier).round() as u32;
        if experience > 0 {
            self.broadcast(&Message::ShareExperience {
                amount: experience,
                source: Some(enemy_id.clone()),
            });
        }
        self.events.push(SessionEvent::EnemyKilled {
            enemy_id: enemy_id.clone(),
            killer,
            experience,
        });
        true
    }

    pub fn latest_input(&self, conn: &ConnectionId) -> Option<&PlayerInput> {
        self.sync.latest_input(conn)
    }

    /// Admitted joiners, in stable order.
    pub fn joiners(&self) -> Vec<ConnectionId> {
        self.directory.joiner_ids()
    }

    // -----------------------------------------------------------------------
    // Timer
    // -----------------------------------------------------------------------

    /// Broadcast a snapshot if the tick is due. Only a running match is
    /// synchronized. Returns whether a snapshot went out.
    pub fn tick(&mut self, now: Instant) -> bool {
        if now < self.next_broadcast {
            return false;
        }
        let interval = self.config.tick_interval();
        self.next_broadcast += interval;
        if self.next_broadcast <= now {
            // Fell behind (long stall); do not burst to catch up.
            self.next_broadcast = now + interval;
        }
        if !self.game_running {
            return false;
        }
        let snapshot = self.sync.build_snapshot();
        self.broadcast(&Message::GameState(snapshot));
        true
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    fn send_to(&mut self, conn: &ConnectionId, msg: &Message) {
        let payload = encode(self.codec.as_ref(), msg);
        if let Err(e) = self.endpoint.send(conn, payload) {
            warn!("send {} to {conn} failed: {e}", msg.tag());
        }
    }

    fn broadcast(&mut self, msg: &Message) {
        self.broadcast_filtered(msg, None);
    }

    fn broadcast_except(&mut self, skip: &ConnectionId, msg: &Message) {
        self.broadcast_filtered(msg, Some(skip));
    }

    fn broadcast_filtered(&mut self, msg: &Message, skip: Option<&ConnectionId>) {
        let targets: Vec<ConnectionId> = self
            .links
            .iter()
            .filter(|(id, state)| **state == LinkState::Joined && Some(*id) != skip)
            .map(|(id, _)| id.clone())
            .collect();
        if targets.is_empty() {
            return;
        }
        let payload = encode(self.codec.as_ref(), msg);
        for conn in targets {
            if let Err(e) = self.endpoint.send(&conn, payload.clone()) {
                warn!("broadcast {} to {conn} failed: {e}", msg.tag());
            }
        }
    }

    fn broadcast_party_bonus(&mut self) {
        let party_size = self.directory.participants().len();
        self.broadcast(&Message::PartyBonusUpdate {
            party_size: party_size as u32,
            multiplier: party_multiplier(party_size, self.config.party_bonus_per_member),
        });
    }

    fn protocol_error(&mut self, from: &ConnectionId, reason: String) {
        warn!("protocol error from {from}: {reason}");
        self.events.push(SessionEvent::ProtocolError {
            from: from.clone(),
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::time::Duration;

    use rally_protocol::{FallbackCodec, SkillCast};

    use super::*;
    use crate::store::MemoryJoinerStore;
    use crate::transport::testing::{Recorded, RecordingEndpoint};

    struct Harness {
        host: HostSession<RecordingEndpoint>,
        wire: Rc<RefCell<Recorded>>,
        start: Instant,
    }

    fn harness() -> Harness {
        let (endpoint, wire) = RecordingEndpoint::new("room");
        let start = Instant::now();
        let host = HostSession::new(
            endpoint,
            SyncConfig::default(),
            Rc::new(FallbackCodec),
            Box::new(MemoryJoinerStore::default()),
            start,
        );
        Harness { host, wire, start }
    }

    fn conn(s: &str) -> ConnectionId {
        ConnectionId::from(s)
    }

    fn data(from: &str, msg: &Message) -> TransportEvent {
        TransportEvent::Data {
            conn: conn(from),
            payload: encode(&FallbackCodec, msg),
        }
    }

    impl Harness {
        fn open(&mut self, id: &str, persistent: Option<&str>) {
            let opened = TransportEvent::Opened {
                conn: conn(id),
                persistent_id: persistent.map(PersistentId::from),
            };
            self.host.handle_event(opened, self.start);
        }

        fn join(&mut self, id: &str, persistent: &str) {
            self.open(id, Some(persistent));
            self.host.handle_event(data(id, &Message::RequestStartGame), self.start);
        }

        fn sent_to(&self, id: &str) -> Vec<Message> {
            self.wire.borrow().sent_to(id)
        }

        fn tags_to(&self, id: &str) -> Vec<&'static str> {
            self.sent_to(id).iter().map(Message::tag).collect()
        }
    }

    #[test]
    fn join_sends_welcome_then_roster_updates() {
        let mut h = harness();
        h.join("a", "pa");

        let to_a = h.sent_to("a");
        let Message::Welcome {
            your_id,
            room_id,
            players,
            game_running,
            ..
        } = &to_a[0]
        else {
            panic!("expected welcome first, got {:?}", to_a[0]);
        };
        assert_eq!(your_id, &conn("a"));
        assert_eq!(room_id, &RoomId::from("room"));
        assert_eq!(players, &vec![conn("room"), conn("a")]);
        assert!(!game_running);
        assert_eq!(
            h.tags_to("a"),
            vec!["welcome", "playerColors", "partyBonusUpdate"]
        );

        h.join("b", "pb");
        assert_eq!(
            &h.tags_to("a")[3..],
            &["playerJoined", "playerColors", "partyBonusUpdate"]
        );
        assert!(matches!(
            h.host.drain_events().as_slice(),
            [
                SessionEvent::JoinerJoined { .. },
                SessionEvent::JoinerJoined { .. }
            ]
        ));
    }

    #[test]
    fn position_reseed_needs_a_pause() {
        let mut h = harness();
        h.join("a", "pa");
        let at = |x: f32| {
            data(
                "a",
                &Message::PlayerPosition {
                    position: [x, 0.0, 0.0],
                    rotation: 0.0,
                },
            )
        };
        let x = |h: &Harness| h.host.sync().player(&conn("a")).unwrap().position[0];

        h.host.handle_event(at(1.0), h.start);
        assert_eq!(x(&h), 1.0);
        // Still chatty: a second report is ignored.
        let soon = h.start + Duration::from_millis(100);
        h.host.handle_event(at(2.0), soon);
        assert_eq!(x(&h), 1.0);

        // Silent for longer than the resume gap: one more seed is allowed.
        let later = soon + SyncConfig::default().resume_gap();
        h.host.handle_event(at(3.0), later);
        assert_eq!(x(&h), 3.0);
        h.host.handle_event(at(4.0), later);
        assert_eq!(x(&h), 3.0);
    }

    #[test]
    fn status_probe_answers_and_never_admits() {
        let mut h = harness();
        h.host.start_game();
        h.open("probe", None);
        h.host.handle_event(data("probe", &Message::StatusRequest), h.start);

        assert_eq!(
            h.sent_to("probe"),
            vec![Message::Status {
                state: HostStatus::Ingame
            }]
        );
        assert_eq!(h.wire.borrow().closed, vec![conn("probe")]);
        assert_eq!(h.host.directory().joiner_count(), 0);
    }

    #[test]
    fn invite_probe_is_forwarded_to_a_joined_target() {
        let mut h = harness();
        h.join("a", "pa");
        h.open("inviter", None);
        let event = data(
            "inviter",
            &Message::InviteRequest {
                room_id: RoomId::from("other-room"),
                from_name: Some("kim".into()),
                target: Some(PersistentId::from("pa")),
            },
        );
        h.host.handle_event(event, h.start);
        assert_eq!(
            h.sent_to("a").last(),
            Some(&Message::InviteFromHost {
                room_id: RoomId::from("other-room"),
                from_name: Some("kim".into()),
            })
        );
        assert_eq!(h.host.directory().joiner_count(), 1);
    }

    #[test]
    fn untargeted_invite_is_raised_locally() {
        let mut h = harness();
        h.open("inviter", None);
        let event = data(
            "inviter",
            &Message::InviteRequest {
                room_id: RoomId::from("other-room"),
                from_name: None,
                target: None,
            },
        );
        h.host.handle_event(event, h.start);
        assert!(matches!(
            h.host.drain_events().as_slice(),
            [SessionEvent::InviteReceived { .. }]
        ));
        assert_eq!(h.wire.borrow().closed, vec![conn("inviter")]);
    }

    #[test]
    fn rejoin_supersedes_with_leave_then_join_to_third_peers() {
        let mut h = harness();
        h.join("a1", "pa");
        h.join("c", "pc");
        let color = h.host.directory().color_of(&conn("a1")).cloned();
        h.wire.borrow_mut().clear_sent();

        h.join("a2", "pa");

        assert_eq!(h.wire.borrow().closed, vec![conn("a1")]);
        assert_eq!(h.host.directory().color_of(&conn("a2")).cloned(), color);
        let roster: Vec<Message> = h
            .sent_to("c")
            .into_iter()
            .filter(|m| matches!(m, Message::PlayerJoined { .. } | Message::PlayerLeft { .. }))
            .collect();
        assert_eq!(
            roster,
            vec![
                Message::PlayerLeft { id: conn("a1") },
                Message::PlayerJoined {
                    id: conn("a2"),
                    color
                },
            ]
        );

        // The old channel's late close changes nothing.
        h.host.handle_event(TransportEvent::Closed { conn: conn("a1") }, h.start);
        assert_eq!(h.host.directory().joiner_count(), 2);
    }

    #[test]
    fn request_start_mid_game_gets_exactly_one_start() {
        let mut h = harness();
        h.host.start_game();
        h.join("late", "pl");

        let starts = h
            .sent_to("late")
            .iter()
            .filter(|m| **m == Message::StartGame)
            .count();
        assert_eq!(starts, 1);
        let Message::Welcome { game_running, .. } = &h.sent_to("late")[0] else {
            panic!("expected welcome");
        };
        assert!(game_running);
    }

    #[test]
    fn kick_then_close_reports_one_departure() {
        let mut h = harness();
        h.join("a", "pa");
        h.join("b", "pb");
        h.host.drain_events();
        h.wire.borrow_mut().clear_sent();

        assert!(h.host.kick(&conn("a"), Some("afk".into())));
        assert!(!h.host.kick(&conn("a"), None));
        h.host.handle_event(TransportEvent::Closed { conn: conn("a") }, h.start);

        assert_eq!(
            h.sent_to("a"),
            vec![Message::Kicked {
                reason: Some("afk".into())
            }]
        );
        let lefts = h
            .sent_to("b")
            .iter()
            .filter(|m| matches!(m, Message::PlayerLeft { .. }))
            .count();
        assert_eq!(lefts, 1);
        let departures = h
            .host
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::JoinerLeft { .. }))
            .count();
        assert_eq!(departures, 1);
    }

    #[test]
    fn skill_cast_is_rebroadcast_without_position() {
        let mut h = harness();
        h.join("a", "pa");
        h.join("b", "pb");
        h.wire.borrow_mut().clear_sent();

        let event = data(
            "a",
            &Message::SkillCast(SkillCast {
                caster: None,
                skill: "fireball".into(),
                target: Some([1.0, 0.0, 1.0]),
                position: Some([9.0, 9.0, 9.0]),
                rotation: Some(1.0),
            }),
        );
        h.host.handle_event(event, h.start);

        assert!(h.sent_to("a").is_empty());
        assert_eq!(
            h.sent_to("b"),
            vec![Message::SkillCast(SkillCast {
                caster: Some(conn("a")),
                skill: "fireball".into(),
                target: Some([1.0, 0.0, 1.0]),
                position: None,
                rotation: None,
            })]
        );
    }

    #[test]
    fn enemy_kill_counts_once_and_shares_scaled_experience() {
        let mut h = harness();
        h.join("a", "pa");
        h.host.upsert_entity(
            "slime".into(),
            EntityState {
                kind: "slime".into(),
                position: [0.0; 3],
                rotation: 0.0,
                health: None,
                animation: None,
                experience: 10,
            },
        );
        h.wire.borrow_mut().clear_sent();

        let kill = Message::EnemyKilled {
            enemy_id: "slime".into(),
            killer: None,
        };
        h.host.handle_event(data("a", &kill), h.start);
        h.host.handle_event(data("a", &kill), h.start);

        assert_eq!(
            h.sent_to("a"),
            vec![
                Message::EnemiesRemoved {
                    ids: vec!["slime".into()]
                },
                Message::ShareExperience {
                    amount: 11,
                    source: Some("slime".into())
                },
            ]
        );
    }

    #[test]
    fn downlink_tags_from_joiners_are_dropped() {
        let mut h = harness();
        h.join("a", "pa");
        h.join("b", "pb");
        h.wire.borrow_mut().clear_sent();

        h.host.handle_event(data("a", &Message::HostLeft), h.start);
        h.host.handle_event(data("a", &Message::StartGame), h.start);

        assert!(!h.host.game_running());
        assert!(h.sent_to("b").is_empty());
    }

    #[test]
    fn garbage_payload_is_a_protocol_error_not_a_teardown() {
        let mut h = harness();
        h.join("a", "pa");
        h.host.drain_events();
        let garbage = TransportEvent::Data {
            conn: conn("a"),
            payload: Payload::Binary(vec![0xc1u8, 0x00].into()),
        };
        h.host.handle_event(garbage, h.start);
        assert!(matches!(
            h.host.drain_events().as_slice(),
            [SessionEvent::ProtocolError { .. }]
        ));
        assert_eq!(h.host.directory().joiner_count(), 1);
    }

    #[test]
    fn ticks_broadcast_identical_payloads_only_in_game() {
        let mut h = harness();
        h.join("a", "pa");
        h.join("b", "pb");
        h.wire.borrow_mut().clear_sent();

        let step = h.host.config.tick_interval();
        assert!(!h.host.tick(h.start + step));
        h.host.start_game();
        h.wire.borrow_mut().clear_sent();
        assert!(h.host.tick(h.start + step * 2));
        assert!(!h.host.tick(h.start + step * 2 + Duration::from_millis(1)));

        let wire = h.wire.borrow();
        assert_eq!(wire.sent.len(), 2);
        assert_eq!(wire.sent[0].1, wire.sent[1].1);
        assert!(matches!(
            decode(&FallbackCodec, &wire.sent[0].1).unwrap(),
            Message::GameState(_)
        ));
    }

    #[test]
    fn shutdown_announces_and_closes_everyone() {
        let mut h = harness();
        h.join("a", "pa");
        h.join("b", "pb");
        h.host.shutdown();

        assert_eq!(h.sent_to("a").last(), Some(&Message::HostLeft));
        assert_eq!(h.sent_to("b").last(), Some(&Message::HostLeft));
        let wire = h.wire.borrow();
        assert!(wire.shut_down);
        assert_eq!(wire.closed.len(), 2);
    }
}
