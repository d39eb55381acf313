// Integration smoke test for the TCP transport.
//
// Starts a hosting node on localhost, points a joining node at it through
// the transport's address book, and drives both until the joiner is in the
// match and has mirrored a snapshot. Then exercises a kick and checks the
// joiner ends without trying to reconnect.
//
// Both nodes run on this thread; only the transport's listener and reader
// threads run in the background, exactly as in a game process.

use std::time::{Duration, Instant};

use rally_protocol::{EntityState, Message, PlayerInput};
use rally_session::{
    JoinerStatus, MemoryIdentityStore, MemoryJoinerStore, Node, Role, SessionEvent, SyncConfig,
    TcpTransport,
};

fn config() -> SyncConfig {
    SyncConfig {
        tick_interval_ms: 10,
        join_timeout_ms: 5_000,
        ..SyncConfig::default()
    }
}

/// Pump both nodes until `done` holds or five seconds pass. Returns every
/// event the joiner raised along the way.
fn pump_until(
    host: &mut Node<TcpTransport>,
    joiner: &mut Node<TcpTransport>,
    mut done: impl FnMut(&Node<TcpTransport>, &Node<TcpTransport>) -> bool,
) -> Vec<SessionEvent> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut joiner_events = Vec::new();
    while Instant::now() < deadline {
        host.pump(Instant::now());
        joiner.pump(Instant::now());
        host.poll_events();
        joiner_events.extend(joiner.poll_events());
        if done(host, joiner) {
            return joiner_events;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not reached; joiner events so far: {joiner_events:?}");
}

#[test]
fn join_play_and_kick_over_tcp() {
    let _ = env_logger::builder().is_test(true).try_init();

    // 1. Host on an OS-picked port.
    let mut host = Node::new(
        TcpTransport::new(0),
        &mut MemoryIdentityStore::with_id("hostdevice"),
        MemoryJoinerStore::default(),
        config(),
    )
    .unwrap();
    let room = host.become_host(Instant::now()).unwrap();
    let addr = host.host().unwrap().endpoint().local_addr().unwrap();
    host.start_game().unwrap();
    host.host_mut().unwrap().upsert_entity(
        "goblin-1".into(),
        EntityState {
            kind: "goblin".into(),
            position: [1.0, 0.0, 1.0],
            rotation: 0.0,
            health: Some(10.0),
            animation: None,
            experience: 5,
        },
    );

    // 2. Joiner that knows where the room lives.
    let mut transport = TcpTransport::new(0);
    transport.add_peer(room.as_connection_id(), addr);
    let mut joiner = Node::new(
        transport,
        &mut MemoryIdentityStore::with_id("joinerdevice"),
        MemoryJoinerStore::default(),
        config(),
    )
    .unwrap();
    joiner.become_joiner(&room, Instant::now()).unwrap();

    // 3. Handshake, start, first snapshot.
    let events = pump_until(&mut host, &mut joiner, |_, j| {
        j.joiner().is_some_and(|s| {
            s.status() == JoinerStatus::InGame && !s.view().entities().is_empty()
        })
    });
    assert!(
        events
            .iter()
            .any(|e| matches!(e, SessionEvent::Welcomed { .. })),
        "no welcome in {events:?}"
    );
    let my_id = joiner.joiner().unwrap().my_id().cloned().unwrap();
    assert_eq!(host.host().unwrap().joiners(), vec![my_id.clone()]);
    let view = joiner.joiner().unwrap().view();
    assert!(view.roster().contains(&room.as_connection_id()));
    assert!(view.roster().contains(&my_id));
    assert_ne!(
        view.color_of(&room.as_connection_id()),
        view.color_of(&my_id)
    );

    // 4. Input flows upward.
    joiner
        .send_input(PlayerInput {
            movement: [1.0, 0.0],
            ..PlayerInput::default()
        })
        .unwrap();
    pump_until(&mut host, &mut joiner, |h, _| {
        h.host().unwrap().latest_input(&my_id).is_some()
    });

    // 5. Gameplay reports are forwarded back as-is by the application.
    joiner
        .joiner_mut()
        .unwrap()
        .send_gameplay(Message::EnemyKilled {
            enemy_id: "goblin-1".into(),
            killer: None,
        })
        .unwrap();
    pump_until(&mut host, &mut joiner, |h, _| {
        h.host().unwrap().sync().entity(&"goblin-1".into()).is_none()
    });

    // 6. A kick is terminal: the joiner hands the node back and does not
    //    retry.
    assert!(host.kick(&my_id, Some("test over".into())).unwrap());
    let events = pump_until(&mut host, &mut joiner, |_, j| {
        j.current_role() == Role::Unconnected
    });
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::StatusChanged(JoinerStatus::Kicked { .. })
    )));
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, SessionEvent::StatusChanged(JoinerStatus::Reconnecting { .. })))
    );
    assert!(host.host().unwrap().joiners().is_empty());
}

#[test]
fn unknown_room_fails_to_dial() {
    let mut joiner = Node::new(
        TcpTransport::new(0),
        &mut MemoryIdentityStore::with_id("lonely"),
        MemoryJoinerStore::default(),
        config(),
    )
    .unwrap();
    // No address book entry and not a socket address: the first dial fails
    // synchronously and the session reports it.
    joiner
        .become_joiner(&"nowhere".into(), Instant::now())
        .unwrap_err();
    assert_eq!(joiner.current_role(), Role::Unconnected);
}

/// Closing the room, as `rally-host` does on Ctrl+C, reaches the joiner as
/// an announced departure: it ends without a single retry.
#[test]
fn host_shutdown_is_announced_over_tcp() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut host = Node::new(
        TcpTransport::new(0),
        &mut MemoryIdentityStore::with_id("closinghost"),
        MemoryJoinerStore::default(),
        config(),
    )
    .unwrap();
    let room = host.become_host(Instant::now()).unwrap();
    let addr = host.host().unwrap().endpoint().local_addr().unwrap();

    let mut transport = TcpTransport::new(0);
    transport.add_peer(room.as_connection_id(), addr);
    let mut joiner = Node::new(
        transport,
        &mut MemoryIdentityStore::with_id("guestdevice"),
        MemoryJoinerStore::default(),
        config(),
    )
    .unwrap();
    joiner.become_joiner(&room, Instant::now()).unwrap();
    pump_until(&mut host, &mut joiner, |_, j| {
        j.joiner()
            .is_some_and(|s| s.status() == JoinerStatus::ConnectedWaiting)
    });

    host.leave(Instant::now());
    assert_eq!(host.current_role(), Role::Unconnected);
    let events = pump_until(&mut host, &mut joiner, |_, j| {
        j.current_role() == Role::Unconnected
    });
    assert!(
        events
            .iter()
            .any(|e| matches!(e, SessionEvent::StatusChanged(JoinerStatus::HostLeft)))
    );
    assert!(!events.iter().any(|e| matches!(
        e,
        SessionEvent::StatusChanged(JoinerStatus::Reconnecting { .. })
    )));
}
