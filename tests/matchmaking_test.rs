//! End-to-end matchmaking tests: pooling, group formation rules and the
//! seating of matchmade rosters.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use huddle::coordinator::Player;
use huddle::network::{LoopbackNet, MatchmakerArgs, RelayServer, WsConnector};
use huddle::{MatchConfig, MatchCoordinator, MatchEvent, MatchMode, MatchState};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Long enough for the relay to have run a pool pass if it was going to
const POOL_SETTLE: Duration = Duration::from_millis(300);

type Coordinator = MatchCoordinator<WsConnector, LoopbackNet>;
type Events = mpsc::Receiver<MatchEvent>;

fn find_available_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to address")
        .local_addr()
        .expect("Failed to get local address")
        .port()
}

async fn start_relay() -> (String, JoinHandle<()>) {
    let port = find_available_port();
    let addr = format!("127.0.0.1:{}", port);
    let server = RelayServer::new();
    let bind_addr = addr.clone();
    let handle = tokio::spawn(async move {
        if let Err(e) = server.run(&bind_addr).await {
            eprintln!("Relay exited: {}", e);
        }
    });

    sleep(Duration::from_millis(100)).await;
    (format!("ws://{}", addr), handle)
}

fn client(url: &str, name: &str, net: &LoopbackNet, config: MatchConfig) -> (Coordinator, Events) {
    MatchCoordinator::new(WsConnector::new(url, name), net.clone(), config)
}

fn pool_args(min_count: u32, max_count: u32) -> MatchmakerArgs {
    MatchmakerArgs {
        min_count,
        max_count,
        ..MatchmakerArgs::default()
    }
}

async fn next_event(events: &mut Events) -> MatchEvent {
    timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("Timed out waiting for a match event")
        .expect("Event channel closed")
}

/// Drain events until the pool seats us, returning the matched roster.
async fn wait_matched(events: &mut Events) -> Vec<Player> {
    loop {
        if let MatchEvent::MatchmakerMatched { players } = next_event(events).await {
            return players;
        }
    }
}

/// Drain events until the match becomes ready.
async fn wait_ready(events: &mut Events) -> Vec<Player> {
    loop {
        if let MatchEvent::MatchReady { players } = next_event(events).await {
            return players;
        }
    }
}

/// Test: two pooled clients are matched, seated in session-id order and
/// negotiate a ready mesh; exactly one of them holds the host seat.
#[tokio::test]
async fn test_pool_matches_two_clients_into_ready_mesh() {
    let (url, relay) = start_relay().await;
    let net = LoopbackNet::new();
    let (alice, mut alice_events) = client(&url, "Alice", &net, MatchConfig::default());
    let (bob, mut bob_events) = client(&url, "Bob", &net, MatchConfig::default());

    alice
        .start_matchmaking(pool_args(2, 2))
        .await
        .expect("matchmaking failed");
    assert_eq!(alice.state().await, MatchState::Matching);

    bob.start_matchmaking(pool_args(2, 2))
        .await
        .expect("matchmaking failed");

    let matched = wait_matched(&mut alice_events).await;
    assert_eq!(matched.len(), 2);
    let mut by_session = matched.clone();
    by_session.sort_by(|x, y| x.session_id.cmp(&y.session_id));
    for (i, p) in by_session.iter().enumerate() {
        assert_eq!(p.peer_id, (i + 1) as u32, "seats follow session id order");
    }

    let peer_matched = wait_matched(&mut bob_events).await;
    assert_eq!(peer_matched.len(), 2);

    wait_ready(&mut alice_events).await;
    wait_ready(&mut bob_events).await;

    let alice_hosts = alice.is_host().await;
    let bob_hosts = bob.is_host().await;
    assert_ne!(alice_hosts, bob_hosts, "exactly one side takes the host seat");
    let host = if alice_hosts { &alice } else { &bob };
    assert_eq!(host.my_peer_id().await, Some(1));

    assert_eq!(alice.mode().await, MatchMode::Matchmaker);
    assert_eq!(bob.mode().await, MatchMode::Matchmaker);

    relay.abort();
}

/// Test: the pool holds clients until the minimum group size is present.
#[tokio::test]
async fn test_pool_waits_for_minimum_count() {
    let (url, relay) = start_relay().await;
    let net = LoopbackNet::new();
    let (first, mut first_events) = client(&url, "First", &net, MatchConfig::default());
    let (second, mut second_events) = client(&url, "Second", &net, MatchConfig::default());
    let (third, mut third_events) = client(&url, "Third", &net, MatchConfig::default());

    first
        .start_matchmaking(pool_args(3, 3))
        .await
        .expect("matchmaking failed");
    second
        .start_matchmaking(pool_args(3, 3))
        .await
        .expect("matchmaking failed");

    sleep(POOL_SETTLE).await;
    assert_eq!(first.state().await, MatchState::Matching);
    assert_eq!(second.state().await, MatchState::Matching);

    third
        .start_matchmaking(pool_args(3, 3))
        .await
        .expect("matchmaking failed");

    assert_eq!(wait_matched(&mut first_events).await.len(), 3);
    assert_eq!(wait_matched(&mut second_events).await.len(), 3);
    assert_eq!(wait_matched(&mut third_events).await.len(), 3);

    wait_ready(&mut first_events).await;
    wait_ready(&mut second_events).await;
    wait_ready(&mut third_events).await;

    relay.abort();
}

/// Test: clients on different versions never pool together.
#[tokio::test]
async fn test_version_fences_the_pool() {
    let (url, relay) = start_relay().await;
    let net = LoopbackNet::new();

    let odd_config = MatchConfig {
        client_version: "9.9.9-other".to_string(),
        ..MatchConfig::default()
    };
    let (current, mut current_events) = client(&url, "Current", &net, MatchConfig::default());
    let (outdated, _outdated_events) = client(&url, "Outdated", &net, odd_config);

    current
        .start_matchmaking(pool_args(2, 2))
        .await
        .expect("matchmaking failed");
    outdated
        .start_matchmaking(pool_args(2, 2))
        .await
        .expect("matchmaking failed");

    sleep(POOL_SETTLE).await;
    assert_eq!(current.state().await, MatchState::Matching);
    assert_eq!(outdated.state().await, MatchState::Matching);

    // A same-version arrival matches immediately, leaving the odd one out
    let (fresh, mut fresh_events) = client(&url, "Fresh", &net, MatchConfig::default());
    fresh
        .start_matchmaking(pool_args(2, 2))
        .await
        .expect("matchmaking failed");

    wait_matched(&mut current_events).await;
    wait_matched(&mut fresh_events).await;
    assert_eq!(outdated.state().await, MatchState::Matching);

    outdated.leave(true).await;
    relay.abort();
}

/// Test: leaving while pooled withdraws the ticket, even when the relay
/// connection stays open.
#[tokio::test]
async fn test_leave_withdraws_ticket() {
    let (url, relay) = start_relay().await;
    let net = LoopbackNet::new();
    let (quitter, mut quitter_events) = client(&url, "Quitter", &net, MatchConfig::default());
    let (stayer, mut stayer_events) = client(&url, "Stayer", &net, MatchConfig::default());

    quitter
        .start_matchmaking(pool_args(2, 2))
        .await
        .expect("matchmaking failed");
    quitter.leave(false).await;
    assert_eq!(quitter.state().await, MatchState::Lobby);

    stayer
        .start_matchmaking(pool_args(2, 2))
        .await
        .expect("matchmaking failed");
    sleep(POOL_SETTLE).await;
    assert_eq!(
        stayer.state().await,
        MatchState::Matching,
        "a withdrawn ticket must not fill the pool"
    );

    let (partner, mut partner_events) = client(&url, "Partner", &net, MatchConfig::default());
    partner
        .start_matchmaking(pool_args(2, 2))
        .await
        .expect("matchmaking failed");

    wait_matched(&mut stayer_events).await;
    wait_matched(&mut partner_events).await;
    assert!(
        quitter_events.try_recv().is_err(),
        "the withdrawn client must see no match"
    );

    relay.abort();
}

/// Test: a count-multiple constraint holds a pair back until a full
/// multiple is pooled, then matches the whole group.
#[tokio::test]
async fn test_count_multiple_gates_group_size() {
    let (url, relay) = start_relay().await;
    let net = LoopbackNet::new();
    let (first, mut first_events) = client(&url, "First", &net, MatchConfig::default());
    let (second, mut second_events) = client(&url, "Second", &net, MatchConfig::default());
    let (third, mut third_events) = client(&url, "Third", &net, MatchConfig::default());

    let args = || MatchmakerArgs {
        min_count: 2,
        max_count: 8,
        count_multiple: Some(3),
        ..MatchmakerArgs::default()
    };

    first
        .start_matchmaking(args())
        .await
        .expect("matchmaking failed");
    second
        .start_matchmaking(args())
        .await
        .expect("matchmaking failed");

    sleep(POOL_SETTLE).await;
    assert_eq!(first.state().await, MatchState::Matching);
    assert_eq!(second.state().await, MatchState::Matching);

    third
        .start_matchmaking(args())
        .await
        .expect("matchmaking failed");

    assert_eq!(wait_matched(&mut first_events).await.len(), 3);
    assert_eq!(wait_matched(&mut second_events).await.len(), 3);
    assert_eq!(wait_matched(&mut third_events).await.len(), 3);

    relay.abort();
}
