//! End-to-end link recovery tests: severed links, stalled negotiations
//! and relay candidate policies.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use huddle::coordinator::{Player, PlayerStatus};
use huddle::network::{
    LoopbackLink, LoopbackNet, PeerConnector, PeerError, PeerEventSender, PeerLink, RelayServer,
    WsConnector,
};
use huddle::protocol::{IceCandidate, SessionDescription};
use huddle::{MatchConfig, MatchCoordinator, MatchEvent, MatchState, RelayPolicy};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

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

async fn next_event(events: &mut Events) -> MatchEvent {
    timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("Timed out waiting for a match event")
        .expect("Event channel closed")
}

async fn wait_ready(events: &mut Events) -> Vec<Player> {
    loop {
        if let MatchEvent::MatchReady { players } = next_event(events).await {
            return players;
        }
    }
}

async fn wait_code(events: &mut Events) -> String {
    loop {
        if let MatchEvent::MatchCreated { match_id } = next_event(events).await {
            return match_id;
        }
    }
}

/// Drain events until some player reaches the given status.
async fn wait_status(events: &mut Events, status: PlayerStatus) -> Player {
    loop {
        if let MatchEvent::PlayerStatusChanged(p) = next_event(events).await {
            if p.status == status {
                return p;
            }
        }
    }
}

/// Test: a severed peer link is noticed on both sides and rebuilt without
/// touching the roster.
#[tokio::test]
async fn test_severed_link_rebuilds_automatically() {
    let (url, relay) = start_relay().await;
    let net = LoopbackNet::new();
    let (host, mut host_events) = client(&url, "Host", &net, MatchConfig::default());
    let (guest, mut guest_events) = client(&url, "Guest", &net, MatchConfig::default());

    host.create_match().await.expect("create failed");
    let code = wait_code(&mut host_events).await;
    guest.join_match(&code).await.expect("join failed");
    wait_ready(&mut host_events).await;
    wait_ready(&mut guest_events).await;

    let host_sid = host.session_id().await.expect("host session id");
    let guest_sid = guest.session_id().await.expect("guest session id");
    net.sever(&host_sid, &guest_sid);

    let lost = wait_status(&mut host_events, PlayerStatus::Connecting).await;
    assert_eq!(lost.username, "Guest");
    let lost = wait_status(&mut guest_events, PlayerStatus::Connecting).await;
    assert_eq!(lost.username, "Host");

    let mut roster = wait_ready(&mut host_events).await;
    roster.sort_by_key(|p| p.peer_id);
    assert_eq!(roster.len(), 2);
    assert_eq!(roster[0].username, "Host");
    assert_eq!(roster[0].peer_id, 1);
    assert_eq!(roster[1].username, "Guest");
    assert_eq!(roster[1].peer_id, 2);

    wait_ready(&mut guest_events).await;
    assert_eq!(host.state().await, MatchState::Ready);
    assert_eq!(guest.state().await, MatchState::Ready);

    relay.abort();
}

/// Test: severing one pair of a three-player mesh disturbs only that
/// pair; the third player never drops out of Ready.
#[tokio::test]
async fn test_partial_sever_only_disturbs_that_pair() {
    let (url, relay) = start_relay().await;
    let net = LoopbackNet::new();
    let (host, mut host_events) = client(&url, "Host", &net, MatchConfig::default());
    let (bob, mut bob_events) = client(&url, "Bob", &net, MatchConfig::default());
    let (carol, mut carol_events) = client(&url, "Carol", &net, MatchConfig::default());

    host.create_match().await.expect("create failed");
    let code = wait_code(&mut host_events).await;
    bob.join_match(&code).await.expect("join failed");
    wait_ready(&mut bob_events).await;
    carol.join_match(&code).await.expect("join failed");
    wait_ready(&mut carol_events).await;
    wait_ready(&mut host_events).await;
    let roster = wait_ready(&mut host_events).await;
    assert_eq!(roster.len(), 3);

    let bob_sid = bob.session_id().await.expect("bob session id");
    let carol_sid = carol.session_id().await.expect("carol session id");
    net.sever(&bob_sid, &carol_sid);

    wait_status(&mut bob_events, PlayerStatus::Connecting).await;
    wait_status(&mut carol_events, PlayerStatus::Connecting).await;
    wait_ready(&mut bob_events).await;
    wait_ready(&mut carol_events).await;

    assert_eq!(host.state().await, MatchState::Ready);
    assert!(
        host_events.try_recv().is_err(),
        "the host should observe nothing during a rebuild it is not part of"
    );

    relay.abort();
}

/// Connector whose links swallow the first offer, so attempt 0 of every
/// negotiation stalls and only a watchdog rebuild can complete the link.
#[derive(Clone)]
struct DropFirstOfferNet {
    inner: LoopbackNet,
}

struct DropFirstOfferLink {
    inner: LoopbackLink,
}

impl PeerLink for DropFirstOfferLink {
    fn session_id(&self) -> &str {
        self.inner.session_id()
    }

    fn attempt(&self) -> u64 {
        self.inner.attempt()
    }

    fn begin_offer(&self) -> Result<(), PeerError> {
        if self.inner.attempt() == 0 {
            // The offer vanishes; nothing reaches the other side
            return Ok(());
        }
        self.inner.begin_offer()
    }

    fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), PeerError> {
        self.inner.set_remote_description(desc)
    }

    fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError> {
        self.inner.add_ice_candidate(candidate)
    }

    fn send(&self, payload: Vec<u8>) -> Result<(), PeerError> {
        self.inner.send(payload)
    }

    fn close(&self) {
        self.inner.close()
    }
}

impl PeerConnector for DropFirstOfferNet {
    type Link = DropFirstOfferLink;

    fn connect(
        &self,
        local: &str,
        remote: &str,
        attempt: u64,
        events: PeerEventSender,
    ) -> Self::Link {
        DropFirstOfferLink {
            inner: self.inner.connect(local, remote, attempt, events),
        }
    }
}

/// Test: when negotiation stalls without a disconnect, the watchdog tears
/// the attempt down and the rebuilt link completes.
#[tokio::test]
async fn test_watchdog_rebuilds_stalled_negotiation() {
    let (url, relay) = start_relay().await;
    let net = DropFirstOfferNet {
        inner: LoopbackNet::new(),
    };
    let config = MatchConfig {
        negotiation_timeout: Some(Duration::from_millis(250)),
        ..MatchConfig::default()
    };
    let (host, mut host_events) =
        MatchCoordinator::new(WsConnector::new(&url, "Host"), net.clone(), config.clone());
    let (guest, mut guest_events) =
        MatchCoordinator::new(WsConnector::new(&url, "Guest"), net, config);

    host.create_match().await.expect("create failed");
    let code = wait_code(&mut host_events).await;
    guest.join_match(&code).await.expect("join failed");

    let roster = wait_ready(&mut host_events).await;
    assert_eq!(roster.len(), 2);
    wait_ready(&mut guest_events).await;
    assert_eq!(host.state().await, MatchState::Ready);
    assert_eq!(guest.state().await, MatchState::Ready);

    relay.abort();
}

async fn pair_reaches_ready_with(policy: RelayPolicy) {
    let (url, relay) = start_relay().await;
    let net = LoopbackNet::new();
    let config = MatchConfig {
        relay_policy: policy,
        ..MatchConfig::default()
    };
    let (host, mut host_events) = client(&url, "Host", &net, config.clone());
    let (guest, mut guest_events) = client(&url, "Guest", &net, config);

    host.create_match().await.expect("create failed");
    let code = wait_code(&mut host_events).await;
    guest.join_match(&code).await.expect("join failed");

    wait_ready(&mut host_events).await;
    wait_ready(&mut guest_events).await;

    relay.abort();
}

/// Test: with relay candidates dropped, host candidates still connect.
#[tokio::test]
async fn test_disabled_relay_policy_still_connects() {
    pair_reaches_ready_with(RelayPolicy::Disabled).await;
}

/// Test: with only relay candidates allowed, the link still connects.
#[tokio::test]
async fn test_forced_relay_policy_still_connects() {
    pair_reaches_ready_with(RelayPolicy::Forced).await;
}
