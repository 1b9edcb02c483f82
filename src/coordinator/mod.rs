//! Match coordination: discovery, admission and peer mesh lifecycle
//!
//! [`MatchCoordinator`] drives one match at a time. It talks to the relay
//! through the [`Signaling`] seam to create, join or matchmake into a room,
//! admits players (host side), negotiates a full mesh of peer links through
//! [`PeerConnector`], and reports everything observable on a single bounded
//! event channel.
//!
//! All state lives behind one async mutex. Relay traffic, peer link
//! callbacks and watchdog ticks funnel through a single pump task in
//! arrival order; public operations lock the same state, so user calls
//! interleave only at transition boundaries. `leave()` bumps a generation
//! counter that in-flight operations re-check after every await, which
//! makes a late completion a no-op instead of a corruption.

pub mod error;
pub mod player;

pub use error::MatchError;
pub use player::{PeerId, Player, PlayerStatus, Roster, HOST_PEER_ID};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, trace, warn};

use crate::network::{
    MatchmakerArgs, PeerConnector, PeerError, PeerEvent, PeerEventSender, PeerLink, Signaling,
    SignalingConnector, SignalingError, SignalingEvent, UserPresence,
};
use crate::protocol::{
    self, IceCandidate, JoinDenied, JoinRefusal, JoinSuccess, MatchOpCode, PeerEnvelope,
    PeerSignal, SdpKind,
};

/// Observer channel depth; events beyond this are dropped with a warning
const EVENT_CAPACITY: usize = 64;

/// Where the match lifecycle currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchState {
    Lobby,
    Matching,
    Connecting,
    WaitingForEnoughPlayers,
    Ready,
    Playing,
}

/// How this client entered (or will enter) the match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    #[default]
    None,
    Create,
    Join,
    Matchmaker,
}

/// What to do with relay-typed (TURN) transport candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelayPolicy {
    /// Accept every candidate
    #[default]
    Auto,
    /// Accept only relay-typed candidates, forcing traffic through TURN
    Forced,
    /// Drop relay-typed candidates
    Disabled,
}

impl RelayPolicy {
    /// Whether a candidate may cross this policy, in either direction
    pub fn allows(self, candidate: &IceCandidate) -> bool {
        match self {
            RelayPolicy::Auto => true,
            RelayPolicy::Forced => candidate.is_relay(),
            RelayPolicy::Disabled => !candidate.is_relay(),
        }
    }
}

/// Tunables for one coordinator instance
#[derive(Debug, Clone)]
pub struct MatchConfig {
    /// Fewer connected players than this and the match is not ready
    pub min_players: u32,
    /// The host refuses joiners past this roster size
    pub max_players: u32,
    /// Version joiners must share with the host; matchmaking filters on it
    pub client_version: String,
    /// STUN/TURN servers for the peer transport
    pub ice_servers: Vec<String>,
    pub relay_policy: RelayPolicy,
    /// How long one link attempt may negotiate before it is rebuilt.
    /// `None` disables the watchdog.
    pub negotiation_timeout: Option<Duration>,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            min_players: 2,
            max_players: 4,
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            relay_policy: RelayPolicy::Auto,
            negotiation_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Everything observable about the match, drained from one channel
#[derive(Debug)]
pub enum MatchEvent {
    /// We host a new match; share `match_id` so others can join
    MatchCreated { match_id: String },
    MatchJoined { match_id: String },
    /// The pool matched us; the roster is already seated
    MatchmakerMatched { players: Vec<Player> },
    PlayerJoined(Player),
    PlayerLeft(Player),
    PlayerStatusChanged(Player),
    /// Every seated player is connected and the minimum is met
    MatchReady { players: Vec<Player> },
    MatchNotReady,
    /// The relay link is gone and the match has been torn down
    Disconnected,
    /// Bytes a peer sent on the reliable mesh channel
    MessageReceived { from: PeerId, payload: Vec<u8> },
    Error(MatchError),
}

/// Unified input stream for the pump task
enum Pump {
    Signaling { epoch: u64, event: SignalingEvent },
    Peer { generation: u64, event: PeerEvent },
    Watchdog { generation: u64, session_id: String, attempt: u64 },
}

type PumpSender = mpsc::UnboundedSender<Pump>;

struct LinkEntry<L> {
    link: L,
    attempt: u64,
    connected: bool,
}

struct Inner<S, L> {
    state: MatchState,
    mode: MatchMode,
    /// Bumped by every leave; stale async completions check it
    generation: u64,
    /// Bumped whenever the relay client is replaced or closed
    conn_epoch: u64,
    signaling: Option<Arc<S>>,
    session_id: Option<String>,
    match_id: Option<String>,
    ticket: Option<String>,
    roster: Roster,
    links: HashMap<String, LinkEntry<L>>,
    peer_tx: Option<PeerEventSender>,
}

impl<S, L> Inner<S, L> {
    fn new() -> Self {
        Self {
            state: MatchState::Lobby,
            mode: MatchMode::None,
            generation: 0,
            conn_epoch: 0,
            signaling: None,
            session_id: None,
            match_id: None,
            ticket: None,
            roster: Roster::new(),
            links: HashMap::new(),
            peer_tx: None,
        }
    }

    /// Whether this client currently holds the host seat
    fn is_host(&self) -> bool {
        self.session_id
            .as_deref()
            .and_then(|sid| self.roster.get(sid))
            .map(|p| p.is_host())
            .unwrap_or(false)
    }
}

/// Best-effort relay teardown, performed once the state lock is released
struct Cleanup<S> {
    client: Option<Arc<S>>,
    room: Option<String>,
    ticket: Option<String>,
    close_socket: bool,
}

impl<S: Signaling> Cleanup<S> {
    async fn run(self) {
        let Some(client) = self.client else { return };
        if let Some(room) = self.room {
            if let Err(e) = client.leave_room(&room).await {
                debug!("Leaving room {} failed: {}", room, e);
            }
        }
        if let Some(ticket) = self.ticket {
            if let Err(e) = client.remove_matchmaker(&ticket).await {
                debug!("Withdrawing matchmaker ticket failed: {}", e);
            }
        }
        if self.close_socket {
            let _ = client.close().await;
        }
    }
}

/// A room broadcast built under the lock, sent after it is released
struct Outgoing<S> {
    client: Arc<S>,
    room: String,
    op: MatchOpCode,
    payload: Vec<u8>,
}

/// Encode and queue one room broadcast
fn push_room<S, T: Serialize>(
    out: &mut Vec<Outgoing<S>>,
    client: Arc<S>,
    room: String,
    op: MatchOpCode,
    value: &T,
) {
    match protocol::encode(value) {
        Ok(payload) => out.push(Outgoing {
            client,
            room,
            op,
            payload,
        }),
        Err(e) => warn!("Failed to encode {:?} payload: {}", op, e),
    }
}

/// Tear down under the lock: links, roster, identifiers. The returned
/// cleanup performs the relay calls once the lock is gone.
fn reset_locked<S, L: PeerLink>(st: &mut Inner<S, L>, close_socket: bool) -> Cleanup<S> {
    st.generation += 1;

    for (_, entry) in st.links.drain() {
        entry.link.close();
    }
    st.peer_tx = None;
    st.roster.clear();
    st.state = MatchState::Lobby;
    st.mode = MatchMode::None;

    let room = st.match_id.take();
    let ticket = st.ticket.take();
    let client = if close_socket {
        st.conn_epoch += 1;
        st.session_id = None;
        st.signaling.take()
    } else {
        st.signaling.clone()
    };

    Cleanup {
        client,
        room,
        ticket,
        close_socket,
    }
}

fn link_current<S, L>(st: &Inner<S, L>, session_id: &str, attempt: u64) -> bool {
    st.links
        .get(session_id)
        .map(|e| e.attempt == attempt)
        .unwrap_or(false)
}

struct Shared<C: SignalingConnector, P: PeerConnector> {
    connector: C,
    peers: P,
    config: MatchConfig,
    events: mpsc::Sender<MatchEvent>,
    state: Mutex<Inner<C::Client, P::Link>>,
}

/// Handle to one match lifecycle
///
/// Cheap to clone; all clones drive the same match.
pub struct MatchCoordinator<C: SignalingConnector, P: PeerConnector> {
    shared: Arc<Shared<C, P>>,
    pump_tx: PumpSender,
}

impl<C: SignalingConnector, P: PeerConnector> Clone for MatchCoordinator<C, P> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            pump_tx: self.pump_tx.clone(),
        }
    }
}

impl<C: SignalingConnector, P: PeerConnector> MatchCoordinator<C, P> {
    /// Build a coordinator and the channel its events arrive on
    pub fn new(connector: C, peers: P, config: MatchConfig) -> (Self, mpsc::Receiver<MatchEvent>) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let (pump_tx, pump_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            connector,
            peers,
            config,
            events: event_tx,
            state: Mutex::new(Inner::new()),
        });

        tokio::spawn(pump(shared.clone(), pump_tx.clone(), pump_rx));

        (Self { shared, pump_tx }, event_rx)
    }

    /// Create a hosted match. We take the host seat as peer 1;
    /// [`MatchEvent::MatchCreated`] carries the join code.
    pub async fn create_match(&self) -> Result<(), MatchError> {
        self.leave(false).await;

        let generation = {
            let mut st = self.shared.state.lock().await;
            st.mode = MatchMode::Create;
            st.generation
        };

        let client = match self.attach_signaling(generation).await {
            Ok(Some(client)) => client,
            Ok(None) => return Ok(()),
            Err(e) => {
                self.abort_pending(generation).await;
                return Err(MatchError::MatchCreateFailed(e));
            }
        };

        let room_id = match client.create_room().await {
            Ok(room_id) => room_id,
            Err(e) => {
                self.abort_pending(generation).await;
                return Err(MatchError::MatchCreateFailed(e));
            }
        };

        let mut st = self.shared.state.lock().await;
        if st.generation != generation {
            // Left while the room was being created; give the seat back
            drop(st);
            let _ = client.leave_room(&room_id).await;
            return Ok(());
        }

        st.match_id = Some(room_id.clone());
        st.state = MatchState::Lobby;

        let mut me = Player::new(client.session_id(), client.username(), HOST_PEER_ID);
        me.status = PlayerStatus::Connected;
        st.roster.insert(me.clone());
        self.shared.ensure_peer_channel(&mut st, &self.pump_tx);
        drop(st);

        info!("Created match {} as host", room_id);
        self.shared
            .emit(MatchEvent::MatchCreated { match_id: room_id });
        self.shared.emit(MatchEvent::PlayerJoined(me));
        Ok(())
    }

    /// Join a hosted match by its code. Seat and roster arrive with the
    /// host's admission broadcast.
    pub async fn join_match(&self, match_id: &str) -> Result<(), MatchError> {
        self.leave(false).await;

        let generation = {
            let mut st = self.shared.state.lock().await;
            st.mode = MatchMode::Join;
            st.generation
        };

        let client = match self.attach_signaling(generation).await {
            Ok(Some(client)) => client,
            Ok(None) => return Ok(()),
            Err(e) => {
                self.abort_pending(generation).await;
                return Err(MatchError::JoinMatchFailed(e));
            }
        };

        if let Err(e) = client.join_room(match_id).await {
            self.abort_pending(generation).await;
            return Err(MatchError::JoinMatchFailed(e));
        }

        let mut st = self.shared.state.lock().await;
        if st.generation != generation {
            drop(st);
            let _ = client.leave_room(match_id).await;
            return Ok(());
        }

        st.match_id = Some(match_id.to_string());
        st.state = MatchState::Lobby;
        self.shared.ensure_peer_channel(&mut st, &self.pump_tx);
        drop(st);

        info!("Joined match {}", match_id);
        self.shared.emit(MatchEvent::MatchJoined {
            match_id: match_id.to_string(),
        });
        Ok(())
    }

    /// Enter the matchmaking pool. A client-version filter is always added
    /// so incompatible clients never pool together.
    pub async fn start_matchmaking(&self, mut args: MatchmakerArgs) -> Result<(), MatchError> {
        self.leave(false).await;

        let generation = {
            let mut st = self.shared.state.lock().await;
            st.mode = MatchMode::Matchmaker;
            st.state = MatchState::Matching;
            st.generation
        };

        let version = self.shared.config.client_version.clone();
        args.string_properties
            .insert("client_version".to_string(), version.clone());
        let term = format!("+properties.client_version:{}", version);
        args.query = match args.query.trim() {
            "" | "*" => term,
            q => format!("{} {}", q, term),
        };

        let client = match self.attach_signaling(generation).await {
            Ok(Some(client)) => client,
            Ok(None) => return Ok(()),
            Err(e) => {
                self.abort_pending(generation).await;
                return Err(MatchError::StartMatchmakingFailed(e));
            }
        };

        let ticket = match client.add_matchmaker(args).await {
            Ok(ticket) => ticket,
            Err(e) => {
                self.abort_pending(generation).await;
                return Err(MatchError::StartMatchmakingFailed(e));
            }
        };

        let mut st = self.shared.state.lock().await;
        if st.generation != generation {
            drop(st);
            let _ = client.remove_matchmaker(&ticket).await;
            return Ok(());
        }
        st.ticket = Some(ticket);
        info!("Waiting in the matchmaking pool");
        Ok(())
    }

    /// Tear the match down: close peer links, leave the room or withdraw
    /// the matchmaking ticket, clear the roster. Safe from any state and
    /// idempotent. `close_socket` also drops the relay link.
    pub async fn leave(&self, close_socket: bool) {
        let cleanup = {
            let mut st = self.shared.state.lock().await;
            reset_locked(&mut st, close_socket)
        };
        cleanup.run().await;
    }

    /// Move a ready match into play. Joiners are refused until
    /// [`reopen_match`](Self::reopen_match). Only valid on a
    /// [`MatchState::Ready`] match.
    pub async fn start_playing(&self) {
        let mut st = self.shared.state.lock().await;
        debug_assert_eq!(st.state, MatchState::Ready, "start_playing outside Ready");
        if st.state != MatchState::Ready {
            warn!("start_playing outside Ready, ignoring");
            return;
        }
        st.state = MatchState::Playing;
        info!("Match is now playing");
    }

    /// Between rounds: return from Playing to the lobby flow, so joiners
    /// are admitted again and readiness is re-evaluated.
    pub async fn reopen_match(&self) {
        let mut st = self.shared.state.lock().await;
        if st.state != MatchState::Playing {
            warn!("reopen_match outside Playing, ignoring");
            return;
        }
        st.state = MatchState::Connecting;
        self.shared.evaluate_readiness(&mut st);
    }

    /// Send to every connected peer on the reliable channel
    pub async fn broadcast_reliable(&self, payload: Vec<u8>) -> Result<(), PeerError> {
        let st = self.shared.state.lock().await;
        for entry in st.links.values() {
            if entry.connected {
                entry.link.send(payload.clone())?;
            }
        }
        Ok(())
    }

    /// Send to one peer by its id
    pub async fn send_reliable(&self, peer_id: PeerId, payload: Vec<u8>) -> Result<(), PeerError> {
        let st = self.shared.state.lock().await;
        let player = st
            .roster
            .by_peer_id(peer_id)
            .ok_or_else(|| PeerError::UnknownPeer(format!("peer {}", peer_id)))?;
        let entry = st
            .links
            .get(&player.session_id)
            .ok_or(PeerError::LinkClosed)?;
        entry.link.send(payload)
    }

    pub async fn state(&self) -> MatchState {
        self.shared.state.lock().await.state
    }

    pub async fn mode(&self) -> MatchMode {
        self.shared.state.lock().await.mode
    }

    /// Room id of the current match, once known
    pub async fn match_id(&self) -> Option<String> {
        self.shared.state.lock().await.match_id.clone()
    }

    /// Session id the relay assigned to us, once connected
    pub async fn session_id(&self) -> Option<String> {
        self.shared.state.lock().await.session_id.clone()
    }

    /// Roster ordered by peer id
    pub async fn players(&self) -> Vec<Player> {
        self.shared.state.lock().await.roster.players()
    }

    /// Our seat in the current match, once assigned
    pub async fn my_peer_id(&self) -> Option<PeerId> {
        let st = self.shared.state.lock().await;
        st.session_id
            .as_deref()
            .and_then(|sid| st.roster.get(sid))
            .map(|p| p.peer_id)
    }

    pub async fn is_host(&self) -> bool {
        self.my_peer_id().await == Some(HOST_PEER_ID)
    }

    /// Reuse the live relay link or dial a new one. `None` means a
    /// concurrent leave invalidated the operation.
    async fn attach_signaling(
        &self,
        generation: u64,
    ) -> Result<Option<Arc<C::Client>>, SignalingError> {
        {
            let st = self.shared.state.lock().await;
            if st.generation != generation {
                return Ok(None);
            }
            if let Some(client) = &st.signaling {
                return Ok(Some(client.clone()));
            }
        }

        let (client, events) = self.shared.connector.connect().await?;
        let client = Arc::new(client);

        let mut st = self.shared.state.lock().await;
        if st.generation != generation {
            drop(st);
            let _ = client.close().await;
            return Ok(None);
        }

        st.conn_epoch += 1;
        let epoch = st.conn_epoch;
        st.session_id = Some(client.session_id().to_string());
        st.signaling = Some(client.clone());
        drop(st);

        tokio::spawn(forward_signaling(epoch, events, self.pump_tx.clone()));
        Ok(Some(client))
    }

    /// A failed create/join/matchmake leaves no half-state behind
    async fn abort_pending(&self, generation: u64) {
        let cleanup = {
            let mut st = self.shared.state.lock().await;
            if st.generation != generation {
                return;
            }
            reset_locked(&mut st, false)
        };
        cleanup.run().await;
    }
}

impl<C: SignalingConnector, P: PeerConnector> Shared<C, P> {
    fn emit(&self, event: MatchEvent) {
        if let Err(e) = self.events.try_send(event) {
            warn!("Dropping match event: {}", e);
        }
    }

    fn ensure_peer_channel(&self, st: &mut Inner<C::Client, P::Link>, pump: &PumpSender) {
        if st.peer_tx.is_some() {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        st.peer_tx = Some(tx);
        tokio::spawn(forward_peers(st.generation, rx, pump.clone()));
    }

    /// Open (or rebuild) the link to a remote. The side with the smaller
    /// session id offers; the other waits and answers.
    fn open_link(&self, st: &mut Inner<C::Client, P::Link>, pump: &PumpSender, remote: &str) {
        let Some(local) = st.session_id.clone() else {
            warn!("Cannot open a link without a relay session");
            return;
        };
        self.ensure_peer_channel(st, pump);
        let Some(events) = st.peer_tx.clone() else {
            return;
        };

        let attempt = match st.links.remove(remote) {
            Some(old) => {
                old.link.close();
                old.attempt + 1
            }
            None => 0,
        };

        debug!("Opening link to {} (attempt {})", remote, attempt);
        let link = self.peers.connect(&local, remote, attempt, events);

        if local.as_str() < remote {
            if let Err(e) = link.begin_offer() {
                self.emit(MatchEvent::Error(MatchError::OfferFailed {
                    session_id: remote.to_string(),
                    detail: e.to_string(),
                }));
            }
        }

        if let Some(timeout) = self.config.negotiation_timeout {
            let pump = pump.clone();
            let generation = st.generation;
            let session_id = remote.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = pump.send(Pump::Watchdog {
                    generation,
                    session_id,
                    attempt,
                });
            });
        }

        st.links.insert(
            remote.to_string(),
            LinkEntry {
                link,
                attempt,
                connected: false,
            },
        );
    }

    /// Recompute Ready / Connecting / WaitingForEnoughPlayers after a
    /// roster or connectivity change
    fn evaluate_readiness(&self, st: &mut Inner<C::Client, P::Link>) {
        match st.state {
            MatchState::Connecting | MatchState::Ready | MatchState::WaitingForEnoughPlayers => {}
            _ => return,
        }

        let enough = st.roster.len() >= self.config.min_players as usize;
        let whole = !st.roster.is_empty() && st.roster.all_connected();

        if !enough {
            if st.state != MatchState::WaitingForEnoughPlayers {
                st.state = MatchState::WaitingForEnoughPlayers;
                self.emit(MatchEvent::MatchNotReady);
            }
        } else if whole {
            if st.state != MatchState::Ready {
                st.state = MatchState::Ready;
                info!("Match ready with {} players", st.roster.len());
                self.emit(MatchEvent::MatchReady {
                    players: st.roster.players(),
                });
            }
        } else if st.state == MatchState::Ready {
            st.state = MatchState::Connecting;
            self.emit(MatchEvent::MatchNotReady);
        } else {
            st.state = MatchState::Connecting;
        }
    }

    fn on_signaling(
        &self,
        st: &mut Inner<C::Client, P::Link>,
        pump: &PumpSender,
        event: SignalingEvent,
        out: &mut Vec<Outgoing<C::Client>>,
        cleanups: &mut Vec<Cleanup<C::Client>>,
    ) {
        match event {
            SignalingEvent::Presence { joins, leaves } => {
                if st.is_host() {
                    for join in joins {
                        self.admit(st, pump, join, out);
                    }
                }
                for leave in leaves {
                    self.on_player_left(st, leave, cleanups);
                }
            }
            SignalingEvent::RoomMessage {
                op_code,
                payload,
                sender,
            } => {
                let Ok(op) = MatchOpCode::try_from(op_code) else {
                    debug!("Ignoring unknown op code {}", op_code);
                    return;
                };
                match op {
                    MatchOpCode::PeerSignal => self.on_peer_signal(st, pump, &payload, &sender),
                    MatchOpCode::JoinSuccess => self.on_join_success(st, pump, &payload, cleanups),
                    MatchOpCode::JoinError => self.on_join_denied(st, &payload, cleanups),
                }
            }
            SignalingEvent::MatchmakerMatched { room_id, users } => {
                self.on_matchmade(st, pump, room_id, users, cleanups);
            }
            SignalingEvent::Closed { error } => {
                if st.signaling.is_none() {
                    return;
                }
                warn!("Relay link lost");
                if error.is_some() {
                    self.emit(MatchEvent::Error(MatchError::WebsocketConnection(error)));
                }
                let mut cleanup = reset_locked(st, true);
                // The socket is dead, nothing left worth calling on it
                cleanup.client = None;
                cleanups.push(cleanup);
                self.emit(MatchEvent::Disconnected);
            }
        }
    }

    /// Host-side admission: seat the joiner or turn it away
    fn admit(
        &self,
        st: &mut Inner<C::Client, P::Link>,
        pump: &PumpSender,
        join: UserPresence,
        out: &mut Vec<Outgoing<C::Client>>,
    ) {
        if st.roster.contains(&join.session_id) {
            return;
        }
        let (Some(client), Some(room)) = (st.signaling.clone(), st.match_id.clone()) else {
            return;
        };

        let refusal = if st.state == MatchState::Playing {
            Some(JoinRefusal::MatchHasAlreadyBegun)
        } else if st.roster.len() >= self.config.max_players as usize {
            Some(JoinRefusal::MatchIsFull)
        } else {
            None
        };

        if let Some(reason) = refusal {
            info!("Refusing {}: {}", join.username, reason);
            push_room(
                out,
                client,
                room,
                MatchOpCode::JoinError,
                &JoinDenied {
                    target: join.session_id,
                    reason,
                },
            );
            return;
        }

        let peer_id = st.roster.next_free_peer_id();
        let player = Player::new(&join.session_id, &join.username, peer_id);
        st.roster.insert(player.clone());
        info!("Admitted {} as peer {}", player.username, peer_id);

        push_room(
            out,
            client,
            room,
            MatchOpCode::JoinSuccess,
            &JoinSuccess {
                players: st.roster.records(),
                host_version: self.config.client_version.clone(),
            },
        );

        self.open_link(st, pump, &player.session_id);
        self.emit(MatchEvent::PlayerJoined(player));

        if st.state == MatchState::Lobby {
            st.state = MatchState::Connecting;
        } else {
            self.evaluate_readiness(st);
        }
    }

    fn on_player_left(
        &self,
        st: &mut Inner<C::Client, P::Link>,
        leave: UserPresence,
        cleanups: &mut Vec<Cleanup<C::Client>>,
    ) {
        if st.session_id.as_deref() == Some(leave.session_id.as_str()) {
            return;
        }
        let Some(player) = st.roster.remove(&leave.session_id) else {
            return;
        };

        if player.is_host() {
            warn!("Host {} left, the match is over", player.username);
            self.emit(MatchEvent::Error(MatchError::HostDisconnected));
            cleanups.push(reset_locked(st, false));
            return;
        }

        if let Some(entry) = st.links.remove(&player.session_id) {
            entry.link.close();
        }
        info!("{} left the match", player.username);
        self.emit(MatchEvent::PlayerLeft(player));

        if st.state != MatchState::Playing {
            self.evaluate_readiness(st);
        }
    }

    fn on_peer_signal(
        &self,
        st: &mut Inner<C::Client, P::Link>,
        pump: &PumpSender,
        payload: &[u8],
        sender: &UserPresence,
    ) {
        let envelope: PeerEnvelope = match protocol::decode(payload) {
            Ok(env) => env,
            Err(e) => {
                warn!("Bad peer signal from {}: {}", sender.username, e);
                return;
            }
        };
        if st.session_id.as_deref() != Some(envelope.target.as_str()) {
            return;
        }

        match envelope.signal {
            PeerSignal::Description(desc) => {
                // The offer can beat the roster broadcast; open the
                // answering side on demand.
                if !st.links.contains_key(&sender.session_id)
                    && st.roster.contains(&sender.session_id)
                    && desc.kind == SdpKind::Offer
                    && st
                        .session_id
                        .as_deref()
                        .map(|sid| sid > sender.session_id.as_str())
                        .unwrap_or(false)
                {
                    self.open_link(st, pump, &sender.session_id);
                }
                match st.links.get(&sender.session_id) {
                    Some(entry) => {
                        if let Err(e) = entry.link.set_remote_description(&desc) {
                            warn!("Description from {} rejected: {}", sender.username, e);
                        }
                    }
                    None => debug!("Description from {} without a link", sender.username),
                }
            }
            PeerSignal::Candidate(candidate) => {
                if !self.config.relay_policy.allows(&candidate) {
                    trace!("Relay policy drops inbound candidate from {}", sender.username);
                    return;
                }
                match st.links.get(&sender.session_id) {
                    Some(entry) => {
                        if let Err(e) = entry.link.add_ice_candidate(&candidate) {
                            warn!("Candidate from {} rejected: {}", sender.username, e);
                        }
                    }
                    None => debug!("Candidate from {} without a link", sender.username),
                }
            }
            PeerSignal::Reconnect => {
                if !st.roster.contains(&sender.session_id) {
                    return;
                }
                info!("Rebuilding link to {} on request", sender.username);
                self.mark_connecting(st, &sender.session_id);
                self.open_link(st, pump, &sender.session_id);
            }
        }
    }

    /// Roster broadcast from the host. The first one tells us our seat and
    /// carries the version gate.
    fn on_join_success(
        &self,
        st: &mut Inner<C::Client, P::Link>,
        pump: &PumpSender,
        payload: &[u8],
        cleanups: &mut Vec<Cleanup<C::Client>>,
    ) {
        let roster: JoinSuccess = match protocol::decode(payload) {
            Ok(r) => r,
            Err(e) => {
                warn!("Bad roster broadcast: {}", e);
                return;
            }
        };

        let Some(my_session) = st.session_id.clone() else {
            return;
        };
        if st.is_host() {
            return;
        }

        if st.roster.is_empty() && roster.host_version != self.config.client_version {
            warn!(
                "Host runs version {}, we run {}",
                roster.host_version, self.config.client_version
            );
            self.emit(MatchEvent::Error(MatchError::ClientVersion));
            cleanups.push(reset_locked(st, false));
            return;
        }

        let added = st.roster.merge_records(&roster.players);
        if added.is_empty() {
            return;
        }

        if let Some(me) = st.roster.get_mut(&my_session) {
            me.status = PlayerStatus::Connected;
        }

        for player in added {
            let remote = player.session_id != my_session;
            self.emit(MatchEvent::PlayerJoined(player.clone()));
            if remote {
                self.open_link(st, pump, &player.session_id);
            }
        }

        if st.state == MatchState::Lobby {
            st.state = MatchState::Connecting;
        } else if st.state != MatchState::Playing {
            self.evaluate_readiness(st);
        }
    }

    fn on_join_denied(
        &self,
        st: &mut Inner<C::Client, P::Link>,
        payload: &[u8],
        cleanups: &mut Vec<Cleanup<C::Client>>,
    ) {
        let denied: JoinDenied = match protocol::decode(payload) {
            Ok(d) => d,
            Err(e) => {
                warn!("Bad join refusal: {}", e);
                return;
            }
        };
        if st.session_id.as_deref() != Some(denied.target.as_str()) {
            return;
        }
        warn!("Host refused us: {}", denied.reason);
        self.emit(MatchEvent::Error(MatchError::ClientJoin(denied.reason)));
        cleanups.push(reset_locked(st, false));
    }

    /// The pool matched us. The relay already seated everyone in a fresh
    /// room, so the roster comes straight from the announcement.
    fn on_matchmade(
        &self,
        st: &mut Inner<C::Client, P::Link>,
        pump: &PumpSender,
        room_id: String,
        users: Vec<UserPresence>,
        cleanups: &mut Vec<Cleanup<C::Client>>,
    ) {
        if st.mode != MatchMode::Matchmaker || st.state != MatchState::Matching {
            debug!("Ignoring a matchmaker result outside matchmaking");
            return;
        }
        let Some(my_session) = st.session_id.clone() else {
            return;
        };
        if !users.iter().any(|u| u.session_id == my_session) {
            self.emit(MatchEvent::Error(MatchError::Matchmaker(
                "matched without us in the member list".to_string(),
            )));
            cleanups.push(reset_locked(st, false));
            return;
        }

        st.ticket = None;
        st.match_id = Some(room_id.clone());
        st.roster = Roster::from_matchmade(&users);
        if let Some(me) = st.roster.get_mut(&my_session) {
            me.status = PlayerStatus::Connected;
        }

        info!("Matched into room {} with {} players", room_id, users.len());
        self.emit(MatchEvent::MatchmakerMatched {
            players: st.roster.players(),
        });

        st.state = MatchState::Connecting;
        for player in st.roster.players() {
            self.emit(MatchEvent::PlayerJoined(player.clone()));
            if player.session_id != my_session {
                self.open_link(st, pump, &player.session_id);
            }
        }
    }

    fn on_peer(
        &self,
        st: &mut Inner<C::Client, P::Link>,
        pump: &PumpSender,
        event: PeerEvent,
        out: &mut Vec<Outgoing<C::Client>>,
    ) {
        match event {
            PeerEvent::LocalDescription {
                session_id,
                attempt,
                desc,
            } => {
                if !link_current(st, &session_id, attempt) {
                    return;
                }
                self.relay_signal(st, &session_id, PeerSignal::Description(desc), out);
            }
            PeerEvent::LocalCandidate {
                session_id,
                attempt,
                candidate,
            } => {
                if !link_current(st, &session_id, attempt) {
                    return;
                }
                if !self.config.relay_policy.allows(&candidate) {
                    trace!("Relay policy drops outbound candidate for {}", session_id);
                    return;
                }
                self.relay_signal(st, &session_id, PeerSignal::Candidate(candidate), out);
            }
            PeerEvent::Connected {
                session_id,
                attempt,
            } => {
                if !link_current(st, &session_id, attempt) {
                    return;
                }
                if let Some(entry) = st.links.get_mut(&session_id) {
                    entry.connected = true;
                }
                if let Some(player) = st.roster.get_mut(&session_id) {
                    player.status = PlayerStatus::Connected;
                    let snapshot = player.clone();
                    info!("Peer {} connected", snapshot.username);
                    self.emit(MatchEvent::PlayerStatusChanged(snapshot));
                }
                if st.state != MatchState::Playing {
                    self.evaluate_readiness(st);
                }
            }
            PeerEvent::Disconnected {
                session_id,
                attempt,
            } => {
                if !link_current(st, &session_id, attempt) {
                    return;
                }
                self.on_link_lost(st, pump, &session_id, out);
            }
            PeerEvent::Message {
                session_id,
                payload,
            } => match st.roster.get(&session_id) {
                Some(player) => self.emit(MatchEvent::MessageReceived {
                    from: player.peer_id,
                    payload,
                }),
                None => debug!("Mesh payload from unknown session {}", session_id),
            },
        }
    }

    /// Transport loss on one link. The smaller session id rebuilds at once
    /// and asks the other side to follow; the larger side rebuilds when
    /// that request arrives. Exactly one reconnect request per loss.
    fn on_link_lost(
        &self,
        st: &mut Inner<C::Client, P::Link>,
        pump: &PumpSender,
        session_id: &str,
        out: &mut Vec<Outgoing<C::Client>>,
    ) {
        if !st.roster.contains(session_id) {
            // Already gone from the match; the link died with the player
            return;
        }
        if let Some(entry) = st.links.get_mut(session_id) {
            entry.connected = false;
        }
        warn!("Link to {} lost", session_id);
        self.mark_connecting(st, session_id);

        let initiates = st
            .session_id
            .as_deref()
            .map(|sid| sid < session_id)
            .unwrap_or(false);
        if initiates {
            self.relay_signal(st, session_id, PeerSignal::Reconnect, out);
            self.open_link(st, pump, session_id);
        }
    }

    /// Downgrade a player to Connecting and let readiness follow
    fn mark_connecting(&self, st: &mut Inner<C::Client, P::Link>, session_id: &str) {
        if let Some(player) = st.roster.get_mut(session_id) {
            if player.status != PlayerStatus::Connecting {
                player.status = PlayerStatus::Connecting;
                let snapshot = player.clone();
                self.emit(MatchEvent::PlayerStatusChanged(snapshot));
            }
        }
        if st.state != MatchState::Playing {
            self.evaluate_readiness(st);
        }
    }

    fn on_watchdog(
        &self,
        st: &mut Inner<C::Client, P::Link>,
        pump: &PumpSender,
        session_id: &str,
        attempt: u64,
        out: &mut Vec<Outgoing<C::Client>>,
    ) {
        let stalled = st
            .links
            .get(session_id)
            .map(|e| e.attempt == attempt && !e.connected)
            .unwrap_or(false);
        if !stalled {
            return;
        }
        warn!("Negotiation with {} timed out", session_id);
        self.on_link_lost(st, pump, session_id, out);
    }

    /// Queue a negotiation envelope for one room member
    fn relay_signal(
        &self,
        st: &Inner<C::Client, P::Link>,
        target: &str,
        signal: PeerSignal,
        out: &mut Vec<Outgoing<C::Client>>,
    ) {
        let (Some(client), Some(room)) = (st.signaling.clone(), st.match_id.clone()) else {
            return;
        };
        push_room(
            out,
            client,
            room,
            MatchOpCode::PeerSignal,
            &PeerEnvelope {
                target: target.to_string(),
                signal,
            },
        );
    }
}

/// Feed relay traffic into the pump, tagged with its connection epoch
async fn forward_signaling(
    epoch: u64,
    mut events: mpsc::Receiver<SignalingEvent>,
    pump: PumpSender,
) {
    while let Some(event) = events.recv().await {
        if pump.send(Pump::Signaling { epoch, event }).is_err() {
            break;
        }
    }
}

/// Feed peer link traffic into the pump, tagged with the match generation
async fn forward_peers(
    generation: u64,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
    pump: PumpSender,
) {
    while let Some(event) = events.recv().await {
        if pump.send(Pump::Peer { generation, event }).is_err() {
            break;
        }
    }
}

/// Single sequential processor for relay traffic, peer callbacks and
/// watchdog ticks. Everything that mutates match state funnels through
/// here in arrival order; queued sends and teardowns run after the lock
/// is released.
async fn pump<C: SignalingConnector, P: PeerConnector>(
    shared: Arc<Shared<C, P>>,
    pump_tx: PumpSender,
    mut rx: mpsc::UnboundedReceiver<Pump>,
) {
    while let Some(msg) = rx.recv().await {
        let mut out: Vec<Outgoing<C::Client>> = Vec::new();
        let mut cleanups: Vec<Cleanup<C::Client>> = Vec::new();

        {
            let mut st = shared.state.lock().await;
            match msg {
                Pump::Signaling { epoch, event } => {
                    if epoch == st.conn_epoch {
                        shared.on_signaling(&mut st, &pump_tx, event, &mut out, &mut cleanups);
                    } else {
                        trace!("Dropping relay event from a previous connection");
                    }
                }
                Pump::Peer { generation, event } => {
                    if generation == st.generation {
                        shared.on_peer(&mut st, &pump_tx, event, &mut out);
                    } else {
                        trace!("Dropping peer event from a previous match");
                    }
                }
                Pump::Watchdog {
                    generation,
                    session_id,
                    attempt,
                } => {
                    if generation == st.generation {
                        shared.on_watchdog(&mut st, &pump_tx, &session_id, attempt, &mut out);
                    }
                }
            }
        }

        for msg in out {
            if let Err(e) = msg
                .client
                .send_room_message(&msg.room, msg.op as i64, msg.payload)
                .await
            {
                warn!("Relay send failed: {}", e);
            }
        }
        for cleanup in cleanups {
            cleanup.run().await;
        }
    }
}
