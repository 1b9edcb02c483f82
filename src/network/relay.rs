//! Relay server: rooms, presence fan-out and the matchmaking pool
//!
//! The relay never inspects match payloads. It assigns session ids, tracks
//! room membership, forwards op-coded room messages to everyone but the
//! sender, and groups compatible matchmaking tickets into fresh rooms.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::SignalingError;
use super::signaling::{ClientRequest, MatchmakerArgs, ServerPush, UserPresence};

/// Server-side cap on room size. The real seat limit is the host's business.
pub const MAX_ROOM_MEMBERS: usize = 16;

/// Length of a room join code
pub const ROOM_CODE_LEN: usize = 6;

// No 0/O/1/I so codes survive being read out loud
const ROOM_CODE_ALPHABET: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZ";

struct ClientHandle {
    presence: UserPresence,
    tx: mpsc::Sender<ServerPush>,
}

struct Room {
    id: String,
    members: HashMap<String, UserPresence>,
}

struct Ticket {
    id: String,
    session_id: String,
    args: MatchmakerArgs,
}

#[derive(Default)]
struct RelayState {
    clients: HashMap<String, ClientHandle>,
    rooms: HashMap<String, Room>,
    pool: Vec<Ticket>,
}

type SharedState = Arc<RwLock<RelayState>>;

/// A queued push for another client, dispatched after the state lock drops
type Dispatch = (mpsc::Sender<ServerPush>, ServerPush);

/// Relay server state
pub struct RelayServer {
    state: SharedState,
}

impl RelayServer {
    /// Create a new relay server
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(RelayState::default())),
        }
    }

    /// Serve plain WebSocket connections
    pub async fn run(&self, addr: &str) -> Result<(), SignalingError> {
        let listener = TcpListener::bind(addr).await?;
        info!("Relay listening on {}", addr);

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("New relay connection from {}", peer_addr);
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_socket(stream, state).await {
                            warn!("Connection error for {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }

    /// Serve TLS WebSocket connections
    pub async fn run_tls(&self, addr: &str, acceptor: TlsAcceptor) -> Result<(), SignalingError> {
        let listener = TcpListener::bind(addr).await?;
        info!("Relay listening on {} (TLS)", addr);

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("New relay connection from {}", peer_addr);
                    let acceptor = acceptor.clone();
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        let tls_stream = match acceptor.accept(stream).await {
                            Ok(s) => s,
                            Err(e) => {
                                warn!("TLS handshake failed for {}: {}", peer_addr, e);
                                return;
                            }
                        };
                        if let Err(e) = handle_socket(tls_stream, state).await {
                            warn!("Connection error for {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle a single client socket, plain or TLS
async fn handle_socket<S>(stream: S, state: SharedState) -> Result<(), SignalingError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ws_stream = accept_async(stream).await?;
    let (mut write, mut read) = ws_stream.split();

    // First message must introduce the client
    let username = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientRequest>(&text) {
                Ok(ClientRequest::Hello { username }) => break username,
                Ok(_) => {
                    let err = ServerPush::Error {
                        message: "Expected hello".to_string(),
                    };
                    let _ = write.send(Message::Text(serde_json::to_string(&err)?)).await;
                    return Ok(());
                }
                Err(e) => {
                    warn!("Invalid message during handshake: {}", e);
                    return Ok(());
                }
            },
            Some(Ok(Message::Close(_))) | None => return Ok(()),
            Some(Err(e)) => return Err(e.into()),
            _ => continue,
        }
    };

    let session_id = Uuid::new_v4().to_string();
    let presence = UserPresence {
        session_id: session_id.clone(),
        username,
    };

    let welcome = ServerPush::Welcome {
        session_id: session_id.clone(),
    };
    write.send(Message::Text(serde_json::to_string(&welcome)?)).await?;

    let (tx, mut rx) = mpsc::channel(100);
    state.write().await.clients.insert(
        session_id.clone(),
        ClientHandle {
            presence: presence.clone(),
            tx,
        },
    );
    info!("Session {} ({}) connected", session_id, presence.username);

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientRequest>(&text) {
                            Ok(req) => {
                                let (reply, outgoing) =
                                    process_request(req, &presence, &state).await;

                                if let Some(resp) = reply {
                                    let json = serde_json::to_string(&resp)?;
                                    if write.send(Message::Text(json)).await.is_err() {
                                        break;
                                    }
                                }
                                for (peer_tx, push) in outgoing {
                                    let _ = peer_tx.send(push).await;
                                }
                            }
                            Err(e) => {
                                warn!("Invalid message from {}: {}", session_id, e);
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {}", session_id, e);
                        break;
                    }
                    _ => {}
                }
            }

            push = rx.recv() => {
                match push {
                    Some(push) => {
                        let json = serde_json::to_string(&push)?;
                        if write.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    let outgoing = cleanup_client(&session_id, &state).await;
    for (peer_tx, push) in outgoing {
        let _ = peer_tx.send(push).await;
    }
    info!("Session {} disconnected", session_id);

    Ok(())
}

/// Apply one request to the shared state.
///
/// Returns the direct answer for the requesting client plus any pushes for
/// other clients; the caller dispatches those once the lock is released.
async fn process_request(
    req: ClientRequest,
    presence: &UserPresence,
    state: &SharedState,
) -> (Option<ServerPush>, Vec<Dispatch>) {
    let session_id = &presence.session_id;
    let mut outgoing: Vec<Dispatch> = Vec::new();

    let mut guard = state.write().await;
    let st = &mut *guard;

    let reply = match req {
        ClientRequest::Hello { .. } => Some(ServerPush::Error {
            message: "Already introduced".to_string(),
        }),

        ClientRequest::CreateRoom => {
            let room_id = unused_room_code(&st.rooms);
            let mut members = HashMap::new();
            members.insert(session_id.clone(), presence.clone());
            st.rooms.insert(
                room_id.clone(),
                Room {
                    id: room_id.clone(),
                    members,
                },
            );

            info!("Room {} created by {}", room_id, session_id);
            Some(ServerPush::RoomCreated { room_id })
        }

        ClientRequest::JoinRoom { room_id } => match st.rooms.get_mut(&room_id) {
            Some(room) => {
                if room.members.len() >= MAX_ROOM_MEMBERS {
                    Some(ServerPush::Error {
                        message: "Room is full".to_string(),
                    })
                } else if room.members.contains_key(session_id) {
                    Some(ServerPush::Error {
                        message: "Already in room".to_string(),
                    })
                } else {
                    room.members.insert(session_id.clone(), presence.clone());

                    let push = ServerPush::Presence {
                        room_id: room_id.clone(),
                        joins: vec![presence.clone()],
                        leaves: vec![],
                    };
                    queue_for_others(st, &room_id, session_id, push, &mut outgoing);

                    info!("Session {} joined room {}", session_id, room_id);
                    Some(ServerPush::RoomJoined { room_id })
                }
            }
            None => Some(ServerPush::Error {
                message: "Room not found".to_string(),
            }),
        },

        ClientRequest::LeaveRoom { room_id } => {
            remove_from_room(st, &room_id, presence, &mut outgoing);
            Some(ServerPush::RoomLeft { room_id })
        }

        ClientRequest::RoomMessage {
            room_id,
            op_code,
            payload,
        } => {
            let is_member = st
                .rooms
                .get(&room_id)
                .is_some_and(|room| room.members.contains_key(session_id));

            if is_member {
                let push = ServerPush::RoomMessage {
                    room_id: room_id.clone(),
                    op_code,
                    payload,
                    sender: presence.clone(),
                };
                queue_for_others(st, &room_id, session_id, push, &mut outgoing);
            } else {
                warn!(
                    "Dropping room message from {} to {} (not a member)",
                    session_id, room_id
                );
            }
            None
        }

        ClientRequest::AddMatchmaker(args) => {
            let ticket = Uuid::new_v4().to_string();
            st.pool.push(Ticket {
                id: ticket.clone(),
                session_id: session_id.clone(),
                args,
            });
            debug!("Session {} pooled with ticket {}", session_id, ticket);

            while let Some(group) = select_group(&st.pool) {
                form_match(st, group, &mut outgoing);
            }

            Some(ServerPush::MatchmakerTicket { ticket })
        }

        ClientRequest::RemoveMatchmaker { ticket } => {
            st.pool
                .retain(|t| !(t.id == ticket && t.session_id == *session_id));
            Some(ServerPush::MatchmakerRemoved { ticket })
        }
    };

    drop(guard);
    (reply, outgoing)
}

/// Queue a push for every room member except `sender`
fn queue_for_others(
    st: &RelayState,
    room_id: &str,
    sender: &str,
    push: ServerPush,
    outgoing: &mut Vec<Dispatch>,
) {
    let Some(room) = st.rooms.get(room_id) else {
        return;
    };
    for member_id in room.members.keys() {
        if member_id == sender {
            continue;
        }
        if let Some(client) = st.clients.get(member_id) {
            outgoing.push((client.tx.clone(), push.clone()));
        }
    }
}

/// Drop a member from a room, announcing the leave and removing empty rooms
fn remove_from_room(
    st: &mut RelayState,
    room_id: &str,
    presence: &UserPresence,
    outgoing: &mut Vec<Dispatch>,
) {
    let Some(room) = st.rooms.get_mut(room_id) else {
        return;
    };
    if room.members.remove(&presence.session_id).is_none() {
        return;
    }

    let push = ServerPush::Presence {
        room_id: room_id.to_string(),
        joins: vec![],
        leaves: vec![presence.clone()],
    };
    queue_for_others(st, room_id, &presence.session_id, push, outgoing);

    if st.rooms.get(room_id).is_some_and(|r| r.members.is_empty()) {
        st.rooms.remove(room_id);
        info!("Room {} removed (empty)", room_id);
    }
}

/// Turn a selected ticket group into a room and notify every member
fn form_match(st: &mut RelayState, group: Vec<usize>, outgoing: &mut Vec<Dispatch>) {
    let mut chosen: Vec<Ticket> = Vec::with_capacity(group.len());
    for index in group.into_iter().rev() {
        chosen.push(st.pool.remove(index));
    }
    chosen.reverse();

    let room_id = unused_room_code(&st.rooms);
    let mut members = HashMap::new();
    let mut users = Vec::new();
    for ticket in &chosen {
        if let Some(client) = st.clients.get(&ticket.session_id) {
            members.insert(ticket.session_id.clone(), client.presence.clone());
            users.push(client.presence.clone());
        }
    }

    if users.len() < 2 {
        // Matched clients vanished in the meantime, forget the group
        warn!("Matched group collapsed before room {} formed", room_id);
        return;
    }

    st.rooms.insert(
        room_id.clone(),
        Room {
            id: room_id.clone(),
            members,
        },
    );
    info!("Matched {} sessions into room {}", users.len(), room_id);

    for ticket in &chosen {
        if let Some(client) = st.clients.get(&ticket.session_id) {
            outgoing.push((
                client.tx.clone(),
                ServerPush::MatchmakerMatched {
                    room_id: room_id.clone(),
                    users: users.clone(),
                },
            ));
        }
    }
}

/// Remove a disconnected client everywhere it is referenced
async fn cleanup_client(session_id: &str, state: &SharedState) -> Vec<Dispatch> {
    let mut outgoing = Vec::new();
    let mut guard = state.write().await;
    let st = &mut *guard;

    let Some(client) = st.clients.remove(session_id) else {
        return outgoing;
    };
    st.pool.retain(|t| t.session_id != *session_id);

    let room_ids: Vec<String> = st
        .rooms
        .values()
        .filter(|room| room.members.contains_key(session_id))
        .map(|room| room.id.clone())
        .collect();
    for room_id in room_ids {
        remove_from_room(st, &room_id, &client.presence, &mut outgoing);
    }

    outgoing
}

/// Pick a room code no live room is using
fn unused_room_code(rooms: &HashMap<String, Room>) -> String {
    loop {
        let code = generate_room_code();
        if !rooms.contains_key(&code) {
            return code;
        }
    }
}

/// Generate a short join code
fn generate_room_code() -> String {
    let mut rng = rand::thread_rng();
    (0..ROOM_CODE_LEN)
        .map(|_| {
            let i = rng.gen_range(0..ROOM_CODE_ALPHABET.len());
            ROOM_CODE_ALPHABET[i] as char
        })
        .collect()
}

/// Find the first ticket group that can form a match.
///
/// A group holds tickets whose queries are all mutually satisfied. It forms
/// once it reaches every kept member's `min_count`, capped by the smallest
/// `max_count` and trimmed to the seed's `count_multiple`. Returns pool
/// indices in insertion order.
fn select_group(pool: &[Ticket]) -> Option<Vec<usize>> {
    for seed in 0..pool.len() {
        let mut group = vec![seed];
        for other in 0..pool.len() {
            if other == seed {
                continue;
            }
            let fits = group.iter().all(|&member| {
                mutually_compatible(&pool[member].args, &pool[other].args)
            });
            if fits {
                group.push(other);
            }
        }
        group.sort_unstable();

        let eff_max = group
            .iter()
            .map(|&i| pool[i].args.max_count as usize)
            .min()
            .unwrap_or(0);
        let mut size = group.len().min(eff_max);
        if let Some(multiple) = pool[seed].args.count_multiple {
            if multiple > 0 {
                size -= size % multiple as usize;
            }
        }
        if size < 2 {
            continue;
        }

        let kept = &group[..size];
        let eff_min = kept
            .iter()
            .map(|&i| pool[i].args.min_count as usize)
            .max()
            .unwrap_or(usize::MAX);
        if size >= eff_min {
            return Some(kept.to_vec());
        }
    }
    None
}

fn mutually_compatible(a: &MatchmakerArgs, b: &MatchmakerArgs) -> bool {
    query_satisfied(&a.query, b) && query_satisfied(&b.query, a)
}

/// Check a `+key:value` term list against a ticket's properties.
///
/// `*` matches anything. Terms without a `+` prefix are advisory and do not
/// gate the match. Keys may carry a `properties.` prefix.
fn query_satisfied(query: &str, candidate: &MatchmakerArgs) -> bool {
    let query = query.trim();
    if query.is_empty() || query == "*" {
        return true;
    }

    for term in query.split_whitespace() {
        let Some(required) = term.strip_prefix('+') else {
            continue;
        };
        let Some((key, value)) = required.split_once(':') else {
            warn!("Malformed matchmaker term: {}", term);
            return false;
        };
        let key = key.strip_prefix("properties.").unwrap_or(key);

        let string_hit = candidate.string_properties.get(key) == Some(&value.to_string());
        let numeric_hit = match (candidate.numeric_properties.get(key), value.parse::<f64>()) {
            (Some(have), Ok(want)) => *have == want,
            _ => false,
        };
        if !string_hit && !numeric_hit {
            return false;
        }
    }
    true
}
