//! Relay link: control protocol, client seam and WebSocket implementation
//!
//! The relay is the discovery and negotiation backbone. Clients hold one
//! WebSocket to it, identified by a server-assigned session id, and use it
//! to create/join rooms, exchange op-coded room messages and enter the
//! matchmaking pool. Everything above this module talks through the
//! [`Signaling`] trait so tests and alternative backends can swap the
//! transport out.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::error::SignalingError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// A room member as the relay sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPresence {
    pub session_id: String,
    pub username: String,
}

/// Matchmaking ticket parameters
///
/// `query` is a space-separated list of `+key:value` terms that every other
/// member of a prospective group must satisfy through its own properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchmakerArgs {
    pub query: String,
    pub min_count: u32,
    pub max_count: u32,
    pub string_properties: HashMap<String, String>,
    pub numeric_properties: HashMap<String, f64>,
    pub count_multiple: Option<u32>,
}

impl Default for MatchmakerArgs {
    fn default() -> Self {
        Self {
            query: "*".to_string(),
            min_count: 2,
            max_count: 8,
            string_properties: HashMap::new(),
            numeric_properties: HashMap::new(),
            count_multiple: None,
        }
    }
}

/// Client -> relay requests
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientRequest {
    Hello { username: String },
    CreateRoom,
    JoinRoom { room_id: String },
    LeaveRoom { room_id: String },
    RoomMessage { room_id: String, op_code: i64, payload: Vec<u8> },
    AddMatchmaker(MatchmakerArgs),
    RemoveMatchmaker { ticket: String },
}

/// Relay -> client messages
///
/// `Welcome`, `RoomCreated`, `RoomJoined`, `RoomLeft`, `MatchmakerTicket`,
/// `MatchmakerRemoved` and `Error` answer requests in arrival order; the
/// rest are pushes and may interleave.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerPush {
    Welcome { session_id: String },
    RoomCreated { room_id: String },
    RoomJoined { room_id: String },
    RoomLeft { room_id: String },
    Presence { room_id: String, joins: Vec<UserPresence>, leaves: Vec<UserPresence> },
    RoomMessage { room_id: String, op_code: i64, payload: Vec<u8>, sender: UserPresence },
    MatchmakerTicket { ticket: String },
    MatchmakerRemoved { ticket: String },
    MatchmakerMatched { room_id: String, users: Vec<UserPresence> },
    Error { message: String },
}

/// Asynchronous traffic from the relay, drained by the match coordinator
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    RoomMessage {
        op_code: i64,
        payload: Vec<u8>,
        sender: UserPresence,
    },
    Presence {
        joins: Vec<UserPresence>,
        leaves: Vec<UserPresence>,
    },
    MatchmakerMatched {
        room_id: String,
        users: Vec<UserPresence>,
    },
    /// The relay link is gone. `error` is `None` on a clean close.
    Closed { error: Option<String> },
}

/// Operations against the relay
#[async_trait]
pub trait Signaling: Send + Sync + 'static {
    /// Session id the relay assigned to this client
    fn session_id(&self) -> &str;

    /// Display name this client introduced itself with
    fn username(&self) -> &str;

    /// Create a new room and return its join code
    async fn create_room(&self) -> Result<String, SignalingError>;

    async fn join_room(&self, room_id: &str) -> Result<(), SignalingError>;

    async fn leave_room(&self, room_id: &str) -> Result<(), SignalingError>;

    /// Fan a binary payload out to the other room members
    async fn send_room_message(
        &self,
        room_id: &str,
        op_code: i64,
        payload: Vec<u8>,
    ) -> Result<(), SignalingError>;

    /// Enter the matchmaking pool and return the ticket id
    async fn add_matchmaker(&self, args: MatchmakerArgs) -> Result<String, SignalingError>;

    async fn remove_matchmaker(&self, ticket: &str) -> Result<(), SignalingError>;

    /// Close the relay link
    async fn close(&self) -> Result<(), SignalingError>;
}

/// Factory for relay links, one per match lifetime
#[async_trait]
pub trait SignalingConnector: Send + Sync + 'static {
    type Client: Signaling;

    async fn connect(
        &self,
    ) -> Result<(Self::Client, mpsc::Receiver<SignalingEvent>), SignalingError>;
}

/// Connects [`WsSignaling`] clients to a relay URL
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    username: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: username.into(),
        }
    }
}

#[async_trait]
impl SignalingConnector for WsConnector {
    type Client = WsSignaling;

    async fn connect(
        &self,
    ) -> Result<(WsSignaling, mpsc::Receiver<SignalingEvent>), SignalingError> {
        WsSignaling::connect(&self.url, &self.username).await
    }
}

/// Successful answers the socket task hands back to waiting requests
#[derive(Debug)]
enum Ack {
    RoomCreated(String),
    RoomJoined(String),
    RoomLeft(String),
    Ticket(String),
    MatchmakerRemoved,
}

enum Command {
    Request {
        req: ClientRequest,
        ack: oneshot::Sender<Result<Ack, SignalingError>>,
    },
    /// Fire-and-forget, no answer expected
    Fire { req: ClientRequest },
    Close,
}

/// WebSocket implementation of [`Signaling`]
///
/// One background task owns the socket. Requests queue acks in FIFO order,
/// matching the relay's in-order answering; pushes flow to the event channel
/// handed out by [`WsSignaling::connect`].
pub struct WsSignaling {
    session_id: String,
    username: String,
    cmd_tx: mpsc::Sender<Command>,
}

impl WsSignaling {
    /// Connect, introduce ourselves and wait for the assigned session id
    pub async fn connect(
        url: &str,
        username: &str,
    ) -> Result<(Self, mpsc::Receiver<SignalingEvent>), SignalingError> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let hello = serde_json::to_string(&ClientRequest::Hello {
            username: username.to_string(),
        })?;
        write.send(Message::Text(hello)).await?;

        let session_id = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerPush>(&text)? {
                    ServerPush::Welcome { session_id } => break session_id,
                    ServerPush::Error { message } => {
                        return Err(SignalingError::Handshake(message))
                    }
                    other => {
                        return Err(SignalingError::Handshake(format!(
                            "expected welcome, got {:?}",
                            other
                        )))
                    }
                },
                Some(Ok(Message::Close(_))) | None => return Err(SignalingError::ConnectionClosed),
                Some(Err(e)) => return Err(e.into()),
                _ => continue,
            }
        };

        debug!("Relay link up, session {}", session_id);

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(100);
        tokio::spawn(socket_task(write, read, cmd_rx, event_tx));

        Ok((
            Self {
                session_id,
                username: username.to_string(),
                cmd_tx,
            },
            event_rx,
        ))
    }

    async fn request(&self, req: ClientRequest) -> Result<Ack, SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Request { req, ack: tx })
            .await
            .map_err(|_| SignalingError::ConnectionClosed)?;
        rx.await.map_err(|_| SignalingError::ConnectionClosed)?
    }
}

#[async_trait]
impl Signaling for WsSignaling {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn username(&self) -> &str {
        &self.username
    }

    async fn create_room(&self) -> Result<String, SignalingError> {
        match self.request(ClientRequest::CreateRoom).await? {
            Ack::RoomCreated(room_id) => Ok(room_id),
            other => Err(SignalingError::Protocol(format!(
                "unexpected answer to create: {:?}",
                other
            ))),
        }
    }

    async fn join_room(&self, room_id: &str) -> Result<(), SignalingError> {
        match self
            .request(ClientRequest::JoinRoom {
                room_id: room_id.to_string(),
            })
            .await?
        {
            Ack::RoomJoined(_) => Ok(()),
            other => Err(SignalingError::Protocol(format!(
                "unexpected answer to join: {:?}",
                other
            ))),
        }
    }

    async fn leave_room(&self, room_id: &str) -> Result<(), SignalingError> {
        match self
            .request(ClientRequest::LeaveRoom {
                room_id: room_id.to_string(),
            })
            .await?
        {
            Ack::RoomLeft(_) => Ok(()),
            other => Err(SignalingError::Protocol(format!(
                "unexpected answer to leave: {:?}",
                other
            ))),
        }
    }

    async fn send_room_message(
        &self,
        room_id: &str,
        op_code: i64,
        payload: Vec<u8>,
    ) -> Result<(), SignalingError> {
        self.cmd_tx
            .send(Command::Fire {
                req: ClientRequest::RoomMessage {
                    room_id: room_id.to_string(),
                    op_code,
                    payload,
                },
            })
            .await
            .map_err(|_| SignalingError::ConnectionClosed)
    }

    async fn add_matchmaker(&self, args: MatchmakerArgs) -> Result<String, SignalingError> {
        match self.request(ClientRequest::AddMatchmaker(args)).await? {
            Ack::Ticket(ticket) => Ok(ticket),
            other => Err(SignalingError::Protocol(format!(
                "unexpected answer to matchmaker add: {:?}",
                other
            ))),
        }
    }

    async fn remove_matchmaker(&self, ticket: &str) -> Result<(), SignalingError> {
        match self
            .request(ClientRequest::RemoveMatchmaker {
                ticket: ticket.to_string(),
            })
            .await?
        {
            Ack::MatchmakerRemoved => Ok(()),
            other => Err(SignalingError::Protocol(format!(
                "unexpected answer to matchmaker remove: {:?}",
                other
            ))),
        }
    }

    async fn close(&self) -> Result<(), SignalingError> {
        // Closing twice is fine, the task may already be gone
        let _ = self.cmd_tx.send(Command::Close).await;
        Ok(())
    }
}

/// Background socket loop: serializes requests, pairs answers with waiting
/// acks in FIFO order, forwards pushes to the event channel
async fn socket_task(
    mut write: WsSink,
    mut read: WsSource,
    mut cmd_rx: mpsc::Receiver<Command>,
    events: mpsc::Sender<SignalingEvent>,
) {
    let mut pending: VecDeque<oneshot::Sender<Result<Ack, SignalingError>>> = VecDeque::new();
    let mut close_error: Option<String> = None;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Request { req, ack }) => {
                        let json = match serde_json::to_string(&req) {
                            Ok(json) => json,
                            Err(e) => {
                                let _ = ack.send(Err(e.into()));
                                continue;
                            }
                        };
                        if write.send(Message::Text(json)).await.is_err() {
                            let _ = ack.send(Err(SignalingError::ConnectionClosed));
                            break;
                        }
                        pending.push_back(ack);
                    }
                    Some(Command::Fire { req }) => {
                        let json = match serde_json::to_string(&req) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!("Dropping unserializable request: {}", e);
                                continue;
                            }
                        };
                        if write.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Some(Command::Close) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerPush>(&text) {
                            Ok(push) => {
                                if !handle_push(push, &mut pending, &events).await {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("Invalid relay message: {}", e);
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break;
                    }
                    Some(Err(e)) => {
                        close_error = Some(e.to_string());
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    for ack in pending {
        let _ = ack.send(Err(SignalingError::ConnectionClosed));
    }
    let _ = events
        .send(SignalingEvent::Closed { error: close_error })
        .await;
}

/// Route one relay message. Returns false when the event receiver is gone.
async fn handle_push(
    push: ServerPush,
    pending: &mut VecDeque<oneshot::Sender<Result<Ack, SignalingError>>>,
    events: &mpsc::Sender<SignalingEvent>,
) -> bool {
    let mut answer = |result: Result<Ack, SignalingError>| match pending.pop_front() {
        Some(ack) => {
            let _ = ack.send(result);
        }
        None => warn!("Relay answered with nothing pending: {:?}", result),
    };

    match push {
        ServerPush::RoomCreated { room_id } => answer(Ok(Ack::RoomCreated(room_id))),
        ServerPush::RoomJoined { room_id } => answer(Ok(Ack::RoomJoined(room_id))),
        ServerPush::RoomLeft { room_id } => answer(Ok(Ack::RoomLeft(room_id))),
        ServerPush::MatchmakerTicket { ticket } => answer(Ok(Ack::Ticket(ticket))),
        ServerPush::MatchmakerRemoved { .. } => answer(Ok(Ack::MatchmakerRemoved)),
        ServerPush::Error { message } => answer(Err(SignalingError::Rejected(message))),
        ServerPush::Welcome { .. } => warn!("Unexpected welcome after handshake"),
        ServerPush::Presence { joins, leaves, .. } => {
            return events
                .send(SignalingEvent::Presence { joins, leaves })
                .await
                .is_ok();
        }
        ServerPush::RoomMessage {
            op_code,
            payload,
            sender,
            ..
        } => {
            return events
                .send(SignalingEvent::RoomMessage {
                    op_code,
                    payload,
                    sender,
                })
                .await
                .is_ok();
        }
        ServerPush::MatchmakerMatched { room_id, users } => {
            return events
                .send(SignalingEvent::MatchmakerMatched { room_id, users })
                .await
                .is_ok();
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialize() {
        let msg = ClientRequest::JoinRoom {
            room_id: "ABC123".to_string(),
        };

        let json = serde_json::to_string(&msg).unwrap();
        let parsed: ClientRequest = serde_json::from_str(&json).unwrap();

        match parsed {
            ClientRequest::JoinRoom { room_id } => assert_eq!(room_id, "ABC123"),
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_push_tag_format() {
        let msg = ServerPush::Welcome {
            session_id: "s-1".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();

        assert!(json.contains("\"type\":\"Welcome\""));
        assert!(json.contains("\"session_id\":\"s-1\""));
    }

    #[test]
    fn test_matchmaker_args_defaults() {
        let args = MatchmakerArgs::default();

        assert_eq!(args.query, "*");
        assert_eq!(args.min_count, 2);
        assert_eq!(args.max_count, 8);
        assert!(args.string_properties.is_empty());
        assert!(args.count_multiple.is_none());
    }
}
