//! Payload definitions for the match channel and the peer mesh
//!
//! Two kinds of traffic share these records:
//! - Match channel: binary payloads relayed to every room member, tagged
//!   with an op-code (`MatchOpCode`). Connection negotiation and roster
//!   distribution travel here.
//! - Peer mesh: `SessionMessage` records sent over the reliable peer links
//!   once the mesh is up.
//!
//! All payloads are bincode-encoded.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

/// Op-codes for match channel messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i64)]
pub enum MatchOpCode {
    /// Relayed connection negotiation (descriptions, candidates, reconnects)
    PeerSignal = 9001,
    /// Host's roster broadcast after admitting a joiner
    JoinSuccess = 9002,
    /// Host's rejection of a joiner
    JoinError = 9003,
}

impl TryFrom<i64> for MatchOpCode {
    type Error = ();

    fn try_from(value: i64) -> Result<Self, ()> {
        match value {
            9001 => Ok(MatchOpCode::PeerSignal),
            9002 => Ok(MatchOpCode::JoinSuccess),
            9003 => Ok(MatchOpCode::JoinError),
            _ => Err(()),
        }
    }
}

/// Wire encode/decode failure
#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] bincode::Error),
}

/// Encode a record for the wire
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    Ok(bincode::serialize(value)?)
}

/// Decode a record from the wire
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    Ok(bincode::deserialize(bytes)?)
}

/// Which side of the negotiation a description belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A session description produced by one end of a peer link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

/// A transport candidate produced by one end of a peer link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub media: String,
    pub index: u32,
    pub candidate: String,
}

impl IceCandidate {
    /// Whether this candidate goes through a relay (TURN) server
    pub fn is_relay(&self) -> bool {
        self.candidate.contains("typ relay")
    }
}

/// Negotiation traffic for a single peer link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerSignal {
    Description(SessionDescription),
    Candidate(IceCandidate),
    /// Ask the target to tear down and renegotiate the link with the sender
    Reconnect,
}

/// A `PeerSignal` addressed to one room member
///
/// The relay fans room messages out to everyone; only the member whose
/// session id matches `target` acts on the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEnvelope {
    pub target: String,
    pub signal: PeerSignal,
}

/// One roster entry inside a `JoinSuccess` broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub session_id: String,
    pub username: String,
    pub peer_id: u32,
}

/// Full roster broadcast by the host after each admission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSuccess {
    pub players: Vec<PlayerRecord>,
    pub host_version: String,
}

/// Why the host refused a joiner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinRefusal {
    MatchHasAlreadyBegun,
    MatchIsFull,
}

impl std::fmt::Display for JoinRefusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinRefusal::MatchHasAlreadyBegun => write!(f, "the match has already begun"),
            JoinRefusal::MatchIsFull => write!(f, "the match is full"),
        }
    }
}

/// Host's rejection of one joiner, addressed by session id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinDenied {
    pub target: String,
    pub reason: JoinRefusal,
}

/// Authoritative end-of-round record, computed by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundResults {
    pub winner: u32,
    pub score: u32,
    pub is_match_over: bool,
}

/// One player's cumulative score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreEntry {
    pub peer_id: u32,
    pub score: u32,
}

/// Cumulative scores, replayed to players that joined between rounds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ScoreSync {
    pub entries: Vec<ScoreEntry>,
}

/// Traffic on the peer mesh once the match is connected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionMessage {
    /// Host tells everyone to move from the lobby into a round
    StartGame,
    /// A participant finished its per-round setup
    PlayerSetUp { peer_id: u32 },
    /// Host's end-of-round broadcast
    RoundResults(RoundResults),
    /// Host's score replay for a player that joined between rounds
    ScoreSync(ScoreSync),
    /// Application payload carried for the embedding game
    Game(Vec<u8>),
}
