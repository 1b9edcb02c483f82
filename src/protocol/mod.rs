//! Wire protocol definitions
//!
//! Defines the binary payloads exchanged over the match channel and the
//! peer mesh.

mod message;

pub use message::{
    decode, encode, IceCandidate, JoinDenied, JoinRefusal, JoinSuccess, MatchOpCode, PeerEnvelope,
    PeerSignal, PlayerRecord, RoundResults, ScoreEntry, ScoreSync, SdpKind, SessionDescription,
    SessionMessage, WireError,
};
