//! huddle - Peer-to-peer match and session coordination for small games
//!
//! This library connects 2-4 players into a fully meshed match: a relay
//! server handles discovery and signaling, peers negotiate direct links,
//! and a session layer runs rounds and scores on top of the mesh.

pub mod coordinator;
pub mod network;
pub mod protocol;
pub mod session;

pub use coordinator::{
    MatchConfig, MatchCoordinator, MatchError, MatchEvent, MatchMode, MatchState, RelayPolicy,
};
pub use session::{GameDriver, SessionCoordinator, SessionEvent, SessionRules};
