//! Network module for match discovery and peer links
//!
//! Handles the relay link (WebSocket signaling, rooms, matchmaking) and the
//! peer transport seam the coordinator drives.

mod error;
mod peer;
mod relay;
mod signaling;

pub use error::{PeerError, SignalingError};
pub use peer::{
    LoopbackLink, LoopbackNet, PeerConnector, PeerEvent, PeerEventSender, PeerLink,
};
pub use relay::{RelayServer, MAX_ROOM_MEMBERS, ROOM_CODE_LEN};
pub use signaling::{
    ClientRequest, MatchmakerArgs, ServerPush, Signaling, SignalingConnector, SignalingEvent,
    UserPresence, WsConnector, WsSignaling,
};
