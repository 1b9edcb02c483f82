//! Match lifecycle error taxonomy
//!
//! Every variant carries a user-presentable message. Signaling failures
//! during create/join/matchmake run a full leave before one of these is
//! surfaced, so the coordinator never sits half-initialized.

use thiserror::Error;

use crate::network::SignalingError;
use crate::protocol::JoinRefusal;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("Failed to create match: {0}")]
    MatchCreateFailed(#[source] SignalingError),

    #[error("Unable to join match: {0}")]
    JoinMatchFailed(#[source] SignalingError),

    #[error("Unable to start matchmaking: {0}")]
    StartMatchmakingFailed(#[source] SignalingError),

    #[error("Connection to the relay lost{}", fmt_detail(.0))]
    WebsocketConnection(Option<String>),

    /// The host left. No leader re-election, the match is over.
    #[error("Host has disconnected")]
    HostDisconnected,

    #[error("Matchmaker error: {0}")]
    Matchmaker(String),

    #[error("Client version doesn't match host version")]
    ClientVersion,

    /// The host turned us away at the door
    #[error("Unable to join match: {0}")]
    ClientJoin(JoinRefusal),

    #[error("Unable to begin connection negotiation with {session_id}: {detail}")]
    OfferFailed { session_id: String, detail: String },
}

fn fmt_detail(detail: &Option<String>) -> String {
    match detail {
        Some(msg) => format!(": {}", msg),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_refusal_message_is_user_readable() {
        let err = MatchError::ClientJoin(JoinRefusal::MatchIsFull);
        assert_eq!(err.to_string(), "Unable to join match: the match is full");
    }

    #[test]
    fn test_websocket_detail_formatting() {
        let bare = MatchError::WebsocketConnection(None);
        assert_eq!(bare.to_string(), "Connection to the relay lost");

        let detailed = MatchError::WebsocketConnection(Some("reset by peer".to_string()));
        assert_eq!(
            detailed.to_string(),
            "Connection to the relay lost: reset by peer"
        );
    }
}
