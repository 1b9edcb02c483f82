//! Network error types

use thiserror::Error;

/// Errors that can occur on the relay link
#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Relay rejected request: {0}")]
    Rejected(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur on a peer link
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Link closed")]
    LinkClosed,

    #[error("No such peer: {0}")]
    UnknownPeer(String),

    #[error("Negotiation out of order: {0}")]
    Negotiation(String),
}
