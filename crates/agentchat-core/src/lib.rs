//! Core types for agentchat.
//!
//! This crate holds the wire frames, the connection state machine and the
//! pure validation rules. Everything that touches the network lives in
//! `agentchat-client`; this crate provides the vocabulary.

mod message;
mod reconnect;
mod token;
mod upload;

pub use message::{InboundEvent, MessageRejection, OutboundMessage, validate_message};
pub use reconnect::ReconnectPolicy;
pub use token::{BearerToken, TokenParseError};
pub use upload::{FileRejection, UploadContext, UploadLimits, UploadedFile, format_file_size};

/// Longest chat message the front-end accepts, in characters.
pub const MAX_MESSAGE_LENGTH: usize = 1000;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No channel, and no retry scheduled.
    Disconnected,
    /// Opening a channel on behalf of an explicit `connect()`.
    Connecting,
    /// Channel open; sends are accepted.
    Connected,
    /// Channel dropped unexpectedly, or a first open failed with initial
    /// retries enabled; automatic retries are pending.
    Reconnecting,
}

impl ConnectionState {
    /// Whether the state machine has an edge from `self` to `next`.
    ///
    /// Self-loops are not edges; callers skip no-op transitions.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connecting, Reconnecting)
                | (Connected, Reconnecting)
                | (Connected, Disconnected)
                | (Reconnecting, Connected)
                | (Reconnecting, Connecting)
                | (Reconnecting, Disconnected)
        )
    }

    /// True only when outbound frames may be written.
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}
