//! Error types, one enum per client.

use agentchat_core::{FileRejection, MessageRejection, TokenParseError};

/// Failure reading or writing the persisted token.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Login failure. The stored token is never touched when one of these occurs.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The server answered with a non-success status.
    #[error("login rejected ({status}): {detail}")]
    Rejected { status: u16, detail: String },

    /// The request never produced a usable response.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Success status but no usable `access_token` in the body.
    #[error("login response did not contain a valid access token: {0}")]
    MissingToken(#[from] TokenParseError),

    #[error("could not persist token: {0}")]
    Store(#[from] CredentialError),
}

/// Failure of the duplex channel.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// `send` was called while the channel was not open.
    #[error("not connected")]
    NotConnected,

    /// Another `connect` is still opening the channel.
    #[error("a connection attempt is already in progress")]
    ConnectInProgress,

    /// `disconnect` (or a newer `connect`) ran while this attempt was opening.
    #[error("connection attempt was cancelled")]
    Aborted,

    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("timed out opening channel after {0:?}")]
    Timeout(std::time::Duration),

    #[error("invalid channel endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("could not encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failure of a single file upload.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// No bearer token is stored.
    #[error("no authentication token found")]
    Unauthenticated,

    /// Server refused the upload; `message` is its `detail` when present.
    #[error("{message}")]
    Rejected { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure fetching model configuration.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("no authentication token found")]
    Unauthenticated,

    #[error("failed to fetch models ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Failure loading client configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Failure surfaced by [`crate::ChatSession`].
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("no stored token and no credentials to log in with")]
    NoCredentials,

    #[error("no model configuration available")]
    NoModel,

    #[error(transparent)]
    InvalidMessage(#[from] MessageRejection),

    #[error(transparent)]
    InvalidFile(#[from] FileRejection),

    #[error("unknown attachment {0}")]
    UnknownAttachment(u64),

    #[error("attachment {0} is already uploading")]
    UploadInProgress(u64),

    #[error("attachment {0} is already uploaded")]
    AlreadyUploaded(u64),
}
