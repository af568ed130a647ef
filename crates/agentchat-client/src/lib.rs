//! Client side of agentchat.
//!
//! [`ConnectionManager`] keeps the duplex channel to the agent backend open;
//! [`AuthClient`], [`UploadClient`] and [`ModelClient`] cover the HTTP
//! endpoints; [`ChatSession`] ties them together for a front-end.
//!
//! Nothing here is global. Build a [`CredentialStore`], hand it to the
//! clients that need it, and tear the connection down with
//! [`ConnectionManager::disconnect`].

mod attachments;
mod auth;
mod config;
mod connection;
mod credentials;
mod error;
mod models;
mod session;
mod upload;

pub use attachments::{AttachedFile, AttachmentSet, LocalId};
pub use auth::AuthClient;
pub use config::{API_URL_ENV, ClientConfig, DEFAULT_API_URL, DEFAULT_WS_URL, WS_URL_ENV};
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionOptions};
pub use credentials::{CredentialStore, FileCredentialStore, MemoryCredentialStore, TOKEN_KEY};
pub use error::{
    AuthError, ConfigError, ConnectionError, CredentialError, ModelError, SessionError, UploadError,
};
pub use models::{ModelClient, ModelConfig, ModelProvider, ModelSelection, select_default};
pub use session::{ChatSession, Credentials};
pub use upload::{UploadClient, UploadFile};

pub use agentchat_core as core;
