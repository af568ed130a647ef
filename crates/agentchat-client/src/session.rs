//! Session coordinator.
//!
//! Wires the clients together for one chat session: obtain a token, open the
//! channel, pick a model, then turn front-end actions into channel calls.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use agentchat_core::{
    BearerToken, InboundEvent, MAX_MESSAGE_LENGTH, OutboundMessage, UploadContext, UploadedFile,
    validate_message,
};

use crate::attachments::{AttachmentSet, LocalId};
use crate::auth::AuthClient;
use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, ConnectionOptions};
use crate::credentials::CredentialStore;
use crate::error::SessionError;
use crate::models::{ModelClient, ModelSelection};
use crate::upload::{UploadClient, UploadFile};

/// Username and password for the password grant.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

/// One authenticated chat session.
pub struct ChatSession {
    config: ClientConfig,
    auth: AuthClient,
    uploads: UploadClient,
    models: ModelClient,
    connection: ConnectionManager,
    session_id: String,
    model: Option<ModelSelection>,
}

impl ChatSession {
    /// Authenticate, connect and pick the default model.
    ///
    /// A stored token is reused; otherwise `credentials` are required. A
    /// failed model lookup is logged and leaves the session without a model.
    pub async fn start(
        config: ClientConfig,
        store: Arc<dyn CredentialStore>,
        credentials: Option<&Credentials>,
    ) -> Result<Self, SessionError> {
        let http = reqwest::Client::new();
        let auth = AuthClient::new(http.clone(), &config, Arc::clone(&store));
        let uploads = UploadClient::new(http.clone(), &config, Arc::clone(&store));
        let models = ModelClient::new(http, &config, store);

        let token = match (auth.get_token(), credentials) {
            (Some(token), _) => token,
            (None, Some(creds)) => auth.login(&creds.username, &creds.password).await?,
            (None, None) => return Err(SessionError::NoCredentials),
        };

        let mut session = Self::with_clients(config, auth, uploads, models, token);
        if let Err(e) = session.connection.connect().await {
            // Stop any background retry; the caller never gets the session.
            session.connection.disconnect();
            return Err(e.into());
        }

        match session.models.default_model().await {
            Ok(model) => session.model = model,
            Err(e) => tracing::warn!("failed to fetch model configuration: {e}"),
        }
        Ok(session)
    }

    /// Assemble a session from prepared clients without connecting.
    pub fn with_clients(
        config: ClientConfig,
        auth: AuthClient,
        uploads: UploadClient,
        models: ModelClient,
        token: BearerToken,
    ) -> Self {
        let options = ConnectionOptions::from_config(&config).with_token(token);
        let session_id = format!("session_{}", unix_millis());
        tracing::debug!(%session_id, "session created");
        Self {
            config,
            auth,
            uploads,
            models,
            connection: ConnectionManager::new(options),
            session_id,
            model: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn model(&self) -> Option<&ModelSelection> {
        self.model.as_ref()
    }

    pub fn set_model(&mut self, model: ModelSelection) {
        self.model = Some(model);
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Route inbound frames to `handler`.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(InboundEvent) + Send + Sync + 'static,
    {
        self.connection.on_message(handler);
    }

    /// Check a file against the upload limits and add it to `set`.
    pub fn attach<P>(
        &self,
        set: &mut AttachmentSet<P>,
        file: UploadFile,
        preview: Option<P>,
    ) -> Result<LocalId, SessionError> {
        self.config.upload.check_count(set.len())?;
        file.check(&self.config.upload)?;
        Ok(set.add(file, preview))
    }

    /// Upload one attachment, recording the outcome on the entry.
    ///
    /// Errors are kept on the entry for a later retry as well as returned.
    pub async fn upload<P>(
        &self,
        set: &mut AttachmentSet<P>,
        id: LocalId,
    ) -> Result<UploadedFile, SessionError> {
        match set.get(id) {
            None => return Err(SessionError::UnknownAttachment(id)),
            Some(entry) if entry.uploading => return Err(SessionError::UploadInProgress(id)),
            Some(entry) if entry.uploaded.is_some() => {
                return Err(SessionError::AlreadyUploaded(id));
            }
            Some(_) => {}
        }
        let file = set.begin_upload(id).ok_or(SessionError::UnknownAttachment(id))?;
        let context = UploadContext::new(format!("request_{}", unix_millis()), &self.session_id);
        let outcome = self.uploads.upload_file(&file, Some(&context)).await;
        set.finish_upload(id, &outcome);
        Ok(outcome?)
    }

    /// Send a chat turn with every resolved attachment.
    ///
    /// Resolved attachments are removed only after the frame was queued.
    pub fn send_message<P>(
        &self,
        text: &str,
        set: &mut AttachmentSet<P>,
    ) -> Result<OutboundMessage, SessionError> {
        validate_message(text, MAX_MESSAGE_LENGTH)?;
        let model = self.model.as_ref().ok_or(SessionError::NoModel)?;
        let message = OutboundMessage::new(text, &model.llm_name, &model.provider)
            .with_files(set.ready_ids());
        self.connection.send(&message)?;
        let sent = set.take_sent();
        tracing::debug!(files = sent.len(), "message sent");
        Ok(message)
    }

    /// Close the channel and forget the token.
    pub fn logout(&self) -> Result<(), SessionError> {
        self.connection.disconnect();
        self.auth.logout()?;
        Ok(())
    }

    /// Close the channel; the stored token is kept.
    pub fn shutdown(&self) {
        self.connection.disconnect();
    }
}
