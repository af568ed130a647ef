//! Username/password login.

use std::sync::Arc;

use agentchat_core::BearerToken;
use serde::Deserialize;

use crate::config::ClientConfig;
use crate::credentials::CredentialStore;
use crate::error::AuthError;

const LOGIN_PATH: &str = "login/access-token";

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Exchanges credentials for a bearer token and keeps it in a
/// [`CredentialStore`].
#[derive(Clone)]
pub struct AuthClient {
    http: reqwest::Client,
    login_url: String,
    store: Arc<dyn CredentialStore>,
}

impl AuthClient {
    pub fn new(http: reqwest::Client, config: &ClientConfig, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            http,
            login_url: config.api_endpoint(LOGIN_PATH),
            store,
        }
    }

    /// Log in with the password grant and persist the returned token.
    ///
    /// On any failure the previously stored token is left as it was.
    #[tracing::instrument(skip(self, password))]
    pub async fn login(&self, username: &str, password: &str) -> Result<BearerToken, AuthError> {
        let form = [
            ("grant_type", "password"),
            ("username", username),
            ("password", password),
        ];
        let resp = self.http.post(&self.login_url).form(&form).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "login rejected");
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                detail,
            });
        }

        let data: TokenResponse = resp.json().await?;
        let token = BearerToken::new(data.access_token)?;
        self.store.save(token.as_str())?;
        tracing::info!("logged in");
        Ok(token)
    }

    /// The stored token, without any network I/O.
    pub fn get_token(&self) -> Option<BearerToken> {
        match self.store.load() {
            Ok(Some(raw)) => match BearerToken::new(raw) {
                Ok(token) => Some(token),
                Err(e) => {
                    tracing::warn!("ignoring stored token: {e}");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("failed to read stored token: {e}");
                None
            }
        }
    }

    /// Forget the stored token.
    pub fn logout(&self) -> Result<(), AuthError> {
        self.store.clear()?;
        tracing::info!("logged out");
        Ok(())
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }
}
