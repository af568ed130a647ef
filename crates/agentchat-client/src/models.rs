//! Model configuration lookup.

use std::sync::Arc;

use agentchat_core::BearerToken;
use serde::{Deserialize, Serialize};

use crate::config::ClientConfig;
use crate::credentials::CredentialStore;
use crate::error::ModelError;

const MODEL_CONFIGS_PATH: &str = "llm/model/configs";

/// One provider and the model configurations registered under it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProvider {
    pub provider: String,
    #[serde(default)]
    pub configs: Vec<ModelConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub name: String,
    pub model: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default)]
    pub max_last_messages: Option<u32>,
}

/// The `llm_name`/`provider` pair an outbound message needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub llm_name: String,
    pub provider: String,
    pub model: String,
}

/// First provider with at least one config, using its first config.
pub fn select_default(providers: &[ModelProvider]) -> Option<ModelSelection> {
    providers.iter().find_map(|p| {
        p.configs.first().map(|c| ModelSelection {
            llm_name: c.name.clone(),
            provider: p.provider.clone(),
            model: c.model.clone(),
        })
    })
}

#[derive(Clone)]
pub struct ModelClient {
    http: reqwest::Client,
    configs_url: String,
    store: Arc<dyn CredentialStore>,
}

impl ModelClient {
    pub fn new(http: reqwest::Client, config: &ClientConfig, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            http,
            configs_url: config.api_endpoint(MODEL_CONFIGS_PATH),
            store,
        }
    }

    pub async fn available_models(&self) -> Result<Vec<ModelProvider>, ModelError> {
        let token = self
            .store
            .load()
            .ok()
            .flatten()
            .and_then(|raw| BearerToken::new(raw).ok())
            .ok_or(ModelError::Unauthenticated)?;

        let resp = self
            .http
            .get(&self.configs_url)
            .header(reqwest::header::AUTHORIZATION, token.header_value())
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ModelError::Rejected {
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or("unknown error").to_string(),
            });
        }

        let providers: Vec<ModelProvider> = resp.json().await?;
        tracing::debug!(count = providers.len(), "fetched model providers");
        Ok(providers)
    }

    pub async fn default_model(&self) -> Result<Option<ModelSelection>, ModelError> {
        let providers = self.available_models().await?;
        let selected = select_default(&providers);
        if selected.is_none() {
            tracing::warn!("no model configurations found");
        }
        Ok(selected)
    }
}
