//! File uploads.

use std::path::Path;
use std::sync::Arc;

use agentchat_core::{BearerToken, FileRejection, UploadContext, UploadLimits, UploadedFile};
use futures_util::future::join_all;
use reqwest::multipart::{Form, Part};

use crate::config::ClientConfig;
use crate::credentials::CredentialStore;
use crate::error::UploadError;

const UPLOAD_PATH: &str = "files/upload";

/// A file selected for upload, held in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub name: String,
    pub mimetype: String,
    pub bytes: Vec<u8>,
}

impl UploadFile {
    pub fn new(name: impl Into<String>, mimetype: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mimetype: mimetype.into(),
            bytes,
        }
    }

    /// Read a file from disk, guessing its MIME type from the extension.
    pub async fn from_path(path: &Path) -> Result<Self, UploadError> {
        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let mimetype = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        Ok(Self::new(name, mimetype, bytes))
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Apply the advisory size/type gates.
    pub fn check(&self, limits: &UploadLimits) -> Result<(), FileRejection> {
        limits.check(&self.name, &self.mimetype, self.size())
    }
}

/// Sends files to the upload endpoint. Holds no per-upload state.
#[derive(Clone)]
pub struct UploadClient {
    http: reqwest::Client,
    upload_url: String,
    store: Arc<dyn CredentialStore>,
}

impl UploadClient {
    pub fn new(http: reqwest::Client, config: &ClientConfig, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            http,
            upload_url: config.api_endpoint(UPLOAD_PATH),
            store,
        }
    }

    fn token(&self) -> Result<BearerToken, UploadError> {
        match self.store.load() {
            Ok(Some(raw)) => BearerToken::new(raw).map_err(|_| UploadError::Unauthenticated),
            Ok(None) => Err(UploadError::Unauthenticated),
            Err(e) => {
                tracing::warn!("failed to read stored token: {e}");
                Err(UploadError::Unauthenticated)
            }
        }
    }

    /// Upload one file as multipart `file`, plus any context fields.
    #[tracing::instrument(skip_all, fields(file = %file.name, size = file.size()))]
    pub async fn upload_file(
        &self,
        file: &UploadFile,
        context: Option<&UploadContext>,
    ) -> Result<UploadedFile, UploadError> {
        let token = self.token()?;

        let part = Part::bytes(file.bytes.clone())
            .file_name(file.name.clone())
            .mime_str(&file.mimetype)?;
        let mut form = Form::new().part("file", part);
        if let Some(ctx) = context {
            for (name, value) in ctx.fields() {
                form = form.text(name, value.to_string());
            }
        }

        let resp = self
            .http
            .post(&self.upload_url)
            .header(reqwest::header::AUTHORIZATION, token.header_value())
            .multipart(form)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|body| body.get("detail").and_then(|d| d.as_str()).map(str::to_owned));
            let message = detail.unwrap_or_else(|| {
                format!("Upload failed: {}", status.canonical_reason().unwrap_or("unknown error"))
            });
            tracing::warn!(status = status.as_u16(), "upload rejected: {message}");
            return Err(UploadError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let uploaded: UploadedFile = resp.json().await?;
        tracing::debug!(id = %uploaded.id, "uploaded");
        Ok(uploaded)
    }

    /// Upload several files concurrently; results keep input order.
    pub async fn upload_many(
        &self,
        files: &[UploadFile],
        context: Option<&UploadContext>,
    ) -> Vec<Result<UploadedFile, UploadError>> {
        join_all(files.iter().map(|file| self.upload_file(file, context))).await
    }
}
