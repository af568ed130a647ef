//! File upload types and the advisory pre-checks applied before uploading.

use serde::{Deserialize, Serialize};

/// What the upload endpoint returns for a stored file.
///
/// Treated as a client-side cache; the backend stays authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    /// Identifier to reference the file in an outbound message.
    pub id: String,
    pub original_name: String,
    pub mimetype: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_name: Option<String>,
}

/// Session-scoped fields sent alongside an upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadContext {
    pub request_id: Option<String>,
    pub session_id: Option<String>,
}

impl UploadContext {
    pub fn new(request_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            request_id: Some(request_id.into()),
            session_id: Some(session_id.into()),
        }
    }

    /// Non-empty fields as `(name, value)` form pairs.
    pub fn fields(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("request_id", self.request_id.as_deref()),
            ("session_id", self.session_id.as_deref()),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| (name, v)))
    }
}

/// Size and type gates the front-end applies before uploading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadLimits {
    /// Largest accepted file, in bytes.
    pub max_file_size: u64,
    /// MIME types (`image/png`) or dotted extensions (`.pdf`).
    pub allowed_types: Vec<String>,
    /// Files per outbound message.
    pub max_files: usize,
}

impl UploadLimits {
    pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;
    pub const DEFAULT_MAX_FILES: usize = 5;

    /// Check one file against the limits.
    pub fn check(&self, name: &str, mimetype: &str, size: u64) -> Result<(), FileRejection> {
        if size > self.max_file_size {
            return Err(FileRejection::TooLarge {
                max: format_file_size(self.max_file_size),
            });
        }
        let lower_name = name.to_lowercase();
        let accepted = self.allowed_types.iter().any(|allowed| {
            if allowed.starts_with('.') {
                lower_name.ends_with(&allowed.to_lowercase())
            } else {
                mimetype.eq_ignore_ascii_case(allowed)
            }
        });
        if !accepted {
            return Err(FileRejection::InvalidType {
                allowed: self.allowed_types.join(", "),
            });
        }
        Ok(())
    }

    /// Check that one more file fits in a message already holding `current`.
    pub fn check_count(&self, current: usize) -> Result<(), FileRejection> {
        if current >= self.max_files {
            return Err(FileRejection::TooMany {
                max: self.max_files,
            });
        }
        Ok(())
    }
}

impl Default for UploadLimits {
    fn default() -> Self {
        let allowed = [
            "image/jpeg",
            "image/jpg",
            "image/png",
            "image/gif",
            "image/webp",
            "application/pdf",
            "text/plain",
            "application/msword",
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            ".pdf",
            ".txt",
            ".doc",
            ".docx",
        ];
        Self {
            max_file_size: Self::DEFAULT_MAX_FILE_SIZE,
            allowed_types: allowed.iter().map(|s| s.to_string()).collect(),
            max_files: Self::DEFAULT_MAX_FILES,
        }
    }
}

/// Why a file was refused before upload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FileRejection {
    #[error("file size exceeds {max}")]
    TooLarge { max: String },
    #[error("invalid file type, allowed types: {allowed}")]
    InvalidType { allowed: String },
    #[error("at most {max} files per message")]
    TooMany { max: usize },
}

/// Human-readable byte count using 1024-based units (`1.5 KB`, `10 MB`).
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["Bytes", "KB", "MB", "GB"];
    if bytes == 0 {
        return "0 Bytes".to_string();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let rounded = (value * 100.0).round() / 100.0;
    format!("{rounded} {}", UNITS[unit])
}
