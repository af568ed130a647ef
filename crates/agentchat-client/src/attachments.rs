//! Files attached to the message being composed.
//!
//! Each entry moves through: selected -> uploading -> resolved to a server id
//! (or failed, retryable) -> removed once sent or dismissed. A preview is any
//! value whose `Drop` releases the resource; removing an entry drops it.

use agentchat_core::UploadedFile;

use crate::error::UploadError;
use crate::upload::UploadFile;

/// Client-local handle for an attached file.
pub type LocalId = u64;

/// One attached file and its upload progress.
#[derive(Debug)]
pub struct AttachedFile<P = ()> {
    pub id: LocalId,
    pub file: UploadFile,
    pub preview: Option<P>,
    pub uploaded: Option<UploadedFile>,
    pub uploading: bool,
    pub error: Option<String>,
}

impl<P> AttachedFile<P> {
    /// Server id once the upload has succeeded.
    pub fn server_id(&self) -> Option<&str> {
        self.uploaded.as_ref().map(|u| u.id.as_str())
    }

    pub fn is_ready(&self) -> bool {
        self.uploaded.is_some() && !self.uploading
    }

    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Ordered set of attachments for the next outbound message.
#[derive(Debug)]
pub struct AttachmentSet<P = ()> {
    files: Vec<AttachedFile<P>>,
    next_id: LocalId,
}

impl<P> Default for AttachmentSet<P> {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            next_id: 1,
        }
    }
}

impl<P> AttachmentSet<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AttachedFile<P>> {
        self.files.iter()
    }

    pub fn get(&self, id: LocalId) -> Option<&AttachedFile<P>> {
        self.files.iter().find(|f| f.id == id)
    }

    fn get_mut(&mut self, id: LocalId) -> Option<&mut AttachedFile<P>> {
        self.files.iter_mut().find(|f| f.id == id)
    }

    /// Track a newly selected file.
    pub fn add(&mut self, file: UploadFile, preview: Option<P>) -> LocalId {
        let id = self.next_id;
        self.next_id += 1;
        self.files.push(AttachedFile {
            id,
            file,
            preview,
            uploaded: None,
            uploading: false,
            error: None,
        });
        id
    }

    /// Mark an entry in flight and hand back its file for uploading.
    ///
    /// Returns `None` for unknown ids, entries already uploading, and entries
    /// that already have a server id. Clears any previous error, so this is
    /// also how a failed upload is retried.
    pub fn begin_upload(&mut self, id: LocalId) -> Option<UploadFile> {
        let entry = self.get_mut(id)?;
        if entry.uploading || entry.uploaded.is_some() {
            return None;
        }
        entry.uploading = true;
        entry.error = None;
        Some(entry.file.clone())
    }

    /// Record the outcome of an upload started with [`begin_upload`](Self::begin_upload).
    ///
    /// Returns `false` if the entry was dismissed meanwhile.
    pub fn finish_upload(&mut self, id: LocalId, outcome: &Result<UploadedFile, UploadError>) -> bool {
        let Some(entry) = self.get_mut(id) else {
            return false;
        };
        entry.uploading = false;
        match outcome {
            Ok(uploaded) => {
                entry.uploaded = Some(uploaded.clone());
                entry.error = None;
            }
            Err(e) => {
                entry.error = Some(e.to_string());
            }
        }
        true
    }

    /// Remove an entry at the user's request, releasing its preview.
    pub fn dismiss(&mut self, id: LocalId) -> bool {
        let before = self.files.len();
        self.files.retain(|f| f.id != id);
        self.files.len() != before
    }

    /// Server ids of resolved entries, in attachment order.
    pub fn ready_ids(&self) -> Vec<String> {
        self.files
            .iter()
            .filter(|f| f.is_ready())
            .filter_map(|f| f.server_id().map(str::to_owned))
            .collect()
    }

    pub fn any_uploading(&self) -> bool {
        self.files.iter().any(|f| f.uploading)
    }

    /// Drop resolved entries after they went out with a message.
    ///
    /// Pending and failed entries stay for the next message.
    pub fn take_sent(&mut self) -> Vec<UploadedFile> {
        let (sent, kept): (Vec<_>, Vec<_>) = self.files.drain(..).partition(|f| f.is_ready());
        self.files = kept;
        sent.into_iter().filter_map(|f| f.uploaded).collect()
    }

    /// Remove everything.
    pub fn clear(&mut self) {
        self.files.clear();
    }
}
