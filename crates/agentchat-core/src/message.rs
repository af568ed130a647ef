//! Chat frames.
//!
//! Outbound frames have a fixed shape. Inbound frames are only required to be
//! JSON; they are classified by their `type` field but always carry the raw
//! value so consumers see exactly what the backend sent.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One chat turn sent to the agent backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// The user's text.
    pub message: String,
    /// Name of the selected model configuration.
    pub llm_name: String,
    /// Provider the model configuration belongs to.
    pub provider: String,
    /// Server-assigned ids of attached files, in attachment order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
}

impl OutboundMessage {
    pub fn new(
        message: impl Into<String>,
        llm_name: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            llm_name: llm_name.into(),
            provider: provider.into(),
            files: Vec::new(),
        }
    }

    /// Attach file ids.
    pub fn with_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files.extend(files.into_iter().map(Into::into));
        self
    }
}

/// A frame received from the agent backend.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// `type: "agent_log"`: agent diagnostics, never shown.
    AgentLog { frame: Value },
    /// `type: "agent_response"`: the agent's answer in `response`.
    AgentResponse { response: Value, frame: Value },
    /// `type: "user_message"`: echo of a user turn.
    UserMessage { frame: Value },
    /// Any other frame, including ones without a `type`.
    Other { kind: Option<String>, frame: Value },
}

impl InboundEvent {
    /// Parse a text frame. Fails only if the text is not JSON.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text).map(Self::from_frame)
    }

    /// Parse a binary frame holding UTF-8 JSON.
    pub fn parse_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes).map(Self::from_frame)
    }

    /// Classify an already-parsed frame.
    pub fn from_frame(frame: Value) -> Self {
        let kind = frame.get("type").and_then(Value::as_str).map(str::to_owned);
        match kind.as_deref() {
            Some("agent_log") => InboundEvent::AgentLog { frame },
            Some("agent_response") => {
                let response = frame.get("response").cloned().unwrap_or(Value::Null);
                InboundEvent::AgentResponse { response, frame }
            }
            Some("user_message") => InboundEvent::UserMessage { frame },
            _ => InboundEvent::Other { kind, frame },
        }
    }

    /// The `type` tag, if the frame had one.
    pub fn kind(&self) -> Option<&str> {
        match self {
            InboundEvent::AgentLog { .. } => Some("agent_log"),
            InboundEvent::AgentResponse { .. } => Some("agent_response"),
            InboundEvent::UserMessage { .. } => Some("user_message"),
            InboundEvent::Other { kind, .. } => kind.as_deref(),
        }
    }

    pub fn is_log(&self) -> bool {
        matches!(self, InboundEvent::AgentLog { .. })
    }

    /// The frame exactly as received.
    pub fn frame(&self) -> &Value {
        match self {
            InboundEvent::AgentLog { frame }
            | InboundEvent::AgentResponse { frame, .. }
            | InboundEvent::UserMessage { frame }
            | InboundEvent::Other { frame, .. } => frame,
        }
    }

    pub fn into_frame(self) -> Value {
        match self {
            InboundEvent::AgentLog { frame }
            | InboundEvent::AgentResponse { frame, .. }
            | InboundEvent::UserMessage { frame }
            | InboundEvent::Other { frame, .. } => frame,
        }
    }

    /// Displayable answer text.
    ///
    /// The backend sends `response` either as a plain string or wrapped as
    /// `{"response": "..."}`. Any frame other than an agent log that carries
    /// such a `response` counts as an answer, whatever its `type`.
    pub fn response_text(&self) -> Option<&str> {
        let response = match self {
            InboundEvent::AgentLog { .. } => return None,
            InboundEvent::AgentResponse { response, .. } => response,
            other => other.frame().get("response")?,
        };
        match response {
            Value::String(s) => Some(s.as_str()),
            Value::Object(map) => map.get("response").and_then(Value::as_str),
            _ => None,
        }
    }
}

/// Why a chat message was refused before sending.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageRejection {
    #[error("message cannot be empty")]
    Empty,
    #[error("message too long, maximum {max} characters allowed")]
    TooLong { max: usize },
}

/// Check user text before it becomes an [`OutboundMessage`].
pub fn validate_message(text: &str, max_len: usize) -> Result<(), MessageRejection> {
    if text.trim().is_empty() {
        return Err(MessageRejection::Empty);
    }
    if text.chars().count() > max_len {
        return Err(MessageRejection::TooLong { max: max_len });
    }
    Ok(())
}
