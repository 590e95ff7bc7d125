//! Structured error status shared by both transports.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sse::parse_sse_line;

/// Status code used for failures that did not come with an HTTP status,
/// i.e. everything raised on the WebSocket transport.
pub const WEBSOCKET_ERROR_STATUS: u16 = 44;

/// Machine-readable codes produced by the client itself.
pub mod codes {
    /// Response body could not be parsed as a structured error.
    pub const RESPONSE_ERROR: &str = "ResponseError";
    /// Request failed before any response was available.
    pub const NETWORK_ERROR: &str = "NetworkError";
    /// WebSocket connection could not be (re)established.
    pub const CONNECTION_ERROR: &str = "ConnectionError";
    /// Inbound text frame was not a valid envelope.
    pub const MESSAGE_FORMAT_ERROR: &str = "MessageFormatError";
    /// Inbound envelope carried an event this client does not know.
    pub const UNKNOWN_MESSAGE: &str = "UnknownMessage";
    /// No API key could be resolved.
    pub const MISSING_API_KEY: &str = "MissingApiKey";
    /// Caller supplied input stream failed.
    pub const INPUT_ERROR: &str = "InputError";
    /// The call was canceled locally.
    pub const CANCELED: &str = "Canceled";
    /// A second call was attached to a busy connection.
    pub const CONNECTION_BUSY: &str = "ConnectionBusy";
    /// Invalid client-side configuration.
    pub const CONFIG_ERROR: &str = "ConfigError";
}

/// Error status surfaced to the caller for every terminal failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub status_code: u16,
    pub code: String,
    pub message: String,
    pub request_id: Option<String>,
    /// Whether `message` was taken from a structured JSON body.
    pub is_json: bool,
}

impl Status {
    pub fn new(status_code: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status_code,
            code: code.into(),
            message: message.into(),
            request_id: None,
            is_json: false,
        }
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    /// Decode an error body returned with `status_code`.
    ///
    /// Accepts a JSON object or an SSE body whose first `data:` line holds the
    /// JSON object. Anything else becomes a generic [`codes::RESPONSE_ERROR`]
    /// carrying the raw body.
    pub fn from_error_body(status_code: u16, body: &str) -> Self {
        let trimmed = body.trim();
        let candidate = if trimmed.starts_with('{') {
            Some(trimmed)
        } else {
            trimmed.lines().find_map(|line| parse_sse_line(line.trim()))
        };

        match candidate.and_then(|c| serde_json::from_str::<Value>(c).ok()) {
            Some(Value::Object(map)) => {
                let field = |name: &str| map.get(name).and_then(Value::as_str).map(str::to_string);
                Self {
                    status_code,
                    code: field("code").unwrap_or_default(),
                    message: field("message").unwrap_or_default(),
                    request_id: field("request_id"),
                    is_json: true,
                }
            }
            _ => Self::new(status_code, codes::RESPONSE_ERROR, body),
        }
    }

    /// Status for a WebSocket `task-failed` event.
    pub fn task_failed(task_id: &str, code: Option<&str>, message: Option<&str>) -> Self {
        Self {
            status_code: WEBSOCKET_ERROR_STATUS,
            code: code.unwrap_or_default().to_string(),
            message: message.unwrap_or_default().to_string(),
            request_id: Some(task_id.to_string()),
            is_json: true,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "status_code: {}, code: {}, message: {}",
            self.status_code, self.code, self.message
        )?;
        if let Some(id) = &self.request_id {
            write!(f, ", request_id: {}", id)?;
        }
        Ok(())
    }
}
