//! Transport-agnostic responses and the unified result shape.

use bytes::Bytes;
use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::client::ClientError;

/// One inbound unit from either transport.
#[derive(Debug, Clone, Default)]
pub struct NetworkResponse {
    pub headers: HeaderMap,
    /// Text body, SSE data or WebSocket text frame.
    pub message: Option<String>,
    /// SSE `event:` name.
    pub event: Option<String>,
    pub binary: Option<Bytes>,
    pub status_code: u16,
}

impl NetworkResponse {
    pub fn text(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            status_code,
            message: Some(message.into()),
            ..Self::default()
        }
    }
}

/// Caller-visible output of a result.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ResultOutput {
    Json(Value),
    Binary(Bytes),
    #[default]
    Empty,
}

impl ResultOutput {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ResultOutput::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&Bytes> {
        match self {
            ResultOutput::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, ResultOutput::Empty)
    }
}

/// Result of one call, or one item of a streamed call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnifiedResult {
    pub request_id: Option<String>,
    /// SSE event name the result arrived under.
    pub event: Option<String>,
    pub output: ResultOutput,
    pub usage: Option<Value>,
    pub status_code: Option<u16>,
    pub code: Option<String>,
    pub message: Option<String>,
}

impl UnifiedResult {
    /// Translate an inbound unit into a result.
    ///
    /// Binary units always become [`ResultOutput::Binary`]. Text units are
    /// parsed as a JSON envelope; with `flatten` the output is the envelope's
    /// `output` field, otherwise the whole envelope.
    pub fn from_response(response: NetworkResponse, flatten: bool) -> Result<Self, ClientError> {
        let status_code = Some(response.status_code).filter(|c| *c != 0);
        let request_id = header_request_id(&response.headers);

        if let Some(binary) = response.binary {
            return Ok(Self {
                request_id,
                event: response.event,
                output: ResultOutput::Binary(binary),
                status_code,
                ..Self::default()
            });
        }

        let envelope = match response.message.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => serde_json::from_str::<Value>(text)?,
            _ => {
                return Ok(Self {
                    request_id,
                    event: response.event,
                    status_code,
                    ..Self::default()
                })
            }
        };

        let mut result = Self::from_envelope(envelope, flatten);
        result.event = response.event;
        result.status_code = status_code;
        if result.request_id.is_none() {
            result.request_id = request_id;
        }
        Ok(result)
    }

    /// Build a result from an already parsed envelope.
    pub fn from_envelope(envelope: Value, flatten: bool) -> Self {
        let text_field = |name: &str| envelope.get(name).and_then(Value::as_str).map(str::to_string);
        let request_id = text_field("request_id");
        let code = text_field("code").filter(|c| !c.is_empty());
        let message = text_field("message").filter(|m| !m.is_empty());
        let usage = envelope.get("usage").filter(|u| !u.is_null()).cloned();

        let output = if flatten {
            match envelope.get("output") {
                Some(Value::Null) | None => ResultOutput::Empty,
                Some(output) => ResultOutput::Json(output.clone()),
            }
        } else {
            ResultOutput::Json(envelope)
        };

        Self {
            request_id,
            event: None,
            output,
            usage,
            status_code: None,
            code,
            message,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

fn header_request_id(headers: &HeaderMap) -> Option<String> {
    ["x-request-id", "x-dashscope-request-id"]
        .iter()
        .find_map(|name| headers.get(*name))
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
