//! Per-call request descriptor.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use serde_json::{Map, Value};

use crate::client::ClientError;

/// One item of a caller-streamed input.
#[derive(Debug, Clone, PartialEq)]
pub enum InputItem {
    /// Sent as a `continue-task` frame carrying the value as `input`.
    Text(Value),
    /// Sent as a raw binary frame.
    Binary(Bytes),
    /// Sent as a `continue-task` frame addressed to an already started task.
    Continuation { task_id: String, input: Value },
}

impl From<Value> for InputItem {
    fn from(value: Value) -> Self {
        InputItem::Text(value)
    }
}

impl From<Bytes> for InputItem {
    fn from(bytes: Bytes) -> Self {
        InputItem::Binary(bytes)
    }
}

impl From<Vec<u8>> for InputItem {
    fn from(bytes: Vec<u8>) -> Self {
        InputItem::Binary(Bytes::from(bytes))
    }
}

impl From<&[u8]> for InputItem {
    fn from(bytes: &[u8]) -> Self {
        InputItem::Binary(Bytes::copy_from_slice(bytes))
    }
}

/// Caller-produced input for full-duplex calls.
pub type InputStream = Pin<Box<dyn Stream<Item = Result<InputItem, ClientError>> + Send>>;

/// Everything the transport needs to know about one call.
///
/// Built by feature-specific collaborators; the transport does not interpret
/// `input`, `parameters` or `resources`.
#[derive(Default)]
pub struct RequestDescriptor {
    pub model: String,
    pub input: Value,
    pub parameters: Map<String, Value>,
    pub resources: Option<Value>,
    pub binary: Option<Bytes>,
    pub input_stream: Option<InputStream>,
    pub headers: HashMap<String, String>,
    pub workspace: Option<String>,
    pub security_check: bool,
    pub encrypt_request: bool,
    pub api_key: Option<String>,
    /// Resume this task instead of minting a new id.
    pub task_id: Option<String>,
}

impl fmt::Debug for RequestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestDescriptor")
            .field("model", &self.model)
            .field("input", &self.input)
            .field("parameters", &self.parameters)
            .field("resources", &self.resources)
            .field("binary", &self.binary.as_ref().map(Bytes::len))
            .field("input_stream", &self.input_stream.is_some())
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("workspace", &self.workspace)
            .field("security_check", &self.security_check)
            .field("encrypt_request", &self.encrypt_request)
            .field("task_id", &self.task_id)
            .finish()
    }
}

impl RequestDescriptor {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            input: Value::Object(Map::new()),
            ..Self::default()
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    /// Set one parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_resources(mut self, resources: Value) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn with_binary(mut self, binary: impl Into<Bytes>) -> Self {
        self.binary = Some(binary.into());
        self
    }

    pub fn with_input_stream<S>(mut self, stream: S) -> Self
    where
        S: Stream<Item = Result<InputItem, ClientError>> + Send + 'static,
    {
        self.input_stream = Some(Box::pin(stream));
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_workspace(mut self, workspace: impl Into<String>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    pub fn with_security_check(mut self, enabled: bool) -> Self {
        self.security_check = enabled;
        self
    }

    pub fn with_encryption(mut self, enabled: bool) -> Self {
        self.encrypt_request = enabled;
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Pick the API key: the request's own, then the transport default.
    pub fn resolve_api_key(&self, fallback: Option<&str>) -> Result<String, ClientError> {
        self.api_key
            .as_deref()
            .or(fallback)
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .ok_or(ClientError::MissingApiKey)
    }
}
