//! WebSocket wire envelope.
//!
//! ```json
//! {
//!   "header": {"action": "run-task", "task_id": "…", "streaming": "duplex"},
//!   "payload": {"model": "…", "task_group": "audio", "task": "asr",
//!               "function": "recognition", "input": {}, "parameters": {}}
//! }
//! ```
//!
//! Client frames carry `header.action`; server frames carry `header.event`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::skip_serializing_none;

use crate::options::{ServiceOption, StreamingMode};
use crate::request::RequestDescriptor;

/// Client to server actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    RunTask,
    ContinueTask,
    FinishTask,
}

/// Server to client events this client understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    TaskStarted,
    ResultGenerated,
    TaskFinished,
    TaskFailed,
}

impl Event {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "task-started" => Some(Event::TaskStarted),
            "result-generated" => Some(Event::ResultGenerated),
            "task-finished" => Some(Event::TaskFinished),
            "task-failed" => Some(Event::TaskFailed),
            _ => None,
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireHeader {
    pub action: Option<Action>,
    pub event: Option<String>,
    #[serde(default)]
    pub task_id: String,
    pub streaming: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub attributes: Option<Value>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WirePayload {
    pub model: Option<String>,
    pub task_group: Option<String>,
    pub task: Option<String>,
    pub function: Option<String>,
    pub input: Option<Value>,
    pub parameters: Option<Map<String, Value>>,
    pub resources: Option<Value>,
    pub output: Option<Value>,
    pub usage: Option<Value>,
    /// Fields this client does not model, kept for the caller.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WirePayload {
    /// Whether the server sent an `output` or `usage` value.
    pub fn has_content(&self) -> bool {
        let present = |v: &Option<Value>| v.as_ref().is_some_and(|v| !v.is_null());
        present(&self.output) || present(&self.usage)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub header: WireHeader,
    #[serde(default)]
    pub payload: WirePayload,
}

impl WireEnvelope {
    fn client(action: Action, task_id: &str, streaming: StreamingMode, payload: WirePayload) -> Self {
        Self {
            header: WireHeader {
                action: Some(action),
                task_id: task_id.to_string(),
                streaming: Some(streaming.as_str().to_string()),
                ..WireHeader::default()
            },
            payload,
        }
    }

    /// First frame of a call.
    pub fn run_task(task_id: &str, service: &ServiceOption, request: &RequestDescriptor) -> Self {
        let (task_group, task, function) = match service.task_segments() {
            Some((g, t, f)) => (Some(g.to_string()), Some(t.to_string()), Some(f.to_string())),
            None => (None, None, None),
        };
        let payload = WirePayload {
            model: Some(request.model.clone()),
            task_group,
            task,
            function,
            input: Some(request.input.clone()),
            parameters: Some(request.parameters.clone()),
            resources: request.resources.clone(),
            ..WirePayload::default()
        };
        Self::client(Action::RunTask, task_id, service.streaming_mode, payload)
    }

    /// One streamed input item.
    pub fn continue_task(task_id: &str, streaming: StreamingMode, input: Value) -> Self {
        let payload = WirePayload {
            input: Some(input),
            ..WirePayload::default()
        };
        Self::client(Action::ContinueTask, task_id, streaming, payload)
    }

    /// End of streamed input.
    pub fn finish_task(task_id: &str, streaming: StreamingMode) -> Self {
        let payload = WirePayload {
            input: Some(Value::Object(Map::new())),
            ..WirePayload::default()
        };
        Self::client(Action::FinishTask, task_id, streaming, payload)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
