//! Classification of inbound WebSocket frames.

use bytes::Bytes;

use super::protocol::{Event, WireEnvelope};
use crate::client::ClientError;
use crate::result::{ResultOutput, UnifiedResult};
use crate::status::{codes, Status, WEBSOCKET_ERROR_STATUS};

/// What the reader should do with one inbound frame.
#[derive(Debug)]
pub(crate) enum Dispatch {
    /// `task-started`; carries a result when the payload had content.
    Started(Option<UnifiedResult>),
    Emit(UnifiedResult),
    /// `task-finished`; carries a result when the payload had content.
    Finish(Option<UnifiedResult>),
    Fail(ClientError),
}

/// Classify a text frame. Returns the task id from the frame header (empty
/// when the frame could not be decoded) together with the action.
pub(crate) fn dispatch_text(text: &str, flatten: bool) -> (String, Dispatch) {
    let envelope: WireEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            let status = Status::new(
                WEBSOCKET_ERROR_STATUS,
                codes::MESSAGE_FORMAT_ERROR,
                format!("unexpected message {}: {}", text, e),
            );
            return (String::new(), Dispatch::Fail(ClientError::Api(status)));
        }
    };

    let task_id = envelope.header.task_id.clone();
    let event_name = envelope.header.event.clone().unwrap_or_default();

    let dispatch = match Event::parse(&event_name) {
        Some(Event::TaskStarted) => Dispatch::Started(content(envelope, flatten)),
        Some(Event::ResultGenerated) => Dispatch::Emit(to_result(envelope, flatten)),
        Some(Event::TaskFinished) => Dispatch::Finish(content(envelope, flatten)),
        Some(Event::TaskFailed) => Dispatch::Fail(ClientError::Api(Status::task_failed(
            &task_id,
            envelope.header.error_code.as_deref(),
            envelope.header.error_message.as_deref(),
        ))),
        None => {
            let status = Status::new(
                WEBSOCKET_ERROR_STATUS,
                codes::UNKNOWN_MESSAGE,
                format!("unknown event {:?}", event_name),
            )
            .with_request_id(Some(task_id.clone()).filter(|id| !id.is_empty()));
            Dispatch::Fail(ClientError::Api(status))
        }
    };
    (task_id, dispatch)
}

pub(crate) fn dispatch_binary(data: Bytes, task_id: Option<&str>) -> Dispatch {
    Dispatch::Emit(UnifiedResult {
        request_id: task_id.map(str::to_string),
        output: ResultOutput::Binary(data),
        ..UnifiedResult::default()
    })
}

fn content(envelope: WireEnvelope, flatten: bool) -> Option<UnifiedResult> {
    if envelope.payload.has_content() {
        Some(to_result(envelope, flatten))
    } else {
        None
    }
}

fn to_result(envelope: WireEnvelope, flatten: bool) -> UnifiedResult {
    let task_id = envelope.header.task_id;
    let payload = serde_json::to_value(envelope.payload).unwrap_or_default();
    UnifiedResult::from_envelope(payload, flatten).with_request_id(task_id)
}
