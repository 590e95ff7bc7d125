//! WebSocket duplex transport.
//!
//! A call is one task on the connection:
//!
//! 1. `run-task` carries the model, input and parameters.
//! 2. Half duplex: an optional binary payload follows as one binary frame.
//!    Full duplex: after `task-started`, every input item becomes a
//!    `continue-task` or binary frame, then `finish-task` is sent.
//! 3. The server answers with `result-generated` events and ends the task
//!    with `task-finished` or `task-failed`.

pub mod connection;
pub(crate) mod dispatch;
pub mod protocol;

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};
use uuid::Uuid;

use crate::callback::{spawn_callback, ResultCallback};
use crate::client::{Client, ClientError, ResultStream};
use crate::headers::{build_headers, HeaderTarget};
use crate::options::{ServiceOption, StreamingMode, TransportOptions};
use crate::request::{InputItem, InputStream, RequestDescriptor};
use crate::result::UnifiedResult;

pub use connection::{Connection, ConnectionState};
use connection::ConsumerSlot;
use protocol::WireEnvelope;

/// WebSocket transport for one service.
///
/// Clones share the same physical connection, which serves one call at a
/// time.
#[derive(Clone)]
pub struct WebSocketTransport {
    connection: Arc<Connection>,
    service: Arc<ServiceOption>,
    options: Arc<TransportOptions>,
}

impl WebSocketTransport {
    pub fn new(service: ServiceOption, options: TransportOptions) -> Self {
        Self::from_shared(Arc::new(service), Arc::new(options))
    }

    pub(crate) fn from_shared(service: Arc<ServiceOption>, options: Arc<TransportOptions>) -> Self {
        let connection = Arc::new(Connection::new(service.websocket_url(), options.clone()));
        Self {
            connection,
            service,
            options,
        }
    }

    pub fn service(&self) -> &ServiceOption {
        &self.service
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Gracefully close the connection.
    pub async fn close(&self, code: u16, reason: &str) -> Result<(), ClientError> {
        self.connection.close(code, reason).await
    }

    /// Drop the connection immediately. An attached call ends with
    /// [`ClientError::Canceled`].
    pub async fn cancel(&self) {
        self.connection.cancel().await
    }

    /// Execute the call and return the last result.
    pub async fn call(&self, request: RequestDescriptor) -> Result<UnifiedResult, ClientError> {
        let mut results = self.stream(request).await?;
        let mut last = None;
        while let Some(item) = results.next().await {
            last = Some(item?);
        }
        Ok(last.unwrap_or_default())
    }

    /// Start the call and return its results.
    ///
    /// Returns once `run-task` (and a half-duplex binary payload) has been
    /// sent. Dropping the stream stops the input task and frees the
    /// connection for the next call.
    pub async fn stream(&self, mut request: RequestDescriptor) -> Result<ResultStream, ClientError> {
        let api_key = request.resolve_api_key(self.options.api_key.as_deref())?;
        let headers = build_headers(
            &api_key,
            &request,
            &self.service,
            &self.options.headers,
            HeaderTarget::WebSocket,
        )?;

        let mode = self.service.streaming_mode;
        let input = if mode.streams_input() {
            let input = request.input_stream.take().ok_or_else(|| {
                ClientError::Input(format!("streaming mode {} needs an input stream", mode.as_str()))
            })?;
            Some(input)
        } else {
            None
        };

        let task_id = request
            .task_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let (tx, rx) = mpsc::channel(self.options.channel_capacity.max(1));
        let (started_tx, started_rx) = oneshot::channel();

        self.connection.attach(ConsumerSlot {
            task_id: task_id.clone(),
            flatten: self.service.is_flatten(),
            sender: tx,
            started: Some(started_tx),
        })?;
        let mut guard = CallGuard {
            connection: self.connection.clone(),
            task_id: task_id.clone(),
            input_task: None,
            done: false,
        };
        self.connection.set_handshake_headers(headers);

        info!("Starting task {} ({})", task_id, mode.as_str());
        let run_task = WireEnvelope::run_task(&task_id, &self.service, &request);
        self.connection.send_envelope(&run_task).await?;

        match input {
            Some(input) => {
                guard.input_task = Some(tokio::spawn(drain_input(
                    self.connection.clone(),
                    task_id,
                    mode,
                    input,
                    started_rx,
                )));
            }
            None => {
                if let Some(binary) = request.binary.take() {
                    self.connection.send_frame(Message::Binary(binary)).await?;
                }
            }
        }

        Ok(result_stream(rx, guard))
    }
}

#[async_trait]
impl Client for WebSocketTransport {
    async fn call(&self, request: RequestDescriptor) -> Result<UnifiedResult, ClientError> {
        WebSocketTransport::call(self, request).await
    }

    async fn stream(&self, request: RequestDescriptor) -> Result<ResultStream, ClientError> {
        WebSocketTransport::stream(self, request).await
    }

    fn call_with_callback(
        &self,
        request: RequestDescriptor,
        callback: Box<dyn ResultCallback>,
    ) -> JoinHandle<()> {
        let this = self.clone();
        spawn_callback(async move { WebSocketTransport::stream(&this, request).await }, callback)
    }
}

/// Ties a call's lifetime to its result stream.
struct CallGuard {
    connection: Arc<Connection>,
    task_id: String,
    input_task: Option<JoinHandle<()>>,
    done: bool,
}

impl CallGuard {
    async fn finish(&mut self) {
        if let Some(task) = self.input_task.take() {
            task.abort();
            let _ = task.await;
        }
        self.connection.detach(&self.task_id);
        self.done = true;
        debug!("Task {} released", self.task_id);
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Some(task) = self.input_task.take() {
            task.abort();
        }
        if self.connection.detach(&self.task_id) {
            debug!("Task {} dropped by consumer", self.task_id);
        }
    }
}

fn result_stream(
    mut rx: mpsc::Receiver<Result<UnifiedResult, ClientError>>,
    mut guard: CallGuard,
) -> ResultStream {
    Box::pin(async_stream::stream! {
        while let Some(item) = rx.recv().await {
            let failed = item.is_err();
            yield item;
            if failed {
                break;
            }
        }
        guard.finish().await;
    })
}

async fn drain_input(
    connection: Arc<Connection>,
    task_id: String,
    mode: StreamingMode,
    mut input: InputStream,
    started: oneshot::Receiver<()>,
) {
    if started.await.is_err() {
        debug!("Task {} ended before it started, no input sent", task_id);
        return;
    }

    let mut count = 0usize;
    while let Some(item) = input.next().await {
        let sent = match item {
            Ok(InputItem::Text(value)) => {
                connection
                    .send_envelope(&WireEnvelope::continue_task(&task_id, mode, value))
                    .await
            }
            Ok(InputItem::Binary(data)) => connection.send_frame(Message::Binary(data)).await,
            Ok(InputItem::Continuation { task_id: target, input }) => {
                connection
                    .send_envelope(&WireEnvelope::continue_task(&target, mode, input))
                    .await
            }
            Err(e) => {
                connection.fail_task(&task_id, e).await;
                return;
            }
        };
        if let Err(e) = sent {
            connection.fail_task(&task_id, e).await;
            return;
        }
        count += 1;
    }

    debug!("Task {} input complete after {} items", task_id, count);
    if let Err(e) = connection
        .send_envelope(&WireEnvelope::finish_task(&task_id, mode))
        .await
    {
        connection.fail_task(&task_id, e).await;
    }
}
