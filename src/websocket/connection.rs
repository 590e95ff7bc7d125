//! One physical WebSocket connection and its lifecycle.
//!
//! State machine:
//!
//! ```text
//! Disconnected -> Connecting -> Open -> Closing -> Closed
//!                      \          \
//!                       `-> Failed <'
//! ```
//!
//! Every successful connect starts a new *generation* with its own reader
//! task. Readers of older generations are ignored, so a socket replaced
//! during send retry cannot end the call running on its successor.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use reqwest::header::HeaderMap;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::dispatch::{dispatch_binary, dispatch_text, Dispatch};
use super::protocol::WireEnvelope;
use crate::client::ClientError;
use crate::options::TransportOptions;
use crate::result::UnifiedResult;
use crate::status::{codes, Status, WEBSOCKET_ERROR_STATUS};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

pub(crate) type ResultSender = mpsc::Sender<Result<UnifiedResult, ClientError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
    Closed,
    Failed,
}

/// The call currently receiving results from the connection.
pub(crate) struct ConsumerSlot {
    pub task_id: String,
    pub flatten: bool,
    pub sender: ResultSender,
    /// Fired on `task-started`.
    pub started: Option<oneshot::Sender<()>>,
}

/// Outcome of one attempt inside [`run_with_retry`].
pub(crate) enum Attempt<T> {
    Done(T),
    /// Give up without further attempts.
    Abort(ClientError),
    /// Failed with the given message; try again if attempts remain.
    Retry(String),
}

/// Run `operation` up to `max_attempts` times, sleeping `delay` between
/// attempts. Exhaustion becomes a connection error carrying the last message.
pub(crate) async fn run_with_retry<T, Op, Fut>(
    max_attempts: u32,
    delay: Duration,
    mut operation: Op,
) -> Result<T, ClientError>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        match operation(attempt).await {
            Attempt::Done(value) => return Ok(value),
            Attempt::Abort(e) => return Err(e),
            Attempt::Retry(message) => {
                last_error = message;
                if attempt < max_attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    Err(ClientError::Connection(Status::new(
        WEBSOCKET_ERROR_STATUS,
        codes::CONNECTION_ERROR,
        last_error,
    )))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn connection_error(message: impl Into<String>) -> ClientError {
    ClientError::Connection(Status::new(
        WEBSOCKET_ERROR_STATUS,
        codes::CONNECTION_ERROR,
        message,
    ))
}

/// State shared between the connection and its reader task.
struct Shared {
    state: Mutex<ConnectionState>,
    generation: AtomicU64,
    slot: Mutex<Option<ConsumerSlot>>,
    writer: tokio::sync::Mutex<Option<WsSink>>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = lock(&self.state);
        if *current != state {
            debug!("WebSocket state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn take_slot(&self) -> Option<ConsumerSlot> {
        lock(&self.slot).take()
    }

    fn take_slot_for(&self, task_id: &str) -> Option<ConsumerSlot> {
        self.take_slot_if(|s| s.task_id == task_id)
    }

    fn take_slot_if(&self, predicate: impl Fn(&ConsumerSlot) -> bool) -> Option<ConsumerSlot> {
        let mut slot = lock(&self.slot);
        if slot.as_ref().is_some_and(predicate) {
            slot.take()
        } else {
            None
        }
    }

    /// Sender and settings of the attached consumer, without detaching it.
    fn peek_slot(&self) -> Option<(ResultSender, bool, String)> {
        lock(&self.slot)
            .as_ref()
            .map(|s| (s.sender.clone(), s.flatten, s.task_id.clone()))
    }

    /// Route `dispatch` to the attached consumer when it owns `task_id`.
    /// An empty `task_id` belongs to whichever consumer is attached.
    async fn deliver(&self, task_id: &str, dispatch: Dispatch) {
        let owns = |slot: &ConsumerSlot| task_id.is_empty() || slot.task_id == task_id;

        match dispatch {
            Dispatch::Started(result) => {
                let (sender, started) = {
                    let mut slot = lock(&self.slot);
                    match slot.as_mut().filter(|s| owns(s)) {
                        Some(s) => (s.sender.clone(), s.started.take()),
                        None => {
                            debug!("Ignoring task-started for task {}", task_id);
                            return;
                        }
                    }
                };
                if let Some(started) = started {
                    let _ = started.send(());
                }
                if let Some(result) = result {
                    let _ = sender.send(Ok(result)).await;
                }
            }
            Dispatch::Emit(result) => {
                let sender = lock(&self.slot)
                    .as_ref()
                    .filter(|s| owns(s))
                    .map(|s| s.sender.clone());
                match sender {
                    Some(sender) => {
                        if sender.send(Ok(result)).await.is_err() {
                            debug!("Result dropped, consumer went away");
                        }
                    }
                    None => debug!("Ignoring result for task {}", task_id),
                }
            }
            Dispatch::Finish(result) => match self.take_slot_if(owns) {
                Some(slot) => {
                    debug!("Task {} finished", slot.task_id);
                    if let Some(result) = result {
                        let _ = slot.sender.send(Ok(result)).await;
                    }
                }
                None => debug!("Ignoring task-finished for task {}", task_id),
            },
            Dispatch::Fail(error) => match self.take_slot_if(owns) {
                Some(slot) => {
                    let _ = slot.sender.send(Err(error)).await;
                }
                None => warn!("Task failed with no matching consumer: {}", error),
            },
        }
    }

    /// Peer started the close handshake.
    async fn on_closing(&self, frame: Option<CloseFrame>) {
        self.set_state(ConnectionState::Closing);
        debug!("Peer closed connection: {:?}", frame);
        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = sink.close().await;
        }
        self.set_state(ConnectionState::Closed);
        if let Some(slot) = self.take_slot() {
            debug!("Ending task {} on peer close", slot.task_id);
        }
    }

    /// Socket failed without a close handshake.
    async fn on_failure(&self, message: String) {
        warn!("WebSocket failure: {}", message);
        self.set_state(ConnectionState::Failed);
        self.writer.lock().await.take();
        match self.take_slot() {
            Some(slot) => {
                let error = ClientError::Connection(
                    Status::new(WEBSOCKET_ERROR_STATUS, codes::CONNECTION_ERROR, message)
                        .with_request_id(Some(slot.task_id.clone())),
                );
                let _ = slot.sender.send(Err(error)).await;
            }
            None => debug!("Failure with no consumer attached"),
        }
    }
}

async fn read_loop(shared: Arc<Shared>, mut source: WsSource, generation: u64) {
    while let Some(frame) = source.next().await {
        if !shared.is_current(generation) {
            debug!("Stale reader {} exiting", generation);
            return;
        }
        match frame {
            Ok(Message::Text(text)) => {
                debug!("<< {}", text.as_str());
                let flatten = shared.peek_slot().map(|(_, f, _)| f).unwrap_or(false);
                let (task_id, dispatch) = dispatch_text(text.as_str(), flatten);
                shared.deliver(&task_id, dispatch).await;
            }
            Ok(Message::Binary(data)) => {
                debug!("<< binary frame ({} bytes)", data.len());
                let task_id = shared.peek_slot().map(|(_, _, id)| id);
                shared.deliver("", dispatch_binary(data, task_id.as_deref())).await;
            }
            Ok(Message::Close(frame)) => {
                shared.on_closing(frame).await;
                return;
            }
            Ok(_) => {}
            Err(e) => {
                shared.on_failure(e.to_string()).await;
                return;
            }
        }
    }

    if shared.is_current(generation) {
        shared.on_closing(None).await;
    }
}

/// A reconnecting WebSocket connection with a single consumer slot.
pub struct Connection {
    url: String,
    options: Arc<TransportOptions>,
    handshake: Mutex<HeaderMap>,
    connect_lock: tokio::sync::Mutex<()>,
    reader: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<Shared>,
}

impl Connection {
    pub fn new(url: impl Into<String>, options: Arc<TransportOptions>) -> Self {
        Self {
            url: url.into(),
            options,
            handshake: Mutex::new(HeaderMap::new()),
            connect_lock: tokio::sync::Mutex::new(()),
            reader: Mutex::new(None),
            shared: Arc::new(Shared {
                state: Mutex::new(ConnectionState::Disconnected),
                generation: AtomicU64::new(0),
                slot: Mutex::new(None),
                writer: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Headers sent with the next handshake.
    pub(crate) fn set_handshake_headers(&self, headers: HeaderMap) {
        *lock(&self.handshake) = headers;
    }

    /// Attach the consumer of a new call. Fails if one is already attached.
    pub(crate) fn attach(&self, slot: ConsumerSlot) -> Result<(), ClientError> {
        let mut current = lock(&self.shared.slot);
        if current.is_some() {
            return Err(ClientError::Busy);
        }
        *current = Some(slot);
        Ok(())
    }

    /// Release the slot if it still belongs to `task_id`.
    pub(crate) fn detach(&self, task_id: &str) -> bool {
        self.shared.take_slot_for(task_id).is_some()
    }

    /// End the call `task_id` with `error`, if it is still attached.
    pub(crate) async fn fail_task(&self, task_id: &str, error: ClientError) {
        match self.shared.take_slot_for(task_id) {
            Some(slot) => {
                let _ = slot.sender.send(Err(error)).await;
            }
            None => debug!("Task {} already ended, dropping error: {}", task_id, error),
        }
    }

    /// Open the connection, retrying failed attempts.
    ///
    /// A 401 handshake rejection aborts immediately.
    pub async fn establish(&self) -> Result<(), ClientError> {
        let _guard = self.connect_lock.lock().await;
        if self.state() == ConnectionState::Open {
            return Ok(());
        }
        let retry = self.options.retry;

        let result = run_with_retry(retry.max_attempts, retry.connect_delay, |attempt| async move {
            self.shared.set_state(ConnectionState::Connecting);
            match self.open().await {
                Ok(stream) => Attempt::Done(stream),
                Err(ClientError::WebSocket(tungstenite::Error::Http(response)))
                    if response.status().as_u16() == 401 =>
                {
                    let body = response
                        .body()
                        .as_deref()
                        .map(String::from_utf8_lossy)
                        .unwrap_or_default();
                    Attempt::Abort(ClientError::Connection(Status::from_error_body(401, &body)))
                }
                Err(e) => {
                    warn!("Connect attempt {} to {} failed: {}", attempt, self.url, e);
                    Attempt::Retry(e.to_string())
                }
            }
        })
        .await;

        match result {
            Ok(stream) => {
                self.install(stream).await;
                info!("WebSocket connected to {}", self.url);
                Ok(())
            }
            Err(e) => {
                self.shared.set_state(ConnectionState::Failed);
                Err(e)
            }
        }
    }

    async fn open(&self) -> Result<WsStream, ClientError> {
        let mut request = self.url.as_str().into_client_request()?;
        request.headers_mut().extend(lock(&self.handshake).clone());

        let connect = tokio_tungstenite::connect_async(request);
        let (stream, _response) = match self.options.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| connection_error(format!("connect timed out after {:?}", timeout)))??,
            None => connect.await?,
        };
        Ok(stream)
    }

    async fn install(&self, stream: WsStream) {
        let (sink, source) = stream.split();
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.shared.writer.lock().await = Some(sink);
        self.shared.set_state(ConnectionState::Open);

        let handle = tokio::spawn(read_loop(self.shared.clone(), source, generation));
        if let Some(old) = lock(&self.reader).replace(handle) {
            old.abort();
        }
    }

    /// Drop the current socket after a failed transmission.
    async fn mark_broken(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(old) = lock(&self.reader).take() {
            old.abort();
        }
        self.shared.writer.lock().await.take();
        self.shared.set_state(ConnectionState::Disconnected);
    }

    async fn transmit(&self, message: Message) -> Result<(), ClientError> {
        let mut writer = self.shared.writer.lock().await;
        let sink = writer
            .as_mut()
            .ok_or_else(|| connection_error("connection is not open"))?;
        match self.options.write_timeout {
            Some(timeout) => tokio::time::timeout(timeout, sink.send(message))
                .await
                .map_err(|_| connection_error(format!("send timed out after {:?}", timeout)))??,
            None => sink.send(message).await?,
        }
        Ok(())
    }

    /// Send one frame, reconnecting and retrying on failure.
    ///
    /// Delivery is at-least-once: a frame whose transmission reported failure
    /// may still have reached the peer before the retry.
    pub async fn send_frame(&self, message: Message) -> Result<(), ClientError> {
        let retry = self.options.retry;
        run_with_retry(retry.max_attempts, retry.send_delay, |attempt| {
            let message = message.clone();
            async move {
                if self.state() != ConnectionState::Open {
                    if let Err(e) = self.establish().await {
                        return Attempt::Abort(e);
                    }
                }
                match self.transmit(message).await {
                    Ok(()) => Attempt::Done(()),
                    Err(e) => {
                        warn!("Send attempt {} failed: {}", attempt, e);
                        self.mark_broken().await;
                        Attempt::Retry(e.to_string())
                    }
                }
            }
        })
        .await
    }

    pub(crate) async fn send_envelope(&self, envelope: &WireEnvelope) -> Result<(), ClientError> {
        let text = envelope.to_json()?;
        debug!(">> {}", text);
        self.send_frame(Message::Text(text.into())).await
    }

    /// Start a graceful close handshake.
    pub async fn close(&self, code: u16, reason: &str) -> Result<(), ClientError> {
        let mut writer = self.shared.writer.lock().await;
        if let Some(sink) = writer.as_mut() {
            self.shared.set_state(ConnectionState::Closing);
            let frame = CloseFrame {
                code: CloseCode::from(code),
                reason: reason.to_string().into(),
            };
            sink.send(Message::Close(Some(frame))).await?;
        }
        Ok(())
    }

    /// Abort the socket without a close handshake.
    pub async fn cancel(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
        self.shared.writer.lock().await.take();
        self.shared.set_state(ConnectionState::Closed);
        if let Some(slot) = self.shared.take_slot() {
            let _ = slot.sender.send(Err(ClientError::Canceled)).await;
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
    }
}
