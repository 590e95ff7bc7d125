//! Core client trait and error types.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;

use crate::callback::ResultCallback;
use crate::request::RequestDescriptor;
use crate::result::UnifiedResult;
use crate::status::{codes, Status, WEBSOCKET_ERROR_STATUS};

/// Lazy, cancelable sequence of results. Dropping it cancels the call.
pub type ResultStream = Pin<Box<dyn Stream<Item = Result<UnifiedResult, ClientError>> + Send>>;

/// Errors that can occur during client operations.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The service answered with an error.
    #[error("API error: {0}")]
    Api(Status),

    /// The WebSocket connection could not be established.
    #[error("Connection error: {0}")]
    Connection(Status),

    #[error("No API key provided, set DASHSCOPE_API_KEY or pass one with the request")]
    MissingApiKey,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Input stream error: {0}")]
    Input(String),

    #[error("Connection already has a call in flight")]
    Busy,

    #[error("Call canceled")]
    Canceled,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// Structured status for this error.
    ///
    /// Service errors keep their decoded status; local failures are given a
    /// client-side code so every error reaching the caller carries a status.
    pub fn status(&self) -> Status {
        match self {
            ClientError::Api(status) | ClientError::Connection(status) => status.clone(),
            ClientError::MissingApiKey => Status::new(401, codes::MISSING_API_KEY, self.to_string()),
            ClientError::Http(e) => Status::new(
                e.status().map(|s| s.as_u16()).unwrap_or(0),
                codes::NETWORK_ERROR,
                e.to_string(),
            ),
            ClientError::WebSocket(e) => {
                Status::new(WEBSOCKET_ERROR_STATUS, codes::CONNECTION_ERROR, e.to_string())
            }
            ClientError::Parse(e) => Status::new(0, codes::RESPONSE_ERROR, e.to_string()),
            ClientError::Input(msg) => Status::new(0, codes::INPUT_ERROR, msg.clone()),
            ClientError::Busy => Status::new(0, codes::CONNECTION_BUSY, self.to_string()),
            ClientError::Canceled => Status::new(0, codes::CANCELED, self.to_string()),
            ClientError::Config(msg) => Status::new(0, codes::CONFIG_ERROR, msg.clone()),
        }
    }
}

/// A transport that can execute one logical call.
#[async_trait]
pub trait Client: Send + Sync {
    /// Execute the call and wait for its terminal event.
    async fn call(&self, request: RequestDescriptor) -> Result<UnifiedResult, ClientError>;

    /// Execute the call and return its results as a lazy sequence.
    async fn stream(&self, request: RequestDescriptor) -> Result<ResultStream, ClientError>;

    /// Execute the call on a background task, pushing results to `callback`.
    ///
    /// The callback sees `on_event` zero or more times followed by exactly one
    /// of `on_complete` or `on_error`.
    fn call_with_callback(
        &self,
        request: RequestDescriptor,
        callback: Box<dyn ResultCallback>,
    ) -> JoinHandle<()>;
}
