//! Protocol-selecting entry point.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::callback::ResultCallback;
use crate::client::{Client, ClientError, ResultStream};
use crate::headers::RequestEncryptor;
use crate::http::HttpTransport;
use crate::options::{Protocol, ServiceOption, TransportOptions};
use crate::request::RequestDescriptor;
use crate::result::UnifiedResult;
use crate::websocket::WebSocketTransport;

/// Client for one service, dispatching to the transport its
/// [`Protocol`] names.
///
/// # Example
/// ```no_run
/// use dashscope::{ApiClient, Client, RequestDescriptor, ServiceOption, TransportOptions};
/// use dashscope::options::StreamingMode;
/// use futures::StreamExt;
/// use serde_json::json;
///
/// # async fn run() -> Result<(), dashscope::ClientError> {
/// let service = ServiceOption::task("aigc", "text-generation", "generation")
///     .with_streaming_mode(StreamingMode::Out)
///     .with_sse(true);
/// let client = ApiClient::new(service, TransportOptions::from_env())?;
///
/// let request = RequestDescriptor::new("qwen-turbo")
///     .with_input(json!({"prompt": "Hello"}))
///     .with_parameter("incremental_output", true);
///
/// let mut results = client.stream(request).await?;
/// while let Some(result) = results.next().await {
///     println!("{:?}", result?.output);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ApiClient {
    http: HttpTransport,
    websocket: Option<WebSocketTransport>,
}

impl ApiClient {
    pub fn new(service: ServiceOption, options: TransportOptions) -> Result<Self, ClientError> {
        let service = Arc::new(service);
        let options = Arc::new(options);
        let http = HttpTransport::from_shared(service.clone(), options.clone())?;
        let websocket = match service.protocol {
            Protocol::WebSocket => Some(WebSocketTransport::from_shared(service, options)),
            Protocol::Http => None,
        };
        Ok(Self { http, websocket })
    }

    /// Build from `DASHSCOPE_*` environment variables.
    pub fn from_env(service: ServiceOption) -> Result<Self, ClientError> {
        Self::new(service.with_base_urls_from_env(), TransportOptions::from_env())
    }

    /// Install the request encryption hook (HTTP only).
    pub fn with_encryptor(mut self, encryptor: Arc<dyn RequestEncryptor>) -> Self {
        self.http = self.http.with_encryptor(encryptor);
        self
    }

    pub fn service(&self) -> &ServiceOption {
        self.http.service()
    }

    pub fn http(&self) -> &HttpTransport {
        &self.http
    }

    /// The WebSocket transport, for services using that protocol.
    pub fn websocket(&self) -> Option<&WebSocketTransport> {
        self.websocket.as_ref()
    }

    fn transport(&self) -> &dyn Client {
        match &self.websocket {
            Some(websocket) => websocket as &dyn Client,
            None => &self.http,
        }
    }
}

#[async_trait]
impl Client for ApiClient {
    async fn call(&self, request: RequestDescriptor) -> Result<UnifiedResult, ClientError> {
        self.transport().call(request).await
    }

    async fn stream(&self, request: RequestDescriptor) -> Result<ResultStream, ClientError> {
        self.transport().stream(request).await
    }

    fn call_with_callback(
        &self,
        request: RequestDescriptor,
        callback: Box<dyn ResultCallback>,
    ) -> JoinHandle<()> {
        self.transport().call_with_callback(request, callback)
    }
}
