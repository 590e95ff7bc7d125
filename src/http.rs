//! HTTP transport: blocking, callback and SSE streaming calls.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client as ReqwestClient, RequestBuilder};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::callback::{spawn_callback, ResultCallback};
use crate::client::{Client, ClientError, ResultStream};
use crate::headers::{build_headers, HeaderTarget, RequestEncryptor, ENCRYPTION_KEY_HEADER};
use crate::options::{HttpMethod, NetworkLogLevel, ServiceOption, TransportOptions};
use crate::request::RequestDescriptor;
use crate::result::{NetworkResponse, UnifiedResult};
use crate::sse::{SSEResponseExt, SseEvent};
use crate::status::{codes, Status};

/// Build a configured HTTP client from transport options.
pub fn build_http_client(options: &TransportOptions) -> Result<ReqwestClient, ClientError> {
    let mut builder = ReqwestClient::builder();

    if let Some(t) = options.connect_timeout {
        builder = builder.connect_timeout(t);
    }
    if let Some(t) = options.read_timeout {
        builder = builder.read_timeout(t);
    }
    if let Some(n) = options.connection_pool_size {
        builder = builder.pool_max_idle_per_host(n);
    }
    if let Some(t) = options.connection_idle_timeout {
        builder = builder.pool_idle_timeout(t);
    }
    if let Some(proxy_options) = &options.proxy {
        let mut proxy = reqwest::Proxy::all(proxy_options.url())?;
        if let (Some(user), Some(password)) = (&proxy_options.username, &proxy_options.password) {
            proxy = proxy.basic_auth(user, password);
        }
        builder = builder.proxy(proxy);
    }

    Ok(builder.build()?)
}

/// Extension trait for RequestBuilder that logs request body.
pub trait RequestBuilderExt {
    /// Set JSON request body and log it at [`NetworkLogLevel::Body`].
    fn json_logged<T: Serialize + ?Sized>(self, json: &T, level: NetworkLogLevel) -> Self;
}

impl RequestBuilderExt for RequestBuilder {
    fn json_logged<T: Serialize + ?Sized>(self, json: &T, level: NetworkLogLevel) -> Self {
        if level >= NetworkLogLevel::Body {
            if let Ok(req_body) = serde_json::to_string_pretty(json) {
                debug!("API request body ({} bytes):\n{}", req_body.len(), req_body);
            }
        }

        self.json(json)
    }
}

/// Extension trait for Response that logs response body.
#[async_trait]
pub trait ResponseExt {
    /// Get response text and log it according to `level`. Consumes the response.
    async fn text_logged(self, level: NetworkLogLevel) -> Result<String, reqwest::Error>;
}

#[async_trait]
impl ResponseExt for reqwest::Response {
    async fn text_logged(self, level: NetworkLogLevel) -> Result<String, reqwest::Error> {
        if level >= NetworkLogLevel::Basic {
            debug!("API response {} from {}", self.status(), self.url());
        }
        if level >= NetworkLogLevel::Headers {
            debug!("API response headers: {:?}", self.headers());
        }
        let text = self.text().await?;
        if level >= NetworkLogLevel::Body {
            debug!("API response ({} bytes):\n{}", text.len(), text);
        }
        Ok(text)
    }
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Serialize)]
struct HttpRequestBody<'a> {
    model: &'a str,
    input: Value,
    parameters: &'a Map<String, Value>,
    resources: Option<&'a Value>,
}

/// Outcome of one SSE event.
#[derive(Debug)]
enum SseOutcome {
    Emit(UnifiedResult),
    Done,
    Fail(ClientError),
}

/// HTTP transport for one service.
///
/// Cheap to clone; clones share the connection pool and the request limit.
#[derive(Clone)]
pub struct HttpTransport {
    client: ReqwestClient,
    service: Arc<ServiceOption>,
    options: Arc<TransportOptions>,
    limiter: Option<Arc<Semaphore>>,
    encryptor: Option<Arc<dyn RequestEncryptor>>,
}

impl HttpTransport {
    pub fn new(service: ServiceOption, options: TransportOptions) -> Result<Self, ClientError> {
        Self::from_shared(Arc::new(service), Arc::new(options))
    }

    pub(crate) fn from_shared(
        service: Arc<ServiceOption>,
        options: Arc<TransportOptions>,
    ) -> Result<Self, ClientError> {
        let client = build_http_client(&options)?;
        let limiter = options.request_limit().map(|n| Arc::new(Semaphore::new(n)));
        Ok(Self {
            client,
            service,
            options,
            limiter,
            encryptor: None,
        })
    }

    /// Install the hook used for requests with `encrypt_request` set.
    pub fn with_encryptor(mut self, encryptor: Arc<dyn RequestEncryptor>) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    pub fn service(&self) -> &ServiceOption {
        &self.service
    }

    /// Execute the call and decode the single response.
    ///
    /// SSE services are consumed to the end and the last result is returned.
    pub async fn call(&self, request: RequestDescriptor) -> Result<UnifiedResult, ClientError> {
        if self.service.is_sse {
            let mut last = None;
            let mut results = self.stream_out(request);
            while let Some(item) = results.next().await {
                last = Some(item?);
            }
            return Ok(last.unwrap_or_default());
        }

        let builder = self.prepare(&request, false)?;
        let _permit = self.acquire().await?;
        let level = self.options.network_log_level;

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text_logged(level).await?;

        if !status.is_success() {
            return Err(ClientError::Api(Status::from_error_body(status.as_u16(), &body)));
        }

        let network = NetworkResponse {
            headers,
            ..NetworkResponse::text(status.as_u16(), body)
        };
        UnifiedResult::from_response(network, self.service.is_flatten())
    }

    /// Open a Server-Sent-Event stream for the call.
    ///
    /// Nothing is sent until the returned stream is first polled. The stream
    /// ends after `[DONE]`, or with exactly one error.
    pub fn stream_out(&self, request: RequestDescriptor) -> ResultStream {
        let this = self.clone();
        Box::pin(async_stream::stream! {
            let builder = match this.prepare(&request, true) {
                Ok(builder) => builder,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            let _permit = match this.acquire().await {
                Ok(permit) => permit,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            let level = this.options.network_log_level;

            let response = match builder.send().await {
                Ok(response) => response,
                Err(e) => {
                    yield Err(ClientError::from(e));
                    return;
                }
            };
            let status = response.status();
            if !status.is_success() {
                let body = response.text_logged(level).await.unwrap_or_default();
                yield Err(ClientError::Api(Status::from_error_body(status.as_u16(), &body)));
                return;
            }

            let headers = response.headers().clone();
            let flatten = this.service.is_flatten();
            let mut events = Box::pin(response.sse());

            while let Some(event) = events.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        let status = Status::new(status.as_u16(), codes::NETWORK_ERROR, e.to_string());
                        yield Err(ClientError::Api(status));
                        return;
                    }
                };
                if level >= NetworkLogLevel::Body {
                    debug!("SSE event {:?}: {}", event.event, event.data);
                }
                match classify_event(event, status.as_u16(), &headers, flatten) {
                    SseOutcome::Emit(result) => yield Ok(result),
                    SseOutcome::Done => return,
                    SseOutcome::Fail(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        })
    }

    fn streams_output(&self) -> bool {
        self.service.is_sse || self.service.streaming_mode.streams_output()
    }

    async fn acquire(&self) -> Result<Option<OwnedSemaphorePermit>, ClientError> {
        match &self.limiter {
            Some(limiter) => limiter
                .clone()
                .acquire_owned()
                .await
                .map(Some)
                .map_err(|_| ClientError::Canceled),
            None => Ok(None),
        }
    }

    fn prepare(&self, request: &RequestDescriptor, sse: bool) -> Result<RequestBuilder, ClientError> {
        let api_key = request.resolve_api_key(self.options.api_key.as_deref())?;
        let mut headers = build_headers(
            &api_key,
            request,
            &self.service,
            &self.options.headers,
            HeaderTarget::Http { sse },
        )?;
        let url = self.service.http_url();
        let level = self.options.network_log_level;

        if level >= NetworkLogLevel::Basic {
            debug!("{:?} {}", self.service.http_method, url);
        }
        if level >= NetworkLogLevel::Headers {
            debug!("Request headers: {:?}", headers.keys().collect::<Vec<_>>());
        }

        let builder = self.client.request(self.service.http_method.into(), &url);
        let builder = match self.service.http_method {
            HttpMethod::Get => builder.headers(headers).query(&query_pairs(&request.parameters)),
            HttpMethod::Post | HttpMethod::Delete => {
                let input = if request.encrypt_request {
                    let encryptor = self.encryptor.as_ref().ok_or_else(|| {
                        ClientError::Config("request encryption requested but no encryptor installed".to_string())
                    })?;
                    let encrypted = encryptor.encrypt(&request.input)?;
                    headers.insert(
                        HeaderName::from_static("x-dashscope-encryptionkey"),
                        HeaderValue::from_str(&encrypted.key_header).map_err(|e| {
                            ClientError::Config(format!("invalid {} value: {}", ENCRYPTION_KEY_HEADER, e))
                        })?,
                    );
                    encrypted.input
                } else {
                    request.input.clone()
                };
                let body = HttpRequestBody {
                    model: &request.model,
                    input,
                    parameters: &request.parameters,
                    resources: request.resources.as_ref(),
                };
                builder.headers(headers).json_logged(&body, level)
            }
        };

        Ok(builder)
    }
}

#[async_trait]
impl Client for HttpTransport {
    async fn call(&self, request: RequestDescriptor) -> Result<UnifiedResult, ClientError> {
        HttpTransport::call(self, request).await
    }

    async fn stream(&self, request: RequestDescriptor) -> Result<ResultStream, ClientError> {
        if self.streams_output() {
            return Ok(self.stream_out(request));
        }
        let result = HttpTransport::call(self, request).await?;
        Ok(Box::pin(stream::once(async move { Ok(result) })))
    }

    fn call_with_callback(
        &self,
        request: RequestDescriptor,
        callback: Box<dyn ResultCallback>,
    ) -> JoinHandle<()> {
        let this = self.clone();
        spawn_callback(async move { Client::stream(&this, request).await }, callback)
    }
}

/// GET query pairs; strings are sent verbatim, other values as JSON text.
fn query_pairs(parameters: &Map<String, Value>) -> Vec<(String, String)> {
    parameters
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| {
            let value = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), value)
        })
        .collect()
}

fn classify_event(event: SseEvent, http_status: u16, headers: &HeaderMap, flatten: bool) -> SseOutcome {
    let status_code = event.status_code.unwrap_or(http_status);

    if event.event.as_deref() == Some("error") {
        return SseOutcome::Fail(ClientError::Api(Status::from_error_body(status_code, &event.data)));
    }
    if event.is_done() {
        return SseOutcome::Done;
    }

    let response = NetworkResponse {
        headers: headers.clone(),
        event: event.event,
        ..NetworkResponse::text(status_code, event.data)
    };
    match UnifiedResult::from_response(response, flatten) {
        Ok(result) => SseOutcome::Emit(result),
        Err(e) => SseOutcome::Fail(e),
    }
}
