//! Service and transport configuration.
//!
//! [`ServiceOption`] describes *what* is called (protocol, endpoint, streaming
//! mode) and [`TransportOptions`] describes *how* the network is used
//! (timeouts, proxy, pool sizing, retry). Both are immutable once a transport
//! is built and are shared read-only between calls.

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_HTTP_BASE_URL: &str = "https://dashscope.aliyuncs.com/api/v1";
pub const DEFAULT_WEBSOCKET_BASE_URL: &str = "wss://dashscope.aliyuncs.com/api-ws/v1/inference";

/// Wire protocol used for a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    WebSocket,
}

/// Which directions of a call are streamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamingMode {
    #[default]
    None,
    In,
    Out,
    Duplex,
}

impl StreamingMode {
    /// Value of the envelope header `streaming` field.
    pub fn as_str(self) -> &'static str {
        match self {
            StreamingMode::None => "none",
            StreamingMode::In => "in",
            StreamingMode::Out => "out",
            StreamingMode::Duplex => "duplex",
        }
    }

    /// Whether the caller streams input to the service.
    pub fn streams_input(self) -> bool {
        matches!(self, StreamingMode::In | StreamingMode::Duplex)
    }

    /// Whether the service streams output back.
    pub fn streams_output(self) -> bool {
        matches!(self, StreamingMode::Out | StreamingMode::Duplex)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Delete,
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Location of a service below the base URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointPath {
    /// Task-style service addressed by group, task and function segments.
    Task {
        group: String,
        task: String,
        function: String,
    },
    /// General pass-through service addressed by a raw path.
    Raw(String),
}

/// Immutable description of one remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceOption {
    pub protocol: Protocol,
    pub streaming_mode: StreamingMode,
    pub http_method: HttpMethod,
    pub path: EndpointPath,
    pub is_sse: bool,
    pub is_async_task: bool,
    /// Prefix the path with `/services`.
    pub is_service: bool,
    /// Explicit flatten override. See [`ServiceOption::is_flatten`].
    pub flatten: Option<bool>,
    pub base_http_url: String,
    pub base_websocket_url: String,
}

impl ServiceOption {
    /// A task-style service, e.g. `aigc/text-generation/generation`.
    pub fn task(
        group: impl Into<String>,
        task: impl Into<String>,
        function: impl Into<String>,
    ) -> Self {
        Self::with_path(EndpointPath::Task {
            group: group.into(),
            task: task.into(),
            function: function.into(),
        })
    }

    /// A general service called through a raw path.
    pub fn general(path: impl Into<String>) -> Self {
        Self::with_path(EndpointPath::Raw(path.into()))
    }

    fn with_path(path: EndpointPath) -> Self {
        Self {
            protocol: Protocol::Http,
            streaming_mode: StreamingMode::None,
            http_method: HttpMethod::Post,
            path,
            is_sse: false,
            is_async_task: false,
            is_service: true,
            flatten: None,
            base_http_url: DEFAULT_HTTP_BASE_URL.to_string(),
            base_websocket_url: DEFAULT_WEBSOCKET_BASE_URL.to_string(),
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_streaming_mode(mut self, mode: StreamingMode) -> Self {
        self.streaming_mode = mode;
        self
    }

    pub fn with_http_method(mut self, method: HttpMethod) -> Self {
        self.http_method = method;
        self
    }

    pub fn with_sse(mut self, is_sse: bool) -> Self {
        self.is_sse = is_sse;
        self
    }

    pub fn with_async_task(mut self, is_async_task: bool) -> Self {
        self.is_async_task = is_async_task;
        self
    }

    pub fn with_service_prefix(mut self, is_service: bool) -> Self {
        self.is_service = is_service;
        self
    }

    pub fn with_flatten(mut self, flatten: bool) -> Self {
        self.flatten = Some(flatten);
        self
    }

    pub fn with_base_http_url(mut self, url: impl Into<String>) -> Self {
        self.base_http_url = url.into();
        self
    }

    pub fn with_base_websocket_url(mut self, url: impl Into<String>) -> Self {
        self.base_websocket_url = url.into();
        self
    }

    /// Override the base URLs from `DASHSCOPE_HTTP_BASE_URL` and
    /// `DASHSCOPE_WEBSOCKET_BASE_URL` when they are set.
    pub fn with_base_urls_from_env(mut self) -> Self {
        if let Ok(url) = std::env::var("DASHSCOPE_HTTP_BASE_URL") {
            self.base_http_url = url;
        }
        if let Ok(url) = std::env::var("DASHSCOPE_WEBSOCKET_BASE_URL") {
            self.base_websocket_url = url;
        }
        self
    }

    /// Full HTTP URL of the service.
    pub fn http_url(&self) -> String {
        let mut url = self.base_http_url.trim_end_matches('/').to_string();
        if self.is_service {
            url.push_str("/services");
        }
        match &self.path {
            EndpointPath::Task {
                group,
                task,
                function,
            } => {
                for segment in [group, task, function] {
                    let segment = segment.trim_matches('/');
                    if !segment.is_empty() {
                        url.push('/');
                        url.push_str(segment);
                    }
                }
            }
            EndpointPath::Raw(path) => {
                let path = path.trim_start_matches('/');
                if !path.is_empty() {
                    url.push('/');
                    url.push_str(path);
                }
            }
        }
        url
    }

    /// URL the WebSocket transport connects to.
    pub fn websocket_url(&self) -> String {
        match &self.path {
            EndpointPath::Raw(path) if !path.trim_matches('/').is_empty() => format!(
                "{}/{}",
                self.base_websocket_url.trim_end_matches('/'),
                path.trim_start_matches('/')
            ),
            _ => self.base_websocket_url.clone(),
        }
    }

    /// Whether results expose only the inner `output` value.
    ///
    /// Defaults to `false` for task-style services and `true` for general ones.
    pub fn is_flatten(&self) -> bool {
        self.flatten
            .unwrap_or(matches!(self.path, EndpointPath::Raw(_)))
    }

    /// `(task_group, task, function)` for the WebSocket payload.
    pub fn task_segments(&self) -> Option<(&str, &str, &str)> {
        match &self.path {
            EndpointPath::Task {
                group,
                task,
                function,
            } => Some((group, task, function)),
            EndpointPath::Raw(_) => None,
        }
    }
}

/// Verbosity of request/response logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkLogLevel {
    None,
    #[default]
    Basic,
    Headers,
    Body,
}

impl NetworkLogLevel {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "basic" => Some(Self::Basic),
            "headers" => Some(Self::Headers),
            "body" => Some(Self::Body),
            _ => None,
        }
    }
}

/// Proxy settings for the HTTP transport.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyOptions {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyOptions {
    pub fn url(&self) -> String {
        if self.host.contains("://") {
            format!("{}:{}", self.host, self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }
}

/// Retry policy of the WebSocket transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryOptions {
    /// Attempts per connect and per frame send.
    pub max_attempts: u32,
    /// Pause after a failed connect attempt.
    pub connect_delay: Duration,
    /// Pause after a failed frame transmission.
    pub send_delay: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            connect_delay: Duration::from_secs(10),
            send_delay: Duration::from_secs(5),
        }
    }
}

/// Transport configuration options.
///
/// Controls how requests are sent over the network.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Default API key when the request does not carry one.
    pub api_key: Option<String>,
    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    /// Applied to every WebSocket frame send.
    pub write_timeout: Option<Duration>,
    pub proxy: Option<ProxyOptions>,
    /// Idle connections kept per host.
    pub connection_pool_size: Option<usize>,
    /// In-flight HTTP request limit.
    pub max_requests: Option<usize>,
    pub max_requests_per_host: Option<usize>,
    pub connection_idle_timeout: Option<Duration>,
    pub network_log_level: NetworkLogLevel,
    /// Additional HTTP headers to send with every request.
    pub headers: HashMap<String, String>,
    /// Buffered results per call before the reader waits for the consumer.
    pub channel_capacity: usize,
    pub retry: RetryOptions,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            api_key: None,
            connect_timeout: Some(Duration::from_secs(120)),
            read_timeout: Some(Duration::from_secs(300)),
            write_timeout: Some(Duration::from_secs(60)),
            proxy: None,
            connection_pool_size: Some(32),
            max_requests: Some(32),
            max_requests_per_host: Some(32),
            connection_idle_timeout: Some(Duration::from_secs(300)),
            network_log_level: NetworkLogLevel::Basic,
            headers: HashMap::new(),
            channel_capacity: 64,
            retry: RetryOptions::default(),
        }
    }
}

impl TransportOptions {
    /// Create new default transport options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `DASHSCOPE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by the values `lookup` returns for the
    /// `DASHSCOPE_*` keys. Unparseable values are ignored with a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut options = Self::default();

        let number = |key: &str| -> Option<u64> {
            let raw = lookup(key)?;
            match raw.trim().parse::<u64>() {
                Ok(n) => Some(n),
                Err(_) => {
                    warn!("Ignoring {}={:?}: not a number", key, raw);
                    None
                }
            }
        };
        let seconds = |key: &str| number(key).map(Duration::from_secs);

        if let Some(key) = lookup("DASHSCOPE_API_KEY").filter(|k| !k.trim().is_empty()) {
            options.api_key = Some(key);
        }
        if let Some(t) = seconds("DASHSCOPE_CONNECTION_TIMEOUT") {
            options.connect_timeout = Some(t);
        }
        if let Some(t) = seconds("DASHSCOPE_READ_TIMEOUT") {
            options.read_timeout = Some(t);
        }
        if let Some(t) = seconds("DASHSCOPE_WRITE_TIMEOUT") {
            options.write_timeout = Some(t);
        }
        if let Some(t) = seconds("DASHSCOPE_CONNECTION_IDLE_TIME") {
            options.connection_idle_timeout = Some(t);
        }
        if let Some(n) = number("DASHSCOPE_CONNECTION_POOL_SIZE") {
            options.connection_pool_size = Some(n as usize);
        }
        if let Some(n) = number("DASHSCOPE_MAXIMUM_ASYNC_REQUESTS") {
            options.max_requests = Some(n as usize);
        }
        if let Some(n) = number("DASHSCOPE_MAXIMUM_ASYNC_REQUESTS_PER_HOST") {
            options.max_requests_per_host = Some(n as usize);
        }
        if let Some(level) = lookup("DASHSCOPE_NETWORK_LOGGING_LEVEL") {
            match NetworkLogLevel::parse(&level) {
                Some(level) => options.network_log_level = level,
                None => warn!("Ignoring unknown network logging level {:?}", level),
            }
        }
        if let Some(host) = lookup("DASHSCOPE_PROXY_HOST") {
            let port = number("DASHSCOPE_PROXY_PORT")
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or(80);
            options.proxy = Some(ProxyOptions {
                host,
                port,
                username: lookup("DASHSCOPE_PROXY_USER"),
                password: lookup("DASHSCOPE_PROXY_PASSWORD"),
            });
        }

        options
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set the timeout for establishing connections.
    pub fn with_connect_timeout(mut self, duration: Duration) -> Self {
        self.connect_timeout = Some(duration);
        self
    }

    pub fn with_read_timeout(mut self, duration: Duration) -> Self {
        self.read_timeout = Some(duration);
        self
    }

    pub fn with_write_timeout(mut self, duration: Duration) -> Self {
        self.write_timeout = Some(duration);
        self
    }

    /// Set the proxy.
    pub fn with_proxy(mut self, proxy: ProxyOptions) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_network_log_level(mut self, level: NetworkLogLevel) -> Self {
        self.network_log_level = level;
        self
    }

    pub fn with_max_requests(mut self, total: usize, per_host: usize) -> Self {
        self.max_requests = Some(total);
        self.max_requests_per_host = Some(per_host);
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    /// Add a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Effective in-flight limit for the single service host.
    pub fn request_limit(&self) -> Option<usize> {
        match (self.max_requests, self.max_requests_per_host) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
        .filter(|n| *n > 0)
    }
}
