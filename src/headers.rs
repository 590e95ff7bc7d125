//! Request header construction shared by the HTTP and WebSocket transports.

use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE,
    USER_AGENT,
};
use serde_json::Value;

use crate::client::ClientError;
use crate::options::ServiceOption;
use crate::request::RequestDescriptor;

pub const WORKSPACE_HEADER: &str = "X-DashScope-WorkSpace";
pub const DATA_INSPECTION_HEADER: &str = "X-DashScope-DataInspection";
pub const ASYNC_HEADER: &str = "X-DashScope-Async";
pub const SSE_HEADER: &str = "X-DashScope-SSE";
pub const ENCRYPTION_KEY_HEADER: &str = "X-DashScope-EncryptionKey";

/// Encrypted form of a request `input`.
#[derive(Debug, Clone)]
pub struct EncryptedInput {
    /// Replaces `input` in the request body.
    pub input: Value,
    /// Sent as `X-DashScope-EncryptionKey`.
    pub key_header: String,
}

/// Hook that encrypts the `input` object of an HTTP request body.
pub trait RequestEncryptor: Send + Sync {
    fn encrypt(&self, input: &Value) -> Result<EncryptedInput, ClientError>;
}

/// Generated user agent, with the caller's agent appended when given.
pub fn user_agent(custom: Option<&str>) -> String {
    let mut agent = format!(
        "dashscope/{}; rust; platform/{}; processor/{}",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH,
    );
    if let Some(custom) = custom.map(str::trim).filter(|c| !c.is_empty()) {
        agent.push_str("; ");
        agent.push_str(custom);
    }
    agent
}

/// Kind of exchange the headers are built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderTarget {
    Http { sse: bool },
    WebSocket,
}

/// Build the headers of one call.
///
/// Extra transport headers are applied first and the request's own headers
/// override them. A `user-agent` in either set is merged into the generated
/// user agent instead of replacing it.
pub fn build_headers(
    api_key: &str,
    request: &RequestDescriptor,
    service: &ServiceOption,
    extra: &std::collections::HashMap<String, String>,
    target: HeaderTarget,
) -> Result<HeaderMap, ClientError> {
    let mut headers = HeaderMap::new();
    let mut custom_agent: Option<String> = None;

    for (key, value) in extra.iter().chain(request.headers.iter()) {
        if key.eq_ignore_ascii_case(USER_AGENT.as_str()) {
            custom_agent = Some(value.clone());
            continue;
        }
        headers.insert(header_name(key)?, header_value(value)?);
    }

    headers.insert(USER_AGENT, header_value(&user_agent(custom_agent.as_deref()))?);
    headers.insert(AUTHORIZATION, header_value(&format!("Bearer {}", api_key))?);

    if let Some(workspace) = request.workspace.as_deref().filter(|w| !w.is_empty()) {
        headers.insert(header_name(WORKSPACE_HEADER)?, header_value(workspace)?);
    }
    if request.security_check {
        headers.insert(header_name(DATA_INSPECTION_HEADER)?, HeaderValue::from_static("enable"));
    }

    if let HeaderTarget::Http { sse } = target {
        if service.is_async_task {
            headers.insert(header_name(ASYNC_HEADER)?, HeaderValue::from_static("enable"));
        }
        if sse {
            headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
            headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            headers.insert(header_name(SSE_HEADER)?, HeaderValue::from_static("enable"));
        } else {
            headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }

    Ok(headers)
}

fn header_name(name: &str) -> Result<HeaderName, ClientError> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| ClientError::Config(format!("invalid header name {:?}: {}", name, e)))
}

fn header_value(value: &str) -> Result<HeaderValue, ClientError> {
    HeaderValue::from_str(value)
        .map_err(|e| ClientError::Config(format!("invalid header value: {}", e)))
}
