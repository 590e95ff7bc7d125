//! # dashscope - DashScope transport client
//!
//! The transport and protocol layer of a DashScope client: it sends one
//! logical call to the inference service over HTTP or WebSocket and hands the
//! results back as a single value, through a callback, or as a lazy stream.
//!
//! ## Features
//! - Async-first, tokio compatible
//! - HTTP calls with optional Server-Sent Events output
//! - WebSocket duplex tasks (`run-task` / `continue-task` / `finish-task`)
//!   with reconnect and bounded send retry
//! - One result type and one error type for both transports
//!
//! ## Architecture
//!
//! 1. **`ServiceOption`** describes the endpoint: protocol, streaming mode,
//!    HTTP method and path.
//! 2. **`RequestDescriptor`** describes one call: model, input, parameters and
//!    optional binary or streamed input.
//! 3. **`Client`** executes calls. [`HttpTransport`] and
//!    [`WebSocketTransport`] implement it; [`ApiClient`] picks one from the
//!    service's protocol.
//!
//! Every result is a [`UnifiedResult`]; every failure is a [`ClientError`]
//! whose [`status`](ClientError::status) gives the service-style [`Status`].
//!
//! ## Example
//! ```no_run
//! use dashscope::{ApiClient, Client, RequestDescriptor, ServiceOption, TransportOptions};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = ServiceOption::task("aigc", "text-generation", "generation");
//!     let client = ApiClient::new(service, TransportOptions::from_env())?;
//!
//!     let request = RequestDescriptor::new("qwen-turbo")
//!         .with_input(json!({"prompt": "Hello!"}));
//!
//!     let result = client.call(request).await?;
//!     println!("{:?}", result.output);
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod callback;
pub mod client;
pub mod headers;
pub mod http;
pub mod options;
pub mod request;
pub mod result;
pub mod sse;
pub mod status;
pub mod websocket;

pub use api::ApiClient;
pub use callback::ResultCallback;
pub use client::{Client, ClientError, ResultStream};
pub use http::HttpTransport;
pub use options::{ServiceOption, TransportOptions};
pub use request::{InputItem, RequestDescriptor};
pub use result::{ResultOutput, UnifiedResult};
pub use status::Status;
pub use websocket::WebSocketTransport;
