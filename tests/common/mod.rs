#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use dashscope::options::RetryOptions;
use dashscope::TransportOptions;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing_subscriber::EnvFilter;

pub type ServerSocket = WebSocketStream<TcpStream>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Options with a test key and no retry delays.
pub fn test_options() -> TransportOptions {
    TransportOptions::new()
        .with_api_key("sk-test")
        .with_retry(RetryOptions {
            max_attempts: 3,
            connect_delay: Duration::ZERO,
            send_delay: Duration::ZERO,
        })
}

/// Serve one canned response per connection, returning the raw requests.
pub async fn http_server(responses: Vec<String>) -> (String, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let mut requests = Vec::new();
        for response in responses {
            let (mut socket, _) = listener.accept().await.unwrap();
            requests.push(read_request(&mut socket).await);
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        }
        requests
    });
    (format!("http://{}/api/v1", addr), handle)
}

async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
            let length = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Split a raw request into its lowercased head and its body.
pub fn split_request(raw: &str) -> (String, String) {
    match raw.split_once("\r\n\r\n") {
        Some((head, body)) => (head.to_lowercase(), body.to_string()),
        None => (raw.to_lowercase(), String::new()),
    }
}

pub fn json_response(status: u16, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nx-request-id: hdr-1\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        if status < 300 { "OK" } else { "Error" },
        body.len(),
        body
    )
}

pub fn sse_response(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n{}",
        body
    )
}

/// Accept one WebSocket connection and run `handler` on it.
pub async fn ws_server<F, Fut>(handler: F) -> (String, JoinHandle<()>)
where
    F: FnOnce(ServerSocket) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(socket).await.unwrap();
        handler(ws).await;
    });
    (format!("ws://{}/api-ws/v1/inference", addr), handle)
}

/// Next text frame as JSON. Panics on anything else.
pub async fn next_json(ws: &mut ServerSocket) -> Value {
    match next_frame(ws).await {
        Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("expected text frame, got {:?}", other),
    }
}

/// Next data frame, skipping control frames.
pub async fn next_frame(ws: &mut ServerSocket) -> Message {
    loop {
        match ws.next().await {
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(message)) => return message,
            other => panic!("connection ended: {:?}", other),
        }
    }
}

pub async fn send_event(ws: &mut ServerSocket, event: &str, task_id: &str, payload: Value) {
    let frame = json!({
        "header": {"event": event, "task_id": task_id, "attributes": {}},
        "payload": payload,
    });
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();
}

/// Keep reading until the client goes away.
pub async fn drain(ws: &mut ServerSocket) {
    while let Some(Ok(_)) = ws.next().await {}
}
