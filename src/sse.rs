//! Server-Sent Events (SSE) stream processing utilities.
//!
//! SSE format as sent by the service:
//! ```text
//! id:1
//! event:result
//! :HTTP_STATUS/200
//! data:{"output":{"text":"he"}}
//!
//! data:[DONE]
//!
//! ```
//!
//! Fields accumulate until a blank line dispatches the event. Multiple `data:`
//! lines are joined with `\n`. Comment lines start with `:`; the
//! `:HTTP_STATUS/<code>` comment sets the status of the current event.

use futures::stream::{self, Stream, StreamExt};

use crate::client::ClientError;

/// One dispatched SSE event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
    /// Status from a `:HTTP_STATUS/<code>` comment.
    pub status_code: Option<u16>,
}

impl SseEvent {
    /// Whether this is the unnamed `[DONE]` terminator.
    pub fn is_done(&self) -> bool {
        self.event.is_none() && is_done_marker(self.data.trim())
    }
}

/// Incremental SSE parser fed line by line.
#[derive(Debug, Default)]
pub struct SseParser {
    current: SseEvent,
    has_fields: bool,
    data_lines: usize,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line without its terminator. Returns an event when the line
    /// completes one.
    pub fn feed_line(&mut self, line: &str) -> Option<SseEvent> {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            return self.flush();
        }

        if let Some(comment) = line.strip_prefix(':') {
            if let Some(code) = comment.trim().strip_prefix("HTTP_STATUS/") {
                self.current.status_code = code.trim().parse().ok();
                self.has_fields = true;
            }
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => {
                if self.data_lines > 0 {
                    self.current.data.push('\n');
                }
                self.current.data.push_str(value);
                self.data_lines += 1;
            }
            "event" => self.current.event = Some(value.trim().to_string()).filter(|e| !e.is_empty()),
            "id" => self.current.id = Some(value.trim().to_string()),
            _ => return None,
        }
        self.has_fields = true;
        None
    }

    /// Emit whatever is pending, e.g. at end of input.
    pub fn flush(&mut self) -> Option<SseEvent> {
        if !self.has_fields {
            return None;
        }
        self.has_fields = false;
        self.data_lines = 0;
        Some(std::mem::take(&mut self.current))
    }
}

/// Extension trait for `reqwest::Response` to enable SSE streaming.
///
/// # Example
/// ```ignore
/// use dashscope::sse::SSEResponseExt;
/// use futures::StreamExt;
///
/// let response = client.get("https://api.example.com/stream").send().await?;
///
/// let mut events = response.sse();
/// while let Some(event) = events.next().await {
///     let event = event?;
///     println!("{:?}: {}", event.event, event.data);
/// }
/// ```
pub trait SSEResponseExt {
    /// Convert the response into a stream of SSE events.
    ///
    /// Every event is yielded, including `[DONE]`; classifying them is left to
    /// the caller.
    fn sse(self) -> impl Stream<Item = Result<SseEvent, ClientError>> + Send;
}

impl SSEResponseExt for reqwest::Response {
    fn sse(self) -> impl Stream<Item = Result<SseEvent, ClientError>> + Send {
        sse_events(self.bytes_stream())
    }
}

/// Parse a byte stream into SSE events.
pub fn sse_events<S, B, E>(byte_stream: S) -> impl Stream<Item = Result<SseEvent, ClientError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Into<ClientError> + Send,
{
    stream::unfold(
        (Box::pin(byte_stream), Vec::<u8>::new(), SseParser::new(), false),
        |(mut byte_stream, mut buffer, mut parser, mut stream_ended)| async move {
            loop {
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let raw: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned();

                    if let Some(event) = parser.feed_line(&line) {
                        return Some((Ok(event), (byte_stream, buffer, parser, stream_ended)));
                    }
                }

                if stream_ended {
                    if !buffer.is_empty() {
                        let line = String::from_utf8_lossy(&buffer).into_owned();
                        buffer.clear();
                        parser.feed_line(&line);
                    }
                    return parser
                        .flush()
                        .map(|event| (Ok(event), (byte_stream, buffer, parser, stream_ended)));
                }

                match byte_stream.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(chunk.as_ref()),
                    Some(Err(e)) => {
                        stream_ended = true;
                        buffer.clear();
                        parser = SseParser::new();
                        return Some((Err(e.into()), (byte_stream, buffer, parser, stream_ended)));
                    }
                    None => stream_ended = true,
                }
            }
        },
    )
}

/// Parse an SSE line to extract the data portion.
///
/// # Example
/// ```
/// use dashscope::sse::parse_sse_line;
///
/// assert_eq!(parse_sse_line("data: {\"key\": \"value\"}"), Some("{\"key\": \"value\"}"));
/// assert_eq!(parse_sse_line("data:{}"), Some("{}"));
/// assert_eq!(parse_sse_line("invalid"), None);
/// ```
pub fn parse_sse_line(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(|s| s.trim())
}

/// Check if an SSE data line indicates the stream is done.
///
/// # Example
/// ```
/// use dashscope::sse::is_done_marker;
///
/// assert!(is_done_marker("[DONE]"));
/// assert!(!is_done_marker(""));
/// assert!(!is_done_marker("{\"data\": \"value\"}"));
/// ```
pub fn is_done_marker(data: &str) -> bool {
    data == "[DONE]"
}
