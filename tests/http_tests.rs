mod common;

use std::sync::{Arc, Mutex};

use common::{http_server, init_tracing, json_response, split_request, sse_response, test_options};
use dashscope::headers::{EncryptedInput, RequestEncryptor};
use dashscope::options::{HttpMethod, StreamingMode};
use dashscope::status::codes;
use dashscope::{
    ApiClient, Client, ClientError, HttpTransport, RequestDescriptor, ResultCallback, ServiceOption,
    TransportOptions, UnifiedResult,
};
use futures::StreamExt;
use serde_json::{json, Value};

fn generation(base: &str) -> ServiceOption {
    ServiceOption::task("aigc", "text-generation", "generation").with_base_http_url(base)
}

/// Wraps the input so the test can see what was encrypted.
struct Sealer;

impl RequestEncryptor for Sealer {
    fn encrypt(&self, input: &Value) -> Result<EncryptedInput, ClientError> {
        Ok(EncryptedInput {
            input: json!({"sealed": input.to_string()}),
            key_header: "key-v1".to_string(),
        })
    }
}

#[tokio::test]
async fn test_call_posts_body_and_decodes_result() {
    init_tracing();
    let body = r#"{"request_id":"r0","output":{"text":"hi"},"usage":{"input_tokens":3}}"#;
    let (base, server) = http_server(vec![json_response(200, body)]).await;

    let client = ApiClient::new(generation(&base), test_options()).unwrap();
    let request = RequestDescriptor::new("qwen-turbo")
        .with_input(json!({"prompt": "hello"}))
        .with_parameter("seed", 7)
        .with_workspace("ws-1");
    let result = client.call(request).await.unwrap();

    assert_eq!(result.request_id.as_deref(), Some("r0"));
    assert_eq!(result.usage, Some(json!({"input_tokens": 3})));
    assert_eq!(result.status_code, Some(200));
    // Task services are not flattened: output is the whole envelope.
    assert_eq!(result.output.as_json().unwrap()["output"]["text"], "hi");

    let requests = server.await.unwrap();
    let (head, body) = split_request(&requests[0]);
    assert!(head.starts_with("post /api/v1/services/aigc/text-generation/generation "));
    assert!(head.contains("authorization: bearer sk-test"));
    assert!(head.contains("x-dashscope-workspace: ws-1"));
    assert!(head.contains("accept: application/json"));

    let sent: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(sent["model"], "qwen-turbo");
    assert_eq!(sent["input"]["prompt"], "hello");
    assert_eq!(sent["parameters"]["seed"], 7);
    assert!(sent.get("resources").is_none());
}

#[tokio::test]
async fn test_flatten_exposes_inner_output() {
    let body = r#"{"output":{"text":"hi"},"usage":{"total_tokens":1}}"#;
    let (base, _server) = http_server(vec![json_response(200, body)]).await;

    let transport = HttpTransport::new(generation(&base).with_flatten(true), test_options()).unwrap();
    let result = transport.call(RequestDescriptor::new("qwen-turbo")).await.unwrap();

    assert_eq!(result.output.as_json(), Some(&json!({"text": "hi"})));
    assert_eq!(result.usage, Some(json!({"total_tokens": 1})));
    // No request id in the body, falls back to the header.
    assert_eq!(result.request_id.as_deref(), Some("hdr-1"));
}

#[tokio::test]
async fn test_http_error_decodes_status() {
    let body = r#"{"code":"InvalidParameter","message":"m","request_id":"r1"}"#;
    let (base, _server) = http_server(vec![json_response(400, body)]).await;

    let client = ApiClient::new(generation(&base), test_options()).unwrap();
    match client.call(RequestDescriptor::new("qwen-turbo")).await {
        Err(ClientError::Api(status)) => {
            assert_eq!(status.status_code, 400);
            assert_eq!(status.code, "InvalidParameter");
            assert_eq!(status.message, "m");
            assert_eq!(status.request_id.as_deref(), Some("r1"));
            assert!(status.is_json);
        }
        other => panic!("unexpected result {:?}", other),
    }
}

#[tokio::test]
async fn test_unparseable_error_body() {
    let (base, _server) = http_server(vec![json_response(502, "bad gateway")]).await;

    let transport = HttpTransport::new(generation(&base), test_options()).unwrap();
    let error = transport.call(RequestDescriptor::new("m")).await.unwrap_err();
    let status = error.status();
    assert_eq!(status.status_code, 502);
    assert_eq!(status.code, codes::RESPONSE_ERROR);
    assert_eq!(status.message, "bad gateway");
    assert!(!status.is_json);
}

#[tokio::test]
async fn test_sse_stream_ends_on_done() {
    init_tracing();
    let body = concat!(
        "id:1\nevent:result\n:HTTP_STATUS/200\ndata:{\"output\":{\"text\":\"he\"},\"request_id\":\"r2\"}\n\n",
        "id:2\nevent:result\n:HTTP_STATUS/200\ndata:{\"output\":{\"text\":\"llo\"},\"request_id\":\"r2\"}\n\n",
        "data:[DONE]\n\n",
    );
    let (base, server) = http_server(vec![sse_response(body)]).await;

    let service = generation(&base)
        .with_streaming_mode(StreamingMode::Out)
        .with_sse(true)
        .with_flatten(true);
    let client = ApiClient::new(service, test_options()).unwrap();
    let results: Vec<_> = client
        .stream(RequestDescriptor::new("qwen-turbo"))
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(results.len(), 2);
    let texts: Vec<_> = results
        .into_iter()
        .map(|r| r.unwrap())
        .map(|r| {
            assert_eq!(r.event.as_deref(), Some("result"));
            r.output.as_json().unwrap()["text"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(texts, vec!["he", "llo"]);

    let requests = server.await.unwrap();
    let (head, _) = split_request(&requests[0]);
    assert!(head.contains("accept: text/event-stream"));
    assert!(head.contains("x-dashscope-sse: enable"));
    assert!(head.contains("cache-control: no-cache"));
}

#[tokio::test]
async fn test_sse_error_event_terminates_with_status() {
    let body = concat!(
        "id:1\nevent:result\ndata:{\"output\":{\"text\":\"a\"}}\n\n",
        "id:2\nevent:error\n:HTTP_STATUS/400\ndata:{\"code\":\"DataInspectionFailed\",\"message\":\"unsafe\",\"request_id\":\"r3\"}\n\n",
        "id:3\nevent:result\ndata:{\"output\":{\"text\":\"never\"}}\n\n",
    );
    let (base, _server) = http_server(vec![sse_response(body)]).await;

    let transport = HttpTransport::new(generation(&base).with_sse(true), test_options()).unwrap();
    let results: Vec<_> = transport.stream_out(RequestDescriptor::new("m")).collect().await;

    assert_eq!(results.len(), 2);
    assert!(results[0].is_ok());
    match &results[1] {
        Err(ClientError::Api(status)) => {
            assert_eq!(status.status_code, 400);
            assert_eq!(status.code, "DataInspectionFailed");
            assert_eq!(status.request_id.as_deref(), Some("r3"));
        }
        other => panic!("unexpected item {:?}", other),
    }
}

#[tokio::test]
async fn test_call_on_sse_service_returns_last_result() {
    let body = concat!(
        "event:result\ndata:{\"output\":{\"text\":\"a\"}}\n\n",
        "event:result\ndata:{\"output\":{\"text\":\"ab\"}}\n\n",
        "data:[DONE]\n\n",
    );
    let (base, _server) = http_server(vec![sse_response(body)]).await;

    let transport =
        HttpTransport::new(generation(&base).with_sse(true).with_flatten(true), test_options()).unwrap();
    let result = transport.call(RequestDescriptor::new("m")).await.unwrap();
    assert_eq!(result.output.as_json(), Some(&json!({"text": "ab"})));
}

#[tokio::test]
async fn test_get_sends_parameters_as_query() {
    let (base, server) = http_server(vec![json_response(200, r#"{"output":{"tasks":[]}}"#)]).await;

    let service = ServiceOption::general("tasks")
        .with_service_prefix(false)
        .with_http_method(HttpMethod::Get)
        .with_base_http_url(&base);
    let transport = HttpTransport::new(service, test_options()).unwrap();
    let request = RequestDescriptor::new("")
        .with_parameter("page_no", 2)
        .with_parameter("status", "RUNNING");
    let result = transport.call(request).await.unwrap();
    // General services are flattened by default.
    assert_eq!(result.output.as_json(), Some(&json!({"tasks": []})));

    let requests = server.await.unwrap();
    let (head, body) = split_request(&requests[0]);
    assert!(
        head.starts_with("get /api/v1/tasks?page_no=2&status=running "),
        "request line was {}",
        head.lines().next().unwrap_or_default()
    );
    assert!(body.is_empty());
}

#[tokio::test]
async fn test_user_agent_is_merged() {
    let (base, server) = http_server(vec![json_response(200, "{}")]).await;

    let transport = HttpTransport::new(generation(&base), test_options()).unwrap();
    let request = RequestDescriptor::new("m")
        .with_header("User-Agent", "my-app/1.0")
        .with_header("X-Trace", "abc");
    transport.call(request).await.unwrap();

    let requests = server.await.unwrap();
    let (head, _) = split_request(&requests[0]);
    let agent = head
        .lines()
        .find_map(|l| l.strip_prefix("user-agent: "))
        .unwrap()
        .to_string();
    assert!(agent.starts_with("dashscope/"));
    assert!(agent.ends_with("; my-app/1.0"));
    assert_eq!(head.matches("user-agent:").count(), 1);
    assert!(head.contains("x-trace: abc"));
}

#[tokio::test]
async fn test_async_task_header() {
    let (base, server) = http_server(vec![json_response(200, r#"{"output":{"task_id":"t"}}"#)]).await;

    let service = ServiceOption::task("aigc", "text2image", "image-synthesis")
        .with_async_task(true)
        .with_base_http_url(&base);
    let transport = HttpTransport::new(service, test_options()).unwrap();
    transport
        .call(RequestDescriptor::new("wanx-v1").with_security_check(true))
        .await
        .unwrap();

    let requests = server.await.unwrap();
    let (head, _) = split_request(&requests[0]);
    assert!(head.contains("x-dashscope-async: enable"));
    assert!(head.contains("x-dashscope-datainspection: enable"));
}

#[tokio::test]
async fn test_missing_api_key_fails_before_sending() {
    let transport = HttpTransport::new(generation("http://127.0.0.1:1"), TransportOptions::new()).unwrap();
    let error = transport.call(RequestDescriptor::new("m")).await.unwrap_err();
    assert!(matches!(error, ClientError::MissingApiKey));
    assert_eq!(error.status().code, codes::MISSING_API_KEY);
}

#[derive(Clone, Default)]
struct Recorder {
    log: Arc<Mutex<Vec<String>>>,
}

impl ResultCallback for Recorder {
    fn on_event(&self, result: UnifiedResult) {
        let text = result
            .output
            .as_json()
            .and_then(|o| o["text"].as_str())
            .unwrap_or_default()
            .to_string();
        self.log.lock().unwrap().push(format!("event:{}", text));
    }

    fn on_complete(&self) {
        self.log.lock().unwrap().push("complete".to_string());
    }

    fn on_error(&self, error: ClientError) {
        self.log.lock().unwrap().push(format!("error:{}", error.status().code));
    }
}

#[tokio::test]
async fn test_callback_sees_events_then_complete() {
    let body = concat!(
        "event:result\ndata:{\"output\":{\"text\":\"a\"}}\n\n",
        "event:result\ndata:{\"output\":{\"text\":\"b\"}}\n\n",
        "data:[DONE]\n\n",
    );
    let (base, _server) = http_server(vec![sse_response(body)]).await;

    let service = generation(&base).with_sse(true).with_flatten(true);
    let client = ApiClient::new(service, test_options()).unwrap();
    let recorder = Recorder::default();
    client
        .call_with_callback(RequestDescriptor::new("m"), Box::new(recorder.clone()))
        .await
        .unwrap();

    assert_eq!(
        *recorder.log.lock().unwrap(),
        vec!["event:a", "event:b", "complete"]
    );
}

#[tokio::test]
async fn test_callback_reports_single_error() {
    let body = r#"{"code":"Throttling","message":"slow down"}"#;
    let (base, _server) = http_server(vec![json_response(429, body)]).await;

    let client = ApiClient::new(generation(&base), test_options()).unwrap();
    let recorder = Recorder::default();
    client
        .call_with_callback(RequestDescriptor::new("m"), Box::new(recorder.clone()))
        .await
        .unwrap();

    assert_eq!(*recorder.log.lock().unwrap(), vec!["error:Throttling"]);
}

#[tokio::test]
async fn test_encrypted_request_replaces_input_and_sends_key() {
    let (base, server) = http_server(vec![json_response(200, r#"{"output":{}}"#)]).await;

    let client = ApiClient::new(generation(&base), test_options())
        .unwrap()
        .with_encryptor(Arc::new(Sealer));
    let request = RequestDescriptor::new("qwen-turbo")
        .with_input(json!({"prompt": "secret"}))
        .with_encryption(true);
    client.call(request).await.unwrap();

    let requests = server.await.unwrap();
    let (head, body) = split_request(&requests[0]);
    assert!(head.contains("x-dashscope-encryptionkey: key-v1"));
    let sent: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(sent["model"], "qwen-turbo");
    assert_eq!(sent["input"], json!({"sealed": r#"{"prompt":"secret"}"#}));
}

#[tokio::test]
async fn test_plain_request_skips_encryptor() {
    let (base, server) = http_server(vec![json_response(200, r#"{"output":{}}"#)]).await;

    let transport = HttpTransport::new(generation(&base), test_options())
        .unwrap()
        .with_encryptor(Arc::new(Sealer));
    let request = RequestDescriptor::new("qwen-turbo").with_input(json!({"prompt": "open"}));
    transport.call(request).await.unwrap();

    let requests = server.await.unwrap();
    let (head, body) = split_request(&requests[0]);
    assert!(!head.contains("x-dashscope-encryptionkey"));
    let sent: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(sent["input"]["prompt"], "open");
}

#[tokio::test]
async fn test_encryption_without_encryptor_is_config_error() {
    let transport = HttpTransport::new(generation("http://127.0.0.1:1/api/v1"), test_options()).unwrap();
    let request = RequestDescriptor::new("qwen-turbo")
        .with_input(json!({"prompt": "secret"}))
        .with_encryption(true);

    match transport.call(request).await {
        Err(ClientError::Config(message)) => assert!(message.contains("no encryptor")),
        other => panic!("unexpected result {:?}", other),
    }
}
