use super::streamable_http::{StreamSupport, StreamableHttpTransport};
use super::*;
use crate::mcp::catalog::HeaderEntry;
use serde_json::json;
use std::sync::Mutex;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn endpoint(server: &MockServer) -> TransportEndpoint {
    TransportEndpoint {
        server_id: "alpha".to_string(),
        url: format!("{}/mcp", server.uri()),
        headers: Vec::new(),
    }
}

fn request(id: i64, method: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "method": method, "params": {}})
}

fn initialized() -> Value {
    json!({"jsonrpc": "2.0", "method": "notifications/initialized"})
}

fn result_body(id: i64, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

async fn mount_initialize(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({"method": "initialize"})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("mcp-session-id", "session-1")
                .set_body_json(result_body(1, json!({"protocolVersion": "2025-06-18"}))),
        )
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({"method": "notifications/initialized"})))
        .respond_with(ResponseTemplate::new(202))
        .mount(server)
        .await;
}

#[tokio::test]
async fn buffered_captures_and_echoes_session_id() {
    let server = MockServer::start().await;
    mount_initialize(&server).await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({"method": "tools/list"})))
        .and(header("mcp-session-id", "session-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(result_body(2, json!({"tools": []}))))
        .expect(1)
        .mount(&server)
        .await;

    let mut transport = http::BufferedHttpTransport::new(endpoint(&server), TransportOptions::default());
    transport.start().await.expect("start");
    let init = transport
        .send(request(1, "initialize"), SendOptions::default())
        .await
        .expect("initialize")
        .expect("response");
    assert_eq!(init.id(), Some(&json!(1)));
    assert_eq!(transport.session().session_id.as_deref(), Some("session-1"));

    let accepted = transport
        .send(initialized(), SendOptions::default())
        .await
        .expect("notification");
    assert!(accepted.is_none());

    let listed = transport
        .send(request(2, "tools/list"), SendOptions::default())
        .await
        .expect("list")
        .expect("response");
    assert_eq!(listed.result(), Some(&json!({"tools": []})));
}

#[tokio::test]
async fn buffered_reads_inline_event_stream_and_reports_event_ids() {
    let server = MockServer::start().await;
    let body = concat!(
        "id: evt-1\n",
        "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\",\"params\":{}}\n\n",
        "id: evt-2\n",
        "event: message\n",
        "data: {\"jsonrpc\":\"2.0\",\"id\":7,\"result\":{\"ok\":true}}\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let options = TransportOptions {
        server_messages: Some(tx),
        ..TransportOptions::default()
    };
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let recorder = Arc::clone(&seen);
    let send_options = SendOptions {
        resumption_token: None,
        on_resumption_token: Some(Arc::new(move |id: &str| {
            recorder.lock().expect("lock").push(id.to_string());
        })),
    };

    let mut transport = http::BufferedHttpTransport::new(endpoint(&server), options);
    transport.start().await.expect("start");
    let response = transport
        .send(request(7, "tools/call"), send_options)
        .await
        .expect("send")
        .expect("response");

    assert_eq!(response.result(), Some(&json!({"ok": true})));
    assert_eq!(*seen.lock().expect("lock"), vec!["evt-1", "evt-2"]);
    assert_eq!(transport.session().last_event_id.as_deref(), Some("evt-2"));
    let forwarded = rx.try_recv().expect("forwarded notification");
    assert_eq!(forwarded.method(), Some("notifications/progress"));
}

#[tokio::test]
async fn non_success_status_is_terminal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let mut transport = http::BufferedHttpTransport::new(endpoint(&server), TransportOptions::default());
    transport.start().await.expect("start");
    let err = transport
        .send(request(1, "tools/call"), SendOptions::default())
        .await
        .expect_err("status error");
    match err {
        TransportError::Status { status, body } => {
            assert_eq!(status, 500);
            assert_eq!(body, "boom");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn unexpected_content_type_is_terminal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("<html></html>", "text/html"))
        .mount(&server)
        .await;

    let mut transport = http::BufferedHttpTransport::new(endpoint(&server), TransportOptions::default());
    transport.start().await.expect("start");
    let err = transport
        .send(request(1, "tools/call"), SendOptions::default())
        .await
        .expect_err("content type error");
    assert!(matches!(err, TransportError::ContentType(ref value) if value.starts_with("text/html")));
}

#[tokio::test]
async fn send_before_start_is_rejected() {
    let server = MockServer::start().await;
    let mut transport = http::BufferedHttpTransport::new(endpoint(&server), TransportOptions::default());
    let err = transport
        .send(request(1, "ping"), SendOptions::default())
        .await
        .expect_err("not started");
    assert!(matches!(err, TransportError::NotStarted));
}

#[tokio::test]
async fn configured_headers_never_replace_protocol_headers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("content-type", "application/json"))
        .and(header("x-api-key", "secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(result_body(1, json!({}))))
        .expect(1)
        .mount(&server)
        .await;

    let mut endpoint = endpoint(&server);
    endpoint.headers = vec![
        HeaderEntry {
            name: "Content-Type".to_string(),
            value: "text/plain".to_string(),
        },
        HeaderEntry {
            name: "X-Api-Key".to_string(),
            value: "secret".to_string(),
        },
    ];
    let mut transport = http::BufferedHttpTransport::new(endpoint, TransportOptions::default());
    transport.start().await.expect("start");
    transport
        .send(request(1, "ping"), SendOptions::default())
        .await
        .expect("send");

    let requests = server.received_requests().await.expect("recorded");
    let content_types: Vec<_> = requests[0].headers.get_all("content-type").iter().collect();
    assert_eq!(content_types.len(), 1);
    assert!(is_protected_header("MCP-Session-Id"));
}

#[tokio::test]
async fn persistent_stream_405_downgrades_to_buffered() {
    let server = MockServer::start().await;
    mount_initialize(&server).await;
    Mock::given(method("GET"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(405))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({"method": "tools/call"})))
        .and(header("mcp-session-id", "session-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(result_body(3, json!({"content": []}))))
        .mount(&server)
        .await;

    let mut transport = StreamableHttpTransport::new(endpoint(&server), TransportOptions::default());
    transport.start().await.expect("start");
    transport
        .send(request(1, "initialize"), SendOptions::default())
        .await
        .expect("initialize");
    let accepted = transport
        .send(initialized(), SendOptions::default())
        .await
        .expect("405 on the event stream is not an error");
    assert!(accepted.is_none());
    assert_eq!(transport.stream_support(), StreamSupport::Unsupported);

    let response = transport
        .send(request(3, "tools/call"), SendOptions::default())
        .await
        .expect("buffered send still works")
        .expect("response");
    assert_eq!(response.id(), Some(&json!(3)));
}

#[tokio::test]
async fn persistent_stream_json_reply_marks_unsupported() {
    let server = MockServer::start().await;
    mount_initialize(&server).await;
    Mock::given(method("GET"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let mut transport = StreamableHttpTransport::new(endpoint(&server), TransportOptions::default());
    transport.start().await.expect("start");
    transport
        .send(request(1, "initialize"), SendOptions::default())
        .await
        .expect("initialize");
    transport
        .send(initialized(), SendOptions::default())
        .await
        .expect("initialized");
    assert_eq!(transport.stream_support(), StreamSupport::Unsupported);
}

#[tokio::test]
async fn persistent_stream_open_is_bounded_by_request_timeout() {
    let server = MockServer::start().await;
    mount_initialize(&server).await;
    Mock::given(method("GET"))
        .and(path("/mcp"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(": keepalive\n\n", "text/event-stream")
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let options = TransportOptions {
        request_timeout: Duration::from_millis(300),
        ..TransportOptions::default()
    };
    let mut transport = StreamableHttpTransport::new(endpoint(&server), options);
    transport.start().await.expect("start");
    transport
        .send(request(1, "initialize"), SendOptions::default())
        .await
        .expect("initialize");

    let started = std::time::Instant::now();
    let accepted = transport
        .send(initialized(), SendOptions::default())
        .await
        .expect("a slow event stream is not fatal");
    assert!(accepted.is_none());
    assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    assert_eq!(transport.stream_support(), StreamSupport::Unsupported);
}

/// First GET delivers one event and ends; the listener reconnects with its id.
async fn mount_dropping_stream(server: &MockServer, second_body: &'static str) {
    Mock::given(method("GET"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            "id: evt-1\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/message\",\"params\":{\"n\":1}}\n\n",
            "text/event-stream",
        ))
        .up_to_n_times(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/mcp"))
        .and(header("last-event-id", "evt-1"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(second_body, "text/event-stream"))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(405))
        .mount(server)
        .await;
}

#[tokio::test]
async fn accepted_post_is_answered_on_the_event_stream() {
    let server = MockServer::start().await;
    mount_initialize(&server).await;
    mount_dropping_stream(
        &server,
        "id: evt-2\ndata: {\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{\"content\":[]}}\n\n",
    )
    .await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({"method": "tools/call"})))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let mut transport = StreamableHttpTransport::new(endpoint(&server), TransportOptions::default());
    transport.start().await.expect("start");
    transport
        .send(request(1, "initialize"), SendOptions::default())
        .await
        .expect("initialize");
    transport
        .send(initialized(), SendOptions::default())
        .await
        .expect("initialized");
    assert_eq!(transport.stream_support(), StreamSupport::Active);

    let response = tokio::time::timeout(
        Duration::from_secs(5),
        transport.send(request(3, "tools/call"), SendOptions::default()),
    )
    .await
    .expect("answered before the deadline")
    .expect("send")
    .expect("response");
    assert_eq!(response.id(), Some(&json!(3)));
    assert_eq!(response.result(), Some(&json!({"content": []})));
}

#[tokio::test]
async fn dropped_event_stream_reconnects_with_last_event_id() {
    let server = MockServer::start().await;
    mount_initialize(&server).await;
    mount_dropping_stream(
        &server,
        "id: evt-2\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/message\",\"params\":{\"n\":2}}\n\n",
    )
    .await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let options = TransportOptions {
        server_messages: Some(tx),
        ..TransportOptions::default()
    };
    let mut transport = StreamableHttpTransport::new(endpoint(&server), options);
    transport.start().await.expect("start");
    transport
        .send(request(1, "initialize"), SendOptions::default())
        .await
        .expect("initialize");
    transport
        .send(initialized(), SendOptions::default())
        .await
        .expect("initialized");

    let mut seen = Vec::new();
    for _ in 0..2 {
        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("message before the deadline")
            .expect("channel open");
        seen.push(message.into_value()["params"]["n"].clone());
    }
    assert_eq!(seen, vec![json!(1), json!(2)]);
    assert_eq!(transport.session().last_event_id.as_deref(), Some("evt-2"));
}

#[tokio::test]
async fn terminate_resets_stream_support() {
    let server = MockServer::start().await;
    mount_initialize(&server).await;
    mount_dropping_stream(&server, ": keepalive\n\n").await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({"method": "tools/call"})))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    let options = TransportOptions {
        request_timeout: Duration::from_secs(10),
        ..TransportOptions::default()
    };
    let mut transport = StreamableHttpTransport::new(endpoint(&server), options);
    transport.start().await.expect("start");
    transport
        .send(request(1, "initialize"), SendOptions::default())
        .await
        .expect("initialize");
    transport
        .send(initialized(), SendOptions::default())
        .await
        .expect("initialized");
    assert_eq!(transport.stream_support(), StreamSupport::Active);

    transport.terminate_session().await.expect("terminate");
    assert_eq!(transport.stream_support(), StreamSupport::Unknown);

    let accepted = tokio::time::timeout(
        Duration::from_secs(2),
        transport.send(request(4, "tools/call"), SendOptions::default()),
    )
    .await
    .expect("no wait for a stream that is gone")
    .expect("send");
    assert!(accepted.is_none());
}

#[tokio::test]
async fn resumption_replays_with_rewritten_request_id() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/mcp"))
        .and(header("last-event-id", "evt-41"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            "id: evt-42\ndata: {\"jsonrpc\":\"2.0\",\"id\":99,\"result\":{\"done\":true}}\n\n",
            "text/event-stream",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let mut transport = StreamableHttpTransport::new(endpoint(&server), TransportOptions::default());
    transport.start().await.expect("start");
    let options = SendOptions {
        resumption_token: Some("evt-41".to_string()),
        on_resumption_token: None,
    };
    let response = transport
        .send(request(5, "tools/call"), options)
        .await
        .expect("resume")
        .expect("response");

    assert_eq!(response.id(), Some(&json!(5)));
    assert_eq!(response.result(), Some(&json!({"done": true})));
    assert_eq!(transport.session().last_event_id.as_deref(), Some("evt-42"));
}

#[tokio::test]
async fn terminate_tolerates_405_and_clears_session() {
    let server = MockServer::start().await;
    mount_initialize(&server).await;
    Mock::given(method("DELETE"))
        .and(header("mcp-session-id", "session-1"))
        .respond_with(ResponseTemplate::new(405))
        .expect(1)
        .mount(&server)
        .await;

    let mut transport = http::BufferedHttpTransport::new(endpoint(&server), TransportOptions::default());
    transport.start().await.expect("start");
    transport
        .send(request(1, "initialize"), SendOptions::default())
        .await
        .expect("initialize");
    transport.terminate_session().await.expect("405 is tolerated");
    assert_eq!(transport.session().session_id, None);
}

#[tokio::test]
async fn terminate_failure_is_an_error() {
    let server = MockServer::start().await;
    mount_initialize(&server).await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let mut transport = http::BufferedHttpTransport::new(endpoint(&server), TransportOptions::default());
    transport.start().await.expect("start");
    transport
        .send(request(1, "initialize"), SendOptions::default())
        .await
        .expect("initialize");
    let err = transport.terminate_session().await.expect_err("hard error");
    assert!(matches!(err, TransportError::Status { status: 500, .. }));
    assert_eq!(transport.session().session_id.as_deref(), Some("session-1"));
}

#[tokio::test]
async fn close_stops_listener_and_clears_session() {
    let server = MockServer::start().await;
    mount_initialize(&server).await;
    Mock::given(method("GET"))
        .and(path("/mcp"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(": keepalive\n\n", "text/event-stream")
                .set_delay(std::time::Duration::from_millis(50)),
        )
        .mount(&server)
        .await;

    let mut transport = StreamableHttpTransport::new(endpoint(&server), TransportOptions::default());
    transport.start().await.expect("start");
    transport
        .send(request(1, "initialize"), SendOptions::default())
        .await
        .expect("initialize");
    transport
        .send(initialized(), SendOptions::default())
        .await
        .expect("initialized");

    transport.close().await;
    assert_eq!(transport.session(), TransportSession::default());
    assert_eq!(transport.stream_support(), StreamSupport::Unknown);
    let err = transport
        .send(request(2, "ping"), SendOptions::default())
        .await
        .expect_err("closed");
    assert!(matches!(err, TransportError::NotStarted));
}

#[test]
fn envelope_classification() {
    let response = ServerEnvelope::new(json!({"jsonrpc": "2.0", "id": 1, "result": {}}));
    assert!(response.is_response());
    let request = ServerEnvelope::new(json!({"jsonrpc": "2.0", "id": 1, "method": "sampling/createMessage"}));
    assert!(!request.is_response());
    let error = ServerEnvelope::new(json!({"id": 2, "error": {"code": -32601, "message": "nope"}}));
    assert_eq!(error.error().map(|e| e.code), Some(-32601));
    assert_eq!(
        error.with_request_id(json!("x")).id(),
        Some(&json!("x"))
    );
}
