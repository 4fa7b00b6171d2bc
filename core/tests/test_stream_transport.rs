/// Stream transport tests against scripted raw HTTP servers

use hotelchat_core::config::{Config, Identity};
use hotelchat_core::live::{SseConnector, StreamConnector, StreamListener};
use hotelchat_core::messenger_types::Message;
use hotelchat_core::ImError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

#[derive(Debug)]
enum Event {
    Message(Message),
    Ping,
    Error(ImError),
}

struct Recorder {
    tx: mpsc::UnboundedSender<Event>,
}

impl StreamListener for Recorder {
    fn on_message(&self, message: Message) {
        let _ = self.tx.send(Event::Message(message));
    }

    fn on_ping(&self) {
        let _ = self.tx.send(Event::Ping);
    }

    fn on_error(&self, error: ImError) {
        let _ = self.tx.send(Event::Error(error));
    }
}

fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Recorder { tx }), rx)
}

enum Step {
    Write(String),
    Sleep(Duration),
    /// Wait for the test to release the server
    Wait(oneshot::Receiver<()>),
    /// Keep the connection open
    Hold,
}

const SSE_HEAD: &str =
    "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\n\r\n";

/// Accepts one connection, reads the request head, then plays `script`
async fn scripted_server(script: Vec<Step>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            head.extend_from_slice(&buf[..n]);
        }
        let head = String::from_utf8_lossy(&head);
        assert!(head.starts_with("GET /api/v1/im/conversations/c1/stream"));
        assert!(head.to_ascii_lowercase().contains("authorization: bearer u1"));

        for step in script {
            match step {
                Step::Write(data) => {
                    if socket.write_all(data.as_bytes()).await.is_err() {
                        return;
                    }
                    let _ = socket.flush().await;
                }
                Step::Sleep(d) => tokio::time::sleep(d).await,
                Step::Wait(rx) => {
                    let _ = rx.await;
                }
                Step::Hold => tokio::time::sleep(Duration::from_secs(60)).await,
            }
        }
    });

    addr
}

fn connector(addr: SocketAddr, idle_timeout: Duration) -> SseConnector {
    let config = Config {
        api_base_url: format!("http://{}/api/v1/im", addr),
        identity: Identity::new("u1", "u1"),
        stream_idle_timeout: idle_timeout,
        ..Config::default()
    };
    SseConnector::new(&config).unwrap()
}

fn message_frame(id: &str, text: &str) -> String {
    format!(
        "event: message.new\ndata: {{\"message\":{{\"_id\":\"{}\",\"conversation_id\":\"c1\",\"sender_id\":\"u2\",\"text\":\"{}\",\"created_at\":\"2024-01-01T00:00:00Z\"}}}}\n\n",
        id, text
    )
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("listener dropped")
}

#[tokio::test]
async fn test_ping_and_split_message_frame() {
    let frame = message_frame("m1", "hi");
    let (first, second) = frame.split_at(40);
    let addr = scripted_server(vec![
        Step::Write(SSE_HEAD.to_string()),
        Step::Write("event: ping\n\n".to_string()),
        Step::Write(first.to_string()),
        Step::Sleep(Duration::from_millis(50)),
        Step::Write(second.to_string()),
        Step::Hold,
    ])
    .await;

    let (listener, mut rx) = recorder();
    let _handle = connector(addr, Duration::from_secs(5)).open("c1", listener);

    assert!(matches!(next(&mut rx).await, Event::Ping));
    match next(&mut rx).await {
        Event::Message(msg) => {
            assert_eq!(msg.id, "m1");
            assert_eq!(msg.text.as_deref(), Some("hi"));
        }
        other => panic!("expected message, got {:?}", other),
    }
}

#[tokio::test]
async fn test_malformed_frame_is_skipped() {
    let addr = scripted_server(vec![
        Step::Write(SSE_HEAD.to_string()),
        Step::Write("event: message.new\ndata: {not json\n\n".to_string()),
        Step::Write(message_frame("m2", "after bad")),
        Step::Hold,
    ])
    .await;

    let (listener, mut rx) = recorder();
    let _handle = connector(addr, Duration::from_secs(5)).open("c1", listener);

    match next(&mut rx).await {
        Event::Message(msg) => assert_eq!(msg.id, "m2"),
        other => panic!("expected m2, got {:?}", other),
    }
}

#[tokio::test]
async fn test_server_close_reports_error_once() {
    let addr = scripted_server(vec![
        Step::Write(SSE_HEAD.to_string()),
        Step::Write(message_frame("m1", "bye")),
    ])
    .await;

    let (listener, mut rx) = recorder();
    let handle = connector(addr, Duration::from_secs(5)).open("c1", listener);

    assert!(matches!(next(&mut rx).await, Event::Message(_)));
    assert!(matches!(next(&mut rx).await, Event::Error(ImError::Stream(_))));

    // Reader finished and dropped its listener
    assert!(timeout(Duration::from_secs(2), rx.recv()).await.unwrap().is_none());
    assert!(!handle.is_active());
}

#[tokio::test]
async fn test_non_success_status_reports_error() {
    let addr = scripted_server(vec![Step::Write(
        "HTTP/1.1 403 Forbidden\r\nContent-Type: application/json\r\nContent-Length: 16\r\n\r\n{\"error\":\"nope\"}"
            .to_string(),
    )])
    .await;

    let (listener, mut rx) = recorder();
    let _handle = connector(addr, Duration::from_secs(5)).open("c1", listener);

    match next(&mut rx).await {
        Event::Error(e) => assert_eq!(e.status(), Some(403)),
        other => panic!("expected error, got {:?}", other),
    }
    assert!(timeout(Duration::from_secs(2), rx.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_idle_stream_times_out() {
    let addr = scripted_server(vec![Step::Write(SSE_HEAD.to_string()), Step::Hold]).await;

    let (listener, mut rx) = recorder();
    let _handle = connector(addr, Duration::from_millis(200)).open("c1", listener);

    assert!(matches!(next(&mut rx).await, Event::Error(ImError::Timeout(_))));
}

#[tokio::test]
async fn test_pings_keep_stream_alive() {
    let addr = scripted_server(vec![
        Step::Write(SSE_HEAD.to_string()),
        Step::Sleep(Duration::from_millis(150)),
        Step::Write("event: ping\n\n".to_string()),
        Step::Sleep(Duration::from_millis(150)),
        Step::Write("event: ping\n\n".to_string()),
        Step::Sleep(Duration::from_millis(150)),
        Step::Write(message_frame("m3", "still here")),
        Step::Hold,
    ])
    .await;

    let (listener, mut rx) = recorder();
    let _handle = connector(addr, Duration::from_millis(250)).open("c1", listener);

    assert!(matches!(next(&mut rx).await, Event::Ping));
    assert!(matches!(next(&mut rx).await, Event::Ping));
    assert!(matches!(next(&mut rx).await, Event::Message(_)));
}

#[tokio::test]
async fn test_cancel_stops_callbacks() {
    let (release_tx, release_rx) = oneshot::channel();
    let addr = scripted_server(vec![
        Step::Write(SSE_HEAD.to_string()),
        Step::Write(message_frame("m1", "first")),
        Step::Wait(release_rx),
        Step::Write(message_frame("m2", "too late")),
        Step::Hold,
    ])
    .await;

    let (listener, mut rx) = recorder();
    let mut handle = connector(addr, Duration::from_secs(5)).open("c1", listener);

    assert!(matches!(next(&mut rx).await, Event::Message(_)));
    handle.cancel();
    assert!(!handle.is_active());
    let _ = release_tx.send(());

    // Either nothing arrives or the aborted reader drops the listener
    match timeout(Duration::from_millis(500), rx.recv()).await {
        Ok(None) | Err(_) => {}
        Ok(Some(event)) => panic!("callback after cancel: {:?}", event),
    }
}

#[tokio::test]
async fn test_crlf_framed_stream() {
    let frame = message_frame("m4", "crlf").replace('\n', "\r\n");
    let cut = frame.len() - 3;
    let addr = scripted_server(vec![
        Step::Write(SSE_HEAD.to_string()),
        Step::Write("event: ping\r\n\r\n".to_string()),
        Step::Write(frame[..cut].to_string()),
        Step::Sleep(Duration::from_millis(50)),
        Step::Write(frame[cut..].to_string()),
        Step::Hold,
    ])
    .await;

    let (listener, mut rx) = recorder();
    let _handle = connector(addr, Duration::from_secs(5)).open("c1", listener);

    assert!(matches!(next(&mut rx).await, Event::Ping));
    match next(&mut rx).await {
        Event::Message(msg) => assert_eq!(msg.id, "m4"),
        other => panic!("expected m4, got {:?}", other),
    }
}

#[tokio::test]
async fn test_comments_and_partial_frames_count_as_activity() {
    let frame = message_frame("m5", "slow");
    let (head, tail) = frame.split_at(30);
    let addr = scripted_server(vec![
        Step::Write(SSE_HEAD.to_string()),
        Step::Sleep(Duration::from_millis(150)),
        Step::Write(": keepalive\n\n".to_string()),
        Step::Sleep(Duration::from_millis(150)),
        Step::Write(head.to_string()),
        Step::Sleep(Duration::from_millis(150)),
        Step::Write(tail.to_string()),
        Step::Hold,
    ])
    .await;

    let (listener, mut rx) = recorder();
    let _handle = connector(addr, Duration::from_millis(250)).open("c1", listener);

    match next(&mut rx).await {
        Event::Message(msg) => assert_eq!(msg.id, "m5"),
        other => panic!("expected m5, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unterminated_frame_fails_stream() {
    let flood = format!("data: {}", "x".repeat(1024 * 1024 + 1024));
    let addr = scripted_server(vec![
        Step::Write(SSE_HEAD.to_string()),
        Step::Write(flood),
        Step::Hold,
    ])
    .await;

    let (listener, mut rx) = recorder();
    let _handle = connector(addr, Duration::from_secs(5)).open("c1", listener);

    assert!(matches!(next(&mut rx).await, Event::Error(ImError::Stream(_))));
}
