//! Session transport over real TCP: handshake, JSON line frames, binary
//! envelope frames, and limit rejections.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use mesh_protocol::frame::{FrameCodec, FrameHeader, FRAME_HEADER_LEN};
use mesh_protocol::message::WireMessage;
use mesh_server::config::Config;
use mesh_server::runtime::Runtime;

async fn start_server(mut config: Config) -> (Arc<Runtime>, std::net::SocketAddr) {
    config.server.port = 0;
    let runtime = Runtime::build(config);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    {
        let runtime = runtime.clone();
        tokio::spawn(async move {
            let _ = runtime.serve(listener).await;
        });
    }
    (runtime, addr)
}

async fn send_line(stream: &mut TcpStream, msg: &WireMessage) {
    let bytes = FrameCodec::default().encode_json(msg).unwrap();
    stream.write_all(&bytes).await.unwrap();
}

async fn read_line(reader: &mut BufReader<&mut TcpStream>) -> WireMessage {
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    serde_json::from_str(line.trim_end()).unwrap()
}

fn initialize_msg(agent: &str) -> WireMessage {
    WireMessage::request(
        "init",
        "initialize",
        json!({
            "agent_id": agent,
            "tenant_id": "t1",
            "token": "secret-token-123",
            "capabilities": ["mesh:read", "mesh:write"],
        }),
    )
}

#[tokio::test]
async fn handshake_then_ping_over_json_lines() {
    let (_runtime, addr) = start_server(Config::default()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    send_line(&mut stream, &initialize_msg("agent-a")).await;

    let mut reader = BufReader::new(&mut stream);
    let response = read_line(&mut reader).await;
    assert!(response.error.is_none());
    let session_id = response.result.unwrap()["session_id"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(!session_id.is_empty());

    drop(reader);
    send_line(
        &mut stream,
        &WireMessage::request("r1", "ping", json!({})),
    )
    .await;
    let mut reader = BufReader::new(&mut stream);
    let pong = read_line(&mut reader).await;
    assert_eq!(pong.id.as_deref(), Some("r1"));
    assert_eq!(pong.result.unwrap()["status"], "healthy");
}

#[tokio::test]
async fn binary_frames_are_accepted_after_handshake() {
    let (_runtime, addr) = start_server(Config::default()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    send_line(&mut stream, &initialize_msg("agent-a")).await;
    let mut reader = BufReader::new(&mut stream);
    let response = read_line(&mut reader).await;
    assert!(response.error.is_none());
    drop(reader);

    // A compressed binary frame: the payload is large enough to cross the
    // default threshold.
    let codec = FrameCodec::default();
    let request = WireMessage::request(
        "r1",
        "agent.register",
        json!({ "capabilities": vec!["review"; 400] }),
    );
    let frame = codec.encode_binary(&request).unwrap();
    stream.write_all(&frame).await.unwrap();

    let mut reader = BufReader::new(&mut stream);
    let response = read_line(&mut reader).await;
    assert_eq!(response.id.as_deref(), Some("r1"));
    assert!(response.error.is_none());
    let profile: Value = response.result.unwrap();
    assert_eq!(profile["agent_id"], "agent-a");
}

#[tokio::test]
async fn negotiated_binary_format_gets_binary_responses() {
    let (_runtime, addr) = start_server(Config::default()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut init = initialize_msg("agent-a");
    if let Some(params) = init.params.as_mut().and_then(|p| p.as_object_mut()) {
        params.insert("format".to_string(), json!("binary"));
    }
    send_line(&mut stream, &init).await;

    // The handshake reply already arrives as a binary frame.
    let mut header_bytes = [0u8; FRAME_HEADER_LEN];
    stream.read_exact(&mut header_bytes).await.unwrap();
    let header = FrameHeader::decode(&header_bytes).unwrap();
    let mut payload = vec![0u8; header.payload_len as usize];
    stream.read_exact(&mut payload).await.unwrap();

    let response = FrameCodec::default()
        .decode_payload(&header, &payload)
        .unwrap();
    assert!(response.error.is_none());
    assert!(response.result.unwrap()["session_id"].as_str().is_some());
}

#[tokio::test]
async fn bad_token_is_rejected_at_handshake() {
    let (_runtime, addr) = start_server(Config::default()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut msg = initialize_msg("agent-a");
    msg.params = Some(json!({
        "agent_id": "agent-a",
        "tenant_id": "t1",
        "token": "short",
    }));
    send_line(&mut stream, &msg).await;

    let mut reader = BufReader::new(&mut stream);
    let response = read_line(&mut reader).await;
    assert_eq!(response.error.unwrap().code, 401);

    // The connection is closed afterwards.
    let mut buf = [0u8; 1];
    let read = stream.read(&mut buf).await.unwrap();
    assert_eq!(read, 0);
}

#[tokio::test]
async fn agent_connection_cap_returns_typed_error() {
    let mut config = Config::default();
    config.pool.max_per_agent = 1;
    let (_runtime, addr) = start_server(config).await;

    let mut first = TcpStream::connect(addr).await.unwrap();
    send_line(&mut first, &initialize_msg("agent-a")).await;
    let mut reader = BufReader::new(&mut first);
    assert!(read_line(&mut reader).await.error.is_none());
    drop(reader);

    let mut second = TcpStream::connect(addr).await.unwrap();
    send_line(&mut second, &initialize_msg("agent-a")).await;
    let mut reader = BufReader::new(&mut second);
    let denial = read_line(&mut reader).await;
    assert_eq!(denial.error.unwrap().code, 429);
}

#[tokio::test]
async fn disconnect_closes_the_session() {
    let (runtime, addr) = start_server(Config::default()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    send_line(&mut stream, &initialize_msg("agent-a")).await;
    let mut reader = BufReader::new(&mut stream);
    let _ = read_line(&mut reader).await;
    drop(reader);

    send_line(
        &mut stream,
        &WireMessage::request("r1", "disconnect", json!({})),
    )
    .await;
    let mut reader = BufReader::new(&mut stream);
    let response = read_line(&mut reader).await;
    assert!(response.error.is_none());

    // The pool drops the session shortly after.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(runtime.state.pool.stats().total_sessions, 0);
}
