//! WebSocket upgrade, framing and JSON-RPC against a live server.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use netplane::http::auth::basic_header;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

mod common;

async fn next_text<S>(ws: &mut S) -> String
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("message in time")
            .expect("stream open")
            .expect("valid frame");
        if let Message::Text(text) = message {
            return text.as_str().to_string();
        }
    }
}

#[tokio::test]
async fn echo_mode_echoes_messages() {
    let server = common::start(common::config()).await;
    let (mut ws, response) = tokio_tungstenite::connect_async(server.ws_url("/echo"))
        .await
        .unwrap();
    assert_eq!(response.status(), 101);

    ws.send(Message::Text("hello".into())).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "hello");

    ws.send(Message::Binary(vec![1u8, 2, 3].into())).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reply.into_data().to_vec(), vec![1u8, 2, 3]);

    ws.close(None).await.unwrap();
}

#[tokio::test]
async fn json_rpc_over_websocket() {
    let server = common::start(common::config()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(server.ws_url("/")).await.unwrap();

    let request = json!({"jsonrpc": "2.0", "method": "/services/network/GetUuid", "params": {}, "id": 11});
    ws.send(Message::Text(request.to_string().into())).await.unwrap();
    let reply: Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
    assert_eq!(reply["id"], 11);
    assert_eq!(reply["result"], server.uuid());

    let request = json!({"jsonrpc": "2.0", "method": "/services/network/Bogus", "id": 12});
    ws.send(Message::Text(request.to_string().into())).await.unwrap();
    let reply: Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
    assert_eq!(reply["error"]["code"], -32601);
}

#[tokio::test]
async fn shutdown_closes_with_going_away() {
    let server = common::start(common::config()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(server.ws_url("/echo")).await.unwrap();
    server.stop();

    let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match message {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1001),
        other => panic!("expected close, got {other:?}"),
    }
}

#[tokio::test]
async fn upgrade_requires_token_when_auth_is_on() {
    let server = common::start(common::auth_config()).await;
    assert!(tokio_tungstenite::connect_async(server.ws_url("/")).await.is_err());

    let token: Value = common::client()
        .get(server.url("/services/auth/GetWebSocketToken"))
        .basic_auth(common::USER, Some(common::PASSWORD))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let url = server.ws_url(&format!("/?accesstoken={}", token["token"].as_str().unwrap()));

    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    ws.close(None).await.unwrap();
    // Single use.
    assert!(tokio_tungstenite::connect_async(url.as_str()).await.is_err());
}

async fn call(ws: &mut WsStream, method: &str, id: u64) -> Value {
    let request = json!({"jsonrpc": "2.0", "method": method, "params": {}, "id": id});
    ws.send(Message::Text(request.to_string().into())).await.unwrap();
    serde_json::from_str(&next_text(ws).await).unwrap()
}

#[tokio::test]
async fn rpc_runs_as_the_upgrading_user() {
    let server = common::start(common::auth_config()).await;

    let mut request = server.ws_url("/").into_client_request().unwrap();
    let credentials = basic_header(common::USER, common::PASSWORD);
    request
        .headers_mut()
        .insert("Authorization", credentials.parse().unwrap());
    let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    let reply = call(&mut ws, "/services/auth/GetWebSocketToken", 1).await;
    let token = reply["result"].as_str().unwrap();
    let loopback = Some("127.0.0.1".parse().unwrap());
    assert_eq!(
        server.context.auth().tokens().redeem(token, loopback),
        Some(common::USER.to_string())
    );

    // A socket opened with a token may not mint further tokens.
    let token: Value = common::client()
        .get(server.url("/services/auth/GetWebSocketToken"))
        .basic_auth(common::USER, Some(common::PASSWORD))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let url = server.ws_url(&format!("/?accesstoken={}", token["token"].as_str().unwrap()));
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let reply = call(&mut ws, "/services/auth/GetWebSocketToken", 2).await;
    assert_eq!(reply["error"]["code"], -32001);
    assert_eq!(reply["id"], 2);
}

/// Raw handshake so the test controls every byte that follows.
async fn raw_upgrade(server: &common::TestServer) -> TcpStream {
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    let request = format!(
        "GET / HTTP/1.1\r\nHost: {}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        server.addr
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    assert!(head.starts_with("HTTP/1.1 101"), "{head}");
    assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"), "{head}");
    stream
}

async fn read_close_code(stream: &mut TcpStream) -> u16 {
    let mut header = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut header))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(header[0], 0x88, "expected a final close frame");
    u16::from_be_bytes([header[2], header[3]])
}

#[tokio::test]
async fn oversized_ping_is_a_protocol_error() {
    let server = common::start(common::config()).await;
    let mut stream = raw_upgrade(&server).await;
    // Masked ping declaring a 200 byte payload.
    stream
        .write_all(&[0x89, 0x80 | 126, 0x00, 200, 1, 2, 3, 4])
        .await
        .unwrap();
    assert_eq!(read_close_code(&mut stream).await, 1002);
}

#[tokio::test]
async fn stray_continuation_is_a_protocol_error() {
    let server = common::start(common::config()).await;
    let mut stream = raw_upgrade(&server).await;
    stream.write_all(&[0x80, 0x80, 1, 2, 3, 4]).await.unwrap();
    assert_eq!(read_close_code(&mut stream).await, 1002);
}

#[tokio::test]
async fn unmasked_client_frame_is_a_protocol_error() {
    let server = common::start(common::config()).await;
    let mut stream = raw_upgrade(&server).await;
    stream.write_all(&[0x81, 0x02, b'h', b'i']).await.unwrap();
    assert_eq!(read_close_code(&mut stream).await, 1002);
}
