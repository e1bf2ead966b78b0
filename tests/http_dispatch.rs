//! HTTP dispatch against a live server.

use std::sync::Arc;
use std::time::Duration;

use netplane::http::{ContentType, Request, StatusCode};
use netplane::routing::{Handler, HandlerMeta};
use netplane::ServerContext;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

mod common;

#[tokio::test]
async fn get_details_as_json() {
    let server = common::start(common::config()).await;
    let response = common::client()
        .get(server.url("/services/network/GetDetails"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert!(response.headers()["content-type"].to_str().unwrap().starts_with("application/json"));
    assert!(response.headers()["server"].to_str().unwrap().starts_with("netplane/"));
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["details"]["uuid"], server.uuid());
    assert_eq!(body["details"]["port"], server.addr.port());
}

#[tokio::test]
async fn xml_is_negotiated() {
    let server = common::start(common::config()).await;
    let body = common::client()
        .get(server.url("/services/network/GetPriority"))
        .header("Accept", "application/xml")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("<Priority>0</Priority>"), "{body}");
}

#[tokio::test]
async fn plist_is_negotiated() {
    let server = common::start(common::config()).await;
    let response = common::client()
        .get(server.url("/services/network/GetPriority"))
        .header("Accept", "application/plist")
        .send()
        .await
        .unwrap();
    assert!(response.headers()["content-type"].to_str().unwrap().starts_with("application/plist"));
    let body = response.text().await.unwrap();
    assert!(body.contains("<dict><key>Priority</key><integer>0</integer></dict>"), "{body}");
}

#[tokio::test]
async fn help_pages_revalidate() {
    let server = common::start(common::config()).await;
    let client = common::client();

    let first = client.get(server.url("/services/network/help")).send().await.unwrap();
    assert_eq!(first.status(), 200);
    let tag = first.headers()["etag"].to_str().unwrap().to_string();

    let again = client
        .get(server.url("/services/network/help"))
        .header("If-None-Match", &tag)
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), 304);
    assert_eq!(again.headers()["etag"].to_str().unwrap(), tag);
    assert!(again.bytes().await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_paths_are_not_found() {
    let server = common::start(common::config()).await;
    let client = common::client();
    for path in ["/nothing/here", "/services/network/NoSuchMethod", "/services/unknown/Thing"] {
        let status = client.get(server.url(path)).send().await.unwrap().status();
        assert_eq!(status, 404, "{path}");
    }
}

#[tokio::test]
async fn help_and_options() {
    let server = common::start(common::config()).await;
    let client = common::client();

    let help = client
        .get(server.url("/services/network/help"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(help.contains("GetDetails"));
    assert!(help.contains("GetPeers"));

    let options = client
        .request(reqwest::Method::OPTIONS, server.url("/services/network/GetUuid"))
        .send()
        .await
        .unwrap();
    assert_eq!(options.status(), 200);
    assert_eq!(options.headers()["allow"], "GET, HEAD, OPTIONS");

    let wrong_verb = client.post(server.url("/services/network/GetUuid")).send().await.unwrap();
    assert_eq!(wrong_verb.status(), 400);
}

#[tokio::test]
async fn authentication_and_tokens() {
    let server = common::start(common::auth_config()).await;
    let client = common::client();

    let denied = client.get(server.url("/services/network/GetUuid")).send().await.unwrap();
    assert_eq!(denied.status(), 401);
    assert_eq!(denied.headers()["www-authenticate"], "Basic realm=\"netplane-test\"");

    let allowed = client
        .get(server.url("/services/network/GetUuid"))
        .basic_auth(common::USER, Some(common::PASSWORD))
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.status(), 200);

    let token: Value = client
        .get(server.url("/services/auth/GetWebSocketToken"))
        .basic_auth(common::USER, Some(common::PASSWORD))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let token = token["token"].as_str().unwrap().to_string();

    let url = server.url(&format!("/services/network/GetUuid?accesstoken={token}"));
    assert_eq!(client.get(&url).send().await.unwrap().status(), 200);
    assert_eq!(client.get(&url).send().await.unwrap().status(), 401);
}

/// Answers everything below its signature with the path it was given.
struct Mirror(HandlerMeta);

impl Handler for Mirror {
    fn meta(&self) -> &HandlerMeta {
        &self.0
    }

    fn process(&self, _: &ServerContext, request: &mut Request) {
        let body = format!("mirror {}", request.path());
        request.set_status(StatusCode::Ok);
        request.set_response(ContentType::Plain, body.into_bytes());
    }
}

#[tokio::test]
async fn recursive_handlers_receive_unregistered_subpaths() {
    let server = common::start(common::config()).await;
    let mirror = Mirror(HandlerMeta::new("/services/mirror/", "mirror").recursive());
    assert!(server.context.register(Arc::new(mirror)));
    let client = common::client();

    let deep = client
        .get(server.url("/services/mirror/a/b/Unregistered"))
        .send()
        .await
        .unwrap();
    assert_eq!(deep.status(), 200);
    assert_eq!(deep.text().await.unwrap(), "mirror /services/mirror/a/b/Unregistered");

    // Falls to the recursive services index, which reports the miss itself.
    let index = client.get(server.url("/services/nothing/Here")).send().await.unwrap();
    assert_eq!(index.status(), 404);
    assert!(index.text().await.unwrap().contains("No service at"));

    // Nothing recursive covers this prefix.
    let unrelated = client.get(server.url("/elsewhere/Thing")).send().await.unwrap();
    assert_eq!(unrelated.status(), 404);
    assert_eq!(unrelated.text().await.unwrap(), "Not found");
}

#[tokio::test]
async fn tokens_cannot_buy_more_tokens() {
    let server = common::start(common::auth_config()).await;
    let client = common::client();

    let issued: Value = client
        .get(server.url("/services/auth/GetWebSocketToken"))
        .basic_auth(common::USER, Some(common::PASSWORD))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let token = issued["token"].as_str().unwrap();

    let chained = client
        .get(server.url(&format!("/services/auth/GetWebSocketToken?accesstoken={token}")))
        .send()
        .await
        .unwrap();
    assert_eq!(chained.status(), 401);
    assert_eq!(chained.headers()["www-authenticate"], "Basic realm=\"netplane-test\"");
    assert!(!chained.text().await.unwrap().contains("token\":"));

    // The rejected attempt still spent the token.
    let reuse = client
        .get(server.url(&format!("/services/network/GetUuid?accesstoken={token}")))
        .send()
        .await
        .unwrap();
    assert_eq!(reuse.status(), 401);
}

#[tokio::test]
async fn keep_alive_serves_several_requests() {
    let server = common::start(common::config()).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    let request = "GET /services/network/GetPriority HTTP/1.1\r\nHost: x\r\n\r\n";
    stream
        .write_all(format!("{request}{request}").as_bytes())
        .await
        .unwrap();

    let mut seen = String::new();
    let mut buf = [0u8; 4096];
    while seen.matches("HTTP/1.1 200 OK").count() < 2 {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0, "connection closed early: {seen}");
        seen.push_str(&String::from_utf8_lossy(&buf[..n]));
    }
}

#[tokio::test]
async fn body_arriving_in_pieces_is_reassembled() {
    let server = common::start(common::config()).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(b"POST /services/network/GetUuid HTTP/1.1\r\nHost: x\r\nContent-Length: 10\r\n\r\n")
        .await
        .unwrap();
    for piece in [&b"0123"[..], b"456", b"789"] {
        tokio::time::sleep(Duration::from_millis(30)).await;
        stream.write_all(piece).await.unwrap();
    }

    let mut buf = vec![0u8; 4096];
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    // GetUuid only accepts GET, so a complete request yields a 400 rather than a hang.
    let text = String::from_utf8_lossy(&buf[..n]);
    assert!(text.starts_with("HTTP/1.1 400"), "{text}");
}

#[tokio::test]
async fn malformed_request_closes_without_response() {
    let server = common::start(common::config()).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream.write_all(b"NONSENSE\r\n\r\n").await.unwrap();
    let mut buf = vec![0u8; 256];
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
}
