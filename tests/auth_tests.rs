#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! Integration tests for the HTTP log-on client against a local responder.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use trivia_session::bootstrap::{Authenticator, HttpAuthenticator};
use trivia_session::{LoginErrorKind, TriviaError};

/// Serve one request with `status` and `body`; returns the base URI and the
/// raw request text.
async fn serve_once(status: &'static str, body: &'static str) -> (String, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let (request_tx, request_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
            if request_complete(&request) {
                break;
            }
        }
        let response = format!(
            "HTTP/1.1 {status}\r\nContent-Length: {}\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        let _ = socket.shutdown().await;
        let _ = request_tx.send(String::from_utf8_lossy(&request).into_owned());
    });

    (base, request_rx)
}

fn request_complete(request: &[u8]) -> bool {
    let text = String::from_utf8_lossy(request);
    let Some((head, body)) = text.split_once("\r\n\r\n") else {
        return false;
    };
    let length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    body.len() >= length
}

#[tokio::test]
async fn successful_log_on_returns_the_body_as_token() {
    let (base, request) = serve_once("200 OK", "session-token").await;

    let token = HttpAuthenticator::new().log_on(&base, "alice", "").await.unwrap();
    assert_eq!(token, "session-token");

    let request = request.await.unwrap();
    assert!(request.starts_with("POST /api/Account/LogOn HTTP/1.1"));
    assert!(request.to_ascii_lowercase().contains("content-type: application/x-www-form-urlencoded"));
    assert!(request.ends_with("login=alice&password="));
}

#[tokio::test]
async fn status_codes_map_to_typed_reasons() {
    for (status, expected) in [
        ("403 Forbidden", LoginErrorKind::ForbiddenName),
        ("409 Conflict", LoginErrorKind::DuplicateName),
        ("429 Too Many Requests", LoginErrorKind::RateLimited),
        ("500 Internal Server Error", LoginErrorKind::Other),
    ] {
        let (base, _request) = serve_once(status, "").await;
        let err = HttpAuthenticator::new().log_on(&base, "alice", "").await.unwrap_err();
        match err {
            TriviaError::Login { kind, .. } => assert_eq!(kind, expected, "status {status}"),
            other => panic!("unexpected error for {status}: {other}"),
        }
    }
}

#[tokio::test]
async fn unreachable_server_is_reported() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let err = HttpAuthenticator::new().log_on(&base, "alice", "").await.unwrap_err();
    assert!(matches!(
        err,
        TriviaError::Login {
            kind: LoginErrorKind::CannotReachServer,
            ..
        }
    ));
}
