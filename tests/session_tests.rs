#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! Integration tests for connection ownership, reconnect and rejoin.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{init_tracing, join_ok, join_refused, MockConnector, MockServer, Reply};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use trivia_session::{
    ConnectOutcome, ConnectionConfig, ConnectionListener, ConnectionState, JoinDescriptor,
    JoinGameErrorType, JoinOutcome, LobbyClient, ReconnectPolicy, Role, SessionManager, Sex,
    TriviaError,
};

const WAIT: Duration = Duration::from_secs(2);

struct Recorder {
    seen: mpsc::UnboundedSender<String>,
}

impl ConnectionListener for Recorder {
    fn on_connected(&self) {
        let _ = self.seen.send("connected".into());
    }

    fn on_message(&self, target: &str, _arguments: &[Value]) {
        let _ = self.seen.send(format!("message:{target}"));
    }

    fn on_reconnecting(&self, _reason: Option<&str>) {
        let _ = self.seen.send("reconnecting".into());
    }

    fn on_reconnected(&self) {
        let _ = self.seen.send("reconnected".into());
    }

    fn on_rejoin_failed(&self, _reason: &str) {
        let _ = self.seen.send("rejoin_failed".into());
    }

    fn on_closed(&self, reason: Option<&str>) {
        let _ = self.seen.send(format!("closed:{}", reason.unwrap_or("")));
    }
}

fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<String>) {
    let (seen, rx) = mpsc::unbounded_channel();
    (Arc::new(Recorder { seen }), rx)
}

/// Wait for `label`, skipping anything else.
async fn expect_event(rx: &mut mpsc::UnboundedReceiver<String>, label: &str) {
    let found = tokio::time::timeout(WAIT, async {
        while let Some(seen) = rx.recv().await {
            if seen == label {
                return true;
            }
        }
        false
    })
    .await;
    assert_eq!(found, Ok(true), "event {label} not observed");
}

fn fast_config(base_delay: Duration) -> ConnectionConfig {
    ConnectionConfig::new()
        .with_reconnect_policy(ReconnectPolicy::new().with_base_delay(base_delay))
        .with_rejoin_timeout(Duration::from_secs(1))
}

fn descriptor() -> JoinDescriptor {
    JoinDescriptor::new(17, "alice", Role::Player, Sex::Female)
        .with_password("secret")
        .with_pin(4321)
}

fn host_server() -> Arc<MockServer> {
    MockServer::new(|target, _| match target {
        "JoinGame" => Reply::Ok(join_ok()),
        _ => Reply::Ok(Value::Null),
    })
}

// ── Single handle per endpoint ──────────────────────────────────────

#[tokio::test]
async fn connecting_twice_reuses_the_handle() {
    init_tracing();
    let connector = MockConnector::new(MockServer::null());
    let session = SessionManager::new(connector.clone());
    let (listener, _rx) = recorder();

    let first = session.connect_to_host("ws://host/sihost", listener.clone()).await.unwrap();
    let second = session.connect_to_host("ws://host/sihost", listener.clone()).await.unwrap();
    assert_eq!(first.id(), second.id());

    let ConnectOutcome::Connected(lobby_a) = session.connect_lobby("ws://lobby", listener.clone()).await.unwrap()
    else {
        panic!("lobby should connect");
    };
    let ConnectOutcome::Connected(lobby_b) = session.connect_lobby("ws://lobby", listener).await.unwrap() else {
        panic!("lobby should connect");
    };
    assert_eq!(lobby_a.id(), lobby_b.id());
    assert_ne!(lobby_a.id(), first.id());
    assert_eq!(connector.attempts(), 2);
}

#[tokio::test]
async fn lobby_connect_failures_are_outcomes() {
    let connector = MockConnector::new(MockServer::null());
    let session = SessionManager::new(connector.clone());
    let (listener, _rx) = recorder();

    connector.refuse_next(TriviaError::AuthenticationRequired);
    let outcome = session.connect_lobby("ws://lobby", listener.clone()).await.unwrap();
    assert!(matches!(outcome, ConnectOutcome::AuthenticationRequired));

    connector.refuse_next(TriviaError::Connect("refused".into()));
    let outcome = session.connect_lobby("ws://lobby", listener.clone()).await.unwrap();
    assert!(matches!(outcome, ConnectOutcome::Failed(reason) if reason.contains("refused")));

    assert!(matches!(
        session.connect_lobby("  ", listener).await,
        Err(TriviaError::InvalidInput(_))
    ));
    assert!(session.lobby().await.is_none());
}

#[tokio::test]
async fn closed_host_connection_is_replaced_on_next_connect() {
    let server = host_server();
    let connector = MockConnector::new(server.clone());
    let session = SessionManager::new(connector.clone());
    let (listener, mut events) = recorder();

    let first = session.connect_to_host("ws://host/sihost", listener.clone()).await.unwrap();
    server.close(None);
    expect_event(&mut events, "closed:").await;
    assert_eq!(first.state(), ConnectionState::Disconnected);

    let second = session.connect_to_host("ws://host/sihost", listener).await.unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(second.state(), ConnectionState::Connected);
    assert_eq!(connector.attempts(), 2);
    assert!(!session.registry().is_attached(first.id()));
    assert!(session.registry().is_attached(second.id()));
    assert_eq!(session.host().await.map(|h| h.id()), Some(second.id()));
}

#[tokio::test]
async fn lobby_can_reconnect_after_the_token_expired() {
    let server = MockServer::null();
    let connector = MockConnector::new(server.clone());
    let session = SessionManager::with_config(connector.clone(), fast_config(Duration::from_millis(10)));
    let (listener, mut events) = recorder();

    let ConnectOutcome::Connected(first) = session.connect_lobby("ws://lobby", listener.clone()).await.unwrap() else {
        panic!("lobby should connect");
    };
    connector.refuse_next(TriviaError::AuthenticationRequired);
    server.drop_connection();
    expect_event(&mut events, "closed:authentication required").await;

    // Fresh token, fresh connection.
    let ConnectOutcome::Connected(second) = session.connect_lobby("ws://lobby", listener).await.unwrap() else {
        panic!("lobby should connect again");
    };
    assert_ne!(first.id(), second.id());
    assert!(second.is_connected());
    assert_eq!(connector.attempts(), 3);
}

// ── Rejoin ──────────────────────────────────────────────────────────

#[tokio::test]
async fn reconnect_replays_the_exact_join() {
    init_tracing();
    let server = host_server();
    let connector = MockConnector::new(server.clone());
    let session = SessionManager::with_config(connector.clone(), fast_config(Duration::from_millis(10)));
    let (listener, mut events) = recorder();

    let handle = session.connect_to_host("ws://host/sihost", listener).await.unwrap();
    let outcome = session.join(&handle, descriptor()).await.unwrap();
    assert_eq!(outcome, JoinOutcome::Joined);
    assert_eq!(handle.join_descriptor(), Some(descriptor()));

    server.drop_connection();
    expect_event(&mut events, "reconnecting").await;
    expect_event(&mut events, "reconnected").await;

    let joins = server.calls_to("JoinGame");
    assert_eq!(joins.len(), 2);
    assert_eq!(joins[0].connection, 0);
    assert_eq!(joins[1].connection, 1);
    assert_eq!(joins[0].arguments, joins[1].arguments);
    assert_eq!(joins[1].arguments[0]["Password"], json!("secret"));
    assert_eq!(joins[1].arguments[0]["Pin"], json!(4321));
    assert_eq!(handle.state(), ConnectionState::Connected);
    assert_eq!(server.connections(), 2);
}

#[tokio::test]
async fn lobby_reconnect_rejoins_with_the_same_culture() {
    let server = MockServer::null();
    let connector = MockConnector::new(server.clone());
    let session = SessionManager::with_config(connector, fast_config(Duration::from_millis(10)));
    let (listener, mut events) = recorder();

    let ConnectOutcome::Connected(handle) = session.connect_lobby("ws://lobby", listener).await.unwrap() else {
        panic!("lobby should connect");
    };
    LobbyClient::new(handle).join_lobby("ru-RU").await.unwrap();

    server.drop_connection();
    expect_event(&mut events, "reconnected").await;

    let joins = server.calls_to("JoinLobby2");
    assert_eq!(joins.len(), 2);
    assert_eq!(joins[1].arguments, vec![json!("ru-RU")]);
}

#[tokio::test]
async fn refused_rejoin_keeps_the_connection() {
    let joins = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&joins);
    let server = MockServer::new(move |target, _| match target {
        "JoinGame" if counter.fetch_add(1, Ordering::SeqCst) == 0 => Reply::Ok(join_ok()),
        "JoinGame" => Reply::Ok(join_refused("GameNotFound")),
        _ => Reply::Ok(Value::Null),
    });
    let session = SessionManager::with_config(
        MockConnector::new(server.clone()),
        fast_config(Duration::from_millis(10)),
    );
    let (listener, mut events) = recorder();

    let handle = session.connect_to_host("ws://host/sihost", listener).await.unwrap();
    session.join(&handle, descriptor()).await.unwrap().into_result().unwrap();

    server.drop_connection();
    expect_event(&mut events, "rejoin_failed").await;
    assert!(handle.is_connected());
    assert_eq!(joins.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn rejected_join_is_not_remembered() {
    let server = MockServer::new(|target, _| match target {
        "JoinGame" => Reply::Ok(join_refused("Forbidden")),
        _ => Reply::Ok(Value::Null),
    });
    let session = SessionManager::new(MockConnector::new(server));
    let (listener, _rx) = recorder();

    let handle = session.connect_to_host("ws://host/sihost", listener).await.unwrap();
    let outcome = session.join(&handle, descriptor()).await.unwrap();
    assert_eq!(
        outcome,
        JoinOutcome::Rejected {
            reason: JoinGameErrorType::Forbidden,
            message: Some("nope".into()),
        }
    );
    assert!(handle.join_descriptor().is_none());
    assert!(matches!(
        outcome.into_result(),
        Err(TriviaError::JoinRejected {
            reason: JoinGameErrorType::Forbidden,
            ..
        })
    ));
}

#[tokio::test]
async fn expired_token_during_reconnect_closes_the_connection() {
    let server = MockServer::null();
    let connector = MockConnector::new(server.clone());
    let session = SessionManager::with_config(connector.clone(), fast_config(Duration::from_millis(10)));
    let (listener, mut events) = recorder();

    let ConnectOutcome::Connected(handle) = session.connect_lobby("ws://lobby", listener).await.unwrap() else {
        panic!("lobby should connect");
    };
    connector.refuse_next(TriviaError::AuthenticationRequired);
    server.drop_connection();

    expect_event(&mut events, "closed:authentication required").await;
    assert_eq!(handle.state(), ConnectionState::Disconnected);
    assert_eq!(connector.attempts(), 2);
}

#[tokio::test]
async fn error_close_with_a_join_reconnects_once_and_rejoins() {
    let server = host_server();
    let connector = MockConnector::new(server.clone());
    let session = SessionManager::with_config(connector.clone(), fast_config(Duration::from_millis(10)));
    let (listener, mut events) = recorder();

    let handle = session.connect_to_host("ws://host/sihost", listener).await.unwrap();
    session.join(&handle, descriptor()).await.unwrap().into_result().unwrap();

    server.close(Some("host restarting"));
    expect_event(&mut events, "reconnected").await;

    let joins = server.calls_to("JoinGame");
    assert_eq!(joins.len(), 2);
    assert_eq!(joins[0].arguments, joins[1].arguments);
    assert_eq!(joins[1].connection, 1);
    assert_eq!(connector.attempts(), 2);
    assert!(handle.is_connected());
}

#[tokio::test]
async fn error_close_without_a_join_closes_with_the_reason() {
    let server = host_server();
    let connector = MockConnector::new(server.clone());
    let session = SessionManager::with_config(connector.clone(), fast_config(Duration::from_millis(10)));
    let (listener, mut events) = recorder();

    let handle = session.connect_to_host("ws://host/sihost", listener).await.unwrap();
    server.close(Some("kicked"));

    expect_event(&mut events, "closed:kicked").await;
    assert_eq!(handle.state(), ConnectionState::Disconnected);
    assert_eq!(connector.attempts(), 1);
    assert!(server.calls_to("JoinGame").is_empty());
}

#[tokio::test]
async fn error_close_with_a_refused_rejoin_closes_with_the_reason() {
    let joins = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&joins);
    let server = MockServer::new(move |target, _| match target {
        "JoinGame" if counter.fetch_add(1, Ordering::SeqCst) == 0 => Reply::Ok(join_ok()),
        "JoinGame" => Reply::Ok(join_refused("GameNotFound")),
        _ => Reply::Ok(Value::Null),
    });
    let connector = MockConnector::new(server.clone());
    let session = SessionManager::with_config(connector.clone(), fast_config(Duration::from_millis(10)));
    let (listener, mut events) = recorder();

    let handle = session.connect_to_host("ws://host/sihost", listener).await.unwrap();
    session.join(&handle, descriptor()).await.unwrap().into_result().unwrap();

    server.close(Some("game over"));
    expect_event(&mut events, "closed:game over").await;

    assert_eq!(joins.load(Ordering::SeqCst), 2);
    assert_eq!(connector.attempts(), 2);
    assert_eq!(handle.state(), ConnectionState::Disconnected);
}

// ── Leave and detach ────────────────────────────────────────────────

#[tokio::test]
async fn nothing_is_delivered_after_leave() {
    let server = host_server();
    let session = SessionManager::new(MockConnector::new(server.clone()));
    let (listener, mut events) = recorder();

    let handle = session.connect_to_host("ws://host/sihost", listener).await.unwrap();
    server.push("Receive", vec![json!("STAGE")]);
    expect_event(&mut events, "message:Receive").await;

    session.leave(&handle).await;
    assert!(session.registry().is_detached(handle.id()));
    assert!(session.host().await.is_none());

    server.push("Receive", vec![json!("late")]);
    let late = tokio::time::timeout(Duration::from_millis(100), async {
        while let Some(seen) = events.recv().await {
            if seen.starts_with("message:") {
                return Some(seen);
            }
        }
        None
    })
    .await;
    assert!(!matches!(late, Ok(Some(_))), "late event delivered: {late:?}");

    // Leaving again is harmless.
    session.leave(&handle).await;
}

#[tokio::test]
async fn leave_cancels_a_pending_reconnect() {
    let server = host_server();
    let connector = MockConnector::new(server.clone());
    let session = SessionManager::with_config(connector.clone(), fast_config(Duration::from_millis(300)));
    let (listener, mut events) = recorder();

    let handle = session.connect_to_host("ws://host/sihost", listener).await.unwrap();
    session.join(&handle, descriptor()).await.unwrap();

    server.drop_connection();
    expect_event(&mut events, "reconnecting").await;
    session.leave(&handle).await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(connector.attempts(), 1);
    assert_eq!(handle.state(), ConnectionState::Disconnected);
    assert!(handle.join_descriptor().is_none());
}

#[tokio::test]
async fn log_out_sends_logout_and_drops_both_connections() {
    let server = host_server();
    let session = SessionManager::new(MockConnector::new(server.clone()));
    let (listener, _rx) = recorder();

    session.connect_lobby("ws://lobby", listener.clone()).await.unwrap();
    session.connect_to_host("ws://host/sihost", listener).await.unwrap();
    session.log_out().await;

    assert_eq!(server.calls_to("LogOut").len(), 1);
    assert!(session.lobby().await.is_none());
    assert!(session.host().await.is_none());
}
