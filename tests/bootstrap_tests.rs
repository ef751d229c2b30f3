#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! Integration tests for the cold-start sequence.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{eventually, init_tracing, join_ok, MockConnector, MockServer, Reply};
use serde_json::{json, Value};
use tokio::sync::watch;
use trivia_session::bootstrap::{Authenticator, MemoryLicenseStore};
use trivia_session::snapshot::{GameSnapshot, SnapshotPublisher, StateProjector};
use trivia_session::{
    BootstrapConfig, ConnectionListener, GameCreationResultCode, GamePlan, JoinExisting,
    LoginErrorKind, NewGameOptions, SessionBootstrapper, SessionManager, TriviaError,
};
use trivia_session::protocol::PackageKey;

struct StaticToken;

#[async_trait]
impl Authenticator for StaticToken {
    async fn log_on(&self, _server_uri: &str, _login: &str, _password: &str) -> trivia_session::Result<String> {
        Ok("tok".to_string())
    }
}

struct Refusing;

#[async_trait]
impl Authenticator for Refusing {
    async fn log_on(&self, _server_uri: &str, _login: &str, _password: &str) -> trivia_session::Result<String> {
        Err(TriviaError::Login {
            kind: LoginErrorKind::DuplicateName,
            detail: None,
        })
    }
}

/// Marks the game started on `Receive("STAGE", ...)`.
struct StageProjector;

impl StateProjector for StageProjector {
    fn apply(&mut self, target: &str, arguments: &[Value], current: &GameSnapshot) -> Option<GameSnapshot> {
        if target != "Receive" || arguments.first()?.as_str()? != "STAGE" {
            return None;
        }
        Some(GameSnapshot {
            is_game_started: true,
            ..current.clone()
        })
    }
}

fn lobby_and_host(creation: Value) -> Arc<MockServer> {
    MockServer::new(move |target, _| match target {
        "GetComputerAccountsNew" => Reply::Ok(json!(["Bot A", "Bot B"])),
        "GetGamesHostInfoNew" => Reply::Ok(json!({ "Name": "Test server" })),
        "GetGamesSlice" => Reply::Ok(json!({
            "Data": [{ "GameID": 5, "GameName": "open", "HostUri": "http://other/" }],
            "IsLastSlice": true
        })),
        "GetUsers" => Reply::Ok(json!(["zoe", "alice", "mike"])),
        "GetNews" => Reply::Ok(json!("Season two starts today")),
        "CreateAndJoinGameNew" => Reply::Ok(creation.clone()),
        "JoinGame" => Reply::Ok(join_ok()),
        _ => Reply::Ok(Value::Null),
    })
}

fn create_plan() -> GamePlan {
    GamePlan::Create(NewGameOptions::new("quiz", PackageKey::random()).with_seats(3, 1))
}

fn bootstrapper(connector: Arc<MockConnector>, config: BootstrapConfig) -> SessionBootstrapper {
    SessionBootstrapper::new(config, Arc::new(SessionManager::new(connector)))
        .with_authenticator(Arc::new(StaticToken))
}

fn publisher() -> (Arc<dyn ConnectionListener>, watch::Receiver<GameSnapshot>) {
    let (publisher, snapshots) = SnapshotPublisher::new(StageProjector);
    (Arc::new(publisher), snapshots)
}

fn is_change_type(message: &str) -> bool {
    message.starts_with("CONFIG\nCHANGETYPE\nplayer\n")
}

#[tokio::test]
async fn three_seats_one_human_provisions_two_computer_seats() {
    init_tracing();
    let server = lobby_and_host(json!({ "Code": "Ok", "GameId": 42, "HostUri": "http://host/" }));
    let connector = MockConnector::new(server.clone());
    let config = BootstrapConfig::new("http://server", "alice", create_plan());
    let (listener, snapshots) = publisher();

    let starter = {
        let server = server.clone();
        tokio::spawn(async move {
            let provisioned = eventually(Duration::from_secs(2), || {
                server.sent_messages().iter().filter(|m| is_change_type(m)).count() == 2
            })
            .await;
            assert!(provisioned);
            server.push("Receive", vec![json!("STAGE"), json!("Round")]);
        })
    };

    let outcome = bootstrapper(connector.clone(), config).run(listener, snapshots).await.unwrap();
    starter.await.unwrap();

    assert_eq!(outcome.game_id, 42);
    assert_eq!(outcome.computer_accounts, vec!["Bot A", "Bot B"]);
    assert_eq!(outcome.host_info.name, "Test server");
    assert_eq!(outcome.games.len(), 1);
    assert_eq!(outcome.users, vec!["alice", "mike", "zoe"]);
    assert_eq!(outcome.news.as_deref(), Some("Season two starts today"));

    assert_eq!(
        server.sent_messages(),
        vec![
            "INFO",
            "MOVEABLE",
            "READY\n+",
            "CONFIG\nCHANGETYPE\nplayer\n1",
            "CONFIG\nCHANGETYPE\nplayer\n2",
        ]
    );
    assert_eq!(
        connector.uris(),
        vec!["ws://server/sionline?token=tok", "ws://host/sihost"]
    );

    let created = server.calls_to("CreateAndJoinGameNew");
    let players = created[0].arguments[0]["Players"].as_array().unwrap();
    assert_eq!(players.len(), 3);
    assert_eq!(players[0]["Name"], json!("alice"));
    assert_eq!(players[2]["Name"], json!(" "));
    assert_eq!(server.calls_to("JoinLobby2")[0].arguments, vec![json!("en-US")]);
    assert_eq!(server.calls_to("JoinGame")[0].arguments[0]["GameId"], json!(42));
}

#[tokio::test]
async fn game_that_never_starts_times_out() {
    let server = lobby_and_host(json!({ "Code": "Ok", "GameId": 1 }));
    let config = BootstrapConfig::new("http://server", "alice", create_plan())
        .with_game_start_timeout(Duration::from_millis(150));
    let (listener, snapshots) = publisher();

    let err = bootstrapper(MockConnector::new(server.clone()), config)
        .run(listener, snapshots)
        .await
        .unwrap_err();

    assert!(matches!(err, TriviaError::GameStartTimeout(d) if d == Duration::from_millis(150)));
    assert_eq!(server.sent_messages().iter().filter(|m| is_change_type(m)).count(), 2);
}

#[tokio::test]
async fn joining_uses_the_listed_host() {
    let server = lobby_and_host(Value::Null);
    let connector = MockConnector::new(server.clone());
    let config = BootstrapConfig::new("http://server", "bob", GamePlan::Join(JoinExisting::new(5)))
        .with_role(trivia_session::Role::Viewer)
        .with_game_start_timeout(Duration::from_millis(50));
    let (listener, snapshots) = publisher();

    let err = bootstrapper(connector.clone(), config).run(listener, snapshots).await.unwrap_err();
    assert!(matches!(err, TriviaError::GameStartTimeout(_)));

    assert_eq!(connector.uris()[1], "ws://other/sihost");
    assert!(server.calls_to("CreateAndJoinGameNew").is_empty());
    // Viewers do not report readiness.
    assert_eq!(server.sent_messages(), vec!["INFO", "MOVEABLE"]);
}

#[tokio::test]
async fn creation_failure_stops_before_the_host() {
    let server = lobby_and_host(json!({ "Code": "TooMuchGames", "ErrorMessage": "busy" }));
    let connector = MockConnector::new(server.clone());
    let config = BootstrapConfig::new("http://server", "alice", create_plan());
    let (listener, snapshots) = publisher();

    let err = bootstrapper(connector.clone(), config).run(listener, snapshots).await.unwrap_err();
    assert!(matches!(
        err,
        TriviaError::GameCreation {
            code: GameCreationResultCode::TooMuchGames,
            message: Some(ref m),
        } if m == "busy"
    ));
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test]
async fn unaccepted_license_stops_before_connecting() {
    let connector = MockConnector::new(MockServer::null());
    let config = BootstrapConfig::new("http://server", "alice", create_plan()).with_accept_license(false);
    let (listener, snapshots) = publisher();

    let err = bootstrapper(connector.clone(), config)
        .with_license_store(Arc::new(MemoryLicenseStore::new()))
        .run(listener, snapshots)
        .await
        .unwrap_err();
    assert!(matches!(err, TriviaError::LicenseNotAccepted));
    assert_eq!(connector.attempts(), 0);
}

#[tokio::test]
async fn log_on_refusal_is_returned() {
    let connector = MockConnector::new(MockServer::null());
    let config = BootstrapConfig::new("http://server", "alice", create_plan());
    let (listener, snapshots) = publisher();

    let err = SessionBootstrapper::new(config, Arc::new(SessionManager::new(connector.clone())))
        .with_authenticator(Arc::new(Refusing))
        .run(listener, snapshots)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TriviaError::Login {
            kind: LoginErrorKind::DuplicateName,
            ..
        }
    ));
    assert_eq!(connector.attempts(), 0);
}

#[tokio::test]
async fn expired_token_surfaces_as_authentication_required() {
    let connector = MockConnector::new(MockServer::null());
    connector.refuse_next(TriviaError::AuthenticationRequired);
    let config = BootstrapConfig::new("http://server", "alice", create_plan());
    let (listener, snapshots) = publisher();

    let err = bootstrapper(connector, config).run(listener, snapshots).await.unwrap_err();
    assert!(matches!(err, TriviaError::AuthenticationRequired));
}
