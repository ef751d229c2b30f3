//! # Loopback Session
//!
//! Shows how to implement [`Transport`] and [`Connector`] over in-process
//! channels, and what a reconnect with rejoin looks like from the outside.
//! A tiny fake host answers `JoinGame` and `SendMessage`; halfway through, the
//! demo cuts the connection and the handle reconnects and replays the join on
//! its own.
//!
//! ## Running
//!
//! ```sh
//! RUST_LOG=trivia_session=debug cargo run --example loopback_session
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use trivia_session::protocol::{ClientFrame, ServerFrame};
use trivia_session::{
    ConnectionConfig, ConnectionListener, Connector, HostClient, JoinDescriptor, ReconnectPolicy, Role,
    SessionManager, Sex, Transport, TriviaError,
};

// ─────────────────────────────────────────────────────────────────────
// Step 1: A channel-based transport
// ─────────────────────────────────────────────────────────────────────

/// Client half of an in-process connection.
struct LoopbackTransport {
    to_server: mpsc::UnboundedSender<String>,
    from_server: mpsc::UnboundedReceiver<Result<String, TriviaError>>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&mut self, message: String) -> Result<(), TriviaError> {
        self.to_server
            .send(message)
            .map_err(|e| TriviaError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, TriviaError>> {
        self.from_server.recv().await
    }

    async fn close(&mut self) -> Result<(), TriviaError> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 2: A connector that starts a fake host per connection
// ─────────────────────────────────────────────────────────────────────

/// Lets `main` cut the newest connection.
type Killer = mpsc::UnboundedSender<Result<String, TriviaError>>;

#[derive(Default)]
struct LoopbackConnector {
    newest: Mutex<Option<Killer>>,
}

impl LoopbackConnector {
    fn cut(&self) {
        let newest = self.newest.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(tx) = newest.as_ref() {
            let _ = tx.send(Err(TriviaError::TransportReceive("cable pulled".into())));
        }
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, uri: &str) -> Result<Box<dyn Transport>, TriviaError> {
        println!("  connector: opening {uri}");
        let (to_server, mut server_rx) = mpsc::unbounded_channel::<String>();
        let (server_tx, from_server) = mpsc::unbounded_channel();
        *self.newest.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(server_tx.clone());

        tokio::spawn(async move {
            while let Some(text) = server_rx.recv().await {
                let Ok(ClientFrame::Invocation {
                    invocation_id,
                    target,
                    arguments,
                }) = serde_json::from_str::<ClientFrame>(&text)
                else {
                    continue;
                };
                println!("  host: {target} {}", Value::Array(arguments.clone()));
                let result = match target.as_str() {
                    "JoinGame" => json!({ "IsSuccess": true }),
                    _ => Value::Null,
                };
                if let Some(invocation_id) = invocation_id {
                    let completion = ServerFrame::Completion {
                        invocation_id,
                        result: Some(result),
                        error: None,
                    };
                    if let Ok(json) = serde_json::to_string(&completion) {
                        let _ = server_tx.send(Ok(json));
                    }
                }
            }
        });

        Ok(Box::new(LoopbackTransport { to_server, from_server }))
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 3: A listener that prints lifecycle events
// ─────────────────────────────────────────────────────────────────────

struct PrintListener;

impl ConnectionListener for PrintListener {
    fn on_connected(&self) {
        println!("  listener: connected");
    }

    fn on_reconnecting(&self, reason: Option<&str>) {
        println!("  listener: reconnecting ({})", reason.unwrap_or("no reason"));
    }

    fn on_reconnected(&self) {
        println!("  listener: reconnected, join replayed");
    }

    fn on_closed(&self, reason: Option<&str>) {
        println!("  listener: closed ({})", reason.unwrap_or("normal"));
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 4: Drive a session
// ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let connector = Arc::new(LoopbackConnector::default());
    let config = ConnectionConfig::new()
        .with_reconnect_policy(ReconnectPolicy::new().with_base_delay(Duration::from_millis(200)));
    let session = SessionManager::with_config(Arc::clone(&connector) as Arc<dyn Connector>, config);

    println!("connecting to the host");
    let handle = session
        .connect_to_host("loopback://host/sihost", Arc::new(PrintListener))
        .await?;

    println!("joining game 7");
    let descriptor = JoinDescriptor::new(7, "demo", Role::Player, Sex::Male).with_password("pw");
    session.join(&handle, descriptor).await?.into_result()?;

    let host = HostClient::new(handle.clone());
    host.say("hello from the loopback").await?;

    println!("pulling the cable");
    connector.cut();
    tokio::time::sleep(Duration::from_millis(500)).await;

    host.say("still here").await?;

    println!("leaving");
    session.leave(&handle).await;
    println!("state after leave: {:?}", handle.state());
    Ok(())
}
