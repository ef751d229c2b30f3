#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for trivia-session integration tests.
//!
//! Provides a channel-based [`MockServer`] that answers invocations through a
//! responder closure, records every call, and can push events or drop the
//! current connection. [`MockConnector`] hands out one [`MockTransport`] per
//! connect and can be told to refuse connects.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use trivia_session::protocol::{ClientFrame, ServerFrame};
use trivia_session::{Connector, Transport, TriviaError};

// ── MockServer ──────────────────────────────────────────────────────

/// What the server answers to one invocation.
pub enum Reply {
    Ok(Value),
    Error(String),
    /// No completion at all.
    Silent,
}

type Responder = dyn Fn(&str, &[Value]) -> Reply + Send + Sync;
type Link = mpsc::UnboundedSender<Option<Result<String, TriviaError>>>;

/// One recorded invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    /// Index of the transport (connect order) that carried the call.
    pub connection: usize,
    pub target: String,
    pub arguments: Vec<Value>,
}

/// Scripted server shared by every transport of a [`MockConnector`].
pub struct MockServer {
    responder: Box<Responder>,
    calls: StdMutex<Vec<Call>>,
    links: StdMutex<Vec<Link>>,
}

impl MockServer {
    pub fn new(responder: impl Fn(&str, &[Value]) -> Reply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            calls: StdMutex::new(Vec::new()),
            links: StdMutex::new(Vec::new()),
        })
    }

    /// Server answering `null` to everything.
    pub fn null() -> Arc<Self> {
        Self::new(|_, _| Reply::Ok(Value::Null))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, target: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.target == target).collect()
    }

    /// Text of every `SendMessage` call, in order.
    pub fn sent_messages(&self) -> Vec<String> {
        self.calls_to("SendMessage")
            .into_iter()
            .filter_map(|c| c.arguments.first()?.get("Text")?.as_str().map(str::to_string))
            .collect()
    }

    /// Number of transports handed out so far.
    pub fn connections(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    /// Push a server invocation on the newest connection.
    pub fn push(&self, target: &str, arguments: Vec<Value>) {
        let frame = ServerFrame::Invocation {
            target: target.to_string(),
            arguments,
        };
        self.deliver(Some(Ok(serde_json::to_string(&frame).unwrap())));
    }

    /// Fail the newest connection with a receive error.
    pub fn drop_connection(&self) {
        self.deliver(Some(Err(TriviaError::TransportReceive("connection reset".into()))));
    }

    /// Close the newest connection with an optional error.
    pub fn close(&self, error: Option<&str>) {
        let frame = ServerFrame::Close {
            error: error.map(str::to_string),
        };
        self.deliver(Some(Ok(serde_json::to_string(&frame).unwrap())));
    }

    fn deliver(&self, item: Option<Result<String, TriviaError>>) {
        if let Some(link) = self.links.lock().unwrap().last() {
            let _ = link.send(item);
        }
    }

    fn open(self: &Arc<Self>) -> MockTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        let index = {
            let mut links = self.links.lock().unwrap();
            links.push(tx.clone());
            links.len() - 1
        };
        MockTransport {
            server: Arc::clone(self),
            index,
            to_client: tx,
            incoming: rx,
        }
    }
}

// ── MockTransport ───────────────────────────────────────────────────

/// Transport wired to a [`MockServer`]. Completions for client invocations
/// are queued on the transport's own incoming channel.
pub struct MockTransport {
    server: Arc<MockServer>,
    index: usize,
    to_client: Link,
    incoming: mpsc::UnboundedReceiver<Option<Result<String, TriviaError>>>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, message: String) -> Result<(), TriviaError> {
        let frame: ClientFrame = serde_json::from_str(&message)?;
        let ClientFrame::Invocation {
            invocation_id,
            target,
            arguments,
        } = frame
        else {
            return Ok(());
        };

        self.server.calls.lock().unwrap().push(Call {
            connection: self.index,
            target: target.clone(),
            arguments: arguments.clone(),
        });

        let reply = (self.server.responder)(&target, &arguments);
        let Some(invocation_id) = invocation_id else {
            return Ok(());
        };
        let completion = match reply {
            Reply::Ok(result) => ServerFrame::Completion {
                invocation_id,
                result: Some(result),
                error: None,
            },
            Reply::Error(error) => ServerFrame::Completion {
                invocation_id,
                result: None,
                error: Some(error),
            },
            Reply::Silent => return Ok(()),
        };
        let _ = self
            .to_client
            .send(Some(Ok(serde_json::to_string(&completion).unwrap())));
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, TriviaError>> {
        match self.incoming.recv().await {
            Some(item) => item,
            // No more frames: hang so the loop stays alive until shutdown.
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<(), TriviaError> {
        Ok(())
    }
}

// ── MockConnector ───────────────────────────────────────────────────

/// Hands out transports to a shared [`MockServer`].
pub struct MockConnector {
    pub server: Arc<MockServer>,
    refusals: StdMutex<VecDeque<TriviaError>>,
    attempts: AtomicUsize,
    uris: StdMutex<Vec<String>>,
}

impl MockConnector {
    pub fn new(server: Arc<MockServer>) -> Arc<Self> {
        Arc::new(Self {
            server,
            refusals: StdMutex::new(VecDeque::new()),
            attempts: AtomicUsize::new(0),
            uris: StdMutex::new(Vec::new()),
        })
    }

    /// Fail the next connect attempt with `error`.
    pub fn refuse_next(&self, error: TriviaError) {
        self.refusals.lock().unwrap().push_back(error);
    }

    /// Connect attempts so far, refused ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Every URI a connect was attempted against.
    pub fn uris(&self) -> Vec<String> {
        self.uris.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, uri: &str) -> Result<Box<dyn Transport>, TriviaError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.uris.lock().unwrap().push(uri.to_string());
        if let Some(error) = self.refusals.lock().unwrap().pop_front() {
            return Err(error);
        }
        Ok(Box::new(self.server.open()))
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Successful host `JoinGame` response.
pub fn join_ok() -> Value {
    json!({ "IsSuccess": true })
}

/// Refused host `JoinGame` response.
pub fn join_refused(error_type: &str) -> Value {
    json!({ "IsSuccess": false, "ErrorType": error_type, "Message": "nope" })
}

/// Poll `condition` until it holds or `limit` passes.
pub async fn eventually(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Route `tracing` output to the test writer. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
