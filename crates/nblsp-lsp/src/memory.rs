//! In-process transports.
//!
//! [`MemoryConnector`] hands each opened transport's far end to a callback
//! as a [`MemoryPeer`]. [`ScriptedServer`] is a small language server that
//! runs on such a peer: it answers `initialize`, `hover` and `shutdown`,
//! can publish diagnostics, and records everything it receives.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::protocol::{Message, ResponseError};
use crate::transport::{
    Endpoint, MessageSink, MessageStream, Transport, TransportConnector, TransportError,
};

/// Creates a connected client transport and server peer.
pub fn memory_pair(endpoint: Endpoint) -> (Transport, MemoryPeer) {
    let (client_tx, server_rx) = mpsc::unbounded_channel();
    let (server_tx, client_rx) = mpsc::unbounded_channel();

    let transport = Transport {
        sink: Box::new(ChannelSink {
            sender: Some(client_tx),
        }),
        stream: Box::new(ChannelStream { receiver: client_rx }),
    };
    let peer = MemoryPeer {
        endpoint,
        incoming: server_rx,
        outgoing: server_tx,
    };
    (transport, peer)
}

struct ChannelSink {
    sender: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl MessageSink for ChannelSink {
    async fn send(&mut self, message: String) -> Result<(), TransportError> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| TransportError::Io("sink closed".to_string()))?;
        sender
            .send(message)
            .map_err(|_| TransportError::closed(crate::transport::CLOSE_ABNORMAL, "peer gone"))
    }

    async fn close(&mut self) {
        self.sender = None;
    }
}

struct ChannelStream {
    receiver: mpsc::UnboundedReceiver<Result<String, TransportError>>,
}

#[async_trait]
impl MessageStream for ChannelStream {
    async fn next(&mut self) -> Option<Result<String, TransportError>> {
        self.receiver.recv().await
    }
}

/// Server end of an in-memory transport.
pub struct MemoryPeer {
    endpoint: Endpoint,
    incoming: mpsc::UnboundedReceiver<String>,
    outgoing: mpsc::UnboundedSender<Result<String, TransportError>>,
}

impl MemoryPeer {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Next raw message from the client. `None` once the client closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.incoming.recv().await
    }

    /// Next parseable message from the client.
    pub async fn recv_message(&mut self) -> Option<Message> {
        while let Some(text) = self.recv().await {
            match Message::parse(&text) {
                Ok(message) => return Some(message),
                Err(e) => tracing::warn!("Peer dropped unparseable message: {}", e),
            }
        }
        None
    }

    pub fn send(&self, message: &Message) -> bool {
        self.outgoing.send(Ok(message.to_text())).is_ok()
    }

    /// Closes the link from the server side with an error.
    pub fn fail(&self, error: TransportError) {
        let _ = self.outgoing.send(Err(error));
    }
}

type AcceptFn = dyn Fn(MemoryPeer) -> Result<(), TransportError> + Send + Sync;

/// Opens in-memory transports and passes the server end to a callback.
pub struct MemoryConnector {
    accept: Box<AcceptFn>,
    opened: Mutex<HashMap<String, usize>>,
}

impl MemoryConnector {
    /// `accept` runs for every open. Returning an error fails the open.
    pub fn new<F>(accept: F) -> Self
    where
        F: Fn(MemoryPeer) -> Result<(), TransportError> + Send + Sync + 'static,
    {
        Self {
            accept: Box::new(accept),
            opened: Mutex::new(HashMap::new()),
        }
    }

    /// Serves every language with `server`.
    pub fn serving(server: ScriptedServer) -> Self {
        Self::new(move |peer| {
            server.serve(peer);
            Ok(())
        })
    }

    /// Open attempts for `language`, failed ones included.
    pub fn opened(&self, language: &str) -> usize {
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(language)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_opened(&self) -> usize {
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .sum()
    }
}

#[async_trait]
impl TransportConnector for MemoryConnector {
    async fn open(&self, endpoint: &Endpoint) -> Result<Transport, TransportError> {
        *self
            .opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(endpoint.language.clone())
            .or_default() += 1;

        let (transport, peer) = memory_pair(endpoint.clone());
        (self.accept)(peer)?;
        Ok(transport)
    }
}

// ============================================================================
// Scripted server
// ============================================================================

struct ScriptedState {
    received: Mutex<Vec<Message>>,
    hover: Mutex<Option<String>>,
    hover_delay: Mutex<Duration>,
    diagnostic_marker: Mutex<Option<String>>,
    unresponsive: AtomicBool,
    disconnects: broadcast::Sender<TransportError>,
}

impl Default for ScriptedState {
    fn default() -> Self {
        Self {
            received: Mutex::default(),
            hover: Mutex::default(),
            hover_delay: Mutex::default(),
            diagnostic_marker: Mutex::default(),
            unresponsive: AtomicBool::new(false),
            disconnects: broadcast::channel(4).0,
        }
    }
}

/// A minimal language server for in-process use.
#[derive(Clone, Default)]
pub struct ScriptedServer {
    state: Arc<ScriptedState>,
}

impl ScriptedServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers every hover with `text` as markdown.
    pub fn with_hover(self, text: impl Into<String>) -> Self {
        *lock(&self.state.hover) = Some(text.into());
        self
    }

    /// Delays hover answers.
    pub fn with_hover_delay(self, delay: Duration) -> Self {
        *lock(&self.state.hover_delay) = delay;
        self
    }

    /// Publishes an error diagnostic for every occurrence of `marker` in
    /// opened or changed documents.
    pub fn with_diagnostic_marker(self, marker: impl Into<String>) -> Self {
        *lock(&self.state.diagnostic_marker) = Some(marker.into());
        self
    }

    /// Never answers `initialize`.
    pub fn unresponsive(self) -> Self {
        self.state.unresponsive.store(true, Ordering::SeqCst);
        self
    }

    /// Drops every live peer with `error`.
    pub fn disconnect(&self, error: TransportError) {
        let _ = self.state.disconnects.send(error);
    }

    /// Every message received so far, across all peers.
    pub fn received(&self) -> Vec<Message> {
        lock(&self.state.received).clone()
    }

    /// Params of every received notification with `method`.
    pub fn notifications(&self, method: &str) -> Vec<Value> {
        self.received()
            .into_iter()
            .filter_map(|message| match message {
                Message::Notification { method: m, params } if m == method => Some(params),
                _ => None,
            })
            .collect()
    }

    /// Params of every received request with `method`.
    pub fn requests(&self, method: &str) -> Vec<Value> {
        self.received()
            .into_iter()
            .filter_map(|message| match message {
                Message::Request { method: m, params, .. } if m == method => Some(params),
                _ => None,
            })
            .collect()
    }

    /// Waits until at least `count` notifications with `method` arrived.
    pub async fn wait_for_notifications(&self, method: &str, count: usize, timeout: Duration) -> Vec<Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let found = self.notifications(method);
            if found.len() >= count || tokio::time::Instant::now() >= deadline {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Serves `peer` until the client goes away.
    pub fn serve(&self, mut peer: MemoryPeer) -> JoinHandle<()> {
        let state = self.state.clone();
        let peer_out = peer.outgoing.clone();
        let mut disconnects = state.disconnects.subscribe();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    message = peer.recv_message() => message,
                    Ok(error) = disconnects.recv() => {
                        peer.fail(error);
                        break;
                    }
                };
                let Some(message) = message else {
                    break;
                };
                lock(&state.received).push(message.clone());
                let replies = respond(&state, &message);
                for (delay, reply) in replies {
                    if delay.is_zero() {
                        let _ = peer_out.send(Ok(reply.to_text()));
                    } else {
                        let out = peer_out.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = out.send(Ok(reply.to_text()));
                        });
                    }
                }
            }
            tracing::debug!("Scripted server for {} stopped", peer.endpoint.language);
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn respond(state: &ScriptedState, message: &Message) -> Vec<(Duration, Message)> {
    match message {
        Message::Request { id, method, .. } => {
            let result = match method.as_str() {
                "initialize" if state.unresponsive.load(Ordering::SeqCst) => return Vec::new(),
                "initialize" => Ok(json!({
                    "capabilities": {
                        "textDocumentSync": 1,
                        "hoverProvider": true,
                    },
                    "serverInfo": { "name": "scripted" },
                })),
                "textDocument/hover" => {
                    let hover = lock(&state.hover).clone();
                    let delay = *lock(&state.hover_delay);
                    let result = match hover {
                        Some(text) => json!({ "contents": { "kind": "markdown", "value": text } }),
                        None => Value::Null,
                    };
                    return vec![(delay, Message::response(id.clone(), Ok(result)))];
                }
                "shutdown" => Ok(Value::Null),
                other => Err(ResponseError::method_not_found(other)),
            };
            vec![(Duration::ZERO, Message::response(id.clone(), result))]
        }
        Message::Notification { method, params } => {
            let text = match method.as_str() {
                "textDocument/didOpen" => params["textDocument"]["text"].as_str(),
                "textDocument/didChange" => params["contentChanges"][0]["text"].as_str(),
                _ => None,
            };
            let Some(text) = text else {
                return Vec::new();
            };
            let Some(marker) = lock(&state.diagnostic_marker).clone() else {
                return Vec::new();
            };
            let uri = params["textDocument"]["uri"].clone();
            vec![(Duration::ZERO, publish_diagnostics(uri, text, &marker))]
        }
        Message::Response { .. } => Vec::new(),
    }
}

fn publish_diagnostics(uri: Value, text: &str, marker: &str) -> Message {
    let width = marker.chars().count();
    let diagnostics: Vec<Value> = text
        .split('\n')
        .enumerate()
        .flat_map(|(line, content)| {
            content.match_indices(marker).map(move |(byte, _)| {
                let character = content[..byte].chars().count();
                json!({
                    "range": {
                        "start": { "line": line, "character": character },
                        "end": { "line": line, "character": character + width },
                    },
                    "severity": 1,
                    "source": "scripted",
                    "message": format!("found {}", marker),
                })
            })
        })
        .collect();

    Message::notification(
        "textDocument/publishDiagnostics",
        json!({ "uri": uri, "diagnostics": diagnostics }),
    )
}
