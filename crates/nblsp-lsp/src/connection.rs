//! One JSON-RPC session with one language server.
//!
//! ## Learning: Request/Response over Channels
//!
//! Two background tasks own the transport halves:
//!
//! ```text
//!  request() ──► outgoing mpsc ──► writer task ──► sink
//!      ▲
//!      │ oneshot (by id)
//!      │
//!  pending map ◄── reader task ◄── stream
//! ```
//!
//! A request registers a `oneshot::Sender` under its id before sending,
//! then awaits the receiver with a timeout. The reader completes whichever
//! sender matches an incoming response id. A reply that arrives after the
//! timeout finds no entry and is discarded.
//!
//! The outgoing channel is FIFO and has a single consumer, so messages
//! reach the server in the order they were sent.

use lsp_types::notification::{
    DidChangeConfiguration, DidChangeTextDocument, DidCloseTextDocument, DidOpenTextDocument,
    DidSaveTextDocument, Exit, Initialized, Notification, PublishDiagnostics,
};
use lsp_types::request::{
    Completion, GotoDefinition, HoverRequest, Initialize, Request, Shutdown, SignatureHelpRequest,
};
use lsp_types::{
    ClientCapabilities, ClientInfo, CompletionParams, CompletionResponse,
    DidChangeConfigurationParams, DidChangeTextDocumentParams, DidCloseTextDocumentParams,
    DidOpenTextDocumentParams, DidSaveTextDocumentParams, GotoDefinitionParams,
    GotoDefinitionResponse, Hover, HoverClientCapabilities, HoverParams, InitializeParams,
    InitializeResult, InitializedParams, MarkupKind, PublishDiagnosticsParams, ServerCapabilities,
    SignatureHelp, SignatureHelpParams, TextDocumentClientCapabilities,
    TextDocumentContentChangeEvent, TextDocumentIdentifier, TextDocumentItem,
    TextDocumentPositionParams, TextDocumentSyncClientCapabilities, Uri,
    VersionedTextDocumentIdentifier, WorkspaceClientCapabilities, WorkspaceFolder,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use nblsp_core::Signal;

use crate::protocol::{Message, RequestId, ResponseError};
use crate::transport::{
    CLOSE_ABNORMAL, Endpoint, MessageSink, MessageStream, Transport, TransportConnector,
    TransportError,
};
use crate::{LspError, LspResult};

/// How long `close` waits for the shutdown reply.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport open, handshake running
    Connecting,
    /// Handshake done
    Ready,
    /// `close` in progress
    Closing,
    /// Transport failed
    Errored,
    /// Closed on request
    Closed,
}

impl ConnectionState {
    pub fn is_usable(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Ready)
    }
}

/// What the client sends about one virtual document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentInfo {
    pub uri: Uri,
    pub language_id: String,
    pub text: String,
}

/// A notification pushed by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerNotification {
    pub method: String,
    pub params: Value,
}

/// Settings for opening a connection.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub endpoint: Endpoint,

    /// Workspace root announced during `initialize`
    pub root_uri: Uri,

    pub request_timeout: Duration,
}

type PendingMap = HashMap<i64, oneshot::Sender<Result<Value, LspError>>>;

enum Outgoing {
    Message(String),
    Close,
}

/// A live session with a language server.
pub struct LspConnection {
    endpoint: Endpoint,
    root_uri: Uri,
    request_timeout: Duration,

    outgoing: mpsc::UnboundedSender<Outgoing>,
    pending: Mutex<PendingMap>,
    next_id: AtomicI64,
    state: watch::Sender<ConnectionState>,
    capabilities: RwLock<Option<ServerCapabilities>>,
    last_error: Mutex<Option<TransportError>>,

    /// Open documents and their last sent version
    versions: Mutex<HashMap<Uri, i32>>,
    /// Documents waiting for the handshake
    open_queue: Mutex<Vec<DocumentInfo>>,

    notifications: Signal<ServerNotification>,
    diagnostics: Signal<PublishDiagnosticsParams>,
    errors: Signal<TransportError>,

    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl std::fmt::Debug for LspConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LspConnection")
            .field("language", &self.endpoint.language)
            .field("state", &self.state())
            .finish()
    }
}

impl LspConnection {
    /// Opens a transport and starts the handshake in the background.
    ///
    /// Returns as soon as the transport is open. Transport failures,
    /// including terminal closures, are returned as errors.
    pub async fn open(
        connector: &dyn TransportConnector,
        options: ConnectionOptions,
    ) -> LspResult<Arc<Self>> {
        let Transport { sink, stream } = connector.open(&options.endpoint).await?;
        tracing::info!(
            "Opened transport for {} at {}",
            options.endpoint.language,
            options.endpoint.url
        );

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let connection = Arc::new(Self {
            endpoint: options.endpoint,
            root_uri: options.root_uri,
            request_timeout: options.request_timeout,
            outgoing,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            state,
            capabilities: RwLock::new(None),
            last_error: Mutex::new(None),
            versions: Mutex::new(HashMap::new()),
            open_queue: Mutex::new(Vec::new()),
            notifications: Signal::new(),
            diagnostics: Signal::new(),
            errors: Signal::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&connection);
        let writer = tokio::spawn(write_loop(weak.clone(), sink, outgoing_rx));
        let reader = tokio::spawn(read_loop(weak.clone(), stream));
        let handshake = tokio::spawn(async move {
            let Some(connection) = weak.upgrade() else {
                return;
            };
            if let Err(e) = connection.initialize().await {
                tracing::warn!("{} handshake failed: {}", connection.language(), e);
                connection.fail(TransportError::Protocol(format!("initialize failed: {}", e)));
            }
        });
        lock(&connection.tasks).extend([writer, reader, handshake]);

        Ok(connection)
    }

    async fn initialize(&self) -> LspResult<()> {
        #[allow(deprecated)]
        let params = InitializeParams {
            process_id: Some(std::process::id()),
            root_uri: Some(self.root_uri.clone()),
            workspace_folders: Some(vec![WorkspaceFolder {
                uri: self.root_uri.clone(),
                name: "root".to_string(),
            }]),
            capabilities: client_capabilities(),
            client_info: Some(ClientInfo {
                name: "nblsp".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            ..Default::default()
        };

        // No request timeout: the caller's readiness window bounds the handshake
        let value = self
            .request_value(Initialize::METHOD, serde_json::to_value(params)?, None)
            .await?;
        let result: InitializeResult = serde_json::from_value(value)?;
        *self
            .capabilities
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(result.capabilities);
        self.notify::<Initialized>(InitializedParams {})?;

        if self.state() == ConnectionState::Connecting {
            self.state.send_replace(ConnectionState::Ready);
            tracing::info!("{} server initialized", self.language());
            self.flush_open_queue();
        }
        Ok(())
    }

    // ========================================================================
    // State
    // ========================================================================

    pub fn language(&self) -> &str {
        &self.endpoint.language
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Transport open and not failed.
    pub fn is_connected(&self) -> bool {
        self.state().is_usable()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Waits up to `timeout` for the handshake. False if the connection
    /// failed or the time ran out.
    pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
        let mut changes = self.state.subscribe();
        let settled = tokio::time::timeout(
            timeout,
            changes.wait_for(|state| *state != ConnectionState::Connecting),
        )
        .await;
        matches!(settled, Ok(Ok(state)) if *state == ConnectionState::Ready)
    }

    pub fn capabilities(&self) -> Option<ServerCapabilities> {
        self.capabilities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The transport error that took the connection down, if any.
    pub fn last_error(&self) -> Option<TransportError> {
        lock(&self.last_error).clone()
    }

    // ========================================================================
    // Signals
    // ========================================================================

    /// Every server notification, diagnostics included.
    pub fn notifications(&self) -> &Signal<ServerNotification> {
        &self.notifications
    }

    pub fn diagnostics(&self) -> &Signal<PublishDiagnosticsParams> {
        &self.diagnostics
    }

    /// Unexpected transport failures.
    pub fn errors(&self) -> &Signal<TransportError> {
        &self.errors
    }

    // ========================================================================
    // Messaging
    // ========================================================================

    fn send_message(&self, message: &Message) -> LspResult<()> {
        tracing::trace!("-> {} {:?}", self.language(), message.method());
        self.outgoing
            .send(Outgoing::Message(message.to_text()))
            .map_err(|_| LspError::ConnectionClosed)
    }

    /// Sends a typed request and waits for its result.
    pub async fn request<R: Request>(&self, params: R::Params) -> LspResult<R::Result> {
        let value = self
            .request_value(R::METHOD, serde_json::to_value(params)?, Some(self.request_timeout))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn request_value(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> LspResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = oneshot::channel();
        lock(&self.pending).insert(id, sender);

        if let Err(e) = self.send_message(&Message::request(id, method, params)) {
            lock(&self.pending).remove(&id);
            return Err(e);
        }

        let Some(timeout) = timeout else {
            return receiver.await.unwrap_or(Err(LspError::ConnectionClosed));
        };
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LspError::ConnectionClosed),
            Err(_) => {
                lock(&self.pending).remove(&id);
                tracing::warn!("{} request {} timed out", self.language(), method);
                Err(LspError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Sends a typed notification.
    pub fn notify<N: Notification>(&self, params: N::Params) -> LspResult<()> {
        let params = serde_json::to_value(params)?;
        self.send_message(&Message::notification(N::METHOD, params))
    }

    fn handle_incoming(&self, text: &str) {
        let message = match Message::parse(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Dropping malformed message from {}: {}", self.language(), e);
                return;
            }
        };

        match message {
            Message::Response { id, result } => self.complete_request(id, result),
            Message::Notification { method, params } => {
                if method == PublishDiagnostics::METHOD {
                    match serde_json::from_value::<PublishDiagnosticsParams>(params.clone()) {
                        Ok(diagnostics) => {
                            self.diagnostics.emit(diagnostics);
                        }
                        Err(e) => tracing::warn!("Bad diagnostics payload: {}", e),
                    }
                }
                self.notifications.emit(ServerNotification { method, params });
            }
            Message::Request { id, method, params } => {
                let result = answer_server_request(&method, &params);
                if let Err(e) = self.send_message(&Message::response(id, result)) {
                    tracing::debug!("Could not answer {}: {}", method, e);
                }
            }
        }
    }

    fn complete_request(&self, id: RequestId, result: Result<Value, ResponseError>) {
        let id = match id {
            RequestId::Number(id) => id,
            other => {
                tracing::debug!("Ignoring response with foreign id {}", other);
                return;
            }
        };
        let Some(sender) = lock(&self.pending).remove(&id) else {
            tracing::trace!("Discarding late response {}", id);
            return;
        };
        let result = result.map_err(|error| LspError::Server {
            code: error.code,
            message: error.message,
        });
        let _ = sender.send(result);
    }

    /// Marks the connection failed and wakes every pending request.
    fn fail(&self, error: TransportError) {
        let mut unexpected = false;
        self.state.send_modify(|state| match state {
            ConnectionState::Connecting | ConnectionState::Ready => {
                *state = ConnectionState::Errored;
                unexpected = true;
            }
            ConnectionState::Closing => *state = ConnectionState::Closed,
            ConnectionState::Errored | ConnectionState::Closed => {}
        });

        for (_, sender) in lock(&self.pending).drain() {
            let _ = sender.send(Err(LspError::Transport(error.clone())));
        }

        if unexpected {
            tracing::warn!("{} connection failed: {}", self.language(), error);
            *lock(&self.last_error) = Some(error.clone());
            self.errors.emit(error);
        }
    }

    // ========================================================================
    // Document synchronization
    // ========================================================================

    pub fn is_document_open(&self, uri: &Uri) -> bool {
        lock(&self.versions).contains_key(uri)
    }

    /// Last version sent for `uri`.
    pub fn document_version(&self, uri: &Uri) -> Option<i32> {
        lock(&self.versions).get(uri).copied()
    }

    /// Sends `didOpen`. Opening an already open document does nothing.
    pub fn send_open(&self, document: &DocumentInfo) -> LspResult<()> {
        {
            let mut versions = lock(&self.versions);
            if versions.contains_key(&document.uri) {
                tracing::debug!("{} already open", document.uri.as_str());
                return Ok(());
            }
            versions.insert(document.uri.clone(), 0);
        }

        self.notify::<DidOpenTextDocument>(DidOpenTextDocumentParams {
            text_document: TextDocumentItem {
                uri: document.uri.clone(),
                language_id: document.language_id.clone(),
                version: 0,
                text: document.text.clone(),
            },
        })
    }

    /// Opens now if ready, otherwise right after the handshake.
    pub fn send_open_when_ready(&self, document: &DocumentInfo) -> LspResult<()> {
        // Checked under the queue lock so a concurrent flush cannot miss it
        let mut queue = lock(&self.open_queue);
        if self.is_ready() {
            drop(queue);
            return self.send_open(document);
        }
        queue.retain(|queued| queued.uri != document.uri);
        queue.push(document.clone());
        Ok(())
    }

    fn flush_open_queue(&self) {
        let queued = std::mem::take(&mut *lock(&self.open_queue));
        for document in queued {
            if let Err(e) = self.send_open(&document) {
                tracing::warn!("Deferred open of {} failed: {}", document.uri.as_str(), e);
            }
        }
    }

    /// Sends the whole text as a change. A document that was never opened
    /// is opened instead.
    pub fn send_full_text_change(&self, document: &DocumentInfo) -> LspResult<()> {
        let version = {
            let mut versions = lock(&self.versions);
            match versions.get_mut(&document.uri) {
                Some(version) => {
                    *version += 1;
                    Some(*version)
                }
                None => None,
            }
        };

        let Some(version) = version else {
            tracing::debug!("Change before open for {}", document.uri.as_str());
            return self.send_open(document);
        };

        self.notify::<DidChangeTextDocument>(DidChangeTextDocumentParams {
            text_document: VersionedTextDocumentIdentifier {
                uri: document.uri.clone(),
                version,
            },
            content_changes: vec![TextDocumentContentChangeEvent {
                range: None,
                range_length: None,
                text: document.text.clone(),
            }],
        })
    }

    pub fn send_saved(&self, document: &DocumentInfo) -> LspResult<()> {
        self.notify::<DidSaveTextDocument>(DidSaveTextDocumentParams {
            text_document: TextDocumentIdentifier {
                uri: document.uri.clone(),
            },
            text: Some(document.text.clone()),
        })
    }

    /// Sends `didClose` for an open document.
    pub fn send_close(&self, uri: &Uri) -> LspResult<()> {
        lock(&self.open_queue).retain(|queued| &queued.uri != uri);
        if lock(&self.versions).remove(uri).is_none() {
            return Ok(());
        }
        self.notify::<DidCloseTextDocument>(DidCloseTextDocumentParams {
            text_document: TextDocumentIdentifier { uri: uri.clone() },
        })
    }

    pub fn update_configuration(&self, settings: Value) -> LspResult<()> {
        self.notify::<DidChangeConfiguration>(DidChangeConfigurationParams { settings })
    }

    // ========================================================================
    // Feature requests
    // ========================================================================

    pub async fn get_hover_tooltip(
        &self,
        uri: &Uri,
        position: lsp_types::Position,
    ) -> LspResult<Option<Hover>> {
        self.request::<HoverRequest>(HoverParams {
            text_document_position_params: position_params(uri, position),
            work_done_progress_params: Default::default(),
        })
        .await
    }

    pub async fn get_completion(
        &self,
        uri: &Uri,
        position: lsp_types::Position,
    ) -> LspResult<Option<CompletionResponse>> {
        self.request::<Completion>(CompletionParams {
            text_document_position: position_params(uri, position),
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
            context: None,
        })
        .await
    }

    pub async fn get_signature_help(
        &self,
        uri: &Uri,
        position: lsp_types::Position,
    ) -> LspResult<Option<SignatureHelp>> {
        self.request::<SignatureHelpRequest>(SignatureHelpParams {
            context: None,
            text_document_position_params: position_params(uri, position),
            work_done_progress_params: Default::default(),
        })
        .await
    }

    pub async fn get_definition(
        &self,
        uri: &Uri,
        position: lsp_types::Position,
    ) -> LspResult<Option<GotoDefinitionResponse>> {
        self.request::<GotoDefinition>(GotoDefinitionParams {
            text_document_position_params: position_params(uri, position),
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
        })
        .await
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Sends `shutdown` and `exit`, then closes the transport.
    pub async fn close(&self) {
        let previous = self.state();
        if matches!(previous, ConnectionState::Closing | ConnectionState::Closed) {
            return;
        }
        self.state.send_replace(ConnectionState::Closing);

        if previous == ConnectionState::Ready {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.request::<Shutdown>(())).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!("{} shutdown request failed: {}", self.language(), e),
                Err(_) => tracing::debug!("{} shutdown request timed out", self.language()),
            }
            let _ = self.notify::<Exit>(());
        }

        let _ = self.outgoing.send(Outgoing::Close);
        self.state.send_replace(ConnectionState::Closed);
        lock(&self.versions).clear();
        for (_, sender) in lock(&self.pending).drain() {
            let _ = sender.send(Err(LspError::ConnectionClosed));
        }
        tracing::info!("Closed {} connection", self.language());
    }
}

impl Drop for LspConnection {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

async fn write_loop(
    weak: Weak<LspConnection>,
    mut sink: Box<dyn MessageSink>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
) {
    while let Some(item) = outgoing.recv().await {
        match item {
            Outgoing::Message(text) => {
                if let Err(e) = sink.send(text).await {
                    if let Some(connection) = weak.upgrade() {
                        connection.fail(e);
                    }
                    break;
                }
            }
            Outgoing::Close => {
                sink.close().await;
                break;
            }
        }
    }
}

async fn read_loop(weak: Weak<LspConnection>, mut stream: Box<dyn MessageStream>) {
    loop {
        let next = stream.next().await;
        let Some(connection) = weak.upgrade() else {
            return;
        };
        match next {
            Some(Ok(text)) => connection.handle_incoming(&text),
            Some(Err(e)) => {
                connection.fail(e);
                return;
            }
            None => {
                connection.fail(TransportError::closed(CLOSE_ABNORMAL, "stream ended"));
                return;
            }
        }
    }
}

/// Replies to requests the server sends to the client.
fn answer_server_request(method: &str, params: &Value) -> Result<Value, ResponseError> {
    match method {
        // One null per requested section: use server defaults
        "workspace/configuration" => {
            let items = params["items"].as_array().map_or(0, Vec::len);
            Ok(Value::Array(vec![Value::Null; items]))
        }
        "client/registerCapability"
        | "client/unregisterCapability"
        | "window/workDoneProgress/create" => Ok(Value::Null),
        other => {
            tracing::debug!("Unhandled server request {}", other);
            Err(ResponseError::method_not_found(other))
        }
    }
}

fn position_params(uri: &Uri, position: lsp_types::Position) -> TextDocumentPositionParams {
    TextDocumentPositionParams {
        text_document: TextDocumentIdentifier { uri: uri.clone() },
        position,
    }
}

fn client_capabilities() -> ClientCapabilities {
    ClientCapabilities {
        workspace: Some(WorkspaceClientCapabilities {
            configuration: Some(true),
            workspace_folders: Some(true),
            ..Default::default()
        }),
        text_document: Some(TextDocumentClientCapabilities {
            synchronization: Some(TextDocumentSyncClientCapabilities {
                did_save: Some(true),
                ..Default::default()
            }),
            hover: Some(HoverClientCapabilities {
                dynamic_registration: Some(false),
                content_format: Some(vec![MarkupKind::Markdown, MarkupKind::PlainText]),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryConnector, MemoryPeer, ScriptedServer};
    use serde_json::json;

    fn options(language: &str) -> ConnectionOptions {
        ConnectionOptions {
            endpoint: Endpoint {
                language: language.to_string(),
                url: format!("ws://localhost:8888/lsp/{}", language),
            },
            root_uri: "file:///".parse().unwrap(),
            request_timeout: Duration::from_secs(10),
        }
    }

    fn info(uri: &str, text: &str) -> DocumentInfo {
        DocumentInfo {
            uri: uri.parse().unwrap(),
            language_id: "python".to_string(),
            text: text.to_string(),
        }
    }

    async fn ready_connection(server: &ScriptedServer) -> Arc<LspConnection> {
        let connector = MemoryConnector::serving(server.clone());
        let connection = LspConnection::open(&connector, options("python")).await.unwrap();
        assert!(connection.wait_until_ready(Duration::from_secs(5)).await);
        connection
    }

    /// A connector whose single peer is handed to the test.
    fn manual_connector() -> (MemoryConnector, Arc<Mutex<Option<MemoryPeer>>>) {
        let slot = Arc::new(Mutex::new(None));
        let stored = slot.clone();
        let connector = MemoryConnector::new(move |peer| {
            *stored.lock().unwrap() = Some(peer);
            Ok(())
        });
        (connector, slot)
    }

    #[tokio::test]
    async fn test_handshake_reaches_ready() {
        let server = ScriptedServer::new();
        let connection = ready_connection(&server).await;

        assert!(connection.capabilities().is_some());
        let methods: Vec<_> = server
            .received()
            .iter()
            .filter_map(|m| m.method().map(str::to_string))
            .collect();
        assert_eq!(methods, vec!["initialize", "initialized"]);
    }

    #[tokio::test]
    async fn test_open_queued_until_ready() {
        let (connector, slot) = manual_connector();
        let connection = LspConnection::open(&connector, options("python")).await.unwrap();
        let mut peer = slot.lock().unwrap().take().unwrap();

        connection.send_open_when_ready(&info("file:///a.py", "x = 1")).unwrap();
        let Some(Message::Request { id, method, .. }) = peer.recv_message().await else {
            panic!("expected initialize");
        };
        assert_eq!(method, "initialize");
        peer.send(&Message::response(id, Ok(json!({ "capabilities": {} }))));

        assert_eq!(peer.recv_message().await.unwrap().method(), Some("initialized"));
        let open = peer.recv_message().await.unwrap();
        assert_eq!(open.method(), Some("textDocument/didOpen"));
        assert!(connection.is_ready());
    }

    #[tokio::test]
    async fn test_change_before_open_sends_open() {
        let server = ScriptedServer::new();
        let connection = ready_connection(&server).await;
        let document = info("file:///a.py", "x = 1");

        connection.send_full_text_change(&document).unwrap();
        connection.send_full_text_change(&info("file:///a.py", "x = 2")).unwrap();

        let opens = server
            .wait_for_notifications("textDocument/didOpen", 1, Duration::from_secs(5))
            .await;
        let changes = server
            .wait_for_notifications("textDocument/didChange", 1, Duration::from_secs(5))
            .await;
        assert_eq!(opens[0]["textDocument"]["text"], "x = 1");
        assert_eq!(changes[0]["textDocument"]["version"], 1);
        assert_eq!(changes[0]["contentChanges"][0]["text"], "x = 2");
        assert_eq!(connection.document_version(&document.uri), Some(1));
    }

    #[tokio::test]
    async fn test_close_only_sent_for_open_documents() {
        let server = ScriptedServer::new();
        let connection = ready_connection(&server).await;
        let document = info("file:///a.py", "");

        connection.send_close(&document.uri).unwrap();
        connection.send_open(&document).unwrap();
        connection.send_close(&document.uri).unwrap();
        connection.send_close(&document.uri).unwrap();

        let closes = server
            .wait_for_notifications("textDocument/didClose", 1, Duration::from_secs(5))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(closes.len(), 1);
        assert_eq!(server.notifications("textDocument/didClose").len(), 1);
        assert!(!connection.is_document_open(&document.uri));
    }

    #[tokio::test]
    async fn test_hover_reply_is_typed() {
        let server = ScriptedServer::new().with_hover("**int**");
        let connection = ready_connection(&server).await;

        let hover = connection
            .get_hover_tooltip(&"file:///a.py".parse().unwrap(), lsp_types::Position::new(0, 0))
            .await
            .unwrap()
            .unwrap();
        match hover.contents {
            lsp_types::HoverContents::Markup(markup) => assert_eq!(markup.value, "**int**"),
            other => panic!("unexpected contents {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_discards_late_reply() {
        let server = ScriptedServer::new()
            .with_hover("late")
            .with_hover_delay(Duration::from_secs(30));
        let connection = ready_connection(&server).await;

        let result = connection
            .get_hover_tooltip(&"file:///a.py".parse().unwrap(), lsp_types::Position::new(0, 0))
            .await;
        assert!(matches!(result, Err(LspError::Timeout { .. })));

        // the late reply lands on an empty pending map
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(lock(&connection.pending).is_empty());
        assert!(connection.is_ready());
    }

    #[tokio::test]
    async fn test_server_requests_are_answered() {
        let (connector, slot) = manual_connector();
        let _connection = LspConnection::open(&connector, options("python")).await.unwrap();
        let mut peer = slot.lock().unwrap().take().unwrap();
        // skip initialize
        peer.recv_message().await.unwrap();

        peer.send(&Message::Request {
            id: RequestId::String("cfg".into()),
            method: "workspace/configuration".into(),
            params: json!({ "items": [{ "section": "pylsp" }, { "section": "other" }] }),
        });
        peer.send(&Message::request(7, "workspace/applyEdit", json!({})));

        let Some(Message::Response { id, result }) = peer.recv_message().await else {
            panic!("expected response");
        };
        assert_eq!(id, RequestId::String("cfg".into()));
        assert_eq!(result, Ok(json!([null, null])));

        let Some(Message::Response { result: Err(error), .. }) = peer.recv_message().await else {
            panic!("expected error response");
        };
        assert_eq!(error.code, crate::protocol::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_dropped_peer_fails_pending_and_emits_error() {
        let (connector, slot) = manual_connector();
        let connection = LspConnection::open(&connector, options("python")).await.unwrap();
        let mut errors = connection.errors().subscribe();
        let peer = slot.lock().unwrap().take().unwrap();

        drop(peer);

        let error = errors.next().await.unwrap();
        assert!(!error.is_terminal());
        assert_eq!(connection.state(), ConnectionState::Errored);
        assert!(!connection.wait_until_ready(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_close_sends_shutdown_then_exit() {
        let server = ScriptedServer::new();
        let connection = ready_connection(&server).await;
        let mut errors = connection.errors().subscribe();

        connection.close().await;
        connection.close().await;

        let exits = server
            .wait_for_notifications("exit", 1, Duration::from_secs(5))
            .await;
        assert_eq!(exits.len(), 1);
        assert_eq!(server.requests("shutdown").len(), 1);
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(errors.try_next().is_none());
    }

    #[tokio::test]
    async fn test_diagnostics_signal() {
        let server = ScriptedServer::new().with_diagnostic_marker("oops");
        let connection = ready_connection(&server).await;
        let mut diagnostics = connection.diagnostics().subscribe();

        connection.send_open(&info("file:///a.py", "oops()")).unwrap();

        let published = diagnostics.next().await.unwrap();
        assert_eq!(published.uri.as_str(), "file:///a.py");
        assert_eq!(published.diagnostics.len(), 1);
    }
}
