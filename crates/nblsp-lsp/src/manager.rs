//! Maps virtual documents onto pooled connections.
//!
//! ## Learning: Readiness Windows
//!
//! A server can take a long time to initialize (first run of a Python
//! environment, an R package install). `connect` waits a short window
//! first, logs, then waits a much longer grace window before giving up:
//!
//! ```text
//! open ──► wait ready_timeout ──► (log) ──► wait ready_grace ──► give up
//!               │ ready                          │ ready
//!               ▼                                ▼
//!           connected                        connected
//! ```
//!
//! A terminal closure (code 1005) puts the language on an ignore list so no
//! further connection is ever attempted for it. Transient failures are
//! retried with a delay that grows by half a second per attempt up to five
//! seconds.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

use nblsp_core::config::ConnectionConfig;
use nblsp_core::{Signal, VirtualDocument};

use crate::connection::{ConnectionOptions, ConnectionState, DocumentInfo, LspConnection};
use crate::pool::ConnectionPool;
use crate::transport::Endpoint;
use crate::uri::{parse_uri, solve_uris};
use crate::LspResult;

/// Added to the retry delay after each failed attempt.
const RETRY_STEP: Duration = Duration::from_millis(500);

/// The retry delay stops growing here.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

/// What to connect.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub document: Arc<VirtualDocument>,

    /// Send `didOpen` once ready. Adapters that attach features first turn
    /// this off and open the document themselves.
    pub open_document: bool,
}

impl ConnectOptions {
    pub fn new(document: Arc<VirtualDocument>) -> Self {
        Self {
            document,
            open_document: true,
        }
    }

    pub fn without_open(mut self) -> Self {
        self.open_document = false;
        self
    }
}

/// Payload of the manager's signals.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub document: Arc<VirtualDocument>,
    pub language: String,
    pub connection: Option<Arc<LspConnection>>,
}

/// Connects virtual documents to language servers.
pub struct ConnectionManager {
    this: Weak<Self>,
    pool: Arc<ConnectionPool>,
    config: ConnectionConfig,

    /// id path → connection
    connections: RwLock<HashMap<String, Arc<LspConnection>>>,
    /// id path → document
    documents: RwLock<HashMap<String, Arc<VirtualDocument>>>,
    ignored_languages: RwLock<HashSet<String>>,
    monitors: Mutex<HashMap<String, JoinHandle<()>>>,

    connected: Signal<ConnectionEvent>,
    initialized: Signal<ConnectionEvent>,
    disconnected: Signal<ConnectionEvent>,
    closed: Signal<ConnectionEvent>,
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl ConnectionManager {
    pub fn new(pool: Arc<ConnectionPool>, config: ConnectionConfig) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            pool,
            config,
            connections: RwLock::new(HashMap::new()),
            documents: RwLock::new(HashMap::new()),
            ignored_languages: RwLock::new(HashSet::new()),
            monitors: Mutex::new(HashMap::new()),
            connected: Signal::new(),
            initialized: Signal::new(),
            disconnected: Signal::new(),
            closed: Signal::new(),
        })
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    // ========================================================================
    // Signals
    // ========================================================================

    pub fn connected(&self) -> &Signal<ConnectionEvent> {
        &self.connected
    }

    /// Server capabilities are available on the event's connection.
    pub fn initialized(&self) -> &Signal<ConnectionEvent> {
        &self.initialized
    }

    /// A transient failure; a retry may follow.
    pub fn disconnected(&self) -> &Signal<ConnectionEvent> {
        &self.disconnected
    }

    /// The document will not be served again: it was unregistered or its
    /// language is ignored.
    pub fn closed(&self) -> &Signal<ConnectionEvent> {
        &self.closed
    }

    fn event(&self, document: &Arc<VirtualDocument>, connection: Option<Arc<LspConnection>>) -> ConnectionEvent {
        ConnectionEvent {
            document: document.clone(),
            language: document.language().to_string(),
            connection,
        }
    }

    // ========================================================================
    // Registry
    // ========================================================================

    pub fn register_document(&self, document: &Arc<VirtualDocument>) {
        write(&self.documents).insert(document.id_path(), document.clone());
    }

    pub fn is_registered(&self, id_path: &str) -> bool {
        read(&self.documents).contains_key(id_path)
    }

    pub fn document(&self, id_path: &str) -> Option<Arc<VirtualDocument>> {
        read(&self.documents).get(id_path).cloned()
    }

    pub fn documents(&self) -> Vec<Arc<VirtualDocument>> {
        read(&self.documents).values().cloned().collect()
    }

    pub fn connection_for(&self, document: &VirtualDocument) -> Option<Arc<LspConnection>> {
        read(&self.connections).get(&document.id_path()).cloned()
    }

    pub fn is_ignored(&self, language: &str) -> bool {
        read(&self.ignored_languages).contains(language)
    }

    pub fn ignored_languages(&self) -> Vec<String> {
        let mut languages: Vec<String> = read(&self.ignored_languages).iter().cloned().collect();
        languages.sort();
        languages
    }

    fn ignore_language(&self, language: &str, reason: &dyn std::fmt::Display) {
        if write(&self.ignored_languages).insert(language.to_string()) {
            tracing::warn!("Ignoring {} from now on: {}", language, reason);
        }
    }

    /// What a connection needs to open or update `document`.
    pub fn document_info(&self, document: &VirtualDocument) -> LspResult<DocumentInfo> {
        let uris = solve_uris(document, &self.config)?;
        Ok(DocumentInfo {
            uri: uris.document,
            language_id: document.language().to_string(),
            text: document.value(),
        })
    }

    // ========================================================================
    // Connecting
    // ========================================================================

    /// Connects `options.document` and waits for the server to be ready.
    ///
    /// Returns `None` when the language is ignored, the transport fails or
    /// both readiness windows pass.
    pub async fn connect(&self, options: ConnectOptions) -> Option<Arc<LspConnection>> {
        let document = &options.document;
        let language = document.language().to_string();
        if self.is_ignored(&language) {
            tracing::debug!("Not connecting {}: {} is ignored", document.id_path(), language);
            return None;
        }
        self.register_document(document);

        let connection_options = match self.connection_options(document) {
            Ok(connection_options) => connection_options,
            Err(e) => {
                tracing::warn!("Cannot resolve URIs for {}: {}", document.id_path(), e);
                return None;
            }
        };

        let connection = match self.pool.get_or_connect(connection_options).await {
            Ok(connection) => connection,
            Err(e) if e.is_terminal() => {
                self.ignore_language(&language, &e);
                self.closed.emit(self.event(document, None));
                return None;
            }
            Err(e) => {
                tracing::warn!("Connecting {} failed: {}", document.id_path(), e);
                self.disconnected.emit(self.event(document, None));
                return None;
            }
        };

        if !self.wait_until_ready(&connection, document).await {
            return None;
        }

        let id_path = document.id_path();
        if !self.is_registered(&id_path) || document.is_disposed() {
            tracing::debug!("{} went away while connecting", id_path);
            return None;
        }
        write(&self.connections).insert(id_path, connection.clone());

        if options.open_document {
            match self.document_info(document) {
                Ok(info) => {
                    if let Err(e) = connection.send_open_when_ready(&info) {
                        tracing::warn!("Opening {} failed: {}", document.id_path(), e);
                    }
                }
                Err(e) => tracing::warn!("Cannot open {}: {}", document.id_path(), e),
            }
        }

        let event = self.event(document, Some(connection.clone()));
        self.connected.emit(event.clone());
        self.initialized.emit(event);
        self.monitor(document, &connection);
        Some(connection)
    }

    fn connection_options(&self, document: &VirtualDocument) -> LspResult<ConnectionOptions> {
        let uris = solve_uris(document, &self.config)?;
        Ok(ConnectionOptions {
            endpoint: Endpoint {
                language: document.language().to_string(),
                url: uris.server,
            },
            root_uri: parse_uri(&self.config.root_uri)?,
            request_timeout: self.config.request_timeout(),
        })
    }

    async fn wait_until_ready(&self, connection: &Arc<LspConnection>, document: &Arc<VirtualDocument>) -> bool {
        if connection.wait_until_ready(self.config.ready_timeout()).await {
            return true;
        }

        if connection.is_connected() {
            tracing::info!(
                "Connection for {} not ready after {:?}, waiting another {:?}",
                document.id_path(),
                self.config.ready_timeout(),
                self.config.ready_grace()
            );
            if connection.wait_until_ready(self.config.ready_grace()).await {
                return true;
            }
        }

        match connection.last_error() {
            Some(error) if error.is_terminal() => {
                self.ignore_language(document.language(), &error);
                self.closed.emit(self.event(document, None));
            }
            _ if connection.state() == ConnectionState::Connecting => {
                tracing::warn!("Giving up on {} server for {}", document.language(), document.id_path());
                connection.close().await;
            }
            _ => {
                self.disconnected.emit(self.event(document, None));
            }
        }
        false
    }

    /// Calls [`ConnectionManager::connect`] until it succeeds, the retries
    /// run out or the language gets ignored.
    ///
    /// `retries` of `None` retries forever.
    pub async fn retry_to_connect(
        &self,
        options: ConnectOptions,
        reconnect_delay: Duration,
        retries: Option<u32>,
    ) -> Option<Arc<LspConnection>> {
        let language = options.document.language().to_string();
        let mut delay = reconnect_delay;
        let mut attempts_left = retries;

        loop {
            if self.is_ignored(&language) || options.document.is_disposed() {
                return None;
            }
            if let Some(connection) = self.connect(options.clone()).await {
                return Some(connection);
            }

            if let Some(left) = attempts_left.as_mut() {
                *left = left.saturating_sub(1);
                if *left == 0 {
                    tracing::warn!("Out of retries for {}", options.document.id_path());
                    return None;
                }
            }
            if self.is_ignored(&language) {
                return None;
            }

            tracing::info!("Will reconnect {} in {:?}", options.document.id_path(), delay);
            tokio::time::sleep(delay).await;
            if delay < MAX_RETRY_DELAY {
                delay = (delay + RETRY_STEP).min(MAX_RETRY_DELAY);
            }
        }
    }

    /// Watches a connection on behalf of one document and reacts to its
    /// loss.
    fn monitor(&self, document: &Arc<VirtualDocument>, connection: &Arc<LspConnection>) {
        let manager = self.this.clone();
        let document = document.clone();
        let connection = connection.clone();
        let id_path = document.id_path();
        let mut states = connection.state_changes();

        let handle = tokio::spawn(async move {
            let lost = states
                .wait_for(|state| matches!(state, ConnectionState::Errored | ConnectionState::Closed))
                .await
                .map(|state| *state);
            let (Ok(state), Some(manager)) = (lost, manager.upgrade()) else {
                return;
            };
            manager.connection_lost(document, connection, state).await;
        });

        if let Some(previous) = self
            .monitors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id_path, handle)
        {
            previous.abort();
        }
    }

    async fn connection_lost(
        &self,
        document: Arc<VirtualDocument>,
        connection: Arc<LspConnection>,
        state: ConnectionState,
    ) {
        let id_path = document.id_path();
        if !self.is_registered(&id_path) {
            return;
        }
        // This task is the monitor; a reconnect installs a fresh one
        self.monitors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id_path);
        {
            let mut connections = write(&self.connections);
            if connections
                .get(&id_path)
                .is_some_and(|current| Arc::ptr_eq(current, &connection))
            {
                connections.remove(&id_path);
            }
        }

        let error = connection.last_error();
        if let Some(error) = error.as_ref().filter(|error| error.is_terminal()) {
            self.ignore_language(document.language(), error);
            self.closed.emit(self.event(&document, None));
            return;
        }

        // Closed is only reached through an intentional close
        if state == ConnectionState::Closed || document.is_disposed() {
            tracing::debug!("Connection for {} closed, not reconnecting", id_path);
            self.closed.emit(self.event(&document, None));
            return;
        }

        self.disconnected.emit(self.event(&document, Some(connection)));

        tracing::info!("Lost connection for {}, reconnecting", id_path);
        self.retry_to_connect(
            ConnectOptions::new(document),
            self.config.reconnect_delay(),
            self.config.max_retries,
        )
        .await;
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Forgets `document`, closes it on its server and emits `closed`.
    /// Does nothing for a document that is not registered.
    pub fn unregister_document(&self, document: &Arc<VirtualDocument>) {
        let id_path = document.id_path();
        let registered = write(&self.documents).remove(&id_path).is_some();
        let connection = write(&self.connections).remove(&id_path);
        if let Some(monitor) = self
            .monitors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id_path)
        {
            monitor.abort();
        }

        if let Some(connection) = &connection {
            match self.document_info(document) {
                Ok(info) => {
                    if let Err(e) = connection.send_close(&info.uri) {
                        tracing::debug!("Closing {} on server failed: {}", id_path, e);
                    }
                }
                Err(e) => tracing::debug!("No URI for {}: {}", id_path, e),
            }
        }

        if registered || connection.is_some() {
            tracing::debug!("Unregistered {}", id_path);
            self.closed.emit(self.event(document, connection));
        }
    }

    /// Sends new settings to every pooled server.
    pub async fn update_configuration(&self, settings: Value) {
        for connection in self.pool.connections().await {
            if !connection.is_ready() {
                continue;
            }
            if let Err(e) = connection.update_configuration(settings.clone()) {
                tracing::warn!("Configuration update for {} failed: {}", connection.language(), e);
            }
        }
    }

    /// Stops every monitor and forgets all documents.
    pub fn dispose(&self) {
        for (_, monitor) in self
            .monitors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
        {
            monitor.abort();
        }
        write(&self.connections).clear();
        write(&self.documents).clear();
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        for (_, monitor) in self
            .monitors
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
        {
            monitor.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryConnector, ScriptedServer};
    use crate::transport::{CLOSE_ABNORMAL, CLOSE_NO_STATUS, TransportError};
    use nblsp_core::VirtualDocumentOptions;
    use serde_json::json;

    fn document(language: &str, path: &str) -> Arc<VirtualDocument> {
        VirtualDocument::new(VirtualDocumentOptions::new(language, language, path))
    }

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            ready_timeout_secs: 1,
            ready_grace_secs: 1,
            reconnect_delay_secs: 1.0,
            ..ConnectionConfig::default()
        }
    }

    fn manager_with(connector: Arc<MemoryConnector>) -> Arc<ConnectionManager> {
        ConnectionManager::new(Arc::new(ConnectionPool::new(connector)), config())
    }

    fn refusing(language: &'static str, code: u16) -> Arc<MemoryConnector> {
        let server = ScriptedServer::new();
        Arc::new(MemoryConnector::new(move |peer| {
            if peer.endpoint().language == language {
                return Err(TransportError::closed(code, "refused"));
            }
            server.serve(peer);
            Ok(())
        }))
    }

    #[tokio::test]
    async fn test_same_language_shares_connection() {
        let connector = Arc::new(MemoryConnector::serving(ScriptedServer::new()));
        let manager = manager_with(connector.clone());

        let a = manager.connect(ConnectOptions::new(document("python", "a.ipynb"))).await.unwrap();
        let b = manager.connect(ConnectOptions::new(document("python", "b.ipynb"))).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(connector.opened("python"), 1);
    }

    #[tokio::test]
    async fn test_connect_opens_document() {
        let server = ScriptedServer::new();
        let manager = manager_with(Arc::new(MemoryConnector::serving(server.clone())));
        let mut connected = manager.connected().subscribe();

        let doc = document("python", "a.ipynb");
        manager.connect(ConnectOptions::new(doc.clone())).await.unwrap();

        let opens = server
            .wait_for_notifications("textDocument/didOpen", 1, Duration::from_secs(5))
            .await;
        assert_eq!(opens[0]["textDocument"]["uri"], "file:///.virtual_documents/a.ipynb");
        assert_eq!(connected.next().await.unwrap().document.id_path(), doc.id_path());
    }

    #[tokio::test]
    async fn test_terminal_failure_ignores_language() {
        let connector = refusing("r", CLOSE_NO_STATUS);
        let manager = manager_with(connector.clone());
        let mut closed = manager.closed().subscribe();
        let doc = document("r", "a.ipynb");

        assert!(manager.connect(ConnectOptions::new(doc.clone())).await.is_none());
        assert!(manager.is_ignored("r"));
        assert_eq!(closed.next().await.unwrap().language, "r");

        assert!(manager.connect(ConnectOptions::new(doc.clone())).await.is_none());
        assert!(
            manager
                .retry_to_connect(ConnectOptions::new(doc), Duration::from_secs(1), None)
                .await
                .is_none()
        );
        assert_eq!(connector.opened("r"), 1);
    }

    #[tokio::test]
    async fn test_pool_shutdown_closes_without_reconnecting() {
        let connector = Arc::new(MemoryConnector::serving(ScriptedServer::new()));
        let manager = manager_with(connector.clone());
        let mut disconnected = manager.disconnected().subscribe();
        let mut closed = manager.closed().subscribe();
        let doc = document("python", "a.ipynb");
        manager.connect(ConnectOptions::new(doc.clone())).await.unwrap();

        manager.pool().shutdown().await;

        let event = tokio::time::timeout(Duration::from_secs(5), closed.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.document.id_path(), doc.id_path());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(disconnected.try_next().map(|event| event.document.id_path()), None);
        assert_eq!(closed.try_next().map(|event| event.document.id_path()), None);
        assert_eq!(connector.opened("python"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_delay_grows_linearly() {
        let connector = refusing("python", CLOSE_ABNORMAL);
        let manager = manager_with(connector.clone());
        let started = tokio::time::Instant::now();

        let result = manager
            .retry_to_connect(
                ConnectOptions::new(document("python", "a.ipynb")),
                Duration::from_secs(1),
                Some(4),
            )
            .await;

        assert!(result.is_none());
        assert_eq!(connector.opened("python"), 4);
        // 1s + 1.5s + 2s between four attempts
        assert_eq!(started.elapsed(), Duration::from_millis(4500));
        assert!(!manager.is_ignored("python"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_delay_is_capped() {
        let connector = refusing("python", CLOSE_ABNORMAL);
        let manager = manager_with(connector.clone());
        let started = tokio::time::Instant::now();

        manager
            .retry_to_connect(
                ConnectOptions::new(document("python", "a.ipynb")),
                Duration::from_millis(4800),
                Some(4),
            )
            .await;

        // 4.8s + 5s + 5s
        assert_eq!(started.elapsed(), Duration::from_millis(14800));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_server_gives_up_after_both_windows() {
        let connector = Arc::new(MemoryConnector::serving(ScriptedServer::new().unresponsive()));
        let manager = manager_with(connector);
        let started = tokio::time::Instant::now();

        let result = manager.connect(ConnectOptions::new(document("python", "a.ipynb"))).await;

        assert!(result.is_none());
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(!manager.is_ignored("python"));
    }

    #[tokio::test]
    async fn test_unregister_closes_once() {
        let server = ScriptedServer::new();
        let manager = manager_with(Arc::new(MemoryConnector::serving(server.clone())));
        let mut closed = manager.closed().subscribe();
        let doc = document("python", "a.ipynb");
        manager.connect(ConnectOptions::new(doc.clone())).await.unwrap();

        manager.unregister_document(&doc);
        manager.unregister_document(&doc);

        assert!(manager.connection_for(&doc).is_none());
        let closes = server
            .wait_for_notifications("textDocument/didClose", 1, Duration::from_secs(5))
            .await;
        assert_eq!(closes.len(), 1);
        assert_eq!(closed.drain().len(), 1);
    }

    #[tokio::test]
    async fn test_lost_connection_reconnects() {
        let server = ScriptedServer::new();
        let connector = Arc::new(MemoryConnector::serving(server.clone()));
        let manager = ConnectionManager::new(
            Arc::new(ConnectionPool::new(connector.clone())),
            ConnectionConfig {
                reconnect_delay_secs: 0.01,
                ..config()
            },
        );
        let mut disconnected = manager.disconnected().subscribe();
        let mut connected = manager.connected().subscribe();
        let doc = document("python", "a.ipynb");
        let first = manager.connect(ConnectOptions::new(doc.clone())).await.unwrap();
        connected.next().await.unwrap();

        server.disconnect(TransportError::closed(CLOSE_ABNORMAL, "dropped"));

        let lost = disconnected.next().await.unwrap();
        assert!(lost.connection.is_some_and(|c| Arc::ptr_eq(&c, &first)));
        let again = connected.next().await.unwrap();
        let second = again.connection.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(connector.opened("python"), 2);
        assert!(manager.connection_for(&doc).is_some_and(|c| Arc::ptr_eq(&c, &second)));
    }

    #[tokio::test]
    async fn test_update_configuration_reaches_servers() {
        let server = ScriptedServer::new();
        let manager = manager_with(Arc::new(MemoryConnector::serving(server.clone())));
        manager.connect(ConnectOptions::new(document("python", "a.ipynb"))).await.unwrap();

        manager.update_configuration(json!({ "pylsp": { "plugins": {} } })).await;

        let updates = server
            .wait_for_notifications("workspace/didChangeConfiguration", 1, Duration::from_secs(5))
            .await;
        assert_eq!(updates[0]["settings"]["pylsp"]["plugins"], json!({}));
    }
}
