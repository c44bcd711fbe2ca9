//! Adapters between host documents, virtual documents and servers.
//!
//! ## Learning: Subscribe, Connect, Attach, Open
//!
//! A [`WidgetAdapter`] owns the virtual document tree of one host. The
//! order of operations for every document in the tree is fixed:
//!
//! 1. subscribe to the tree's signals (before anything can emit)
//! 2. connect through the [`ConnectionManager`]
//! 3. build an [`EditorAdapter`], which instantiates the features
//! 4. send `didOpen`
//!
//! Features installed in step 3 therefore observe everything the server
//! says about the document.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::task::JoinHandle;

use nblsp_core::config::Config;
use nblsp_core::extractor::ExtractorRegistry;
use nblsp_core::host::{HostChange, HostDocument};
use nblsp_core::{
    CoreError, DocumentChanged, EditorKind, ForeignDocumentEvent, Signal, SignalReceiver,
    UpdateManager, VirtualDocument, VirtualEditor,
};

use crate::connection::LspConnection;
use crate::feature::{Feature, FeatureContext, FeatureRegistry};
use crate::manager::{ConnectOptions, ConnectionEvent, ConnectionManager};
use crate::{LspError, LspResult};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Editor adapter
// ============================================================================

/// The features attached to one virtual document on one connection.
pub struct EditorAdapter {
    document: Arc<VirtualDocument>,
    connection: Arc<LspConnection>,
    features: Vec<Box<dyn Feature>>,
    disposed: AtomicBool,
}

impl EditorAdapter {
    pub fn new(context: FeatureContext, registry: &FeatureRegistry) -> Self {
        let features = registry.create(&context);
        tracing::debug!(
            "Attached {} features to {}",
            features.len(),
            context.document.id_path()
        );
        Self {
            document: context.document,
            connection: context.connection,
            features,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn document(&self) -> &Arc<VirtualDocument> {
        &self.document
    }

    pub fn connection(&self) -> &Arc<LspConnection> {
        &self.connection
    }

    pub fn feature_ids(&self) -> Vec<String> {
        self.features.iter().map(|f| f.id().to_string()).collect()
    }

    /// The attached feature of type `T`.
    pub fn feature<T: 'static>(&self) -> Option<&T> {
        self.features
            .iter()
            .find_map(|feature| feature.as_any().downcast_ref::<T>())
    }

    pub fn update_after_change(&self, document: &Arc<VirtualDocument>) {
        if self.is_disposed() {
            return;
        }
        for feature in &self.features {
            feature.document_changed(document);
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Detaches every feature. Safe to call more than once.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        for feature in &self.features {
            feature.dispose();
        }
    }
}

impl std::fmt::Debug for EditorAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditorAdapter")
            .field("document", &self.document.id_path())
            .field("features", &self.feature_ids())
            .finish()
    }
}

// ============================================================================
// Widget adapter
// ============================================================================

/// Connection status of one virtual document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentStatus {
    /// Not connected, e.g. before connecting or after retries ran out
    Unconnected,
    Connecting,
    /// Features attached and document opened
    Connected,
    /// Unregistered, or the language is not served
    Closed,
    /// The adapter was disposed
    Disposed,
}

/// The virtual document tree of the current host state.
struct Tree {
    document: Arc<VirtualDocument>,
    updates: Arc<UpdateManager>,
    events: JoinHandle<()>,
}

/// Keeps a host document's virtual documents connected to their servers.
pub struct WidgetAdapter {
    this: Weak<Self>,
    host: Arc<dyn HostDocument>,
    config: Config,
    extractors: Arc<ExtractorRegistry>,
    manager: Arc<ConnectionManager>,
    features: Arc<FeatureRegistry>,

    tree: Mutex<Option<Tree>>,
    /// id path → editor adapter
    editor_adapters: Mutex<HashMap<String, Arc<EditorAdapter>>>,
    statuses: Mutex<HashMap<String, DocumentStatus>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    host_events: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,

    document_connected: Signal<ConnectionEvent>,
}

impl WidgetAdapter {
    /// Builds the root virtual document of `host` and starts listening.
    ///
    /// Nothing is connected until [`WidgetAdapter::initialize`].
    pub fn new(
        host: Arc<dyn HostDocument>,
        manager: Arc<ConnectionManager>,
        features: Arc<FeatureRegistry>,
        config: Config,
    ) -> LspResult<Arc<Self>> {
        let extractors = Arc::new(config.extractor_registry().map_err(CoreError::from)?);
        let host_changes = host.changes();

        let adapter = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            host,
            config,
            extractors,
            manager,
            features,
            tree: Mutex::new(None),
            editor_adapters: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            host_events: Mutex::new(None),
            disposed: AtomicBool::new(false),
            document_connected: Signal::new(),
        });

        adapter.start_tree();
        let events = tokio::spawn(host_events(adapter.this.clone(), host_changes));
        *lock(&adapter.host_events) = Some(events);
        Ok(adapter)
    }

    /// Populates the tree and starts connecting the root document.
    /// Foreign documents connect as they appear.
    pub async fn initialize(&self) -> LspResult<()> {
        self.update_documents().await?;
        let document = self.document().ok_or_else(|| self.disposed_error())?;
        self.spawn_connect(document);
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn host(&self) -> &Arc<dyn HostDocument> {
        &self.host
    }

    /// The current root virtual document.
    pub fn document(&self) -> Option<Arc<VirtualDocument>> {
        lock(&self.tree).as_ref().map(|tree| tree.document.clone())
    }

    pub fn update_manager(&self) -> Option<Arc<UpdateManager>> {
        lock(&self.tree).as_ref().map(|tree| tree.updates.clone())
    }

    pub fn virtual_editor(&self) -> Option<VirtualEditor> {
        self.document().map(VirtualEditor::new)
    }

    pub fn editor_adapter(&self, id_path: &str) -> Option<Arc<EditorAdapter>> {
        lock(&self.editor_adapters).get(id_path).cloned()
    }

    pub fn editor_adapters(&self) -> Vec<Arc<EditorAdapter>> {
        lock(&self.editor_adapters).values().cloned().collect()
    }

    pub fn status(&self, id_path: &str) -> Option<DocumentStatus> {
        lock(&self.statuses).get(id_path).copied()
    }

    /// Emitted once a document's features are attached and it is open.
    pub fn document_connected(&self) -> &Signal<ConnectionEvent> {
        &self.document_connected
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn disposed_error(&self) -> LspError {
        LspError::Core(CoreError::Disposed(self.host.path()))
    }

    fn set_status(&self, id_path: &str, status: DocumentStatus) {
        lock(&self.statuses).insert(id_path.to_string(), status);
    }

    /// Kind of the host's first editor; features are chosen by it.
    fn editor_kind(&self) -> EditorKind {
        self.host
            .blocks()
            .first()
            .map(|block| block.editor.kind())
            .unwrap_or(EditorKind::Rope)
    }

    // ========================================================================
    // Tree lifecycle
    // ========================================================================

    fn start_tree(&self) {
        let options = self.host.document_options(&self.config, self.extractors.clone());
        let document = VirtualDocument::new(options);
        let updates = Arc::new(UpdateManager::new(document.clone()));

        // Subscribe before the first update can emit
        let events = tokio::spawn(tree_events(
            self.this.clone(),
            document.changed().subscribe(),
            document.foreign_document_opened().subscribe(),
            document.foreign_document_closed().subscribe(),
            self.manager.connected().subscribe(),
        ));

        tracing::debug!("Started virtual document tree for {}", document.id_path());
        *lock(&self.tree) = Some(Tree {
            document,
            updates,
            events,
        });
    }

    fn teardown_tree(&self, status: DocumentStatus) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        let Some(tree) = lock(&self.tree).take() else {
            return;
        };
        tree.events.abort();
        for document in tree.document.all_documents() {
            self.disconnect_document(&document);
            self.set_status(&document.id_path(), status);
        }
        tree.updates.dispose();
        tree.document.dispose();
    }

    /// Rebuilds the tree from the host's current blocks.
    pub async fn update_documents(&self) -> LspResult<()> {
        let updates = self.update_manager().ok_or_else(|| self.disposed_error())?;
        updates.update_documents(self.host.blocks()).await?;
        Ok(())
    }

    /// Throws the tree away and connects a fresh one, e.g. after the host's
    /// language or path changed.
    pub async fn reload(&self) -> LspResult<()> {
        if self.is_disposed() {
            return Err(self.disposed_error());
        }
        tracing::info!("Reloading {}", self.host.path());
        self.teardown_tree(DocumentStatus::Closed);
        self.start_tree();
        self.initialize().await
    }

    // ========================================================================
    // Connecting documents
    // ========================================================================

    fn spawn_connect(&self, document: Arc<VirtualDocument>) {
        if self.is_disposed() {
            return;
        }
        self.set_status(&document.id_path(), DocumentStatus::Unconnected);
        let adapter = self.this.clone();
        let task = tokio::spawn(async move {
            if let Some(adapter) = adapter.upgrade() {
                adapter.connect_document(document).await;
            }
        });
        let mut tasks = lock(&self.tasks);
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    async fn connect_document(&self, document: Arc<VirtualDocument>) {
        let id_path = document.id_path();
        self.set_status(&id_path, DocumentStatus::Connecting);

        let config = self.manager.config();
        let connection = self
            .manager
            .retry_to_connect(
                ConnectOptions::new(document.clone()).without_open(),
                config.reconnect_delay(),
                config.max_retries,
            )
            .await;

        let Some(connection) = connection else {
            let status = if self.manager.is_ignored(document.language()) {
                DocumentStatus::Closed
            } else {
                DocumentStatus::Unconnected
            };
            self.set_status(&id_path, status);
            return;
        };

        if self.is_disposed() || document.is_disposed() {
            return;
        }
        self.attach(&document, connection);
    }

    /// Attaches features, then opens the document.
    fn attach(&self, document: &Arc<VirtualDocument>, connection: Arc<LspConnection>) {
        let Some(root) = self.document() else {
            return;
        };
        let info = match self.manager.document_info(document) {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!("Cannot attach {}: {}", document.id_path(), e);
                return;
            }
        };

        let context = FeatureContext {
            document: document.clone(),
            editor: VirtualEditor::new(root),
            connection: connection.clone(),
            uri: info.uri.clone(),
            kind: self.editor_kind(),
        };
        let adapter = Arc::new(EditorAdapter::new(context, &self.features));
        let id_path = document.id_path();
        if let Some(previous) = lock(&self.editor_adapters).insert(id_path.clone(), adapter) {
            previous.dispose();
        }

        if let Err(e) = connection.send_open_when_ready(&info) {
            tracing::warn!("Opening {} failed: {}", id_path, e);
        }
        self.set_status(&id_path, DocumentStatus::Connected);
        self.document_connected.emit(ConnectionEvent {
            document: document.clone(),
            language: document.language().to_string(),
            connection: Some(connection),
        });
    }

    fn disconnect_document(&self, document: &Arc<VirtualDocument>) {
        let id_path = document.id_path();
        if let Some(adapter) = lock(&self.editor_adapters).remove(&id_path) {
            adapter.dispose();
        }
        self.manager.unregister_document(document);
        self.set_status(&id_path, DocumentStatus::Closed);
    }

    // ========================================================================
    // Tree events
    // ========================================================================

    fn document_changed(&self, event: DocumentChanged) {
        let document = event.document;
        let Some(adapter) = self.editor_adapter(&document.id_path()) else {
            return;
        };
        let connection = adapter.connection();
        if !connection.is_ready() {
            tracing::debug!("Skipping change of {}: not ready", document.id_path());
            return;
        }

        match self.manager.document_info(&document) {
            Ok(info) => {
                if let Err(e) = connection.send_full_text_change(&info) {
                    tracing::warn!("Change of {} not sent: {}", document.id_path(), e);
                }
            }
            Err(e) => tracing::warn!("No URI for {}: {}", document.id_path(), e),
        }

        if !event.is_init {
            adapter.update_after_change(&document);
        }
    }

    fn foreign_document_opened(&self, event: ForeignDocumentEvent) {
        tracing::debug!(
            "Foreign {} opened in {}",
            event.foreign.id_path(),
            event.host.id_path()
        );
        self.spawn_connect(event.foreign);
    }

    fn foreign_document_closed(&self, event: ForeignDocumentEvent) {
        self.disconnect_document(&event.foreign);
    }

    /// Re-attaches a document the manager reconnected on its own.
    fn reconnected(&self, event: ConnectionEvent) {
        let Some(connection) = event.connection else {
            return;
        };
        let Some(adapter) = self.editor_adapter(&event.document.id_path()) else {
            return;
        };
        if !Arc::ptr_eq(adapter.document(), &event.document)
            || Arc::ptr_eq(adapter.connection(), &connection)
        {
            return;
        }
        tracing::info!("Re-attaching {} after reconnect", event.document.id_path());
        self.attach(&event.document, connection);
    }

    // ========================================================================
    // Host operations
    // ========================================================================

    /// Tells the servers every connected document was saved.
    pub fn save(&self) {
        for adapter in self.editor_adapters() {
            let connection = adapter.connection();
            if !connection.is_ready() {
                continue;
            }
            let result = self
                .manager
                .document_info(adapter.document())
                .and_then(|info| connection.send_saved(&info));
            if let Err(e) = result {
                tracing::warn!("Save of {} not sent: {}", adapter.document().id_path(), e);
            }
        }
    }

    /// Disconnects everything and stops listening. Safe to call more than
    /// once.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(events) = lock(&self.host_events).take() {
            events.abort();
        }
        self.teardown_tree(DocumentStatus::Disposed);
        tracing::debug!("Disposed adapter for {}", self.host.path());
    }
}

impl Drop for WidgetAdapter {
    fn drop(&mut self) {
        if let Some(events) = lock(&self.host_events).take() {
            events.abort();
        }
        if let Some(tree) = lock(&self.tree).take() {
            tree.events.abort();
        }
    }
}

async fn host_events(adapter: Weak<WidgetAdapter>, mut changes: SignalReceiver<HostChange>) {
    while let Some(change) = changes.next().await {
        let Some(adapter) = adapter.upgrade() else {
            return;
        };
        let result = match change {
            HostChange::Content => adapter.update_documents().await,
            HostChange::Language | HostChange::Path => adapter.reload().await,
        };
        if let Err(e) = result {
            tracing::warn!("Handling {:?} of {} failed: {}", change, adapter.host.path(), e);
        }
    }
}

async fn tree_events(
    adapter: Weak<WidgetAdapter>,
    mut changed: SignalReceiver<DocumentChanged>,
    mut opened: SignalReceiver<ForeignDocumentEvent>,
    mut closed: SignalReceiver<ForeignDocumentEvent>,
    mut connected: SignalReceiver<ConnectionEvent>,
) {
    loop {
        // Openings and closings first so changes find their adapters
        tokio::select! {
            biased;
            Some(event) = opened.next() => {
                let Some(adapter) = adapter.upgrade() else { return };
                adapter.foreign_document_opened(event);
            }
            Some(event) = closed.next() => {
                let Some(adapter) = adapter.upgrade() else { return };
                adapter.foreign_document_closed(event);
            }
            Some(event) = changed.next() => {
                let Some(adapter) = adapter.upgrade() else { return };
                adapter.document_changed(event);
            }
            Some(event) = connected.next() => {
                let Some(adapter) = adapter.upgrade() else { return };
                adapter.reconnected(event);
            }
            else => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::memory::{MemoryConnector, ScriptedServer};
    use crate::pool::ConnectionPool;
    use nblsp_core::FileHost;
    use std::any::Any;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Counting {
        changes: Arc<AtomicUsize>,
        disposals: Arc<AtomicUsize>,
    }

    impl Feature for Counting {
        fn id(&self) -> &str {
            "counting"
        }

        fn document_changed(&self, _document: &Arc<VirtualDocument>) {
            self.changes.fetch_add(1, Ordering::SeqCst);
        }

        fn dispose(&self) {
            self.disposals.fetch_add(1, Ordering::SeqCst);
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct Fixture {
        server: ScriptedServer,
        host: Arc<FileHost>,
        adapter: Arc<WidgetAdapter>,
        changes: Arc<AtomicUsize>,
        disposals: Arc<AtomicUsize>,
    }

    async fn fixture() -> Fixture {
        let server = ScriptedServer::new();
        let connector = Arc::new(MemoryConnector::serving(server.clone()));
        let config = Config::default();
        let manager = ConnectionManager::new(
            Arc::new(ConnectionPool::new(connector)),
            config.connection.clone(),
        );

        let changes = Arc::new(AtomicUsize::new(0));
        let disposals = Arc::new(AtomicUsize::new(0));
        let mut registry = FeatureRegistry::new();
        let (c, d) = (changes.clone(), disposals.clone());
        registry.register_for_all("counting", move |_| {
            Box::new(Counting {
                changes: c.clone(),
                disposals: d.clone(),
            })
        });

        let host = FileHost::new("a.py", "python", "py", "x = 1\n");
        let adapter = WidgetAdapter::new(host.clone(), manager, Arc::new(registry), config).unwrap();
        let mut connected = adapter.document_connected().subscribe();
        adapter.initialize().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), connected.next())
            .await
            .unwrap()
            .unwrap();

        Fixture {
            server,
            host,
            adapter,
            changes,
            disposals,
        }
    }

    #[tokio::test]
    async fn test_features_see_changes_but_not_population() {
        let fixture = fixture().await;
        assert_eq!(fixture.changes.load(Ordering::SeqCst), 0);

        fixture.host.set_text("x = 2\n");
        fixture
            .server
            .wait_for_notifications("textDocument/didChange", 1, Duration::from_secs(5))
            .await;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while fixture.changes.load(Ordering::SeqCst) == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(fixture.changes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let fixture = fixture().await;
        let id_path = fixture.adapter.document().unwrap().id_path();
        let connection = fixture.adapter.editor_adapter(&id_path).unwrap().connection().clone();

        fixture.adapter.dispose();
        fixture.adapter.dispose();

        assert_eq!(fixture.disposals.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.adapter.status(&id_path), Some(DocumentStatus::Disposed));
        assert!(fixture.adapter.document().is_none());
        assert!(fixture.adapter.initialize().await.is_err());
        // The pooled connection outlives the adapter
        assert_eq!(connection.state(), ConnectionState::Ready);
        assert_eq!(
            fixture
                .server
                .wait_for_notifications("textDocument/didClose", 1, Duration::from_secs(5))
                .await
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_language_change_reloads_tree() {
        let fixture = fixture().await;
        let before = fixture.adapter.document().unwrap();

        fixture.host.set_language("javascript");
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while fixture
            .adapter
            .document()
            .is_some_and(|document| Arc::ptr_eq(&document, &before))
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let after = fixture.adapter.document().unwrap();
        assert_eq!(after.language(), "javascript");
        assert!(before.is_disposed());
        assert_eq!(fixture.disposals.load(Ordering::SeqCst), 1);
    }
}
