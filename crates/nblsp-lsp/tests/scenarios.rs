//! End-to-end flows: host documents through virtual documents to a scripted
//! in-memory server.

use std::sync::Arc;
use std::time::Duration;

use nblsp_core::host::CellKind;
use nblsp_core::{Config, EditorPosition, FileHost, HostDocument, NotebookHost};
use nblsp_lsp::{
    CLOSE_NO_STATUS, ConnectionManager, ConnectionPool, DocumentStatus, FeatureRegistry,
    MemoryConnector, ScriptedServer, TransportError, WidgetAdapter,
};
use serde_json::Value;

const WAIT: Duration = Duration::from_secs(5);

fn config() -> Config {
    let mut config = Config::default();
    config.connection.ready_timeout_secs = 2;
    config.connection.ready_grace_secs = 2;
    config.connection.reconnect_delay_secs = 0.1;
    config
}

fn manager(connector: Arc<MemoryConnector>, config: &Config) -> Arc<ConnectionManager> {
    ConnectionManager::new(
        Arc::new(ConnectionPool::new(connector)),
        config.connection.clone(),
    )
}

async fn adapter_for(
    host: Arc<dyn HostDocument>,
    manager: Arc<ConnectionManager>,
    config: Config,
) -> Arc<WidgetAdapter> {
    let adapter =
        WidgetAdapter::new(host, manager, Arc::new(FeatureRegistry::new()), config).unwrap();
    adapter.initialize().await.unwrap();
    adapter
}

fn opened_text(params: &Value) -> &str {
    params["textDocument"]["text"].as_str().unwrap()
}

fn changed_text(params: &Value) -> &str {
    params["contentChanges"][0]["text"].as_str().unwrap()
}

async fn wait_for_status(adapter: &WidgetAdapter, id_path: &str, status: DocumentStatus) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while adapter.status(id_path) != Some(status) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "{} stuck at {:?}",
            id_path,
            adapter.status(id_path)
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn file_is_opened_with_its_exact_text() {
    let server = ScriptedServer::new();
    let connector = Arc::new(MemoryConnector::serving(server.clone()));
    let config = config();
    let host = FileHost::new("src/app.py", "python", "py", "import os\nprint(os.sep)\n");

    let _adapter = adapter_for(host, manager(connector, &config), config).await;

    let opened = server
        .wait_for_notifications("textDocument/didOpen", 1, WAIT)
        .await;
    assert_eq!(opened.len(), 1);
    assert_eq!(opened_text(&opened[0]), "import os\nprint(os.sep)\n");
    assert_eq!(opened[0]["textDocument"]["languageId"], "python");
    assert_eq!(opened[0]["textDocument"]["uri"], "file:///src/app.py");
}

#[tokio::test]
async fn removing_a_cell_sends_the_remaining_text() {
    let server = ScriptedServer::new();
    let connector = Arc::new(MemoryConnector::serving(server.clone()));
    let config = config();
    let notebook = NotebookHost::new("analysis.ipynb", "python", "py");
    notebook.push_cell(CellKind::Code, "x = 1");
    notebook.push_cell(CellKind::Code, "y = 2");

    let adapter = adapter_for(notebook.clone(), manager(connector, &config), config).await;
    let opened = server
        .wait_for_notifications("textDocument/didOpen", 1, WAIT)
        .await;
    assert!(opened_text(&opened[0]).starts_with("x = 1"));

    notebook.remove_cell(0).unwrap();

    let changes = server
        .wait_for_notifications("textDocument/didChange", 1, WAIT)
        .await;
    assert_eq!(changes.len(), 1);
    assert_eq!(changed_text(&changes[0]), "y = 2");
    assert_eq!(adapter.document().unwrap().value(), "y = 2");
}

#[tokio::test]
async fn fenced_code_opens_a_foreign_document() {
    let server = ScriptedServer::new();
    let connector = Arc::new(MemoryConnector::serving(server.clone()));
    let config = config();
    let host = FileHost::new(
        "README.md",
        "markdown",
        "md",
        "# Usage\n\n```python\nimport nblsp\n```\n",
    );

    let adapter = adapter_for(host, manager(connector.clone(), &config), config).await;

    let root = adapter.document().unwrap();
    let foreign = root.foreign_documents();
    assert_eq!(foreign.len(), 1);
    assert_eq!(foreign[0].language(), "python");

    wait_for_status(&adapter, &foreign[0].id_path(), DocumentStatus::Connected).await;
    let opened = server
        .wait_for_notifications("textDocument/didOpen", 2, WAIT)
        .await;
    let python: Vec<_> = opened
        .iter()
        .filter(|params| params["textDocument"]["languageId"] == "python")
        .collect();
    assert_eq!(python.len(), 1);
    assert_eq!(opened_text(python[0]), "import nblsp");
    assert_eq!(connector.opened("python"), 1);
}

#[tokio::test]
async fn refused_language_is_ignored_after_one_attempt() {
    let server = ScriptedServer::new();
    let connector = Arc::new(MemoryConnector::new(move |peer| {
        if peer.endpoint().language == "r" {
            return Err(TransportError::closed(CLOSE_NO_STATUS, "no server for r"));
        }
        server.serve(peer);
        Ok(())
    }));
    let config = config();
    let manager = manager(connector.clone(), &config);
    let notebook = NotebookHost::new("stats.ipynb", "r", "r");
    notebook.push_cell(CellKind::Code, "summary(cars)");

    let adapter = adapter_for(notebook.clone(), manager.clone(), config).await;
    let id_path = adapter.document().unwrap().id_path();
    wait_for_status(&adapter, &id_path, DocumentStatus::Closed).await;

    assert!(manager.is_ignored("r"));
    notebook.set_cell_text(0, "plot(cars)").unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(connector.opened("r"), 1);
}

#[tokio::test]
async fn documents_of_one_language_share_a_connection() {
    let server = ScriptedServer::new();
    let connector = Arc::new(MemoryConnector::serving(server.clone()));
    let config = config();
    let manager = manager(connector.clone(), &config);
    let first = FileHost::new("a.py", "python", "py", "a = 1\n");
    let second = FileHost::new("b.py", "python", "py", "b = 2\n");

    let a = adapter_for(first, manager.clone(), config.clone()).await;
    let b = adapter_for(second, manager.clone(), config).await;
    let a_path = a.document().unwrap().id_path();
    let b_path = b.document().unwrap().id_path();
    wait_for_status(&a, &a_path, DocumentStatus::Connected).await;
    wait_for_status(&b, &b_path, DocumentStatus::Connected).await;

    let a_connection = a.editor_adapter(&a_path).unwrap().connection().clone();
    let b_connection = b.editor_adapter(&b_path).unwrap().connection().clone();
    assert!(Arc::ptr_eq(&a_connection, &b_connection));
    assert_eq!(connector.opened("python"), 1);
    assert_eq!(
        server
            .wait_for_notifications("textDocument/didOpen", 2, WAIT)
            .await
            .len(),
        2
    );
}

#[tokio::test]
async fn hundreds_of_cell_magics_all_connect() {
    let server = ScriptedServer::new();
    let connector = Arc::new(MemoryConnector::serving(server.clone()));
    let config = config();
    let notebook = NotebookHost::new("scripts.ipynb", "python", "py");
    for i in 0..300 {
        notebook.push_cell(CellKind::Code, &format!("%%bash\necho {}", i));
    }

    let adapter = adapter_for(notebook, manager(connector.clone(), &config), config).await;

    let foreign = adapter.document().unwrap().foreign_documents();
    assert_eq!(foreign.len(), 300);
    for document in &foreign {
        wait_for_status(&adapter, &document.id_path(), DocumentStatus::Connected).await;
    }
    let opened = server
        .wait_for_notifications("textDocument/didOpen", 301, WAIT)
        .await;
    assert_eq!(opened.len(), 301);
    assert_eq!(connector.opened("shell"), 1);
}

#[tokio::test]
async fn typing_in_a_cell_editor_reaches_the_server() {
    let server = ScriptedServer::new();
    let connector = Arc::new(MemoryConnector::serving(server.clone()));
    let config = config();
    let notebook = NotebookHost::new("typing.ipynb", "python", "py");
    notebook.push_cell(CellKind::Code, "x = 1");

    let adapter = adapter_for(notebook.clone(), manager(connector, &config), config).await;
    let id_path = adapter.document().unwrap().id_path();
    wait_for_status(&adapter, &id_path, DocumentStatus::Connected).await;
    server
        .wait_for_notifications("textDocument/didOpen", 1, WAIT)
        .await;

    notebook
        .cell_editor(0)
        .unwrap()
        .insert(EditorPosition::new(0, 5), "0")
        .unwrap();

    let changes = server
        .wait_for_notifications("textDocument/didChange", 1, WAIT)
        .await;
    assert_eq!(changes.len(), 1);
    assert_eq!(changed_text(&changes[0]), "x = 10");
}
