//! # nblsp Features
//!
//! Feature integrations that ship with nblsp. Each one is a
//! [`Feature`](nblsp_lsp::Feature) built by a factory in the
//! [`FeatureRegistry`], one instance per virtual document and connection.
//!
//! ## Learning: Registration Instead of Loading
//!
//! Features are plain Rust types registered by id. A host that wants a
//! different set simply registers its own factories under the same ids,
//! which replaces the built-in ones.

pub mod diagnostics;
pub mod hover;

pub use diagnostics::{DiagnosticsFeature, EditorDiagnostic};
pub use hover::{HoverFeature, HoverInfo};

use nblsp_lsp::FeatureRegistry;

pub const DIAGNOSTICS: &str = "diagnostics";
pub const HOVER: &str = "hover";

/// Registers every built-in feature for every editor kind.
pub fn register_builtin(registry: &mut FeatureRegistry) {
    registry.register_for_all(DIAGNOSTICS, |context| {
        Box::new(DiagnosticsFeature::new(context))
    });
    registry.register_for_all(HOVER, |context| Box::new(HoverFeature::new(context)));
}

/// A registry holding the built-in features.
pub fn builtin_registry() -> FeatureRegistry {
    let mut registry = FeatureRegistry::new();
    register_builtin(&mut registry);
    registry
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use std::time::Duration;

    use nblsp_core::{Config, HostDocument};
    use nblsp_lsp::{
        ConnectionManager, ConnectionPool, EditorAdapter, MemoryConnector, ScriptedServer,
        WidgetAdapter,
    };

    /// A connected adapter for `host` backed by `server`.
    pub async fn connect(
        host: Arc<dyn HostDocument>,
        server: ScriptedServer,
        config: Config,
    ) -> (Arc<WidgetAdapter>, Arc<EditorAdapter>) {
        let connector = Arc::new(MemoryConnector::serving(server));
        let manager = ConnectionManager::new(
            Arc::new(ConnectionPool::new(connector)),
            config.connection.clone(),
        );
        let adapter = WidgetAdapter::new(
            host,
            manager,
            Arc::new(super::builtin_registry()),
            config,
        )
        .unwrap();
        let mut connected = adapter.document_connected().subscribe();
        adapter.initialize().await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), connected.next())
            .await
            .unwrap()
            .unwrap();
        let editor_adapter = adapter.editor_adapter(&event.document.id_path()).unwrap();
        (adapter, editor_adapter)
    }
}
