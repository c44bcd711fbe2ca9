//! Feature integrations.
//!
//! A feature (diagnostics, hover, ...) attaches to one virtual document on
//! one connection. Editors of different kinds can carry different features,
//! so factories are registered per [`EditorKind`].
//!
//! Factories run before the document is opened on the server. A feature
//! that subscribes to connection signals in its factory therefore sees the
//! server's first reply for the document.

use lsp_types::Uri;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use nblsp_core::{EditorKind, VirtualDocument, VirtualEditor};

use crate::connection::LspConnection;

/// Everything a feature factory gets to work with.
#[derive(Debug, Clone)]
pub struct FeatureContext {
    /// The virtual document the feature serves
    pub document: Arc<VirtualDocument>,

    /// Root-coordinate view over the host's editors
    pub editor: VirtualEditor,

    pub connection: Arc<LspConnection>,

    /// LSP URI of `document`
    pub uri: Uri,

    pub kind: EditorKind,
}

/// One attached feature.
pub trait Feature: Send + Sync {
    fn id(&self) -> &str;

    /// Runs after every change of the document except its first population.
    fn document_changed(&self, _document: &Arc<VirtualDocument>) {}

    /// Detaches the feature. Called once.
    fn dispose(&self) {}

    fn as_any(&self) -> &dyn Any;
}

/// Builds a feature for a context.
pub type FeatureFactory = Arc<dyn Fn(&FeatureContext) -> Box<dyn Feature> + Send + Sync>;

/// Feature factories by editor kind.
#[derive(Clone, Default)]
pub struct FeatureRegistry {
    factories: HashMap<EditorKind, Vec<(String, FeatureFactory)>>,
}

impl FeatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` for `kind`, replacing any factory with the same id.
    pub fn register<F>(&mut self, kind: EditorKind, id: impl Into<String>, factory: F)
    where
        F: Fn(&FeatureContext) -> Box<dyn Feature> + Send + Sync + 'static,
    {
        self.insert(kind, id.into(), Arc::new(factory));
    }

    /// Registers `factory` for every editor kind.
    pub fn register_for_all<F>(&mut self, id: impl Into<String>, factory: F)
    where
        F: Fn(&FeatureContext) -> Box<dyn Feature> + Send + Sync + 'static,
    {
        let id = id.into();
        let factory: FeatureFactory = Arc::new(factory);
        for kind in [EditorKind::Rope, EditorKind::Snapshot] {
            self.insert(kind, id.clone(), factory.clone());
        }
    }

    fn insert(&mut self, kind: EditorKind, id: String, factory: FeatureFactory) {
        let factories = self.factories.entry(kind).or_default();
        match factories.iter_mut().find(|(existing, _)| *existing == id) {
            Some(slot) => slot.1 = factory,
            None => factories.push((id, factory)),
        }
    }

    /// Ids registered for `kind`, in registration order.
    pub fn ids(&self, kind: EditorKind) -> Vec<String> {
        self.factories
            .get(&kind)
            .map(|factories| factories.iter().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default()
    }

    /// Instantiates every feature registered for the context's editor kind.
    pub fn create(&self, context: &FeatureContext) -> Vec<Box<dyn Feature>> {
        self.factories
            .get(&context.kind)
            .map(|factories| factories.iter().map(|(_, factory)| factory(context)).collect())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for FeatureRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureRegistry")
            .field("rope", &self.ids(EditorKind::Rope))
            .field("snapshot", &self.ids(EditorKind::Snapshot))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl Feature for Named {
        fn id(&self) -> &str {
            self.0
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_registration_is_per_kind() {
        let mut registry = FeatureRegistry::new();
        registry.register(EditorKind::Rope, "hover", |_| Box::new(Named("hover")));
        registry.register_for_all("diagnostics", |_| Box::new(Named("diagnostics")));

        assert_eq!(registry.ids(EditorKind::Rope), vec!["hover", "diagnostics"]);
        assert_eq!(registry.ids(EditorKind::Snapshot), vec!["diagnostics"]);
    }

    #[test]
    fn test_same_id_replaces() {
        let mut registry = FeatureRegistry::new();
        registry.register(EditorKind::Rope, "hover", |_| Box::new(Named("old")));
        registry.register(EditorKind::Rope, "hover", |_| Box::new(Named("new")));

        assert_eq!(registry.ids(EditorKind::Rope), vec!["hover"]);
    }
}
