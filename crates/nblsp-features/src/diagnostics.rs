//! Diagnostics mapped back onto the editors they belong to.
//!
//! The server reports ranges in the coordinates of one virtual document.
//! A range is translated to virtual positions (UTF-16 aware), then to the
//! editor and editor position of the block that contributed the text.

use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;

use nblsp_core::editor::same_editor;
use nblsp_core::{EditorPosition, EditorRef, Signal, VirtualDocument};
use nblsp_lsp::convert::virtual_range_in;
use nblsp_lsp::lsp_types::{Diagnostic, DiagnosticSeverity, PublishDiagnosticsParams, Uri};
use nblsp_lsp::{Feature, FeatureContext};

/// A diagnostic located in one editor.
#[derive(Debug, Clone)]
pub struct EditorDiagnostic {
    pub editor: EditorRef,
    pub start: EditorPosition,
    pub end: EditorPosition,
    pub severity: Option<DiagnosticSeverity>,
    pub message: String,
    pub source: Option<String>,
}

struct DiagnosticsState {
    document: Arc<VirtualDocument>,
    uri: Uri,
    current: Mutex<Vec<EditorDiagnostic>>,
    updated: Signal<Vec<EditorDiagnostic>>,
}

impl DiagnosticsState {
    fn publish(&self, params: PublishDiagnosticsParams) {
        if params.uri != self.uri || self.document.is_disposed() {
            return;
        }

        let text = self.document.value();
        let diagnostics: Vec<EditorDiagnostic> = params
            .diagnostics
            .into_iter()
            .filter_map(|diagnostic| self.locate(&text, diagnostic))
            .collect();

        tracing::debug!(
            "{} diagnostics for {}",
            diagnostics.len(),
            self.document.id_path()
        );
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = diagnostics.clone();
        self.updated.emit(diagnostics);
    }

    fn locate(&self, text: &str, diagnostic: Diagnostic) -> Option<EditorDiagnostic> {
        let (start, end) = virtual_range_in(text, diagnostic.range);
        let Some((editor, editor_start)) = self.document.virtual_to_editor(start) else {
            tracing::trace!("Diagnostic at {} has no editor", start);
            return None;
        };

        // A range running past its block is cut at the start line
        let editor_end = match self.document.virtual_to_editor(end) {
            Some((end_editor, position)) if same_editor(&editor, &end_editor) => position,
            _ => editor_start,
        };

        Some(EditorDiagnostic {
            editor,
            start: editor_start,
            end: editor_end,
            severity: diagnostic.severity,
            message: diagnostic.message,
            source: diagnostic.source,
        })
    }
}

/// Collects the server's diagnostics for one virtual document.
pub struct DiagnosticsFeature {
    state: Arc<DiagnosticsState>,
    task: JoinHandle<()>,
}

impl DiagnosticsFeature {
    /// Subscribes to the connection straight away so the reply to the
    /// document's `didOpen` is not missed.
    pub fn new(context: &FeatureContext) -> Self {
        let state = Arc::new(DiagnosticsState {
            document: context.document.clone(),
            uri: context.uri.clone(),
            current: Mutex::new(Vec::new()),
            updated: Signal::new(),
        });

        let mut published = context.connection.diagnostics().subscribe();
        let listener = state.clone();
        let task = tokio::spawn(async move {
            while let Some(params) = published.next().await {
                listener.publish(params);
            }
        });

        Self { state, task }
    }

    /// Diagnostics from the latest publication.
    pub fn diagnostics(&self) -> Vec<EditorDiagnostic> {
        self.state
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Diagnostics located in `editor`.
    pub fn diagnostics_for(&self, editor: &EditorRef) -> Vec<EditorDiagnostic> {
        self.diagnostics()
            .into_iter()
            .filter(|diagnostic| same_editor(&diagnostic.editor, editor))
            .collect()
    }

    /// Emitted with the full set after every publication.
    pub fn updated(&self) -> &Signal<Vec<EditorDiagnostic>> {
        &self.state.updated
    }
}

impl Feature for DiagnosticsFeature {
    fn id(&self) -> &str {
        crate::DIAGNOSTICS
    }

    fn dispose(&self) {
        self.task.abort();
        self.state
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for DiagnosticsFeature {
    fn drop(&mut self) {
        self.task.abort();
    }
}
