//! Host documents: what a widget adapter decomposes into virtual documents.
//!
//! A host knows its path, its language and its editors, and says when any
//! of them changed. `FileHost` is one editor over one file; `NotebookHost`
//! is one editor per cell, read from `.ipynb` JSON.

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use crate::block::BlockInput;
use crate::config::Config;
use crate::editor::{CodeEditor, EditorRef, InMemoryEditor};
use crate::extractor::ExtractorRegistry;
use crate::signal::{Signal, SignalReceiver};
use crate::virtual_document::VirtualDocumentOptions;
use crate::{CoreError, CoreResult};

/// What changed in a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostChange {
    /// Text of one or more blocks, or the block list itself
    Content,
    /// Document language, e.g. after a kernel change
    Language,
    /// File path, after a rename
    Path,
}

/// A document made of one or more editors.
pub trait HostDocument: Send + Sync {
    /// Path relative to the root URI.
    fn path(&self) -> String;

    fn language(&self) -> String;

    fn file_extension(&self) -> String;

    fn mime_type(&self) -> String;

    /// Whether servers can open the host file as is.
    fn has_lsp_supported_file(&self) -> bool;

    /// Current blocks in document order.
    fn blocks(&self) -> Vec<BlockInput>;

    fn changes(&self) -> SignalReceiver<HostChange>;

    /// Options for the root virtual document of this host.
    fn document_options(
        &self,
        config: &Config,
        extractors: Arc<ExtractorRegistry>,
    ) -> VirtualDocumentOptions {
        VirtualDocumentOptions::new(self.language(), self.file_extension(), self.path())
            .with_extractors(extractors)
            .with_blank_lines(config.documents.blank_lines_between_cells)
            .with_lsp_supported_file(self.has_lsp_supported_file())
    }
}

fn read_lock<T: Clone>(lock: &RwLock<T>) -> T {
    lock.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn write_lock<T>(lock: &RwLock<T>, value: T) {
    *lock.write().unwrap_or_else(PoisonError::into_inner) = value;
}

// ============================================================================
// File host
// ============================================================================

/// A plain source file edited in a single editor.
pub struct FileHost {
    path: RwLock<String>,
    language: RwLock<String>,
    file_extension: String,
    editor: Arc<InMemoryEditor>,
    changes: Signal<HostChange>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl FileHost {
    pub fn new(
        path: impl Into<String>,
        language: impl Into<String>,
        file_extension: impl Into<String>,
        text: impl Into<String>,
    ) -> Arc<Self> {
        let editor = InMemoryEditor::new(text);
        let changes = Signal::new();
        editor.relay_to(&changes);
        Arc::new(Self {
            path: RwLock::new(path.into()),
            language: RwLock::new(language.into()),
            file_extension: file_extension.into(),
            editor,
            changes,
            watcher: Mutex::new(None),
        })
    }

    /// Reads a file, picking the language from its extension.
    pub fn open(path: impl AsRef<Path>, config: &Config) -> CoreResult<Arc<Self>> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_string();
        let language = config
            .language_for_extension(&extension)
            .unwrap_or_else(|| extension.clone());
        tracing::debug!("Opened {} as {}", path.display(), language);
        Ok(Self::new(
            path.to_string_lossy(),
            language,
            extension,
            text,
        ))
    }

    pub fn editor(&self) -> Arc<InMemoryEditor> {
        self.editor.clone()
    }

    /// Replaces the text. The editor announces the change.
    pub fn set_text(&self, text: &str) {
        self.editor.set_text(text);
    }

    pub fn rename(&self, path: impl Into<String>) {
        write_lock(&self.path, path.into());
        self.changes.emit(HostChange::Path);
    }

    pub fn set_language(&self, language: impl Into<String>) {
        write_lock(&self.language, language.into());
        self.changes.emit(HostChange::Language);
    }

    /// Reloads the text whenever the file changes on disk.
    pub fn watch(self: &Arc<Self>, path: impl Into<PathBuf>) -> CoreResult<()> {
        let path = path.into();
        let host: Weak<FileHost> = Arc::downgrade(self);
        let watched = path.clone();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!("Watch error on {}: {}", watched.display(), e);
                    return;
                }
            };
            if !matches!(event.kind, notify::EventKind::Modify(_)) {
                return;
            }
            let Some(host) = host.upgrade() else {
                return;
            };
            match std::fs::read_to_string(&watched) {
                Ok(text) if text != host.editor.text() => host.set_text(&text),
                Ok(_) => {}
                Err(e) => tracing::warn!("Failed to reload {}: {}", watched.display(), e),
            }
        })?;
        watcher.watch(&path, RecursiveMode::NonRecursive)?;

        *self.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(watcher);
        Ok(())
    }
}

impl HostDocument for FileHost {
    fn path(&self) -> String {
        read_lock(&self.path)
    }

    fn language(&self) -> String {
        read_lock(&self.language)
    }

    fn file_extension(&self) -> String {
        self.file_extension.clone()
    }

    fn mime_type(&self) -> String {
        format!("text/x-{}", self.language())
    }

    fn has_lsp_supported_file(&self) -> bool {
        true
    }

    fn blocks(&self) -> Vec<BlockInput> {
        let editor: EditorRef = self.editor.clone();
        vec![BlockInput::from_editor(editor)]
    }

    fn changes(&self) -> SignalReceiver<HostChange> {
        self.changes.subscribe()
    }
}

// ============================================================================
// Notebook host
// ============================================================================

/// Kind of a notebook cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Code,
    Markdown,
    Raw,
}

impl CellKind {
    fn parse(cell_type: &str) -> Self {
        match cell_type {
            "code" => Self::Code,
            "markdown" => Self::Markdown,
            _ => Self::Raw,
        }
    }
}

/// One cell and its editor.
#[derive(Debug, Clone)]
pub struct NotebookCell {
    pub kind: CellKind,
    pub editor: Arc<InMemoryEditor>,
}

#[derive(Debug, Deserialize)]
struct RawNotebook {
    #[serde(default)]
    cells: Vec<RawCell>,
    #[serde(default)]
    metadata: RawMetadata,
}

#[derive(Debug, Deserialize)]
struct RawCell {
    cell_type: String,
    #[serde(default)]
    source: CellSource,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CellSource {
    Text(String),
    Lines(Vec<String>),
}

impl Default for CellSource {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl CellSource {
    fn into_text(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Lines(lines) => lines.concat(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawMetadata {
    language_info: Option<LanguageInfo>,
    kernelspec: Option<KernelSpec>,
}

#[derive(Debug, Deserialize)]
struct LanguageInfo {
    name: String,
    file_extension: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KernelSpec {
    language: Option<String>,
}

/// A notebook: one editor per cell, code cells in the kernel language.
pub struct NotebookHost {
    path: RwLock<String>,
    language: RwLock<String>,
    file_extension: RwLock<String>,
    cells: RwLock<Vec<NotebookCell>>,
    changes: Signal<HostChange>,
}

impl NotebookHost {
    pub fn new(
        path: impl Into<String>,
        language: impl Into<String>,
        file_extension: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            path: RwLock::new(path.into()),
            language: RwLock::new(language.into()),
            file_extension: RwLock::new(file_extension.into()),
            cells: RwLock::new(Vec::new()),
            changes: Signal::new(),
        })
    }

    /// Parses notebook JSON. The language comes from `language_info`, then
    /// `kernelspec`, and defaults to python.
    pub fn from_ipynb(path: impl Into<String>, json: &str, config: &Config) -> CoreResult<Arc<Self>> {
        let raw: RawNotebook = serde_json::from_str(json)?;

        let language = raw
            .metadata
            .language_info
            .as_ref()
            .map(|info| info.name.clone())
            .or_else(|| raw.metadata.kernelspec.as_ref().and_then(|spec| spec.language.clone()))
            .unwrap_or_else(|| "python".to_string())
            .to_lowercase();
        let file_extension = raw
            .metadata
            .language_info
            .as_ref()
            .and_then(|info| info.file_extension.as_deref())
            .map(|ext| ext.trim_start_matches('.').to_string())
            .unwrap_or_else(|| config.file_extension(&language));

        let notebook = Self::new(path, language, file_extension);
        {
            let mut cells = notebook.cells.write().unwrap_or_else(PoisonError::into_inner);
            for cell in raw.cells {
                let editor = InMemoryEditor::new(cell.source.into_text());
                editor.relay_to(&notebook.changes);
                cells.push(NotebookCell {
                    kind: CellKind::parse(&cell.cell_type),
                    editor,
                });
            }
        }
        Ok(notebook)
    }

    /// Reads a `.ipynb` file.
    pub fn open(path: impl AsRef<Path>, config: &Config) -> CoreResult<Arc<Self>> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        Self::from_ipynb(path.to_string_lossy(), &json, config).map_err(|e| match e {
            CoreError::Json(e) => CoreError::InvalidNotebook(format!("{}: {}", path.display(), e)),
            other => other,
        })
    }

    pub fn cells(&self) -> Vec<NotebookCell> {
        read_lock(&self.cells)
    }

    pub fn cell_count(&self) -> usize {
        self.cells.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn cell_editor(&self, index: usize) -> Option<Arc<InMemoryEditor>> {
        self.cells
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index)
            .map(|cell| cell.editor.clone())
    }

    /// Inserts a cell at `index` (clamped to the end).
    pub fn insert_cell(&self, index: usize, kind: CellKind, text: &str) -> Arc<InMemoryEditor> {
        let editor = InMemoryEditor::new(text);
        editor.relay_to(&self.changes);
        {
            let mut cells = self.cells.write().unwrap_or_else(PoisonError::into_inner);
            let index = index.min(cells.len());
            cells.insert(
                index,
                NotebookCell {
                    kind,
                    editor: editor.clone(),
                },
            );
        }
        self.changes.emit(HostChange::Content);
        editor
    }

    pub fn push_cell(&self, kind: CellKind, text: &str) -> Arc<InMemoryEditor> {
        self.insert_cell(usize::MAX, kind, text)
    }

    /// Removes a cell and disposes its editor.
    pub fn remove_cell(&self, index: usize) -> CoreResult<()> {
        let removed = {
            let mut cells = self.cells.write().unwrap_or_else(PoisonError::into_inner);
            if index >= cells.len() {
                return Err(CoreError::CellOutOfRange(index));
            }
            cells.remove(index)
        };
        removed.editor.dispose();
        self.changes.emit(HostChange::Content);
        Ok(())
    }

    pub fn set_cell_text(&self, index: usize, text: &str) -> CoreResult<()> {
        let editor = self
            .cell_editor(index)
            .ok_or(CoreError::CellOutOfRange(index))?;
        editor.set_text(text);
        Ok(())
    }

    /// Switches the kernel language.
    pub fn set_language(&self, language: impl Into<String>, file_extension: impl Into<String>) {
        write_lock(&self.language, language.into());
        write_lock(&self.file_extension, file_extension.into());
        self.changes.emit(HostChange::Language);
    }

    pub fn rename(&self, path: impl Into<String>) {
        write_lock(&self.path, path.into());
        self.changes.emit(HostChange::Path);
    }
}

impl HostDocument for NotebookHost {
    fn path(&self) -> String {
        read_lock(&self.path)
    }

    fn language(&self) -> String {
        read_lock(&self.language)
    }

    fn file_extension(&self) -> String {
        read_lock(&self.file_extension)
    }

    fn mime_type(&self) -> String {
        "application/x-ipynb+json".to_string()
    }

    fn has_lsp_supported_file(&self) -> bool {
        false
    }

    fn blocks(&self) -> Vec<BlockInput> {
        self.cells()
            .into_iter()
            .filter_map(|cell| {
                let editor: EditorRef = cell.editor;
                match cell.kind {
                    CellKind::Code => Some(BlockInput::from_editor(editor)),
                    CellKind::Markdown => {
                        Some(BlockInput::from_editor(editor).with_language("markdown"))
                    }
                    CellKind::Raw => None,
                }
            })
            .collect()
    }

    fn changes(&self) -> SignalReceiver<HostChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nblsp_buffer::EditorPosition;
    use std::io::Write;

    const NOTEBOOK: &str = r##"{
        "cells": [
            {"cell_type": "code", "source": ["import os\n", "os.getcwd()"]},
            {"cell_type": "markdown", "source": "# Notes"},
            {"cell_type": "raw", "source": "ignored"},
            {"cell_type": "code", "source": "%%bash\nls"}
        ],
        "metadata": {
            "language_info": {"name": "Python", "file_extension": ".py"}
        },
        "nbformat": 4,
        "nbformat_minor": 5
    }"##;

    #[test]
    fn test_notebook_from_ipynb() {
        let notebook = NotebookHost::from_ipynb("nb.ipynb", NOTEBOOK, &Config::default()).unwrap();

        assert_eq!(notebook.language(), "python");
        assert_eq!(notebook.file_extension(), "py");
        assert_eq!(notebook.cell_count(), 4);
        assert!(!notebook.has_lsp_supported_file());

        let blocks = notebook.blocks();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].text, "import os\nos.getcwd()");
        assert_eq!(blocks[1].language.as_deref(), Some("markdown"));
    }

    #[test]
    fn test_kernelspec_fallback() {
        let json = r#"{"cells": [], "metadata": {"kernelspec": {"language": "R"}}}"#;
        let notebook = NotebookHost::from_ipynb("a.ipynb", json, &Config::default()).unwrap();
        assert_eq!(notebook.language(), "r");
        assert_eq!(notebook.file_extension(), "R");
    }

    #[test]
    fn test_invalid_notebook_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let err = match NotebookHost::open(file.path(), &Config::default()) {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err, CoreError::InvalidNotebook(_)));
    }

    #[test]
    fn test_cell_edits_emit_changes() {
        let notebook = NotebookHost::new("nb.ipynb", "python", "py");
        let mut changes = notebook.changes();

        let first = notebook.push_cell(CellKind::Code, "a = 1");
        notebook.push_cell(CellKind::Code, "b = 2");
        notebook.set_cell_text(1, "b = 3").unwrap();
        notebook.remove_cell(0).unwrap();

        assert!(first.is_disposed());
        assert_eq!(notebook.blocks()[0].text, "b = 3");
        assert_eq!(changes.drain().len(), 4);
        assert!(matches!(
            notebook.remove_cell(5),
            Err(CoreError::CellOutOfRange(5))
        ));
    }

    #[test]
    fn test_language_change_is_announced() {
        let notebook = NotebookHost::new("nb.ipynb", "python", "py");
        let mut changes = notebook.changes();
        notebook.set_language("r", "R");
        assert_eq!(changes.try_next(), Some(HostChange::Language));
        assert_eq!(notebook.language(), "r");
    }

    #[test]
    fn test_direct_editor_edits_reach_host() {
        let notebook = NotebookHost::from_ipynb("nb.ipynb", NOTEBOOK, &Config::default()).unwrap();
        let file = FileHost::new("a.py", "python", "py", "x = 1\n");
        let mut notebook_changes = notebook.changes();
        let mut file_changes = file.changes();

        notebook
            .cell_editor(0)
            .unwrap()
            .insert(EditorPosition::new(1, 11), "\n")
            .unwrap();
        file.editor().insert(EditorPosition::new(1, 0), "y = 2").unwrap();

        assert_eq!(notebook_changes.drain(), vec![HostChange::Content]);
        assert_eq!(file_changes.drain(), vec![HostChange::Content]);
        assert_eq!(file.blocks()[0].text, "x = 1\ny = 2");

        let removed = notebook.cell_editor(0).unwrap();
        notebook.remove_cell(0).unwrap();
        notebook_changes.drain();
        removed.set_text("gone");
        assert_eq!(notebook_changes.try_next(), None);
    }

    #[test]
    fn test_file_host_open_detects_language() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("script.py");
        std::fs::write(&path, "print('hi')\n").unwrap();

        let host = FileHost::open(&path, &Config::default()).unwrap();
        assert_eq!(host.language(), "python");
        assert_eq!(host.file_extension(), "py");
        assert!(host.has_lsp_supported_file());
        assert_eq!(host.blocks()[0].text, "print('hi')\n");
    }

    #[test]
    fn test_document_options_follow_host() {
        let host = FileHost::new("src/app.py", "python", "py", "x = 1");
        let options = host.document_options(&Config::default(), Arc::new(ExtractorRegistry::new()));
        assert_eq!(options.path, "src/app.py");
        assert!(options.has_lsp_supported_file);
        assert_eq!(options.blank_lines_between_cells, 2);
    }
}
