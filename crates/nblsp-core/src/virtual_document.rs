//! Virtual documents.
//!
//! A virtual document is "this host, in this one language": the blocks of
//! that language concatenated with blank separator lines, plus a tree of
//! foreign documents for code embedded in other languages.
//!
//! ## Learning: Parent Links with `Weak`
//!
//! Foreign documents need to reach their host (for URIs and source
//! mapping) while the host owns them. An `Arc` both ways would be a
//! reference cycle that never frees, so the host holds children by `Arc` and
//! each child holds its parent by `Weak`. `Arc::new_cyclic` gives every
//! document a `Weak` to itself as well, so `&self` methods can hand out
//! `Arc<Self>` in events.
//!
//! ## Rebuild Protocol
//!
//! ```text
//! begin_rebuild()          clear blocks, mark all foreign keys unused
//! append_code_block(b)*    extract, place host text, recurse into fragments
//! finish_rebuild()         drop unused foreign docs, announce new ones
//! maybe_emit_changed()     emit `changed` where the text differs
//! ```
//!
//! `UpdateManager` drives this sequence under its update lock.

use nblsp_buffer::{EditorPosition, Position, RootPosition, SourcePosition, VirtualPosition, text};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use crate::block::{BlockInput, CodeBlock};
use crate::editor::EditorRef;
use crate::extractor::{ExtractorRegistry, ForeignFragment};
use crate::signal::Signal;

/// Construction options for a root virtual document.
#[derive(Debug, Clone)]
pub struct VirtualDocumentOptions {
    pub language: String,
    pub file_extension: String,

    /// Path of the host document, relative to the root URI
    pub path: String,

    pub standalone: bool,

    /// Whether the host file itself can be opened by a server
    pub has_lsp_supported_file: bool,

    pub extractors: Arc<ExtractorRegistry>,
    pub blank_lines_between_cells: usize,
}

impl VirtualDocumentOptions {
    pub fn new(language: impl Into<String>, file_extension: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            file_extension: file_extension.into(),
            path: path.into(),
            standalone: false,
            has_lsp_supported_file: false,
            extractors: Arc::new(ExtractorRegistry::new()),
            blank_lines_between_cells: 2,
        }
    }

    pub fn with_extractors(mut self, extractors: Arc<ExtractorRegistry>) -> Self {
        self.extractors = extractors;
        self
    }

    pub fn with_blank_lines(mut self, blank_lines: usize) -> Self {
        self.blank_lines_between_cells = blank_lines;
        self
    }

    pub fn with_lsp_supported_file(mut self, supported: bool) -> Self {
        self.has_lsp_supported_file = supported;
        self
    }
}

/// Key of a foreign document within its host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ForeignKey {
    pub language: String,

    /// Set for standalone documents, one per fragment
    pub id: Option<String>,
}

/// Emitted when a document's text changed after a rebuild.
#[derive(Debug, Clone)]
pub struct DocumentChanged {
    pub root: Arc<VirtualDocument>,
    pub document: Arc<VirtualDocument>,

    /// First population of the document
    pub is_init: bool,
}

/// Emitted when a foreign document is opened in or closed from a host.
#[derive(Debug, Clone)]
pub struct ForeignDocumentEvent {
    pub host: Arc<VirtualDocument>,
    pub foreign: Arc<VirtualDocument>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ForeignChange {
    Opened,
    Closed,
}

#[derive(Default)]
struct DocumentState {
    blocks: Vec<CodeBlock>,
    lines: Vec<String>,
    value: String,
    previous_value: Option<String>,
    foreign: BTreeMap<ForeignKey, Arc<VirtualDocument>>,
    used_keys: HashSet<ForeignKey>,
    standalone_counters: HashMap<String, usize>,
    opened: Vec<Arc<VirtualDocument>>,
    rebuilds: u64,
}

/// A line-addressable text in one language assembled from code blocks.
pub struct VirtualDocument {
    this: Weak<VirtualDocument>,
    parent: Option<Weak<VirtualDocument>>,
    foreign_id: Option<String>,

    language: String,
    file_extension: String,
    path: String,
    standalone: bool,
    has_lsp_supported_file: bool,
    extractors: Arc<ExtractorRegistry>,
    blank_lines: usize,

    state: RwLock<DocumentState>,
    disposed: AtomicBool,

    changed: Signal<DocumentChanged>,
    foreign_document_opened: Signal<ForeignDocumentEvent>,
    foreign_document_closed: Signal<ForeignDocumentEvent>,
    disposed_signal: Signal<String>,
}

impl std::fmt::Debug for VirtualDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualDocument")
            .field("id_path", &self.id_path())
            .field("language", &self.language)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl VirtualDocument {
    /// Creates a root document.
    pub fn new(options: VirtualDocumentOptions) -> Arc<Self> {
        Self::build(options, None, None)
    }

    fn build(
        options: VirtualDocumentOptions,
        parent: Option<&Arc<VirtualDocument>>,
        foreign_id: Option<String>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            parent: parent.map(Arc::downgrade),
            foreign_id,
            language: options.language,
            file_extension: options.file_extension,
            path: options.path,
            standalone: options.standalone,
            has_lsp_supported_file: options.has_lsp_supported_file,
            extractors: options.extractors,
            blank_lines: options.blank_lines_between_cells,
            state: RwLock::new(DocumentState::default()),
            disposed: AtomicBool::new(false),
            changed: Signal::new(),
            foreign_document_opened: Signal::new(),
            foreign_document_closed: Signal::new(),
            disposed_signal: Signal::new(),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, DocumentState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, DocumentState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Identity
    // ========================================================================

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn file_extension(&self) -> &str {
        &self.file_extension
    }

    /// Path of the host document.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn standalone(&self) -> bool {
        self.standalone
    }

    pub fn has_lsp_supported_file(&self) -> bool {
        self.has_lsp_supported_file
    }

    pub fn parent(&self) -> Option<Arc<VirtualDocument>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// The root of this document's tree.
    pub fn root(&self) -> Option<Arc<VirtualDocument>> {
        match self.parent() {
            Some(parent) => parent.root(),
            None => self.this.upgrade(),
        }
    }

    /// Identifier of this document among its host's foreign documents.
    pub fn virtual_id(&self) -> String {
        match &self.foreign_id {
            Some(id) => format!("{}-{}", self.language, id),
            None => self.language.clone(),
        }
    }

    fn virtual_id_chain(&self) -> String {
        match self.parent() {
            Some(parent) => format!("{}-{}", parent.virtual_id_chain(), self.virtual_id()),
            None => self.language.clone(),
        }
    }

    /// Hierarchical key: the host path, then one `-virtual_id` per level.
    pub fn id_path(&self) -> String {
        match self.parent() {
            Some(parent) => format!("{}-{}", parent.id_path(), self.virtual_id()),
            None => self.path.clone(),
        }
    }

    /// Path of the document as sent to the server, relative to the root URI.
    ///
    /// The root keeps the host path; a foreign document appends the chain
    /// of virtual ids and its own extension.
    pub fn uri(&self) -> String {
        if self.is_root() {
            self.path.clone()
        } else {
            format!(
                "{}.{}.{}",
                self.path,
                self.virtual_id_chain(),
                self.file_extension
            )
        }
    }

    // ========================================================================
    // Content
    // ========================================================================

    /// Assembled text as of the last finished rebuild.
    pub fn value(&self) -> String {
        self.read().value.clone()
    }

    pub fn line_count(&self) -> usize {
        text::line_count(&self.read().value)
    }

    pub fn blocks(&self) -> Vec<CodeBlock> {
        self.read().blocks.clone()
    }

    /// Number of finished rebuilds.
    pub fn version(&self) -> u64 {
        self.read().rebuilds
    }

    pub fn foreign_documents(&self) -> Vec<Arc<VirtualDocument>> {
        self.read().foreign.values().cloned().collect()
    }

    pub fn foreign_document(&self, key: &ForeignKey) -> Option<Arc<VirtualDocument>> {
        self.read().foreign.get(key).cloned()
    }

    /// This document and every nested foreign document, pre-order.
    pub fn all_documents(&self) -> Vec<Arc<VirtualDocument>> {
        let mut documents = Vec::new();
        if let Some(this) = self.this.upgrade() {
            documents.push(this);
        }
        for foreign in self.foreign_documents() {
            documents.extend(foreign.all_documents());
        }
        documents
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Signals
    // ========================================================================

    /// Text changes of this document. On the root this also carries the
    /// changes of every nested foreign document.
    pub fn changed(&self) -> &Signal<DocumentChanged> {
        &self.changed
    }

    /// Foreign documents opened directly in this host. On the root this also
    /// carries openings anywhere in the tree.
    pub fn foreign_document_opened(&self) -> &Signal<ForeignDocumentEvent> {
        &self.foreign_document_opened
    }

    /// Counterpart of [`VirtualDocument::foreign_document_opened`].
    pub fn foreign_document_closed(&self) -> &Signal<ForeignDocumentEvent> {
        &self.foreign_document_closed
    }

    /// Emits this document's id path once, when it is disposed.
    pub fn disposed(&self) -> &Signal<String> {
        &self.disposed_signal
    }

    fn emit_foreign_event(&self, change: ForeignChange, foreign: Arc<VirtualDocument>) {
        let Some(host) = self.this.upgrade() else {
            return;
        };
        let event = ForeignDocumentEvent { host, foreign };
        let signal = |document: &VirtualDocument| match change {
            ForeignChange::Opened => document.foreign_document_opened.clone(),
            ForeignChange::Closed => document.foreign_document_closed.clone(),
        };
        signal(self).emit(event.clone());
        if !self.is_root() {
            if let Some(root) = self.root() {
                signal(&root).emit(event);
            }
        }
    }

    // ========================================================================
    // Rebuild
    // ========================================================================

    /// Starts a rebuild: forgets all blocks of this document and its
    /// foreign documents.
    pub fn begin_rebuild(&self) {
        let foreign = {
            let mut state = self.write();
            state.blocks.clear();
            state.lines.clear();
            state.used_keys.clear();
            state.standalone_counters.clear();
            state.opened.clear();
            state.foreign.values().cloned().collect::<Vec<_>>()
        };
        for document in foreign {
            document.begin_rebuild();
        }
    }

    /// Appends a host block at the end of this document.
    pub fn append_code_block(&self, block: &BlockInput) {
        match &block.language {
            Some(language) if *language != self.language => {
                self.append_whole_block_as_foreign(block, language)
            }
            _ => self.append_block(&block.text, &block.editor, Position::ZERO, None),
        }
    }

    /// Places a block in another language: blanked in this document, the
    /// whole text in the foreign document for that language.
    fn append_whole_block_as_foreign(&self, block: &BlockInput, language: &str) {
        let start_line = self.place_host_text(
            &text::blank_span(&block.text, 0..block.text.len()),
            &block.editor,
            Position::ZERO,
            None,
        );
        let fragment = ForeignFragment::from_span(
            &block.text,
            0..block.text.len(),
            language,
            self.extractors.file_extension(language),
            false,
        );
        self.append_fragments(start_line, &block.editor, Position::ZERO, vec![fragment]);
    }

    fn append_block(
        &self,
        code: &str,
        editor: &EditorRef,
        origin: Position,
        source_range: Option<(Position, Position)>,
    ) {
        let extraction = self.extractors.extract(&self.language, code);
        let start_line = self.place_host_text(&extraction.host_text, editor, origin, source_range);
        self.append_fragments(start_line, editor, origin, extraction.fragments);
    }

    /// Pushes separator and block lines and records the block. Returns the
    /// block's first virtual line.
    fn place_host_text(
        &self,
        host_text: &str,
        editor: &EditorRef,
        origin: Position,
        source_range: Option<(Position, Position)>,
    ) -> usize {
        let mut state = self.write();
        if !state.blocks.is_empty() {
            for _ in 0..self.blank_lines {
                state.lines.push(String::new());
            }
        }
        let start_line = state.lines.len();
        let lines = text::split_lines(host_text);
        let line_count = lines.len();
        state.lines.extend(lines.into_iter().map(str::to_string));
        state.blocks.push(CodeBlock {
            editor: editor.clone(),
            virtual_start: start_line,
            line_count,
            origin,
            source_range,
        });
        start_line
    }

    fn append_fragments(
        &self,
        start_line: usize,
        editor: &EditorRef,
        origin: Position,
        fragments: Vec<ForeignFragment>,
    ) {
        for fragment in fragments {
            let Some(document) = self.foreign_document_for(&fragment) else {
                continue;
            };
            let block_origin = Position::new(start_line, 0);
            let source_range = (
                fragment.start.shifted_by(block_origin),
                fragment.end.shifted_by(block_origin),
            );
            document.append_block(
                &fragment.text,
                editor,
                fragment.start.shifted_by(origin),
                Some(source_range),
            );
        }
    }

    /// Finds or creates the foreign document a fragment belongs to.
    fn foreign_document_for(&self, fragment: &ForeignFragment) -> Option<Arc<VirtualDocument>> {
        let this = self.this.upgrade()?;
        let mut state = self.write();

        let id = if fragment.standalone {
            let counter = state
                .standalone_counters
                .entry(fragment.language.clone())
                .or_insert(0);
            let id = counter.to_string();
            *counter += 1;
            Some(id)
        } else {
            None
        };
        let key = ForeignKey {
            language: fragment.language.clone(),
            id,
        };
        state.used_keys.insert(key.clone());

        if let Some(existing) = state.foreign.get(&key) {
            return Some(existing.clone());
        }

        tracing::debug!(
            "Opening foreign {} document in {}",
            fragment.language,
            self.id_path()
        );
        let options = VirtualDocumentOptions {
            language: fragment.language.clone(),
            file_extension: fragment.file_extension.clone(),
            path: self.path.clone(),
            standalone: fragment.standalone,
            has_lsp_supported_file: false,
            extractors: self.extractors.clone(),
            blank_lines_between_cells: self.blank_lines,
        };
        let document = Self::build(options, Some(&this), key.id.clone());
        state.foreign.insert(key, document.clone());
        state.opened.push(document.clone());
        Some(document)
    }

    /// Ends a rebuild: closes foreign documents no block referenced and
    /// announces the new ones, hosts before their nested documents.
    pub fn finish_rebuild(&self) {
        let mut pending = Vec::new();
        self.settle(&mut pending);

        for (host, change, document) in pending {
            host.emit_foreign_event(change, document.clone());
            if change == ForeignChange::Closed {
                tracing::debug!("Closing foreign document {}", document.id_path());
                document.dispose();
            }
        }
    }

    /// Finalizes the text of this subtree and collects foreign changes in
    /// pre-order.
    fn settle(&self, pending: &mut Vec<(Arc<VirtualDocument>, ForeignChange, Arc<VirtualDocument>)>) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let (kept, expired, opened) = {
            let mut state = self.write();
            let expired_keys: Vec<ForeignKey> = state
                .foreign
                .keys()
                .filter(|key| !state.used_keys.contains(key))
                .cloned()
                .collect();
            let expired: Vec<_> = expired_keys
                .iter()
                .filter_map(|key| state.foreign.remove(key))
                .collect();
            state.value = state.lines.join("\n");
            state.rebuilds += 1;
            let opened = std::mem::take(&mut state.opened);
            let kept: Vec<_> = state.foreign.values().cloned().collect();
            (kept, expired, opened)
        };

        pending.extend(
            expired
                .into_iter()
                .map(|document| (this.clone(), ForeignChange::Closed, document)),
        );
        pending.extend(
            opened
                .into_iter()
                .map(|document| (this.clone(), ForeignChange::Opened, document)),
        );
        for document in kept {
            document.settle(pending);
        }
    }

    /// Emits `changed` for this document and every foreign document whose
    /// text differs from what was last announced.
    pub fn maybe_emit_changed(&self) {
        let (emission, foreign) = {
            let mut state = self.write();
            let emission = if state.previous_value.as_deref() != Some(state.value.as_str()) {
                let is_init = state.previous_value.is_none();
                state.previous_value = Some(state.value.clone());
                Some(is_init)
            } else {
                None
            };
            (emission, state.foreign.values().cloned().collect::<Vec<_>>())
        };

        if let (Some(is_init), Some(document), Some(root)) =
            (emission, self.this.upgrade(), self.root())
        {
            let event = DocumentChanged {
                root: root.clone(),
                document,
                is_init,
            };
            self.changed.emit(event.clone());
            if !self.is_root() {
                root.changed.emit(event);
            }
        }

        for document in foreign {
            document.maybe_emit_changed();
        }
    }

    /// Disposes this document and all foreign documents. Safe to call more
    /// than once.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let foreign = {
            let mut state = self.write();
            state.blocks.clear();
            state.lines.clear();
            state.opened.clear();
            std::mem::take(&mut state.foreign)
        };
        for document in foreign.into_values() {
            self.emit_foreign_event(ForeignChange::Closed, document.clone());
            document.dispose();
        }
        tracing::debug!("Disposed virtual document {}", self.id_path());
        self.disposed_signal.emit(self.id_path());
    }

    // ========================================================================
    // Coordinate transforms
    // ========================================================================

    fn block_at_virtual_line(&self, line: usize) -> Option<CodeBlock> {
        let state = self.read();
        let index = state.blocks.partition_point(|block| block.virtual_end() <= line);
        state
            .blocks
            .get(index)
            .filter(|block| block.contains_virtual_line(line))
            .cloned()
    }

    /// Locates the editor owning a virtual position.
    pub fn virtual_to_editor(&self, position: VirtualPosition) -> Option<(EditorRef, EditorPosition)> {
        let block = self.block_at_virtual_line(position.line())?;
        let editor_position = block.virtual_to_editor(position)?;
        Some((block.editor, editor_position))
    }

    /// Maps an editor position into this document, if one of its blocks
    /// covers it.
    pub fn editor_to_virtual(
        &self,
        editor: &EditorRef,
        position: EditorPosition,
    ) -> Option<VirtualPosition> {
        self.read()
            .blocks
            .iter()
            .find_map(|block| block.editor_to_virtual(editor, position))
    }

    pub fn editor_to_root(&self, editor: &EditorRef, position: EditorPosition) -> Option<RootPosition> {
        let root = self.root()?;
        root.editor_to_virtual(editor, position)
            .map(|position| RootPosition(position.position()))
    }

    pub fn root_to_virtual(&self, position: RootPosition) -> Option<VirtualPosition> {
        if self.is_root() {
            return Some(VirtualPosition(position.position()));
        }
        let root = self.root()?;
        let (editor, editor_position) = root.virtual_to_editor(VirtualPosition(position.position()))?;
        self.editor_to_virtual(&editor, editor_position)
    }

    pub fn virtual_to_root(&self, position: VirtualPosition) -> Option<RootPosition> {
        if self.is_root() {
            return Some(RootPosition(position.position()));
        }
        let (editor, editor_position) = self.virtual_to_editor(position)?;
        self.editor_to_root(&editor, editor_position)
    }

    /// Maps a position in this document into its parent. The root is its
    /// own source.
    pub fn virtual_to_source(&self, position: VirtualPosition) -> Option<SourcePosition> {
        let Some(parent) = self.parent() else {
            return Some(SourcePosition(position.position()));
        };
        let (editor, editor_position) = self.virtual_to_editor(position)?;
        parent
            .editor_to_virtual(&editor, editor_position)
            .map(|position| SourcePosition(position.position()))
    }

    /// Maps a parent position to the editor it lives in.
    pub fn source_to_editor(&self, position: SourcePosition) -> Option<(EditorRef, EditorPosition)> {
        match self.parent() {
            Some(parent) => parent.virtual_to_editor(VirtualPosition(position.position())),
            None => self.virtual_to_editor(VirtualPosition(position.position())),
        }
    }

    /// The innermost document covering a position of this document.
    pub fn document_at_source_position(&self, position: SourcePosition) -> Option<Arc<VirtualDocument>> {
        for foreign in self.foreign_documents() {
            let inner = foreign
                .read()
                .blocks
                .iter()
                .find_map(|block| block.source_to_virtual(position));
            if let Some(inner) = inner {
                return foreign.document_at_source_position(SourcePosition(inner.position()));
            }
        }
        self.this.upgrade()
    }

    /// Whether a position of this document lies inside extracted foreign code.
    pub fn is_within_foreign(&self, position: SourcePosition) -> bool {
        self.foreign_documents().iter().any(|foreign| {
            foreign
                .read()
                .blocks
                .iter()
                .any(|block| block.contains_source(position))
        })
    }
}
