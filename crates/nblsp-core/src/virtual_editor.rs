//! Root-coordinate view over the editors of a host document.
//!
//! Features think in root positions; the text lives in per-cell editors.
//! `VirtualEditor` answers root queries by finding the block that owns the
//! position and asking that block's editor.

use nblsp_buffer::{EditorPosition, Position, RootPosition, SourcePosition, VirtualPosition, text};
use std::sync::Arc;

use crate::editor::{EditorRef, same_editor};
use crate::virtual_document::VirtualDocument;

/// A word under a position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub text: String,
    pub start: RootPosition,
    pub end: RootPosition,
}

/// Dispatches root-coordinate queries to the owning editors.
#[derive(Debug, Clone)]
pub struct VirtualEditor {
    root: Arc<VirtualDocument>,
}

impl VirtualEditor {
    pub fn new(root: Arc<VirtualDocument>) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Arc<VirtualDocument> {
        &self.root
    }

    /// Editors of the root document in block order, each once.
    pub fn editors(&self) -> Vec<EditorRef> {
        let mut editors: Vec<EditorRef> = Vec::new();
        for block in self.root.blocks() {
            if !editors.iter().any(|known| same_editor(known, &block.editor)) {
                editors.push(block.editor);
            }
        }
        editors
    }

    /// Cursor of `editor` in root coordinates.
    pub fn cursor_position(&self, editor: &EditorRef) -> Option<RootPosition> {
        self.root.editor_to_root(editor, editor.cursor_position())
    }

    pub fn root_to_editor(&self, position: RootPosition) -> Option<(EditorRef, EditorPosition)> {
        self.root
            .virtual_to_editor(VirtualPosition(position.position()))
    }

    /// Text of the editor line covering a root line.
    pub fn line(&self, position: RootPosition) -> Option<String> {
        let (editor, editor_position) = self.root_to_editor(position)?;
        editor.line(editor_position.line())
    }

    /// The word at a root position, read from the owning editor.
    pub fn token_at(&self, position: RootPosition) -> Option<Token> {
        let (editor, editor_position) = self.root_to_editor(position)?;
        let line = editor.line(editor_position.line())?;
        let (start_column, word) = text::token_at(&line, editor_position.column())?;
        let width = word.chars().count();

        let start = EditorPosition::new(editor_position.line(), start_column);
        let end = EditorPosition::new(editor_position.line(), start_column + width);
        Some(Token {
            text: word.to_string(),
            start: self.root.editor_to_root(&editor, start)?,
            end: self.root.editor_to_root(&editor, end)?,
        })
    }

    /// The innermost virtual document at a root position.
    pub fn document_at(&self, position: RootPosition) -> Option<Arc<VirtualDocument>> {
        self.root
            .document_at_source_position(SourcePosition(position.position()))
    }

    /// Maps a root position into whichever document owns it.
    pub fn locate(&self, position: RootPosition) -> Option<(Arc<VirtualDocument>, VirtualPosition)> {
        let document = self.document_at(position)?;
        let virtual_position = document.root_to_virtual(position)?;
        Some((document, virtual_position))
    }

    /// Root position of the start of an editor.
    pub fn editor_origin(&self, editor: &EditorRef) -> Option<RootPosition> {
        self.root
            .editor_to_root(editor, EditorPosition(Position::ZERO))
    }
}
