//! Code blocks: the pieces a virtual document is assembled from.
//!
//! A block occupies a contiguous line range of its virtual document, always
//! starting at column 0. Its `origin` is where the block's first character
//! sits inside the owning editor: `(0, 0)` for a whole cell, somewhere in the
//! middle for a fragment extracted from a cell.

use nblsp_buffer::{EditorPosition, Position, SourcePosition, VirtualPosition};

use crate::editor::{EditorRef, same_editor};

/// One block handed to the update manager by a host.
#[derive(Debug, Clone)]
pub struct BlockInput {
    /// Current text of the block
    pub text: String,

    /// Editor the text lives in
    pub editor: EditorRef,

    /// Language of this block when it differs from the document's,
    /// e.g. a markdown cell in a python notebook
    pub language: Option<String>,
}

impl BlockInput {
    pub fn new(text: impl Into<String>, editor: EditorRef) -> Self {
        Self {
            text: text.into(),
            editor,
            language: None,
        }
    }

    /// Reads the current text straight from the editor.
    pub fn from_editor(editor: EditorRef) -> Self {
        Self::new(editor.text(), editor)
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

/// A block as placed inside a virtual document.
#[derive(Debug, Clone)]
pub struct CodeBlock {
    pub editor: EditorRef,

    /// First line of the block in the virtual document
    pub virtual_start: usize,

    /// Number of lines the block spans
    pub line_count: usize,

    /// Editor position of the block's first character
    pub origin: Position,

    /// Span in the parent document this block was extracted from
    pub source_range: Option<(Position, Position)>,
}

impl CodeBlock {
    /// One past the last virtual line of this block.
    pub fn virtual_end(&self) -> usize {
        self.virtual_start + self.line_count
    }

    pub fn contains_virtual_line(&self, line: usize) -> bool {
        line >= self.virtual_start && line < self.virtual_end()
    }

    pub fn virtual_to_editor(&self, position: VirtualPosition) -> Option<EditorPosition> {
        if !self.contains_virtual_line(position.line()) {
            return None;
        }
        let local = Position::new(position.line() - self.virtual_start, position.column());
        Some(EditorPosition(local.shifted_by(self.origin)))
    }

    /// Maps an editor position back into this block, if it lies inside it.
    pub fn editor_to_virtual(
        &self,
        editor: &EditorRef,
        position: EditorPosition,
    ) -> Option<VirtualPosition> {
        if !same_editor(&self.editor, editor) {
            return None;
        }
        let local = position.position().relative_to(self.origin)?;
        if local.line >= self.line_count {
            return None;
        }
        Some(VirtualPosition::new(
            self.virtual_start + local.line,
            local.column,
        ))
    }

    /// Whether a parent-document position falls in the span this block was
    /// extracted from. Both ends are inclusive so a cursor at the end of the
    /// fragment still counts.
    pub fn contains_source(&self, position: SourcePosition) -> bool {
        match self.source_range {
            Some((start, end)) => position.position() >= start && position.position() <= end,
            None => false,
        }
    }

    /// Maps a parent-document position into this block's virtual lines.
    pub fn source_to_virtual(&self, position: SourcePosition) -> Option<VirtualPosition> {
        if !self.contains_source(position) {
            return None;
        }
        let (start, _) = self.source_range?;
        let local = position.position().relative_to(start)?;
        Some(VirtualPosition::new(
            self.virtual_start + local.line,
            local.column,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editor::SnapshotEditor;

    fn block(origin: Position) -> (EditorRef, CodeBlock) {
        let editor: EditorRef = SnapshotEditor::new("a\nb\nc");
        let block = CodeBlock {
            editor: editor.clone(),
            virtual_start: 4,
            line_count: 3,
            origin,
            source_range: Some((Position::new(10, 3), Position::new(12, 1))),
        };
        (editor, block)
    }

    #[test]
    fn test_whole_cell_block_offsets_lines() {
        let (editor, block) = block(Position::ZERO);
        let editor_pos = block.virtual_to_editor(VirtualPosition::new(5, 2)).unwrap();
        assert_eq!(editor_pos, EditorPosition::new(1, 2));
        assert_eq!(
            block.editor_to_virtual(&editor, editor_pos),
            Some(VirtualPosition::new(5, 2))
        );
        assert_eq!(block.virtual_to_editor(VirtualPosition::new(7, 0)), None);
    }

    #[test]
    fn test_fragment_block_shifts_first_line_column() {
        let (editor, block) = block(Position::new(2, 6));
        assert_eq!(
            block.virtual_to_editor(VirtualPosition::new(4, 1)),
            Some(EditorPosition::new(2, 7))
        );
        assert_eq!(
            block.virtual_to_editor(VirtualPosition::new(5, 1)),
            Some(EditorPosition::new(3, 1))
        );
        // before the fragment
        assert_eq!(block.editor_to_virtual(&editor, EditorPosition::new(2, 1)), None);
    }

    #[test]
    fn test_other_editor_is_rejected() {
        let (_, block) = block(Position::ZERO);
        let other: EditorRef = SnapshotEditor::new("a");
        assert_eq!(block.editor_to_virtual(&other, EditorPosition::new(0, 0)), None);
    }

    #[test]
    fn test_source_mapping() {
        let (_, block) = block(Position::ZERO);
        assert!(block.contains_source(SourcePosition::new(12, 1)));
        assert!(!block.contains_source(SourcePosition::new(10, 2)));
        assert_eq!(
            block.source_to_virtual(SourcePosition::new(10, 5)),
            Some(VirtualPosition::new(4, 2))
        );
        assert_eq!(
            block.source_to_virtual(SourcePosition::new(11, 0)),
            Some(VirtualPosition::new(5, 0))
        );
    }
}
