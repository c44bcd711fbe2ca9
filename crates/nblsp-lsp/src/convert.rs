//! Conversions between document positions and LSP positions.
//!
//! Columns in the document model count Unicode scalar values. LSP counts
//! UTF-16 code units by default, so columns past a character outside the
//! Basic Multilingual Plane shift by one per such character. The helpers
//! below take the line text when it is available to convert exactly.

use lsp_types::{Position as LspPosition, Range as LspRange};
use nblsp_buffer::VirtualPosition;

/// Converts a virtual position, counting columns as characters.
pub fn lsp_position(position: VirtualPosition) -> LspPosition {
    LspPosition::new(position.line() as u32, position.column() as u32)
}

/// Converts an LSP position, counting columns as characters.
pub fn virtual_position(position: LspPosition) -> VirtualPosition {
    VirtualPosition::new(position.line as usize, position.character as usize)
}

/// UTF-16 column of character column `column` in `line`.
pub fn utf16_column(line: &str, column: usize) -> u32 {
    line.chars()
        .take(column)
        .map(|c| c.len_utf16() as u32)
        .sum()
}

/// Character column of UTF-16 column `column` in `line`.
pub fn char_column(line: &str, column: u32) -> usize {
    let mut units = 0u32;
    for (index, c) in line.chars().enumerate() {
        if units >= column {
            return index;
        }
        units += c.len_utf16() as u32;
    }
    line.chars().count()
}

/// Exact conversion using the text of the virtual document.
pub fn lsp_position_in(text: &str, position: VirtualPosition) -> LspPosition {
    match text.split('\n').nth(position.line()) {
        Some(line) => LspPosition::new(position.line() as u32, utf16_column(line, position.column())),
        None => lsp_position(position),
    }
}

/// Exact conversion using the text of the virtual document.
pub fn virtual_position_in(text: &str, position: LspPosition) -> VirtualPosition {
    match text.split('\n').nth(position.line as usize) {
        Some(line) => VirtualPosition::new(position.line as usize, char_column(line, position.character)),
        None => virtual_position(position),
    }
}

/// Start and end of an LSP range in virtual coordinates.
pub fn virtual_range_in(text: &str, range: LspRange) -> (VirtualPosition, VirtualPosition) {
    (
        virtual_position_in(text, range.start),
        virtual_position_in(text, range.end),
    )
}
