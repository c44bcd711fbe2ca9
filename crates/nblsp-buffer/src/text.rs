//! Line and offset helpers over plain strings.
//!
//! Lines are separated by `\n` only; a `\r` before it is kept as part of the
//! line so that carriage returns survive blanking untouched.

use std::ops::Range;

use unicode_segmentation::UnicodeSegmentation;

use crate::Position;

/// Number of lines in `text`. An empty string has one line, and a trailing
/// newline opens a new (empty) line.
pub fn line_count(text: &str) -> usize {
    text.bytes().filter(|&b| b == b'\n').count() + 1
}

/// Splits `text` into lines without their terminating `\n`.
pub fn split_lines(text: &str) -> Vec<&str> {
    text.split('\n').collect()
}

/// Converts a byte offset into a line/column position.
///
/// Offsets past the end clamp to the end of the text. Offsets are expected
/// on character boundaries.
pub fn position_at_offset(text: &str, offset: usize) -> Position {
    let offset = offset.min(text.len());
    let mut line = 0;
    let mut line_start = 0;
    for (idx, byte) in text.bytes().enumerate().take(offset) {
        if byte == b'\n' {
            line += 1;
            line_start = idx + 1;
        }
    }
    let column = text[line_start..]
        .char_indices()
        .take_while(|(idx, _)| line_start + idx < offset)
        .count();
    Position::new(line, column)
}

/// Converts a line/column position into a byte offset. Columns may point one
/// past the last character of a line.
pub fn offset_at_position(text: &str, position: Position) -> Option<usize> {
    let mut line_start = 0;
    for _ in 0..position.line {
        line_start += text[line_start..].find('\n')? + 1;
    }
    let line = text[line_start..].split('\n').next().unwrap_or("");
    if position.column == line.chars().count() {
        return Some(line_start + line.len());
    }
    line.char_indices()
        .nth(position.column)
        .map(|(idx, _)| line_start + idx)
}

/// Replaces every character inside `span` with a space, keeping line breaks,
/// so the result has exactly the same lines and columns as `text`.
pub fn blank_span(text: &str, span: Range<usize>) -> String {
    let mut blanked = String::with_capacity(text.len());
    for (idx, ch) in text.char_indices() {
        if span.contains(&idx) && ch != '\n' && ch != '\r' {
            blanked.push(' ');
        } else {
            blanked.push(ch);
        }
    }
    blanked
}

/// Returns the position just past the last character of `text`.
pub fn end_position(text: &str) -> Position {
    position_at_offset(text, text.len())
}

/// Returns the word-like token covering `column` on `line`, with its start
/// column. Whitespace and punctuation are not tokens.
pub fn token_at(line: &str, column: usize) -> Option<(usize, &str)> {
    let mut start_column = 0;
    for word in line.split_word_bounds() {
        let width = word.chars().count();
        if column >= start_column && column <= start_column + width {
            let is_token = word.chars().any(|c| c.is_alphanumeric() || c == '_');
            if is_token {
                return Some((start_column, word));
            }
        }
        start_column += width;
    }
    None
}
