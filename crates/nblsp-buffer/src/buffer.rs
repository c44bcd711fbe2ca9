//! Rope-backed text buffer used by in-memory editors.
//!
//! ## Why Rope?
//!
//! Cell editors receive many small edits while the document model keeps
//! asking for the full text. A rope gives O(log n) edits and cheap
//! line lookups, which is the access pattern of an editor that is re-read
//! on every content-changed event.

use ropey::Rope;
use std::borrow::Cow;
use std::ops::Range;

use crate::{BufferError, BufferResult, Position};

/// A text buffer backed by a rope.
#[derive(Debug, Clone, Default)]
pub struct TextBuffer {
    rope: Rope,

    /// Bumped on every mutation
    revision: u64,
}

impl TextBuffer {
    /// Creates a new empty buffer.
    ///
    /// # Example
    /// ```
    /// use nblsp_buffer::TextBuffer;
    ///
    /// let buffer = TextBuffer::new();
    /// assert!(buffer.is_empty());
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entire text content.
    #[inline]
    pub fn text(&self) -> Cow<'_, str> {
        self.rope.slice(..).into()
    }

    /// Returns a specific line (0-indexed) without its trailing newline.
    pub fn line(&self, line_idx: usize) -> BufferResult<Cow<'_, str>> {
        if line_idx >= self.len_lines() {
            return Err(BufferError::PositionOutOfBounds {
                line: line_idx,
                column: 0,
            });
        }
        let line: Cow<'_, str> = self.rope.line(line_idx).into();
        Ok(match line {
            Cow::Borrowed(s) => Cow::Borrowed(s.strip_suffix('\n').unwrap_or(s)),
            Cow::Owned(mut s) => {
                if s.ends_with('\n') {
                    s.pop();
                }
                Cow::Owned(s)
            }
        })
    }

    /// Returns a slice of text by character range.
    pub fn slice(&self, range: Range<usize>) -> BufferResult<Cow<'_, str>> {
        if range.start > range.end || range.end > self.len_chars() {
            return Err(BufferError::InvalidCharIndex(range.end));
        }
        Ok(self.rope.slice(range).into())
    }

    /// Returns true if the buffer is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rope.len_chars() == 0
    }

    /// Returns the number of characters in the buffer.
    #[inline]
    pub fn len_chars(&self) -> usize {
        self.rope.len_chars()
    }

    /// Returns the number of lines in the buffer.
    ///
    /// An empty buffer has 1 line. A buffer ending with `\n` counts
    /// the empty line after it.
    #[inline]
    pub fn len_lines(&self) -> usize {
        self.rope.len_lines()
    }

    /// Returns the length of a line in characters, excluding the newline.
    pub fn line_len(&self, line_idx: usize) -> BufferResult<usize> {
        Ok(self.line(line_idx)?.chars().count())
    }

    /// Returns how many times the buffer has been mutated.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Inserts text at a character index.
    pub fn insert(&mut self, char_idx: usize, text: &str) -> BufferResult<()> {
        if char_idx > self.len_chars() {
            return Err(BufferError::InvalidCharIndex(char_idx));
        }
        self.rope.insert(char_idx, text);
        self.revision += 1;
        Ok(())
    }

    /// Inserts text at a line:column position.
    pub fn insert_at(&mut self, pos: Position, text: &str) -> BufferResult<()> {
        let char_idx = self.position_to_char_idx(pos)?;
        self.insert(char_idx, text)
    }

    /// Deletes text in a character range and returns it.
    pub fn delete(&mut self, range: Range<usize>) -> BufferResult<String> {
        if range.start > range.end || range.end > self.len_chars() {
            return Err(BufferError::InvalidCharIndex(range.end));
        }
        let deleted: String = self.rope.slice(range.clone()).into();
        self.rope.remove(range);
        self.revision += 1;
        Ok(deleted)
    }

    /// Replaces the whole content.
    pub fn set_text(&mut self, text: &str) {
        self.rope = Rope::from_str(text);
        self.revision += 1;
    }

    /// Converts a Position (line, column) to a character index.
    ///
    /// The column may point just past the last character of the line.
    pub fn position_to_char_idx(&self, pos: Position) -> BufferResult<usize> {
        let out_of_bounds = BufferError::PositionOutOfBounds {
            line: pos.line,
            column: pos.column,
        };
        if pos.line >= self.len_lines() {
            return Err(out_of_bounds);
        }
        if pos.column > self.line_len(pos.line)? {
            return Err(out_of_bounds);
        }
        Ok(self.rope.line_to_char(pos.line) + pos.column)
    }

    /// Converts a character index to a Position (line, column).
    pub fn char_idx_to_position(&self, char_idx: usize) -> BufferResult<Position> {
        if char_idx > self.len_chars() {
            return Err(BufferError::InvalidCharIndex(char_idx));
        }
        let line = self.rope.char_to_line(char_idx);
        let column = char_idx - self.rope.line_to_char(line);
        Ok(Position { line, column })
    }
}

impl From<&str> for TextBuffer {
    fn from(s: &str) -> Self {
        Self {
            rope: Rope::from_str(s),
            revision: 0,
        }
    }
}

impl From<String> for TextBuffer {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_strips_newline() {
        let buffer = TextBuffer::from("a = 1\nb = 2\n");
        assert_eq!(buffer.len_lines(), 3);
        assert_eq!(buffer.line(0).unwrap(), "a = 1");
        assert_eq!(buffer.line(2).unwrap(), "");
        assert!(buffer.line(3).is_err());
    }

    #[test]
    fn test_insert_and_delete_bump_revision() {
        let mut buffer = TextBuffer::from("print()");
        buffer.insert_at(Position::new(0, 6), "1").unwrap();
        assert_eq!(buffer.text(), "print(1)");
        assert_eq!(buffer.delete(0..5).unwrap(), "print");
        assert_eq!(buffer.text(), "(1)");
        assert_eq!(buffer.revision(), 2);
    }

    #[test]
    fn test_position_conversion() {
        let buffer = TextBuffer::from("ab\ncde");
        assert_eq!(buffer.position_to_char_idx(Position::new(1, 3)).unwrap(), 6);
        assert!(buffer.position_to_char_idx(Position::new(0, 3)).is_err());
        assert_eq!(buffer.char_idx_to_position(4).unwrap(), Position::new(1, 1));
    }
}
