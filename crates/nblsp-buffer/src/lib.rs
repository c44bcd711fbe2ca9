//! # nblsp Buffer
//!
//! Text primitives shared by the document model and the LSP layer.
//!
//! ## Coordinate Spaces
//!
//! A notebook is edited in many small editors (one per cell) but a language
//! server only ever sees one file per language. Every position therefore lives
//! in one of four spaces:
//!
//! ```text
//!  editor   line/column inside one cell editor
//!  root     line/column inside the root virtual document (all cells joined)
//!  virtual  line/column inside one (possibly foreign) virtual document
//!  source   line/column inside the parent of a foreign document
//! ```
//!
//! Each space gets its own newtype so a root position can never be passed
//! where an editor position is expected.

mod buffer;
mod position;
pub mod text;

pub use buffer::TextBuffer;
pub use position::{EditorPosition, Position, RootPosition, SourcePosition, VirtualPosition};

/// Result type for buffer operations
pub type BufferResult<T> = Result<T, BufferError>;

/// Errors that can occur during buffer operations
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("Position {line}:{column} is out of bounds")]
    PositionOutOfBounds { line: usize, column: usize },

    #[error("Invalid character index: {0}")]
    InvalidCharIndex(usize),
}
