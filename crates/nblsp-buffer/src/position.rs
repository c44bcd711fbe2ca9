//! Position types.
//!
//! ## Learning: Newtypes over Tuples
//!
//! `Position` is the raw line/column pair. The coordinate-space wrappers
//! (`RootPosition`, `VirtualPosition`, `EditorPosition`, `SourcePosition`)
//! are zero-cost newtypes around it; converting between them is only
//! possible through the transforms on `VirtualDocument`, which keeps the
//! compiler checking that every position is interpreted in the right space.

use serde::{Deserialize, Serialize};

/// A line/column pair, both 0-indexed.
///
/// Columns count characters, not bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Position {
    /// Line number (0-indexed)
    pub line: usize,
    /// Column number (0-indexed, in characters not bytes)
    pub column: usize,
}

impl Position {
    /// Position at the start of a text.
    pub const ZERO: Position = Position { line: 0, column: 0 };

    /// Creates a new position.
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }

    /// Returns true if this position is before another.
    pub fn is_before(&self, other: &Position) -> bool {
        self.line < other.line || (self.line == other.line && self.column < other.column)
    }

    /// Offsets this position by a block origin: lines are shifted by the
    /// origin line, the column only on the origin's own line.
    pub fn shifted_by(self, origin: Position) -> Position {
        if self.line == 0 {
            Position::new(origin.line, origin.column + self.column)
        } else {
            Position::new(origin.line + self.line, self.column)
        }
    }

    /// Inverse of [`Position::shifted_by`]. Returns `None` for positions
    /// before the origin.
    pub fn relative_to(self, origin: Position) -> Option<Position> {
        if self.line < origin.line {
            return None;
        }
        if self.line == origin.line {
            let column = self.column.checked_sub(origin.column)?;
            Some(Position::new(0, column))
        } else {
            Some(Position::new(self.line - origin.line, self.column))
        }
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.line
            .cmp(&other.line)
            .then_with(|| self.column.cmp(&other.column))
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // 1-indexed for user-facing output
        write!(f, "{}:{}", self.line + 1, self.column + 1)
    }
}

macro_rules! coordinate_space {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Position);

        impl $name {
            pub fn new(line: usize, column: usize) -> Self {
                Self(Position::new(line, column))
            }

            pub fn line(&self) -> usize {
                self.0.line
            }

            pub fn column(&self) -> usize {
                self.0.column
            }

            pub fn position(&self) -> Position {
                self.0
            }
        }

        impl From<Position> for $name {
            fn from(position: Position) -> Self {
                Self(position)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

coordinate_space!(
    /// Position in the root virtual document of a host.
    RootPosition
);
coordinate_space!(
    /// Position in one specific virtual document.
    VirtualPosition
);
coordinate_space!(
    /// Position in one cell/file editor.
    EditorPosition
);
coordinate_space!(
    /// Position in the parent document of a foreign document.
    SourcePosition
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        assert!(Position::new(0, 5) < Position::new(1, 0));
        assert!(Position::new(2, 1) > Position::new(2, 0));
        assert!(Position::new(1, 3).is_before(&Position::new(1, 4)));
    }

    #[test]
    fn test_shift_first_line_adds_column() {
        let origin = Position::new(3, 4);
        assert_eq!(Position::new(0, 2).shifted_by(origin), Position::new(3, 6));
        assert_eq!(Position::new(2, 2).shifted_by(origin), Position::new(5, 2));
    }

    #[test]
    fn test_relative_to_rejects_positions_before_origin() {
        let origin = Position::new(3, 4);
        assert_eq!(Position::new(2, 9).relative_to(origin), None);
        assert_eq!(Position::new(3, 1).relative_to(origin), None);
        assert_eq!(
            Position::new(3, 6).relative_to(origin),
            Some(Position::new(0, 2))
        );
    }

    #[test]
    fn test_display_is_one_indexed() {
        assert_eq!(EditorPosition::new(0, 0).to_string(), "1:1");
    }
}
