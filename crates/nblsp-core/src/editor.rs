//! Editor abstraction.
//!
//! ## Learning: Trait Objects at the Seam
//!
//! The document model never owns an editor widget. It only needs cursor
//! and text queries in the editor's own coordinates, so it talks to a
//! `dyn CodeEditor` behind an `Arc`. Hosts plug in whatever editor they have;
//! the crate ships a rope-backed `InMemoryEditor` and a read-only
//! `SnapshotEditor`.

use nblsp_buffer::{EditorPosition, Position, TextBuffer, text};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use crate::CoreResult;
use crate::host::HostChange;
use crate::signal::{Signal, SignalReceiver};

/// Unique identifier for an editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EditorId(Uuid);

impl EditorId {
    /// Creates a new unique editor ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EditorId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EditorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kinds of editors features can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditorKind {
    /// Editable rope-backed editor
    Rope,
    /// Immutable text snapshot
    Snapshot,
}

/// What the document model needs from an editor.
pub trait CodeEditor: Send + Sync + std::fmt::Debug {
    fn id(&self) -> EditorId;

    fn kind(&self) -> EditorKind;

    /// Full text of the editor.
    fn text(&self) -> String;

    /// One line without its newline, or `None` past the end.
    fn line(&self, line: usize) -> Option<String> {
        text::split_lines(&self.text())
            .get(line)
            .map(|line| line.to_string())
    }

    fn line_count(&self) -> usize {
        text::line_count(&self.text())
    }

    fn cursor_position(&self) -> EditorPosition;

    /// Returns the text between two editor positions.
    fn get_range(&self, start: EditorPosition, end: EditorPosition) -> Option<String> {
        let content = self.text();
        let from = text::offset_at_position(&content, start.position())?;
        let to = text::offset_at_position(&content, end.position())?;
        content.get(from..to).map(str::to_string)
    }

    fn is_disposed(&self) -> bool;
}

/// Shared handle to an editor.
pub type EditorRef = Arc<dyn CodeEditor>;

/// Compares two editor handles by identity.
pub fn same_editor(a: &EditorRef, b: &EditorRef) -> bool {
    a.id() == b.id()
}

// ============================================================================
// In-memory editor
// ============================================================================

/// An editable editor backed by a [`TextBuffer`].
///
/// Every edit emits on [`content_changed`](Self::content_changed) and on each
/// host signal registered with [`relay_to`](Self::relay_to), synchronously
/// and after the buffer lock is released.
#[derive(Debug)]
pub struct InMemoryEditor {
    id: EditorId,
    buffer: RwLock<TextBuffer>,
    cursor: RwLock<Position>,
    disposed: AtomicBool,
    changed: Signal<EditorId>,
    relays: Mutex<Vec<Signal<HostChange>>>,
}

impl InMemoryEditor {
    /// Creates an editor holding `text`, cursor at the start.
    pub fn new(text: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: EditorId::new(),
            buffer: RwLock::new(TextBuffer::from(text.into())),
            cursor: RwLock::new(Position::ZERO),
            disposed: AtomicBool::new(false),
            changed: Signal::new(),
            relays: Mutex::new(Vec::new()),
        })
    }

    fn buffer(&self) -> RwLockReadGuard<'_, TextBuffer> {
        self.buffer.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn buffer_mut(&self) -> RwLockWriteGuard<'_, TextBuffer> {
        self.buffer.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn relays(&self) -> MutexGuard<'_, Vec<Signal<HostChange>>> {
        self.relays.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Keeps the cursor inside the text after an edit.
    fn clamp_cursor(&self, buffer: &TextBuffer) -> CoreResult<()> {
        let mut cursor = self.cursor.write().unwrap_or_else(PoisonError::into_inner);
        if buffer.position_to_char_idx(*cursor).is_err() {
            *cursor = buffer.char_idx_to_position(buffer.len_chars())?;
        }
        Ok(())
    }

    fn edited(&self) {
        self.changed.emit(self.id);
        for relay in self.relays().iter() {
            relay.emit(HostChange::Content);
        }
    }

    /// Replaces the whole text.
    pub fn set_text(&self, text: &str) {
        {
            let mut buffer = self.buffer_mut();
            buffer.set_text(text);
            if let Err(e) = self.clamp_cursor(&buffer) {
                tracing::warn!("Cursor reset after replacing text: {}", e);
                *self.cursor.write().unwrap_or_else(PoisonError::into_inner) = Position::ZERO;
            }
        }
        self.edited();
    }

    /// Inserts text at an editor position.
    pub fn insert(&self, position: EditorPosition, text: &str) -> CoreResult<()> {
        self.buffer_mut().insert_at(position.position(), text)?;
        self.edited();
        Ok(())
    }

    /// Deletes the text between two editor positions and returns it.
    pub fn delete(&self, start: EditorPosition, end: EditorPosition) -> CoreResult<String> {
        let deleted = {
            let mut buffer = self.buffer_mut();
            let from = buffer.position_to_char_idx(start.position())?;
            let to = buffer.position_to_char_idx(end.position())?;
            let deleted = buffer.delete(from..to)?;
            self.clamp_cursor(&buffer)?;
            deleted
        };
        self.edited();
        Ok(deleted)
    }

    /// Moves the cursor. Positions outside the text are rejected.
    pub fn set_cursor(&self, position: EditorPosition) -> CoreResult<()> {
        self.buffer().position_to_char_idx(position.position())?;
        *self.cursor.write().unwrap_or_else(PoisonError::into_inner) = position.position();
        Ok(())
    }

    /// Buffer revision, bumped on every edit.
    pub fn revision(&self) -> u64 {
        self.buffer().revision()
    }

    /// Subscribes to content changes of this editor.
    pub fn content_changed(&self) -> SignalReceiver<EditorId> {
        self.changed.subscribe()
    }

    /// Announces every later edit as [`HostChange::Content`] on `signal`.
    pub fn relay_to(&self, signal: &Signal<HostChange>) {
        self.relays().push(signal.clone());
    }

    /// Marks the editor as gone. Pending updates skip its blocks and its
    /// edits no longer reach the host.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.relays().clear();
    }
}

impl CodeEditor for InMemoryEditor {
    fn id(&self) -> EditorId {
        self.id
    }

    fn kind(&self) -> EditorKind {
        EditorKind::Rope
    }

    fn text(&self) -> String {
        self.buffer().text().into_owned()
    }

    fn line(&self, line: usize) -> Option<String> {
        self.buffer().line(line).ok().map(|line| line.into_owned())
    }

    fn line_count(&self) -> usize {
        self.buffer().len_lines()
    }

    fn cursor_position(&self) -> EditorPosition {
        EditorPosition(*self.cursor.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn get_range(&self, start: EditorPosition, end: EditorPosition) -> Option<String> {
        let buffer = self.buffer();
        let from = buffer.position_to_char_idx(start.position()).ok()?;
        let to = buffer.position_to_char_idx(end.position()).ok()?;
        buffer.slice(from..to).ok().map(|text| text.into_owned())
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Snapshot editor
// ============================================================================

/// A read-only editor over a fixed string, used for files read from disk
/// in batch tools.
#[derive(Debug, Clone)]
pub struct SnapshotEditor {
    id: EditorId,
    text: String,
    cursor: Position,
}

impl SnapshotEditor {
    pub fn new(text: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: EditorId::new(),
            text: text.into(),
            cursor: Position::ZERO,
        })
    }

    pub fn with_cursor(text: impl Into<String>, cursor: EditorPosition) -> Arc<Self> {
        Arc::new(Self {
            id: EditorId::new(),
            text: text.into(),
            cursor: cursor.position(),
        })
    }
}

impl CodeEditor for SnapshotEditor {
    fn id(&self) -> EditorId {
        self.id
    }

    fn kind(&self) -> EditorKind {
        EditorKind::Snapshot
    }

    fn text(&self) -> String {
        self.text.clone()
    }

    fn cursor_position(&self) -> EditorPosition {
        EditorPosition(self.cursor)
    }

    fn is_disposed(&self) -> bool {
        false
    }
}
