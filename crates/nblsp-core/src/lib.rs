//! # nblsp Core
//!
//! The document model that sits between host documents (files, notebooks)
//! and language servers.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  HostDocument (file / notebook)           │
//! │   cell 1 editor      cell 2 editor      cell 3 editor     │
//! └──────────┬──────────────────┬──────────────────┬─────────┘
//!            │ blocks           │                  │
//!     ┌──────┴──────────────────┴──────────────────┴──────┐
//!     │                   UpdateManager                    │
//!     │  (one rebuild at a time, extraction per block)     │
//!     └──────────────────────┬─────────────────────────────┘
//!                            │
//!     ┌──────────────────────┴─────────────────────────────┐
//!     │          VirtualDocument (root, e.g. python)        │
//!     │   ┌────────────────────┐  ┌────────────────────┐    │
//!     │   │ foreign: markdown  │  │ foreign: shell-0   │    │
//!     │   └────────────────────┘  └────────────────────┘    │
//!     └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Learning: Module Organization
//!
//! Each concern lives in its own module and the crate root re-exports the
//! types callers need, so downstream crates write `nblsp_core::VirtualDocument`
//! instead of reaching into submodules.

pub mod block;
pub mod config;
pub mod editor;
pub mod extractor;
pub mod host;
pub mod signal;
pub mod update_manager;
pub mod virtual_document;
pub mod virtual_editor;

pub use block::{BlockInput, CodeBlock};
pub use config::Config;
pub use editor::{CodeEditor, EditorId, EditorKind, EditorRef, InMemoryEditor, SnapshotEditor};
pub use extractor::{
    Extraction, ExtractorRegistry, FencedCodeExtractor, ForeignCodeExtractor, ForeignFragment,
    RegExpExtractor,
};
pub use host::{FileHost, HostDocument, NotebookHost};
pub use signal::{Signal, SignalReceiver};
pub use update_manager::UpdateManager;
pub use virtual_document::{
    DocumentChanged, ForeignDocumentEvent, ForeignKey, VirtualDocument, VirtualDocumentOptions,
};
pub use virtual_editor::{Token, VirtualEditor};

pub use nblsp_buffer::{EditorPosition, Position, RootPosition, SourcePosition, VirtualPosition};

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in core operations
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Document disposed: {0}")]
    Disposed(String),

    #[error("Cell index out of range: {0}")]
    CellOutOfRange(usize),

    #[error("Invalid notebook: {0}")]
    InvalidNotebook(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Buffer error: {0}")]
    Buffer(#[from] nblsp_buffer::BufferError),

    #[error("Extractor error: {0}")]
    Extract(#[from] extractor::ExtractError),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),
}
