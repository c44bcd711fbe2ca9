//! # nblsp LSP
//!
//! Language Server Protocol client for virtual documents.
//!
//! ## What lives here?
//!
//! - [`transport`]: how bytes reach a server (stdio process, in-memory pair)
//! - [`connection`]: one JSON-RPC session with one server
//! - [`pool`]: at most one live connection per language
//! - [`manager`]: maps virtual documents onto pooled connections, retries
//! - [`adapter`]: glues a host document, its virtual documents and features
//!
//! ## Learning: JSON-RPC
//!
//! LSP uses JSON-RPC 2.0 for communication:
//! ```json
//! // Request
//! {"jsonrpc": "2.0", "id": 1, "method": "textDocument/hover", "params": {...}}
//!
//! // Response
//! {"jsonrpc": "2.0", "id": 1, "result": {...}}
//!
//! // Notification (no id, no response)
//! {"jsonrpc": "2.0", "method": "textDocument/didOpen", "params": {...}}
//! ```

pub mod adapter;
pub mod connection;
pub mod convert;
pub mod feature;
pub mod manager;
pub mod memory;
pub mod pool;
pub mod protocol;
pub mod transport;
pub mod uri;

pub use adapter::{DocumentStatus, EditorAdapter, WidgetAdapter};
pub use connection::{
    ConnectionOptions, ConnectionState, DocumentInfo, LspConnection, ServerNotification,
};
pub use feature::{Feature, FeatureContext, FeatureFactory, FeatureRegistry};
pub use manager::{ConnectOptions, ConnectionEvent, ConnectionManager};
pub use memory::{MemoryConnector, MemoryPeer, ScriptedServer};
pub use pool::ConnectionPool;
pub use transport::{
    CLOSE_ABNORMAL, CLOSE_NO_STATUS, Endpoint, StdioConnector, Transport, TransportConnector,
    TransportError,
};
pub use uri::{DocumentUris, solve_uris};

// Re-export LSP types
pub use lsp_types;

use std::time::Duration;

/// Result type for LSP operations
pub type LspResult<T> = Result<T, LspError>;

/// LSP client errors.
#[derive(Debug, thiserror::Error)]
pub enum LspError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Request {method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("Server error {code}: {message}")]
    Server { code: i64, message: String },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Core error: {0}")]
    Core(#[from] nblsp_core::CoreError),
}

impl LspError {
    /// Whether the error is a terminal transport closure.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LspError::Transport(error) if error.is_terminal())
    }
}
