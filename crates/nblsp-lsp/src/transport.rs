//! Message transports.
//!
//! A connection does not care whether messages travel over a websocket, a
//! child process's stdio or an in-memory channel. It sees a [`Transport`]:
//! a sink for outgoing JSON text and a stream of incoming JSON text, opened
//! by a [`TransportConnector`].
//!
//! ## Learning: Close Codes
//!
//! Closures carry a websocket-style status code. `1005` (no status) means
//! the server side refused the language outright and retrying is
//! pointless; `1006` (abnormal) is a dropped link that may come back.

use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use nblsp_core::config::Config;

use crate::protocol;

/// Terminal: the language is not served and never will be.
pub const CLOSE_NO_STATUS: u16 = 1005;

/// Transient: the link dropped.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Transport-level failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Connection closed with code {code}: {reason}")]
    Closed { code: u16, reason: String },

    #[error("IO error: {0}")]
    Io(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    pub fn closed(code: u16, reason: impl Into<String>) -> Self {
        TransportError::Closed {
            code,
            reason: reason.into(),
        }
    }

    /// A terminal closure must not be retried.
    pub fn is_terminal(&self) -> bool {
        self.code() == Some(CLOSE_NO_STATUS)
    }

    pub fn code(&self) -> Option<u16> {
        match self {
            TransportError::Closed { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        TransportError::Io(error.to_string())
    }
}

/// Where a connection goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub language: String,

    /// Server URL, e.g. `ws://localhost:8888/lsp/python`
    pub url: String,
}

/// Outgoing half of a transport.
#[async_trait]
pub trait MessageSink: Send {
    async fn send(&mut self, message: String) -> Result<(), TransportError>;

    /// Closes the outgoing direction.
    async fn close(&mut self);
}

/// Incoming half of a transport.
#[async_trait]
pub trait MessageStream: Send {
    /// Next message, or `None` once the peer has gone.
    async fn next(&mut self) -> Option<Result<String, TransportError>>;
}

/// An open, bidirectional message channel.
pub struct Transport {
    pub sink: Box<dyn MessageSink>,
    pub stream: Box<dyn MessageStream>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Opens transports to endpoints.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn open(&self, endpoint: &Endpoint) -> Result<Transport, TransportError>;
}

// ============================================================================
// Stdio
// ============================================================================

/// Command line for one language server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCommand {
    pub command: String,
    pub args: Vec<String>,
}

/// Spawns a language server process per transport.
#[derive(Debug, Clone, Default)]
pub struct StdioConnector {
    commands: HashMap<String, ServerCommand>,
}

impl StdioConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands for every configured language that has one.
    pub fn from_config(config: &Config) -> Self {
        let mut connector = Self::new();
        for language in config.known_languages() {
            let settings = config.language(&language);
            if let Some(command) = settings.command {
                connector.register(language, command, settings.args);
            }
        }
        connector
    }

    pub fn register(&mut self, language: impl Into<String>, command: impl Into<String>, args: Vec<String>) {
        self.commands.insert(
            language.into(),
            ServerCommand {
                command: command.into(),
                args,
            },
        );
    }

    pub fn command(&self, language: &str) -> Option<&ServerCommand> {
        self.commands.get(language)
    }
}

#[async_trait]
impl TransportConnector for StdioConnector {
    async fn open(&self, endpoint: &Endpoint) -> Result<Transport, TransportError> {
        let Some(server) = self.commands.get(&endpoint.language) else {
            return Err(TransportError::closed(
                CLOSE_NO_STATUS,
                format!("no language server configured for {}", endpoint.language),
            ));
        };

        tracing::info!("Starting {} server: {} {:?}", endpoint.language, server.command, server.args);
        let mut child = Command::new(&server.command)
            .args(&server.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    TransportError::closed(
                        CLOSE_NO_STATUS,
                        format!("{} not found", server.command),
                    )
                } else {
                    TransportError::from(e)
                }
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Io("server stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Io("server stdout unavailable".to_string()))?;

        Ok(Transport {
            sink: Box::new(StdioSink { stdin }),
            stream: Box::new(StdioStream {
                reader: BufReader::new(stdout),
                _child: child,
            }),
        })
    }
}

struct StdioSink {
    stdin: ChildStdin,
}

#[async_trait]
impl MessageSink for StdioSink {
    async fn send(&mut self, message: String) -> Result<(), TransportError> {
        protocol::write_frame(&mut self.stdin, &message).await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.stdin.shutdown().await;
    }
}

struct StdioStream {
    reader: BufReader<ChildStdout>,
    // Killed when the stream is dropped
    _child: Child,
}

#[async_trait]
impl MessageStream for StdioStream {
    async fn next(&mut self) -> Option<Result<String, TransportError>> {
        match protocol::read_frame(&mut self.reader).await {
            Ok(Some(message)) => Some(Ok(message)),
            Ok(None) => None,
            Err(e) => Some(Err(TransportError::Protocol(e.to_string()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_codes() {
        assert!(TransportError::closed(CLOSE_NO_STATUS, "gone").is_terminal());
        assert!(!TransportError::closed(CLOSE_ABNORMAL, "dropped").is_terminal());
        assert!(!TransportError::Io("broken pipe".into()).is_terminal());
    }

    #[test]
    fn test_stdio_connector_from_default_config() {
        let connector = StdioConnector::from_config(&Config::default());
        assert_eq!(connector.command("python").map(|c| c.command.as_str()), Some("pylsp"));
        // markdown has no server configured
        assert!(connector.command("markdown").is_none());
    }

    #[tokio::test]
    async fn test_unserved_language_is_terminal() {
        let connector = StdioConnector::new();
        let endpoint = Endpoint {
            language: "cobol".to_string(),
            url: "ws://localhost/lsp/cobol".to_string(),
        };
        let error = connector.open(&endpoint).await.unwrap_err();
        assert!(error.is_terminal());
    }

    #[tokio::test]
    async fn test_missing_binary_is_terminal() {
        let mut connector = StdioConnector::new();
        connector.register("python", "nblsp-no-such-server-binary", vec![]);
        let endpoint = Endpoint {
            language: "python".to_string(),
            url: "ws://localhost/lsp/python".to_string(),
        };
        let error = connector.open(&endpoint).await.unwrap_err();
        assert!(error.is_terminal());
    }
}
