//! JSON-RPC 2.0 messages and `Content-Length` framing.
//!
//! Transports move whole messages as JSON text. Byte-stream transports
//! (stdio) wrap each message in a header block:
//!
//! ```text
//! Content-Length: 52\r\n
//! \r\n
//! {"jsonrpc":"2.0","method":"initialized","params":{}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const REQUEST_CANCELLED: i64 = -32800;

/// Errors decoding a message.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Missing Content-Length header")]
    MissingLength,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Request ids may be numbers or strings on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(id) => write!(f, "{}", id),
            RequestId::String(id) => write!(f, "{:?}", id),
        }
    }
}

/// The `error` member of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: METHOD_NOT_FOUND,
            message: format!("Unhandled method {}", method),
            data: None,
        }
    }
}

/// One JSON-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: RequestId,
        method: String,
        params: Value,
    },
    Response {
        id: RequestId,
        result: Result<Value, ResponseError>,
    },
    Notification {
        method: String,
        params: Value,
    },
}

/// Wire shape shared by all message kinds.
#[derive(Debug, Default, Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<RequestId>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ResponseError>,
}

impl Message {
    pub fn request(id: i64, method: impl Into<String>, params: Value) -> Self {
        Message::Request {
            id: RequestId::Number(id),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Message::Notification {
            method: method.into(),
            params,
        }
    }

    pub fn response(id: RequestId, result: Result<Value, ResponseError>) -> Self {
        Message::Response { id, result }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request { method, .. } | Message::Notification { method, .. } => {
                Some(method)
            }
            Message::Response { .. } => None,
        }
    }

    /// Parses one message from JSON text.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawMessage = serde_json::from_str(text)?;
        let params = raw.params.unwrap_or(Value::Null);

        match (raw.id, raw.method) {
            (Some(id), Some(method)) => Ok(Message::Request { id, method, params }),
            (None, Some(method)) => Ok(Message::Notification { method, params }),
            (Some(id), None) => {
                let result = match raw.error {
                    Some(error) => Err(error),
                    // A missing result means null
                    None => Ok(raw.result.unwrap_or(Value::Null)),
                };
                Ok(Message::Response { id, result })
            }
            (None, None) => Err(ProtocolError::Malformed(
                "message has neither id nor method".to_string(),
            )),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Message::Request { id, method, params } => json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
                "params": params,
            }),
            Message::Notification { method, params } => json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params,
            }),
            Message::Response { id, result: Ok(result) } => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": result,
            }),
            Message::Response { id, result: Err(error) } => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": error,
            }),
        }
    }

    pub fn to_text(&self) -> String {
        self.to_value().to_string()
    }
}

// ============================================================================
// Framing
// ============================================================================

/// Writes one framed message.
pub async fn write_frame<W>(writer: &mut W, body: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(body.as_bytes()).await?;
    writer.flush().await
}

/// Reads one framed message. Returns `Ok(None)` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<String>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }

        let header = line.trim_end();
        if header.is_empty() {
            if content_length.is_some() {
                break;
            }
            // Stray blank line between messages
            continue;
        }

        if let Some((name, value)) = header.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                let length = value.trim().parse::<usize>().map_err(|_| {
                    ProtocolError::Malformed(format!("bad Content-Length: {}", value.trim()))
                })?;
                content_length = Some(length);
            }
        }
    }

    let length = content_length.ok_or(ProtocolError::MissingLength)?;
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    String::from_utf8(body)
        .map(Some)
        .map_err(|e| ProtocolError::Malformed(e.to_string()))
}
