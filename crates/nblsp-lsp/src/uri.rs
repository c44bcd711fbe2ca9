//! Document and server URIs for virtual documents.
//!
//! A document the server can read from disk lives under the root URI. A
//! synthetic one (a notebook, or any foreign document) lives under the
//! virtual documents URI, where the proxy mirrors it. Servers are reached
//! at `<ws base>/lsp/<language>`.

use lsp_types::Uri;
use url::Url;

use nblsp_core::VirtualDocument;
use nblsp_core::config::ConnectionConfig;

use crate::{LspError, LspResult};

/// Resolved addresses for one virtual document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentUris {
    /// Root the document URI was joined onto
    pub base: String,

    /// LSP document URI
    pub document: Uri,

    /// Websocket URL of the language server
    pub server: String,
}

/// Joins a relative slash-separated path onto a base URL taken as a
/// directory.
pub fn join(base: &str, relative: &str) -> LspResult<Url> {
    let mut url = Url::parse(base).map_err(|e| LspError::InvalidUri(format!("{}: {}", base, e)))?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| LspError::InvalidUri(format!("{} cannot be a base", base)))?;
        segments.pop_if_empty();
        for part in relative.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    segments.pop();
                }
                part => {
                    segments.push(part);
                }
            }
        }
    }
    Ok(url)
}

/// Websocket URL of the server for `language`.
pub fn server_url(base_url: &str, language: &str) -> LspResult<String> {
    let mut url = join(base_url, &format!("lsp/{}", language))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|_| LspError::InvalidUri(format!("cannot use {} as websocket base", base_url)))?;
    Ok(url.to_string())
}

/// Resolves the document URI and server URL of `document`.
pub fn solve_uris(document: &VirtualDocument, config: &ConnectionConfig) -> LspResult<DocumentUris> {
    let base = if document.has_lsp_supported_file() {
        &config.root_uri
    } else {
        &config.virtual_documents_uri
    };

    let mut document_uri = join(base, &document.uri())?.to_string();
    // Some bases come back with an empty authority collapsed
    if document_uri.starts_with("file://") && !document_uri.starts_with("file:///") {
        document_uri = document_uri.replacen("file://", "file:///", 1);
    }

    Ok(DocumentUris {
        base: base.clone(),
        document: parse_uri(&document_uri)?,
        server: server_url(&config.base_url, document.language())?,
    })
}

pub fn parse_uri(text: &str) -> LspResult<Uri> {
    text.parse::<Uri>()
        .map_err(|e| LspError::InvalidUri(format!("{}: {}", text, e)))
}
