//! Hover with a response cache.
//!
//! Responses are cached per document version and virtual position, so
//! moving the pointer back and forth over unchanged text costs one request
//! per spot. Any change to the document drops the cache.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use nblsp_core::{RootPosition, VirtualDocument, VirtualEditor, VirtualPosition};
use nblsp_lsp::convert::{lsp_position_in, virtual_range_in};
use nblsp_lsp::lsp_types::{Hover, HoverContents, MarkedString, Uri};
use nblsp_lsp::{Feature, FeatureContext, LspConnection, LspResult};

/// A hover ready for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoverInfo {
    /// Contents flattened to one text, sections separated by blank lines
    pub text: String,

    /// Span the hover applies to, when the server named one
    pub range: Option<(RootPosition, RootPosition)>,
}

type CacheKey = (u64, VirtualPosition);

/// Hover requests for one virtual document.
pub struct HoverFeature {
    document: Arc<VirtualDocument>,
    editor: VirtualEditor,
    connection: Arc<LspConnection>,
    uri: Uri,
    cache: Mutex<HashMap<CacheKey, Option<HoverInfo>>>,
}

impl HoverFeature {
    pub fn new(context: &FeatureContext) -> Self {
        Self {
            document: context.document.clone(),
            editor: context.editor.clone(),
            connection: context.connection.clone(),
            uri: context.uri.clone(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, Option<HoverInfo>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cached_entries(&self) -> usize {
        self.cache().len()
    }

    /// Hover at a root position.
    ///
    /// Returns `Ok(None)` when the position belongs to another document,
    /// the connection is not ready, or the server has nothing to say.
    /// Failed requests are not cached.
    pub async fn hover_at(&self, position: RootPosition) -> LspResult<Option<HoverInfo>> {
        let Some((document, virtual_position)) = self.editor.locate(position) else {
            return Ok(None);
        };
        if !Arc::ptr_eq(&document, &self.document) || !self.connection.is_ready() {
            return Ok(None);
        }

        let key = (document.version(), virtual_position);
        let cached = self.cache().get(&key).cloned();
        if let Some(cached) = cached {
            return Ok(cached);
        }

        let text = document.value();
        let hover = self
            .connection
            .get_hover_tooltip(&self.uri, lsp_position_in(&text, virtual_position))
            .await?;
        let info = hover.and_then(|hover| self.hover_info(&text, hover));

        // The document may have moved on while the request was in flight
        if document.version() == key.0 {
            self.cache().insert(key, info.clone());
        }
        Ok(info)
    }

    fn hover_info(&self, text: &str, hover: Hover) -> Option<HoverInfo> {
        let text_content = flatten(hover.contents);
        if text_content.trim().is_empty() {
            return None;
        }
        let range = hover.range.and_then(|range| {
            let (start, end) = virtual_range_in(text, range);
            Some((
                self.document.virtual_to_root(start)?,
                self.document.virtual_to_root(end)?,
            ))
        });
        Some(HoverInfo {
            text: text_content,
            range,
        })
    }
}

fn marked_text(marked: MarkedString) -> String {
    match marked {
        MarkedString::String(text) => text,
        MarkedString::LanguageString(code) => format!("```{}\n{}\n```", code.language, code.value),
    }
}

fn flatten(contents: HoverContents) -> String {
    match contents {
        HoverContents::Scalar(marked) => marked_text(marked),
        HoverContents::Array(parts) => parts
            .into_iter()
            .map(marked_text)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n"),
        HoverContents::Markup(markup) => markup.value,
    }
}

impl Feature for HoverFeature {
    fn id(&self) -> &str {
        crate::HOVER
    }

    fn document_changed(&self, _document: &Arc<VirtualDocument>) {
        self.cache().clear();
    }

    fn dispose(&self) {
        self.cache().clear();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::connect;
    use nblsp_core::{Config, FileHost};
    use nblsp_lsp::lsp_types::{LanguageString, MarkupContent, MarkupKind};
    use nblsp_lsp::{LspError, ScriptedServer};
    use std::time::Duration;

    #[test]
    fn test_flatten_joins_sections() {
        let contents = HoverContents::Array(vec![
            MarkedString::LanguageString(LanguageString {
                language: "python".to_string(),
                value: "x: int".to_string(),
            }),
            MarkedString::String("The answer".to_string()),
        ]);
        assert_eq!(flatten(contents), "```python\nx: int\n```\n\nThe answer");

        let markup = HoverContents::Markup(MarkupContent {
            kind: MarkupKind::Markdown,
            value: "**x**".to_string(),
        });
        assert_eq!(flatten(markup), "**x**");
    }

    #[tokio::test]
    async fn test_hover_is_cached_per_position() {
        let host = FileHost::new("a.py", "python", "py", "value = 1\n");
        let server = ScriptedServer::new().with_hover("value: int");

        let (_adapter, editor_adapter) = connect(host, server.clone(), Config::default()).await;
        let hover = editor_adapter.feature::<HoverFeature>().unwrap();

        let first = hover.hover_at(RootPosition::new(0, 2)).await.unwrap().unwrap();
        let again = hover.hover_at(RootPosition::new(0, 2)).await.unwrap().unwrap();
        hover.hover_at(RootPosition::new(0, 8)).await.unwrap();

        assert_eq!(first.text, "value: int");
        assert_eq!(first, again);
        assert_eq!(server.requests("textDocument/hover").len(), 2);
        assert_eq!(hover.cached_entries(), 2);
    }

    #[tokio::test]
    async fn test_change_drops_cache() {
        let host = FileHost::new("a.py", "python", "py", "value = 1\n");
        let server = ScriptedServer::new().with_hover("value: int");

        let (_adapter, editor_adapter) = connect(host.clone(), server.clone(), Config::default()).await;
        let hover = editor_adapter.feature::<HoverFeature>().unwrap();
        hover.hover_at(RootPosition::new(0, 2)).await.unwrap();
        assert_eq!(hover.cached_entries(), 1);

        host.set_text("value = 2\n");
        server
            .wait_for_notifications("textDocument/didChange", 1, Duration::from_secs(5))
            .await;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while hover.cached_entries() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(hover.cached_entries(), 0);
        hover.hover_at(RootPosition::new(0, 2)).await.unwrap();
        assert_eq!(server.requests("textDocument/hover").len(), 2);
    }

    #[tokio::test]
    async fn test_timeout_is_not_cached() {
        let mut config = Config::default();
        config.connection.request_timeout_secs = 1;
        let host = FileHost::new("a.py", "python", "py", "value = 1\n");
        let server = ScriptedServer::new()
            .with_hover("value: int")
            .with_hover_delay(Duration::from_secs(3));

        let (_adapter, editor_adapter) = connect(host, server, config).await;
        let hover = editor_adapter.feature::<HoverFeature>().unwrap();

        let result = hover.hover_at(RootPosition::new(0, 2)).await;

        assert!(matches!(result, Err(LspError::Timeout { .. })));
        assert_eq!(hover.cached_entries(), 0);
    }
}
