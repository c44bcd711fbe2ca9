//! Foreign code extraction.
//!
//! A host block can embed code in another language: a fenced python block in
//! markdown, a `%%bash` cell magic in python. Extractors find those spans;
//! the registry blanks them out of the host text and hands them to the
//! virtual document as fragments.
//!
//! ## Learning: Keeping Positions Stable
//!
//! The host language server reports diagnostics against the text it was
//! sent. If extraction removed lines, every position after the span would be
//! wrong. Blanking (replacing each character with a space, keeping newlines)
//! keeps the host text aligned with the original line for line and column
//! for column.

use nblsp_buffer::{Position, text};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

/// Errors raised while building or running an extractor.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("Invalid pattern for {language} extractor: {source}")]
    InvalidPattern {
        language: String,
        #[source]
        source: regex::Error,
    },

    #[error("Extractor {name} failed: {reason}")]
    Failed { name: String, reason: String },
}

/// A span of foreign code found in a host block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignFragment {
    /// Language of the extracted code
    pub language: String,

    /// File extension used for the foreign document's URI
    pub file_extension: String,

    /// Whether every fragment gets its own document
    pub standalone: bool,

    /// The extracted code
    pub text: String,

    /// Byte span in the host block
    pub span: Range<usize>,

    /// Host position of the fragment's first character
    pub start: Position,

    /// Host position just past the fragment's last character
    pub end: Position,
}

impl ForeignFragment {
    /// Builds a fragment from a byte span of `host`.
    pub fn from_span(
        host: &str,
        span: Range<usize>,
        language: impl Into<String>,
        file_extension: impl Into<String>,
        standalone: bool,
    ) -> Self {
        Self {
            language: language.into(),
            file_extension: file_extension.into(),
            standalone,
            text: host[span.clone()].to_string(),
            start: text::position_at_offset(host, span.start),
            end: text::position_at_offset(host, span.end),
            span,
        }
    }

    fn overlaps(&self, other: &ForeignFragment) -> bool {
        self.span.start < other.span.end && other.span.start < self.span.end
    }
}

/// Finds foreign code in a host block.
pub trait ForeignCodeExtractor: Send + Sync + std::fmt::Debug {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Cheap pre-check before running [`ForeignCodeExtractor::extract`].
    fn has_foreign_code(&self, code: &str) -> bool;

    fn extract(&self, code: &str) -> Result<Vec<ForeignFragment>, ExtractError>;
}

// ============================================================================
// Regular expression extractor
// ============================================================================

/// Settings for a [`RegExpExtractor`], also the shape of `[[extractors]]`
/// entries in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegExpExtractorOptions {
    /// Host language the extractor applies to
    pub host_language: String,

    /// Language of the extracted code
    pub language: String,

    pub pattern: String,

    /// Capture groups holding the foreign code; the last non-empty one wins
    #[serde(default = "default_capture_groups")]
    pub capture_groups: Vec<usize>,

    #[serde(default)]
    pub standalone: bool,

    pub file_extension: String,
}

fn default_capture_groups() -> Vec<usize> {
    vec![1]
}

/// Extracts the capture groups of a regular expression.
#[derive(Debug)]
pub struct RegExpExtractor {
    name: String,
    options: RegExpExtractorOptions,
    pattern: Regex,
}

impl RegExpExtractor {
    pub fn new(options: RegExpExtractorOptions) -> Result<Self, ExtractError> {
        let pattern =
            Regex::new(&options.pattern).map_err(|source| ExtractError::InvalidPattern {
                language: options.language.clone(),
                source,
            })?;
        Ok(Self {
            name: format!("{}-in-{}", options.language, options.host_language),
            options,
            pattern,
        })
    }

    pub fn options(&self) -> &RegExpExtractorOptions {
        &self.options
    }
}

impl ForeignCodeExtractor for RegExpExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_foreign_code(&self, code: &str) -> bool {
        self.pattern.is_match(code)
    }

    fn extract(&self, code: &str) -> Result<Vec<ForeignFragment>, ExtractError> {
        let mut fragments = Vec::new();
        for captures in self.pattern.captures_iter(code) {
            let found = self
                .options
                .capture_groups
                .iter()
                .rev()
                .find_map(|&group| captures.get(group).filter(|m| !m.as_str().is_empty()));
            let Some(found) = found else {
                continue;
            };
            fragments.push(ForeignFragment::from_span(
                code,
                found.range(),
                &self.options.language,
                &self.options.file_extension,
                self.options.standalone,
            ));
        }
        Ok(fragments)
    }
}

// ============================================================================
// Fenced code extractor
// ============================================================================

/// Extracts markdown fenced code blocks, taking the language from the
/// fence's info string.
#[derive(Debug)]
pub struct FencedCodeExtractor {
    pattern: Regex,
    extensions: HashMap<String, String>,
}

impl FencedCodeExtractor {
    /// `extensions` maps a language to the file extension of its documents.
    pub fn new(extensions: HashMap<String, String>) -> Result<Self, ExtractError> {
        let pattern = Regex::new(FENCE_PATTERN).map_err(|source| ExtractError::InvalidPattern {
            language: "markdown".to_string(),
            source,
        })?;
        Ok(Self {
            pattern,
            extensions,
        })
    }

    fn normalize_language(info: &str) -> String {
        let language = info.to_lowercase();
        match language.as_str() {
            "py" | "python3" | "ipython" => "python".to_string(),
            "js" => "javascript".to_string(),
            "ts" => "typescript".to_string(),
            "sh" | "bash" | "zsh" => "shell".to_string(),
            "md" => "markdown".to_string(),
            _ => language,
        }
    }
}

/// Opening fence with an info string, body, closing fence on its own line.
const FENCE_PATTERN: &str = r"(?ms)^```[ \t]*([A-Za-z0-9_+#.-]+)[^\n]*\n(.*?)\n```[ \t]*$";

impl ForeignCodeExtractor for FencedCodeExtractor {
    fn name(&self) -> &str {
        "fenced-code"
    }

    fn has_foreign_code(&self, code: &str) -> bool {
        code.contains("```")
    }

    fn extract(&self, code: &str) -> Result<Vec<ForeignFragment>, ExtractError> {
        let mut fragments = Vec::new();
        for captures in self.pattern.captures_iter(code) {
            let (Some(info), Some(body)) = (captures.get(1), captures.get(2)) else {
                continue;
            };
            if body.as_str().is_empty() {
                continue;
            }
            let language = Self::normalize_language(info.as_str());
            let extension = self
                .extensions
                .get(&language)
                .cloned()
                .unwrap_or_else(|| language.clone());
            fragments.push(ForeignFragment::from_span(
                code,
                body.range(),
                language,
                extension,
                false,
            ));
        }
        Ok(fragments)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Result of running every extractor of a host language over one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    /// Host text with foreign spans blanked
    pub host_text: String,

    /// Accepted fragments in text order
    pub fragments: Vec<ForeignFragment>,
}

/// Extractors keyed by host language, plus the language to file extension
/// table used when a whole block is routed to a foreign document.
#[derive(Debug, Default)]
pub struct ExtractorRegistry {
    extractors: HashMap<String, Vec<Arc<dyn ForeignCodeExtractor>>>,
    extensions: HashMap<String, String>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an extractor. Earlier registrations win on overlap.
    pub fn register(&mut self, host_language: &str, extractor: Arc<dyn ForeignCodeExtractor>) {
        tracing::debug!("Registering extractor {} for {}", extractor.name(), host_language);
        self.extractors
            .entry(host_language.to_string())
            .or_default()
            .push(extractor);
    }

    pub fn set_file_extension(&mut self, language: &str, extension: &str) {
        self.extensions
            .insert(language.to_string(), extension.to_string());
    }

    /// File extension for documents of `language`, the language itself if
    /// none is known.
    pub fn file_extension(&self, language: &str) -> String {
        self.extensions
            .get(language)
            .cloned()
            .unwrap_or_else(|| language.to_string())
    }

    pub fn extractors_for(&self, host_language: &str) -> &[Arc<dyn ForeignCodeExtractor>] {
        self.extractors
            .get(host_language)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Runs all extractors of `host_language` over `code`.
    ///
    /// A failing extractor contributes nothing; the block is still
    /// processed by the others.
    pub fn extract(&self, host_language: &str, code: &str) -> Extraction {
        let mut accepted: Vec<ForeignFragment> = Vec::new();

        for extractor in self.extractors_for(host_language) {
            if !extractor.has_foreign_code(code) {
                continue;
            }
            let fragments = match extractor.extract(code) {
                Ok(fragments) => fragments,
                Err(e) => {
                    tracing::warn!("Extractor {} failed, ignoring: {}", extractor.name(), e);
                    continue;
                }
            };
            for fragment in fragments {
                if let Some(existing) = accepted.iter().find(|a| a.overlaps(&fragment)) {
                    tracing::warn!(
                        "Extractor {} produced a {} fragment at {} overlapping a {} fragment, dropping it",
                        extractor.name(),
                        fragment.language,
                        fragment.start,
                        existing.language
                    );
                    continue;
                }
                accepted.push(fragment);
            }
        }

        accepted.sort_by_key(|fragment| fragment.span.start);
        let host_text = accepted
            .iter()
            .fold(code.to_string(), |host, fragment| {
                text::blank_span(&host, fragment.span.clone())
            });

        Extraction {
            host_text,
            fragments: accepted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn bash_magic() -> RegExpExtractor {
        RegExpExtractor::new(RegExpExtractorOptions {
            host_language: "python".into(),
            language: "shell".into(),
            pattern: r"(?s)\A%%(?:bash|sh)[^\n]*\n(.*)".into(),
            capture_groups: vec![1],
            standalone: true,
            file_extension: "sh".into(),
        })
        .unwrap()
    }

    #[derive(Debug)]
    struct Broken;

    impl ForeignCodeExtractor for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        fn has_foreign_code(&self, _code: &str) -> bool {
            true
        }
        fn extract(&self, _code: &str) -> Result<Vec<ForeignFragment>, ExtractError> {
            Err(ExtractError::Failed {
                name: "broken".into(),
                reason: "always".into(),
            })
        }
    }

    #[test]
    fn test_regexp_extractor_takes_capture_group() {
        let code = "%%bash\nls -la\necho hi";
        let fragments = bash_magic().extract(code).unwrap();

        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].text, "ls -la\necho hi");
        assert_eq!(fragments[0].start, Position::new(1, 0));
        assert_eq!(fragments[0].end, Position::new(2, 7));
        assert!(fragments[0].standalone);
    }

    #[test]
    fn test_invalid_pattern_is_reported() {
        let err = RegExpExtractor::new(RegExpExtractorOptions {
            host_language: "python".into(),
            language: "sql".into(),
            pattern: "(".into(),
            capture_groups: vec![1],
            standalone: false,
            file_extension: "sql".into(),
        })
        .unwrap_err();
        assert!(matches!(err, ExtractError::InvalidPattern { .. }));
    }

    #[test]
    fn test_fenced_code_language_from_info_string() {
        let extractor = FencedCodeExtractor::new(HashMap::from([("python".into(), "py".into())])).unwrap();
        let code = "# Title\n```py\nimport os\nos.getcwd()\n```\ntext";
        let fragments = extractor.extract(code).unwrap();

        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].language, "python");
        assert_eq!(fragments[0].file_extension, "py");
        assert_eq!(fragments[0].text, "import os\nos.getcwd()");
        assert_eq!(fragments[0].start, Position::new(2, 0));
    }

    #[test]
    fn test_registry_blanks_fragment_and_keeps_lines() {
        let mut registry = ExtractorRegistry::new();
        registry.register(
            "markdown",
            Arc::new(FencedCodeExtractor::new(HashMap::new()).unwrap()),
        );
        let code = "intro\n```python\nx = 1\n```";
        let extraction = registry.extract("markdown", code);

        assert_eq!(extraction.host_text, "intro\n```python\n     \n```");
        assert_eq!(extraction.fragments.len(), 1);
        assert_eq!(text::line_count(&extraction.host_text), text::line_count(code));
    }

    #[test]
    fn test_overlap_first_registered_wins() {
        let mut registry = ExtractorRegistry::new();
        registry.register("python", Arc::new(bash_magic()));
        let everything = RegExpExtractor::new(RegExpExtractorOptions {
            host_language: "python".into(),
            language: "text".into(),
            pattern: r"(?s)(.+)".into(),
            capture_groups: vec![1],
            standalone: false,
            file_extension: "txt".into(),
        })
        .unwrap();
        registry.register("python", Arc::new(everything));

        let extraction = registry.extract("python", "%%sh\necho 1");
        assert_eq!(extraction.fragments.len(), 1);
        assert_eq!(extraction.fragments[0].language, "shell");
    }

    #[test]
    fn test_failing_extractor_means_no_foreign_content() {
        let mut registry = ExtractorRegistry::new();
        registry.register("python", Arc::new(Broken));

        let extraction = registry.extract("python", "x = 1");
        assert_eq!(extraction.host_text, "x = 1");
        assert!(extraction.fragments.is_empty());
    }

    #[test]
    fn test_unknown_host_language_passes_through() {
        let registry = ExtractorRegistry::new();
        let extraction = registry.extract("julia", "x = 1");
        assert_eq!(extraction.host_text, "x = 1");
        assert_eq!(registry.file_extension("julia"), "julia");
    }

    proptest! {
        #[test]
        fn extraction_preserves_line_count(
            before in "[a-z =\\n]{0,30}",
            body in "[a-z =()\\n]{1,30}",
            after in "[a-z =\\n]{0,30}",
        ) {
            let mut registry = ExtractorRegistry::new();
            registry.register("markdown", Arc::new(FencedCodeExtractor::new(HashMap::new()).unwrap()));
            let code = format!("{before}\n```python\n{body}\n```\n{after}");

            let extraction = registry.extract("markdown", &code);
            prop_assert_eq!(
                text::line_count(&extraction.host_text),
                text::line_count(&code)
            );
            prop_assert_eq!(extraction.host_text.len(), code.len());
        }
    }
}
