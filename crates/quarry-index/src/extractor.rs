//! File bytes to normalized text.
//!
//! Extractors are pluggable: an [`ExtractorSet`] asks each registered
//! [`ContentExtractor`] in order and uses the first that supports the path.

use std::path::Path;
use std::sync::LazyLock;

use pulldown_cmark::{Event, Parser, Tag, TagEnd};
use regex::Regex;

use crate::languages::{Lang, detect_language};

/// Default maximum file size: 1 MiB.
pub const DEFAULT_MAX_FILE_BYTES: u64 = 1024 * 1024;

const BINARY_SNIFF_BYTES: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("binary content")]
    Binary,

    #[error("file too large: {0} bytes")]
    TooLarge(u64),

    #[error("no extractor for {0}")]
    Unsupported(String),
}

/// Normalized document text plus what was learned about it on the way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub text: String,
    pub lang: Option<Lang>,
    pub content_type: &'static str,
}

pub trait ContentExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports(&self, path: &Path) -> bool;

    /// Convert already-decoded, line-normalized text.
    ///
    /// # Errors
    ///
    /// Returns an error if the content cannot be converted.
    fn extract(&self, path: &Path, text: &str) -> Result<String, ExtractError>;

    fn content_type(&self) -> &'static str;
}

pub struct MarkdownExtractor;

impl ContentExtractor for MarkdownExtractor {
    fn name(&self) -> &'static str {
        "markdown"
    }

    fn supports(&self, path: &Path) -> bool {
        has_extension(path, &["md", "markdown"])
    }

    fn extract(&self, _path: &Path, text: &str) -> Result<String, ExtractError> {
        let mut out = String::with_capacity(text.len());
        for event in Parser::new(text) {
            match event {
                Event::Text(t) | Event::Code(t) => out.push_str(&t),
                Event::SoftBreak | Event::HardBreak => out.push('\n'),
                Event::Start(Tag::Item) => out.push_str("- "),
                Event::End(TagEnd::Paragraph | TagEnd::Heading(_) | TagEnd::CodeBlock) => {
                    out.push_str("\n\n");
                }
                Event::End(TagEnd::Item) => out.push('\n'),
                _ => {}
            }
        }
        Ok(collapse_blank_lines(&out))
    }

    fn content_type(&self) -> &'static str {
        "text/markdown"
    }
}

static SCRIPT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script\b.*?</script\s*>").unwrap());
static STYLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<style\b.*?</style\s*>").unwrap());
static BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)</?(p|div|br|li|ul|ol|tr|table|section|article|h[1-6]|pre)\b[^>]*>").unwrap()
});
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());
static BLANK_RUN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n[ \t]*(\n[ \t]*)+\n").unwrap());

pub struct HtmlExtractor;

impl ContentExtractor for HtmlExtractor {
    fn name(&self) -> &'static str {
        "html"
    }

    fn supports(&self, path: &Path) -> bool {
        has_extension(path, &["html", "htm", "xhtml"])
    }

    fn extract(&self, _path: &Path, text: &str) -> Result<String, ExtractError> {
        Ok(html_to_text(text))
    }

    fn content_type(&self) -> &'static str {
        "text/html"
    }
}

/// Strip markup from an HTML fragment, keeping block structure as line breaks.
#[must_use]
pub fn html_to_text(html: &str) -> String {
    let text = SCRIPT_RE.replace_all(html, "");
    let text = STYLE_RE.replace_all(&text, "");
    let text = BLOCK_RE.replace_all(&text, "\n");
    let text = TAG_RE.replace_all(&text, "");
    let text = decode_entities(&text);
    collapse_blank_lines(text.trim())
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

fn collapse_blank_lines(text: &str) -> String {
    BLANK_RUN_RE.replace_all(text, "\n\n").into_owned()
}

/// Code and plain text pass through unchanged; accepts every path.
pub struct PlainTextExtractor;

impl ContentExtractor for PlainTextExtractor {
    fn name(&self) -> &'static str {
        "plain"
    }

    fn supports(&self, _path: &Path) -> bool {
        true
    }

    fn extract(&self, _path: &Path, text: &str) -> Result<String, ExtractError> {
        Ok(text.to_owned())
    }

    fn content_type(&self) -> &'static str {
        "text/plain"
    }
}

pub struct ExtractorSet {
    extractors: Vec<Box<dyn ContentExtractor>>,
    max_bytes: u64,
}

impl Default for ExtractorSet {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FILE_BYTES)
    }
}

impl ExtractorSet {
    /// Markdown, HTML, then plain text.
    #[must_use]
    pub fn new(max_bytes: u64) -> Self {
        Self {
            extractors: vec![
                Box::new(MarkdownExtractor),
                Box::new(HtmlExtractor),
                Box::new(PlainTextExtractor),
            ],
            max_bytes,
        }
    }

    /// Register an extractor ahead of the built-ins.
    pub fn register(&mut self, extractor: Box<dyn ContentExtractor>) {
        self.extractors.insert(0, extractor);
    }

    /// Decode, normalize and convert raw file bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::TooLarge`] above the size limit, [`ExtractError::Binary`] for
    /// binary content and [`ExtractError::Unsupported`] if no extractor accepts the path.
    pub fn extract(&self, path: &Path, bytes: &[u8]) -> Result<Extracted, ExtractError> {
        let len = bytes.len() as u64;
        if len > self.max_bytes {
            return Err(ExtractError::TooLarge(len));
        }
        if bytes[..bytes.len().min(BINARY_SNIFF_BYTES)].contains(&0) {
            return Err(ExtractError::Binary);
        }

        let extractor = self
            .extractors
            .iter()
            .find(|e| e.supports(path))
            .ok_or_else(|| ExtractError::Unsupported(path.display().to_string()))?;

        let decoded = String::from_utf8_lossy(bytes);
        let normalized = normalize(&decoded);
        let text = extractor.extract(path, &normalized)?;
        tracing::trace!(path = %path.display(), extractor = extractor.name(), "extracted");

        Ok(Extracted {
            text,
            lang: detect_language(path),
            content_type: extractor.content_type(),
        })
    }
}

/// Strip a BOM and convert CRLF / CR line endings to LF.
#[must_use]
pub fn normalize(text: &str) -> String {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    text.replace("\r\n", "\n").replace('\r', "\n")
}

fn has_extension(path: &Path, exts: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| exts.iter().any(|x| x.eq_ignore_ascii_case(e)))
}
