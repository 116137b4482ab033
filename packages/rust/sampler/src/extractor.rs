//! Reference-link extraction.
//!
//! [`HtmlReferenceExtractor`] pulls outbound citations from structural cues:
//! - links under headings such as "References" or "Bibliography"
//! - links inside reference-like lists (`<ol class="references">` etc.)
//! - links matching well-known citation networks (DOI, arXiv, PubMed, ...)
//!
//! Plain-text documents fall back to scanning for URLs after a
//! "References" line.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

/// What the sampler needs from a fetched document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedDocument {
    pub title: Option<String>,
    pub excerpt: Option<String>,
    /// Visible text, used for relevance scoring.
    pub text: String,
    /// Absolute, de-fragmented, de-duplicated reference URLs.
    pub references: Vec<String>,
}

/// Extracts title, text and outbound references from fetched content.
pub trait ReferenceExtractor: Send + Sync {
    fn extract(&self, content: &str, base_url: &Url, max_references: usize) -> ExtractedDocument;
}

static REFERENCE_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(\d+[.)]?\s*)?(references|bibliography|works cited|sources|citations|further reading|literature cited)\b",
    )
    .expect("static regex")
});

static REFERENCE_LIST_HINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(ref|biblio|citation|footnote|endnote|sources)").expect("static regex")
});

static CITATION_NETWORK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^https?://([a-z0-9-]+\.)*(doi\.org|dx\.doi\.org|arxiv\.org|pubmed\.ncbi\.nlm\.nih\.gov|ncbi\.nlm\.nih\.gov/pmc|jstor\.org|ssrn\.com|papers\.ssrn\.com|semanticscholar\.org|scholar\.google\.[a-z.]+|researchgate\.net)(/|$)|\.pdf([?#]|$)",
    )
    .expect("static regex")
});

static TEXT_REFERENCE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*(references|bibliography|works cited|sources)\s*:?\s*$")
        .expect("static regex")
});

static TEXT_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>"'\)\]]+"#).expect("static regex"));

static HEADING: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h1, h2, h3, h4, h5, h6").expect("static selector"));
static LINK: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("static selector"));
static LIST: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("ol, ul, dl, section, div").expect("static selector"));
static TITLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("title").expect("static selector"));
static H1: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h1").expect("static selector"));
static META_DESCRIPTION: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"meta[name="description"], meta[property="og:description"]"#)
        .expect("static selector")
});
static PARAGRAPH: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("p").expect("static selector"));

const EXCERPT_CHARS: usize = 300;
const MIN_EXCERPT_CHARS: usize = 40;

/// Default extractor for HTML and plain-text documents.
#[derive(Debug, Default, Clone)]
pub struct HtmlReferenceExtractor;

impl ReferenceExtractor for HtmlReferenceExtractor {
    fn extract(&self, content: &str, base_url: &Url, max_references: usize) -> ExtractedDocument {
        if looks_like_html(content) {
            extract_html(content, base_url, max_references)
        } else {
            extract_plain_text(content, base_url, max_references)
        }
    }
}

fn looks_like_html(content: &str) -> bool {
    let head: String = content.chars().take(1024).collect::<String>().to_lowercase();
    head.contains("<html") || head.contains("<!doctype html") || head.contains("<body") || content.contains("</")
}

// ---------------------------------------------------------------------------
// HTML
// ---------------------------------------------------------------------------

fn extract_html(content: &str, base_url: &Url, max_references: usize) -> ExtractedDocument {
    let doc = Html::parse_document(content);
    let mut refs = ReferenceSet::new(base_url, max_references);

    // 1. Links in the section following a reference heading.
    for heading in doc.select(&HEADING) {
        if !REFERENCE_HEADING.is_match(&element_text(&heading)) {
            continue;
        }
        for sibling in heading.next_siblings() {
            let Some(el) = ElementRef::wrap(sibling) else {
                continue;
            };
            if is_heading(&el) {
                break;
            }
            if el.value().name() == "a" {
                refs.push_href(el.value().attr("href"));
            }
            for link in el.select(&LINK) {
                refs.push_href(link.value().attr("href"));
            }
        }
    }

    // 2. Links inside reference-like containers.
    for list in doc.select(&LIST) {
        let hint = [list.value().attr("class"), list.value().attr("id")]
            .into_iter()
            .flatten()
            .any(|v| REFERENCE_LIST_HINT.is_match(v));
        if hint {
            for link in list.select(&LINK) {
                refs.push_href(link.value().attr("href"));
            }
        }
    }

    // 3. Citation-network links anywhere in the document.
    for link in doc.select(&LINK) {
        if let Some(resolved) = refs.resolve(link.value().attr("href")) {
            if CITATION_NETWORK.is_match(resolved.as_str()) {
                refs.push(resolved);
            }
        }
    }

    let title = doc
        .select(&TITLE)
        .next()
        .map(|el| element_text(&el))
        .filter(|t| !t.is_empty())
        .or_else(|| {
            doc.select(&H1)
                .next()
                .map(|el| element_text(&el))
                .filter(|t| !t.is_empty())
        });

    let excerpt = doc
        .select(&META_DESCRIPTION)
        .filter_map(|el| el.value().attr("content"))
        .map(collapse_whitespace)
        .find(|d| !d.is_empty())
        .or_else(|| {
            doc.select(&PARAGRAPH)
                .map(|p| element_text(&p))
                .find(|p| p.chars().count() >= MIN_EXCERPT_CHARS)
        })
        .map(|e| truncate_chars(&e, EXCERPT_CHARS));

    ExtractedDocument {
        title,
        excerpt,
        text: visible_text(&doc),
        references: refs.into_vec(),
    }
}

fn is_heading(el: &ElementRef<'_>) -> bool {
    matches!(el.value().name(), "h1" | "h2" | "h3" | "h4" | "h5" | "h6")
}

fn element_text(el: &ElementRef<'_>) -> String {
    collapse_whitespace(&el.text().collect::<String>())
}

/// Document text outside `<script>`, `<style>` and `<noscript>`.
fn visible_text(doc: &Html) -> String {
    let mut out = String::new();
    for node in doc.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .is_some_and(|e| matches!(e.name(), "script" | "style" | "noscript" | "template"))
        });
        if !hidden {
            let chunk = text.trim();
            if !chunk.is_empty() {
                out.push_str(chunk);
                out.push('\n');
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Plain text
// ---------------------------------------------------------------------------

fn extract_plain_text(content: &str, base_url: &Url, max_references: usize) -> ExtractedDocument {
    let mut refs = ReferenceSet::new(base_url, max_references);

    match TEXT_REFERENCE_LINE.find(content) {
        Some(heading) => {
            for m in TEXT_URL.find_iter(&content[heading.end()..]) {
                refs.push_href(Some(trim_url_punctuation(m.as_str())));
            }
        }
        None => {
            for m in TEXT_URL.find_iter(content) {
                let candidate = trim_url_punctuation(m.as_str());
                if CITATION_NETWORK.is_match(candidate) {
                    refs.push_href(Some(candidate));
                }
            }
        }
    }

    let title = content
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(|l| truncate_chars(l, 200));

    let excerpt = content
        .split("\n\n")
        .map(collapse_whitespace)
        .find(|p| p.chars().count() >= MIN_EXCERPT_CHARS)
        .map(|p| truncate_chars(&p, EXCERPT_CHARS));

    ExtractedDocument {
        title,
        excerpt,
        text: content.to_string(),
        references: refs.into_vec(),
    }
}

fn trim_url_punctuation(url: &str) -> &str {
    url.trim_end_matches(['.', ',', ';', ':'])
}

// ---------------------------------------------------------------------------
// Reference accumulation
// ---------------------------------------------------------------------------

/// Ordered, de-duplicated, capped set of absolute reference URLs.
struct ReferenceSet<'a> {
    base: &'a Url,
    self_key: String,
    max: usize,
    seen: HashSet<String>,
    out: Vec<String>,
}

impl<'a> ReferenceSet<'a> {
    fn new(base: &'a Url, max: usize) -> Self {
        Self {
            base,
            self_key: normalize_url(base),
            max,
            seen: HashSet::new(),
            out: Vec::new(),
        }
    }

    fn resolve(&self, href: Option<&str>) -> Option<Url> {
        let href = href?.trim();
        if href.is_empty()
            || href.starts_with('#')
            || href.starts_with("javascript:")
            || href.starts_with("mailto:")
            || href.starts_with("tel:")
        {
            return None;
        }
        let mut resolved = self.base.join(href).ok()?;
        if !matches!(resolved.scheme(), "http" | "https") {
            return None;
        }
        resolved.set_fragment(None);
        Some(resolved)
    }

    fn push_href(&mut self, href: Option<&str>) {
        if let Some(url) = self.resolve(href) {
            self.push(url);
        }
    }

    fn push(&mut self, url: Url) {
        if self.out.len() >= self.max {
            return;
        }
        let key = normalize_url(&url);
        if key == self.self_key || !self.seen.insert(key) {
            return;
        }
        self.out.push(url.to_string());
    }

    fn into_vec(self) -> Vec<String> {
        self.out
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Normalize a URL for deduplication (strip fragment and trailing slash).
pub fn normalize_url(url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);
    let mut s = normalized.to_string();
    // Remove trailing slash for consistency (except root path)
    if s.ends_with('/') && s.matches('/').count() > 3 {
        s.pop();
    }
    s
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", s[..idx].trim_end()),
        None => s.to_string(),
    }
}
