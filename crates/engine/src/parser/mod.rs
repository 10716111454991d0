// ABOUTME: Per-source page parser: search, book detail, chapter list and chapter content operations.
// ABOUTME: Fetching is async; HTML parsing happens in sync helpers so no parsed document lives across an await.

//! Page parsing.
//!
//! A [`SourceParser`] binds one [`SourceDefinition`] to the shared fetcher.
//! Each operation fetches one or two pages and runs the definition's rules over
//! them. Missing rules fail fast with a `Config` error; a list item whose rules
//! yield nothing is skipped; a single entity that yields nothing is a `Parse`
//! error.

pub mod cache;

use std::collections::BTreeMap;
use std::sync::Arc;

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use once_cell::sync::Lazy;
use percent_encoding::{utf8_percent_encode, percent_encode, AsciiSet, NON_ALPHANUMERIC};
use regex::Regex;
use scraper::Selector;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EngineError, Stage};
use crate::resource::{is_loopback_or_null_host, Fetcher};
use crate::selector::{self, text, Page};
use crate::source::patches::{apply_all, canonical_placeholders, PatchContext};
use crate::source::SourceDefinition;
use crate::urls;

/// Characters left unescaped by `encodeURIComponent`.
const KEYWORD_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Stands in for the keyword while a search URL template is resolved.
const KEYWORD_SLOT: &str = "shelfkeywordslot";

/// Anchor texts that usually point from a detail page to the full chapter list.
const CHAPTER_LIST_ANCHORS: &[&str] = &[
    "全部章节",
    "章节目录",
    "查看目录",
    "完整目录",
    "查看全部",
    "点击阅读",
    "all chapters",
    "table of contents",
];

static CHAPTER_ANCHOR_MATCHER: Lazy<AhoCorasick> = Lazy::new(|| {
    AhoCorasickBuilder::new()
        .ascii_case_insensitive(true)
        .match_kind(MatchKind::LeftmostFirst)
        .build(CHAPTER_LIST_ANCHORS)
        .expect("static anchor patterns are valid")
});

static ANCHOR_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a[href]").expect("static selector is valid"));

static AUTHOR_PREFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(作\s*者|author)\s*[:：]\s*").unwrap());

/// Default chapter rules for definitions that only name the list.
const DEFAULT_CHAPTER_NAME_RULE: &str = "a@text||@text";
const DEFAULT_CHAPTER_LINK_RULE: &str = "a@href||@href";

/// One book found by a search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub source_name: String,
    pub name: String,
    #[serde(default)]
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intro: Option<String>,
    pub book_url: String,
}

/// Book metadata from a detail page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookDetail {
    pub source_name: String,
    pub url: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intro: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    /// Chapter list page; the detail page itself when no rule points elsewhere.
    pub chapter_url: String,
}

/// One entry in a chapter list. Indices are contiguous from zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub index: usize,
    pub name: String,
    pub url: String,
}

/// Extracted chapter text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterContent {
    pub url: String,
    pub text: String,
    /// Filters that changed the text, in application order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applied_filters: Vec<String>,
}

/// Engine-level settings every parser shares.
#[derive(Debug, Clone, Default)]
pub struct ParserSettings {
    pub allow_loopback: bool,
    pub domain_aliases: Arc<BTreeMap<String, String>>,
}

/// Binds one source definition to the shared fetcher.
pub struct SourceParser {
    def: SourceDefinition,
    fetcher: Arc<Fetcher>,
    settings: ParserSettings,
}

impl SourceParser {
    pub fn new(def: SourceDefinition, fetcher: Arc<Fetcher>, settings: ParserSettings) -> Self {
        Self {
            def,
            fetcher,
            settings,
        }
    }

    pub fn definition(&self) -> &SourceDefinition {
        &self.def
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    /// Searches the source for `keyword`.
    ///
    /// When any result matches exactly (case-insensitive name equality, or the
    /// keyword appearing in the author), only those are returned.
    pub async fn search(&self, keyword: &str) -> Result<Vec<SearchResult>, EngineError> {
        let mut def = self.def.clone();
        apply_all(
            &mut def,
            PatchContext {
                domain_aliases: &self.settings.domain_aliases,
            },
        );

        let template = def
            .search
            .url
            .as_deref()
            .ok_or_else(|| self.missing_rule(Stage::Search, "search.url"))?;
        let rules = SearchRuleSet::from_definition(&def)
            .ok_or_else(|| self.missing_rule(Stage::Search, "search.list/name/book_url"))?;

        let url = build_search_url(template, &def.url, keyword, def.connection.charset.as_deref())
            .ok_or_else(|| {
                EngineError::invalid_url(Stage::Search, template).for_source(&def.name)
            })?;
        self.check_host(&url, Stage::Search)?;

        let page = self
            .fetcher
            .fetch(&url, &def.connection, Stage::Search, &def.name)
            .await?;
        let candidates = parse_search_page(&rules, &def.name, &page.text, &page.final_url);
        debug!(
            source = %def.name,
            keyword,
            candidates = candidates.len(),
            "parsed search page"
        );
        Ok(apply_match_policy(candidates, keyword))
    }

    /// Fetches a book's detail page.
    pub async fn detail(&self, url: &str) -> Result<BookDetail, EngineError> {
        if self.def.detail.is_empty() {
            return Err(self.missing_rule(Stage::Detail, "detail"));
        }
        self.check_host(url, Stage::Detail)?;
        let page = self
            .fetcher
            .fetch(url, &self.def.connection, Stage::Detail, &self.def.name)
            .await?;
        parse_detail_page(&self.def, &page.text, &page.final_url).ok_or_else(|| {
            EngineError::parse(Stage::Detail, "no detail field could be extracted")
                .for_source(&self.def.name)
                .at_url(url)
        })
    }

    /// Lists a book's chapters starting from its detail page.
    ///
    /// The list page is located by the `detail.chapter_url` rule when present,
    /// otherwise by probing for a "full chapter list" anchor, otherwise the
    /// detail page itself is used.
    pub async fn chapters(&self, url: &str) -> Result<Vec<Chapter>, EngineError> {
        let list_rule = self
            .def
            .chapters
            .list
            .as_deref()
            .ok_or_else(|| self.missing_rule(Stage::Chapters, "chapters.list"))?;
        let rules = ChapterRuleSet {
            list: list_rule,
            name: self
                .def
                .chapters
                .name
                .as_deref()
                .unwrap_or(DEFAULT_CHAPTER_NAME_RULE),
            link: self
                .def
                .chapters
                .link
                .as_deref()
                .unwrap_or(DEFAULT_CHAPTER_LINK_RULE),
        };

        self.check_host(url, Stage::Chapters)?;
        let detail_page = self
            .fetcher
            .fetch(url, &self.def.connection, Stage::Chapters, &self.def.name)
            .await?;
        let detail_base = detail_page.final_url.clone();

        let list_url = match self.def.detail.chapter_url.as_deref() {
            Some(rule) => {
                let page = Page::parse(&detail_page.text, &detail_base);
                selector::extract_text(page.root(), &detail_base, rule)
                    .map(|raw| urls::resolve(&raw, &detail_base))
                    .filter(|u| !u.is_empty())
            }
            None => find_chapter_list_url(&detail_page.text, &detail_base),
        };

        if let Some(list_url) = list_url.filter(|u| u != &detail_base) {
            self.check_host(&list_url, Stage::Chapters)?;
            debug!(source = %self.def.name, %list_url, "following chapter list link");
            let list_page = self
                .fetcher
                .fetch(&list_url, &self.def.connection, Stage::Chapters, &self.def.name)
                .await?;
            let chapters = parse_chapter_page(&rules, &list_page.text, &list_page.final_url);
            if !chapters.is_empty() {
                return Ok(chapters);
            }
            debug!(source = %self.def.name, %list_url, "chapter list link yielded nothing, using detail page");
        }

        let chapters = parse_chapter_page(&rules, &detail_page.text, &detail_base);
        if chapters.is_empty() {
            return Err(
                EngineError::parse(Stage::Chapters, "chapter list rule matched nothing")
                    .for_source(&self.def.name)
                    .at_url(url),
            );
        }
        Ok(chapters)
    }

    /// Fetches one chapter and returns its filtered, paragraph-preserving text.
    pub async fn content(&self, url: &str) -> Result<ChapterContent, EngineError> {
        let rule = self
            .def
            .content
            .selector
            .as_deref()
            .ok_or_else(|| self.missing_rule(Stage::Content, "content.selector"))?;
        self.check_host(url, Stage::Content)?;
        let page = self
            .fetcher
            .fetch(url, &self.def.connection, Stage::Content, &self.def.name)
            .await?;

        let raw = {
            let doc = Page::parse(&page.text, &page.final_url);
            selector::extract_multiline(doc.root(), doc.base_url(), rule)
        };
        let raw = raw.filter(|t| !t.trim().is_empty()).ok_or_else(|| {
            EngineError::parse(Stage::Content, "content rule matched nothing")
                .for_source(&self.def.name)
                .at_url(url)
        })?;

        let (text, applied_filters) = apply_content_filters(&raw, &self.def.content.filters);
        Ok(ChapterContent {
            url: url.to_string(),
            text,
            applied_filters,
        })
    }

    fn check_host(&self, url: &str, stage: Stage) -> Result<(), EngineError> {
        if !self.settings.allow_loopback && is_loopback_or_null_host(url) {
            return Err(EngineError::invalid_url(stage, url)
                .for_source(&self.def.name)
                .message("loopback or empty host refused"));
        }
        Ok(())
    }

    fn missing_rule(&self, stage: Stage, rule: &str) -> EngineError {
        EngineError::config(stage, format!("missing required rule {rule}")).for_source(&self.def.name)
    }
}

/// Search rules resolved to plain strings, required ones present.
struct SearchRuleSet<'a> {
    list: &'a str,
    name: &'a str,
    book_url: &'a str,
    author: Option<&'a str>,
    kind: Option<&'a str>,
    cover: Option<&'a str>,
    intro: Option<&'a str>,
}

impl<'a> SearchRuleSet<'a> {
    fn from_definition(def: &'a SourceDefinition) -> Option<Self> {
        Some(Self {
            list: def.search.list.as_deref()?,
            name: def.search.name.as_deref()?,
            book_url: def.search.book_url.as_deref()?,
            author: def.search.author.as_deref(),
            kind: def.search.kind.as_deref(),
            cover: def.search.cover.as_deref(),
            intro: def.search.intro.as_deref(),
        })
    }
}

struct ChapterRuleSet<'a> {
    list: &'a str,
    name: &'a str,
    link: &'a str,
}

/// Percent-encodes a keyword, first transcoding it when the source uses a non-UTF-8 charset.
pub fn encode_keyword(keyword: &str, charset: Option<&str>) -> String {
    let encoding = charset
        .and_then(|label| encoding_rs::Encoding::for_label(label.trim().as_bytes()))
        .filter(|enc| *enc != encoding_rs::UTF_8);
    match encoding {
        Some(enc) => {
            let (bytes, _, _) = enc.encode(keyword);
            percent_encode(&bytes, KEYWORD_ENCODE_SET).to_string()
        }
        None => utf8_percent_encode(keyword, KEYWORD_ENCODE_SET).to_string(),
    }
}

/// Fills the search URL template and resolves it against the source's base URL.
///
/// `{page}` becomes 1. A template without a keyword placeholder gets a
/// `keyword` query parameter appended.
pub fn build_search_url(
    template: &str,
    base: &str,
    keyword: &str,
    charset: Option<&str>,
) -> Option<String> {
    let canonical = canonical_placeholders(template.trim()).replace("{page}", "1");
    // The keyword itself never goes through URL cleanup.
    let slotted = if canonical.contains("{keyword}") {
        canonical.replace("{keyword}", KEYWORD_SLOT)
    } else {
        let sep = if canonical.contains('?') { '&' } else { '?' };
        format!("{canonical}{sep}keyword={KEYWORD_SLOT}")
    };
    let resolved = urls::resolve(&slotted, base);
    if resolved.is_empty() {
        return None;
    }
    let encoded = encode_keyword(keyword.trim(), charset);
    Some(resolved.replace(KEYWORD_SLOT, &encoded))
}

fn parse_search_page(
    rules: &SearchRuleSet<'_>,
    source_name: &str,
    html: &str,
    page_url: &str,
) -> Vec<SearchResult> {
    let page = Page::parse(html, page_url);
    let base = page.base_url();
    let mut results = Vec::new();
    for item in selector::select_elements(page.root(), rules.list) {
        let Some(name) = selector::extract_text(item, base, rules.name) else {
            continue;
        };
        let book_url = selector::extract_text(item, base, rules.book_url)
            .map(|raw| urls::resolve(&raw, base))
            .unwrap_or_default();
        if name.trim().is_empty() || book_url.is_empty() {
            continue;
        }
        let optional = |rule: Option<&str>| rule.and_then(|r| selector::extract_text(item, base, r));
        results.push(SearchResult {
            source_name: source_name.to_string(),
            name: name.trim().to_string(),
            author: optional(rules.author)
                .map(|a| clean_author(&a))
                .unwrap_or_default(),
            kind: optional(rules.kind),
            cover: optional(rules.cover)
                .map(|c| urls::resolve(&c, base))
                .filter(|c| !c.is_empty()),
            intro: optional(rules.intro),
            book_url,
        });
    }
    results
}

fn clean_author(raw: &str) -> String {
    AUTHOR_PREFIX_RE.replace(raw, "").trim().to_string()
}

/// Keeps only exact matches when there are any.
pub fn apply_match_policy(candidates: Vec<SearchResult>, keyword: &str) -> Vec<SearchResult> {
    let needle = keyword.trim().to_lowercase();
    if needle.is_empty() {
        return candidates;
    }
    let is_exact = |r: &SearchResult| {
        r.name.to_lowercase() == needle
            || (!r.author.is_empty() && r.author.to_lowercase().contains(&needle))
    };
    if candidates.iter().any(|r| is_exact(r)) {
        candidates.into_iter().filter(|r| is_exact(r)).collect()
    } else {
        candidates
    }
}

fn parse_detail_page(def: &SourceDefinition, html: &str, page_url: &str) -> Option<BookDetail> {
    let page = Page::parse(html, page_url);
    let root = page.root();
    let base = page.base_url();
    let field = |rule: &Option<String>| {
        rule.as_deref()
            .and_then(|r| selector::extract_text(root, base, r))
    };

    let name = field(&def.detail.name).unwrap_or_default();
    let author = field(&def.detail.author)
        .map(|a| clean_author(&a))
        .unwrap_or_default();
    let cover = field(&def.detail.cover)
        .map(|c| urls::resolve(&c, base))
        .filter(|c| !c.is_empty());
    let intro = def
        .detail
        .intro
        .as_deref()
        .and_then(|r| selector::extract_multiline(root, base, r));
    let categories = def
        .detail
        .categories
        .as_deref()
        .map(|r| {
            selector::extract_list(root, base, r)
                .iter()
                .flat_map(|c| c.split(|ch: char| ch == ',' || ch == '，' || ch == '/' || ch == '|'))
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let chapter_url = field(&def.detail.chapter_url)
        .map(|u| urls::resolve(&u, base))
        .filter(|u| !u.is_empty());

    if name.is_empty()
        && author.is_empty()
        && cover.is_none()
        && intro.is_none()
        && chapter_url.is_none()
    {
        return None;
    }
    Some(BookDetail {
        source_name: def.name.clone(),
        url: page_url.to_string(),
        name,
        author,
        cover,
        intro,
        categories,
        chapter_url: chapter_url.unwrap_or_else(|| page_url.to_string()),
    })
}

/// Finds a link whose text looks like "full chapter list".
fn find_chapter_list_url(html: &str, page_url: &str) -> Option<String> {
    let page = Page::parse(html, page_url);
    page.root()
        .select(&ANCHOR_SELECTOR)
        .find(|a| {
            let label = text::normalize_whitespace(&a.text().collect::<String>());
            CHAPTER_ANCHOR_MATCHER.is_match(&label)
        })
        .and_then(|a| a.value().attr("href"))
        .map(|href| urls::resolve(href, page_url))
        .filter(|u| !u.is_empty())
}

fn parse_chapter_page(rules: &ChapterRuleSet<'_>, html: &str, page_url: &str) -> Vec<Chapter> {
    let page = Page::parse(html, page_url);
    let base = page.base_url();
    let mut chapters = Vec::new();
    for item in selector::select_elements(page.root(), rules.list) {
        let name = selector::extract_text(item, base, rules.name)
            .map(|n| n.trim().to_string())
            .unwrap_or_default();
        let url = selector::extract_text(item, base, rules.link)
            .map(|raw| urls::resolve(&raw, base))
            .unwrap_or_default();
        if name.is_empty() || url.is_empty() {
            continue;
        }
        chapters.push(Chapter {
            index: chapters.len(),
            name,
            url,
        });
    }
    chapters
}

/// A content filter, compiled.
enum ContentFilter {
    Literal(String),
    Pattern { re: Regex, replacement: String },
}

impl ContentFilter {
    /// `re:PATTERN` and `##PATTERN[##REPLACEMENT]` are regexes; anything else is a literal.
    fn parse(raw: &str) -> Option<Self> {
        let (pattern, replacement) = if let Some(rest) = raw.strip_prefix("re:") {
            (rest, "")
        } else if let Some(rest) = raw.strip_prefix("##") {
            rest.split_once("##").unwrap_or((rest, ""))
        } else {
            return Some(ContentFilter::Literal(raw.to_string()));
        };
        match Regex::new(pattern) {
            Ok(re) => Some(ContentFilter::Pattern {
                re,
                replacement: replacement.to_string(),
            }),
            Err(e) => {
                warn!(filter = raw, error = %e, "skipping content filter with invalid regex");
                None
            }
        }
    }

    fn apply(&self, input: &str) -> String {
        match self {
            ContentFilter::Literal(needle) => input.replace(needle.as_str(), ""),
            ContentFilter::Pattern { re, replacement } => {
                re.replace_all(input, replacement.as_str()).into_owned()
            }
        }
    }
}

/// Applies filters in order and reports which of them changed the text.
pub fn apply_content_filters(raw: &str, filters: &[String]) -> (String, Vec<String>) {
    let mut text = raw.to_string();
    let mut applied = Vec::new();
    for raw_filter in filters {
        if raw_filter.is_empty() {
            continue;
        }
        let Some(filter) = ContentFilter::parse(raw_filter) else {
            continue;
        };
        let next = filter.apply(&text);
        if next != text {
            applied.push(raw_filter.clone());
            text = next;
        }
    }
    (text::tidy_lines(&text), applied)
}
