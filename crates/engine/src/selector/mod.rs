// ABOUTME: Selector engine entry points: Page wrapper, compiled-rule cache, and extract helpers.
// ABOUTME: Rules are parsed once into an AST (see rule.rs) and evaluated purely against a parsed page.

//! Selector engine.
//!
//! The rule language understood here:
//! - `A||B` tries A, then B when A yields nothing.
//! - `A##pattern##replacement` runs a regex substitution over A's values.
//! - `class.NAME.attr:INDEX`, `id.NAME.attr:INDEX`, `tag.NAME.attr:INDEX` simplified forms.
//! - `selector@attribute` with `text`, `ownText`, `html`, `outerHtml` or any attribute name;
//!   href/src style attributes are resolved to absolute URLs.
//! - `A@B@C` steps down the tree: each step may be CSS or a simplified segment,
//!   and only a final attribute-like segment is read as the attribute.
//! - `A&&B` structural fallback: the first selector matching anything is used.
//! - a bare CSS selector yields the trimmed text of its matches.
//!
//! Evaluation never panics and never touches the network.

pub mod rule;
pub mod text;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use scraper::{ElementRef, Html};

pub use crate::selector::rule::{AttrKind, EvalContext, Query, Rule};

/// Thread-safe cache of parsed rules keyed by rule text.
static RULE_CACHE: Lazy<RwLock<HashMap<String, Arc<Rule>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Gets or parses a rule, caching the AST.
///
/// Subsequent calls with the same rule text return the cached AST.
pub fn compile(rule: &str) -> Arc<Rule> {
    let key = rule.trim();
    // Fast path: read lock for a cached rule
    if let Ok(cache) = RULE_CACHE.read() {
        if let Some(cached) = cache.get(key) {
            return Arc::clone(cached);
        }
    }

    // Slow path: parse and cache
    let compiled = Arc::new(Rule::parse(key));
    if let Ok(mut cache) = RULE_CACHE.write() {
        // Double-check after acquiring write lock (another thread may have inserted)
        return Arc::clone(
            cache
                .entry(key.to_string())
                .or_insert_with(|| Arc::clone(&compiled)),
        );
    }
    compiled
}

/// A parsed page together with the URL it was fetched from.
pub struct Page {
    doc: Html,
    base_url: String,
}

impl Page {
    /// Parses an HTML document.
    pub fn parse(html: &str, base_url: &str) -> Self {
        Self {
            doc: Html::parse_document(html),
            base_url: base_url.to_string(),
        }
    }

    /// The document root, the default scope for page-level rules.
    pub fn root(&self) -> ElementRef<'_> {
        self.doc.root_element()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Evaluates a rule against the whole page.
    pub fn extract(&self, rule: &str, want: Want) -> Extracted {
        extract_in(self.root(), &self.base_url, rule, want)
    }
}

/// Whether the caller expects a single value or a list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Want {
    One,
    Many,
}

/// Result of evaluating a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extracted {
    Null,
    One(String),
    List(Vec<String>),
}

impl Extracted {
    /// The single value, or the first element of a list.
    pub fn into_string(self) -> Option<String> {
        match self {
            Extracted::Null => None,
            Extracted::One(s) => Some(s),
            Extracted::List(v) => v.into_iter().next(),
        }
    }

    pub fn into_list(self) -> Vec<String> {
        match self {
            Extracted::Null => Vec::new(),
            Extracted::One(s) => vec![s],
            Extracted::List(v) => v,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Extracted::Null)
    }
}

/// Evaluates `rule` inside `scope`. An empty rule yields `Null`.
pub fn extract_in(scope: ElementRef<'_>, base_url: &str, rule: &str, want: Want) -> Extracted {
    if rule.trim().is_empty() {
        return Extracted::Null;
    }
    let ctx = EvalContext {
        base_url,
        multiline: false,
        first_only: want == Want::One,
    };
    let values = compile(rule).eval(scope, ctx);
    into_extracted(values, want)
}

/// First value of `rule` inside `scope`.
pub fn extract_text(scope: ElementRef<'_>, base_url: &str, rule: &str) -> Option<String> {
    extract_in(scope, base_url, rule, Want::One).into_string()
}

/// All values of `rule` inside `scope`.
pub fn extract_list(scope: ElementRef<'_>, base_url: &str, rule: &str) -> Vec<String> {
    extract_in(scope, base_url, rule, Want::Many).into_list()
}

/// Paragraph-preserving text of the first match, for chapter bodies.
pub fn extract_multiline(scope: ElementRef<'_>, base_url: &str, rule: &str) -> Option<String> {
    if rule.trim().is_empty() {
        return None;
    }
    let ctx = EvalContext {
        base_url,
        multiline: true,
        first_only: true,
    };
    let compiled = compile(rule);
    let values = compiled.eval(scope, ctx);
    let first = values.into_iter().next()?;
    // An @html rule hands back markup; flatten it the same way.
    if matches!(
        &*compiled,
        Rule::Attribute {
            attr: AttrKind::Html | AttrKind::OuterHtml,
            ..
        }
    ) {
        let flattened = text::html_to_text(&first);
        return if flattened.is_empty() {
            None
        } else {
            Some(flattened)
        };
    }
    Some(first)
}

/// Elements addressed by a list rule.
pub fn select_elements<'a>(scope: ElementRef<'a>, rule: &str) -> Vec<ElementRef<'a>> {
    if rule.trim().is_empty() {
        return Vec::new();
    }
    compile(rule).elements(scope)
}

fn into_extracted(values: Vec<String>, want: Want) -> Extracted {
    if values.is_empty() {
        return Extracted::Null;
    }
    match want {
        Want::One => values
            .into_iter()
            .next()
            .map(Extracted::One)
            .unwrap_or(Extracted::Null),
        Want::Many => Extracted::List(values),
    }
}
