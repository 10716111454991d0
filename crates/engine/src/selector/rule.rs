// ABOUTME: Rule AST for the selector language: parsing from rule text and evaluation against an element scope.
// ABOUTME: Node kinds are Structural, Chained and Indexed queries plus Attribute, Regex and Fallback rules.

use std::collections::HashSet;

use ego_tree::NodeId;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Selector};

use crate::selector::text::{block_text, normalize_whitespace, own_text};
use crate::urls::resolve;

static SIMPLIFIED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(class|id|tag)\.([^.:@\s]+)(?:\.([A-Za-z][\w-]*))?(?::(-?\d+))?$").unwrap()
});
static SIMPLIFIED_STEP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(class|id|tag)\.([^.:@\s]+)(?::(-?\d+))?$").unwrap());
static TRAILING_INDEX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(.*?):(-?\d+)$").unwrap());
static ATTR_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z][\w:-]*$").unwrap());

/// What to pull out of a matched element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrKind {
    /// Trimmed text with whitespace collapsed (paragraph-preserving in multiline mode).
    Text,
    /// Text of direct child text nodes only.
    OwnText,
    Html,
    OuterHtml,
    /// An href/src style attribute, resolved to an absolute URL.
    Url(String),
    Named(String),
}

impl AttrKind {
    fn parse(name: &str) -> Self {
        match name {
            "text" => AttrKind::Text,
            "ownText" | "textNodes" => AttrKind::OwnText,
            "html" => AttrKind::Html,
            "outerHtml" | "all" => AttrKind::OuterHtml,
            other => {
                let lower = other.to_ascii_lowercase();
                if lower.ends_with("href")
                    || lower.ends_with("src")
                    || lower == "data-original"
                    || lower == "data-url"
                {
                    AttrKind::Url(other.to_string())
                } else {
                    AttrKind::Named(other.to_string())
                }
            }
        }
    }
}

/// An element-producing query.
#[derive(Debug)]
pub enum Query {
    /// Empty selector: the scope node itself.
    SelfNode,
    Structural(Selector),
    /// `A&&B`: the first query that matches anything wins.
    Chained(Vec<Query>),
    /// Zero-based index into the inner query's matches; negative counts from the end.
    Indexed { inner: Box<Query>, index: i32 },
    /// `A@B`: each step runs inside every match of the previous one.
    Descend(Vec<Query>),
    /// Syntax the engine does not understand. Reads as the scope node when
    /// extracting a value, and as nothing when addressing list items.
    Unrecognized(String),
}

/// A value-producing rule.
#[derive(Debug)]
pub enum Rule {
    Attribute { query: Query, attr: AttrKind },
    /// `A##pattern##replacement`. A malformed pattern leaves values unchanged.
    Regex {
        inner: Box<Rule>,
        pattern: Result<Regex, String>,
        replacement: String,
    },
    /// `A||B`: alternatives evaluated lazily, first non-empty wins.
    Fallback(Vec<Rule>),
}

/// Evaluation context shared by every node of one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'b> {
    pub base_url: &'b str,
    /// Preserve paragraph breaks in text extraction (chapter content).
    pub multiline: bool,
    /// Stop after the first non-empty value.
    pub first_only: bool,
}

impl Rule {
    /// Parses rule text into an AST. Never fails; bad syntax degrades to whole-node text.
    pub fn parse(text: &str) -> Rule {
        let text = text.trim();

        if text.contains("||") {
            let alternatives: Vec<Rule> = text
                .split("||")
                .filter(|part| !part.trim().is_empty())
                .map(Rule::parse)
                .collect();
            if alternatives.len() != 1 {
                return Rule::Fallback(alternatives);
            }
            return alternatives.into_iter().next().unwrap_or_else(|| Rule::parse(""));
        }

        if let Some((inner, rest)) = text.split_once("##") {
            let (pattern, replacement) = match rest.split_once("##") {
                Some((p, r)) => (p, r),
                None => (rest, ""),
            };
            return Rule::Regex {
                inner: Box::new(Rule::parse(inner)),
                pattern: Regex::new(pattern).map_err(|e| e.to_string()),
                replacement: js_replacement(replacement),
            };
        }

        if let Some(caps) = SIMPLIFIED_RE.captures(text) {
            let index = caps.get(4).and_then(|m| m.as_str().parse::<i32>().ok());
            let query = simplified_query(&caps[1], &caps[2], index, text);
            let attr = caps
                .get(3)
                .map(|m| AttrKind::parse(m.as_str()))
                .unwrap_or(AttrKind::Text);
            return Rule::Attribute { query, attr };
        }

        if text.contains('@') {
            let mut steps: Vec<&str> = text.split('@').collect();
            let last: &str = steps.last().copied().unwrap_or_default().trim();
            let attr = if steps.len() > 1 && ATTR_NAME_RE.is_match(last) {
                steps.pop();
                AttrKind::parse(last)
            } else {
                AttrKind::Text
            };
            return Rule::Attribute {
                query: Query::descend(&steps),
                attr,
            };
        }

        Rule::Attribute {
            query: Query::parse(text),
            attr: AttrKind::Text,
        }
    }

    /// Evaluates the rule, returning non-empty values in document order.
    pub fn eval(&self, scope: ElementRef<'_>, ctx: EvalContext<'_>) -> Vec<String> {
        match self {
            Rule::Attribute { query, attr } => {
                let mut out = Vec::new();
                for el in query.select(scope) {
                    if let Some(value) = extract_value(el, attr, ctx) {
                        out.push(value);
                        if ctx.first_only {
                            break;
                        }
                    }
                }
                out
            }
            Rule::Regex {
                inner,
                pattern,
                replacement,
            } => {
                let values = inner.eval(scope, ctx);
                let Ok(re) = pattern else {
                    return values;
                };
                values
                    .into_iter()
                    .map(|v| re.replace_all(&v, replacement.as_str()).trim().to_string())
                    .filter(|v| !v.is_empty())
                    .collect()
            }
            Rule::Fallback(alternatives) => {
                for alt in alternatives {
                    let values = alt.eval(scope, ctx);
                    if !values.is_empty() {
                        return values;
                    }
                }
                Vec::new()
            }
        }
    }

    /// Returns the elements a list rule addresses, ignoring any attribute extraction.
    pub fn elements<'a>(&self, scope: ElementRef<'a>) -> Vec<ElementRef<'a>> {
        match self {
            Rule::Attribute { query, .. } => query.select_in(scope, true),
            Rule::Regex { inner, .. } => inner.elements(scope),
            Rule::Fallback(alternatives) => alternatives
                .iter()
                .map(|alt| alt.elements(scope))
                .find(|els| !els.is_empty())
                .unwrap_or_default(),
        }
    }

    /// True when the rule ends in an href/src style attribute.
    pub fn yields_urls(&self) -> bool {
        match self {
            Rule::Attribute { attr, .. } => matches!(attr, AttrKind::Url(_)),
            Rule::Regex { inner, .. } => inner.yields_urls(),
            Rule::Fallback(alternatives) => alternatives.iter().any(Rule::yields_urls),
        }
    }
}

impl Query {
    /// Parses a structural selector, honouring `A&&B` and a trailing `:INDEX`.
    pub fn parse(text: &str) -> Query {
        let text = text.trim();
        if text.contains("&&") {
            let parts: Vec<Query> = text
                .split("&&")
                .filter(|p| !p.trim().is_empty())
                .map(Query::parse_step)
                .collect();
            return Query::Chained(parts);
        }
        if text.is_empty() {
            return Query::SelfNode;
        }
        if let Some(caps) = TRAILING_INDEX_RE.captures(text) {
            if let Ok(index) = caps[2].parse::<i32>() {
                return Query::Indexed {
                    inner: Box::new(Query::parse(&caps[1])),
                    index,
                };
            }
        }
        match Selector::parse(text) {
            Ok(sel) => Query::Structural(sel),
            Err(_) => Query::Unrecognized(text.to_string()),
        }
    }

    /// Parses one `@`-separated step: a simplified `class.`/`id.`/`tag.` segment or CSS.
    fn parse_step(text: &str) -> Query {
        let text = text.trim();
        match SIMPLIFIED_STEP_RE.captures(text) {
            Some(caps) => {
                let index = caps.get(3).and_then(|m| m.as_str().parse::<i32>().ok());
                simplified_query(&caps[1], &caps[2], index, text)
            }
            None => Query::parse(text),
        }
    }

    fn descend(steps: &[&str]) -> Query {
        match steps {
            [single] => Query::parse_step(single),
            _ => Query::Descend(steps.iter().map(|s| Query::parse_step(s)).collect()),
        }
    }

    /// Returns matching elements below `scope` in document order.
    pub fn select<'a>(&self, scope: ElementRef<'a>) -> Vec<ElementRef<'a>> {
        self.select_in(scope, false)
    }

    fn select_in<'a>(&self, scope: ElementRef<'a>, listing: bool) -> Vec<ElementRef<'a>> {
        match self {
            Query::SelfNode => vec![scope],
            Query::Unrecognized(_) if listing => Vec::new(),
            Query::Unrecognized(_) => vec![scope],
            Query::Structural(sel) => scope.select(sel).collect(),
            Query::Chained(parts) => parts
                .iter()
                .map(|q| q.select_in(scope, listing))
                .find(|els| !els.is_empty())
                .unwrap_or_default(),
            Query::Indexed { inner, index } => {
                let matches = inner.select_in(scope, listing);
                pick_index(&matches, *index).into_iter().collect()
            }
            Query::Descend(steps) => {
                let mut current = vec![scope];
                for step in steps {
                    let mut seen: HashSet<NodeId> = HashSet::new();
                    current = current
                        .into_iter()
                        .flat_map(|el| step.select_in(el, listing))
                        .filter(|el| seen.insert(el.id()))
                        .collect();
                    if current.is_empty() {
                        break;
                    }
                }
                current
            }
        }
    }
}

/// Builds the query for a simplified `class.NAME`, `id.NAME` or `tag.NAME` segment.
fn simplified_query(kind: &str, name: &str, index: Option<i32>, raw: &str) -> Query {
    let css = match kind {
        "class" => format!(".{}", name),
        "id" => format!("#{}", name),
        _ => name.to_string(),
    };
    let fallback_css = match kind {
        "class" => format!("[class~=\"{}\"]", name),
        "id" => format!("[id=\"{}\"]", name),
        _ => name.to_string(),
    };
    let structural = Selector::parse(&css)
        .or_else(|_| Selector::parse(&fallback_css))
        .map(Query::Structural)
        .unwrap_or_else(|_| Query::Unrecognized(raw.to_string()));
    match index {
        Some(index) => Query::Indexed {
            inner: Box::new(structural),
            index,
        },
        None => structural,
    }
}

/// Picks an element by zero-based index, negative counting from the end; out of range yields None.
fn pick_index<'a>(matches: &[ElementRef<'a>], index: i32) -> Option<ElementRef<'a>> {
    let len = matches.len() as i64;
    let idx = if index < 0 {
        len + index as i64
    } else {
        index as i64
    };
    if idx < 0 || idx >= len {
        return None;
    }
    matches.get(idx as usize).copied()
}

fn extract_value(el: ElementRef<'_>, attr: &AttrKind, ctx: EvalContext<'_>) -> Option<String> {
    let value = match attr {
        AttrKind::Text if ctx.multiline => block_text(el),
        AttrKind::Text => normalize_whitespace(&el.text().collect::<String>()),
        AttrKind::OwnText => normalize_whitespace(&own_text(el)),
        AttrKind::Html => el.inner_html().trim().to_string(),
        AttrKind::OuterHtml => el.html().trim().to_string(),
        AttrKind::Named(name) => el.value().attr(name)?.trim().to_string(),
        AttrKind::Url(name) => resolve(el.value().attr(name)?, ctx.base_url),
    };
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Rewrites `$1`-style group references to the `${1}` form so a following letter is not read as part of the name.
fn js_replacement(replacement: &str) -> String {
    let mut out = String::with_capacity(replacement.len());
    let mut chars = replacement.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' {
            let mut digits = String::new();
            while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                digits.push(d);
                chars.next();
            }
            if digits.is_empty() {
                out.push('$');
            } else {
                out.push_str("${");
                out.push_str(&digits);
                out.push('}');
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fallback_with_nested_regex() {
        let rule = Rule::parse("h1.title||h2##\\s+##-");
        match rule {
            Rule::Fallback(alts) => {
                assert_eq!(alts.len(), 2);
                assert!(matches!(alts[1], Rule::Regex { .. }));
            }
            other => panic!("expected fallback, got {:?}", other),
        }
    }

    #[test]
    fn parses_simplified_form() {
        match Rule::parse("class.book-name.text:-1") {
            Rule::Attribute {
                query: Query::Indexed { index, .. },
                attr,
            } => {
                assert_eq!(index, -1);
                assert_eq!(attr, AttrKind::Text);
            }
            other => panic!("unexpected {:?}", other),
        }
        match Rule::parse("tag.a.href") {
            Rule::Attribute {
                query: Query::Structural(_),
                attr,
            } => assert_eq!(attr, AttrKind::Url("href".to_string())),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parses_attribute_and_chained() {
        match Rule::parse("div.a&&div.b@data-id") {
            Rule::Attribute {
                query: Query::Chained(parts),
                attr,
            } => {
                assert_eq!(parts.len(), 2);
                assert_eq!(attr, AttrKind::Named("data-id".to_string()));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parses_legacy_steps_between_at_signs() {
        match Rule::parse("id.list@tag.dd") {
            Rule::Attribute {
                query: Query::Descend(steps),
                attr,
            } => {
                assert_eq!(steps.len(), 2);
                assert!(matches!(steps[0], Query::Structural(_)));
                assert_eq!(attr, AttrKind::Text);
            }
            other => panic!("unexpected {:?}", other),
        }
        match Rule::parse("id.content@textNodes") {
            Rule::Attribute {
                query: Query::Structural(_),
                attr,
            } => assert_eq!(attr, AttrKind::OwnText),
            other => panic!("unexpected {:?}", other),
        }
        match Rule::parse("class.item:1@tag.a@href") {
            Rule::Attribute {
                query: Query::Descend(steps),
                attr,
            } => {
                assert!(matches!(steps[0], Query::Indexed { index: 1, .. }));
                assert_eq!(attr, AttrKind::Url("href".to_string()));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn invalid_css_is_unrecognized() {
        assert!(matches!(
            Rule::parse("[[[broken"),
            Rule::Attribute {
                query: Query::Unrecognized(_),
                attr: AttrKind::Text
            }
        ));
    }

    #[test]
    fn malformed_regex_is_kept_as_error() {
        match Rule::parse("p##([unclosed##x") {
            Rule::Regex { pattern, .. } => assert!(pattern.is_err()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn js_replacement_wraps_group_numbers() {
        assert_eq!(js_replacement("$1abc"), "${1}abc");
        assert_eq!(js_replacement("cost $"), "cost $");
        assert_eq!(js_replacement("$12-$2"), "${12}-${2}");
    }

    #[test]
    fn attr_kind_classification() {
        assert_eq!(AttrKind::parse("src"), AttrKind::Url("src".to_string()));
        assert_eq!(
            AttrKind::parse("data-src"),
            AttrKind::Url("data-src".to_string())
        );
        assert_eq!(AttrKind::parse("title"), AttrKind::Named("title".to_string()));
        assert_eq!(AttrKind::parse("outerHtml"), AttrKind::OuterHtml);
    }
}
