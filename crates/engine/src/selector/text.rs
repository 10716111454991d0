// ABOUTME: Text helpers for rule evaluation: whitespace normalization, own-text, and paragraph-preserving text.
// ABOUTME: block_text walks the element tree so <br>, <p> and <div> boundaries become line breaks.

use scraper::{ElementRef, Html};

/// Block-level tags whose boundaries start a new line.
const BLOCK_TAGS: &[&str] = &[
    "p", "div", "br", "li", "h1", "h2", "h3", "h4", "h5", "h6", "section", "article", "blockquote",
    "pre", "tr", "dd", "dt",
];

/// Tags whose text never belongs to readable content.
const SKIP_TAGS: &[&str] = &["script", "style", "noscript", "template"];

/// Normalizes whitespace in a string by collapsing runs of whitespace into single spaces.
pub fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Text of the element's direct child text nodes.
pub fn own_text(el: ElementRef<'_>) -> String {
    el.children()
        .filter_map(|child| match child.value() {
            scraper::Node::Text(text) => Some(&**text),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Paragraph-preserving text: one trimmed line per block, blank lines dropped.
pub fn block_text(el: ElementRef<'_>) -> String {
    let mut raw = String::new();
    for child in el.children() {
        collect_block_text(child, &mut raw);
    }
    tidy_lines(&raw)
}

/// Converts an HTML fragment to paragraph-preserving text.
pub fn html_to_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    block_text(fragment.root_element())
}

fn collect_block_text(node: ego_tree::NodeRef<scraper::Node>, out: &mut String) {
    match node.value() {
        scraper::Node::Text(text) => out.push_str(&**text),
        scraper::Node::Element(el) => {
            let name = el.name();
            if SKIP_TAGS.contains(&name) {
                return;
            }
            let is_block = BLOCK_TAGS.contains(&name);
            if is_block {
                out.push('\n');
            }
            for child in node.children() {
                collect_block_text(child, out);
            }
            if is_block {
                out.push('\n');
            }
        }
        _ => {}
    }
}

/// Normalizes each line and drops the blank ones.
pub fn tidy_lines(raw: &str) -> String {
    raw.lines()
        .map(|line| normalize_whitespace(line))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
