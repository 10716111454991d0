// ABOUTME: Canonical SourceDefinition data model: per-stage rule sets, connection settings and usage stats.
// ABOUTME: Submodules normalize heterogeneous input shapes and apply the known-issue patch table.

//! Source definitions.
//!
//! A source definition describes how to search one reading site, fetch a
//! book's detail page, list its chapters and extract chapter text. Rules are
//! plain strings in the selector language (see [`crate::selector`]); an absent
//! rule only disables the operations that need it.

pub mod normalize;
pub mod patches;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_retry_count() -> u32 {
    1
}

fn is_default_retry(n: &u32) -> bool {
    *n == default_retry_count()
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Rules for the search stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SearchRules {
    /// URL template containing a keyword placeholder such as `{keyword}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Selects one element per result item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intro: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub book_url: Option<String>,
}

/// Rules for the book detail page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DetailRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intro: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categories: Option<String>,
    /// Locates the full chapter list page from the detail page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_url: Option<String>,
}

impl DetailRules {
    /// True when no detail rule is set.
    pub fn is_empty(&self) -> bool {
        self == &DetailRules::default()
    }
}

/// Rules for the chapter list page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ChapterRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

/// Rules for chapter bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ContentRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    /// Applied in order. `re:` or `##` prefix marks a regex, anything else is removed literally.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<String>,
}

/// Per-source HTTP settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cookies: BTreeMap<String, String>,
    /// Explicit page charset, overriding detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_retry_count", skip_serializing_if = "is_default_retry")]
    pub retry_count: u32,
    /// Recorded for callers; script-heavy pages are not rendered.
    #[serde(default, skip_serializing_if = "is_false")]
    pub requires_js: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            headers: BTreeMap::new(),
            cookies: BTreeMap::new(),
            charset: None,
            timeout_ms: None,
            retry_count: default_retry_count(),
            requires_js: false,
        }
    }
}

/// Usage statistics, maintained by the registry and excluded from export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UsageStats {
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rating: f32,
}

impl UsageStats {
    pub fn is_empty(&self) -> bool {
        self == &UsageStats::default()
    }
}

/// A named rule set describing how to crawl one reading site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDefinition {
    /// Globally unique key.
    pub name: String,
    /// Base URL of the site.
    #[serde(default)]
    pub url: String,
    /// Comma or semicolon separated group labels.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub search: SearchRules,
    #[serde(default)]
    pub detail: DetailRules,
    #[serde(default)]
    pub chapters: ChapterRules,
    #[serde(default)]
    pub content: ContentRules,
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default, skip_serializing_if = "UsageStats::is_empty")]
    pub stats: UsageStats,
}

impl SourceDefinition {
    /// Creates an enabled definition with empty rule sets.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            group: String::new(),
            enabled: true,
            search: SearchRules::default(),
            detail: DetailRules::default(),
            chapters: ChapterRules::default(),
            content: ContentRules::default(),
            connection: ConnectionSettings::default(),
            stats: UsageStats::default(),
        }
    }

    /// Individual group labels, trimmed, in declaration order.
    pub fn groups(&self) -> Vec<String> {
        self.group
            .split(|c| c == ',' || c == ';' || c == '，')
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.groups().iter().any(|g| g == group.trim())
    }

    /// A copy with usage statistics cleared, as used for export and comparisons.
    pub fn without_stats(&self) -> Self {
        Self {
            stats: UsageStats::default(),
            ..self.clone()
        }
    }

    /// True when rules and settings match, ignoring usage statistics.
    pub fn same_rules(&self, other: &SourceDefinition) -> bool {
        self.without_stats() == other.without_stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_split_on_separators() {
        let mut def = SourceDefinition::new("A", "https://a.example");
        def.group = "玄幻, 精品;  ,Top，Daily".to_string();
        assert_eq!(def.groups(), vec!["玄幻", "精品", "Top", "Daily"]);
        assert!(def.in_group("精品"));
        assert!(!def.in_group("Other"));
    }

    #[test]
    fn serde_skips_defaults() {
        let def = SourceDefinition::new("A", "https://a.example");
        let json = serde_json::to_value(&def).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "name": "A",
                "url": "https://a.example",
                "enabled": true,
                "search": {},
                "detail": {},
                "chapters": {},
                "content": {},
                "connection": {}
            })
        );
        let back: SourceDefinition = serde_json::from_value(json).unwrap();
        assert_eq!(back, def);
    }

    #[test]
    fn same_rules_ignores_stats() {
        let a = SourceDefinition::new("A", "https://a.example");
        let mut b = a.clone();
        b.stats.count = 9;
        assert!(a.same_rules(&b));
        assert_ne!(a, b);
        b.enabled = false;
        assert!(!a.same_rules(&b));
    }
}
