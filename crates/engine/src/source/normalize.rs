// ABOUTME: Converts heterogeneous source JSON (canonical, flat legacy, nested legacy) into SourceDefinition.
// ABOUTME: Input is flattened to dotted keys, then a declarative field table picks the first candidate key present.

//! Source normalization.
//!
//! Three input shapes are accepted for the same information:
//!
//! - the canonical shape produced by export (`search.list`, `chapters.link`, ...)
//! - the flat legacy shape (`bookSourceName`, `ruleSearchList`, `ruleChapterUrl`, ...)
//! - the nested legacy shape (`ruleSearch.bookList`, `ruleToc.chapterList`, ...)
//!
//! Rather than hand-writing a branch per shape, the input is flattened into a
//! map of dotted paths and every canonical field lists the paths it may come
//! from. The first non-empty candidate wins.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::error::{EngineError, Stage};
use crate::source::SourceDefinition;

/// How a field value is written into the definition.
type Setter = fn(&mut SourceDefinition, &Value);

/// One canonical field and the input paths it may be read from, in priority order.
struct FieldMapping {
    keys: &'static [&'static str],
    set: Setter,
}

const FIELD_TABLE: &[FieldMapping] = &[
    FieldMapping {
        keys: &["name", "bookSourceName", "sourceName"],
        set: |d, v| d.name = text(v).unwrap_or_default(),
    },
    FieldMapping {
        keys: &["url", "bookSourceUrl", "sourceUrl"],
        set: |d, v| d.url = text(v).unwrap_or_default(),
    },
    FieldMapping {
        keys: &["group", "bookSourceGroup", "sourceGroup"],
        set: |d, v| d.group = text(v).unwrap_or_default(),
    },
    FieldMapping {
        keys: &["enabled", "enable"],
        set: |d, v| {
            if let Some(b) = flag(v) {
                d.enabled = b;
            }
        },
    },
    // search
    FieldMapping {
        keys: &["search.url", "ruleSearchUrl", "searchUrl"],
        set: |d, v| d.search.url = text(v),
    },
    FieldMapping {
        keys: &["search.list", "ruleSearchList", "ruleSearch.bookList"],
        set: |d, v| d.search.list = text(v),
    },
    FieldMapping {
        keys: &["search.name", "ruleSearchName", "ruleSearch.name"],
        set: |d, v| d.search.name = text(v),
    },
    FieldMapping {
        keys: &["search.author", "ruleSearchAuthor", "ruleSearch.author"],
        set: |d, v| d.search.author = text(v),
    },
    FieldMapping {
        keys: &["search.kind", "ruleSearchKind", "ruleSearch.kind"],
        set: |d, v| d.search.kind = text(v),
    },
    FieldMapping {
        keys: &["search.cover", "ruleSearchCoverUrl", "ruleSearch.coverUrl"],
        set: |d, v| d.search.cover = text(v),
    },
    FieldMapping {
        keys: &["search.intro", "ruleSearchIntroduce", "ruleSearch.intro"],
        set: |d, v| d.search.intro = text(v),
    },
    FieldMapping {
        keys: &["search.book_url", "ruleSearchNoteUrl", "ruleSearch.bookUrl"],
        set: |d, v| d.search.book_url = text(v),
    },
    // detail
    FieldMapping {
        keys: &["detail.name", "ruleBookName", "ruleBookInfo.name"],
        set: |d, v| d.detail.name = text(v),
    },
    FieldMapping {
        keys: &["detail.author", "ruleBookAuthor", "ruleBookInfo.author"],
        set: |d, v| d.detail.author = text(v),
    },
    FieldMapping {
        keys: &["detail.cover", "ruleCoverUrl", "ruleBookInfo.coverUrl"],
        set: |d, v| d.detail.cover = text(v),
    },
    FieldMapping {
        keys: &["detail.intro", "ruleIntroduce", "ruleBookInfo.intro"],
        set: |d, v| d.detail.intro = text(v),
    },
    FieldMapping {
        keys: &["detail.categories", "ruleBookKind", "ruleBookInfo.kind"],
        set: |d, v| d.detail.categories = text(v),
    },
    FieldMapping {
        keys: &["detail.chapter_url", "ruleChapterUrl", "ruleBookInfo.tocUrl"],
        set: |d, v| d.detail.chapter_url = text(v),
    },
    // chapters
    FieldMapping {
        keys: &["chapters.list", "ruleChapterList", "ruleToc.chapterList"],
        set: |d, v| d.chapters.list = text(v),
    },
    FieldMapping {
        keys: &["chapters.name", "ruleChapterName", "ruleToc.chapterName"],
        set: |d, v| d.chapters.name = text(v),
    },
    FieldMapping {
        keys: &["chapters.link", "ruleContentUrl", "ruleToc.chapterUrl"],
        set: |d, v| d.chapters.link = text(v),
    },
    // content
    FieldMapping {
        keys: &["content.selector", "ruleBookContent", "ruleContent.content"],
        set: |d, v| d.content.selector = text(v),
    },
    FieldMapping {
        keys: &[
            "content.filters",
            "ruleBookContentReplace",
            "ruleContent.replaceRegex",
        ],
        set: |d, v| d.content.filters = string_list(v),
    },
    // connection
    FieldMapping {
        keys: &["connection.headers", "header", "headers"],
        set: |d, v| d.connection.headers.extend(string_map(v)),
    },
    FieldMapping {
        keys: &["httpUserAgent"],
        set: |d, v| {
            if let Some(ua) = text(v) {
                d.connection
                    .headers
                    .entry("User-Agent".to_string())
                    .or_insert(ua);
            }
        },
    },
    FieldMapping {
        keys: &["connection.cookies", "cookies", "cookie"],
        set: |d, v| d.connection.cookies.extend(cookie_map(v)),
    },
    FieldMapping {
        keys: &["connection.charset", "charset"],
        set: |d, v| d.connection.charset = text(v),
    },
    FieldMapping {
        keys: &["connection.timeout_ms", "timeout", "respondTimeout"],
        set: |d, v| d.connection.timeout_ms = number(v).filter(|n| *n > 0),
    },
    FieldMapping {
        keys: &["connection.retry_count", "retry", "retryCount"],
        set: |d, v| {
            if let Some(n) = number(v) {
                d.connection.retry_count = n.min(u32::MAX as u64) as u32;
            }
        },
    },
    FieldMapping {
        keys: &["connection.requires_js", "requiresJs"],
        set: |d, v| d.connection.requires_js = flag(v).unwrap_or(false),
    },
    // stats
    FieldMapping {
        keys: &["stats.count", "usageCount"],
        set: |d, v| d.stats.count = number(v).unwrap_or(0),
    },
    FieldMapping {
        keys: &["stats.last_used", "lastUsed", "lastUpdateTime"],
        set: |d, v| d.stats.last_used = timestamp(v),
    },
    FieldMapping {
        keys: &["stats.rating", "rating"],
        set: |d, v| d.stats.rating = v.as_f64().unwrap_or(0.0) as f32,
    },
];

/// Normalizes one JSON value into a canonical definition.
///
/// Fails when the value is not an object or carries no usable name.
pub fn normalize(raw: &Value) -> Result<SourceDefinition, EngineError> {
    if !raw.is_object() {
        return Err(EngineError::config(
            Stage::Normalize,
            "source definition must be a JSON object",
        ));
    }

    let mut flat = BTreeMap::new();
    flatten("", raw, &mut flat);

    let mut def = SourceDefinition::new("", "");
    for mapping in FIELD_TABLE {
        let found = mapping
            .keys
            .iter()
            .filter_map(|key| flat.get(*key))
            .find(|value| !is_blank(value));
        if let Some(value) = found {
            (mapping.set)(&mut def, value);
        }
    }

    if def.name.trim().is_empty() {
        return Err(EngineError::config(
            Stage::Normalize,
            "source definition has no name",
        ));
    }
    def.name = def.name.trim().to_string();
    Ok(def)
}

/// Parses a JSON document and normalizes it.
pub fn normalize_str(json: &str) -> Result<SourceDefinition, EngineError> {
    let value: Value = serde_json::from_str(json).map_err(|e| {
        EngineError::parse(Stage::Normalize, "source definition is not valid JSON").caused_by(e)
    })?;
    normalize(&value)
}

/// Splits an import payload into its items: an array yields its elements, anything else is one item.
pub fn split_batch(json: &str) -> Result<Vec<Value>, EngineError> {
    let value: Value = serde_json::from_str(json).map_err(|e| {
        EngineError::parse(Stage::Import, "import payload is not valid JSON").caused_by(e)
    })?;
    Ok(match value {
        Value::Array(items) => items,
        other => vec![other],
    })
}

/// Records every object and leaf under its dotted path.
fn flatten(prefix: &str, value: &Value, out: &mut BTreeMap<String, Value>) {
    if !prefix.is_empty() {
        out.insert(prefix.to_string(), value.clone());
    }
    if let Value::Object(map) = value {
        for (key, child) in map {
            let path = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{prefix}.{key}")
            };
            flatten(&path, child, out);
        }
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn number(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        // Legacy exports store epoch milliseconds.
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

/// Accepts a JSON array, a newline separated string, or a single string.
fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().filter_map(text).collect(),
        Value::String(s) => s
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Accepts an object or a string holding a JSON object.
fn string_map(value: &Value) -> BTreeMap<String, String> {
    let parsed;
    let object = match value {
        Value::Object(map) => map,
        Value::String(s) => match serde_json::from_str::<Value>(s.trim()) {
            Ok(Value::Object(map)) => {
                parsed = map;
                &parsed
            }
            _ => return BTreeMap::new(),
        },
        _ => return BTreeMap::new(),
    };
    object
        .iter()
        .filter_map(|(k, v)| text(v).map(|v| (k.clone(), v)))
        .collect()
}

/// Like `string_map`, but also accepts a `k=v; k2=v2` cookie header string.
fn cookie_map(value: &Value) -> BTreeMap<String, String> {
    if let Value::String(s) = value {
        if !s.trim_start().starts_with('{') {
            return s
                .split(';')
                .filter_map(|pair| pair.split_once('='))
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .filter(|(k, _)| !k.is_empty())
                .collect();
        }
    }
    string_map(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn canonical_shape_round_trips() {
        let mut def = SourceDefinition::new("Canon", "https://canon.example/");
        def.group = "A,B".to_string();
        def.search.url = Some("https://canon.example/s?q={keyword}".to_string());
        def.search.list = Some("li.book".to_string());
        def.chapters.link = Some("a@href".to_string());
        def.content.filters = vec!["ad".to_string()];
        def.connection.retry_count = 3;
        def.connection.charset = Some("gbk".to_string());

        let value = serde_json::to_value(&def).unwrap();
        assert_eq!(normalize(&value).unwrap(), def);
    }

    #[test]
    fn flat_legacy_shape() {
        let raw = json!({
            "bookSourceName": "Legacy",
            "bookSourceUrl": "https://legacy.example",
            "bookSourceGroup": "old",
            "enable": false,
            "ruleSearchUrl": "https://legacy.example/s?k=searchKey",
            "ruleSearchList": "class.result",
            "ruleSearchName": "tag.a.text",
            "ruleSearchNoteUrl": "tag.a.href",
            "ruleChapterList": "id.list@tag.dd",
            "ruleContentUrl": "tag.a.href",
            "ruleBookContent": "id.content@textNodes",
            "httpUserAgent": "Legacy/1.0"
        });
        let def = normalize(&raw).unwrap();
        assert_eq!(def.name, "Legacy");
        assert_eq!(def.url, "https://legacy.example");
        assert_eq!(def.group, "old");
        assert!(!def.enabled);
        assert_eq!(def.search.list.as_deref(), Some("class.result"));
        assert_eq!(def.search.book_url.as_deref(), Some("tag.a.href"));
        assert_eq!(def.chapters.link.as_deref(), Some("tag.a.href"));
        assert_eq!(def.content.selector.as_deref(), Some("id.content@textNodes"));
        assert_eq!(
            def.connection.headers.get("User-Agent").map(String::as_str),
            Some("Legacy/1.0")
        );
    }

    #[test]
    fn nested_legacy_shape() {
        let raw = json!({
            "bookSourceName": "Nested",
            "bookSourceUrl": "https://nested.example",
            "searchUrl": "/search?q={{key}}",
            "header": "{\"Referer\":\"https://nested.example\"}",
            "ruleSearch": {"bookList": ".item", "name": ".t", "author": ".a", "bookUrl": "a@href"},
            "ruleBookInfo": {"intro": "#intro", "tocUrl": "a.toc@href"},
            "ruleToc": {"chapterList": "#list dd", "chapterName": "a", "chapterUrl": "a@href"},
            "ruleContent": {"content": "#content@html", "replaceRegex": "本章未完\n请收藏"}
        });
        let def = normalize(&raw).unwrap();
        assert_eq!(def.search.url.as_deref(), Some("/search?q={{key}}"));
        assert_eq!(def.search.list.as_deref(), Some(".item"));
        assert_eq!(def.search.author.as_deref(), Some(".a"));
        assert_eq!(def.detail.chapter_url.as_deref(), Some("a.toc@href"));
        assert_eq!(def.chapters.list.as_deref(), Some("#list dd"));
        assert_eq!(def.content.selector.as_deref(), Some("#content@html"));
        assert_eq!(def.content.filters, vec!["本章未完", "请收藏"]);
        assert_eq!(
            def.connection.headers.get("Referer").map(String::as_str),
            Some("https://nested.example")
        );
        assert!(def.enabled);
    }

    #[test]
    fn canonical_key_wins_over_legacy_alias() {
        let raw = json!({"name": "Both", "bookSourceName": "Legacy", "search": {"list": "new"}, "ruleSearchList": "old"});
        let def = normalize(&raw).unwrap();
        assert_eq!(def.name, "Both");
        assert_eq!(def.search.list.as_deref(), Some("new"));
    }

    #[test]
    fn empty_strings_become_absent() {
        let raw = json!({"name": "E", "search": {"list": "  ", "name": ""}});
        let def = normalize(&raw).unwrap();
        assert_eq!(def.search.list, None);
        assert_eq!(def.search.name, None);
    }

    #[test]
    fn missing_name_is_config_error() {
        let err = normalize(&json!({"url": "https://x.example"})).unwrap_err();
        assert!(err.is_config());
        let err = normalize(&json!("just a string")).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn cookies_accept_header_string() {
        let raw = json!({"name": "C", "cookie": "sid=abc; theme = dark"});
        let def = normalize(&raw).unwrap();
        assert_eq!(def.connection.cookies.get("sid").map(String::as_str), Some("abc"));
        assert_eq!(def.connection.cookies.get("theme").map(String::as_str), Some("dark"));
    }

    #[test]
    fn epoch_millis_last_used() {
        let raw = json!({"name": "T", "lastUpdateTime": 1_700_000_000_000i64});
        let def = normalize(&raw).unwrap();
        assert_eq!(
            def.stats.last_used.map(|t| t.timestamp()),
            Some(1_700_000_000)
        );
    }

    #[test]
    fn split_batch_accepts_object_or_array() {
        assert_eq!(split_batch(r#"{"name":"a"}"#).unwrap().len(), 1);
        assert_eq!(split_batch(r#"[{"name":"a"}, 3]"#).unwrap().len(), 2);
        assert!(split_batch("not json").unwrap_err().is_parse());
    }

    #[test]
    fn normalize_str_reports_parse_errors() {
        assert!(normalize_str("{").unwrap_err().is_parse());
        assert_eq!(normalize_str(r#"{"name":" N "}"#).unwrap().name, "N");
    }
}
