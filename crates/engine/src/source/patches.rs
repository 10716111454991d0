// ABOUTME: Ordered table of known-issue patches applied to canonical source definitions.
// ABOUTME: Each patch is a plain function over the definition; apply_all reports which ones changed it.

use std::collections::BTreeMap;

use tracing::debug;
use url::Url;

use crate::source::SourceDefinition;

/// Sites that moved to a new domain while community rules kept the old one.
pub const KNOWN_DOMAIN_ALIASES: &[(&str, &str)] = &[
    ("www.biquge.com", "www.biqooge.com"),
    ("www.xbiquge.la", "www.xbiqugu.info"),
    ("www.qu.la", "www.quge3.com"),
];

/// Keyword placeholder spellings found in the wild, longest first.
pub const KEYWORD_PLACEHOLDERS: &[&str] = &[
    "{{searchKey}}",
    "{{keyword}}",
    "{{key}}",
    "{searchKey}",
    "{keyword}",
    "{query}",
    "{key}",
    "searchKey",
    "%s",
];

/// Page-number placeholder spellings, longest first.
pub const PAGE_PLACEHOLDERS: &[&str] = &["{{searchPage}}", "{{page}}", "{searchPage}", "{page}", "searchPage"];

/// Settings a patch may consult.
#[derive(Debug, Clone, Copy)]
pub struct PatchContext<'a> {
    pub domain_aliases: &'a BTreeMap<String, String>,
}

/// A patch rewrites the definition in place and returns whether it changed anything.
pub type Patch = fn(&mut SourceDefinition, PatchContext<'_>) -> bool;

/// Patches in application order.
pub const PATCHES: &[(&str, Patch)] = &[
    ("domain-alias", substitute_domains),
    ("inline-url-options", split_inline_url_options),
    ("placeholder-spelling", unify_placeholders),
    ("stray-filters", trim_filters),
];

/// The built-in alias table as an owned map.
pub fn default_domain_aliases() -> BTreeMap<String, String> {
    KNOWN_DOMAIN_ALIASES
        .iter()
        .map(|(from, to)| (from.to_string(), to.to_string()))
        .collect()
}

/// Runs every patch in order and returns the names of those that applied.
pub fn apply_all(def: &mut SourceDefinition, ctx: PatchContext<'_>) -> Vec<&'static str> {
    let mut applied = Vec::new();
    for (name, patch) in PATCHES {
        if patch(def, ctx) {
            debug!(source = %def.name, patch = name, "applied source patch");
            applied.push(*name);
        }
    }
    applied
}

/// Swaps the host of `raw` when it appears in the alias table.
pub fn alias_host(raw: &str, aliases: &BTreeMap<String, String>) -> Option<String> {
    if aliases.is_empty() {
        return None;
    }
    let mut parsed = Url::parse(raw).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let replacement = aliases.get(&host)?;
    parsed.set_host(Some(replacement)).ok()?;
    Some(parsed.to_string())
}

fn substitute_domains(def: &mut SourceDefinition, ctx: PatchContext<'_>) -> bool {
    let mut changed = false;
    if let Some(swapped) = alias_host(&def.url, ctx.domain_aliases) {
        def.url = swapped;
        changed = true;
    }
    if let Some(template) = def.search.url.as_mut() {
        // Templates contain placeholders that Url would percent-encode; swap the host text directly.
        for (from, to) in ctx.domain_aliases {
            let needle = format!("://{from}");
            if template.contains(&needle) {
                *template = template.replace(&needle, &format!("://{to}"));
                changed = true;
            }
        }
    }
    changed
}

/// Splits `url,{"charset":"gbk","headers":{..}}` into the URL and connection settings.
fn split_inline_url_options(def: &mut SourceDefinition, _ctx: PatchContext<'_>) -> bool {
    let Some(template) = def.search.url.clone() else {
        return false;
    };
    let Some(idx) = template.find(",{") else {
        return false;
    };
    let (url_part, options_part) = template.split_at(idx);
    let Ok(serde_json::Value::Object(options)) =
        serde_json::from_str::<serde_json::Value>(&options_part[1..])
    else {
        return false;
    };

    if let Some(charset) = options.get("charset").and_then(|v| v.as_str()) {
        if def.connection.charset.is_none() && !charset.trim().is_empty() {
            def.connection.charset = Some(charset.trim().to_string());
        }
    }
    if let Some(serde_json::Value::Object(headers)) = options.get("headers") {
        for (key, value) in headers {
            if let Some(value) = value.as_str() {
                def.connection
                    .headers
                    .entry(key.clone())
                    .or_insert_with(|| value.to_string());
            }
        }
    }
    for ignored in options.keys().filter(|k| *k != "charset" && *k != "headers") {
        debug!(source = %def.name, option = %ignored, "ignoring inline url option");
    }
    def.search.url = Some(url_part.trim().to_string());
    true
}

/// Rewrites every known placeholder spelling in a URL template to `{keyword}` / `{page}`.
pub fn canonical_placeholders(template: &str) -> String {
    let mut out = template.to_string();
    for spelling in PAGE_PLACEHOLDERS {
        if *spelling != "{page}" && out.contains(spelling) {
            out = out.replace(spelling, "{page}");
        }
    }
    for spelling in KEYWORD_PLACEHOLDERS {
        if *spelling != "{keyword}" && out.contains(spelling) {
            out = out.replace(spelling, "{keyword}");
        }
    }
    // Replacing a bare spelling can wrap an already-canonical one, e.g. "{searchKey}" -> "{{keyword}}".
    while out.contains("{{keyword}}") || out.contains("{{page}}") {
        out = out.replace("{{keyword}}", "{keyword}").replace("{{page}}", "{page}");
    }
    out
}

fn unify_placeholders(def: &mut SourceDefinition, _ctx: PatchContext<'_>) -> bool {
    let Some(template) = def.search.url.as_mut() else {
        return false;
    };
    let unified = canonical_placeholders(template);
    if unified == *template {
        return false;
    }
    *template = unified;
    true
}

fn trim_filters(def: &mut SourceDefinition, _ctx: PatchContext<'_>) -> bool {
    let original = def.content.filters.clone();
    let mut seen = Vec::with_capacity(original.len());
    for filter in &original {
        let trimmed = filter.trim();
        if trimmed.is_empty() || seen.iter().any(|f: &String| f == trimmed) {
            continue;
        }
        seen.push(trimmed.to_string());
    }
    def.content.filters = seen;
    def.content.filters != original
}
