// ABOUTME: URL resolution for rule-produced hrefs: absolute, protocol/root-relative, query/fragment-only, relative.
// ABOUTME: Sanitizes unsubstituted placeholders first; an empty return value means "drop this result".

//! URL resolution.
//!
//! Rules on community-authored sources produce every flavour of href. `resolve`
//! turns them into absolute URLs the fetcher can use, matching what a browser
//! computes for the same base. Anything that cannot be made absolute comes back
//! as an empty string; callers drop the result rather than fail.

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{[^}]*\}\}|\$\{[^}]*\}|\{[^{}]*\}").unwrap());

/// Removes template placeholders and the literal `undefined` left behind by broken rules.
fn sanitize(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches(|c| c == '"' || c == '\'');
    let without_placeholders = PLACEHOLDER_RE.replace_all(trimmed, "");
    without_placeholders
        .replace("undefined", "")
        .replace("\\/", "/")
        .trim()
        .to_string()
}

/// True when nothing addressable survives sanitizing.
fn is_unusable(s: &str) -> bool {
    s.chars().all(|c| matches!(c, '/' | '?' | '#' | '&' | '=' | '.'))
}

fn has_http_scheme(s: &str) -> bool {
    let lower = s.get(..8).unwrap_or(s).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Returns `scheme://host[:port]` for a parsed base.
fn origin_of(base: &Url) -> Option<String> {
    let host = base.host_str()?;
    Some(match base.port() {
        Some(port) => format!("{}://{}:{}", base.scheme(), host, port),
        None => format!("{}://{}", base.scheme(), host),
    })
}

fn validated(candidate: String) -> String {
    match Url::parse(&candidate) {
        Ok(_) => candidate,
        Err(_) => String::new(),
    }
}

/// Resolves `raw` against `base`, returning an absolute URL or an empty string.
///
/// Resolution order:
/// 1. already absolute (stray spaces repaired), returned as-is when it parses
/// 2. protocol-relative `//host/path` takes the base scheme
/// 3. root-relative `/path` takes the base origin
/// 4. query-only `?x=y` replaces the base query
/// 5. fragment-only `#x` replaces the base fragment
/// 6. relative path via structured join, falling back to a manual segment stack
pub fn resolve(raw: &str, base: &str) -> String {
    let cleaned = sanitize(raw);
    if cleaned.is_empty() || is_unusable(&cleaned) {
        return String::new();
    }
    if cleaned.to_ascii_lowercase().starts_with("javascript:") {
        return String::new();
    }

    if has_http_scheme(&cleaned) {
        return validated(cleaned.replace(' ', "%20"));
    }

    let base_url = match Url::parse(&base.trim().replace(' ', "%20")) {
        Ok(u) => u,
        Err(_) => return String::new(),
    };

    if let Some(rest) = cleaned.strip_prefix("//") {
        return validated(format!("{}://{}", base_url.scheme(), rest.replace(' ', "%20")));
    }

    let Some(origin) = origin_of(&base_url) else {
        return String::new();
    };

    if cleaned.starts_with('/') {
        return validated(format!("{}{}", origin, cleaned.replace(' ', "%20")));
    }

    if cleaned.starts_with('?') {
        let mut stripped = base_url.clone();
        stripped.set_query(None);
        stripped.set_fragment(None);
        return validated(format!("{}{}", stripped, cleaned.replace(' ', "%20")));
    }

    if cleaned.starts_with('#') {
        let mut stripped = base_url.clone();
        stripped.set_fragment(None);
        return validated(format!("{}{}", stripped, cleaned.replace(' ', "%20")));
    }

    match base_url.join(&cleaned) {
        Ok(joined) => joined.to_string(),
        Err(_) => manual_join(&base_url, &origin, &cleaned),
    }
}

/// Resolves a relative path by walking segments against the base directory.
fn manual_join(base: &Url, origin: &str, rel: &str) -> String {
    let split_at = rel.find(|c| c == '?' || c == '#').unwrap_or(rel.len());
    let (rel_path, suffix) = rel.split_at(split_at);

    let mut stack: Vec<&str> = base.path().split('/').filter(|s| !s.is_empty()).collect();
    if !base.path().ends_with('/') {
        stack.pop();
    }

    for segment in rel_path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            other => stack.push(other),
        }
    }

    let mut out = format!("{}/{}", origin, stack.join("/"));
    if rel_path.ends_with('/') && !stack.is_empty() {
        out.push('/');
    }
    out.push_str(suffix);
    validated(out.replace(' ', "%20"))
}
