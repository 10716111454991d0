// ABOUTME: HTTP fetching for source pages: header/cookie merge, retries with backoff, size cap and charset decoding.
// ABOUTME: Errors are classified into timeout, DNS, HTTP status and transport so callers can tell them apart.

//! Page fetching.
//!
//! [`Fetcher`] wraps one shared `reqwest::Client`. Each call merges the engine
//! default headers with the source's own headers and cookies, applies the
//! source timeout, and retries transient failures. Bodies are decoded to text
//! using, in order: the source's explicit charset, the `Content-Type` header,
//! a `<meta>` declaration near the top of the document, UTF-8 when the bytes
//! are valid UTF-8, and finally statistical detection.

pub mod dns;

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::bytes::Regex as BytesRegex;
use tracing::{debug, warn};
use url::Url;

use crate::error::{EngineError, ErrorCode, Stage};
use crate::options::{DnsMode, EngineOptions};
use crate::resource::dns::{is_dns_error, DualResolver};
use crate::source::patches::alias_host;
use crate::source::ConnectionSettings;

/// Maximum allowed body size (10 MB).
pub const MAX_CONTENT_LENGTH: usize = 10 * 1024 * 1024;

/// How far into the body to look for a `<meta>` charset declaration.
const META_SCAN_BYTES: usize = 1024;

/// Base delay between retries; attempt `n` waits `n` times this.
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

static META_CHARSET_RE: Lazy<BytesRegex> =
    Lazy::new(|| BytesRegex::new(r#"(?i)charset\s*=\s*["']?([A-Za-z0-9_\-]+)"#).unwrap());

/// Result of a successful fetch.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub status: u16,
    pub url: String,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Bytes,
    /// Body decoded to text.
    pub text: String,
    /// Label of the encoding used to decode `text`.
    pub encoding: &'static str,
}

/// Shared HTTP client plus the engine-wide request defaults.
#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    timeout: Duration,
    headers: BTreeMap<String, String>,
    domain_aliases: BTreeMap<String, String>,
}

impl Fetcher {
    /// Builds the client from engine options, or reuses `opts.http_client` when set.
    pub fn new(opts: &EngineOptions) -> Result<Self, EngineError> {
        let client = match &opts.http_client {
            Some(client) => client.clone(),
            None => build_client(opts)?,
        };
        Ok(Self {
            client,
            timeout: opts.timeout,
            headers: opts.headers.clone(),
            domain_aliases: opts.domain_aliases.clone(),
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Fetches `url` with the source's connection settings.
    ///
    /// Transient failures are retried up to `conn.retry_count` times with linear
    /// backoff. Client errors other than 408 and 429 fail immediately.
    pub async fn fetch(
        &self,
        url: &str,
        conn: &ConnectionSettings,
        stage: Stage,
        source_name: &str,
    ) -> Result<FetchResult, EngineError> {
        let target = alias_host(url, &self.domain_aliases).unwrap_or_else(|| url.to_string());
        let parsed = Url::parse(&target).map_err(|e| {
            EngineError::invalid_url(stage, url)
                .for_source(source_name)
                .caused_by(e)
        })?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(EngineError::invalid_url(stage, url)
                .for_source(source_name)
                .message("scheme must be http or https"));
        }

        let timeout = conn
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.timeout);

        let mut attempt: u32 = 0;
        loop {
            match self.fetch_once(&parsed, conn, timeout).await {
                Ok(result) => return Ok(result),
                Err(code_and_cause) => {
                    let err = code_and_cause
                        .into_error(stage)
                        .for_source(source_name)
                        .at_url(target.as_str());
                    if attempt >= conn.retry_count || !err.is_retryable() {
                        return Err(err);
                    }
                    attempt += 1;
                    let delay = RETRY_BACKOFF * attempt;
                    debug!(
                        source = source_name,
                        url = %target,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying fetch"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn fetch_once(
        &self,
        url: &Url,
        conn: &ConnectionSettings,
        timeout: Duration,
    ) -> Result<FetchResult, FetchFailure> {
        let mut request = self.client.get(url.clone()).timeout(timeout);
        for (key, value) in merged_headers(&self.headers, conn) {
            request = request.header(key, value);
        }

        let response = request.send().await.map_err(FetchFailure::from_reqwest)?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Err(FetchFailure::new(ErrorCode::HttpStatus(status), None));
        }

        if let Some(len) = response.content_length() {
            if len as usize > MAX_CONTENT_LENGTH {
                return Err(FetchFailure::too_large());
            }
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_ascii_lowercase());

        let body = response.bytes().await.map_err(FetchFailure::from_reqwest)?;
        if body.len() > MAX_CONTENT_LENGTH {
            return Err(FetchFailure::too_large());
        }

        let (text, encoding) = decode_body(&body, conn.charset.as_deref(), content_type.as_deref());
        Ok(FetchResult {
            status,
            url: url.to_string(),
            final_url,
            content_type,
            body,
            text,
            encoding,
        })
    }
}

/// A failed attempt, before it is tagged with stage and source.
struct FetchFailure {
    code: ErrorCode,
    cause: Option<anyhow::Error>,
}

impl FetchFailure {
    fn new(code: ErrorCode, cause: Option<anyhow::Error>) -> Self {
        Self { code, cause }
    }

    fn too_large() -> Self {
        Self::new(
            ErrorCode::Transport,
            Some(anyhow::anyhow!(
                "response exceeds {} bytes",
                MAX_CONTENT_LENGTH
            )),
        )
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        let code = if err.is_timeout() {
            ErrorCode::Timeout
        } else if is_dns_error(&err) {
            ErrorCode::DnsFailure
        } else if let Some(status) = err.status() {
            ErrorCode::HttpStatus(status.as_u16())
        } else {
            ErrorCode::Transport
        };
        Self::new(code, Some(err.into()))
    }

    fn into_error(self, stage: Stage) -> EngineError {
        let err = EngineError::new(self.code, stage);
        match self.cause {
            Some(cause) => err.caused_by(cause),
            None => err,
        }
    }
}

fn build_client(opts: &EngineOptions) -> Result<reqwest::Client, EngineError> {
    let mut builder = reqwest::Client::builder()
        .user_agent(opts.user_agent.clone())
        .cookie_store(true)
        .gzip(true)
        .brotli(true)
        .deflate(true)
        .connect_timeout(opts.timeout)
        .redirect(reqwest::redirect::Policy::limited(10));
    if let DnsMode::Public { primary, secondary } = opts.dns {
        builder = builder.dns_resolver(Arc::new(DualResolver::new(primary, secondary)));
    }
    builder.build().map_err(|e| {
        EngineError::config(Stage::Fetch, "failed to build HTTP client").caused_by(e)
    })
}

/// Engine defaults overlaid with the source's headers, plus a `Cookie` header from its cookie map.
fn merged_headers(
    defaults: &BTreeMap<String, String>,
    conn: &ConnectionSettings,
) -> Vec<(String, String)> {
    let mut merged: BTreeMap<String, (String, String)> = BTreeMap::new();
    for (key, value) in defaults.iter().chain(conn.headers.iter()) {
        merged.insert(key.to_ascii_lowercase(), (key.clone(), value.clone()));
    }
    if !conn.cookies.is_empty() {
        let cookie = conn
            .cookies
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("; ");
        merged.insert("cookie".to_string(), ("Cookie".to_string(), cookie));
    }
    merged.into_values().collect()
}

/// True for hosts that must not be fetched on behalf of a source: loopback, unspecified or missing.
pub fn is_loopback_or_null_host(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return true;
    };
    match parsed.host() {
        None => true,
        Some(url::Host::Domain(domain)) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            domain.is_empty() || domain == "localhost" || domain.ends_with(".localhost")
        }
        Some(url::Host::Ipv4(ip)) => {
            let ip = IpAddr::V4(ip);
            ip.is_loopback() || ip.is_unspecified()
        }
        Some(url::Host::Ipv6(ip)) => {
            let ip = IpAddr::V6(ip);
            ip.is_loopback() || ip.is_unspecified()
        }
    }
}

/// Decodes body bytes, returning the text and the label of the encoding used.
pub fn decode_body(
    body: &[u8],
    explicit: Option<&str>,
    content_type: Option<&str>,
) -> (String, &'static str) {
    let declared = explicit
        .and_then(lookup_encoding)
        .or_else(|| content_type.and_then(extract_charset).and_then(|c| lookup_encoding(&c)))
        .or_else(|| sniff_meta_charset(body).and_then(|c| lookup_encoding(&c)));

    let encoding = match declared {
        Some(encoding) => encoding,
        None if std::str::from_utf8(body).is_ok() => encoding_rs::UTF_8,
        None => {
            let mut detector = chardetng::EncodingDetector::new();
            detector.feed(body, true);
            detector.guess(None, true)
        }
    };

    let (decoded, _, had_errors) = encoding.decode(body);
    if had_errors {
        warn!(encoding = encoding.name(), "body contained bytes invalid for its charset");
    }
    (decoded.into_owned(), encoding.name())
}

fn lookup_encoding(label: &str) -> Option<&'static encoding_rs::Encoding> {
    let label = label.trim();
    // gb2312 pages routinely contain gbk-only characters.
    let label = if label.eq_ignore_ascii_case("gb2312") {
        "gbk"
    } else {
        label
    };
    encoding_rs::Encoding::for_label(label.as_bytes())
}

/// Extract charset value from Content-Type header.
fn extract_charset(content_type: &str) -> Option<String> {
    let lower = content_type.to_lowercase();
    for part in lower.split(';') {
        let trimmed = part.trim();
        if let Some(charset) = trimmed.strip_prefix("charset=") {
            let charset = charset.trim_matches('"').trim_matches('\'');
            return Some(charset.to_string());
        }
    }
    None
}

/// Finds a charset declared by `<meta charset>` or `<meta http-equiv>` near the top of the document.
fn sniff_meta_charset(body: &[u8]) -> Option<String> {
    let head = &body[..body.len().min(META_SCAN_BYTES)];
    let caps = META_CHARSET_RE.captures(head)?;
    let label = caps.get(1)?;
    std::str::from_utf8(label.as_bytes()).ok().map(str::to_string)
}
