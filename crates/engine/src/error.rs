// ABOUTME: Error types for the engine including the ErrorCode enum, Stage enum and EngineError struct.
// ABOUTME: Every error carries source name, URL and stage so a failure can be reproduced from the log line.

use std::fmt;
use std::time::Duration;

/// Error codes representing different categories of engine failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// A rule required by the operation is missing or the definition is unusable.
    Config,
    InvalidUrl,
    Timeout,
    DnsFailure,
    HttpStatus(u16),
    /// Connection-level failure that is neither a timeout nor a DNS failure.
    Transport,
    /// The page was fetched but nothing usable could be extracted.
    Parse,
    AggregateTimeout,
    NotFound,
    Storage,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Config => write!(f, "config error"),
            ErrorCode::InvalidUrl => write!(f, "invalid URL"),
            ErrorCode::Timeout => write!(f, "timeout"),
            ErrorCode::DnsFailure => write!(f, "DNS failure"),
            ErrorCode::HttpStatus(status) => write!(f, "HTTP status {}", status),
            ErrorCode::Transport => write!(f, "transport error"),
            ErrorCode::Parse => write!(f, "parse error"),
            ErrorCode::AggregateTimeout => write!(f, "aggregate search timeout"),
            ErrorCode::NotFound => write!(f, "not found"),
            ErrorCode::Storage => write!(f, "storage error"),
        }
    }
}

/// The pipeline stage an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Normalize,
    Search,
    Detail,
    Chapters,
    Content,
    Registry,
    Orchestrate,
    Import,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Fetch => "fetch",
            Stage::Normalize => "normalize",
            Stage::Search => "search",
            Stage::Detail => "detail",
            Stage::Chapters => "chapters",
            Stage::Content => "content",
            Stage::Registry => "registry",
            Stage::Orchestrate => "orchestrate",
            Stage::Import => "import",
        };
        write!(f, "{}", s)
    }
}

/// The main error type for engine operations.
#[derive(Debug, thiserror::Error)]
pub struct EngineError {
    pub code: ErrorCode,
    pub stage: Stage,
    /// Name of the source definition involved, empty when not source-specific.
    pub source_name: String,
    pub url: String,
    #[source]
    pub source: Option<anyhow::Error>,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shelf: {}", self.stage)?;
        if !self.source_name.is_empty() {
            write!(f, " [{}]", self.source_name)?;
        }
        if !self.url.is_empty() {
            write!(f, " {}", self.url)?;
        }
        write!(f, ": {}", self.code)?;
        if let Some(ref src) = self.source {
            write!(f, ": {:#}", src)?;
        }
        Ok(())
    }
}

impl EngineError {
    /// Create a bare error for the given code and stage.
    pub fn new(code: ErrorCode, stage: Stage) -> Self {
        Self {
            code,
            stage,
            source_name: String::new(),
            url: String::new(),
            source: None,
        }
    }

    /// Attach the name of the source definition involved.
    pub fn for_source(mut self, name: impl Into<String>) -> Self {
        self.source_name = name.into();
        self
    }

    /// Attach the URL being processed.
    pub fn at_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Attach an underlying cause. A message set earlier is kept as context.
    pub fn caused_by(mut self, err: impl Into<anyhow::Error>) -> Self {
        let err = err.into();
        self.source = Some(match self.source.take() {
            Some(msg) => err.context(msg.to_string()),
            None => err,
        });
        self
    }

    /// Attach a plain message, as context for any cause already present.
    pub fn message(mut self, msg: impl fmt::Display) -> Self {
        self.source = Some(match self.source.take() {
            Some(cause) => cause.context(msg.to_string()),
            None => anyhow::anyhow!("{}", msg),
        });
        self
    }

    /// Create a Config error: a rule the operation needs is missing or invalid.
    pub fn config(stage: Stage, msg: impl fmt::Display) -> Self {
        Self::new(ErrorCode::Config, stage).message(msg)
    }

    /// Create a Parse error.
    pub fn parse(stage: Stage, msg: impl fmt::Display) -> Self {
        Self::new(ErrorCode::Parse, stage).message(msg)
    }

    /// Create an InvalidUrl error.
    pub fn invalid_url(stage: Stage, url: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidUrl, stage).at_url(url)
    }

    /// Create a NotFound error naming the missing entity.
    pub fn not_found(stage: Stage, what: impl fmt::Display) -> Self {
        Self::new(ErrorCode::NotFound, stage).message(format!("{} not found", what))
    }

    /// Create a Storage error wrapping a persistence failure.
    pub fn storage(err: impl Into<anyhow::Error>) -> Self {
        Self::new(ErrorCode::Storage, Stage::Registry).caused_by(err)
    }

    /// Create an AggregateTimeout error for a fan-out search.
    pub fn aggregate_timeout(after: Duration) -> Self {
        Self::new(ErrorCode::AggregateTimeout, Stage::Orchestrate).message(format!(
            "not all sources completed within {}ms",
            after.as_millis()
        ))
    }

    /// Returns true if this is a per-request Timeout error.
    pub fn is_timeout(&self) -> bool {
        self.code == ErrorCode::Timeout
    }

    /// Returns true if this is an AggregateTimeout error.
    pub fn is_aggregate_timeout(&self) -> bool {
        self.code == ErrorCode::AggregateTimeout
    }

    /// Returns true if this is a DnsFailure error.
    pub fn is_dns_failure(&self) -> bool {
        self.code == ErrorCode::DnsFailure
    }

    /// Returns the HTTP status if this is an HttpStatus error.
    pub fn http_status(&self) -> Option<u16> {
        match self.code {
            ErrorCode::HttpStatus(status) => Some(status),
            _ => None,
        }
    }

    /// Returns true if this is a Config error.
    pub fn is_config(&self) -> bool {
        self.code == ErrorCode::Config
    }

    /// Returns true if this is a Parse error.
    pub fn is_parse(&self) -> bool {
        self.code == ErrorCode::Parse
    }

    /// Returns true if this is an InvalidUrl error.
    pub fn is_invalid_url(&self) -> bool {
        self.code == ErrorCode::InvalidUrl
    }

    /// Returns true if this is a NotFound error.
    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::NotFound
    }

    /// Returns true for the network family: timeout, DNS, HTTP status and transport errors.
    pub fn is_network(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::Timeout
                | ErrorCode::DnsFailure
                | ErrorCode::HttpStatus(_)
                | ErrorCode::Transport
        )
    }

    /// Returns true if a fetch-level retry may succeed.
    ///
    /// Client errors other than 408 and 429 are deterministic and not retried.
    pub fn is_retryable(&self) -> bool {
        match self.code {
            ErrorCode::HttpStatus(status) => status >= 500 || status == 408 || status == 429,
            ErrorCode::Timeout | ErrorCode::DnsFailure | ErrorCode::Transport => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_stage_source_url_and_cause() {
        let err = EngineError::parse(Stage::Detail, "no name matched")
            .for_source("Example Books")
            .at_url("https://books.example/b/1");
        assert_eq!(
            err.to_string(),
            "shelf: detail [Example Books] https://books.example/b/1: parse error: no name matched"
        );
    }

    #[test]
    fn display_omits_empty_parts() {
        let err = EngineError::new(ErrorCode::Storage, Stage::Registry);
        assert_eq!(err.to_string(), "shelf: registry: storage error");
    }

    #[test]
    fn message_and_cause_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err = EngineError::storage(io).message("could not save sources");
        assert_eq!(
            err.to_string(),
            "shelf: registry: storage error: could not save sources: disk full"
        );
    }

    #[test]
    fn retryable_classification() {
        assert!(EngineError::new(ErrorCode::Timeout, Stage::Fetch).is_retryable());
        assert!(EngineError::new(ErrorCode::HttpStatus(503), Stage::Fetch).is_retryable());
        assert!(EngineError::new(ErrorCode::HttpStatus(429), Stage::Fetch).is_retryable());
        assert!(!EngineError::new(ErrorCode::HttpStatus(404), Stage::Fetch).is_retryable());
        assert!(!EngineError::config(Stage::Search, "missing list rule").is_retryable());
    }

    #[test]
    fn network_family() {
        assert!(EngineError::new(ErrorCode::DnsFailure, Stage::Fetch).is_network());
        assert!(EngineError::new(ErrorCode::HttpStatus(404), Stage::Fetch).is_network());
        assert!(!EngineError::aggregate_timeout(Duration::from_millis(200)).is_network());
        assert_eq!(
            EngineError::new(ErrorCode::HttpStatus(404), Stage::Fetch).http_status(),
            Some(404)
        );
    }
}
