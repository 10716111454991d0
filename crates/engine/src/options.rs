// ABOUTME: Configuration options for the engine including DnsMode, EngineOptions and EngineBuilder.
// ABOUTME: EngineBuilder provides a fluent API; EngineOptions::from_env overlays SHELF_* variables.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use crate::engine::Engine;
use crate::error::EngineError;
use crate::registry::store::{MemoryStore, SourceStore};
use crate::source::patches::KNOWN_DOMAIN_ALIASES;

/// Default desktop browser User-Agent; many reading sites serve stripped pages to unknown agents.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Primary public resolver.
pub const PRIMARY_RESOLVER: IpAddr = IpAddr::V4(Ipv4Addr::new(223, 5, 5, 5));
/// Secondary public resolver, consulted when the primary fails or answers with a null address.
pub const SECONDARY_RESOLVER: IpAddr = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));

/// How hostnames are resolved by the fetcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsMode {
    /// Use the operating system resolver.
    System,
    /// Query two fixed public resolvers, falling back to the secondary once.
    Public { primary: IpAddr, secondary: IpAddr },
}

impl Default for DnsMode {
    fn default() -> Self {
        DnsMode::Public {
            primary: PRIMARY_RESOLVER,
            secondary: SECONDARY_RESOLVER,
        }
    }
}

/// Configuration options for the engine.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Per-request timeout when a definition does not set one.
    pub timeout: Duration,
    pub user_agent: String,
    /// Default header set; source headers are merged over it.
    pub headers: BTreeMap<String, String>,
    /// Aggregate deadline for a fan-out search when the caller does not pass one.
    pub search_timeout: Duration,
    pub max_concurrent_sources: usize,
    pub dns: DnsMode,
    /// Known-bad host -> working host substitutions applied to definitions and URLs.
    pub domain_aliases: BTreeMap<String, String>,
    /// Permit loopback/null hosts in search URLs. Off outside of tests.
    pub allow_loopback: bool,
    pub task_retention: Duration,
    pub reaper_interval: Duration,
    /// Maximum number of per-item entries kept in a task's detail log.
    pub task_log_cap: usize,
    pub http_client: Option<reqwest::Client>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        let mut headers = BTreeMap::new();
        headers.insert(
            "Accept".to_string(),
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string(),
        );
        headers.insert(
            "Accept-Language".to_string(),
            "zh-CN,zh;q=0.9,en;q=0.8".to_string(),
        );

        Self {
            timeout: Duration::from_secs(15),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            headers,
            search_timeout: Duration::from_secs(30),
            max_concurrent_sources: 16,
            dns: DnsMode::default(),
            domain_aliases: KNOWN_DOMAIN_ALIASES
                .iter()
                .map(|(from, to)| (from.to_string(), to.to_string()))
                .collect(),
            allow_loopback: false,
            task_retention: Duration::from_secs(24 * 60 * 60),
            reaper_interval: Duration::from_secs(10 * 60),
            task_log_cap: 500,
            http_client: None,
        }
    }
}

impl EngineOptions {
    /// Defaults overlaid with any `SHELF_*` environment variables that parse.
    pub fn from_env() -> Self {
        let mut opts = Self::default();
        if let Some(ms) = read_env_u64("SHELF_TIMEOUT_MS") {
            opts.timeout = Duration::from_millis(ms.max(1));
        }
        if let Some(ms) = read_env_u64("SHELF_SEARCH_TIMEOUT_MS") {
            opts.search_timeout = Duration::from_millis(ms.max(1));
        }
        if let Some(n) = read_env_u64("SHELF_MAX_CONCURRENCY") {
            opts.max_concurrent_sources = (n as usize).max(1);
        }
        if let Some(ua) = read_env_string("SHELF_USER_AGENT") {
            opts.user_agent = ua;
        }
        if let Some(secs) = read_env_u64("SHELF_TASK_RETENTION_SECS") {
            opts.task_retention = Duration::from_secs(secs);
        }
        if let Some(flag) = read_env_string("SHELF_ALLOW_LOOPBACK") {
            opts.allow_loopback = matches!(
                flag.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes"
            );
        }
        match read_env_string("SHELF_DNS")
            .map(|mode| mode.to_ascii_lowercase())
            .as_deref()
        {
            Some("system") => opts.dns = DnsMode::System,
            Some("public") | None => {
                let primary = read_env_ip("SHELF_DNS_PRIMARY").unwrap_or(PRIMARY_RESOLVER);
                let secondary = read_env_ip("SHELF_DNS_SECONDARY").unwrap_or(SECONDARY_RESOLVER);
                opts.dns = DnsMode::Public { primary, secondary };
            }
            Some(other) => {
                tracing::warn!("ignoring unknown SHELF_DNS mode: {other}");
            }
        }
        opts
    }
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn read_env_u64(name: &str) -> Option<u64> {
    read_env_string(name).and_then(|v| v.parse().ok())
}

fn read_env_ip(name: &str) -> Option<IpAddr> {
    read_env_string(name).and_then(|v| v.parse().ok())
}

/// Builder for constructing Engine instances with custom configuration.
#[derive(Clone)]
pub struct EngineBuilder {
    opts: EngineOptions,
    store: Option<Arc<dyn SourceStore>>,
}

impl EngineBuilder {
    /// Create a new EngineBuilder with default options.
    pub fn new() -> Self {
        Self {
            opts: EngineOptions::default(),
            store: None,
        }
    }

    /// Start from an existing set of options.
    pub fn with_options(opts: EngineOptions) -> Self {
        Self { opts, store: None }
    }

    /// Set the default per-request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.opts.timeout = timeout;
        self
    }

    /// Set the default aggregate search timeout.
    pub fn search_timeout(mut self, timeout: Duration) -> Self {
        self.opts.search_timeout = timeout;
        self
    }

    /// Set the User-Agent header.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.opts.user_agent = user_agent.into();
        self
    }

    /// Add a header to the default header set.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.opts.headers.insert(key.into(), value.into());
        self
    }

    /// Bound the number of sources searched concurrently.
    pub fn max_concurrent_sources(mut self, n: usize) -> Self {
        self.opts.max_concurrent_sources = n.max(1);
        self
    }

    /// Select the DNS resolution mode.
    pub fn dns(mut self, dns: DnsMode) -> Self {
        self.opts.dns = dns;
        self
    }

    /// Add a known-bad domain substitution.
    pub fn domain_alias(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.opts.domain_aliases.insert(from.into(), to.into());
        self
    }

    /// Allow or disallow loopback/null hosts in search URLs.
    pub fn allow_loopback(mut self, allow: bool) -> Self {
        self.opts.allow_loopback = allow;
        self
    }

    /// Set how long terminal import tasks are retained.
    pub fn task_retention(mut self, retention: Duration) -> Self {
        self.opts.task_retention = retention;
        self
    }

    /// Set the reaper sweep interval.
    pub fn reaper_interval(mut self, interval: Duration) -> Self {
        self.opts.reaper_interval = interval;
        self
    }

    /// Cap the per-task detail log.
    pub fn task_log_cap(mut self, cap: usize) -> Self {
        self.opts.task_log_cap = cap;
        self
    }

    /// Use a custom HTTP client. DNS mode is ignored for a caller-supplied client.
    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.opts.http_client = Some(client);
        self
    }

    /// Persist definitions through the given store. Defaults to an in-memory store.
    pub fn store(mut self, store: Arc<dyn SourceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Build the Engine, loading the registry mirror from the store.
    pub async fn build(self) -> Result<Engine, EngineError> {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn SourceStore>);
        Engine::new(self.opts, store).await
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_public_resolvers_and_alias_table() {
        let opts = EngineOptions::default();
        assert_eq!(
            opts.dns,
            DnsMode::Public {
                primary: PRIMARY_RESOLVER,
                secondary: SECONDARY_RESOLVER
            }
        );
        assert_eq!(opts.domain_aliases.len(), KNOWN_DOMAIN_ALIASES.len());
        assert!(!opts.allow_loopback);
        assert_eq!(opts.task_retention, Duration::from_secs(86_400));
    }

    #[test]
    fn builder_overrides_apply() {
        let builder = EngineBuilder::new()
            .timeout(Duration::from_secs(3))
            .max_concurrent_sources(0)
            .allow_loopback(true)
            .dns(DnsMode::System)
            .header("Referer", "https://books.example/");
        assert_eq!(builder.opts.timeout, Duration::from_secs(3));
        assert_eq!(builder.opts.max_concurrent_sources, 1);
        assert!(builder.opts.allow_loopback);
        assert_eq!(builder.opts.dns, DnsMode::System);
        assert_eq!(
            builder.opts.headers.get("Referer").map(String::as_str),
            Some("https://books.example/")
        );
    }
}
