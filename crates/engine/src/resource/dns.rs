// ABOUTME: Public-DNS resolver plugged into reqwest: primary upstream first, one retry against the secondary.
// ABOUTME: Unspecified-only answers (0.0.0.0 / ::) count as failures, which is how polluted lookups show up.

use std::error::Error as StdError;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use once_cell::sync::OnceCell;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use tracing::{debug, warn};

/// Raised when both upstreams fail for a host.
#[derive(Debug, thiserror::Error)]
#[error("dns lookup failed for {host}: {reason}")]
pub struct DnsLookupError {
    pub host: String,
    pub reason: String,
}

/// A single nameserver the resolver can ask.
#[async_trait]
trait Upstream: Send + Sync {
    fn label(&self) -> String;

    /// Raw answer for `host`, unfiltered.
    async fn query(&self, host: &str) -> Result<Vec<IpAddr>, String>;
}

/// A public nameserver reached through hickory, connected lazily on first use.
struct HickoryUpstream {
    addr: IpAddr,
    resolver: OnceCell<TokioAsyncResolver>,
}

impl HickoryUpstream {
    fn new(addr: IpAddr) -> Self {
        Self {
            addr,
            resolver: OnceCell::new(),
        }
    }

    fn resolver(&self) -> &TokioAsyncResolver {
        self.resolver.get_or_init(|| {
            let group = NameServerConfigGroup::from_ips_clear(&[self.addr], 53, true);
            let config = ResolverConfig::from_parts(None, vec![], group);
            TokioAsyncResolver::tokio(config, ResolverOpts::default())
        })
    }
}

#[async_trait]
impl Upstream for HickoryUpstream {
    fn label(&self) -> String {
        self.addr.to_string()
    }

    async fn query(&self, host: &str) -> Result<Vec<IpAddr>, String> {
        let answer = self
            .resolver()
            .lookup_ip(host)
            .await
            .map_err(|e| e.to_string())?;
        Ok(answer.iter().collect())
    }
}

/// Asks one upstream and drops unspecified addresses; nothing left is a failure.
async fn usable_lookup(upstream: &dyn Upstream, host: &str) -> Result<Vec<IpAddr>, String> {
    let ips: Vec<IpAddr> = upstream
        .query(host)
        .await?
        .into_iter()
        .filter(|ip| !ip.is_unspecified())
        .collect();
    if ips.is_empty() {
        return Err(format!("{} returned no usable address", upstream.label()));
    }
    Ok(ips)
}

/// reqwest resolver backed by two public nameservers.
#[derive(Clone)]
pub struct DualResolver {
    primary: Arc<dyn Upstream>,
    secondary: Arc<dyn Upstream>,
}

impl DualResolver {
    pub fn new(primary: IpAddr, secondary: IpAddr) -> Self {
        Self {
            primary: Arc::new(HickoryUpstream::new(primary)),
            secondary: Arc::new(HickoryUpstream::new(secondary)),
        }
    }

    /// Resolves `host`, falling back to the secondary upstream once.
    pub async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, DnsLookupError> {
        match usable_lookup(self.primary.as_ref(), host).await {
            Ok(ips) => Ok(ips),
            Err(first) => {
                debug!(host, upstream = %self.primary.label(), error = %first, "primary dns lookup failed");
                usable_lookup(self.secondary.as_ref(), host)
                    .await
                    .map_err(|second| {
                        warn!(host, error = %second, "dns lookup failed on both upstreams");
                        DnsLookupError {
                            host: host.to_string(),
                            reason: format!("primary: {first}; secondary: {second}"),
                        }
                    })
            }
        }
    }
}

impl Resolve for DualResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let this = self.clone();
        Box::pin(async move {
            let ips = this.lookup(name.as_str()).await?;
            // reqwest replaces the port with the one from the URL.
            let addrs: Addrs = Box::new(ips.into_iter().map(|ip| SocketAddr::new(ip, 0)));
            Ok::<Addrs, Box<dyn StdError + Send + Sync>>(addrs)
        })
    }
}

/// True when an error chain contains a DNS failure, from this resolver or the system one.
pub fn is_dns_error(err: &(dyn StdError + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if e.downcast_ref::<DnsLookupError>().is_some() {
            return true;
        }
        let text = e.to_string().to_ascii_lowercase();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            return true;
        }
        current = e.source();
    }
    false
}
