//! System DNS resolver using getaddrinfo.
//!
//! Resolution blocks inside `getaddrinfo`, so it runs on tokio's blocking
//! pool rather than on a runtime worker.

use super::{Addrs, Name, Resolve, Resolving};
use crate::base::context::IoResultExt;
use crate::base::neterror::NetError;
use std::{
    io,
    net::{IpAddr, ToSocketAddrs},
};

/// System DNS resolver using `getaddrinfo` in the blocking pool.
#[derive(Clone, Debug, Default)]
pub struct GaiResolver;

impl GaiResolver {
    pub fn new() -> Self {
        Self
    }
}

impl Resolve for GaiResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(async move {
            let host = name.as_str().to_string();
            let result = tokio::task::spawn_blocking(move || {
                tracing::debug!(host = %host, "resolving via getaddrinfo");
                (host.as_str(), 0u16).to_socket_addrs().map(|iter| iter.collect::<Vec<_>>())
            })
            .await;

            let addrs = result
                .map_err(|e| {
                    tracing::error!(error = %e, "DNS resolution task failed");
                    NetError::NameNotResolved
                })?
                .dns_context(name.as_str())?;

            let mut ips: Addrs = Vec::with_capacity(addrs.len());
            for addr in addrs {
                // getaddrinfo repeats an address once per socket type
                if !ips.contains(&addr.ip()) {
                    ips.push(addr.ip());
                }
            }

            if ips.is_empty() {
                return Err(NetError::dns_failed(
                    name.as_str(),
                    io::Error::new(io::ErrorKind::NotFound, "No addresses returned by getaddrinfo"),
                ));
            }

            tracing::debug!(domain = %name, count = ips.len(), "DNS resolution complete");
            Ok(ips)
        })
    }
}

/// IP literal detection, used to skip DNS for numeric hosts.
pub struct SocketAddrs;

impl SocketAddrs {
    /// Parses `host` as an IPv4 or IPv6 literal.
    ///
    /// Bracketed IPv6 (`[::1]`) is accepted. Returns `None` for host names.
    pub fn try_parse(host: &str) -> Option<IpAddr> {
        let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
        host.parse::<IpAddr>().ok()
    }
}
