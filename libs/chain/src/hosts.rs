//! Static host-name mapping consulted before dialing.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::conn::Network;

/// Maps host names to addresses.
pub trait HostMapper: Send + Sync {
    /// Addresses for `host`, or `None` when the mapper has no entry.
    fn lookup(&self, network: Network, host: &str) -> Option<Vec<IpAddr>>;
}

/// In-memory hosts table, keyed by lowercase host name.
#[derive(Debug, Clone, Default)]
pub struct StaticHosts {
    entries: HashMap<String, Vec<IpAddr>>,
}

impl StaticHosts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, host: &str, ips: Vec<IpAddr>) {
        self.entries
            .insert(host.trim_end_matches('.').to_ascii_lowercase(), ips);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, Vec<IpAddr>)> for StaticHosts {
    fn from_iter<I: IntoIterator<Item = (String, Vec<IpAddr>)>>(iter: I) -> Self {
        let mut hosts = StaticHosts::new();
        for (host, ips) in iter {
            hosts.insert(&host, ips);
        }
        hosts
    }
}

impl HostMapper for StaticHosts {
    fn lookup(&self, _network: Network, host: &str) -> Option<Vec<IpAddr>> {
        self.entries
            .get(&host.trim_end_matches('.').to_ascii_lowercase())
            .filter(|ips| !ips.is_empty())
            .cloned()
    }
}
