//! Destination nodes and their per-node options.

use std::collections::BTreeMap;
use std::fmt;

use crate::marker::Marker;

/// HTTP rewrite settings applied when relaying HTTP traffic to a node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpNodeSettings {
    /// Replacement for the request `Host` header.
    pub host: Option<String>,
    /// Headers set (overwriting any existing value) on every request.
    pub headers: BTreeMap<String, String>,
}

impl HttpNodeSettings {
    pub fn is_empty(&self) -> bool {
        self.host.as_deref().map_or(true, str::is_empty) && self.headers.is_empty()
    }
}

/// Selection hints derived from the inbound connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectHints {
    /// Destination host, optionally with a port.
    pub host: String,
    /// Sniffed application protocol (`"http"`), empty when unknown.
    pub protocol: String,
}

impl SelectHints {
    pub fn new(host: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            protocol: protocol.into(),
        }
    }
}

/// Restricts which hints a node accepts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeFilter {
    /// Exact host name or `*.suffix` wildcard.
    pub host: Option<String>,
    /// Required protocol hint.
    pub protocol: Option<String>,
}

impl NodeFilter {
    pub fn matches(&self, hints: &SelectHints) -> bool {
        if let Some(protocol) = &self.protocol {
            if !protocol.eq_ignore_ascii_case(&hints.protocol) {
                return false;
            }
        }
        if let Some(pattern) = &self.host {
            if !host_matches(pattern, split_host(&hints.host)) {
                return false;
            }
        }
        true
    }
}

/// One destination reachable through the routing chain.
pub struct Node {
    name: String,
    addr: String,
    filter: Option<NodeFilter>,
    http: Option<HttpNodeSettings>,
    marker: Marker,
}

impl Node {
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            filter: None,
            http: None,
            marker: Marker::new(),
        }
    }

    pub fn with_filter(mut self, filter: NodeFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_http(mut self, http: HttpNodeSettings) -> Self {
        self.http = Some(http);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn filter(&self) -> Option<&NodeFilter> {
        self.filter.as_ref()
    }

    /// HTTP rewrite settings, if any are configured.
    pub fn http(&self) -> Option<&HttpNodeSettings> {
        self.http.as_ref().filter(|h| !h.is_empty())
    }

    pub fn marker(&self) -> &Marker {
        &self.marker
    }

    /// Whether the node accepts the given hints.
    pub fn accepts(&self, hints: &SelectHints) -> bool {
        self.filter.as_ref().map_or(true, |f| f.matches(hints))
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("addr", &self.addr)
            .field("filter", &self.filter)
            .field("http", &self.http)
            .field("fails", &self.marker.count())
            .finish()
    }
}

/// Host portion of `host[:port]`, without IPv6 brackets.
pub fn split_host(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split_once(']').map_or(rest, |(host, _)| host);
    }
    match addr.rsplit_once(':') {
        // A bare IPv6 address has more than one colon and no port.
        Some((host, _)) if !host.contains(':') => host,
        Some(_) => addr,
        None => addr,
    }
}

/// Whether `addr` already carries a port.
pub fn has_port(addr: &str) -> bool {
    if let Some(rest) = addr.strip_prefix('[') {
        return rest
            .split_once(']')
            .is_some_and(|(_, tail)| tail.starts_with(':'));
    }
    matches!(addr.rsplit_once(':'), Some((host, _)) if !host.contains(':'))
}

/// Join a host and a port, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn host_matches(pattern: &str, host: &str) -> bool {
    let host = host.trim_end_matches('.');
    match pattern.strip_prefix("*.") {
        Some(suffix) => {
            let (host, suffix) = (host.as_bytes(), suffix.as_bytes());
            host.len() > suffix.len() + 1
                && host[host.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
                && host[host.len() - suffix.len() - 1] == b'.'
        }
        None => pattern.eq_ignore_ascii_case(host),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("example.com:80", "example.com")]
    #[case("example.com", "example.com")]
    #[case("[::1]:443", "::1")]
    #[case("::1", "::1")]
    #[case(":0", "")]
    #[case("", "")]
    fn test_split_host(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(split_host(input), expected);
    }

    #[rstest]
    #[case("example.com:80", true)]
    #[case("example.com", false)]
    #[case("[::1]:443", true)]
    #[case("[::1]", false)]
    #[case("::1", false)]
    #[case(":0", true)]
    fn test_has_port(#[case] input: &str, #[case] expected: bool) {
        assert_eq!(has_port(input), expected);
    }

    #[test]
    fn test_join_host_port() {
        assert_eq!(join_host_port("example.com", 0), "example.com:0");
        assert_eq!(join_host_port("::1", 80), "[::1]:80");
        assert_eq!(join_host_port("", 0), ":0");
    }

    #[rstest]
    #[case("example.com", "EXAMPLE.com:8080", true)]
    #[case("example.com", "other.com", false)]
    #[case("*.example.com", "api.example.com", true)]
    #[case("*.example.com", "a.b.example.com:443", true)]
    #[case("*.example.com", "example.com", false)]
    #[case("*.example.com", "badexample.com", false)]
    fn test_host_filter(#[case] pattern: &str, #[case] host: &str, #[case] expected: bool) {
        let filter = NodeFilter {
            host: Some(pattern.to_string()),
            protocol: None,
        };
        assert_eq!(filter.matches(&SelectHints::new(host, "")), expected);
    }

    #[test]
    fn test_protocol_filter() {
        let node = Node::new("web", "10.0.0.1:80").with_filter(NodeFilter {
            host: None,
            protocol: Some("http".to_string()),
        });
        assert!(node.accepts(&SelectHints::new("", "http")));
        assert!(!node.accepts(&SelectHints::new("", "")));
    }

    #[test]
    fn test_empty_http_settings_hidden() {
        let node = Node::new("a", "10.0.0.1:80").with_http(HttpNodeSettings::default());
        assert!(node.http().is_none());

        let mut headers = BTreeMap::new();
        headers.insert("X-Forwarded".to_string(), "1".to_string());
        let node = Node::new("b", "10.0.0.2:80").with_http(HttpNodeSettings {
            host: None,
            headers,
        });
        assert!(node.http().is_some());
    }
}
