//! Outbound dialing.
//!
//! A router opens the transport connection to a resolved node address.
//! `DirectRouter` dials the address itself; further upstream chaining is
//! hidden behind the same trait.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::conn::{BoxConnection, Network, UdpSession};
use crate::hosts::HostMapper;
use crate::node::{has_port, split_host};

/// Default connect timeout for outbound connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Dial strategy used by handlers to reach a target.
#[async_trait]
pub trait Router: Send + Sync {
    /// Open a connection to `addr` over `network`.
    ///
    /// Returns `ErrorKind::Interrupted` if `token` is cancelled first.
    async fn dial(
        &self,
        token: &CancellationToken,
        network: Network,
        addr: &str,
    ) -> io::Result<BoxConnection>;
}

/// Router that connects straight to the target address.
pub struct DirectRouter {
    connect_timeout: Duration,
    hosts: Option<Arc<dyn HostMapper>>,
}

impl DirectRouter {
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            hosts: None,
        }
    }

    pub fn with_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Consult `hosts` before falling back to the system resolver.
    pub fn with_hosts(mut self, hosts: Arc<dyn HostMapper>) -> Self {
        self.hosts = Some(hosts);
        self
    }

    async fn resolve(&self, network: Network, addr: &str) -> io::Result<SocketAddr> {
        if !has_port(addr) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("missing port in address {}", addr),
            ));
        }
        let host = split_host(addr);
        let port: u16 = addr
            .rsplit_once(':')
            .and_then(|(_, p)| p.parse().ok())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, format!("invalid port in {}", addr))
            })?;
        if port == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unspecified port in address {}", addr),
            ));
        }
        if host.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("missing host in address {}", addr),
            ));
        }

        if let Ok(ip) = host.parse() {
            return Ok(SocketAddr::new(ip, port));
        }

        if let Some(ip) = self
            .hosts
            .as_ref()
            .and_then(|h| h.lookup(network, host))
            .and_then(|ips| ips.into_iter().next())
        {
            debug!(host = %host, ip = %ip, "Resolved via hosts mapping");
            return Ok(SocketAddr::new(ip, port));
        }

        tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no address for {}", host))
            })
    }

    async fn connect(&self, network: Network, addr: &str) -> io::Result<BoxConnection> {
        let target = self.resolve(network, addr).await?;
        debug!(network = %network, addr = %addr, target = %target, "Connecting");

        let conn: BoxConnection = match network {
            Network::Tcp => Box::new(TcpStream::connect(target).await?),
            Network::Udp => Box::new(UdpSession::connect(target).await?),
        };
        Ok(conn)
    }
}

impl Default for DirectRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Router for DirectRouter {
    async fn dial(
        &self,
        token: &CancellationToken,
        network: Network,
        addr: &str,
    ) -> io::Result<BoxConnection> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "dial canceled",
            )),
            result = timeout(self.connect_timeout, self.connect(network, addr)) => match result {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connect timeout",
                )),
            },
        }
    }
}
