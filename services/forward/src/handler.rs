//! Connection handlers.
//!
//! A handler owns one accepted connection for the life of a session.
//! Handlers are built by name through `handler_registry()`; the forward
//! handler is registered under `tcp`, `udp` and `forward`.
//!
//! ## Session flow
//!
//! ```text
//! accepted ──> rate limit ──deny──> closed (ok)
//!                 │
//!                 v
//!               sniff (stream only)
//!                 │
//!                 v
//!     hop.select / literal destination ──none──> TargetUnavailable
//!                 │
//!                 v
//!            router.dial ──err──> mark node, DialFailed
//!                 │ ok: reset node
//!                 v
//!     relay (HTTP-aware if sniffed HTTP and the node rewrites)
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use async_trait::async_trait;
use hopline_chain::{
    has_port, join_host_port, split_host, BoxConnection, Connection, DirectRouter, Hop, Node,
    Router, SelectHints, Transport,
};
use hopline_registry::{RegisterPolicy, Registry};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::HandlerError;
use crate::http::relay_http;
use crate::metadata::Metadata;
use crate::prefixed::PrefixedStream;
use crate::rate_limit::{rate_limit_key, RateLimiter};
use crate::relay;
use crate::sniff::{Protocol, SniffConfig, Sniffer};

/// Metadata key enabling protocol sniffing.
pub const MD_SNIFFING: &str = "sniffing";
/// Metadata key for the sniffing timeout in milliseconds.
pub const MD_SNIFFING_TIMEOUT: &str = "sniffing.timeout";
/// Metadata key for the sniffing buffer limit in bytes.
pub const MD_SNIFFING_MAX_BYTES: &str = "sniffing.max_bytes";

/// Handles one accepted connection per call.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Apply metadata before the handler serves connections.
    fn init(&mut self, md: &Metadata) -> Result<(), HandlerError>;

    /// Serve `conn` until the session ends. The connection is closed on
    /// return.
    async fn handle(&self, token: &CancellationToken, conn: BoxConnection)
        -> Result<(), HandlerError>;

    /// Access to the forwarding hop, for handlers that route through one.
    fn as_forwarder(&mut self) -> Option<&mut dyn Forwarder> {
        None
    }
}

/// A handler that selects targets from a hop.
pub trait Forwarder {
    fn forward(&mut self, hop: Arc<dyn Hop>);
}

/// Shared collaborators handed to handler constructors.
#[derive(Clone)]
pub struct HandlerOptions {
    pub router: Arc<dyn Router>,
    pub rate_limiter: Option<Arc<dyn RateLimiter>>,
}

impl HandlerOptions {
    pub fn new(router: Arc<dyn Router>) -> Self {
        Self {
            router,
            rate_limiter: None,
        }
    }

    pub fn with_rate_limiter(mut self, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self::new(Arc::new(DirectRouter::new()))
    }
}

impl fmt::Debug for HandlerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerOptions")
            .field("rate_limiter", &self.rate_limiter.is_some())
            .finish_non_exhaustive()
    }
}

/// Constructor stored in the handler registry.
pub type HandlerFactory = dyn Fn(HandlerOptions) -> Box<dyn Handler> + Send + Sync;

const FORWARD_HANDLER_NAMES: [&str; 3] = ["tcp", "udp", "forward"];

static HANDLERS: LazyLock<Arc<Registry<HandlerFactory>>> = LazyLock::new(|| {
    let registry = Arc::new(Registry::with_policy(RegisterPolicy::Reject));
    let factory: Arc<HandlerFactory> =
        Arc::new(|opts: HandlerOptions| Box::new(ForwardHandler::new(opts)) as Box<dyn Handler>);
    for name in FORWARD_HANDLER_NAMES {
        if let Err(e) = registry.register(name, Arc::clone(&factory)) {
            error!(handler = name, error = %e, "Failed to register handler");
        }
    }
    registry
});

/// Process-wide registry of handler constructors.
///
/// Registration is first-wins: a second handler under a taken name is
/// refused with `RegistryError::DuplicateName`.
pub fn handler_registry() -> &'static Arc<Registry<HandlerFactory>> {
    &HANDLERS
}

/// Build the handler registered under `name`.
pub fn new_handler(name: &str, opts: HandlerOptions) -> Option<Box<dyn Handler>> {
    handler_registry().get(name).map(|factory| factory(opts))
}

/// Relays each connection to a target chosen by sniffing and hop selection.
pub struct ForwardHandler {
    options: HandlerOptions,
    hop: Option<Arc<dyn Hop>>,
    sniffing: bool,
    sniffer: Sniffer,
}

impl ForwardHandler {
    pub fn new(options: HandlerOptions) -> Self {
        Self {
            options,
            hop: None,
            sniffing: false,
            sniffer: Sniffer::new(),
        }
    }

    pub fn sniffing(&self) -> bool {
        self.sniffing
    }

    /// Whether the session for `remote` may proceed.
    fn admit(&self, remote: Option<SocketAddr>) -> bool {
        let (Some(rate_limiter), Some(remote)) = (&self.options.rate_limiter, remote) else {
            return true;
        };
        match rate_limiter.limiter(&rate_limit_key(remote)) {
            Some(limiter) => limiter.allow(1),
            None => true,
        }
    }

    /// Node and dial address for a session, or `TargetUnavailable`.
    fn resolve_target(
        &self,
        host: &str,
        protocol: Protocol,
    ) -> Result<(String, Option<Arc<Node>>), HandlerError> {
        match &self.hop {
            Some(hop) => {
                let hints = SelectHints::new(host, protocol.as_str());
                let node = hop
                    .select(&hints)
                    .ok_or(HandlerError::TargetUnavailable)?;
                Ok((node.addr().to_string(), Some(node)))
            }
            None if host.is_empty() => Err(HandlerError::TargetUnavailable),
            None => Ok((host.to_string(), None)),
        }
    }

    async fn session(
        &self,
        token: &CancellationToken,
        conn: BoxConnection,
        remote: Option<SocketAddr>,
    ) -> Result<(), HandlerError> {
        if !self.admit(remote) {
            debug!("Rate limited, dropping connection");
            return Ok(());
        }

        let transport = conn.transport();
        let network = transport.network();

        let (stream, mut host, protocol) = if self.sniffing && transport == Transport::Stream {
            let sniffed = self.sniffer.sniff(token, conn).await;
            debug!(host = %sniffed.host, protocol = %sniffed.protocol, "Sniffed");
            (sniffed.stream, sniffed.host, sniffed.protocol)
        } else {
            (PrefixedStream::passthrough(conn), String::new(), Protocol::Unknown)
        };

        if host.is_empty() {
            host = stream.destination().unwrap_or_default().to_string();
        }
        if !host.is_empty() && !has_port(&host) {
            host = join_host_port(split_host(&host), 0);
        }

        let (addr, node) = match self.resolve_target(&host, protocol) {
            Ok(target) => target,
            Err(e) => {
                error!(host = %host, protocol = %protocol, "Target not available");
                return Err(e);
            }
        };

        debug!(dst = %addr, network = %network, "Dialing");
        let target = match self.options.router.dial(token, network, &addr).await {
            Ok(target) => target,
            Err(_) if token.is_cancelled() => {
                debug!(dst = %addr, "Dial canceled");
                return Err(HandlerError::Canceled);
            }
            Err(e) => {
                error!(dst = %addr, error = %e, "Dial failed");
                if let Some(node) = &node {
                    node.marker().mark();
                }
                return Err(HandlerError::Dial { addr, source: e });
            }
        };
        if let Some(node) = &node {
            node.marker().reset();
        }

        let relay_start = Instant::now();
        debug!(dst = %addr, "Relaying");

        let http = node.as_ref().and_then(|n| n.http().cloned());
        let result = match (protocol, http) {
            (Protocol::Http, Some(settings)) => relay_http(stream, target, settings).await,
            _ => relay::transport(stream, target, transport)
                .await
                .map(|traffic| {
                    debug!(
                        upstream = traffic.upstream,
                        downstream = traffic.downstream,
                        "Relay traffic"
                    );
                }),
        };

        let duration_ms = relay_start.elapsed().as_millis() as u64;
        match result {
            Ok(()) => {
                debug!(dst = %addr, duration_ms, "Relay finished");
                Ok(())
            }
            Err(e) => {
                warn!(dst = %addr, duration_ms, error = %e, "Relay failed");
                Err(HandlerError::Relay(e))
            }
        }
    }
}

impl fmt::Debug for ForwardHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardHandler")
            .field("hop", &self.hop.is_some())
            .field("sniffing", &self.sniffing)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Handler for ForwardHandler {
    fn init(&mut self, md: &Metadata) -> Result<(), HandlerError> {
        let mut config = SniffConfig::default();

        if md.get(MD_SNIFFING).is_some() {
            self.sniffing = md
                .get_bool(MD_SNIFFING)
                .ok_or_else(|| invalid(MD_SNIFFING, "expected a boolean"))?;
        }
        if md.get(MD_SNIFFING_TIMEOUT).is_some() {
            config.timeout = md
                .get_duration_ms(MD_SNIFFING_TIMEOUT)
                .ok_or_else(|| invalid(MD_SNIFFING_TIMEOUT, "expected milliseconds"))?;
        }
        if md.get(MD_SNIFFING_MAX_BYTES).is_some() {
            config.max_bytes = md
                .get_u64(MD_SNIFFING_MAX_BYTES)
                .filter(|n| *n > 0)
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| invalid(MD_SNIFFING_MAX_BYTES, "expected a positive size"))?;
        }

        self.sniffer = Sniffer::with_config(config);
        Ok(())
    }

    async fn handle(
        &self,
        token: &CancellationToken,
        conn: BoxConnection,
    ) -> Result<(), HandlerError> {
        let start = Instant::now();
        let remote = conn.peer_addr().ok();
        let local = conn.local_addr().ok();
        info!(remote = %fmt_addr(remote), local = %fmt_addr(local), "Session started");

        let result = self.session(token, conn, remote).await;

        info!(
            remote = %fmt_addr(remote),
            local = %fmt_addr(local),
            duration_ms = start.elapsed().as_millis() as u64,
            "Session closed"
        );
        result
    }

    fn as_forwarder(&mut self) -> Option<&mut dyn Forwarder> {
        Some(self)
    }
}

impl Forwarder for ForwardHandler {
    fn forward(&mut self, hop: Arc<dyn Hop>) {
        self.hop = Some(hop);
    }
}

fn invalid(key: &str, detail: &str) -> HandlerError {
    HandlerError::Metadata {
        key: key.to_string(),
        detail: detail.to_string(),
    }
}

fn fmt_addr(addr: Option<SocketAddr>) -> String {
    addr.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string())
}
