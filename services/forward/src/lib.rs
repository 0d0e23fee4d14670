//! Forwarding relay.
//!
//! Serves accepted connections by admitting them through a per-client rate
//! limiter, sniffing HTTP, selecting a target from a hop, dialing it and
//! relaying bytes. HTTP requests to nodes with rewrite settings are relayed
//! through the HTTP-aware path.

pub mod config;
pub mod error;
pub mod handler;
pub mod http;
pub mod listener;
pub mod metadata;
pub mod prefixed;
pub mod rate_limit;
pub mod relay;
pub mod sniff;

pub use config::{Config, ConfigError, FileConfig};
pub use error::HandlerError;
pub use handler::{
    handler_registry, new_handler, ForwardHandler, Forwarder, Handler, HandlerFactory,
    HandlerOptions,
};
pub use listener::{Listener, ListenerConfig, ListenerStats};
pub use metadata::Metadata;
pub use prefixed::PrefixedStream;
pub use rate_limit::{KeyedRateLimiter, Limiter, RateLimit, RateLimiter};
pub use relay::Traffic;
pub use sniff::{Protocol, SniffConfig, Sniffed, Sniffer};
