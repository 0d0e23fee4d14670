//! Routing chain primitives.
//!
//! This library provides:
//! - `Connection`: duplex stream or datagram session handed to handlers
//! - `Node` and `Marker`: destinations and their shared health state
//! - `Hop`: selection of one node per session from selection hints
//! - `Router`: outbound dialing, optionally through a `HostMapper`
//!
//! ## Health feedback
//!
//! ```text
//! Hop::select ──> Node ──> Router::dial ──ok──> Marker::reset
//!      ^                        └──err──> Marker::mark
//!      └──────── Exclusion reads Marker ────────┘
//! ```
//!
//! Markers are only written by dial outcomes; selection only reads them.

pub mod conn;
pub mod hop;
pub mod hosts;
pub mod marker;
pub mod node;
pub mod router;

pub use conn::{BoxConnection, Connection, Network, Transport, UdpSession, WithDestination};
pub use hop::{Exclusion, FailFilter, Hop, NodeHop, Strategy};
pub use hosts::{HostMapper, StaticHosts};
pub use marker::{Health, Marker, MarkerState};
pub use node::{
    has_port, join_host_port, split_host, HttpNodeSettings, Node, NodeFilter, SelectHints,
};
pub use router::{DirectRouter, Router, DEFAULT_CONNECT_TIMEOUT};
