//! Capability registry.
//!
//! Pluggable implementations register themselves by name at startup;
//! consumers obtain late-binding handles that look the name up again on
//! every call. A handle distributed before a re-registration therefore
//! observes the newest implementation, and a handle for a name with no
//! registration behaves as "not found" instead of failing.
//!
//! One registry instance exists per capability kind:
//! - `hosts_registry()`: host-name mappers used by routers
//! - `hop_registry()`: routing hops used by handlers
//!
//! Handler constructors live in the service crate that defines the
//! handler trait.

mod error;
mod registry;

use std::net::IpAddr;
use std::sync::{Arc, LazyLock};

use hopline_chain::{HostMapper, Hop, Network, Node, SelectHints};

pub use error::RegistryError;
pub use registry::{Binding, RegisterPolicy, Registry};

static HOSTS: LazyLock<Arc<Registry<dyn HostMapper>>> =
    LazyLock::new(|| Arc::new(Registry::new()));

static HOPS: LazyLock<Arc<Registry<dyn Hop>>> = LazyLock::new(|| Arc::new(Registry::new()));

/// Process-wide registry of host mappers.
pub fn hosts_registry() -> &'static Arc<Registry<dyn HostMapper>> {
    &HOSTS
}

/// Process-wide registry of routing hops.
pub fn hop_registry() -> &'static Arc<Registry<dyn Hop>> {
    &HOPS
}

/// Late-binding host mapper; an unregistered name maps nothing.
impl HostMapper for Binding<dyn HostMapper> {
    fn lookup(&self, network: Network, host: &str) -> Option<Vec<IpAddr>> {
        self.resolve()?.lookup(network, host)
    }
}

/// Late-binding hop; an unregistered name selects nothing.
impl Hop for Binding<dyn Hop> {
    fn select(&self, hints: &SelectHints) -> Option<Arc<Node>> {
        self.resolve()?.select(hints)
    }
}
