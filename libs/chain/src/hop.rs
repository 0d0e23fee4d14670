//! Hops: groups of candidate nodes with a selection policy.
//!
//! Selection runs in three passes over the configured nodes:
//! - drop nodes whose filter rejects the hints
//! - drop nodes the exclusion policy considers dead
//! - pick one of the remaining nodes with the hop's strategy
//!
//! Both strategies are deterministic for identical hints and marker state.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::marker::{now_ms, Marker};
use crate::node::{split_host, Node, SelectHints};

/// Default consecutive failures before a node is excluded.
pub const DEFAULT_MAX_FAILS: u32 = 1;

/// Default exclusion window after the failure threshold is reached.
pub const DEFAULT_FAIL_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound for the exponentially growing exclusion window.
pub const DEFAULT_MAX_FAIL_TIMEOUT: Duration = Duration::from_secs(300);

/// A routing hop that chooses one destination node per session.
pub trait Hop: Send + Sync {
    /// Choose a node for the hints, or `None` if no node is eligible.
    fn select(&self, hints: &SelectHints) -> Option<Arc<Node>>;
}

/// Decides whether a node's failure history excludes it from selection.
pub trait Exclusion: Send + Sync {
    fn excludes(&self, marker: &Marker, now_ms: u64) -> bool;
}

/// Temporary exclusion with exponential backoff.
///
/// A node with at least `max_fails` recorded failures is excluded for
/// `fail_timeout * 2^(fails - max_fails)`, capped at `max_fail_timeout`,
/// counted from its most recent failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailFilter {
    pub max_fails: u32,
    pub fail_timeout: Duration,
    pub max_fail_timeout: Duration,
}

impl FailFilter {
    /// Exclusion window for a node with `fails` consecutive failures.
    pub fn window(&self, fails: u32) -> Duration {
        if fails < self.max_fails.max(1) {
            return Duration::ZERO;
        }
        let exp = (fails - self.max_fails.max(1)).min(16);
        self.fail_timeout
            .saturating_mul(1u32 << exp)
            .min(self.max_fail_timeout)
    }
}

impl Default for FailFilter {
    fn default() -> Self {
        Self {
            max_fails: DEFAULT_MAX_FAILS,
            fail_timeout: DEFAULT_FAIL_TIMEOUT,
            max_fail_timeout: DEFAULT_MAX_FAIL_TIMEOUT,
        }
    }
}

impl Exclusion for FailFilter {
    fn excludes(&self, marker: &Marker, now_ms: u64) -> bool {
        let state = marker.snapshot();
        let window = self.window(state.count);
        if window.is_zero() {
            return false;
        }
        match state.since_marked(now_ms) {
            Some(elapsed) => elapsed < window,
            None => false,
        }
    }
}

/// How a hop picks among eligible nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Strategy {
    /// First eligible node in configuration order.
    #[default]
    Failover,
    /// Stable hash of the host hint over the eligible nodes.
    Hash,
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "failover" | "fifo" => Ok(Strategy::Failover),
            "hash" => Ok(Strategy::Hash),
            other => Err(format!("unknown selection strategy: {}", other)),
        }
    }
}

/// Hop over a fixed, ordered list of nodes.
pub struct NodeHop {
    name: String,
    nodes: Vec<Arc<Node>>,
    strategy: Strategy,
    exclusion: Box<dyn Exclusion>,
}

impl NodeHop {
    pub fn new(name: impl Into<String>, nodes: Vec<Node>) -> Self {
        Self {
            name: name.into(),
            nodes: nodes.into_iter().map(Arc::new).collect(),
            strategy: Strategy::default(),
            exclusion: Box::new(FailFilter::default()),
        }
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_exclusion(mut self, exclusion: impl Exclusion + 'static) -> Self {
        self.exclusion = Box::new(exclusion);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Look up a node by name.
    pub fn node(&self, name: &str) -> Option<&Arc<Node>> {
        self.nodes.iter().find(|n| n.name() == name)
    }

    /// Selection against an explicit clock, in milliseconds since the epoch.
    pub fn select_at(&self, hints: &SelectHints, now_ms: u64) -> Option<Arc<Node>> {
        let eligible: Vec<&Arc<Node>> = self
            .nodes
            .iter()
            .filter(|n| n.accepts(hints))
            .filter(|n| {
                let excluded = self.exclusion.excludes(n.marker(), now_ms);
                if excluded {
                    trace!(hop = %self.name, node = %n.name(), fails = n.marker().count(), "Node excluded");
                }
                !excluded
            })
            .collect();

        if eligible.is_empty() {
            debug!(
                hop = %self.name,
                host = %hints.host,
                protocol = %hints.protocol,
                "No eligible node"
            );
            return None;
        }

        let idx = match self.strategy {
            Strategy::Failover => 0,
            Strategy::Hash => {
                let mut hasher = DefaultHasher::new();
                split_host(&hints.host).to_ascii_lowercase().hash(&mut hasher);
                (hasher.finish() % eligible.len() as u64) as usize
            }
        };

        Some(Arc::clone(eligible[idx]))
    }
}

impl Hop for NodeHop {
    fn select(&self, hints: &SelectHints) -> Option<Arc<Node>> {
        self.select_at(hints, now_ms())
    }
}

impl fmt::Debug for NodeHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeHop")
            .field("name", &self.name)
            .field("nodes", &self.nodes)
            .field("strategy", &self.strategy)
            .finish()
    }
}
