//! Node discovery and per-node retry bookkeeping.
//!
//! The connector consumes a `Discovery` capability and never cares where
//! nodes come from. Two implementations ship here: a fixed seed list (a
//! single host/port config is a one-node seed) and DNS resolution of a
//! discovery endpoint. Either way, exhaustion is terminal: once every known
//! node is marked failed, `discover` returns `Exhausted` and the connector
//! stops.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

/// Backoff is capped here no matter how many failures accumulate.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// NodeService
// ---------------------------------------------------------------------------

/// A discovered server node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeService {
    pub address: String,
    pub port: u16,
    /// Opaque identity for retry bookkeeping; `address:port` when absent.
    pub tag: Option<String>,
}

impl NodeService {
    pub fn new(address: impl Into<String>, port: u16) -> NodeService {
        NodeService {
            address: address.into(),
            port,
            tag: None,
        }
    }

    fn key(&self) -> String {
        self.tag
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.address, self.port))
    }
}

impl std::fmt::Display for NodeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, thiserror::Error)]
pub enum DiscoveryError {
    /// Every known node has been marked failed.
    #[error("no discoverable nodes remain")]
    Exhausted,
    #[error("resolving {host}:{port}: {message}")]
    Resolve {
        host: String,
        port: u16,
        message: String,
    },
}

/// Where the connector gets nodes from.
#[async_trait]
pub trait Discovery: Send {
    /// Produce the next node to dial.
    async fn discover(&mut self) -> Result<NodeService, DiscoveryError>;

    /// Exclude a node from future discovery.
    fn mark_failed(&mut self, node: &NodeService);
}

/// Fixed seed list; failed nodes are skipped until none remain.
pub struct StaticDiscovery {
    seeds: Vec<NodeService>,
    failed: HashSet<String>,
}

impl StaticDiscovery {
    pub fn new(seeds: Vec<NodeService>) -> StaticDiscovery {
        StaticDiscovery {
            seeds,
            failed: HashSet::new(),
        }
    }

    pub fn single(address: impl Into<String>, port: u16) -> StaticDiscovery {
        StaticDiscovery::new(vec![NodeService::new(address, port)])
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn discover(&mut self) -> Result<NodeService, DiscoveryError> {
        self.seeds
            .iter()
            .find(|node| !self.failed.contains(&node.key()))
            .cloned()
            .ok_or(DiscoveryError::Exhausted)
    }

    fn mark_failed(&mut self, node: &NodeService) {
        debug!(node = %node, "marking node failed");
        let _ = self.failed.insert(node.key());
    }
}

/// Resolves the discovery endpoint on every attempt and returns the first
/// candidate not yet marked failed, so a DNS change brings fresh nodes in
/// without restarting the client.
pub struct DnsDiscovery {
    host: String,
    port: u16,
    failed: HashSet<String>,
}

impl DnsDiscovery {
    pub fn new(host: impl Into<String>, port: u16) -> DnsDiscovery {
        DnsDiscovery {
            host: host.into(),
            port,
            failed: HashSet::new(),
        }
    }
}

#[async_trait]
impl Discovery for DnsDiscovery {
    async fn discover(&mut self) -> Result<NodeService, DiscoveryError> {
        let addrs = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| DiscoveryError::Resolve {
                host: self.host.clone(),
                port: self.port,
                message: e.to_string(),
            })?;
        for addr in addrs {
            let node = NodeService::new(addr.ip().to_string(), addr.port());
            if !self.failed.contains(&node.key()) {
                return Ok(node);
            }
        }
        Err(DiscoveryError::Exhausted)
    }

    fn mark_failed(&mut self, node: &NodeService) {
        debug!(node = %node, "marking node failed");
        let _ = self.failed.insert(node.key());
    }
}

// ---------------------------------------------------------------------------
// DiscoveryRetryPolicy
// ---------------------------------------------------------------------------

/// Per-node reconnect bookkeeping: bounded retries with capped exponential
/// backoff, counters reset on success.
#[derive(Debug)]
pub struct DiscoveryRetryPolicy {
    retries_per_node: usize,
    base_delay: Duration,
    failures: HashMap<String, u32>,
}

impl DiscoveryRetryPolicy {
    pub fn new(retries_per_node: usize, base_delay: Duration) -> DiscoveryRetryPolicy {
        DiscoveryRetryPolicy {
            retries_per_node,
            base_delay,
            failures: HashMap::new(),
        }
    }

    pub fn record_failure(&mut self, node: &NodeService) {
        *self.failures.entry(node.key()).or_insert(0) += 1;
    }

    pub fn record_success(&mut self, node: &NodeService) {
        let _ = self.failures.remove(&node.key());
    }

    /// Whether the node still has retry budget after its recorded failures.
    pub fn should_retry(&self, node: &NodeService) -> bool {
        self.failure_count(node) as usize <= self.retries_per_node
    }

    pub fn failure_count(&self, node: &NodeService) -> u32 {
        self.failures.get(&node.key()).copied().unwrap_or(0)
    }

    /// Delay before the next attempt on this node: doubles per failure,
    /// capped at [`MAX_RETRY_DELAY`].
    pub fn delay(&self, node: &NodeService) -> Duration {
        let failures = self.failure_count(node);
        let shift = failures.saturating_sub(1).min(6);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(MAX_RETRY_DELAY)
    }

    pub async fn wait(&self, node: &NodeService) {
        tokio::time::sleep(self.delay(node)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(port: u16) -> NodeService {
        NodeService::new("10.0.0.1", port)
    }

    #[test]
    fn should_retry_until_the_budget_is_spent() {
        let mut policy = DiscoveryRetryPolicy::new(1, Duration::from_millis(10));
        let n = node(1113);

        policy.record_failure(&n);
        assert!(policy.should_retry(&n), "first failure is within budget");
        policy.record_failure(&n);
        assert!(!policy.should_retry(&n), "second failure exhausts budget 1");
    }

    #[test]
    fn zero_budget_never_retries_a_failed_node() {
        let mut policy = DiscoveryRetryPolicy::new(0, Duration::from_millis(10));
        let n = node(1113);

        assert!(policy.should_retry(&n), "no failures yet");
        policy.record_failure(&n);
        assert!(!policy.should_retry(&n));
    }

    #[test]
    fn success_resets_the_failure_counter() {
        let mut policy = DiscoveryRetryPolicy::new(2, Duration::from_millis(10));
        let n = node(1113);

        policy.record_failure(&n);
        policy.record_failure(&n);
        policy.record_success(&n);
        assert_eq!(policy.failure_count(&n), 0);
        assert!(policy.should_retry(&n));
    }

    #[test]
    fn failures_are_tracked_per_node() {
        let mut policy = DiscoveryRetryPolicy::new(0, Duration::from_millis(10));
        let a = node(1113);
        let b = node(2113);

        policy.record_failure(&a);
        assert!(!policy.should_retry(&a));
        assert!(policy.should_retry(&b));
    }

    #[test]
    fn backoff_doubles_and_is_capped() {
        let mut policy = DiscoveryRetryPolicy::new(usize::MAX, Duration::from_millis(100));
        let n = node(1113);

        policy.record_failure(&n);
        assert_eq!(policy.delay(&n), Duration::from_millis(100));
        policy.record_failure(&n);
        assert_eq!(policy.delay(&n), Duration::from_millis(200));
        policy.record_failure(&n);
        assert_eq!(policy.delay(&n), Duration::from_millis(400));

        for _ in 0..20 {
            policy.record_failure(&n);
        }
        assert!(policy.delay(&n) <= MAX_RETRY_DELAY);
    }

    #[tokio::test]
    async fn static_discovery_skips_failed_nodes_then_exhausts() {
        let mut discovery =
            StaticDiscovery::new(vec![node(1113), node(2113)]);

        let first = discovery.discover().await.unwrap();
        assert_eq!(first.port, 1113);

        discovery.mark_failed(&first);
        let second = discovery.discover().await.unwrap();
        assert_eq!(second.port, 2113);

        discovery.mark_failed(&second);
        assert!(matches!(
            discovery.discover().await,
            Err(DiscoveryError::Exhausted)
        ));
    }

    #[tokio::test]
    async fn single_node_discovery_exhausts_after_one_failure() {
        let mut discovery = StaticDiscovery::single("127.0.0.1", 1113);
        let n = discovery.discover().await.unwrap();
        discovery.mark_failed(&n);
        assert!(matches!(
            discovery.discover().await,
            Err(DiscoveryError::Exhausted)
        ));
    }

    #[tokio::test]
    async fn dns_discovery_resolves_localhost() {
        let mut discovery = DnsDiscovery::new("localhost", 1113);
        let n = discovery.discover().await.unwrap();
        assert_eq!(n.port, 1113);
    }
}
