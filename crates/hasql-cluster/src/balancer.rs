use hasql_common::{ClusterError, Node, NodeId, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

/// Load-balancing policy for single-target dispatch.
///
/// Candidates are always passed sorted by node id and are already restricted
/// to active nodes, so a balancer can never return a node outside the active
/// set. Stateful policies keep their state behind interior mutability.
pub trait Balancer: Send + Sync + fmt::Debug {
    /// Picks one candidate. Fails with `ClusterExhausted` when there is none.
    fn pick(&self, candidates: &[Node]) -> Result<NodeId>;

    /// The node `pick` would choose, without advancing any state.
    ///
    /// Policies that cannot answer this deterministically return `None`.
    fn peek(&self, candidates: &[Node]) -> Option<NodeId>;

    /// Every candidate, in id order, for fan-out dispatch.
    fn all(&self, candidates: &[Node]) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = candidates.iter().map(|n| n.id.clone()).collect();
        ids.sort();
        ids
    }

    /// Called when a single-target call starts on `node`.
    fn call_started(&self, _node: &NodeId) {}

    /// Called when a single-target call on `node` completes.
    fn call_finished(&self, _node: &NodeId) {}
}

/// The shipped balancer policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancerKind {
    #[default]
    RoundRobin,
    Random,
    Weighted,
    Load,
}

impl BalancerKind {
    pub const ALL: [BalancerKind; 4] = [
        BalancerKind::RoundRobin,
        BalancerKind::Random,
        BalancerKind::Weighted,
        BalancerKind::Load,
    ];

    /// Builds a fresh balancer. `seed` only affects [`BalancerKind::Random`].
    pub fn build(self, seed: Option<u64>) -> Box<dyn Balancer> {
        match self {
            BalancerKind::RoundRobin => Box::new(RoundRobinBalancer::new()),
            BalancerKind::Random => Box::new(match seed {
                Some(seed) => RandomBalancer::with_seed(seed),
                None => RandomBalancer::new(),
            }),
            BalancerKind::Weighted => Box::new(WeightedBalancer),
            BalancerKind::Load => Box::new(LoadBalancer::new()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BalancerKind::RoundRobin => "round_robin",
            BalancerKind::Random => "random",
            BalancerKind::Weighted => "weighted",
            BalancerKind::Load => "load",
        }
    }
}

impl fmt::Display for BalancerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BalancerKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" | "roundrobin" | "rr" => Ok(BalancerKind::RoundRobin),
            "random" => Ok(BalancerKind::Random),
            "weighted" | "simple" => Ok(BalancerKind::Weighted),
            "load" => Ok(BalancerKind::Load),
            other => Err(format!("unknown balancer '{}'", other)),
        }
    }
}

fn lowest(candidates: &[Node]) -> Option<&Node> {
    candidates.iter().min_by(|a, b| a.id.cmp(&b.id))
}

// ============================================================================
// Round Robin
// ============================================================================

/// Cursor over node ids: picks the first candidate after the previous pick.
///
/// Because the cursor is an id rather than an index, membership changes never
/// make it skip or repeat a node: every candidate is visited once before any
/// is visited twice.
#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    last: Mutex<Option<NodeId>>,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_after<'a>(last: Option<&NodeId>, candidates: &'a [Node]) -> Option<&'a Node> {
        let after = last.and_then(|last| {
            candidates
                .iter()
                .filter(|n| &n.id > last)
                .min_by(|a, b| a.id.cmp(&b.id))
        });
        after.or_else(|| lowest(candidates))
    }
}

impl Balancer for RoundRobinBalancer {
    fn pick(&self, candidates: &[Node]) -> Result<NodeId> {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let node = Self::next_after(last.as_ref(), candidates).ok_or(ClusterError::ClusterExhausted)?;
        *last = Some(node.id.clone());
        Ok(node.id.clone())
    }

    fn peek(&self, candidates: &[Node]) -> Option<NodeId> {
        let last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        Self::next_after(last.as_ref(), candidates).map(|n| n.id.clone())
    }
}

// ============================================================================
// Random
// ============================================================================

/// Weight-proportional random choice.
#[derive(Debug)]
pub struct RandomBalancer {
    rng: Mutex<StdRng>,
}

impl RandomBalancer {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Reproducible sequence for a given seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for RandomBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl Balancer for RandomBalancer {
    fn pick(&self, candidates: &[Node]) -> Result<NodeId> {
        if candidates.is_empty() {
            return Err(ClusterError::ClusterExhausted);
        }
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());

        let total: u64 = candidates.iter().map(|n| n.weight as u64).sum();
        if total == 0 {
            let index = rng.gen_range(0..candidates.len());
            return Ok(candidates[index].id.clone());
        }

        let mut ticket = rng.gen_range(0..total);
        for node in candidates {
            let weight = node.weight as u64;
            if ticket < weight {
                return Ok(node.id.clone());
            }
            ticket -= weight;
        }
        // unreachable while ticket < total
        Err(ClusterError::ClusterExhausted)
    }

    fn peek(&self, _candidates: &[Node]) -> Option<NodeId> {
        None
    }
}

// ============================================================================
// Weighted
// ============================================================================

/// Always the highest-weight candidate; ties go to the lowest id.
#[derive(Debug, Default, Clone, Copy)]
pub struct WeightedBalancer;

impl WeightedBalancer {
    fn choose(candidates: &[Node]) -> Option<&Node> {
        candidates
            .iter()
            .min_by(|a, b| b.weight.cmp(&a.weight).then_with(|| a.id.cmp(&b.id)))
    }
}

impl Balancer for WeightedBalancer {
    fn pick(&self, candidates: &[Node]) -> Result<NodeId> {
        Self::choose(candidates)
            .map(|n| n.id.clone())
            .ok_or(ClusterError::ClusterExhausted)
    }

    fn peek(&self, candidates: &[Node]) -> Option<NodeId> {
        Self::choose(candidates).map(|n| n.id.clone())
    }
}

// ============================================================================
// Load
// ============================================================================

/// Fewest in-flight calls relative to weight; ties go to the lowest id.
#[derive(Debug, Default)]
pub struct LoadBalancer {
    in_flight: Mutex<HashMap<NodeId, u64>>,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current in-flight count for `node`.
    pub fn in_flight(&self, node: &NodeId) -> u64 {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(node)
            .copied()
            .unwrap_or(0)
    }

    fn choose<'a>(&self, candidates: &'a [Node]) -> Option<&'a Node> {
        let in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        let load = |n: &Node| in_flight.get(&n.id).copied().unwrap_or(0);
        // compare load_a / weight_a with load_b / weight_b without dividing
        candidates.iter().min_by(|a, b| {
            let lhs = load(a) * b.weight.max(1) as u64;
            let rhs = load(b) * a.weight.max(1) as u64;
            lhs.cmp(&rhs).then_with(|| a.id.cmp(&b.id))
        })
    }
}

impl Balancer for LoadBalancer {
    fn pick(&self, candidates: &[Node]) -> Result<NodeId> {
        self.choose(candidates)
            .map(|n| n.id.clone())
            .ok_or(ClusterError::ClusterExhausted)
    }

    fn peek(&self, candidates: &[Node]) -> Option<NodeId> {
        self.choose(candidates).map(|n| n.id.clone())
    }

    fn call_started(&self, node: &NodeId) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        *in_flight.entry(node.clone()).or_insert(0) += 1;
    }

    fn call_finished(&self, node: &NodeId) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = in_flight.get_mut(node) {
            *count = count.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(ids: &[&str]) -> Vec<Node> {
        ids.iter().map(|id| Node::new(*id, format!("memory://{}", id))).collect()
    }

    fn id(s: &str) -> NodeId {
        NodeId::from(s)
    }

    #[test]
    fn test_round_robin() {
        let lb = RoundRobinBalancer::new();
        let candidates = nodes(&["node1", "node2", "node3"]);

        assert_eq!(lb.pick(&candidates).unwrap(), id("node1"));
        assert_eq!(lb.pick(&candidates).unwrap(), id("node2"));
        assert_eq!(lb.pick(&candidates).unwrap(), id("node3"));
        // wraps around
        assert_eq!(lb.pick(&candidates).unwrap(), id("node1"));
    }

    #[test]
    fn test_round_robin_skips_removed_node() {
        let lb = RoundRobinBalancer::new();
        let all = nodes(&["node1", "node2", "node3"]);
        assert_eq!(lb.pick(&all).unwrap(), id("node1"));

        let without_node2 = nodes(&["node1", "node3"]);
        assert_eq!(lb.pick(&without_node2).unwrap(), id("node3"));
        assert_eq!(lb.pick(&without_node2).unwrap(), id("node1"));
    }

    #[test]
    fn test_round_robin_visits_all_before_repeating() {
        let lb = RoundRobinBalancer::new();
        let candidates = nodes(&["a", "b", "c", "d", "e"]);
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..candidates.len() {
            assert!(seen.insert(lb.pick(&candidates).unwrap()));
        }
    }

    #[test]
    fn test_round_robin_peek_does_not_advance() {
        let lb = RoundRobinBalancer::new();
        let candidates = nodes(&["node1", "node2"]);
        assert_eq!(lb.peek(&candidates), Some(id("node1")));
        assert_eq!(lb.peek(&candidates), Some(id("node1")));
        lb.pick(&candidates).unwrap();
        assert_eq!(lb.peek(&candidates), Some(id("node2")));
    }

    #[test]
    fn test_empty_candidates_exhausted() {
        for kind in BalancerKind::ALL {
            let lb = kind.build(Some(7));
            assert!(lb.pick(&[]).unwrap_err().is_cluster_exhausted());
            assert_eq!(lb.peek(&[]), None);
        }
    }

    #[test]
    fn test_single_node() {
        for kind in BalancerKind::ALL {
            let lb = kind.build(Some(7));
            let candidates = nodes(&["only-node"]);
            assert_eq!(lb.pick(&candidates).unwrap(), id("only-node"));
            assert_eq!(lb.pick(&candidates).unwrap(), id("only-node"));
        }
    }

    #[test]
    fn test_random_is_reproducible_with_seed() {
        let candidates = nodes(&["a", "b", "c"]);
        let first = RandomBalancer::with_seed(42);
        let second = RandomBalancer::with_seed(42);
        for _ in 0..20 {
            assert_eq!(first.pick(&candidates).unwrap(), second.pick(&candidates).unwrap());
        }
    }

    #[test]
    fn test_random_respects_zero_weight() {
        let lb = RandomBalancer::with_seed(1);
        let candidates = vec![
            Node::new("a", "memory://a").with_weight(0),
            Node::new("b", "memory://b").with_weight(1),
        ];
        for _ in 0..50 {
            assert_eq!(lb.pick(&candidates).unwrap(), id("b"));
        }
    }

    #[test]
    fn test_random_all_zero_weights() {
        let lb = RandomBalancer::with_seed(3);
        let candidates = vec![
            Node::new("a", "memory://a").with_weight(0),
            Node::new("b", "memory://b").with_weight(0),
        ];
        let picked = lb.pick(&candidates).unwrap();
        assert!(picked == id("a") || picked == id("b"));
    }

    #[test]
    fn test_weighted_prefers_heaviest() {
        let lb = WeightedBalancer;
        let candidates = vec![
            Node::new("a", "memory://a").with_weight(1),
            Node::new("b", "memory://b").with_weight(5),
            Node::new("c", "memory://c").with_weight(5),
        ];
        // tie between b and c goes to the lowest id
        assert_eq!(lb.pick(&candidates).unwrap(), id("b"));
        assert_eq!(lb.peek(&candidates), Some(id("b")));
    }

    #[test]
    fn test_load_balancer_tracks_in_flight() {
        let lb = LoadBalancer::new();
        let candidates = nodes(&["a", "b"]);

        assert_eq!(lb.pick(&candidates).unwrap(), id("a"));
        lb.call_started(&id("a"));
        assert_eq!(lb.pick(&candidates).unwrap(), id("b"));
        lb.call_started(&id("b"));
        lb.call_started(&id("b"));
        assert_eq!(lb.pick(&candidates).unwrap(), id("a"));

        lb.call_finished(&id("b"));
        lb.call_finished(&id("b"));
        assert_eq!(lb.in_flight(&id("b")), 0);
        assert_eq!(lb.pick(&candidates).unwrap(), id("b"));
    }

    #[test]
    fn test_load_balancer_relative_to_weight() {
        let lb = LoadBalancer::new();
        let candidates = vec![
            Node::new("a", "memory://a").with_weight(1),
            Node::new("b", "memory://b").with_weight(4),
        ];
        lb.call_started(&id("a"));
        lb.call_started(&id("b"));
        lb.call_started(&id("b"));
        // a: 1/1, b: 2/4
        assert_eq!(lb.pick(&candidates).unwrap(), id("b"));
    }

    #[test]
    fn test_all_is_sorted() {
        let lb = RoundRobinBalancer::new();
        let candidates = nodes(&["c", "a", "b"]);
        assert_eq!(lb.all(&candidates), vec![id("a"), id("b"), id("c")]);
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("round-robin".parse::<BalancerKind>().unwrap(), BalancerKind::RoundRobin);
        assert_eq!("random".parse::<BalancerKind>().unwrap(), BalancerKind::Random);
        assert_eq!("Weighted".parse::<BalancerKind>().unwrap(), BalancerKind::Weighted);
        assert_eq!("load".parse::<BalancerKind>().unwrap(), BalancerKind::Load);
        assert!("fastest".parse::<BalancerKind>().is_err());
        assert_eq!(BalancerKind::RoundRobin.to_string(), "round_robin");
    }
}
