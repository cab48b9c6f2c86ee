//! Smooth weighted round-robin.
//!
//! Each selection adds every node's weight to its credit, picks the node with the greatest credit
//! and charges it the total weight. Over any run of `Σw` selections a node of weight `w` is picked
//! exactly `w` times, and heavy nodes are interleaved with light ones instead of bunched.
//!
//! ```rust
//! use tollgate::WeightedBalancer;
//!
//! let balancer = WeightedBalancer::new();
//! balancer.add(1, 5);
//! balancer.add(2, 1);
//! balancer.add(3, 1);
//! let picks: Vec<u64> = (0..7).map(|_| balancer.next().unwrap()).collect();
//! assert_eq!(picks, vec![1, 1, 2, 1, 3, 1, 1]);
//! ```

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::catalog::ResourceId;

/// Credits beyond this magnitude are shifted back towards zero.
pub const CREDIT_SHIFT_THRESHOLD: i64 = i64::MAX / 4;

/// Returned when no node can be selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BalancerError {
    #[error("no node with positive weight")]
    NoResourceAvailable,
}

/// One member as seen by [`WeightedBalancer::snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Node {
    pub id: ResourceId,
    pub weight: i64,
    pub credit: i64,
}

#[derive(Debug, Default)]
struct Inner {
    nodes: Vec<Node>,
    total: i64,
}

impl Inner {
    fn recompute_total(&mut self) {
        self.total = self
            .nodes
            .iter()
            .filter(|n| n.weight > 0)
            .fold(0i64, |acc, n| acc.saturating_add(n.weight));
    }

    fn reset_credits(&mut self) {
        for node in &mut self.nodes {
            node.credit = 0;
        }
    }

    fn upsert(&mut self, id: ResourceId, weight: i64) {
        match self.nodes.iter_mut().find(|n| n.id == id) {
            Some(node) => {
                node.weight = weight;
                node.credit = 0;
            }
            None => self.nodes.push(Node { id, weight, credit: 0 }),
        }
        self.recompute_total();
    }

    fn remove_all(&mut self, ids: &[ResourceId]) -> usize {
        let before = self.nodes.len();
        self.nodes.retain(|n| !ids.contains(&n.id));
        let removed = before - self.nodes.len();
        if removed > 0 {
            self.reset_credits();
            self.recompute_total();
        }
        removed
    }

    fn select(&mut self) -> Option<ResourceId> {
        let mut positive = self.nodes.iter().filter(|n| n.weight > 0);
        let first = positive.next()?.id;
        if positive.next().is_none() {
            return Some(first);
        }

        for node in self.nodes.iter_mut().filter(|n| n.weight > 0) {
            node.credit = node.credit.saturating_add(node.weight);
        }
        // Strictly greater replaces, so the earliest node wins ties.
        let winner = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.weight > 0)
            .fold(None, |best: Option<(usize, i64)>, (idx, n)| match best {
                Some((_, credit)) if credit >= n.credit => best,
                _ => Some((idx, n.credit)),
            })
            .map(|(idx, _)| idx);

        let winner = winner?;
        let total = self.total;
        let node = &mut self.nodes[winner];
        node.credit = node.credit.saturating_sub(total);
        let id = node.id;
        self.shift_credits();
        Some(id)
    }

    fn shift_credits(&mut self) {
        let (Some(max), Some(min)) = (
            self.nodes.iter().map(|n| n.credit).max(),
            self.nodes.iter().map(|n| n.credit).min(),
        ) else {
            return;
        };
        if max.saturating_abs() > CREDIT_SHIFT_THRESHOLD
            || min.saturating_abs() > CREDIT_SHIFT_THRESHOLD
        {
            for node in &mut self.nodes {
                node.credit = node.credit.saturating_sub(min);
            }
        }
    }
}

/// Thread-safe SWRR balancer over resource ids.
///
/// Mutation and selection take the write lock; [`snapshot`](Self::snapshot) and the size queries
/// take the read lock. A poisoned lock is recovered, since every mutation leaves the node list in
/// a consistent state.
#[derive(Debug, Default)]
pub struct WeightedBalancer {
    inner: RwLock<Inner>,
}

impl WeightedBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(id, weight)` pairs in order.
    pub fn with_nodes(nodes: impl IntoIterator<Item = (ResourceId, i64)>) -> Self {
        let balancer = Self::new();
        for (id, weight) in nodes {
            balancer.add(id, weight);
        }
        balancer
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert `id`, or update its weight if present. Its credit restarts at zero.
    pub fn add(&self, id: ResourceId, weight: i64) {
        self.write().upsert(id, weight);
    }

    /// Alias of [`add`](Self::add) for existing members.
    pub fn update_weight(&self, id: ResourceId, weight: i64) {
        self.write().upsert(id, weight);
    }

    /// Remove `id`. Every remaining credit restarts at zero.
    pub fn remove(&self, id: ResourceId) -> bool {
        self.write().remove_all(&[id]) > 0
    }

    /// Remove several ids at once; returns how many were present.
    pub fn batch_remove(&self, ids: &[ResourceId]) -> usize {
        self.write().remove_all(ids)
    }

    /// Make membership equal to `nodes`: drop absent ids and upsert changed weights. Unchanged
    /// members keep their credit unless something was dropped.
    pub fn sync(&self, nodes: &[(ResourceId, i64)]) {
        let mut inner = self.write();
        let stale: Vec<ResourceId> = inner
            .nodes
            .iter()
            .filter(|n| !nodes.iter().any(|(id, _)| *id == n.id))
            .map(|n| n.id)
            .collect();
        inner.remove_all(&stale);
        for &(id, weight) in nodes {
            let unchanged = inner.nodes.iter().any(|n| n.id == id && n.weight == weight);
            if !unchanged {
                inner.upsert(id, weight);
            }
        }
    }

    /// Pick the next id.
    pub fn next(&self) -> Result<ResourceId, BalancerError> {
        self.write().select().ok_or(BalancerError::NoResourceAvailable)
    }

    pub fn snapshot(&self) -> Vec<Node> {
        self.read().nodes.clone()
    }

    pub fn contains(&self, id: ResourceId) -> bool {
        self.read().nodes.iter().any(|n| n.id == id)
    }

    pub fn len(&self) -> usize {
        self.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().nodes.is_empty()
    }

    /// Sum of positive weights.
    pub fn total_weight(&self) -> i64 {
        self.read().total
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn tally(balancer: &WeightedBalancer, rounds: usize) -> HashMap<ResourceId, i64> {
        let mut counts = HashMap::new();
        for _ in 0..rounds {
            *counts.entry(balancer.next().unwrap()).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn each_node_wins_its_weight_per_cycle() {
        let weights = [(1, 5), (2, 3), (3, 2), (4, 1)];
        let balancer = WeightedBalancer::with_nodes(weights);
        let total = balancer.total_weight() as usize;
        assert_eq!(total, 11);
        for _cycle in 0..2 {
            let counts = tally(&balancer, total);
            for (id, w) in weights {
                assert_eq!(counts[&id], w, "node {id}");
            }
        }
    }

    #[test]
    fn heavy_node_is_not_bunched() {
        let balancer = WeightedBalancer::with_nodes([(1, 2), (2, 1), (3, 1)]);
        let picks: Vec<_> = (0..4).map(|_| balancer.next().unwrap()).collect();
        assert_eq!(picks, vec![1, 2, 3, 1]);
        for pair in picks.windows(2) {
            assert!(pair[0] != pair[1] || pair[0] != 1, "weight-2 node picked twice in a row");
        }
    }

    #[test]
    fn degenerate_pools() {
        let empty = WeightedBalancer::new();
        assert_eq!(empty.next(), Err(BalancerError::NoResourceAvailable));

        let zeros = WeightedBalancer::with_nodes([(1, 0), (2, -3)]);
        assert_eq!(zeros.next(), Err(BalancerError::NoResourceAvailable));
        assert_eq!(zeros.total_weight(), 0);

        let single = WeightedBalancer::with_nodes([(1, 0), (7, 4)]);
        assert_eq!(single.next(), Ok(7));
        assert!(single.snapshot().iter().all(|n| n.credit == 0));
    }

    #[test]
    fn remove_resets_credits() {
        let balancer = WeightedBalancer::with_nodes([(1, 3), (2, 2), (3, 1)]);
        balancer.next().unwrap();
        balancer.next().unwrap();
        assert!(balancer.remove(2));
        assert!(!balancer.remove(2));
        assert!(balancer.snapshot().iter().all(|n| n.credit == 0));
        assert_eq!(balancer.total_weight(), 4);

        assert_eq!(balancer.batch_remove(&[1, 3, 99]), 2);
        assert!(balancer.is_empty());
    }

    #[test]
    fn update_weight_changes_share() {
        let balancer = WeightedBalancer::with_nodes([(1, 1), (2, 1)]);
        balancer.update_weight(2, 3);
        assert_eq!(balancer.len(), 2);
        let counts = tally(&balancer, 4);
        assert_eq!(counts[&2], 3);
        assert_eq!(counts[&1], 1);
    }

    #[test]
    fn sync_matches_membership() {
        let balancer = WeightedBalancer::with_nodes([(1, 1), (2, 1), (3, 1)]);
        balancer.sync(&[(2, 1), (3, 5), (4, 2)]);
        let ids: Vec<_> = balancer.snapshot().iter().map(|n| (n.id, n.weight)).collect();
        assert_eq!(ids, vec![(2, 1), (3, 5), (4, 2)]);
        assert_eq!(balancer.total_weight(), 8);
        assert!(!balancer.contains(1));
    }

    #[test]
    fn huge_weights_stay_fair() {
        let big = i64::MAX / 8;
        let balancer = WeightedBalancer::with_nodes([(1, big), (2, big)]);
        let counts = tally(&balancer, 200);
        assert_eq!(counts[&1], 100);
        assert_eq!(counts[&2], 100);
        for node in balancer.snapshot() {
            assert!(node.credit.saturating_abs() <= CREDIT_SHIFT_THRESHOLD.saturating_mul(2));
        }
    }

    #[test]
    fn credits_near_overflow_are_shifted() {
        let balancer = WeightedBalancer::with_nodes([(1, i64::MAX / 2), (2, i64::MAX / 2)]);
        let picks: Vec<_> = (0..10).map(|_| balancer.next().unwrap()).collect();
        assert_eq!(picks, vec![1, 2, 1, 2, 1, 2, 1, 2, 1, 2]);
        assert!(balancer.snapshot().iter().all(|n| n.credit >= 0));

        let skewed = WeightedBalancer::with_nodes([(1, i64::MAX / 2), (2, i64::MAX / 4)]);
        let counts = tally(&skewed, 12);
        assert_eq!(counts[&1], 8);
        assert_eq!(counts[&2], 4);
    }
}
