//! Binary contraction trees and their cost model.
//!
//! Nodes are identified by the set of inputs they cover. Each node carries
//! its surviving `(index, count)` legs, where `count` is the number of
//! covered inputs the index appears on; an index is dropped once its count
//! reaches its total number of appearances (inputs plus output).

use std::collections::BTreeSet;
use std::sync::Arc;

use bit_set::BitSet;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::error::{HyperError, Result};
use crate::paths::{linear_to_ssa_n, ssa_to_linear, LinearPath, SsaPath};
use crate::problem::{ContractionProblem, Label};
use crate::processor::{compute_legs, Count};
use crate::scoring::LocalCost;
use crate::Dict;

pub use crate::reconfigure::{ReconfOptions, SliceReconfOptions};

pub(crate) type Legs = Vec<(u32, Count)>;

// marks the output in an incidence key
const OUTPUT_INCIDENCE: usize = usize::MAX;

/// How intermediate sizes are accounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeKind {
    Standard,
    /// Legs of a node that connect to exactly the same outside inputs are
    /// treated as one bond, capped at `chi`.
    Compressed { chi: u64 },
}

/// Options for [`ContractionTree::slice`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SliceOptions {
    /// Slice until the largest intermediate is at most this size.
    pub target_size: Option<f64>,
    /// Stop before total flops exceed this multiple of the unsliced flops.
    pub target_overhead: Option<f64>,
    /// Slice until there are at least this many independent contractions.
    pub target_slices: Option<f64>,
    /// Whether output indices may be sliced.
    pub allow_outer: bool,
}

impl Default for SliceOptions {
    fn default() -> Self {
        SliceOptions {
            target_size: None,
            target_overhead: None,
            target_slices: None,
            allow_outer: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContractionTree {
    pub(crate) problem: Arc<ContractionProblem>,
    appearances: Vec<Count>,
    // for each index, the inputs it appears on
    ind_terms: Vec<Vec<usize>>,
    pub(crate) legs: Dict<BitSet, Legs>,
    pub(crate) children: Dict<BitSet, (BitSet, BitSet)>,
    // intermediates, children always before parents
    pub(crate) order: Vec<BitSet>,
    root: BitSet,
    pub(crate) sliced: BTreeSet<u32>,
    kind: TreeKind,
    pub(crate) already_optimized: FxHashSet<BitSet>,
}

fn leaf(i: usize, n: usize) -> BitSet {
    let mut a = BitSet::with_capacity(n);
    a.insert(i);
    a
}

impl ContractionTree {
    /// A tree with only leaves and no contractions yet.
    fn empty(problem: Arc<ContractionProblem>) -> ContractionTree {
        let n = problem.num_inputs();
        let mut appearances: Vec<Count> = vec![0; problem.num_indices()];
        let mut ind_terms: Vec<Vec<usize>> = vec![Vec::new(); problem.num_indices()];
        let mut legs: Dict<BitSet, Legs> = Dict::default();
        for (i, term) in problem.terms().iter().enumerate() {
            for &ix in term {
                appearances[ix as usize] += 1;
                ind_terms[ix as usize].push(i);
            }
            legs.insert(leaf(i, n), term.iter().map(|&ix| (ix, 1)).collect());
        }
        for &ix in problem.out_ids() {
            appearances[ix as usize] += 1;
        }
        ContractionTree {
            problem,
            appearances,
            ind_terms,
            legs,
            children: Dict::default(),
            order: Vec::with_capacity(n.saturating_sub(1)),
            root: (0..n).collect(),
            sliced: BTreeSet::new(),
            kind: TreeKind::Standard,
            already_optimized: FxHashSet::default(),
        }
    }

    /// Build a tree from an SSA path. Single-id steps are no-ops, steps with
    /// more than two ids are contracted left to right, and any nodes still
    /// separate at the end are joined in order.
    pub fn from_ssa_path(problem: Arc<ContractionProblem>, ssa_path: &[Vec<usize>]) -> Result<ContractionTree> {
        let n = problem.num_inputs();
        let mut tree = ContractionTree::empty(problem);
        let mut ssa_nodes: Vec<Option<BitSet>> = (0..n).map(|i| Some(leaf(i, n))).collect();

        for con in ssa_path {
            let mut parts = Vec::with_capacity(con.len());
            for &s in con {
                let node = ssa_nodes
                    .get_mut(s)
                    .and_then(Option::take)
                    .ok_or_else(|| HyperError::InvalidPath(format!("ssa id {} is not available", s)))?;
                parts.push(node);
            }
            let mut parts = parts.into_iter();
            let mut acc = parts
                .next()
                .ok_or_else(|| HyperError::InvalidPath("empty contraction step".to_string()))?;
            for node in parts {
                acc = tree.merge(acc, node)?;
            }
            ssa_nodes.push(Some(acc));
        }

        // join anything left disconnected
        let mut remaining = ssa_nodes.into_iter().flatten();
        if let Some(mut acc) = remaining.next() {
            for node in remaining {
                acc = tree.merge(acc, node)?;
            }
            tree.root = acc;
        }
        Ok(tree)
    }

    /// Build a tree from a linear path, see [`ContractionTree::from_ssa_path`].
    pub fn from_linear_path(problem: Arc<ContractionProblem>, path: &[Vec<usize>]) -> Result<ContractionTree> {
        let ssa_path = linear_to_ssa_n(path, problem.num_inputs())?;
        ContractionTree::from_ssa_path(problem, &ssa_path)
    }

    /// Legs of the node formed by joining nodes with legs `a` and `b`.
    pub(crate) fn merge_legs(&self, a: &[(u32, Count)], b: &[(u32, Count)]) -> Legs {
        compute_legs(a, b, &self.appearances)
            .into_iter()
            // indices local to a single input are summed at its first contraction
            .filter(|&(ix, c)| c != self.appearances[ix as usize])
            .collect()
    }

    fn merge(&mut self, l: BitSet, r: BitSet) -> Result<BitSet> {
        if !l.is_disjoint(&r) {
            return Err(HyperError::InvalidPath(format!(
                "nodes {:?} and {:?} overlap",
                l.iter().collect::<Vec<_>>(),
                r.iter().collect::<Vec<_>>()
            )));
        }
        let p: BitSet = l.union(&r).collect();
        let p_legs = self.merge_legs(&self.legs[&l], &self.legs[&r]);
        self.legs.insert(p.clone(), p_legs);
        self.children.insert(p.clone(), (l, r));
        self.order.push(p.clone());
        Ok(p)
    }

    pub fn problem(&self) -> &ContractionProblem {
        &self.problem
    }

    pub fn num_inputs(&self) -> usize {
        self.problem.num_inputs()
    }

    pub fn kind(&self) -> TreeKind {
        self.kind
    }

    pub fn set_kind(&mut self, kind: TreeKind) {
        self.kind = kind;
    }

    pub fn root(&self) -> &BitSet {
        &self.root
    }

    pub fn is_leaf(&self, node: &BitSet) -> bool {
        node.len() == 1
    }

    pub fn get_children(&self, node: &BitSet) -> Option<&(BitSet, BitSet)> {
        self.children.get(node)
    }

    /// Intermediate nodes in construction order.
    pub fn intermediates(&self) -> &[BitSet] {
        &self.order
    }

    /// Labels of the indices on `node`, excluding sliced ones.
    pub fn node_inds(&self, node: &BitSet) -> Vec<Label> {
        self.legs
            .get(node)
            .map(|legs| {
                legs.iter()
                    .filter(|(ix, _)| !self.sliced.contains(ix))
                    .map(|&(ix, _)| self.problem.label(ix).to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn ix_size(&self, ix: u32) -> f64 {
        if self.sliced.contains(&ix) {
            1.0
        } else {
            self.problem.sizes()[ix as usize] as f64
        }
    }

    fn plain_size(&self, legs: &[(u32, Count)]) -> f64 {
        legs.iter().map(|&(ix, _)| self.ix_size(ix)).product()
    }

    /// group indices by which inputs (and output) outside `node` they touch
    fn grouped_size(&self, node: &BitSet, ixs: impl Iterator<Item = u32>, chi: f64) -> f64 {
        let mut groups: Dict<Vec<usize>, f64> = Dict::default();
        for ix in ixs {
            let mut key: Vec<usize> = self.ind_terms[ix as usize]
                .iter()
                .copied()
                .filter(|t| !node.contains(*t))
                .collect();
            if self.problem.out_ids().contains(&ix) {
                key.push(OUTPUT_INCIDENCE);
            }
            *groups.entry(key).or_insert(1.0) *= self.ix_size(ix);
        }
        groups.values().map(|&d| d.min(chi)).product()
    }

    /// Size of the tensor at `node`.
    pub fn get_size(&self, node: &BitSet) -> f64 {
        let legs = match self.legs.get(node) {
            Some(legs) => legs,
            None => return 1.0,
        };
        match self.kind {
            TreeKind::Standard => self.plain_size(legs),
            TreeKind::Compressed { chi } => self.grouped_size(node, legs.iter().map(|&(ix, _)| ix), chi as f64),
        }
    }

    /// All indices involved in contracting the children of `node`.
    fn involved_inds(&self, node: &BitSet) -> Vec<u32> {
        let Some((l, r)) = self.children.get(node) else {
            return Vec::new();
        };
        let mut ixs: Vec<u32> = self.legs[l].iter().chain(self.legs[r].iter()).map(|&(ix, _)| ix).collect();
        ixs.sort_unstable();
        ixs.dedup();
        ixs
    }

    /// Scalar operations needed to form `node` from its children, zero for
    /// leaves.
    pub fn get_flops(&self, node: &BitSet) -> f64 {
        if !self.children.contains_key(node) {
            return 0.0;
        }
        let ixs = self.involved_inds(node);
        match self.kind {
            TreeKind::Standard => ixs.iter().map(|&ix| self.ix_size(ix)).product(),
            TreeKind::Compressed { chi } => self.grouped_size(node, ixs.into_iter(), chi as f64),
        }
    }

    /// Number of independent slices the contraction is split into.
    pub fn multiplicity(&self) -> f64 {
        self.sliced
            .iter()
            .map(|&ix| self.problem.sizes()[ix as usize] as f64)
            .product()
    }

    pub fn total_flops(&self) -> f64 {
        self.multiplicity() * self.order.iter().map(|node| self.get_flops(node)).sum::<f64>()
    }

    pub fn total_write(&self) -> f64 {
        self.multiplicity() * self.order.iter().map(|node| self.get_size(node)).sum::<f64>()
    }

    /// Sum over contractions of `max(flops, factor * write)`.
    pub fn total_cost_limit(&self, factor: f64) -> f64 {
        self.multiplicity()
            * self
                .order
                .iter()
                .map(|node| self.get_flops(node).max(factor * self.get_size(node)))
                .sum::<f64>()
    }

    /// Largest single tensor, inputs included.
    pub fn max_size(&self) -> f64 {
        self.legs.keys().map(|node| self.get_size(node)).fold(1.0, f64::max)
    }

    pub fn contraction_width(&self) -> f64 {
        self.max_size().log2()
    }

    /// Largest total memory of live tensors when contracting in `order`.
    pub fn peak_size(&self) -> f64 {
        let n = self.num_inputs();
        let mut live: f64 = (0..n).map(|i| self.get_size(&leaf(i, n))).sum();
        let mut peak = live;
        for node in &self.order {
            live += self.get_size(node);
            peak = peak.max(live);
            if let Some((l, r)) = self.children.get(node) {
                live -= self.get_size(l) + self.get_size(r);
            }
        }
        peak
    }

    /// Cost of forming `p` (legs `p_legs`) from legs `a` and `b` under `minimize`.
    pub(crate) fn local_cost(&self, minimize: LocalCost, a: &[(u32, Count)], b: &[(u32, Count)], p_legs: &[(u32, Count)]) -> f64 {
        let mut ixs: Vec<u32> = a.iter().chain(b.iter()).map(|&(ix, _)| ix).collect();
        ixs.sort_unstable();
        ixs.dedup();
        let flops: f64 = ixs.iter().map(|&ix| self.ix_size(ix)).product();
        let size = self.plain_size(p_legs);
        match minimize {
            LocalCost::Flops => flops,
            LocalCost::Max | LocalCost::Size | LocalCost::Write => size,
            LocalCost::Combo(f) => flops + f * size,
            LocalCost::Limit(f) => flops.max(f * size),
        }
    }

    /// Combine local costs: `max` for size-like targets, sum otherwise.
    pub(crate) fn combine_costs(minimize: LocalCost, costs: impl Iterator<Item = f64>) -> f64 {
        match minimize {
            LocalCost::Max | LocalCost::Size => costs.fold(0.0, f64::max),
            _ => costs.sum(),
        }
    }

    /// Total cost of the whole tree under a local cost.
    pub fn total_cost(&self, minimize: LocalCost) -> f64 {
        let costs = self.order.iter().map(|node| {
            let (l, r) = &self.children[node];
            self.local_cost(minimize, &self.legs[l], &self.legs[r], &self.legs[node])
        });
        self.multiplicity() * ContractionTree::combine_costs(minimize, costs)
    }

    /// Labels of the currently sliced indices, sorted by first appearance.
    pub fn sliced_inds(&self) -> Vec<Label> {
        self.sliced.iter().map(|&ix| self.problem.label(ix).to_string()).collect()
    }

    /// Slice a single index.
    pub fn remove_ind(&mut self, label: &str) -> Result<()> {
        let ix = self
            .problem
            .index_of(label)
            .ok_or_else(|| HyperError::InvalidOption(format!("unknown index '{}'", label)))?;
        self.sliced.insert(ix);
        Ok(())
    }

    /// Greedily slice indices until the targets in `opts` hold. Each step
    /// slices the index (of the largest tensor while over `target_size`)
    /// that keeps total flops lowest.
    pub fn slice(&mut self, opts: &SliceOptions) {
        if opts.target_size.is_none() && opts.target_slices.is_none() {
            return;
        }
        let original_flops = self.total_flops();

        loop {
            let size_ok = opts.target_size.map_or(true, |t| self.max_size() <= t);
            let slices_ok = opts.target_slices.map_or(true, |t| self.multiplicity() >= t);
            if size_ok && slices_ok {
                break;
            }

            let candidate_legs: Vec<u32> = if !size_ok {
                let largest = self
                    .legs
                    .keys()
                    .max_by(|a, b| self.get_size(a).total_cmp(&self.get_size(b)).then_with(|| b.cmp(a)));
                match largest {
                    Some(node) => self.legs[node].iter().map(|&(ix, _)| ix).collect(),
                    None => break,
                }
            } else {
                (0..self.problem.num_indices() as u32).collect()
            };
            let candidates: Vec<u32> = candidate_legs
                .into_iter()
                .filter(|ix| !self.sliced.contains(ix))
                .filter(|&ix| self.problem.sizes()[ix as usize] > 1)
                .filter(|ix| opts.allow_outer || !self.problem.out_ids().contains(ix))
                .collect();

            let mut best: Option<(f64, f64, u32)> = None;
            for ix in candidates {
                self.sliced.insert(ix);
                let flops = self.total_flops();
                let size = self.max_size();
                self.sliced.remove(&ix);
                let better = match best {
                    None => true,
                    Some((bf, bs, _)) => flops < bf || (flops == bf && size < bs),
                };
                if better {
                    best = Some((flops, size, ix));
                }
            }

            let Some((flops, _, ix)) = best else {
                break;
            };
            if let Some(overhead) = opts.target_overhead {
                if flops > overhead * original_flops {
                    break;
                }
            }
            self.sliced.insert(ix);
        }
    }

    /// The memo of nodes subtree reconfiguration has already visited.
    pub fn optimized_nodes(&self) -> &FxHashSet<BitSet> {
        &self.already_optimized
    }

    pub fn clear_optimized(&mut self) {
        self.already_optimized.clear();
    }

    /// The tree as an SSA path, following the construction order.
    pub fn ssa_path(&self) -> SsaPath {
        let n = self.num_inputs();
        let mut ids: Dict<BitSet, usize> = (0..n).map(|i| (leaf(i, n), i)).collect();
        let mut path = Vec::with_capacity(self.order.len());
        for (k, node) in self.order.iter().enumerate() {
            let (l, r) = &self.children[node];
            path.push(vec![ids[l], ids[r]]);
            ids.insert(node.clone(), n + k);
        }
        path
    }

    /// The tree as a linear path.
    pub fn path(&self) -> LinearPath {
        // replaying our own order never references a missing id
        ssa_to_linear(&self.ssa_path(), self.num_inputs()).unwrap_or_default()
    }

    /// Reorder construction to follow `ssa_path` wherever it produces the
    /// same intermediates, which matters for compressed accounting. Orders
    /// that would build a parent before its children are ignored.
    pub fn set_surface_order_from_path(&mut self, ssa_path: &[Vec<usize>]) {
        let n = self.num_inputs();
        let mut ssa_nodes: Vec<BitSet> = (0..n).map(|i| leaf(i, n)).collect();
        let mut seen: FxHashSet<BitSet> = FxHashSet::default();
        let mut new_order: Vec<BitSet> = Vec::with_capacity(self.order.len());
        for con in ssa_path {
            let mut p = BitSet::with_capacity(n);
            for &s in con {
                match ssa_nodes.get(s) {
                    Some(node) => p.union_with(node),
                    None => return,
                }
            }
            if self.children.contains_key(&p) && seen.insert(p.clone()) {
                new_order.push(p.clone());
            }
            ssa_nodes.push(p);
        }
        for node in &self.order {
            if !seen.contains(node) {
                new_order.push(node.clone());
            }
        }

        let mut built: FxHashSet<&BitSet> = FxHashSet::default();
        for node in &new_order {
            let (l, r) = &self.children[node];
            let ready = |c: &BitSet| self.is_leaf(c) || built.contains(c);
            if !(ready(l) && ready(r)) {
                return;
            }
            built.insert(node);
        }
        self.order = new_order;
    }

    pub(crate) fn n(&self) -> usize {
        self.num_inputs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::linear_to_ssa;
    use proptest::prelude::*;

    fn chain() -> Arc<ContractionProblem> {
        Arc::new(ContractionProblem::from_equation("ab,bc,cd->ad", [('a', 2), ('b', 3), ('c', 4), ('d', 5)]).unwrap())
    }

    /// re-simulate a path on plain label sets: (flops, write, max intermediate)
    fn simulate(problem: &ContractionProblem, ssa: &[Vec<usize>]) -> (f64, f64, f64) {
        let size = |set: &BTreeSet<String>| -> f64 { set.iter().map(|l| problem.size_dict()[l] as f64).product() };
        let mut terms: Vec<Option<BTreeSet<String>>> = problem
            .inputs()
            .iter()
            .map(|t| Some(t.iter().cloned().collect()))
            .collect();
        let output: BTreeSet<String> = problem.output().iter().cloned().collect();
        let (mut flops, mut write, mut max_size) = (0.0, 0.0, 0.0f64);
        for con in ssa {
            let parts: Vec<BTreeSet<String>> = con.iter().map(|&s| terms[s].take().unwrap()).collect();
            let mut acc = parts[0].clone();
            for (k, part) in parts.iter().enumerate().skip(1) {
                let union: BTreeSet<String> = acc.union(part).cloned().collect();
                let rest: BTreeSet<String> = terms
                    .iter()
                    .flatten()
                    .chain(parts[k + 1..].iter())
                    .flat_map(|t| t.iter().cloned())
                    .collect();
                let kept: BTreeSet<String> =
                    union.iter().filter(|l| rest.contains(*l) || output.contains(*l)).cloned().collect();
                flops += size(&union);
                write += size(&kept);
                max_size = max_size.max(size(&kept));
                acc = kept;
            }
            terms.push(Some(acc));
        }
        (flops, write, max_size)
    }

    #[test]
    fn chain_costs() {
        let tree = ContractionTree::from_ssa_path(chain(), &[vec![0, 1], vec![2, 3]]).unwrap();
        // ab,bc->ac: 2*3*4, ac,cd->ad: 2*4*5
        assert_eq!(tree.total_flops(), 24.0 + 40.0);
        assert_eq!(tree.total_write(), 8.0 + 10.0);
        assert_eq!(tree.max_size(), 20.0);
        // 6 + 12 + 20 live, then +8 -18, then +10 -28
        assert_eq!(tree.peak_size(), 46.0);
        assert_eq!(tree.node_inds(tree.root()), vec!["a".to_string(), "d".to_string()]);
    }

    #[test]
    fn paths_roundtrip_through_tree() {
        let ssa = vec![vec![1, 2], vec![0, 3]];
        let tree = ContractionTree::from_ssa_path(chain(), &ssa).unwrap();
        assert_eq!(tree.ssa_path(), ssa);
        let linear = tree.path();
        let again = ContractionTree::from_linear_path(chain(), &linear).unwrap();
        assert_eq!(again.ssa_path(), ssa);
        assert_eq!(linear_to_ssa(&linear).unwrap(), ssa);
    }

    #[test]
    fn single_and_multi_way_steps() {
        let tree = ContractionTree::from_ssa_path(chain(), &[vec![1], vec![0, 2, 3]]).unwrap();
        assert_eq!(tree.intermediates().len(), 2);
        assert_eq!(tree.root().len(), 3);
    }

    #[test]
    fn leftovers_are_joined() {
        let tree = ContractionTree::from_ssa_path(chain(), &[vec![0, 1]]).unwrap();
        assert_eq!(tree.ssa_path(), vec![vec![0, 1], vec![2, 3]]);
    }

    #[test]
    fn bad_paths_rejected() {
        assert!(ContractionTree::from_ssa_path(chain(), &[vec![0, 1], vec![0, 2]]).is_err());
        assert!(ContractionTree::from_ssa_path(chain(), &[vec![0, 7]]).is_err());
        assert!(ContractionTree::from_ssa_path(chain(), &[vec![]]).is_err());
    }

    #[test]
    fn slicing_reduces_size() {
        let mut tree = ContractionTree::from_ssa_path(chain(), &[vec![0, 1], vec![2, 3]]).unwrap();
        tree.slice(&SliceOptions {
            target_size: Some(10.0),
            ..Default::default()
        });
        assert!(tree.max_size() <= 10.0);
        assert!(!tree.sliced_inds().is_empty());
        assert!(tree.total_flops() >= 64.0);

        let mut manual = ContractionTree::from_ssa_path(chain(), &[vec![0, 1], vec![2, 3]]).unwrap();
        manual.remove_ind("c").unwrap();
        assert_eq!(manual.multiplicity(), 4.0);
        assert_eq!(manual.sliced_inds(), vec!["c".to_string()]);
        assert!(manual.remove_ind("z").is_err());
    }

    #[test]
    fn slicing_respects_overhead() {
        let mut tree = ContractionTree::from_ssa_path(chain(), &[vec![0, 1], vec![2, 3]]).unwrap();
        tree.slice(&SliceOptions {
            target_size: Some(1.0),
            target_overhead: Some(1.0),
            ..Default::default()
        });
        assert!(tree.total_flops() <= 64.0);
    }

    #[test]
    fn compressed_accounting_caps_bonds() {
        // ab and cd both connect the first pair to the last input
        let p = Arc::new(
            ContractionProblem::from_equation("xa,xb,abcd,cd->", [('x', 2), ('a', 4), ('b', 4), ('c', 4), ('d', 4)])
                .unwrap(),
        );
        let mut tree = ContractionTree::from_ssa_path(p, &[vec![0, 1], vec![4, 2], vec![5, 3]]).unwrap();
        let standard = tree.max_size();
        tree.set_kind(TreeKind::Compressed { chi: 4 });
        assert!(tree.max_size() < standard);
        // a and b both only lead to the third input
        assert_eq!(tree.get_size(&[0, 1].into_iter().collect()), 4.0);
    }

    #[test]
    fn surface_order_follows_path() {
        let p = Arc::new(
            ContractionProblem::from_equation("ab,bc,cd,de->ae", [('a', 2), ('b', 2), ('c', 2), ('d', 2), ('e', 2)])
                .unwrap(),
        );
        let mut tree = ContractionTree::from_ssa_path(p, &[vec![0, 1], vec![2, 3], vec![4, 5]]).unwrap();
        tree.set_surface_order_from_path(&[vec![2, 3], vec![0, 1], vec![4, 5]]);
        assert_eq!(tree.ssa_path(), vec![vec![2, 3], vec![0, 1], vec![5, 4]]);
        // an order building the root first is ignored
        tree.set_surface_order_from_path(&[vec![0, 1, 2, 3]]);
        assert_eq!(tree.ssa_path()[2], vec![5, 4]);
    }

    fn random_ssa(n: usize, picks: &[(usize, usize)]) -> SsaPath {
        let mut remaining: Vec<usize> = (0..n).collect();
        let mut path = Vec::new();
        for (k, &(a, b)) in picks.iter().take(n - 1).enumerate() {
            let i = remaining.remove(a % remaining.len());
            let j = remaining.remove(b % remaining.len());
            path.push(vec![i, j]);
            remaining.push(n + k);
        }
        path
    }

    proptest! {
        #[test]
        fn costs_match_resimulation(
            picks in proptest::collection::vec((0usize..64, 0usize..64), 5),
            dims in proptest::collection::vec(2u64..5, 6),
        ) {
            let labels = ['a', 'b', 'c', 'd', 'e', 'f'];
            let problem = Arc::new(ContractionProblem::from_equation(
                "ab,bcd,de,ea,cf,f->ad",
                labels.iter().copied().zip(dims.iter().copied()),
            ).unwrap());
            let ssa = random_ssa(6, &picks);
            let tree = ContractionTree::from_ssa_path(problem.clone(), &ssa).unwrap();
            let (flops, write, size) = simulate(&problem, &ssa);
            prop_assert!(tree.total_flops() >= flops * (1.0 - 1e-12));
            prop_assert!(tree.total_write() >= write * (1.0 - 1e-12));
            prop_assert!(tree.max_size() >= size);
            prop_assert_eq!(tree.ssa_path().len(), 5);
        }
    }
}
