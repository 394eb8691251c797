//! Subtree reconfiguration: re-solve small subtrees exactly and keep strict
//! improvements, optionally over a forest of randomised copies, optionally
//! interleaved with slicing.

use bit_set::BitSet;
use log::debug;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::processor::optimal_ssa_path;
use crate::scoring::LocalCost;
use crate::tree::{ContractionTree, Legs, SliceOptions};
use crate::Dict;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconfOptions {
    /// Number of frontier nodes each subtree is grown to.
    pub subtree_size: usize,
    /// Maximum number of subtrees visited per pass.
    pub maxiter: usize,
    /// Local cost to minimize, taken from the search target when unset.
    pub minimize: Option<LocalCost>,
    pub seed: Option<u64>,
    /// Use the forest variant.
    pub forested: bool,
    pub num_trees: usize,
    pub num_restarts: usize,
    /// Run the forest's trees on the rayon pool.
    pub parallel: bool,
}

impl Default for ReconfOptions {
    fn default() -> Self {
        ReconfOptions {
            subtree_size: 8,
            maxiter: 500,
            minimize: None,
            seed: None,
            forested: false,
            num_trees: 2,
            num_restarts: 8,
            parallel: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SliceReconfOptions {
    pub target_size: f64,
    /// Each round slices until the largest tensor shrinks by this factor.
    pub step_size: f64,
    pub target_overhead: Option<f64>,
    pub allow_outer: bool,
    pub reconf_opts: ReconfOptions,
}

impl Default for SliceReconfOptions {
    fn default() -> Self {
        SliceReconfOptions {
            target_size: 2f64.powi(27),
            step_size: 2.0,
            target_overhead: None,
            allow_outer: true,
            reconf_opts: ReconfOptions::default(),
        }
    }
}

fn seed_or_entropy(seed: Option<u64>) -> u64 {
    match seed {
        Some(seed) => seed,
        None => StdRng::from_entropy().gen(),
    }
}

struct Replacement {
    interior: Vec<BitSet>,
    nodes: Vec<(BitSet, (BitSet, BitSet), Legs)>,
}

impl ContractionTree {
    fn cost_of(&self, minimize: LocalCost, node: &BitSet) -> f64 {
        let (l, r) = &self.children[node];
        self.local_cost(minimize, &self.legs[l], &self.legs[r], &self.legs[node])
    }

    /// Grow a subtree below `node` to `subtree_size` frontier nodes, always
    /// expanding the largest frontier intermediate, and solve it exactly.
    fn best_replacement(&self, node: &BitSet, subtree_size: usize, minimize: LocalCost) -> Option<Replacement> {
        let (l, r) = self.children.get(node)?.clone();
        let mut frontier: Vec<BitSet> = vec![l, r];
        let mut interior: Vec<BitSet> = vec![node.clone()];
        while frontier.len() < subtree_size {
            let expand = frontier
                .iter()
                .enumerate()
                .filter(|(_, f)| self.children.contains_key(*f))
                .max_by(|(_, a), (_, b)| self.get_size(a).total_cmp(&self.get_size(b)))
                .map(|(k, _)| k);
            let Some(k) = expand else {
                break;
            };
            let f = frontier.remove(k);
            let (a, b) = self.children[&f].clone();
            interior.push(f);
            frontier.push(a);
            frontier.push(b);
        }
        if frontier.len() < 3 {
            return None;
        }

        let inputs: Vec<Vec<u32>> = frontier
            .iter()
            .map(|f| self.legs[f].iter().map(|&(ix, _)| ix).collect())
            .collect();
        let output: Vec<u32> = self.legs[node].iter().map(|&(ix, _)| ix).collect();
        let size_dict: Dict<u32, f32> = inputs
            .iter()
            .flatten()
            .map(|&ix| (ix, self.ix_size(ix) as f32))
            .collect();
        let ssa = optimal_ssa_path(&inputs, &output, &size_dict, minimize);

        let mut legs: Dict<BitSet, Legs> = frontier.iter().map(|f| (f.clone(), self.legs[f].clone())).collect();
        let mut ssa_nodes: Vec<Option<BitSet>> = frontier.iter().cloned().map(Some).collect();
        let mut nodes = Vec::with_capacity(interior.len());
        for con in ssa {
            let [i, j] = con[..] else {
                return None;
            };
            let a = ssa_nodes.get_mut(i)?.take()?;
            let b = ssa_nodes.get_mut(j)?.take()?;
            let p: BitSet = a.union(&b).collect();
            let p_legs = self.merge_legs(&legs[&a], &legs[&b]);
            legs.insert(p.clone(), p_legs.clone());
            ssa_nodes.push(Some(p.clone()));
            nodes.push((p, (a, b), p_legs));
        }
        match nodes.last() {
            Some((p, _, _)) if p == node => {}
            _ => return None,
        }

        let old_cost = ContractionTree::combine_costs(minimize, interior.iter().map(|x| self.cost_of(minimize, x)));
        let new_cost = ContractionTree::combine_costs(
            minimize,
            nodes
                .iter()
                .map(|(_, (a, b), p_legs)| self.local_cost(minimize, &legs[a], &legs[b], p_legs)),
        );
        if new_cost < old_cost * (1.0 - 1e-9) {
            Some(Replacement { interior, nodes })
        } else {
            None
        }
    }

    fn apply_replacement(&mut self, replacement: Replacement) {
        let Replacement { interior, nodes } = replacement;
        let Some(root) = nodes.last().map(|(p, _, _)| p.clone()) else {
            return;
        };
        let Some(pos) = self.order.iter().position(|x| *x == root) else {
            return;
        };
        let interior: FxHashSet<BitSet> = interior.into_iter().collect();
        let removed_before = self.order[..pos].iter().filter(|x| interior.contains(*x)).count();
        self.order.retain(|x| !interior.contains(x));
        for x in interior.iter() {
            self.children.remove(x);
            self.legs.remove(x);
        }
        let at = pos - removed_before;
        let mut new_order = Vec::with_capacity(nodes.len());
        for (p, lr, p_legs) in nodes {
            self.children.insert(p.clone(), lr);
            self.legs.insert(p.clone(), p_legs);
            new_order.push(p);
        }
        self.order.splice(at..at, new_order);
    }

    /// One pass over not yet optimized intermediates, most expensive first
    /// (or in random order given an rng). Returns the number of subtrees
    /// replaced.
    fn reconfigure_pass(
        &mut self,
        subtree_size: usize,
        minimize: LocalCost,
        maxiter: usize,
        rng: Option<&mut StdRng>,
    ) -> usize {
        let mut queue: Vec<BitSet> = self
            .order
            .iter()
            .filter(|x| !self.already_optimized.contains(*x))
            .cloned()
            .collect();
        match rng {
            Some(rng) => queue.shuffle(rng),
            None => queue.sort_by(|a, b| {
                self.cost_of(minimize, a)
                    .total_cmp(&self.cost_of(minimize, b))
                    .then_with(|| b.cmp(a))
            }),
        }

        let mut replaced = 0;
        for _ in 0..maxiter {
            let Some(node) = queue.pop() else {
                break;
            };
            if !self.children.contains_key(&node) || self.already_optimized.contains(&node) {
                continue;
            }
            if let Some(replacement) = self.best_replacement(&node, subtree_size, minimize) {
                self.apply_replacement(replacement);
                replaced += 1;
            }
            self.already_optimized.insert(node);
        }
        replaced
    }

    /// Re-solve subtrees exactly, replacing any that strictly improve.
    pub fn subtree_reconfigure(&mut self, opts: &ReconfOptions) {
        let minimize = opts.minimize.unwrap_or(LocalCost::Flops);
        let before = self.total_cost(minimize);
        let replaced = self.reconfigure_pass(opts.subtree_size, minimize, opts.maxiter, None);
        debug!(
            "subtree reconfiguration replaced {} subtrees, cost {:.4e} -> {:.4e}",
            replaced,
            before,
            self.total_cost(minimize)
        );
    }

    /// Keep a forest of copies, reconfigure each with random subtree sizes
    /// and visiting orders, and after every restart replace the worse half
    /// with copies of the better half. The best tree is kept.
    pub fn subtree_reconfigure_forest(&mut self, opts: &ReconfOptions) {
        let minimize = opts.minimize.unwrap_or(LocalCost::Flops);
        let num_trees = opts.num_trees.max(1);
        let base_seed = seed_or_entropy(opts.seed);
        let min_size = (opts.subtree_size / 2).max(3).min(opts.subtree_size.max(3));
        let max_size = opts.subtree_size.max(min_size);

        let mut forest: Vec<ContractionTree> = vec![self.clone(); num_trees];
        for restart in 0..opts.num_restarts.max(1) {
            let run = |(t, tree): (usize, &mut ContractionTree)| {
                let stream = (restart * num_trees + t) as u64;
                let mut rng = StdRng::seed_from_u64(base_seed.wrapping_add(stream.wrapping_mul(0x9E37_79B9_7F4A_7C15)));
                let subtree_size = rng.gen_range(min_size..=max_size);
                tree.already_optimized.clear();
                tree.reconfigure_pass(subtree_size, minimize, opts.maxiter, Some(&mut rng));
            };
            if opts.parallel {
                forest.par_iter_mut().enumerate().for_each(run);
            } else {
                forest.iter_mut().enumerate().for_each(run);
            }
            forest.sort_by(|a, b| a.total_cost(minimize).total_cmp(&b.total_cost(minimize)));
            let keep = (num_trees + 1) / 2;
            for i in keep..num_trees {
                forest[i] = forest[i % keep].clone();
            }
        }
        if let Some(best) = forest.into_iter().next() {
            if best.total_cost(minimize) < self.total_cost(minimize) {
                *self = best;
            }
        }
    }

    /// Alternate slicing towards `target_size` in steps of `step_size` with
    /// subtree reconfiguration.
    pub fn slice_and_reconfigure(&mut self, opts: &SliceReconfOptions) {
        while self.max_size() > opts.target_size {
            let num_sliced = self.sliced.len();
            let step_target = (self.max_size() / opts.step_size.max(1.0 + 1e-9)).max(opts.target_size);
            self.slice(&SliceOptions {
                target_size: Some(step_target),
                target_overhead: opts.target_overhead,
                target_slices: None,
                allow_outer: opts.allow_outer,
            });
            self.already_optimized.clear();
            if opts.reconf_opts.forested {
                self.subtree_reconfigure_forest(&opts.reconf_opts);
            } else {
                self.subtree_reconfigure(&opts.reconf_opts);
            }
            if self.sliced.len() == num_sliced {
                // nothing left that can be sliced
                break;
            }
        }
    }

    /// Run [`ContractionTree::slice_and_reconfigure`] on several copies, all
    /// but the first with seeded forest reconfiguration, and keep the
    /// cheapest.
    pub fn slice_and_reconfigure_forest(&mut self, opts: &SliceReconfOptions) {
        let minimize = opts.reconf_opts.minimize.unwrap_or(LocalCost::Flops);
        let num_trees = opts.reconf_opts.num_trees.max(1);
        let base_seed = seed_or_entropy(opts.reconf_opts.seed);

        let mut forest: Vec<ContractionTree> = vec![self.clone(); num_trees];
        let run = |(t, tree): (usize, &mut ContractionTree)| {
            let mut tree_opts = opts.clone();
            tree_opts.reconf_opts.seed = Some(base_seed.wrapping_add(t as u64));
            // the first tree follows the deterministic pass
            tree_opts.reconf_opts.forested = t > 0;
            tree.slice_and_reconfigure(&tree_opts);
        };
        if opts.reconf_opts.parallel {
            forest.par_iter_mut().enumerate().for_each(run);
        } else {
            forest.iter_mut().enumerate().for_each(run);
        }
        let best = forest
            .into_iter()
            .min_by(|a, b| a.total_cost(minimize).total_cmp(&b.total_cost(minimize)));
        if let Some(best) = best {
            *self = best;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::ContractionProblem;
    use std::sync::Arc;

    fn ring(n: usize, d: u64) -> Arc<ContractionProblem> {
        // a closed ring of matrices, with one open index per site
        let letters: Vec<char> = "abcdefghijklmnopqrstuvwxyz".chars().collect();
        let bonds = &letters[..n];
        let opens = &letters[n..2 * n];
        let terms: Vec<String> = (0..n)
            .map(|i| format!("{}{}{}", bonds[i], bonds[(i + 1) % n], opens[i]))
            .collect();
        let eq = format!("{}->", terms.join(","));
        ContractionProblem::from_equation(&eq, letters[..2 * n].iter().map(|&c| (c, d))).map(Arc::new).unwrap()
    }

    fn bad_ring_tree(n: usize) -> ContractionTree {
        // contract every other site first, which creates big intermediates
        let mut path: Vec<Vec<usize>> = Vec::new();
        let mut next = n;
        let mut evens: Vec<usize> = (0..n).step_by(2).collect();
        let odds: Vec<usize> = (1..n).step_by(2).collect();
        let mut acc = evens.remove(0);
        for e in evens.into_iter().chain(odds) {
            path.push(vec![acc, e]);
            acc = next;
            next += 1;
        }
        ContractionTree::from_ssa_path(ring(n, 4), &path).unwrap()
    }

    #[test]
    fn reconfigure_improves_and_keeps_tree_valid() {
        let mut tree = bad_ring_tree(8);
        let before = tree.total_flops();
        tree.subtree_reconfigure(&ReconfOptions::default());
        assert!(tree.total_flops() < before);
        assert_eq!(tree.intermediates().len(), 7);
        assert!(!tree.optimized_nodes().is_empty());
        // the tree still round trips through its own path
        let again = ContractionTree::from_ssa_path(tree.problem.clone(), &tree.ssa_path()).unwrap();
        assert_eq!(again.total_flops(), tree.total_flops());
    }

    #[test]
    fn reconfigure_never_worsens() {
        let mut tree = bad_ring_tree(6);
        tree.subtree_reconfigure(&ReconfOptions::default());
        let once = tree.total_flops();
        tree.clear_optimized();
        tree.subtree_reconfigure(&ReconfOptions::default());
        assert!(tree.total_flops() <= once);
    }

    #[test]
    fn forest_is_seeded_and_improves() {
        let opts = ReconfOptions {
            seed: Some(42),
            num_restarts: 3,
            subtree_size: 6,
            ..Default::default()
        };
        let mut a = bad_ring_tree(8);
        let before = a.total_flops();
        a.subtree_reconfigure_forest(&opts);
        let mut b = bad_ring_tree(8);
        b.subtree_reconfigure_forest(&ReconfOptions { parallel: true, ..opts });
        assert!(a.total_flops() < before);
        assert_eq!(a.ssa_path(), b.ssa_path());
    }

    #[test]
    fn slice_and_reconfigure_hits_target() {
        let mut tree = bad_ring_tree(8);
        let opts = SliceReconfOptions {
            target_size: 64.0,
            ..Default::default()
        };
        tree.slice_and_reconfigure(&opts);
        assert!(tree.max_size() <= 64.0);
        assert!(!tree.sliced_inds().is_empty());

        let mut forest = bad_ring_tree(8);
        forest.slice_and_reconfigure_forest(&SliceReconfOptions {
            reconf_opts: ReconfOptions {
                seed: Some(1),
                ..Default::default()
            },
            ..opts
        });
        assert!(forest.max_size() <= 64.0);
    }
}
