//! Greedy contraction by growing a single connected region outwards from a
//! seed, absorbing one neighboring node at a time.

use std::cmp::Ordering;
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::error::{HyperError, Result};
use crate::hyper::PathOptimizer;
use crate::hypergraph::{HyperGraph, Node};
use crate::paths::{ssa_to_linear, LinearPath, SsaPath};
use crate::problem::ContractionProblem;
use crate::processor::{greedy_ssa_path, GreedyOptions};
use crate::space::{ParamAccess, Params};
use crate::Dict;

/// Where the region starts when the contraction has no output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanStart {
    /// The most central node.
    Max,
    /// The least central node.
    Min,
    /// An explicit set of input positions.
    Nodes(Vec<Node>),
}

/// Rule for re-pointing a frontier node that is reachable from a newly
/// absorbed node as well as from its current merge target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceSteal {
    /// Never re-point.
    None,
    /// Re-point if the new node is strictly closer to the seed.
    Abs,
    /// Re-point if the new node's distance differs more from the frontier
    /// node's distance than the current target's does.
    Rel,
}

impl FromStr for DistanceSteal {
    type Err = HyperError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "none" => Ok(DistanceSteal::None),
            "abs" => Ok(DistanceSteal::Abs),
            "rel" => Ok(DistanceSteal::Rel),
            _ => Err(HyperError::InvalidOption(format!("unknown distance_steal '{}'", s))),
        }
    }
}

const SORT_TERMS: &str = "CNDLTI";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GreedySpanOptions {
    pub start: SpanStart,
    pub coeff_connectivity: f64,
    pub coeff_ndim: f64,
    pub coeff_distance: f64,
    pub coeff_next_centrality: f64,
    /// Weight connectivity by `log2` of the bond size rather than counting
    /// shared bonds.
    pub connectivity_weight_bonds: bool,
    pub temperature: f64,
    /// Letters of `CNDLTI` compared lexicographically, empty to sum `CNDLT`.
    pub score_perm: String,
    pub distance_p: f64,
    pub distance_steal: DistanceSteal,
    pub seed: Option<u64>,
}

impl Default for GreedySpanOptions {
    fn default() -> Self {
        GreedySpanOptions {
            start: SpanStart::Max,
            coeff_connectivity: 1.0,
            coeff_ndim: 1.0,
            coeff_distance: -1.0,
            coeff_next_centrality: 0.0,
            connectivity_weight_bonds: true,
            temperature: 0.0,
            score_perm: "CNDLTI".to_string(),
            distance_p: 1.0,
            distance_steal: DistanceSteal::Abs,
            seed: None,
        }
    }
}

impl GreedySpanOptions {
    pub fn from_params(params: &Params, seed: u64) -> Result<Self> {
        let d = GreedySpanOptions::default();
        let start = match params.str_or("start", "max")? {
            "max" => SpanStart::Max,
            "min" => SpanStart::Min,
            other => {
                return Err(HyperError::InvalidParam {
                    name: "start".to_string(),
                    reason: format!("unknown start '{}'", other),
                })
            }
        };
        Ok(GreedySpanOptions {
            start,
            coeff_connectivity: params.float_or("coeff_connectivity", d.coeff_connectivity)?,
            coeff_ndim: params.float_or("coeff_ndim", d.coeff_ndim)?,
            coeff_distance: params.float_or("coeff_distance", d.coeff_distance)?,
            coeff_next_centrality: params.float_or("coeff_next_centrality", d.coeff_next_centrality)?,
            connectivity_weight_bonds: params.bool_or("connectivity_weight_bonds", d.connectivity_weight_bonds)?,
            temperature: params.float_or("temperature", d.temperature)?,
            score_perm: params.str_or("score_perm", &d.score_perm)?.to_string(),
            distance_p: params.float_or("distance_p", d.distance_p)?,
            distance_steal: params.str_or("distance_steal", "abs")?.parse()?,
            seed: Some(seed),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct GreedySpan {
    pub opts: GreedySpanOptions,
}

fn cmp_keys(a: &[f64], b: &[f64]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        match x.total_cmp(y) {
            Ordering::Equal => continue,
            ord => return ord,
        }
    }
    a.len().cmp(&b.len())
}

/// the growing region and its frontier
struct Span<'a> {
    opts: &'a GreedySpanOptions,
    hg: &'a HyperGraph,
    cents: &'a Dict<Node, f64>,
    ndims: Vec<f64>,
    region: FxHashSet<Node>,
    candidates: Vec<Node>,
    merges: Dict<Node, Node>,
    distances: Dict<Node, f64>,
    connectivity: Dict<Node, f64>,
    rng: StdRng,
}

impl Span<'_> {
    fn distance(&self, i: Node) -> f64 {
        self.distances.get(&i).copied().unwrap_or(1.0)
    }

    fn check_candidate(&mut self, i_surface: Node, i_neighbor: Node) {
        if self.region.contains(&i_neighbor) {
            return;
        }

        if let Some(&i_current) = self.merges.get(&i_neighbor) {
            let steal = match self.opts.distance_steal {
                DistanceSteal::None => false,
                DistanceSteal::Abs => self.distance(i_surface) < self.distance(i_current),
                DistanceSteal::Rel => {
                    let old_diff = (self.distance(i_current) - self.distance(i_neighbor)).abs();
                    let new_diff = (self.distance(i_surface) - self.distance(i_neighbor)).abs();
                    new_diff > old_diff
                }
            };
            if steal {
                self.merges.insert(i_neighbor, i_surface);
            }
        } else {
            self.merges.insert(i_neighbor, i_surface);
            self.candidates.push(i_neighbor);
        }

        let weight = if self.opts.connectivity_weight_bonds {
            (self.hg.bond_size(i_surface, i_neighbor) as f64).log2()
        } else {
            1.0
        };
        *self.connectivity.entry(i_neighbor).or_insert(0.0) += weight;
    }

    fn absorb_neighbors(&mut self, i: Node) {
        for j in self.hg.neighbors(i) {
            self.check_candidate(i, j);
        }
    }

    fn sort_key(&mut self, i: Node) -> Vec<f64> {
        let o = self.opts;
        let mut term = |c: char| -> f64 {
            match c {
                'C' => o.coeff_connectivity * self.connectivity.get(&i).copied().unwrap_or(0.0),
                'N' => o.coeff_ndim * self.ndims[i],
                'D' => o.coeff_distance * self.distances.get(&i).copied().unwrap_or(1.0),
                'L' => o.coeff_next_centrality * self.cents.get(&i).copied().unwrap_or(0.0),
                'T' => {
                    if o.temperature > 0.0 {
                        o.temperature * -(-self.rng.gen::<f64>().ln()).ln()
                    } else {
                        0.0
                    }
                }
                _ => -(i as f64),
            }
        };
        let mut key: Vec<f64> = if o.score_perm.is_empty() {
            vec!["CNDLT".chars().map(&mut term).sum()]
        } else {
            o.score_perm.chars().map(&mut term).collect()
        };
        // ties always go to the lowest node id
        key.push(-(i as f64));
        key
    }

    /// Grow until no candidates remain, returning `(absorbed, target)` pairs.
    fn grow(&mut self, seq: &mut Vec<(Node, Node)>) {
        while !self.candidates.is_empty() {
            let keys: Vec<Vec<f64>> = self.candidates.clone().into_iter().map(|i| self.sort_key(i)).collect();
            let best = (0..keys.len()).max_by(|&a, &b| cmp_keys(&keys[a], &keys[b])).unwrap_or(0);
            let i_surface = self.candidates.swap_remove(best);
            self.region.insert(i_surface);
            self.absorb_neighbors(i_surface);
            seq.push((i_surface, self.merges[&i_surface]));
        }
    }
}

impl GreedySpan {
    pub fn new(opts: GreedySpanOptions) -> Self {
        GreedySpan { opts }
    }

    pub fn ssa_path(&self, problem: &ContractionProblem) -> Result<SsaPath> {
        if let Some(bad) = self.opts.score_perm.chars().find(|c| !SORT_TERMS.contains(*c)) {
            return Err(HyperError::InvalidParam {
                name: "score_perm".to_string(),
                reason: format!("unknown score term '{}'", bad),
            });
        }
        let n = problem.num_inputs();
        let hg = HyperGraph::from_problem(problem);
        let cents = hg.simple_centrality(2.0, 0.75, 0.5);
        let by_centrality = |a: &Node, b: &Node| cents[a].total_cmp(&cents[b]).then(b.cmp(a));

        let mut seeds: Vec<Node> = if !problem.out_ids().is_empty() {
            hg.output_nodes()
        } else {
            match &self.opts.start {
                SpanStart::Max => hg.nodes().into_iter().max_by(by_centrality).into_iter().collect(),
                SpanStart::Min => hg.nodes().into_iter().min_by(by_centrality).into_iter().collect(),
                SpanStart::Nodes(nodes) => {
                    if let Some(&bad) = nodes.iter().find(|&&i| i >= n) {
                        return Err(HyperError::InvalidOption(format!("start node {} out of range", bad)));
                    }
                    nodes.clone()
                }
            }
        };
        seeds.sort_unstable();
        seeds.dedup();
        if seeds.is_empty() {
            return Err(HyperError::InvalidOption("no start nodes given".to_string()));
        }

        let mut span = Span {
            opts: &self.opts,
            hg: &hg,
            cents: &cents,
            ndims: problem.terms().iter().map(|t| t.len() as f64).collect(),
            region: seeds.iter().copied().collect(),
            candidates: Vec::new(),
            merges: Dict::default(),
            distances: hg.simple_distance(&seeds, self.opts.distance_p),
            connectivity: Dict::default(),
            rng: match self.opts.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            },
        };

        // the seed's own merges, in construction order
        let mut seed_seq: Vec<(Node, Node)> = Vec::new();
        let mut main_root = seeds.first().copied().unwrap_or(0);
        if seeds.len() == 2 {
            seed_seq.push((seeds[0], seeds[1]));
            main_root = seeds[1];
        } else if seeds.len() > 2 {
            // span will have multiple starting points, contract these first
            let mut o_nodes = seeds.clone();
            let o_inputs: Vec<Vec<u32>> = seeds.iter().map(|&i| problem.terms()[i].clone()).collect();
            let o_output: Vec<u32> = problem
                .out_ids()
                .iter()
                .copied()
                .filter(|ix| o_inputs.iter().any(|t| t.contains(ix)))
                .collect();
            let o_ssa_path = greedy_ssa_path(
                &o_inputs,
                &o_output,
                &problem.id_size_dict(),
                &GreedyOptions {
                    simplify: false,
                    ..Default::default()
                },
            );
            for con in o_ssa_path {
                if let [pi, pj] = con[..] {
                    span.merges.insert(o_nodes[pi], o_nodes[pj]);
                    seed_seq.push((o_nodes[pi], o_nodes[pj]));
                    o_nodes.push(o_nodes[pj]);
                    main_root = o_nodes[pj];
                }
            }
        }

        let mut seq: Vec<(Node, Node)> = Vec::with_capacity(n);
        for &i in seeds.iter() {
            span.absorb_neighbors(i);
        }
        span.grow(&mut seq);

        // disconnected components: grow each from its own seed, then join
        let mut joins: Vec<(Node, Node)> = Vec::new();
        while span.region.len() < n {
            let rest: Vec<Node> = hg.nodes().into_iter().filter(|i| !span.region.contains(i)).collect();
            let root = match self.opts.start {
                SpanStart::Min => rest.into_iter().min_by(by_centrality),
                _ => rest.into_iter().max_by(by_centrality),
            };
            let Some(root) = root else {
                break;
            };
            span.distances.extend(hg.simple_distance(&[root], self.opts.distance_p));
            span.region.insert(root);
            span.absorb_neighbors(root);
            span.grow(&mut seq);
            joins.push((root, main_root));
        }

        // absorption order -> construction order, components joined last
        let mut ordered: Vec<(Node, Node)> = seq.into_iter().rev().collect();
        ordered.extend(seed_seq);
        ordered.extend(joins);

        let mut ssa = n;
        let mut node2ssa: Dict<Node, usize> = (0..n).map(|i| (i, i)).collect();
        let mut ssa_path: SsaPath = Vec::with_capacity(ordered.len());
        for (i, j) in ordered {
            ssa_path.push(vec![node2ssa[&i], node2ssa[&j]]);
            node2ssa.insert(j, ssa);
            ssa += 1;
        }
        Ok(ssa_path)
    }
}

impl PathOptimizer for GreedySpan {
    fn optimize(&mut self, problem: &ContractionProblem) -> Result<LinearPath> {
        let ssa_path = self.ssa_path(problem)?;
        ssa_to_linear(&ssa_path, problem.num_inputs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::ContractionTree;
    use std::sync::Arc;

    fn lattice() -> ContractionProblem {
        // 3x3 grid, no output
        ContractionProblem::from_equation(
            "ab,acd,ce,bfg,dfhi,ehj,gk,ikl,jl->",
            "abcdefghijkl".chars().map(|c| (c, 2)),
        )
        .unwrap()
    }

    /// Offer node 3 of `ab,ac,ad,bcd->` to surfaces 0, 1 and 2 in turn and
    /// return where it ends up merging.
    fn merge_target(steal: DistanceSteal, distances: [f64; 4]) -> Node {
        let p = ContractionProblem::from_equation("ab,ac,ad,bcd->", "abcd".chars().map(|c| (c, 2))).unwrap();
        let hg = HyperGraph::from_problem(&p);
        let opts = GreedySpanOptions {
            distance_steal: steal,
            ..Default::default()
        };
        let cents = Dict::default();
        let mut span = Span {
            opts: &opts,
            hg: &hg,
            cents: &cents,
            ndims: vec![2.0, 2.0, 2.0, 3.0],
            region: [0, 1, 2].into_iter().collect(),
            candidates: Vec::new(),
            merges: Dict::default(),
            distances: distances.iter().enumerate().map(|(i, &d)| (i, d)).collect(),
            connectivity: Dict::default(),
            rng: StdRng::seed_from_u64(0),
        };
        for surface in 0..3 {
            span.check_candidate(surface, 3);
        }
        assert_eq!(span.candidates, vec![3]);
        assert_eq!(span.connectivity[&3], 3.0);
        span.merges[&3]
    }

    #[test]
    fn steal_rules() {
        // never re-points
        assert_eq!(merge_target(DistanceSteal::None, [2.0, 1.0, 0.0, 5.0]), 0);
        // strictly closer to the seed steals, a tie keeps the current target
        assert_eq!(merge_target(DistanceSteal::Abs, [2.0, 1.0, 1.0, 5.0]), 1);
        assert_eq!(merge_target(DistanceSteal::Abs, [1.0, 1.0, 3.0, 5.0]), 0);
        assert_eq!(merge_target(DistanceSteal::Abs, [3.0, 2.0, 1.0, 5.0]), 2);
        // a larger gap to the candidate steals, equal or smaller gaps keep
        assert_eq!(merge_target(DistanceSteal::Rel, [4.0, 3.0, 4.5, 5.0]), 1);
        assert_eq!(merge_target(DistanceSteal::Rel, [4.0, 6.0, 4.0, 5.0]), 0);
        assert_eq!(merge_target(DistanceSteal::Rel, [4.0, 3.0, 1.0, 5.0]), 2);
    }

    #[test]
    fn span_covers_everything() {
        let p = lattice();
        let path = GreedySpan::default().ssa_path(&p).unwrap();
        assert_eq!(path.len(), 8);
        let tree = ContractionTree::from_ssa_path(Arc::new(p), &path).unwrap();
        assert_eq!(tree.intermediates().len(), 8);
    }

    #[test]
    fn output_nodes_seed_the_region() {
        let p = ContractionProblem::from_equation("ab,bc,cd,de->ae", "abcde".chars().map(|c| (c, 3))).unwrap();
        let path = GreedySpan::default().ssa_path(&p).unwrap();
        assert_eq!(path.len(), 4);
        // the two output nodes are merged last, after absorbing the middle
        assert!(path.last().unwrap().iter().all(|&x| x >= 4));
        assert!(ssa_to_linear(&path, 4).is_ok());
    }

    #[test]
    fn many_output_nodes_use_greedy_seed_order() {
        let p = ContractionProblem::from_equation("ab,bc,cd,de,ef->abcdef", "abcdef".chars().map(|c| (c, 2))).unwrap();
        let path = GreedySpan::default().ssa_path(&p).unwrap();
        assert_eq!(path.len(), 4);
        assert!(ssa_to_linear(&path, 5).is_ok());
    }

    #[test]
    fn steal_modes_and_options() {
        let p = lattice();
        for steal in ["", "abs", "rel"] {
            for perm in ["", "CDNLTI", "CILNDT"] {
                let opts = GreedySpanOptions {
                    distance_steal: steal.parse().unwrap(),
                    score_perm: perm.to_string(),
                    start: SpanStart::Min,
                    connectivity_weight_bonds: false,
                    ..Default::default()
                };
                let path = GreedySpan::new(opts).ssa_path(&p).unwrap();
                assert_eq!(path.len(), 8);
                assert!(ssa_to_linear(&path, 9).is_ok());
            }
        }
        assert!("far".parse::<DistanceSteal>().is_err());
    }

    #[test]
    fn disconnected_components_are_joined() {
        let p = ContractionProblem::from_equation("ab,bc,de,ef->", "abcdef".chars().map(|c| (c, 2))).unwrap();
        let path = GreedySpan::default().ssa_path(&p).unwrap();
        assert_eq!(path.len(), 3);
        assert!(ssa_to_linear(&path, 4).is_ok());
    }

    #[test]
    fn explicit_start_nodes() {
        let p = lattice();
        let opts = GreedySpanOptions {
            start: SpanStart::Nodes(vec![0, 8]),
            ..Default::default()
        };
        let path = GreedySpan::new(opts).ssa_path(&p).unwrap();
        assert_eq!(path.len(), 8);
        let bad = GreedySpanOptions {
            start: SpanStart::Nodes(vec![42]),
            ..Default::default()
        };
        assert!(GreedySpan::new(bad).ssa_path(&p).is_err());
        let empty = GreedySpanOptions {
            start: SpanStart::Nodes(vec![]),
            ..Default::default()
        };
        assert!(GreedySpan::new(empty).ssa_path(&p).is_err());
    }
}
