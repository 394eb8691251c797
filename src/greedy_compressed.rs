//! Greedy contraction with a global priority queue over pairwise merges,
//! aware of the bond compression applied after every contraction.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::str::FromStr;

use itertools::Itertools;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{HyperError, Result};
use crate::hyper::PathOptimizer;
use crate::hypergraph::{HyperGraph, Node};
use crate::paths::{ssa_to_linear, LinearPath, SsaPath};
use crate::problem::ContractionProblem;
use crate::space::{ParamAccess, Params};
use crate::Dict;

/// How two per-node quantities are combined into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Combine {
    Sum,
    Mean,
    Max,
    Min,
    /// Absolute difference.
    Diff,
}

impl Combine {
    pub fn apply(self, x: f64, y: f64) -> f64 {
        match self {
            Combine::Sum => x + y,
            Combine::Mean => (x + y) / 2.0,
            Combine::Max => x.max(y),
            Combine::Min => x.min(y),
            Combine::Diff => (x - y).abs(),
        }
    }
}

impl FromStr for Combine {
    type Err = HyperError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sum" => Ok(Combine::Sum),
            "mean" => Ok(Combine::Mean),
            "max" => Ok(Combine::Max),
            "min" => Ok(Combine::Min),
            "diff" => Ok(Combine::Diff),
            _ => Err(HyperError::InvalidOption(format!("unknown combine '{}'", s))),
        }
    }
}

impl fmt::Display for Combine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Combine::Sum => "sum",
            Combine::Mean => "mean",
            Combine::Max => "max",
            Combine::Min => "min",
            Combine::Diff => "diff",
        };
        f.write_str(s)
    }
}

/// A candidate merge of nodes `i` and `j`. Ordered so that a
/// [`BinaryHeap`] pops the lowest score first, comparing score components
/// lexicographically, then `i`, then `j`.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub score: Vec<f64>,
    pub i: Node,
    pub j: Node,
}

impl ScoredCandidate {
    pub fn new(score: Vec<f64>, i: Node, j: Node) -> Self {
        ScoredCandidate { score, i, j }
    }

    /// Natural ascending order of `(score, i, j)`.
    fn key_cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.score.iter().zip(other.score.iter()) {
            match a.total_cmp(b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        self.score
            .len()
            .cmp(&other.score.len())
            .then(self.i.cmp(&other.i))
            .then(self.j.cmp(&other.j))
    }
}

impl PartialEq for ScoredCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.key_cmp(other) == Ordering::Equal
    }
}

impl Eq for ScoredCandidate {}

impl PartialOrd for ScoredCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoredCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed, BinaryHeap is a max-heap
        other.key_cmp(self)
    }
}

const SCORE_TERMS: &str = "ROISLT";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GreedyCompressedOptions {
    /// Bond size cap, `(max dimension)^2` when unset.
    pub chi: Option<u64>,
    /// Weight of the candidate's size after compression (`R`).
    pub coeff_size_compressed: f64,
    /// Weight of the candidate's size before compression (`O`).
    pub coeff_size: f64,
    /// Weight of the combined input sizes (`I`).
    pub coeff_size_inputs: f64,
    pub score_size_inputs: Combine,
    /// Weight of the combined subgraph sizes (`S`).
    pub coeff_subgraph: f64,
    pub score_subgraph: Combine,
    /// Weight of the combined centralities (`L`).
    pub coeff_centrality: f64,
    /// How a merged node inherits centrality.
    pub centrality_combine: Combine,
    pub score_centrality: Combine,
    /// Gumbel noise level (`T`), negative values act as zero.
    pub temperature: f64,
    /// Letters of `ROISLT` compared lexicographically, empty to sum all terms.
    pub score_perm: String,
    pub seed: Option<u64>,
}

impl Default for GreedyCompressedOptions {
    fn default() -> Self {
        GreedyCompressedOptions {
            chi: None,
            coeff_size_compressed: 1.0,
            coeff_size: 0.0,
            coeff_size_inputs: 0.0,
            score_size_inputs: Combine::Max,
            coeff_subgraph: 0.0,
            score_subgraph: Combine::Sum,
            coeff_centrality: 0.0,
            centrality_combine: Combine::Max,
            score_centrality: Combine::Diff,
            temperature: 0.0,
            score_perm: String::new(),
            seed: None,
        }
    }
}

impl GreedyCompressedOptions {
    /// Read options from sampled hyper-parameters, missing ones default.
    pub fn from_params(params: &Params, seed: u64) -> Result<Self> {
        let d = GreedyCompressedOptions::default();
        let chi = match params.get("chi") {
            Some(_) => Some(params.int_or("chi", 0)?.max(1) as u64),
            None => None,
        };
        Ok(GreedyCompressedOptions {
            chi,
            coeff_size_compressed: params.float_or("coeff_size_compressed", d.coeff_size_compressed)?,
            coeff_size: params.float_or("coeff_size", d.coeff_size)?,
            coeff_size_inputs: params.float_or("coeff_size_inputs", d.coeff_size_inputs)?,
            score_size_inputs: params.str_or("score_size_inputs", "max")?.parse()?,
            coeff_subgraph: params.float_or("coeff_subgraph", d.coeff_subgraph)?,
            score_subgraph: params.str_or("score_subgraph", "sum")?.parse()?,
            coeff_centrality: params.float_or("coeff_centrality", d.coeff_centrality)?,
            centrality_combine: params.str_or("centrality_combine", "max")?.parse()?,
            score_centrality: params.str_or("score_centrality", "diff")?.parse()?,
            temperature: params.float_or("temperature", d.temperature)?,
            score_perm: params.str_or("score_perm", "")?.to_string(),
            seed: Some(seed),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct GreedyCompressed {
    pub opts: GreedyCompressedOptions,
}

/// per-search mutable state
struct Search<'a> {
    opts: &'a GreedyCompressedOptions,
    chi: u128,
    hg: HyperGraph,
    sgcents: Dict<Node, f64>,
    sgsizes: Dict<Node, f64>,
    rng: StdRng,
}

impl Search<'_> {
    fn score(&mut self, i1: Node, i2: Node) -> Vec<f64> {
        let o = self.opts;
        // the two inputs tensors (with prior compressions)
        let size1 = self.hg.node_size(i1) as f64;
        let size2 = self.hg.node_size(i2) as f64;

        // the new tensor inds, plus indices that will be available to compress
        let old_size = self.hg.candidate_contraction_size(i1, i2, None) as f64;
        let new_size = self.hg.candidate_contraction_size(i1, i2, Some(self.chi)) as f64;

        let term = |c: char, search: &mut Self| -> f64 {
            match c {
                'R' => o.coeff_size_compressed * new_size.log2(),
                'O' => o.coeff_size * old_size.log2(),
                'I' => o.coeff_size_inputs * o.score_size_inputs.apply(size1.log2(), size2.log2()),
                'S' => {
                    o.coeff_subgraph * o.score_subgraph.apply(search.sgsizes[&i1].ln(), search.sgsizes[&i2].ln())
                }
                'L' => o.coeff_centrality * o.score_centrality.apply(search.sgcents[&i1], search.sgcents[&i2]),
                // randomize using boltzmann sampling trick
                _ => {
                    if o.temperature > 0.0 {
                        o.temperature * -(-search.rng.gen::<f64>().ln()).ln()
                    } else {
                        0.0
                    }
                }
            }
        };

        if o.score_perm.is_empty() {
            vec![SCORE_TERMS.chars().map(|c| term(c, self)).sum()]
        } else {
            o.score_perm.chars().map(|c| term(c, self)).collect()
        }
    }

    fn push_edge_pairs(&mut self, queue: &mut BinaryHeap<ScoredCandidate>, e: u32) {
        let e_nodes: Vec<Node> = self.hg.get_edge(e).to_vec();
        for (i, j) in e_nodes.into_iter().tuple_combinations() {
            let score = self.score(i, j);
            queue.push(ScoredCandidate::new(score, i, j));
        }
    }
}

impl GreedyCompressed {
    pub fn new(opts: GreedyCompressedOptions) -> Self {
        GreedyCompressed { opts }
    }

    pub fn ssa_path(&self, problem: &ContractionProblem) -> Result<SsaPath> {
        if let Some(bad) = self.opts.score_perm.chars().find(|c| !SCORE_TERMS.contains(*c)) {
            return Err(HyperError::InvalidParam {
                name: "score_perm".to_string(),
                reason: format!("unknown score term '{}'", bad),
            });
        }
        let chi = match self.opts.chi {
            Some(chi) => chi as u128,
            None => (problem.max_dim() as u128).pow(2),
        };
        let hg = HyperGraph::from_problem(problem);
        let n = problem.num_inputs();

        let mut search = Search {
            opts: &self.opts,
            chi,
            // compute hypergraph centralities to use heuristically
            sgcents: hg.simple_centrality(2.0, 0.75, 0.5),
            sgsizes: (0..n).map(|i| (i, 1.0)).collect(),
            hg,
            rng: match self.opts.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            },
        };

        let mut queue: BinaryHeap<ScoredCandidate> = BinaryHeap::new();
        let mut ssa_path: SsaPath = Vec::with_capacity(n);

        // populate initial scores with contractions among leaves
        for e in 0..problem.num_indices() as u32 {
            search.push_edge_pairs(&mut queue, e);
        }

        while search.hg.num_nodes() > 2 {
            let (i1, i2) = match queue.pop() {
                Some(c) => (c.i, c.j),
                None => {
                    // disconnected subgraphs -> pick any two
                    let nodes = search.hg.nodes();
                    (nodes[0], nodes[1])
                }
            };
            if !(search.hg.has_node(i1) && search.hg.has_node(i2)) {
                // stale - either node already contracted
                continue;
            }

            let i12 = search.hg.contract(i1, i2);
            let new_edges = search.hg.get_node(i12).to_vec();
            search.hg.compress(chi, Some(new_edges));
            ssa_path.push(vec![i1, i2]);

            // propagate some meta information up the contraction tree
            let s1 = search.sgsizes.remove(&i1).unwrap_or(1.0);
            let s2 = search.sgsizes.remove(&i2).unwrap_or(1.0);
            search.sgsizes.insert(i12, s1 + s2);
            let c1 = search.sgcents.remove(&i1).unwrap_or(0.0);
            let c2 = search.sgcents.remove(&i2).unwrap_or(0.0);
            search.sgcents.insert(i12, self.opts.centrality_combine.apply(c1, c2));

            // assess / re-assess new and also neighboring contractions
            for e in search.hg.neighbor_edges(i12) {
                search.push_edge_pairs(&mut queue, e);
            }
        }

        let remaining = search.hg.nodes();
        if remaining.len() >= 2 {
            ssa_path.push(remaining);
        }
        Ok(ssa_path)
    }
}

impl PathOptimizer for GreedyCompressed {
    fn optimize(&mut self, problem: &ContractionProblem) -> Result<LinearPath> {
        let ssa_path = self.ssa_path(problem)?;
        ssa_to_linear(&ssa_path, problem.num_inputs())
    }
}
