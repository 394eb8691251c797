//! Bottom-up contraction kernels working directly on `(index, count)` legs:
//! a single-shot greedy optimizer and an exact size-sieved dynamic program.
//! Both are used on whole problems (the `greedy` method) and on small
//! sub-problems (spanning seeds, subtree reconfiguration).

use bit_set::BitSet;
use num_traits::{AsPrimitive, Bounded, PrimInt};
use ordered_float::OrderedFloat;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Exp1;
use std::collections::{BTreeSet, BinaryHeap};
use std::hash::Hash;

use crate::paths::SsaPath;
use crate::scoring::LocalCost;
use crate::Dict;

// n.b. this constrains the maximum number index appearances < 65536
pub(crate) type Count = u16;
type Score = f32;
type GreedyScore = OrderedFloat<Score>;
// types for optimal optimization
type Subgraph = BitSet;
type BitPath = Vec<(Subgraph, Subgraph)>;
type SubContraction<Ix> = (Vec<(Ix, Count)>, Score, BitPath);
type ConCostFn<Ix> = fn(Vec<(Ix, Count)>, &[Count], &[Score], Score, Score, Score) -> (Vec<(Ix, Count)>, Score);

// these allow us write generic implementations for u8, u16, u32
pub(crate) trait IndexType: PrimInt + Bounded + Hash + AsPrimitive<usize> + 'static {}
pub(crate) trait NodeType: PrimInt + Bounded + Hash + AsPrimitive<usize> + 'static {}

impl<T> IndexType for T where T: PrimInt + Bounded + Hash + AsPrimitive<usize> + 'static {}
impl<T> NodeType for T where T: PrimInt + Bounded + Hash + AsPrimitive<usize> + 'static {}

/// given log(x) and log(y) compute log(x + y), without exponentiating both
fn ln_add(lx: Score, ly: Score) -> Score {
    let max_val = lx.max(ly);
    max_val + f32::ln_1p(f32::exp(-f32::abs(lx - ly)))
}

/// given log(x) and log(y) compute log(x - y), without exponentiating both,
/// if (x - y) is negative, return -log(x - y).
fn ln_sub(lx: Score, ly: Score) -> Score {
    if lx < ly {
        -ly - f32::ln_1p(-f32::exp(lx - ly))
    } else {
        lx + f32::ln_1p(-f32::exp(ly - lx))
    }
}

/// Merge two sorted leg lists, summing counts of shared indices and dropping
/// any index whose count reaches its total number of appearances.
pub(crate) fn compute_legs<Ix: IndexType>(
    ilegs: &[(Ix, Count)],
    jlegs: &[(Ix, Count)],
    appearances: &[Count],
) -> Vec<(Ix, Count)> {
    let mut ip = 0;
    let mut jp = 0;
    let ni = ilegs.len();
    let nj = jlegs.len();
    let mut new_legs: Vec<(Ix, Count)> = Vec::with_capacity(ilegs.len() + jlegs.len());

    loop {
        if ip == ni {
            new_legs.extend(jlegs[jp..].iter());
            break;
        }
        if jp == nj {
            new_legs.extend(ilegs[ip..].iter());
            break;
        }

        let (ix, ic) = ilegs[ip];
        let (jx, jc) = jlegs[jp];

        if ix < jx {
            // index only appears in ilegs
            new_legs.push((ix, ic));
            ip += 1;
        } else if ix > jx {
            // index only appears in jlegs
            new_legs.push((jx, jc));
            jp += 1;
        } else {
            // index appears in both
            let new_count = ic + jc;
            if new_count != appearances[ix.as_()] {
                // not last appearance -> kept index contributes to new size
                new_legs.push((ix, new_count));
            }
            ip += 1;
            jp += 1;
        }
    }
    new_legs
}

fn compute_size<Ix: IndexType>(legs: &[(Ix, Count)], sizes: &[Score]) -> Score {
    legs.iter().map(|&(ix, _)| sizes[ix.as_()]).sum()
}

fn is_simplifiable<Ix: IndexType>(legs: &[(Ix, Count)], appearances: &[Count]) -> bool {
    let mut prev_ix = Ix::max_value();
    for &(ix, ix_count) in legs {
        if (ix == prev_ix) || (ix_count == appearances[ix.as_()]) {
            return true;
        }
        prev_ix = ix;
    }
    false
}

fn compute_simplified<Ix: IndexType>(legs: &[(Ix, Count)], appearances: &[Count]) -> Vec<(Ix, Count)> {
    if legs.is_empty() {
        return legs.to_vec();
    }
    let mut new_legs: Vec<(Ix, Count)> = Vec::with_capacity(legs.len());

    let (mut cur_ix, mut cur_cnt) = legs[0];
    for &(ix, ix_cnt) in legs.iter().skip(1) {
        if ix == cur_ix {
            cur_cnt += ix_cnt;
        } else {
            if cur_cnt != appearances[cur_ix.as_()] {
                new_legs.push((cur_ix, cur_cnt));
            }
            cur_ix = ix;
            cur_cnt = ix_cnt;
        }
    }
    if cur_cnt != appearances[cur_ix.as_()] {
        new_legs.push((cur_ix, cur_cnt));
    }
    new_legs
}

/// Options for the single-shot greedy kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct GreedyOptions {
    /// Weighting of the input sizes against the output size, `1.0` means
    /// the plain memory removed heuristic.
    pub costmod: f32,
    /// Gumbel noise level, `0.0` is fully deterministic.
    pub temperature: f32,
    /// Scale the noise of each candidate by the magnitude of its cost.
    pub rel_temperature: bool,
    /// Score candidates by sizes, otherwise by numbers of legs.
    pub usesizes: bool,
    /// Each size is multiplied by `1 + random_strength * Exp(1)` before
    /// the search, `0.0` leaves sizes untouched.
    pub random_strength: f32,
    /// Skip indices shared by more than this many terms, `0` for no limit.
    pub max_neighbors: usize,
    pub seed: Option<u64>,
    /// Run the single-term, scalar and hadamard simplifications first.
    pub simplify: bool,
}

impl Default for GreedyOptions {
    fn default() -> Self {
        GreedyOptions {
            costmod: 1.0,
            temperature: 0.0,
            rel_temperature: true,
            usesizes: true,
            random_strength: 0.0,
            max_neighbors: 16,
            seed: None,
            simplify: true,
        }
    }
}

/// helper struct to build contractions from bottom up
#[derive(Clone)]
struct ContractionProcessor<Ix: IndexType, Node: NodeType> {
    nodes: Dict<Node, Vec<(Ix, Count)>>,
    edges: Dict<Ix, Vec<Node>>,
    appearances: Vec<Count>,
    sizes: Vec<Score>,
    ssa: Node,
    ssa_path: SsaPath,
}

fn node_id<Node: NodeType>(i: usize) -> Node {
    // widths are chosen by the dispatchers so that every id fits
    Node::from(i).unwrap_or_else(Node::max_value)
}

impl<Ix: IndexType, Node: NodeType> ContractionProcessor<Ix, Node> {
    fn new(inputs: &[Vec<u32>], output: &[u32], size_dict: &Dict<u32, f32>) -> ContractionProcessor<Ix, Node> {
        let mut nodes: Dict<Node, Vec<(Ix, Count)>> = Dict::default();
        let mut edges: Dict<Ix, Vec<Node>> = Dict::default();
        let mut indmap: Dict<u32, Ix> = Dict::default();
        let mut sizes: Vec<Score> = Vec::with_capacity(size_dict.len());
        let mut appearances: Vec<Count> = Vec::with_capacity(size_dict.len());
        // enumerate index labels as unsigned integers from 0
        let mut c: Ix = Ix::zero();

        for (i, term) in inputs.iter().enumerate() {
            let node: Node = node_id(i);
            let mut legs = Vec::with_capacity(term.len());
            for &ind in term {
                match indmap.get(&ind) {
                    None => {
                        // index not parsed yet
                        indmap.insert(ind, c);
                        edges.insert(c, vec![node]);
                        appearances.push(1);
                        sizes.push(f32::ln(size_dict.get(&ind).copied().unwrap_or(1.0)));
                        legs.push((c, 1));
                        c = c + Ix::one();
                    }
                    Some(&ix) => {
                        // index already present
                        appearances[ix.as_()] += 1;
                        if let Some(en) = edges.get_mut(&ix) {
                            if !en.contains(&node) {
                                en.push(node);
                            }
                        }
                        legs.push((ix, 1));
                    }
                };
            }
            legs.sort();
            nodes.insert(node, legs);
        }
        for ind in output {
            if let Some(ix) = indmap.get(ind) {
                appearances[ix.as_()] += 1;
            }
        }

        let ssa: Node = node_id(nodes.len());
        let ssa_path: SsaPath = Vec::with_capacity(2 * nodes.len());

        ContractionProcessor {
            nodes,
            edges,
            appearances,
            sizes,
            ssa,
            ssa_path,
        }
    }

    fn neighbors(&self, i: Node) -> Vec<Node> {
        let mut js: Vec<Node> = Vec::new();
        for (ix, _) in self.nodes[&i].iter() {
            if let Some(enodes) = self.edges.get(ix) {
                for &j in enodes.iter() {
                    if j != i && !js.contains(&j) {
                        js.push(j);
                    }
                }
            }
        }
        js
    }

    /// like neighbors but skip edges with too many neighbors, for greedy
    fn neighbors_limit(&self, i: Node, max_neighbors: usize) -> Vec<Node> {
        let mut js: Vec<Node> = Vec::new();
        for (ix, _) in self.nodes[&i].iter() {
            if let Some(enodes) = self.edges.get(ix) {
                if max_neighbors != 0 && enodes.len() > max_neighbors {
                    // basically a batch index with too many combinations -> skip
                    continue;
                }
                for &j in enodes.iter() {
                    if j != i && !js.contains(&j) {
                        js.push(j);
                    }
                }
            }
        }
        js
    }

    /// remove an index from the graph, updating all legs
    fn remove_ix(&mut self, ix: Ix) {
        if let Some(enodes) = self.edges.remove(&ix) {
            for j in enodes {
                if let Some(legs) = self.nodes.get_mut(&j) {
                    legs.retain(|(k, _)| *k != ix);
                }
            }
        }
    }

    /// remove a node from the graph, update the edgemap, return the legs
    fn pop_node(&mut self, i: Node) -> Vec<(Ix, Count)> {
        let legs = self.nodes.remove(&i).unwrap_or_default();
        for (ix, _) in legs.iter() {
            let remove_entire = match self.edges.get_mut(ix) {
                Some(enodes) => {
                    if let Some(pos) = enodes.iter().position(|&n| n == i) {
                        enodes.swap_remove(pos);
                    }
                    enodes.is_empty()
                }
                None => false,
            };
            if remove_entire {
                self.edges.remove(ix);
            }
        }
        legs
    }

    /// add a new node to the graph, update the edgemap, return the new id
    fn add_node(&mut self, legs: Vec<(Ix, Count)>) -> Node {
        let i = self.ssa;
        self.ssa = self.ssa + Node::one();
        for (ix, _) in &legs {
            self.edges
                .entry(*ix)
                .and_modify(|nodes| {
                    if !nodes.contains(&i) {
                        nodes.push(i);
                    }
                })
                .or_insert_with(|| vec![i]);
        }
        self.nodes.insert(i, legs);
        i
    }

    /// contract two nodes, return the new node id
    fn contract_nodes(&mut self, i: Node, j: Node) -> Node {
        let ilegs = self.pop_node(i);
        let jlegs = self.pop_node(j);
        let new_legs = compute_legs(&ilegs, &jlegs, &self.appearances);
        let k = self.add_node(new_legs);
        self.ssa_path.push(vec![i.as_(), j.as_()]);
        k
    }

    /// contract two nodes (which we already know the legs for), return the new node id
    fn contract_nodes_given_legs(&mut self, i: Node, j: Node, new_legs: Vec<(Ix, Count)>) -> Node {
        self.pop_node(i);
        self.pop_node(j);
        let k = self.add_node(new_legs);
        self.ssa_path.push(vec![i.as_(), j.as_()]);
        k
    }

    /// find any indices that appear in all terms and just remove/ignore them
    fn simplify_batch(&mut self) {
        let nterms = self.nodes.len();
        let ix_to_remove: Vec<Ix> = self
            .edges
            .iter()
            .filter(|(_, ix_nodes)| nterms > 1 && ix_nodes.len() >= nterms)
            .map(|(ix, _)| *ix)
            .collect();
        for ix in ix_to_remove {
            self.remove_ix(ix);
        }
    }

    /// perform any simplifications involving single terms
    fn simplify_single_terms(&mut self) {
        let mut candidates: Vec<(Node, Vec<(Ix, Count)>)> = self.nodes.clone().into_iter().collect();
        candidates.sort_by_key(|(i, _)| *i);
        for (i, legs) in candidates {
            if is_simplifiable(&legs, &self.appearances) {
                self.pop_node(i);
                let legs_reduced = compute_simplified(&legs, &self.appearances);
                self.add_node(legs_reduced);
                self.ssa_path.push(vec![i.as_()]);
            }
        }
    }

    /// combine and remove all scalars
    fn simplify_scalars(&mut self) {
        let mut scalars = Vec::new();
        let mut j: Option<Node> = None;
        let mut jndim: usize = 0;
        let mut keys: Vec<Node> = self.nodes.keys().copied().collect();
        keys.sort();
        for i in keys {
            let ndim = self.nodes[&i].len();
            if ndim == 0 {
                scalars.push(i);
            } else if j.is_none() || ndim < jndim {
                // also search for smallest other term to multiply into
                j = Some(i);
                jndim = ndim;
            }
        }
        if !scalars.is_empty() {
            // chain all scalars into a single scalar node
            let mut acc = scalars[0];
            for &s in scalars.iter().skip(1) {
                acc = self.contract_nodes(acc, s);
            }
            // multiply resultant scalar into smallest non-scalar so it doesn't linger
            if let Some(target) = j {
                self.contract_nodes(acc, target);
            }
        }
    }

    /// combine all terms that have the same legs
    fn simplify_hadamard(&mut self) {
        // group by full legs (including counts) so only *identical* tensors combine
        let mut groups: Dict<Vec<(Ix, Count)>, Vec<Node>> = Dict::default();
        let mut keys_multi: Vec<Vec<(Ix, Count)>> = Vec::new();
        let mut keys: Vec<Node> = self.nodes.keys().copied().collect();
        keys.sort();
        for i in keys {
            let key = self.nodes[&i].clone();
            match groups.get_mut(&key) {
                Some(v) => {
                    if v.len() == 1 {
                        keys_multi.push(key.clone());
                    }
                    v.push(i);
                }
                None => {
                    groups.insert(key, vec![i]);
                }
            }
        }
        for key in keys_multi.into_iter() {
            if let Some(mut group) = groups.remove(&key) {
                while let (Some(i), Some(j)) = (group.pop(), group.pop()) {
                    let k = self.contract_nodes(i, j);
                    group.push(k);
                }
            }
        }
    }

    /// iteratively perform all simplifications until nothing left to do
    fn simplify(&mut self) {
        self.simplify_batch();
        let mut should_run = true;
        while should_run {
            self.simplify_single_terms();
            self.simplify_scalars();
            let ssa_before = self.ssa;
            self.simplify_hadamard();
            should_run = ssa_before != self.ssa;
        }
    }

    /// find disconnected subgraphs
    fn subgraphs(&self) -> Vec<Vec<Node>> {
        let mut remaining: BTreeSet<Node> = self.nodes.keys().copied().collect();
        let mut groups: Vec<Vec<Node>> = Vec::new();
        while let Some(i) = remaining.pop_first() {
            let mut queue: Vec<Node> = vec![i];
            let mut group: BTreeSet<Node> = [i].into_iter().collect();
            while let Some(i) = queue.pop() {
                for j in self.neighbors(i) {
                    if group.insert(j) {
                        queue.push(j);
                    }
                }
            }
            group.iter().for_each(|i| {
                remaining.remove(i);
            });
            groups.push(group.into_iter().collect());
        }
        groups
    }

    /// greedily optimize the contraction order of all terms
    fn optimize_greedy(&mut self, opts: &GreedyOptions) {
        let coeff_t = opts.temperature;
        let log_coeff_a = f32::ln(opts.costmod);
        let max_neighbors = opts.max_neighbors;

        let mut rng = if coeff_t != 0.0 {
            Some(match opts.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            })
        } else {
            // zero temp - no need for rng
            None
        };

        let (usesizes, rel_temperature, costmod) = (opts.usesizes, opts.rel_temperature, opts.costmod);
        let mut local_score = |sa: Score, sb: Score, sab: Score, na: usize, nb: usize, nab: usize| -> Score {
            let cost = if usesizes {
                ln_sub(sab - log_coeff_a, ln_add(sa, sb) + log_coeff_a)
            } else {
                nab as Score - costmod * na.max(nb) as Score
            };
            let gumbel = if let Some(rng) = &mut rng {
                let t = if rel_temperature { coeff_t * cost.abs().max(1.0) } else { coeff_t };
                t * -f32::ln(-f32::ln(rng.gen::<f32>()))
            } else {
                0.0
            };
            cost - gumbel
        };

        // cache all current nodes sizes as we go
        let mut node_sizes: Dict<Node, Score> = Dict::default();
        self.nodes.iter().for_each(|(&i, legs)| {
            node_sizes.insert(i, compute_size(legs, &self.sizes));
        });

        // we will *deincrement* c, since its a max-heap
        let mut c: i64 = 0;
        let mut queue: BinaryHeap<(GreedyScore, i64)> = BinaryHeap::with_capacity(self.edges.len() * 2);

        // the heap keeps a reference to actual contraction info in this
        let mut contractions: Dict<i64, (Node, Node, Score, Vec<(Ix, Count)>)> = Dict::default();

        // get the initial candidate contractions, in a fixed order
        let mut ixs: Vec<Ix> = self.edges.keys().copied().collect();
        ixs.sort();
        for ix in ixs {
            let ix_nodes = &self.edges[&ix];
            if max_neighbors != 0 && ix_nodes.len() > max_neighbors {
                // basically a batch index with too many combinations -> skip
                continue;
            }
            // for all combinations of nodes with a connected edge
            for ip in 0..ix_nodes.len() {
                let i = ix_nodes[ip];
                let isize = node_sizes[&i];
                for &j in ix_nodes.iter().skip(ip + 1) {
                    let jsize = node_sizes[&j];
                    let klegs = compute_legs(&self.nodes[&i], &self.nodes[&j], &self.appearances);
                    let ksize = compute_size(&klegs, &self.sizes);
                    let score = local_score(
                        isize,
                        jsize,
                        ksize,
                        self.nodes[&i].len(),
                        self.nodes[&j].len(),
                        klegs.len(),
                    );
                    queue.push((OrderedFloat(-score), c));
                    contractions.insert(c, (i, j, ksize, klegs));
                    c -= 1;
                }
            }
        }

        // greedily contract remaining
        let mut steps: usize = 0;
        while let Some((_, c0)) = queue.pop() {
            let Some((i, j, ksize, klegs)) = contractions.remove(&c0) else {
                continue;
            };
            if !self.nodes.contains_key(&i) || !self.nodes.contains_key(&j) {
                // one of the nodes has been removed -> skip
                continue;
            }

            let k = self.contract_nodes_given_legs(i, j, klegs.clone());
            node_sizes.insert(k, ksize);

            for l in self.neighbors_limit(k, max_neighbors) {
                // assess all neighboring contractions of new node
                let llegs = &self.nodes[&l];
                let lsize = node_sizes[&l];
                let mlegs = compute_legs(&klegs, llegs, &self.appearances);
                let msize = compute_size(&mlegs, &self.sizes);
                let score = local_score(ksize, lsize, msize, klegs.len(), llegs.len(), mlegs.len());
                queue.push((OrderedFloat(-score), c));
                contractions.insert(c, (k, l, msize, mlegs));
                c -= 1;
            }

            // periodically prune queue and contractions to remove stale entries
            steps += 1;
            if steps % 4096 == 0 {
                let mut valid = Vec::new();
                for (score, cid) in queue.drain() {
                    if let Some((i, j, _, _)) = contractions.get(&cid) {
                        if self.nodes.contains_key(i) && self.nodes.contains_key(j) {
                            valid.push((score, cid));
                        } else {
                            contractions.remove(&cid);
                        }
                    }
                }
                queue = BinaryHeap::from(valid);
            }
        }
    }

    /// Contract the two smallest terms until one remains. Typically only
    /// called once disconnected subgraph terms (outer products) remain.
    fn optimize_remaining_by_size(&mut self) {
        if self.nodes.len() <= 1 {
            return;
        }

        let mut nodes_sizes: BinaryHeap<(GreedyScore, std::cmp::Reverse<Node>)> = BinaryHeap::default();
        self.nodes.iter().for_each(|(node, legs)| {
            nodes_sizes.push((OrderedFloat(-compute_size(legs, &self.sizes)), std::cmp::Reverse(*node)));
        });

        while let (Some((_, i)), Some((_, j))) = (nodes_sizes.pop(), nodes_sizes.pop()) {
            let k = self.contract_nodes(i.0, j.0);
            if self.nodes.len() <= 1 {
                break;
            }
            let ksize = compute_size(&self.nodes[&k], &self.sizes);
            nodes_sizes.push((OrderedFloat(-ksize), std::cmp::Reverse(k)));
        }
    }
}

fn single_el_bitset(x: usize, n: usize) -> BitSet {
    let mut a = BitSet::with_capacity(n);
    a.insert(x);
    a
}

fn compute_con_cost_flops<Ix: IndexType>(
    temp_legs: Vec<(Ix, Count)>,
    appearances: &[Count],
    sizes: &[Score],
    iscore: Score,
    jscore: Score,
    _factor: Score,
) -> (Vec<(Ix, Count)>, Score) {
    // remove indices that have reached final appearance
    // and compute cost and size of local contraction
    let mut new_legs: Vec<(Ix, Count)> = Vec::with_capacity(temp_legs.len());
    let mut cost: Score = 0.0;
    for (ix, ix_count) in temp_legs.into_iter() {
        // all involved indices contribute to the cost
        cost += sizes[ix.as_()];
        if ix_count != appearances[ix.as_()] {
            new_legs.push((ix, ix_count));
        }
    }
    let new_score = ln_add(ln_add(iscore, jscore), cost);
    (new_legs, new_score)
}

fn compute_con_cost_max<Ix: IndexType>(
    temp_legs: Vec<(Ix, Count)>,
    appearances: &[Count],
    sizes: &[Score],
    iscore: Score,
    jscore: Score,
    _factor: Score,
) -> (Vec<(Ix, Count)>, Score) {
    let mut new_legs: Vec<(Ix, Count)> = Vec::with_capacity(temp_legs.len());
    let mut cost: Score = 0.0;
    for (ix, ix_count) in temp_legs.into_iter() {
        cost += sizes[ix.as_()];
        if ix_count != appearances[ix.as_()] {
            new_legs.push((ix, ix_count));
        }
    }
    let new_score = iscore.max(jscore).max(cost);
    (new_legs, new_score)
}

fn compute_con_cost_size<Ix: IndexType>(
    temp_legs: Vec<(Ix, Count)>,
    appearances: &[Count],
    sizes: &[Score],
    iscore: Score,
    jscore: Score,
    _factor: Score,
) -> (Vec<(Ix, Count)>, Score) {
    let mut new_legs: Vec<(Ix, Count)> = Vec::with_capacity(temp_legs.len());
    let mut size: Score = 0.0;
    for (ix, ix_count) in temp_legs.into_iter() {
        if ix_count != appearances[ix.as_()] {
            // not last appearance -> kept index contributes to new size
            new_legs.push((ix, ix_count));
            size += sizes[ix.as_()];
        }
    }
    let new_score = iscore.max(jscore).max(size);
    (new_legs, new_score)
}

fn compute_con_cost_write<Ix: IndexType>(
    temp_legs: Vec<(Ix, Count)>,
    appearances: &[Count],
    sizes: &[Score],
    iscore: Score,
    jscore: Score,
    _factor: Score,
) -> (Vec<(Ix, Count)>, Score) {
    let mut new_legs: Vec<(Ix, Count)> = Vec::with_capacity(temp_legs.len());
    let mut size: Score = 0.0;
    for (ix, ix_count) in temp_legs.into_iter() {
        if ix_count != appearances[ix.as_()] {
            new_legs.push((ix, ix_count));
            size += sizes[ix.as_()];
        }
    }
    let new_score = ln_add(ln_add(iscore, jscore), size);
    (new_legs, new_score)
}

fn compute_con_cost_combo<Ix: IndexType>(
    temp_legs: Vec<(Ix, Count)>,
    appearances: &[Count],
    sizes: &[Score],
    iscore: Score,
    jscore: Score,
    factor: Score,
) -> (Vec<(Ix, Count)>, Score) {
    let mut new_legs: Vec<(Ix, Count)> = Vec::with_capacity(temp_legs.len());
    let mut size: Score = 0.0;
    let mut cost: Score = 0.0;
    for (ix, ix_count) in temp_legs.into_iter() {
        let d = sizes[ix.as_()];
        cost += d;
        if ix_count != appearances[ix.as_()] {
            new_legs.push((ix, ix_count));
            size += d;
        }
    }
    // the score just for this contraction
    let new_local_score = ln_add(cost, factor + size);
    // the total score including history
    let new_score = ln_add(ln_add(iscore, jscore), new_local_score);
    (new_legs, new_score)
}

fn compute_con_cost_limit<Ix: IndexType>(
    temp_legs: Vec<(Ix, Count)>,
    appearances: &[Count],
    sizes: &[Score],
    iscore: Score,
    jscore: Score,
    factor: Score,
) -> (Vec<(Ix, Count)>, Score) {
    let mut new_legs: Vec<(Ix, Count)> = Vec::with_capacity(temp_legs.len());
    let mut size: Score = 0.0;
    let mut cost: Score = 0.0;
    for (ix, ix_count) in temp_legs.into_iter() {
        let d = sizes[ix.as_()];
        cost += d;
        if ix_count != appearances[ix.as_()] {
            new_legs.push((ix, ix_count));
            size += d;
        }
    }
    // whichever is more expensive, the cost or the scaled write
    let new_local_score = cost.max(factor + size);
    let new_score = ln_add(ln_add(iscore, jscore), new_local_score);
    (new_legs, new_score)
}

fn con_cost_fn<Ix: IndexType>(minimize: LocalCost) -> ConCostFn<Ix> {
    match minimize {
        LocalCost::Flops => compute_con_cost_flops::<Ix>,
        LocalCost::Max => compute_con_cost_max::<Ix>,
        LocalCost::Size => compute_con_cost_size::<Ix>,
        LocalCost::Write => compute_con_cost_write::<Ix>,
        LocalCost::Combo(_) => compute_con_cost_combo::<Ix>,
        LocalCost::Limit(_) => compute_con_cost_limit::<Ix>,
    }
}

impl<Ix: IndexType, Node: NodeType> ContractionProcessor<Ix, Node> {
    fn optimize_optimal_connected(&mut self, subgraph: Vec<Node>, minimize: LocalCost, search_outer: bool) {
        let compute_cost = con_cost_fn::<Ix>(minimize);
        let factor = (minimize.factor() as Score).ln();

        // storage for each possible contraction to reach subgraph of size m
        let mut contractions: Vec<Dict<Subgraph, SubContraction<Ix>>> = vec![Dict::default(); subgraph.len() + 1];
        // intermediate storage for the entries we are expanding
        let mut contractions_m_temp: Vec<(Subgraph, SubContraction<Ix>)> = Vec::new();
        // need to keep these separately
        let mut best_scores: Dict<Subgraph, Score> = Dict::default();

        // we use linear index within terms given during optimization, this maps
        // back to the original node index
        let nterms = subgraph.len();
        if nterms < 2 {
            return;
        }
        let mut termmap: Dict<Subgraph, Node> = Dict::default();

        for (i, node) in subgraph.into_iter().enumerate() {
            let isubgraph = single_el_bitset(i, nterms);
            termmap.insert(isubgraph.clone(), node);
            let ilegs = self.nodes[&node].clone();
            contractions[1].insert(isubgraph, (ilegs, 0.0, Vec::new()));
        }

        let cost_cap_incr = f32::ln(2.0);
        let mut cost_cap = cost_cap_incr;
        while contractions[nterms].is_empty() {
            // try building subgraphs of size m
            for m in 2..=nterms {
                // out of bipartitions of size (k, m - k)
                for k in 1..=m / 2 {
                    for (isubgraph, (ilegs, iscore, ipath)) in contractions[k].iter() {
                        for (jsubgraph, (jlegs, jscore, jpath)) in contractions[m - k].iter() {
                            // filter invalid combinations first
                            if !isubgraph.is_disjoint(jsubgraph) || ((k == m - k) && isubgraph.gt(jsubgraph)) {
                                // subgraphs overlap -> not valid, or
                                // equal subgraph size -> only process sorted pairs
                                continue;
                            }

                            let mut temp_legs: Vec<(Ix, Count)> = Vec::with_capacity(ilegs.len() + jlegs.len());
                            let mut ip = 0;
                            let mut jp = 0;
                            // if search_outer -> we will never skip
                            let mut skip_because_outer = !search_outer;
                            while ip < ilegs.len() && jp < jlegs.len() {
                                if ilegs[ip].0 < jlegs[jp].0 {
                                    temp_legs.push(ilegs[ip]);
                                    ip += 1;
                                } else if ilegs[ip].0 > jlegs[jp].0 {
                                    temp_legs.push(jlegs[jp]);
                                    jp += 1;
                                } else {
                                    temp_legs.push((ilegs[ip].0, ilegs[ip].1 + jlegs[jp].1));
                                    ip += 1;
                                    jp += 1;
                                    skip_because_outer = false;
                                }
                            }
                            if skip_because_outer {
                                // no shared indices -> outer product
                                continue;
                            }
                            temp_legs.extend(ilegs[ip..].iter().chain(jlegs[jp..].iter()));

                            let (new_legs, new_score) =
                                compute_cost(temp_legs, &self.appearances, &self.sizes, *iscore, *jscore, factor);

                            if new_score > cost_cap {
                                // contraction not allowed yet due to 'sieve'
                                continue;
                            }

                            let new_subgraph: Subgraph = isubgraph.union(jsubgraph).collect();

                            // because we have to do a delayed update of
                            // contractions[m] for borrowing reasons, we check
                            // against a non-delayed score lookup so we don't
                            // overwrite best scores within the same iteration
                            let found_new_best = match best_scores.get(&new_subgraph) {
                                Some(current_score) => new_score < *current_score,
                                None => true,
                            };
                            if found_new_best {
                                best_scores.insert(new_subgraph.clone(), new_score);
                                let mut new_path: BitPath = Vec::with_capacity(ipath.len() + jpath.len() + 1);
                                new_path.extend_from_slice(ipath);
                                new_path.extend_from_slice(jpath);
                                new_path.push((isubgraph.clone(), jsubgraph.clone()));
                                contractions_m_temp.push((new_subgraph, (new_legs, new_score, new_path)));
                            }
                        }
                    }
                    // later entries for the same subgraph are guaranteed better
                    contractions_m_temp.drain(..).for_each(|(k, v)| {
                        contractions[m].insert(k, v);
                    });
                }
            }
            cost_cap += cost_cap_incr;
        }

        // can only ever be a single entry in contractions[nterms] -> the best
        let best_path = match contractions[nterms].values().next() {
            Some((_, _, best_path)) => best_path.clone(),
            None => return,
        };

        // convert from the bitpath to the actual (subgraph) node ids
        for (isubgraph, jsubgraph) in best_path.into_iter() {
            let i = termmap[&isubgraph];
            let j = termmap[&jsubgraph];
            let k = self.contract_nodes(i, j);
            let ksubgraph: Subgraph = isubgraph.union(&jsubgraph).collect();
            termmap.insert(ksubgraph, k);
        }
    }

    fn optimize_optimal(&mut self, minimize: LocalCost, search_outer: bool) {
        for subgraph in self.subgraphs() {
            self.optimize_optimal_connected(subgraph, minimize, search_outer);
        }
    }
}

// ----------------------- dispatch-able functions ------------------------- //

fn run_greedy<Ix: IndexType, Node: NodeType>(
    inputs: &[Vec<u32>],
    output: &[u32],
    size_dict: &Dict<u32, f32>,
    opts: &GreedyOptions,
) -> SsaPath {
    let mut cp: ContractionProcessor<Ix, Node> = if opts.random_strength > 0.0 {
        ContractionProcessor::new(inputs, output, &jitter_sizes(size_dict, opts.random_strength, opts.seed))
    } else {
        ContractionProcessor::new(inputs, output, size_dict)
    };
    if opts.simplify {
        cp.simplify();
    }
    cp.optimize_greedy(opts);
    cp.optimize_remaining_by_size();
    cp.ssa_path
}

fn run_optimal<Ix: IndexType, Node: NodeType>(
    inputs: &[Vec<u32>],
    output: &[u32],
    size_dict: &Dict<u32, f32>,
    minimize: LocalCost,
    search_outer: bool,
) -> SsaPath {
    let mut cp: ContractionProcessor<Ix, Node> = ContractionProcessor::new(inputs, output, size_dict);
    cp.optimize_optimal(minimize, search_outer);
    cp.optimize_remaining_by_size();
    cp.ssa_path
}

/// Randomly inflate every size by a factor `1 + strength * Exp(1)`.
fn jitter_sizes(size_dict: &Dict<u32, f32>, strength: f32, seed: Option<u64>) -> Dict<u32, f32> {
    let mut rng = match seed {
        // offset so the jitter is independent of the gumbel noise
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1)),
        None => StdRng::from_entropy(),
    };
    let mut keys: Vec<u32> = size_dict.keys().copied().collect();
    keys.sort_unstable();
    keys.into_iter()
        .map(|k| {
            let e: f32 = rng.sample(Exp1);
            (k, size_dict[&k] * (1.0 + strength * e))
        })
        .collect()
}

/// Integer widths needed for (number of distinct indices, number of ssa ids).
fn dispatch_widths(inputs: &[Vec<u32>]) -> (usize, usize) {
    let mut distinct: Vec<u32> = inputs.iter().flatten().copied().collect();
    distinct.sort_unstable();
    distinct.dedup();
    // simplifications can allocate one extra id per term on top of 2n
    (distinct.len(), 3 * inputs.len() + 1)
}

/// Find a single greedy SSA path for the terms `inputs`.
pub(crate) fn greedy_ssa_path(
    inputs: &[Vec<u32>],
    output: &[u32],
    size_dict: &Dict<u32, f32>,
    opts: &GreedyOptions,
) -> SsaPath {
    match dispatch_widths(inputs) {
        (idx, nodes) if idx < u8::MAX as usize && nodes < u8::MAX as usize => {
            run_greedy::<u8, u8>(inputs, output, size_dict, opts)
        }
        (idx, nodes) if idx < u16::MAX as usize && nodes < u16::MAX as usize => {
            run_greedy::<u16, u16>(inputs, output, size_dict, opts)
        }
        _ => run_greedy::<u32, u32>(inputs, output, size_dict, opts),
    }
}

/// Find the optimal SSA path (per `minimize`) for the terms `inputs`, joining
/// any disconnected subgraphs smallest first.
pub(crate) fn optimal_ssa_path(
    inputs: &[Vec<u32>],
    output: &[u32],
    size_dict: &Dict<u32, f32>,
    minimize: LocalCost,
) -> SsaPath {
    match dispatch_widths(inputs) {
        (idx, nodes) if idx < u8::MAX as usize && nodes < u8::MAX as usize => {
            run_optimal::<u8, u8>(inputs, output, size_dict, minimize, false)
        }
        (idx, nodes) if idx < u16::MAX as usize && nodes < u16::MAX as usize => {
            run_optimal::<u16, u16>(inputs, output, size_dict, minimize, false)
        }
        _ => run_optimal::<u32, u32>(inputs, output, size_dict, minimize, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> (Vec<Vec<u32>>, Vec<u32>, Dict<u32, f32>) {
        // ab,bc,cd->ad with a=2, b=3, c=4, d=5
        let inputs = vec![vec![0, 1], vec![1, 2], vec![2, 3]];
        let output = vec![0, 3];
        let sizes = [(0, 2.0), (1, 3.0), (2, 4.0), (3, 5.0)].into_iter().collect();
        (inputs, output, sizes)
    }

    fn pair_steps(path: &SsaPath) -> usize {
        path.iter().filter(|con| con.len() == 2).count()
    }

    #[test]
    fn compute_legs_drops_final_appearances() {
        let appearances: Vec<Count> = vec![2, 3, 1];
        let new = compute_legs::<u8>(&[(0, 1), (1, 1)], &[(0, 1), (1, 1), (2, 1)], &appearances);
        assert_eq!(new, vec![(1, 2), (2, 1)]);
    }

    #[test]
    fn ln_helpers() {
        let (x, y) = (5.0f32, 3.0f32);
        assert!((ln_add(x.ln(), y.ln()).exp() - 8.0).abs() < 1e-4);
        assert!((ln_sub(x.ln(), y.ln()).exp() - 2.0).abs() < 1e-4);
    }

    #[test]
    fn greedy_chain_is_complete() {
        let (inputs, output, sizes) = chain();
        let path = greedy_ssa_path(&inputs, &output, &sizes, &GreedyOptions::default());
        assert_eq!(pair_steps(&path), 2);
    }

    #[test]
    fn greedy_joins_disconnected_terms() {
        let inputs = vec![vec![0], vec![1], vec![2, 3], vec![3]];
        let sizes = [(0, 2.0), (1, 2.0), (2, 2.0), (3, 2.0)].into_iter().collect();
        let opts = GreedyOptions {
            simplify: false,
            ..Default::default()
        };
        let path = greedy_ssa_path(&inputs, &[0, 1, 2], &sizes, &opts);
        assert_eq!(pair_steps(&path), 3);
    }

    #[test]
    fn greedy_seeded_temperature_is_reproducible() {
        let (inputs, output, sizes) = chain();
        let opts = GreedyOptions {
            temperature: 0.5,
            seed: Some(7),
            ..Default::default()
        };
        let a = greedy_ssa_path(&inputs, &output, &sizes, &opts);
        let b = greedy_ssa_path(&inputs, &output, &sizes, &opts);
        assert_eq!(a, b);
    }

    #[test]
    fn jittered_sizes_only_grow() {
        let (_, _, sizes) = chain();
        let a = jitter_sizes(&sizes, 0.5, Some(11));
        assert_eq!(a, jitter_sizes(&sizes, 0.5, Some(11)));
        for (k, v) in sizes.iter() {
            assert!(a[k] >= *v);
        }
        assert!(a.iter().any(|(k, v)| *v > sizes[k]));
    }

    #[test]
    fn rank_based_and_jittered_greedy() {
        let (inputs, output, sizes) = chain();
        for (usesizes, rel_temperature) in [(false, false), (false, true), (true, false)] {
            let opts = GreedyOptions {
                usesizes,
                rel_temperature,
                temperature: 0.3,
                random_strength: 0.5,
                seed: Some(3),
                ..Default::default()
            };
            let a = greedy_ssa_path(&inputs, &output, &sizes, &opts);
            assert_eq!(pair_steps(&a), 2);
            assert_eq!(a, greedy_ssa_path(&inputs, &output, &sizes, &opts));
        }
    }

    #[test]
    fn optimal_chain_picks_cheapest_order() {
        let (inputs, output, sizes) = chain();
        // (ab,bc) costs 2*3*4 + 2*4*5 = 64, (bc,cd) costs 3*4*5 + 2*3*5 = 90
        let path = optimal_ssa_path(&inputs, &output, &sizes, LocalCost::Flops);
        assert_eq!(path, vec![vec![0, 1], vec![2, 3]]);
    }

    #[test]
    fn optimal_handles_disconnected_subgraphs() {
        let inputs = vec![vec![0, 1], vec![1], vec![2], vec![2, 3]];
        let sizes = [(0, 2.0), (1, 3.0), (2, 4.0), (3, 5.0)].into_iter().collect();
        let path = optimal_ssa_path(&inputs, &[0, 3], &sizes, LocalCost::Size);
        assert_eq!(pair_steps(&path), 3);
    }
}
