use std::collections::{BTreeSet, VecDeque};

use bit_set::BitSet;
use itertools::Itertools;
use rustc_hash::FxHashSet;

use crate::problem::ContractionProblem;
use crate::Dict;

/// Node ids: inputs are `0..n`, contractions continue from `n`.
pub type Node = usize;
/// Edge ids are the problem's interned index ids.
pub type Edge = u32;

/// Mutable hypergraph view of a contraction, where every index is an edge
/// that may touch any number of nodes.
#[derive(Debug, Clone)]
pub struct HyperGraph {
    nodes: Dict<Node, Vec<Edge>>,
    edges: Dict<Edge, Vec<Node>>,
    output: Vec<Edge>,
    size_dict: Dict<Edge, u128>,
    node_counter: Node,
}

fn single_el_bitset(x: usize, n: usize) -> BitSet {
    let mut a = BitSet::with_capacity(n);
    a.insert(x);
    a
}

/// rescale values to lie in `[0, 1]`
fn affine_renorm(x: &Dict<Node, f64>) -> Dict<Node, f64> {
    let mut mn: f64 = f64::INFINITY;
    let mut mx: f64 = f64::NEG_INFINITY;
    for &v in x.values() {
        mn = f64::min(mn, v);
        mx = f64::max(mx, v);
    }
    if mn == mx {
        mn = 0.0;
        if mx == 0.0 {
            mx = 1.0;
        }
    }
    x.iter().map(|(&k, &v)| (k, (v - mn) / (mx - mn))).collect()
}

impl HyperGraph {
    pub fn from_problem(problem: &ContractionProblem) -> HyperGraph {
        let mut nodes: Dict<Node, Vec<Edge>> = Dict::default();
        let mut edges: Dict<Edge, Vec<Node>> = Dict::default();
        for (i, term) in problem.terms().iter().enumerate() {
            for &e in term {
                edges.entry(e).or_default().push(i);
            }
            nodes.insert(i, term.clone());
        }
        let size_dict = problem
            .sizes()
            .iter()
            .enumerate()
            .map(|(e, &d)| (e as Edge, d as u128))
            .collect();
        HyperGraph {
            node_counter: nodes.len().saturating_sub(1),
            nodes,
            edges,
            output: problem.out_ids().to_vec(),
            size_dict,
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// Current node ids in ascending order.
    pub fn nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.keys().copied().collect();
        nodes.sort_unstable();
        nodes
    }

    pub fn has_node(&self, i: Node) -> bool {
        self.nodes.contains_key(&i)
    }

    pub fn has_edge(&self, e: Edge) -> bool {
        self.edges.contains_key(&e)
    }

    pub fn get_node(&self, i: Node) -> &[Edge] {
        self.nodes.get(&i).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn get_edge(&self, e: Edge) -> &[Node] {
        self.edges.get(&e).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_output(&self, e: Edge) -> bool {
        self.output.contains(&e)
    }

    pub fn edge_size(&self, e: Edge) -> u128 {
        self.size_dict.get(&e).copied().unwrap_or(1)
    }

    fn edges_size(&self, es: &[Edge]) -> u128 {
        es.iter().fold(1u128, |x, &e| x.saturating_mul(self.edge_size(e)))
    }

    fn next_node(&mut self) -> Node {
        self.node_counter += 1;
        while self.nodes.contains_key(&self.node_counter) {
            self.node_counter += 1;
        }
        self.node_counter
    }

    fn add_node(&mut self, inds: Vec<Edge>) -> Node {
        let i = self.next_node();
        for &e in &inds {
            self.edges.entry(e).or_default().push(i);
        }
        self.nodes.insert(i, inds);
        i
    }

    fn remove_node(&mut self, i: Node) -> Vec<Edge> {
        let inds = self.nodes.remove(&i).unwrap_or_default();
        for e in &inds {
            let should_delete = match self.edges.get_mut(e) {
                Some(v) => {
                    v.retain(|&j| j != i);
                    v.is_empty()
                }
                None => false,
            };
            if should_delete {
                self.edges.remove(e);
            }
        }
        inds
    }

    fn remove_edge(&mut self, e: Edge) {
        if let Some(e_nodes) = self.edges.remove(&e) {
            for i in e_nodes {
                if let Some(i_edges) = self.nodes.get_mut(&i) {
                    i_edges.retain(|&d| d != e);
                }
            }
        }
    }

    /// Product of the sizes of the edges on node `i`.
    pub fn node_size(&self, i: Node) -> u128 {
        self.edges_size(self.get_node(i))
    }

    /// Product of the sizes of the edges shared by `i` and `j`.
    pub fn bond_size(&self, i: Node, j: Node) -> u128 {
        let j_edges = self.get_node(j);
        let es: Vec<Edge> = self.get_node(i).iter().filter(|e| j_edges.contains(e)).copied().collect();
        self.edges_size(&es)
    }

    /// Nodes touching any output edge.
    pub fn output_nodes(&self) -> Vec<Node> {
        let mut onodes = Vec::new();
        for e in self.output.iter() {
            for &i in self.get_edge(*e) {
                if !onodes.contains(&i) {
                    onodes.push(i);
                }
            }
        }
        onodes
    }

    pub fn neighbors(&self, i: Node) -> Vec<Node> {
        let mut i_neighbors = Vec::with_capacity(self.get_node(i).len());
        for &e in self.get_node(i) {
            for &j in self.get_edge(e) {
                if i != j && !i_neighbors.contains(&j) {
                    i_neighbors.push(j);
                }
            }
        }
        i_neighbors
    }

    /// All edges touching any neighbor of `i`.
    pub fn neighbor_edges(&self, i: Node) -> Vec<Edge> {
        let mut es: Vec<Edge> = Vec::new();
        for j in self.neighbors(i) {
            for &e in self.get_node(j) {
                if !es.contains(&e) {
                    es.push(e);
                }
            }
        }
        es
    }

    /// Contract nodes `i` and `j`, returning the id of the new node. Edges
    /// not on any other node (and not output) are removed.
    pub fn contract(&mut self, i: Node, j: Node) -> Node {
        let mut inds_ij = self.remove_node(i);
        inds_ij.extend(self.remove_node(j));
        let inds_ij: Vec<Edge> = inds_ij
            .into_iter()
            .unique()
            .filter(|e| self.output.contains(e) || self.edges.contains_key(e))
            .collect();
        self.add_node(inds_ij)
    }

    /// Merge every group of non-output edges in `edges` that are incident to
    /// exactly the same nodes into a single edge of size `min(product, chi)`.
    pub fn compress(&mut self, chi: u128, edges: Option<Vec<Edge>>) {
        let mut edges = match edges {
            Some(edges) => edges,
            None => self.edges.keys().copied().collect(),
        };
        edges.sort_unstable();
        let mut incidences: Dict<BTreeSet<Node>, Vec<Edge>> = Dict::default();
        for e in edges {
            if self.output.contains(&e) {
                continue;
            }
            if let Some(e_nodes) = self.edges.get(&e) {
                let nodes: BTreeSet<Node> = e_nodes.iter().copied().collect();
                let group = incidences.entry(nodes).or_default();
                if !group.contains(&e) {
                    group.push(e);
                }
            }
        }
        for (_, es) in incidences.into_iter().sorted() {
            if es.len() > 1 {
                let new_size = self.edges_size(&es);
                let e0 = es[0];
                for &e in es.iter().skip(1) {
                    self.remove_edge(e);
                }
                self.size_dict.insert(e0, new_size.min(chi));
            }
        }
    }

    /// The edges that would remain on the node formed by merging `nodes`.
    pub fn compute_contracted_inds(&self, nodes: &[Node]) -> Vec<Edge> {
        let mut inds = Vec::new();
        for i in nodes {
            for &e in self.get_node(*i) {
                if !inds.contains(&e)
                    // ind appears on any other node or in output -> keep
                    && (self.get_edge(e).iter().any(|k| !nodes.contains(k)) || self.output.contains(&e))
                {
                    inds.push(e);
                }
            }
        }
        inds
    }

    /// Size of the node that contracting `i` and `j` would produce. With a
    /// `chi`, edges left incident to the same set of nodes are grouped and
    /// each group is capped at `chi`.
    pub fn candidate_contraction_size(&self, i: Node, j: Node, chi: Option<u128>) -> u128 {
        let es = self.compute_contracted_inds(&[i, j]);
        match chi {
            None => self.edges_size(&es),
            Some(chi) => {
                let mut incidences: Dict<BTreeSet<Node>, Vec<Edge>> = Dict::default();
                for e in es {
                    let nodes: BTreeSet<Node> = self
                        .get_edge(e)
                        .iter()
                        .map(|&k| if k == j { i } else { k })
                        .collect();
                    incidences.entry(nodes).or_default().push(e);
                }
                incidences
                    .values()
                    .fold(1u128, |x, es| x.saturating_mul(chi.min(self.edges_size(es))))
            }
        }
    }

    fn build_neighbor_map(&self) -> Dict<Node, Vec<Node>> {
        self.nodes.keys().map(|&i| (i, self.neighbors(i))).collect()
    }

    /// Rough closeness: how quickly each node is reached by all others, with
    /// visitors from distance `d` weighted by `1 / (d + 1)^mu`.
    pub fn simple_closeness(&self, p: f64, mu: f64) -> Dict<Node, f64> {
        self.closeness_with(p, mu, &self.build_neighbor_map())
    }

    fn closeness_with(&self, p: f64, mu: f64, nmap: &Dict<Node, Vec<Node>>) -> Dict<Node, f64> {
        let n = self.node_counter + 1;

        // which nodes have reached which other nodes
        let mut visitors: Dict<Node, BitSet> = self.nodes.keys().map(|&x| (x, single_el_bitset(x, n))).collect();

        // the change in unique visitors each step is the number of new
        // shortest paths of length ``d``
        let mut num_visitors: Dict<Node, f64> = self.nodes.keys().map(|&i| (i, 1.0)).collect();

        // the total weighted score - combining num visitors and their distance
        let mut scores: Dict<Node, f64> = self.nodes.keys().map(|&i| (i, 0.0)).collect();

        let sz_stop = (self.num_edges() as f64).powf(p);
        let mut should_stop = false;

        for d in 0..self.num_edges().max(1) {
            // do a parallel update
            let previous_visitors = visitors.clone();
            for &i in self.nodes.keys() {
                if let Some(vi) = visitors.get_mut(&i) {
                    for j in nmap[&i].iter() {
                        vi.union_with(&previous_visitors[j]);
                    }
                }
                // visitors are worth less the further they've come from
                let new_nv = visitors[&i].len() as f64;
                if let Some(v) = scores.get_mut(&i) {
                    *v += (new_nv - num_visitors[&i]) / ((d as f64) + 1.0).powf(mu);
                }
                num_visitors.insert(i, new_nv);

                // once any node has reached a certain number of visitors stop
                should_stop |= new_nv >= sz_stop;
            }
            if should_stop {
                break;
            }
        }
        // finally rescale the values between 0.0 and 1.0
        affine_renorm(&scores)
    }

    /// Closeness smoothed by repeatedly diffusing it into neighbors, values
    /// in `[0, 1]`. Typical arguments are `(2.0, 0.75, 0.5)`.
    pub fn simple_centrality(&self, smoothness: f64, p: f64, mu: f64) -> Dict<Node, f64> {
        let neighbor_map = self.build_neighbor_map();

        // take a rough closeness as the starting point
        let mut c = self.closeness_with(p, mu, &neighbor_map);

        // take the propagation time as sqrt hypergraph size
        let r = 10.max((self.num_edges() as f64).powf(0.5) as usize);

        for _ in 0..r {
            // do a parallel update
            let previous_c = c.clone();

            // spread the centrality of each node into its neighbors
            for (&i, &ci) in previous_c.iter() {
                for j in &neighbor_map[&i] {
                    if let Some(v) = c.get_mut(j) {
                        *v += smoothness * ci / (r as f64);
                    }
                }
            }
            // then rescale all the values between 0.0 and 1.0
            c = affine_renorm(&c);
        }
        c
    }

    /// Breadth-first distance of every reachable node from `region`; nodes
    /// reached from `c` region-surface nodes at depth `d` score
    /// `d + (1 / c)^p`, then everything is rescaled to `[0, 1]`.
    pub fn simple_distance(&self, region: &[Node], p: f64) -> Dict<Node, f64> {
        let mut ball: FxHashSet<Node> = FxHashSet::default();
        let mut distances: Dict<Node, f64> = Dict::default();
        let mut surface: Dict<Node, u32> = Dict::default();
        let mut queue: VecDeque<Node> = VecDeque::new();
        for &i in region {
            ball.insert(i);
            distances.insert(i, 0.0);
            queue.push_back(i);
        }
        let mut d = 0;
        while !queue.is_empty() {
            d += 1;
            for i in queue.drain(..) {
                for j in self.neighbors(i) {
                    if !ball.contains(&j) {
                        *surface.entry(j).or_insert(0) += 1;
                    }
                }
            }
            for (j, c) in surface.drain().sorted() {
                ball.insert(j);
                queue.push_back(j);
                distances.insert(j, d as f64 + (1.0 / c as f64).powf(p));
            }
        }
        affine_renorm(&distances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> HyperGraph {
        let p = ContractionProblem::from_equation("ab,bc,cd->ad", [('a', 2), ('b', 3), ('c', 4), ('d', 5)]).unwrap();
        HyperGraph::from_problem(&p)
    }

    #[test]
    fn contract_continues_ssa_ids() {
        let mut hg = chain();
        assert_eq!(hg.nodes(), vec![0, 1, 2]);
        let k = hg.contract(0, 1);
        assert_eq!(k, 3);
        // b is gone, a (output) and c remain
        assert_eq!(hg.node_size(k), 2 * 4);
        assert!(!hg.has_edge(1));
        assert_eq!(hg.contract(k, 2), 4);
        assert_eq!(hg.num_nodes(), 1);
    }

    #[test]
    fn neighbors_and_bonds() {
        let hg = chain();
        let mut ns = hg.neighbors(1);
        ns.sort();
        assert_eq!(ns, vec![0, 2]);
        assert_eq!(hg.bond_size(0, 1), 3);
        assert_eq!(hg.bond_size(0, 2), 1);
        let mut onodes = hg.output_nodes();
        onodes.sort();
        assert_eq!(onodes, vec![0, 2]);
    }

    #[test]
    fn candidate_size_with_and_without_chi() {
        // ab,ab,bc: contracting 0 and 2 leaves a and b both incident to {0, 1}
        let p = ContractionProblem::from_equation("ab,ab,bc->", [('a', 8), ('b', 8), ('c', 2)]).unwrap();
        let hg = HyperGraph::from_problem(&p);
        assert_eq!(hg.candidate_contraction_size(0, 2, None), 64);
        assert_eq!(hg.candidate_contraction_size(0, 2, Some(16)), 16);
    }

    #[test]
    fn compress_merges_parallel_edges() {
        let p = ContractionProblem::from_equation("abc,abd->cd", [('a', 4), ('b', 4), ('c', 2), ('d', 2)]).unwrap();
        let mut hg = HyperGraph::from_problem(&p);
        hg.compress(8, None);
        assert_eq!(hg.bond_size(0, 1), 8);
        assert_eq!(hg.get_node(0).len(), 2);
    }

    #[test]
    fn centrality_and_distance_are_normalised() {
        let hg = chain();
        let c = hg.simple_centrality(2.0, 0.75, 0.5);
        assert_eq!(c.len(), 3);
        assert!(c.values().all(|&v| (0.0..=1.0).contains(&v)));
        // the middle of a chain is the most central
        assert!(c[&1] >= c[&0] && c[&1] >= c[&2]);

        let d = hg.simple_distance(&[0], 1.0);
        assert_eq!(d[&0], 0.0);
        assert!(d[&1] < d[&2]);
        assert_eq!(d[&2], 1.0);
    }
}
