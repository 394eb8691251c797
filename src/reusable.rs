//! A hyper-optimizer that remembers the paths it found, keyed by a hash of
//! the contraction.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::cache::{sha256_hex, DiskDict};
use crate::error::{HyperError, Result};
use crate::hyper::{tree_kind, HyperOptimizer, HyperOptions, PathOptimizer};
use crate::paths::LinearPath;
use crate::problem::{ContractionProblem, Label};
use crate::tree::ContractionTree;

/// How a contraction is reduced to a cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashMethod {
    /// Exact labels: sorted inputs, sorted output and sorted sizes.
    A,
    /// Structure only: every index is replaced by the operands it touches,
    /// so consistent relabelings share a key.
    B,
}

impl Default for HashMethod {
    fn default() -> Self {
        HashMethod::A
    }
}

impl FromStr for HashMethod {
    type Err = HyperError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "a" => Ok(HashMethod::A),
            "b" => Ok(HashMethod::B),
            _ => Err(HyperError::InvalidOption(format!("unknown hash method '{}'", s))),
        }
    }
}

impl HashMethod {
    /// Hex digest identifying `problem`.
    pub fn hash(self, problem: &ContractionProblem) -> Result<String> {
        let canonical = match self {
            HashMethod::A => {
                let inputs: Vec<Vec<&Label>> = problem
                    .inputs()
                    .iter()
                    .map(|term| {
                        let mut t: Vec<&Label> = term.iter().collect();
                        t.sort();
                        t
                    })
                    .collect();
                let mut output: Vec<&Label> = problem.output().iter().collect();
                output.sort();
                let mut sizes: Vec<(&Label, u64)> = problem.size_dict().iter().map(|(k, &v)| (k, v)).collect();
                sizes.sort();
                serde_json::to_vec(&(inputs, output, sizes))?
            }
            HashMethod::B => {
                let mut edges = edge_signatures(problem);
                edges.sort();
                serde_json::to_vec(&(problem.num_inputs(), edges))?
            }
        };
        Ok(sha256_hex(&canonical))
    }
}

/// An index described only by the operands it appears on (`-1` for the
/// output) and its size.
pub type EdgeSignature = (Vec<i64>, u64);

/// The signature of every index, by interned id.
fn edge_signatures(problem: &ContractionProblem) -> Vec<EdgeSignature> {
    let mut ops: Vec<Vec<i64>> = vec![Vec::new(); problem.num_indices()];
    for (i, term) in problem.terms().iter().enumerate() {
        for &ix in term {
            ops[ix as usize].push(i as i64);
        }
    }
    for &ix in problem.out_ids() {
        ops[ix as usize].push(-1);
    }
    ops.into_iter()
        .zip(problem.sizes())
        .map(|(mut o, &size)| {
            o.sort_unstable();
            (o, size)
        })
        .collect()
}

/// What is remembered for each contraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub path: LinearPath,
    pub sliced_inds: Vec<Label>,
    /// The sliced indices again, by signature, so that a relabeled problem
    /// sharing a structural key can find its own labels.
    #[serde(default)]
    pub sliced_edges: Vec<EdgeSignature>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReusableOptions {
    /// Where entries are stored, in memory only if unset.
    pub directory: Option<PathBuf>,
    /// Search again even on a hit, replacing the entry.
    pub overwrite: bool,
    /// Rebuild hits with the cached path as their contraction order.
    pub set_surface_order: bool,
    pub hash_method: HashMethod,
    /// Options for each fresh search.
    pub hyper: HyperOptions,
}

impl Default for ReusableOptions {
    fn default() -> Self {
        ReusableOptions {
            directory: None,
            overwrite: false,
            set_surface_order: false,
            hash_method: HashMethod::A,
            hyper: HyperOptions::default(),
        }
    }
}

/// Runs a fresh [`HyperOptimizer`] only for contractions it has not seen.
#[derive(Debug)]
pub struct ReusableHyperOptimizer {
    opts: ReusableOptions,
    cache: DiskDict<CacheEntry>,
    last_opt: Option<HyperOptimizer>,
    searches_run: usize,
}

impl ReusableHyperOptimizer {
    pub fn new(opts: ReusableOptions) -> Result<Self> {
        let cache = DiskDict::new(opts.directory.clone())?;
        Ok(ReusableHyperOptimizer {
            opts,
            cache,
            last_opt: None,
            searches_run: 0,
        })
    }

    pub fn hash_key(&self, problem: &ContractionProblem) -> Result<String> {
        self.opts.hash_method.hash(problem)
    }

    /// Look up `problem`, searching and storing on a miss or when `force`
    /// is set. Returns the entry and the searched tree when a search ran.
    fn lookup(&mut self, problem: &ContractionProblem, force: bool) -> Result<(CacheEntry, Option<ContractionTree>)> {
        let key = self.hash_key(problem)?;
        if !self.opts.overwrite && !force {
            if let Some(entry) = self.cache.get(&key) {
                debug!("cache hit for {}", key);
                return Ok((entry, None));
            }
        }

        debug!("cache miss for {}, searching", key);
        let mut opt = HyperOptimizer::new(self.opts.hyper.clone())?;
        let tree = opt.search(problem)?;
        let signatures = edge_signatures(problem);
        let sliced_inds = tree.sliced_inds();
        let sliced_edges = sliced_inds
            .iter()
            .filter_map(|ind| problem.index_of(ind))
            .map(|ix| signatures[ix as usize].clone())
            .collect();
        let entry = CacheEntry {
            path: tree.path(),
            sliced_inds,
            sliced_edges,
        };
        self.cache.insert(&key, &entry)?;
        self.last_opt = Some(opt);
        self.searches_run += 1;
        Ok((entry, Some(tree)))
    }

    /// The best tree for `problem`, rebuilt from the cache on a hit with its
    /// slices reapplied.
    pub fn search(&mut self, problem: &ContractionProblem) -> Result<ContractionTree> {
        let (entry, searched) = self.lookup(problem, false)?;
        if let Some(tree) = searched {
            return Ok(tree);
        }
        if let Some(tree) = self.rebuild(&entry, problem) {
            return Ok(tree);
        }
        warn!("cached entry does not fit the contraction, searching again");
        self.lookup(problem, true)?
            .1
            .ok_or_else(|| HyperError::Cache("search did not produce a tree".to_string()))
    }

    /// The labels of `problem` that `entry` sliced.
    fn resolve_slices(&self, entry: &CacheEntry, problem: &ContractionProblem) -> Option<Vec<Label>> {
        match self.opts.hash_method {
            HashMethod::A => {
                if entry.sliced_inds.iter().all(|ind| problem.index_of(ind).is_some()) {
                    Some(entry.sliced_inds.clone())
                } else {
                    None
                }
            }
            HashMethod::B => {
                if entry.sliced_edges.len() != entry.sliced_inds.len() {
                    return None;
                }
                // indices sharing a signature are interchangeable
                let signatures = edge_signatures(problem);
                let mut taken = vec![false; signatures.len()];
                let mut labels = Vec::with_capacity(entry.sliced_edges.len());
                for sig in entry.sliced_edges.iter() {
                    let ix = (0..signatures.len()).find(|&ix| !taken[ix] && signatures[ix] == *sig)?;
                    taken[ix] = true;
                    labels.push(problem.label(ix as u32).to_string());
                }
                Some(labels)
            }
        }
    }

    /// Rebuild the tree a hit describes, `None` if the entry does not fit.
    fn rebuild(&self, entry: &CacheEntry, problem: &ContractionProblem) -> Option<ContractionTree> {
        let sliced = self.resolve_slices(entry, problem)?;
        let mut tree = ContractionTree::from_linear_path(Arc::new(problem.clone()), &entry.path).ok()?;
        if self.opts.set_surface_order {
            let ssa_path = tree.ssa_path();
            tree.set_surface_order_from_path(&ssa_path);
        }
        tree.set_kind(tree_kind(&self.opts.hyper, problem));
        for ind in sliced.iter() {
            tree.remove_ind(ind).ok()?;
        }
        Some(tree)
    }

    /// The optimizer behind the most recent search, if any ran.
    pub fn last_opt(&self) -> Option<&HyperOptimizer> {
        self.last_opt.as_ref()
    }

    /// Number of fresh searches run, i.e. cache misses.
    pub fn searches_run(&self) -> usize {
        self.searches_run
    }

    /// Drop every cached entry.
    pub fn cleanup(&self) -> Result<()> {
        self.cache.cleanup()
    }
}

impl PathOptimizer for ReusableHyperOptimizer {
    fn optimize(&mut self, problem: &ContractionProblem) -> Result<LinearPath> {
        Ok(self.lookup(problem, false)?.0.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::SliceOptions;

    fn lattice(labels: &str) -> ContractionProblem {
        let l: Vec<char> = labels.chars().collect();
        let eq = format!(
            "{}{},{}{}{},{}{},{}{}{},{}{}{}{},{}{}{},{}{},{}{}{},{}{}->",
            l[0], l[1], l[0], l[2], l[3], l[2], l[4], l[1], l[5], l[6], l[3], l[5], l[7], l[8], l[4], l[7], l[9],
            l[6], l[10], l[8], l[10], l[11], l[9], l[11]
        );
        ContractionProblem::from_equation(&eq, l.iter().copied().zip([2, 3, 4, 2, 3, 4, 2, 3, 4, 2, 3, 4])).unwrap()
    }

    fn opts(directory: Option<PathBuf>) -> ReusableOptions {
        ReusableOptions {
            directory,
            hyper: HyperOptions {
                methods: vec!["greedy".into(), "greedy-span".into()],
                max_repeats: 6,
                seed: Some(3),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn second_call_hits_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let p = lattice("abcdefghijkl");
        let mut opt = ReusableHyperOptimizer::new(opts(Some(dir.path().to_path_buf()))).unwrap();
        let first = opt.optimize(&p).unwrap();
        assert_eq!(opt.searches_run(), 1);
        assert_eq!(opt.last_opt().unwrap().history().len(), 6);
        let second = opt.optimize(&p).unwrap();
        assert_eq!(first, second);
        assert_eq!(opt.searches_run(), 1);

        // a new optimizer on the same directory reuses the entry too
        let mut fresh = ReusableHyperOptimizer::new(opts(Some(dir.path().to_path_buf()))).unwrap();
        assert_eq!(fresh.optimize(&p).unwrap(), first);
        assert_eq!(fresh.searches_run(), 0);
        assert!(fresh.last_opt().is_none());

        let mut over = ReusableHyperOptimizer::new(ReusableOptions {
            overwrite: true,
            ..opts(Some(dir.path().to_path_buf()))
        })
        .unwrap();
        over.optimize(&p).unwrap();
        assert_eq!(over.searches_run(), 1);
        over.cleanup().unwrap();
        assert!(!dir.path().exists());
    }

    #[test]
    fn hits_restore_slices() {
        let p = lattice("abcdefghijkl");
        let mut o = opts(None);
        o.hyper.slicing_opts = Some(SliceOptions {
            target_size: Some(16.0),
            ..Default::default()
        });
        o.set_surface_order = true;
        let mut opt = ReusableHyperOptimizer::new(o).unwrap();
        let searched = opt.search(&p).unwrap();
        let rebuilt = opt.search(&p).unwrap();
        assert_eq!(opt.searches_run(), 1);
        assert!(!searched.sliced_inds().is_empty());
        assert_eq!(rebuilt.sliced_inds(), searched.sliced_inds());
        assert_eq!(rebuilt.path(), searched.path());
        assert_eq!(rebuilt.total_flops(), searched.total_flops());
        assert!(rebuilt.max_size() <= 16.0);
    }

    #[test]
    fn structural_hits_translate_slices() {
        let ring = |labels: &str| {
            let l: Vec<char> = labels.chars().collect();
            let eq = format!("{}{},{}{},{}{},{}{}->", l[0], l[1], l[1], l[2], l[2], l[3], l[3], l[0]);
            ContractionProblem::from_equation(&eq, l.iter().map(|&c| (c, 8))).unwrap()
        };
        let (p, q) = (ring("abcd"), ring("wxyz"));
        let mut o = opts(None);
        o.hash_method = HashMethod::B;
        o.hyper.slicing_opts = Some(SliceOptions {
            target_size: Some(8.0),
            ..Default::default()
        });
        let mut opt = ReusableHyperOptimizer::new(o).unwrap();
        let searched = opt.search(&p).unwrap();
        assert!(!searched.sliced_inds().is_empty());

        let rebuilt = opt.search(&q).unwrap();
        assert_eq!(opt.searches_run(), 1);
        let relabeled: Vec<Label> = searched
            .sliced_inds()
            .iter()
            .map(|ind| match ind.as_str() {
                "a" => "w",
                "b" => "x",
                "c" => "y",
                _ => "z",
            })
            .map(String::from)
            .collect();
        assert_eq!(rebuilt.sliced_inds(), relabeled);
        assert_eq!(rebuilt.total_flops(), searched.total_flops());
        assert!(rebuilt.max_size() <= 8.0);
    }

    #[test]
    fn unusable_entries_are_searched_again() {
        let p = lattice("abcdefghijkl");
        let mut opt = ReusableHyperOptimizer::new(opts(None)).unwrap();
        let key = opt.hash_key(&p).unwrap();
        let stale = CacheEntry {
            path: vec![vec![0, 1]; 8],
            sliced_inds: vec!["nope".to_string()],
            sliced_edges: Vec::new(),
        };
        opt.cache.insert(&key, &stale).unwrap();
        let tree = opt.search(&p).unwrap();
        assert_eq!(opt.searches_run(), 1);
        assert!(tree.sliced_inds().is_empty());

        // the replacement entry is used from now on
        assert_ne!(opt.cache.get(&key).unwrap(), stale);
        opt.search(&p).unwrap();
        assert_eq!(opt.searches_run(), 1);
    }

    #[test]
    fn structural_hash_ignores_labels() {
        let p = lattice("abcdefghijkl");
        let q = lattice("ABCDEFGHIJKL");
        assert_ne!(HashMethod::A.hash(&p).unwrap(), HashMethod::A.hash(&q).unwrap());
        assert_eq!(HashMethod::B.hash(&p).unwrap(), HashMethod::B.hash(&q).unwrap());

        // same structure, different sizes
        let r = ContractionProblem::from_equation("ab,bc->ac", [('a', 2), ('b', 3), ('c', 4)]).unwrap();
        let s = ContractionProblem::from_equation("ab,bc->ac", [('a', 2), ('b', 5), ('c', 4)]).unwrap();
        assert_ne!(HashMethod::B.hash(&r).unwrap(), HashMethod::B.hash(&s).unwrap());

        let mut o = opts(None);
        o.hash_method = "b".parse().unwrap();
        let mut opt = ReusableHyperOptimizer::new(o).unwrap();
        let pp = opt.optimize(&p).unwrap();
        let qp = opt.optimize(&q).unwrap();
        assert_eq!(pp, qp);
        assert_eq!(opt.searches_run(), 1);
    }
}
