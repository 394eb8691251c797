//! Cheap single-shot optimizers: one greedy path polished by a single round
//! of subtree reconfiguration.

use std::str::FromStr;
use std::sync::Arc;

use crate::error::{HyperError, Result};
use crate::hyper::PathOptimizer;
use crate::paths::LinearPath;
use crate::problem::ContractionProblem;
use crate::processor::{greedy_ssa_path, GreedyOptions};
use crate::scoring::{LocalCost, DEFAULT_FACTOR};
use crate::tree::{ContractionTree, ReconfOptions};

/// `greedy-rf`, `greedy-rw` and `greedy-rc`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GreedyReconf {
    pub minimize: LocalCost,
    pub subtree_size: usize,
}

impl GreedyReconf {
    pub fn flops() -> Self {
        GreedyReconf {
            minimize: LocalCost::Flops,
            subtree_size: 6,
        }
    }

    pub fn write() -> Self {
        GreedyReconf {
            minimize: LocalCost::Write,
            subtree_size: 6,
        }
    }

    pub fn combo() -> Self {
        GreedyReconf {
            minimize: LocalCost::Combo(DEFAULT_FACTOR),
            subtree_size: 6,
        }
    }

    pub fn tree(&self, problem: &Arc<ContractionProblem>) -> Result<ContractionTree> {
        let ssa_path = greedy_ssa_path(
            problem.terms(),
            problem.out_ids(),
            &problem.id_size_dict(),
            &GreedyOptions::default(),
        );
        let mut tree = ContractionTree::from_ssa_path(Arc::clone(problem), &ssa_path)?;
        tree.subtree_reconfigure(&ReconfOptions {
            subtree_size: self.subtree_size,
            minimize: Some(self.minimize),
            ..Default::default()
        });
        Ok(tree)
    }
}

impl FromStr for GreedyReconf {
    type Err = HyperError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "greedy-rf" => Ok(GreedyReconf::flops()),
            "greedy-rw" => Ok(GreedyReconf::write()),
            "greedy-rc" => Ok(GreedyReconf::combo()),
            _ => Err(HyperError::UnknownMethod(s.to_string())),
        }
    }
}

impl PathOptimizer for GreedyReconf {
    fn optimize(&mut self, problem: &ContractionProblem) -> Result<LinearPath> {
        Ok(self.tree(&Arc::new(problem.clone()))?.path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lattice() -> Arc<ContractionProblem> {
        let eq = "ab,acd,ce,bfg,dfhi,ehj,gk,ikl,jl,km,lmn->n";
        let sizes = "abcdefghijklmn".chars().zip([2, 8, 3, 5, 2, 4, 7, 3, 6, 2, 5, 3, 4, 2]);
        Arc::new(ContractionProblem::from_equation(eq, sizes).unwrap())
    }

    #[test]
    fn never_worse_than_plain_greedy() {
        let p = lattice();
        let ssa_path = greedy_ssa_path(p.terms(), p.out_ids(), &p.id_size_dict(), &GreedyOptions::default());
        let greedy = ContractionTree::from_ssa_path(Arc::clone(&p), &ssa_path).unwrap();
        for name in ["greedy-rf", "greedy-rw", "greedy-rc"] {
            let opt: GreedyReconf = name.parse().unwrap();
            let tree = opt.tree(&p).unwrap();
            assert_eq!(tree.intermediates().len(), p.num_inputs() - 1);
            assert!(tree.total_cost(opt.minimize) <= greedy.total_cost(opt.minimize), "{}", name);
        }
        assert!(GreedyReconf::flops().tree(&p).unwrap().total_flops() <= greedy.total_flops());
        assert!(GreedyReconf::write().tree(&p).unwrap().total_write() <= greedy.total_write());
    }

    #[test]
    fn optimize_returns_a_linear_path() {
        let p = lattice();
        let path = GreedyReconf::combo().optimize(&p).unwrap();
        assert_eq!(path.len(), p.num_inputs() - 1);
        let tree = ContractionTree::from_linear_path(Arc::clone(&p), &path).unwrap();
        assert!(tree.total_cost(LocalCost::Combo(DEFAULT_FACTOR)) > 0.0);
        assert!("greedy-rx".parse::<GreedyReconf>().is_err());
    }
}
