//! Hyper-optimized contraction path finding.
//!
//! A [`HyperOptimizer`] repeatedly samples a path finding method and its
//! hyper-parameters, builds a candidate [`ContractionTree`], optionally slices
//! and reconfigures it, scores it and reports back to an adaptive sampler.
//! [`ReusableHyperOptimizer`] adds a content addressed cache on top.
//!
//! ```no_run
//! use cotengra_hyper::{ContractionProblem, HyperOptimizer, HyperOptions, PathOptimizer};
//!
//! let problem = ContractionProblem::from_equation("ab,bc,cd->ad", [('a', 2), ('b', 3), ('c', 4), ('d', 5)])?;
//! let mut opt = HyperOptimizer::new(HyperOptions { max_repeats: 16, ..Default::default() })?;
//! let path = opt.optimize(&problem)?;
//! # Ok::<(), cotengra_hyper::HyperError>(())
//! ```

use rustc_hash::FxHashMap;

pub mod cache;
pub mod error;
pub mod greedy_compressed;
pub mod greedy_reconf;
pub mod greedy_span;
pub mod hyper;
pub mod hypergraph;
pub mod parallel;
pub mod paths;
pub mod problem;
pub mod processor;
mod reconfigure;
pub mod registry;
pub mod reusable;
pub mod sampler;
pub mod scoring;
pub mod space;
pub mod tree;
pub mod trial;

// just for convenience
pub type Dict<K, V> = FxHashMap<K, V>;

pub use cache::DiskDict;
pub use error::{HyperError, Result};
pub use greedy_compressed::{Combine, GreedyCompressed, GreedyCompressedOptions, ScoredCandidate};
pub use greedy_reconf::GreedyReconf;
pub use greedy_span::{DistanceSteal, GreedySpan, GreedySpanOptions, SpanStart};
pub use hyper::{HyperOptimizer, HyperOptions, MaxTime, PathOptimizer, TrialRecord, TrialSort};
pub use hypergraph::HyperGraph;
pub use parallel::{ImmediatePool, ThreadPool, TrialFuture, WorkerPool};
pub use paths::{linear_to_ssa, ssa_to_linear, LinearPath, SsaPath};
pub use problem::{ContractionProblem, Label, SizeDict};
pub use processor::GreedyOptions;
pub use registry::{MethodFn, MethodRegistry};
pub use reusable::{CacheEntry, HashMethod, ReusableHyperOptimizer, ReusableOptions};
pub use sampler::{Sampler, SamplerOptions, SamplerRegistry};
pub use scoring::{LocalCost, Minimize};
pub use space::{ParamSpec, ParamValue, Params, Setting};
pub use tree::{ContractionTree, ReconfOptions, SliceOptions, SliceReconfOptions, TreeKind};
pub use trial::{Trial, TrialFn};
