//! Named path finding methods and the hyper-parameter spaces they expose.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use itertools::Itertools;

use crate::error::{HyperError, Result};
use crate::greedy_compressed::{GreedyCompressed, GreedyCompressedOptions};
use crate::greedy_span::{GreedySpan, GreedySpanOptions};
use crate::problem::ContractionProblem;
use crate::processor::{greedy_ssa_path, GreedyOptions};
use crate::space::{ParamAccess, ParamSpec, ParamValue, Params, Space};
use crate::tree::ContractionTree;

/// Build one candidate tree for a problem from a set of parameters and a seed.
pub type MethodFn = Arc<dyn Fn(&Arc<ContractionProblem>, &Params, u64) -> Result<ContractionTree> + Send + Sync>;

#[derive(Clone)]
struct Method {
    func: MethodFn,
    space: Space,
    constants: Params,
}

/// Table of the methods a [`HyperOptimizer`](crate::HyperOptimizer) may
/// sample from. Each optimizer owns its registry.
#[derive(Clone)]
pub struct MethodRegistry {
    methods: BTreeMap<String, Method>,
}

impl fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.names())
            .finish()
    }
}

impl MethodRegistry {
    /// A registry without any methods.
    pub fn empty() -> Self {
        MethodRegistry {
            methods: BTreeMap::new(),
        }
    }

    /// Register (or replace) a method. `constants` are passed on every call
    /// and override sampled parameters of the same name.
    pub fn register(&mut self, name: &str, func: MethodFn, space: Space, constants: Params) -> Result<()> {
        for (param, spec) in space.iter() {
            spec.check(param)?;
        }
        self.methods.insert(
            name.to_string(),
            Method {
                func,
                space,
                constants,
            },
        );
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Registered method names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Result<&MethodFn> {
        self.method(name).map(|m| &m.func)
    }

    pub fn space(&self, name: &str) -> Result<&Space> {
        self.method(name).map(|m| &m.space)
    }

    pub fn constants(&self, name: &str) -> Result<&Params> {
        self.method(name).map(|m| &m.constants)
    }

    fn method(&self, name: &str) -> Result<&Method> {
        self.methods
            .get(name)
            .ok_or_else(|| HyperError::UnknownMethod(name.to_string()))
    }

    /// Run `name` with sampled `params` merged over its constants.
    pub fn call(&self, name: &str, problem: &Arc<ContractionProblem>, params: &Params, seed: u64) -> Result<ContractionTree> {
        let method = self.method(name)?;
        let mut merged = params.clone();
        merged.extend(method.constants.iter().map(|(k, v)| (k.clone(), v.clone())));
        (method.func)(problem, &merged, seed)
    }
}

fn float(min: f64, max: f64) -> ParamSpec {
    ParamSpec::Float { min, max }
}

fn int(min: i64, max: i64) -> ParamSpec {
    ParamSpec::Int { min, max }
}

fn options(opts: &[&str]) -> ParamSpec {
    ParamSpec::String {
        options: opts.iter().map(|s| s.to_string()).collect(),
    }
}

fn trial_greedy(problem: &Arc<ContractionProblem>, params: &Params, seed: u64) -> Result<ContractionTree> {
    let opts = GreedyOptions {
        costmod: params.float_or("costmod", 1.0)? as f32,
        temperature: params.float_or("temperature", 0.0)? as f32,
        rel_temperature: params.bool_or("rel_temperature", true)?,
        usesizes: params.bool_or("usesizes", true)?,
        random_strength: params.float_or("random_strength", 0.0)? as f32,
        max_neighbors: params.int_or("max_neighbors", 16)?.max(1) as usize,
        seed: Some(seed),
        simplify: params.bool_or("simplify", true)?,
    };
    let ssa_path = greedy_ssa_path(problem.terms(), problem.out_ids(), &problem.id_size_dict(), &opts);
    ContractionTree::from_ssa_path(Arc::clone(problem), &ssa_path)
}

fn trial_greedy_compressed(problem: &Arc<ContractionProblem>, params: &Params, seed: u64) -> Result<ContractionTree> {
    let opt = GreedyCompressed::new(GreedyCompressedOptions::from_params(params, seed)?);
    let ssa_path = opt.ssa_path(problem)?;
    let mut tree = ContractionTree::from_ssa_path(Arc::clone(problem), &ssa_path)?;
    tree.set_surface_order_from_path(&ssa_path);
    Ok(tree)
}

fn trial_greedy_span(problem: &Arc<ContractionProblem>, params: &Params, seed: u64) -> Result<ContractionTree> {
    let opt = GreedySpan::new(GreedySpanOptions::from_params(params, seed)?);
    let ssa_path = opt.ssa_path(problem)?;
    let mut tree = ContractionTree::from_ssa_path(Arc::clone(problem), &ssa_path)?;
    tree.set_surface_order_from_path(&ssa_path);
    Ok(tree)
}

fn greedy_space() -> (Space, Params) {
    let space = Space::from([
        ("random_strength".to_string(), ParamSpec::FloatExp { min: 0.01, max: 10.0 }),
        ("temperature".to_string(), ParamSpec::FloatExp { min: 0.01, max: 10.0 }),
        ("rel_temperature".to_string(), ParamSpec::Bool),
        ("costmod".to_string(), float(0.0, 2.0)),
        ("usesizes".to_string(), ParamSpec::Bool),
    ]);
    let constants = Params::from([
        ("max_neighbors".to_string(), ParamValue::Int(16)),
        ("simplify".to_string(), ParamValue::Bool(true)),
    ]);
    (space, constants)
}

fn greedy_compressed_space() -> Space {
    let combos = ["min", "max", "mean", "sum", "diff"];
    Space::from([
        ("coeff_size_compressed".to_string(), float(0.5, 2.0)),
        ("coeff_size".to_string(), float(0.0, 1.0)),
        ("coeff_size_inputs".to_string(), float(-1.0, 1.0)),
        ("score_size_inputs".to_string(), options(&combos)),
        ("coeff_subgraph".to_string(), float(-1.0, 1.0)),
        ("score_subgraph".to_string(), options(&combos)),
        ("coeff_centrality".to_string(), float(-10.0, 10.0)),
        ("centrality_combine".to_string(), options(&["min", "max", "mean"])),
        ("score_centrality".to_string(), options(&["min", "max", "mean", "diff"])),
        ("temperature".to_string(), float(-0.1, 1.0)),
        ("chi".to_string(), int(2, 128)),
    ])
}

fn greedy_span_space() -> Space {
    let perms: Vec<String> = "NDLI"
        .chars()
        .permutations(4)
        .map(|p| format!("C{}T", p.into_iter().collect::<String>()))
        .collect();
    Space::from([
        ("start".to_string(), options(&["min", "max"])),
        ("score_perm".to_string(), ParamSpec::String { options: perms }),
        ("coeff_connectivity".to_string(), int(0, 1)),
        ("coeff_ndim".to_string(), int(-1, 1)),
        ("coeff_distance".to_string(), int(-1, 1)),
        ("coeff_next_centrality".to_string(), float(-1.0, 1.0)),
        ("connectivity_weight_bonds".to_string(), ParamSpec::Bool),
        ("temperature".to_string(), float(-1.0, 1.0)),
        ("distance_p".to_string(), float(-5.0, 5.0)),
        ("distance_steal".to_string(), options(&["", "abs", "rel"])),
    ])
}

impl Default for MethodRegistry {
    /// `greedy`, `greedy-compressed` and `greedy-span`.
    fn default() -> Self {
        let mut methods = BTreeMap::new();
        let (space, constants) = greedy_space();
        methods.insert(
            "greedy".to_string(),
            Method {
                func: Arc::new(trial_greedy) as MethodFn,
                space,
                constants,
            },
        );
        methods.insert(
            "greedy-compressed".to_string(),
            Method {
                func: Arc::new(trial_greedy_compressed) as MethodFn,
                space: greedy_compressed_space(),
                constants: Params::new(),
            },
        );
        methods.insert(
            "greedy-span".to_string(),
            Method {
                func: Arc::new(trial_greedy_span) as MethodFn,
                space: greedy_span_space(),
                constants: Params::new(),
            },
        );
        MethodRegistry { methods }
    }
}
