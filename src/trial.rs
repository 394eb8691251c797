//! A trial is one candidate tree plus its costs. Trial functions produce
//! trials and compose like middleware: slicing, reconfiguration and scoring
//! each wrap an inner trial function.

use std::sync::Arc;

use log::debug;

use crate::error::Result;
use crate::problem::ContractionProblem;
use crate::registry::MethodRegistry;
use crate::scoring::Minimize;
use crate::space::Setting;
use crate::tree::{ContractionTree, ReconfOptions, SliceOptions, SliceReconfOptions, TreeKind};

#[derive(Debug, Clone)]
pub struct Trial {
    pub tree: ContractionTree,
    pub flops: f64,
    pub write: f64,
    pub size: f64,
    /// Costs before any slicing or reconfiguration.
    pub original_flops: Option<f64>,
    pub original_write: Option<f64>,
    pub original_size: Option<f64>,
    /// Set by [`ComputeScore`], lower is better.
    pub score: f64,
    pub setting: Setting,
}

impl Trial {
    pub fn new(tree: ContractionTree, setting: Setting) -> Self {
        let mut trial = Trial {
            tree,
            flops: 0.0,
            write: 0.0,
            size: 0.0,
            original_flops: None,
            original_write: None,
            original_size: None,
            score: f64::INFINITY,
            setting,
        };
        trial.refresh_costs();
        trial
    }

    /// Record the current costs as the originals, unless already recorded.
    pub fn snapshot_original(&mut self) {
        self.original_flops.get_or_insert(self.flops);
        self.original_write.get_or_insert(self.write);
        self.original_size.get_or_insert(self.size);
    }

    pub fn refresh_costs(&mut self) {
        self.flops = self.tree.total_flops();
        self.write = self.tree.total_write();
        self.size = self.tree.max_size();
    }
}

/// Produces a trial for a setting.
pub trait TrialFn: Send + Sync {
    fn run(&self, problem: &Arc<ContractionProblem>, setting: &Setting) -> Result<Trial>;
}

/// Dispatch a setting to its registered method.
pub struct FindTree {
    registry: Arc<MethodRegistry>,
    kind: TreeKind,
}

impl FindTree {
    /// Trees are tagged `kind` as soon as they are built.
    pub fn new(registry: Arc<MethodRegistry>, kind: TreeKind) -> Self {
        FindTree { registry, kind }
    }
}

impl TrialFn for FindTree {
    fn run(&self, problem: &Arc<ContractionProblem>, setting: &Setting) -> Result<Trial> {
        let mut tree = self
            .registry
            .call(&setting.method, problem, &setting.params, setting.seed)?;
        tree.set_kind(self.kind);
        Ok(Trial::new(tree, setting.clone()))
    }
}

/// Slice the inner trial's tree.
pub struct SlicedTrialFn {
    inner: Box<dyn TrialFn>,
    opts: SliceOptions,
}

impl SlicedTrialFn {
    pub fn new(inner: Box<dyn TrialFn>, opts: SliceOptions) -> Self {
        SlicedTrialFn { inner, opts }
    }
}

impl TrialFn for SlicedTrialFn {
    fn run(&self, problem: &Arc<ContractionProblem>, setting: &Setting) -> Result<Trial> {
        let mut trial = self.inner.run(problem, setting)?;
        trial.snapshot_original();
        trial.tree.slice(&self.opts);
        trial.tree.clear_optimized();
        trial.refresh_costs();
        Ok(trial)
    }
}

/// Reconfigure subtrees of the inner trial's tree, optionally as a forest.
pub struct ReconfTrialFn {
    inner: Box<dyn TrialFn>,
    opts: ReconfOptions,
}

impl ReconfTrialFn {
    pub fn new(inner: Box<dyn TrialFn>, opts: ReconfOptions) -> Self {
        ReconfTrialFn { inner, opts }
    }
}

impl TrialFn for ReconfTrialFn {
    fn run(&self, problem: &Arc<ContractionProblem>, setting: &Setting) -> Result<Trial> {
        let mut trial = self.inner.run(problem, setting)?;
        trial.snapshot_original();
        let mut opts = self.opts.clone();
        opts.seed.get_or_insert(setting.seed);
        if opts.forested {
            trial.tree.subtree_reconfigure_forest(&opts);
        } else {
            trial.tree.subtree_reconfigure(&opts);
        }
        trial.tree.clear_optimized();
        trial.refresh_costs();
        Ok(trial)
    }
}

/// Interleave slicing with reconfiguration.
pub struct SlicedReconfTrialFn {
    inner: Box<dyn TrialFn>,
    opts: SliceReconfOptions,
}

impl SlicedReconfTrialFn {
    pub fn new(inner: Box<dyn TrialFn>, opts: SliceReconfOptions) -> Self {
        SlicedReconfTrialFn { inner, opts }
    }
}

impl TrialFn for SlicedReconfTrialFn {
    fn run(&self, problem: &Arc<ContractionProblem>, setting: &Setting) -> Result<Trial> {
        let mut trial = self.inner.run(problem, setting)?;
        trial.snapshot_original();
        let mut opts = self.opts.clone();
        opts.reconf_opts.seed.get_or_insert(setting.seed);
        if opts.reconf_opts.forested {
            trial.tree.slice_and_reconfigure_forest(&opts);
        } else {
            trial.tree.slice_and_reconfigure(&opts);
        }
        trial.tree.clear_optimized();
        trial.refresh_costs();
        Ok(trial)
    }
}

/// Outermost wrapper: score the finished trial. The raw score is raised to
/// `compression`, which flattens the differences the sampler sees between
/// very bad trials.
pub struct ComputeScore {
    inner: Box<dyn TrialFn>,
    minimize: Minimize,
    compression: f64,
}

impl ComputeScore {
    pub fn new(inner: Box<dyn TrialFn>, minimize: Minimize, compression: f64) -> Self {
        ComputeScore {
            inner,
            minimize,
            compression,
        }
    }
}

impl TrialFn for ComputeScore {
    fn run(&self, problem: &Arc<ContractionProblem>, setting: &Setting) -> Result<Trial> {
        let mut trial = self.inner.run(problem, setting)?;
        let raw = self.minimize.score(&trial);
        trial.score = raw.signum() * raw.abs().powf(self.compression);
        debug!(
            "trial {} seed={} flops={:.4e} write={:.4e} size={:.4e} score={:.4}",
            setting.method, setting.seed, trial.flops, trial.write, trial.size, trial.score
        );
        Ok(trial)
    }
}

/// Post-processing applied to every trial, in order of precedence.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    pub slicing_opts: Option<SliceOptions>,
    pub slicing_reconf_opts: Option<SliceReconfOptions>,
    pub reconf_opts: Option<ReconfOptions>,
}

/// Compose the trial function: find, then slice, then slice and reconfigure,
/// then reconfigure, then score. Reconfiguration without an explicit local
/// cost minimizes the closest match to `minimize`.
pub fn build_trial_fn(
    registry: Arc<MethodRegistry>,
    kind: TreeKind,
    pipeline: &Pipeline,
    minimize: &Minimize,
    score_compression: f64,
) -> Box<dyn TrialFn> {
    let mut trial_fn: Box<dyn TrialFn> = Box::new(FindTree::new(registry, kind));
    if let Some(opts) = &pipeline.slicing_opts {
        trial_fn = Box::new(SlicedTrialFn::new(trial_fn, opts.clone()));
    }
    if let Some(opts) = &pipeline.slicing_reconf_opts {
        let mut opts = opts.clone();
        opts.reconf_opts.minimize.get_or_insert(minimize.local_cost());
        trial_fn = Box::new(SlicedReconfTrialFn::new(trial_fn, opts));
    }
    if let Some(opts) = &pipeline.reconf_opts {
        let mut opts = opts.clone();
        opts.minimize.get_or_insert(minimize.local_cost());
        trial_fn = Box::new(ReconfTrialFn::new(trial_fn, opts));
    }
    Box::new(ComputeScore::new(trial_fn, minimize.clone(), score_compression))
}
