//! The hyper-optimizer: sample a method and parameters, build and
//! post-process a tree, score it, report back, repeat.

use std::fmt::{self, Write as _};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Select;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::error::{HyperError, Result};
use crate::parallel::{ThreadPool, TrialFuture, WorkerPool};
use crate::paths::LinearPath;
use crate::problem::ContractionProblem;
use crate::registry::MethodRegistry;
use crate::sampler::{Sampler, SamplerOptions, SamplerRegistry, Spaces};
use crate::scoring::Minimize;
use crate::space::{Params, Setting};
use crate::tree::{ContractionTree, ReconfOptions, SliceOptions, SliceReconfOptions, TreeKind};
use crate::trial::{build_trial_fn, Pipeline, Trial, TrialFn};

/// Anything that turns a contraction into a linear path.
pub trait PathOptimizer {
    fn optimize(&mut self, problem: &ContractionProblem) -> Result<LinearPath>;
}

/// Wall-clock budget for one search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "MaxTimeRepr", into = "MaxTimeRepr")]
pub enum MaxTime {
    /// Stop once this many seconds have passed.
    Seconds(f64),
    /// Stop once the time spent exceeds the best flops found divided by this
    /// many flops per second, i.e. searching longer than contracting would.
    Rate(f64),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum MaxTimeRepr {
    Seconds(f64),
    Text(String),
}

impl TryFrom<MaxTimeRepr> for MaxTime {
    type Error = HyperError;

    fn try_from(repr: MaxTimeRepr) -> Result<Self> {
        match repr {
            MaxTimeRepr::Seconds(s) => Ok(MaxTime::Seconds(s)),
            MaxTimeRepr::Text(s) => s.parse(),
        }
    }
}

impl From<MaxTime> for MaxTimeRepr {
    fn from(t: MaxTime) -> Self {
        match t {
            MaxTime::Seconds(s) => MaxTimeRepr::Seconds(s),
            MaxTime::Rate(r) => MaxTimeRepr::Text(format!("rate:{}", r)),
        }
    }
}

impl std::str::FromStr for MaxTime {
    type Err = HyperError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || HyperError::InvalidOption(format!("invalid max_time '{}'", s));
        match s.split_once(':') {
            Some(("rate", rate)) => rate.trim().parse().map(MaxTime::Rate).map_err(|_| bad()),
            Some(_) => Err(bad()),
            None => s.trim().parse().map(MaxTime::Seconds).map_err(|_| bad()),
        }
    }
}

/// Every knob of a [`HyperOptimizer`]. Loadable from JSON, missing fields
/// take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HyperOptions {
    pub methods: Vec<String>,
    pub minimize: Minimize,
    pub max_repeats: usize,
    pub max_time: Option<MaxTime>,
    /// Zero runs trials on the calling thread.
    pub num_workers: usize,
    pub slicing_opts: Option<SliceOptions>,
    pub slicing_reconf_opts: Option<SliceReconfOptions>,
    pub reconf_opts: Option<ReconfOptions>,
    /// Sampler backend name.
    pub optlib: String,
    pub score_compression: f64,
    /// After this many trials the sampler only learns from new bests.
    pub max_training_steps: Option<usize>,
    /// Log every new best at info level.
    pub progbar: bool,
    pub seed: Option<u64>,
    /// Bond dimension cap for compressed targets, defaults to the largest
    /// dimension squared.
    pub compress_chi: Option<u64>,
    pub sampler_opts: SamplerOptions,
}

impl Default for HyperOptions {
    fn default() -> Self {
        HyperOptions {
            methods: vec!["greedy".to_string()],
            minimize: Minimize::Flops,
            max_repeats: 128,
            max_time: None,
            num_workers: 0,
            slicing_opts: None,
            slicing_reconf_opts: None,
            reconf_opts: None,
            optlib: "tpe".to_string(),
            score_compression: 0.75,
            max_training_steps: None,
            progbar: false,
            seed: None,
            compress_chi: None,
            sampler_opts: SamplerOptions::default(),
        }
    }
}

impl HyperOptions {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// The cost accounting trees are built with for `opts`.
pub(crate) fn tree_kind(opts: &HyperOptions, problem: &ContractionProblem) -> TreeKind {
    if opts.minimize.is_compressed() {
        let chi = opts
            .compress_chi
            .unwrap_or_else(|| problem.max_dim().saturating_mul(problem.max_dim()));
        TreeKind::Compressed { chi }
    } else {
        TreeKind::Standard
    }
}

/// One finished trial as recorded in the history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialRecord {
    pub method: String,
    pub params: Params,
    pub seed: u64,
    pub flops: f64,
    pub write: f64,
    pub size: f64,
    pub score: f64,
}

/// Orderings for [`HyperOptimizer::get_trials`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialSort {
    Method,
    Combo,
    Size,
    Flops,
    Write,
}

fn log2(x: f64) -> f64 {
    x.max(1.0).log2()
}

impl TrialSort {
    fn key(self, r: &TrialRecord) -> f64 {
        let (size, flops, write) = (log2(r.size), log2(r.flops), log2(r.write));
        match self {
            TrialSort::Method => 0.0,
            TrialSort::Combo => size / 1e3 + log2(r.flops + 256.0 * r.write),
            TrialSort::Size => size + flops / 1e3 + write / 1e3,
            TrialSort::Flops => size / 1e3 + flops + write / 1e3,
            TrialSort::Write => size / 1e3 + flops / 1e3 + write,
        }
    }
}

/// Repeatedly samples path finding methods and their hyper-parameters,
/// keeping the best tree found. Successive searches on the same problem
/// extend the history rather than restart it.
pub struct HyperOptimizer {
    opts: HyperOptions,
    registry: Arc<MethodRegistry>,
    sampler: Box<dyn Sampler>,
    pool: Option<Arc<dyn WorkerPool>>,
    pre_dispatch: usize,
    problem: Option<Arc<ContractionProblem>>,
    jitter: Normal<f64>,
    rng: StdRng,
    // best jittered score reported to the sampler
    best_score: f64,
    best: Option<Trial>,
    history: Vec<TrialRecord>,
}

impl fmt::Debug for HyperOptimizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HyperOptimizer")
            .field("opts", &self.opts)
            .field("num_trials", &self.history.len())
            .field("best_score", &self.best.as_ref().map(|t| t.score))
            .finish()
    }
}

impl HyperOptimizer {
    /// An optimizer over the default methods and samplers, with a rayon pool
    /// when `num_workers > 0`.
    pub fn new(opts: HyperOptions) -> Result<Self> {
        let num_workers = opts.num_workers;
        let opt = Self::with_registries(opts, MethodRegistry::default(), &SamplerRegistry::default())?;
        if num_workers > 0 {
            Ok(opt.with_pool(Arc::new(ThreadPool::new(num_workers)?)))
        } else {
            Ok(opt)
        }
    }

    pub fn with_registries(opts: HyperOptions, methods: MethodRegistry, samplers: &SamplerRegistry) -> Result<Self> {
        if opts.methods.is_empty() {
            return Err(HyperError::InvalidOption("no methods given".to_string()));
        }
        let mut spaces = Spaces::new();
        for m in opts.methods.iter() {
            spaces.insert(m.clone(), methods.space(m)?.clone());
        }
        let mut sampler_opts = opts.sampler_opts.clone();
        if sampler_opts.seed.is_none() {
            sampler_opts.seed = opts.seed;
        }
        let sampler = samplers.init(&opts.optlib, &opts.methods, &spaces, &sampler_opts)?;
        let jitter = Normal::new(1.0, 1e-6).map_err(|e| HyperError::InvalidOption(e.to_string()))?;
        let rng = match opts.seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ 0x5DEE_CE66),
            None => StdRng::from_entropy(),
        };
        Ok(HyperOptimizer {
            opts,
            registry: Arc::new(methods),
            sampler,
            pool: None,
            pre_dispatch: 0,
            problem: None,
            jitter,
            rng,
            best_score: f64::INFINITY,
            best: None,
            history: Vec::new(),
        })
    }

    /// Run trials on `pool`, keeping up to `max(w + 4, 1.2 w)` in flight for
    /// `w` workers.
    pub fn with_pool(mut self, pool: Arc<dyn WorkerPool>) -> Self {
        let w = pool.num_workers();
        self.pre_dispatch = (w + 4).max((1.2 * w as f64) as usize);
        self.pool = Some(pool);
        self
    }

    pub fn options(&self) -> &HyperOptions {
        &self.opts
    }

    /// Compose the trial function for `problem`.
    fn setup(&self, problem: &ContractionProblem) -> Arc<dyn TrialFn> {
        let pipeline = Pipeline {
            slicing_opts: self.opts.slicing_opts.clone(),
            slicing_reconf_opts: self.opts.slicing_reconf_opts.clone(),
            reconf_opts: self.opts.reconf_opts.clone(),
        };
        Arc::from(build_trial_fn(
            Arc::clone(&self.registry),
            tree_kind(&self.opts, problem),
            &pipeline,
            &self.opts.minimize,
            self.opts.score_compression,
        ))
    }

    fn check_problem(&mut self, problem: &ContractionProblem) -> Result<Arc<ContractionProblem>> {
        match &self.problem {
            Some(p) if **p != *problem => Err(HyperError::ProblemMismatch),
            Some(p) => Ok(Arc::clone(p)),
            None => {
                let p = Arc::new(problem.clone());
                self.problem = Some(Arc::clone(&p));
                Ok(p)
            }
        }
    }

    fn report(&mut self, trial: Trial) {
        let score = trial.score * self.jitter.sample(&mut self.rng);
        let new_best = score < self.best_score;
        if new_best {
            self.best_score = score;
        }
        // past the training epoch only fit the sampler on improvements
        let training = self.opts.max_training_steps.map_or(true, |m| self.history.len() < m);
        if training || new_best {
            self.sampler.report_result(&trial.setting, &trial, score);
        }

        self.history.push(TrialRecord {
            method: trial.setting.method.clone(),
            params: trial.setting.params.clone(),
            seed: trial.setting.seed,
            flops: trial.flops,
            write: trial.write,
            size: trial.size,
            score: trial.score,
        });

        if self.best.as_ref().map_or(true, |b| trial.score < b.score) {
            let msg = format!(
                "new best after {} trials: {} log2[SIZE]={:.2} log10[FLOPS]={:.2}",
                self.history.len(),
                trial.setting.method,
                log2(trial.size),
                trial.flops.max(1.0).log10()
            );
            if self.opts.progbar {
                info!("{}", msg);
            } else {
                debug!("{}", msg);
            }
            self.best = Some(trial);
        }
    }

    fn reached_time_limit(&self, t0: Instant) -> bool {
        let elapsed = t0.elapsed().as_secs_f64();
        match self.opts.max_time {
            None => false,
            Some(MaxTime::Seconds(limit)) => elapsed > limit,
            Some(MaxTime::Rate(rate)) => {
                let best_flops = self.best.as_ref().map_or(f64::INFINITY, |b| b.flops);
                elapsed > best_flops / rate
            }
        }
    }

    fn search_sequential(&mut self, trial_fn: &Arc<dyn TrialFn>, problem: &Arc<ContractionProblem>, t0: Instant) -> Result<()> {
        for _ in 0..self.opts.max_repeats {
            let setting = self.sampler.get_setting();
            let trial = trial_fn.run(problem, &setting)?;
            self.report(trial);
            if self.reached_time_limit(t0) {
                break;
            }
        }
        Ok(())
    }

    fn submit(pool: &Arc<dyn WorkerPool>, trial_fn: &Arc<dyn TrialFn>, problem: &Arc<ContractionProblem>, setting: Setting) -> TrialFuture {
        let trial_fn = Arc::clone(trial_fn);
        let problem = Arc::clone(problem);
        pool.submit(Box::new(move || trial_fn.run(&problem, &setting)))
    }

    fn search_parallel(
        &mut self,
        pool: &Arc<dyn WorkerPool>,
        trial_fn: &Arc<dyn TrialFn>,
        problem: &Arc<ContractionProblem>,
        pending: &mut Vec<TrialFuture>,
        t0: Instant,
    ) -> Result<()> {
        let mut submitted = 0;
        while submitted < self.opts.max_repeats || !pending.is_empty() {
            if submitted < self.opts.max_repeats && pending.len() < self.pre_dispatch {
                let setting = self.sampler.get_setting();
                pending.push(Self::submit(pool, trial_fn, problem, setting));
                submitted += 1;
                continue;
            }
            let trial = next_completed(pending)?;
            self.report(trial);
            if self.reached_time_limit(t0) {
                break;
            }
        }
        Ok(())
    }

    /// Run up to `max_repeats` more trials on `problem` and return the best
    /// tree found so far.
    pub fn search(&mut self, problem: &ContractionProblem) -> Result<ContractionTree> {
        let problem = self.check_problem(problem)?;
        let trial_fn = self.setup(&problem);
        let t0 = Instant::now();

        match self.pool.clone() {
            None => self.search_sequential(&trial_fn, &problem, t0)?,
            Some(pool) => {
                let mut pending = Vec::new();
                let res = self.search_parallel(&pool, &trial_fn, &problem, &mut pending, t0);
                // anything still in flight is abandoned
                for future in pending.iter() {
                    future.cancel();
                }
                res?;
            }
        }
        Ok(self.tree()?.clone())
    }

    /// The best tree found.
    pub fn tree(&self) -> Result<&ContractionTree> {
        self.best.as_ref().map(|t| &t.tree).ok_or(HyperError::NoTrials)
    }

    /// The best path found, in linear form.
    pub fn path(&self) -> Result<LinearPath> {
        Ok(self.tree()?.path())
    }

    pub fn best(&self) -> Option<&Trial> {
        self.best.as_ref()
    }

    /// Every finished trial, in completion order.
    pub fn history(&self) -> &[TrialRecord] {
        &self.history
    }

    pub fn scores(&self) -> Vec<f64> {
        self.history.iter().map(|r| r.score).collect()
    }

    pub fn costs_flops(&self) -> Vec<f64> {
        self.history.iter().map(|r| r.flops).collect()
    }

    pub fn costs_write(&self) -> Vec<f64> {
        self.history.iter().map(|r| r.write).collect()
    }

    pub fn costs_size(&self) -> Vec<f64> {
        self.history.iter().map(|r| r.size).collect()
    }

    pub fn get_trials(&self, sort: Option<TrialSort>) -> Vec<&TrialRecord> {
        let mut trials: Vec<&TrialRecord> = self.history.iter().collect();
        match sort {
            None => {}
            Some(TrialSort::Method) => trials.sort_by(|a, b| a.method.cmp(&b.method)),
            Some(s) => trials.sort_by(|a, b| s.key(a).total_cmp(&s.key(b))),
        }
        trials
    }

    /// A plain text table of the trials.
    pub fn format_trials(&self, sort: Option<TrialSort>) -> String {
        let mut out = format!(
            "{:>18} {:>11} {:>12} {:>12}    {}\n",
            "METHOD", "log2[SIZE]", "log10[FLOPS]", "log10[WRITE]", "PARAMS"
        );
        for r in self.get_trials(sort) {
            let params: Vec<String> = r.params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            let _ = writeln!(
                out,
                "{:>18} {:>11.2} {:>12.2} {:>12.2}    {}",
                r.method,
                log2(r.size),
                r.flops.max(1.0).log10(),
                r.write.max(1.0).log10(),
                params.join(", ")
            );
        }
        out
    }

    /// The trial history as a JSON array.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.history)?)
    }
}

/// Remove and return the earliest submitted future that has finished,
/// blocking until one has.
fn next_completed(pending: &mut Vec<TrialFuture>) -> Result<Trial> {
    loop {
        for i in 0..pending.len() {
            if let Some(res) = pending[i].try_result() {
                pending.remove(i);
                return res;
            }
        }
        let mut sel = Select::new();
        for future in pending.iter() {
            sel.recv(future.receiver());
        }
        sel.ready();
    }
}

impl PathOptimizer for HyperOptimizer {
    fn optimize(&mut self, problem: &ContractionProblem) -> Result<LinearPath> {
        self.search(problem)?;
        self.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::ImmediatePool;
    use crate::tree::ContractionTree;
    use itertools::Itertools;

    fn chain() -> ContractionProblem {
        ContractionProblem::from_equation("ab,bc,cd->ad", [('a', 2), ('b', 3), ('c', 4), ('d', 5)]).unwrap()
    }

    fn lattice() -> ContractionProblem {
        ContractionProblem::from_equation(
            "ab,acd,ce,bfg,dfhi,ehj,gk,ikl,jl->",
            "abcdefghijkl".chars().zip([2, 3, 4, 2, 3, 4, 2, 3, 4, 2, 3, 4]),
        )
        .unwrap()
    }

    fn opts(max_repeats: usize) -> HyperOptions {
        HyperOptions {
            methods: vec!["greedy".into(), "greedy-compressed".into(), "greedy-span".into()],
            max_repeats,
            seed: Some(7),
            ..Default::default()
        }
    }

    #[test]
    fn chain_matches_brute_force() {
        let p = chain();
        let mut opt = HyperOptimizer::new(HyperOptions {
            max_repeats: 32,
            seed: Some(0),
            ..Default::default()
        })
        .unwrap();
        let tree = opt.search(&p).unwrap();
        assert_eq!(tree.intermediates().len(), 2);

        let shared = Arc::new(p.clone());
        let brute = [[0, 1], [0, 2], [1, 2]]
            .iter()
            .map(|&[i, j]| {
                let path = vec![vec![i, j], vec![0, 1]];
                ContractionTree::from_linear_path(Arc::clone(&shared), &path).unwrap().total_flops()
            })
            .fold(f64::INFINITY, f64::min);
        assert_eq!(tree.total_flops(), brute);
        assert_eq!(opt.path().unwrap().len(), 2);
    }

    #[test]
    fn best_never_gets_worse() {
        let mut opt = HyperOptimizer::new(opts(24)).unwrap();
        opt.search(&lattice()).unwrap();
        let scores = opt.scores();
        assert_eq!(scores.len(), 24);
        let running_best: Vec<f64> = scores
            .iter()
            .scan(f64::INFINITY, |b, &s| {
                *b = b.min(s);
                Some(*b)
            })
            .collect();
        assert!(running_best.windows(2).all(|w| w[1] <= w[0]));
        assert_eq!(opt.best().unwrap().score, *running_best.last().unwrap());
    }

    #[test]
    fn searches_extend_history() {
        let p = lattice();
        let mut opt = HyperOptimizer::new(opts(5)).unwrap();
        opt.search(&p).unwrap();
        opt.search(&p).unwrap();
        assert_eq!(opt.history().len(), 10);
        assert!(matches!(opt.search(&chain()), Err(HyperError::ProblemMismatch)));
    }

    #[test]
    fn parallel_mock_matches_sequential() {
        let p = lattice();
        let mut seq = HyperOptimizer::new(opts(5)).unwrap();
        seq.search(&p).unwrap();
        let mut par = HyperOptimizer::new(opts(5))
            .unwrap()
            .with_pool(Arc::new(ImmediatePool { num_workers: 2 }));
        par.search(&p).unwrap();

        let key = |r: &TrialRecord| (r.method.clone(), r.seed);
        let a: Vec<(String, u64)> = seq.history().iter().map(key).sorted().collect();
        let b: Vec<(String, u64)> = par.history().iter().map(key).sorted().collect();
        assert_eq!(a, b);
        let (sb, pb) = (seq.best().unwrap(), par.best().unwrap());
        assert_eq!(sb.score, pb.score);
        assert_eq!(sb.tree.ssa_path(), pb.tree.ssa_path());
    }

    #[test]
    fn thread_pool_runs_all_trials() {
        let p = lattice();
        let mut opt = HyperOptimizer::new(HyperOptions {
            num_workers: 2,
            ..opts(12)
        })
        .unwrap();
        opt.search(&p).unwrap();
        assert_eq!(opt.history().len(), 12);
        assert!(opt.tree().unwrap().total_flops() > 0.0);
    }

    #[test]
    fn zero_max_time_stops_early() {
        let mut opt = HyperOptimizer::new(HyperOptions {
            max_time: Some(MaxTime::Seconds(0.0)),
            ..opts(50)
        })
        .unwrap();
        opt.search(&lattice()).unwrap();
        let n = opt.history().len();
        assert!(n >= 1 && n < 50);

        // a tiny rate means contraction would take forever, so keep going
        let mut opt = HyperOptimizer::new(HyperOptions {
            max_time: Some(MaxTime::Rate(1e-30)),
            ..opts(6)
        })
        .unwrap();
        opt.search(&lattice()).unwrap();
        assert_eq!(opt.history().len(), 6);
    }

    #[test]
    fn options_from_json() {
        let opts = HyperOptions::from_json(
            r#"{
                "methods": ["greedy-span"],
                "minimize": "combo-256",
                "max_time": "rate:1e9",
                "slicing_opts": {"target_size": 1024},
                "reconf_opts": {"subtree_size": 6},
                "optlib": "random"
            }"#,
        )
        .unwrap();
        assert_eq!(opts.max_time, Some(MaxTime::Rate(1e9)));
        assert!(matches!(opts.minimize, Minimize::Combo(f) if f == 256.0));
        assert_eq!(opts.slicing_opts.unwrap().target_size, Some(1024.0));
        assert_eq!(opts.reconf_opts.unwrap().subtree_size, 6);
        assert_eq!(opts.max_repeats, 128);
        assert_eq!("12.5".parse::<MaxTime>().unwrap(), MaxTime::Seconds(12.5));
        assert!("speed:3".parse::<MaxTime>().is_err());
        assert!(HyperOptions::from_json(r#"{"max_time": "soon"}"#).is_err());
    }

    #[test]
    fn post_processing_and_reports() {
        let p = lattice();
        let mut opt = HyperOptimizer::new(HyperOptions {
            minimize: "size".parse().unwrap(),
            slicing_opts: Some(SliceOptions {
                target_size: Some(16.0),
                ..Default::default()
            }),
            reconf_opts: Some(ReconfOptions::default()),
            max_training_steps: Some(2),
            ..opts(6)
        })
        .unwrap();
        let tree = opt.search(&p).unwrap();
        assert!(tree.max_size() <= 16.0);
        assert!(opt.best().unwrap().original_size.is_some());

        let by_flops = opt.get_trials(Some(TrialSort::Flops));
        assert!(by_flops.windows(2).all(|w| w[0].flops.log2() <= w[1].flops.log2() + 0.1));
        let table = opt.format_trials(Some(TrialSort::Method));
        assert_eq!(table.lines().count(), 7);
        let json: serde_json::Value = serde_json::from_str(&opt.to_json().unwrap()).unwrap();
        assert_eq!(json.as_array().unwrap().len(), 6);
    }

    #[test]
    fn compressed_target_and_unknown_method() {
        let p = lattice();
        let mut opt = HyperOptimizer::new(HyperOptions {
            methods: vec!["greedy-compressed".into()],
            minimize: Minimize::PeakCompressed,
            compress_chi: Some(4),
            ..opts(4)
        })
        .unwrap();
        let tree = opt.search(&p).unwrap();
        assert_eq!(tree.kind(), TreeKind::Compressed { chi: 4 });

        let err = HyperOptimizer::new(HyperOptions {
            methods: vec!["kahypar".into()],
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, HyperError::UnknownMethod(_)));
    }
}
