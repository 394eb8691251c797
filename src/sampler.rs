//! Samplers choose which method and hyper-parameters to try next and learn
//! from the scores reported back.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use log::warn;
use rand::distributions::WeightedIndex;
use rand::prelude::Distribution;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::error::{HyperError, Result};
use crate::space::{ParamSpec, ParamValue, Params, Setting, Space};
use crate::trial::Trial;

/// Proposes settings and is told how they scored. Only ever driven from the
/// optimizer's control thread.
pub trait Sampler: Send {
    fn get_setting(&mut self) -> Setting;

    fn report_result(&mut self, setting: &Setting, trial: &Trial, score: f64);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerOptions {
    pub seed: Option<u64>,
    /// Purely random settings before the model is used.
    pub n_startup: usize,
    /// Fraction of reported scores counted as good.
    pub gamma: f64,
    /// Candidates drawn from the good model per proposal.
    pub n_candidates: usize,
    /// Weight of the uniform prior mixed into every density.
    pub prior_weight: f64,
    /// Kernel width in the unit interval.
    pub bandwidth: f64,
}

impl Default for SamplerOptions {
    fn default() -> Self {
        SamplerOptions {
            seed: None,
            n_startup: 10,
            gamma: 0.25,
            n_candidates: 24,
            prior_weight: 1.0,
            bandwidth: 0.15,
        }
    }
}

/// Per-method search spaces, keyed by method name.
pub type Spaces = BTreeMap<String, Space>;

pub type SamplerInit = Arc<dyn Fn(&[String], &Spaces, &SamplerOptions) -> Result<Box<dyn Sampler>> + Send + Sync>;

/// Sampler backends by name.
#[derive(Clone)]
pub struct SamplerRegistry {
    backends: BTreeMap<String, SamplerInit>,
}

impl fmt::Debug for SamplerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamplerRegistry")
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}

const FALLBACK: &str = "random";

impl SamplerRegistry {
    pub fn register(&mut self, name: &str, init: SamplerInit) {
        self.backends.insert(name.to_string(), init);
    }

    pub fn names(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    /// Build the sampler `name`; an unknown name warns and falls back to
    /// random sampling.
    pub fn init(&self, name: &str, methods: &[String], spaces: &Spaces, opts: &SamplerOptions) -> Result<Box<dyn Sampler>> {
        if methods.is_empty() {
            return Err(HyperError::InvalidOption("no methods to sample from".to_string()));
        }
        match self.backends.get(name) {
            Some(init) => init(methods, spaces, opts),
            None => {
                warn!("unknown sampler '{}', falling back to '{}'", name, FALLBACK);
                Ok(Box::new(RandomSampler::new(methods, spaces, opts)))
            }
        }
    }
}

impl Default for SamplerRegistry {
    fn default() -> Self {
        let mut reg = SamplerRegistry {
            backends: BTreeMap::new(),
        };
        reg.register(
            "random",
            Arc::new(|methods: &[String], spaces: &Spaces, opts: &SamplerOptions| {
                Ok(Box::new(RandomSampler::new(methods, spaces, opts)) as Box<dyn Sampler>)
            }),
        );
        reg.register(
            "tpe",
            Arc::new(|methods: &[String], spaces: &Spaces, opts: &SamplerOptions| {
                Ok(Box::new(TpeSampler::new(methods, spaces, opts)) as Box<dyn Sampler>)
            }),
        );
        reg
    }
}

fn make_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

fn sample_params(space: &Space, rng: &mut StdRng) -> Params {
    space.iter().map(|(k, spec)| (k.clone(), spec.sample(rng))).collect()
}

/// Uniform sampling over methods and parameters.
pub struct RandomSampler {
    methods: Vec<String>,
    spaces: Spaces,
    rng: StdRng,
}

impl RandomSampler {
    pub fn new(methods: &[String], spaces: &Spaces, opts: &SamplerOptions) -> Self {
        RandomSampler {
            methods: methods.to_vec(),
            spaces: spaces.clone(),
            rng: make_rng(opts.seed),
        }
    }
}

impl Sampler for RandomSampler {
    fn get_setting(&mut self) -> Setting {
        let method = self.methods[self.rng.gen_range(0..self.methods.len())].clone();
        let params = match self.spaces.get(&method) {
            Some(space) => sample_params(space, &mut self.rng),
            None => Params::new(),
        };
        Setting {
            method,
            params,
            seed: self.rng.gen(),
        }
    }

    fn report_result(&mut self, _setting: &Setting, _trial: &Trial, _score: f64) {}
}

/// Tree-structured Parzen estimator. Reported scores are split at the
/// `gamma` quantile into good and bad; methods are drawn in proportion to
/// their smoothed share of good results and parameters are the candidate
/// maximizing `l(x) / g(x)`, treating each parameter independently.
pub struct TpeSampler {
    methods: Vec<String>,
    spaces: Spaces,
    opts: SamplerOptions,
    rng: StdRng,
    /// (params, score) per method
    history: BTreeMap<String, Vec<(Params, f64)>>,
    scores: Vec<f64>,
}

impl TpeSampler {
    pub fn new(methods: &[String], spaces: &Spaces, opts: &SamplerOptions) -> Self {
        TpeSampler {
            methods: methods.to_vec(),
            spaces: spaces.clone(),
            opts: opts.clone(),
            rng: make_rng(opts.seed),
            history: methods.iter().map(|m| (m.clone(), Vec::new())).collect(),
            scores: Vec::new(),
        }
    }

    /// Scores at or below this are good.
    fn threshold(&self) -> f64 {
        let mut sorted = self.scores.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let k = ((self.opts.gamma * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
        sorted[k - 1]
    }

    fn choose_method(&mut self, threshold: f64) -> String {
        let prior = self.opts.prior_weight.max(1e-9);
        let weights: Vec<f64> = self
            .methods
            .iter()
            .map(|m| {
                let results = self.history.get(m).map(|h| h.as_slice()).unwrap_or(&[]);
                let good = results.iter().filter(|(_, s)| *s <= threshold).count() as f64;
                (good + prior) / (results.len() as f64 + 2.0 * prior)
            })
            .collect();
        match WeightedIndex::new(&weights) {
            Ok(dist) => self.methods[dist.sample(&mut self.rng)].clone(),
            Err(_) => self.methods[self.rng.gen_range(0..self.methods.len())].clone(),
        }
    }

    fn choose_params(&mut self, method: &str, threshold: f64) -> Params {
        let Some(space) = self.spaces.get(method) else {
            return Params::new();
        };
        let results = self.history.get(method).map(|h| h.as_slice()).unwrap_or(&[]);
        let (good, bad): (Vec<&(Params, f64)>, Vec<&(Params, f64)>) =
            results.iter().partition(|(_, s)| *s <= threshold);
        if good.is_empty() || bad.is_empty() {
            return sample_params(space, &mut self.rng);
        }

        let mut best: Option<(f64, Params)> = None;
        for _ in 0..self.opts.n_candidates.max(1) {
            let mut candidate = Params::new();
            let mut log_ratio = 0.0;
            for (name, spec) in space.iter() {
                let good_obs = observations(&good, name);
                let bad_obs = observations(&bad, name);
                let value = propose(spec, &good_obs, &self.opts, &mut self.rng);
                let l = density(spec, &value, &good_obs, &self.opts);
                let g = density(spec, &value, &bad_obs, &self.opts);
                log_ratio += l.ln() - g.ln();
                candidate.insert(name.clone(), value);
            }
            if best.as_ref().map_or(true, |(r, _)| log_ratio > *r) {
                best = Some((log_ratio, candidate));
            }
        }
        best.map(|(_, params)| params)
            .unwrap_or_else(|| sample_params(space, &mut self.rng))
    }
}

fn observations<'a>(results: &[&'a (Params, f64)], name: &str) -> Vec<&'a ParamValue> {
    results.iter().filter_map(|&r| r.0.get(name)).collect()
}

/// Draw from the Parzen mixture fitted to `obs`, including the uniform prior.
fn propose(spec: &ParamSpec, obs: &[&ParamValue], opts: &SamplerOptions, rng: &mut StdRng) -> ParamValue {
    let n = obs.len() as f64;
    if obs.is_empty() || rng.gen::<f64>() < opts.prior_weight / (n + opts.prior_weight) {
        return spec.sample(rng);
    }
    let centre = obs[rng.gen_range(0..obs.len())];
    match spec.num_choices() {
        Some(_) => centre.clone(),
        None => match spec.to_unit(centre) {
            Some(u) => {
                let z: f64 = rng.sample(StandardNormal);
                spec.from_unit(u + opts.bandwidth * z)
            }
            None => spec.sample(rng),
        },
    }
}

fn density(spec: &ParamSpec, value: &ParamValue, obs: &[&ParamValue], opts: &SamplerOptions) -> f64 {
    let n = obs.len() as f64;
    let w = opts.prior_weight;
    let d = match spec.num_choices() {
        Some(k) => {
            let k = k.max(1) as f64;
            let count = obs.iter().filter(|&&o| o == value).count() as f64;
            (count + w / k) / (n + w)
        }
        None => {
            let Some(u) = spec.to_unit(value) else {
                return 1.0;
            };
            let h = opts.bandwidth.max(1e-3);
            let norm = 1.0 / (h * (2.0 * std::f64::consts::PI).sqrt());
            let kernels: f64 = obs
                .iter()
                .filter_map(|o| spec.to_unit(o))
                .map(|ui| norm * (-0.5 * ((u - ui) / h).powi(2)).exp())
                .sum();
            // uniform prior on [0, 1] has density one
            (kernels + w) / (n + w)
        }
    };
    d.max(1e-300)
}

impl Sampler for TpeSampler {
    fn get_setting(&mut self) -> Setting {
        let (method, params) = if self.scores.len() < self.opts.n_startup.max(1) {
            let method = self.methods[self.rng.gen_range(0..self.methods.len())].clone();
            let params = match self.spaces.get(&method) {
                Some(space) => sample_params(space, &mut self.rng),
                None => Params::new(),
            };
            (method, params)
        } else {
            let threshold = self.threshold();
            let method = self.choose_method(threshold);
            let params = self.choose_params(&method, threshold);
            (method, params)
        };
        Setting {
            method,
            params,
            seed: self.rng.gen(),
        }
    }

    fn report_result(&mut self, setting: &Setting, _trial: &Trial, score: f64) {
        if !score.is_finite() {
            return;
        }
        self.scores.push(score);
        self.history
            .entry(setting.method.clone())
            .or_default()
            .push((setting.params.clone(), score));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::ContractionProblem;
    use crate::tree::ContractionTree;

    fn dummy_trial(setting: &Setting) -> Trial {
        let problem = Arc::new(ContractionProblem::from_equation("ab,bc->ac", [('a', 2), ('b', 2), ('c', 2)]).unwrap());
        let tree = ContractionTree::from_ssa_path(problem, &[vec![0, 1]]).unwrap();
        Trial::new(tree, setting.clone())
    }

    fn spaces() -> (Vec<String>, Spaces) {
        let methods = vec!["good".to_string(), "bad".to_string()];
        let x = Space::from([("x".to_string(), ParamSpec::Float { min: 0.0, max: 1.0 })]);
        let spaces = Spaces::from([("good".to_string(), x.clone()), ("bad".to_string(), x)]);
        (methods, spaces)
    }

    fn objective(setting: &Setting) -> f64 {
        let x = match setting.params["x"] {
            ParamValue::Float(x) => x,
            _ => unreachable!(),
        };
        let offset = if setting.method == "good" { 0.0 } else { 1.0 };
        offset + (x - 0.3).abs()
    }

    #[test]
    fn random_sampler_is_seeded() {
        let (methods, spaces) = spaces();
        let opts = SamplerOptions {
            seed: Some(5),
            ..Default::default()
        };
        let mut a = RandomSampler::new(&methods, &spaces, &opts);
        let mut b = RandomSampler::new(&methods, &spaces, &opts);
        for _ in 0..10 {
            assert_eq!(a.get_setting(), b.get_setting());
        }
    }

    #[test]
    fn tpe_prefers_the_better_region() {
        let (methods, spaces) = spaces();
        let opts = SamplerOptions {
            seed: Some(0),
            ..Default::default()
        };
        let mut tpe = TpeSampler::new(&methods, &spaces, &opts);
        let mut late_good = 0;
        let mut late_err = 0.0;
        for i in 0..120 {
            let setting = tpe.get_setting();
            let score = objective(&setting);
            if i >= 60 {
                late_good += (setting.method == "good") as usize;
                late_err += score;
            }
            tpe.report_result(&setting, &dummy_trial(&setting), score);
        }
        // uniform sampling would give about half of each and a mean score near 0.8
        assert!(late_good > 40, "{}", late_good);
        assert!(late_err / 60.0 < 0.6);
    }

    #[test]
    fn unknown_backend_falls_back() {
        let (methods, spaces) = spaces();
        let reg = SamplerRegistry::default();
        assert_eq!(reg.names(), vec!["random", "tpe"]);
        let mut sampler = reg.init("nevergrad", &methods, &spaces, &SamplerOptions::default()).unwrap();
        let setting = sampler.get_setting();
        assert!(methods.contains(&setting.method));
        assert!(reg.init("tpe", &[], &spaces, &SamplerOptions::default()).is_err());
    }

    #[test]
    fn discrete_density_is_smoothed() {
        let spec = ParamSpec::String {
            options: vec!["a".into(), "b".into()],
        };
        let a = ParamValue::Str("a".into());
        let b = ParamValue::Str("b".into());
        let obs = vec![&a, &a, &a];
        let opts = SamplerOptions::default();
        let da = density(&spec, &a, &obs, &opts);
        let db = density(&spec, &b, &obs, &opts);
        assert!((da + db - 1.0).abs() < 1e-12);
        assert!(da > db && db > 0.0);
    }
}
