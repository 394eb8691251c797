//! Hyper-parameter spaces and the settings drawn from them.

use std::collections::BTreeMap;
use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{HyperError, Result};

/// The declared range of a single hyper-parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum ParamSpec {
    Bool,
    Int { min: i64, max: i64 },
    Float { min: f64, max: f64 },
    /// Sampled uniformly in log space, bounds must be positive.
    #[serde(rename = "FLOAT_EXP")]
    FloatExp { min: f64, max: f64 },
    String { options: Vec<String> },
}

/// A concrete hyper-parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Int(i) => write!(f, "{}", i),
            ParamValue::Float(x) => write!(f, "{:.4}", x),
            ParamValue::Str(s) => write!(f, "'{}'", s),
        }
    }
}

pub type Params = BTreeMap<String, ParamValue>;
/// Parameter name to spec for one method.
pub type Space = BTreeMap<String, ParamSpec>;

/// A method together with the parameters to run it with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setting {
    pub method: String,
    pub params: Params,
    /// Seed for any randomness inside the method.
    pub seed: u64,
}

impl ParamSpec {
    /// Number of discrete choices, `None` for continuous parameters.
    pub fn num_choices(&self) -> Option<usize> {
        match self {
            ParamSpec::Bool => Some(2),
            ParamSpec::String { options } => Some(options.len()),
            _ => None,
        }
    }

    /// The value of discrete choice `k`.
    pub fn choice(&self, k: usize) -> ParamValue {
        match self {
            ParamSpec::Bool => ParamValue::Bool(k == 1),
            ParamSpec::String { options } => ParamValue::Str(options.get(k).cloned().unwrap_or_default()),
            _ => self.from_unit(0.5),
        }
    }

    /// Index of `value` among the discrete choices.
    pub fn choice_index(&self, value: &ParamValue) -> Option<usize> {
        match (self, value) {
            (ParamSpec::Bool, ParamValue::Bool(b)) => Some(*b as usize),
            (ParamSpec::String { options }, ParamValue::Str(s)) => options.iter().position(|o| o == s),
            _ => None,
        }
    }

    /// Map a continuous value into `[0, 1]`.
    pub fn to_unit(&self, value: &ParamValue) -> Option<f64> {
        let x = match value {
            ParamValue::Int(i) => *i as f64,
            ParamValue::Float(x) => *x,
            _ => return None,
        };
        let u = match *self {
            ParamSpec::Int { min, max } => (x - min as f64 + 0.5) / ((max - min) as f64 + 1.0),
            ParamSpec::Float { min, max } => {
                if max > min {
                    (x - min) / (max - min)
                } else {
                    0.5
                }
            }
            ParamSpec::FloatExp { min, max } => {
                if max > min {
                    (x.ln() - min.ln()) / (max.ln() - min.ln())
                } else {
                    0.5
                }
            }
            _ => return None,
        };
        Some(u.clamp(0.0, 1.0))
    }

    /// Inverse of [`ParamSpec::to_unit`], clamping to the bounds.
    pub fn from_unit(&self, u: f64) -> ParamValue {
        let u = u.clamp(0.0, 1.0);
        match *self {
            ParamSpec::Int { min, max } => {
                let span = (max - min) as f64 + 1.0;
                let x = min + (u * span).floor() as i64;
                ParamValue::Int(x.clamp(min, max))
            }
            ParamSpec::Float { min, max } => ParamValue::Float(min + u * (max - min)),
            ParamSpec::FloatExp { min, max } => ParamValue::Float((min.ln() + u * (max.ln() - min.ln())).exp()),
            ParamSpec::Bool => ParamValue::Bool(u >= 0.5),
            ParamSpec::String { ref options } => {
                let k = ((u * options.len() as f64) as usize).min(options.len().saturating_sub(1));
                ParamValue::Str(options.get(k).cloned().unwrap_or_default())
            }
        }
    }

    /// Draw a value uniformly (in log space for `FloatExp`).
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ParamValue {
        match self.num_choices() {
            Some(k) if k > 0 => self.choice(rng.gen_range(0..k)),
            _ => self.from_unit(rng.gen::<f64>()),
        }
    }

    /// Check that the spec itself is well formed.
    pub fn check(&self, name: &str) -> Result<()> {
        let bad = |reason: &str| {
            Err(HyperError::InvalidParam {
                name: name.to_string(),
                reason: reason.to_string(),
            })
        };
        match self {
            ParamSpec::Int { min, max } if min > max => bad("min exceeds max"),
            ParamSpec::Float { min, max } if min > max => bad("min exceeds max"),
            ParamSpec::FloatExp { min, max } if min > max || *min <= 0.0 => bad("bounds must be positive and ordered"),
            ParamSpec::String { options } if options.is_empty() => bad("no options"),
            _ => Ok(()),
        }
    }
}

fn wrong_type(name: &str, value: &ParamValue, expected: &str) -> HyperError {
    HyperError::InvalidParam {
        name: name.to_string(),
        reason: format!("expected {}, got {:?}", expected, value),
    }
}

/// Typed lookups with defaults for missing parameters.
pub trait ParamAccess {
    fn float_or(&self, name: &str, default: f64) -> Result<f64>;
    fn int_or(&self, name: &str, default: i64) -> Result<i64>;
    fn bool_or(&self, name: &str, default: bool) -> Result<bool>;
    fn str_or<'a>(&'a self, name: &str, default: &'a str) -> Result<&'a str>;
}

impl ParamAccess for Params {
    fn float_or(&self, name: &str, default: f64) -> Result<f64> {
        match self.get(name) {
            None => Ok(default),
            Some(ParamValue::Float(x)) => Ok(*x),
            Some(ParamValue::Int(i)) => Ok(*i as f64),
            Some(v) => Err(wrong_type(name, v, "a number")),
        }
    }

    fn int_or(&self, name: &str, default: i64) -> Result<i64> {
        match self.get(name) {
            None => Ok(default),
            Some(ParamValue::Int(i)) => Ok(*i),
            Some(ParamValue::Float(x)) if x.fract() == 0.0 => Ok(*x as i64),
            Some(v) => Err(wrong_type(name, v, "an integer")),
        }
    }

    fn bool_or(&self, name: &str, default: bool) -> Result<bool> {
        match self.get(name) {
            None => Ok(default),
            Some(ParamValue::Bool(b)) => Ok(*b),
            Some(ParamValue::Int(i)) if *i == 0 || *i == 1 => Ok(*i == 1),
            Some(v) => Err(wrong_type(name, v, "a bool")),
        }
    }

    fn str_or<'a>(&'a self, name: &str, default: &'a str) -> Result<&'a str> {
        match self.get(name) {
            None => Ok(default),
            Some(ParamValue::Str(s)) => Ok(s.as_str()),
            Some(v) => Err(wrong_type(name, v, "a string")),
        }
    }
}
