use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::HyperError;
use crate::trial::Trial;

pub(crate) const DEFAULT_FACTOR: f64 = 64.0;

/// Per-contraction cost minimized by the exact kernel and by subtree
/// reconfiguration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LocalCost {
    Flops,
    Max,
    Size,
    Write,
    Combo(f64),
    Limit(f64),
}

impl LocalCost {
    /// Relative weight of writes to flops for `combo` and `limit`.
    pub fn factor(&self) -> f64 {
        match *self {
            LocalCost::Combo(f) | LocalCost::Limit(f) => f,
            _ => DEFAULT_FACTOR,
        }
    }
}

/// parse `name` or `name-F` into the factor `F`
fn parse_factor(s: &str, name: &str) -> Option<Result<f64, HyperError>> {
    if s == name {
        return Some(Ok(DEFAULT_FACTOR));
    }
    let rest = s.strip_prefix(name)?.strip_prefix('-')?;
    Some(
        rest.parse::<f64>()
            .map_err(|_| HyperError::InvalidOption(format!("bad factor in '{}'", s))),
    )
}

impl FromStr for LocalCost {
    type Err = HyperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flops" => Ok(LocalCost::Flops),
            "max" => Ok(LocalCost::Max),
            "size" => Ok(LocalCost::Size),
            "write" => Ok(LocalCost::Write),
            _ => {
                if let Some(f) = parse_factor(s, "combo") {
                    return f.map(LocalCost::Combo);
                }
                if let Some(f) = parse_factor(s, "limit") {
                    return f.map(LocalCost::Limit);
                }
                Err(HyperError::InvalidOption(format!("unknown local cost '{}'", s)))
            }
        }
    }
}

impl fmt::Display for LocalCost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalCost::Flops => write!(f, "flops"),
            LocalCost::Max => write!(f, "max"),
            LocalCost::Size => write!(f, "size"),
            LocalCost::Write => write!(f, "write"),
            LocalCost::Combo(x) => write!(f, "combo-{}", x),
            LocalCost::Limit(x) => write!(f, "limit-{}", x),
        }
    }
}

impl TryFrom<String> for LocalCost {
    type Error = HyperError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<LocalCost> for String {
    fn from(c: LocalCost) -> String {
        c.to_string()
    }
}

/// User supplied scoring function, lower is better.
pub type ScoreFn = Arc<dyn Fn(&Trial) -> f64 + Send + Sync>;

/// What a search minimizes. Built-in targets score as `log2` of the cost.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Minimize {
    Flops,
    Size,
    Write,
    Combo(f64),
    Limit(f64),
    Peak,
    MaxCompressed,
    PeakCompressed,
    TotalCompressed,
    Custom(ScoreFn),
}

impl Default for Minimize {
    fn default() -> Self {
        Minimize::Flops
    }
}

impl fmt::Debug for Minimize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Minimize({})", self)
    }
}

impl fmt::Display for Minimize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Minimize::Flops => write!(f, "flops"),
            Minimize::Size => write!(f, "size"),
            Minimize::Write => write!(f, "write"),
            Minimize::Combo(x) => write!(f, "combo-{}", x),
            Minimize::Limit(x) => write!(f, "limit-{}", x),
            Minimize::Peak => write!(f, "peak"),
            Minimize::MaxCompressed => write!(f, "max-compressed"),
            Minimize::PeakCompressed => write!(f, "peak-compressed"),
            Minimize::TotalCompressed => write!(f, "total-compressed"),
            Minimize::Custom(_) => write!(f, "custom"),
        }
    }
}

impl FromStr for Minimize {
    type Err = HyperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flops" => Ok(Minimize::Flops),
            "size" => Ok(Minimize::Size),
            "write" => Ok(Minimize::Write),
            "peak" => Ok(Minimize::Peak),
            "max-compressed" => Ok(Minimize::MaxCompressed),
            "peak-compressed" => Ok(Minimize::PeakCompressed),
            "total-compressed" => Ok(Minimize::TotalCompressed),
            _ => match s.parse::<LocalCost>() {
                Ok(LocalCost::Combo(f)) => Ok(Minimize::Combo(f)),
                Ok(LocalCost::Limit(f)) => Ok(Minimize::Limit(f)),
                _ => Err(HyperError::InvalidOption(format!("unknown minimize target '{}'", s))),
            },
        }
    }
}

impl TryFrom<String> for Minimize {
    type Error = HyperError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Minimize> for String {
    fn from(m: Minimize) -> String {
        m.to_string()
    }
}

fn log2(x: f64) -> f64 {
    x.max(1.0).log2()
}

impl Minimize {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Trial) -> f64 + Send + Sync + 'static,
    {
        Minimize::Custom(Arc::new(f))
    }

    /// Whether trees should be costed with compressed accounting.
    pub fn is_compressed(&self) -> bool {
        matches!(
            self,
            Minimize::MaxCompressed | Minimize::PeakCompressed | Minimize::TotalCompressed
        )
    }

    /// The closest per-contraction cost, for local re-optimization.
    pub fn local_cost(&self) -> LocalCost {
        match *self {
            Minimize::Flops => LocalCost::Flops,
            Minimize::Size | Minimize::Peak | Minimize::MaxCompressed | Minimize::PeakCompressed => LocalCost::Size,
            Minimize::Write | Minimize::TotalCompressed => LocalCost::Write,
            Minimize::Combo(f) => LocalCost::Combo(f),
            Minimize::Limit(f) => LocalCost::Limit(f),
            Minimize::Custom(_) => LocalCost::Combo(DEFAULT_FACTOR),
        }
    }

    /// Score a finished trial, lower is better.
    pub fn score(&self, trial: &Trial) -> f64 {
        match self {
            Minimize::Flops => log2(trial.flops),
            Minimize::Size | Minimize::MaxCompressed => log2(trial.size),
            Minimize::Write | Minimize::TotalCompressed => log2(trial.write),
            Minimize::Combo(f) => log2(trial.flops + f * trial.write),
            Minimize::Limit(f) => log2(trial.tree.total_cost_limit(*f)),
            Minimize::Peak | Minimize::PeakCompressed => log2(trial.tree.peak_size()),
            Minimize::Custom(score_fn) => score_fn(trial),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_local_costs() {
        assert_eq!("flops".parse::<LocalCost>().unwrap(), LocalCost::Flops);
        assert_eq!("combo".parse::<LocalCost>().unwrap(), LocalCost::Combo(64.0));
        assert_eq!("limit-256".parse::<LocalCost>().unwrap(), LocalCost::Limit(256.0));
        assert!("combo-x".parse::<LocalCost>().is_err());
        assert!("nope".parse::<LocalCost>().is_err());
    }

    #[test]
    fn parse_minimize() {
        assert!(matches!("combo-128".parse::<Minimize>().unwrap(), Minimize::Combo(f) if f == 128.0));
        assert!("peak-compressed".parse::<Minimize>().unwrap().is_compressed());
        assert!(!"peak".parse::<Minimize>().unwrap().is_compressed());
        assert!("max".parse::<Minimize>().is_err());
        assert_eq!(Minimize::TotalCompressed.local_cost(), LocalCost::Write);
    }

    #[test]
    fn minimize_serde_roundtrip() {
        let m: Minimize = serde_json::from_str("\"limit-32\"").unwrap();
        assert_eq!(serde_json::to_string(&m).unwrap(), "\"limit-32\"");
    }
}
