use std::collections::BTreeSet;

use crate::error::{HyperError, Result};
use crate::Dict;

/// An index label, e.g. `"a"` or `"k12"`.
pub type Label = String;
/// Mapping of index label to dimension size.
pub type SizeDict = Dict<Label, u64>;

/// A validated contraction: operand label sets, the surviving output labels
/// and the dimension of every label.
///
/// Labels are interned to dense `u32` ids in order of first appearance, which
/// is the representation every search kernel works with internally.
#[derive(Debug, Clone, PartialEq)]
pub struct ContractionProblem {
    inputs: Vec<Vec<Label>>,
    output: Vec<Label>,
    size_dict: SizeDict,
    labels: Vec<Label>,
    ids: Dict<Label, u32>,
    terms: Vec<Vec<u32>>,
    out: Vec<u32>,
    sizes: Vec<u64>,
}

impl ContractionProblem {
    /// Validate and intern a contraction. Fails fast if any used label is
    /// missing from `size_dict`, has size zero, or if an output label is not
    /// carried by any input.
    pub fn new(inputs: Vec<Vec<Label>>, output: Vec<Label>, size_dict: SizeDict) -> Result<Self> {
        if inputs.is_empty() {
            return Err(HyperError::EmptyProblem);
        }

        let mut labels: Vec<Label> = Vec::new();
        let mut ids: Dict<Label, u32> = Dict::default();
        let mut sizes: Vec<u64> = Vec::new();
        let mut terms: Vec<Vec<u32>> = Vec::with_capacity(inputs.len());

        for term in inputs.iter() {
            let mut ixs: BTreeSet<u32> = BTreeSet::new();
            for label in term {
                let ix = match ids.get(label) {
                    Some(&ix) => ix,
                    None => {
                        let size = *size_dict.get(label).ok_or_else(|| HyperError::MissingSize {
                            label: label.clone(),
                        })?;
                        if size == 0 {
                            return Err(HyperError::InvalidSize {
                                label: label.clone(),
                                size,
                            });
                        }
                        let ix = labels.len() as u32;
                        labels.push(label.clone());
                        ids.insert(label.clone(), ix);
                        sizes.push(size);
                        ix
                    }
                };
                ixs.insert(ix);
            }
            terms.push(ixs.into_iter().collect());
        }

        let mut out: BTreeSet<u32> = BTreeSet::new();
        for label in output.iter() {
            if !size_dict.contains_key(label) {
                return Err(HyperError::MissingSize {
                    label: label.clone(),
                });
            }
            match ids.get(label) {
                Some(&ix) => {
                    out.insert(ix);
                }
                None => {
                    return Err(HyperError::OrphanOutputIndex {
                        label: label.clone(),
                    })
                }
            }
        }

        Ok(ContractionProblem {
            inputs,
            output,
            size_dict,
            labels,
            ids,
            terms,
            out: out.into_iter().collect(),
            sizes,
        })
    }

    /// Build a problem from an einsum style equation with single character
    /// labels, e.g. `"ab,bc,cd->ad"`. Without `->` the output is the sorted
    /// set of labels appearing exactly once.
    pub fn from_equation<I>(eq: &str, sizes: I) -> Result<Self>
    where
        I: IntoIterator<Item = (char, u64)>,
    {
        let eq: String = eq.chars().filter(|c| !c.is_whitespace()).collect();
        let (lhs, rhs) = match eq.split_once("->") {
            Some((lhs, rhs)) => (lhs.to_string(), Some(rhs.to_string())),
            None => (eq.clone(), None),
        };
        let inputs: Vec<Vec<Label>> = lhs
            .split(',')
            .map(|term| term.chars().map(String::from).collect())
            .collect();
        let output: Vec<Label> = match rhs {
            Some(rhs) => rhs.chars().map(String::from).collect(),
            None => {
                let mut counts: Dict<char, usize> = Dict::default();
                lhs.chars()
                    .filter(|&c| c != ',')
                    .for_each(|c| *counts.entry(c).or_insert(0) += 1);
                let mut once: Vec<char> = counts
                    .into_iter()
                    .filter(|&(_, n)| n == 1)
                    .map(|(c, _)| c)
                    .collect();
                once.sort_unstable();
                once.into_iter().map(String::from).collect()
            }
        };
        let size_dict: SizeDict = sizes.into_iter().map(|(c, d)| (c.to_string(), d)).collect();
        ContractionProblem::new(inputs, output, size_dict)
    }

    pub fn inputs(&self) -> &[Vec<Label>] {
        &self.inputs
    }

    pub fn output(&self) -> &[Label] {
        &self.output
    }

    pub fn size_dict(&self) -> &SizeDict {
        &self.size_dict
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_indices(&self) -> usize {
        self.labels.len()
    }

    /// Largest single dimension size.
    pub fn max_dim(&self) -> u64 {
        self.sizes.iter().copied().max().unwrap_or(1)
    }

    /// Interned index ids of each input, sorted and deduplicated.
    pub(crate) fn terms(&self) -> &[Vec<u32>] {
        &self.terms
    }

    /// Interned index ids of the output, sorted.
    pub(crate) fn out_ids(&self) -> &[u32] {
        &self.out
    }

    pub(crate) fn sizes(&self) -> &[u64] {
        &self.sizes
    }

    pub(crate) fn label(&self, ix: u32) -> &str {
        &self.labels[ix as usize]
    }

    pub(crate) fn index_of(&self, label: &str) -> Option<u32> {
        self.ids.get(label).copied()
    }

    /// Sizes keyed by interned id, in the form the contraction processor
    /// consumes.
    pub(crate) fn id_size_dict(&self) -> Dict<u32, f32> {
        self.sizes
            .iter()
            .enumerate()
            .map(|(ix, &d)| (ix as u32, d as f32))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes(pairs: &[(&str, u64)]) -> SizeDict {
        pairs.iter().map(|&(k, v)| (k.to_string(), v)).collect()
    }

    fn labels(xs: &[&str]) -> Vec<Label> {
        xs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn interns_in_order_of_appearance() {
        let p = ContractionProblem::new(
            vec![labels(&["b", "a"]), labels(&["a", "c", "a"])],
            labels(&["c"]),
            sizes(&[("a", 2), ("b", 3), ("c", 4)]),
        )
        .unwrap();
        assert_eq!(p.index_of("b"), Some(0));
        assert_eq!(p.index_of("a"), Some(1));
        assert_eq!(p.terms(), &[vec![0, 1], vec![1, 2]]);
        assert_eq!(p.out_ids(), &[2]);
        assert_eq!(p.max_dim(), 4);
    }

    #[test]
    fn missing_size_fails_fast() {
        let err = ContractionProblem::new(
            vec![labels(&["a", "b"]), labels(&["b"])],
            vec![],
            sizes(&[("a", 2)]),
        )
        .unwrap_err();
        assert!(matches!(err, HyperError::MissingSize { label } if label == "b"));
    }

    #[test]
    fn orphan_output_rejected() {
        let err = ContractionProblem::new(
            vec![labels(&["a"])],
            labels(&["z"]),
            sizes(&[("a", 2), ("z", 2)]),
        )
        .unwrap_err();
        assert!(matches!(err, HyperError::OrphanOutputIndex { .. }));
    }

    #[test]
    fn zero_size_rejected() {
        let err =
            ContractionProblem::new(vec![labels(&["a"])], vec![], sizes(&[("a", 0)])).unwrap_err();
        assert!(matches!(err, HyperError::InvalidSize { .. }));
    }

    #[test]
    fn equation_parsing() {
        let p = ContractionProblem::from_equation("ab,bc,cd->ad", [('a', 2), ('b', 3), ('c', 4), ('d', 5)])
            .unwrap();
        assert_eq!(p.num_inputs(), 3);
        assert_eq!(p.output(), &labels(&["a", "d"]));

        let implicit = ContractionProblem::from_equation("ab,bc", [('a', 2), ('b', 3), ('c', 4)]).unwrap();
        assert_eq!(implicit.output(), &labels(&["a", "c"]));
    }
}
