use crate::error::{HyperError, Result};

/// A path where inputs are `0..n` and every step produces the next unused id.
pub type SsaPath = Vec<Vec<usize>>;
/// A path over positions in a shrinking list of remaining terms, with each
/// result appended to the end.
pub type LinearPath = Vec<Vec<usize>>;

/// Convert an SSA path over `n` inputs into the linear (shrinking list) form.
pub fn ssa_to_linear(ssa_path: &[Vec<usize>], n: usize) -> Result<LinearPath> {
    let mut ids: Vec<usize> = (0..n).collect();
    let mut path: LinearPath = Vec::with_capacity(ssa_path.len());
    let mut ssa = n;
    for scon in ssa_path {
        // find the locations of the ssa ids in the list of ids
        let mut con: Vec<usize> = scon
            .iter()
            .map(|s| {
                ids.binary_search(s)
                    .map_err(|_| HyperError::InvalidPath(format!("ssa id {} is not available", s)))
            })
            .collect::<Result<_>>()?;
        con.sort_unstable();
        if con.windows(2).any(|w| w[0] == w[1]) {
            return Err(HyperError::InvalidPath(format!("repeated id in step {:?}", scon)));
        }
        // remove the ssa ids from the list
        for &j in con.iter().rev() {
            ids.remove(j);
        }
        path.push(con);
        ids.push(ssa);
        ssa += 1;
    }
    Ok(path)
}

/// Convert a linear path into SSA form.
pub fn linear_to_ssa(path: &[Vec<usize>]) -> Result<SsaPath> {
    let total: usize = path.iter().map(|con| con.len()).sum();
    let n = (total + 1).saturating_sub(path.len()).max(1);
    linear_to_ssa_n(path, n)
}

/// Convert a possibly incomplete linear path over `n` inputs into SSA form.
pub(crate) fn linear_to_ssa_n(path: &[Vec<usize>], n: usize) -> Result<SsaPath> {
    let mut ids: Vec<usize> = (0..n).collect();
    let mut ssa = n;
    let mut ssa_path: SsaPath = Vec::with_capacity(path.len());
    for con in path {
        let mut scon = Vec::with_capacity(con.len());
        for &c in con {
            let s = ids.get(c).copied().ok_or_else(|| {
                HyperError::InvalidPath(format!("position {} out of range in step {:?}", c, con))
            })?;
            scon.push(s);
        }
        let mut positions = con.clone();
        positions.sort_unstable();
        positions.dedup();
        if positions.len() != con.len() {
            return Err(HyperError::InvalidPath(format!("repeated position in step {:?}", con)));
        }
        for &j in positions.iter().rev() {
            ids.remove(j);
        }
        ids.push(ssa);
        ssa += 1;
        ssa_path.push(scon);
    }
    Ok(ssa_path)
}

/// Number of inputs an SSA path implies, assuming it fully contracts them.
pub fn ssa_num_inputs(ssa_path: &[Vec<usize>]) -> usize {
    let total: usize = ssa_path.iter().map(|con| con.len()).sum();
    (total + 1).saturating_sub(ssa_path.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn ssa_linear_known() {
        let ssa = vec![vec![0, 2], vec![1, 3], vec![4, 5]];
        let linear = ssa_to_linear(&ssa, 4).unwrap();
        assert_eq!(linear, vec![vec![0, 2], vec![0, 1], vec![0, 1]]);
        assert_eq!(linear_to_ssa(&linear).unwrap(), ssa);
    }

    #[test]
    fn single_term_steps() {
        let ssa = vec![vec![1], vec![0, 2]];
        let linear = ssa_to_linear(&ssa, 2).unwrap();
        assert_eq!(linear, vec![vec![1], vec![0, 1]]);
        assert_eq!(linear_to_ssa(&linear).unwrap(), ssa);
    }

    #[test]
    fn invalid_ssa_rejected() {
        assert!(ssa_to_linear(&[vec![0, 1], vec![0, 2]], 3).is_err());
        assert!(linear_to_ssa(&[vec![0, 5]]).is_err());
    }

    fn random_ssa(n: usize, picks: Vec<(usize, usize)>) -> SsaPath {
        let mut remaining: Vec<usize> = (0..n).collect();
        let mut ssa = n;
        let mut path = Vec::new();
        for (a, b) in picks.into_iter().take(n - 1) {
            let i = remaining.remove(a % remaining.len());
            let j = remaining.remove(b % remaining.len());
            path.push(vec![i, j]);
            remaining.push(ssa);
            ssa += 1;
        }
        path
    }

    proptest! {
        #[test]
        fn ssa_linear_roundtrip(
            n in 2usize..12,
            picks in proptest::collection::vec((0usize..64, 0usize..64), 11),
        ) {
            let ssa = random_ssa(n, picks);
            let linear = ssa_to_linear(&ssa, n).unwrap();
            prop_assert_eq!(ssa_num_inputs(&ssa), n);
            prop_assert_eq!(linear_to_ssa(&linear).unwrap(), ssa);
        }
    }
}
