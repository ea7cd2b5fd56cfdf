// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Helper module for functions that didn't fit anywhere else.

use rayon::prelude::*;
use std::ops::Range;
use std::str::FromStr;

use crate::error::{RegError, Result};

/// Fixed grain for chunked voxel-range parallelism.
///
/// Partial results are combined in chunk index order, so aggregates are
/// reproducible run to run.
pub const CHUNK: usize = 1 << 14;

/// Per-thread partial accumulator contract for parallel reductions.
pub trait Reducer: Sync {
    type Partial: Send;
    fn identity(&self) -> Self::Partial;
    fn combine(&self, a: Self::Partial, b: Self::Partial) -> Self::Partial;
}

/// Map disjoint sub-ranges of `0..len` in parallel, then fold the partial
/// results in chunk index order.
pub fn reduce_chunks<R, F>(len: usize, reducer: &R, map: F) -> R::Partial
where
    R: Reducer,
    F: Fn(Range<usize>) -> R::Partial + Sync,
{
    if len == 0 {
        return reducer.identity();
    }
    let chunk_count = (len + CHUNK - 1) / CHUNK;
    let partials: Vec<R::Partial> = (0..chunk_count)
        .into_par_iter()
        .map(|c| {
            let start = c * CHUNK;
            let end = (start + CHUNK).min(len);
            map(start..end)
        })
        .collect();
    partials
        .into_iter()
        .fold(reducer.identity(), |a, b| reducer.combine(a, b))
}

/// Sum reducer over f64.
pub struct SumReducer;

impl Reducer for SumReducer {
    type Partial = f64;
    fn identity(&self) -> f64 {
        0.0
    }
    fn combine(&self, a: f64, b: f64) -> f64 {
        a + b
    }
}

/// Minimal linear congruential generator. https://stackoverflow.com/a/3062783
///
/// Used for the deterministic affine jitter and the NCC stabilization noise
/// so that runs are reproducible without carrying a PRNG dependency.
#[derive(Debug, Clone)]
pub struct Lcg(u32);

impl Lcg {
    pub fn new(seed: u32) -> Self {
        Lcg(seed)
    }

    pub fn next_u32(&mut self) -> u32 {
        self.0 = (1103515245u32.wrapping_mul(self.0).wrapping_add(12345)) % 2147483648;
        self.0
    }

    /// Uniform in [0, 1).
    pub fn next_f64(&mut self) -> f64 {
        self.next_u32() as f64 / 2147483648.0
    }

    /// Uniform in [-amplitude, amplitude].
    pub fn next_symmetric(&mut self, amplitude: f64) -> f64 {
        (2.0 * self.next_f64() - 1.0) * amplitude
    }
}

/// Unit of a smoothing parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Vox,
    Mm,
}

/// A smoothing sigma with an explicit unit.
#[derive(Debug, Clone, Copy)]
pub struct Sigma {
    pub value: f64,
    pub unit: Unit,
}

impl Sigma {
    pub fn vox(value: f64) -> Self {
        Sigma {
            value,
            unit: Unit::Vox,
        }
    }

    /// Per-axis sigma in voxel units of a grid with the given spacing.
    pub fn to_voxel_units(&self, spacing: &[f64]) -> Vec<f64> {
        match self.unit {
            Unit::Vox => vec![self.value; spacing.len()],
            Unit::Mm => spacing.iter().map(|s| self.value / s).collect(),
        }
    }
}

impl FromStr for Sigma {
    type Err = RegError;
    fn from_str(s: &str) -> Result<Self> {
        let (value_str, unit) = if let Some(v) = s.strip_suffix("vox") {
            (v, Unit::Vox)
        } else if let Some(v) = s.strip_suffix("mm") {
            (v, Unit::Mm)
        } else {
            (s, Unit::Vox)
        };
        let value: f64 = value_str
            .parse()
            .map_err(|_| RegError::Input(format!("cannot parse sigma from \"{}\"", s)))?;
        if value < 0.0 {
            return Err(RegError::Input(format!("negative sigma: {}", s)));
        }
        Ok(Sigma { value, unit })
    }
}

/// Parse an `AxBxC` vector of counts, coarse level first.
pub fn parse_schedule(s: &str) -> Result<Vec<usize>> {
    s.split('x')
        .map(|p| {
            p.parse::<usize>()
                .map_err(|_| RegError::Input(format!("cannot parse schedule from \"{}\"", s)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_parses_counts() {
        assert_eq!(parse_schedule("100x50x10").unwrap(), vec![100, 50, 10]);
        assert!(parse_schedule("100x").is_err());
    }

    #[test]
    fn sigma_units() {
        let s: Sigma = "1.7vox".parse().unwrap();
        assert_eq!(s.unit, Unit::Vox);
        let s: Sigma = "2.0mm".parse().unwrap();
        assert_eq!(s.to_voxel_units(&[0.5, 2.0]), vec![4.0, 1.0]);
    }

    #[test]
    fn reduction_matches_serial_sum() {
        let n = 100_000;
        let total = reduce_chunks(n, &SumReducer, |r| r.map(|i| i as f64).sum());
        assert_eq!(total, (0..n).map(|i| i as f64).sum());
    }

    #[test]
    fn lcg_is_reproducible() {
        let mut a = Lcg::new(7);
        let mut b = Lcg::new(7);
        for _ in 0..10 {
            assert_eq!(a.next_u32(), b.next_u32());
        }
    }
}
