// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Affine solver: wraps the metric in a scaled scalar cost and drives it
//! with a nonlinear minimizer.
//!
//! The parameter vector packs `(offset_d, row_d)` sequentially per axis. A
//! scaling vector built once from the reference size makes a unit step in
//! any scaled parameter move the domain corner by about one voxel, so the
//! minimizer tolerances behave uniformly across translation and matrix
//! terms.

use nalgebra::{DMatrix, DVector};

use crate::error::{RegError, Result};
use crate::img::{Geometry, Image};
use crate::metric::{MetricEval, MetricKind};
use crate::optimizer::{lbfgs, powell, ScalarCost};
use crate::pyramid::Pyramid;
use crate::transform::{ras_to_voxel, voxel_to_ras, LinearTransform};
use crate::utils::Lcg;

/// Amplitude of the identity-seed jitter in scaled parameter units.
const JITTER: f64 = 0.4;

/// Configuration of the affine solver.
#[derive(Debug, Clone)]
pub struct AffineConfig {
    /// Function-evaluation budgets per level, coarse to fine.
    pub iterations: Vec<usize>,
    pub metric: MetricKind,
    /// Derivative-free Powell instead of the quasi-Newton default.
    pub use_powell: bool,
    /// Gradient-norm tolerance handed to the minimizer.
    pub tolerance: f64,
    /// Seed of the deterministic identity jitter.
    pub jitter_seed: u32,
    /// Compare the analytic gradient against a four-point central
    /// difference at the starting point of the coarsest level.
    pub debug_deriv: Option<f64>,
}

/// Starting transform for the coarsest level.
#[derive(Debug, Clone)]
pub enum AffineSeed {
    /// Identity with a small deterministic jitter in scaled space.
    Identity,
    /// Homogeneous physical-RAS matrix read from a file.
    Ras(DMatrix<f64>),
}

/// Pack a voxel-frame transform as `(offset_d, row_d)` per axis.
pub fn pack(t: &LinearTransform) -> DVector<f64> {
    let d = t.ndim();
    let mut x = DVector::zeros(d * (d + 1));
    for r in 0..d {
        let base = r * (d + 1);
        x[base] = t.offset[r];
        for c in 0..d {
            x[base + 1 + c] = t.matrix[(r, c)];
        }
    }
    x
}

pub fn unpack(x: &DVector<f64>, d: usize) -> LinearTransform {
    let mut t = LinearTransform::identity(d);
    for r in 0..d {
        let base = r * (d + 1);
        t.offset[r] = x[base];
        for c in 0..d {
            t.matrix[(r, c)] = x[base + 1 + c];
        }
    }
    t
}

/// Scaling vector: offsets scale by one, matrix entries by the domain extent
/// of their column, so a unit scaled step displaces the far corner by about
/// one voxel.
pub fn parameter_scales(geom: &Geometry) -> DVector<f64> {
    let d = geom.ndim();
    let mut s = DVector::from_element(d * (d + 1), 1.0);
    for r in 0..d {
        let base = r * (d + 1);
        for c in 0..d {
            s[base + 1 + c] = geom.size()[c] as f64;
        }
    }
    s
}

/// Scaled-space cost adapter around the metric's affine path.
struct AffineCost<'a> {
    eval: MetricEval<'a>,
    scales: DVector<f64>,
    grad_field: Image,
    param_grad: DVector<f64>,
    d: usize,
}

impl<'a> AffineCost<'a> {
    fn new(
        level: &'a crate::pyramid::PyramidLevel,
        metric: &MetricKind,
        scales: DVector<f64>,
    ) -> Result<Self> {
        let d = level.reference_space().ndim();
        let eval = MetricEval::new(level, metric)?;
        let grad_field = Image::zeros(level.reference_space().clone(), d);
        Ok(AffineCost {
            eval,
            scales,
            grad_field,
            param_grad: DVector::zeros(d * (d + 1)),
            d,
        })
    }

    fn transform_at(&self, x_scaled: &DVector<f64>) -> LinearTransform {
        unpack(&x_scaled.component_div(&self.scales), self.d)
    }
}

impl<'a> ScalarCost for AffineCost<'a> {
    fn dim(&self) -> usize {
        self.d * (self.d + 1)
    }

    fn evaluate(&mut self, x_scaled: &DVector<f64>, grad: Option<&mut DVector<f64>>) -> f64 {
        let t = self.transform_at(x_scaled);
        match grad {
            Some(g) => {
                let report = self
                    .eval
                    .affine(&t, &mut self.grad_field, Some(&mut self.param_grad))
                    .expect("affine metric evaluation failed");
                // Gradient in scaled space is the raw gradient divided by
                // the scales.
                *g = self.param_grad.component_div(&self.scales);
                report.value
            }
            None => self
                .eval
                .affine(&t, &mut self.grad_field, None)
                .expect("affine metric evaluation failed")
                .value,
        }
    }
}

fn four_point_gradient(cost: &mut AffineCost, x: &DVector<f64>, eps: f64) -> DVector<f64> {
    let n = x.len();
    let mut g = DVector::zeros(n);
    for i in 0..n {
        let mut probe = |delta: f64| {
            let mut p = x.clone();
            p[i] += delta;
            cost.evaluate(&p, None)
        };
        let f1 = probe(eps);
        let f2 = probe(-eps);
        let f3 = probe(2.0 * eps);
        let f4 = probe(-2.0 * eps);
        g[i] = (8.0 * (f1 - f2) - (f3 - f4)) / (12.0 * eps);
    }
    g
}

fn report_derivative_check(cost: &mut AffineCost, x: &DVector<f64>, eps: f64) {
    let mut analytic = DVector::zeros(x.len());
    cost.evaluate(x, Some(&mut analytic));
    let numeric = four_point_gradient(cost, x, eps);
    for i in 0..x.len() {
        let scale = analytic[i].abs().max(numeric[i].abs()).max(1e-12);
        log::info!(
            "deriv check [{}]: analytic {:+.6e}, numeric {:+.6e}, rel {:.2e}",
            i,
            analytic[i],
            numeric[i],
            (analytic[i] - numeric[i]).abs() / scale
        );
    }
}

/// Run the multi-resolution affine optimization and return the final
/// transform as a homogeneous physical-RAS matrix.
pub fn run(pyramid: &Pyramid, config: &AffineConfig, seed: &AffineSeed) -> Result<DMatrix<f64>> {
    if config.iterations.len() != pyramid.levels().len() {
        return Err(RegError::Config(
            "iteration schedule does not match the pyramid depth".into(),
        ));
    }

    let mut current: Option<(LinearTransform, Geometry)> = None;
    for (l, level) in pyramid.levels().iter().enumerate() {
        let geom = level.reference_space().clone();
        let d = geom.ndim();
        let scales = parameter_scales(&geom);

        let t = match current.take() {
            Some((prev, prev_geom)) => {
                // Re-anchor to the finer grid through the RAS form.
                let ras = voxel_to_ras(&prev, &prev_geom, &prev_geom)?;
                ras_to_voxel(&ras, &geom, &geom)?
            }
            None => match seed {
                AffineSeed::Identity => LinearTransform::identity(d),
                AffineSeed::Ras(m) => ras_to_voxel(m, &geom, &geom)?,
            },
        };

        let mut x = pack(&t).component_mul(&scales);
        if l == 0 {
            if let AffineSeed::Identity = seed {
                let mut rng = Lcg::new(config.jitter_seed);
                for v in x.iter_mut() {
                    *v += rng.next_symmetric(JITTER);
                }
            }
        }

        let mut cost = AffineCost::new(level, &config.metric, scales.clone())?;
        if l == 0 {
            if let Some(eps) = config.debug_deriv {
                report_derivative_check(&mut cost, &x, eps);
            }
        }

        let report = if config.use_powell {
            powell(&mut cost, &mut x, config.iterations[l], config.tolerance)
        } else {
            lbfgs(&mut cost, &mut x, config.iterations[l], config.tolerance)
        };
        log::info!(
            "affine level {}: value {:.6e} after {} evaluations (converged: {})",
            l,
            report.value,
            report.evaluations,
            report.converged
        );

        current = Some((cost.transform_at(&x), geom));
    }

    let (t, geom) = current.unwrap();
    voxel_to_ras(&t, &geom, &geom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn pack_unpack_round_trip() {
        let t = LinearTransform {
            matrix: DMatrix::from_row_slice(2, 2, &[1.1, 0.2, -0.3, 0.9]),
            offset: DVector::from_column_slice(&[4.0, -2.0]),
        };
        let x = pack(&t);
        assert_eq!(x.len(), 6);
        assert_eq!(x[0], 4.0);
        assert_eq!(x[1], 1.1);
        assert_eq!(x[2], 0.2);
        let back = unpack(&x, 2);
        assert_eq!(back, t);
    }

    #[test]
    fn scales_anchor_to_corner() {
        let geom = Geometry::identity(vec![32, 64]).unwrap();
        let s = parameter_scales(&geom);
        // Offset slots are unscaled, matrix columns carry the extent.
        assert_relative_eq!(s[0], 1.0);
        assert_relative_eq!(s[1], 32.0);
        assert_relative_eq!(s[2], 64.0);
        assert_relative_eq!(s[3], 1.0);
    }
}
