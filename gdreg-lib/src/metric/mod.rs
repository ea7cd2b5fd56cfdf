// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Similarity metrics: per-voxel value and gradient with respect to the
//! displacement, for SSD, windowed NCC and histogram MI.
//!
//! Every metric answers two shapes of query. The dense shape returns the
//! aggregate value and fills a gradient field; the affine shape applies a
//! linear transform as a virtual displacement field and reduces the dense
//! gradient to the D*(D+1) parameter gradient by summing `g(i) (x) [i; 1]`.
//! Samples that land outside the moving composite carry zero value and zero
//! gradient through the validity mask.

pub mod mi;
pub mod ncc;
pub mod ssd;

use nalgebra::DVector;
use rayon::prelude::*;

use crate::error::{RegError, Result};
use crate::img::{Image, MAX_DIM};
use crate::interp::sample_linear_with_gradient;
use crate::pyramid::PyramidLevel;
use crate::transform::LinearTransform;
use crate::utils::{reduce_chunks, Reducer, CHUNK};

/// Extra scale on the affine-path value and gradient of the correlation and
/// information metrics, keeping default optimizer tolerances meaningful.
const AFFINE_SCALE: f64 = 1.0e4;

/// Metric selector with its per-metric parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricKind {
    Ssd,
    Ncc { radius: Vec<usize> },
    Mi { bins: usize },
}

impl MetricKind {
    /// Negated-similarity metrics get the large affine-path scale.
    fn affine_scale(&self) -> f64 {
        match self {
            MetricKind::Ssd => 1.0,
            _ => AFFINE_SCALE,
        }
    }
}

/// Aggregate result of one metric query.
#[derive(Debug, Clone, Copy)]
pub struct MetricReport {
    pub value: f64,
    /// Total validity-mask weight, i.e. the effective sample volume.
    pub mask_volume: f64,
}

/// Map every voxel of `out` in parallel while accumulating a per-chunk sum,
/// combined in chunk index order.
pub(crate) fn par_map_value<F>(out: &mut Image, f: F) -> f64
where
    F: Fn(usize, &mut [f32]) -> f64 + Sync,
{
    let k = out.channels();
    let partials: Vec<f64> = out
        .data_mut()
        .par_chunks_mut(k * CHUNK)
        .enumerate()
        .map(|(ci, chunk)| {
            let base = ci * CHUNK;
            let mut sum = 0.0;
            for (j, voxel) in chunk.chunks_exact_mut(k).enumerate() {
                sum += f(base + j, voxel);
            }
            sum
        })
        .collect();
    partials.into_iter().sum()
}

/// Metric evaluator bound to one pyramid level, owning the scratch buffers
/// that are reused across iterations.
pub struct MetricEval<'a> {
    level: &'a PyramidLevel,
    kind: MetricKind,
    /// Interleaved per-voxel samples: warped moving channels, the validity
    /// mask, then the moving spatial gradients `[k * D + d]`.
    samples: Image,
    /// Virtual displacement field scratch for the affine path.
    virtual_field: Option<Image>,
}

impl<'a> MetricEval<'a> {
    pub fn new(level: &'a PyramidLevel, kind: &MetricKind) -> Result<Self> {
        let d = level.reference_space().ndim();
        let k = level.fixed.channels();
        if let MetricKind::Ncc { radius } = kind {
            if radius.len() != d {
                return Err(RegError::Config(format!(
                    "NCC radius has {} axes, image has {}",
                    radius.len(),
                    d
                )));
            }
        }
        if let MetricKind::Mi { bins } = kind {
            if *bins < 4 {
                return Err(RegError::Config("MI needs at least 4 bins".into()));
            }
        }
        let samples = Image::zeros(level.reference_space().clone(), k * (1 + d) + 1);
        Ok(MetricEval {
            level,
            kind: kind.clone(),
            samples,
            virtual_field: None,
        })
    }

    pub fn level(&self) -> &PyramidLevel {
        self.level
    }

    /// The moving composite warped by the last queried displacement,
    /// extracted from the sample buffer; used by the dump hooks.
    pub fn extract_warped(&self) -> Image {
        let layout = SampleLayout::of(self.level);
        let mut out = Image::zeros(self.level.reference_space().clone(), layout.k);
        for vi in 0..out.voxel_count() {
            out.voxel_mut(vi)
                .copy_from_slice(layout.warped(self.samples.voxel(vi)));
        }
        out
    }

    fn channels(&self) -> usize {
        self.level.fixed.channels()
    }

    /// Sample the moving composite at `i + u(i)`: values, validity mask and
    /// spatial gradients in one pass. Returns the mask volume.
    fn warp_pass(&mut self, field: &Image) -> f64 {
        let d = self.level.reference_space().ndim();
        let k = self.channels();
        let geom = self.level.reference_space().clone();
        let moving = &self.level.moving;
        par_map_value(&mut self.samples, |vi, voxel| {
            let mut idx = [0usize; MAX_DIM];
            let mut point = [0.0f64; MAX_DIM];
            geom.delinearize(vi, &mut idx[..d]);
            let u = field.voxel(vi);
            for a in 0..d {
                point[a] = idx[a] as f64 + u[a] as f64;
            }
            let (values, rest) = voxel.split_at_mut(k);
            let (mask, grads) = rest.split_at_mut(1);
            let m = sample_linear_with_gradient(moving, &point[..d], values, grads);
            mask[0] = m;
            m as f64
        })
    }

    /// Dense query: aggregate value plus the per-voxel gradient field
    /// `g(i) = dm/du(i)`.
    pub fn dense(&mut self, field: &Image, grad: &mut Image) -> Result<MetricReport> {
        let d = self.level.reference_space().ndim();
        if field.channels() != d || !field.geometry().same_size(self.level.reference_space()) {
            return Err(RegError::Config(
                "displacement field does not match the level geometry".into(),
            ));
        }
        let mask_volume = self.warp_pass(field);
        let value = match &self.kind {
            MetricKind::Ssd => ssd::dense(self.level, &self.samples, grad),
            MetricKind::Ncc { radius } => ncc::dense(self.level, &self.samples, radius, grad),
            MetricKind::Mi { bins } => mi::dense(self.level, &self.samples, *bins, grad),
        };
        Ok(MetricReport { value, mask_volume })
    }

    /// Per-voxel similarity map (no gradient); NCC only, used by the
    /// brute-force solver. Higher is better.
    pub fn value_map(&mut self, field: &Image, out: &mut Image) -> Result<MetricReport> {
        let radius = match &self.kind {
            MetricKind::Ncc { radius } => radius.clone(),
            _ => {
                return Err(RegError::Config(
                    "per-voxel similarity maps require the NCC metric".into(),
                ))
            }
        };
        let mask_volume = self.warp_pass(field);
        let value = ncc::value_map(self.level, &self.samples, &radius, out);
        Ok(MetricReport { value, mask_volume })
    }

    /// Affine query: evaluate at the virtual field `u(i) = T i + b - i`,
    /// optionally reducing the dense gradient to the parameter gradient in
    /// the `(offset_d, row_d)` packing.
    pub fn affine(
        &mut self,
        t: &LinearTransform,
        grad_field: &mut Image,
        param_grad: Option<&mut DVector<f64>>,
    ) -> Result<MetricReport> {
        let geom = self.level.reference_space().clone();
        let d = geom.ndim();
        if t.ndim() != d {
            return Err(RegError::Config("transform dimensionality mismatch".into()));
        }
        let mut field = self
            .virtual_field
            .take()
            .unwrap_or_else(|| Image::zeros(geom.clone(), d));
        crate::kernels::fill_affine_field(t, &mut field);
        let mut report = self.dense(&field, grad_field)?;
        let scale = self.kind.affine_scale();
        report.value *= scale;
        if let Some(pg) = param_grad {
            *pg = reduce_param_gradient(&geom, grad_field);
            *pg *= scale;
        }
        self.virtual_field = Some(field);
        Ok(report)
    }
}

struct ParamGradReducer {
    len: usize,
}

impl Reducer for ParamGradReducer {
    type Partial = DVector<f64>;
    fn identity(&self) -> DVector<f64> {
        DVector::zeros(self.len)
    }
    fn combine(&self, a: DVector<f64>, b: DVector<f64>) -> DVector<f64> {
        a + b
    }
}

/// Reduce a dense gradient field to the `D*(D+1)` parameter gradient:
/// for each axis `d`, the offset slot collects `sum g_d(i)` and the row
/// slots collect `sum g_d(i) * i_a`.
fn reduce_param_gradient(geom: &crate::img::Geometry, grad: &Image) -> DVector<f64> {
    let d = geom.ndim();
    let reducer = ParamGradReducer { len: d * (d + 1) };
    reduce_chunks(grad.voxel_count(), &reducer, |range| {
        let mut acc = DVector::zeros(d * (d + 1));
        let mut idx = [0usize; MAX_DIM];
        for vi in range {
            geom.delinearize(vi, &mut idx[..d]);
            let g = grad.voxel(vi);
            for r in 0..d {
                let base = r * (d + 1);
                let gr = g[r] as f64;
                acc[base] += gr;
                for a in 0..d {
                    acc[base + 1 + a] += gr * idx[a] as f64;
                }
            }
        }
        acc
    })
}

/// Sample-buffer layout helpers shared by the metric implementations.
pub(crate) struct SampleLayout {
    pub k: usize,
    pub d: usize,
}

impl SampleLayout {
    pub fn of(level: &PyramidLevel) -> Self {
        SampleLayout {
            k: level.fixed.channels(),
            d: level.reference_space().ndim(),
        }
    }

    #[inline]
    pub fn warped<'s>(&self, voxel: &'s [f32]) -> &'s [f32] {
        &voxel[..self.k]
    }

    #[inline]
    pub fn mask(&self, voxel: &[f32]) -> f32 {
        voxel[self.k]
    }

    /// Spatial gradient of warped channel `k`.
    #[inline]
    pub fn grad<'s>(&self, voxel: &'s [f32], k: usize) -> &'s [f32] {
        let o = self.k + 1 + k * self.d;
        &voxel[o..o + self.d]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::img::Geometry;
    use crate::pyramid::{ImagePair, Pyramid};
    use approx::assert_relative_eq;
    use nalgebra::{DMatrix, DVector as DV};

    pub(crate) fn blob_image(n: usize, cx: f64, cy: f64, sigma: f64) -> Image {
        let geom = Geometry::identity(vec![n, n]).unwrap();
        let mut img = Image::zeros(geom, 1);
        for y in 0..n {
            for x in 0..n {
                let dx = x as f64 - cx;
                let dy = y as f64 - cy;
                let v = (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();
                img.set(y * n + x, 0, v as f32);
            }
        }
        img
    }

    pub(crate) fn single_level(fixed: Image, moving: Image) -> Pyramid {
        Pyramid::build(
            vec![ImagePair {
                fixed,
                moving,
                weight: 1.0,
            }],
            1,
            None,
            0.0,
            None,
        )
        .unwrap()
    }

    /// Four-point central difference of the dense metric along one
    /// displacement component.
    fn numeric_partial(
        eval: &mut MetricEval,
        field: &Image,
        vi: usize,
        axis: usize,
        eps: f64,
    ) -> f64 {
        let mut grad = Image::zeros(field.geometry().clone(), field.channels());
        let mut at = |delta: f64| {
            let mut f = field.clone();
            let v = f.get(vi, axis);
            f.set(vi, axis, v + delta as f32);
            eval.dense(&f, &mut grad).unwrap().value
        };
        let f1 = at(eps);
        let f2 = at(-eps);
        let f3 = at(2.0 * eps);
        let f4 = at(-2.0 * eps);
        (8.0 * (f1 - f2) - (f3 - f4)) / (12.0 * eps)
    }

    fn check_gradient(kind: MetricKind, tol: f64) {
        let fixed = blob_image(24, 11.0, 12.0, 4.0);
        let moving = blob_image(24, 12.5, 11.0, 4.5);
        let pyr = single_level(fixed, moving);
        let level = pyr.finest();
        let mut eval = MetricEval::new(level, &kind).unwrap();

        let geom = level.reference_space().clone();
        let mut field = Image::zeros(geom.clone(), 2);
        // A smooth non-zero field keeps us away from interpolation kinks.
        for vi in 0..field.voxel_count() {
            field.set(vi, 0, 0.3);
            field.set(vi, 1, -0.2);
        }

        let mut grad = Image::zeros(geom, 2);
        eval.dense(&field, &mut grad).unwrap();

        for &(x, y, axis) in &[(8usize, 9usize, 0usize), (13, 12, 1), (10, 14, 0)] {
            let vi = y * 24 + x;
            let analytic = grad.get(vi, axis) as f64;
            let numeric = numeric_partial(&mut eval, &field, vi, axis, 1e-4);
            let scale = analytic.abs().max(numeric.abs()).max(1e-8);
            assert!(
                ((analytic - numeric) / scale).abs() < tol,
                "axis {} at ({}, {}): analytic {} vs numeric {}",
                axis,
                x,
                y,
                analytic,
                numeric
            );
        }
    }

    #[test]
    fn ssd_gradient_matches_central_difference() {
        check_gradient(MetricKind::Ssd, 1e-3);
    }

    #[test]
    fn ncc_gradient_matches_central_difference() {
        check_gradient(
            MetricKind::Ncc {
                radius: vec![2, 2],
            },
            1e-3,
        );
    }

    #[test]
    fn mi_gradient_matches_central_difference() {
        check_gradient(MetricKind::Mi { bins: 16 }, 5e-3);
    }

    #[test]
    fn affine_equals_dense_at_virtual_field() {
        let fixed = blob_image(20, 9.0, 10.0, 3.5);
        let moving = blob_image(20, 10.5, 9.5, 3.5);
        let pyr = single_level(fixed, moving);
        let level = pyr.finest();
        let mut eval = MetricEval::new(level, &MetricKind::Ssd).unwrap();

        let t = LinearTransform {
            matrix: DMatrix::from_row_slice(2, 2, &[1.01, 0.02, -0.01, 0.99]),
            offset: DV::from_column_slice(&[0.5, -0.25]),
        };
        let geom = level.reference_space().clone();
        let mut grad = Image::zeros(geom.clone(), 2);
        let affine_value = eval.affine(&t, &mut grad, None).unwrap().value;

        let mut field = Image::zeros(geom.clone(), 2);
        for y in 0..20 {
            for x in 0..20 {
                let vi = y * 20 + x;
                let p = t.apply(&DV::from_column_slice(&[x as f64, y as f64]));
                field.set(vi, 0, (p[0] - x as f64) as f32);
                field.set(vi, 1, (p[1] - y as f64) as f32);
            }
        }
        let dense_value = eval.dense(&field, &mut grad).unwrap().value;
        assert_relative_eq!(affine_value, dense_value, max_relative = 1e-6);
    }

    #[test]
    fn affine_parameter_gradient_matches_numeric() {
        let fixed = blob_image(16, 7.0, 8.0, 3.0);
        let moving = blob_image(16, 8.0, 7.5, 3.0);
        let pyr = single_level(fixed, moving);
        let level = pyr.finest();
        let mut eval = MetricEval::new(level, &MetricKind::Ssd).unwrap();
        let geom = level.reference_space().clone();
        let mut grad = Image::zeros(geom.clone(), 2);

        let t0 = LinearTransform {
            matrix: DMatrix::from_row_slice(2, 2, &[1.02, -0.01, 0.03, 0.98]),
            offset: DV::from_column_slice(&[0.4, -0.6]),
        };
        let mut pg = DV::zeros(6);
        eval.affine(&t0, &mut grad, Some(&mut pg)).unwrap();

        // Perturb the offset of axis 0 (parameter slot 0).
        let eps = 1e-4;
        let mut perturb = |delta: f64| {
            let mut t = t0.clone();
            t.offset[0] += delta;
            eval.affine(&t, &mut grad, None).unwrap().value
        };
        let numeric = (perturb(eps) - perturb(-eps)) / (2.0 * eps);
        let scale = numeric.abs().max(pg[0].abs()).max(1e-8);
        assert!(((pg[0] - numeric) / scale).abs() < 1e-3);
    }
}
