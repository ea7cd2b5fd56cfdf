// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Windowed normalized cross-correlation over a box patch.
//!
//! One box-filter pass accumulates the running sums of F, M, F^2, M^2 and
//! F*M (mask-weighted) so the per-voxel correlation is O(1) afterwards. A
//! second box pass over the per-voxel coefficient maps makes the gradient
//! exact: a voxel's intensity influences every patch containing it, and the
//! box filter collects all those contributions.
//!
//! The reported value is the negative signed square correlation
//! `-A|A| / (B C)`, so minimizing it maximizes correlation.

use crate::img::Image;
use crate::kernels::{box_sum, par_voxel_map};
use crate::metric::{par_map_value, SampleLayout};
use crate::pyramid::PyramidLevel;

/// Patches with less accumulated mask weight than this are skipped.
const MIN_WEIGHT: f64 = 0.25;
/// Variance floor below which a patch is treated as flat.
const VAR_FLOOR: f64 = 1e-12;

struct PatchStats {
    mean_f: f64,
    mean_m: f64,
    /// Demeaned cross term `sum m (F - mean_f)(M - mean_m)`.
    a: f64,
    /// Demeaned fixed variance term.
    b: f64,
    /// Demeaned moving variance term.
    c: f64,
}

fn patch_stats(sums: &[f32], base: usize, n: f64) -> PatchStats {
    let sf = sums[base] as f64;
    let sm = sums[base + 1] as f64;
    let sff = sums[base + 2] as f64;
    let smm = sums[base + 3] as f64;
    let sfm = sums[base + 4] as f64;
    PatchStats {
        mean_f: sf / n,
        mean_m: sm / n,
        a: sfm - sf * sm / n,
        b: sff - sf * sf / n,
        c: smm - sm * sm / n,
    }
}

/// Box sums of the mask-weighted running quantities; channel layout is
/// `[mF, mM, mF^2, mM^2, mFM] per k`, mask count last.
fn accumulate_sums(level: &PyramidLevel, samples: &Image, radius: &[usize]) -> Image {
    let layout = SampleLayout::of(level);
    let fixed = &level.fixed;
    let mut q = Image::zeros(level.reference_space().clone(), 5 * layout.k + 1);
    par_voxel_map(&mut q, |vi, voxel| {
        let s = samples.voxel(vi);
        let f = fixed.voxel(vi);
        let warped = layout.warped(s);
        let m = layout.mask(s);
        for k in 0..layout.k {
            let base = 5 * k;
            let fv = f[k];
            let mv = warped[k];
            voxel[base] = m * fv;
            voxel[base + 1] = m * mv;
            voxel[base + 2] = m * fv * fv;
            voxel[base + 3] = m * mv * mv;
            voxel[base + 4] = m * fv * mv;
        }
        voxel[5 * layout.k] = m;
    });
    box_sum(&q, radius)
}

pub(super) fn dense(
    level: &PyramidLevel,
    samples: &Image,
    radius: &[usize],
    grad: &mut Image,
) -> f64 {
    let layout = SampleLayout::of(level);
    let fixed = &level.fixed;
    let weights = &level.channel_weights;
    let d = layout.d;
    let sums = accumulate_sums(level, samples, radius);

    // Per-voxel coefficient maps [alpha, alpha*mean_f, gamma, gamma*mean_m]
    // per channel, plus the (negated) aggregate value.
    let mut coeff = Image::zeros(level.reference_space().clone(), 4 * layout.k);
    let value = par_map_value(&mut coeff, |vi, voxel| {
        let s = sums.voxel(vi);
        let n = s[5 * layout.k] as f64;
        for v in voxel.iter_mut() {
            *v = 0.0;
        }
        if n < MIN_WEIGHT {
            return 0.0;
        }
        let mut value = 0.0f64;
        for k in 0..layout.k {
            let st = patch_stats(s, 5 * k, n);
            if st.b < VAR_FLOOR || st.c < VAR_FLOOR {
                continue;
            }
            let denom = st.b * st.c;
            let sign = if st.a >= 0.0 { 1.0 } else { -1.0 };
            let ncc = sign * st.a * st.a / denom;
            value -= weights[k] as f64 * ncc;
            let alpha = 2.0 * sign * st.a / denom;
            let gamma = 2.0 * sign * st.a * st.a / (denom * st.c);
            let base = 4 * k;
            voxel[base] = alpha as f32;
            voxel[base + 1] = (alpha * st.mean_f) as f32;
            voxel[base + 2] = gamma as f32;
            voxel[base + 3] = (gamma * st.mean_m) as f32;
        }
        value
    });

    // Every patch containing voxel j contributes to its gradient; the box
    // filter over the coefficient maps collects them all.
    let collected = box_sum(&coeff, radius);
    par_voxel_map(grad, |vi, g| {
        let s = samples.voxel(vi);
        let f = fixed.voxel(vi);
        let warped = layout.warped(s);
        let m = layout.mask(s) as f64;
        for v in g.iter_mut() {
            *v = 0.0;
        }
        if m == 0.0 {
            return;
        }
        let cb = collected.voxel(vi);
        for k in 0..layout.k {
            let base = 4 * k;
            let alpha_sum = cb[base] as f64;
            let alpha_mean_f_sum = cb[base + 1] as f64;
            let gamma_sum = cb[base + 2] as f64;
            let gamma_mean_m_sum = cb[base + 3] as f64;
            let d_ncc = m
                * (f[k] as f64 * alpha_sum - alpha_mean_f_sum - warped[k] as f64 * gamma_sum
                    + gamma_mean_m_sum);
            // Value is the negated correlation.
            let d_value = -(weights[k] as f64) * d_ncc;
            let mg = layout.grad(s, k);
            for a in 0..d {
                g[a] += (d_value * mg[a] as f64) as f32;
            }
        }
    });

    value
}

/// Per-voxel signed square correlation (positive is better), summed over
/// channels with their weights. Used by the brute-force solver.
pub(super) fn value_map(
    level: &PyramidLevel,
    samples: &Image,
    radius: &[usize],
    out: &mut Image,
) -> f64 {
    let layout = SampleLayout::of(level);
    let weights = &level.channel_weights;
    let sums = accumulate_sums(level, samples, radius);
    par_map_value(out, |vi, voxel| {
        let s = sums.voxel(vi);
        let n = s[5 * layout.k] as f64;
        voxel[0] = 0.0;
        if n < MIN_WEIGHT {
            return 0.0;
        }
        let mut value = 0.0f64;
        for k in 0..layout.k {
            let st = patch_stats(s, 5 * k, n);
            if st.b < VAR_FLOOR || st.c < VAR_FLOOR {
                continue;
            }
            let sign = if st.a >= 0.0 { 1.0 } else { -1.0 };
            value += weights[k] as f64 * sign * st.a * st.a / (st.b * st.c);
        }
        voxel[0] = value as f32;
        value
    })
}

#[cfg(test)]
mod tests {
    use super::super::tests::{blob_image, single_level};
    use super::super::{MetricEval, MetricKind};
    use crate::img::Image;
    use crate::pyramid::{ImagePair, Pyramid};

    fn eval_value(fixed: Image, moving: Image) -> f64 {
        let pyr = single_level(fixed, moving);
        let level = pyr.finest();
        let kind = MetricKind::Ncc {
            radius: vec![2, 2],
        };
        let mut eval = MetricEval::new(level, &kind).unwrap();
        let field = Image::zeros(level.reference_space().clone(), 2);
        let mut grad = Image::new_like(&field);
        eval.dense(&field, &mut grad).unwrap().value
    }

    #[test]
    fn invariant_to_affine_intensity_change() {
        let fixed = blob_image(24, 12.0, 11.0, 4.0);
        let mut rescaled = fixed.clone();
        for v in rescaled.data_mut() {
            *v = 2.0 * *v + 5.0;
        }
        let plain = eval_value(fixed.clone(), fixed.clone());
        let scaled = eval_value(fixed, rescaled);
        assert!((plain - scaled).abs() < 1e-3 * plain.abs());
    }

    #[test]
    fn perfect_match_reaches_negative_count() {
        // With identical inputs the correlation is 1 in every patch with
        // variance, so the value approaches minus the voxel count.
        let img = blob_image(16, 8.0, 8.0, 4.0);
        let value = eval_value(img.clone(), img);
        assert!(value < -100.0);
    }

    #[test]
    fn radius_dimension_mismatch_is_rejected() {
        let img = blob_image(8, 4.0, 4.0, 2.0);
        let pyr = Pyramid::build(
            vec![ImagePair {
                fixed: img.clone(),
                moving: img,
                weight: 1.0,
            }],
            1,
            None,
            0.0,
            None,
        )
        .unwrap();
        let kind = MetricKind::Ncc {
            radius: vec![2, 2, 2],
        };
        assert!(MetricEval::new(pyr.finest(), &kind).is_err());
    }
}
