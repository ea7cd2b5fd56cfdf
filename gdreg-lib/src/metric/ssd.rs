// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Sum-of-squared-differences metric.

use crate::img::Image;
use crate::metric::{par_map_value, SampleLayout};
use crate::pyramid::PyramidLevel;

/// `m(i) = sum_k w_k mask(i) (F_k(i) - M_k(i+u))^2`, gradient by the chain
/// rule through the resampled moving channel.
pub(super) fn dense(level: &PyramidLevel, samples: &Image, grad: &mut Image) -> f64 {
    let layout = SampleLayout::of(level);
    let fixed = &level.fixed;
    let weights = &level.channel_weights;
    let d = layout.d;

    par_map_value(grad, |vi, g| {
        let s = samples.voxel(vi);
        let f = fixed.voxel(vi);
        let warped = layout.warped(s);
        let mask = layout.mask(s) as f64;
        for v in g.iter_mut() {
            *v = 0.0;
        }
        if mask == 0.0 {
            return 0.0;
        }
        let mut value = 0.0f64;
        for k in 0..layout.k {
            let w = weights[k] as f64 * mask;
            let diff = f[k] as f64 - warped[k] as f64;
            value += w * diff * diff;
            let mg = layout.grad(s, k);
            // d/du of (F - M(i+u))^2 = 2 (M - F) grad M.
            let coeff = 2.0 * w * (-diff);
            for a in 0..d {
                g[a] += (coeff * mg[a] as f64) as f32;
            }
        }
        value
    })
}

#[cfg(test)]
mod tests {
    use super::super::tests::{blob_image, single_level};
    use super::super::{MetricEval, MetricKind};
    use crate::img::Image;
    use approx::assert_relative_eq;

    #[test]
    fn identical_images_have_zero_cost() {
        let img = blob_image(16, 8.0, 8.0, 3.0);
        let pyr = single_level(img.clone(), img);
        let level = pyr.finest();
        let mut eval = MetricEval::new(level, &MetricKind::Ssd).unwrap();
        let field = Image::zeros(level.reference_space().clone(), 2);
        let mut grad = Image::new_like(&field);
        let report = eval.dense(&field, &mut grad).unwrap();
        assert_relative_eq!(report.value, 0.0, epsilon = 1e-10);
        assert_relative_eq!(crate::kernels::max_vector_norm(&grad), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn pair_weight_scales_value() {
        use crate::pyramid::{ImagePair, Pyramid};
        let fixed = blob_image(16, 8.0, 8.0, 3.0);
        let moving = blob_image(16, 9.0, 8.0, 3.0);
        let value_for = |w: f32| {
            let pyr = Pyramid::build(
                vec![ImagePair {
                    fixed: fixed.clone(),
                    moving: moving.clone(),
                    weight: w,
                }],
                1,
                None,
                0.0,
                None,
            )
            .unwrap();
            let level = pyr.finest();
            let mut eval = MetricEval::new(level, &MetricKind::Ssd).unwrap();
            let field = Image::zeros(level.reference_space().clone(), 2);
            let mut grad = Image::new_like(&field);
            eval.dense(&field, &mut grad).unwrap().value
        };
        let v1 = value_for(1.0);
        let v3 = value_for(3.0);
        assert_relative_eq!(v3, 3.0 * v1, max_relative = 1e-6);
    }
}
