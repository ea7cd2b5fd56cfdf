// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Histogram-based mutual information.
//!
//! The joint distribution uses nearest binning on the fixed axis and a
//! linear Parzen window on the moving axis, so the value stays differentiable
//! in the displacement. Intensity bounds are frozen at pyramid build time,
//! which keeps the bin mapping constant across iterations. The reported
//! value is the negated mutual information.

use crate::img::Image;
use crate::kernels::par_voxel_map;
use crate::metric::SampleLayout;
use crate::pyramid::{ChannelRange, PyramidLevel};
use crate::utils::{reduce_chunks, Reducer};

struct HistReducer {
    len: usize,
}

impl Reducer for HistReducer {
    type Partial = Vec<f64>;
    fn identity(&self) -> Vec<f64> {
        vec![0.0; self.len]
    }
    fn combine(&self, mut a: Vec<f64>, b: Vec<f64>) -> Vec<f64> {
        for (x, y) in a.iter_mut().zip(b.into_iter()) {
            *x += y;
        }
        a
    }
}

/// Bin mapping of one channel; `scale` is zero for degenerate ranges, which
/// drops the channel from the histogram.
#[derive(Clone, Copy)]
struct BinMap {
    f_min: f64,
    f_scale: f64,
    m_min: f64,
    m_scale: f64,
}

impl BinMap {
    fn of(range: &ChannelRange, bins: usize) -> Self {
        let span = |lo: f32, hi: f32| {
            let w = (hi - lo) as f64;
            if w > 0.0 {
                (bins as f64 - 1.0) / w
            } else {
                0.0
            }
        };
        BinMap {
            f_min: range.fixed.0 as f64,
            f_scale: span(range.fixed.0, range.fixed.1),
            m_min: range.moving.0 as f64,
            m_scale: span(range.moving.0, range.moving.1),
        }
    }

    #[inline]
    fn fixed_bin(&self, v: f64, bins: usize) -> usize {
        let t = (v - self.f_min) * self.f_scale;
        (t.round().max(0.0) as usize).min(bins - 1)
    }

    /// Lower moving bin and the fractional weight of the upper one.
    #[inline]
    fn moving_bins(&self, v: f64, bins: usize) -> (usize, f64) {
        let t = ((v - self.m_min) * self.m_scale)
            .max(0.0)
            .min(bins as f64 - 1.0 - 1e-9);
        let b0 = t.floor() as usize;
        (b0, t - b0 as f64)
    }
}

pub(super) fn dense(level: &PyramidLevel, samples: &Image, bins: usize, grad: &mut Image) -> f64 {
    let layout = SampleLayout::of(level);
    let fixed = &level.fixed;
    let weights = &level.channel_weights;
    let d = layout.d;
    let maps: Vec<BinMap> = level.ranges.iter().map(|r| BinMap::of(r, bins)).collect();

    // Joint histograms, one B x B table per channel.
    let table = bins * bins;
    let reducer = HistReducer {
        len: layout.k * table,
    };
    let hist = reduce_chunks(samples.voxel_count(), &reducer, |range| {
        let mut h = vec![0.0f64; layout.k * table];
        for vi in range {
            let s = samples.voxel(vi);
            let m = layout.mask(s) as f64;
            if m == 0.0 {
                continue;
            }
            let f = fixed.voxel(vi);
            let warped = layout.warped(s);
            for k in 0..layout.k {
                let map = &maps[k];
                if map.m_scale == 0.0 || map.f_scale == 0.0 {
                    continue;
                }
                let bf = map.fixed_bin(f[k] as f64, bins);
                let (b0, frac) = map.moving_bins(warped[k] as f64, bins);
                let base = k * table + bf * bins;
                h[base + b0] += m * (1.0 - frac);
                h[base + b0 + 1] += m * frac;
            }
        }
        h
    });

    // Per-channel information value and the pointwise log-ratio table
    // L(f, b) = ln(p / (pF pM)), zero where the joint bin is empty.
    let mut value = 0.0f64;
    let mut log_ratio = vec![0.0f64; layout.k * table];
    let mut channel_weight_total = vec![0.0f64; layout.k];
    for k in 0..layout.k {
        let h = &hist[k * table..(k + 1) * table];
        let total: f64 = h.iter().sum();
        channel_weight_total[k] = total;
        if total <= 0.0 {
            continue;
        }
        let mut p_f = vec![0.0f64; bins];
        let mut p_m = vec![0.0f64; bins];
        for f in 0..bins {
            for b in 0..bins {
                let p = h[f * bins + b] / total;
                p_f[f] += p;
                p_m[b] += p;
            }
        }
        let mut mi = 0.0f64;
        for f in 0..bins {
            for b in 0..bins {
                let p = h[f * bins + b] / total;
                if p > 0.0 && p_f[f] > 0.0 && p_m[b] > 0.0 {
                    let l = (p / (p_f[f] * p_m[b])).ln();
                    mi += p * l;
                    log_ratio[k * table + f * bins + b] = l;
                }
            }
        }
        value -= weights[k] as f64 * mi;
    }

    // Gradient: a voxel only moves mass between its two moving bins.
    par_voxel_map(grad, |vi, g| {
        let s = samples.voxel(vi);
        let m = layout.mask(s) as f64;
        for v in g.iter_mut() {
            *v = 0.0;
        }
        if m == 0.0 {
            return;
        }
        let f = fixed.voxel(vi);
        let warped = layout.warped(s);
        for k in 0..layout.k {
            let map = &maps[k];
            let total = channel_weight_total[k];
            if map.m_scale == 0.0 || map.f_scale == 0.0 || total <= 0.0 {
                continue;
            }
            let bf = map.fixed_bin(f[k] as f64, bins);
            let (b0, _) = map.moving_bins(warped[k] as f64, bins);
            let base = k * table + bf * bins;
            let d_mi = m * map.m_scale / total * (log_ratio[base + b0 + 1] - log_ratio[base + b0]);
            let d_value = -(weights[k] as f64) * d_mi;
            let mg = layout.grad(s, k);
            for a in 0..d {
                g[a] += (d_value * mg[a] as f64) as f32;
            }
        }
    });

    value
}

#[cfg(test)]
mod tests {
    use super::super::tests::{blob_image, single_level};
    use super::super::{MetricEval, MetricKind};
    use crate::img::Image;

    fn eval_value(fixed: Image, moving: Image) -> f64 {
        let pyr = single_level(fixed, moving);
        let level = pyr.finest();
        let mut eval = MetricEval::new(level, &MetricKind::Mi { bins: 16 }).unwrap();
        let field = Image::zeros(level.reference_space().clone(), 2);
        let mut grad = Image::new_like(&field);
        eval.dense(&field, &mut grad).unwrap().value
    }

    #[test]
    fn aligned_images_carry_more_information() {
        let img = blob_image(24, 12.0, 12.0, 4.0);
        let shifted = blob_image(24, 16.0, 8.0, 4.0);
        let aligned = eval_value(img.clone(), img.clone());
        let misaligned = eval_value(img, shifted);
        // Values are negated mutual information: aligned must be lower.
        assert!(aligned < misaligned);
    }

    #[test]
    fn invariant_to_monotone_remapping() {
        let img = blob_image(24, 12.0, 12.0, 4.0);
        let mut remapped = img.clone();
        for v in remapped.data_mut() {
            *v = 3.0 * *v + 1.0;
        }
        let plain = eval_value(img.clone(), img.clone());
        let mapped = eval_value(img, remapped);
        assert!((plain - mapped).abs() < 1e-6 * plain.abs());
    }

    #[test]
    fn needs_enough_bins() {
        let img = blob_image(8, 4.0, 4.0, 2.0);
        let pyr = single_level(img.clone(), img);
        assert!(MetricEval::new(pyr.finest(), &MetricKind::Mi { bins: 2 }).is_err());
    }
}
