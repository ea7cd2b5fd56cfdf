// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Sampling of dense buffers at continuous voxel positions.
//!
//! The N-dimensional linear interpolant walks the 2^D corners of the
//! enclosing cell with a bitmask. Two boundary policies: `Replicate` clamps
//! sample positions into the domain, `Zero` drops outside corners and reports
//! the in-domain weight so callers can track sample validity.

use crate::img::{Image, MAX_DIM};

/// Behavior for samples that fall outside the source domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    Replicate,
    Zero,
}

#[inline]
fn clamp_index(i: isize, n: usize) -> usize {
    if i < 0 {
        0
    } else if i as usize >= n {
        n - 1
    } else {
        i as usize
    }
}

/// Linear interpolation of all channels at `point` (continuous voxel
/// coordinates). Returns the in-domain weight: 1 inside, 0 fully outside,
/// the partial corner weight across the border. With `Replicate` the weight
/// is always 1.
pub fn sample_linear(img: &Image, point: &[f64], out: &mut [f32], boundary: Boundary) -> f32 {
    let geom = img.geometry();
    let d = geom.ndim();
    let size = geom.size();
    let k = img.channels();
    debug_assert_eq!(point.len(), d);
    debug_assert_eq!(out.len(), k);

    let mut base = [0isize; MAX_DIM];
    let mut frac = [0.0f64; MAX_DIM];
    for a in 0..d {
        let f = point[a].floor();
        base[a] = f as isize;
        frac[a] = point[a] - f;
    }

    for v in out.iter_mut() {
        *v = 0.0;
    }
    let mut inside_weight = 0.0f64;

    let strides = geom.strides();
    for corner in 0..(1usize << d) {
        let mut w = 1.0f64;
        let mut vi = 0usize;
        let mut inside = true;
        for a in 0..d {
            let up = corner & (1 << a) != 0;
            let ia = base[a] + if up { 1 } else { 0 };
            w *= if up { frac[a] } else { 1.0 - frac[a] };
            match boundary {
                Boundary::Replicate => vi += clamp_index(ia, size[a]) * strides[a],
                Boundary::Zero => {
                    if ia < 0 || ia as usize >= size[a] {
                        inside = false;
                        break;
                    }
                    vi += ia as usize * strides[a];
                }
            }
        }
        if !inside || w == 0.0 {
            continue;
        }
        inside_weight += w;
        let values = img.voxel(vi);
        for c in 0..k {
            out[c] += (w * values[c] as f64) as f32;
        }
    }

    match boundary {
        Boundary::Replicate => 1.0,
        Boundary::Zero => inside_weight as f32,
    }
}

/// Linear interpolation of values and their spatial gradient, `Zero` policy.
///
/// `out_grads` is laid out `[channel * ndim + axis]`; outside corners
/// contribute neither value nor gradient, matching the metric convention
/// that invalid samples carry zero weight.
pub fn sample_linear_with_gradient(
    img: &Image,
    point: &[f64],
    out: &mut [f32],
    out_grads: &mut [f32],
) -> f32 {
    let geom = img.geometry();
    let d = geom.ndim();
    let size = geom.size();
    let k = img.channels();
    debug_assert_eq!(out.len(), k);
    debug_assert_eq!(out_grads.len(), k * d);

    let mut base = [0isize; MAX_DIM];
    let mut frac = [0.0f64; MAX_DIM];
    for a in 0..d {
        let f = point[a].floor();
        base[a] = f as isize;
        frac[a] = point[a] - f;
    }

    for v in out.iter_mut() {
        *v = 0.0;
    }
    for v in out_grads.iter_mut() {
        *v = 0.0;
    }
    let mut inside_weight = 0.0f64;

    let strides = geom.strides();
    for corner in 0..(1usize << d) {
        let mut vi = 0usize;
        let mut inside = true;
        let mut axis_w = [0.0f64; MAX_DIM];
        for a in 0..d {
            let up = corner & (1 << a) != 0;
            let ia = base[a] + if up { 1 } else { 0 };
            if ia < 0 || ia as usize >= size[a] {
                inside = false;
                break;
            }
            axis_w[a] = if up { frac[a] } else { 1.0 - frac[a] };
            vi += ia as usize * strides[a];
        }
        if !inside {
            continue;
        }
        let w: f64 = axis_w[..d].iter().product();
        inside_weight += w;
        let values = img.voxel(vi);
        for c in 0..k {
            out[c] += (w * values[c] as f64) as f32;
        }
        for g in 0..d {
            // d/dx_g of the corner weight: sign along axis g, plain weights
            // on the other axes.
            let up = corner & (1 << g) != 0;
            let mut dw = if up { 1.0 } else { -1.0 };
            for a in 0..d {
                if a != g {
                    dw *= axis_w[a];
                }
            }
            for c in 0..k {
                out_grads[c * d + g] += (dw * values[c] as f64) as f32;
            }
        }
    }

    inside_weight as f32
}

/// Nearest-neighbor sampling of all channels. Returns false when the rounded
/// position falls outside the domain (outputs are zeroed in that case).
pub fn sample_nearest(img: &Image, point: &[f64], out: &mut [f32]) -> bool {
    let geom = img.geometry();
    let d = geom.ndim();
    let size = geom.size();
    let strides = geom.strides();

    let mut vi = 0usize;
    for a in 0..d {
        let ia = point[a].round() as isize;
        if ia < 0 || ia as usize >= size[a] {
            for v in out.iter_mut() {
                *v = 0.0;
            }
            return false;
        }
        vi += ia as usize * strides[a];
    }
    out.copy_from_slice(img.voxel(vi));
    true
}
